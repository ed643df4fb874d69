//! Debounce batcher: coalesces a burst of messages from one user into one [`Batch`].
//!
//! Per user the batcher is either idle (no entry) or collecting (entry with pending messages and a
//! deadline). The call that moves a user from idle to collecting owns the wait: it sleeps until the
//! deadline, re-reads it (later messages push it back), and once the deadline holds it detaches the
//! pending list, removes the entry and forwards the batch. Every other call appends and returns.
//! A burst with gaps shorter than the idle period therefore never flushes until it stops.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_core::ChatMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Messages collected for one user within one idle window, in submission order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub user_id: i64,
    pub messages: Vec<ChatMessage>,
}

/// Receives closed batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn accept(&self, batch: Batch);
}

struct Collecting {
    pending: Vec<ChatMessage>,
    deadline: Instant,
}

pub struct DebounceBatcher {
    idle: Duration,
    users: DashMap<i64, Collecting>,
    sink: Arc<dyn BatchSink>,
}

impl DebounceBatcher {
    pub fn new(idle: Duration, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            idle,
            users: DashMap::new(),
            sink,
        }
    }

    /// Adds `message` to the user's pending batch and pushes the deadline back.
    ///
    /// Returns immediately unless this call opened the batch; the opening call returns after the
    /// batch was handed to the sink.
    #[instrument(skip(self, message), fields(message_id = message.platform_message_id))]
    pub async fn submit(&self, user_id: i64, message: ChatMessage) {
        let deadline = Instant::now() + self.idle;
        let opened = match self.users.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.pending.push(message);
                state.deadline = deadline;
                debug!(user_id, pending = state.pending.len(), "step: appended to open batch");
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Collecting {
                    pending: vec![message],
                    deadline,
                });
                true
            }
        };
        if !opened {
            return;
        }

        loop {
            let Some(deadline) = self.users.get(&user_id).map(|s| s.deadline) else {
                return;
            };
            tokio::time::sleep_until(deadline).await;

            let closed = self
                .users
                .remove_if(&user_id, |_, state| state.deadline <= Instant::now());
            if let Some((_, state)) = closed {
                info!(user_id, size = state.pending.len(), "step: batch closed");
                self.sink
                    .accept(Batch {
                        user_id,
                        messages: state.pending,
                    })
                    .await;
                return;
            }
        }
    }

    /// Users with an open batch.
    pub fn open_batches(&self) -> usize {
        self.users.len()
    }
}

//! Per-user sequencer: one batch in flight per user, batches of a user in arrival order,
//! different users fully concurrent.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use relay_core::Result;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

use crate::batcher::{Batch, BatchSink};

/// Handles one closed batch.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, batch: Batch) -> Result<()>;
}

struct UserQueue {
    batches: VecDeque<Batch>,
    draining: bool,
}

pub struct Sequencer {
    queues: DashMap<i64, UserQueue>,
    processor: Arc<dyn BatchProcessor>,
}

impl Sequencer {
    pub fn new(processor: Arc<dyn BatchProcessor>) -> Self {
        Self {
            queues: DashMap::new(),
            processor,
        }
    }

    /// Queues `batch`. The call that finds nobody draining this user's queue drains it, processing
    /// batches one by one until it is empty, then removes the queue.
    ///
    /// A failing or panicking batch is logged and does not stop the drain.
    pub async fn enqueue(&self, batch: Batch) {
        let user_id = batch.user_id;
        let drain = {
            let mut queue = self.queues.entry(user_id).or_insert_with(|| UserQueue {
                batches: VecDeque::new(),
                draining: false,
            });
            queue.batches.push_back(batch);
            !std::mem::replace(&mut queue.draining, true)
        };
        if !drain {
            info!(user_id, "step: batch queued behind in-flight batch");
            return;
        }

        while let Some(batch) = self.next_batch(user_id) {
            let size = batch.messages.len();
            match AssertUnwindSafe(self.processor.process(batch))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => info!(user_id, size, "step: batch processed"),
                Ok(Err(e)) => error!(user_id, error = %e, "Batch processing failed"),
                Err(_) => error!(user_id, "Batch processing panicked"),
            }
        }
    }

    /// Pops the next batch; removes the queue when it is empty so the next enqueue drains again.
    fn next_batch(&self, user_id: i64) -> Option<Batch> {
        match self.queues.entry(user_id) {
            Entry::Occupied(mut entry) => match entry.get_mut().batches.pop_front() {
                Some(batch) => Some(batch),
                None => {
                    entry.remove();
                    None
                }
            },
            Entry::Vacant(_) => None,
        }
    }

    /// Users with queued or in-flight batches.
    pub fn active_users(&self) -> usize {
        self.queues.len()
    }
}

#[async_trait]
impl BatchSink for Sequencer {
    async fn accept(&self, batch: Batch) {
        self.enqueue(batch).await;
    }
}

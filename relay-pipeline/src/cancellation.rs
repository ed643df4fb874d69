//! Cancellation registry: per-user tokens that let the "Stop" button abort a streaming answer.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared cancelled flag, polled by the streaming assembler.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<i64, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of `user_key`, created if absent.
    pub fn get_token(&self, user_key: i64) -> CancellationToken {
        self.tokens.entry(user_key).or_default().clone()
    }

    /// Marks the user's token cancelled and forgets it. Returns false when there was none.
    pub fn cancel(&self, user_key: i64) -> bool {
        match self.tokens.remove(&user_key) {
            Some((_, token)) => {
                token.cancel();
                info!(user_key, "step: streaming answer cancelled");
                true
            }
            None => false,
        }
    }

    /// Forgets `token` once its answer finished, unless it was already replaced.
    pub fn release(&self, user_key: i64, token: &CancellationToken) {
        self.tokens.remove_if(&user_key, |_, current| current.same_as(token));
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

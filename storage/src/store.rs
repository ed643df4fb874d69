//! Persistence contracts used by the relay pipeline.
//!
//! All operations are keyed by opaque integer ids. Implementations: [`crate::SqliteMessageStore`]
//! and [`crate::InMemoryMessageStore`].

use async_trait::async_trait;
use relay_core::{CompletionUsage, MessageKind, NewMessage, StoredMessage, NO_PLATFORM_MESSAGE_ID};

use crate::error::StorageError;

/// Append-only store of thread nodes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Most recently created node of `user_id` in `chat_id`.
    async fn get_last_message(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<StoredMessage>, StorageError>;

    /// Nodes with the given ids, in the order of `ids`. Unknown ids are skipped.
    async fn get_messages_by_ids(&self, ids: &[i64]) -> Result<Vec<StoredMessage>, StorageError>;

    /// Node that was delivered to the chat as `platform_message_id`.
    async fn get_platform_message(
        &self,
        chat_id: i64,
        platform_message_id: i64,
    ) -> Result<Option<StoredMessage>, StorageError>;

    /// Persists a new node; the store assigns the sequential id and timestamps.
    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StorageError>;

    /// Sets `last_activated_at` to now for every id.
    async fn update_activation_time(&self, ids: &[i64]) -> Result<(), StorageError>;

    /// Persists a payload-less `RESET` sentinel that empties the next main-thread resolution.
    async fn create_reset_marker(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<StoredMessage, StorageError> {
        self.create_message(NewMessage {
            user_id,
            chat_id,
            platform_message_id: NO_PLATFORM_MESSAGE_ID,
            payload: None,
            previous_message_ids: Vec::new(),
            kind: MessageKind::Reset,
        })
        .await
    }
}

/// Destination of completion usage records. Callers treat failures as non-fatal.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_completion_usage(&self, usage: &CompletionUsage) -> Result<(), StorageError>;
}

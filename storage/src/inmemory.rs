//! In-memory [`MessageStore`] and [`UsageSink`], for tests and for running without a database file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{CompletionUsage, NewMessage, StoredMessage};
use std::sync::Mutex;

use crate::error::StorageError;
use crate::store::{MessageStore, UsageSink};

#[derive(Default)]
struct Inner {
    messages: Vec<StoredMessage>,
    usage: Vec<CompletionUsage>,
}

/// Vec-backed store; ids are 1-based positions, so id order is creation order.
#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: Mutex<Inner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Database("in-memory store lock poisoned".to_string()))
    }

    /// Overrides `last_activated_at` of the given nodes (replaying histories, expiry tests).
    pub fn set_activation_time(&self, ids: &[i64], at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        for m in inner.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            m.last_activated_at = at;
        }
        Ok(())
    }

    /// Snapshot of every stored node in creation order.
    pub fn all_messages(&self) -> Result<Vec<StoredMessage>, StorageError> {
        Ok(self.lock()?.messages.clone())
    }

    /// Snapshot of recorded usage.
    pub fn usage_records(&self) -> Result<Vec<CompletionUsage>, StorageError> {
        Ok(self.lock()?.usage.clone())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn get_last_message(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .rev()
            .find(|m| m.user_id == user_id && m.chat_id == chat_id)
            .cloned())
    }

    async fn get_messages_by_ids(&self, ids: &[i64]) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.iter().find(|m| m.id == *id))
            .cloned()
            .collect())
    }

    async fn get_platform_message(
        &self,
        chat_id: i64,
        platform_message_id: i64,
    ) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .rev()
            .find(|m| m.chat_id == chat_id && m.platform_message_id == platform_message_id)
            .cloned())
    }

    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let stored = StoredMessage {
            id: inner.messages.len() as i64 + 1,
            user_id: message.user_id,
            chat_id: message.chat_id,
            platform_message_id: message.platform_message_id,
            payload: message.payload,
            created_at: now,
            last_activated_at: now,
            previous_message_ids: message.previous_message_ids,
            kind: message.kind,
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn update_activation_time(&self, ids: &[i64]) -> Result<(), StorageError> {
        self.set_activation_time(ids, Utc::now())
    }
}

#[async_trait]
impl UsageSink for InMemoryMessageStore {
    async fn record_completion_usage(&self, usage: &CompletionUsage) -> Result<(), StorageError> {
        self.lock()?.usage.push(usage.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{DialogTurn, MessageKind};

    fn new_message(user_id: i64, chat_id: i64, platform_message_id: i64, previous: Vec<i64>) -> NewMessage {
        NewMessage {
            user_id,
            chat_id,
            platform_message_id,
            payload: Some(DialogTurn::user(format!("m{}", platform_message_id))),
            previous_message_ids: previous,
            kind: MessageKind::Message,
        }
    }

    #[tokio::test]
    async fn test_ids_are_sequential_and_last_message_is_per_user_and_chat() {
        let store = InMemoryMessageStore::new();
        let a = store.create_message(new_message(1, 10, 100, vec![])).await.unwrap();
        let b = store.create_message(new_message(1, 10, 101, vec![a.id])).await.unwrap();
        store.create_message(new_message(2, 10, 102, vec![])).await.unwrap();
        store.create_message(new_message(1, 11, 103, vec![])).await.unwrap();

        assert_eq!((a.id, b.id), (1, 2));
        let last = store.get_last_message(1, 10).await.unwrap().unwrap();
        assert_eq!(last.id, b.id);
        assert_eq!(last.previous_message_ids, vec![a.id]);
        assert!(store.get_last_message(3, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_by_ids_follow_requested_order() {
        let store = InMemoryMessageStore::new();
        let a = store.create_message(new_message(1, 10, 100, vec![])).await.unwrap();
        let b = store.create_message(new_message(1, 10, 101, vec![])).await.unwrap();

        let loaded = store.get_messages_by_ids(&[b.id, 99, a.id]).await.unwrap();
        let ids: Vec<i64> = loaded.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_reset_marker_has_no_payload() {
        let store = InMemoryMessageStore::new();
        let marker = store.create_reset_marker(1, 10).await.unwrap();
        assert_eq!(marker.kind, MessageKind::Reset);
        assert!(marker.payload.is_none());
        assert_eq!(store.get_last_message(1, 10).await.unwrap().unwrap().id, marker.id);
    }

    #[tokio::test]
    async fn test_usage_records_are_appended() {
        let store = InMemoryMessageStore::new();
        let usage = CompletionUsage {
            user_id: 1,
            model: "gpt-4".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        store.record_completion_usage(&usage).await.unwrap();
        assert_eq!(store.usage_records().unwrap(), vec![usage]);
    }
}

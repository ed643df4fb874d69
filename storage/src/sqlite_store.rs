//! SQLite-backed [`MessageStore`] and [`UsageSink`].
//!
//! Payloads and back-pointer lists are stored as JSON text; ids come from `AUTOINCREMENT`,
//! so id order is creation order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{CompletionUsage, DialogTurn, MessageKind, NewMessage, StoredMessage};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::sqlite_pool::SqlitePoolManager;
use crate::store::{MessageStore, UsageSink};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        chat_id INTEGER NOT NULL,
        platform_message_id INTEGER NOT NULL,
        payload TEXT,
        created_at TEXT NOT NULL,
        last_activated_at TEXT NOT NULL,
        previous_message_ids TEXT NOT NULL,
        kind TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_user_chat ON messages(user_id, chat_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_platform ON messages(chat_id, platform_message_id)",
    r#"
    CREATE TABLE IF NOT EXISTS completion_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        model TEXT NOT NULL,
        prompt_tokens INTEGER NOT NULL,
        completion_tokens INTEGER NOT NULL,
        total_tokens INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_completion_usage_user ON completion_usage(user_id)",
];

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    user_id: i64,
    chat_id: i64,
    platform_message_id: i64,
    payload: Option<String>,
    created_at: DateTime<Utc>,
    last_activated_at: DateTime<Utc>,
    previous_message_ids: String,
    kind: String,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt { id: row.id, reason };
        let payload = row
            .payload
            .as_deref()
            .map(serde_json::from_str::<DialogTurn>)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let previous_message_ids: Vec<i64> =
            serde_json::from_str(&row.previous_message_ids).map_err(|e| corrupt(e.to_string()))?;
        let kind: MessageKind = row.kind.parse().map_err(corrupt)?;
        Ok(StoredMessage {
            id: row.id,
            user_id: row.user_id,
            chat_id: row.chat_id,
            platform_message_id: row.platform_message_id,
            payload,
            created_at: row.created_at,
            last_activated_at: row.last_activated_at,
            previous_message_ids,
            kind,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    pool_manager: SqlitePoolManager,
}

impl SqliteMessageStore {
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let pool_manager = SqlitePoolManager::new(database_url).await?;
        let store = Self { pool_manager };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StorageError> {
        info!("Creating database tables if not exist");
        let pool = self.pool_manager.pool();
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        info!("Database tables created successfully");
        Ok(())
    }

    fn rows_to_messages(rows: Vec<MessageRow>) -> Result<Vec<StoredMessage>, StorageError> {
        rows.into_iter().map(StoredMessage::try_from).collect()
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn get_last_message(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE user_id = ? AND chat_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(chat_id)
        .fetch_optional(self.pool_manager.pool())
        .await?;
        row.map(StoredMessage::try_from).transpose()
    }

    async fn get_messages_by_ids(&self, ids: &[i64]) -> Result<Vec<StoredMessage>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM messages WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query_as::<_, MessageRow>(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(self.pool_manager.pool()).await?;
        debug!(requested = ids.len(), found = rows.len(), "Loaded messages by ids");
        let mut messages = Self::rows_to_messages(rows)?;
        messages.sort_by_key(|m| ids.iter().position(|id| *id == m.id));
        Ok(messages)
    }

    async fn get_platform_message(
        &self,
        chat_id: i64,
        platform_message_id: i64,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE chat_id = ? AND platform_message_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(chat_id)
        .bind(platform_message_id)
        .fetch_optional(self.pool_manager.pool())
        .await?;
        row.map(StoredMessage::try_from).transpose()
    }

    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        let now = Utc::now();
        let payload = message
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let previous = serde_json::to_string(&message.previous_message_ids)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (user_id, chat_id, platform_message_id, payload, created_at, last_activated_at, previous_message_ids, kind)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.user_id)
        .bind(message.chat_id)
        .bind(message.platform_message_id)
        .bind(&payload)
        .bind(now)
        .bind(now)
        .bind(&previous)
        .bind(message.kind.as_str())
        .execute(self.pool_manager.pool())
        .await?;

        let id = result.last_insert_rowid();
        info!(
            id,
            user_id = message.user_id,
            chat_id = message.chat_id,
            kind = message.kind.as_str(),
            previous = message.previous_message_ids.len(),
            "Saved message"
        );
        Ok(StoredMessage {
            id,
            user_id: message.user_id,
            chat_id: message.chat_id,
            platform_message_id: message.platform_message_id,
            payload: message.payload,
            created_at: now,
            last_activated_at: now,
            previous_message_ids: message.previous_message_ids,
            kind: message.kind,
        })
    }

    async fn update_activation_time(&self, ids: &[i64]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE messages SET last_activated_at = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(Utc::now());
        for id in ids {
            query = query.bind(*id);
        }
        let result = query.execute(self.pool_manager.pool()).await?;
        debug!(updated = result.rows_affected(), "Updated activation time");
        Ok(())
    }
}

#[async_trait]
impl UsageSink for SqliteMessageStore {
    async fn record_completion_usage(&self, usage: &CompletionUsage) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO completion_usage (user_id, model, prompt_tokens, completion_tokens, total_tokens, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(usage.user_id)
        .bind(&usage.model)
        .bind(usage.prompt_tokens as i64)
        .bind(usage.completion_tokens as i64)
        .bind(usage.total_tokens as i64)
        .bind(Utc::now())
        .execute(self.pool_manager.pool())
        .await?;
        Ok(())
    }
}

impl SqliteMessageStore {
    /// Number of usage records stored for `user_id`.
    pub async fn usage_count(&self, user_id: i64) -> Result<i64, StorageError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM completion_usage WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.pool_manager.pool())
            .await?;
        Ok(count.0)
    }
}

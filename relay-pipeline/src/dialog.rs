//! Dialog resolver: rebuilds the conversation thread an incoming message continues.
//!
//! A reply (that is not a forward) to a tracked message continues that message's branch: the
//! replied-to node and its ancestors, all re-activated. Anything else continues the user's main
//! thread in the chat: the latest node and its ancestors, unless that node is a reset marker or was
//! last activated longer ago than the expiration window, in which case the thread starts empty.

use chrono::Utc;
use relay_core::{ChatMessage, DialogTurn, MessageKind, NewMessage, Result, StoredMessage};
use std::sync::Arc;
use std::time::Duration;
use storage::MessageStore;
use tracing::{debug, info, instrument};

/// Ordered nodes of one conversation branch.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogThread {
    pub user_id: i64,
    pub chat_id: i64,
    pub nodes: Vec<StoredMessage>,
}

impl DialogThread {
    pub fn empty(user_id: i64, chat_id: i64) -> Self {
        Self {
            user_id,
            chat_id,
            nodes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Turns to send to the model; payload-less nodes are skipped.
    pub fn turns(&self) -> Vec<DialogTurn> {
        self.nodes.iter().filter_map(|n| n.payload.clone()).collect()
    }
}

pub struct DialogResolver {
    store: Arc<dyn MessageStore>,
    expiration: Duration,
}

impl DialogResolver {
    pub fn new(store: Arc<dyn MessageStore>, expiration: Duration) -> Self {
        Self { store, expiration }
    }

    #[instrument(skip(self, message), fields(user_id = message.user_id, chat_id = message.chat_id))]
    pub async fn resolve(&self, message: &ChatMessage) -> Result<DialogThread> {
        let (user_id, chat_id) = (message.user_id, message.chat_id);

        if let (Some(reply_to), false) = (message.reply_to_message_id, message.is_forward) {
            match self.store.get_platform_message(chat_id, reply_to).await? {
                Some(node) if node.kind != MessageKind::Reset => {
                    let nodes = self.load_branch(&node).await?;
                    let ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
                    self.store.update_activation_time(&ids).await?;
                    info!(reply_to, size = nodes.len(), "step: resolved sub-thread");
                    return Ok(DialogThread {
                        user_id,
                        chat_id,
                        nodes,
                    });
                }
                Some(_) => return Ok(DialogThread::empty(user_id, chat_id)),
                None => debug!(reply_to, "Reply to untracked message, using main thread"),
            }
        }

        let Some(last) = self.store.get_last_message(user_id, chat_id).await? else {
            return Ok(DialogThread::empty(user_id, chat_id));
        };
        if last.kind == MessageKind::Reset {
            debug!("Last node is a reset marker, starting empty thread");
            return Ok(DialogThread::empty(user_id, chat_id));
        }
        let idle = Utc::now().signed_duration_since(last.last_activated_at);
        if idle.to_std().map(|idle| idle > self.expiration).unwrap_or(false) {
            debug!(idle_secs = idle.num_seconds(), "Main thread expired, starting empty thread");
            return Ok(DialogThread::empty(user_id, chat_id));
        }

        let nodes = self.load_branch(&last).await?;
        info!(size = nodes.len(), "step: resolved main thread");
        Ok(DialogThread {
            user_id,
            chat_id,
            nodes,
        })
    }

    /// `node`'s ancestors in creation order, followed by `node`.
    async fn load_branch(&self, node: &StoredMessage) -> Result<Vec<StoredMessage>> {
        let mut nodes = self
            .store
            .get_messages_by_ids(&node.previous_message_ids)
            .await?;
        nodes.push(node.clone());
        Ok(nodes)
    }

    /// Persists `turn` as the next node of `thread` and returns the extended thread.
    pub async fn append(
        &self,
        mut thread: DialogThread,
        turn: DialogTurn,
        platform_message_id: i64,
    ) -> Result<DialogThread> {
        let node = self
            .store
            .create_message(NewMessage {
                user_id: thread.user_id,
                chat_id: thread.chat_id,
                platform_message_id,
                payload: Some(turn),
                previous_message_ids: thread.ids(),
                kind: MessageKind::Message,
            })
            .await?;
        thread.nodes.push(node);
        Ok(thread)
    }

    /// Forgets the main thread: the next non-reply message starts an empty conversation.
    pub async fn reset(&self, user_id: i64, chat_id: i64) -> Result<()> {
        self.store.create_reset_marker(user_id, chat_id).await?;
        info!(user_id, chat_id, "step: conversation reset");
        Ok(())
    }
}

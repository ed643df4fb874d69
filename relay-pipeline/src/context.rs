//! Context window manager: keeps a thread inside a model's token budgets.

use async_trait::async_trait;
use llm_client::{ModelSpec, Tokenizers};
use relay_core::{
    DialogTurn, MessageKind, NewMessage, RelayError, Result, Role, NO_PLATFORM_MESSAGE_ID,
};
use std::sync::Arc;
use storage::MessageStore;
use tracing::{info, instrument, warn};

use crate::dialog::DialogThread;

pub const SUMMARY_PREFIX: &str = "Summarized previous conversation:\n";

/// Condenses turns into a short text of about `target_tokens` tokens.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        user_id: i64,
        model: &str,
        turns: &[DialogTurn],
        target_tokens: usize,
    ) -> Result<String>;
}

pub struct ContextWindow {
    store: Arc<dyn MessageStore>,
    tokenizers: Arc<dyn Tokenizers>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextWindow {
    pub fn new(
        store: Arc<dyn MessageStore>,
        tokenizers: Arc<dyn Tokenizers>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            store,
            tokenizers,
            summarizer,
        }
    }

    /// Tokens `thread` costs when sent to `model`.
    pub fn count(&self, thread: &DialogThread, model: &ModelSpec) -> usize {
        self.tokenizers
            .for_model(&model.name)
            .count_turns(&thread.turns())
    }

    /// Fails with `ContextTooLarge` above the hard ceiling. With `auto_summarize` and a thread at or
    /// above the short-term budget, replaces the oldest nodes with one persisted summary node so the
    /// kept suffix fits in half the budget, and re-persists the last node with the summarized
    /// ancestry. Otherwise returns the thread unchanged.
    #[instrument(skip(self, thread, model), fields(user_id = thread.user_id, model = %model.name))]
    pub async fn bound(
        &self,
        thread: DialogThread,
        model: &ModelSpec,
        auto_summarize: bool,
    ) -> Result<DialogThread> {
        let config = &model.context;
        let total = self.count(&thread, model);
        if total > config.hard_max_tokens {
            warn!(tokens = total, limit = config.hard_max_tokens, "Context too large");
            return Err(RelayError::ContextTooLarge {
                tokens: total,
                limit: config.hard_max_tokens,
            });
        }
        if !auto_summarize || total < config.short_term_budget_tokens {
            return Ok(thread);
        }

        let Some(split) = self.split_point(&thread, model) else {
            warn!(tokens = total, "No split point keeps the suffix within half the budget, summarizing nothing");
            return Ok(thread);
        };

        let (head, suffix) = thread.nodes.split_at(split);
        let Some((tail, kept)) = suffix.split_last() else {
            return Ok(thread);
        };
        let head_turns: Vec<DialogTurn> = head.iter().filter_map(|n| n.payload.clone()).collect();
        let summary = self
            .summarizer
            .summarize(
                thread.user_id,
                &model.name,
                &head_turns,
                config.summary_length_tokens,
            )
            .await?;

        let summary_node = self
            .store
            .create_message(NewMessage {
                user_id: thread.user_id,
                chat_id: thread.chat_id,
                platform_message_id: NO_PLATFORM_MESSAGE_ID,
                payload: Some(DialogTurn::user(format!("{}{}", SUMMARY_PREFIX, summary))),
                previous_message_ids: Vec::new(),
                kind: MessageKind::Summary,
            })
            .await?;

        // Persisted again on top of the summary: the newest node must reach it.
        let mut nodes = Vec::with_capacity(suffix.len() + 1);
        nodes.push(summary_node);
        nodes.extend_from_slice(kept);
        let relinked = self
            .store
            .create_message(NewMessage {
                user_id: thread.user_id,
                chat_id: thread.chat_id,
                platform_message_id: tail.platform_message_id,
                payload: tail.payload.clone(),
                previous_message_ids: nodes.iter().map(|n| n.id).collect(),
                kind: tail.kind,
            })
            .await?;
        nodes.push(relinked);
        let bounded = DialogThread {
            user_id: thread.user_id,
            chat_id: thread.chat_id,
            nodes,
        };
        info!(
            before = total,
            after = self.count(&bounded, model),
            summarized = split,
            "step: thread summarized"
        );
        Ok(bounded)
    }

    /// Earliest index whose suffix fits in half the short-term budget and does not open with a
    /// function or tool result. Index 0 (nothing to summarize) counts as no split.
    pub fn split_point(&self, thread: &DialogThread, model: &ModelSpec) -> Option<usize> {
        let counter = self.tokenizers.for_model(&model.name);
        let target = model.context.short_term_budget_tokens / 2;
        (1..thread.nodes.len()).find(|&i| {
            let orphan_result = thread.nodes[i]
                .payload
                .as_ref()
                .is_some_and(|turn| matches!(turn.role, Role::Function | Role::Tool));
            if orphan_result {
                return false;
            }
            let suffix: Vec<DialogTurn> = thread.nodes[i..]
                .iter()
                .filter_map(|n| n.payload.clone())
                .collect();
            counter.count_turns(&suffix) <= target
        })
    }
}

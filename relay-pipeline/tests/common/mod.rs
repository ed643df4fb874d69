//! Test doubles shared by the pipeline integration tests.
//!
//! [`MockBot`] records every send, edit and typing action and hands out increasing message ids.
//! [`ScriptedBackend`] answers completion requests from a queue of scripts and records requests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use llm_client::{
    Capabilities, Completion, CompletionBackend, CompletionRequest, ContextConfiguration,
    ModelRegistry, ModelSpec, PartialTurn, TokenUsage, TurnStream,
};
use relay_core::{Bot, DialogTurn, OutgoingRef, RelayError, Result, SendOptions};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_MODEL: &str = "test-model";

/// Usage reported by scripted replies.
pub const SCRIPT_USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 10,
    completion_tokens: 5,
    total_tokens: 15,
};

#[derive(Debug, Clone, PartialEq)]
pub enum BotCall {
    Sent {
        chat_id: i64,
        message_id: i64,
        text: String,
        options: SendOptions,
    },
    Edited {
        chat_id: i64,
        message_id: i64,
        text: String,
        options: SendOptions,
    },
    Typing {
        chat_id: i64,
    },
}

pub struct MockBot {
    calls: Mutex<Vec<BotCall>>,
    next_id: AtomicI64,
}

impl MockBot {
    /// Sent messages get ids 1000, 1001, ...
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        })
    }

    pub fn calls(&self) -> Vec<BotCall> {
        self.calls.lock().unwrap().clone()
    }

    /// `(message_id, text)` of every sent message.
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BotCall::Sent {
                    message_id, text, ..
                } => Some((message_id, text)),
                _ => None,
            })
            .collect()
    }

    /// `(message_id, text)` of every edit.
    pub fn edits(&self) -> Vec<(i64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BotCall::Edited {
                    message_id, text, ..
                } => Some((message_id, text)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Bot for MockBot {
    async fn send_message(&self, chat_id: i64, text: &str, options: &SendOptions) -> Result<OutgoingRef> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(BotCall::Sent {
            chat_id,
            message_id,
            text: text.to_string(),
            options: options.clone(),
        });
        Ok(OutgoingRef {
            chat_id,
            message_id,
        })
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<OutgoingRef> {
        self.calls.lock().unwrap().push(BotCall::Edited {
            chat_id,
            message_id,
            text: text.to_string(),
            options: options.clone(),
        });
        Ok(OutgoingRef {
            chat_id,
            message_id,
        })
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.calls.lock().unwrap().push(BotCall::Typing { chat_id });
        Ok(())
    }
}

/// One scripted backend answer.
#[derive(Debug, Clone)]
pub enum Script {
    /// Whole reply at once (a single item when streamed).
    Reply(DialogTurn),
    /// Text arriving in `chunks`, one every `delay`; the last item carries [`SCRIPT_USAGE`].
    Stream { chunks: Vec<String>, delay: Duration },
    /// The request fails.
    Fail(String),
}

impl Script {
    pub fn text(text: &str) -> Self {
        Script::Reply(DialogTurn::assistant(text))
    }

    /// `text` split into words, each chunk keeping its trailing space.
    pub fn words(text: &str, delay: Duration) -> Self {
        Script::Stream {
            chunks: text.split_inclusive(' ').map(str::to_string).collect(),
            delay,
        }
    }
}

pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    /// Replayed once the queue is empty.
    repeat: Option<Script>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers every request with `script`.
    pub fn repeating(script: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            repeat: Some(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_script(&self, request: CompletionRequest) -> Result<Script> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .ok_or_else(|| RelayError::Completion("no script left".to_string()))?;
        match script {
            Script::Fail(reason) => Err(RelayError::Completion(reason)),
            script => Ok(script),
        }
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let turn = match self.next_script(request)? {
            Script::Reply(turn) => turn,
            Script::Stream { chunks, .. } => DialogTurn::assistant(chunks.concat()),
            Script::Fail(_) => unreachable!(),
        };
        Ok(Completion {
            turn,
            usage: Some(SCRIPT_USAGE),
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<TurnStream> {
        match self.next_script(request)? {
            Script::Reply(turn) => Ok(Box::pin(futures::stream::iter(vec![Ok(PartialTurn {
                turn,
                usage: Some(SCRIPT_USAGE),
            })]))),
            Script::Stream { chunks, delay } => {
                let count = chunks.len();
                let mut text = String::new();
                let items: Vec<PartialTurn> = chunks
                    .iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        text.push_str(chunk);
                        PartialTurn {
                            turn: DialogTurn::assistant(text.clone()),
                            usage: (i + 1 == count).then_some(SCRIPT_USAGE),
                        }
                    })
                    .collect();
                let stream = futures::stream::iter(items).then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    Ok(item)
                });
                Ok(Box::pin(stream))
            }
            Script::Fail(_) => unreachable!(),
        }
    }
}

/// Model with every capability and the given budgets.
pub fn test_model(budget: usize, summary: usize, hard: usize) -> ModelSpec {
    ModelSpec {
        name: TEST_MODEL.to_string(),
        capabilities: Capabilities::OPENAI_CHAT,
        context: ContextConfiguration::new(budget, summary, hard).unwrap(),
        base_url: None,
        api_key: "test".to_string(),
    }
}

pub fn registry(model: ModelSpec) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new([model]))
}

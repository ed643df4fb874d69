//! Completion driver: sends bounded threads to the backend and records exactly one usage record
//! per model call, estimating it with the token counter when the provider does not report it.

use async_trait::async_trait;
use futures::StreamExt;
use llm_client::{
    CallingStrategy, CompletionBackend, CompletionRequest, TokenUsage, Tokenizers, TurnStream,
};
use relay_core::{CompletionUsage, DialogTurn, Result, Role};
use std::sync::Arc;
use storage::UsageSink;
use tracing::{debug, info, instrument, warn};

use crate::context::Summarizer;

/// Completion tokens of a cancelled stream are multiplied by this; the provider keeps generating
/// until it notices the closed connection.
pub const CANCELLED_COMPLETION_FUDGE: f64 = 1.2;

const SUMMARY_TEMPERATURE: f32 = 0.2;

/// How a streaming answer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Cancelled,
}

pub struct CompletionDriver {
    backend: Arc<dyn CompletionBackend>,
    usage_sink: Arc<dyn UsageSink>,
    tokenizers: Arc<dyn Tokenizers>,
}

impl CompletionDriver {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        usage_sink: Arc<dyn UsageSink>,
        tokenizers: Arc<dyn Tokenizers>,
    ) -> Self {
        Self {
            backend,
            usage_sink,
            tokenizers,
        }
    }

    /// One request, one reply turn, one usage record.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn complete(&self, user_id: i64, request: CompletionRequest) -> Result<DialogTurn> {
        let model = request.model.clone();
        let prompt_tokens = self.prompt_tokens(&request);
        let completion = self.backend.complete(request).await?;
        let usage = completion.usage.unwrap_or_else(|| TokenUsage {
            prompt_tokens,
            completion_tokens: self
                .tokenizers
                .for_model(&model)
                .count_turn(&completion.turn) as u32,
            total_tokens: 0,
        });
        record_usage(self.usage_sink.as_ref(), user_id, &model, usage).await;
        Ok(completion.turn)
    }

    /// Starts a streaming call. Usage is recorded by [`CompletionStream::finish`].
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn stream(&self, user_id: i64, request: CompletionRequest) -> Result<CompletionStream> {
        let prompt_tokens = self.prompt_tokens(&request);
        let model = request.model.clone();
        let inner = self.backend.complete_stream(request).await?;
        debug!(prompt_tokens, "step: completion stream opened");
        Ok(CompletionStream {
            inner,
            user_id,
            model,
            prompt_tokens,
            last: None,
            usage: None,
            usage_sink: self.usage_sink.clone(),
            tokenizers: self.tokenizers.clone(),
        })
    }

    fn prompt_tokens(&self, request: &CompletionRequest) -> u32 {
        let system = DialogTurn::user(request.system_prompt.clone());
        let turns: Vec<DialogTurn> = std::iter::once(system)
            .chain(request.turns.iter().cloned())
            .collect();
        self.tokenizers
            .for_model(&request.model)
            .count_turns(&turns) as u32
    }
}

/// Renders turns as a plain transcript so call/result pairs never reach the model half-split.
fn transcript(turns: &[DialogTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Function | Role::Tool => "function",
            };
            let mut line = format!("{}: {}", role, turn.text());
            if let Some(call) = &turn.function_call {
                line.push_str(&format!(" [call {}({})]", call.name, call.arguments));
            }
            for call in &turn.tool_calls {
                line.push_str(&format!(" [call {}({})]", call.function.name, call.function.arguments));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Summarizer for CompletionDriver {
    async fn summarize(
        &self,
        user_id: i64,
        model: &str,
        turns: &[DialogTurn],
        target_tokens: usize,
    ) -> Result<String> {
        info!(user_id, turns = turns.len(), target_tokens, "step: summarizing");
        let request = CompletionRequest {
            model: model.to_string(),
            system_prompt: format!(
                "Summarize the conversation you are given in no more than {} tokens. \
                 Keep facts, names, decisions and open questions; drop pleasantries.",
                target_tokens
            ),
            turns: vec![DialogTurn::user(transcript(turns))],
            tools: Vec::new(),
            strategy: CallingStrategy::Plain,
            temperature: SUMMARY_TEMPERATURE,
        };
        let turn = self.complete(user_id, request).await?;
        Ok(turn.text())
    }
}

async fn record_usage(sink: &dyn UsageSink, user_id: i64, model: &str, usage: TokenUsage) {
    let total = if usage.total_tokens == 0 {
        usage.prompt_tokens + usage.completion_tokens
    } else {
        usage.total_tokens
    };
    let record = CompletionUsage {
        user_id,
        model: model.to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: total,
    };
    if let Err(e) = sink.record_completion_usage(&record).await {
        warn!(user_id, error = %e, "Failed to record completion usage");
    }
}

/// In-flight streaming call. Yields the reply accumulated so far.
pub struct CompletionStream {
    inner: TurnStream,
    user_id: i64,
    model: String,
    prompt_tokens: u32,
    last: Option<DialogTurn>,
    usage: Option<TokenUsage>,
    usage_sink: Arc<dyn UsageSink>,
    tokenizers: Arc<dyn Tokenizers>,
}

impl CompletionStream {
    pub async fn next(&mut self) -> Option<Result<DialogTurn>> {
        match self.inner.next().await? {
            Ok(partial) => {
                if partial.usage.is_some() {
                    self.usage = partial.usage;
                }
                self.last = Some(partial.turn.clone());
                Some(Ok(partial.turn))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Closes the stream, records usage and returns the last accumulated turn.
    pub async fn finish(self, end: StreamEnd) -> Option<DialogTurn> {
        let usage = match (end, self.usage) {
            (StreamEnd::Completed, Some(usage)) => usage,
            _ => {
                let counted = self
                    .last
                    .as_ref()
                    .map(|t| self.tokenizers.for_model(&self.model).count_turn(t))
                    .unwrap_or(0) as f64;
                let completion = match end {
                    StreamEnd::Cancelled => (counted * CANCELLED_COMPLETION_FUDGE).ceil(),
                    StreamEnd::Completed => counted,
                };
                TokenUsage {
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: completion as u32,
                    total_tokens: 0,
                }
            }
        };
        drop(self.inner);
        record_usage(self.usage_sink.as_ref(), self.user_id, &self.model, usage).await;
        self.last
    }
}

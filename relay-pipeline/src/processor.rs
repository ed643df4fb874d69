//! Message processor: answers one batch.
//!
//! Resolves the thread the batch continues, appends the batch as user turns, then runs the answer
//! loop: request a completion, deliver it (streamed or at once), persist what was delivered and
//! execute any function/tool calls until the model answers in plain text, the user cancels, or the
//! function-call limit is hit.

use async_trait::async_trait;
use llm_client::{
    CallingStrategy, CompletionBackend, CompletionMode, CompletionRequest, ModelRegistry, ModelSpec,
    ModelTokenizers, PromptModes, Tokenizers,
};
use relay_core::{
    send_with_fallback, Bot, ChatMessage, ContentPart, DialogTurn, MessageContent, RelayError,
    Result, SendOptions, TextFormat, NO_PLATFORM_MESSAGE_ID,
};
use std::sync::Arc;
use storage::{MessageStore, UsageSink};
use tracing::{debug, error, info, instrument, warn};

use crate::batcher::Batch;
use crate::cancellation::{CancellationRegistry, CancellationToken};
use crate::completion::{CompletionDriver, StreamEnd};
use crate::config::PipelineConfig;
use crate::context::ContextWindow;
use crate::dialog::{DialogResolver, DialogThread};
use crate::preferences::{PreferencesProvider, UserPreferences};
use crate::sequencer::BatchProcessor;
use crate::streaming::{deliver_text, AssembledReply, StreamingAssembler};
use crate::tools::ToolRegistry;
use crate::typing::TypingIndicator;

pub const FAILURE_NOTICE: &str = "Something went wrong while answering. Please try again later.";
pub const CONTEXT_TOO_LARGE_NOTICE: &str =
    "This conversation is too long to continue. Send /reset or reply to an earlier message to branch off.";
pub const FUNCTION_LOOP_NOTICE: &str =
    "Stopped answering: the model kept calling functions without replying.";

/// Text shown to the user when answering a batch fails.
pub fn failure_notice(error: &RelayError) -> &'static str {
    match error {
        RelayError::ContextTooLarge { .. } => CONTEXT_TOO_LARGE_NOTICE,
        RelayError::FunctionLoopExceeded { .. } => FUNCTION_LOOP_NOTICE,
        _ => FAILURE_NOTICE,
    }
}

/// Collaborators of [`MessageProcessor`].
pub struct ProcessorDeps {
    pub bot: Arc<dyn Bot>,
    pub store: Arc<dyn MessageStore>,
    pub usage_sink: Arc<dyn UsageSink>,
    pub backend: Arc<dyn CompletionBackend>,
    pub models: Arc<ModelRegistry>,
    pub preferences: Arc<dyn PreferencesProvider>,
    pub cancellation: Arc<CancellationRegistry>,
}

pub struct MessageProcessor {
    bot: Arc<dyn Bot>,
    resolver: DialogResolver,
    window: ContextWindow,
    driver: Arc<CompletionDriver>,
    assembler: StreamingAssembler,
    models: Arc<ModelRegistry>,
    modes: PromptModes,
    tools: ToolRegistry,
    preferences: Arc<dyn PreferencesProvider>,
    cancellation: Arc<CancellationRegistry>,
    config: PipelineConfig,
}

/// Per-answer values shared by the loop steps.
struct Answer<'a> {
    user_id: i64,
    chat_id: i64,
    model: &'a ModelSpec,
    preferences: &'a UserPreferences,
    system_prompt: String,
    options: SendOptions,
}

impl MessageProcessor {
    /// Counts tokens with each registered model's tiktoken encoding where one exists.
    pub fn new(deps: ProcessorDeps, config: PipelineConfig) -> Self {
        let tokenizers = ModelTokenizers::new(deps.models.iter().map(|m| m.name.as_str()));
        Self::with_tokenizers(deps, config, Arc::new(tokenizers))
    }

    pub fn with_tokenizers(
        deps: ProcessorDeps,
        config: PipelineConfig,
        tokenizers: Arc<dyn Tokenizers>,
    ) -> Self {
        let driver = Arc::new(CompletionDriver::new(
            deps.backend,
            deps.usage_sink,
            tokenizers.clone(),
        ));
        Self {
            resolver: DialogResolver::new(deps.store.clone(), config.message_expiration),
            window: ContextWindow::new(deps.store, tokenizers, driver.clone()),
            assembler: StreamingAssembler::new(
                deps.bot.clone(),
                config.stream_edit_interval,
                config.message_limit,
            ),
            bot: deps.bot,
            driver,
            models: deps.models,
            modes: PromptModes::default(),
            tools: ToolRegistry::new(),
            preferences: deps.preferences,
            cancellation: deps.cancellation,
            config,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_modes(mut self, modes: PromptModes) -> Self {
        self.modes = modes;
        self
    }

    /// Starts a fresh main thread for the user in the chat.
    pub async fn reset(&self, user_id: i64, chat_id: i64) -> Result<()> {
        self.resolver.reset(user_id, chat_id).await
    }

    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    async fn answer_batch(&self, user_id: i64, messages: &[ChatMessage]) -> Result<()> {
        let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
            return Ok(());
        };
        let chat_id = first.chat_id;

        let preferences = self.preferences.preferences(user_id).await?;
        let model = self.models.get(&preferences.model)?;
        let system_prompt = self.modes.get(&preferences.mode)?.to_string();

        let mut thread = self.resolver.resolve(first).await?;
        thread = self
            .window
            .bound(thread, model, preferences.auto_summarize)
            .await?;

        let mut has_prompt = false;
        for message in messages {
            has_prompt |= !message.is_forward || preferences.forward_as_prompt;
            thread = self
                .append_bounded(thread, user_turn(message), message.platform_message_id, model, &preferences)
                .await?;
        }
        info!(chat_id, size = thread.len(), "step: batch appended");
        if !has_prompt {
            debug!("Only forwarded messages, stored as context");
            return Ok(());
        }

        let answer = Answer {
            user_id,
            chat_id,
            model,
            preferences: &preferences,
            system_prompt,
            options: SendOptions {
                reply_to: last.reply_to_message_id.map(|_| last.platform_message_id),
                format: TextFormat::Markdown,
                cancel_button: false,
            },
        };

        let token = self.cancellation.get_token(user_id);
        let typing = TypingIndicator::start(
            self.bot.clone(),
            chat_id,
            self.config.typing_interval,
            self.config.typing_max,
        );
        let outcome = self.answer_loop(thread, &answer, &token).await;
        drop(typing);
        self.cancellation.release(user_id, &token);
        outcome
    }

    async fn answer_loop(
        &self,
        mut thread: DialogThread,
        answer: &Answer<'_>,
        token: &CancellationToken,
    ) -> Result<()> {
        let capabilities = &answer.model.capabilities;
        let strategy = CallingStrategy::select(
            capabilities,
            !self.tools.is_empty(),
            answer.preferences.use_functions,
        );
        let mode = CompletionMode::select(capabilities, answer.preferences.streaming);
        let mut calls = 0usize;

        loop {
            let request = CompletionRequest {
                model: answer.model.name.clone(),
                system_prompt: answer.system_prompt.clone(),
                turns: thread.turns(),
                tools: match strategy {
                    CallingStrategy::Plain => Vec::new(),
                    _ => self.tools.specs(),
                },
                strategy,
                temperature: self.config.temperature,
            };

            let reply = match mode {
                CompletionMode::Sync => self.reply_sync(answer, request).await?,
                CompletionMode::Streaming => {
                    let stream = self.driver.stream(answer.user_id, request).await?;
                    self.assembler
                        .assemble(answer.chat_id, stream, token, &answer.options)
                        .await?
                }
            };
            thread = self.persist_reply(thread, &reply, answer).await?;

            if reply.end == StreamEnd::Cancelled {
                info!("step: answer cancelled");
                return Ok(());
            }
            let Some(turn) = reply.turn.filter(DialogTurn::has_call) else {
                info!(size = thread.len(), "step: answer delivered");
                return Ok(());
            };

            calls += 1;
            if calls > self.config.function_call_limit {
                warn!(calls, limit = self.config.function_call_limit, "Function call limit exceeded");
                return Err(RelayError::FunctionLoopExceeded {
                    limit: self.config.function_call_limit,
                });
            }
            thread = self.run_calls(thread, &turn, answer).await?;
        }
    }

    async fn reply_sync(&self, answer: &Answer<'_>, request: CompletionRequest) -> Result<AssembledReply> {
        let turn = self.driver.complete(answer.user_id, request).await?;
        let text = turn.text();
        let parts = if text.is_empty() {
            Vec::new()
        } else {
            deliver_text(
                self.bot.as_ref(),
                answer.chat_id,
                &text,
                &answer.options,
                self.config.message_limit,
            )
            .await?
        };
        Ok(AssembledReply {
            end: StreamEnd::Completed,
            turn: Some(turn),
            parts,
        })
    }

    /// Call turns are stored whole; plain replies as one node per delivered message so replies to
    /// any part branch from it.
    async fn persist_reply(
        &self,
        mut thread: DialogThread,
        reply: &AssembledReply,
        answer: &Answer<'_>,
    ) -> Result<DialogThread> {
        let Some(turn) = &reply.turn else {
            return Ok(thread);
        };
        if turn.has_call() || reply.parts.is_empty() {
            if !turn.has_call() && turn.text().is_empty() {
                return Ok(thread);
            }
            let platform_message_id = reply
                .parts
                .first()
                .map(|p| p.outgoing.message_id)
                .unwrap_or(NO_PLATFORM_MESSAGE_ID);
            return self
                .append_bounded(thread, turn.clone(), platform_message_id, answer.model, answer.preferences)
                .await;
        }
        for part in &reply.parts {
            thread = self
                .append_bounded(
                    thread,
                    DialogTurn::assistant(part.text.clone()),
                    part.outgoing.message_id,
                    answer.model,
                    answer.preferences,
                )
                .await?;
        }
        Ok(thread)
    }

    async fn run_calls(
        &self,
        mut thread: DialogThread,
        turn: &DialogTurn,
        answer: &Answer<'_>,
    ) -> Result<DialogThread> {
        if let Some(call) = &turn.function_call {
            let output = self.call_tool(&call.name, &call.arguments).await?;
            thread = self
                .append_bounded(
                    thread,
                    DialogTurn::function_result(call.name.clone(), output),
                    NO_PLATFORM_MESSAGE_ID,
                    answer.model,
                    answer.preferences,
                )
                .await?;
        }
        for call in &turn.tool_calls {
            let output = self
                .call_tool(&call.function.name, &call.function.arguments)
                .await?;
            thread = self
                .append_bounded(
                    thread,
                    DialogTurn::tool_result(call.id.clone(), output),
                    NO_PLATFORM_MESSAGE_ID,
                    answer.model,
                    answer.preferences,
                )
                .await?;
        }
        Ok(thread)
    }

    /// Unknown tools fail the answer; a failing tool reports its error back to the model.
    async fn call_tool(&self, name: &str, arguments: &str) -> Result<String> {
        let tool = self.tools.get(name)?;
        info!(tool = name, "step: calling tool");
        match tool.call(arguments).await {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                Ok(format!("Error: {}", e))
            }
        }
    }

    async fn append_bounded(
        &self,
        thread: DialogThread,
        turn: DialogTurn,
        platform_message_id: i64,
        model: &ModelSpec,
        preferences: &UserPreferences,
    ) -> Result<DialogThread> {
        let thread = self.resolver.append(thread, turn, platform_message_id).await?;
        self.window
            .bound(thread, model, preferences.auto_summarize)
            .await
    }
}

/// User turn for `message`; forwards are prefixed with the original sender.
fn user_turn(message: &ChatMessage) -> DialogTurn {
    let content = match (&message.forward_sender, message.is_forward) {
        (Some(sender), true) => match &message.content {
            MessageContent::Text(text) => MessageContent::Text(format!("{}:\n{}", sender, text)),
            MessageContent::Parts(parts) => {
                let mut prefixed = vec![ContentPart::Text {
                    text: format!("{}:", sender),
                }];
                prefixed.extend(parts.iter().cloned());
                MessageContent::Parts(prefixed)
            }
        },
        _ => message.content.clone(),
    };
    DialogTurn::user_content(content)
}

#[async_trait]
impl BatchProcessor for MessageProcessor {
    async fn process(&self, batch: Batch) -> Result<()> {
        let Batch {
            user_id,
            mut messages,
        } = batch;
        messages.sort_by_key(|m| m.platform_message_id);
        let Some(chat_id) = messages.first().map(|m| m.chat_id) else {
            return Ok(());
        };

        match self.answer_batch(user_id, &messages).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(user_id, chat_id, error = %e, "Failed to answer batch");
                let notice = failure_notice(&e);
                if let Err(send_err) =
                    send_with_fallback(self.bot.as_ref(), chat_id, notice, &SendOptions::default())
                        .await
                {
                    warn!(chat_id, error = %send_err, "Failed to send failure notice");
                }
                Err(e)
            }
        }
    }
}

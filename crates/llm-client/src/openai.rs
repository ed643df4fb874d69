//! [`CompletionBackend`] over OpenAI-compatible chat completions (OpenAI itself and Ollama).

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionFunctionsArgs, ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestFunctionMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImageArgs, ChatCompletionRequestMessageContentPartTextArgs,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
    ChatCompletionRequestUserMessageContentPart, ChatCompletionResponseMessage,
    ChatCompletionStreamOptions, ChatCompletionToolArgs, ChatCompletionToolType,
    CompletionUsage as OpenAiUsage, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    CreateChatCompletionStreamResponse, FunctionCall as OpenAiFunctionCall, FunctionObjectArgs,
    ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures::StreamExt;
use relay_core::{
    ContentPart, DialogTurn, FunctionCall, MessageContent, RelayError, Result, Role, ToolCall,
};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use crate::mask::mask_token;
use crate::models::{CallingStrategy, ModelRegistry};
use crate::{Completion, CompletionBackend, CompletionRequest, PartialTurn, TokenUsage, TurnStream};

fn completion_error(e: OpenAIError) -> RelayError {
    RelayError::Completion(e.to_string())
}

struct Endpoint {
    client: Client<OpenAIConfig>,
    masked_key: String,
}

/// One async-openai client per registered model, pointed at the model's endpoint.
pub struct OpenAiBackend {
    endpoints: HashMap<String, Endpoint>,
}

impl OpenAiBackend {
    pub fn new(registry: &ModelRegistry) -> Self {
        let endpoints = registry
            .iter()
            .map(|spec| {
                let mut config = OpenAIConfig::new().with_api_key(spec.api_key.clone());
                if let Some(base_url) = &spec.base_url {
                    config = config.with_api_base(base_url.clone());
                }
                let endpoint = Endpoint {
                    client: Client::with_config(config),
                    masked_key: mask_token(&spec.api_key),
                };
                (spec.name.clone(), endpoint)
            })
            .collect();
        Self { endpoints }
    }

    fn endpoint(&self, model: &str) -> Result<&Endpoint> {
        self.endpoints
            .get(model)
            .ok_or_else(|| RelayError::UnknownModel(model.to_string()))
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let endpoint = self.endpoint(&request.model)?;
        info!(
            message_count = request.turns.len(),
            api_key = %endpoint.masked_key,
            "OpenAI chat completion request"
        );
        let request = build_request(&request, false).map_err(completion_error)?;
        log_request(&request);

        let response = endpoint
            .client
            .chat()
            .create(request)
            .await
            .map_err(completion_error)?;

        let usage = response.usage.as_ref().map(token_usage);
        if let Some(u) = usage {
            info!(
                prompt_tokens = u.prompt_tokens,
                completion_tokens = u.completion_tokens,
                total_tokens = u.total_tokens,
                "OpenAI chat completion usage"
            );
        }

        let choice = response
            .choices
            .first()
            .ok_or_else(|| RelayError::Completion("No response from model".to_string()))?;
        Ok(Completion {
            turn: response_turn(&choice.message),
            usage,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete_stream(&self, request: CompletionRequest) -> Result<TurnStream> {
        let endpoint = self.endpoint(&request.model)?;
        info!(
            message_count = request.turns.len(),
            api_key = %endpoint.masked_key,
            "OpenAI chat completion stream request"
        );
        let request = build_request(&request, true).map_err(completion_error)?;
        log_request(&request);

        let stream = endpoint
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(completion_error)?;

        let turns = stream.scan(StreamAccumulator::default(), |acc, item| {
            let partial = item.map_err(completion_error).map(|chunk| {
                acc.apply(&chunk);
                PartialTurn {
                    turn: acc.snapshot(),
                    usage: chunk.usage.as_ref().map(token_usage),
                }
            });
            futures::future::ready(Some(partial))
        });
        Ok(Box::pin(turns))
    }
}

fn log_request(request: &CreateChatCompletionRequest) {
    if let Ok(json) = serde_json::to_string(request) {
        debug!(request_json = %json, "OpenAI request JSON");
    }
}

fn token_usage(usage: &OpenAiUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

#[allow(deprecated)]
fn build_request(
    request: &CompletionRequest,
    stream: bool,
) -> std::result::Result<CreateChatCompletionRequest, OpenAIError> {
    let mut messages: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestSystemMessageArgs::default()
            .content(request.system_prompt.clone())
            .build()?
            .into(),
    ];
    for turn in &request.turns {
        messages.push(to_openai_message(turn)?);
    }

    let mut args = CreateChatCompletionRequestArgs::default();
    args.model(request.model.clone())
        .messages(messages)
        .temperature(request.temperature);

    if !request.tools.is_empty() {
        match request.strategy {
            CallingStrategy::Tools => {
                let tools = request
                    .tools
                    .iter()
                    .map(|tool| {
                        ChatCompletionToolArgs::default()
                            .r#type(ChatCompletionToolType::Function)
                            .function(
                                FunctionObjectArgs::default()
                                    .name(tool.name.clone())
                                    .description(tool.description.clone())
                                    .parameters(tool.parameters.clone())
                                    .build()?,
                            )
                            .build()
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                args.tools(tools);
            }
            CallingStrategy::Functions => {
                let functions = request
                    .tools
                    .iter()
                    .map(|tool| {
                        ChatCompletionFunctionsArgs::default()
                            .name(tool.name.clone())
                            .description(tool.description.clone())
                            .parameters(tool.parameters.clone())
                            .build()
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                args.functions(functions);
            }
            CallingStrategy::Plain => {}
        }
    }

    if stream {
        args.stream_options(ChatCompletionStreamOptions {
            include_usage: true,
        });
    }
    args.build()
}

#[allow(deprecated)]
fn to_openai_message(
    turn: &DialogTurn,
) -> std::result::Result<ChatCompletionRequestMessage, OpenAIError> {
    let message: ChatCompletionRequestMessage = match turn.role {
        Role::User => {
            let content = match &turn.content {
                MessageContent::Text(text) => ChatCompletionRequestUserMessageContent::Text(text.clone()),
                MessageContent::Parts(parts) => ChatCompletionRequestUserMessageContent::Array(
                    parts
                        .iter()
                        .map(user_content_part)
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                ),
            };
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?
                .into()
        }
        Role::Assistant => {
            let mut args = ChatCompletionRequestAssistantMessageArgs::default();
            let text = turn.text();
            if !text.is_empty() {
                args.content(text);
            }
            if let Some(call) = &turn.function_call {
                args.function_call(OpenAiFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
            }
            if !turn.tool_calls.is_empty() {
                args.tool_calls(
                    turn.tool_calls
                        .iter()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: OpenAiFunctionCall {
                                name: call.function.name.clone(),
                                arguments: call.function.arguments.clone(),
                            },
                        })
                        .collect::<Vec<_>>(),
                );
            }
            args.build()?.into()
        }
        Role::Function => ChatCompletionRequestFunctionMessageArgs::default()
            .name(turn.name.clone().unwrap_or_default())
            .content(turn.text())
            .build()?
            .into(),
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .tool_call_id(turn.tool_call_id.clone().unwrap_or_default())
            .content(turn.text())
            .build()?
            .into(),
    };
    Ok(message)
}

fn user_content_part(
    part: &ContentPart,
) -> std::result::Result<ChatCompletionRequestUserMessageContentPart, OpenAIError> {
    Ok(match part {
        ContentPart::Text { text } => ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(text.clone())
                .build()?,
        ),
        ContentPart::Image { image } => ChatCompletionRequestUserMessageContentPart::ImageUrl(
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(ImageUrlArgs::default().url(image.url.clone()).build()?)
                .build()?,
        ),
    })
}

#[allow(deprecated)]
fn response_turn(message: &ChatCompletionResponseMessage) -> DialogTurn {
    let mut turn = DialogTurn::assistant(message.content.clone().unwrap_or_default());
    turn.function_call = message.function_call.as_ref().map(|call| FunctionCall {
        name: call.name.clone(),
        arguments: call.arguments.clone(),
    });
    if let Some(calls) = &message.tool_calls {
        turn.tool_calls = calls
            .iter()
            .map(|call| ToolCall {
                id: call.id.clone(),
                function: FunctionCall {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                },
            })
            .collect();
    }
    turn
}

/// Folds stream deltas into the reply accumulated so far.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    function_call: Option<FunctionCall>,
    tool_calls: Vec<ToolCall>,
}

impl StreamAccumulator {
    #[allow(deprecated)]
    fn apply(&mut self, chunk: &CreateChatCompletionStreamResponse) {
        let Some(choice) = chunk.choices.first() else {
            return;
        };
        let delta = &choice.delta;
        if let Some(content) = &delta.content {
            self.content.push_str(content);
        }
        if let Some(fragment) = &delta.function_call {
            let call = self.function_call.get_or_insert_with(|| FunctionCall {
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(name) = &fragment.name {
                call.name.push_str(name);
            }
            if let Some(arguments) = &fragment.arguments {
                call.arguments.push_str(arguments);
            }
        }
        for fragment in delta.tool_calls.iter().flatten() {
            let index = fragment.index as usize;
            while self.tool_calls.len() <= index {
                self.tool_calls.push(ToolCall {
                    id: String::new(),
                    function: FunctionCall {
                        name: String::new(),
                        arguments: String::new(),
                    },
                });
            }
            let call = &mut self.tool_calls[index];
            if let Some(id) = &fragment.id {
                call.id.push_str(id);
            }
            if let Some(function) = &fragment.function {
                if let Some(name) = &function.name {
                    call.function.name.push_str(name);
                }
                if let Some(arguments) = &function.arguments {
                    call.function.arguments.push_str(arguments);
                }
            }
        }
    }

    fn snapshot(&self) -> DialogTurn {
        let mut turn = DialogTurn::assistant(self.content.clone());
        turn.function_call = self.function_call.clone();
        turn.tool_calls = self.tool_calls.clone();
        turn
    }
}

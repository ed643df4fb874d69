//! Streaming response assembler: turns accumulated partial replies into one outgoing message that is
//! sent once and then edited in place, at most once per edit interval.
//!
//! # Entry points
//!
//! - **[`StreamingAssembler::assemble`]** – drives one [`CompletionStream`] to the chat.
//! - **[`deliver_text`]** – sends a finished text, split by the platform limit.
//! - **[`split_message`]** / **[`display_text`]** – text helpers.

use relay_core::{
    edit_with_fallback, send_with_fallback, Bot, DialogTurn, OutgoingRef, Result, SendOptions,
    TextFormat,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::completion::{CompletionStream, StreamEnd};

/// Partial replies shorter than this are not shown.
pub const MIN_DISPLAY_CHARS: usize = 50;
/// Appended when a streaming message hits the platform limit and stops updating.
pub const STREAMING_MARKER: &str = "\n\n[still streaming...]";

/// Text delivered to the chat as one platform message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPart {
    pub outgoing: OutgoingRef,
    pub text: String,
}

/// Outcome of one streamed answer.
#[derive(Debug, Clone)]
pub struct AssembledReply {
    pub end: StreamEnd,
    /// Final turn: the complete reply, or what was on screen when cancelled. `None` if nothing arrived
    /// or nothing was shown before cancellation.
    pub turn: Option<DialogTurn>,
    pub parts: Vec<DeliveredPart>,
}

/// Partial text with its last whitespace-delimited token dropped, so half-received words never show.
pub fn display_text(content: &str) -> &str {
    let trimmed = content.trim();
    match trimmed.rfind(char::is_whitespace) {
        Some(i) => trimmed[..i].trim_end(),
        None => "",
    }
}

/// Splits `text` into parts of at most `limit` characters, cutting after the last newline, else the
/// last period, else the last space of each window, else hard at the limit. Concatenating the parts
/// gives back `text`.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some((window_end, _)) = rest.char_indices().nth(limit) {
        let window = &rest[..window_end];
        let cut = ['\n', '.', ' ']
            .iter()
            .find_map(|sep| window.rfind(*sep).map(|i| i + sep.len_utf8()))
            .unwrap_or(window_end);
        parts.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

fn truncate_with_marker(text: &str, limit: usize) -> String {
    let keep = limit.saturating_sub(STREAMING_MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(STREAMING_MARKER);
    out
}

/// Sends `text` as one or more messages; only the first replies to `options.reply_to`.
pub async fn deliver_text(
    bot: &dyn Bot,
    chat_id: i64,
    text: &str,
    options: &SendOptions,
    limit: usize,
) -> Result<Vec<DeliveredPart>> {
    let mut delivered = Vec::new();
    for (i, part) in split_message(text, limit).into_iter().enumerate() {
        let opts = if i == 0 {
            options.clone()
        } else {
            SendOptions {
                reply_to: None,
                ..options.clone()
            }
        };
        let outgoing = send_with_fallback(bot, chat_id, &part, &opts).await?;
        delivered.push(DeliveredPart {
            outgoing,
            text: part,
        });
    }
    Ok(delivered)
}

/// Message being streamed into.
struct LiveMessage {
    outgoing: OutgoingRef,
    shown: String,
    last_edit: Instant,
    frozen: bool,
}

pub struct StreamingAssembler {
    bot: Arc<dyn Bot>,
    edit_interval: Duration,
    message_limit: usize,
}

impl StreamingAssembler {
    pub fn new(bot: Arc<dyn Bot>, edit_interval: Duration, message_limit: usize) -> Self {
        Self {
            bot,
            edit_interval,
            message_limit,
        }
    }

    /// Consumes `stream` until it ends or `token` is cancelled, then finalizes the message and
    /// records usage. `options.reply_to` applies to the first message sent.
    pub async fn assemble(
        &self,
        chat_id: i64,
        mut stream: CompletionStream,
        token: &CancellationToken,
        options: &SendOptions,
    ) -> Result<AssembledReply> {
        let mut live: Option<LiveMessage> = None;
        let outcome = self
            .render(chat_id, &mut stream, token, options, &mut live)
            .await;
        let end = match &outcome {
            Ok(end) => *end,
            Err(_) => StreamEnd::Completed,
        };
        let last = stream.finish(end).await;
        outcome?;

        let final_options = SendOptions {
            cancel_button: false,
            ..options.clone()
        };
        match end {
            StreamEnd::Cancelled => {
                let Some(live) = live else {
                    info!(chat_id, "Cancelled before anything was shown");
                    return Ok(AssembledReply {
                        end,
                        turn: None,
                        parts: Vec::new(),
                    });
                };
                let shown = live.shown.clone();
                let parts = self
                    .finalize(chat_id, Some(live), &shown, &final_options)
                    .await?;
                Ok(AssembledReply {
                    end,
                    turn: Some(DialogTurn::assistant(shown)),
                    parts,
                })
            }
            StreamEnd::Completed => {
                let Some(turn) = last else {
                    return Ok(AssembledReply {
                        end,
                        turn: None,
                        parts: Vec::new(),
                    });
                };
                let parts = self
                    .finalize(chat_id, live, &turn.text(), &final_options)
                    .await?;
                Ok(AssembledReply {
                    end,
                    turn: Some(turn),
                    parts,
                })
            }
        }
    }

    async fn render(
        &self,
        chat_id: i64,
        stream: &mut CompletionStream,
        token: &CancellationToken,
        options: &SendOptions,
        live: &mut Option<LiveMessage>,
    ) -> Result<StreamEnd> {
        // Partial text is often unbalanced markup, so it is always shown plain.
        let streaming_options = SendOptions {
            cancel_button: true,
            format: TextFormat::Plain,
            ..options.clone()
        };
        let mut first = true;
        loop {
            if token.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            let Some(item) = stream.next().await else {
                return Ok(StreamEnd::Completed);
            };
            if token.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            let turn = item?;
            if std::mem::take(&mut first) {
                continue;
            }
            if turn.has_call() {
                continue;
            }
            let content = turn.text();
            let display = display_text(&content);
            if display.chars().count() < MIN_DISPLAY_CHARS {
                continue;
            }

            match live {
                None => {
                    let (text, frozen) = self.fit(display);
                    let outgoing =
                        send_with_fallback(self.bot.as_ref(), chat_id, &text, &streaming_options)
                            .await?;
                    debug!(chat_id, message_id = outgoing.message_id, "step: streaming message sent");
                    *live = Some(LiveMessage {
                        outgoing,
                        shown: display.to_string(),
                        last_edit: Instant::now(),
                        frozen,
                    });
                }
                Some(message) => {
                    if message.frozen
                        || message.shown == display
                        || message.last_edit.elapsed() < self.edit_interval
                    {
                        continue;
                    }
                    let (text, frozen) = self.fit(display);
                    if let Err(e) = edit_with_fallback(
                        self.bot.as_ref(),
                        chat_id,
                        message.outgoing.message_id,
                        &text,
                        &streaming_options,
                    )
                    .await
                    {
                        warn!(chat_id, error = %e, "Failed to edit streaming message");
                    }
                    message.shown = display.to_string();
                    message.last_edit = Instant::now();
                    message.frozen = frozen;
                }
            }
        }
    }

    /// Text to show for `display`, and whether the message must stop updating.
    fn fit(&self, display: &str) -> (String, bool) {
        if display.chars().count() > self.message_limit {
            (truncate_with_marker(display, self.message_limit), true)
        } else {
            (display.to_string(), false)
        }
    }

    /// Puts the full reply on screen: the live message gets the first part, the rest are sent.
    async fn finalize(
        &self,
        chat_id: i64,
        live: Option<LiveMessage>,
        content: &str,
        options: &SendOptions,
    ) -> Result<Vec<DeliveredPart>> {
        let Some(live) = live else {
            if content.is_empty() {
                return Ok(Vec::new());
            }
            return deliver_text(self.bot.as_ref(), chat_id, content, options, self.message_limit)
                .await;
        };

        let mut parts = split_message(content, self.message_limit).into_iter();
        let first = parts.next().unwrap_or_default();
        self.edit_best_effort(chat_id, &live, &first, options).await;

        let mut delivered = vec![DeliveredPart {
            outgoing: live.outgoing,
            text: first,
        }];
        let follow_up = SendOptions {
            reply_to: None,
            ..options.clone()
        };
        for part in parts {
            let outgoing = send_with_fallback(self.bot.as_ref(), chat_id, &part, &follow_up).await?;
            delivered.push(DeliveredPart {
                outgoing,
                text: part,
            });
        }
        info!(chat_id, parts = delivered.len(), "step: streaming message finalized");
        Ok(delivered)
    }

    async fn edit_best_effort(&self, chat_id: i64, live: &LiveMessage, text: &str, options: &SendOptions) {
        if let Err(e) = edit_with_fallback(
            self.bot.as_ref(),
            chat_id,
            live.outgoing.message_id,
            text,
            options,
        )
        .await
        {
            warn!(chat_id, error = %e, "Failed to finalize streaming message");
        }
    }
}

//! Bot abstraction for sending and editing messages.
//!
//! [`Bot`] trait is transport-agnostic; [`TelegramBot`] implements it via teloxide.
//! [`send_with_fallback`] and [`edit_with_fallback`] add the formatting retry and
//! the "not modified" tolerance that every caller wants.

use crate::error::{RelayError, Result};
use crate::types::OutgoingRef;
use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{
        ChatAction, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode,
        ReplyParameters,
    },
    RequestError,
};
use tracing::warn;

/// Callback data of the inline "Stop" button attached to streamed replies.
pub const CANCEL_CALLBACK_DATA: &str = "cancel.cancel";
/// Prefix matched by the runner when routing callback queries to cancellation.
pub const CANCEL_CALLBACK_PREFIX: &str = "cancel";

/// Text formatting requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextFormat {
    #[default]
    Plain,
    Markdown,
}

/// Per-call send/edit options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Reply to this platform message instead of posting a new one.
    pub reply_to: Option<i64>,
    pub format: TextFormat,
    /// Attach the inline "Stop" button (streaming replies only).
    pub cancel_button: bool,
}

impl SendOptions {
    pub fn plain(&self) -> Self {
        Self {
            format: TextFormat::Plain,
            ..self.clone()
        }
    }
}

/// Abstraction for sending and editing messages. Implementations map to a transport (e.g. Telegram).
#[async_trait]
pub trait Bot: Send + Sync {
    /// Sends a text message and returns its reference for later edits.
    async fn send_message(&self, chat_id: i64, text: &str, options: &SendOptions) -> Result<OutgoingRef>;
    /// Replaces the text of an already-sent message.
    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<OutgoingRef>;
    /// Shows the "typing" chat action.
    async fn send_typing(&self, chat_id: i64) -> Result<()>;
}

/// True when Telegram returns "message is not modified" (content unchanged); treat as success.
pub fn is_message_not_modified_error(error: &str) -> bool {
    error.contains("message is not modified") || error.contains("exactly the same")
}

/// True when Telegram rejects the entities of a formatted message.
pub fn is_formatting_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("can't parse entities") || lower.contains("can't find end of the entity")
}

/// Sends `text`; if the transport rejects the formatting, retries once as plain text.
pub async fn send_with_fallback(
    bot: &dyn Bot,
    chat_id: i64,
    text: &str,
    options: &SendOptions,
) -> Result<OutgoingRef> {
    match bot.send_message(chat_id, text, options).await {
        Err(RelayError::UnsupportedFormatting(reason)) if options.format != TextFormat::Plain => {
            warn!(chat_id, reason = %reason, "Send rejected formatting, retrying as plain text");
            bot.send_message(chat_id, text, &options.plain()).await
        }
        other => other,
    }
}

/// Edits `message_id`; retries once as plain text on formatting errors and treats
/// "message is not modified" as success.
pub async fn edit_with_fallback(
    bot: &dyn Bot,
    chat_id: i64,
    message_id: i64,
    text: &str,
    options: &SendOptions,
) -> Result<OutgoingRef> {
    let result = match bot.edit_message(chat_id, message_id, text, options).await {
        Err(RelayError::UnsupportedFormatting(reason)) if options.format != TextFormat::Plain => {
            warn!(chat_id, message_id, reason = %reason, "Edit rejected formatting, retrying as plain text");
            bot.edit_message(chat_id, message_id, text, &options.plain()).await
        }
        other => other,
    };
    match result {
        Err(e) if is_message_not_modified_error(&e.to_string()) => Ok(OutgoingRef { chat_id, message_id }),
        other => other,
    }
}

/// Teloxide-based implementation of [`Bot`].
pub struct TelegramBot {
    bot: teloxide::Bot,
}

impl TelegramBot {
    /// Creates a bot using the given Telegram bot token.
    pub fn new(token: String) -> Self {
        Self {
            bot: teloxide::Bot::new(token),
        }
    }

    /// Wraps an existing teloxide bot (shared with the dispatcher).
    pub fn from_teloxide(bot: teloxide::Bot) -> Self {
        Self { bot }
    }

    fn cancel_keyboard() -> InlineKeyboardMarkup {
        InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            "Stop",
            CANCEL_CALLBACK_DATA,
        )]])
    }

    #[allow(deprecated)]
    fn parse_mode(format: TextFormat) -> Option<ParseMode> {
        match format {
            TextFormat::Plain => None,
            TextFormat::Markdown => Some(ParseMode::Markdown),
        }
    }
}

fn map_request_error(e: RequestError) -> RelayError {
    let text = e.to_string();
    if is_formatting_error(&text) {
        RelayError::UnsupportedFormatting(text)
    } else {
        RelayError::Bot(text)
    }
}

fn to_message_id(message_id: i64) -> Result<MessageId> {
    i32::try_from(message_id)
        .map(MessageId)
        .map_err(|_| RelayError::Bot(format!("Invalid message_id: {}", message_id)))
}

#[async_trait]
impl Bot for TelegramBot {
    async fn send_message(&self, chat_id: i64, text: &str, options: &SendOptions) -> Result<OutgoingRef> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if let Some(reply_to) = options.reply_to {
            request = request.reply_parameters(ReplyParameters::new(to_message_id(reply_to)?));
        }
        if let Some(mode) = Self::parse_mode(options.format) {
            request = request.parse_mode(mode);
        }
        if options.cancel_button {
            request = request.reply_markup(Self::cancel_keyboard());
        }
        let sent = request.await.map_err(map_request_error)?;
        Ok(OutgoingRef {
            chat_id,
            message_id: sent.id.0 as i64,
        })
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<OutgoingRef> {
        let mut request = self
            .bot
            .edit_message_text(ChatId(chat_id), to_message_id(message_id)?, text);
        if let Some(mode) = Self::parse_mode(options.format) {
            request = request.parse_mode(mode);
        }
        if options.cancel_button {
            request = request.reply_markup(Self::cancel_keyboard());
        }
        request.await.map_err(map_request_error)?;
        Ok(OutgoingRef { chat_id, message_id })
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .map_err(map_request_error)?;
        Ok(())
    }
}

//! # relay-core
//!
//! Core types and traits for the conversational relay: [`Bot`] transport, [`ChatMessage`],
//! [`DialogTurn`], [`StoredMessage`], usage records, [`RelayError`] and tracing initialization.
//! Transport-agnostic apart from the teloxide-backed [`TelegramBot`].

pub mod bot;
pub mod error;
pub mod logger;
pub mod types;

pub use bot::{
    edit_with_fallback, is_message_not_modified_error, send_with_fallback, Bot, SendOptions,
    TelegramBot, TextFormat, CANCEL_CALLBACK_DATA, CANCEL_CALLBACK_PREFIX,
};
pub use error::{RelayError, Result};
pub use logger::init_tracing;
pub use types::{
    ChatMessage, CompletionUsage, ContentPart, DialogTurn, FunctionCall, ImageRef, MessageContent,
    MessageKind, NewMessage, OutgoingRef, Role, StoredMessage, ToolCall, NO_PLATFORM_MESSAGE_ID,
};

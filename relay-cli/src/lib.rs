//! # relay-cli
//!
//! Wires the relay pipeline to Telegram: configuration from env, update dispatching, `/reset` and
//! the cancel button.

pub mod adapter;
pub mod cli;
pub mod config;
pub mod runner;

pub use adapter::{is_reset_command, to_chat_message};
pub use cli::{Cli, Commands};
pub use config::RelayConfig;
pub use runner::run_relay;

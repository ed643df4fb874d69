//! Long-polling runner: builds the pipeline and routes Telegram updates into it.
//!
//! Text messages go to the debounce batcher (one spawned task per message so the dispatcher never
//! waits on an answer), `/reset` starts a new main thread, and the "Stop" button cancels the
//! sender's streaming answer.

use anyhow::{Context, Result};
use llm_client::{ModelRegistry, OpenAiBackend};
use relay_core::{init_tracing, TelegramBot, CANCEL_CALLBACK_PREFIX};
use relay_pipeline::{
    CancellationRegistry, DebounceBatcher, MessageProcessor, ProcessorDeps, Sequencer,
    StaticPreferences,
};
use std::sync::Arc;
use storage::SqliteMessageStore;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, Message};
use tracing::{debug, error, info, instrument};

use crate::adapter::{is_reset_command, to_chat_message};
use crate::config::RelayConfig;

const RESET_REPLY: &str = "Conversation reset. Your next message starts a new thread.";

/// Handles shared by the update endpoints.
struct Relay {
    batcher: Arc<DebounceBatcher>,
    processor: Arc<MessageProcessor>,
    cancellation: Arc<CancellationRegistry>,
}

/// Main entry: init logging, open the database, build the pipeline, then dispatch updates until
/// Ctrl-C.
#[instrument(skip(config))]
pub async fn run_relay(config: RelayConfig) -> Result<()> {
    init_tracing(&config.log_file).context("Failed to initialize logging")?;

    let models = Arc::new(ModelRegistry::defaults(&config.providers)?);
    models
        .get(&config.preferences.model)
        .context("DEFAULT_MODEL is not a registered model")?;

    info!(database_url = %config.database_url, model = %config.preferences.model, "Initializing relay");
    let store = Arc::new(
        SqliteMessageStore::new(&config.database_url)
            .await
            .context("Failed to open message database")?,
    );
    let backend = Arc::new(OpenAiBackend::new(&models));
    let teloxide_bot = teloxide::Bot::new(config.bot_token.clone());
    let cancellation = Arc::new(CancellationRegistry::new());

    let processor = Arc::new(MessageProcessor::new(
        ProcessorDeps {
            bot: Arc::new(TelegramBot::from_teloxide(teloxide_bot.clone())),
            store: store.clone(),
            usage_sink: store,
            backend,
            models,
            preferences: Arc::new(StaticPreferences::new(config.preferences.clone())),
            cancellation: cancellation.clone(),
        },
        config.pipeline.clone(),
    ));
    let sequencer = Arc::new(Sequencer::new(processor.clone()));
    let batcher = Arc::new(DebounceBatcher::new(config.pipeline.batch_idle, sequencer));
    let relay = Arc::new(Relay {
        batcher,
        processor,
        cancellation,
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback));

    info!("Relay started");
    Dispatcher::builder(teloxide_bot, handler)
        .dependencies(dptree::deps![relay])
        .default_handler(|update| async move {
            debug!(update = ?update, "Unhandled update");
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Error in update handler"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Relay stopped");
    Ok(())
}

async fn on_message(bot: Bot, msg: Message, relay: Arc<Relay>) -> ResponseResult<()> {
    let Some(message) = to_chat_message(&msg) else {
        debug!(chat_id = msg.chat.id.0, "Ignoring message without text");
        return Ok(());
    };
    info!(
        user_id = message.user_id,
        chat_id = message.chat_id,
        message_id = message.platform_message_id,
        forward = message.is_forward,
        "Received message"
    );

    if is_reset_command(&message) {
        match relay.processor.reset(message.user_id, message.chat_id).await {
            Ok(()) => {
                bot.send_message(msg.chat.id, RESET_REPLY).await?;
            }
            Err(e) => error!(user_id = message.user_id, error = %e, "Failed to reset conversation"),
        }
        return Ok(());
    }

    let batcher = relay.batcher.clone();
    tokio::spawn(async move {
        batcher.submit(message.user_id, message).await;
    });
    Ok(())
}

async fn on_callback(bot: Bot, query: CallbackQuery, relay: Arc<Relay>) -> ResponseResult<()> {
    let user_id = query.from.id.0 as i64;
    let is_cancel = query
        .data
        .as_deref()
        .is_some_and(|data| data.starts_with(CANCEL_CALLBACK_PREFIX));
    if is_cancel {
        let cancelled = relay.cancellation.cancel(user_id);
        info!(user_id, cancelled, "Cancel button pressed");
    }
    bot.answer_callback_query(query.id.clone()).await?;
    Ok(())
}

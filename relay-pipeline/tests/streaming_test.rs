//! Integration tests for [`relay_pipeline::StreamingAssembler`] and [`relay_pipeline::deliver_text`].
//!
//! A scripted backend streams words on a paused clock; [`common::MockBot`] records what reached
//! the chat.

mod common;

use common::{BotCall, MockBot, Script, ScriptedBackend, TEST_MODEL};
use llm_client::{CallingStrategy, CompletionRequest, EstimateTokenCounter, TokenCounter};
use relay_core::{DialogTurn, SendOptions};
use relay_pipeline::{
    deliver_text, CancellationRegistry, CompletionDriver, StreamEnd, StreamingAssembler,
    STREAMING_MARKER,
};
use std::sync::Arc;
use std::time::Duration;
use storage::InMemoryMessageStore;

const CHAT: i64 = 11;
const USER: i64 = 1;

fn request() -> CompletionRequest {
    CompletionRequest {
        model: TEST_MODEL.to_string(),
        system_prompt: "Be brief.".to_string(),
        turns: vec![DialogTurn::user("tell me")],
        tools: Vec::new(),
        strategy: CallingStrategy::Plain,
        temperature: 0.3,
    }
}

fn driver(backend: Arc<ScriptedBackend>) -> (CompletionDriver, Arc<InMemoryMessageStore>) {
    let store = Arc::new(InMemoryMessageStore::new());
    let driver = CompletionDriver::new(backend, store.clone(), Arc::new(EstimateTokenCounter));
    (driver, store)
}

/// `count` six-character words separated by spaces: "word00 word01 ...".
fn words(count: usize) -> String {
    (0..count)
        .map(|i| format!("word{:02}", i))
        .collect::<Vec<_>>()
        .join(" ")
}

/// **Test: Edits are throttled and the final edit carries the full reply.**
///
/// **Setup:** 60 words streamed one per 100ms (6s); edit interval 1s.
///
/// **Action:** Assemble the stream.
///
/// **Expected:** One message sent with the cancel button; at most 7 streaming edits; a last edit
/// without the button carrying the whole reply; usage recorded once from the provider.
#[tokio::test(start_paused = true)]
async fn test_edits_are_throttled_and_finalized() {
    let text = words(60);
    let backend = ScriptedBackend::new(vec![Script::words(&text, Duration::from_millis(100))]);
    let (driver, store) = driver(backend);
    let bot = MockBot::new();
    let assembler = StreamingAssembler::new(bot.clone(), Duration::from_secs(1), 4096);
    let registry = CancellationRegistry::new();
    let token = registry.get_token(USER);

    let stream = driver.stream(USER, request()).await.unwrap();
    let reply = assembler
        .assemble(CHAT, stream, &token, &SendOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.end, StreamEnd::Completed);
    assert_eq!(reply.turn.as_ref().map(|t| t.text()), Some(text.clone()));
    assert_eq!(reply.parts.len(), 1);
    assert_eq!(reply.parts[0].text, text);

    let calls = bot.calls();
    let sent: Vec<&BotCall> = calls.iter().filter(|c| matches!(c, BotCall::Sent { .. })).collect();
    assert_eq!(sent.len(), 1);
    let BotCall::Sent {
        message_id,
        options,
        ..
    } = sent[0]
    else {
        unreachable!()
    };
    assert!(options.cancel_button);
    assert_eq!(reply.parts[0].outgoing.message_id, *message_id);

    let streaming_edits = calls
        .iter()
        .filter(|c| matches!(c, BotCall::Edited { options, .. } if options.cancel_button))
        .count();
    assert!(streaming_edits <= 7, "got {} streaming edits", streaming_edits);
    assert!(streaming_edits >= 1);

    match calls.last() {
        Some(BotCall::Edited {
            message_id: edited,
            text: final_text,
            options,
            ..
        }) => {
            assert_eq!(edited, message_id);
            assert_eq!(final_text, &text);
            assert!(!options.cancel_button);
        }
        other => panic!("expected a final edit, got {:?}", other),
    }

    let usage = store.usage_records().unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].total_tokens, common::SCRIPT_USAGE.total_tokens);
}

/// **Test: Cancelling stops the stream and keeps what was on screen.**
///
/// **Setup:** 60 words at 100ms each; cancel fires after 2.05s.
///
/// **Action:** Assemble the stream.
///
/// **Expected:** `Cancelled`; the turn is the text shown so far; the last call is an edit without
/// the cancel button showing that text; one estimated usage record at least as large as the text.
#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_streaming() {
    let backend = ScriptedBackend::new(vec![Script::words(&words(60), Duration::from_millis(100))]);
    let (driver, store) = driver(backend);
    let bot = MockBot::new();
    let assembler = StreamingAssembler::new(bot.clone(), Duration::from_millis(500), 4096);
    let registry = Arc::new(CancellationRegistry::new());
    let token = registry.get_token(USER);

    let canceller = {
        let registry = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2050)).await;
            registry.cancel(USER)
        })
    };

    let stream = driver.stream(USER, request()).await.unwrap();
    let reply = assembler
        .assemble(CHAT, stream, &token, &SendOptions::default())
        .await
        .unwrap();
    assert!(canceller.await.unwrap());

    assert_eq!(reply.end, StreamEnd::Cancelled);
    let shown = reply.turn.as_ref().map(|t| t.text()).unwrap();
    assert!(shown.len() >= 50 && shown.len() < words(60).len());
    assert_eq!(reply.parts.len(), 1);

    match bot.calls().last() {
        Some(BotCall::Edited { text, options, .. }) => {
            assert_eq!(text, &shown);
            assert!(!options.cancel_button);
        }
        other => panic!("expected a final edit, got {:?}", other),
    }

    let usage = store.usage_records().unwrap();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].completion_tokens as usize >= EstimateTokenCounter.count_text(&shown));
}

/// **Test: A reply longer than the limit freezes the live message, then is split.**
///
/// **Setup:** 40 words (279 characters) at 100ms each; message limit 100; no edit throttling.
///
/// **Action:** Assemble the stream.
///
/// **Expected:** Once over the limit the live message shows the streaming marker and is not
/// edited again until finalization; the reply is delivered as three parts cut at spaces that
/// concatenate to the reply; follow-up parts are new messages.
#[tokio::test(start_paused = true)]
async fn test_overflow_freezes_then_splits() {
    let text = words(40);
    let backend = ScriptedBackend::new(vec![Script::words(&text, Duration::from_millis(100))]);
    let (driver, _store) = driver(backend);
    let bot = MockBot::new();
    let assembler = StreamingAssembler::new(bot.clone(), Duration::ZERO, 100);
    let registry = CancellationRegistry::new();
    let token = registry.get_token(USER);

    let stream = driver.stream(USER, request()).await.unwrap();
    let reply = assembler
        .assemble(CHAT, stream, &token, &SendOptions::default())
        .await
        .unwrap();

    let calls = bot.calls();
    let frozen_at = calls
        .iter()
        .position(|c| matches!(c, BotCall::Edited { text, .. } if text.ends_with(STREAMING_MARKER)))
        .expect("marker edit");
    assert!(calls[frozen_at + 1..]
        .iter()
        .all(|c| !matches!(c, BotCall::Edited { options, .. } if options.cancel_button)));

    let lengths: Vec<usize> = reply.parts.iter().map(|p| p.text.len()).collect();
    assert_eq!(lengths, vec![98, 98, 83]);
    let joined: String = reply.parts.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(joined, text);
    assert_eq!(bot.sent().len(), reply.parts.len());
}

/// **Test: Cancelling a frozen message splits what was shown by the limit.**
///
/// **Setup:** 60 words at 100ms each; message limit 100; no edit throttling; cancel after 3.05s.
/// The live message freezes once the shown text reaches 104 characters (words 0 to 14).
///
/// **Action:** Assemble the stream.
///
/// **Expected:** `Cancelled`; the turn is the 104 shown characters; the live message is edited to
/// the first 98 characters without the button and the remaining word is sent as a new message;
/// no edit or part exceeds the limit.
#[tokio::test(start_paused = true)]
async fn test_cancel_after_freeze_respects_limit() {
    let text = words(60);
    let backend = ScriptedBackend::new(vec![Script::words(&text, Duration::from_millis(100))]);
    let (driver, _store) = driver(backend);
    let bot = MockBot::new();
    let assembler = StreamingAssembler::new(bot.clone(), Duration::ZERO, 100);
    let registry = Arc::new(CancellationRegistry::new());
    let token = registry.get_token(USER);

    let canceller = {
        let registry = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3050)).await;
            registry.cancel(USER)
        })
    };

    let stream = driver.stream(USER, request()).await.unwrap();
    let reply = assembler
        .assemble(CHAT, stream, &token, &SendOptions::default())
        .await
        .unwrap();
    assert!(canceller.await.unwrap());

    assert_eq!(reply.end, StreamEnd::Cancelled);
    let shown = reply.turn.as_ref().map(|t| t.text()).unwrap();
    assert_eq!(shown, words(15));
    let lengths: Vec<usize> = reply.parts.iter().map(|p| p.text.len()).collect();
    assert_eq!(lengths, vec![98, 6]);
    let joined: String = reply.parts.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(joined, shown);

    let calls = bot.calls();
    assert!(calls.iter().all(|c| match c {
        BotCall::Sent { text, .. } | BotCall::Edited { text, .. } => text.chars().count() <= 100,
        BotCall::Typing { .. } => true,
    }));
    let final_edit = calls.iter().rev().find_map(|c| match c {
        BotCall::Edited { text, options, .. } if !options.cancel_button => Some(text.clone()),
        _ => None,
    });
    assert_eq!(final_edit, Some(reply.parts[0].text.clone()));
    assert_eq!(bot.sent().last().map(|(_, t)| t.clone()), Some("word14".to_string()));
}

/// **Test: A short reply is sent once, after the stream ends.**
///
/// **Setup:** Backend answers "Short answer." in one piece.
///
/// **Action:** Assemble the stream with `reply_to` set.
///
/// **Expected:** No streaming message or edit; one message without cancel button replying to the
/// trigger.
#[tokio::test(start_paused = true)]
async fn test_short_reply_is_sent_after_stream() {
    let backend = ScriptedBackend::new(vec![Script::text("Short answer.")]);
    let (driver, _store) = driver(backend);
    let bot = MockBot::new();
    let assembler = StreamingAssembler::new(bot.clone(), Duration::from_secs(1), 4096);
    let registry = CancellationRegistry::new();
    let token = registry.get_token(USER);
    let options = SendOptions {
        reply_to: Some(77),
        ..SendOptions::default()
    };

    let stream = driver.stream(USER, request()).await.unwrap();
    let reply = assembler.assemble(CHAT, stream, &token, &options).await.unwrap();

    assert_eq!(reply.parts.len(), 1);
    assert_eq!(
        bot.calls(),
        vec![BotCall::Sent {
            chat_id: CHAT,
            message_id: 1000,
            text: "Short answer.".to_string(),
            options,
        }]
    );
}

/// **Test: `deliver_text` splits long text and only the first part replies.**
#[tokio::test]
async fn test_deliver_text_splits_and_replies_once() {
    let bot = MockBot::new();
    let text = words(30);
    let options = SendOptions {
        reply_to: Some(5),
        ..SendOptions::default()
    };

    let parts = deliver_text(bot.as_ref(), CHAT, &text, &options, 100).await.unwrap();

    assert_eq!(parts.len(), 3);
    let replies: Vec<Option<i64>> = bot
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            BotCall::Sent { options, .. } => Some(options.reply_to),
            _ => None,
        })
        .collect();
    assert_eq!(replies, vec![Some(5), None, None]);
    assert_eq!(parts.iter().map(|p| p.text.as_str()).collect::<String>(), text);
}

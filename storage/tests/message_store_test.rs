//! Integration tests for [`storage::SqliteMessageStore`].
//!
//! Covers node creation, lookups by id and platform id, activation updates, reset markers
//! and usage recording against in-memory and file-backed SQLite.

use relay_core::{CompletionUsage, DialogTurn, FunctionCall, MessageKind, NewMessage};
use storage::{MessageStore, SqliteMessageStore, UsageSink};
use tempfile::tempdir;

fn user_node(user_id: i64, chat_id: i64, platform_message_id: i64, text: &str, previous: Vec<i64>) -> NewMessage {
    NewMessage {
        user_id,
        chat_id,
        platform_message_id,
        payload: Some(DialogTurn::user(text)),
        previous_message_ids: previous,
        kind: MessageKind::Message,
    }
}

async fn memory_store() -> SqliteMessageStore {
    SqliteMessageStore::new("sqlite::memory:")
        .await
        .expect("Failed to create store")
}

/// **Test: Created nodes get sequential ids and round-trip their payload.**
///
/// **Setup:** In-memory DB; create a user turn then an assistant function-call turn pointing back at it.
/// **Action:** `get_messages_by_ids` with ids in reverse order.
/// **Expected:** Both nodes returned in the requested order with identical payloads and back-pointers.
#[tokio::test]
async fn test_create_and_get_messages_by_ids() {
    let store = memory_store().await;

    let first = store
        .create_message(user_node(1, 10, 100, "hello", vec![]))
        .await
        .expect("Failed to create message");
    let second = store
        .create_message(NewMessage {
            user_id: 1,
            chat_id: 10,
            platform_message_id: 101,
            payload: Some(DialogTurn::function_call("get_time", "{}")),
            previous_message_ids: vec![first.id],
            kind: MessageKind::Message,
        })
        .await
        .expect("Failed to create message");

    assert!(second.id > first.id);

    let loaded = store
        .get_messages_by_ids(&[second.id, first.id])
        .await
        .expect("Failed to load messages");
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[1].id, first.id);
    assert_eq!(loaded[1].payload, Some(DialogTurn::user("hello")));
    assert_eq!(loaded[0].previous_message_ids, vec![first.id]);
    let call = loaded[0].payload.as_ref().and_then(|p| p.function_call.clone());
    assert_eq!(
        call,
        Some(FunctionCall {
            name: "get_time".to_string(),
            arguments: "{}".to_string()
        })
    );
}

/// **Test: Loading an empty id list returns nothing.**
///
/// **Setup:** In-memory DB with one node.
/// **Action:** `get_messages_by_ids(&[])` and `get_messages_by_ids(&[999])`.
/// **Expected:** Both return an empty vector.
#[tokio::test]
async fn test_get_messages_by_ids_empty_and_unknown() {
    let store = memory_store().await;
    store
        .create_message(user_node(1, 10, 100, "hello", vec![]))
        .await
        .expect("Failed to create message");

    assert!(store.get_messages_by_ids(&[]).await.unwrap().is_empty());
    assert!(store.get_messages_by_ids(&[999]).await.unwrap().is_empty());
}

/// **Test: Last message is scoped to user and chat.**
///
/// **Setup:** Nodes for (user 1, chat 10), (user 2, chat 10), (user 1, chat 11).
/// **Action:** `get_last_message(1, 10)`.
/// **Expected:** Latest node of user 1 in chat 10; None for an unknown pair.
#[tokio::test]
async fn test_get_last_message_per_user_and_chat() {
    let store = memory_store().await;
    store.create_message(user_node(1, 10, 100, "a", vec![])).await.unwrap();
    let b = store.create_message(user_node(1, 10, 101, "b", vec![])).await.unwrap();
    store.create_message(user_node(2, 10, 102, "c", vec![])).await.unwrap();
    store.create_message(user_node(1, 11, 103, "d", vec![])).await.unwrap();

    let last = store.get_last_message(1, 10).await.unwrap().expect("last message");
    assert_eq!(last.id, b.id);
    assert_eq!(last.payload.map(|p| p.text()), Some("b".to_string()));
    assert!(store.get_last_message(5, 10).await.unwrap().is_none());
}

/// **Test: Platform message lookup is scoped to the chat.**
///
/// **Setup:** Same platform id 100 used in chats 10 and 11.
/// **Action:** `get_platform_message(11, 100)` and `get_platform_message(10, 555)`.
/// **Expected:** Node from chat 11; None for an unknown platform id.
#[tokio::test]
async fn test_get_platform_message() {
    let store = memory_store().await;
    store.create_message(user_node(1, 10, 100, "in ten", vec![])).await.unwrap();
    let other = store.create_message(user_node(1, 11, 100, "in eleven", vec![])).await.unwrap();

    let found = store.get_platform_message(11, 100).await.unwrap().expect("tracked");
    assert_eq!(found.id, other.id);
    assert!(store.get_platform_message(10, 555).await.unwrap().is_none());
}

/// **Test: Activation update only touches the given ids.**
///
/// **Setup:** Two nodes.
/// **Action:** `update_activation_time(&[second])`.
/// **Expected:** Second node's activation time moves forward, first is unchanged.
#[tokio::test]
async fn test_update_activation_time() {
    let store = memory_store().await;
    let first = store.create_message(user_node(1, 10, 100, "a", vec![])).await.unwrap();
    let second = store.create_message(user_node(1, 10, 101, "b", vec![first.id])).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.update_activation_time(&[second.id]).await.unwrap();
    store.update_activation_time(&[]).await.unwrap();

    let loaded = store.get_messages_by_ids(&[first.id, second.id]).await.unwrap();
    assert_eq!(loaded[0].last_activated_at, first.last_activated_at);
    assert!(loaded[1].last_activated_at > second.last_activated_at);
}

/// **Test: Reset marker is stored as a payload-less RESET node.**
///
/// **Setup:** One user node.
/// **Action:** `create_reset_marker(1, 10)` then `get_last_message(1, 10)`.
/// **Expected:** Last node has kind Reset, no payload, no back-pointers.
#[tokio::test]
async fn test_reset_marker() {
    let store = memory_store().await;
    store.create_message(user_node(1, 10, 100, "a", vec![])).await.unwrap();
    store.create_reset_marker(1, 10).await.unwrap();

    let last = store.get_last_message(1, 10).await.unwrap().expect("marker");
    assert_eq!(last.kind, MessageKind::Reset);
    assert!(last.payload.is_none());
    assert!(last.previous_message_ids.is_empty());
}

/// **Test: Usage records are persisted per user.**
///
/// **Setup:** In-memory DB.
/// **Action:** Record two usages for user 1 and one for user 2.
/// **Expected:** `usage_count(1) == 2`, `usage_count(2) == 1`.
#[tokio::test]
async fn test_record_completion_usage() {
    let store = memory_store().await;
    let usage = |user_id| CompletionUsage {
        user_id,
        model: "gpt-3.5-turbo".to_string(),
        prompt_tokens: 12,
        completion_tokens: 3,
        total_tokens: 15,
    };
    store.record_completion_usage(&usage(1)).await.unwrap();
    store.record_completion_usage(&usage(1)).await.unwrap();
    store.record_completion_usage(&usage(2)).await.unwrap();

    assert_eq!(store.usage_count(1).await.unwrap(), 2);
    assert_eq!(store.usage_count(2).await.unwrap(), 1);
}

/// **Test: Nodes survive reopening a file-backed database.**
///
/// **Setup:** Temp directory; create a store at `relay.db` and save one node.
/// **Action:** Drop and reopen the store at the same path; load by id.
/// **Expected:** Node is found with its payload.
#[tokio::test]
async fn test_file_database_persists_across_reopen() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("relay.db");
    let path = path.to_str().expect("utf-8 path");

    let id = {
        let store = SqliteMessageStore::new(path).await.expect("open store");
        store.create_message(user_node(1, 10, 100, "persisted", vec![])).await.unwrap().id
    };

    let store = SqliteMessageStore::new(path).await.expect("reopen store");
    let loaded = store.get_messages_by_ids(&[id]).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].payload, Some(DialogTurn::user("persisted")));
}

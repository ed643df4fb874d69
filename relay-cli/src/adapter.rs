//! Conversion from teloxide messages to [`ChatMessage`].

use relay_core::{ChatMessage, MessageContent};
use teloxide::types::{Message, MessageOrigin};

/// `ChatMessage` for a text (or captioned) message from a user; `None` for anything else.
pub fn to_chat_message(msg: &Message) -> Option<ChatMessage> {
    let user = msg.from.as_ref()?;
    let text = msg.text().or_else(|| msg.caption())?;
    let origin = msg.forward_origin();

    Some(ChatMessage {
        user_id: user.id.0 as i64,
        chat_id: msg.chat.id.0,
        platform_message_id: i64::from(msg.id.0),
        reply_to_message_id: msg.reply_to_message().map(|m| i64::from(m.id.0)),
        content: MessageContent::Text(text.to_string()),
        is_forward: origin.is_some(),
        forward_sender: origin.and_then(origin_label),
        received_at: msg.date,
    })
}

/// Display label of a forward's original sender.
fn origin_label(origin: &MessageOrigin) -> Option<String> {
    match origin {
        MessageOrigin::User { sender_user, .. } => Some(sender_user.full_name()),
        MessageOrigin::HiddenUser {
            sender_user_name, ..
        } => Some(sender_user_name.clone()),
        MessageOrigin::Chat { sender_chat, .. } => sender_chat.title().map(str::to_string),
        MessageOrigin::Channel { chat, .. } => chat.title().map(str::to_string),
    }
}

/// `/reset`, optionally addressed as `/reset@botname`.
pub fn is_reset_command(message: &ChatMessage) -> bool {
    let text = message.content.text();
    let Some(command) = text.split_whitespace().next() else {
        return false;
    };
    command == "/reset" || command.starts_with("/reset@")
}

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::hub::Hub;
use crate::store::Store;
use crate::types::{ChatMessage, ChatTarget, ServerMsg, User};

pub const MAX_MESSAGE_CHARS: usize = 500;

/// Trim and bound a chat message.
pub fn validate_text(text: &str) -> AppResult<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::bad_request("Message cannot be empty"));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::bad_request(format!(
            "Message cannot exceed {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(text.to_string())
}

pub fn room_message(from: Uuid, from_name: String, room_id: Uuid, text: String) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4(),
        from,
        from_name,
        target: ChatTarget::Room { room_id },
        text,
        sent_at: Utc::now(),
    }
}

/// Direct messages are only allowed between accepted friends.
pub fn send_direct(store: &Store, hub: &Hub, from: &User, to: Uuid, text: &str) -> AppResult<ChatMessage> {
    if from.id == to {
        return Err(AppError::bad_request("Cannot message yourself"));
    }
    if store.user(to).is_none() {
        return Err(AppError::not_found("User not found"));
    }
    if !store.are_friends(from.id, to) {
        return Err(AppError::forbidden("You can only message friends"));
    }
    let text = validate_text(text)?;

    let message = ChatMessage {
        id: Uuid::new_v4(),
        from: from.id,
        from_name: from.display_name.clone(),
        target: ChatTarget::Direct { to },
        text,
        sent_at: Utc::now(),
    };
    store.insert_message(message.clone());
    hub.send(to, ServerMsg::DirectMessage {
        message: message.clone(),
    });
    Ok(message)
}

pub fn conversation(store: &Store, me: Uuid, other: Uuid, limit: usize) -> AppResult<Vec<ChatMessage>> {
    if store.user(other).is_none() {
        return Err(AppError::not_found("User not found"));
    }
    Ok(store.conversation(me, other, limit.clamp(1, 200)))
}

pub fn delete_message(store: &Store, id: Uuid) -> AppResult<ChatMessage> {
    store
        .remove_message(id)
        .ok_or_else(|| AppError::not_found("Message not found"))
}

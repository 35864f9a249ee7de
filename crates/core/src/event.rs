use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ImageState, Message, UserId};

/// Display fields of a sender, read from the profile directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSnapshot {
    pub id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Named events pushed over live connections.
///
/// Frames are `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<AuthorSnapshot>,
    },
    /// Always carries the full message so clients can reconcile by id.
    MessageUpdated { message: Message },
    PresenceSnapshot { user_ids: Vec<UserId> },
    ProfileUpdated { user_id: UserId, avatar: ImageState },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage { .. } => "new-message",
            ServerEvent::MessageUpdated { .. } => "message-updated",
            ServerEvent::PresenceSnapshot { .. } => "presence-snapshot",
            ServerEvent::ProfileUpdated { .. } => "profile-updated",
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UserId;

/// What a finished upload resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadTarget {
    ChatAttachment { message_id: Uuid },
    ProfilePicture { user_id: UserId },
}

impl UploadTarget {
    /// Object store folder the blob lands in.
    pub fn folder(&self) -> &'static str {
        match self {
            UploadTarget::ChatAttachment { .. } => "chat_messages",
            UploadTarget::ProfilePicture { .. } => "profile_pictures",
        }
    }

    /// Jobs are idempotent per this id.
    pub fn key(&self) -> Uuid {
        match self {
            UploadTarget::ChatAttachment { message_id } => *message_id,
            UploadTarget::ProfilePicture { user_id } => *user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UploadTarget::ChatAttachment { .. } => "chat_attachment",
            UploadTarget::ProfilePicture { .. } => "profile_picture",
        }
    }
}

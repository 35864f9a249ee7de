use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::UserId;

/// Upper bound on message text, counted in characters.
pub const MAX_TEXT_CHARS: usize = 1000;

/// Appended to the text of a message whose attachment could not be stored.
pub const FAILURE_NOTE: &str = "[image upload failed]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must contain text or an image")]
    Empty,
    #[error("message text is {actual} characters, limit is {max}")]
    TextTooLong { actual: usize, max: usize },
    #[error("attachment is {size} bytes, limit is {max}")]
    AttachmentTooLarge { size: usize, max: usize },
    #[error("attachment is not a supported image format")]
    UnsupportedAttachment,
    #[error("attachment is not valid base64")]
    InvalidEncoding,
    #[error("sender and receiver must differ")]
    SelfAddressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageTransitionError {
    #[error("invalid image state transition from {from} to {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("unknown image status '{0}'")]
    UnknownStatus(String),
}

/// Lifecycle of a message attachment.
///
/// `Pending` is the placeholder written while the upload runs. `Uploaded` and
/// `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageState {
    None,
    Pending,
    Uploaded { url: String },
    Failed,
}

impl ImageState {
    pub fn as_status(&self) -> &'static str {
        match self {
            ImageState::None => "none",
            ImageState::Pending => "pending",
            ImageState::Uploaded { .. } => "uploaded",
            ImageState::Failed => "failed",
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ImageState::Uploaded { url } => Some(url.as_str()),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ImageState::None)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ImageState::Pending)
    }

    /// Rebuild a state from its persisted `(status, url)` columns.
    pub fn from_parts(status: &str, url: Option<String>) -> Result<Self, ImageTransitionError> {
        match (status, url) {
            ("none", _) => Ok(ImageState::None),
            ("pending", _) => Ok(ImageState::Pending),
            ("uploaded", Some(url)) => Ok(ImageState::Uploaded { url }),
            ("failed", _) => Ok(ImageState::Failed),
            (other, _) => Err(ImageTransitionError::UnknownStatus(other.to_string())),
        }
    }

    /// Check that `next` is reachable from `self`. Only `Pending` moves, and
    /// only into a terminal state.
    pub fn check_transition(&self, next: &ImageState) -> Result<(), ImageTransitionError> {
        match (self, next) {
            (ImageState::Pending, ImageState::Uploaded { .. })
            | (ImageState::Pending, ImageState::Failed) => Ok(()),
            (from, to) => Err(ImageTransitionError::InvalidStateTransition {
                from: from.as_status(),
                to: to.as_status(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub image: ImageState,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Build a fresh, unseen message. Fails when there is neither text nor an
    /// image state to carry.
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<String>,
        image: ImageState,
    ) -> Result<Self, ValidationError> {
        let text = text.filter(|t| !t.trim().is_empty());
        if text.is_none() && image.is_none() {
            return Err(ValidationError::Empty);
        }
        let now = now_micros();
        Ok(Self {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            text,
            image,
            seen: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Ordering key for history: newest first means descending on this.
    pub fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }

    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// Move the attachment into `next`. A failed upload also gets the failure
    /// note appended to the text, in the same mutation.
    pub fn resolve_image(&mut self, next: ImageState) -> Result<(), ImageTransitionError> {
        self.image.check_transition(&next)?;
        if matches!(next, ImageState::Failed) {
            self.text = Some(with_failure_note(self.text.as_deref()));
        }
        self.image = next;
        self.updated_at = now_micros();
        Ok(())
    }

    /// Returns true when the flag actually flipped.
    pub fn mark_seen(&mut self) -> bool {
        if self.seen {
            return false;
        }
        self.seen = true;
        self.updated_at = now_micros();
        true
    }
}

/// Trim the text and enforce the character limit. Blank text becomes `None`.
pub fn normalize_text(text: Option<&str>, max_chars: usize) -> Result<Option<String>, ValidationError> {
    let Some(trimmed) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let actual = trimmed.chars().count();
    if actual > max_chars {
        return Err(ValidationError::TextTooLong {
            actual,
            max: max_chars,
        });
    }
    Ok(Some(trimmed.to_string()))
}

pub fn with_failure_note(text: Option<&str>) -> String {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => format!("{text}\n{FAILURE_NOTE}"),
        None => FAILURE_NOTE.to_string(),
    }
}

/// Current time truncated to the microsecond precision Postgres stores, so
/// cursors built from in-memory and persisted messages compare the same way.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_message() -> Message {
        Message::new(Uuid::new_v4(), Uuid::new_v4(), None, ImageState::Pending)
            .expect("pending message is valid")
    }

    #[test]
    fn empty_message_is_rejected() {
        let err = Message::new(Uuid::new_v4(), Uuid::new_v4(), Some("   ".into()), ImageState::None)
            .unwrap_err();
        assert_eq!(err, ValidationError::Empty);
    }

    #[test]
    fn pending_resolves_once() {
        let mut message = pending_message();
        message
            .resolve_image(ImageState::Uploaded {
                url: "https://cdn.example/a.png".into(),
            })
            .expect("first resolution succeeds");

        let before = message.clone();
        let err = message.resolve_image(ImageState::Failed).unwrap_err();
        assert!(matches!(
            err,
            ImageTransitionError::InvalidStateTransition {
                from: "uploaded",
                to: "failed"
            }
        ));
        assert_eq!(message, before);
    }

    #[test]
    fn failure_appends_note() {
        let mut message = Message::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Some("look at this".into()),
            ImageState::Pending,
        )
        .unwrap();
        message.resolve_image(ImageState::Failed).unwrap();
        assert_eq!(
            message.text.as_deref(),
            Some("look at this\n[image upload failed]")
        );

        let mut bare = pending_message();
        bare.resolve_image(ImageState::Failed).unwrap();
        assert_eq!(bare.text.as_deref(), Some(FAILURE_NOTE));
    }

    #[test]
    fn none_and_terminal_states_cannot_move() {
        assert!(ImageState::None.check_transition(&ImageState::Failed).is_err());
        assert!(ImageState::Failed.check_transition(&ImageState::Pending).is_err());
        assert!(ImageState::Pending.check_transition(&ImageState::Pending).is_err());
    }

    #[test]
    fn text_is_trimmed_and_bounded() {
        assert_eq!(normalize_text(Some("  hi  "), 10).unwrap().as_deref(), Some("hi"));
        assert_eq!(normalize_text(Some("   "), 10).unwrap(), None);
        let long = "é".repeat(11);
        assert_eq!(
            normalize_text(Some(&long), 10).unwrap_err(),
            ValidationError::TextTooLong { actual: 11, max: 10 }
        );
    }

    #[test]
    fn image_state_serializes_with_status_tag() {
        let value = serde_json::to_value(ImageState::Uploaded {
            url: "https://cdn.example/x.webp".into(),
        })
        .unwrap();
        assert_eq!(value["status"], "uploaded");
        assert_eq!(value["url"], "https://cdn.example/x.webp");
        assert_eq!(
            serde_json::to_value(ImageState::Pending).unwrap()["status"],
            "pending"
        );
    }

    #[test]
    fn mark_seen_is_idempotent() {
        let mut message = pending_message();
        assert!(message.mark_seen());
        assert!(!message.mark_seen());
        assert!(message.seen);
    }
}

//! Core domain types for Parley: messages and their attachment state machine,
//! history cursors, upload targets and the events pushed to live connections.

pub mod cursor;
pub mod event;
pub mod messaging;
pub mod upload;

pub use cursor::{Cursor, CursorError, HistoryPage};
pub use event::{AuthorSnapshot, ServerEvent};
pub use messaging::{ImageState, ImageTransitionError, Message, ValidationError};
pub use upload::UploadTarget;

/// Stable identifier handed out by the identity collaborator.
pub type UserId = uuid::Uuid;

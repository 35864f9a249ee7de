//! History cursors and page assembly.
//!
//! A cursor names the last message of a page by its `(created_at, id)` key.
//! The next page holds messages strictly older than that key, so messages
//! sharing a timestamp are neither repeated nor skipped.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::{Message, UserId};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor is not valid base64")]
    Encoding,
    #[error("cursor is malformed")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn after(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            id: message.id,
        }
    }

    /// Opaque token handed to clients. The timestamp is written in whole
    /// microseconds, the precision messages are stored with; any finer part
    /// is truncated.
    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.created_at.timestamp_micros(), self.id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Accepts tokens produced by [`Cursor::encode`] as well as a bare
    /// RFC 3339 timestamp, which selects everything strictly older than it.
    pub fn decode(raw: &str) -> Result<Self, CursorError> {
        let raw = raw.trim();
        if let Ok(created_at) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self {
                created_at: created_at.with_timezone(&Utc),
                id: Uuid::nil(),
            });
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| CursorError::Encoding)?;
        let text = String::from_utf8(bytes).map_err(|_| CursorError::Malformed)?;
        let (micros, id) = text.split_once(':').ok_or(CursorError::Malformed)?;
        let micros: i64 = micros.parse().map_err(|_| CursorError::Malformed)?;
        let created_at = DateTime::from_timestamp_micros(micros).ok_or(CursorError::Malformed)?;
        let id = Uuid::parse_str(id).map_err(|_| CursorError::Malformed)?;
        Ok(Self { created_at, id })
    }

    /// True when `message` belongs on a page following this cursor.
    pub fn precedes(&self, message: &Message) -> bool {
        message.sort_key() < (self.created_at, self.id)
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Cursor::decode(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

impl HistoryPage {
    /// Assemble a page from up to `limit + 1` candidates already sorted
    /// newest first. The extra row only signals that more history exists.
    pub fn from_candidates(mut candidates: Vec<Message>, limit: usize) -> Self {
        let has_more = candidates.len() > limit;
        candidates.truncate(limit);
        let next_cursor = if has_more {
            candidates.last().map(Cursor::after)
        } else {
            None
        };
        Self {
            messages: candidates,
            next_cursor,
            has_more,
        }
    }
}

pub fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(1, max.max(1))
}

/// Page through an unordered collection of messages, as the in-memory store
/// does.
pub fn paginate<'a, I>(
    messages: I,
    a: UserId,
    b: UserId,
    cursor: Option<&Cursor>,
    limit: usize,
) -> HistoryPage
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut candidates: Vec<Message> = messages
        .into_iter()
        .filter(|m| m.is_between(a, b))
        .filter(|m| cursor.map_or(true, |c| c.precedes(m)))
        .cloned()
        .collect();
    candidates.sort_by(|x, y| y.sort_key().cmp(&x.sort_key()));
    candidates.truncate(limit + 1);
    HistoryPage::from_candidates(candidates, limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{messaging::now_micros, ImageState};
    use chrono::Duration;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn message_at(sender: UserId, receiver: UserId, base: DateTime<Utc>, offset_ms: i64) -> Message {
        let mut message =
            Message::new(sender, receiver, Some("hello".into()), ImageState::None).unwrap();
        message.created_at = base + Duration::milliseconds(offset_ms);
        message
    }

    #[test]
    fn cursor_round_trips_through_token() {
        let message = message_at(Uuid::new_v4(), Uuid::new_v4(), now_micros(), 0);
        let cursor = Cursor::after(&message);
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
    }

    #[test]
    fn encoding_truncates_to_microseconds() {
        let created_at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let cursor = Cursor {
            created_at,
            id: Uuid::new_v4(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.created_at.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(decoded.id, cursor.id);
    }

    #[test]
    fn rfc3339_cursor_keeps_nanoseconds() {
        let cursor = Cursor::decode("2024-03-01T12:00:00.123456789+02:00").unwrap();
        assert_eq!(cursor.created_at.timestamp_subsec_nanos(), 123_456_789);
        assert_eq!(cursor.created_at.to_rfc3339(), "2024-03-01T10:00:00.123456789+00:00");
        assert_eq!(cursor.id, Uuid::nil());
    }

    #[test]
    fn bare_timestamp_selects_strictly_older() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let base = now_micros();
        let same = message_at(a, b, base, 0);
        let older = message_at(a, b, base, -1);
        let cursor = Cursor::decode(&base.to_rfc3339()).unwrap();
        assert!(!cursor.precedes(&same));
        assert!(cursor.precedes(&older));
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert_eq!(Cursor::decode("%%%").unwrap_err(), CursorError::Encoding);
        let token = URL_SAFE_NO_PAD.encode("nope");
        assert_eq!(Cursor::decode(&token).unwrap_err(), CursorError::Malformed);
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_limit(None, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT), 50);
        assert_eq!(clamp_limit(Some(0), DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT), 1);
        assert_eq!(clamp_limit(Some(10_000), DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT), 200);
    }

    #[test]
    fn exact_fit_has_no_more() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let base = now_micros();
        let messages: Vec<_> = (0..3).map(|i| message_at(a, b, base, i)).collect();
        let page = paginate(&messages, a, b, None, 3);
        assert_eq!(page.messages.len(), 3);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    proptest! {
        #[test]
        fn pages_cover_conversation_exactly_once(
            offsets in proptest::collection::vec((0i64..6, any::<bool>(), any::<bool>()), 0..60),
            limit in 1usize..8,
        ) {
            let a = Uuid::new_v4();
            let b = Uuid::new_v4();
            let stranger = Uuid::new_v4();
            let base = now_micros();

            let messages: Vec<Message> = offsets
                .iter()
                .map(|(offset, outgoing, unrelated)| match (outgoing, unrelated) {
                    (_, true) => message_at(a, stranger, base, *offset),
                    (true, false) => message_at(a, b, base, *offset),
                    (false, false) => message_at(b, a, base, *offset),
                })
                .collect();

            let mut expected: Vec<&Message> = messages.iter().filter(|m| m.is_between(a, b)).collect();
            expected.sort_by(|x, y| y.sort_key().cmp(&x.sort_key()));

            let mut collected = Vec::new();
            let mut cursor = None;
            loop {
                let page = paginate(&messages, a, b, cursor.as_ref(), limit);
                prop_assert!(page.messages.len() <= limit);
                collected.extend(page.messages.iter().map(|m| m.id));
                if !page.has_more {
                    break;
                }
                cursor = page.next_cursor;
                prop_assert!(cursor.is_some());
            }

            let unique: HashSet<_> = collected.iter().collect();
            prop_assert_eq!(unique.len(), collected.len());
            let expected_ids: Vec<_> = expected.iter().map(|m| m.id).collect();
            prop_assert_eq!(collected, expected_ids);
        }
    }
}

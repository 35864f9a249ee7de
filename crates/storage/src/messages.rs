use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parley_core::{
    cursor::HistoryPage, messaging::FAILURE_NOTE, Cursor, ImageState, ImageTransitionError,
    Message,
};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::StoragePool;

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, text, image_status, image_url, seen, created_at, updated_at";

/// Raised (inside `anyhow::Error`) when an image update is refused.
#[derive(Debug, Error)]
pub enum ImageUpdateError {
    #[error("message {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Transition(#[from] ImageTransitionError),
}

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
    text: Option<String>,
    image_status: String,
    image_url: Option<String>,
    seen: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let image = ImageState::from_parts(&row.image_status, row.image_url)
            .map_err(|err| anyhow!("message {} has invalid image state: {err}", row.id))?;
        Ok(Message {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            text: row.text,
            image,
            seen: row.seen,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    rows.into_iter().map(Message::try_from).collect()
}

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub async fn insert(&self, message: &Message) -> Result<Message> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            INSERT INTO messages ({MESSAGE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(message.id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(message.text.as_deref())
        .bind(message.image.as_status())
        .bind(message.image.url())
        .bind(message.seen)
        .bind(message.created_at)
        .bind(message.updated_at)
        .fetch_one(self.pool.pool())
        .await?;
        row.try_into()
    }

    pub async fn get(&self, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Message::try_from).transpose()
    }

    /// Newest-first page of the conversation between `a` and `b`.
    pub async fn page(
        &self,
        a: Uuid,
        b: Uuid,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let fetch = (limit + 1) as i64;
        let rows = if let Some(cursor) = cursor {
            sqlx::query_as::<_, MessageRow>(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS}
                FROM messages
                WHERE ((sender_id = $1 AND receiver_id = $2)
                    OR (sender_id = $2 AND receiver_id = $1))
                  AND (created_at, id) < ($3, $4)
                ORDER BY created_at DESC, id DESC
                LIMIT $5
                "#
            ))
            .bind(a)
            .bind(b)
            .bind(cursor.created_at)
            .bind(cursor.id)
            .bind(fetch)
            .fetch_all(self.pool.pool())
            .await?
        } else {
            sqlx::query_as::<_, MessageRow>(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS}
                FROM messages
                WHERE (sender_id = $1 AND receiver_id = $2)
                   OR (sender_id = $2 AND receiver_id = $1)
                ORDER BY created_at DESC, id DESC
                LIMIT $3
                "#
            ))
            .bind(a)
            .bind(b)
            .bind(fetch)
            .fetch_all(self.pool.pool())
            .await?
        };

        Ok(HistoryPage::from_candidates(into_messages(rows)?, limit))
    }

    /// Returns the message after the update, or `None` if it does not exist.
    pub async fn mark_seen(&self, message_id: Uuid) -> Result<Option<Message>> {
        let updated = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            UPDATE messages
            SET seen = TRUE, updated_at = now()
            WHERE id = $1 AND seen = FALSE
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await?;

        match updated {
            Some(row) => Ok(Some(row.try_into()?)),
            None => self.get(message_id).await,
        }
    }

    pub async fn mark_all_seen_from(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET seen = TRUE, updated_at = now()
            WHERE sender_id = $1 AND receiver_id = $2 AND seen = FALSE
            "#,
        )
        .bind(sender_id)
        .bind(receiver_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Resolve a pending attachment. The conditional update makes the
    /// transition atomic; a failed upload gets the failure note in the same
    /// statement.
    pub async fn update_image_state(&self, message_id: Uuid, next: &ImageState) -> Result<Message> {
        ImageState::Pending
            .check_transition(next)
            .map_err(ImageUpdateError::from)?;

        let updated = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            UPDATE messages
            SET image_status = $2,
                image_url = $3,
                text = CASE
                    WHEN $2 <> 'failed' THEN text
                    WHEN text IS NULL OR btrim(text) = '' THEN $4
                    ELSE text || E'\n' || $4
                END,
                updated_at = now()
            WHERE id = $1 AND image_status = 'pending'
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(message_id)
        .bind(next.as_status())
        .bind(next.url())
        .bind(FAILURE_NOTE)
        .fetch_optional(self.pool.pool())
        .await?;

        if let Some(row) = updated {
            return row.try_into();
        }

        match self.get(message_id).await? {
            None => Err(ImageUpdateError::NotFound(message_id).into()),
            Some(current) => {
                current
                    .image
                    .check_transition(next)
                    .map_err(ImageUpdateError::from)?;
                Err(anyhow!(
                    "message {message_id} changed concurrently during image update"
                ))
            }
        }
    }

    /// Messages still pending that were created before `older_than`,
    /// skipping the ids in `exclude`.
    pub async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        exclude: &[Uuid],
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE image_status = 'pending' AND created_at < $1 AND NOT (id = ANY($2))
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(older_than)
        .bind(exclude)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await?;
        into_messages(rows)
    }

    /// Unseen message counts addressed to `receiver_id`, grouped by sender.
    pub async fn unseen_counts(&self, receiver_id: Uuid) -> Result<Vec<(Uuid, i64)>> {
        let counts = sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT sender_id, COUNT(*)
            FROM messages
            WHERE receiver_id = $1 AND seen = FALSE
            GROUP BY sender_id
            "#,
        )
        .bind(receiver_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn pending_attachment_resolves_once_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool().await else {
            return Ok(());
        };
        let repo = MessageRepository::new(pool);
        let sender = Uuid::new_v4();
        let receiver = Uuid::new_v4();

        let draft = Message::new(sender, receiver, Some("photo".into()), ImageState::Pending)?;
        let stored = repo.insert(&draft).await?;
        assert!(stored.image.is_pending());

        let failed = repo.update_image_state(stored.id, &ImageState::Failed).await?;
        assert_eq!(failed.text.as_deref(), Some("photo\n[image upload failed]"));
        assert_eq!(failed.created_at, stored.created_at);

        let err = repo
            .update_image_state(
                stored.id,
                &ImageState::Uploaded {
                    url: "https://cdn.example/late.png".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageUpdateError>(),
            Some(ImageUpdateError::Transition(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn history_pages_and_seen_flags_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool().await else {
            return Ok(());
        };
        let repo = MessageRepository::new(pool);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut ids = Vec::new();
        for i in 0..5 {
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            let message = Message::new(from, to, Some(format!("m{i}")), ImageState::None)?;
            ids.push(repo.insert(&message).await?.id);
        }

        let first = repo.page(a, b, None, 3).await?;
        assert_eq!(first.messages.len(), 3);
        assert!(first.has_more);
        let second = repo.page(a, b, first.next_cursor.as_ref(), 3).await?;
        assert_eq!(second.messages.len(), 2);
        assert!(!second.has_more);

        let mut seen: Vec<Uuid> = first
            .messages
            .iter()
            .chain(second.messages.iter())
            .map(|m| m.id)
            .collect();
        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);

        assert_eq!(repo.unseen_counts(b).await?, vec![(a, 3)]);
        assert_eq!(repo.mark_all_seen_from(a, b).await?, 3);
        assert!(repo.unseen_counts(b).await?.is_empty());
        Ok(())
    }
}

use std::sync::Arc;

use anyhow::Result;
use parley_core::AuthorSnapshot;
use uuid::Uuid;

use crate::StoragePool;

/// Read side of the identity collaborator's user records, plus the avatar
/// write performed when a profile picture upload resolves.
#[derive(Clone)]
pub struct ProfileRepository {
    pool: StoragePool,
}

impl ProfileRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub async fn author_snapshot(&self, user_id: Uuid) -> Result<Option<AuthorSnapshot>> {
        let row = sqlx::query_as::<_, (Uuid, Option<String>, Option<String>)>(
            r#"
            SELECT id, display_name, avatar_url
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(row.map(|(id, display_name, avatar_url)| AuthorSnapshot {
            id,
            display_name,
            avatar_url,
        }))
    }

    pub async fn set_avatar_url(&self, user_id: Uuid, avatar_url: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, avatar_url)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
            SET avatar_url = EXCLUDED.avatar_url,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(avatar_url)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }
}

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use parley_core::{AuthorSnapshot, UserId};
use parley_storage::{ProfileRepository, StoragePool};
use tokio::sync::RwLock;

/// The slice of user records the engine touches: display fields for event
/// payloads and the avatar URL written after a profile picture upload.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn author_snapshot(&self, user_id: UserId) -> Result<Option<AuthorSnapshot>>;
    async fn set_avatar_url(&self, user_id: UserId, avatar_url: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryProfiles {
    profiles: RwLock<HashMap<UserId, AuthorSnapshot>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn upsert(&self, snapshot: AuthorSnapshot) {
        self.profiles.write().await.insert(snapshot.id, snapshot);
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryProfiles {
    async fn author_snapshot(&self, user_id: UserId) -> Result<Option<AuthorSnapshot>> {
        Ok(self.profiles.read().await.get(&user_id).cloned())
    }

    async fn set_avatar_url(&self, user_id: UserId, avatar_url: &str) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles.entry(user_id).or_insert_with(|| AuthorSnapshot {
            id: user_id,
            display_name: None,
            avatar_url: None,
        });
        profile.avatar_url = Some(avatar_url.to_string());
        Ok(())
    }
}

#[async_trait]
impl ProfileDirectory for ProfileRepository {
    async fn author_snapshot(&self, user_id: UserId) -> Result<Option<AuthorSnapshot>> {
        ProfileRepository::author_snapshot(self, user_id).await
    }

    async fn set_avatar_url(&self, user_id: UserId, avatar_url: &str) -> Result<()> {
        ProfileRepository::set_avatar_url(self, user_id, avatar_url).await
    }
}

pub fn init_profile_directory(pool: Option<StoragePool>) -> Arc<dyn ProfileDirectory> {
    match pool {
        Some(pool) => ProfileRepository::new(pool),
        None => Arc::new(InMemoryProfiles::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn avatar_update_creates_or_amends_profile() {
        let profiles = InMemoryProfiles::new();
        let user = Uuid::new_v4();
        assert!(profiles.author_snapshot(user).await.unwrap().is_none());

        profiles
            .set_avatar_url(user, "https://cdn.example/avatar.png")
            .await
            .unwrap();
        let snapshot = profiles.author_snapshot(user).await.unwrap().unwrap();
        assert_eq!(snapshot.avatar_url.as_deref(), Some("https://cdn.example/avatar.png"));
        assert_eq!(snapshot.display_name, None);
    }
}

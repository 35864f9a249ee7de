use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{
    cursor::{paginate, MAX_PAGE_LIMIT},
    Cursor, HistoryPage, ImageState, ImageTransitionError, Message, UserId, ValidationError,
};
use parley_storage::{ImageUpdateError, MessageRepository, StoragePool};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    InvalidStateTransition(#[from] ImageTransitionError),
    #[error("message {0} not found")]
    NotFound(Uuid),
    #[error("storage error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Durable, ordered log of messages between user pairs.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<String>,
        image: ImageState,
    ) -> Result<Message, StoreError>;

    async fn get(&self, message_id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Newest first, strictly older than `cursor`. `limit` is capped.
    async fn page(
        &self,
        user_a: UserId,
        user_b: UserId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<HistoryPage, StoreError>;

    async fn mark_seen(&self, message_id: Uuid) -> Result<Message, StoreError>;

    async fn mark_all_seen_from(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<u64, StoreError>;

    /// Only a pending image may move, and only to a terminal state.
    async fn update_image_state(
        &self,
        message_id: Uuid,
        next: ImageState,
    ) -> Result<Message, StoreError>;

    /// Oldest pending messages created before `older_than`, leaving out the
    /// ids in `exclude`.
    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn unseen_counts(&self, receiver_id: UserId) -> Result<HashMap<UserId, u64>, StoreError>;
}

fn capped(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<Uuid, Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message as-is, bypassing validation. Tests use it to seed
    /// specific timestamps.
    #[cfg(test)]
    pub async fn insert_raw(&self, message: Message) {
        self.messages.write().await.insert(message.id, message);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<String>,
        image: ImageState,
    ) -> Result<Message, StoreError> {
        let message = Message::new(sender_id, receiver_id, text, image)?;
        self.messages
            .write()
            .await
            .insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.read().await.get(&message_id).cloned())
    }

    async fn page(
        &self,
        user_a: UserId,
        user_b: UserId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<HistoryPage, StoreError> {
        let messages = self.messages.read().await;
        Ok(paginate(
            messages.values(),
            user_a,
            user_b,
            cursor,
            capped(limit),
        ))
    }

    async fn mark_seen(&self, message_id: Uuid) -> Result<Message, StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound(message_id))?;
        message.mark_seen();
        Ok(message.clone())
    }

    async fn mark_all_seen_from(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<u64, StoreError> {
        let mut messages = self.messages.write().await;
        let changed = messages
            .values_mut()
            .filter(|m| m.sender_id == sender_id && m.receiver_id == receiver_id)
            .filter_map(|m| m.mark_seen().then_some(()))
            .count();
        Ok(changed as u64)
    }

    async fn update_image_state(
        &self,
        message_id: Uuid,
        next: ImageState,
    ) -> Result<Message, StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound(message_id))?;
        message.resolve_image(next)?;
        Ok(message.clone())
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read().await;
        let mut stale: Vec<Message> = messages
            .values()
            .filter(|m| m.image.is_pending() && m.created_at < older_than)
            .filter(|m| !exclude.contains(&m.id))
            .cloned()
            .collect();
        stale.sort_by_key(Message::sort_key);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn unseen_counts(&self, receiver_id: UserId) -> Result<HashMap<UserId, u64>, StoreError> {
        let messages = self.messages.read().await;
        let mut counts = HashMap::new();
        for message in messages
            .values()
            .filter(|m| m.receiver_id == receiver_id && !m.seen)
        {
            *counts.entry(message.sender_id).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Maps repository errors back onto the store's typed errors.
fn from_image_update(err: anyhow::Error) -> StoreError {
    match err.downcast::<ImageUpdateError>() {
        Ok(ImageUpdateError::NotFound(id)) => StoreError::NotFound(id),
        Ok(ImageUpdateError::Transition(err)) => StoreError::InvalidStateTransition(err),
        Err(err) => StoreError::Backend(err),
    }
}

#[async_trait]
impl MessageStore for MessageRepository {
    async fn append(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<String>,
        image: ImageState,
    ) -> Result<Message, StoreError> {
        let message = Message::new(sender_id, receiver_id, text, image)?;
        Ok(self.insert(&message).await?)
    }

    async fn get(&self, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(MessageRepository::get(self, message_id).await?)
    }

    async fn page(
        &self,
        user_a: UserId,
        user_b: UserId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<HistoryPage, StoreError> {
        Ok(MessageRepository::page(self, user_a, user_b, cursor, capped(limit)).await?)
    }

    async fn mark_seen(&self, message_id: Uuid) -> Result<Message, StoreError> {
        MessageRepository::mark_seen(self, message_id)
            .await?
            .ok_or(StoreError::NotFound(message_id))
    }

    async fn mark_all_seen_from(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<u64, StoreError> {
        Ok(MessageRepository::mark_all_seen_from(self, sender_id, receiver_id).await?)
    }

    async fn update_image_state(
        &self,
        message_id: Uuid,
        next: ImageState,
    ) -> Result<Message, StoreError> {
        MessageRepository::update_image_state(self, message_id, &next)
            .await
            .map_err(from_image_update)
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(MessageRepository::stale_pending(self, older_than, exclude, limit).await?)
    }

    async fn unseen_counts(&self, receiver_id: UserId) -> Result<HashMap<UserId, u64>, StoreError> {
        let counts = MessageRepository::unseen_counts(self, receiver_id).await?;
        Ok(counts
            .into_iter()
            .map(|(sender, count)| (sender, count.max(0) as u64))
            .collect())
    }
}

pub fn init_message_store(pool: Option<StoragePool>) -> Arc<dyn MessageStore> {
    match pool {
        Some(pool) => MessageRepository::new(pool),
        None => {
            tracing::info!("no database configured; messages are kept in memory");
            Arc::new(InMemoryMessageStore::new())
        }
    }
}

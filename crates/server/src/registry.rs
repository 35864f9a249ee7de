use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use parley_core::{ServerEvent, UserId};
use serde::Serialize;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify, RwLock,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The connection's queue is full; the event was dropped for it.
    Full,
    Closed,
}

/// One live connection: its identity and the sending half of its outbound
/// queue. The receiving half is drained by the socket task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::Sender<Arc<ServerEvent>>,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Arc<ServerEvent>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            sender,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn try_push(&self, event: Arc<ServerEvent>) -> Result<(), PushError> {
        self.sender.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }
}

#[derive(Default)]
struct RegistryIndex {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Live connections keyed by connection id, with a secondary index by user.
///
/// Every register and unregister signals [`ConnectionRegistry::changes`] so the
/// presence publisher can follow the online set.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    index: Arc<RwLock<RegistryIndex>>,
    changes: Arc<Notify>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: ConnectionHandle) {
        {
            let mut index = self.index.write().await;
            index
                .by_user
                .entry(handle.user_id)
                .or_default()
                .insert(handle.id);
            index.connections.insert(handle.id, handle);
        }
        self.changes.notify_one();
    }

    /// Removes only the given connection; the user stays online while any
    /// other connection remains.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let removed = {
            let mut index = self.index.write().await;
            let removed = index.connections.remove(&connection_id);
            if let Some(handle) = &removed {
                if let Some(ids) = index.by_user.get_mut(&handle.user_id) {
                    ids.remove(&connection_id);
                    if ids.is_empty() {
                        index.by_user.remove(&handle.user_id);
                    }
                }
            }
            removed
        };
        if removed.is_some() {
            self.changes.notify_one();
        }
        removed
    }

    pub async fn connections_for(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        let index = self.index.read().await;
        index
            .by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.index.read().await.connections.values().cloned().collect()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.index.read().await.by_user.contains_key(&user_id)
    }

    /// Users holding at least one connection, sorted for stable output.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.index.read().await.by_user.keys().copied().collect();
        users.sort();
        users
    }

    pub async fn connection_count(&self) -> usize {
        self.index.read().await.connections.len()
    }

    pub fn changes(&self) -> Arc<Notify> {
        self.changes.clone()
    }
}

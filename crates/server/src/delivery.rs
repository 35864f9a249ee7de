use std::sync::Arc;

use parley_core::{ServerEvent, UserId};

use crate::registry::{ConnectionHandle, ConnectionRegistry, PushError};

/// Pushes events onto the outbound queues of live connections.
///
/// Pushing never waits: a connection whose queue is full loses the event and
/// the others are unaffected. Offline users simply receive nothing; they catch
/// up through history.
#[derive(Clone)]
pub struct DeliveryRouter {
    registry: ConnectionRegistry,
}

impl DeliveryRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Returns the number of connections the event reached.
    pub async fn notify(&self, user_id: UserId, event: ServerEvent) -> usize {
        self.notify_shared(user_id, Arc::new(event)).await
    }

    pub async fn notify_shared(&self, user_id: UserId, event: Arc<ServerEvent>) -> usize {
        let handles = self.registry.connections_for(user_id).await;
        if handles.is_empty() {
            tracing::trace!(%user_id, event = event.name(), "recipient offline; event dropped");
            return 0;
        }
        push_all(&handles, &event)
    }

    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let handles = self.registry.all_connections().await;
        push_all(&handles, &Arc::new(event))
    }
}

fn push_all(handles: &[ConnectionHandle], event: &Arc<ServerEvent>) -> usize {
    let mut delivered = 0;
    for handle in handles {
        match handle.try_push(event.clone()) {
            Ok(()) => delivered += 1,
            Err(PushError::Full) => tracing::warn!(
                connection_id = %handle.id(),
                user_id = %handle.user_id(),
                event = event.name(),
                "connection queue full; dropping event"
            ),
            Err(PushError::Closed) => tracing::debug!(
                connection_id = %handle.id(),
                event = event.name(),
                "connection closed before delivery"
            ),
        }
    }
    delivered
}

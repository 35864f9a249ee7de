use std::time::Duration;

use parley_core::ServerEvent;
use tokio::{sync::watch, task::JoinHandle, time::sleep};

use crate::{delivery::DeliveryRouter, registry::ConnectionRegistry};

/// Follows registry changes and broadcasts full `presence-snapshot` events.
///
/// After the first change the publisher waits one debounce window, then
/// publishes a single snapshot covering everything that happened meanwhile.
pub struct PresencePublisher {
    registry: ConnectionRegistry,
    router: DeliveryRouter,
    debounce: Duration,
}

impl PresencePublisher {
    pub fn new(registry: ConnectionRegistry, router: DeliveryRouter, debounce: Duration) -> Self {
        Self {
            registry,
            router,
            debounce,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn publish_snapshot(&self) -> usize {
        let user_ids = self.registry.online_users().await;
        let online = user_ids.len();
        let reached = self
            .router
            .broadcast(ServerEvent::PresenceSnapshot { user_ids })
            .await;
        tracing::debug!(online, reached, "published presence snapshot");
        reached
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let changes = self.registry.changes();
        loop {
            tokio::select! {
                _ = changes.notified() => {
                    sleep(self.debounce).await;
                    self.publish_snapshot().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("presence publisher stopped");
    }
}

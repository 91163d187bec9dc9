//! Distributed event bus over the shared pub/sub channel.
//!
//! Wraps a [`LocalEventBus`]: publishing delivers locally first, then
//! writes a wire envelope to the broadcast channel (or a targeted
//! `event:service:{target}` channel). Receivers drop envelopes whose
//! `source_node` is themselves, rebuild the event from its class name and
//! forward it to their local bus. No ordering is guaranteed across the
//! network beyond per-publisher source order; handlers must be idempotent.

// Layer 1: Standard library
use std::sync::Arc;

// Layer 2: Third-party
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// Layer 3: Internal
use crate::bus::LocalEventBus;
use crate::error::SyncError;
use crate::event::CoreEvent;
use hivecore_shared::ids::NodeId;
use hivecore_store::{PubSubChannel, Subscription};

/// Shared channel every node listens on.
pub const BROADCAST_CHANNEL: &str = "event:broadcast";

/// Channel for events targeted at one service/node.
pub fn service_channel(target: &str) -> String {
    format!("event:service:{target}")
}

/// Wire form of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventEnvelope {
    class_name: String,
    json_data: Value,
    source_node: String,
    timestamp: DateTime<Utc>,
}

/// The cluster-wide bus.
pub struct DistributedEventBus {
    local: Arc<LocalEventBus>,
    pubsub: Arc<dyn PubSubChannel>,
    node_id: NodeId,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributedEventBus {
    pub fn new(local: Arc<LocalEventBus>, pubsub: Arc<dyn PubSubChannel>, node_id: NodeId) -> Self {
        Self {
            local,
            pubsub,
            node_id,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn local(&self) -> &Arc<LocalEventBus> {
        &self.local
    }

    /// Start receiving: the broadcast channel plus this node's own
    /// targeted channel.
    pub async fn start(&self) -> Result<(), SyncError> {
        let broadcast = self.pubsub.subscribe(BROADCAST_CHANNEL).await?;
        let targeted = self
            .pubsub
            .subscribe(&service_channel(self.node_id.as_str()))
            .await?;
        let mut listeners = self.listeners.lock();
        listeners.push(Self::spawn_listener(
            broadcast,
            Arc::clone(&self.local),
            self.node_id.clone(),
        ));
        listeners.push(Self::spawn_listener(
            targeted,
            Arc::clone(&self.local),
            self.node_id.clone(),
        ));
        Ok(())
    }

    /// Stop the receive tasks. Local publishing keeps working.
    pub fn stop(&self) {
        for task in self.listeners.lock().drain(..) {
            task.abort();
        }
    }

    /// Deliver locally, then broadcast to every other node.
    pub async fn publish(&self, event: &CoreEvent) -> Result<(), SyncError> {
        self.local.publish(event);
        let payload = self.encode(event)?;
        self.pubsub.publish(BROADCAST_CHANNEL, payload).await?;
        Ok(())
    }

    /// Deliver to one target service/node only (not locally).
    pub async fn publish_to(&self, target: &str, event: &CoreEvent) -> Result<(), SyncError> {
        let payload = self.encode(event)?;
        self.pubsub.publish(&service_channel(target), payload).await?;
        Ok(())
    }

    fn encode(&self, event: &CoreEvent) -> Result<String, SyncError> {
        let (class_name, json_data) = event.wire_parts()?;
        let envelope = EventEnvelope {
            class_name,
            json_data,
            source_node: self.node_id.as_str().to_string(),
            timestamp: Utc::now(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn spawn_listener(
        mut subscription: Subscription,
        local: Arc<LocalEventBus>,
        node_id: NodeId,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let envelope: EventEnvelope = match serde_json::from_str(&raw) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable event envelope");
                        continue;
                    }
                };
                // Our own broadcasts were already delivered locally.
                if envelope.source_node == node_id.as_str() {
                    continue;
                }
                let event =
                    CoreEvent::from_wire_parts(&envelope.class_name, envelope.json_data);
                debug!(
                    class = %envelope.class_name,
                    source = %envelope.source_node,
                    "remote event received"
                );
                local.publish(&event);
            }
        })
    }
}

impl Drop for DistributedEventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use hivecore_store::MemoryPubSub;
    use std::time::Duration;

    fn node_bus(
        pubsub: &Arc<MemoryPubSub>,
        host: &str,
    ) -> (DistributedEventBus, Arc<LocalEventBus>) {
        let local = Arc::new(LocalEventBus::new());
        let bus = DistributedEventBus::new(
            Arc::clone(&local),
            Arc::clone(pubsub) as Arc<dyn PubSubChannel>,
            NodeId::new(host, 9000),
        );
        (bus, local)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "condition timed out");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_nodes_not_self_twice() {
        let pubsub = Arc::new(MemoryPubSub::new());
        let (bus_a, local_a) = node_bus(&pubsub, "a");
        let (bus_b, local_b) = node_bus(&pubsub, "b");
        bus_a.start().await.unwrap();
        bus_b.start().await.unwrap();

        let seen_a = Arc::new(Mutex::new(0u32));
        let seen_b = Arc::new(Mutex::new(0u32));
        {
            let sink = Arc::clone(&seen_a);
            local_a.subscribe_type("GuildDissolve", move |_| *sink.lock() += 1);
        }
        {
            let sink = Arc::clone(&seen_b);
            local_b.subscribe_type("GuildDissolve", move |_| *sink.lock() += 1);
        }

        bus_a
            .publish(&CoreEvent::GuildDissolve { guild_id: 42 })
            .await
            .unwrap();

        wait_for(|| *seen_b.lock() == 1).await;
        // A delivered locally exactly once: the loopback copy was dropped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen_a.lock(), 1);
    }

    #[tokio::test]
    async fn test_targeted_publish_reaches_only_target() {
        let pubsub = Arc::new(MemoryPubSub::new());
        let (bus_a, _local_a) = node_bus(&pubsub, "a");
        let (bus_b, local_b) = node_bus(&pubsub, "b");
        let (bus_c, local_c) = node_bus(&pubsub, "c");
        bus_a.start().await.unwrap();
        bus_b.start().await.unwrap();
        bus_c.start().await.unwrap();

        let seen_b = Arc::new(Mutex::new(0u32));
        let seen_c = Arc::new(Mutex::new(0u32));
        {
            let sink = Arc::clone(&seen_b);
            local_b.subscribe_type("ConfigReload", move |_| *sink.lock() += 1);
        }
        {
            let sink = Arc::clone(&seen_c);
            local_c.subscribe_type("ConfigReload", move |_| *sink.lock() += 1);
        }

        bus_a
            .publish_to(
                "b:9000",
                &CoreEvent::ConfigReload {
                    scope: "activity".to_string(),
                },
            )
            .await
            .unwrap();

        wait_for(|| *seen_b.lock() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen_c.lock(), 0);
    }
}

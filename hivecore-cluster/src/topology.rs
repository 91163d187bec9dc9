//! Topology watcher: keeps the ring in step with service discovery.
//!
//! Two feeds: push (`on_instances_changed`) and pull (a periodic
//! [`InstanceFetcher`] poll). Either way the watcher diffs the incoming
//! node set against the last known one; identical sets are a no-op,
//! anything else rebuilds the ring and logs the added/removed members.
//! With auto-migrate enabled, actors this node no longer owns are
//! gracefully stopped (state flushed) so the next request lands on the
//! winner.

// Layer 1: Standard library
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// Layer 3: Internal
use crate::error::ClusterError;
use crate::ring::{ClusterNode, HashRing};
use hivecore_rt::registry::ActorSystemRegistry;
use hivecore_shared::ids::NodeId;

/// One discovered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InstanceInfo {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(&self.host, self.port)
    }

    /// `metadata.actorSystems` is a comma-separated list of hosted systems.
    pub fn actor_systems(&self) -> Vec<String> {
        self.metadata
            .get("actorSystems")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `metadata.weight`, defaulting to 1.
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1)
    }

    pub fn to_cluster_node(&self) -> ClusterNode {
        ClusterNode::new(self.node_id(), self.actor_systems()).with_weight(self.weight())
    }
}

/// Pluggable discovery backend for pull mode.
#[async_trait]
pub trait InstanceFetcher: Send + Sync + 'static {
    async fn fetch_instances(&self) -> Result<Vec<InstanceInfo>, ClusterError>;
}

/// The watcher.
pub struct TopologyWatcher {
    ring: Arc<HashRing>,
    self_node: NodeId,
    auto_migrate: bool,
    registry: Option<Arc<ActorSystemRegistry>>,
    known: Mutex<BTreeMap<NodeId, ClusterNode>>,
    puller: Mutex<Option<JoinHandle<()>>>,
}

impl TopologyWatcher {
    pub fn new(ring: Arc<HashRing>, self_node: NodeId) -> Self {
        Self {
            ring,
            self_node,
            auto_migrate: false,
            registry: None,
            known: Mutex::new(BTreeMap::new()),
            puller: Mutex::new(None),
        }
    }

    /// Enable graceful stopping of actors lost to a rebuild. Requires the
    /// registry so the watcher can reach local systems.
    pub fn with_auto_migrate(mut self, registry: Arc<ActorSystemRegistry>) -> Self {
        self.auto_migrate = true;
        self.registry = Some(registry);
        self
    }

    /// Push mode: discovery calls this with the full current instance list.
    pub async fn on_instances_changed(&self, instances: Vec<InstanceInfo>) {
        let incoming: BTreeMap<NodeId, ClusterNode> = instances
            .iter()
            .map(|i| (i.node_id(), i.to_cluster_node()))
            .collect();

        {
            let mut known = self.known.lock();
            if *known == incoming {
                debug!("topology unchanged, skipping rebuild");
                return;
            }
            let added: Vec<&NodeId> =
                incoming.keys().filter(|id| !known.contains_key(*id)).collect();
            let removed: Vec<&NodeId> =
                known.keys().filter(|id| !incoming.contains_key(*id)).collect();
            info!(?added, ?removed, total = incoming.len(), "topology changed");
            *known = incoming.clone();
        }

        self.ring.rebuild(incoming.into_values().collect());

        if self.auto_migrate {
            self.migrate_lost_actors().await;
        }
    }

    /// Pull mode: poll the fetcher on `interval` until `stop` is called.
    pub fn start_pull(
        self: &Arc<Self>,
        fetcher: Arc<dyn InstanceFetcher>,
        interval: Duration,
    ) {
        let mut puller = self.puller.lock();
        if puller.is_some() {
            return;
        }
        let watcher = Arc::clone(self);
        *puller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match fetcher.fetch_instances().await {
                    Ok(instances) => watcher.on_instances_changed(instances).await,
                    Err(err) => {
                        // Keep the last known topology on fetch failure; a
                        // flapping registry must not empty the ring.
                        error!(error = %err, "instance fetch failed");
                    }
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.puller.lock().take() {
            task.abort();
        }
    }

    /// Stop every local actor whose ownership moved away from this node.
    async fn migrate_lost_actors(&self) {
        let Some(registry) = &self.registry else {
            return;
        };
        for system_name in registry.names() {
            let Some(system) = registry.get(&system_name) else {
                continue;
            };
            let mut stopped = 0usize;
            for actor_id in system.actor_ids() {
                let owner = self.ring.route_for_system(&system_name, &actor_id);
                match owner {
                    Some(owner) if owner == self.self_node => {}
                    // Lost ownership (or the system vanished from the
                    // ring): flush and stop so the winner reloads fresh.
                    _ => {
                        if system.stop_actor(&actor_id).await {
                            stopped += 1;
                        }
                    }
                }
            }
            if stopped > 0 {
                info!(
                    system = %system_name,
                    stopped,
                    "migrated actors off this node after topology change"
                );
            }
        }
    }
}

impl Drop for TopologyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instance(host: &str, systems: &str) -> InstanceInfo {
        let mut metadata = HashMap::new();
        metadata.insert("actorSystems".to_string(), systems.to_string());
        InstanceInfo {
            host: host.to_string(),
            port: 9200,
            metadata,
        }
    }

    #[test]
    fn test_instance_metadata_parsing() {
        let info = instance("a", "player, guild,room");
        assert_eq!(info.node_id().as_str(), "a:9200");
        assert_eq!(info.actor_systems(), vec!["player", "guild", "room"]);
        assert_eq!(info.weight(), 1);

        let mut weighted = instance("b", "player");
        weighted
            .metadata
            .insert("weight".to_string(), "4".to_string());
        assert_eq!(weighted.weight(), 4);
    }

    #[tokio::test]
    async fn test_push_rebuilds_only_on_change() {
        let ring = Arc::new(HashRing::new(32));
        let watcher =
            TopologyWatcher::new(Arc::clone(&ring), NodeId::new("a", 9200));

        watcher
            .on_instances_changed(vec![instance("a", "player"), instance("b", "player")])
            .await;
        assert_eq!(ring.len(), 2);
        let route_before = ring.route("42").unwrap();

        // Same set again: the ring must stay byte-identical in behavior.
        watcher
            .on_instances_changed(vec![instance("b", "player"), instance("a", "player")])
            .await;
        assert_eq!(ring.route("42").unwrap(), route_before);

        watcher
            .on_instances_changed(vec![instance("a", "player")])
            .await;
        assert_eq!(ring.len(), 1);
    }

    struct ScriptedFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl InstanceFetcher for ScriptedFetcher {
        async fn fetch_instances(&self) -> Result<Vec<InstanceInfo>, ClusterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(vec![instance("a", "player")])
            } else {
                Ok(vec![instance("a", "player"), instance("b", "player")])
            }
        }
    }

    #[tokio::test]
    async fn test_pull_mode_follows_fetcher() {
        let ring = Arc::new(HashRing::new(32));
        let watcher = Arc::new(TopologyWatcher::new(
            Arc::clone(&ring),
            NodeId::new("a", 9200),
        ));
        watcher.start_pull(
            Arc::new(ScriptedFetcher {
                calls: AtomicU32::new(0),
            }),
            Duration::from_millis(20),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while ring.len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "ring never grew");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        watcher.stop();
    }
}

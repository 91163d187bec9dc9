//! Node composition: explicit bootstrap and shutdown of the core.
//!
//! Bootstrap wires the subsystems in topological order (cache, events,
//! actors, transport, gateway) and `shutdown` reverses it. There is no
//! lazy global state: everything hangs off the returned [`CoreRuntime`],
//! which the host launcher owns.

// Layer 1: Standard library
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

// Layer 3: Internal
use crate::state_adapter::EntityStateStore;
use hivecore_cluster::{
    ClusterError, HashRing, InstanceFetcher, MockRemoteActor, RemoteActor, RemoteActorClient,
    RpcServer, TopologyWatcher,
};
use hivecore_gate::{Dispatcher, GateError, GateServer, SessionRegistry};
use hivecore_rt::handler::HandlerSet;
use hivecore_rt::registry::ActorSystemRegistry;
use hivecore_rt::system::{ActorSystem, SystemOptions};
use hivecore_shared::config::CoreConfig;
use hivecore_shared::ids::NodeId;
use hivecore_shared::metrics::{MetricsSink, NoopMetrics};
use hivecore_store::{
    EntityStore, EvictBroadcast, KeyValueStore, MemoryEntityStore, MemoryKv, MemoryPubSub,
    MemorySortedSet, PubSubChannel, RankIndex, SortedSetStore, TieredCache,
};
use hivecore_sync::{
    CompensationEngine, CoreEvent, DistributedEventBus, LocalEventBus, SyncError,
};

/// Clean shutdown.
pub const EXIT_CLEAN: i32 = 0;
/// Fatal error before the runtime came up.
pub const EXIT_STARTUP_FAILURE: i32 = 1;
/// Fatal error after the runtime came up.
pub const EXIT_RUNTIME_FAILURE: i32 = 2;

/// Cadence of the session expiry sweeper.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The four storage contracts a node runs on.
pub struct StoreBundle {
    pub kv: Arc<dyn KeyValueStore>,
    pub sorted: Arc<dyn SortedSetStore>,
    pub pubsub: Arc<dyn PubSubChannel>,
    pub entities: Arc<dyn EntityStore>,
}

impl StoreBundle {
    /// In-process stores; tests and single-node deployments.
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(MemoryKv::new()),
            sorted: Arc::new(MemorySortedSet::new()),
            pubsub: Arc::new(MemoryPubSub::new()),
            entities: Arc::new(MemoryEntityStore::new()),
        }
    }
}

/// Everything `bootstrap` needs from the launcher.
pub struct BootstrapOptions {
    pub config: CoreConfig,
    pub node: NodeId,
    /// Distinguishes this node's session-id space; unique per node.
    pub node_index: u16,
    /// Client-facing listener; `None` runs headless (no gateway socket).
    pub gate_addr: Option<String>,
    /// Cluster RPC listener; defaults to the node id's address when the
    /// cluster is enabled.
    pub rpc_addr: Option<String>,
    pub stores: StoreBundle,
    pub metrics: Arc<dyn MetricsSink>,
}

impl BootstrapOptions {
    /// Single-node defaults over in-memory stores.
    pub fn single_node(node: NodeId) -> Self {
        Self {
            config: CoreConfig::default(),
            node,
            node_index: 0,
            gate_addr: None,
            rpc_addr: None,
            stores: StoreBundle::in_memory(),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// Startup failures; map to [`EXIT_STARTUP_FAILURE`].
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Forwards evictions from the cache into the event phase's publish task.
struct ChannelEvictBroadcast {
    tx: mpsc::UnboundedSender<(String, Option<String>)>,
}

impl EvictBroadcast for ChannelEvictBroadcast {
    fn broadcast_evict(&self, namespace: &str, key: Option<&str>) {
        let _ = self
            .tx
            .send((namespace.to_string(), key.map(String::from)));
    }
}

/// The running core; owner of every subsystem's lifecycle.
pub struct CoreRuntime {
    config: CoreConfig,
    node: NodeId,
    metrics: Arc<dyn MetricsSink>,
    stores: StoreBundle,
    cache: Arc<TieredCache>,
    rank: Arc<RankIndex>,
    local_bus: Arc<LocalEventBus>,
    bus: Arc<DistributedEventBus>,
    compensation: Arc<CompensationEngine>,
    actors: Arc<ActorSystemRegistry>,
    ring: Arc<HashRing>,
    watcher: Option<Arc<TopologyWatcher>>,
    rpc_server: Option<RpcServer>,
    remote: Arc<dyn RemoteActor>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    gate: Option<GateServer>,
    evict_forwarder: tokio::task::JoinHandle<()>,
}

/// Bring the core up in dependency order.
pub async fn bootstrap(options: BootstrapOptions) -> Result<CoreRuntime, BootstrapError> {
    options.config.validate().map_err(BootstrapError::Config)?;
    let BootstrapOptions {
        config,
        node,
        node_index,
        gate_addr,
        rpc_addr,
        stores,
        metrics,
    } = options;

    // Phase 1: cache. Evictions queue into a channel the event phase will
    // start draining.
    let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
    let cache = Arc::new(
        TieredCache::new(Arc::clone(&stores.kv))
            .with_metrics(Arc::clone(&metrics))
            .with_broadcast(Arc::new(ChannelEvictBroadcast { tx: evict_tx })),
    );
    let rank = Arc::new(RankIndex::new(Arc::clone(&stores.sorted)));

    // Phase 2: events. Remote CacheEvict deliveries clear the local tier.
    let local_bus = Arc::new(LocalEventBus::new());
    let bus = Arc::new(DistributedEventBus::new(
        Arc::clone(&local_bus),
        Arc::clone(&stores.pubsub),
        node.clone(),
    ));
    bus.start().await?;
    {
        let cache = Arc::clone(&cache);
        local_bus.subscribe_type("CacheEvict", move |event| {
            if let CoreEvent::CacheEvict { namespace, key } = event {
                match key {
                    Some(key) => cache.evict_local_key(namespace, key),
                    None => cache.evict_local(namespace),
                }
            }
        });
    }
    let evict_forwarder = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            while let Some((namespace, key)) = evict_rx.recv().await {
                let event = CoreEvent::CacheEvict { namespace, key };
                if let Err(err) = bus.publish(&event).await {
                    warn!(error = %err, "cache evict broadcast failed");
                }
            }
        })
    };
    let compensation = Arc::new(
        CompensationEngine::new(Arc::clone(&stores.kv), Arc::clone(&stores.sorted))
            .with_metrics(Arc::clone(&metrics)),
    );
    compensation.start();

    // Phase 3: actors.
    let actors = Arc::new(ActorSystemRegistry::new());

    // Phase 4: transport.
    let ring = Arc::new(HashRing::new(config.cluster.virtual_nodes));
    let mut watcher = None;
    let mut rpc_server = None;
    let remote: Arc<dyn RemoteActor> = if config.cluster.enabled {
        let topology = if config.cluster.auto_migrate {
            TopologyWatcher::new(Arc::clone(&ring), node.clone())
                .with_auto_migrate(Arc::clone(&actors))
        } else {
            TopologyWatcher::new(Arc::clone(&ring), node.clone())
        };
        watcher = Some(Arc::new(topology));
        let bind_addr = rpc_addr.unwrap_or_else(|| node.as_str().to_string());
        rpc_server = Some(RpcServer::bind(&bind_addr, Arc::clone(&actors)).await?);
        Arc::new(
            RemoteActorClient::new(node.clone(), Arc::clone(&actors), Arc::clone(&ring))
                .with_metrics(Arc::clone(&metrics)),
        )
    } else {
        // No discovery: the mock keeps the dependency non-null and every
        // call answers ServiceUnavailable.
        Arc::new(MockRemoteActor::new("remoteActor"))
    };

    // Phase 5: gateway.
    let sessions = Arc::new(
        SessionRegistry::new(&config.session, node_index)
            .with_metrics(Arc::clone(&metrics))
            .with_events(Arc::clone(&local_bus)),
    );
    sessions.start_sweeper(SESSION_SWEEP_INTERVAL);
    let dispatcher = Arc::new(Dispatcher::new().with_metrics(Arc::clone(&metrics)));
    let gate = match &gate_addr {
        Some(addr) => Some(
            GateServer::bind(
                addr,
                Arc::clone(&sessions),
                Arc::clone(&dispatcher),
                &config.gateway,
            )
            .await?,
        ),
        None => None,
    };

    info!(node = %node, cluster = config.cluster.enabled, "core runtime up");
    Ok(CoreRuntime {
        config,
        node,
        metrics,
        stores,
        cache,
        rank,
        local_bus,
        bus,
        compensation,
        actors,
        ring,
        watcher,
        rpc_server,
        remote,
        sessions,
        dispatcher,
        gate,
        evict_forwarder,
    })
}

impl CoreRuntime {
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn rank_index(&self) -> &Arc<RankIndex> {
        &self.rank
    }

    pub fn local_events(&self) -> &Arc<LocalEventBus> {
        &self.local_bus
    }

    pub fn events(&self) -> &Arc<DistributedEventBus> {
        &self.bus
    }

    pub fn compensation(&self) -> &Arc<CompensationEngine> {
        &self.compensation
    }

    pub fn actors(&self) -> &Arc<ActorSystemRegistry> {
        &self.actors
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn topology(&self) -> Option<&Arc<TopologyWatcher>> {
        self.watcher.as_ref()
    }

    pub fn remote(&self) -> &Arc<dyn RemoteActor> {
        &self.remote
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn gate_addr(&self) -> Option<std::net::SocketAddr> {
        self.gate.as_ref().map(|g| g.local_addr())
    }

    pub fn rpc_addr(&self) -> Option<std::net::SocketAddr> {
        self.rpc_server.as_ref().map(|s| s.local_addr())
    }

    pub fn entity_store(&self) -> &Arc<dyn EntityStore> {
        &self.stores.entities
    }

    /// Create, persist-wire, and register one actor system.
    pub fn register_system<S>(
        &self,
        name: &str,
        handlers: HandlerSet<S>,
    ) -> Arc<ActorSystem<S>>
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let store = Arc::new(EntityStateStore::<S>::new(
            Arc::clone(&self.stores.entities),
            name,
        ));
        let system = Arc::new(ActorSystem::with_metrics(
            name,
            SystemOptions::from_config(&self.config.actor),
            handlers,
            store,
            Arc::clone(&self.metrics),
        ));
        self.actors.register(Arc::clone(&system) as _);
        system
    }

    /// Start pull-mode topology refresh with the host's fetcher.
    pub fn start_topology_pull(&self, fetcher: Arc<dyn InstanceFetcher>) {
        if let Some(watcher) = &self.watcher {
            watcher.start_pull(fetcher, self.config.cluster.refresh_interval());
        }
    }

    /// Tear everything down in reverse bootstrap order.
    pub async fn shutdown(self) {
        info!(node = %self.node, "core runtime shutting down");
        if let Some(gate) = &self.gate {
            gate.shutdown();
        }
        self.sessions.stop_sweeper();
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        if let Some(rpc) = &self.rpc_server {
            rpc.shutdown();
        }
        self.actors.shutdown_all().await;
        self.compensation.stop();
        self.evict_forwarder.abort();
        self.bus.stop();
        info!(node = %self.node, "core runtime stopped");
    }
}

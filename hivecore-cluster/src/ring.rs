//! Consistent-hash ring with copy-on-write snapshots.
//!
//! Each physical node contributes `virtual_nodes * weight` tokens keyed by
//! `fnv1a32("{node_id}#{replica}")`. Routing walks to the first token at or
//! clockwise-after the key's hash. Rebuilds swap a fresh snapshot in under
//! an exclusive lock; `route` reads the current snapshot wait-free.

// Layer 1: Standard library
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

// Layer 2: Third-party
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

// Layer 3: Internal
use hivecore_shared::ids::NodeId;

/// Default ring tokens per weight unit.
pub const DEFAULT_VIRTUAL_NODES: u32 = 160;

/// One cluster member as the ring sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: NodeId,
    /// Actor-system names this node hosts.
    pub systems: Vec<String>,
    /// Token multiplier; defaults to 1.
    pub weight: u32,
}

impl ClusterNode {
    pub fn new(node_id: NodeId, systems: Vec<String>) -> Self {
        Self {
            node_id,
            systems,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn hosts_system(&self, system: &str) -> bool {
        self.systems.iter().any(|s| s == system)
    }
}

/// 32-bit FNV-1a; stable across platforms and processes.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Immutable ring snapshot.
struct RingSnapshot {
    /// All tokens over all nodes.
    tokens: BTreeMap<u32, NodeId>,
    /// Tokens restricted to the nodes hosting each system.
    system_tokens: HashMap<String, BTreeMap<u32, NodeId>>,
    nodes: BTreeMap<NodeId, ClusterNode>,
}

impl RingSnapshot {
    fn empty() -> Self {
        Self {
            tokens: BTreeMap::new(),
            system_tokens: HashMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    fn build(nodes: Vec<ClusterNode>, virtual_nodes: u32) -> Self {
        let mut by_id: BTreeMap<NodeId, ClusterNode> = BTreeMap::new();
        for node in nodes {
            by_id.insert(node.node_id.clone(), node);
        }

        let mut tokens = BTreeMap::new();
        let mut system_tokens: HashMap<String, BTreeMap<u32, NodeId>> = HashMap::new();
        // Deterministic build order: token collisions resolve the same way
        // on every node.
        for node in by_id.values() {
            let replicas = virtual_nodes * node.weight;
            for replica in 0..replicas {
                let token = fnv1a32(format!("{}#{replica}", node.node_id).as_bytes());
                tokens.insert(token, node.node_id.clone());
                for system in &node.systems {
                    system_tokens
                        .entry(system.clone())
                        .or_default()
                        .insert(token, node.node_id.clone());
                }
            }
        }
        Self {
            tokens,
            system_tokens,
            nodes: by_id,
        }
    }

    fn walk(tokens: &BTreeMap<u32, NodeId>, hash: u32) -> Option<NodeId> {
        tokens
            .range(hash..)
            .next()
            .or_else(|| tokens.iter().next())
            .map(|(_, node)| node.clone())
    }
}

/// The ring: wait-free reads, locked rebuilds.
pub struct HashRing {
    snapshot: ArcSwap<RingSnapshot>,
    rebuild_lock: Mutex<()>,
    virtual_nodes: u32,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RingSnapshot::empty()),
            rebuild_lock: Mutex::new(()),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    /// Replace the whole membership.
    pub fn rebuild(&self, nodes: Vec<ClusterNode>) {
        let _guard = self.rebuild_lock.lock();
        let snapshot = RingSnapshot::build(nodes, self.virtual_nodes);
        info!(
            nodes = snapshot.nodes.len(),
            tokens = snapshot.tokens.len(),
            "hash ring rebuilt"
        );
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Add one node, keeping the rest.
    pub fn add(&self, node: ClusterNode) {
        let _guard = self.rebuild_lock.lock();
        let current = self.snapshot.load();
        let mut nodes: Vec<ClusterNode> = current.nodes.values().cloned().collect();
        nodes.retain(|n| n.node_id != node.node_id);
        nodes.push(node);
        self.snapshot
            .store(Arc::new(RingSnapshot::build(nodes, self.virtual_nodes)));
    }

    /// Remove one node, keeping the rest.
    pub fn remove(&self, node_id: &NodeId) {
        let _guard = self.rebuild_lock.lock();
        let current = self.snapshot.load();
        let nodes: Vec<ClusterNode> = current
            .nodes
            .values()
            .filter(|n| &n.node_id != node_id)
            .cloned()
            .collect();
        self.snapshot
            .store(Arc::new(RingSnapshot::build(nodes, self.virtual_nodes)));
    }

    /// Owner of an entity id over all nodes.
    pub fn route(&self, entity_id: &str) -> Option<NodeId> {
        let snapshot = self.snapshot.load();
        RingSnapshot::walk(&snapshot.tokens, fnv1a32(entity_id.as_bytes()))
    }

    /// Owner of an entity id among the nodes hosting `system`.
    pub fn route_for_system(&self, system: &str, entity_id: &str) -> Option<NodeId> {
        let snapshot = self.snapshot.load();
        let tokens = snapshot.system_tokens.get(system)?;
        RingSnapshot::walk(tokens, fnv1a32(entity_id.as_bytes()))
    }

    /// Current members, sorted by node id.
    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.snapshot.load().nodes.values().cloned().collect()
    }

    /// Members hosting `system`, sorted by node id.
    pub fn nodes_for_system(&self, system: &str) -> Vec<NodeId> {
        self.snapshot
            .load()
            .nodes
            .values()
            .filter(|n| n.hosts_system(system))
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.snapshot.load().nodes.keys().cloned().collect()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.snapshot.load().nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! # hivecore-cluster
//!
//! Cluster sharding and routing: the consistent-hash ring deciding which
//! node owns an entity, the topology watcher keeping the ring in step with
//! service discovery, and the remote RPC transport letting any node
//! `tell`/`ask` an actor regardless of location.

pub mod error;
pub mod ring;
pub mod topology;
pub mod transport;

pub use error::ClusterError;
pub use ring::{fnv1a32, ClusterNode, HashRing, DEFAULT_VIRTUAL_NODES};
pub use topology::{InstanceFetcher, InstanceInfo, TopologyWatcher};
pub use transport::{
    LoadBalancePolicy, MockRemoteActor, RemoteActor, RemoteActorClient, RpcOptions, RpcServer,
    DEFAULT_RPC_TIMEOUT,
};

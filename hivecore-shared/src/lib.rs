//! # hivecore-shared
//!
//! Cross-cutting foundation for the hivecore workspace: typed identifiers,
//! runtime configuration, the wire error taxonomy, per-request trace
//! context, and the metrics sink contract.
//!
//! Every other hivecore crate depends on this one; it depends on nothing
//! inside the workspace.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod trace;
pub mod validate;

// Re-export the common surface so dependents can `use hivecore_shared::...`
// without spelling out submodules.
pub use config::{ActorConfig, ClusterConfig, CoreConfig, GatewayConfig, SessionConfig};
pub use error::{BusinessError, ErrorCode};
pub use ids::{NodeId, RecordId, RoleId, SessionId};
pub use metrics::{AtomicMetrics, MetricsSink, NoopMetrics};
pub use trace::TraceContext;

//! Core runtime configuration with sensible defaults.
//!
//! One field per configuration key the core recognizes; nested sections
//! mirror the dotted key prefixes (`cluster.*`, `actor.*`, `session.*`,
//! `gateway.*`). Field names serialize camelCased so a JSON config file
//! uses the exact published key names.

// Layer 1: Standard library
use std::time::Duration;

// Layer 2: Third-party
use serde::{Deserialize, Serialize};

// Layer 3: Internal
// (none)

/// Default number of ring tokens per physical node.
pub const DEFAULT_VIRTUAL_NODES: u32 = 160;

/// Default topology refresh interval in pull mode (30 seconds).
pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 30;

/// Default actor idle timeout before eviction (30 minutes).
pub const DEFAULT_IDLE_TIMEOUT_MINUTES: u64 = 30;

/// Default write-behind save interval (5 minutes).
pub const DEFAULT_SAVE_INTERVAL_SECONDS: u64 = 300;

/// Default bounded mailbox capacity.
pub const DEFAULT_MAILBOX_MAX_SIZE: usize = 10_000;

/// Default disconnect grace period before a session is purged (5 minutes).
pub const DEFAULT_RECONNECT_GRACE_MS: u64 = 300_000;

/// Default maximum encoded frame length (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1_048_576;

/// `cluster.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// `cluster.enabled` - whether this node joins a ring at all.
    pub enabled: bool,

    /// `cluster.virtualNodes` - ring tokens per physical node.
    pub virtual_nodes: u32,

    /// `cluster.autoMigrate` - gracefully stop actors lost to a rebuild.
    pub auto_migrate: bool,

    /// `cluster.refreshIntervalSeconds` - pull-mode topology cadence.
    pub refresh_interval_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            auto_migrate: false,
            refresh_interval_seconds: DEFAULT_REFRESH_INTERVAL_SECONDS,
        }
    }
}

impl ClusterConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }
}

/// `actor.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActorConfig {
    /// `actor.defaultIdleTimeoutMinutes` - idle eviction threshold.
    pub default_idle_timeout_minutes: u64,

    /// `actor.defaultSaveIntervalSeconds` - write-behind flush cadence.
    pub default_save_interval_seconds: u64,

    /// `actor.mailboxMaxSize` - bounded mailbox capacity.
    pub mailbox_max_size: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            default_idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
            default_save_interval_seconds: DEFAULT_SAVE_INTERVAL_SECONDS,
            mailbox_max_size: DEFAULT_MAILBOX_MAX_SIZE,
        }
    }
}

impl ActorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.default_idle_timeout_minutes * 60)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.default_save_interval_seconds)
    }
}

/// `session.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// `session.reconnectGraceMs` - retention after disconnect.
    pub reconnect_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace_ms: DEFAULT_RECONNECT_GRACE_MS,
        }
    }
}

impl SessionConfig {
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }
}

/// `gateway.*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// `gateway.maxFrameLength` - frame cap, inclusive of the length header.
    pub max_frame_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Complete configuration recognized by the core.
///
/// # Examples
///
/// ```rust
/// use hivecore_shared::config::CoreConfig;
///
/// let config = CoreConfig::default();
/// assert!(!config.cluster.enabled);
/// assert_eq!(config.cluster.virtual_nodes, 160);
///
/// let config = CoreConfig::builder()
///     .with_cluster_enabled(true)
///     .with_virtual_nodes(64)
///     .build()
///     .unwrap();
/// assert_eq!(config.cluster.virtual_nodes, 64);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cluster: ClusterConfig,
    pub actor: ActorConfig,
    pub session: SessionConfig,
    pub gateway: GatewayConfig,
}

impl CoreConfig {
    /// Create a new configuration builder.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Parse a JSON configuration document; unknown sections are ignored,
    /// missing keys take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Validate configuration values.
    ///
    /// Returns `Err` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster.virtual_nodes == 0 {
            return Err("cluster.virtualNodes must be > 0".to_string());
        }
        if self.cluster.refresh_interval_seconds == 0 {
            return Err("cluster.refreshIntervalSeconds must be > 0".to_string());
        }
        if self.actor.mailbox_max_size == 0 {
            return Err("actor.mailboxMaxSize must be > 0".to_string());
        }
        if self.actor.default_save_interval_seconds == 0 {
            return Err("actor.defaultSaveIntervalSeconds must be > 0".to_string());
        }
        if self.session.reconnect_grace_ms == 0 {
            return Err("session.reconnectGraceMs must be > 0".to_string());
        }
        if self.gateway.max_frame_length < 16 {
            return Err("gateway.maxFrameLength must cover at least one header".to_string());
        }
        Ok(())
    }
}

/// Builder for [`CoreConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    pub fn with_cluster_enabled(mut self, enabled: bool) -> Self {
        self.config.cluster.enabled = enabled;
        self
    }

    pub fn with_virtual_nodes(mut self, virtual_nodes: u32) -> Self {
        self.config.cluster.virtual_nodes = virtual_nodes;
        self
    }

    pub fn with_auto_migrate(mut self, auto_migrate: bool) -> Self {
        self.config.cluster.auto_migrate = auto_migrate;
        self
    }

    pub fn with_refresh_interval_seconds(mut self, seconds: u64) -> Self {
        self.config.cluster.refresh_interval_seconds = seconds;
        self
    }

    pub fn with_idle_timeout_minutes(mut self, minutes: u64) -> Self {
        self.config.actor.default_idle_timeout_minutes = minutes;
        self
    }

    pub fn with_save_interval_seconds(mut self, seconds: u64) -> Self {
        self.config.actor.default_save_interval_seconds = seconds;
        self
    }

    pub fn with_mailbox_max_size(mut self, size: usize) -> Self {
        self.config.actor.mailbox_max_size = size;
        self
    }

    pub fn with_reconnect_grace_ms(mut self, ms: u64) -> Self {
        self.config.session.reconnect_grace_ms = ms;
        self
    }

    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.config.gateway.max_frame_length = bytes;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<CoreConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert!(!config.cluster.enabled);
        assert_eq!(config.cluster.virtual_nodes, 160);
        assert!(!config.cluster.auto_migrate);
        assert_eq!(config.cluster.refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.actor.idle_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.actor.save_interval(), Duration::from_secs(300));
        assert_eq!(config.actor.mailbox_max_size, 10_000);
        assert_eq!(config.session.reconnect_grace(), Duration::from_secs(300));
        assert_eq!(config.gateway.max_frame_length, 1_048_576);
    }

    #[test]
    fn test_validation_rejects_zero_virtual_nodes() {
        let result = CoreConfig::builder().with_virtual_nodes(0).build();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("virtualNodes"));
    }

    #[test]
    fn test_validation_rejects_zero_mailbox() {
        let result = CoreConfig::builder().with_mailbox_max_size(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_round_trip() {
        let config = CoreConfig::builder()
            .with_cluster_enabled(true)
            .with_virtual_nodes(320)
            .with_auto_migrate(true)
            .with_idle_timeout_minutes(10)
            .with_reconnect_grace_ms(60_000)
            .build()
            .unwrap();
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.virtual_nodes, 320);
        assert!(config.cluster.auto_migrate);
        assert_eq!(config.actor.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.session.reconnect_grace(), Duration::from_secs(60));
    }

    #[test]
    fn test_json_uses_published_key_names() {
        let json = r#"{
            "cluster": {"enabled": true, "virtualNodes": 80},
            "gateway": {"maxFrameLength": 65536}
        }"#;
        let config = CoreConfig::from_json_str(json).unwrap();
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.virtual_nodes, 80);
        assert_eq!(config.gateway.max_frame_length, 65_536);
        // Untouched sections keep their defaults.
        assert_eq!(config.actor.mailbox_max_size, 10_000);
    }

    #[test]
    fn test_serialization_json() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("virtualNodes"));
        assert!(json.contains("reconnectGraceMs"));
        let back = CoreConfig::from_json_str(&json).unwrap();
        assert_eq!(back.cluster.virtual_nodes, config.cluster.virtual_nodes);
    }
}

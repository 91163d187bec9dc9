//! Cluster event families as one tagged variant type.
//!
//! The serde tag doubles as the wire class name, so the distributed bus
//! needs no separate class registry: decoding the tag reconstructs the
//! variant. Host-defined events ride in `Generic`.

// Layer 1: Standard library
// (none)

// Layer 2: Third-party
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Layer 3: Internal
use crate::error::SyncError;
use hivecore_shared::ids::RoleId;

/// Every event the core publishes or understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", content = "data")]
pub enum CoreEvent {
    /// A configuration scope should be re-read.
    ConfigReload { scope: String },

    /// A cached entry (or a whole namespace) went stale cluster-wide.
    CacheEvict {
        namespace: String,
        key: Option<String>,
    },

    /// An activity switched phase.
    ActivityChange { activity_id: u64, status: String },

    PlayerOnline { role_id: RoleId, server_id: u32 },

    PlayerOffline { role_id: RoleId, server_id: u32 },

    /// A player document changed in a way others may cache.
    PlayerChange { role_id: RoleId, field: String },

    GuildMemberChange {
        guild_id: u64,
        role_id: RoleId,
        change: String,
    },

    GuildDissolve { guild_id: u64 },

    MaintenanceNotice {
        message: String,
        start_at: DateTime<Utc>,
    },

    /// Escape hatch for host-defined event types.
    Generic { event_type: String, data: Value },
}

impl CoreEvent {
    /// The class name carried on the wire and used by subscriber filters.
    pub fn event_type(&self) -> &str {
        match self {
            Self::ConfigReload { .. } => "ConfigReload",
            Self::CacheEvict { .. } => "CacheEvict",
            Self::ActivityChange { .. } => "ActivityChange",
            Self::PlayerOnline { .. } => "PlayerOnline",
            Self::PlayerOffline { .. } => "PlayerOffline",
            Self::PlayerChange { .. } => "PlayerChange",
            Self::GuildMemberChange { .. } => "GuildMemberChange",
            Self::GuildDissolve { .. } => "GuildDissolve",
            Self::MaintenanceNotice { .. } => "MaintenanceNotice",
            Self::Generic { event_type, .. } => event_type,
        }
    }

    /// Split into `(class_name, json_data)` for the wire envelope.
    pub fn wire_parts(&self) -> Result<(String, Value), SyncError> {
        let mut value = serde_json::to_value(self)?;
        let class = value["class"]
            .as_str()
            .unwrap_or(self.event_type())
            .to_string();
        let data = value
            .as_object_mut()
            .and_then(|obj| obj.remove("data"))
            .unwrap_or(Value::Null);
        Ok((class, data))
    }

    /// Rebuild from wire parts; unknown class names become `Generic` so an
    /// older node never chokes on a newer peer's events.
    pub fn from_wire_parts(class: &str, data: Value) -> Self {
        let tagged = serde_json::json!({ "class": class, "data": data.clone() });
        match serde_json::from_value(tagged) {
            Ok(event) => event,
            Err(_) => Self::Generic {
                event_type: class.to_string(),
                data,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_parts_round_trip() {
        let event = CoreEvent::CacheEvict {
            namespace: "player_config".to_string(),
            key: Some("99".to_string()),
        };
        let (class, data) = event.wire_parts().unwrap();
        assert_eq!(class, "CacheEvict");
        assert_eq!(CoreEvent::from_wire_parts(&class, data), event);
    }

    #[test]
    fn test_every_family_round_trips() {
        let events = vec![
            CoreEvent::ConfigReload {
                scope: "activity".to_string(),
            },
            CoreEvent::ActivityChange {
                activity_id: 4,
                status: "open".to_string(),
            },
            CoreEvent::PlayerOnline {
                role_id: RoleId::from_u64(7),
                server_id: 1,
            },
            CoreEvent::PlayerOffline {
                role_id: RoleId::from_u64(7),
                server_id: 1,
            },
            CoreEvent::PlayerChange {
                role_id: RoleId::from_u64(7),
                field: "name".to_string(),
            },
            CoreEvent::GuildMemberChange {
                guild_id: 3,
                role_id: RoleId::from_u64(7),
                change: "join".to_string(),
            },
            CoreEvent::GuildDissolve { guild_id: 3 },
            CoreEvent::MaintenanceNotice {
                message: "down at dawn".to_string(),
                start_at: Utc::now(),
            },
            CoreEvent::Generic {
                event_type: "custom.thing".to_string(),
                data: json!({"x": 1}),
            },
        ];
        for event in events {
            let (class, data) = event.wire_parts().unwrap();
            assert_eq!(CoreEvent::from_wire_parts(&class, data), event);
        }
    }

    #[test]
    fn test_unknown_class_degrades_to_generic() {
        let event = CoreEvent::from_wire_parts("FutureThing", json!({"a": 1}));
        assert_eq!(
            event,
            CoreEvent::Generic {
                event_type: "FutureThing".to_string(),
                data: json!({"a": 1}),
            }
        );
    }
}

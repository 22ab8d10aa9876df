//! Instance model and runtime-value accessors.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Public base path the instance is reachable at.
pub const PUBLIC_PATH_KEY: &str = "SHINYPROXY_PUBLIC_PATH";
/// Reconnection policy in effect for the instance.
pub const RECONNECTION_MODE_KEY: &str = "SHINYPROXY_WEBSOCKET_RECONNECTION_MODE";
/// Disables the in-place reconnect capability when `true`.
pub const FORCE_FULL_RELOAD_KEY: &str = "SHINYPROXY_FORCE_FULL_RELOAD";
/// Enables reporting of in-app navigation.
pub const TRACK_APP_URL_KEY: &str = "SHINYPROXY_TRACK_APP_URL";
/// Server-side heartbeat timeout (milliseconds).
pub const HEARTBEAT_TIMEOUT_KEY: &str = "SHINYPROXY_HEARTBEAT_TIMEOUT";
/// Maximum lifetime of the instance (minutes).
pub const MAX_LIFETIME_KEY: &str = "SHINYPROXY_MAX_LIFETIME";

/// Lifecycle status of a backend instance, as reported by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    /// Created, container not yet reachable.
    New,
    /// Reachable and serving.
    Up,
    /// Stop requested, teardown in progress.
    Stopping,
    /// Pause requested, teardown in progress.
    Pausing,
    /// Paused; can be resumed.
    Paused,
    /// Resume requested, container starting again.
    Resuming,
    /// Gone for good.
    Stopped,
}

impl InstanceStatus {
    /// Whether a long-poll may stop waiting on this status.
    #[must_use]
    pub fn ends_transition(self) -> bool {
        matches!(self, Self::Up | Self::Stopped | Self::Paused)
    }
}

/// Desired status sent with a `PUT status` request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DesiredStatus {
    /// Request a stop.
    Stopping,
    /// Request a pause.
    Pausing,
    /// Request a resume of a paused instance.
    Resuming,
}

/// Policy applied when the embedded content loses its transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ReconnectionMode {
    /// Never reconnect; only check whether the instance is gone.
    None,
    /// Reconnect silently.
    Auto,
    /// Ask the user before reconnecting.
    #[default]
    Confirm,
}

impl ReconnectionMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "None" => Some(Self::None),
            "Auto" => Some(Self::Auto),
            "Confirm" => Some(Self::Confirm),
            _ => None,
        }
    }
}

/// Immutable key/value pairs fixed when the instance was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RuntimeValues(HashMap<String, String>);

impl RuntimeValues {
    /// Wrap a raw map.
    #[must_use]
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    /// Raw lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Public base path, if the server assigned one.
    #[must_use]
    pub fn public_path(&self) -> Option<&str> {
        self.get(PUBLIC_PATH_KEY)
    }

    /// Reconnection policy; unknown or missing values fall back to `Confirm`.
    #[must_use]
    pub fn reconnection_mode(&self) -> ReconnectionMode {
        self.get(RECONNECTION_MODE_KEY)
            .and_then(ReconnectionMode::parse)
            .unwrap_or_default()
    }

    /// Whether recovery must always recreate the frame.
    #[must_use]
    pub fn force_full_reload(&self) -> bool {
        self.flag(FORCE_FULL_RELOAD_KEY)
    }

    /// Whether in-app navigation is reported.
    #[must_use]
    pub fn track_app_url(&self) -> bool {
        self.flag(TRACK_APP_URL_KEY)
    }

    /// Server-side heartbeat timeout in milliseconds.
    #[must_use]
    pub fn heartbeat_timeout_ms(&self) -> Option<u64> {
        self.get(HEARTBEAT_TIMEOUT_KEY).and_then(|v| v.parse().ok())
    }

    /// Maximum instance lifetime in minutes.
    #[must_use]
    pub fn max_lifetime_minutes(&self) -> Option<u64> {
        self.get(MAX_LIFETIME_KEY).and_then(|v| v.parse().ok())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// One backend-managed application container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Opaque identifier, stable for the instance's lifetime.
    pub id: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Application (spec) the instance runs.
    #[serde(default)]
    pub spec_id: Option<String>,
    /// Human-readable name of the application.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Values fixed at creation time.
    #[serde(default)]
    pub runtime_values: RuntimeValues,
    /// Epoch milliseconds at which the instance became reachable; 0 before.
    #[serde(default)]
    pub startup_timestamp: i64,
}

impl Instance {
    /// Instant the instance became reachable, if it has.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        if self.startup_timestamp <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.startup_timestamp).single()
    }

    /// Time since startup, if the instance has started.
    #[must_use]
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at().map(|started| now - started)
    }
}

//! Client configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Heartbeat emitter settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Interval between heartbeat ticks, and minimum idle time before one is sent.
    #[serde(default = "default_heartbeat_rate_ms")]
    pub rate_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            rate_ms: default_heartbeat_rate_ms(),
        }
    }
}

/// Reconnection coordinator settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReconnectConfig {
    /// Consecutive recovery attempts before a full page reload is offered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Number of recovery checks per attempt.
    #[serde(default = "default_check_count")]
    pub check_count: u32,
    /// Delay between two recovery checks.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Client-side timeout of the liveness probe.
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            check_count: default_check_count(),
            check_interval_ms: default_check_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
        }
    }
}

/// Long-poll (`watch=true`) settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LongPollConfig {
    /// Server-side window of one long-poll request.
    #[serde(default = "default_long_poll_seconds")]
    pub timeout_seconds: u64,
    /// Extra client-side wait on top of the server window before a
    /// long-poll request is abandoned.
    #[serde(default = "default_long_poll_margin_ms")]
    pub request_margin_ms: u64,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_long_poll_seconds(),
            request_margin_ms: default_long_poll_margin_ms(),
        }
    }
}

/// Frame instrumentation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct InjectorConfig {
    /// Ready-state polling interval used when no pre-script hook exists.
    #[serde(default = "default_injector_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_injector_poll_ms(),
        }
    }
}

fn default_heartbeat_rate_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_check_count() -> u32 {
    10
}

fn default_check_interval_ms() -> u64 {
    250
}

fn default_liveness_timeout_ms() -> u64 {
    3_000
}

fn default_long_poll_seconds() -> u64 {
    10
}

fn default_long_poll_margin_ms() -> u64 {
    10_000
}

fn default_injector_poll_ms() -> u64 {
    50
}

fn default_app_instance() -> String {
    "_".into()
}

fn default_timezone() -> String {
    "UTC".into()
}

/// Client configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Base URL (context path) of the proxy server; always ends with `/`.
    pub server_url: String,
    /// Application (spec) identifier to start.
    pub app_name: String,
    /// Named instance of the application; `_` is the default instance.
    #[serde(default = "default_app_instance")]
    pub app_instance: String,
    /// Sub-path appended to the instance's public path when embedding it.
    #[serde(default)]
    pub container_sub_path: String,
    /// Time zone reported when creating an instance.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Pins every request to one proxy server when several serve the same host.
    #[serde(default)]
    pub instance_override: Option<String>,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnection settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Long-poll settings.
    #[serde(default)]
    pub long_poll: LongPollConfig,
    /// Frame instrumentation settings.
    #[serde(default)]
    pub injector: InjectorConfig,
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize the server URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat_rate(&self) -> Duration {
        Duration::from_millis(self.heartbeat.rate_ms)
    }

    /// Delay between two recovery checks.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect.check_interval_ms)
    }

    /// Client-side timeout of the liveness probe.
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect.liveness_timeout_ms)
    }

    /// Client-side slack added to every long-poll request's server window.
    #[must_use]
    pub fn long_poll_margin(&self) -> Duration {
        Duration::from_millis(self.long_poll.request_margin_ms)
    }

    /// Ready-state polling interval of the frame injector.
    #[must_use]
    pub fn injector_poll_interval(&self) -> Duration {
        Duration::from_millis(self.injector.poll_interval_ms)
    }

    fn validate(&mut self) -> Result<()> {
        let url = self.server_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "server_url must be an http(s) URL, got `{url}`"
            )));
        }
        // Relative URL joins drop the last path segment unless it ends with '/'.
        self.server_url = if url.ends_with('/') {
            url.to_owned()
        } else {
            format!("{url}/")
        };

        if self.app_name.trim().is_empty() {
            return Err(AppError::Config("app_name must not be empty".into()));
        }
        if self.heartbeat.rate_ms == 0 {
            return Err(AppError::Config("heartbeat.rate_ms must be > 0".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(AppError::Config(
                "reconnect.max_attempts must be > 0".into(),
            ));
        }
        if self.reconnect.check_count == 0 || self.reconnect.check_interval_ms == 0 {
            return Err(AppError::Config(
                "reconnect.check_count and reconnect.check_interval_ms must be > 0".into(),
            ));
        }
        if self.long_poll.timeout_seconds == 0 {
            return Err(AppError::Config(
                "long_poll.timeout_seconds must be > 0".into(),
            ));
        }
        if self.injector.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "injector.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.reconnect.liveness_timeout_ms > self.heartbeat.rate_ms {
            warn!(
                liveness_timeout_ms = self.reconnect.liveness_timeout_ms,
                heartbeat_rate_ms = self.heartbeat.rate_ms,
                "liveness timeout exceeds heartbeat rate; probes may overlap ticks"
            );
        }
        Ok(())
    }
}

//! Agent configuration
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields the stock behaviour:
//!
//! ```json
//! {
//!   "receive_timeout_ms": 1000,
//!   "receive_buffer_bytes": 16384,
//!   "max_response_bytes": 10000000,
//!   "interface_lookup_attempts": 10,
//!   "interface_lookup_interval_ms": 100,
//!   "monitor_idle_backoff_ms": 100,
//!   "route_cache_policy": "snapshot_only"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::netlink::structures::NlMsgHdr;
use crate::netlink::structures::WireStruct;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// How live route notifications affect the route caches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCachePolicy {
    /// Route caches hold the last explicit dump; notifications are only logged
    #[default]
    SnapshotOnly,
    /// Route notifications are folded into the caches as they arrive
    LiveSynced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// `SO_RCVTIMEO` for every socket
    pub receive_timeout_ms: u64,
    /// Size of the user-space buffer one datagram is received into
    pub receive_buffer_bytes: usize,
    /// Upper bound on the bytes accumulated by one dump
    pub max_response_bytes: usize,
    pub interface_lookup_attempts: u32,
    pub interface_lookup_interval_ms: u64,
    /// Pause after an idle or failed receive in the monitor loop
    pub monitor_idle_backoff_ms: u64,
    pub route_cache_policy: RouteCachePolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 1000,
            receive_buffer_bytes: 16 * 1024,
            max_response_bytes: 10_000_000,
            interface_lookup_attempts: 10,
            interface_lookup_interval_ms: 100,
            monitor_idle_backoff_ms: 100,
            route_cache_policy: RouteCachePolicy::SnapshotOnly,
        }
    }
}

impl AgentConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // A zero SO_RCVTIMEO means "block forever", which would make the
        // monitor thread impossible to stop.
        if self.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid("receive_timeout_ms must be positive"));
        }
        if self.receive_buffer_bytes < NlMsgHdr::SIZE {
            return Err(ConfigError::Invalid(
                "receive_buffer_bytes must hold at least one message header",
            ));
        }
        if self.max_response_bytes < self.receive_buffer_bytes {
            return Err(ConfigError::Invalid(
                "max_response_bytes must not be smaller than receive_buffer_bytes",
            ));
        }
        if self.interface_lookup_attempts == 0 {
            return Err(ConfigError::Invalid(
                "interface_lookup_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn interface_lookup_interval(&self) -> Duration {
        Duration::from_millis(self.interface_lookup_interval_ms)
    }

    pub fn monitor_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.monitor_idle_backoff_ms)
    }
}

//! Coordinator configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; `MeshConfig::default()` is suitable for tests and embedding.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default coordinator mailbox buffer size.
pub const DEFAULT_COORDINATOR_MAILBOX: usize = 256;

/// Default buffer size for events surfaced to the presentation layer.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Default capacity of the relay's per-subscription dedup cache.
pub const DEFAULT_RELAY_DEDUP_CAPACITY: usize = 1024;

/// Default bound on how long a peer session waits for its transport to
/// close during teardown.
pub const DEFAULT_SESSION_CLOSE_TIMEOUT_MS: u64 = 5_000;

/// Default ICE mode: trickled candidates, out-of-order delivery tolerated.
pub const DEFAULT_TRICKLE_ICE: bool = true;

/// Mesh coordinator configuration.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Coordinator mailbox buffer size (default: 256).
    pub coordinator_mailbox: usize,

    /// Buffer size for `MeshEvent`s to the presentation layer (default: 64).
    pub event_buffer: usize,

    /// Capacity of the relay dedup cache, in sequence keys (default: 1024).
    pub relay_dedup_capacity: usize,

    /// Bound on a transport's close during session teardown (default: 5s).
    /// A wedged transport is abandoned once the timeout elapses so teardown
    /// of the whole attendance cannot stall.
    pub session_close_timeout: Duration,

    /// Whether transports trickle ICE candidates (default: true). When set,
    /// candidates may arrive before or interleaved with the answer and the
    /// transport must tolerate that ordering.
    pub trickle_ice: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            coordinator_mailbox: DEFAULT_COORDINATOR_MAILBOX,
            event_buffer: DEFAULT_EVENT_BUFFER,
            relay_dedup_capacity: DEFAULT_RELAY_DEDUP_CAPACITY,
            session_close_timeout: Duration::from_millis(DEFAULT_SESSION_CLOSE_TIMEOUT_MS),
            trickle_ice: DEFAULT_TRICKLE_ICE,
        }
    }
}

impl MeshConfig {
    /// Load configuration from environment variables.
    ///
    /// Recognized variables: `MESH_COORDINATOR_MAILBOX`, `MESH_EVENT_BUFFER`,
    /// `MESH_RELAY_DEDUP_CAPACITY`, `MESH_SESSION_CLOSE_TIMEOUT_MS`,
    /// `MESH_TRICKLE_ICE`. Unset variables fall back to defaults; malformed
    /// values are an error. The channel buffer sizes must be nonzero — a
    /// zero-capacity mailbox cannot be constructed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            coordinator_mailbox: parse_nonzero_usize("MESH_COORDINATOR_MAILBOX")?
                .unwrap_or(DEFAULT_COORDINATOR_MAILBOX),
            event_buffer: parse_nonzero_usize("MESH_EVENT_BUFFER")?.unwrap_or(DEFAULT_EVENT_BUFFER),
            relay_dedup_capacity: parse_usize("MESH_RELAY_DEDUP_CAPACITY")?
                .unwrap_or(DEFAULT_RELAY_DEDUP_CAPACITY),
            session_close_timeout: Duration::from_millis(
                parse_u64("MESH_SESSION_CLOSE_TIMEOUT_MS")?
                    .unwrap_or(DEFAULT_SESSION_CLOSE_TIMEOUT_MS),
            ),
            trickle_ice: parse_bool("MESH_TRICKLE_ICE")?.unwrap_or(DEFAULT_TRICKLE_ICE),
        })
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable is set to an unparseable value.
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

impl From<ConfigError> for crate::errors::MeshError {
    fn from(e: ConfigError) -> Self {
        crate::errors::MeshError::Config(e.to_string())
    }
}

fn parse_usize(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(None),
    }
}

fn parse_nonzero_usize(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match parse_usize(var)? {
        Some(0) => Err(ConfigError::InvalidValue {
            var,
            value: "0".to_string(),
        }),
        other => Ok(other),
    }
}

fn parse_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(var) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { var, value: raw }),
        },
        Err(_) => Ok(None),
    }
}

//! # Pool Configuration
//!
//! Immutable settings fixed at startup. The gateway never mutates these after
//! the pool is built; changing them means restarting the process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default backing store port (Redis-compatible).
pub const DEFAULT_TARGET_PORT: u16 = 6379;

/// Default ceiling on simultaneously outstanding handles.
pub const DEFAULT_MAX_CONNECTIONS: usize = 2500;

/// Default time a borrow may wait for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Backing store host name or IP.
    pub target_host: String,
    /// Backing store port.
    pub target_port: u16,
    /// Upper bound on simultaneously outstanding handles.
    pub max_connections: usize,
    /// Connections opened eagerly at startup.
    pub min_idle: usize,
    /// How long `borrow()` waits before failing with `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional bound on each backend round trip.
    pub io_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            target_host: "localhost".to_string(),
            target_port: DEFAULT_TARGET_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_idle: 0,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            connect_timeout: Some(Duration::from_secs(1)),
            io_timeout: Some(Duration::from_secs(2)),
        }
    }
}

impl PoolConfig {
    /// Returns `host:port` for the backing store.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// Checks the startup invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if self.min_idle > self.max_connections {
            return Err(ConfigError::MinIdleAboveMax {
                min_idle: self.min_idle,
                max_connections: self.max_connections,
            });
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConfigError::ZeroAcquireTimeout);
        }
        if self.target_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        Ok(())
    }
}

//! # Gateway Configuration
//!
//! Read once at startup from flags or the environment; never mutated at
//! runtime.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use cachegw_common::{ConfigError, PoolConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_TARGET_PORT};

/// Default key served by `GET /cache`.
pub const DEFAULT_KEY: &str = "test_key";

/// Command-line interface of the `cachegw` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "cachegw")]
#[command(about = "Caching gateway in front of a Redis-compatible backing store", long_about = None)]
pub struct Args {
    /// Address the HTTP surface listens on
    #[arg(long, env = "CACHEGW_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Backing store host
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Backing store port
    #[arg(long, env = "REDIS_PORT", default_value_t = DEFAULT_TARGET_PORT)]
    pub redis_port: u16,

    /// Upper bound on simultaneously borrowed backend connections
    #[arg(long, env = "CACHEGW_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Connections opened eagerly at startup
    #[arg(long, env = "CACHEGW_MIN_IDLE", default_value_t = 0)]
    pub min_idle: usize,

    /// How long a request waits for a free connection
    #[arg(long, env = "CACHEGW_ACQUIRE_TIMEOUT_MS", default_value_t = 5_000)]
    pub acquire_timeout_ms: u64,

    /// TCP connect timeout (0 disables it)
    #[arg(long, env = "CACHEGW_CONNECT_TIMEOUT_MS", default_value_t = 1_000)]
    pub connect_timeout_ms: u64,

    /// Bound on each backend round trip (0 disables it)
    #[arg(long, env = "CACHEGW_IO_TIMEOUT_MS", default_value_t = 2_000)]
    pub io_timeout_ms: u64,

    /// How long shutdown waits for in-flight requests
    #[arg(long, env = "CACHEGW_DRAIN_TIMEOUT_MS", default_value_t = 10_000)]
    pub drain_timeout_ms: u64,

    /// Key served by `GET /cache`
    #[arg(long, env = "CACHEGW_DEFAULT_KEY", default_value = DEFAULT_KEY)]
    pub default_key: String,

    /// Start without checking that the backing store answers
    #[arg(long, env = "CACHEGW_SKIP_PREFLIGHT")]
    pub skip_preflight: bool,

    /// Backing store implementation
    #[arg(long, env = "CACHEGW_BACKEND", value_enum, default_value_t = BackendKind::Resp)]
    pub backend: BackendKind,
}

/// Backing store selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Redis-compatible server over TCP
    Resp,
    /// Process-local map, for demos and load tests without a backend
    Memory,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub pool: PoolConfig,
    pub default_key: String,
    /// Fail startup when the backing store does not answer a PING.
    pub preflight: bool,
    pub drain_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            pool: PoolConfig::default(),
            default_key: DEFAULT_KEY.to_string(),
            preflight: true,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()
    }
}

impl Args {
    /// Converts parsed flags into a validated configuration.
    pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
        let config = GatewayConfig {
            listen: self.listen,
            pool: PoolConfig {
                target_host: self.redis_host,
                target_port: self.redis_port,
                max_connections: self.max_connections,
                min_idle: self.min_idle,
                acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
                connect_timeout: optional_millis(self.connect_timeout_ms),
                io_timeout: optional_millis(self.io_timeout_ms),
            },
            default_key: self.default_key,
            preflight: !self.skip_preflight,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

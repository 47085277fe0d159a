//! # Lifecycle Manager
//!
//! Own the pool and the gateway for the lifetime of the process.
//!
//! State machine: `Uninitialized -> Ready -> Draining -> Closed`.
//!
//! - Startup validates the configuration, builds the pool and, unless
//!   `preflight` is disabled, opens and PINGs one connection. A failed
//!   preflight aborts startup.
//! - Shutdown stops admission, waits (bounded) for in-flight operations and
//!   drains the pool. `Closed` is terminal.
//!
//! State is published on a watch channel so observers never take a lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use cachegw_client::{ConnectionPool, Connector};
use cachegw_common::{ConfigError, PoolError};

use crate::config::GatewayConfig;
use crate::gateway::CacheGateway;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Draining,
    Closed,
}

impl LifecycleState {
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Ready => "ready",
            LifecycleState::Draining => "draining",
            LifecycleState::Closed => "closed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that keep the service from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("backend preflight failed: {0}")]
    Preflight(#[source] PoolError),
    #[error("failed to open warm connections: {0}")]
    WarmUp(#[source] PoolError),
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections closed by the pool drain.
    pub connections_closed: usize,
    /// In-flight operations were still running when the drain timeout elapsed.
    pub timed_out: bool,
}

pub struct LifecycleManager<C: Connector> {
    gateway: Arc<CacheGateway<C>>,
    state: watch::Sender<LifecycleState>,
    drain_timeout: Duration,
}

impl<C: Connector> LifecycleManager<C> {
    /// Builds the pool and gateway and moves to `Ready`.
    pub async fn start(connector: C, config: &GatewayConfig) -> Result<Self, StartupError> {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        let pool = ConnectionPool::new(connector, config.pool.clone())?;

        if config.preflight {
            pool.preflight().await.map_err(StartupError::Preflight)?;
            info!(backend = %config.pool.addr(), "backend preflight passed");
        } else {
            info!(backend = %config.pool.addr(), "skipping backend preflight");
        }

        match pool.warm_up().await {
            Ok(_) => {}
            Err(err) if config.preflight => return Err(StartupError::WarmUp(err)),
            Err(err) => warn!(error = %err, "warm-up failed, connecting lazily"),
        }

        let gateway = Arc::new(CacheGateway::new(pool, Arc::new(Metrics::new())));
        state.send_replace(LifecycleState::Ready);
        info!(
            max_connections = config.pool.max_connections,
            state = %LifecycleState::Ready,
            "gateway lifecycle started"
        );

        Ok(LifecycleManager {
            gateway,
            state,
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn gateway(&self) -> &Arc<CacheGateway<C>> {
        &self.gateway
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Drains the gateway and closes every backend connection.
    ///
    /// Only the first caller drives the drain; later callers wait for
    /// `Closed` and get an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Ready {
                *state = LifecycleState::Draining;
                claimed = true;
                return true;
            }
            false
        });

        if !claimed {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|state| *state == LifecycleState::Closed).await;
            return ShutdownReport::default();
        }

        info!(inflight = self.gateway.inflight(), "draining gateway");
        self.gateway.stop_admission();
        let timed_out = tokio::time::timeout(self.drain_timeout, self.gateway.wait_idle())
            .await
            .is_err();
        if timed_out {
            warn!(
                inflight = self.gateway.inflight(),
                timeout = ?self.drain_timeout,
                "in-flight operations outlived the drain timeout"
            );
        }

        let drained = self.gateway.pool().drain().await;
        self.state.send_replace(LifecycleState::Closed);
        info!(connections_closed = drained.closed, "gateway closed");

        ShutdownReport {
            connections_closed: drained.closed,
            timed_out,
        }
    }
}

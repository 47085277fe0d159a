//! # Cache Gateway
//!
//! Turn logical `get`/`set` calls into pooled backend round trips.
//!
//! ## Design Principles
//! 1. **One Record Per Call**: Every call records exactly one `OperationRecord`,
//!    including rejected and cancelled calls.
//! 2. **No Silent Retries**: Backend failures surface to the caller as-is.
//! 3. **Suspect Connections Leave**: A connection fault discards the handle;
//!    a well-formed error reply releases it.
//! 4. **Drain-Aware Admission**: The in-flight token is taken before the
//!    admission flag is checked, so `wait_idle` cannot miss an operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use cachegw_client::{BackendConnection, ConnectionPool, Connector, PooledConnection};
use cachegw_common::{BackendError, GatewayError, GatewayResult, OperationKind, Outcome};

use crate::metrics::Metrics;

/// Request-handling core shared by every handler.
pub struct CacheGateway<C: Connector> {
    pool: ConnectionPool<C>,
    metrics: Arc<Metrics>,
    admitting: AtomicBool,
    inflight: TaskTracker,
}

impl<C: Connector> CacheGateway<C> {
    /// Creates a gateway that admits operations immediately.
    pub fn new(pool: ConnectionPool<C>, metrics: Arc<Metrics>) -> Self {
        CacheGateway {
            pool,
            metrics,
            admitting: AtomicBool::new(true),
            inflight: TaskTracker::new(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_admitting(&self) -> bool {
        self.admitting.load(Ordering::Acquire)
    }

    /// Number of operations currently holding an in-flight token.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Reads `key`. `Ok(None)` means the key is absent.
    pub async fn get(&self, key: &str) -> GatewayResult<Option<Bytes>> {
        let scope = self.metrics.begin(OperationKind::Get);
        let result = self.run_get(key).await;
        let outcome = match &result {
            Ok(Some(_)) => Outcome::Hit,
            Ok(None) => Outcome::Miss,
            Err(_) => Outcome::Error,
        };
        let latency = scope.finish(outcome);
        debug!(op = "get", key, %outcome, ?latency, "gateway operation");
        result
    }

    /// Writes `key`. Returns true iff the backend acknowledged the write.
    pub async fn set(&self, key: &str, value: &[u8]) -> GatewayResult<bool> {
        let scope = self.metrics.begin(OperationKind::Set);
        let result = self.run_set(key, value).await;
        let outcome = match &result {
            Ok(true) => Outcome::Hit,
            Ok(false) => Outcome::Miss,
            Err(_) => Outcome::Error,
        };
        let latency = scope.finish(outcome);
        debug!(op = "set", key, %outcome, ?latency, "gateway operation");
        result
    }

    /// Rejects every new operation with `ServiceShuttingDown`.
    pub fn stop_admission(&self) {
        self.admitting.store(false, Ordering::Release);
        self.inflight.close();
    }

    /// Resolves once admission is stopped and no operation is in flight.
    pub async fn wait_idle(&self) {
        self.inflight.wait().await;
    }

    async fn run_get(&self, key: &str) -> GatewayResult<Option<Bytes>> {
        let _token = self.admit()?;
        let mut handle = self.pool.borrow().await?;
        match handle.get(key).await {
            Ok(value) => {
                self.pool.release(handle);
                Ok(value)
            }
            Err(err) => {
                self.settle(handle, OperationKind::Get, &err);
                Err(GatewayError::BackendUnavailable(err))
            }
        }
    }

    async fn run_set(&self, key: &str, value: &[u8]) -> GatewayResult<bool> {
        let _token = self.admit()?;
        let mut handle = self.pool.borrow().await?;
        match handle.set(key, value).await {
            Ok(stored) => {
                self.pool.release(handle);
                Ok(stored)
            }
            Err(err) if !err.is_connection_fault() => {
                self.settle(handle, OperationKind::Set, &err);
                Ok(false)
            }
            Err(err) => {
                self.settle(handle, OperationKind::Set, &err);
                Err(GatewayError::BackendUnavailable(err))
            }
        }
    }

    fn admit(&self) -> GatewayResult<TaskTrackerToken> {
        let token = self.inflight.token();
        if !self.admitting.load(Ordering::Acquire) {
            return Err(GatewayError::ServiceShuttingDown);
        }
        Ok(token)
    }

    fn settle(&self, handle: PooledConnection<C>, op: OperationKind, err: &BackendError) {
        if err.is_connection_fault() {
            warn!(%op, conn = handle.id(), error = %err, "discarding backend connection");
            self.pool.discard(handle);
        } else {
            warn!(%op, conn = handle.id(), error = %err, "backend rejected command");
            self.pool.release(handle);
        }
    }
}

//! # Error Taxonomy
//!
//! Errors are layered the same way the system is: the backend connection
//! fails with `BackendError`, the pool wraps it in `PoolError`, and the
//! gateway maps both onto the outcomes callers see in `GatewayError`.
//!
//! ## Design Principles
//! 1. **Local Failures**: Every error belongs to one operation; none of them
//!    is fatal to the process.
//! 2. **Fault Classification**: `BackendError::is_connection_fault` decides
//!    whether a connection may go back to the free set.
//! 3. **Swallowed Metrics**: `MetricsError` exists so recording failures can be
//!    logged, never propagated.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for backend round trips.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures talking to the backing store.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// The connect or round trip did not finish in time.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
    /// Server returned an error reply.
    #[error("server error: {message}")]
    Server { message: String },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Address could not be resolved into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl BackendError {
    /// Returns true when the connection that produced this error is in an
    /// unknown state and must not be reused.
    ///
    /// A server error reply is a complete, well-framed response, so the
    /// connection stays usable.
    pub fn is_connection_fault(&self) -> bool {
        !matches!(self, BackendError::Server { .. })
    }
}

/// Failures borrowing from the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became free before the acquisition timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    Exhausted { waited: Duration },
    /// The pool is draining or drained.
    #[error("connection pool closed")]
    Closed,
    /// A fresh connection could not be established.
    #[error("failed to open backend connection: {0}")]
    Connect(#[source] BackendError),
}

/// Outcomes surfaced to gateway callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No connection became free in time; retry with backoff.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// The pool no longer hands out connections.
    #[error("connection pool closed")]
    PoolClosed,
    /// The gateway stopped admitting operations.
    #[error("service shutting down")]
    ServiceShuttingDown,
    /// The backing store could not be reached or misbehaved.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => GatewayError::PoolExhausted,
            PoolError::Closed => GatewayError::PoolClosed,
            PoolError::Connect(err) => GatewayError::BackendUnavailable(err),
        }
    }
}

impl GatewayError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::PoolExhausted => "POOL_EXHAUSTED",
            GatewayError::PoolClosed => "POOL_CLOSED",
            GatewayError::ServiceShuttingDown => "SERVICE_SHUTTING_DOWN",
            GatewayError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
        }
    }
}

/// Internal metrics recording failure. Always swallowed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    /// Latency does not fit the histogram's microsecond counters.
    #[error("latency {0:?} overflows the histogram")]
    LatencyOverflow(Duration),
}

/// Invalid startup configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_connections must be greater than zero")]
    ZeroMaxConnections,
    #[error("min_idle ({min_idle}) exceeds max_connections ({max_connections})")]
    MinIdleAboveMax { min_idle: usize, max_connections: usize },
    #[error("acquire_timeout must be greater than zero")]
    ZeroAcquireTimeout,
    #[error("target_host must not be empty")]
    EmptyHost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_reply_is_not_a_connection_fault() {
        let err = BackendError::Server {
            message: "WRONGTYPE".to_string(),
        };
        assert!(!err.is_connection_fault());
        assert!(BackendError::Protocol.is_connection_fault());
        assert!(BackendError::Timeout(Duration::from_millis(5)).is_connection_fault());
    }

    #[test]
    fn pool_errors_map_to_gateway_errors() {
        let exhausted = PoolError::Exhausted {
            waited: Duration::from_millis(10),
        };
        assert!(matches!(
            GatewayError::from(exhausted),
            GatewayError::PoolExhausted
        ));
        assert!(matches!(
            GatewayError::from(PoolError::Closed),
            GatewayError::PoolClosed
        ));
        let connect = PoolError::Connect(BackendError::Protocol);
        assert!(matches!(
            GatewayError::from(connect),
            GatewayError::BackendUnavailable(BackendError::Protocol)
        ));
    }
}

//! # Caching Gateway Server
//!
//! Purpose: Serve cache reads and writes over HTTP, multiplexing many requests
//! over a bounded pool of backend connections.
//!
//! ## Design Principles
//! 1. **Explicit Ownership**: `LifecycleManager` owns the pool and gateway and
//!    is passed to handlers; nothing lives in a global.
//! 2. **Admission Control**: The pool bounds outstanding backend work.
//! 3. **Observability**: Every operation is counted and timed.
//! 4. **Orderly Shutdown**: Stop admitting, finish in-flight work, close
//!    connections.

pub mod config;
pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod metrics;

pub use config::{Args, BackendKind, GatewayConfig};
pub use gateway::CacheGateway;
pub use lifecycle::{LifecycleManager, LifecycleState, ShutdownReport, StartupError};
pub use metrics::{LatencySnapshot, Metrics, MetricsSnapshot, OperationScope};

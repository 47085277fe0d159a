//! # Caching Gateway Backend Client
//!
//! Purpose: Talk to the backing store over a bounded, FIFO-fair pool of
//! persistent connections.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Strategy Pattern**: `Connector` abstracts the backend so tests can run
//!    against an in-memory store.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod connection;
mod memory;
mod pool;
pub mod resp;

pub use connection::{BackendConnection, Connector, RespConnection, RespConnector};
pub use memory::{MemoryConnection, MemoryConnector};
pub use pool::{ConnectionPool, DrainReport, PoolStats, PooledConnection};

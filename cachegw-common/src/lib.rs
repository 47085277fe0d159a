// cachegw-common - Shared types, configuration and errors for the caching gateway
//
// This crate defines the vocabulary shared by the backend client, the pool
// and the gateway server.

pub mod config;
pub mod error;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use types::*;

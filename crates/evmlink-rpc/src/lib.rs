//! evmlink-rpc crate
//!
//! JSON-RPC connection layer for Ethereum-compatible execution nodes:
//! transports, the typed error taxonomy, and the capability-probing
//! [`Connection`] that the rest of the engine builds on.

pub mod connection;
pub mod errors;
pub mod mock;
pub mod quantity;
pub mod transport;
pub mod types;

pub use connection::{
    BlockId, Connection, ConnectionSettings, Endpoint, NetworkConfig, SnapshotId, TraceApproach,
};
pub use errors::EngineError;
pub use transport::{RpcFailure, Transport};
pub use types::Block;

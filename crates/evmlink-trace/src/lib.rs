//! evmlink-trace crate
//!
//! Execution-trace acquisition and enrichment: raw frames from whichever
//! tracing backend the node supports, normalized call trees, and
//! per-method gas reports.

pub mod calltree;
pub mod engine;
pub mod frame;
pub mod gas;

pub use calltree::{CallTreeNode, CallType, RootCall, StructLogBuilder};
pub use engine::TraceEngine;
pub use frame::TraceFrame;
pub use gas::{gas_report, GasExclusion, GasReport};

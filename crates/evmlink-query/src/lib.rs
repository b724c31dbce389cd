//! evmlink-query crate
//!
//! Long-running chain consumers: the confirmed-block poller with reorg
//! recovery, log polling on top of it, and binary-search queries over
//! chain history.

pub mod history;
pub mod logs;
pub mod poller;

pub use history::{ContractCreation, HistoryQueryEngine};
pub use logs::{fetch_logs_range, LogFilter, LogPoller};
pub use poller::BlockPoller;

//! evmlink-tx crate
//!
//! Transaction lifecycle: fee computation, preparation, submission, and
//! confirmation, plus the receipt data model and cache.

pub mod fees;
pub mod pipeline;
pub mod types;

pub use fees::FeeModel;
pub use pipeline::{TransactionPipeline, TxStage};
pub use types::{AccessListEntry, GasLimit, PendingTransaction, Receipt, TxStatus, TxType};

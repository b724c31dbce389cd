//! Chain data types owned by the connection layer.

use alloy::primitives::B256;
use serde_json::Value;

use crate::errors::EngineError;
use crate::quantity;

/// A confirmed block header, as the engine sees it.
///
/// Identified by the hash+number pair: a reorg produces a different Block
/// at the same number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Block hash.
    pub hash: B256,
    /// Block number.
    pub number: u64,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Timestamp in unix seconds.
    pub timestamp: u64,
    /// Base fee per gas in Wei; 0 on pre-1559 chains.
    pub base_fee: u64,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Number of transactions in the block.
    pub transaction_count: u64,
}

impl Block {
    /// Map a raw `eth_getBlockBy*` result onto the engine type.
    pub fn from_rpc(raw: &Value) -> Result<Self, EngineError> {
        if raw.is_null() {
            return Err(EngineError::BlockNotFound("node returned null".to_string()));
        }
        let transaction_count = raw
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| txs.len() as u64)
            .unwrap_or(0);
        Ok(Self {
            hash: quantity::to_b256(raw.get("hash").unwrap_or(&Value::Null), "block.hash")?,
            number: quantity::to_u64(raw.get("number").unwrap_or(&Value::Null), "block.number")?,
            parent_hash: quantity::to_b256(
                raw.get("parentHash").unwrap_or(&Value::Null),
                "block.parentHash",
            )?,
            timestamp: quantity::to_u64(
                raw.get("timestamp").unwrap_or(&Value::Null),
                "block.timestamp",
            )?,
            base_fee: match raw.get("baseFeePerGas") {
                Some(Value::Null) | None => 0,
                Some(v) => quantity::to_u64(v, "block.baseFeePerGas")?,
            },
            gas_limit: quantity::to_u64(
                raw.get("gasLimit").unwrap_or(&Value::Null),
                "block.gasLimit",
            )?,
            transaction_count,
        })
    }
}

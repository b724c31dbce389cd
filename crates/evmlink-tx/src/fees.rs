//! Fee computation against the connected node.

use serde_json::{json, Value};

use evmlink_rpc::connection::{BlockId, Connection};
use evmlink_rpc::errors::EngineError;
use evmlink_rpc::quantity;

use crate::types::PendingTransaction;

/// Computes fee fields for pending transactions from node fee data.
pub struct FeeModel<'a> {
    connection: &'a Connection,
}

impl<'a> FeeModel<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Current EIP-1559 base fee in Wei.
    ///
    /// Falls back to the latest block's stored base fee when fee history
    /// is unsupported, and to 0 when the chain predates base fees.
    pub async fn base_fee(&self) -> Result<u128, EngineError> {
        match self
            .connection
            .call("eth_feeHistory", json!(["0x1", "pending", []]))
            .await
        {
            Ok(history) => {
                let fees = history
                    .get("baseFeePerGas")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                match fees.last() {
                    Some(last) => quantity::to_u128(last, "baseFeePerGas"),
                    None => self.base_fee_from_latest_block().await,
                }
            }
            Err(EngineError::ApiNotImplemented(_)) => self.base_fee_from_latest_block().await,
            Err(e) => Err(e),
        }
    }

    async fn base_fee_from_latest_block(&self) -> Result<u128, EngineError> {
        // Block::from_rpc already defaults a missing base fee to 0.
        let block = self.connection.get_block(BlockId::Latest).await?;
        Ok(u128::from(block.base_fee))
    }

    /// Node-suggested priority fee (tip) in Wei.
    ///
    /// When the node lacks `eth_maxPriorityFeePerGas` the caller must
    /// supply a tip explicitly; the not-implemented error propagates.
    pub async fn priority_fee(&self) -> Result<u128, EngineError> {
        let raw = self
            .connection
            .call("eth_maxPriorityFeePerGas", json!([]))
            .await?;
        quantity::to_u128(&raw, "maxPriorityFeePerGas")
    }

    /// Node-suggested legacy gas price in Wei.
    pub async fn gas_price(&self) -> Result<u128, EngineError> {
        let raw = self.connection.call("eth_gasPrice", json!([])).await?;
        quantity::to_u128(&raw, "gasPrice")
    }

    /// Ask the node to estimate gas for the fully-formed call.
    ///
    /// Estimation failure is always an error derived from the underlying
    /// revert; a debug trace is attempted only to enrich that error, never
    /// to substitute a gas value.
    pub async fn estimate_gas(&self, txn: &PendingTransaction) -> Result<u64, EngineError> {
        let call_object = txn.to_call_object();
        match self
            .connection
            .call("eth_estimateGas", json!([call_object]))
            .await
        {
            Ok(raw) => quantity::to_u64(&raw, "estimateGas"),
            Err(original) => Err(self.enrich_estimate_failure(call_object, original).await),
        }
    }

    /// Best-effort second signal: replay the call under `debug_traceCall`
    /// to pull out a revert payload the estimate endpoint swallowed.
    async fn enrich_estimate_failure(
        &self,
        call_object: Value,
        original: EngineError,
    ) -> EngineError {
        if matches!(original, EngineError::ContractLogic { .. }) {
            return original;
        }
        match self
            .connection
            .call("debug_traceCall", json!([call_object, "latest", {}]))
            .await
        {
            Ok(trace) if trace.get("failed").and_then(Value::as_bool) == Some(true) => {
                let return_value = trace
                    .get("returnValue")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if return_value.is_empty() {
                    return original;
                }
                tracing::debug!(return_value, "gas estimate enriched from debug trace");
                let data = format!(
                    "0x{}",
                    return_value.trim_start_matches("0x")
                );
                EngineError::ContractLogic {
                    reason: "execution reverted".to_string(),
                    data: data.parse().ok(),
                }
            }
            _ => original,
        }
    }
}

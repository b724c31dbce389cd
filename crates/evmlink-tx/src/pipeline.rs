//! Transaction pipeline: prepare, submit, confirm.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

use evmlink_rpc::connection::{BlockId, Connection};
use evmlink_rpc::errors::EngineError;
use evmlink_rpc::quantity;

use crate::fees::FeeModel;
use crate::types::{AccessListEntry, GasLimit, PendingTransaction, Receipt, TxStatus, TxType};

/// Lifecycle stage of one transaction moving through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStage {
    Unprepared,
    Prepared,
    Submitted,
    Confirmed,
    Failed,
}

/// Seconds between post-receipt transaction-object retries.
const RECEIPT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Drives a transaction from preparation through confirmation.
///
/// Confirmed receipts are cached by hash in an append-only map; a second
/// lookup returns the identical `Arc`.
pub struct TransactionPipeline<'a> {
    connection: &'a Connection,
    receipts: DashMap<B256, Arc<Receipt>>,
    base_fee_multiplier: f64,
    gas_estimate_multiplier: f64,
    acceptance_timeout: Duration,
}

impl<'a> TransactionPipeline<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self {
            connection,
            receipts: DashMap::new(),
            base_fee_multiplier: 1.0,
            gas_estimate_multiplier: 1.0,
            acceptance_timeout: Duration::from_secs(
                connection.config().transaction_acceptance_timeout,
            ),
        }
    }

    /// Headroom applied to the base fee when computing `max_fee`.
    pub fn with_base_fee_multiplier(mut self, multiplier: f64) -> Self {
        self.base_fee_multiplier = multiplier;
        self
    }

    /// Headroom applied to gas estimates under `GasLimit::Auto`.
    pub fn with_gas_estimate_multiplier(mut self, multiplier: f64) -> Self {
        self.gas_estimate_multiplier = multiplier;
        self
    }

    /// Override the receipt-wait timeout derived from network config.
    pub fn with_acceptance_timeout(mut self, timeout: Duration) -> Self {
        self.acceptance_timeout = timeout;
        self
    }

    /// Cached receipt for `hash`, if this pipeline confirmed it.
    pub fn get_receipt(&self, hash: B256) -> Option<Arc<Receipt>> {
        self.receipts.get(&hash).map(|entry| Arc::clone(&entry))
    }

    /// Fill in chain id, fees, access list, and gas limit.
    ///
    /// Deterministic: preparing twice against frozen node state yields
    /// identical fields.
    #[tracing::instrument(skip_all, fields(sender = %txn.sender))]
    pub async fn prepare(&self, txn: &mut PendingTransaction) -> Result<(), EngineError> {
        if txn.is_signed() {
            return Err(EngineError::Transaction(
                "cannot prepare a transaction that already carries a signature".to_string(),
            ));
        }
        if let Some(confirmations) = txn.required_confirmations {
            if confirmations < 0 {
                return Err(EngineError::Transaction(format!(
                    "required_confirmations must be non-negative, got {confirmations}"
                )));
            }
        }

        // The active connection is the authority on chain id.
        let node_chain_id = self.connection.chain_id();
        match txn.chain_id {
            None => txn.chain_id = Some(node_chain_id),
            Some(supplied) if supplied != node_chain_id => {
                return Err(EngineError::Transaction(format!(
                    "chain id mismatch: transaction says {supplied}, node says {node_chain_id}"
                )));
            }
            Some(_) => {}
        }

        if txn.nonce.is_none() {
            txn.nonce = Some(
                self.connection
                    .get_transaction_count(txn.sender, BlockId::Pending)
                    .await?,
            );
        }

        let fees = FeeModel::new(self.connection);
        match txn.tx_type {
            TxType::Legacy | TxType::AccessList => {
                if txn.gas_price.is_none() {
                    txn.gas_price = Some(fees.gas_price().await?);
                }
            }
            TxType::Eip1559 => {
                let tip = match txn.max_priority_fee {
                    Some(tip) => tip,
                    None => {
                        let tip = fees.priority_fee().await?;
                        txn.max_priority_fee = Some(tip);
                        tip
                    }
                };
                if txn.max_fee.is_none() {
                    let base = fees.base_fee().await?;
                    txn.max_fee = Some((base as f64 * self.base_fee_multiplier) as u128 + tip);
                }
            }
        }

        if txn.tx_type == TxType::AccessList && txn.access_list.is_none() {
            self.fill_access_list(txn).await;
        }

        txn.gas_limit = GasLimit::Fixed(self.resolve_gas_limit(txn, &fees).await?);
        tracing::debug!(nonce = ?txn.nonce, gas_limit = ?txn.gas_limit, "transaction prepared");
        Ok(())
    }

    /// Best-effort access-list fill; nodes without the API are ignored.
    async fn fill_access_list(&self, txn: &mut PendingTransaction) {
        let params = json!([txn.to_call_object(), "latest"]);
        match self.connection.call("eth_createAccessList", params).await {
            Ok(result) => {
                let entries = result
                    .get("accessList")
                    .and_then(Value::as_array)
                    .map(|raw| {
                        raw.iter()
                            .map(AccessListEntry::from_rpc)
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .transpose();
                match entries {
                    Ok(Some(entries)) => txn.access_list = Some(entries),
                    _ => tracing::debug!("access list response unusable, leaving unset"),
                }
            }
            Err(e) => tracing::debug!(error = %e, "access list unavailable"),
        }
    }

    async fn resolve_gas_limit(
        &self,
        txn: &PendingTransaction,
        fees: &FeeModel<'_>,
    ) -> Result<u64, EngineError> {
        match txn.gas_limit {
            GasLimit::Fixed(gas) => Ok(gas),
            GasLimit::Max => Ok(self.connection.get_block(BlockId::Latest).await?.gas_limit),
            GasLimit::Auto => {
                let estimate = fees.estimate_gas(txn).await?;
                let padded = (estimate as f64 * self.gas_estimate_multiplier) as u64;
                let ceiling = self.connection.get_block(BlockId::Latest).await?.gas_limit;
                Ok(padded.min(ceiling))
            }
        }
    }

    /// Submit the transaction and return its hash.
    ///
    /// A signed payload goes out raw; otherwise the node is asked to sign
    /// and send, which only works for node-managed accounts. Node-side
    /// rejections are classified and raised immediately.
    #[tracing::instrument(skip_all, fields(sender = %txn.sender))]
    pub async fn submit(&self, txn: &PendingTransaction) -> Result<B256, EngineError> {
        let raw = match &txn.raw_signed {
            Some(payload) => {
                self.connection
                    .call("eth_sendRawTransaction", json!([format!("{payload}")]))
                    .await?
            }
            None => {
                self.connection
                    .call("eth_sendTransaction", json!([txn.to_call_object()]))
                    .await?
            }
        };
        let hash = quantity::to_b256(&raw, "transactionHash")?;
        tracing::info!(%hash, "transaction submitted");
        Ok(hash)
    }

    /// Wait for the receipt, enforce confirmations, and classify failures.
    ///
    /// The receipt is cached before any failure enrichment, so a revert
    /// during enrichment never loses the receipt.
    #[tracing::instrument(skip_all, fields(hash = %txn_hash))]
    pub async fn confirm(
        &self,
        txn_hash: B256,
        txn: &PendingTransaction,
    ) -> Result<Arc<Receipt>, EngineError> {
        let raw_receipt = self.wait_for_receipt(txn_hash).await?;
        let block_number = quantity::to_u64(
            raw_receipt.get("blockNumber").unwrap_or(&Value::Null),
            "receipt.blockNumber",
        )?;
        self.wait_for_confirmations(txn, block_number).await?;
        let gas_limit = self.fetch_transaction_gas(txn_hash).await?;

        let receipt = Arc::new(Receipt::from_rpc(&raw_receipt, gas_limit)?);
        // Cache first; enrichment below may itself error out.
        let cached = Arc::clone(
            &self
                .receipts
                .entry(txn_hash)
                .or_insert_with(|| Arc::clone(&receipt)),
        );

        if cached.status == TxStatus::Failed {
            return Err(self.recover_failure(txn, &cached).await);
        }
        tracing::info!(block_number, "transaction confirmed");
        Ok(cached)
    }

    /// Prepare, submit, and confirm in one motion, walking the
    /// `Unprepared → Prepared → Submitted → Confirmed | Failed` stages.
    pub async fn send(&self, txn: &mut PendingTransaction) -> Result<Arc<Receipt>, EngineError> {
        if !txn.is_signed() {
            self.prepare(txn).await?;
        }
        tracing::debug!(stage = ?TxStage::Prepared, "pipeline advanced");

        let hash = self.submit(txn).await?;
        tracing::debug!(stage = ?TxStage::Submitted, %hash, "pipeline advanced");

        match self.confirm(hash, txn).await {
            Ok(receipt) => {
                tracing::debug!(stage = ?TxStage::Confirmed, "pipeline advanced");
                Ok(receipt)
            }
            Err(e) => {
                tracing::debug!(stage = ?TxStage::Failed, error = %e, "pipeline advanced");
                Err(e)
            }
        }
    }

    async fn wait_for_receipt(&self, txn_hash: B256) -> Result<Value, EngineError> {
        let deadline = Instant::now() + self.acceptance_timeout;
        loop {
            let raw = self
                .connection
                .call("eth_getTransactionReceipt", json!([format!("{txn_hash}")]))
                .await?;
            if raw.is_object() && !raw["blockNumber"].is_null() {
                return Ok(raw);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::TransactionNotFound(format!(
                    "{txn_hash} not mined within {:?}",
                    self.acceptance_timeout
                )));
            }
            sleep(self.poll_interval()).await;
        }
    }

    async fn wait_for_confirmations(
        &self,
        txn: &PendingTransaction,
        block_number: u64,
    ) -> Result<(), EngineError> {
        let required = match txn.required_confirmations {
            Some(n) => n.max(0) as u64,
            None => self.connection.config().required_confirmations,
        };
        if required == 0 {
            return Ok(());
        }
        let deadline = Instant::now() + self.acceptance_timeout;
        loop {
            let head = self.connection.chain_height().await?;
            if head >= block_number + required {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::TransactionNotFound(format!(
                    "timed out waiting for {required} confirmations past block {block_number}"
                )));
            }
            sleep(self.poll_interval()).await;
        }
    }

    /// Read the mined transaction back for its gas limit, tolerating
    /// node-side read-your-own-write lag.
    async fn fetch_transaction_gas(&self, txn_hash: B256) -> Result<u64, EngineError> {
        let retries = self.connection.config().max_receipt_retries;
        for attempt in 0..=retries {
            let raw = self
                .connection
                .call("eth_getTransactionByHash", json!([format!("{txn_hash}")]))
                .await?;
            if raw.is_object() {
                return quantity::to_u64(raw.get("gas").unwrap_or(&Value::Null), "txn.gas");
            }
            if attempt < retries {
                tracing::debug!(attempt = attempt + 1, "transaction object not yet readable");
                sleep(RECEIPT_RETRY_BACKOFF).await;
            }
        }
        Err(EngineError::TransactionNotFound(format!(
            "{txn_hash} has a receipt but no readable transaction object"
        )))
    }

    /// Replay the failed call at its block to recover a revert reason.
    ///
    /// If the replay does not itself revert, the generic failure from the
    /// receipt's status is raised instead.
    async fn recover_failure(&self, txn: &PendingTransaction, receipt: &Receipt) -> EngineError {
        let params = json!([
            txn.to_call_object(),
            quantity::from_u64(receipt.block_number)
        ]);
        match self.connection.call("eth_call", params).await {
            Err(replayed) => replayed,
            Ok(_) => receipt
                .raise_for_status()
                .expect_err("failed receipt must raise"),
        }
    }

    fn poll_interval(&self) -> Duration {
        let block_time = self.connection.config().block_time;
        if block_time == 0 {
            Duration::from_millis(100)
        } else {
            Duration::from_secs((block_time / 2).max(1))
        }
    }
}

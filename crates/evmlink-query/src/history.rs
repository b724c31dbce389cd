//! Binary-search queries over chain history.

use alloy::primitives::{Address, B256};
use serde_json::{json, Value};

use evmlink_rpc::connection::{BlockId, Connection};
use evmlink_rpc::errors::EngineError;
use evmlink_rpc::quantity;
use evmlink_trace::{CallTreeNode, TraceEngine};

/// Where and by whom a contract was deployed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractCreation {
    pub block: u64,
    pub tx_hash: B256,
    /// Transaction origin.
    pub creator: Address,
    /// Deploying contract, when the creation was performed by a contract
    /// other than the origin.
    pub factory: Option<Address>,
}

/// Read-only history queries the RPC does not answer directly.
pub struct HistoryQueryEngine<'a> {
    connection: &'a Connection,
}

impl<'a> HistoryQueryEngine<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Block at which code first exists at `address`, or `None` when the
    /// address holds no code at the latest block.
    ///
    /// Binary search on "does code exist at this block". Assumes code
    /// never reappears after being removed: a selfdestructed-and-redeployed
    /// address yields an arbitrary boundary. This is a documented
    /// limitation of the search, not a recoverable condition.
    #[tracing::instrument(skip_all, fields(address = %address))]
    pub async fn find_creation_block(
        &self,
        address: Address,
    ) -> Result<Option<u64>, EngineError> {
        let latest = self.connection.get_code(address, BlockId::Latest).await?;
        if latest.is_empty() {
            return Ok(None);
        }

        let mut lo = 0u64;
        let mut hi = self.connection.chain_height().await?;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let code = self
                .connection
                .get_code(address, BlockId::Number(mid))
                .await?;
            if code.is_empty() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        tracing::debug!(block = lo, "creation block found");
        Ok(Some(lo))
    }

    /// Full creation record for `address`: block, transaction, origin, and
    /// the factory contract when one deployed it.
    ///
    /// Prefers the `ots_getContractCreator` fast path when the node offers
    /// it; otherwise binary-searches for the creation block and scans its
    /// transactions through the active trace backend.
    #[tracing::instrument(skip_all, fields(address = %address))]
    pub async fn find_creation(
        &self,
        address: Address,
    ) -> Result<Option<ContractCreation>, EngineError> {
        match self
            .connection
            .call("ots_getContractCreator", json!([format!("{address}")]))
            .await
        {
            Ok(Value::Null) => return Ok(None),
            Ok(raw) => return self.creation_from_ots(&raw).await.map(Some),
            Err(e) if e.is_recoverable() => {
                tracing::debug!("no creator fast path, scanning the creation block");
            }
            Err(e) => return Err(e),
        }

        let Some(block) = self.find_creation_block(address).await? else {
            return Ok(None);
        };
        let raw_block = self
            .connection
            .get_block_with_transactions(BlockId::Number(block))
            .await?;
        let empty = Vec::new();
        let transactions = raw_block
            .get("transactions")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let engine = TraceEngine::new(self.connection);
        for tx in transactions {
            let tx_hash = quantity::to_b256(field(tx, "hash"), "hash")?;
            let origin = quantity::to_address(field(tx, "from"), "from")?;

            let tree = engine.call_tree(tx_hash).await?;
            if let Some((_, parent)) = find_create_node(&tree, None, address) {
                let factory = parent.map(|p| p.address).filter(|&f| f != origin);
                return Ok(Some(ContractCreation {
                    block,
                    tx_hash,
                    creator: origin,
                    factory,
                }));
            }

            // Trace backends without call data still expose plain
            // deployments through the receipt.
            if field(tx, "to").is_null() {
                let receipt = self
                    .connection
                    .call("eth_getTransactionReceipt", json!([format!("{tx_hash}")]))
                    .await?;
                let deployed = field(&receipt, "contractAddress")
                    .as_str()
                    .and_then(|a| a.parse::<Address>().ok());
                if deployed == Some(address) {
                    return Ok(Some(ContractCreation {
                        block,
                        tx_hash,
                        creator: origin,
                        factory: None,
                    }));
                }
            }
        }
        tracing::warn!(block, "creation block holds no matching creation");
        Ok(None)
    }

    async fn creation_from_ots(&self, raw: &Value) -> Result<ContractCreation, EngineError> {
        let tx_hash = quantity::to_b256(field(raw, "hash"), "hash")?;
        let creator = quantity::to_address(field(raw, "creator"), "creator")?;
        let receipt = self
            .connection
            .call("eth_getTransactionReceipt", json!([format!("{tx_hash}")]))
            .await?;
        let block = quantity::to_u64(field(&receipt, "blockNumber"), "blockNumber")?;
        Ok(ContractCreation {
            block,
            tx_hash,
            creator,
            factory: None,
        })
    }

    /// Transactions sent by `account` with nonces in `[start_nonce,
    /// stop_nonce]`, searched over blocks `[lo, hi]`, in nonce order.
    ///
    /// Divide and conquer on the account's transaction count at the range
    /// midpoint; each split costs one RPC round trip, so wide nonce
    /// ranges on live networks are warned about rather than refused.
    #[tracing::instrument(skip_all, fields(account = %account, start_nonce, stop_nonce))]
    pub async fn transactions_by_nonce(
        &self,
        account: Address,
        start_nonce: u64,
        stop_nonce: u64,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<Value>, EngineError> {
        if stop_nonce < start_nonce || hi < lo {
            return Ok(Vec::new());
        }
        if !self.connection.config().dev_network && stop_nonce - start_nonce + 1 > 2 {
            tracing::warn!(
                nonces = stop_nonce - start_nonce + 1,
                "wide nonce scan on a live network costs one round trip per split"
            );
        }

        let mut found = Vec::new();
        let mut pending = vec![(lo, hi)];
        while let Some((lo, hi)) = pending.pop() {
            if lo == hi {
                self.collect_block_matches(account, start_nonce, stop_nonce, lo, &mut found)
                    .await?;
                continue;
            }
            let mid = lo + (hi - lo) / 2;
            let count = self
                .connection
                .get_transaction_count(account, BlockId::Number(mid))
                .await?;
            // Nonces below `count` were spent by block `mid` inclusive.
            // Push right first so the left half is searched first.
            if count <= stop_nonce {
                pending.push((mid + 1, hi));
            }
            if count > start_nonce {
                pending.push((lo, mid));
            }
        }
        Ok(found)
    }

    async fn collect_block_matches(
        &self,
        account: Address,
        start_nonce: u64,
        stop_nonce: u64,
        block: u64,
        found: &mut Vec<Value>,
    ) -> Result<(), EngineError> {
        let raw = self
            .connection
            .get_block_with_transactions(BlockId::Number(block))
            .await?;
        let empty = Vec::new();
        let transactions = raw
            .get("transactions")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let mut matches = Vec::new();
        for tx in transactions {
            let sender = field(tx, "from")
                .as_str()
                .and_then(|a| a.parse::<Address>().ok());
            if sender != Some(account) {
                continue;
            }
            let nonce = quantity::to_u64(field(tx, "nonce"), "nonce")?;
            if (start_nonce..=stop_nonce).contains(&nonce) {
                matches.push((nonce, tx.clone()));
            }
        }
        // A block can carry several of the account's transactions.
        matches.sort_by_key(|(nonce, _)| *nonce);
        found.extend(matches.into_iter().map(|(_, tx)| tx));
        Ok(())
    }
}

fn field<'v>(raw: &'v Value, name: &str) -> &'v Value {
    raw.get(name).unwrap_or(&Value::Null)
}

fn find_create_node<'t>(
    node: &'t CallTreeNode,
    parent: Option<&'t CallTreeNode>,
    target: Address,
) -> Option<(&'t CallTreeNode, Option<&'t CallTreeNode>)> {
    if node.call_type.is_create() && node.address == target {
        return Some((node, parent));
    }
    node.children
        .iter()
        .find_map(|child| find_create_node(child, Some(node), target))
}

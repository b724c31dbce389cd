//! Trace acquisition: backend discovery and call-tree fetching.

use alloy::primitives::{Address, B256};
use serde_json::json;

use evmlink_rpc::connection::{Connection, TraceApproach};
use evmlink_rpc::errors::EngineError;
use evmlink_rpc::quantity;

use crate::calltree::{self, CallTreeNode, CallType, RootCall};
use crate::frame::TraceFrame;
use crate::gas::{self, GasExclusion, GasReport};

/// Discovery order: richest backend first, opcode-level reconstruction
/// last because it is the most failure-prone, bare receipt data as the
/// floor that always works.
const DISCOVERY_ORDER: [TraceApproach; 4] = [
    TraceApproach::Parity,
    TraceApproach::GethCallTracer,
    TraceApproach::GethStructLog,
    TraceApproach::Basic,
];

/// Fetches execution traces through whichever backend the connected node
/// supports, discovered once and then fixed for the session.
pub struct TraceEngine<'a> {
    connection: &'a Connection,
}

impl<'a> TraceEngine<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Normalized call tree for a mined transaction.
    ///
    /// The first call per session walks the discovery ladder; later calls
    /// reuse the fixed approach without re-probing.
    #[tracing::instrument(skip_all, fields(tx = %tx_hash))]
    pub async fn call_tree(&self, tx_hash: B256) -> Result<CallTreeNode, EngineError> {
        if let Some(approach) = self.connection.trace_approach() {
            return self.fetch(approach, tx_hash).await;
        }

        if let Some(known) = approach_for_client(self.connection.client_version()) {
            let fixed = self.connection.fix_trace_approach(known);
            tracing::debug!(
                client = self.connection.client_version(),
                approach = ?fixed,
                "trace approach known for this client"
            );
            return self.fetch(fixed, tx_hash).await;
        }

        let mut last = None;
        for approach in DISCOVERY_ORDER {
            match self.fetch(approach, tx_hash).await {
                Ok(tree) => {
                    let fixed = self.connection.fix_trace_approach(approach);
                    tracing::debug!(approach = ?fixed, "trace approach discovered");
                    return Ok(tree);
                }
                Err(e) if e.is_recoverable() => {
                    tracing::debug!(approach = ?approach, error = %e, "backend unavailable");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            EngineError::ApiNotImplemented("no tracing backend available".to_string())
        }))
    }

    /// Per-method gas report for a transaction, honoring exclusions.
    pub async fn gas_report(
        &self,
        tx_hash: B256,
        exclusions: &[GasExclusion],
    ) -> Result<GasReport, EngineError> {
        let tree = self.call_tree(tx_hash).await?;
        Ok(gas::gas_report(&tree, exclusions))
    }

    async fn fetch(
        &self,
        approach: TraceApproach,
        tx_hash: B256,
    ) -> Result<CallTreeNode, EngineError> {
        match approach {
            TraceApproach::Parity => self.fetch_parity(tx_hash).await,
            TraceApproach::GethCallTracer => self.fetch_call_tracer(tx_hash).await,
            TraceApproach::GethStructLog => self.fetch_struct_logs(tx_hash).await,
            TraceApproach::Basic => self.fetch_basic(tx_hash).await,
        }
    }

    async fn fetch_parity(&self, tx_hash: B256) -> Result<CallTreeNode, EngineError> {
        let raw = self
            .connection
            .call("trace_transaction", json!([format!("{tx_hash}")]))
            .await?;
        let items = raw.as_array().ok_or_else(|| EngineError::Provider {
            code: 0,
            message: "trace_transaction did not return an array".to_string(),
            data: None,
        })?;
        calltree::from_parity(items)
    }

    async fn fetch_call_tracer(&self, tx_hash: B256) -> Result<CallTreeNode, EngineError> {
        let raw = self
            .connection
            .call(
                "debug_traceTransaction",
                json!([format!("{tx_hash}"), {"tracer": "callTracer"}]),
            )
            .await?;
        calltree::from_call_tracer(&raw)
    }

    async fn fetch_struct_logs(&self, tx_hash: B256) -> Result<CallTreeNode, EngineError> {
        let (root, _) = self.root_info(tx_hash).await?;
        let mut stream = self
            .connection
            .stream(
                "debug_traceTransaction",
                json!([
                    format!("{tx_hash}"),
                    {"disableMemory": true, "disableStorage": true}
                ]),
                "result.structLogs",
            )
            .await?;

        // Frames fold into the tree as they arrive; opcode traces are far
        // too large to hold as a frame vector.
        let mut builder = calltree::StructLogBuilder::new(root);
        while let Some(item) = stream.next().await {
            let raw = item?;
            let frame: TraceFrame =
                serde_json::from_value(raw).map_err(|e| EngineError::Provider {
                    code: 0,
                    message: format!("unusable struct log frame: {e}"),
                    data: None,
                })?;
            builder.push(frame);
        }
        Ok(builder.finish())
    }

    /// No tracing support at all: reconstruct only the root call from the
    /// transaction and its receipt.
    async fn fetch_basic(&self, tx_hash: B256) -> Result<CallTreeNode, EngineError> {
        let (root, gas_used) = self.root_info(tx_hash).await?;
        let mut node = CallTreeNode::new(root.address, root.call_type);
        node.calldata = root.calldata;
        node.value = root.value;
        node.failed = root.failed;
        node.gas_cost = gas_used;
        Ok(node)
    }

    /// Root-call template plus receipt gas, shared by the struct-log and
    /// basic strategies.
    async fn root_info(&self, tx_hash: B256) -> Result<(RootCall, u64), EngineError> {
        let hash = format!("{tx_hash}");
        let tx = self
            .connection
            .call("eth_getTransactionByHash", json!([hash]))
            .await?;
        if tx.is_null() {
            return Err(EngineError::TransactionNotFound(hash));
        }
        let receipt = self
            .connection
            .call("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if receipt.is_null() {
            return Err(EngineError::TransactionNotFound(hash));
        }

        let (address, call_type) = match tx.get("to").filter(|to| !to.is_null()) {
            Some(to) => (quantity::to_address(to, "to")?, CallType::Call),
            // Contract creation; the receipt names the deployed address.
            None => {
                let deployed = receipt
                    .get("contractAddress")
                    .filter(|a| !a.is_null())
                    .map(|a| quantity::to_address(a, "contractAddress"))
                    .transpose()?
                    .unwrap_or(Address::ZERO);
                (deployed, CallType::Create)
            }
        };

        let root = RootCall {
            address,
            call_type,
            calldata: tx
                .get("input")
                .map(|v| quantity::to_bytes(v, "input"))
                .transpose()?
                .unwrap_or_default(),
            value: tx
                .get("value")
                .filter(|v| !v.is_null())
                .map(|v| quantity::to_u256(v, "value"))
                .transpose()?
                .unwrap_or_default(),
            failed: receipt
                .get("status")
                .filter(|v| !v.is_null())
                .map(|v| quantity::to_u64(v, "status"))
                .transpose()?
                == Some(0),
        };
        let gas_used = receipt
            .get("gasUsed")
            .filter(|v| !v.is_null())
            .map(|v| quantity::to_u64(v, "gasUsed"))
            .transpose()?
            .unwrap_or(0);
        Ok((root, gas_used))
    }
}

/// Known-good approaches for well-known clients, keyed by version string.
fn approach_for_client(version: &str) -> Option<TraceApproach> {
    let version = version.to_ascii_lowercase();
    if version.contains("erigon") || version.contains("reth") || version.contains("openethereum") {
        Some(TraceApproach::Parity)
    } else if version.contains("geth") {
        Some(TraceApproach::GethCallTracer)
    } else if version.contains("hardhat") || version.contains("ganache") {
        Some(TraceApproach::GethStructLog)
    } else {
        None
    }
}

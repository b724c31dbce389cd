//! Node connection: transport ownership, capability probing, and the
//! `call`/`stream` primitives everything else is built on.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::errors::{classify, EngineError};
use crate::quantity;
use crate::transport::{HttpTransport, IpcTransport, RpcFailure, Transport};
use crate::types::Block;

/// Where the node lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// HTTP(S) JSON-RPC endpoint URI.
    Http(String),
    /// Local socket path.
    Ipc(PathBuf),
}

/// Connection-scoped settings. Immutable once connected; changing them
/// means disconnecting and connecting again.
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub endpoint: Endpoint,
    /// Bounded fan-out width for ranged queries.
    pub concurrency: usize,
    /// Block-range page size for ranged queries.
    pub page_size: u64,
}

impl ConnectionSettings {
    pub fn http(url: &str) -> Self {
        Self {
            endpoint: Endpoint::Http(url.to_string()),
            concurrency: 8,
            page_size: 100,
        }
    }

    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::Ipc(path.into()),
            concurrency: 8,
            page_size: 100,
        }
    }
}

/// Per-network behavior knobs. Loading and merging config files is the
/// caller's concern; this is just the deserialized shape.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Expected seconds between blocks; 0 on instamine dev chains.
    pub block_time: u64,
    /// Default confirmations before a block or receipt counts as final.
    pub required_confirmations: u64,
    /// Seconds to wait for a submitted transaction's receipt.
    pub transaction_acceptance_timeout: u64,
    /// Post-receipt `eth_getTransactionByHash` retries (1s backoff each).
    pub max_receipt_retries: u32,
    /// Marks fast local development networks.
    pub dev_network: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            block_time: 12,
            required_confirmations: 2,
            transaction_acceptance_timeout: 120,
            max_receipt_retries: 3,
            dev_network: false,
        }
    }
}

impl NetworkConfig {
    /// Preset for instamine development chains.
    pub fn dev() -> Self {
        Self {
            block_time: 0,
            required_confirmations: 0,
            transaction_acceptance_timeout: 60,
            max_receipt_retries: 3,
            dev_network: true,
        }
    }

    /// How long a silent chain may stay silent before polling errors out.
    pub fn poll_timeout(&self) -> Duration {
        if self.dev_network || self.block_time == 0 {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(50 * self.block_time)
        }
    }
}

/// Which tracing backend the connected node supports. Discovered once per
/// connection by the trace engine and fixed for the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceApproach {
    /// `trace_transaction` flat traces.
    Parity,
    /// `debug_traceTransaction` with the call tracer.
    GethCallTracer,
    /// `debug_traceTransaction` opcode-level struct logs.
    GethStructLog,
    /// No tracing; only the root call can be reconstructed.
    Basic,
}

/// Opaque revert point on a dev/test backend. Only meaningful within the
/// connection that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotId(pub String);

/// Block selector for read calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Latest,
    Pending,
}

impl BlockId {
    pub fn to_param(self) -> Value {
        match self {
            BlockId::Number(n) => Value::String(quantity::from_u64(n)),
            BlockId::Latest => Value::String("latest".to_string()),
            BlockId::Pending => Value::String("pending".to_string()),
        }
    }
}

/// A live session against one node.
///
/// Capability state (client version, chain id, proof-of-authority flag,
/// trace approach) is scoped to the session: written at most once, read
/// many times, and gone when the connection is dropped.
pub struct Connection {
    transport: Box<dyn Transport>,
    settings: ConnectionSettings,
    config: NetworkConfig,
    chain_id: u64,
    client_version: String,
    poa: bool,
    trace_approach: OnceLock<TraceApproach>,
}

impl Connection {
    /// Open the transport named by `settings` and probe the node.
    #[tracing::instrument(skip_all, fields(endpoint = ?settings.endpoint))]
    pub async fn connect(
        settings: ConnectionSettings,
        config: NetworkConfig,
    ) -> Result<Self, EngineError> {
        let transport: Box<dyn Transport> = match &settings.endpoint {
            Endpoint::Http(url) => Box::new(
                HttpTransport::new(url).map_err(|e| connection_failure("eth_chainId", e))?,
            ),
            Endpoint::Ipc(path) => Box::new(
                IpcTransport::connect(path.clone())
                    .await
                    .map_err(|e| connection_failure("eth_chainId", e))?,
            ),
        };
        Self::with_transport(transport, settings, config).await
    }

    /// Build a session over an already-open transport (IPC handed over by
    /// a supervisor, or the in-process test backend).
    pub async fn with_transport(
        transport: Box<dyn Transport>,
        settings: ConnectionSettings,
        config: NetworkConfig,
    ) -> Result<Self, EngineError> {
        let mut connection = Self {
            transport,
            settings,
            config,
            chain_id: 0,
            client_version: String::new(),
            poa: false,
            trace_approach: OnceLock::new(),
        };
        connection.probe().await?;
        Ok(connection)
    }

    /// One-time capability probe: chain id (required), client identity and
    /// proof-of-authority detection (best effort).
    async fn probe(&mut self) -> Result<(), EngineError> {
        let raw = self.call("eth_chainId", json!([])).await?;
        self.chain_id = quantity::to_u64(&raw, "chainId")?;

        self.client_version = match self.call("web3_clientVersion", json!([])).await {
            Ok(v) => v.as_str().unwrap_or("unknown").to_string(),
            Err(EngineError::ApiNotImplemented(_)) => "unknown".to_string(),
            Err(e) => return Err(e),
        };

        // Clique-style PoA seals a signature into extraData and mines at
        // zero difficulty.
        self.poa = match self.call("eth_getBlockByNumber", json!(["latest", false])).await {
            Ok(raw) if raw.is_object() => {
                let difficulty = raw
                    .get("difficulty")
                    .map(|d| quantity::to_u256(d, "difficulty").unwrap_or(U256::ZERO))
                    .unwrap_or(U256::ZERO);
                let extra_len = raw
                    .get("extraData")
                    .and_then(Value::as_str)
                    .map(str::len)
                    .unwrap_or(0);
                difficulty.is_zero() && extra_len > 66
            }
            _ => false,
        };

        tracing::info!(
            chain_id = self.chain_id,
            client = %self.client_version,
            poa = self.poa,
            endpoint = %self.transport.endpoint(),
            "connected to node"
        );
        Ok(())
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn is_poa(&self) -> bool {
        self.poa
    }

    /// The tracing backend fixed for this session, if discovered yet.
    pub fn trace_approach(&self) -> Option<TraceApproach> {
        self.trace_approach.get().copied()
    }

    /// Fix the tracing backend for the remainder of the session. The first
    /// writer wins; later calls return the already-fixed mode.
    pub fn fix_trace_approach(&self, approach: TraceApproach) -> TraceApproach {
        *self.trace_approach.get_or_init(|| approach)
    }

    /// Issue one JSON-RPC request, returning the `result` payload.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        tracing::trace!(method, "rpc call");
        self.transport
            .request(method, params)
            .await
            .map_err(|failure| classify(method, failure))
    }

    /// Issue one request whose result holds a large array at `item_path`,
    /// receiving items incrementally.
    pub async fn stream(
        &self,
        method: &str,
        params: Value,
        item_path: &str,
    ) -> Result<ValueStream, EngineError> {
        tracing::trace!(method, item_path, "rpc stream");
        let rx = self
            .transport
            .request_stream(method, params, item_path)
            .await
            .map_err(|failure| classify(method, failure))?;
        Ok(ValueStream {
            method: method.to_string(),
            rx,
        })
    }

    /// Release the transport. Capability state dies with the session and
    /// is rediscovered after the next connect.
    pub fn disconnect(self) {
        tracing::info!(endpoint = %self.transport.endpoint(), "disconnecting");
    }

    /// Current head number.
    pub async fn chain_height(&self) -> Result<u64, EngineError> {
        let raw = self.call("eth_blockNumber", json!([])).await?;
        quantity::to_u64(&raw, "blockNumber")
    }

    /// Fetch a block header by selector.
    pub async fn get_block(&self, id: BlockId) -> Result<Block, EngineError> {
        let raw = self
            .call("eth_getBlockByNumber", json!([id.to_param(), false]))
            .await?;
        if raw.is_null() {
            return Err(EngineError::BlockNotFound(format!("{id:?}")));
        }
        Block::from_rpc(&raw)
    }

    /// Fetch a block header by hash.
    pub async fn get_block_by_hash(&self, hash: B256) -> Result<Block, EngineError> {
        let raw = self
            .call("eth_getBlockByHash", json!([format!("{hash}"), false]))
            .await?;
        if raw.is_null() {
            return Err(EngineError::BlockNotFound(format!("{hash}")));
        }
        Block::from_rpc(&raw)
    }

    /// Raw block payload including full transaction objects.
    pub async fn get_block_with_transactions(&self, id: BlockId) -> Result<Value, EngineError> {
        let raw = self
            .call("eth_getBlockByNumber", json!([id.to_param(), true]))
            .await?;
        if raw.is_null() {
            return Err(EngineError::BlockNotFound(format!("{id:?}")));
        }
        Ok(raw)
    }

    /// Deployed code at `address`, empty when none.
    pub async fn get_code(&self, address: Address, id: BlockId) -> Result<Bytes, EngineError> {
        let raw = self
            .call("eth_getCode", json!([format!("{address}"), id.to_param()]))
            .await?;
        quantity::to_bytes(&raw, "code")
    }

    /// Storage slot value at `address`.
    pub async fn get_storage_at(
        &self,
        address: Address,
        slot: U256,
        id: BlockId,
    ) -> Result<U256, EngineError> {
        let raw = self
            .call(
                "eth_getStorageAt",
                json!([format!("{address}"), quantity::from_u256(slot), id.to_param()]),
            )
            .await?;
        quantity::to_u256(&raw, "storage")
    }

    /// Transactions ever sent by `address` as of the selected block, i.e.
    /// the account's next nonce at that point.
    pub async fn get_transaction_count(
        &self,
        address: Address,
        id: BlockId,
    ) -> Result<u64, EngineError> {
        let raw = self
            .call(
                "eth_getTransactionCount",
                json!([format!("{address}"), id.to_param()]),
            )
            .await?;
        quantity::to_u64(&raw, "transactionCount")
    }

    /// Take a state snapshot on a dev/test backend.
    pub async fn snapshot(&self) -> Result<SnapshotId, EngineError> {
        let raw = self.call("evm_snapshot", json!([])).await?;
        let token = match raw {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(SnapshotId(token))
    }

    /// Revert a dev/test backend to a prior snapshot.
    pub async fn revert(&self, id: &SnapshotId) -> Result<bool, EngineError> {
        let raw = self.call("evm_revert", json!([id.0])).await?;
        Ok(raw.as_bool().unwrap_or(false))
    }
}

fn connection_failure(method: &str, failure: RpcFailure) -> EngineError {
    match classify(method, failure) {
        EngineError::ApiNotImplemented(m) => EngineError::Connection(format!(
            "endpoint rejected {m} during connect"
        )),
        other @ EngineError::Connection(_) => other,
        other => EngineError::Connection(other.to_string()),
    }
}

/// Incremental items from [`Connection::stream`].
pub struct ValueStream {
    method: String,
    rx: mpsc::Receiver<Result<Value, RpcFailure>>,
}

impl ValueStream {
    /// Next array item, or `None` once the array closes.
    pub async fn next(&mut self) -> Option<Result<Value, EngineError>> {
        self.rx
            .recv()
            .await
            .map(|item| item.map_err(|failure| classify(&self.method, failure)))
    }
}

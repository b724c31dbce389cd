//! Shared test helpers and utilities.
//!
//! Provides a scripted fake chain over the mock transport plus factory
//! functions for building test transactions and receipts with sensible
//! defaults.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use serde_json::{json, Value};

use evmlink_rpc::connection::{Connection, ConnectionSettings, NetworkConfig};
use evmlink_rpc::mock::MockTransport;
use evmlink_rpc::transport::RpcFailure;

/// Route engine tracing into the test harness output. Safe to call from
/// every test; only the first caller installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A growable scripted chain served through a [`MockTransport`].
///
/// Block `n`'s hash is derived from its number and a per-block seed, so
/// replacing a seed simulates a reorg: same number, different hash.
/// Clones share the chain, letting a test mutate it while a poller runs.
#[derive(Clone)]
pub struct FakeChain {
    pub transport: MockTransport,
    seeds: Arc<Mutex<Vec<u8>>>,
}

impl FakeChain {
    /// Chain holding the genesis block only.
    pub fn new() -> Self {
        let transport = MockTransport::new();
        transport.respond_with("eth_chainId", json!("0x1"));
        transport.respond_with("web3_clientVersion", json!("test-node/0.1"));

        let seeds: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(vec![0]));
        let heights = seeds.clone();
        transport.respond_using("eth_blockNumber", move |_| {
            let len = heights.lock().unwrap().len() as u64;
            Ok(json!(format!("0x{:x}", len - 1)))
        });
        let headers = seeds.clone();
        transport.respond_using("eth_getBlockByNumber", move |params| {
            let number = match params[0].as_str().unwrap_or_default() {
                "latest" | "pending" => headers.lock().unwrap().len() as u64 - 1,
                hex => u64::from_str_radix(hex.trim_start_matches("0x"), 16)
                    .map_err(|e| RpcFailure::Transport(e.to_string()))?,
            };
            let seeds = headers.lock().unwrap();
            match seeds.get(number as usize) {
                Some(seed) => Ok(block_header(number, *seed)),
                None => Ok(Value::Null),
            }
        });
        Self { transport, seeds }
    }

    /// Append `count` blocks immediately.
    pub fn extend(&self, count: usize) {
        let mut seeds = self.seeds.lock().unwrap();
        for _ in 0..count {
            seeds.push(0);
        }
    }

    /// Append `count` blocks, one every 200ms, from a background task.
    /// Meant for paused-clock tests that poll while the chain grows.
    pub fn extend_slowly(&self, count: usize) {
        let seeds = self.seeds.clone();
        tokio::spawn(async move {
            for _ in 0..count {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                seeds.lock().unwrap().push(0);
            }
        });
    }

    /// Replace block `number` on a competing branch: the number stays,
    /// the hash changes.
    pub fn reorg(&self, number: u64, new_seed: u8) {
        self.seeds.lock().unwrap()[number as usize] = new_seed;
    }

    pub fn height(&self) -> u64 {
        self.seeds.lock().unwrap().len() as u64 - 1
    }

    /// Connect a session to this chain on a dev-network config.
    pub async fn connect(&self) -> Connection {
        Connection::with_transport(
            Box::new(self.transport.clone()),
            ConnectionSettings::http("http://localhost:8545"),
            NetworkConfig::dev(),
        )
        .await
        .expect("probe against the fake chain should succeed")
    }
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic block header for the fake chain.
pub fn block_header(number: u64, seed: u8) -> Value {
    json!({
        "hash": format!("0x{:062x}{:02x}", number, seed),
        "number": format!("0x{number:x}"),
        "parentHash": format!("0x{:064x}", number.saturating_sub(1)),
        "timestamp": format!("0x{:x}", 1_700_000_000 + number * 12),
        "gasLimit": "0x1c9c380",
        "baseFeePerGas": "0x64",
        "transactions": [],
    })
}

/// Well-known dev-account sender address.
pub fn sample_sender() -> Address {
    "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".parse().unwrap()
}

/// Receipt payload as `eth_getTransactionReceipt` returns it.
///
/// # Arguments
/// * `hash` - transaction hash, `0x`-prefixed
/// * `status` - 1 for success, 0 for failure
/// * `gas_used` - gas actually consumed
pub fn sample_receipt(hash: &str, status: u64, gas_used: u64) -> Value {
    json!({
        "transactionHash": hash,
        "blockHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
        "blockNumber": "0xa",
        "gasUsed": format!("0x{gas_used:x}"),
        "effectiveGasPrice": "0x4a817c800",
        "status": format!("0x{status:x}"),
        "from": format!("{}", sample_sender()),
        "to": "0x70997970c51812e339d9b73b0245ad59e15ebbf9",
        "contractAddress": null,
        "logs": [],
    })
}

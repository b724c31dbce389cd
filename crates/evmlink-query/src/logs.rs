//! Log polling and ranged log fetching.

use std::collections::VecDeque;

use alloy::primitives::{Address, B256};
use futures::future::try_join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use evmlink_rpc::connection::Connection;
use evmlink_rpc::errors::EngineError;
use evmlink_rpc::quantity;

use crate::poller::BlockPoller;

/// Address/topic constraints for `eth_getLogs`.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub address: Option<Address>,
    /// Positional topic constraints; `None` entries match anything.
    pub topics: Vec<Option<B256>>,
    /// First block of interest. When it lies behind the head, the poller
    /// backfills the gap through a ranged fetch before following live.
    pub start_block: Option<u64>,
}

impl LogFilter {
    pub fn for_address(address: Address) -> Self {
        Self {
            address: Some(address),
            topics: Vec::new(),
            start_block: None,
        }
    }

    pub fn with_topic(mut self, position: usize, topic: B256) -> Self {
        if self.topics.len() <= position {
            self.topics.resize(position + 1, None);
        }
        self.topics[position] = Some(topic);
        self
    }

    pub fn from_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    /// Filter object for an inclusive block range.
    pub fn to_params(&self, from: u64, to: u64) -> Value {
        let mut filter = json!({
            "fromBlock": quantity::from_u64(from),
            "toBlock": quantity::from_u64(to),
        });
        if let Some(address) = self.address {
            filter["address"] = json!(format!("{address}"));
        }
        if !self.topics.is_empty() {
            filter["topics"] = self
                .topics
                .iter()
                .map(|t| match t {
                    Some(topic) => json!(format!("{topic}")),
                    None => Value::Null,
                })
                .collect();
        }
        filter
    }
}

/// Matching logs for one confirmed block at a time, in block order.
///
/// Built on [`BlockPoller`], so reorg recovery and the idle timeout come
/// for free; a re-yielded block simply has its logs fetched again. A
/// filter starting behind the head is backfilled through
/// [`fetch_logs_range`] up to the poller's confirmed anchor, then the
/// live loop takes over from the next block.
pub struct LogPoller<'a> {
    connection: &'a Connection,
    filter: LogFilter,
    blocks: BlockPoller<'a>,
    buffered: VecDeque<Value>,
    catch_up_from: Option<u64>,
}

impl<'a> LogPoller<'a> {
    /// Start polling. A `stop_block` must be strictly beyond the current
    /// head; a boundary already in the past is a caller mistake and fails
    /// immediately instead of yielding a partial range.
    pub async fn new(
        connection: &'a Connection,
        filter: LogFilter,
        stop_block: Option<u64>,
    ) -> Result<LogPoller<'a>, EngineError> {
        let mut blocks = BlockPoller::new(connection);
        if let Some(stop) = stop_block {
            let head = connection.chain_height().await?;
            if stop <= head {
                return Err(EngineError::Provider {
                    code: 0,
                    message: format!(
                        "stop block {stop} is not beyond the current head {head}"
                    ),
                    data: None,
                });
            }
            blocks = blocks.stop_at(stop);
        }
        let catch_up_from = filter.start_block;
        Ok(Self {
            connection,
            filter,
            blocks,
            buffered: VecDeque::new(),
            catch_up_from,
        })
    }

    /// Next matching log, or `None` once the stop block has been passed.
    pub async fn next(&mut self) -> Result<Option<Value>, EngineError> {
        if let Some(start) = self.catch_up_from.take() {
            // Anchor the live poller first so the two ranges meet exactly.
            let confirmed = self.blocks.prime().await?;
            if start <= confirmed {
                tracing::debug!(from = start, to = confirmed, "catching up on past logs");
                let logs =
                    fetch_logs_range(self.connection, &self.filter, start, confirmed).await?;
                self.buffered.extend(logs);
            }
        }
        loop {
            if let Some(log) = self.buffered.pop_front() {
                return Ok(Some(log));
            }
            match self.blocks.next().await? {
                Some(block) => {
                    if block.number < self.filter.start_block.unwrap_or(0) {
                        continue;
                    }
                    let logs = get_logs(
                        self.connection,
                        &self.filter,
                        block.number,
                        block.number,
                    )
                    .await?;
                    tracing::debug!(block = block.number, count = logs.len(), "fetched logs");
                    self.buffered.extend(logs);
                }
                None => return Ok(None),
            }
        }
    }
}

/// Fetch all matching logs in `[from, to]`, fanning out page-sized range
/// requests under the connection's concurrency bound and joining the
/// results back in range order.
#[tracing::instrument(skip(connection, filter))]
pub async fn fetch_logs_range(
    connection: &Connection,
    filter: &LogFilter,
    from: u64,
    to: u64,
) -> Result<Vec<Value>, EngineError> {
    if to < from {
        return Ok(Vec::new());
    }
    let page_size = connection.settings().page_size.max(1);
    let semaphore = Semaphore::new(connection.settings().concurrency.max(1));

    let mut pages = Vec::new();
    let mut lo = from;
    while lo <= to {
        let hi = to.min(lo.saturating_add(page_size - 1));
        pages.push((lo, hi));
        lo = hi + 1;
    }

    let fetches = pages.into_iter().map(|(lo, hi)| {
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| EngineError::Connection(e.to_string()))?;
            get_logs(connection, filter, lo, hi).await
        }
    });
    // try_join_all keeps page order regardless of completion order.
    let results = try_join_all(fetches).await?;
    Ok(results.into_iter().flatten().collect())
}

async fn get_logs(
    connection: &Connection,
    filter: &LogFilter,
    from: u64,
    to: u64,
) -> Result<Vec<Value>, EngineError> {
    let raw = connection
        .call("eth_getLogs", json!([filter.to_params(from, to)]))
        .await?;
    raw.as_array().cloned().ok_or_else(|| EngineError::Provider {
        code: 0,
        message: "eth_getLogs did not return an array".to_string(),
        data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use evmlink_rpc::connection::{ConnectionSettings, NetworkConfig};
    use evmlink_rpc::mock::MockTransport;

    fn sample_address() -> Address {
        Address::repeat_byte(0x42)
    }

    async fn connect(mock: MockTransport) -> Connection {
        mock.respond_with("eth_chainId", json!("0x1"));
        mock.respond_with("web3_clientVersion", json!("test-node/0.1"));
        Connection::with_transport(
            Box::new(mock),
            ConnectionSettings::http("http://localhost:8545"),
            NetworkConfig::dev(),
        )
        .await
        .expect("probe should succeed")
    }

    #[test]
    fn filter_params_cover_range_address_and_topics() {
        let topic = B256::repeat_byte(0x01);
        let filter = LogFilter::for_address(sample_address()).with_topic(1, topic);
        let params = filter.to_params(16, 32);
        assert_eq!(params["fromBlock"], json!("0x10"));
        assert_eq!(params["toBlock"], json!("0x20"));
        assert_eq!(params["address"], json!(format!("{}", sample_address())));
        assert_eq!(params["topics"], json!([null, format!("{topic}")]));
    }

    #[tokio::test]
    async fn past_stop_block_fails_fast() {
        let mock = MockTransport::new();
        mock.respond_with("eth_blockNumber", json!("0x64"));
        let conn = connect(mock).await;

        match LogPoller::new(&conn, LogFilter::default(), Some(0x64)).await {
            Err(EngineError::Provider { message, .. }) => {
                assert!(message.contains("not beyond"), "{message}");
            }
            other => panic!("expected fail-fast, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn range_fetch_joins_pages_in_order() {
        let mock = MockTransport::new();
        let served: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let record = served.clone();
        mock.respond_using("eth_getLogs", move |params| {
            let from = params[0]["fromBlock"].as_str().unwrap_or_default();
            let from = u64::from_str_radix(from.trim_start_matches("0x"), 16).unwrap_or(0);
            record.lock().unwrap().push(from);
            Ok(json!([{"blockNumber": format!("0x{from:x}")}]))
        });
        let conn = connect(mock).await;
        // page_size is 100, so [0, 250] splits into three pages.
        let logs = fetch_logs_range(&conn, &LogFilter::default(), 0, 250)
            .await
            .expect("ranged fetch");

        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0]["blockNumber"], json!("0x0"));
        assert_eq!(logs[1]["blockNumber"], json!("0x64"));
        assert_eq!(logs[2]["blockNumber"], json!("0xc8"));
        assert_eq!(served.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn past_blocks_are_backfilled_before_live_polling() {
        let mock = MockTransport::new();
        // One log per block in the requested range.
        mock.respond_using("eth_getLogs", |params| {
            let bound = |v: &Value| {
                u64::from_str_radix(
                    v.as_str().unwrap_or_default().trim_start_matches("0x"),
                    16,
                )
                .unwrap_or(0)
            };
            let from = bound(&params[0]["fromBlock"]);
            let to = bound(&params[0]["toBlock"]);
            Ok(Value::Array(
                (from..=to)
                    .map(|n| json!({"blockNumber": format!("0x{n:x}")}))
                    .collect(),
            ))
        });
        let chain: Arc<Mutex<u64>> = Arc::new(Mutex::new(5));
        let height = chain.clone();
        mock.respond_using("eth_blockNumber", move |_| {
            Ok(json!(format!("0x{:x}", *height.lock().unwrap())))
        });
        mock.respond_using("eth_getBlockByNumber", |params| {
            let tag = params[0].as_str().unwrap_or_default();
            Ok(json!({
                "hash": format!("0x{:0>64}", tag.trim_start_matches("0x")),
                "number": tag,
                "parentHash": format!("0x{:064x}", 0),
                "timestamp": "0x0",
                "gasLimit": "0x1c9c380",
                "transactions": [],
            }))
        });
        let conn = connect(mock).await;

        let filter = LogFilter::default().from_block(1);
        let mut poller = LogPoller::new(&conn, filter, Some(7))
            .await
            .expect("stop block is ahead of the head");
        {
            let chain = chain.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    *chain.lock().unwrap() += 1;
                }
            });
        }

        let mut blocks = Vec::new();
        while let Some(log) = poller.next().await.expect("poll ok") {
            blocks.push(log["blockNumber"].as_str().unwrap_or_default().to_string());
        }
        // [1, 5] arrives from the backfill, 6 and 7 from the live loop.
        assert_eq!(blocks, vec!["0x1", "0x2", "0x3", "0x4", "0x5", "0x6", "0x7"]);
    }

    #[tokio::test(start_paused = true)]
    async fn logs_come_back_in_block_order() {
        let mock = MockTransport::new();
        mock.respond_using("eth_getLogs", |params| {
            let from = params[0]["fromBlock"].as_str().unwrap_or_default().to_string();
            Ok(json!([{"blockNumber": from, "logIndex": "0x0"}]))
        });
        let chain: Arc<Mutex<u64>> = Arc::new(Mutex::new(0));
        let height = chain.clone();
        mock.respond_using("eth_blockNumber", move |_| {
            Ok(json!(format!("0x{:x}", *height.lock().unwrap())))
        });
        mock.respond_using("eth_getBlockByNumber", |params| {
            let tag = params[0].as_str().unwrap_or_default();
            Ok(json!({
                "hash": format!("0x{:0>64}", tag.trim_start_matches("0x")),
                "number": tag,
                "parentHash": format!("0x{:064x}", 0),
                "timestamp": "0x0",
                "gasLimit": "0x1c9c380",
                "transactions": [],
            }))
        });
        let conn = connect(mock).await;

        let mut poller = LogPoller::new(&conn, LogFilter::default(), Some(2))
            .await
            .expect("stop block is ahead of the head");
        {
            let chain = chain.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    *chain.lock().unwrap() += 1;
                }
            });
        }

        let first = poller.next().await.expect("poll ok").expect("a log");
        assert_eq!(first["blockNumber"], json!("0x1"));
        let second = poller.next().await.expect("poll ok").expect("a log");
        assert_eq!(second["blockNumber"], json!("0x2"));
        assert!(poller.next().await.expect("poll ok").is_none());
    }
}

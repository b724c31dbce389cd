//! Confirmed-block polling with reorg recovery.

use std::time::Duration;

use tokio::time::Instant;

use evmlink_rpc::connection::{BlockId, Connection, NetworkConfig};
use evmlink_rpc::errors::EngineError;
use evmlink_rpc::types::Block;

/// A cancellable sequence of confirmed blocks.
///
/// Each call to [`next`](Self::next) performs its own polling round
/// against the node; nothing runs in the background, so dropping the
/// poller cancels the loop. The marker of the last yielded block is the
/// only state carried between calls, which lets the stream detect reorgs
/// (same number, different hash) and recover without yielding any block
/// twice.
pub struct BlockPoller<'a> {
    connection: &'a Connection,
    required_confirmations: u64,
    timeout: Duration,
    stop_block: Option<u64>,
    /// Last yielded block, or the synthetic start marker.
    marker: Option<Block>,
    next_expected: u64,
}

impl<'a> BlockPoller<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        let config = connection.config();
        Self {
            connection,
            required_confirmations: config.required_confirmations,
            timeout: config.poll_timeout(),
            stop_block: None,
            marker: None,
            next_expected: 0,
        }
    }

    pub fn with_required_confirmations(mut self, confirmations: u64) -> Self {
        self.required_confirmations = confirmations;
        self
    }

    /// Override how long the chain may stay silent before `next` errors.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop after yielding this block number.
    pub fn stop_at(mut self, block: u64) -> Self {
        self.stop_block = Some(block);
        self
    }

    /// Next confirmed block, or `None` once `stop_block` has been
    /// yielded. Errors with a provider failure when the chain makes no
    /// progress for longer than the timeout.
    #[tracing::instrument(skip_all, fields(next = self.next_expected))]
    pub async fn next(&mut self) -> Result<Option<Block>, EngineError> {
        if self.marker.is_none() {
            self.start().await?;
        }
        if let Some(stop) = self.stop_block {
            if self.next_expected > stop {
                return Ok(None);
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let head = self.connection.chain_height().await?;
            let adjusted_number = head.saturating_sub(self.required_confirmations);
            let adjusted = self
                .connection
                .get_block(BlockId::Number(adjusted_number))
                .await?;
            let marker = self.marker.as_ref().expect("marker set by start");

            if adjusted.number == marker.number && adjusted.hash == marker.hash {
                // No new confirmed block yet.
                self.idle(deadline).await?;
                continue;
            }

            if adjusted.number < marker.number
                || (adjusted.number == marker.number && adjusted.hash != marker.hash)
            {
                tracing::warn!(
                    stale = marker.number,
                    resume_at = adjusted.number,
                    "reorg detected, resuming at adjusted head"
                );
                // Re-yield from the adjusted head; the stale range is
                // superseded and never repeated.
                self.next_expected = adjusted.number;
            }

            if adjusted.number < self.next_expected {
                self.idle(deadline).await?;
                continue;
            }

            let block = if self.next_expected == adjusted.number {
                adjusted
            } else {
                self.connection
                    .get_block(BlockId::Number(self.next_expected))
                    .await?
            };
            tracing::debug!(number = block.number, hash = %block.hash, "confirmed block");
            self.next_expected = block.number + 1;
            self.marker = Some(block.clone());
            return Ok(Some(block));
        }
    }

    /// Set the start marker without yielding anything, and return the
    /// highest block number already considered confirmed. Everything
    /// after it comes from [`next`](Self::next); a caller backfilling
    /// history fetches up to this number itself and the two ranges meet
    /// with no gap and no overlap.
    pub async fn prime(&mut self) -> Result<u64, EngineError> {
        if self.marker.is_none() {
            self.start().await?;
        }
        Ok(self.marker.as_ref().expect("marker set by start").number)
    }

    /// Initialize the synthetic marker at `head - required_confirmations`.
    async fn start(&mut self) -> Result<(), EngineError> {
        let head = self.connection.chain_height().await?;
        let start = head.saturating_sub(self.required_confirmations);
        let marker = self.connection.get_block(BlockId::Number(start)).await?;
        self.next_expected = marker.number + 1;
        self.marker = Some(marker);
        Ok(())
    }

    async fn idle(&self, deadline: Instant) -> Result<(), EngineError> {
        if Instant::now() >= deadline {
            return Err(EngineError::Provider {
                code: 0,
                message: format!(
                    "no new confirmed block within {}s",
                    self.timeout.as_secs()
                ),
                data: None,
            });
        }
        tokio::time::sleep(poll_interval(self.connection.config())).await;
        Ok(())
    }
}

fn poll_interval(config: &NetworkConfig) -> Duration {
    if config.dev_network || config.block_time == 0 {
        Duration::from_millis(100)
    } else {
        Duration::from_secs((config.block_time / 2).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use evmlink_rpc::connection::ConnectionSettings;
    use evmlink_rpc::mock::MockTransport;
    use evmlink_rpc::transport::RpcFailure;

    fn header(number: u64, seed: u8) -> Value {
        json!({
            "hash": format!("0x{:062x}{:02x}", number, seed),
            "number": format!("0x{number:x}"),
            "parentHash": format!("0x{:064x}", number.saturating_sub(1)),
            "timestamp": format!("0x{:x}", 1_700_000_000 + number * 12),
            "gasLimit": "0x1c9c380",
            "transactions": [],
        })
    }

    /// Scripted chain: index = block number, value = hash seed.
    fn script_chain(mock: &MockTransport, chain: Arc<Mutex<Vec<u8>>>) {
        let heights = chain.clone();
        mock.respond_using("eth_blockNumber", move |_| {
            let len = heights.lock().unwrap().len() as u64;
            Ok(json!(format!("0x{:x}", len.saturating_sub(1))))
        });
        mock.respond_using("eth_getBlockByNumber", move |params| {
            let tag = params[0].as_str().unwrap_or_default();
            let number = u64::from_str_radix(tag.trim_start_matches("0x"), 16)
                .map_err(|e| RpcFailure::Transport(e.to_string()))?;
            let chain = chain.lock().unwrap();
            match chain.get(number as usize) {
                Some(seed) => Ok(header(number, *seed)),
                None => Ok(Value::Null),
            }
        });
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

    /// Push `count` blocks onto the chain, one every 200ms.
    fn grow(chain: &Arc<Mutex<Vec<u8>>>, count: usize) {
        let chain = chain.clone();
        tokio::spawn(async move {
            for _ in 0..count {
                tokio::time::sleep(Duration::from_millis(200)).await;
                chain.lock().unwrap().push(0);
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn yields_each_confirmed_block_exactly_once() {
        let chain = Arc::new(Mutex::new(vec![0u8])); // genesis only
        let mock = MockTransport::new();
        script_chain(&mock, chain.clone());
        let conn = connect(mock).await;

        let mut poller = BlockPoller::new(&conn).stop_at(5);
        grow(&chain, 5);
        let mut seen = Vec::new();
        while let Some(block) = poller.next().await.expect("poll ok") {
            seen.push(block.number);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5], "in order, no gaps, no repeats");
    }

    #[tokio::test(start_paused = true)]
    async fn confirmations_hold_back_the_head() {
        let chain = Arc::new(Mutex::new(vec![0u8; 6])); // head = 5
        let mock = MockTransport::new();
        script_chain(&mock, chain.clone());
        let conn = connect(mock).await;

        // Marker starts at head - confirmations = 2; block 3 only counts
        // as confirmed once the head reaches 6.
        let mut poller = BlockPoller::new(&conn).with_required_confirmations(3);
        let grower = chain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            grower.lock().unwrap().push(0);
        });
        let block = poller.next().await.expect("poll ok").expect("a block");
        assert_eq!(block.number, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn priming_anchors_the_stream_without_yielding() {
        let chain = Arc::new(Mutex::new(vec![0u8; 6])); // head = 5
        let mock = MockTransport::new();
        script_chain(&mock, chain.clone());
        let conn = connect(mock).await;

        let mut poller = BlockPoller::new(&conn).with_required_confirmations(2);
        assert_eq!(poller.prime().await.expect("prime ok"), 3);

        // The stream picks up right after the primed marker.
        grow(&chain, 1);
        let block = poller.next().await.expect("poll ok").expect("a block");
        assert_eq!(block.number, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn grows_with_the_chain() {
        let chain = Arc::new(Mutex::new(vec![0u8]));
        let mock = MockTransport::new();
        script_chain(&mock, chain.clone());
        let conn = connect(mock).await;

        let mut poller = BlockPoller::new(&conn);
        grow(&chain, 2);
        assert_eq!(poller.next().await.unwrap().unwrap().number, 1);
        assert_eq!(poller.next().await.unwrap().unwrap().number, 2);

        grow(&chain, 1);
        assert_eq!(poller.next().await.unwrap().unwrap().number, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reorg_re_yields_replaced_block_with_new_hash() {
        let chain = Arc::new(Mutex::new(vec![0u8]));
        let mock = MockTransport::new();
        script_chain(&mock, chain.clone());
        let conn = connect(mock).await;

        let mut poller = BlockPoller::new(&conn);
        grow(&chain, 2);
        assert_eq!(poller.next().await.unwrap().unwrap().number, 1);
        let first = poller.next().await.unwrap().unwrap();
        assert_eq!(first.number, 2);

        // Replace block 2 on a competing branch.
        chain.lock().unwrap()[2] = 7;
        let replayed = poller.next().await.unwrap().unwrap();
        assert_eq!(replayed.number, 2, "the replaced number comes again");
        assert_ne!(replayed.hash, first.hash, "with the new branch's hash");

        // The superseded block never comes back.
        chain.lock().unwrap().push(7);
        assert_eq!(poller.next().await.unwrap().unwrap().number, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_timeout_is_an_error() {
        let chain = Arc::new(Mutex::new(vec![0u8; 2]));
        let mock = MockTransport::new();
        script_chain(&mock, chain);
        let conn = connect(mock).await;

        let mut poller = BlockPoller::new(&conn).with_timeout(Duration::from_secs(3));
        // The chain never grows; the poll must fail, not hang.
        match poller.next().await {
            Err(EngineError::Provider { message, .. }) => {
                assert!(message.contains("no new confirmed block"), "{message}");
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_block_ends_the_stream() {
        let chain = Arc::new(Mutex::new(vec![0u8]));
        let mock = MockTransport::new();
        script_chain(&mock, chain.clone());
        let conn = connect(mock).await;
        grow(&chain, 3);

        let mut poller = BlockPoller::new(&conn).stop_at(2);
        assert!(poller.next().await.unwrap().is_some());
        assert!(poller.next().await.unwrap().is_some());
        assert!(poller.next().await.unwrap().is_none());
        assert!(poller.next().await.unwrap().is_none(), "stays finished");
    }
}

use alloy::primitives::Address;
use eyre::Result;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::models::TransferEvent;
use crate::parser::decode_deposit;
use crate::queue::QueueHandle;
use crate::rpc::{LogFilter, SourceChain};

/// Widest block span fetched in one poll when catching up.
const MAX_POLL_SPAN: u64 = 1000;

/// Follows the deposit token's logs and feeds new deposits to the queue.
pub struct ChainWatcher {
    chain: Arc<dyn SourceChain>,
    queue: QueueHandle,
    token: Address,
    listener: Address,
    confirmations: u64,
    poll_interval: Duration,
}

impl ChainWatcher {
    pub fn new(
        chain: Arc<dyn SourceChain>,
        queue: QueueHandle,
        token: Address,
        listener: Address,
        confirmations: u64,
        poll_interval: Duration,
    ) -> Self {
        Self { chain, queue, token, listener, confirmations, poll_interval }
    }

    async fn confirmed_head(&self) -> Result<u64> {
        Ok(self.chain.block_number().await?.saturating_sub(self.confirmations))
    }

    /// Emits deposits in the blocks after `cursor`; returns the new cursor.
    pub async fn poll(&self, cursor: u64) -> Result<u64> {
        let target = self.confirmed_head().await?;
        if target <= cursor {
            return Ok(cursor);
        }
        let to = target.min(cursor + MAX_POLL_SPAN);

        // every log of the token contract; decoding does the filtering
        let filter = LogFilter {
            address: format!("{:#x}", self.token),
            from_block: cursor + 1,
            to_block: to,
            topics: Vec::new(),
        };
        let logs = self.chain.logs(&filter).await?;

        let mut emitted = 0;
        for log in logs {
            match decode_deposit(&log, &self.listener) {
                Ok(transfer) => {
                    info!(
                        "Deposit {} from {} in block {} (log {})",
                        transfer.value,
                        transfer.from,
                        transfer.block_number,
                        log.log_index().unwrap_or_default()
                    );
                    if self.queue.enqueue(TransferEvent::live(log)) {
                        emitted += 1;
                    }
                }
                Err(e) => debug!("Ignoring log {}: {}", log.tx_hash, e),
            }
        }

        debug!("Blocks {} → {}: {} deposits queued", cursor + 1, to, emitted);
        Ok(to)
    }

    /// Polls forever, starting after `start_after` or the current head.
    pub async fn run(self, start_after: Option<u64>) -> Result<()> {
        let mut retry_delay = 10; // backoff in seconds

        let mut cursor = match start_after {
            Some(block) => block,
            None => loop {
                match self.confirmed_head().await {
                    Ok(head) => break head,
                    Err(e) => {
                        warn!("Failed to get latest block for watcher: {:?}", e);
                        sleep(Duration::from_secs(retry_delay)).await;
                        retry_delay = (retry_delay * 2).min(120);
                    }
                }
            },
        };
        info!("Watching deposits to {} after block {}", self.listener, cursor);

        loop {
            match self.poll(cursor).await {
                Ok(next) => {
                    cursor = next;
                    retry_delay = 10;
                    sleep(self.poll_interval).await;
                }
                Err(e) => {
                    warn!("Watcher poll failed at block {}: {:?}", cursor, e);
                    sleep(Duration::from_secs(retry_delay)).await;
                    retry_delay = (retry_delay * 2).min(120);
                }
            }
        }
    }
}

use alloy::primitives::Address;
use eyre::Result;
use futures_util::{stream, StreamExt, TryStreamExt};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::db::Ledger;
use crate::error::LedgerError;
use crate::models::TransferEvent;
use crate::parser::address_topic;
use crate::queue::QueueHandle;
use crate::rpc::{LogFilter, SourceChain, TRANSFER_TOPIC};

/// Result of one backfill pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Last block covered by the scan.
    pub head: u64,
    pub enqueued: usize,
}

/// Finds deposits made while the service was down.
pub struct RecoveryScanner {
    chain: Arc<dyn SourceChain>,
    ledger: Arc<dyn Ledger>,
    queue: QueueHandle,
    token: Address,
    listener: Address,
    genesis_block: u64,
    chunk_size: u64,
    concurrency: usize,
}

impl RecoveryScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn SourceChain>,
        ledger: Arc<dyn Ledger>,
        queue: QueueHandle,
        token: Address,
        listener: Address,
        genesis_block: u64,
        chunk_size: u64,
        concurrency: usize,
    ) -> Self {
        Self {
            chain,
            ledger,
            queue,
            token,
            listener,
            genesis_block,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Unsettled deposits in `[last persisted block, head]`, oldest first.
    pub async fn scan(&self) -> Result<(u64, Vec<TransferEvent>)> {
        let from = self
            .ledger
            .latest_persisted_block()
            .await?
            .unwrap_or(self.genesis_block);
        let head = self.chain.block_number().await?;
        info!("Backfill: scanning {} → {}", from, head);
        if from > head {
            return Ok((head, Vec::new()));
        }

        let topics = vec![
            Some(TRANSFER_TOPIC.to_string()),
            None, // Sender can be any address
            Some(address_topic(&self.listener)),
        ];

        let mut logs = Vec::new();
        let mut start = from;
        while start <= head {
            let end = start.saturating_add(self.chunk_size - 1).min(head);
            let filter = LogFilter {
                address: format!("{:#x}", self.token),
                from_block: start,
                to_block: end,
                topics: topics.clone(),
            };
            logs.extend(self.chain.logs(&filter).await?);
            if end == head {
                break;
            }
            start = end + 1;
        }
        info!("Fetched {} logs", logs.len());

        // buffered() keeps the chain's order while checking a few at a time
        let checked: Vec<_> = stream::iter(logs)
            .map(|log| async move {
                let exists = self.ledger.exists_by_incoming_hash(&log.tx_hash).await?;
                Ok::<_, LedgerError>((log, exists))
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let events: Vec<TransferEvent> = checked
            .into_iter()
            .filter(|(_, exists)| !exists)
            .filter_map(|(log, _)| match log.block_number() {
                Some(block) => Some(TransferEvent::historical(log, block)),
                None => {
                    warn!("Skipping pending log {}", log.tx_hash);
                    None
                }
            })
            .collect();

        info!("Found {} unsettled transfers", events.len());
        Ok((head, events))
    }

    /// Scans and hands everything found to the swap queue.
    pub async fn run(&self) -> Result<ScanReport> {
        let (head, events) = self.scan().await?;
        let enqueued = self.queue.enqueue_all(events);
        Ok(ScanReport { head, enqueued })
    }
}

/// Periodically re-feeds failed settlements to the swap queue.
pub struct RetryReclaimer {
    ledger: Arc<dyn Ledger>,
    queue: QueueHandle,
}

impl RetryReclaimer {
    pub fn new(ledger: Arc<dyn Ledger>, queue: QueueHandle) -> Self {
        Self { ledger, queue }
    }

    /// One sweep. Rows are deleted once queued, not once settled; the
    /// settler's dedup and payout intents make a second pass harmless.
    pub async fn reclaim(&self) -> Result<usize> {
        let rows = self.ledger.all_failed_attempts().await?;
        if rows.is_empty() {
            debug!("No failed attempts to reclaim");
            return Ok(0);
        }
        info!("Fetched {} failed transactions", rows.len());

        let mut done = Vec::with_capacity(rows.len());
        let mut enqueued = 0;
        for row in rows {
            match serde_json::from_str::<TransferEvent>(&row.event) {
                Ok(event) => {
                    if !self.queue.enqueue(event) {
                        // worker gone; leave the rest for the next run
                        break;
                    }
                    enqueued += 1;
                    done.push(row.id);
                }
                Err(e) => {
                    error!("Discarding unreadable failed attempt {}: {}", row.id, e);
                    done.push(row.id);
                }
            }
        }

        self.ledger.delete_failed_attempts(&done).await?;
        info!("Reclaimed {} failed transactions", enqueued);
        Ok(enqueued)
    }

    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick fires immediately

        loop {
            interval.tick().await;
            info!("Running retry sweep for failed transactions");
            if let Err(e) = self.reclaim().await {
                error!("Retry sweep failed: {:?}", e);
            }
        }
    }
}

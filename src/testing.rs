//! In-memory stand-ins for the chains and the price API.

use alloy::primitives::{address, Address, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use rust_decimal::Decimal;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use crate::error::ExecutionError;
use crate::executor::{PayoutExecutor, PayoutStatus};
use crate::models::{PriceSample, SignedPayout};
use crate::parser::address_topic;
use crate::price::PriceFeed;
use crate::rpc::{parse_hex_u64, Log, LogFilter, SourceChain, TRANSFER_TOPIC};

pub const LISTENER: Address = address!("123c058C58102a4eE0E24a3c7F0Cee2590e1c0f4");
pub const SENDER: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");
pub const TOKEN: Address = address!("0b2C639c533813f4Aa9D7837CAf62653d097Ff85");

pub fn transfer_log(from: Address, to: Address, value: u64, block: u64, hash: &str) -> Log {
    Log {
        address: format!("{:#x}", TOKEN),
        topics: vec![TRANSFER_TOPIC.to_string(), address_topic(&from), address_topic(&to)],
        data: format!("0x{:064x}", value),
        block_number_hex: Some(format!("0x{:x}", block)),
        tx_hash: hash.to_string(),
        log_index_hex: Some("0x0".to_string()),
    }
}

#[derive(Default)]
pub struct FakeChain {
    head: Mutex<u64>,
    head_down: AtomicBool,
    timestamps: Mutex<HashMap<u64, u64>>,
    logs: Mutex<Vec<Log>>,
    queries: Mutex<Vec<LogFilter>>,
}

impl FakeChain {
    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub fn set_head_down(&self, down: bool) {
        self.head_down.store(down, Ordering::SeqCst);
    }

    pub fn set_timestamp(&self, block: u64, timestamp: u64) {
        self.timestamps.lock().unwrap().insert(block, timestamp);
    }

    pub fn push_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn queries(&self) -> Vec<LogFilter> {
        self.queries.lock().unwrap().clone()
    }
}

fn topic_matches(filter: &Option<String>, topic: Option<&String>) -> bool {
    match (filter, topic) {
        (None, _) => true,
        (Some(want), Some(got)) => want.eq_ignore_ascii_case(got),
        (Some(_), None) => false,
    }
}

#[async_trait]
impl SourceChain for FakeChain {
    async fn block_number(&self) -> Result<u64> {
        if self.head_down.load(Ordering::SeqCst) {
            return Err(eyre!("rpc down"));
        }
        Ok(*self.head.lock().unwrap())
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        self.queries.lock().unwrap().push(filter.clone());
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .iter()
            .filter(|log| log.address.eq_ignore_ascii_case(&filter.address))
            .filter(|log| {
                let block = log.block_number_hex.as_deref().and_then(parse_hex_u64).unwrap_or(0);
                block >= filter.from_block && block <= filter.to_block
            })
            .filter(|log| {
                filter
                    .topics
                    .iter()
                    .enumerate()
                    .all(|(i, want)| topic_matches(want, log.topics.get(i)))
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        self.timestamps
            .lock()
            .unwrap()
            .get(&block_number)
            .copied()
            .ok_or_else(|| eyre!("unknown block {}", block_number))
    }
}

#[derive(Default)]
pub struct FakeFeed {
    spot: Mutex<Option<Decimal>>,
    samples: Mutex<Vec<PriceSample>>,
    failing: AtomicBool,
    range_queries: Mutex<Vec<(u64, u64)>>,
}

impl FakeFeed {
    pub fn with_spot(price: Decimal) -> Self {
        let feed = Self::default();
        *feed.spot.lock().unwrap() = Some(price);
        feed
    }

    pub fn with_samples(samples: Vec<PriceSample>) -> Self {
        let feed = Self::default();
        feed.set_samples(samples);
        feed
    }

    pub fn failing() -> Self {
        let feed = Self::default();
        feed.fail();
        feed
    }

    pub fn set_samples(&self, samples: Vec<PriceSample>) {
        *self.samples.lock().unwrap() = samples;
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn range_queries(&self) -> Vec<(u64, u64)> {
        self.range_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PriceFeed for FakeFeed {
    async fn spot_price(&self) -> Result<Decimal> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(eyre!("429 Too Many Requests"));
        }
        (*self.spot.lock().unwrap()).ok_or_else(|| eyre!("no spot price"))
    }

    async fn price_range(&self, from: u64, to: u64) -> Result<Vec<PriceSample>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(eyre!("429 Too Many Requests"));
        }
        self.range_queries.lock().unwrap().push((from, to));
        Ok(self.samples.lock().unwrap().clone())
    }
}

/// Records payouts; each one gets a fresh fake hash. Payouts it has not
/// been told about are reported as pending.
#[derive(Default)]
pub struct FakeExecutor {
    submissions: Mutex<Vec<(Address, U256)>>,
    broadcasts: Mutex<Vec<String>>,
    reject_next: Mutex<Option<String>>,
    fail_broadcast_next: AtomicBool,
    timeout_next: AtomicBool,
    statuses: Mutex<HashMap<String, PayoutStatus>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeExecutor {
    pub fn submissions(&self) -> Vec<(Address, U256)> {
        self.submissions.lock().unwrap().clone()
    }

    /// Hashes sent to the network, rebroadcasts included.
    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn reject_next(&self, reason: &str) {
        *self.reject_next.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_broadcast_next(&self) {
        self.fail_broadcast_next.store(true, Ordering::SeqCst);
    }

    pub fn timeout_next(&self) {
        self.timeout_next.store(true, Ordering::SeqCst);
    }

    pub fn set_status(&self, hash: &str, status: PayoutStatus) {
        self.statuses.lock().unwrap().insert(hash.to_string(), status);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayoutExecutor for FakeExecutor {
    async fn sign(&self, recipient: Address, amount: U256) -> Result<SignedPayout, ExecutionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let rejected = self.reject_next.lock().unwrap().take();
        if let Some(reason) = rejected {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecutionError::Rejected(reason));
        }

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((recipient, amount));
        let n = submissions.len() as u64;
        Ok(SignedPayout { hash: format!("0x{:064x}", n), nonce: n - 1, raw: vec![0x02, n as u8] })
    }

    async fn broadcast(&self, payout: &SignedPayout) -> Result<(), ExecutionError> {
        self.broadcasts.lock().unwrap().push(payout.hash.clone());
        if self.fail_broadcast_next.swap(false, Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecutionError::Unconfirmed {
                hash: payout.hash.clone(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(())
    }

    async fn confirm(&self, hash: &str) -> Result<String, ExecutionError> {
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.timeout_next.swap(false, Ordering::SeqCst) {
            return Err(ExecutionError::Unconfirmed {
                hash: hash.to_string(),
                reason: "timed out".to_string(),
            });
        }
        Ok(hash.to_string())
    }

    async fn payout_status(&self, hash: &str, _nonce: u64) -> Result<PayoutStatus, ExecutionError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(hash)
            .copied()
            .unwrap_or(PayoutStatus::Pending))
    }
}

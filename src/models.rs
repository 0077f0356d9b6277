// src/models.rs
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rpc::Log;

/// One detected deposit, as handed to the swap queue.
///
/// `block_number` is only set for backfilled or replayed events; its presence
/// makes the worker price the transfer at the block's time instead of now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub log: Log,
    #[serde(rename = "blockNumber", default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

impl TransferEvent {
    pub fn live(log: Log) -> Self {
        Self { log, block_number: None }
    }

    pub fn historical(log: Log, block_number: u64) -> Self {
        Self { log, block_number: Some(block_number) }
    }

    /// Incoming transaction hash, normalized to lowercase.
    pub fn incoming_hash(&self) -> String {
        self.log.tx_hash.to_lowercase()
    }

    /// Copy of this event pinned to its origin block, so a retry is priced
    /// at the time of the transfer rather than the time of the retry.
    pub fn pinned(&self) -> Self {
        let mut event = self.clone();
        if event.block_number.is_none() {
            event.block_number = self.log.block_number();
        }
        event
    }
}

/// A completed settlement. `incoming_tx_hash` is unique.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapRecord {
    pub sender: Address,
    pub usdc_received: U256, // 6 decimals
    pub arb_amount: U256,    // 18 decimals
    pub arb_price: Decimal,
    pub fee: U256,
    pub block_number: u64,
    pub incoming_tx_hash: String,
    pub outgoing_tx_hash: String,
}

/// An event that could not be settled, waiting for the reclaimer.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAttempt {
    pub id: i64,
    pub event: String, // serialized TransferEvent
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSample {
    pub timestamp_millis: u64,
    pub price: Decimal,
}

/// A payout transaction signed locally but not necessarily broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayout {
    pub hash: String,
    pub nonce: u64,
    /// EIP-2718 encoded transaction, rebroadcast verbatim when needed.
    pub raw: Vec<u8>,
}

/// Durable note written before a payout is signed.
///
/// Carries everything needed to build the SwapRecord. The signed payout is
/// attached before it is broadcast, so a payout that reached the network can
/// always be traced back to its deposit.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutIntent {
    pub sender: Address,
    pub usdc_received: U256,
    pub arb_amount: U256,
    pub arb_price: Decimal,
    pub fee: U256,
    pub block_number: u64,
    pub incoming_tx_hash: String,
    pub payout: Option<SignedPayout>,
}

impl PayoutIntent {
    pub fn into_record(self, outgoing_tx_hash: String) -> SwapRecord {
        SwapRecord {
            sender: self.sender,
            usdc_received: self.usdc_received,
            arb_amount: self.arb_amount,
            arb_price: self.arb_price,
            fee: self.fee,
            block_number: self.block_number,
            incoming_tx_hash: self.incoming_tx_hash,
            outgoing_tx_hash,
        }
    }
}

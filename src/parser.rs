// src/parser.rs
use alloy::primitives::{Address, U256};

use crate::error::DecodeError;
use crate::rpc::{Log, TRANSFER_TOPIC};

/// A decoded ERC20 Transfer
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub value: U256, // raw token units
    pub block_number: u64,
    pub tx_hash: String,
}

fn topic_to_address(topic: &str) -> Option<Address> {
    // topics[1] and topics[2] are 32-byte (padded) hex strings; address is the last 20 bytes
    let s = topic.trim_start_matches("0x");
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let addr_bytes: [u8; 20] = bytes[12..32].try_into().ok()?;
    Some(Address::from(addr_bytes))
}

/// 32-byte topic form of an address, as used in `eth_getLogs` topic filters.
pub fn address_topic(address: &Address) -> String {
    format!("0x{:0>64}", hex::encode(address.as_slice()))
}

/// Decode a single log into `Transfer`
pub fn decode_transfer(log: &Log) -> Result<Transfer, DecodeError> {
    let topic0 = log.topics.first().map(String::as_str).unwrap_or_default();
    if !topic0.eq_ignore_ascii_case(TRANSFER_TOPIC) {
        return Err(DecodeError::NotTransfer(topic0.to_string()));
    }
    // a Transfer with an unindexed recipient is some other contract's event
    if log.topics.len() != 3 {
        return Err(DecodeError::MissingTopics(log.topics.len()));
    }

    let from = topic_to_address(&log.topics[1])
        .ok_or_else(|| DecodeError::BadTopic(log.topics[1].clone()))?;
    let to = topic_to_address(&log.topics[2])
        .ok_or_else(|| DecodeError::BadTopic(log.topics[2].clone()))?;

    let value_hex = log.data.trim_start_matches("0x");
    if value_hex.is_empty() || value_hex.len() > 64 {
        return Err(DecodeError::BadAmount(log.data.clone()));
    }
    let value = U256::from_str_radix(value_hex, 16)
        .map_err(|_| DecodeError::BadAmount(log.data.clone()))?;

    let block_number = log.block_number().ok_or(DecodeError::NoBlock)?;

    Ok(Transfer {
        from,
        to,
        value,
        block_number,
        tx_hash: log.tx_hash.to_lowercase(),
    })
}

/// Decode and keep only transfers paid to `listener`.
pub fn decode_deposit(log: &Log, listener: &Address) -> Result<Transfer, DecodeError> {
    let transfer = decode_transfer(log)?;
    if &transfer.to != listener {
        return Err(DecodeError::WrongRecipient(transfer.to.to_string()));
    }
    Ok(transfer)
}

use std::fmt;
use thiserror::Error;

/// Where in the settlement pipeline an event currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Resolving,
    Computing,
    Submitting,
    Confirming,
    Recorded,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Resolving => "resolving",
            Stage::Computing => "computing",
            Stage::Submitting => "submitting",
            Stage::Confirming => "confirming",
            Stage::Recorded => "recorded",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("not a Transfer log (topic0 {0})")]
    NotTransfer(String),
    #[error("expected 3 topics, got {0}")]
    MissingTopics(usize),
    #[error("malformed address topic {0}")]
    BadTopic(String),
    #[error("malformed transfer amount {0}")]
    BadAmount(String),
    #[error("log has no block number")]
    NoBlock,
    #[error("recipient {0} is not the listener")]
    WrongRecipient(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ArithmeticError {
    #[error("price scales to zero")]
    ZeroPrice,
    #[error("price {0} is negative or out of range")]
    InvalidPrice(String),
    #[error("amount overflow")]
    Overflow,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The payout never left the signer.
    #[error("payout rejected: {0}")]
    Rejected(String),
    /// The payout was mined and failed.
    #[error("payout {0} reverted")]
    Reverted(String),
    /// The payout was broadcast but its outcome is not known.
    #[error("payout {hash} unconfirmed: {reason}")]
    Unconfirmed { hash: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ledger connection poisoned")]
    Poisoned,
    #[error("ledger task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Closed set of ways a single settlement can fail.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("price resolution: {0}")]
    PriceResolution(String),
    #[error("arithmetic: {0}")]
    Arithmetic(#[from] ArithmeticError),
    #[error("execution: {0}")]
    Execution(#[from] ExecutionError),
    #[error("persistence: {0}")]
    Persistence(#[from] LedgerError),
}

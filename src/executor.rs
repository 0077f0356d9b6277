use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, ReceiptResponse, TransactionBuilder},
    primitives::{Address, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
    transports::http::reqwest::Url,
};
use async_trait::async_trait;
use eyre::WrapErr;
use std::{fmt, future::IntoFuture, time::Duration};
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::models::SignedPayout;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// What the target chain knows about an earlier payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutStatus {
    Succeeded,
    Reverted,
    /// Not mined, and its nonce is still free.
    Pending,
    /// Not mined, and its nonce was used by another transaction.
    Dropped,
}

/// Sends payouts from the single custodial wallet.
///
/// A payout is signed first and broadcast second, so the caller can persist
/// its hash before anything reaches the network.
#[async_trait]
pub trait PayoutExecutor: Send + Sync {
    /// Check funds and sign a transfer of `amount` to `recipient`. Only ever
    /// fails with `Rejected`: nothing has been sent yet.
    async fn sign(&self, recipient: Address, amount: U256) -> Result<SignedPayout, ExecutionError>;

    /// Send a signed payout. Safe to repeat; failures are `Unconfirmed`
    /// because the node may have accepted it anyway.
    async fn broadcast(&self, payout: &SignedPayout) -> Result<(), ExecutionError>;

    /// Block until `hash` is mined with enough confirmations.
    async fn confirm(&self, hash: &str) -> Result<String, ExecutionError>;

    async fn payout_status(&self, hash: &str, nonce: u64) -> Result<PayoutStatus, ExecutionError>;
}

fn parse_hash(hash: &str) -> Result<B256, ExecutionError> {
    hash.parse().map_err(|_| ExecutionError::Unconfirmed {
        hash: hash.to_string(),
        reason: "malformed transaction hash".to_string(),
    })
}

fn unconfirmed(hash: &str) -> impl FnOnce(String) -> ExecutionError + '_ {
    move |reason| ExecutionError::Unconfirmed { hash: hash.to_string(), reason }
}

/// ERC20 payouts over an alloy HTTP provider with a local signer.
pub struct AlloyExecutor {
    provider: DynProvider,
    token: IERC20::IERC20Instance<DynProvider>,
    wallet: EthereumWallet,
    wallet_address: Address,
    confirmations: u64,
    rpc_timeout: Duration,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl AlloyExecutor {
    pub fn new(
        rpc_url: &str,
        private_key: &str,
        token: Address,
        confirmations: u64,
        rpc_timeout: Duration,
        confirm_timeout: Duration,
    ) -> eyre::Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .wrap_err("invalid signing key")?;
        let wallet_address = signer.address();

        let url: Url = rpc_url.parse().wrap_err("invalid target RPC URL")?;
        let provider = ProviderBuilder::new().connect_http(url).erased();

        Ok(Self {
            token: IERC20::new(token, provider.clone()),
            provider,
            wallet: EthereumWallet::from(signer),
            wallet_address,
            confirmations: confirmations.max(1),
            rpc_timeout,
            confirm_timeout,
            poll_interval: Duration::from_secs(2),
        })
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    // Every target-chain call goes through here; a hung node is an error.
    async fn within<F, T, E>(&self, what: &str, call: F) -> Result<T, String>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match tokio::time::timeout(self.rpc_timeout, call.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{} failed: {}", what, e)),
            Err(_) => Err(format!("{} timed out after {}s", what, self.rpc_timeout.as_secs_f32())),
        }
    }

    async fn wait_for_receipt(&self, tx_hash: B256, hash: &str) -> Result<String, ExecutionError> {
        loop {
            let receipt = match self
                .within("receipt lookup", self.provider.get_transaction_receipt(tx_hash))
                .await
            {
                Ok(Some(receipt)) => receipt,
                Ok(None) => {
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    warn!(tx_hash = %hash, "{}", e);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if !receipt.status() {
                return Err(ExecutionError::Reverted(hash.to_string()));
            }

            // inclusion counts as the first confirmation
            let tx_block = receipt.block_number().unwrap_or_default();
            let head = self
                .within("block number", self.provider.get_block_number())
                .await
                .unwrap_or(tx_block);
            let confirmations = head.saturating_sub(tx_block) + 1;
            if confirmations >= self.confirmations {
                return Ok(hash.to_string());
            }

            debug!(
                tx_hash = %hash,
                "Waiting for {} more confirmations...",
                self.confirmations - confirmations
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl PayoutExecutor for AlloyExecutor {
    async fn sign(&self, recipient: Address, amount: U256) -> Result<SignedPayout, ExecutionError> {
        let balance = self
            .within("balance check", self.token.balanceOf(self.wallet_address).call())
            .await
            .map_err(ExecutionError::Rejected)?;
        if balance < amount {
            return Err(ExecutionError::Rejected(format!(
                "insufficient balance: have {}, need {}",
                balance, amount
            )));
        }

        let mut tx = self
            .token
            .transfer(recipient, amount)
            .from(self.wallet_address)
            .into_transaction_request();

        let chain_id = self
            .within("chain id", self.provider.get_chain_id())
            .await
            .map_err(ExecutionError::Rejected)?;
        let nonce = self
            .within("nonce", self.provider.get_transaction_count(self.wallet_address).pending())
            .await
            .map_err(ExecutionError::Rejected)?;
        let gas = self
            .within("gas estimate", self.provider.estimate_gas(tx.clone()))
            .await
            .map_err(ExecutionError::Rejected)?;
        let gas_price = self
            .within("gas price", self.provider.get_gas_price())
            .await
            .map_err(ExecutionError::Rejected)?;
        let tip = self
            .within("priority fee", self.provider.get_max_priority_fee_per_gas())
            .await
            .map_err(ExecutionError::Rejected)?;

        tx.set_chain_id(chain_id);
        tx.set_nonce(nonce);
        tx.set_gas_limit(gas);
        tx.set_max_priority_fee_per_gas(tip);
        // headroom for the base fee to double before inclusion
        tx.set_max_fee_per_gas(gas_price.saturating_mul(2).saturating_add(tip));

        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| ExecutionError::Rejected(format!("signing failed: {}", e)))?;

        let payout = SignedPayout {
            hash: format!("{:#x}", envelope.tx_hash()),
            nonce,
            raw: envelope.encoded_2718(),
        };
        debug!(tx_hash = %payout.hash, nonce, %recipient, %amount, "Signed payout");
        Ok(payout)
    }

    async fn broadcast(&self, payout: &SignedPayout) -> Result<(), ExecutionError> {
        self.within("broadcast", self.provider.send_raw_transaction(&payout.raw))
            .await
            .map_err(unconfirmed(&payout.hash))?;
        info!(tx_hash = %payout.hash, nonce = payout.nonce, "Broadcast payout");
        Ok(())
    }

    async fn confirm(&self, hash: &str) -> Result<String, ExecutionError> {
        let tx_hash = parse_hash(hash)?;
        match tokio::time::timeout(self.confirm_timeout, self.wait_for_receipt(tx_hash, hash)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Unconfirmed {
                hash: hash.to_string(),
                reason: format!("no confirmation after {}s", self.confirm_timeout.as_secs()),
            }),
        }
    }

    async fn payout_status(&self, hash: &str, nonce: u64) -> Result<PayoutStatus, ExecutionError> {
        let tx_hash = parse_hash(hash)?;
        // nonce first: if it is used, the receipt read afterwards is final
        let mined_nonce = self
            .within(
                "nonce",
                self.provider.get_transaction_count(self.wallet_address).latest(),
            )
            .await
            .map_err(unconfirmed(hash))?;
        let receipt = self
            .within("receipt lookup", self.provider.get_transaction_receipt(tx_hash))
            .await
            .map_err(unconfirmed(hash))?;

        Ok(match receipt {
            Some(receipt) if receipt.status() => PayoutStatus::Succeeded,
            Some(_) => PayoutStatus::Reverted,
            None if mined_nonce > nonce => PayoutStatus::Dropped,
            None => PayoutStatus::Pending,
        })
    }
}

use alloy::primitives::Address;
use dotenvy::dotenv;
use eyre::{eyre, Result, WrapErr};
use std::{env, fmt, str::FromStr};
use tracing::info;

/// Bridged USDC on Optimism.
const DEFAULT_SOURCE_TOKEN: &str = "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85";
/// ARB on Arbitrum One.
const DEFAULT_PAYOUT_TOKEN: &str = "0x912CE59144191C1204E64559FE8253a0e49E6548";
/// Deployment block of the listener; nothing earlier is relevant.
const DEFAULT_GENESIS_BLOCK: u64 = 116_103_990;

/// Private key wrapper that never prints its contents.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source_rpc_url: String,   // chain the deposits arrive on
    pub target_rpc_url: String,   // chain the payouts are sent on
    pub private_key: Secret,
    pub source_token: Address,
    pub payout_token: Address,
    pub listener_address: Address,
    pub genesis_block: u64,
    pub db_path: String,
    pub port: u16,
    pub confirmations: u64,
    pub payout_confirmations: u64,
    pub poll_interval_secs: u64,
    pub reclaim_interval_secs: u64,
    pub rpc_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub scan_chunk_size: u64,
    pub scan_concurrency: usize,
    pub price_api_url: String,
    pub price_coin_id: String,
    pub price_vs_currency: String,
}

fn required(key: &str, alias: Option<&str>) -> Result<String> {
    env::var(key)
        .or_else(|e| match alias {
            Some(alias) => env::var(alias),
            None => Err(e),
        })
        .map_err(|_| eyre!("missing required environment variable {}", key))
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn address(key: &str, value: &str) -> Result<Address> {
    value
        .trim()
        .parse::<Address>()
        .wrap_err_with(|| format!("{} is not a valid address: {}", key, value))
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // Load from .env file

    // RPC endpoints (aliases kept for older deployments)
    let source_rpc_url = required("SOURCE_RPC_URL", Some("OPTIMISM_RPC"))?;
    let target_rpc_url = required("TARGET_RPC_URL", Some("ARBITRUM_RPC"))?;

    let private_key = Secret(required("PRIVATE_KEY", Some("PVT_KEY"))?);

    let source_token = address(
        "SOURCE_TOKEN_ADDRESS",
        &env::var("SOURCE_TOKEN_ADDRESS").unwrap_or_else(|_| DEFAULT_SOURCE_TOKEN.to_string()),
    )?;
    let payout_token = address(
        "PAYOUT_TOKEN_ADDRESS",
        &env::var("PAYOUT_TOKEN_ADDRESS").unwrap_or_else(|_| DEFAULT_PAYOUT_TOKEN.to_string()),
    )?;
    let listener_address = address("LISTENER_ADDRESS", &required("LISTENER_ADDRESS", None)?)?;

    // SQLite DB path (default: settler.db)
    let db_path = env::var("DATABASE_URL").unwrap_or_else(|_| "settler.db".to_string());

    let scan_concurrency = parsed_or("SCAN_CONCURRENCY", 3usize).max(1);
    let scan_chunk_size = parsed_or("SCAN_CHUNK_SIZE", 2000u64).max(1);

    let cfg = Config {
        source_rpc_url,
        target_rpc_url,
        private_key,
        source_token,
        payout_token,
        listener_address,
        genesis_block: parsed_or("GENESIS_BLOCK", DEFAULT_GENESIS_BLOCK),
        db_path,
        port: parsed_or("PORT", 8080),
        confirmations: parsed_or("CONFIRMATIONS", 2),
        payout_confirmations: parsed_or("PAYOUT_CONFIRMATIONS", 1),
        poll_interval_secs: parsed_or("POLL_INTERVAL_SECS", 4),
        reclaim_interval_secs: parsed_or("RECLAIM_INTERVAL_SECS", 120),
        rpc_timeout_secs: parsed_or("RPC_TIMEOUT_SECS", 15),
        confirmation_timeout_secs: parsed_or("CONFIRMATION_TIMEOUT_SECS", 300),
        scan_chunk_size,
        scan_concurrency,
        price_api_url: env::var("PRICE_API_URL")
            .unwrap_or_else(|_| "https://api.coingecko.com/api/v3".to_string()),
        price_coin_id: env::var("PRICE_COIN_ID").unwrap_or_else(|_| "arbitrum".to_string()),
        price_vs_currency: env::var("PRICE_VS_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
    };

    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}

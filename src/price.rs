use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::Client;
use rust_decimal::prelude::FromStr;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, error};

use crate::models::PriceSample;
use crate::rpc::SourceChain;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Market data for the payout asset, quoted in the deposit asset.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn spot_price(&self) -> Result<Decimal>;
    /// Samples between two unix timestamps (seconds), oldest first.
    async fn price_range(&self, from: u64, to: u64) -> Result<Vec<PriceSample>>;
}

/// CoinGecko's `simple/price` and `market_chart/range` endpoints.
#[derive(Clone)]
pub struct CoinGecko {
    client: Client,
    base_url: String,
    coin_id: String,
    vs_currency: String,
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

// f64 → Decimal through its shortest decimal form, so 1.936062 stays 1.936062
fn to_decimal(value: f64) -> Result<Decimal> {
    Decimal::from_str(&value.to_string()).map_err(|e| eyre!("bad price {}: {}", value, e))
}

impl CoinGecko {
    pub fn new(base_url: &str, coin_id: &str, vs_currency: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            coin_id: coin_id.to_string(),
            vs_currency: vs_currency.to_string(),
        })
    }
}

#[async_trait]
impl PriceFeed for CoinGecko {
    async fn spot_price(&self) -> Result<Decimal> {
        let url = format!("{}/simple/price", self.base_url);
        let body: HashMap<String, HashMap<String, f64>> = self
            .client
            .get(&url)
            .query(&[
                ("ids", self.coin_id.as_str()),
                ("vs_currencies", self.vs_currency.as_str()),
                ("precision", "6"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let price = body
            .get(&self.coin_id)
            .and_then(|quotes| quotes.get(&self.vs_currency))
            .ok_or_else(|| eyre!("no {}/{} quote in response", self.coin_id, self.vs_currency))?;
        to_decimal(*price)
    }

    async fn price_range(&self, from: u64, to: u64) -> Result<Vec<PriceSample>> {
        let url = format!("{}/coins/{}/market_chart/range", self.base_url, self.coin_id);
        let (from, to) = (from.to_string(), to.to_string());
        let chart: MarketChart = self
            .client
            .get(&url)
            .query(&[
                ("vs_currency", self.vs_currency.as_str()),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("precision", "6"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        chart
            .prices
            .into_iter()
            .map(|(ts, price)| {
                Ok(PriceSample {
                    timestamp_millis: ts as u64,
                    price: to_decimal(price)?,
                })
            })
            .collect()
    }
}

/// Half-width of the sample window around a block's time.
///
/// Data granularity coarsens with age: 5-minute points for the last day,
/// hourly up to 90 days, daily beyond that.
pub fn query_window(age_secs: u64) -> u64 {
    if age_secs <= DAY {
        5 * MINUTE
    } else if age_secs <= 90 * DAY {
        HOUR
    } else {
        DAY
    }
}

/// Latest sample not later than `block_time` (seconds). Never a future price.
pub fn select_sample(samples: &[PriceSample], block_time: u64) -> Option<Decimal> {
    let cutoff = block_time.saturating_mul(1000);
    samples
        .iter()
        .filter(|s| s.timestamp_millis <= cutoff)
        .max_by_key(|s| s.timestamp_millis)
        .map(|s| s.price)
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Resolves the exchange rate for a transfer, either now or at a past block.
pub struct PriceResolver {
    feed: Arc<dyn PriceFeed>,
    chain: Arc<dyn SourceChain>,
}

impl PriceResolver {
    pub fn new(feed: Arc<dyn PriceFeed>, chain: Arc<dyn SourceChain>) -> Self {
        Self { feed, chain }
    }

    /// Price for `block_number`, or the spot price when there is none.
    ///
    /// Returns zero when no price can be found. Callers must treat zero as a
    /// failed lookup; errors never escape from here.
    pub async fn resolve(&self, block_number: Option<u64>) -> Decimal {
        match self.try_resolve(block_number, now_secs()).await {
            Ok(price) => price,
            Err(e) => {
                error!("Price resolution failed: {:?}", e);
                Decimal::ZERO
            }
        }
    }

    async fn try_resolve(&self, block_number: Option<u64>, now: u64) -> Result<Decimal> {
        let Some(block_number) = block_number else {
            return self.feed.spot_price().await;
        };

        let block_time = self.chain.block_timestamp(block_number).await?;
        let window = query_window(now.saturating_sub(block_time));
        let samples = self
            .feed
            .price_range(block_time.saturating_sub(window), block_time + window)
            .await?;
        debug!(
            "{} price samples around block {} (t={}, ±{}s)",
            samples.len(),
            block_number,
            block_time,
            window
        );

        select_sample(&samples, block_time)
            .ok_or_else(|| eyre!("no price sample at or before t={}", block_time))
    }
}

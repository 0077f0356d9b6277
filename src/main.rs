mod api;
mod config;
mod db;
mod error;
mod executor;
mod models;
mod parser;
mod price;
mod queue;
mod recovery;
mod rpc;
mod settlement;
mod watcher;

#[cfg(test)]
mod testing;

use std::{sync::Arc, time::Duration};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::db::{Ledger, SqliteLedger};
use crate::executor::{AlloyExecutor, PayoutExecutor};
use crate::price::{CoinGecko, PriceFeed, PriceResolver};
use crate::recovery::{RecoveryScanner, RetryReclaimer};
use crate::rpc::{RpcClient, SourceChain};
use crate::watcher::ChainWatcher;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // RUST_LOG overrides; INFO otherwise
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Swap settler starting...");

    let cfg = config::load()?;

    // Opening the ledger runs the migrations
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open(&cfg.db_path)?);

    let rpc_timeout = Duration::from_secs(cfg.rpc_timeout_secs);
    let chain: Arc<dyn SourceChain> = Arc::new(RpcClient::new(&cfg.source_rpc_url, rpc_timeout)?);
    let feed: Arc<dyn PriceFeed> = Arc::new(CoinGecko::new(
        &cfg.price_api_url,
        &cfg.price_coin_id,
        &cfg.price_vs_currency,
        rpc_timeout,
    )?);
    let alloy_executor = AlloyExecutor::new(
        &cfg.target_rpc_url,
        cfg.private_key.expose(),
        cfg.payout_token,
        cfg.payout_confirmations,
        rpc_timeout,
        Duration::from_secs(cfg.confirmation_timeout_secs),
    )?;
    info!("Payouts sent from {}", alloy_executor.wallet_address());
    let executor: Arc<dyn PayoutExecutor> = Arc::new(alloy_executor);

    let (queue, receiver) = queue::swap_queue();

    let settler = queue::Settler::new(
        Arc::clone(&ledger),
        PriceResolver::new(feed, Arc::clone(&chain)),
        executor,
        cfg.listener_address,
    );
    let settler_handle = tokio::spawn(settler.run(receiver));

    // Catch up before following the chain live
    let scanner = Arc::new(RecoveryScanner::new(
        Arc::clone(&chain),
        Arc::clone(&ledger),
        queue.clone(),
        cfg.source_token,
        cfg.listener_address,
        cfg.genesis_block,
        cfg.scan_chunk_size,
        cfg.scan_concurrency,
    ));
    let start_after = match scanner.run().await {
        Ok(report) => {
            info!("Startup scan queued {} deposits up to block {}", report.enqueued, report.head);
            Some(report.head)
        }
        Err(e) => {
            warn!("Startup scan failed, following from the current head: {:?}", e);
            None
        }
    };

    let watcher = ChainWatcher::new(
        Arc::clone(&chain),
        queue.clone(),
        cfg.source_token,
        cfg.listener_address,
        cfg.confirmations,
        Duration::from_secs(cfg.poll_interval_secs),
    );
    let watcher_handle = tokio::spawn(watcher.run(start_after));

    let reclaimer = RetryReclaimer::new(Arc::clone(&ledger), queue.clone());
    let reclaimer_handle =
        tokio::spawn(reclaimer.run(Duration::from_secs(cfg.reclaim_interval_secs)));

    let api_handle = tokio::spawn(api::serve(
        cfg.port,
        api::ApiState { queue, ledger, scanner },
    ));

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = watcher_handle => match res {
            Ok(Ok(_)) => info!("Watcher exited cleanly"),
            Ok(Err(e)) => error!("Watcher error: {:?}", e),
            Err(e) => error!("Watcher task panicked: {:?}", e),
        },
        res = reclaimer_handle => if let Err(e) = res {
            error!("Reclaimer task panicked: {:?}", e);
        },
        res = settler_handle => if let Err(e) = res {
            error!("Settlement worker panicked: {:?}", e);
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Swap settler stopped.");
    Ok(())
}

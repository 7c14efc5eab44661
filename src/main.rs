//! Rental Market Maker - keeps a wallet's NFT rental listings in line with the ledger
//!
//! Each invocation runs one reconciliation pass over the wallet's tracked
//! assets: stale or expired listings are canceled and relisted at adjusted
//! prices, and held assets without a listing are put up for rent. Scheduling
//! and overlap prevention are left to the caller (cron, systemd timer).

use anyhow::Result;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

mod chain;
mod config;
mod error;
mod events;
mod index;
mod metrics;
mod pricing;
mod reconcile;
mod state;
mod tx;

use chain::{ChainProvider, LendingContract};
use config::Settings;
use error::MarketError;
use index::HttpLoanIndex;
use reconcile::MarketMaker;
use tx::{EthersLedger, GasEstimator, TransactionSender};

/// Exit status when the ledger health gate fails
const EXIT_UNHEALTHY: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Rental Market Maker v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let collections = settings.chain.collection_addresses()?;
    info!(
        "Loaded configuration for {} ({} collections)",
        settings.chain.name,
        collections.len()
    );

    // Chain connections
    let lending = LendingContract::new(settings.chain.lending_address()?);
    let provider = Arc::new(ChainProvider::new(settings.chain.clone(), lending)?);

    // Signer and transaction lifecycle
    let wallet = EthersLedger::load_wallet(&settings.wallet.private_key_env)?;
    let ledger = EthersLedger::new(provider.clone(), wallet);
    let wallet_address = ledger.address();
    let gas_estimator = GasEstimator::new(&settings.tx, Some(provider.max_gas_price()));
    let sender = TransactionSender::new(
        ledger,
        lending,
        gas_estimator,
        settings.tx.clone(),
        settings.chain.confirmation_blocks,
        settings.chain.price_decimals,
    )?;

    let mut market_maker = MarketMaker::new(
        provider,
        Arc::new(sender),
        wallet_address,
        collections,
        settings.market.clone(),
        settings.store.path.clone(),
    )
    .with_metrics_textfile(settings.metrics.textfile_path.clone());

    if let Some(index_config) = settings.loan_index.as_ref().filter(|c| c.prefer) {
        info!("Using loan index at {}", index_config.url);
        market_maker = market_maker.with_loan_index(Arc::new(HttpLoanIndex::new(index_config)?));
    }

    match market_maker.run_pass().await {
        Ok(report) => {
            if !report.failed.is_empty() {
                info!("{} assets will be retried next pass", report.failed.len());
            }
            Ok(())
        }
        Err(MarketError::Unhealthy(reason)) => {
            error!("Pass skipped, ledger unhealthy: {}", reason);
            process::exit(EXIT_UNHEALTHY);
        }
        Err(e) => {
            error!("Pass failed: {}", e);
            Err(e.into())
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,rental_market_maker=debug,hyper=warn,reqwest=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

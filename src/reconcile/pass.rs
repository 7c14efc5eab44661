//! One full reconciliation pass

use super::{DiscoveryScanner, PassReport, ReconciliationEngine};
use crate::chain::{ChainReader, LoanSnapshot};
use crate::config::MarketConfig;
use crate::error::{MarketError, MarketResult};
use crate::index::{snapshots_by_loan_id, LoanIndex};
use crate::metrics;
use crate::state::TrackingStore;
use crate::tx::ListingSubmitter;

use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Drives the engine and discovery over one wallet's tracking store
pub struct MarketMaker {
    chain: Arc<dyn ChainReader>,
    submitter: Arc<dyn ListingSubmitter>,
    loan_index: Option<Arc<dyn LoanIndex>>,
    wallet: Address,
    collections: Vec<Address>,
    config: MarketConfig,
    store_path: PathBuf,
    metrics_textfile: Option<PathBuf>,
}

impl MarketMaker {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        submitter: Arc<dyn ListingSubmitter>,
        wallet: Address,
        collections: Vec<Address>,
        config: MarketConfig,
        store_path: PathBuf,
    ) -> Self {
        Self {
            chain,
            submitter,
            loan_index: None,
            wallet,
            collections,
            config,
            store_path,
            metrics_textfile: None,
        }
    }

    pub fn with_loan_index(mut self, index: Arc<dyn LoanIndex>) -> Self {
        self.loan_index = Some(index);
        self
    }

    pub fn with_metrics_textfile(mut self, path: Option<PathBuf>) -> Self {
        self.metrics_textfile = path;
        self
    }

    pub async fn run_pass(&self) -> MarketResult<PassReport> {
        let started = Instant::now();

        if let Err(e) = self.chain.health_check().await {
            error!("Ledger health check failed, skipping pass: {}", e);
            metrics::record_health(false);
            self.write_metrics();
            return Err(MarketError::Unhealthy(e.to_string()));
        }
        metrics::record_health(true);

        let mut store = TrackingStore::load(&self.store_path).map_err(|e| {
            MarketError::Store(format!("cannot load {:?}: {}", self.store_path, e))
        })?;
        info!("Pass started with {} tracked assets", store.len());

        let engine = ReconciliationEngine::new(
            self.chain.clone(),
            self.submitter.clone(),
            self.wallet,
            self.collections.clone(),
            self.config.clone(),
        )
        .with_indexed_loans(self.prefetch_loans().await);
        let discovery = DiscoveryScanner::new(
            self.chain.clone(),
            self.submitter.clone(),
            self.wallet,
            self.collections.clone(),
            self.config.clone(),
        );

        let mut report = PassReport::default();
        let mut attempted = HashSet::new();
        engine
            .reconcile_all(&mut store, &mut report, &mut attempted)
            .await;
        discovery.scan(&mut store, &mut attempted, &mut report).await;

        store.persist()?;

        let listed = store.listed_count();
        metrics::record_tracked_assets(listed, store.len() - listed);
        metrics::record_pass_duration(started.elapsed().as_secs_f64());
        self.write_metrics();

        info!(
            "Pass complete in {:?}: listed={} relisted={} canceled={} dropped={} repriced={} flagged={:?} failed={:?}",
            started.elapsed(),
            report.listed,
            report.relisted,
            report.canceled,
            report.dropped,
            report.repriced,
            report.flagged,
            report.failed
        );
        Ok(report)
    }

    async fn prefetch_loans(&self) -> HashMap<u64, LoanSnapshot> {
        let index = match &self.loan_index {
            Some(index) => index,
            None => return HashMap::new(),
        };

        match index.loans_of(self.wallet).await {
            Ok(loans) => {
                info!("Loan index reported {} loans", loans.len());
                snapshots_by_loan_id(&loans)
            }
            Err(e) => {
                warn!("Loan index unavailable, reading loans from chain: {}", e);
                HashMap::new()
            }
        }
    }

    fn write_metrics(&self) {
        if let Some(path) = &self.metrics_textfile {
            if let Err(e) = metrics::write_textfile(path) {
                warn!("Failed to write metrics textfile {:?}: {}", path, e);
            }
        }
    }
}

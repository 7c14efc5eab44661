//! Per-asset state evaluation and action dispatch
//!
//! Classification is a pure function of the local record, the loan snapshot
//! and the clock. Effects (cancel, unbundle wait, relist) live in one
//! dispatcher per state so the decision table can be tested without a ledger.

use super::{submit_listing, PassReport};
use crate::chain::{ChainReader, LoanSnapshot};
use crate::config::MarketConfig;
use crate::metrics;
use crate::pricing::{unix_now, PricingPolicy};
use crate::state::{RentalRecord, TrackingStore};
use crate::tx::ListingSubmitter;

use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a tracked asset stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    /// No loan id recorded
    NoActiveLoan,
    HasActiveLoan(LoanStatus),
}

/// Classification of a recorded loan against its chain snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanStatus {
    /// The lending contract does not know the loan
    Unknown,
    Canceled,
    /// The loan belongs to another wallet now
    Transferred,
    Expired { rented_quickly: bool },
    Rented,
    /// Unrented past the staleness threshold and still above the floor
    Stale,
    Quiet,
}

/// Classify a record given the snapshot of its loan (`None` if unknown).
///
/// Priority: canceled, transferred, expired, rented, stale, quiet. An expired
/// loan is always recycled even if it would also count as stale.
pub fn classify(
    record: &RentalRecord,
    snapshot: Option<&LoanSnapshot>,
    wallet: Address,
    policy: &PricingPolicy,
    now: u64,
) -> AssetState {
    if record.loan_id.is_none() {
        return AssetState::NoActiveLoan;
    }

    let loan = match snapshot {
        Some(loan) => loan,
        None => return AssetState::HasActiveLoan(LoanStatus::Unknown),
    };

    // An end time of zero means the listing has not been taken yet
    let expired = loan.end_time > 0 && policy.is_expired(loan.end_time, now);
    let stale = record
        .listed_at
        .map_or(false, |listed_at| policy.is_stale_listing(listed_at, now));

    let status = if loan.canceled {
        LoanStatus::Canceled
    } else if loan.owner != wallet {
        LoanStatus::Transferred
    } else if expired {
        LoanStatus::Expired {
            rented_quickly: policy.was_rented_quickly(record.listed_at, loan.starting_time),
        }
    } else if loan.is_rented() {
        LoanStatus::Rented
    } else if stale && policy.can_decrease(record.price) {
        LoanStatus::Stale
    } else {
        LoanStatus::Quiet
    };

    AssetState::HasActiveLoan(status)
}

/// Brings tracked records in line with the ledger, one asset at a time
pub struct ReconciliationEngine {
    chain: Arc<dyn ChainReader>,
    submitter: Arc<dyn ListingSubmitter>,
    wallet: Address,
    collections: Vec<Address>,
    policy: PricingPolicy,
    config: MarketConfig,
    /// Snapshots prefetched from the loan index, consulted before the chain
    indexed_loans: HashMap<u64, LoanSnapshot>,
}

impl ReconciliationEngine {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        submitter: Arc<dyn ListingSubmitter>,
        wallet: Address,
        collections: Vec<Address>,
        config: MarketConfig,
    ) -> Self {
        Self {
            chain,
            submitter,
            wallet,
            collections,
            policy: config.policy(),
            config,
            indexed_loans: HashMap::new(),
        }
    }

    pub fn with_indexed_loans(mut self, loans: HashMap<u64, LoanSnapshot>) -> Self {
        self.indexed_loans = loans;
        self
    }

    /// Evaluate every tracked record in ascending token order.
    ///
    /// Token ids settled this pass (create attempted, or cancel/relist begun)
    /// are added to `attempted` so discovery leaves them alone.
    pub async fn reconcile_all(
        &self,
        store: &mut TrackingStore,
        report: &mut PassReport,
        attempted: &mut HashSet<u64>,
    ) {
        for token_id in store.token_ids() {
            if let Some(record) = store.get_mut(token_id) {
                self.reconcile(token_id, record, report, attempted).await;
            }
        }
    }

    pub async fn reconcile(
        &self,
        token_id: u64,
        record: &mut RentalRecord,
        report: &mut PassReport,
        attempted: &mut HashSet<u64>,
    ) {
        let snapshot = match record.loan_id {
            None => None,
            Some(loan_id) => match self.lookup_loan(loan_id).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    warn!(
                        "Token {}: cannot read loan {} ({}); leaving record as is this pass",
                        token_id, loan_id, e
                    );
                    return;
                }
            },
        };

        let state = classify(record, snapshot.as_ref(), self.wallet, &self.policy, unix_now());
        debug!("Token {} classified as {:?}", token_id, state);

        match (state, record.loan_id) {
            (AssetState::HasActiveLoan(status), Some(loan_id)) => {
                self.handle_listed(token_id, loan_id, status, record, report, attempted)
                    .await
            }
            _ => self.handle_unlisted(token_id, record, report, attempted).await,
        }
    }

    async fn lookup_loan(&self, loan_id: u64) -> crate::error::MarketResult<LoanSnapshot> {
        if let Some(snapshot) = self.indexed_loans.get(&loan_id) {
            return Ok(snapshot.clone());
        }
        self.chain.loan_snapshot(loan_id).await
    }

    /// First candidate collection in which the wallet holds `token_id`
    async fn locate(&self, token_id: u64, record: &RentalRecord) -> Option<Address> {
        let candidates = match record.collection() {
            Some(collection) => vec![collection],
            None => self.collections.clone(),
        };

        for collection in candidates {
            match self.chain.owner_of(collection, token_id).await {
                Ok(owner) if owner == self.wallet => return Some(collection),
                Ok(owner) => {
                    debug!("Token {} in {:?} is held by {:?}", token_id, collection, owner)
                }
                Err(e) => debug!("Token {} not found in {:?}: {}", token_id, collection, e),
            }
        }
        None
    }

    async fn handle_unlisted(
        &self,
        token_id: u64,
        record: &mut RentalRecord,
        report: &mut PassReport,
        attempted: &mut HashSet<u64>,
    ) {
        let collection = match self.locate(token_id, record).await {
            Some(collection) => collection,
            None => {
                debug!("Token {} is not held by this wallet; keeping its history", token_id);
                return;
            }
        };

        if record.collection() != Some(collection) {
            info!("Token {} resolved to collection {:?}", token_id, collection);
            record.set_collection(collection);
        }

        match self.chain.is_bundled(collection, token_id).await {
            Ok(true) => report.flag(token_id, collection),
            Ok(false) => {
                attempted.insert(token_id);
                if submit_listing(self.submitter.as_ref(), collection, token_id, record).await {
                    report.listed += 1;
                    metrics::record_action("list");
                } else {
                    report.fail(token_id);
                }
            }
            Err(e) => warn!(
                "Token {}: bundled status unavailable ({}); not listing this pass",
                token_id, e
            ),
        }
    }

    async fn handle_listed(
        &self,
        token_id: u64,
        loan_id: u64,
        status: LoanStatus,
        record: &mut RentalRecord,
        report: &mut PassReport,
        attempted: &mut HashSet<u64>,
    ) {
        match status {
            LoanStatus::Unknown => {
                self.drop_loan(token_id, loan_id, record, report, "unknown_loan")
            }
            LoanStatus::Canceled => {
                self.drop_loan(token_id, loan_id, record, report, "canceled_elsewhere")
            }
            LoanStatus::Transferred => {
                self.drop_loan(token_id, loan_id, record, report, "owner_changed")
            }
            LoanStatus::Rented => debug!("Token {} is rented under loan {}", token_id, loan_id),
            LoanStatus::Quiet => debug!("Token {} listed as loan {}; no action", token_id, loan_id),
            LoanStatus::Expired { rented_quickly } => {
                let price = if rented_quickly {
                    self.policy.increase(record.price)
                } else {
                    record.price
                };
                self.cancel_and_relist(token_id, loan_id, price, record, report, attempted, "expired")
                    .await
            }
            LoanStatus::Stale => {
                let price = self.policy.decrease(record.price);
                self.cancel_and_relist(token_id, loan_id, price, record, report, attempted, "stale")
                    .await
            }
        }
    }

    fn drop_loan(
        &self,
        token_id: u64,
        loan_id: u64,
        record: &mut RentalRecord,
        report: &mut PassReport,
        reason: &str,
    ) {
        info!("Token {}: dropping loan {} ({})", token_id, loan_id, reason);
        record.clear_loan();
        report.dropped += 1;
        metrics::record_state_drift(reason);
    }

    /// Cancel `loan_id`, wait for the asset to unbundle, relist at `price`.
    ///
    /// Any failure clears the loan reference so the next pass starts over.
    /// The asset counts as attempted from the start, so discovery cannot
    /// list it again in the same pass.
    #[allow(clippy::too_many_arguments)]
    async fn cancel_and_relist(
        &self,
        token_id: u64,
        loan_id: u64,
        price: u64,
        record: &mut RentalRecord,
        report: &mut PassReport,
        attempted: &mut HashSet<u64>,
        reason: &str,
    ) {
        let collection = match self.locate_listed(token_id, record).await {
            Some(collection) => collection,
            None => {
                self.drop_loan(token_id, loan_id, record, report, "collection_unknown");
                return;
            }
        };

        attempted.insert(token_id);
        info!(
            "Token {}: loan {} is {}, canceling [{}]",
            token_id,
            loan_id,
            reason,
            record.bundle_uuid.as_deref().unwrap_or("-")
        );

        if !self.submitter.cancel(loan_id).await {
            error!("Token {}: cancel of loan {} failed; dropping reference", token_id, loan_id);
            record.clear_loan();
            report.fail(token_id);
            return;
        }
        report.canceled += 1;
        metrics::record_action("cancel");
        record.clear_loan();

        if !self.await_unbundled(collection, token_id).await {
            warn!(
                "Token {} still bundled {:?} after canceling loan {}; re-evaluating next pass",
                token_id,
                self.config.unbundle_timeout(),
                loan_id
            );
            report.fail(token_id);
            return;
        }

        if price != record.price {
            info!("Token {}: price {} -> {} ({})", token_id, record.price, price, reason);
            record.price = price;
            report.repriced += 1;
        }

        if submit_listing(self.submitter.as_ref(), collection, token_id, record).await {
            report.relisted += 1;
            metrics::record_action("relist");
        } else {
            report.fail(token_id);
        }
    }

    /// Collection of a listed asset, probing candidates when unrecorded
    async fn locate_listed(&self, token_id: u64, record: &mut RentalRecord) -> Option<Address> {
        if let Some(collection) = record.collection() {
            return Some(collection);
        }
        let collection = self.locate(token_id, record).await?;
        record.set_collection(collection);
        Some(collection)
    }

    /// Poll bundled status until false or the unbundle timeout elapses
    async fn await_unbundled(&self, collection: Address, token_id: u64) -> bool {
        let deadline = Instant::now() + self.config.unbundle_timeout();

        loop {
            match self.chain.is_bundled(collection, token_id).await {
                Ok(false) => return true,
                Ok(true) => debug!("Token {} still bundled", token_id),
                Err(e) => warn!("Token {}: bundled status check failed: {}", token_id, e),
            }

            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.unbundle_poll_interval()).await;
        }
    }
}

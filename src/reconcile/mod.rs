//! Reconciliation of tracked rentals against chain state
//!
//! A pass:
//! 1. Gates on ledger health
//! 2. Loads the tracking store
//! 3. Evaluates every tracked record (`engine`)
//! 4. Lists held assets the store does not cover (`discovery`)
//! 5. Persists the store

pub mod discovery;
pub mod engine;
pub mod pass;

#[cfg(test)]
mod fake;

pub use discovery::DiscoveryScanner;
pub use engine::ReconciliationEngine;
pub use pass::MarketMaker;

use crate::metrics;
use crate::pricing::unix_now;
use crate::state::RentalRecord;
use crate::tx::{CreatedListing, ListingSubmitter};

use ethers::types::Address;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Fresh listings of unlisted assets
    pub listed: usize,
    /// Listings replaced after cancellation
    pub relisted: usize,
    pub canceled: usize,
    /// Loan references dropped to match chain state
    pub dropped: usize,
    pub repriced: usize,
    /// Assets already bundled on chain while we believed them unlisted
    pub flagged: BTreeSet<u64>,
    pub failed: BTreeSet<u64>,
}

impl PassReport {
    pub fn flag(&mut self, token_id: u64, collection: Address) {
        warn!(
            "Token {} in {:?} is bundled on chain but not tracked as listed; skipping until state converges",
            token_id, collection
        );
        metrics::record_state_drift("bundled_untracked");
        self.flagged.insert(token_id);
    }

    pub fn fail(&mut self, token_id: u64) {
        self.failed.insert(token_id);
    }
}

/// Submit a listing for one asset and record the outcome on `record`
pub(crate) async fn submit_listing(
    submitter: &dyn ListingSubmitter,
    collection: Address,
    token_id: u64,
    record: &mut RentalRecord,
) -> bool {
    match submitter
        .create_listing(&[collection], &[token_id], record.price)
        .await
    {
        Some(CreatedListing {
            loan_id,
            bundle_uuid,
        }) => {
            info!(
                "Token {} listed at {} as loan {} [{}]",
                token_id, record.price, loan_id, bundle_uuid
            );
            record.mark_listed(loan_id, bundle_uuid, unix_now());
            true
        }
        None => {
            warn!(
                "Token {} could not be listed at {}; will retry next pass",
                token_id, record.price
            );
            record.clear_loan();
            false
        }
    }
}

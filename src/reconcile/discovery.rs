//! Discovery of held assets the store does not account for

use super::{submit_listing, PassReport};
use crate::chain::ChainReader;
use crate::config::MarketConfig;
use crate::metrics;
use crate::state::{RentalRecord, TrackingStore};
use crate::tx::ListingSubmitter;

use ethers::types::Address;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DiscoveryScanner {
    chain: Arc<dyn ChainReader>,
    submitter: Arc<dyn ListingSubmitter>,
    wallet: Address,
    collections: Vec<Address>,
    config: MarketConfig,
}

impl DiscoveryScanner {
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
            config,
        }
    }

    /// Whether a held token still needs a listing given what the store says
    fn needs_listing(record: Option<&RentalRecord>, collection: Address) -> bool {
        match record {
            None => true,
            Some(record) => match record.collection() {
                Some(recorded) if recorded != collection => true,
                _ => !record.has_active_loan(),
            },
        }
    }

    /// List every held, unbundled token that is untracked or mistracked.
    ///
    /// Tokens in `attempted` already had their one create attempt this pass.
    pub async fn scan(
        &self,
        store: &mut TrackingStore,
        attempted: &mut HashSet<u64>,
        report: &mut PassReport,
    ) {
        let mut submitted_any = false;

        for &collection in &self.collections {
            let tokens = match self.chain.tokens_of_owner(collection, self.wallet).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!("Cannot enumerate holdings in {:?}: {}", collection, e);
                    continue;
                }
            };
            debug!("Wallet holds {} tokens in {:?}", tokens.len(), collection);

            for token_id in tokens {
                if attempted.contains(&token_id)
                    || !Self::needs_listing(store.get(token_id), collection)
                {
                    continue;
                }

                match self.chain.is_bundled(collection, token_id).await {
                    Ok(true) => {
                        report.flag(token_id, collection);
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Token {}: bundled status unavailable ({}); skipping", token_id, e);
                        continue;
                    }
                }

                if submitted_any {
                    tokio::time::sleep(self.config.inter_listing_delay()).await;
                }
                submitted_any = true;

                let price = store
                    .get(token_id)
                    .map(|record| record.price)
                    .unwrap_or(self.config.default_price);
                let mut record = RentalRecord::new(collection, price);
                if let Some(previous) = store.get(token_id) {
                    record.listed_at = previous.listed_at;
                }

                info!("Discovered token {} in {:?}; listing at {}", token_id, collection, price);
                attempted.insert(token_id);
                if submit_listing(self.submitter.as_ref(), collection, token_id, &mut record).await {
                    report.listed += 1;
                    metrics::record_action("discover");
                } else {
                    report.fail(token_id);
                }
                store.insert(token_id, record);
            }
        }
    }
}

//! In-memory ledger for reconciliation tests
//!
//! Keeps ownership, bundled flags and loans consistent across calls so that
//! multi-step flows (cancel, unbundle, relist) and repeated passes behave
//! the way they would against a real lending contract.

use crate::chain::{ChainReader, LoanSnapshot};
use crate::config::MarketConfig;
use crate::error::{MarketError, MarketResult};
use crate::tx::{CreatedListing, ListingSubmitter};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub fn wallet() -> Address {
    Address::from_low_u64_be(0xa11ce)
}

pub fn collection_a() -> Address {
    Address::from_low_u64_be(0xc0a)
}

pub fn collection_b() -> Address {
    Address::from_low_u64_be(0xc0b)
}

/// Market settings with no waiting between steps
pub fn market_config() -> MarketConfig {
    MarketConfig {
        default_price: 10,
        price_floor: 3,
        stale_after_days: 3,
        quick_rental_minutes: 180,
        inter_listing_delay_ms: 0,
        unbundle_timeout_secs: 0,
        unbundle_poll_interval_ms: 1,
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub owners: HashMap<(Address, u64), Address>,
    pub bundled: HashSet<(Address, u64)>,
    pub loans: HashMap<u64, LoanSnapshot>,
    pub loan_assets: HashMap<u64, Vec<(Address, u64)>>,
    pub next_loan_id: u64,
    pub unhealthy: bool,
    pub fail_cancel: bool,
    pub fail_create: bool,
    /// Canceled listings keep their assets locked
    pub stuck_bundled: bool,
    /// Canceled listings release their assets only after this many polls
    pub release_after_polls: Option<u32>,
    pub pending_release: HashMap<(Address, u64), u32>,
    /// `getLoan` fails with a transport error
    pub loan_reads_fail: bool,
    pub cancels: Vec<u64>,
    pub creates: Vec<(Address, u64, u64)>,
}

pub struct FakeLedger {
    state: Mutex<FakeState>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_loan_id: 1000,
                ..Default::default()
            }),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Give `token_id` of `collection` to the test wallet
    pub fn hold(&self, collection: Address, token_id: u64) {
        self.with_state(|s| {
            s.owners.insert((collection, token_id), wallet());
        });
    }

    /// Register an existing loan over one asset; open loans lock the asset
    pub fn add_loan(&self, loan_id: u64, collection: Address, token_id: u64, loan: LoanSnapshot) {
        self.with_state(|s| {
            if !loan.canceled {
                s.bundled.insert((collection, token_id));
            }
            s.loans.insert(loan_id, loan);
            s.loan_assets.insert(loan_id, vec![(collection, token_id)]);
        });
    }

    pub fn cancels(&self) -> Vec<u64> {
        self.with_state(|s| s.cancels.clone())
    }

    pub fn creates(&self) -> Vec<(Address, u64, u64)> {
        self.with_state(|s| s.creates.clone())
    }
}

#[async_trait]
impl ChainReader for FakeLedger {
    async fn owner_of(&self, collection: Address, token_id: u64) -> MarketResult<Address> {
        self.with_state(|s| s.owners.get(&(collection, token_id)).copied())
            .ok_or_else(|| MarketError::not_found(format!("token {}", token_id)))
    }

    async fn loan_snapshot(&self, loan_id: u64) -> MarketResult<LoanSnapshot> {
        self.with_state(|s| {
            if s.loan_reads_fail {
                return Err(MarketError::ChainConnection("connection reset".to_string()));
            }
            s.loans
                .get(&loan_id)
                .cloned()
                .ok_or_else(|| MarketError::not_found(format!("loan {}", loan_id)))
        })
    }

    async fn is_bundled(&self, collection: Address, token_id: u64) -> MarketResult<bool> {
        let asset = (collection, token_id);
        Ok(self.with_state(|s| {
            let released = match s.pending_release.get_mut(&asset) {
                Some(0) => true,
                Some(remaining) => {
                    *remaining -= 1;
                    false
                }
                None => false,
            };
            if released {
                s.pending_release.remove(&asset);
                s.bundled.remove(&asset);
            }
            s.bundled.contains(&asset)
        }))
    }

    async fn tokens_of_owner(&self, collection: Address, owner: Address) -> MarketResult<Vec<u64>> {
        let mut tokens: Vec<u64> = self.with_state(|s| {
            s.owners
                .iter()
                .filter(|((c, _), o)| *c == collection && **o == owner)
                .map(|((_, token_id), _)| *token_id)
                .collect()
        });
        tokens.sort_unstable();
        Ok(tokens)
    }

    async fn health_check(&self) -> MarketResult<()> {
        if self.with_state(|s| s.unhealthy) {
            return Err(MarketError::ChainConnection("no blocks".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ListingSubmitter for FakeLedger {
    async fn cancel(&self, loan_id: u64) -> bool {
        self.with_state(|s| {
            s.cancels.push(loan_id);
            if s.fail_cancel {
                return false;
            }
            if let Some(loan) = s.loans.get_mut(&loan_id) {
                loan.canceled = true;
            }
            if !s.stuck_bundled {
                for asset in s.loan_assets.get(&loan_id).cloned().unwrap_or_default() {
                    match s.release_after_polls {
                        Some(polls) => {
                            s.pending_release.insert(asset, polls);
                        }
                        None => {
                            s.bundled.remove(&asset);
                        }
                    }
                }
            }
            true
        })
    }

    async fn create_listing(
        &self,
        collections: &[Address],
        token_ids: &[u64],
        price: u64,
    ) -> Option<CreatedListing> {
        self.with_state(|s| {
            for (collection, token_id) in collections.iter().zip(token_ids) {
                s.creates.push((*collection, *token_id, price));
            }
            if s.fail_create {
                return None;
            }

            let loan_id = s.next_loan_id;
            s.next_loan_id += 1;
            let bundle_uuid = format!("fake-{}", loan_id);
            let assets: Vec<(Address, u64)> = collections
                .iter()
                .copied()
                .zip(token_ids.iter().copied())
                .collect();
            for asset in &assets {
                s.bundled.insert(*asset);
            }
            s.loan_assets.insert(loan_id, assets);
            s.loans.insert(
                loan_id,
                LoanSnapshot {
                    owner: wallet(),
                    loanee: Address::zero(),
                    upfront_fee: U256::from(price),
                    starting_time: 0,
                    end_time: 0,
                    bundle_uuid: bundle_uuid.clone(),
                    canceled: false,
                },
            );

            Some(CreatedListing { loan_id, bundle_uuid })
        })
    }
}

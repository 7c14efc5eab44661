//! Chain module - read-only view of the ledger
//!
//! This module provides:
//! - The `ChainReader` seam consumed by reconciliation
//! - Multi-RPC provider management with automatic failover
//! - Call encoding for the lending and collection contracts

pub mod contracts;
pub mod provider;

pub use contracts::{ContractCall, LendingContract};
pub use provider::{ChainProvider, GasPrice};

use crate::error::MarketResult;

use async_trait::async_trait;
use ethers::types::{Address, U256};

/// Snapshot of one loan as the lending contract reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanSnapshot {
    pub owner: Address,
    /// Zero address while the listing is not rented
    pub loanee: Address,
    pub upfront_fee: U256,
    pub starting_time: u64,
    pub end_time: u64,
    pub bundle_uuid: String,
    pub canceled: bool,
}

impl LoanSnapshot {
    pub fn is_rented(&self) -> bool {
        !self.loanee.is_zero()
    }
}

/// Read-only ledger queries
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current owner of `token_id`; `NotFound` if the collection rejects the query
    async fn owner_of(&self, collection: Address, token_id: u64) -> MarketResult<Address>;

    /// `NotFound` if the lending contract does not know `loan_id`
    async fn loan_snapshot(&self, loan_id: u64) -> MarketResult<LoanSnapshot>;

    /// True while the asset is locked inside an active or pending listing
    async fn is_bundled(&self, collection: Address, token_id: u64) -> MarketResult<bool>;

    /// Every token of `collection` held by `owner`, via index-based paging
    async fn tokens_of_owner(&self, collection: Address, owner: Address) -> MarketResult<Vec<u64>>;

    /// Network liveness and identity gate
    async fn health_check(&self) -> MarketResult<()>;
}

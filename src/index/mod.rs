//! Loan index client
//!
//! Optional aggregation API listing every loan a wallet has created, with the
//! assets nested inside each one. When preferred in configuration, one query
//! per pass replaces the per-loan `getLoan` reads used to classify active
//! listings.

use crate::chain::LoanSnapshot;
use crate::config::LoanIndexConfig;
use crate::error::{MarketError, MarketResult};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Asset reference nested in an indexed loan
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedToken {
    pub collection: Address,
    pub token_id: u64,
}

/// One loan as the index reports it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedLoan {
    pub loan_id: u64,
    pub owner: Address,
    #[serde(default)]
    pub loanee: Address,
    /// Decimal string in the ledger's fixed-point unit
    #[serde(default)]
    pub upfront_fee: String,
    #[serde(default)]
    pub starting_time: u64,
    #[serde(default)]
    pub end_time: u64,
    #[serde(default, rename = "bundleUUID")]
    pub bundle_uuid: String,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub tokens: Vec<IndexedToken>,
}

impl IndexedLoan {
    pub fn snapshot(&self) -> LoanSnapshot {
        LoanSnapshot {
            owner: self.owner,
            loanee: self.loanee,
            upfront_fee: U256::from_dec_str(&self.upfront_fee).unwrap_or_default(),
            starting_time: self.starting_time,
            end_time: self.end_time,
            bundle_uuid: self.bundle_uuid.clone(),
            canceled: self.canceled,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoansResponse {
    loans: Vec<IndexedLoan>,
}

/// Read-only aggregation of a wallet's loans
#[async_trait]
pub trait LoanIndex: Send + Sync {
    async fn loans_of(&self, owner: Address) -> MarketResult<Vec<IndexedLoan>>;
}

/// Snapshots keyed by loan id
pub fn snapshots_by_loan_id(loans: &[IndexedLoan]) -> HashMap<u64, LoanSnapshot> {
    loans
        .iter()
        .map(|loan| (loan.loan_id, loan.snapshot()))
        .collect()
}

/// HTTP client for the loan index
pub struct HttpLoanIndex {
    client: Client,
    base_url: String,
}

impl HttpLoanIndex {
    pub fn new(config: &LoanIndexConfig) -> MarketResult<Self> {
        if config.url.trim().is_empty() {
            return Err(MarketError::Config("loan_index.url is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LoanIndex for HttpLoanIndex {
    async fn loans_of(&self, owner: Address) -> MarketResult<Vec<IndexedLoan>> {
        let url = format!("{}/loans/{:?}", self.base_url, owner);
        debug!("Querying loan index: {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Loan index returned {}: {}", status, body);
            return Err(MarketError::ChainConnection(format!(
                "loan index returned {}",
                status
            )));
        }

        let parsed: LoansResponse = response.json().await?;
        debug!("Loan index reports {} loans for {:?}", parsed.loans.len(), owner);
        Ok(parsed.loans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_url_is_a_config_error() {
        let config = LoanIndexConfig {
            url: "  ".to_string(),
            prefer: true,
            timeout_secs: 15,
        };
        assert!(matches!(HttpLoanIndex::new(&config), Err(MarketError::Config(_))));
    }

    #[test]
    fn test_decode_index_response() {
        let body = r#"{
            "loans": [{
                "loanId": 7,
                "owner": "0x00000000000000000000000000000000000000aa",
                "loanee": "0x0000000000000000000000000000000000000000",
                "upfrontFee": "5000000000000000000",
                "startingTime": 0,
                "endTime": 1700604800,
                "bundleUUID": "abc",
                "canceled": false,
                "tokens": [{"collection": "0x00000000000000000000000000000000000000bb", "tokenId": 42}]
            }]
        }"#;

        let parsed: LoansResponse = serde_json::from_str(body).unwrap();
        let loan = &parsed.loans[0];
        assert_eq!(loan.tokens[0].token_id, 42);

        let snapshots = snapshots_by_loan_id(&parsed.loans);
        let snapshot = &snapshots[&7];
        assert!(!snapshot.is_rented());
        assert_eq!(snapshot.upfront_fee, U256::from(5u64) * U256::exp10(18));
        assert_eq!(snapshot.owner, Address::from_low_u64_be(0xaa));
    }
}

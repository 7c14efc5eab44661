//! Transaction sender with retry logic and event-based result extraction

use super::gas::GasEstimator;
use super::ledger::LedgerWriter;
use crate::chain::contracts::scale_price;
use crate::chain::{ContractCall, LendingContract};
use crate::config::TxConfig;
use crate::error::{MarketError, MarketResult};
use crate::events::EventParser;
use crate::metrics;

use async_trait::async_trait;
use ethers::types::{Address, TransactionReceipt, U64};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a confirmed `createLoan`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedListing {
    pub loan_id: u64,
    /// Correlation token embedded in the listing call
    pub bundle_uuid: String,
}

/// Chain-mutating listing operations.
///
/// Implementations never fail past this boundary: exhausting the retry budget
/// is reported as `false` / `None`.
#[async_trait]
pub trait ListingSubmitter: Send + Sync {
    async fn cancel(&self, loan_id: u64) -> bool;

    async fn create_listing(
        &self,
        collections: &[Address],
        token_ids: &[u64],
        price: u64,
    ) -> Option<CreatedListing>;
}

/// Transaction sender with comprehensive retry and error handling
pub struct TransactionSender<L> {
    ledger: L,
    lending: LendingContract,
    events: EventParser,
    gas_estimator: GasEstimator,
    config: TxConfig,
    confirmation_blocks: usize,
    price_decimals: u32,
}

impl<L: LedgerWriter> TransactionSender<L> {
    /// Create a new transaction sender
    pub fn new(
        ledger: L,
        lending: LendingContract,
        gas_estimator: GasEstimator,
        config: TxConfig,
        confirmation_blocks: usize,
        price_decimals: u32,
    ) -> MarketResult<Self> {
        Ok(Self {
            ledger,
            lending,
            events: EventParser::new(&lending)?,
            gas_estimator,
            config,
            confirmation_blocks,
            price_decimals,
        })
    }

    /// One full lifecycle: fee bid, gas estimate, send, confirm
    async fn attempt(&self, call: &ContractCall) -> MarketResult<TransactionReceipt> {
        let suggested = self.ledger.suggested_gas_price().await?;
        let gas_price = self.gas_estimator.bid(&suggested);
        let estimate = self.ledger.estimate_gas(call).await?;
        let gas_limit = self.gas_estimator.gas_limit(estimate);

        let tx_hash = self.ledger.send(call, gas_limit, &gas_price).await?;
        info!("Transaction sent: {:?}", tx_hash);

        let receipt = match self
            .ledger
            .wait_for_receipt(tx_hash, self.confirmation_blocks, self.config.confirmation_timeout())
            .await
        {
            Ok(receipt) => receipt,
            Err(e) if e.is_timeout() => {
                warn!("{}; fetching receipt for {:?} directly", e, tx_hash);
                self.ledger.get_receipt(tx_hash).await?
            }
            Err(e) => return Err(e),
        };

        let receipt = receipt.ok_or_else(|| MarketError::ReceiptMissing {
            tx_hash: format!("{:?}", tx_hash),
        })?;

        if receipt.status != Some(U64::from(1u64)) {
            return Err(MarketError::Reverted {
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        debug!(
            "Transaction {:?} confirmed in block {:?}",
            tx_hash, receipt.block_number
        );
        Ok(receipt)
    }

    fn log_failure(&self, operation: &str, context: &str, attempt: u32, e: &MarketError) {
        let max_attempts = self.config.max_attempts;
        if e.is_retryable() {
            warn!(
                "{} {} failed with transient error (attempt {}/{}): {}",
                operation, context, attempt, max_attempts, e
            );
        } else {
            error!(
                "{} {} failed (attempt {}/{}): {}",
                operation, context, attempt, max_attempts, e
            );
        }
        metrics::record_tx_attempt(operation, "failed");
    }

    async fn pause_before_retry(&self, attempt: u32) {
        if attempt < self.config.max_attempts {
            tokio::time::sleep(self.config.retry_delay()).await;
        }
    }
}

#[async_trait]
impl<L: LedgerWriter> ListingSubmitter for TransactionSender<L> {
    async fn cancel(&self, loan_id: u64) -> bool {
        let call = match self.lending.cancel_loan(loan_id) {
            Ok(call) => call,
            Err(e) => {
                error!("Cannot encode cancel for loan {}: {}", loan_id, e);
                return false;
            }
        };
        let context = format!("for loan {}", loan_id);

        for attempt in 1..=self.config.max_attempts {
            match self.attempt(&call).await {
                Ok(receipt) => {
                    info!(
                        "Canceled loan {} in {:?} (attempt {}/{})",
                        loan_id, receipt.transaction_hash, attempt, self.config.max_attempts
                    );
                    metrics::record_tx_attempt("cancel", "confirmed");
                    return true;
                }
                Err(e) => self.log_failure("cancel", &context, attempt, &e),
            }
            self.pause_before_retry(attempt).await;
        }

        error!("Giving up on cancel {} after {} attempts", context, self.config.max_attempts);
        false
    }

    async fn create_listing(
        &self,
        collections: &[Address],
        token_ids: &[u64],
        price: u64,
    ) -> Option<CreatedListing> {
        let upfront_fee = scale_price(price, self.price_decimals);

        for attempt in 1..=self.config.max_attempts {
            let bundle_uuid = Uuid::new_v4().to_string();
            let context = format!("of tokens {:?} at {} [{}]", token_ids, price, bundle_uuid);

            let result = match self
                .lending
                .create_loan(collections, token_ids, upfront_fee, &bundle_uuid)
            {
                Ok(call) => self.attempt(&call).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(receipt) => match self.events.find_listing_created(&receipt, &bundle_uuid) {
                    Some(event) => {
                        info!(
                            "Listed tokens {:?} at {} as loan {} [{}] (attempt {}/{})",
                            token_ids,
                            price,
                            event.loan_id,
                            bundle_uuid,
                            attempt,
                            self.config.max_attempts
                        );
                        metrics::record_tx_attempt("create", "confirmed");
                        return Some(CreatedListing {
                            loan_id: event.loan_id,
                            bundle_uuid,
                        });
                    }
                    None => {
                        let e = MarketError::EventParsing(format!(
                            "no LoanCreated event in {:?}",
                            receipt.transaction_hash
                        ));
                        self.log_failure("create", &context, attempt, &e);
                    }
                },
                Err(e) => self.log_failure("create", &context, attempt, &e),
            }
            self.pause_before_retry(attempt).await;
        }

        error!(
            "Giving up on listing tokens {:?} after {} attempts",
            token_ids, self.config.max_attempts
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::GasPrice;
    use crate::events::tests::{lending, loan_created_log};
    use crate::tx::ledger::MockLedgerWriter;
    use ethers::types::{H256, U256};

    fn config() -> TxConfig {
        TxConfig {
            retry_delay_ms: 0,
            ..TxConfig::default()
        }
    }

    fn sender(ledger: MockLedgerWriter) -> TransactionSender<MockLedgerWriter> {
        let config = config();
        TransactionSender::new(
            ledger,
            lending(),
            GasEstimator::new(&config, None),
            config,
            2,
            18,
        )
        .unwrap()
    }

    fn receipt(status: u64, logs: Vec<ethers::types::Log>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::from_low_u64_be(0xabc),
            status: Some(U64::from(status)),
            logs,
            ..Default::default()
        }
    }

    /// Ledger whose fee and gas queries always succeed
    fn ledger_with_fees() -> MockLedgerWriter {
        let mut ledger = MockLedgerWriter::new();
        ledger
            .expect_suggested_gas_price()
            .returning(|| Ok(GasPrice::Legacy(U256::from(100u64))));
        ledger
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(200_000u64)));
        ledger
    }

    #[tokio::test]
    async fn test_create_listing_extracts_loan_id() {
        let mut ledger = ledger_with_fees();
        ledger
            .expect_send()
            .withf(|_, gas_limit, gas_price| {
                *gas_limit == U256::from(300_000u64)
                    && *gas_price == GasPrice::Legacy(U256::from(125u64))
            })
            .times(1)
            .returning(|_, _, _| Ok(H256::from_low_u64_be(1)));
        ledger
            .expect_wait_for_receipt()
            .times(1)
            .returning(|_, _, _| Ok(Some(receipt(1, vec![loan_created_log(&lending(), 55, "t")]))));

        let created = sender(ledger)
            .create_listing(&[Address::from_low_u64_be(1)], &[42], 5)
            .await
            .unwrap();
        assert_eq!(created.loan_id, 55);
        assert!(Uuid::parse_str(&created.bundle_uuid).is_ok());
    }

    #[tokio::test]
    async fn test_wait_timeout_falls_back_to_receipt_fetch() {
        let mut ledger = ledger_with_fees();
        ledger
            .expect_send()
            .times(1)
            .returning(|_, _, _| Ok(H256::from_low_u64_be(1)));
        ledger.expect_wait_for_receipt().times(1).returning(|_, _, _| {
            Err(MarketError::Timeout {
                operation: "confirmations".to_string(),
            })
        });
        ledger
            .expect_get_receipt()
            .times(1)
            .returning(|_| Ok(Some(receipt(1, vec![]))));

        assert!(sender(ledger).cancel(7).await);
    }

    #[tokio::test]
    async fn test_non_timeout_wait_error_skips_receipt_fetch() {
        let mut ledger = ledger_with_fees();
        ledger
            .expect_send()
            .times(3)
            .returning(|_, _, _| Ok(H256::from_low_u64_be(1)));
        ledger
            .expect_wait_for_receipt()
            .times(3)
            .returning(|_, _, _| Err(MarketError::Transaction("dropped".to_string())));
        ledger.expect_get_receipt().never();

        assert!(!sender(ledger).cancel(7).await);
    }

    #[tokio::test]
    async fn test_revert_exhausts_retry_budget() {
        let mut ledger = ledger_with_fees();
        ledger
            .expect_send()
            .times(3)
            .returning(|_, _, _| Ok(H256::from_low_u64_be(1)));
        ledger
            .expect_wait_for_receipt()
            .times(3)
            .returning(|_, _, _| Ok(Some(receipt(0, vec![]))));

        let created = sender(ledger)
            .create_listing(&[Address::from_low_u64_be(1)], &[42], 5)
            .await;
        assert!(created.is_none());
    }

    #[tokio::test]
    async fn test_missing_event_is_a_failed_attempt() {
        let mut ledger = ledger_with_fees();
        ledger
            .expect_send()
            .times(3)
            .returning(|_, _, _| Ok(H256::from_low_u64_be(1)));
        ledger
            .expect_wait_for_receipt()
            .times(3)
            .returning(|_, _, _| Ok(Some(receipt(1, vec![]))));

        let created = sender(ledger)
            .create_listing(&[Address::from_low_u64_be(1)], &[42], 5)
            .await;
        assert!(created.is_none());
    }

    #[tokio::test]
    async fn test_transient_send_error_is_retried() {
        let mut ledger = ledger_with_fees();
        let mut calls = 0;
        ledger.expect_send().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(MarketError::ChainConnection("request timed out".to_string()))
            } else {
                Ok(H256::from_low_u64_be(2))
            }
        });
        ledger
            .expect_wait_for_receipt()
            .times(1)
            .returning(|_, _, _| Ok(Some(receipt(1, vec![]))));

        assert!(sender(ledger).cancel(9).await);
    }

    #[tokio::test]
    async fn test_missing_receipt_after_timeout_fails_attempt() {
        let mut ledger = ledger_with_fees();
        ledger
            .expect_send()
            .times(3)
            .returning(|_, _, _| Ok(H256::from_low_u64_be(1)));
        ledger.expect_wait_for_receipt().times(3).returning(|_, _, _| {
            Err(MarketError::Timeout {
                operation: "confirmations".to_string(),
            })
        });
        ledger.expect_get_receipt().times(3).returning(|_| Ok(None));

        assert!(!sender(ledger).cancel(7).await);
    }
}

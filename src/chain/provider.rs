//! Chain provider with multi-RPC support and automatic failover

use super::contracts::{CollectionContract, ContractCall, LendingContract};
use super::{ChainReader, LoanSnapshot};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{MarketError, MarketResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Upper bound on slots reserved up front for `balanceOf`-driven paging
const MAX_PREALLOCATED_TOKENS: u64 = 1024;

/// Reservation for an enumeration of `balance` tokens; the reported balance
/// is untrusted, so the vector grows past the cap as ids actually arrive
fn enumeration_capacity(balance: u64) -> usize {
    balance.min(MAX_PREALLOCATED_TOKENS) as usize
}

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    lending: LendingContract,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig, lending: LendingContract) -> MarketResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(500));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(MarketError::ChainConnection(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            lending,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(
            "Chain {} failover to provider {}",
            self.config.chain_id, next
        );
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> MarketResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(MarketError::ChainConnection(format!(
            "All providers failed for chain {}",
            self.config.chain_id
        )))
    }

    /// Execute a read-only call, rotating providers on transient failures
    pub async fn call(&self, call: &ContractCall) -> MarketResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(call.to)
            .data(call.data.clone())
            .into();

        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().call(&tx, None).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    let err = MarketError::from_provider("eth_call", e.to_string());
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!("Transient eth_call failure on chain {}: {}", self.config.chain_id, err);
                    last_error = Some(err);
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MarketError::ChainConnection("All providers failed eth_call".to_string())
        }))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> MarketResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| MarketError::from_provider("eth_getTransactionReceipt", e.to_string()))
    }

    /// Next nonce for `address`, counting transactions still in the mempool
    pub async fn pending_nonce(&self, address: Address) -> MarketResult<U256> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| MarketError::from_provider("eth_getTransactionCount", e.to_string()))
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> MarketResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| MarketError::GasEstimation(e.to_string()))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> MarketResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| MarketError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> MarketResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| MarketError::GasEstimation(e.to_string()))?
            .ok_or_else(|| MarketError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| MarketError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(1_500_000_000u64);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok((max_fee, priority_fee))
    }

    /// Maximum fee per gas the operator is willing to bid, in wei
    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Map a failed view call to `NotFound` when the contract rejected it
    fn rejected(err: MarketError, what: String) -> MarketError {
        match err {
            MarketError::Contract(_) | MarketError::Transaction(_) => {
                debug!("{} rejected by contract: {}", what, err);
                MarketError::not_found(what)
            }
            other => other,
        }
    }
}

#[async_trait]
impl ChainReader for ChainProvider {
    async fn owner_of(&self, collection: Address, token_id: u64) -> MarketResult<Address> {
        let contract = CollectionContract::new(collection);
        let output = self
            .call(&contract.owner_of(token_id)?)
            .await
            .map_err(|e| Self::rejected(e, format!("Token {} in {:?}", token_id, collection)))?;

        // Non-ERC721 contracts answer with empty output rather than reverting
        contract
            .decode_owner(&output)
            .map_err(|_| MarketError::not_found(format!("Token {} in {:?}", token_id, collection)))
    }

    async fn loan_snapshot(&self, loan_id: u64) -> MarketResult<LoanSnapshot> {
        let output = self
            .call(&self.lending.get_loan(loan_id)?)
            .await
            .map_err(|e| Self::rejected(e, format!("Loan {}", loan_id)))?;

        let (owner, loanee, upfront_fee, starting_time, end_time, bundle_uuid, canceled) =
            self.lending.decode_loan(&output)?;

        // Unknown ids come back as an all-zero struct
        if owner.is_zero() {
            return Err(MarketError::not_found(format!("Loan {}", loan_id)));
        }

        Ok(LoanSnapshot {
            owner,
            loanee,
            upfront_fee,
            starting_time: starting_time.low_u64(),
            end_time: end_time.low_u64(),
            bundle_uuid,
            canceled,
        })
    }

    async fn is_bundled(&self, collection: Address, token_id: u64) -> MarketResult<bool> {
        let output = self.call(&self.lending.is_bundled(collection, token_id)?).await?;
        self.lending.decode_is_bundled(&output)
    }

    async fn tokens_of_owner(&self, collection: Address, owner: Address) -> MarketResult<Vec<u64>> {
        let contract = CollectionContract::new(collection);
        let output = self.call(&contract.balance_of(owner)?).await?;
        let balance = contract.decode_uint("balanceOf", &output)?.low_u64();

        let mut tokens = Vec::with_capacity(enumeration_capacity(balance));
        for index in 0..balance {
            let output = self
                .call(&contract.token_of_owner_by_index(owner, index)?)
                .await?;
            let token_id = contract.decode_uint("tokenOfOwnerByIndex", &output)?;
            if token_id > U256::from(u64::MAX) {
                warn!(
                    "Skipping token {} in {:?}: id does not fit the tracking store",
                    token_id, collection
                );
                continue;
            }
            tokens.push(token_id.as_u64());
        }

        debug!(
            "Enumerated {} tokens of {:?} held by {:?}",
            tokens.len(),
            collection,
            owner
        );
        Ok(tokens)
    }

    async fn health_check(&self) -> MarketResult<()> {
        let block = self.get_block_number().await.map_err(|e| {
            error!("Health check failed for chain {}: {}", self.config.chain_id, e);
            MarketError::Unhealthy(e.to_string())
        })?;

        let chain_id = self
            .http()
            .get_chainid()
            .await
            .map_err(|e| MarketError::Unhealthy(format!("eth_chainId failed: {}", e)))?;

        if chain_id != U256::from(self.config.chain_id) {
            return Err(MarketError::Unhealthy(format!(
                "Node reports chain {} but {} is configured",
                chain_id, self.config.chain_id
            )));
        }

        debug!("Chain {} healthy at block {}", self.config.chain_id, block);
        Ok(())
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_capacity_is_capped() {
        assert_eq!(enumeration_capacity(0), 0);
        assert_eq!(enumeration_capacity(12), 12);
        assert_eq!(enumeration_capacity(u64::MAX), MAX_PREALLOCATED_TOKENS as usize);
    }
}

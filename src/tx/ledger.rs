//! Ledger write interface and its ethers implementation

use crate::chain::{ChainProvider, ContractCall, GasPrice};
use crate::error::{MarketError, MarketResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::PendingTransaction;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Raw ledger mutations the transaction sender drives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Network-suggested fee
    async fn suggested_gas_price(&self) -> MarketResult<GasPrice>;

    async fn estimate_gas(&self, call: &ContractCall) -> MarketResult<U256>;

    /// Sign and broadcast; returns the transaction hash
    async fn send(&self, call: &ContractCall, gas_limit: U256, gas_price: &GasPrice)
        -> MarketResult<H256>;

    /// Wait for `confirmations` blocks; `Timeout` once `wait` elapses
    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: usize,
        wait: Duration,
    ) -> MarketResult<Option<TransactionReceipt>>;

    async fn get_receipt(&self, tx_hash: H256) -> MarketResult<Option<TransactionReceipt>>;
}

/// Signs with a local wallet and submits through the chain provider
pub struct EthersLedger {
    provider: Arc<ChainProvider>,
    wallet: LocalWallet,
}

impl EthersLedger {
    pub fn new(provider: Arc<ChainProvider>, wallet: LocalWallet) -> Self {
        let wallet = wallet.with_chain_id(provider.chain_id());
        info!("Ledger signer initialized with wallet: {:?}", wallet.address());
        Self { provider, wallet }
    }

    /// Load wallet from the environment variable named in configuration
    pub fn load_wallet(private_key_env: &str) -> MarketResult<LocalWallet> {
        let key = std::env::var(private_key_env).map_err(|_| {
            MarketError::Wallet(format!("No wallet configured. Set {}", private_key_env))
        })?;

        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| MarketError::Wallet(format!("Invalid private key: {}", e)))
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Build a typed transaction for `call` with the given fee parameters
    fn build_tx(
        &self,
        call: &ContractCall,
        nonce: U256,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let chain_id = self.provider.chain_id();

        match gas_price {
            GasPrice::Legacy(price) => {
                let tx = TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(call.to)
                    .data(call.data.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*price)
                    .chain_id(chain_id);
                TypedTransaction::Legacy(tx)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let tx = Eip1559TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(call.to)
                    .data(call.data.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(chain_id);
                TypedTransaction::Eip1559(tx)
            }
        }
    }
}

#[async_trait]
impl LedgerWriter for EthersLedger {
    async fn suggested_gas_price(&self) -> MarketResult<GasPrice> {
        self.provider.get_gas_price().await
    }

    async fn estimate_gas(&self, call: &ContractCall) -> MarketResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(call.to)
            .data(call.data.clone())
            .into();
        self.provider.estimate_gas(&tx).await
    }

    async fn send(
        &self,
        call: &ContractCall,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> MarketResult<H256> {
        let nonce = self.provider.pending_nonce(self.wallet.address()).await?;
        let tx = self.build_tx(call, nonce, gas_limit, gas_price);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| MarketError::Wallet(e.to_string()))?;

        let pending = self
            .provider
            .http()
            .send_raw_transaction(tx.rlp_signed(&signature))
            .await
            .map_err(|e| MarketError::from_provider("eth_sendRawTransaction", e.to_string()))?;

        let tx_hash = pending.tx_hash();
        debug!("Broadcast {:?} with nonce {} and gas limit {}", tx_hash, nonce, gas_limit);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: usize,
        wait: Duration,
    ) -> MarketResult<Option<TransactionReceipt>> {
        let pending = PendingTransaction::new(tx_hash, self.provider.http())
            .confirmations(confirmations)
            .interval(Duration::from_secs(2));

        match timeout(wait, pending).await {
            Ok(result) => result.map_err(|e| {
                MarketError::from_provider("waiting for confirmations", e.to_string())
            }),
            Err(_) => Err(MarketError::Timeout {
                operation: format!("{} confirmations of {:?}", confirmations, tx_hash),
            }),
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> MarketResult<Option<TransactionReceipt>> {
        self.provider.get_transaction_receipt(tx_hash).await
    }
}

//! Fee bidding and gas limit padding

use crate::chain::GasPrice;
use crate::config::TxConfig;

use ethers::types::U256;
use tracing::{debug, warn};

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Multiplier for the gas estimate (e.g., 150 = 1.5x)
    gas_limit_multiplier_percent: u64,
    /// Multiplier for the network-suggested fee
    fee_multiplier_percent: u64,
    /// Ceiling for any fee per gas we bid, if configured
    max_fee_per_gas: Option<U256>,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(config: &TxConfig, max_fee_per_gas: Option<U256>) -> Self {
        Self {
            gas_limit_multiplier_percent: config.gas_limit_multiplier_percent,
            fee_multiplier_percent: config.fee_multiplier_percent,
            max_fee_per_gas,
        }
    }

    /// Inflate a node estimate so a small underestimate does not run out of gas
    pub fn gas_limit(&self, estimate: U256) -> U256 {
        estimate * self.gas_limit_multiplier_percent / 100
    }

    /// Bid above the suggested fee so a spike does not leave us stuck
    pub fn bid(&self, suggested: &GasPrice) -> GasPrice {
        let bid = match suggested {
            GasPrice::Legacy(price) => GasPrice::Legacy(self.scale_fee(*price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = self.scale_fee(*max_fee_per_gas);
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: std::cmp::min(
                        *max_priority_fee_per_gas * self.fee_multiplier_percent / 100,
                        max_fee,
                    ),
                }
            }
        };

        debug!("Fee bid {:?} (suggested {:?})", bid, suggested);
        bid
    }

    fn scale_fee(&self, fee: U256) -> U256 {
        let scaled = fee * self.fee_multiplier_percent / 100;
        match self.max_fee_per_gas {
            Some(cap) if scaled > cap => {
                warn!("Fee bid {} capped at configured maximum {}", scaled, cap);
                cap
            }
            _ => scaled,
        }
    }
}

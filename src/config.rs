//! Configuration management for the rental market maker
//!
//! Loads configuration from a TOML file with environment variable substitution.
//! The resulting `Settings` is built once at startup and handed to every
//! component explicitly; nothing reads configuration from global state.

use crate::pricing::PricingPolicy;

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub market: MarketConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub tx: TxConfig,
    pub store: StoreConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub loan_index: Option<LoanIndexConfig>,
}

/// Pricing and pacing of the reconciliation pass
#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Price for assets discovered without any price history
    pub default_price: u64,
    #[serde(default = "default_price_floor")]
    pub price_floor: u64,
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u64,
    #[serde(default = "default_quick_rental_minutes")]
    pub quick_rental_minutes: u64,
    #[serde(default = "default_inter_listing_delay_ms")]
    pub inter_listing_delay_ms: u64,
    #[serde(default = "default_unbundle_timeout_secs")]
    pub unbundle_timeout_secs: u64,
    #[serde(default = "default_unbundle_poll_interval_ms")]
    pub unbundle_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Address of the rental lending contract
    pub lending_contract: String,
    /// Collections whose assets the wallet lends out
    pub collections: Vec<String>,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: usize,
    #[serde(default = "default_gas_price_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    /// Decimals of the ledger's fixed-point price unit
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

/// Transaction lifecycle tuning
#[derive(Debug, Clone, Deserialize)]
pub struct TxConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// Multiplier applied to the network-suggested fee, in percent
    #[serde(default = "default_fee_multiplier_percent")]
    pub fee_multiplier_percent: u64,
    /// Multiplier applied to the gas estimate, in percent
    #[serde(default = "default_gas_limit_multiplier_percent")]
    pub gas_limit_multiplier_percent: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the signer's private key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus textfile written after every pass
    pub textfile_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoanIndexConfig {
    pub url: String,
    /// Classify active loans from the index instead of per-loan chain reads
    #[serde(default)]
    pub prefer: bool,
    #[serde(default = "default_index_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_price_floor() -> u64 {
    3
}

fn default_stale_after_days() -> u64 {
    3
}

fn default_quick_rental_minutes() -> u64 {
    180
}

fn default_inter_listing_delay_ms() -> u64 {
    5_000
}

fn default_unbundle_timeout_secs() -> u64 {
    120
}

fn default_unbundle_poll_interval_ms() -> u64 {
    5_000
}

fn default_confirmation_blocks() -> usize {
    2
}

fn default_gas_price_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Legacy
}

fn default_price_decimals() -> u32 {
    18
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    10_000
}

fn default_confirmation_timeout_secs() -> u64 {
    180
}

fn default_fee_multiplier_percent() -> u64 {
    125
}

fn default_gas_limit_multiplier_percent() -> u64 {
    150
}

fn default_private_key_env() -> String {
    "RENTAL_PRIVATE_KEY".to_string()
}

fn default_index_timeout_secs() -> u64 {
    15
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            fee_multiplier_percent: default_fee_multiplier_percent(),
            gas_limit_multiplier_percent: default_gas_limit_multiplier_percent(),
        }
    }
}

impl MarketConfig {
    /// Pricing rules derived from this configuration
    pub fn policy(&self) -> PricingPolicy {
        PricingPolicy::new(
            self.price_floor,
            self.stale_after_days,
            self.quick_rental_minutes,
        )
    }

    pub fn inter_listing_delay(&self) -> Duration {
        Duration::from_millis(self.inter_listing_delay_ms)
    }

    pub fn unbundle_timeout(&self) -> Duration {
        Duration::from_secs(self.unbundle_timeout_secs)
    }

    pub fn unbundle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.unbundle_poll_interval_ms)
    }
}

impl TxConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

impl ChainConfig {
    pub fn lending_address(&self) -> Result<Address> {
        parse_address(&self.lending_contract)
            .with_context(|| format!("Invalid lending contract address: {}", self.lending_contract))
    }

    /// Parsed collection addresses, in configuration order
    pub fn collection_addresses(&self) -> Result<Vec<Address>> {
        self.collections
            .iter()
            .map(|c| {
                parse_address(c).with_context(|| format!("Invalid collection address: {}", c))
            })
            .collect()
    }
}

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value.trim()).map_err(|e| anyhow::anyhow!(e))
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("RENTAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        if self.chain.collections.is_empty() {
            anyhow::bail!("At least one collection must be configured");
        }

        self.chain.lending_address()?;
        self.chain.collection_addresses()?;

        if self.tx.max_attempts == 0 {
            anyhow::bail!("tx.max_attempts must be at least 1");
        }

        if self.tx.fee_multiplier_percent < 100 || self.tx.gas_limit_multiplier_percent < 100 {
            anyhow::bail!("Fee and gas limit multipliers must not be below 100%");
        }

        if self.market.default_price <= self.market.price_floor {
            tracing::warn!(
                "Default price {} is at or below the price floor {} - stale listings will never be discounted",
                self.market.default_price,
                self.market.price_floor
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [market]
        default_price = 10

        [chain]
        chain_id = 42161
        name = "arbitrum"
        rpc_urls = ["https://rpc.example.com/${RENTAL_TEST_RPC_KEY}"]
        lending_contract = "0x0000000000000000000000000000000000000001"
        collections = ["0x0000000000000000000000000000000000000002"]
        max_gas_price_gwei = 50

        [store]
        path = "rentals.json"

        [wallet]
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_applied() {
        env::set_var("RENTAL_TEST_RPC_KEY", "abc");
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.chain.rpc_urls[0], "https://rpc.example.com/abc");
        assert_eq!(settings.market.price_floor, 3);
        assert_eq!(settings.market.stale_after_days, 3);
        assert_eq!(settings.market.quick_rental_minutes, 180);
        assert_eq!(settings.tx.max_attempts, 3);
        assert_eq!(settings.chain.price_decimals, 18);
        assert_eq!(settings.chain.gas_price_strategy, GasPriceStrategy::Legacy);
        assert_eq!(settings.wallet.private_key_env, "RENTAL_PRIVATE_KEY");
        assert!(settings.loan_index.is_none());
        assert!(settings.metrics.textfile_path.is_none());
    }

    #[test]
    fn test_rejects_missing_collections() {
        let input = SAMPLE.replace(
            r#"collections = ["0x0000000000000000000000000000000000000002"]"#,
            "collections = []",
        );
        assert!(Settings::from_toml(&input).is_err());
    }

    #[test]
    fn test_rejects_bad_collection_address() {
        let input = SAMPLE.replace("0x0000000000000000000000000000000000000002", "not-an-address");
        assert!(Settings::from_toml(&input).is_err());
    }
}

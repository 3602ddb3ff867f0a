/// Configuration module
use crate::retry::{RetryPolicy, RetryPolicyError};
use crate::ton::TonAddress;
use crate::types::{CreditPack, default_catalog};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

const ENV_PREFIX: &str = "TON_CREDITS_";
const ENV_API_BASE_URL: &str = "TON_CREDITS_API_BASE_URL";
const ENV_API_TIMEOUT_MS: &str = "TON_CREDITS_API_TIMEOUT_MS";
const ENV_MERCHANT_ADDRESS: &str = "TON_CREDITS_MERCHANT_ADDRESS";
const ENV_TESTNET: &str = "TON_CREDITS_TESTNET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid retry policy: {0}")]
    RetryPolicy(#[from] RetryPolicyError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdkConfig {
    pub api: ApiConfig,
    pub payment: PaymentConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_catalog")]
    pub catalog: Vec<CreditPack>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "ApiConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ApiConfig {
    pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

    fn default_timeout_ms() -> u64 {
        Self::DEFAULT_TIMEOUT_MS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentConfig {
    /// Wallet that receives credit payments.
    pub merchant_address: String,
    /// How long the wallet may hold the transfer before sending it.
    #[serde(default = "PaymentConfig::default_validity_secs")]
    pub validity_secs: u64,
    #[serde(default)]
    pub testnet: bool,
}

impl PaymentConfig {
    pub const DEFAULT_VALIDITY_SECS: u64 = 300;

    fn default_validity_secs() -> u64 {
        Self::DEFAULT_VALIDITY_SECS
    }
}

impl SdkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("api.base_url is empty".to_string()));
        }
        TonAddress::parse(&self.payment.merchant_address).map_err(|e| {
            ConfigError::InvalidConfig(format!("payment.merchant_address: {e}"))
        })?;
        if self.payment.validity_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "payment.validity_secs must be positive".to_string(),
            ));
        }
        self.retry.validate()?;
        if self.catalog.is_empty() {
            return Err(ConfigError::InvalidConfig("catalog is empty".to_string()));
        }
        if let Some(pack) = self.catalog.iter().find(|p| p.amount_nano == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "pack {} has a zero amount",
                pack.id
            )));
        }
        Ok(())
    }

    pub fn find_pack(&self, id: &str) -> Option<&CreditPack> {
        self.catalog.iter().find(|pack| pack.id == id)
    }
}

pub struct ConfigManager {
    config: SdkConfig,
    environment: HashMap<String, String>,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self::with_environment(
            Self::default_config(),
            Self::load_environment_variables(),
        ))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: SdkConfig = serde_json::from_str(&content)?;
        let manager = Self::with_environment(config, Self::load_environment_variables());
        manager.config.validate()?;
        Ok(manager)
    }

    pub fn from_config(config: SdkConfig) -> Self {
        Self::with_environment(config, Self::load_environment_variables())
    }

    /// Applies `TON_CREDITS_*` overrides from `environment` on top of `config`.
    pub fn with_environment(mut config: SdkConfig, environment: HashMap<String, String>) -> Self {
        if let Some(url) = environment.get(ENV_API_BASE_URL) {
            config.api.base_url = url.clone();
        }
        if let Some(timeout) = environment
            .get(ENV_API_TIMEOUT_MS)
            .and_then(|v| v.parse().ok())
        {
            config.api.timeout_ms = timeout;
        }
        if let Some(address) = environment.get(ENV_MERCHANT_ADDRESS) {
            config.payment.merchant_address = address.clone();
        }
        if let Some(testnet) = environment.get(ENV_TESTNET).and_then(|v| v.parse().ok()) {
            config.payment.testnet = testnet;
        }
        Self {
            config,
            environment,
        }
    }

    pub fn get_config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn into_config(self) -> SdkConfig {
        self.config
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    pub fn update_config<F>(&mut self, updater: F)
    where
        F: FnOnce(&mut SdkConfig),
    {
        updater(&mut self.config);
    }

    fn load_environment_variables() -> HashMap<String, String> {
        std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect()
    }

    fn default_config() -> SdkConfig {
        SdkConfig {
            api: ApiConfig {
                base_url: "http://localhost:8080".to_string(),
                timeout_ms: ApiConfig::DEFAULT_TIMEOUT_MS,
            },
            payment: PaymentConfig {
                merchant_address: String::new(),
                validity_secs: PaymentConfig::DEFAULT_VALIDITY_SECS,
                testnet: false,
            },
            retry: RetryPolicy::default(),
            catalog: default_catalog(),
        }
    }
}

pub struct ConfigBuilder {
    config: SdkConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ConfigManager::default_config(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.api.base_url = base_url.to_string();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.api.timeout_ms = timeout_ms;
        self
    }

    pub fn with_merchant_address(mut self, address: &str) -> Self {
        self.config.payment.merchant_address = address.to_string();
        self
    }

    pub fn with_testnet(mut self, testnet: bool) -> Self {
        self.config.payment.testnet = testnet;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn with_catalog(mut self, catalog: Vec<CreditPack>) -> Self {
        self.config.catalog = catalog;
        self
    }

    pub fn build(self) -> Result<SdkConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MERCHANT: &str = "EQD2NmD_lH5f5u1Kj3KfGyTvhZSX0Eg6qp2a5IQUKXxOG21n";

    #[test]
    fn builder_produces_valid_config() {
        let config = ConfigBuilder::new()
            .with_base_url("https://credits.example.com")
            .with_merchant_address(MERCHANT)
            .build()
            .unwrap();
        assert_eq!(config.catalog.len(), 4);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.find_pack("5").map(|p| p.credits), Some(200));
        assert!(config.find_pack("7").is_none());
    }

    #[test]
    fn missing_merchant_is_rejected() {
        let result = ConfigBuilder::new().build();
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn merchant_workchain_must_fit_the_friendly_form() {
        let result = ConfigBuilder::new()
            .with_merchant_address(
                "256:f63660ff947e5fe6ed4a8f729f1b24ef859497d0483aaa9d9ae48414297c4e1b",
            )
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn invalid_retry_policy_is_rejected() {
        let policy = RetryPolicy {
            growth_factor: 0.5,
            ..RetryPolicy::default()
        };
        let result = ConfigBuilder::new()
            .with_merchant_address(MERCHANT)
            .with_retry_policy(policy)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::RetryPolicy(RetryPolicyError::GrowthFactor(_)))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = ConfigBuilder::new()
            .with_merchant_address(MERCHANT)
            .build()
            .unwrap();
        let environment = HashMap::from([
            (
                ENV_API_BASE_URL.to_string(),
                "https://staging.example.com".to_string(),
            ),
            (ENV_API_TIMEOUT_MS.to_string(), "2500".to_string()),
            (ENV_TESTNET.to_string(), "true".to_string()),
            (ENV_API_TIMEOUT_MS.to_string() + "_IGNORED", "x".to_string()),
        ]);
        let manager = ConfigManager::with_environment(config, environment);
        let config = manager.get_config();
        assert_eq!(config.api.base_url, "https://staging.example.com");
        assert_eq!(config.api.timeout_ms, 2500);
        assert!(config.payment.testnet);
    }

    #[test]
    fn json_config_fills_defaults() {
        let json = format!(
            r#"{{
                "api": {{ "base_url": "https://credits.example.com" }},
                "payment": {{ "merchant_address": "{MERCHANT}" }}
            }}"#
        );
        let config: SdkConfig = serde_json::from_str(&json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.api.timeout_ms, ApiConfig::DEFAULT_TIMEOUT_MS);
        assert_eq!(config.payment.validity_secs, PaymentConfig::DEFAULT_VALIDITY_SECS);
        assert_eq!(config.catalog, default_catalog());
    }

    #[test]
    fn missing_file_is_reported() {
        let result = ConfigManager::from_file("/nonexistent/ton-credits.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}

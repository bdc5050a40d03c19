//! Engine configuration options.
//!
//! Loaded once at startup (JSON via serde, or a preset) and validated before
//! the engine is built. Nothing in here changes while the engine runs.

use crate::types::UserId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deleverage profitable counterparties when the insurance fund cannot absorb a position.
    pub adl_enabled: bool,
    /// Try an IOC close on the book before the insurance fund. Off: insurance first.
    pub market_close_enabled: bool,
    /// Used for symbols without a trading rule.
    pub default_clearance_fee_rate: Decimal,
    pub closed_order_ttl_ms: i64,
    pub history_ttl_ms: i64,
    pub reserved_pool_capacity: usize,
    pub reserved_pool_low_watermark: usize,
    /// Settle asset → insurance fund user
    pub insurance_users: BTreeMap<String, UserId>,
    pub bot_users: BTreeSet<UserId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adl_enabled: true,
            market_close_enabled: false,
            default_clearance_fee_rate: dec!(0.0005),
            closed_order_ttl_ms: HOUR_MS,
            history_ttl_ms: DAY_MS,
            reserved_pool_capacity: 1_000,
            reserved_pool_low_watermark: 100,
            insurance_users: BTreeMap::new(),
            bot_users: BTreeSet::new(),
        }
    }
}

impl EngineConfig {
    /// Relaxed limits, insurance user 1 for both settle assets.
    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.insurance_users.insert("USDT".to_string(), UserId(1));
        config.insurance_users.insert("BTC".to_string(), UserId(1));
        config.reserved_pool_capacity = 100;
        config.reserved_pool_low_watermark = 10;
        config
    }

    pub fn mainnet() -> Self {
        let mut config = Self::testnet();
        config.default_clearance_fee_rate = dec!(0.001);
        config.reserved_pool_capacity = 10_000;
        config.reserved_pool_low_watermark = 1_000;
        config
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_clearance_fee_rate < Decimal::ZERO || self.default_clearance_fee_rate >= dec!(0.1) {
            return Err(ConfigError::InvalidFees {
                reason: format!("clearance fee rate {} outside [0, 0.1)", self.default_clearance_fee_rate),
            });
        }
        if self.closed_order_ttl_ms <= 0 || self.history_ttl_ms <= 0 {
            return Err(ConfigError::InvalidRetention {
                reason: "ttl must be positive".to_string(),
            });
        }
        if self.reserved_pool_capacity == 0 || self.reserved_pool_low_watermark >= self.reserved_pool_capacity {
            return Err(ConfigError::InvalidReservedPool {
                capacity: self.reserved_pool_capacity,
                low_watermark: self.reserved_pool_low_watermark,
            });
        }
        if let Some(user) = self.insurance_users.values().find(|u| self.bot_users.contains(u)) {
            return Err(ConfigError::InsuranceUserIsBot(*user));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid fees: {reason}")]
    InvalidFees { reason: String },

    #[error("Invalid retention: {reason}")]
    InvalidRetention { reason: String },

    #[error("Reserved pool low watermark {low_watermark} must be below capacity {capacity}")]
    InvalidReservedPool { capacity: usize, low_watermark: usize },

    #[error("Insurance user {0:?} is also listed as a bot")]
    InsuranceUserIsBot(UserId),

    #[error("Config parse error: {0}")]
    Parse(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> EngineConfig {
        match self {
            Environment::Development => EngineConfig::default(),
            Environment::Testnet => EngineConfig::testnet(),
            Environment::Mainnet => EngineConfig::mainnet(),
        }
    }
}

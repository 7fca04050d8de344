// 10.0 config.rs: all settings in one place. platform identity, money rules, sweep cadence.
// built once and handed to Engine::new, nothing is re-read or looked up by role at runtime.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{Leverage, Percent, RoundingRule, UserId};

/** 10.1: money and identity settings for the settlement engine */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    // Wallet that collects commissions and upgrade revenue
    pub platform_account: UserId,
    // Currency code stamped on every wallet and record
    pub currency: String,
    // Decimal places kept on ledger amounts
    pub money_scale: u32,
    // How commission and margin are rounded to money_scale
    pub rounding: RoundingRule,
    // Commission used when a trader plan does not set one
    pub default_commission: Percent,
    // Upper bound a trader may set on their own plans
    pub max_commission: Percent,
    pub max_leverage: Leverage,
    // Maximum number of events to retain in memory
    pub max_events: usize,
    pub sweep: SweepConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            platform_account: UserId(0),
            currency: "USD".to_string(),
            money_scale: 2,
            rounding: RoundingRule::HalfEven,
            default_commission: Percent::new(dec!(20)).unwrap_or_else(Percent::zero),
            max_commission: Percent::new(dec!(50)).unwrap_or_else(Percent::zero),
            max_leverage: Leverage::new(dec!(100)).unwrap_or_else(Leverage::one),
            max_events: 100_000,
            sweep: SweepConfig::default(),
        }
    }
}

/** 10.2: background sweep cadence. price refresh and status evaluation tick independently */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub price_refresh_ms: u64,
    pub status_eval_ms: u64,
    // Cached prices older than this are treated as missing
    pub price_ttl_ms: u64,
    // Also close open trades whose stop-loss/take-profit was crossed
    pub check_trade_triggers: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            price_refresh_ms: 5_000,
            status_eval_ms: 10_000,
            price_ttl_ms: 60_000,
            check_trade_triggers: true,
        }
    }
}

impl PlatformConfig {
    // Fast sweeps and low leverage cap for a shared test environment
    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.currency = "USDT".to_string();
        config.max_leverage = Leverage::new(dec!(20)).unwrap_or_else(Leverage::one);
        config.sweep.price_refresh_ms = 1_000;
        config.sweep.status_eval_ms = 2_000;
        config.sweep.price_ttl_ms = 10_000;
        config
    }

    // Conservative production settings
    pub fn production() -> Self {
        let mut config = Self::default();
        config.max_leverage = Leverage::new(dec!(50)).unwrap_or_else(Leverage::one);
        config.max_commission = Percent::new(dec!(40)).unwrap_or_else(Percent::zero);
        config.max_events = 1_000_000;
        config.sweep.price_ttl_ms = 30_000;
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PlatformConfig = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.trim().is_empty() {
            return Err(ConfigError::InvalidMoney {
                reason: "Currency code must not be empty".to_string(),
            });
        }

        // rust_decimal keeps at most 28 fractional digits
        if self.money_scale > 12 {
            return Err(ConfigError::InvalidMoney {
                reason: "Money scale above 12 decimal places".to_string(),
            });
        }

        // deserialized percents skip the constructor's range check
        if Percent::new(self.max_commission.value()).is_none() || Percent::new(self.default_commission.value()).is_none() {
            return Err(ConfigError::InvalidCommission {
                reason: "Commission must be between 0 and 100".to_string(),
            });
        }

        if self.default_commission > self.max_commission {
            return Err(ConfigError::InvalidCommission {
                reason: "Default commission exceeds the maximum".to_string(),
            });
        }

        if self.sweep.price_refresh_ms == 0 || self.sweep.status_eval_ms == 0 {
            return Err(ConfigError::InvalidSweep {
                reason: "Sweep intervals must be positive".to_string(),
            });
        }

        if self.sweep.price_ttl_ms < self.sweep.price_refresh_ms {
            return Err(ConfigError::InvalidSweep {
                reason: "Price TTL shorter than refresh interval".to_string(),
            });
        }

        if self.max_events == 0 {
            return Err(ConfigError::InvalidSweep {
                reason: "Event buffer must hold at least one event".to_string(),
            });
        }

        Ok(())
    }

    /// Smallest representable amount at the configured scale.
    pub fn money_unit(&self) -> Decimal {
        Decimal::new(1, self.money_scale)
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid money settings: {reason}")]
    InvalidMoney { reason: String },

    #[error("Invalid commission settings: {reason}")]
    InvalidCommission { reason: String },

    #[error("Invalid sweep settings: {reason}")]
    InvalidSweep { reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to read config: {0}")]
    Io(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Production,
}

impl Environment {
    pub fn config(&self) -> PlatformConfig {
        match self {
            Environment::Development => PlatformConfig::default(),
            Environment::Testnet => PlatformConfig::testnet(),
            Environment::Production => PlatformConfig::production(),
        }
    }
}

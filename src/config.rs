//! Runtime parameters for the ledger and the withdrawal workflow.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::AMOUNT_SCALE;

pub const ENV_MINIMUM_WITHDRAWAL: &str = "SALDO_MINIMUM_WITHDRAWAL";
pub const ENV_ADMIN_FEE: &str = "SALDO_ADMIN_FEE";
pub const ENV_LOCK_TIMEOUT_MS: &str = "SALDO_LOCK_TIMEOUT_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not a valid value: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("minimum withdrawal must be positive, got {0}")]
    NonPositiveMinimum(Decimal),
    #[error("admin fee must not be negative, got {0}")]
    NegativeFee(Decimal),
    #[error("{name} has more than two decimal places: {value}")]
    TooPrecise { name: &'static str, value: Decimal },
}

/// Business parameters applied when a withdrawal is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalPolicy {
    pub minimum_withdrawal: Decimal,
    /// Flat fee subtracted from the requested amount.
    pub admin_fee: Decimal,
}

impl WithdrawalPolicy {
    pub fn new(minimum_withdrawal: Decimal, admin_fee: Decimal) -> Result<Self, ConfigError> {
        let policy = Self {
            minimum_withdrawal,
            admin_fee,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_withdrawal <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveMinimum(self.minimum_withdrawal));
        }
        if self.admin_fee < Decimal::ZERO {
            return Err(ConfigError::NegativeFee(self.admin_fee));
        }
        for (name, value) in [
            ("minimum_withdrawal", self.minimum_withdrawal),
            ("admin_fee", self.admin_fee),
        ] {
            if value.normalize().scale() > AMOUNT_SCALE {
                return Err(ConfigError::TooPrecise { name, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub minimum_withdrawal: Decimal,
    pub admin_fee: Decimal,
    /// Upper bound on waiting for a balance row lock.
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            minimum_withdrawal: dec!(50000.00),
            admin_fee: dec!(2500.00),
            lock_timeout_ms: 5_000,
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by any `SALDO_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_MINIMUM_WITHDRAWAL) {
            config.minimum_withdrawal = parse(ENV_MINIMUM_WITHDRAWAL, &value)?;
        }
        if let Some(value) = lookup(ENV_ADMIN_FEE) {
            config.admin_fee = parse(ENV_ADMIN_FEE, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_TIMEOUT_MS) {
            config.lock_timeout_ms = parse(ENV_LOCK_TIMEOUT_MS, &value)?;
        }

        config.policy()?;
        Ok(config)
    }

    pub fn policy(&self) -> Result<WithdrawalPolicy, ConfigError> {
        WithdrawalPolicy::new(self.minimum_withdrawal, self.admin_fee)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

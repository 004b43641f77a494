//! Engine configuration loaded from the environment

use std::fmt::Display;
use std::str::FromStr;

use crate::alerting::AlertConfig;
use crate::client::StripeConfig;
use crate::email::EmailConfig;
use crate::error::{BillingError, BillingResult};
use crate::revenue::{FeePolicy, ProcessorFeeEstimate};

pub const DEFAULT_DEPOSIT_PERCENT: u32 = 50;
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeConfig,
    /// Maximum allowed skew between the signature timestamp and now.
    pub webhook_tolerance_secs: i64,
    pub deposit_percent: u32,
    pub fee_policy: FeePolicy,
    pub processor_fee: ProcessorFeeEstimate,
    pub alerts: AlertConfig,
    pub email: EmailConfig,
}

impl BillingConfig {
    /// Defaults everywhere except the processor credentials.
    pub fn new(stripe: StripeConfig) -> Self {
        Self {
            stripe,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            deposit_percent: DEFAULT_DEPOSIT_PERCENT,
            fee_policy: FeePolicy::default(),
            processor_fee: ProcessorFeeEstimate::default(),
            alerts: AlertConfig::default(),
            email: EmailConfig::default(),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let defaults = FeePolicy::default();
        let fee_policy = FeePolicy {
            min_percent: env_or("PLATFORM_FEE_MIN_PERCENT", defaults.min_percent)?,
            max_percent: env_or("PLATFORM_FEE_MAX_PERCENT", defaults.max_percent)?,
            standard_percent: env_or("PLATFORM_FEE_STANDARD_PERCENT", defaults.standard_percent)?,
            promo_percent: env_or("PLATFORM_FEE_PROMO_PERCENT", defaults.promo_percent)?,
        };

        let estimate = ProcessorFeeEstimate::default();
        let processor_fee = ProcessorFeeEstimate {
            basis_points: env_or("PROCESSOR_FEE_BPS", estimate.basis_points)?,
            fixed_cents: env_or("PROCESSOR_FEE_FIXED_CENTS", estimate.fixed_cents)?,
        };

        let config = Self {
            stripe: StripeConfig::from_env()?,
            webhook_tolerance_secs: env_or("WEBHOOK_TOLERANCE_SECS", DEFAULT_WEBHOOK_TOLERANCE_SECS)?,
            deposit_percent: env_or("DEPOSIT_PERCENT", DEFAULT_DEPOSIT_PERCENT)?,
            fee_policy,
            processor_fee,
            alerts: AlertConfig::from_env(),
            email: EmailConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        self.fee_policy.validate()?;
        if self.deposit_percent == 0 || self.deposit_percent > 100 {
            return Err(BillingError::Config(format!(
                "DEPOSIT_PERCENT must be within 1..=100, got {}",
                self.deposit_percent
            )));
        }
        if self.webhook_tolerance_secs <= 0 {
            return Err(BillingError::Config(
                "WEBHOOK_TOLERANCE_SECS must be positive".to_string(),
            ));
        }
        if self.processor_fee.basis_points < 0 || self.processor_fee.fixed_cents < 0 {
            return Err(BillingError::Config(
                "processor fee estimate must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> BillingResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| BillingError::Config(format!("{} is invalid: {}", key, e))),
        _ => Ok(default),
    }
}

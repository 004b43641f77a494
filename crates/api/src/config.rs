//! Server configuration

use storefront_billing::{BillingConfig, BillingError};

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Postgres URL; without it the server runs on the in-memory store.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub billing: BillingConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = std::env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "JWT_SECRET must be at least {} bytes",
                MIN_JWT_SECRET_LEN
            )));
        }

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            jwt_secret,
            allowed_origins,
            billing: BillingConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "JWT_SECRET",
        "DATABASE_URL",
        "ALLOWED_ORIGINS",
        "BIND_ADDRESS",
        "STRIPE_SECRET_KEY",
        "STRIPE_WEBHOOK_SECRET",
        "PLATFORM_FEE_MAX_PERCENT",
    ];

    fn reset() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn set_required() {
        std::env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        reset();
        set_required();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.database_url.is_none());
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.billing.stripe.webhook_secret, "whsec_test");

        reset();
    }

    #[test]
    #[serial]
    fn test_missing_jwt_secret() {
        reset();
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");

        assert!(matches!(Config::from_env(), Err(ConfigError::Missing("JWT_SECRET"))));

        reset();
    }

    #[test]
    #[serial]
    fn test_short_jwt_secret_rejected() {
        reset();
        set_required();
        std::env::set_var("JWT_SECRET", "short");

        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));

        reset();
    }

    #[test]
    #[serial]
    fn test_invalid_fee_band_rejected() {
        reset();
        set_required();
        std::env::set_var("PLATFORM_FEE_MAX_PERCENT", "3");

        assert!(matches!(Config::from_env(), Err(ConfigError::Billing(_))));

        reset();
    }

    #[test]
    #[serial]
    fn test_origins_are_trimmed() {
        reset();
        set_required();
        std::env::set_var("ALLOWED_ORIGINS", " https://shop.example.com , ,https://admin.example.com");
        std::env::set_var("DATABASE_URL", "  ");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://shop.example.com", "https://admin.example.com"]
        );
        assert!(config.database_url.is_none());

        reset();
    }
}

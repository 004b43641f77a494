//! Billing error types
//!
//! Every error carries an [`ErrorKind`] so the HTTP boundary can tell a
//! permanent rejection from a failure the payment processor should retry.
//! Idempotent no-ops (duplicate event, already-latched deposit) are not errors
//! at all; they come back as `Ok` outcomes.

use serde::Serialize;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification used at every boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing signature. Never retried, never logged as processed.
    Authenticity,
    /// Malformed payload, invalid enum value, negative amount.
    Validation,
    /// Store unavailable, downstream call failed. The sender should retry.
    Transient,
    /// Invalid state transition, unknown subject, insufficient balance.
    BusinessRule,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authenticity => "authenticity",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::BusinessRule => "business_rule",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook timestamp outside tolerance ({skew_secs}s skew)")]
    WebhookTimestampExpired { skew_secs: i64 },

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid value '{value}' for {field}")]
    InvalidEnumValue { field: &'static str, value: String },

    #[error("{0} must not be negative")]
    NegativeAmount(&'static str),

    #[error("Checkout metadata value for '{0}' exceeds the processor limit")]
    MetadataTooLong(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plan not found or inactive: {0}")]
    PlanNotFound(String),

    #[error("Invalid {entity} transition from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Requested {requested_cents} cents exceeds available balance of {available_cents} cents")]
    InsufficientBalance {
        requested_cents: i64,
        available_cents: i64,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Event arrived before its prerequisite: {0}")]
    OutOfOrder(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::WebhookSignatureInvalid
            | BillingError::WebhookTimestampExpired { .. } => ErrorKind::Authenticity,

            BillingError::MalformedEvent(_)
            | BillingError::InvalidInput(_)
            | BillingError::InvalidEnumValue { .. }
            | BillingError::NegativeAmount(_)
            | BillingError::MetadataTooLong(_) => ErrorKind::Validation,

            BillingError::NotFound(_)
            | BillingError::PlanNotFound(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::InsufficientBalance { .. }
            | BillingError::Forbidden(_)
            | BillingError::Conflict(_) => ErrorKind::BusinessRule,

            BillingError::OutOfOrder(_)
            | BillingError::Database(_)
            | BillingError::StripeApi(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ErrorKind::Transient,
        }
    }

    /// Whether the sender should redeliver the request later.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn invalid_enum(field: &'static str, value: impl Into<String>) -> Self {
        BillingError::InvalidEnumValue {
            field,
            value: value.into(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BillingError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        BillingError::Database(format!("migration failed: {}", e))
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(BillingError::Database("down".into()).is_retryable());
        assert!(BillingError::OutOfOrder("invoice before subscription".into()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::NegativeAmount("amount_cents").is_retryable());
        assert!(!BillingError::InvalidTransition {
            entity: "order",
            from: "completed".into(),
            to: "ready".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            BillingError::WebhookTimestampExpired { skew_secs: 900 }.kind(),
            ErrorKind::Authenticity
        );
        assert_eq!(
            BillingError::invalid_enum("method", "carrier_pigeon").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            BillingError::InsufficientBalance {
                requested_cents: 10,
                available_cents: 5
            }
            .kind(),
            ErrorKind::BusinessRule
        );
        assert_eq!(ErrorKind::BusinessRule.as_str(), "business_rule");
    }

    #[test]
    fn test_transition_error_names_invalid_target() {
        let err = BillingError::InvalidTransition {
            entity: "order",
            from: "ready".into(),
            to: "pending".into(),
        };
        assert!(err.to_string().contains("'pending'"));
    }
}

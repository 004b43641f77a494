//! HTTP error mapping
//!
//! Billing failures reach clients as `{ "error", "code", "kind" }`. The
//! webhook route has its own table because the processor only reads the
//! status class: 4xx stops redelivery, 5xx schedules it.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use storefront_billing::{BillingError, ErrorKind};

use crate::auth::AuthError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    /// Billing failure raised while ingesting a processor webhook.
    #[error("{0}")]
    Webhook(BillingError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(err) => err.status(),
            ApiError::Billing(err) => sync_status(err),
            ApiError::Webhook(err) => webhook_status(err),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Auth(_) => "auth",
            ApiError::Billing(err) | ApiError::Webhook(err) => err.kind().as_str(),
        }
    }
}

/// Status for a billing error on a synchronous endpoint.
pub fn sync_status(err: &BillingError) -> StatusCode {
    match err.kind() {
        ErrorKind::Authenticity | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::BusinessRule => match err {
            BillingError::NotFound(_) | BillingError::PlanNotFound(_) => StatusCode::NOT_FOUND,
            BillingError::Conflict(_) => StatusCode::CONFLICT,
            BillingError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        },
        ErrorKind::Transient => match err {
            BillingError::StripeApi(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

/// Status for a billing error on the webhook endpoint.
pub fn webhook_status(err: &BillingError) -> StatusCode {
    match err.kind() {
        ErrorKind::Authenticity | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::BusinessRule => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Transient => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Auth(err) => return err.into_response(),
            other => other,
        };

        let status = err.status();
        let kind = err.kind();
        let message = if status.is_server_error() {
            tracing::error!(%status, kind = kind, error = %err, "Request failed");
            match status {
                StatusCode::BAD_GATEWAY => "Payment processor unavailable".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            tracing::warn!(%status, kind = kind, error = %err, "Request rejected");
            err.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16(),
            "kind": kind
        }));

        (status, body).into_response()
    }
}

//! Payment processor webhook route
//!
//! The body is taken as the raw string the processor signed. Re-serializing
//! it before verification would break the signature.

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;
use storefront_billing::{WebhookOutcome, SIGNATURE_HEADER};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

pub async fn receive_payment_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let outcome = state
        .billing
        .webhooks
        .handle(&body, signature)
        .await
        .map_err(ApiError::Webhook)?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

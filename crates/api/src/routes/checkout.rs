//! Checkout routes

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use storefront_billing::{CheckoutIntent, CheckoutResponse};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Create a hosted checkout session for the caller.
pub async fn create_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(mut intent): Json<CheckoutIntent>,
) -> ApiResult<(StatusCode, Json<CheckoutResponse>)> {
    if intent.customer_ref.is_none() {
        intent.customer_ref = Some(auth_user.user_id.to_string());
    }

    tracing::info!(
        user_id = %auth_user.user_id,
        purpose_kind = intent.purpose_kind.as_str(),
        subject_id = %intent.subject_id,
        "Creating checkout session"
    );

    let response = state.billing.checkout.create_session(intent).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

//! Seller self-service routes
//!
//! Every route acts on the caller's own seller id.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use storefront_billing::{
    NewPayoutRequest, PayoutBalance, PayoutPreferences, PayoutPreferencesUpdate, PayoutRequest,
    PayoutStatus, SellerStatement,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct StatementResponse {
    pub statement: SellerStatement,
    pub balance: PayoutBalance,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRequestCreated {
    pub request_id: Uuid,
    pub status: PayoutStatus,
}

#[derive(Debug, Serialize)]
pub struct PayoutRequestList {
    pub requests: Vec<PayoutRequest>,
}

pub async fn get_payout_preferences(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PayoutPreferences>> {
    let seller_id = auth_user.require_seller()?;
    Ok(Json(state.billing.payouts.preferences(seller_id).await?))
}

pub async fn update_payout_preferences(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(update): Json<PayoutPreferencesUpdate>,
) -> ApiResult<Json<PayoutPreferences>> {
    let seller_id = auth_user.require_seller()?;
    Ok(Json(
        state
            .billing
            .payouts
            .update_preferences(seller_id, update)
            .await?,
    ))
}

pub async fn get_statement(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<StatementResponse>> {
    let seller_id = auth_user.require_seller()?;
    let now = OffsetDateTime::now_utc();

    let statement = state.billing.revenue.seller_statement(seller_id, now).await?;
    let balance = state.billing.payouts.balance(seller_id, now).await?;

    Ok(Json(StatementResponse { statement, balance }))
}

pub async fn create_payout_request(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(new): Json<NewPayoutRequest>,
) -> ApiResult<(StatusCode, Json<PayoutRequestCreated>)> {
    let seller_id = auth_user.require_seller()?;
    let request = state.billing.payouts.create_request(seller_id, new).await?;

    Ok((
        StatusCode::CREATED,
        Json(PayoutRequestCreated {
            request_id: request.id,
            status: request.status,
        }),
    ))
}

pub async fn list_payout_requests(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PayoutRequestList>> {
    let seller_id = auth_user.require_seller()?;
    let requests = state.billing.payouts.list_requests(seller_id).await?;
    Ok(Json(PayoutRequestList { requests }))
}

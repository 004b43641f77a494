//! Admin routes
//!
//! Every handler checks the admin role before touching the engine.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use storefront_billing::{
    AdminPayoutUpdate, InvariantCheckSummary, PayoutRequest, Plan, SellerFeeSettings,
    WebhookFailureRecord,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct FeeSettingsRequest {
    #[serde(default)]
    pub fee_percent_override: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub promo_ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
pub struct FailuresQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct FailureList {
    pub failures: Vec<WebhookFailureRecord>,
}

// =============================================================================
// Payouts
// =============================================================================

pub async fn update_payout_request(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(request_id): Path<Uuid>,
    Json(update): Json<AdminPayoutUpdate>,
) -> ApiResult<Json<PayoutRequest>> {
    auth_user.require_admin()?;

    let request = state.billing.payouts.admin_update(request_id, update).await?;
    tracing::info!(
        request_id = %request_id,
        admin_id = %auth_user.user_id,
        status = %request.status,
        "Admin updated payout request"
    );
    Ok(Json(request))
}

// =============================================================================
// Revenue
// =============================================================================

pub async fn update_fee_settings(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(seller_id): Path<Uuid>,
    Json(req): Json<FeeSettingsRequest>,
) -> ApiResult<Json<SellerFeeSettings>> {
    auth_user.require_admin()?;

    let settings = state
        .billing
        .revenue
        .set_fee_settings(SellerFeeSettings {
            seller_id,
            fee_percent_override: req.fee_percent_override,
            promo_ends_at: req.promo_ends_at,
        })
        .await?;

    tracing::info!(
        seller_id = %seller_id,
        admin_id = %auth_user.user_id,
        fee_percent_override = ?settings.fee_percent_override,
        promo_ends_at = ?settings.promo_ends_at,
        "Seller fee settings updated"
    );
    Ok(Json(settings))
}

pub async fn save_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(plan): Json<Plan>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    auth_user.require_admin()?;

    state.billing.subscriptions.save_plan(&plan).await?;
    tracing::info!(plan_id = %plan.id, seller_id = %plan.seller_id, active = plan.active, "Plan saved");
    Ok((StatusCode::CREATED, Json(plan)))
}

// =============================================================================
// Operations
// =============================================================================

pub async fn list_webhook_failures(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<FailuresQuery>,
) -> ApiResult<Json<FailureList>> {
    auth_user.require_admin()?;

    let failures = state
        .billing
        .webhooks
        .list_failures(query.limit.unwrap_or(50))
        .await?;
    Ok(Json(FailureList { failures }))
}

pub async fn run_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    auth_user.require_admin()?;

    tracing::info!(admin_id = %auth_user.user_id, "Invariant check requested");
    Ok(Json(state.billing.invariants.run_all_checks().await?))
}

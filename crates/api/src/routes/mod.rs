//! API routes

pub mod admin;
pub mod checkout;
pub mod orders;
pub mod sellers;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, patch, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // Routes that require a bearer token
    let protected_routes = Router::new()
        .route("/v1/checkout/sessions", post(checkout::create_session))
        .route("/v1/orders", post(orders::create_order))
        .route("/v1/orders/{id}", get(orders::get_order))
        .route("/v1/orders/{id}/status", post(orders::update_status))
        .route(
            "/v1/sellers/me/payout-preferences",
            get(sellers::get_payout_preferences).put(sellers::update_payout_preferences),
        )
        .route("/v1/sellers/me/statement", get(sellers::get_statement))
        .route(
            "/v1/sellers/me/payout-requests",
            post(sellers::create_payout_request).get(sellers::list_payout_requests),
        )
        .route("/v1/admin/payout-requests/{id}", patch(admin::update_payout_request))
        .route("/v1/admin/sellers/{id}/fee-settings", put(admin::update_fee_settings))
        .route("/v1/admin/plans", post(admin::save_plan))
        .route("/v1/admin/webhook-failures", get(admin::list_webhook_failures))
        .route("/v1/admin/invariants", get(admin::run_invariants))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Public routes; the webhook authenticates by signature
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/v1/webhooks/payments", post(webhooks::receive_payment_event));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

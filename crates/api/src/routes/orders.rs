//! Order routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use storefront_billing::{BillingError, Order, OrderItem, OrderStatus, OrderWithHistory};
use uuid::Uuid;

use crate::{
    auth::{AuthUser, Role},
    error::ApiResult,
    state::AppState,
};

fn default_currency() -> String {
    "usd".to_string()
}

/// Walk-in order placed at the counter.
#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItem>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub customer_ref: Option<String>,
    #[serde(default)]
    pub seller_id: Option<Uuid>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn create_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<(StatusCode, Json<OrderWithHistory>)> {
    auth_user.require_admin()?;

    let order = state
        .billing
        .orders
        .create_walk_in(req.customer_ref, req.seller_id, req.items, req.currency, req.note)
        .await?;

    tracing::debug!(order_id = %order.order.id, admin_id = %auth_user.user_id, "Order entered by admin");

    Ok((StatusCode::CREATED, Json(order)))
}

/// Admins read any order; customers and sellers only their own.
fn can_read(auth_user: &AuthUser, order: &Order) -> bool {
    match auth_user.role {
        Role::Admin => true,
        Role::Seller => order.seller_id == Some(auth_user.user_id),
        Role::Customer => order.customer_ref.as_deref() == Some(auth_user.user_id.to_string().as_str()),
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderWithHistory>> {
    let order = state.billing.orders.get(order_id).await?;

    // Foreign orders answer 404 so other orders do not leak.
    if !can_read(&auth_user, &order.order) {
        tracing::warn!(
            order_id = %order_id,
            user_id = %auth_user.user_id,
            role = ?auth_user.role,
            "Order read denied"
        );
        return Err(BillingError::NotFound(format!("order {}", order_id)).into());
    }

    Ok(Json(order))
}

pub async fn update_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> ApiResult<Json<OrderWithHistory>> {
    auth_user.require_admin()?;

    let target: OrderStatus = req.status.parse()?;
    let order = state
        .billing
        .orders
        .update_status(order_id, target, req.note)
        .await?;

    Ok(Json(order))
}

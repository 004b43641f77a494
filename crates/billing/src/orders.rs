//! Order lifecycle
//!
//! Orders move `pending -> confirmed -> preparing -> ready -> completed`, with
//! `cancelled` reachable from any non-terminal status. Every accepted
//! transition appends exactly one history entry, and the status write is a
//! compare-and-set against the status that was validated.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BillingError::invalid_enum("order status", s))
    }
}

/// Check a requested move before anything is written.
pub fn validate_transition(from: OrderStatus, to: OrderStatus) -> BillingResult<()> {
    let allowed = !from.is_terminal() && to != OrderStatus::Pending && from != to;
    if allowed {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            entity: "order",
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub qty: u32,
    pub unit_price_cents: i64,
}

/// Sum of `qty * unit_price_cents`, rejecting empty carts and bad lines.
pub fn order_total(items: &[OrderItem]) -> BillingResult<i64> {
    if items.is_empty() {
        return Err(BillingError::InvalidInput(
            "at least one item is required".to_string(),
        ));
    }
    items.iter().try_fold(0_i64, |total, item| {
        if item.sku.trim().is_empty() {
            return Err(BillingError::InvalidInput("item sku must not be empty".to_string()));
        }
        if item.qty == 0 {
            return Err(BillingError::InvalidInput(format!(
                "item '{}' must have a positive quantity",
                item.sku
            )));
        }
        if item.unit_price_cents < 0 {
            return Err(BillingError::NegativeAmount("unit_price_cents"));
        }
        item.unit_price_cents
            .checked_mul(i64::from(item.qty))
            .and_then(|line| total.checked_add(line))
            .ok_or_else(|| BillingError::InvalidInput("order total overflows".to_string()))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub total_cents: i64,
    pub currency: String,
    pub customer_ref: Option<String>,
    pub seller_id: Option<Uuid>,
    /// Set for orders created by a checkout completion.
    pub external_session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Order {
    /// New `pending` order plus its opening history entry.
    pub fn new_pending(
        items: Vec<OrderItem>,
        currency: String,
        customer_ref: Option<String>,
        seller_id: Option<Uuid>,
        external_session_id: Option<String>,
        note: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<(Order, OrderStatusHistoryEntry)> {
        let total_cents = order_total(&items)?;
        let order = Order {
            id: Uuid::new_v4(),
            status: OrderStatus::Pending,
            items,
            total_cents,
            currency,
            customer_ref,
            seller_id,
            external_session_id,
            created_at: now,
            updated_at: now,
        };
        let entry = OrderStatusHistoryEntry {
            order_id: order.id,
            status: OrderStatus::Pending,
            note,
            occurred_at: now,
        };
        Ok((order, entry))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusHistoryEntry {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderWithHistory {
    #[serde(flatten)]
    pub order: Order,
    pub history: Vec<OrderStatusHistoryEntry>,
}

impl OrderWithHistory {
    /// How long the order has held its current status.
    pub fn time_in_state(&self, now: OffsetDateTime) -> time::Duration {
        let entered = self
            .history
            .iter()
            .rev()
            .find(|entry| entry.status == self.order.status)
            .map(|entry| entry.occurred_at)
            .unwrap_or(self.order.created_at);
        (now - entered).max(time::Duration::ZERO)
    }
}

/// Order operations for the internal API.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn BillingStore>,
}

impl OrderService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn create_walk_in(
        &self,
        customer_ref: Option<String>,
        seller_id: Option<Uuid>,
        items: Vec<OrderItem>,
        currency: String,
        note: Option<String>,
    ) -> BillingResult<OrderWithHistory> {
        let (order, entry) = Order::new_pending(
            items,
            currency,
            customer_ref,
            seller_id,
            None,
            Some(note.unwrap_or_else(|| "walk-in order".to_string())),
            OffsetDateTime::now_utc(),
        )?;
        self.store.insert_order(&order, &entry).await?;

        tracing::info!(
            order_id = %order.id,
            total_cents = order.total_cents,
            "Walk-in order created"
        );

        Ok(OrderWithHistory {
            order,
            history: vec![entry],
        })
    }

    pub async fn get(&self, order_id: Uuid) -> BillingResult<OrderWithHistory> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))?;
        let history = self.store.order_history(order_id).await?;
        Ok(OrderWithHistory { order, history })
    }

    /// Apply an admin status change.
    pub async fn update_status(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        note: Option<String>,
    ) -> BillingResult<OrderWithHistory> {
        let current = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))?;

        validate_transition(current.status, target)?;

        let entry = OrderStatusHistoryEntry {
            order_id,
            status: target,
            note,
            occurred_at: OffsetDateTime::now_utc(),
        };

        let applied = self
            .store
            .transition_order(order_id, current.status, &entry)
            .await?;
        if !applied {
            tracing::warn!(
                order_id = %order_id,
                expected = %current.status,
                target = %target,
                "Order status changed concurrently"
            );
            return Err(BillingError::Conflict(format!(
                "order {} is no longer '{}'",
                order_id, current.status
            )));
        }

        tracing::info!(
            order_id = %order_id,
            from = %current.status,
            to = %target,
            "Order status updated"
        );

        self.get(order_id).await
    }
}

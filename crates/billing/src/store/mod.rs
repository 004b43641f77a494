//! Persistence boundary
//!
//! Every service receives an `Arc<dyn BillingStore>`. [`postgres::PgBillingStore`]
//! is the production implementation; [`memory::MemoryStore`] backs tests and
//! local runs without a database.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::checkout::CheckoutSessionRecord;
use crate::dispatch::EventEffect;
use crate::error::BillingResult;
use crate::intake::Intake;
use crate::orders::{Order, OrderStatus, OrderStatusHistoryEntry};
use crate::payouts::{PayoutPreferences, PayoutRequest, PayoutStatus};
use crate::revenue::{SaleRecord, SellerFeeSettings};
use crate::subscriptions::{Plan, SubscriptionMirror};
use crate::webhooks::WebhookFailureRecord;

pub use memory::MemoryStore;
pub use postgres::PgBillingStore;

/// Row written to the processed-event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Log row and every effect were written.
    Applied,
    /// Another delivery already logged this event id; nothing was written.
    Duplicate,
}

/// Full read of the records the invariant checks look at.
#[derive(Debug, Clone, Default)]
pub struct AuditSnapshot {
    pub orders: Vec<(Order, Vec<OrderStatusHistoryEntry>)>,
    pub intakes: Vec<Intake>,
    pub checkout_sessions: Vec<CheckoutSessionRecord>,
    pub sales: Vec<SaleRecord>,
    pub payout_requests: Vec<PayoutRequest>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Plans and intakes
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;
    async fn upsert_plan(&self, plan: &Plan) -> BillingResult<()>;
    /// A seller is known once it owns a plan or has fee settings on file.
    async fn is_known_seller(&self, seller_id: Uuid) -> BillingResult<bool>;
    async fn get_intake(&self, intake_id: Uuid) -> BillingResult<Option<Intake>>;
    async fn insert_intake(&self, intake: &Intake) -> BillingResult<()>;

    // Checkout
    /// Persist a created session. For deposit sessions the intake's session
    /// id and deposit amount are written in the same operation.
    async fn record_checkout_session(&self, record: &CheckoutSessionRecord) -> BillingResult<()>;
    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<Option<CheckoutSessionRecord>>;

    // Webhook event log
    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool>;
    /// Insert the log row and apply `effects` atomically.
    async fn commit_event(&self, event: &ProcessedEvent, effects: &[EventEffect]) -> BillingResult<CommitOutcome>;
    async fn record_webhook_failure(&self, failure: &WebhookFailureRecord) -> BillingResult<()>;
    async fn list_webhook_failures(&self, limit: i64) -> BillingResult<Vec<WebhookFailureRecord>>;

    // Subscriptions
    async fn get_subscription(&self, external_subscription_id: &str) -> BillingResult<Option<SubscriptionMirror>>;

    // Orders
    async fn insert_order(&self, order: &Order, opening: &OrderStatusHistoryEntry) -> BillingResult<()>;
    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<Order>>;
    async fn find_order_by_session(&self, session_id: &str) -> BillingResult<Option<Order>>;
    async fn order_history(&self, order_id: Uuid) -> BillingResult<Vec<OrderStatusHistoryEntry>>;
    /// Compare-and-set: returns `false` when the order is no longer `expected`.
    async fn transition_order(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        entry: &OrderStatusHistoryEntry,
    ) -> BillingResult<bool>;

    // Revenue
    async fn get_fee_settings(&self, seller_id: Uuid) -> BillingResult<Option<SellerFeeSettings>>;
    async fn upsert_fee_settings(&self, settings: &SellerFeeSettings) -> BillingResult<()>;
    async fn list_sales(&self, seller_id: Uuid) -> BillingResult<Vec<SaleRecord>>;

    // Payouts
    async fn get_payout_preferences(&self, seller_id: Uuid) -> BillingResult<Option<PayoutPreferences>>;
    async fn upsert_payout_preferences(&self, prefs: &PayoutPreferences) -> BillingResult<()>;
    async fn insert_payout_request(&self, request: &PayoutRequest) -> BillingResult<()>;
    async fn get_payout_request(&self, request_id: Uuid) -> BillingResult<Option<PayoutRequest>>;
    async fn list_payout_requests(&self, seller_id: Uuid) -> BillingResult<Vec<PayoutRequest>>;
    /// Compare-and-set on status; writes status, notes and `updated_at`.
    async fn update_payout_request(&self, request: &PayoutRequest, expected: PayoutStatus) -> BillingResult<bool>;

    // Operator tooling
    async fn audit_snapshot(&self) -> BillingResult<AuditSnapshot>;
}

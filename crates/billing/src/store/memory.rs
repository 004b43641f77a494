//! In-memory store
//!
//! Backs the test suites and local runs without `DATABASE_URL`. A commit works
//! on a copy of the state and swaps it in only when every effect applied, so a
//! failing effect leaves nothing behind, same as a rolled-back transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AuditSnapshot, BillingStore, CommitOutcome, ProcessedEvent};
use crate::checkout::{CheckoutSessionRecord, PurposeKind};
use crate::dispatch::EventEffect;
use crate::error::{BillingError, BillingResult};
use crate::intake::Intake;
use crate::orders::{Order, OrderStatus, OrderStatusHistoryEntry};
use crate::payouts::{PayoutPreferences, PayoutRequest, PayoutStatus};
use crate::revenue::{SaleRecord, SellerFeeSettings};
use crate::subscriptions::{Plan, SubscriptionMirror};
use crate::webhooks::WebhookFailureRecord;

#[derive(Debug, Clone, Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    intakes: HashMap<Uuid, Intake>,
    sessions: HashMap<String, CheckoutSessionRecord>,
    processed: HashMap<String, ProcessedEvent>,
    failures: Vec<WebhookFailureRecord>,
    subscriptions: HashMap<String, SubscriptionMirror>,
    orders: HashMap<Uuid, Order>,
    history: HashMap<Uuid, Vec<OrderStatusHistoryEntry>>,
    sales: BTreeMap<String, SaleRecord>,
    fee_settings: HashMap<Uuid, SellerFeeSettings>,
    payout_prefs: HashMap<Uuid, PayoutPreferences>,
    payout_requests: HashMap<Uuid, PayoutRequest>,
}

impl State {
    fn apply(&mut self, effect: &EventEffect) -> BillingResult<()> {
        match effect {
            EventEffect::LatchDeposit {
                intake_id,
                session_id,
            } => {
                let intake = self
                    .intakes
                    .get_mut(intake_id)
                    .ok_or_else(|| BillingError::NotFound(format!("intake {}", intake_id)))?;
                if !intake.latch_deposit(session_id) {
                    tracing::info!(intake_id = %intake_id, "Deposit already latched, skipping");
                }
            }
            EventEffect::CreateOrder { order, opening } => {
                let exists = self.orders.values().any(|o| {
                    o.external_session_id.is_some() && o.external_session_id == order.external_session_id
                });
                if !exists {
                    self.orders.insert(order.id, order.clone());
                    self.history.insert(order.id, vec![opening.clone()]);
                }
            }
            EventEffect::MirrorSubscription(incoming) => {
                let existing = self.subscriptions.get(&incoming.external_subscription_id);
                if let Some(merged) = SubscriptionMirror::merged(existing, incoming) {
                    self.subscriptions
                        .insert(merged.external_subscription_id.clone(), merged);
                } else {
                    tracing::info!(
                        subscription_id = %incoming.external_subscription_id,
                        "Stale subscription event, keeping newer state"
                    );
                }
            }
            EventEffect::RecordSale(sale) => {
                self.sales
                    .entry(sale.source_ref.clone())
                    .or_insert_with(|| sale.clone());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_next_commit: AtomicBool,
    commit_calls: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_event` fail as if the database went away.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn commit_calls(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub async fn processed_event_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.processed.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn seed_sale(&self, sale: SaleRecord) {
        self.state
            .lock()
            .await
            .sales
            .insert(sale.source_ref.clone(), sale);
    }

    pub async fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.state.lock().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.state.lock().await.plans.get(&plan_id).cloned())
    }

    async fn upsert_plan(&self, plan: &Plan) -> BillingResult<()> {
        self.state.lock().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn is_known_seller(&self, seller_id: Uuid) -> BillingResult<bool> {
        let state = self.state.lock().await;
        Ok(state.fee_settings.contains_key(&seller_id)
            || state.plans.values().any(|plan| plan.seller_id == seller_id))
    }

    async fn get_intake(&self, intake_id: Uuid) -> BillingResult<Option<Intake>> {
        Ok(self.state.lock().await.intakes.get(&intake_id).cloned())
    }

    async fn insert_intake(&self, intake: &Intake) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.intakes.contains_key(&intake.id) {
            return Err(BillingError::Conflict(format!("intake {} exists", intake.id)));
        }
        state.intakes.insert(intake.id, intake.clone());
        Ok(())
    }

    async fn record_checkout_session(&self, record: &CheckoutSessionRecord) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if record.purpose_kind == PurposeKind::Deposit {
            let intake = state
                .intakes
                .get_mut(&record.subject_id)
                .ok_or_else(|| BillingError::NotFound(format!("intake {}", record.subject_id)))?;
            intake.external_session_id = Some(record.session_id.clone());
            intake.deposit_amount_cents = record.amount_cents;
        }
        state.sessions.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<Option<CheckoutSessionRecord>> {
        Ok(self.state.lock().await.sessions.get(session_id).cloned())
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.state.lock().await.processed.contains_key(event_id))
    }

    async fn commit_event(&self, event: &ProcessedEvent, effects: &[EventEffect]) -> BillingResult<CommitOutcome> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(BillingError::Database("simulated connection loss".to_string()));
        }

        let mut guard = self.state.lock().await;
        if guard.processed.contains_key(&event.event_id) {
            return Ok(CommitOutcome::Duplicate);
        }

        let mut next = guard.clone();
        for effect in effects {
            next.apply(effect)?;
        }
        next.processed.insert(event.event_id.clone(), event.clone());
        *guard = next;
        Ok(CommitOutcome::Applied)
    }

    async fn record_webhook_failure(&self, failure: &WebhookFailureRecord) -> BillingResult<()> {
        self.state.lock().await.failures.push(failure.clone());
        Ok(())
    }

    async fn list_webhook_failures(&self, limit: i64) -> BillingResult<Vec<WebhookFailureRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .failures
            .iter()
            .rev()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn get_subscription(&self, external_subscription_id: &str) -> BillingResult<Option<SubscriptionMirror>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(external_subscription_id)
            .cloned())
    }

    async fn insert_order(&self, order: &Order, opening: &OrderStatusHistoryEntry) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.orders.insert(order.id, order.clone());
        state.history.insert(order.id, vec![opening.clone()]);
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn find_order_by_session(&self, session_id: &str) -> BillingResult<Option<Order>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .find(|o| o.external_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn order_history(&self, order_id: Uuid) -> BillingResult<Vec<OrderStatusHistoryEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        entry: &OrderStatusHistoryEntry,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        if order.status != expected {
            return Ok(false);
        }
        order.status = entry.status;
        order.updated_at = entry.occurred_at;
        state.history.entry(order_id).or_default().push(entry.clone());
        Ok(true)
    }

    async fn get_fee_settings(&self, seller_id: Uuid) -> BillingResult<Option<SellerFeeSettings>> {
        Ok(self.state.lock().await.fee_settings.get(&seller_id).cloned())
    }

    async fn upsert_fee_settings(&self, settings: &SellerFeeSettings) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .fee_settings
            .insert(settings.seller_id, settings.clone());
        Ok(())
    }

    async fn list_sales(&self, seller_id: Uuid) -> BillingResult<Vec<SaleRecord>> {
        let state = self.state.lock().await;
        let mut sales: Vec<SaleRecord> = state
            .sales
            .values()
            .filter(|s| s.seller_id == seller_id)
            .cloned()
            .collect();
        sales.sort_by_key(|s| s.occurred_at);
        Ok(sales)
    }

    async fn get_payout_preferences(&self, seller_id: Uuid) -> BillingResult<Option<PayoutPreferences>> {
        Ok(self.state.lock().await.payout_prefs.get(&seller_id).cloned())
    }

    async fn upsert_payout_preferences(&self, prefs: &PayoutPreferences) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .payout_prefs
            .insert(prefs.seller_id, prefs.clone());
        Ok(())
    }

    async fn insert_payout_request(&self, request: &PayoutRequest) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .payout_requests
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn get_payout_request(&self, request_id: Uuid) -> BillingResult<Option<PayoutRequest>> {
        Ok(self.state.lock().await.payout_requests.get(&request_id).cloned())
    }

    async fn list_payout_requests(&self, seller_id: Uuid) -> BillingResult<Vec<PayoutRequest>> {
        let state = self.state.lock().await;
        let mut requests: Vec<PayoutRequest> = state
            .payout_requests
            .values()
            .filter(|r| r.seller_id == seller_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn update_payout_request(&self, request: &PayoutRequest, expected: PayoutStatus) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.payout_requests.get_mut(&request.id) {
            Some(stored) if stored.status == expected => {
                stored.status = request.status;
                stored.notes = request.notes.clone();
                stored.updated_at = request.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn audit_snapshot(&self) -> BillingResult<AuditSnapshot> {
        let state = self.state.lock().await;
        Ok(AuditSnapshot {
            orders: state
                .orders
                .values()
                .map(|o| (o.clone(), state.history.get(&o.id).cloned().unwrap_or_default()))
                .collect(),
            intakes: state.intakes.values().cloned().collect(),
            checkout_sessions: state.sessions.values().cloned().collect(),
            sales: state.sales.values().cloned().collect(),
            payout_requests: state.payout_requests.values().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn processed(id: &str) -> ProcessedEvent {
        ProcessedEvent {
            event_id: id.to_string(),
            event_type: "checkout.session.completed".to_string(),
            event_created_at: OffsetDateTime::now_utc(),
            processed_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_failed_effect_rolls_back_log_row() {
        let store = MemoryStore::new();
        let effects = vec![EventEffect::LatchDeposit {
            intake_id: Uuid::new_v4(),
            session_id: "cs_1".to_string(),
        }];
        let result = store.commit_event(&processed("evt_1"), &effects).await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
        assert!(!store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_commit_reports_duplicate() {
        let store = MemoryStore::new();
        assert_eq!(
            store.commit_event(&processed("evt_1"), &[]).await.unwrap(),
            CommitOutcome::Applied
        );
        assert_eq!(
            store.commit_event(&processed("evt_1"), &[]).await.unwrap(),
            CommitOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_simulated_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        assert!(store.commit_event(&processed("evt_1"), &[]).await.is_err());
        assert!(store.commit_event(&processed("evt_1"), &[]).await.is_ok());
        assert_eq!(store.commit_calls(), 2);
    }
}

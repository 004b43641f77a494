// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! End-to-end scenarios through the webhook gateway and the in-memory store
//!
//! - Deposits latched exactly once
//! - Redelivered and concurrent events
//! - Signature rejection
//! - Transient store failures and redelivery
//! - Invoices arriving before their subscription
//! - Revenue statements and the payout workflow

#[cfg(test)]
mod support {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::alerting::FailureNotifier;
    use crate::checkout::{CheckoutIntent, CheckoutService, PurposeKind};
    use crate::client::{HostedCheckoutProvider, HostedCheckoutRequest, HostedSession};
    use crate::dispatch::EventDispatcher;
    use crate::error::BillingResult;
    use crate::store::MemoryStore;
    use crate::webhooks::{SignatureVerifier, WebhookGateway, WebhookOutcome};

    pub const SECRET: &str = "whsec_edge_cases";

    #[derive(Default)]
    pub struct FakeProvider {
        pub requests: Mutex<Vec<HostedCheckoutRequest>>,
    }

    #[async_trait]
    impl HostedCheckoutProvider for FakeProvider {
        async fn create_session(&self, request: &HostedCheckoutRequest) -> BillingResult<HostedSession> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            let id = format!("cs_edge_{}", requests.len());
            Ok(HostedSession {
                redirect_url: format!("https://checkout.test/{}", id),
                session_id: id,
            })
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub provider: Arc<FakeProvider>,
        pub gateway: WebhookGateway,
        pub checkout: CheckoutService,
        verifier: SignatureVerifier,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let provider = Arc::new(FakeProvider::default());
            let verifier = SignatureVerifier::new(SECRET, 300);
            let gateway = WebhookGateway::new(
                store.clone(),
                verifier.clone(),
                EventDispatcher::default(),
                FailureNotifier::default(),
            );
            let checkout = CheckoutService::new(
                store.clone(),
                provider.clone(),
                50,
                "https://shop.test/ok".to_string(),
                "https://shop.test/cancel".to_string(),
            );
            Self {
                store,
                provider,
                gateway,
                checkout,
                verifier,
            }
        }

        pub fn sign(&self, payload: &str) -> String {
            let ts = OffsetDateTime::now_utc().unix_timestamp();
            format!("t={},v1={}", ts, self.verifier.sign(ts, payload).unwrap())
        }

        pub async fn deliver(&self, payload: &str) -> BillingResult<WebhookOutcome> {
            let header = self.sign(payload);
            self.gateway.handle(payload, Some(&header)).await
        }

        /// Metadata the processor would echo back for the n-th session.
        pub fn session_metadata(&self, index: usize) -> BTreeMap<String, String> {
            self.provider.requests.lock().unwrap()[index]
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
    }

    pub fn envelope(event_id: &str, event_type: &str, created: i64, object: Value) -> String {
        json!({
            "id": event_id,
            "type": event_type,
            "created": created,
            "data": { "object": object }
        })
        .to_string()
    }

    pub fn intent(kind: PurposeKind, subject_id: Uuid) -> CheckoutIntent {
        CheckoutIntent {
            purpose_kind: kind,
            subject_id,
            amount_cents: None,
            currency: "usd".to_string(),
            metadata: BTreeMap::new(),
            items: Vec::new(),
            seller_id: None,
            customer_ref: None,
        }
    }
}

#[cfg(test)]
mod deposit_tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use super::support::*;
    use crate::checkout::PurposeKind;
    use crate::dispatch::CHECKOUT_SESSION_COMPLETED;
    use crate::error::{BillingError, ErrorKind};
    use crate::intake::{Intake, IntakeStatus};
    use crate::store::BillingStore;
    use crate::webhooks::WebhookOutcome;

    // =========================================================================
    // 10k-25k tier: 875 000 cent deposit, latched once across two deliveries
    // =========================================================================
    #[tokio::test]
    async fn test_deposit_latched_once_across_deliveries() {
        let h = Harness::new();
        let intake = Intake::new("10k-25k", OffsetDateTime::now_utc());
        h.store.insert_intake(&intake).await.unwrap();

        let response = h
            .checkout
            .create_session(intent(PurposeKind::Deposit, intake.id))
            .await
            .unwrap();
        let metadata = h.session_metadata(0);
        assert_eq!(metadata["amount_cents"], "875000");

        let object = json!({
            "id": response.session_id,
            "payment_status": "paid",
            "amount_total": 875000,
            "currency": "usd",
            "metadata": metadata,
        });
        let created = OffsetDateTime::now_utc().unix_timestamp();
        let payload = envelope("evt_deposit_1", CHECKOUT_SESSION_COMPLETED, created, object.clone());

        assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Duplicate);

        // A second event id for the same session still latches only once.
        let replay = envelope("evt_deposit_2", CHECKOUT_SESSION_COMPLETED, created, object);
        assert_eq!(h.deliver(&replay).await.unwrap(), WebhookOutcome::Processed);

        let stored = h.store.get_intake(intake.id).await.unwrap().unwrap();
        assert!(stored.deposit_paid);
        assert_eq!(stored.status, IntakeStatus::InProgress);
        assert_eq!(stored.deposit_amount_cents, 875_000);
        assert_eq!(stored.external_session_id.as_deref(), Some(response.session_id.as_str()));

        // Paid deposits cannot be checked out again.
        let err = h
            .checkout
            .create_session(intent(PurposeKind::Deposit, intake.id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
    }

    #[tokio::test]
    async fn test_deposit_for_unknown_intake_is_business_rule_failure() {
        let h = Harness::new();
        let object = json!({
            "id": "cs_ghost",
            "payment_status": "paid",
            "metadata": {
                "purpose_kind": "deposit",
                "subject_id": uuid::Uuid::new_v4().to_string(),
                "amount_cents": "875000",
                "currency": "usd",
            }
        });
        let payload = envelope("evt_ghost", CHECKOUT_SESSION_COMPLETED, 1_767_225_600, object);

        let err = h.deliver(&payload).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(!err.is_retryable());
        assert!(h.store.processed_event_ids().await.is_empty());
        assert_eq!(h.gateway.list_failures(10).await.unwrap().len(), 1);
    }
}

#[cfg(test)]
mod redelivery_tests {
    use std::sync::Arc;

    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::support::*;
    use crate::checkout::PurposeKind;
    use crate::dispatch::CHECKOUT_SESSION_COMPLETED;
    use crate::error::{BillingError, ErrorKind};
    use crate::orders::{OrderItem, OrderStatus};
    use crate::revenue::SellerFeeSettings;
    use crate::store::BillingStore;
    use crate::webhooks::WebhookOutcome;

    async fn cart_payload(h: &Harness, event_id: &str) -> (String, String) {
        let mut cart = intent(PurposeKind::Cart, Uuid::new_v4());
        cart.items = vec![
            OrderItem {
                sku: "latte".to_string(),
                qty: 2,
                unit_price_cents: 450,
            },
            OrderItem {
                sku: "croissant".to_string(),
                qty: 1,
                unit_price_cents: 375,
            },
        ];
        let seller_id = Uuid::new_v4();
        h.store
            .upsert_fee_settings(&SellerFeeSettings::standard(seller_id))
            .await
            .unwrap();
        cart.seller_id = Some(seller_id);
        let response = h.checkout.create_session(cart).await.unwrap();
        let index = h.provider.requests.lock().unwrap().len() - 1;

        let object = json!({
            "id": response.session_id,
            "payment_status": "paid",
            "amount_total": 1275,
            "currency": "usd",
            "metadata": h.session_metadata(index),
        });
        let created = OffsetDateTime::now_utc().unix_timestamp();
        (
            envelope(event_id, CHECKOUT_SESSION_COMPLETED, created, object),
            response.session_id,
        )
    }

    // =========================================================================
    // N redeliveries of one event: applied once, every delivery succeeds
    // =========================================================================
    #[tokio::test]
    async fn test_redeliveries_apply_once() {
        let h = Harness::new();
        let (payload, session_id) = cart_payload(&h, "evt_cart_1").await;

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(h.deliver(&payload).await.unwrap());
        }
        assert_eq!(outcomes[0], WebhookOutcome::Processed);
        assert!(outcomes[1..].iter().all(|o| *o == WebhookOutcome::Duplicate));

        let orders = h.store.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].total_cents, 1_275);
        assert_eq!(orders[0].status, OrderStatus::Pending);
        assert_eq!(orders[0].external_session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(h.store.processed_event_ids().await, vec!["evt_cart_1".to_string()]);
        assert_eq!(h.store.order_history(orders[0].id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_apply_once() {
        let h = Arc::new(Harness::new());
        let (payload, _) = cart_payload(&h, "evt_cart_race").await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            let payload = payload.clone();
            tasks.push(tokio::spawn(async move { h.deliver(&payload).await }));
        }
        let mut processed = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == WebhookOutcome::Processed {
                processed += 1;
            }
        }
        assert_eq!(processed, 1);
        assert_eq!(h.store.orders().await.len(), 1);
    }

    // =========================================================================
    // Invalid signature: rejected, not retryable, event id never logged
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_signature_not_logged() {
        let h = Harness::new();
        let (payload, _) = cart_payload(&h, "evt_forged").await;
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let forged = format!("t={},v1={}", ts, "00".repeat(32));

        let err = h.gateway.handle(&payload, Some(&forged)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authenticity);
        assert!(!err.is_retryable());

        let err = h.gateway.handle(&payload, None).await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        assert!(h.store.processed_event_ids().await.is_empty());
        assert_eq!(h.store.commit_calls(), 0);
        assert!(h.store.orders().await.is_empty());
        assert!(h.gateway.list_failures(10).await.unwrap().is_empty());
    }

    // =========================================================================
    // Store failure mid-commit: retryable error, nothing logged, redelivery applies
    // =========================================================================
    #[tokio::test]
    async fn test_transient_commit_failure_then_redelivery() {
        let h = Harness::new();
        let (payload, _) = cart_payload(&h, "evt_flaky").await;

        h.store.fail_next_commit();
        let err = h.deliver(&payload).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(h.store.processed_event_ids().await.is_empty());
        assert!(h.store.orders().await.is_empty());

        let failures = h.gateway.list_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].event_id, "evt_flaky");
        assert_eq!(failures[0].error_kind, "transient");

        assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(h.store.orders().await.len(), 1);
        assert_eq!(h.store.commit_calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_event_type_acknowledged_and_logged() {
        let h = Harness::new();
        let payload = envelope("evt_refund", "charge.refunded", 1_767_225_600, json!({"id": "ch_1"}));
        assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Ignored);
        assert_eq!(h.deliver(&payload).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(h.store.processed_event_ids().await, vec!["evt_refund".to_string()]);
    }
}

#[cfg(test)]
mod ordering_tests {
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::support::*;
    use crate::dispatch::{
        INVOICE_PAID, SUBSCRIPTION_CREATED, SUBSCRIPTION_DELETED, SUBSCRIPTION_UPDATED,
    };
    use crate::error::BillingError;
    use crate::revenue::{FeePolicy, RevenueService};
    use crate::store::BillingStore;
    use crate::subscriptions::SubscriptionStatus;
    use crate::webhooks::WebhookOutcome;

    // =========================================================================
    // Invoice before its subscription: transient failure, applied on redelivery
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_before_subscription_is_retried() {
        let h = Harness::new();
        let seller = Uuid::new_v4();
        let created = OffsetDateTime::now_utc().unix_timestamp();

        let invoice = envelope(
            "evt_inv_early",
            INVOICE_PAID,
            created,
            json!({
                "id": "in_early",
                "amount_paid": 10000,
                "currency": "usd",
                "subscription": "sub_late",
                "charge": {"balance_transaction": {"fee": 320}},
            }),
        );
        let err = h.deliver(&invoice).await.unwrap_err();
        assert!(matches!(err, BillingError::OutOfOrder(_)));
        assert!(err.is_retryable());

        let subscription = envelope(
            "evt_sub_created",
            SUBSCRIPTION_CREATED,
            created - 10,
            json!({
                "id": "sub_late",
                "status": "active",
                "customer": "cus_1",
                "metadata": {"seller_id": seller.to_string()},
            }),
        );
        assert_eq!(h.deliver(&subscription).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(h.deliver(&invoice).await.unwrap(), WebhookOutcome::Processed);

        let revenue = RevenueService::new(h.store.clone(), FeePolicy::default());
        let statement = revenue
            .seller_statement(seller, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(statement.lines.len(), 1);
        assert_eq!(statement.platform_fee_cents, 1_452);
        assert_eq!(statement.seller_payout_cents, 8_228);
    }

    #[tokio::test]
    async fn test_older_subscription_event_does_not_regress_state() {
        let h = Harness::new();
        let object = |status: &str| {
            json!({
                "id": "sub_1",
                "status": status,
                "metadata": {"seller_id": Uuid::nil().to_string()},
            })
        };
        let newer = envelope("evt_new", SUBSCRIPTION_UPDATED, 2_000, object("past_due"));
        let older = envelope("evt_old", SUBSCRIPTION_UPDATED, 1_000, object("active"));

        h.deliver(&newer).await.unwrap();
        h.deliver(&older).await.unwrap();

        let mirror = h.store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(mirror.status, SubscriptionStatus::PastDue);
        assert_eq!(h.store.processed_event_ids().await.len(), 2);
    }

    // =========================================================================
    // deleted and updated share a second; the late update must not reopen it
    // =========================================================================
    #[tokio::test]
    async fn test_same_second_update_after_delete_stays_canceled() {
        let h = Harness::new();
        let object = |status: &str| {
            json!({
                "id": "sub_same_second",
                "status": status,
                "metadata": {"seller_id": Uuid::nil().to_string()},
            })
        };
        let deleted = envelope("evt_deleted", SUBSCRIPTION_DELETED, 3_000, object("canceled"));
        let updated = envelope("evt_updated", SUBSCRIPTION_UPDATED, 3_000, object("active"));

        assert_eq!(h.deliver(&deleted).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(h.deliver(&updated).await.unwrap(), WebhookOutcome::Processed);

        let mirror = h
            .store
            .get_subscription("sub_same_second")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mirror.status, SubscriptionStatus::Canceled);
        assert_eq!(h.store.processed_event_ids().await.len(), 2);
    }
}

#[cfg(test)]
mod revenue_and_payout_tests {
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::support::*;
    use crate::dispatch::INVOICE_PAID;
    use crate::error::BillingError;
    use crate::payouts::{AdminPayoutUpdate, NewPayoutRequest, PayoutService, PayoutStatus};
    use crate::revenue::{FeePolicy, RevenueService};

    async fn seller_with_invoice(h: &Harness) -> Uuid {
        let seller = Uuid::new_v4();
        let invoice = envelope(
            "evt_inv_1",
            INVOICE_PAID,
            OffsetDateTime::now_utc().unix_timestamp(),
            json!({
                "id": "in_1",
                "amount_paid": 10000,
                "currency": "usd",
                "tax": 0,
                "subscription": "sub_1",
                "subscription_details": {"metadata": {"seller_id": seller.to_string()}},
                "charge": {"balance_transaction": {"fee": 320}},
            }),
        );
        h.deliver(&invoice).await.unwrap();
        seller
    }

    fn request(amount: i64) -> NewPayoutRequest {
        NewPayoutRequest {
            amount_cents: Some(amount),
            method: None,
            cadence: None,
            notes: None,
        }
    }

    fn to(status: &str) -> AdminPayoutUpdate {
        AdminPayoutUpdate {
            status: Some(status.to_string()),
            notes: None,
        }
    }

    // =========================================================================
    // 10000 gross, 320 fees, 0 tax, 15% -> 9680 net, 1452 platform, 8228 seller
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_revenue_split() {
        let h = Harness::new();
        let seller = seller_with_invoice(&h).await;

        let revenue = RevenueService::new(h.store.clone(), FeePolicy::default());
        let statement = revenue
            .seller_statement(seller, OffsetDateTime::now_utc())
            .await
            .unwrap();
        let line = &statement.lines[0].breakdown;
        assert_eq!(line.net_receipts_cents(), 9_680);
        assert_eq!(line.platform_fee_cents, 1_452);
        assert_eq!(line.seller_payout_cents, 8_228);
        assert_eq!(statement.platform_fee_percent, 15);
    }

    // =========================================================================
    // requested -> approved, second request rejected, first paid
    // =========================================================================
    #[tokio::test]
    async fn test_payout_lifecycle() {
        let h = Harness::new();
        let seller = seller_with_invoice(&h).await;
        let revenue = RevenueService::new(h.store.clone(), FeePolicy::default());
        let payouts = PayoutService::new(h.store.clone(), revenue);

        let first = payouts.create_request(seller, request(5_000)).await.unwrap();
        assert_eq!(first.status, PayoutStatus::Requested);
        let approved = payouts.admin_update(first.id, to("approved")).await.unwrap();
        assert_eq!(approved.status, PayoutStatus::Approved);

        // 8228 accrued, 5000 committed.
        let over = payouts.create_request(seller, request(4_000)).await.unwrap_err();
        assert!(matches!(
            over,
            BillingError::InsufficientBalance {
                requested_cents: 4_000,
                available_cents: 3_228
            }
        ));

        let second = payouts.create_request(seller, request(3_000)).await.unwrap();
        let rejected = payouts.admin_update(second.id, to("rejected")).await.unwrap();
        assert_eq!(rejected.status, PayoutStatus::Rejected);
        assert!(payouts.admin_update(second.id, to("approved")).await.is_err());

        let paid = payouts.admin_update(first.id, to("paid")).await.unwrap();
        assert_eq!(paid.status, PayoutStatus::Paid);
        assert!(matches!(
            payouts.admin_update(first.id, to("approved")).await,
            Err(BillingError::InvalidTransition { .. })
        ));

        let balance = payouts.balance(seller, OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(balance.accrued_cents, 8_228);
        assert_eq!(balance.committed_cents, 5_000);
        assert_eq!(balance.available_cents, 3_228);
        assert_eq!(payouts.list_requests(seller).await.unwrap().len(), 2);
    }
}

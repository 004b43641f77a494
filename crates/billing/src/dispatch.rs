//! Event dispatch table
//!
//! Routes a verified event to exactly one handler by type. Handlers only read;
//! what they decide comes back as [`EventEffect`]s, which the store applies in
//! the same transaction that logs the event id.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::checkout::{keys, CheckoutMetadata, PurposeKind};
use crate::error::{BillingError, BillingResult};
use crate::orders::{Order, OrderStatusHistoryEntry};
use crate::revenue::{
    effective_platform_fee_percent, FeePolicy, ProcessorFeeEstimate, SaleRecord, SellerFeeSettings,
};
use crate::store::BillingStore;
use crate::subscriptions::{SubscriptionMirror, SubscriptionStatus};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAID: &str = "invoice.paid";

pub const HANDLED_EVENT_TYPES: [&str; 5] = [
    CHECKOUT_SESSION_COMPLETED,
    SUBSCRIPTION_CREATED,
    SUBSCRIPTION_UPDATED,
    SUBSCRIPTION_DELETED,
    INVOICE_PAID,
];

/// Declarative mutation applied inside the event's transaction.
///
/// Each variant is keyed by a natural key so applying it twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    /// Flip `deposit_paid` false -> true and move the intake in progress.
    LatchDeposit { intake_id: Uuid, session_id: String },
    /// Insert unless an order already exists for the session.
    CreateOrder {
        order: Order,
        opening: OrderStatusHistoryEntry,
    },
    /// Upsert unless the stored row saw a newer event.
    MirrorSubscription(SubscriptionMirror),
    /// Insert unless a sale with the same source ref exists.
    RecordSale(SaleRecord),
}

/// Verified webhook envelope
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub object: Value,
}

#[derive(Deserialize)]
struct RawEnvelope {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    created: Option<i64>,
    data: Option<RawData>,
}

#[derive(Deserialize)]
struct RawData {
    object: Option<Value>,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let raw: RawEnvelope = serde_json::from_str(payload)
            .map_err(|e| BillingError::MalformedEvent(format!("invalid JSON: {}", e)))?;

        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| BillingError::MalformedEvent("missing event id".to_string()))?;
        let event_type = raw
            .event_type
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BillingError::MalformedEvent("missing event type".to_string()))?;
        let created = raw
            .created
            .ok_or_else(|| BillingError::MalformedEvent("missing created timestamp".to_string()))
            .and_then(|ts| {
                OffsetDateTime::from_unix_timestamp(ts)
                    .map_err(|_| BillingError::MalformedEvent(format!("invalid created timestamp {}", ts)))
            })?;
        let object = raw
            .data
            .and_then(|data| data.object)
            .filter(Value::is_object)
            .ok_or_else(|| BillingError::MalformedEvent("data.object must be an object".to_string()))?;

        Ok(Self {
            id,
            event_type,
            created,
            object,
        })
    }

    fn object_as<T: for<'de> Deserialize<'de>>(&self) -> BillingResult<T> {
        serde_json::from_value(self.object.clone()).map_err(|e| {
            BillingError::MalformedEvent(format!("{} object: {}", self.event_type, e))
        })
    }
}

/// What the dispatcher decided for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled(Vec<EventEffect>),
    /// Acknowledge and log the id, change nothing.
    Ignored(&'static str),
}

#[derive(Debug, Deserialize)]
struct TotalDetails {
    amount_tax: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    id: String,
    payment_status: Option<String>,
    metadata: Option<HashMap<String, String>>,
    amount_total: Option<i64>,
    currency: Option<String>,
    subscription: Option<Value>,
    customer: Option<Value>,
    total_details: Option<TotalDetails>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
    metadata: Option<HashMap<String, String>>,
    customer: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    amount_paid: i64,
    currency: Option<String>,
    subscription: Option<Value>,
    customer: Option<Value>,
    tax: Option<i64>,
}

/// Id of a field the processor may send either as a string or expanded.
fn expandable_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(obj) => obj.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Fee the processor actually charged, when the payload has it expanded.
fn settled_fee(object: &Value) -> Option<i64> {
    [
        "/payment_intent/latest_charge/balance_transaction/fee",
        "/latest_charge/balance_transaction/fee",
        "/charge/balance_transaction/fee",
    ]
    .iter()
    .find_map(|pointer| object.pointer(pointer).and_then(Value::as_i64))
}

fn metadata_uuid(map: Option<&HashMap<String, String>>, key: &str) -> Option<Uuid> {
    map?.get(key).and_then(|raw| Uuid::parse_str(raw).ok())
}

fn is_settled(payment_status: Option<&str>) -> bool {
    matches!(payment_status, Some("paid") | Some("no_payment_required"))
}

#[derive(Debug, Clone, Default)]
pub struct EventDispatcher {
    processor_fee: ProcessorFeeEstimate,
    fee_policy: FeePolicy,
}

impl EventDispatcher {
    pub fn new(processor_fee: ProcessorFeeEstimate, fee_policy: FeePolicy) -> Self {
        Self {
            processor_fee,
            fee_policy,
        }
    }

    pub fn handles(event_type: &str) -> bool {
        HANDLED_EVENT_TYPES.contains(&event_type)
    }

    pub async fn dispatch(&self, event: &WebhookEvent, store: &dyn BillingStore) -> BillingResult<Dispatch> {
        match event.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => self.on_checkout_completed(event, store).await,
            SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED | SUBSCRIPTION_DELETED => {
                self.on_subscription_changed(event)
            }
            INVOICE_PAID => self.on_invoice_paid(event, store).await,
            other => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %other,
                    "Unhandled webhook event type"
                );
                Ok(Dispatch::Ignored("unhandled event type"))
            }
        }
    }

    fn processor_fee_for(&self, object: &Value, gross_cents: i64) -> BillingResult<i64> {
        match settled_fee(object) {
            Some(fee) if fee < 0 => Err(BillingError::NegativeAmount("processor_fee_cents")),
            Some(fee) => Ok(fee),
            None => Ok(self.processor_fee.estimate(gross_cents)),
        }
    }

    /// Percentage in force for `seller_id` when the payment settled.
    async fn platform_fee_percent_at(
        &self,
        store: &dyn BillingStore,
        seller_id: Uuid,
        settled_at: OffsetDateTime,
    ) -> BillingResult<u32> {
        let settings = store
            .get_fee_settings(seller_id)
            .await?
            .unwrap_or_else(|| SellerFeeSettings::standard(seller_id));
        Ok(effective_platform_fee_percent(&self.fee_policy, &settings, settled_at))
    }

    async fn on_checkout_completed(&self, event: &WebhookEvent, store: &dyn BillingStore) -> BillingResult<Dispatch> {
        let session: SessionObject = event.object_as()?;

        if !is_settled(session.payment_status.as_deref()) {
            tracing::info!(
                event_id = %event.id,
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Checkout completed without settled payment, nothing to apply"
            );
            return Ok(Dispatch::Ignored("payment not settled"));
        }

        let metadata = CheckoutMetadata::from_map(&session.metadata.clone().unwrap_or_default())?;

        match metadata.purpose_kind {
            PurposeKind::Deposit => {
                let intake = store
                    .get_intake(metadata.subject_id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("intake {}", metadata.subject_id)))?;
                if session.amount_total.is_some_and(|paid| paid != metadata.amount_cents) {
                    tracing::warn!(
                        event_id = %event.id,
                        intake_id = %intake.id,
                        paid = ?session.amount_total,
                        expected = metadata.amount_cents,
                        "Deposit amount differs from the amount quoted at checkout"
                    );
                }
                Ok(Dispatch::Handled(vec![EventEffect::LatchDeposit {
                    intake_id: intake.id,
                    session_id: session.id,
                }]))
            }
            PurposeKind::Cart => self.cart_effects(event, &session, metadata, store).await,
            PurposeKind::Subscription => {
                let subscription_id = expandable_id(session.subscription.as_ref()).ok_or_else(|| {
                    BillingError::MalformedEvent("subscription checkout without subscription id".to_string())
                })?;
                let status = if session.payment_status.as_deref() == Some("paid") {
                    SubscriptionStatus::Active
                } else {
                    SubscriptionStatus::Incomplete
                };
                Ok(Dispatch::Handled(vec![EventEffect::MirrorSubscription(SubscriptionMirror {
                    external_subscription_id: subscription_id,
                    plan_id: metadata.plan_id,
                    seller_id: metadata.seller_id,
                    customer_ref: metadata
                        .customer_ref
                        .or_else(|| expandable_id(session.customer.as_ref())),
                    status,
                    last_event_at: event.created,
                })]))
            }
        }
    }

    async fn cart_effects(
        &self,
        event: &WebhookEvent,
        session: &SessionObject,
        metadata: CheckoutMetadata,
        store: &dyn BillingStore,
    ) -> BillingResult<Dispatch> {
        let items = metadata
            .items
            .clone()
            .ok_or_else(|| BillingError::MalformedEvent("cart checkout without items".to_string()))?;
        let currency = session.currency.clone().unwrap_or_else(|| metadata.currency.clone());

        let (order, opening) = Order::new_pending(
            items,
            currency.clone(),
            metadata
                .customer_ref
                .clone()
                .or_else(|| expandable_id(session.customer.as_ref())),
            metadata.seller_id,
            Some(session.id.clone()),
            Some("checkout completed".to_string()),
            event.created,
        )?;

        let mut effects = vec![EventEffect::CreateOrder { order, opening }];

        if let Some(seller_id) = metadata.seller_id {
            let gross = session.amount_total.unwrap_or(metadata.amount_cents);
            if gross < 0 {
                return Err(BillingError::NegativeAmount("gross_cents"));
            }
            let tax = session
                .total_details
                .as_ref()
                .and_then(|t| t.amount_tax)
                .unwrap_or(0);
            effects.push(EventEffect::RecordSale(SaleRecord {
                source_ref: session.id.clone(),
                seller_id,
                gross_cents: gross,
                processor_fee_cents: self.processor_fee_for(&event.object, gross)?,
                tax_cents: tax,
                platform_fee_percent: self
                    .platform_fee_percent_at(store, seller_id, event.created)
                    .await?,
                currency,
                occurred_at: event.created,
            }));
        }

        Ok(Dispatch::Handled(effects))
    }

    fn on_subscription_changed(&self, event: &WebhookEvent) -> BillingResult<Dispatch> {
        let subscription: SubscriptionObject = event.object_as()?;
        let status = if event.event_type == SUBSCRIPTION_DELETED {
            SubscriptionStatus::Canceled
        } else {
            subscription
                .status
                .parse()
                .map_err(|e: BillingError| BillingError::MalformedEvent(e.to_string()))?
        };

        let metadata = subscription.metadata.as_ref();
        Ok(Dispatch::Handled(vec![EventEffect::MirrorSubscription(SubscriptionMirror {
            external_subscription_id: subscription.id.clone(),
            plan_id: metadata_uuid(metadata, keys::PLAN_ID),
            seller_id: metadata_uuid(metadata, keys::SELLER_ID),
            customer_ref: metadata
                .and_then(|m| m.get(keys::CUSTOMER_REF).cloned())
                .or_else(|| expandable_id(subscription.customer.as_ref())),
            status,
            last_event_at: event.created,
        })]))
    }

    async fn on_invoice_paid(&self, event: &WebhookEvent, store: &dyn BillingStore) -> BillingResult<Dispatch> {
        let invoice: InvoiceObject = event.object_as()?;

        let subscription_id = expandable_id(invoice.subscription.as_ref()).or_else(|| {
            event
                .object
                .pointer("/parent/subscription_details/subscription")
                .and_then(|v| expandable_id(Some(v)))
        });
        let Some(subscription_id) = subscription_id else {
            return Ok(Dispatch::Ignored("invoice is not for a subscription"));
        };
        if invoice.amount_paid == 0 {
            return Ok(Dispatch::Ignored("zero-amount invoice"));
        }
        if invoice.amount_paid < 0 {
            return Err(BillingError::NegativeAmount("gross_cents"));
        }

        let seller_from_payload = [
            "/subscription_details/metadata/seller_id",
            "/parent/subscription_details/metadata/seller_id",
        ]
        .iter()
        .find_map(|p| event.object.pointer(p).and_then(Value::as_str))
        .and_then(|raw| Uuid::parse_str(raw).ok());

        let seller_id = match seller_from_payload {
            Some(seller_id) => seller_id,
            None => store
                .get_subscription(&subscription_id)
                .await?
                .and_then(|mirror| mirror.seller_id)
                .ok_or_else(|| {
                    tracing::warn!(
                        event_id = %event.id,
                        invoice_id = %invoice.id,
                        subscription_id = %subscription_id,
                        customer = ?expandable_id(invoice.customer.as_ref()),
                        "Invoice paid before its subscription is known"
                    );
                    BillingError::OutOfOrder(format!(
                        "no seller known yet for subscription {}",
                        subscription_id
                    ))
                })?,
        };

        let tax = invoice.tax.unwrap_or_else(|| {
            event
                .object
                .get("total_taxes")
                .and_then(Value::as_array)
                .map(|taxes| {
                    taxes
                        .iter()
                        .filter_map(|t| t.get("amount").and_then(Value::as_i64))
                        .sum()
                })
                .unwrap_or(0)
        });

        Ok(Dispatch::Handled(vec![EventEffect::RecordSale(SaleRecord {
            source_ref: invoice.id.clone(),
            seller_id,
            gross_cents: invoice.amount_paid,
            processor_fee_cents: self.processor_fee_for(&event.object, invoice.amount_paid)?,
            tax_cents: tax,
            platform_fee_percent: self
                .platform_fee_percent_at(store, seller_id, event.created)
                .await?,
            currency: invoice.currency.unwrap_or_else(|| "usd".to_string()),
            occurred_at: event.created,
        })]))
    }
}

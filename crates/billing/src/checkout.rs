//! Checkout session factory
//!
//! Turns a purchase intent into a hosted checkout session. Amounts are always
//! resolved here, never taken from the client, and the metadata written onto
//! the session is enough for the webhook handlers to rebuild the intent.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{HostedCheckoutMode, HostedCheckoutProvider, HostedCheckoutRequest, HostedLineItem};
use crate::error::{BillingError, BillingResult};
use crate::intake::deposit_amount_cents;
use crate::orders::{order_total, OrderItem};
use crate::store::BillingStore;
use crate::subscriptions::SubscriptionService;

/// Processor limit on a single metadata value.
pub const METADATA_VALUE_MAX_CHARS: usize = 500;
/// Processor limit on a metadata key.
pub const METADATA_KEY_MAX_CHARS: usize = 40;

pub mod keys {
    pub const PURPOSE_KIND: &str = "purpose_kind";
    pub const SUBJECT_ID: &str = "subject_id";
    pub const AMOUNT_CENTS: &str = "amount_cents";
    pub const CURRENCY: &str = "currency";
    pub const PLAN_ID: &str = "plan_id";
    pub const SELLER_ID: &str = "seller_id";
    pub const BUDGET_TIER: &str = "budget_tier";
    pub const CUSTOMER_REF: &str = "customer_ref";
    pub const ITEMS: &str = "items";

    pub const RESERVED: [&str; 9] = [
        PURPOSE_KIND,
        SUBJECT_ID,
        AMOUNT_CENTS,
        CURRENCY,
        PLAN_ID,
        SELLER_ID,
        BUDGET_TIER,
        CUSTOMER_REF,
        ITEMS,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurposeKind {
    #[serde(alias = "SUBSCRIPTION")]
    Subscription,
    #[serde(alias = "DEPOSIT")]
    Deposit,
    #[serde(alias = "CART")]
    Cart,
}

impl PurposeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurposeKind::Subscription => "subscription",
            PurposeKind::Deposit => "deposit",
            PurposeKind::Cart => "cart",
        }
    }
}

impl fmt::Display for PurposeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurposeKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subscription" => Ok(PurposeKind::Subscription),
            "deposit" => Ok(PurposeKind::Deposit),
            "cart" => Ok(PurposeKind::Cart),
            _ => Err(BillingError::invalid_enum("purpose kind", s)),
        }
    }
}

/// Metadata embedded in every session we create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub purpose_kind: PurposeKind,
    pub subject_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub plan_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
    pub budget_tier: Option<String>,
    pub customer_ref: Option<String>,
    pub items: Option<Vec<OrderItem>>,
    /// Caller-supplied keys; never shadows a reserved key.
    pub extra: BTreeMap<String, String>,
}

impl CheckoutMetadata {
    pub fn new(purpose_kind: PurposeKind, subject_id: Uuid, amount_cents: i64, currency: String) -> Self {
        Self {
            purpose_kind,
            subject_id,
            amount_cents,
            currency,
            plan_id: None,
            seller_id: None,
            budget_tier: None,
            customer_ref: None,
            items: None,
            extra: BTreeMap::new(),
        }
    }

    /// Serialize, enforcing the processor's key and value limits.
    pub fn to_map(&self) -> BillingResult<HashMap<String, String>> {
        let mut map = HashMap::new();
        for (key, value) in &self.extra {
            if keys::RESERVED.contains(&key.as_str()) {
                return Err(BillingError::InvalidInput(format!(
                    "metadata key '{}' is reserved",
                    key
                )));
            }
            if key.is_empty() || key.chars().count() > METADATA_KEY_MAX_CHARS {
                return Err(BillingError::InvalidInput(format!(
                    "metadata key '{}' must be 1..={} characters",
                    key, METADATA_KEY_MAX_CHARS
                )));
            }
            map.insert(key.clone(), value.clone());
        }

        map.insert(keys::PURPOSE_KIND.to_string(), self.purpose_kind.to_string());
        map.insert(keys::SUBJECT_ID.to_string(), self.subject_id.to_string());
        map.insert(keys::AMOUNT_CENTS.to_string(), self.amount_cents.to_string());
        map.insert(keys::CURRENCY.to_string(), self.currency.clone());
        if let Some(plan_id) = self.plan_id {
            map.insert(keys::PLAN_ID.to_string(), plan_id.to_string());
        }
        if let Some(seller_id) = self.seller_id {
            map.insert(keys::SELLER_ID.to_string(), seller_id.to_string());
        }
        if let Some(tier) = &self.budget_tier {
            map.insert(keys::BUDGET_TIER.to_string(), tier.clone());
        }
        if let Some(customer_ref) = &self.customer_ref {
            map.insert(keys::CUSTOMER_REF.to_string(), customer_ref.clone());
        }
        if let Some(items) = &self.items {
            let encoded = serde_json::to_string(items)
                .map_err(|e| BillingError::Internal(format!("encode items: {}", e)))?;
            map.insert(keys::ITEMS.to_string(), encoded);
        }

        if let Some((key, _)) = map
            .iter()
            .find(|(_, value)| value.chars().count() > METADATA_VALUE_MAX_CHARS)
        {
            return Err(BillingError::MetadataTooLong(key.clone()));
        }
        Ok(map)
    }

    /// Rebuild from a webhook payload's metadata.
    pub fn from_map(map: &HashMap<String, String>) -> BillingResult<Self> {
        fn required<'a>(map: &'a HashMap<String, String>, key: &str) -> BillingResult<&'a str> {
            map.get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| BillingError::MalformedEvent(format!("metadata is missing '{}'", key)))
        }
        fn uuid(key: &str, raw: &str) -> BillingResult<Uuid> {
            Uuid::parse_str(raw)
                .map_err(|_| BillingError::MalformedEvent(format!("metadata '{}' is not a UUID", key)))
        }
        fn optional_uuid(map: &HashMap<String, String>, key: &str) -> BillingResult<Option<Uuid>> {
            map.get(key)
                .filter(|v| !v.is_empty())
                .map(|raw| uuid(key, raw))
                .transpose()
        }

        let purpose_kind = required(map, keys::PURPOSE_KIND)?
            .parse::<PurposeKind>()
            .map_err(|e| BillingError::MalformedEvent(e.to_string()))?;
        let subject_id = uuid(keys::SUBJECT_ID, required(map, keys::SUBJECT_ID)?)?;
        let amount_cents = required(map, keys::AMOUNT_CENTS)?
            .parse::<i64>()
            .map_err(|_| BillingError::MalformedEvent("metadata 'amount_cents' is not an integer".to_string()))?;
        let currency = required(map, keys::CURRENCY)?.to_string();

        let items = match map.get(keys::ITEMS) {
            Some(raw) => Some(
                serde_json::from_str::<Vec<OrderItem>>(raw)
                    .map_err(|e| BillingError::MalformedEvent(format!("metadata 'items': {}", e)))?,
            ),
            None => None,
        };

        let extra = map
            .iter()
            .filter(|(key, _)| !keys::RESERVED.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            purpose_kind,
            subject_id,
            amount_cents,
            currency,
            plan_id: optional_uuid(map, keys::PLAN_ID)?,
            seller_id: optional_uuid(map, keys::SELLER_ID)?,
            budget_tier: map.get(keys::BUDGET_TIER).cloned(),
            customer_ref: map.get(keys::CUSTOMER_REF).cloned(),
            items,
            extra,
        })
    }
}

fn default_currency() -> String {
    "usd".to_string()
}

/// Purchase intent as submitted by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutIntent {
    pub purpose_kind: PurposeKind,
    /// Plan id, intake id, or the client's cart id.
    pub subject_id: Uuid,
    /// Ignored; amounts are computed server-side.
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub seller_id: Option<Uuid>,
    #[serde(default)]
    pub customer_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub redirect_url: String,
    pub session_id: String,
}

/// Persisted correlation between a session and its subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionRecord {
    pub session_id: String,
    pub purpose_kind: PurposeKind,
    pub subject_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

fn normalize_currency(raw: &str) -> BillingResult<String> {
    let currency = raw.trim().to_ascii_lowercase();
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_lowercase()) {
        Ok(currency)
    } else {
        Err(BillingError::invalid_enum("currency", raw))
    }
}

struct PreparedCheckout {
    mode: HostedCheckoutMode,
    metadata: CheckoutMetadata,
    line_items: Vec<HostedLineItem>,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn HostedCheckoutProvider>,
    subscriptions: SubscriptionService,
    deposit_percent: u32,
    success_url: String,
    cancel_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn HostedCheckoutProvider>,
        deposit_percent: u32,
        success_url: String,
        cancel_url: String,
    ) -> Self {
        Self {
            subscriptions: SubscriptionService::new(store.clone()),
            store,
            provider,
            deposit_percent,
            success_url,
            cancel_url,
        }
    }

    /// Create a hosted checkout session for `intent`.
    pub async fn create_session(&self, intent: CheckoutIntent) -> BillingResult<CheckoutResponse> {
        let prepared = match intent.purpose_kind {
            PurposeKind::Subscription => self.prepare_subscription(&intent).await?,
            PurposeKind::Deposit => self.prepare_deposit(&intent).await?,
            PurposeKind::Cart => self.prepare_cart(&intent).await?,
        };

        let mut metadata = prepared.metadata;
        metadata.customer_ref = metadata.customer_ref.or_else(|| intent.customer_ref.clone());
        metadata.extra = intent.metadata.clone();
        let metadata_map = metadata.to_map()?;

        let request = HostedCheckoutRequest {
            mode: prepared.mode,
            currency: metadata.currency.clone(),
            line_items: prepared.line_items,
            metadata: metadata_map.clone(),
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
        };
        let session = self.provider.create_session(&request).await?;

        let record = CheckoutSessionRecord {
            session_id: session.session_id.clone(),
            purpose_kind: metadata.purpose_kind,
            subject_id: metadata.subject_id,
            amount_cents: metadata.amount_cents,
            currency: metadata.currency.clone(),
            metadata: metadata_map,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.record_checkout_session(&record).await?;

        tracing::info!(
            session_id = %record.session_id,
            purpose_kind = %record.purpose_kind,
            subject_id = %record.subject_id,
            amount_cents = record.amount_cents,
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            redirect_url: session.redirect_url,
            session_id: session.session_id,
        })
    }

    async fn prepare_subscription(&self, intent: &CheckoutIntent) -> BillingResult<PreparedCheckout> {
        let plan = self.subscriptions.active_plan(intent.subject_id).await?;
        if intent.amount_cents.is_some_and(|amount| amount != plan.price_cents) {
            tracing::warn!(
                plan_id = %plan.id,
                "Ignoring client-supplied amount for subscription checkout"
            );
        }

        let currency = normalize_currency(&plan.currency)?;
        let mut metadata =
            CheckoutMetadata::new(PurposeKind::Subscription, plan.id, plan.price_cents, currency);
        metadata.plan_id = Some(plan.id);
        metadata.seller_id = Some(plan.seller_id);

        Ok(PreparedCheckout {
            mode: HostedCheckoutMode::Subscription,
            line_items: vec![HostedLineItem {
                name: plan.name.clone(),
                unit_amount_cents: plan.price_cents,
                quantity: 1,
                recurring: Some(plan.billing_period.interval()),
            }],
            metadata,
        })
    }

    async fn prepare_deposit(&self, intent: &CheckoutIntent) -> BillingResult<PreparedCheckout> {
        let intake = self
            .store
            .get_intake(intent.subject_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("intake {}", intent.subject_id)))?;
        intake.ensure_deposit_open()?;

        let amount = deposit_amount_cents(&intake.budget_tier, self.deposit_percent);
        let currency = normalize_currency(&intent.currency)?;
        let mut metadata = CheckoutMetadata::new(PurposeKind::Deposit, intake.id, amount, currency);
        metadata.budget_tier = Some(intake.budget_tier.clone());

        Ok(PreparedCheckout {
            mode: HostedCheckoutMode::Payment,
            line_items: vec![HostedLineItem {
                name: format!("Project deposit ({})", intake.budget_tier),
                unit_amount_cents: amount,
                quantity: 1,
                recurring: None,
            }],
            metadata,
        })
    }

    /// Cart prices come from the caller. Only the seller is checked here,
    /// so a sale cannot be credited to a seller the platform never onboarded.
    async fn prepare_cart(&self, intent: &CheckoutIntent) -> BillingResult<PreparedCheckout> {
        let total = order_total(&intent.items)?;
        if let Some(seller_id) = intent.seller_id {
            if !self.store.is_known_seller(seller_id).await? {
                tracing::warn!(
                    seller_id = %seller_id,
                    subject_id = %intent.subject_id,
                    "Cart checkout names an unknown seller"
                );
                return Err(BillingError::NotFound(format!("seller {}", seller_id)));
            }
        }
        let currency = normalize_currency(&intent.currency)?;
        let mut metadata = CheckoutMetadata::new(PurposeKind::Cart, intent.subject_id, total, currency);
        metadata.seller_id = intent.seller_id;
        metadata.items = Some(intent.items.clone());

        let line_items = intent
            .items
            .iter()
            .map(|item| HostedLineItem {
                name: item.sku.clone(),
                unit_amount_cents: item.unit_price_cents,
                quantity: u64::from(item.qty),
                recurring: None,
            })
            .collect();

        Ok(PreparedCheckout {
            mode: HostedCheckoutMode::Payment,
            line_items,
            metadata,
        })
    }
}

//! Seller payout requests
//!
//! Sellers ask to be paid out of their accrued balance; an admin approves,
//! rejects, or marks the request paid. Nothing here moves money.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::revenue::RevenueService;
use crate::store::BillingStore;

macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::invalid_enum($field, other)),
                }
            }
        }
    };
}

string_enum!(PayoutMethod, "payout method", {
    BankTransfer => "bank_transfer",
    Paypal => "paypal",
    StripeConnect => "stripe_connect",
    Check => "check",
});

string_enum!(PayoutCadence, "payout cadence", {
    Weekly => "weekly",
    Biweekly => "biweekly",
    Monthly => "monthly",
    OnDemand => "on_demand",
});

string_enum!(PayoutStatus, "payout status", {
    Requested => "requested",
    Approved => "approved",
    Paid => "paid",
    Rejected => "rejected",
});

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Paid | PayoutStatus::Rejected)
    }

    /// Whether a request in this status still holds part of the balance.
    pub fn commits_balance(&self) -> bool {
        !matches!(self, PayoutStatus::Rejected)
    }
}

/// `requested -> approved -> paid`, `requested|approved -> rejected`.
pub fn validate_payout_transition(from: PayoutStatus, to: PayoutStatus) -> BillingResult<()> {
    use PayoutStatus::*;
    match (from, to) {
        (Requested, Approved) | (Approved, Paid) | (Requested, Rejected) | (Approved, Rejected) => {
            Ok(())
        }
        _ => Err(BillingError::InvalidTransition {
            entity: "payout request",
            from: from.to_string(),
            to: to.to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPreferences {
    pub seller_id: Uuid,
    pub cadence: PayoutCadence,
    pub method: PayoutMethod,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub updated_at: Option<OffsetDateTime>,
}

impl PayoutPreferences {
    pub fn defaults(seller_id: Uuid) -> Self {
        Self {
            seller_id,
            cadence: PayoutCadence::Monthly,
            method: PayoutMethod::BankTransfer,
            updated_at: None,
        }
    }
}

/// Partial preference write; raw strings are validated against the enums.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayoutPreferencesUpdate {
    pub cadence: Option<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub seller_id: Uuid,
    /// `None` means everything accrued at disbursement time.
    pub amount_cents: Option<i64>,
    pub method: PayoutMethod,
    pub cadence: PayoutCadence,
    pub status: PayoutStatus,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPayoutRequest {
    pub amount_cents: Option<i64>,
    pub method: Option<String>,
    pub cadence: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminPayoutUpdate {
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutBalance {
    pub accrued_cents: i64,
    pub committed_cents: i64,
    pub available_cents: i64,
}

#[derive(Clone)]
pub struct PayoutService {
    store: Arc<dyn BillingStore>,
    revenue: RevenueService,
}

impl PayoutService {
    pub fn new(store: Arc<dyn BillingStore>, revenue: RevenueService) -> Self {
        Self { store, revenue }
    }

    pub async fn preferences(&self, seller_id: Uuid) -> BillingResult<PayoutPreferences> {
        Ok(self
            .store
            .get_payout_preferences(seller_id)
            .await?
            .unwrap_or_else(|| PayoutPreferences::defaults(seller_id)))
    }

    pub async fn update_preferences(
        &self,
        seller_id: Uuid,
        update: PayoutPreferencesUpdate,
    ) -> BillingResult<PayoutPreferences> {
        let mut prefs = self.preferences(seller_id).await?;
        if let Some(cadence) = update.cadence.as_deref() {
            prefs.cadence = cadence.parse()?;
        }
        if let Some(method) = update.method.as_deref() {
            prefs.method = method.parse()?;
        }
        prefs.updated_at = Some(OffsetDateTime::now_utc());
        self.store.upsert_payout_preferences(&prefs).await?;

        tracing::info!(
            seller_id = %seller_id,
            cadence = %prefs.cadence,
            method = %prefs.method,
            "Payout preferences updated"
        );
        Ok(prefs)
    }

    pub async fn balance(&self, seller_id: Uuid, now: OffsetDateTime) -> BillingResult<PayoutBalance> {
        let statement = self.revenue.seller_statement(seller_id, now).await?;
        let committed: i64 = self
            .store
            .list_payout_requests(seller_id)
            .await?
            .iter()
            .filter(|r| r.status.commits_balance())
            .filter_map(|r| r.amount_cents)
            .sum();
        Ok(PayoutBalance {
            accrued_cents: statement.seller_payout_cents,
            committed_cents: committed,
            available_cents: statement.seller_payout_cents - committed,
        })
    }

    pub async fn create_request(&self, seller_id: Uuid, new: NewPayoutRequest) -> BillingResult<PayoutRequest> {
        let prefs = self.preferences(seller_id).await?;
        let method = match new.method.as_deref() {
            Some(raw) => raw.parse()?,
            None => prefs.method,
        };
        let cadence = match new.cadence.as_deref() {
            Some(raw) => raw.parse()?,
            None => prefs.cadence,
        };

        let now = OffsetDateTime::now_utc();
        if let Some(amount) = new.amount_cents {
            if amount < 0 {
                return Err(BillingError::NegativeAmount("amount_cents"));
            }
            let balance = self.balance(seller_id, now).await?;
            if amount > balance.available_cents {
                return Err(BillingError::InsufficientBalance {
                    requested_cents: amount,
                    available_cents: balance.available_cents,
                });
            }
        }

        let request = PayoutRequest {
            id: Uuid::new_v4(),
            seller_id,
            amount_cents: new.amount_cents,
            method,
            cadence,
            status: PayoutStatus::Requested,
            notes: new.notes,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_payout_request(&request).await?;

        tracing::info!(
            request_id = %request.id,
            seller_id = %seller_id,
            amount_cents = ?request.amount_cents,
            method = %method,
            "Payout requested"
        );
        Ok(request)
    }

    pub async fn list_requests(&self, seller_id: Uuid) -> BillingResult<Vec<PayoutRequest>> {
        self.store.list_payout_requests(seller_id).await
    }

    /// Admin status change and/or note edit.
    pub async fn admin_update(&self, request_id: Uuid, update: AdminPayoutUpdate) -> BillingResult<PayoutRequest> {
        let mut request = self
            .store
            .get_payout_request(request_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payout request {}", request_id)))?;

        let expected = request.status;
        if let Some(raw) = update.status.as_deref() {
            let target: PayoutStatus = raw.parse()?;
            if target != request.status {
                validate_payout_transition(request.status, target)?;
                request.status = target;
            }
        }
        if update.notes.is_some() {
            request.notes = update.notes;
        }
        request.updated_at = OffsetDateTime::now_utc();

        if !self.store.update_payout_request(&request, expected).await? {
            return Err(BillingError::Conflict(format!(
                "payout request {} is no longer '{}'",
                request_id, expected
            )));
        }

        tracing::info!(
            request_id = %request_id,
            from = %expected,
            to = %request.status,
            "Payout request updated by admin"
        );
        Ok(request)
    }
}

//! Plans and the local subscription mirror
//!
//! Subscription state is owned by the processor. We only ever mirror what
//! webhooks tell us, and an older event never overwrites a newer one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::RecurringInterval;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Weekly,
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Weekly => "weekly",
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
        }
    }

    pub fn interval(&self) -> RecurringInterval {
        match self {
            BillingPeriod::Weekly => RecurringInterval::Week,
            BillingPeriod::Monthly => RecurringInterval::Month,
            BillingPeriod::Yearly => RecurringInterval::Year,
        }
    }
}

impl FromStr for BillingPeriod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(BillingPeriod::Weekly),
            "monthly" => Ok(BillingPeriod::Monthly),
            "yearly" => Ok(BillingPeriod::Yearly),
            other => Err(BillingError::invalid_enum("billing period", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub active: bool,
}

/// Processor-side subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// The processor never moves a subscription out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            "paused" => SubscriptionStatus::Paused,
            other => return Err(BillingError::invalid_enum("subscription status", other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMirror {
    pub external_subscription_id: String,
    pub plan_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
    pub customer_ref: Option<String>,
    pub status: SubscriptionStatus,
    /// Creation time of the newest event applied to this row.
    #[serde(with = "time::serde::rfc3339")]
    pub last_event_at: OffsetDateTime,
}

impl SubscriptionMirror {
    /// Merge an incoming snapshot into the stored row.
    ///
    /// Returns `None` when the incoming event is older than what we hold, or
    /// would move a terminal status anywhere else. Event times have one-second
    /// resolution, so a late `updated` can share its second with `deleted`.
    /// Fields the incoming event does not know keep their stored value.
    pub fn merged(existing: Option<&SubscriptionMirror>, incoming: &SubscriptionMirror) -> Option<SubscriptionMirror> {
        match existing {
            None => Some(incoming.clone()),
            Some(current) if incoming.last_event_at < current.last_event_at => None,
            Some(current) if current.status.is_terminal() && incoming.status != current.status => None,
            Some(current) => Some(SubscriptionMirror {
                external_subscription_id: current.external_subscription_id.clone(),
                plan_id: incoming.plan_id.or(current.plan_id),
                seller_id: incoming.seller_id.or(current.seller_id),
                customer_ref: incoming
                    .customer_ref
                    .clone()
                    .or_else(|| current.customer_ref.clone()),
                status: incoming.status,
                last_event_at: incoming.last_event_at,
            }),
        }
    }
}

/// Plan lookups and mirror reads.
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Resolve a plan that can be sold right now.
    pub async fn active_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        match self.store.get_plan(plan_id).await? {
            Some(plan) if plan.active => Ok(plan),
            Some(_) => {
                tracing::warn!(plan_id = %plan_id, "Checkout requested for inactive plan");
                Err(BillingError::PlanNotFound(plan_id.to_string()))
            }
            None => Err(BillingError::PlanNotFound(plan_id.to_string())),
        }
    }

    pub async fn save_plan(&self, plan: &Plan) -> BillingResult<()> {
        if plan.price_cents < 0 {
            return Err(BillingError::NegativeAmount("price_cents"));
        }
        self.store.upsert_plan(plan).await
    }

    pub async fn mirror(&self, external_subscription_id: &str) -> BillingResult<Option<SubscriptionMirror>> {
        self.store.get_subscription(external_subscription_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn mirror(status: SubscriptionStatus, at: OffsetDateTime) -> SubscriptionMirror {
        SubscriptionMirror {
            external_subscription_id: "sub_1".to_string(),
            plan_id: None,
            seller_id: None,
            customer_ref: None,
            status,
            last_event_at: at,
        }
    }

    #[test]
    fn test_older_event_does_not_overwrite() {
        let now = OffsetDateTime::now_utc();
        let stored = mirror(SubscriptionStatus::Canceled, now);
        let stale = mirror(SubscriptionStatus::Active, now - time::Duration::minutes(5));
        assert!(SubscriptionMirror::merged(Some(&stored), &stale).is_none());
    }

    #[test]
    fn test_same_second_update_does_not_reopen_canceled() {
        let at = OffsetDateTime::now_utc();
        let stored = mirror(SubscriptionStatus::Canceled, at);
        let late_update = mirror(SubscriptionStatus::Active, at);
        assert!(SubscriptionMirror::merged(Some(&stored), &late_update).is_none());

        let later_update = mirror(SubscriptionStatus::Active, at + time::Duration::minutes(1));
        assert!(SubscriptionMirror::merged(Some(&stored), &later_update).is_none());

        let expired = mirror(SubscriptionStatus::IncompleteExpired, at);
        let retry = mirror(SubscriptionStatus::Incomplete, at);
        assert!(SubscriptionMirror::merged(Some(&expired), &retry).is_none());
    }

    #[test]
    fn test_same_second_non_terminal_update_applies() {
        let at = OffsetDateTime::now_utc();
        let stored = mirror(SubscriptionStatus::Active, at);
        let canceled = mirror(SubscriptionStatus::Canceled, at);
        let merged = SubscriptionMirror::merged(Some(&stored), &canceled).unwrap();
        assert_eq!(merged.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn test_newer_event_keeps_known_fields() {
        let now = OffsetDateTime::now_utc();
        let seller = Uuid::new_v4();
        let mut stored = mirror(SubscriptionStatus::Active, now);
        stored.seller_id = Some(seller);
        let newer = mirror(SubscriptionStatus::PastDue, now + time::Duration::minutes(1));

        let merged = SubscriptionMirror::merged(Some(&stored), &newer).unwrap();
        assert_eq!(merged.status, SubscriptionStatus::PastDue);
        assert_eq!(merged.seller_id, Some(seller));
    }

    #[test]
    fn test_status_parse_covers_processor_values() {
        for raw in [
            "incomplete",
            "incomplete_expired",
            "trialing",
            "active",
            "past_due",
            "canceled",
            "unpaid",
            "paused",
        ] {
            let status: SubscriptionStatus = raw.parse().unwrap();
            assert_eq!(status.as_str(), raw);
        }
        assert!("cancelled".parse::<SubscriptionStatus>().is_err());
    }

    #[tokio::test]
    async fn test_inactive_plan_is_not_sellable() {
        let store = Arc::new(MemoryStore::new());
        let service = SubscriptionService::new(store);
        let plan = Plan {
            id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            name: "Backstage".to_string(),
            price_cents: 900,
            currency: "usd".to_string(),
            billing_period: BillingPeriod::Monthly,
            active: false,
        };
        service.save_plan(&plan).await.unwrap();

        assert!(matches!(
            service.active_plan(plan.id).await,
            Err(BillingError::PlanNotFound(_))
        ));
        assert!(matches!(
            service.active_plan(Uuid::new_v4()).await,
            Err(BillingError::PlanNotFound(_))
        ));
    }
}

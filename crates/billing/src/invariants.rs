//! Billing Invariants Module
//!
//! Read-only consistency checks an operator runs after an incident or a
//! webhook replay. Every check works on one [`AuditSnapshot`] so a run sees a
//! single view of the store.
//!
//! ## Checks
//!
//! 1. **order_total_matches_items**: stored total equals the item sum
//! 2. **order_history_matches_status**: history exists and ends in the current status
//! 3. **deposit_latch_consistency**: a paid deposit moved its intake to in-progress
//! 4. **payout_over_commitment**: committed payouts never exceed accrued revenue
//! 5. **revenue_identity**: platform fee plus seller payout equals net receipts

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::intake::IntakeStatus;
use crate::orders::order_total;
use crate::store::{AuditSnapshot, BillingStore};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Orders, intakes or sellers affected
    pub subject_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const ORDER_TOTAL: &str = "order_total_matches_items";
const ORDER_HISTORY: &str = "order_history_matches_status";
const DEPOSIT_LATCH: &str = "deposit_latch_consistency";
const PAYOUT_COMMITMENT: &str = "payout_over_commitment";
const REVENUE_IDENTITY: &str = "revenue_identity";

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let snapshot = self.store.audit_snapshot().await?;

        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(Self::evaluate(name, &snapshot));
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        if violations.is_empty() {
            tracing::info!(checks_run = checks_run, "All billing invariants hold");
        } else {
            tracing::warn!(
                checks_failed = checks_failed,
                violations = violations.len(),
                "Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        if !Self::available_checks().contains(&name) {
            return Ok(vec![]);
        }
        let snapshot = self.store.audit_snapshot().await?;
        Ok(Self::evaluate(name, &snapshot))
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            ORDER_TOTAL,
            ORDER_HISTORY,
            DEPOSIT_LATCH,
            PAYOUT_COMMITMENT,
            REVENUE_IDENTITY,
        ]
    }

    fn evaluate(name: &str, snapshot: &AuditSnapshot) -> Vec<InvariantViolation> {
        match name {
            ORDER_TOTAL => check_order_totals(snapshot),
            ORDER_HISTORY => check_order_history(snapshot),
            DEPOSIT_LATCH => check_deposit_latch(snapshot),
            PAYOUT_COMMITMENT => check_payout_commitment(snapshot),
            REVENUE_IDENTITY => check_revenue_identity(snapshot),
            _ => vec![],
        }
    }
}

/// Invariant 1: stored order total equals Σ qty × unit price.
fn check_order_totals(snapshot: &AuditSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .orders
        .iter()
        .filter_map(|(order, _)| {
            let recomputed = order_total(&order.items);
            match &recomputed {
                Ok(total) if *total == order.total_cents => None,
                _ => Some(InvariantViolation {
                    invariant: ORDER_TOTAL.to_string(),
                    subject_ids: vec![order.id],
                    description: format!(
                        "Order {} stores total {} but its items do not add up to it",
                        order.id, order.total_cents
                    ),
                    context: serde_json::json!({
                        "stored_total_cents": order.total_cents,
                        "recomputed_total_cents": recomputed.as_ref().ok(),
                        "recompute_error": recomputed.as_ref().err().map(|e| e.to_string()),
                    }),
                    severity: ViolationSeverity::Critical,
                }),
            }
        })
        .collect()
}

/// Invariant 2: every order has history and the last entry is its status.
fn check_order_history(snapshot: &AuditSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .orders
        .iter()
        .filter_map(|(order, history)| {
            let last = history.last().map(|entry| entry.status);
            if last == Some(order.status) {
                return None;
            }
            Some(InvariantViolation {
                invariant: ORDER_HISTORY.to_string(),
                subject_ids: vec![order.id],
                description: match last {
                    Some(status) => format!(
                        "Order {} is '{}' but its last history entry is '{}'",
                        order.id, order.status, status
                    ),
                    None => format!("Order {} has no status history", order.id),
                },
                context: serde_json::json!({
                    "status": order.status.as_str(),
                    "history_len": history.len(),
                }),
                severity: ViolationSeverity::High,
            })
        })
        .collect()
}

/// Invariant 3: a latched deposit moved its intake forward and names a session.
fn check_deposit_latch(snapshot: &AuditSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .intakes
        .iter()
        .filter(|intake| intake.deposit_paid)
        .filter_map(|intake| {
            let wrong_status = intake.status != IntakeStatus::InProgress;
            let missing_session = intake.external_session_id.is_none();
            if !wrong_status && !missing_session {
                return None;
            }
            Some(InvariantViolation {
                invariant: DEPOSIT_LATCH.to_string(),
                subject_ids: vec![intake.id],
                description: if wrong_status {
                    format!(
                        "Intake {} has a paid deposit but status '{}'",
                        intake.id, intake.status
                    )
                } else {
                    format!("Intake {} has a paid deposit but no checkout session", intake.id)
                },
                context: serde_json::json!({
                    "status": intake.status.as_str(),
                    "external_session_id": intake.external_session_id,
                    "deposit_amount_cents": intake.deposit_amount_cents,
                }),
                severity: if wrong_status {
                    ViolationSeverity::High
                } else {
                    ViolationSeverity::Medium
                },
            })
        })
        .collect()
}

/// Invariant 4: approved and paid requests fit inside accrued seller payout.
fn check_payout_commitment(snapshot: &AuditSnapshot) -> Vec<InvariantViolation> {
    let mut committed: HashMap<Uuid, i64> = HashMap::new();
    for request in &snapshot.payout_requests {
        if request.status.commits_balance() {
            *committed.entry(request.seller_id).or_default() += request.amount_cents.unwrap_or(0);
        }
    }

    let mut violations: Vec<InvariantViolation> = committed
        .into_iter()
        .filter_map(|(seller_id, committed_cents)| {
            let accrued_cents: i64 = snapshot
                .sales
                .iter()
                .filter(|sale| sale.seller_id == seller_id)
                .filter_map(|sale| sale.breakdown().ok())
                .map(|b| b.seller_payout_cents)
                .sum();
            if committed_cents <= accrued_cents {
                return None;
            }
            Some(InvariantViolation {
                invariant: PAYOUT_COMMITMENT.to_string(),
                subject_ids: vec![seller_id],
                description: format!(
                    "Seller {} has {} cents committed against {} cents accrued",
                    seller_id, committed_cents, accrued_cents
                ),
                context: serde_json::json!({
                    "committed_cents": committed_cents,
                    "accrued_cents": accrued_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
        })
        .collect();
    violations.sort_by_key(|v| v.subject_ids.first().copied());
    violations
}

/// Invariant 5: each recorded sale splits into non-negative parts that sum
/// to its net receipts.
fn check_revenue_identity(snapshot: &AuditSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .sales
        .iter()
        .filter_map(|sale| {
            let problem = match sale.breakdown() {
                Err(e) => Some(e.to_string()),
                Ok(b) => {
                    let net = (sale.gross_cents - sale.processor_fee_cents - sale.tax_cents).max(0);
                    if b.net_receipts_cents() != net || b.platform_fee_cents < 0 || b.seller_payout_cents < 0 {
                        Some(format!(
                            "split {} + {} does not equal net {}",
                            b.platform_fee_cents, b.seller_payout_cents, net
                        ))
                    } else {
                        None
                    }
                }
            }?;
            Some(InvariantViolation {
                invariant: REVENUE_IDENTITY.to_string(),
                subject_ids: vec![sale.seller_id],
                description: format!("Sale {}: {}", sale.source_ref, problem),
                context: serde_json::json!({
                    "source_ref": sale.source_ref,
                    "gross_cents": sale.gross_cents,
                    "processor_fee_cents": sale.processor_fee_cents,
                    "tax_cents": sale.tax_cents,
                    "platform_fee_percent": sale.platform_fee_percent,
                }),
                severity: ViolationSeverity::Critical,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::Intake;
    use crate::orders::{Order, OrderItem, OrderStatus};
    use crate::payouts::{PayoutCadence, PayoutMethod, PayoutRequest, PayoutStatus};
    use crate::revenue::SaleRecord;
    use crate::store::MemoryStore;

    fn sale(seller_id: Uuid, source_ref: &str, gross: i64) -> SaleRecord {
        SaleRecord {
            source_ref: source_ref.to_string(),
            seller_id,
            gross_cents: gross,
            processor_fee_cents: 0,
            tax_cents: 0,
            platform_fee_percent: 15,
            currency: "usd".to_string(),
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    fn payout(seller_id: Uuid, amount: i64, status: PayoutStatus) -> PayoutRequest {
        let now = OffsetDateTime::now_utc();
        PayoutRequest {
            id: Uuid::new_v4(),
            seller_id,
            amount_cents: Some(amount),
            method: PayoutMethod::BankTransfer,
            cadence: PayoutCadence::Monthly,
            status,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"order_total_matches_items"));
        assert!(checks.contains(&"payout_over_commitment"));
    }

    #[test]
    fn test_tampered_order_total_flagged() {
        let items = vec![OrderItem {
            sku: "latte".to_string(),
            qty: 2,
            unit_price_cents: 450,
        }];
        let (mut order, opening) =
            Order::new_pending(items, "usd".to_string(), None, None, None, None, OffsetDateTime::now_utc())
                .unwrap();
        order.total_cents = 1;
        let snapshot = AuditSnapshot {
            orders: vec![(order, vec![opening])],
            ..Default::default()
        };
        let violations = check_order_totals(&snapshot);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
        assert!(check_order_history(&snapshot).is_empty());
    }

    #[test]
    fn test_history_must_end_in_current_status() {
        let items = vec![OrderItem {
            sku: "bagel".to_string(),
            qty: 1,
            unit_price_cents: 300,
        }];
        let (mut order, opening) =
            Order::new_pending(items, "usd".to_string(), None, None, None, None, OffsetDateTime::now_utc())
                .unwrap();
        order.status = OrderStatus::Ready;
        let snapshot = AuditSnapshot {
            orders: vec![(order.clone(), vec![opening]), (order, vec![])],
            ..Default::default()
        };
        let violations = check_order_history(&snapshot);
        assert_eq!(violations.len(), 2);
        assert!(violations[1].description.contains("no status history"));
    }

    #[test]
    fn test_paid_deposit_must_be_in_progress() {
        let mut intake = Intake::new("10k-25k", OffsetDateTime::now_utc());
        intake.deposit_paid = true;
        intake.external_session_id = Some("cs_1".to_string());
        let snapshot = AuditSnapshot {
            intakes: vec![intake.clone()],
            ..Default::default()
        };
        assert_eq!(check_deposit_latch(&snapshot).len(), 1);

        intake.status = IntakeStatus::InProgress;
        let snapshot = AuditSnapshot {
            intakes: vec![intake],
            ..Default::default()
        };
        assert!(check_deposit_latch(&snapshot).is_empty());
    }

    #[test]
    fn test_over_commitment_flagged_only_for_committed_requests() {
        let seller = Uuid::new_v4();
        // 10_000 at 15% leaves 8_500 for the seller.
        let mut snapshot = AuditSnapshot {
            sales: vec![sale(seller, "in_1", 10_000)],
            payout_requests: vec![
                payout(seller, 8_000, PayoutStatus::Approved),
                payout(seller, 5_000, PayoutStatus::Rejected),
            ],
            ..Default::default()
        };
        assert!(check_payout_commitment(&snapshot).is_empty());

        snapshot.payout_requests.push(payout(seller, 1_000, PayoutStatus::Paid));
        let violations = check_payout_commitment(&snapshot);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].context["accrued_cents"], 8_500);
        assert_eq!(violations[0].context["committed_cents"], 9_000);
    }

    #[test]
    fn test_accrual_uses_rate_stamped_on_each_sale() {
        let seller = Uuid::new_v4();
        let mut promo_sale = sale(seller, "in_promo", 10_000);
        promo_sale.processor_fee_cents = 320;
        promo_sale.platform_fee_percent = 13;
        // 9_680 at 13% leaves 8_422; at 15% it would only be 8_228.
        let snapshot = AuditSnapshot {
            sales: vec![promo_sale],
            payout_requests: vec![payout(seller, 8_422, PayoutStatus::Approved)],
            ..Default::default()
        };
        assert!(check_payout_commitment(&snapshot).is_empty());
    }

    #[test]
    fn test_negative_sale_breaks_revenue_identity() {
        let seller = Uuid::new_v4();
        let mut bad = sale(seller, "in_bad", 1_000);
        bad.processor_fee_cents = -5;
        let snapshot = AuditSnapshot {
            sales: vec![sale(seller, "in_ok", 9_999), bad],
            ..Default::default()
        };
        let violations = check_revenue_identity(&snapshot);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.contains("in_bad"));
    }

    #[tokio::test]
    async fn test_clean_store_is_healthy() {
        let store = Arc::new(MemoryStore::new());
        store.seed_sale(sale(Uuid::new_v4(), "in_1", 5_000)).await;
        let checker = InvariantChecker::new(store);

        let summary = checker.run_all_checks().await.unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_run, 5);
        assert_eq!(summary.checks_passed, 5);
        assert!(checker.run_check("no_such_check").await.unwrap().is_empty());
    }
}

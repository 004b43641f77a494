//! Revenue split calculation
//!
//! The split itself is pure integer arithmetic. The platform fee is always
//! floored so the seller never loses a fractional cent to rounding.
//! [`RevenueService`] layers seller fee settings and statements on top.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Fee percentage band and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub min_percent: u32,
    pub max_percent: u32,
    pub standard_percent: u32,
    pub promo_percent: u32,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            min_percent: 5,
            max_percent: 30,
            standard_percent: 15,
            promo_percent: 13,
        }
    }
}

impl FeePolicy {
    /// Reject bands that cannot hold their own defaults.
    pub fn validate(&self) -> BillingResult<()> {
        if self.min_percent > self.max_percent || self.max_percent > 100 {
            return Err(BillingError::Config(format!(
                "fee band [{}, {}] is not a valid percentage range",
                self.min_percent, self.max_percent
            )));
        }
        for (name, pct) in [
            ("standard", self.standard_percent),
            ("promo", self.promo_percent),
        ] {
            if pct < self.min_percent || pct > self.max_percent {
                return Err(BillingError::Config(format!(
                    "{} fee {}% lies outside the band [{}, {}]",
                    name, pct, self.min_percent, self.max_percent
                )));
            }
        }
        Ok(())
    }

    pub fn clamp(&self, percent: u32) -> u32 {
        percent.clamp(self.min_percent, self.max_percent)
    }
}

/// Per-seller fee configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerFeeSettings {
    pub seller_id: Uuid,
    /// Explicit percentage; clamped into the band like every other source.
    pub fee_percent_override: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub promo_ends_at: Option<OffsetDateTime>,
}

impl SellerFeeSettings {
    pub fn standard(seller_id: Uuid) -> Self {
        Self {
            seller_id,
            ..Default::default()
        }
    }
}

/// Percentage that applies to a seller at `now`.
///
/// The promotional rate holds strictly before `promo_ends_at`; at or after it
/// the standard rate applies again. Never cache the result.
pub fn effective_platform_fee_percent(
    policy: &FeePolicy,
    settings: &SellerFeeSettings,
    now: OffsetDateTime,
) -> u32 {
    if let Some(explicit) = settings.fee_percent_override {
        return policy.clamp(explicit);
    }
    match settings.promo_ends_at {
        Some(ends_at) if now < ends_at => policy.clamp(policy.promo_percent),
        _ => policy.clamp(policy.standard_percent),
    }
}

/// Reproducible split of one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueBreakdown {
    pub gross_cents: i64,
    pub processor_fees_cents: i64,
    pub taxes_cents: i64,
    pub platform_fee_percent: u32,
    pub platform_fee_cents: i64,
    pub seller_payout_cents: i64,
}

impl RevenueBreakdown {
    pub fn net_receipts_cents(&self) -> i64 {
        self.platform_fee_cents + self.seller_payout_cents
    }
}

/// Split `gross` between platform and seller.
///
/// `percent` is applied as given; callers pass the output of
/// [`effective_platform_fee_percent`] which is already clamped.
pub fn compute_breakdown(
    gross_cents: i64,
    processor_fees_cents: i64,
    taxes_cents: Option<i64>,
    percent: u32,
) -> BillingResult<RevenueBreakdown> {
    let taxes_cents = taxes_cents.unwrap_or(0);
    if gross_cents < 0 {
        return Err(BillingError::NegativeAmount("gross_cents"));
    }
    if processor_fees_cents < 0 {
        return Err(BillingError::NegativeAmount("processor_fees_cents"));
    }
    if taxes_cents < 0 {
        return Err(BillingError::NegativeAmount("taxes_cents"));
    }
    if percent > 100 {
        return Err(BillingError::InvalidInput(format!(
            "fee percentage {} exceeds 100",
            percent
        )));
    }

    let net_receipts = gross_cents
        .saturating_sub(processor_fees_cents)
        .saturating_sub(taxes_cents)
        .max(0);

    // i128 keeps net * pct exact for any i64 net.
    let platform_fee_cents = (i128::from(net_receipts) * i128::from(percent) / 100) as i64;
    let seller_payout_cents = net_receipts - platform_fee_cents;

    Ok(RevenueBreakdown {
        gross_cents,
        processor_fees_cents,
        taxes_cents,
        platform_fee_percent: percent,
        platform_fee_cents,
        seller_payout_cents,
    })
}

/// Processor fee estimate used when the event carries no settled fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorFeeEstimate {
    pub basis_points: i64,
    pub fixed_cents: i64,
}

impl Default for ProcessorFeeEstimate {
    fn default() -> Self {
        Self {
            basis_points: 290,
            fixed_cents: 30,
        }
    }
}

impl ProcessorFeeEstimate {
    pub fn estimate(&self, gross_cents: i64) -> i64 {
        if gross_cents <= 0 {
            return 0;
        }
        let variable = i128::from(gross_cents) * i128::from(self.basis_points) / 10_000;
        (variable as i64 + self.fixed_cents).min(gross_cents)
    }
}

/// Persisted inputs of one sale; the breakdown is recomputed on demand.
///
/// `platform_fee_percent` is resolved once, when the payment settles, so a
/// promo ending or an override changing later never reprices the sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SaleRecord {
    /// Checkout session or invoice id.
    pub source_ref: String,
    pub seller_id: Uuid,
    pub gross_cents: i64,
    pub processor_fee_cents: i64,
    pub tax_cents: i64,
    #[sqlx(try_from = "i32")]
    pub platform_fee_percent: u32,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl SaleRecord {
    pub fn breakdown(&self) -> BillingResult<RevenueBreakdown> {
        compute_breakdown(
            self.gross_cents,
            self.processor_fee_cents,
            Some(self.tax_cents),
            self.platform_fee_percent,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementLine {
    pub source_ref: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub breakdown: RevenueBreakdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerStatement {
    pub seller_id: Uuid,
    pub platform_fee_percent: u32,
    pub lines: Vec<StatementLine>,
    pub gross_cents: i64,
    pub platform_fee_cents: i64,
    pub seller_payout_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

/// Fee settings and statements backed by the store.
#[derive(Clone)]
pub struct RevenueService {
    store: Arc<dyn BillingStore>,
    policy: FeePolicy,
}

impl RevenueService {
    pub fn new(store: Arc<dyn BillingStore>, policy: FeePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    pub async fn fee_settings(&self, seller_id: Uuid) -> BillingResult<SellerFeeSettings> {
        Ok(self
            .store
            .get_fee_settings(seller_id)
            .await?
            .unwrap_or_else(|| SellerFeeSettings::standard(seller_id)))
    }

    pub async fn set_fee_settings(&self, settings: SellerFeeSettings) -> BillingResult<SellerFeeSettings> {
        if let Some(pct) = settings.fee_percent_override {
            if pct > 100 {
                return Err(BillingError::InvalidInput(format!(
                    "fee override {} exceeds 100",
                    pct
                )));
            }
            if self.policy.clamp(pct) != pct {
                tracing::warn!(
                    seller_id = %settings.seller_id,
                    requested = pct,
                    min = self.policy.min_percent,
                    max = self.policy.max_percent,
                    "Fee override outside band will be clamped"
                );
            }
        }
        self.store.upsert_fee_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn effective_percent(&self, seller_id: Uuid, now: OffsetDateTime) -> BillingResult<u32> {
        let settings = self.fee_settings(seller_id).await?;
        Ok(effective_platform_fee_percent(&self.policy, &settings, now))
    }

    /// Recompute every sale with the percentage stamped on it at settlement.
    ///
    /// The statement's own `platform_fee_percent` is the rate for sales
    /// settling at `now`; each line carries the rate it was charged.
    pub async fn seller_statement(&self, seller_id: Uuid, now: OffsetDateTime) -> BillingResult<SellerStatement> {
        let percent = self.effective_percent(seller_id, now).await?;
        let sales = self.store.list_sales(seller_id).await?;

        let mut lines = Vec::with_capacity(sales.len());
        let (mut gross, mut platform, mut payout) = (0_i64, 0_i64, 0_i64);
        for sale in sales {
            let breakdown = sale.breakdown()?;
            gross += breakdown.gross_cents;
            platform += breakdown.platform_fee_cents;
            payout += breakdown.seller_payout_cents;
            lines.push(StatementLine {
                source_ref: sale.source_ref,
                occurred_at: sale.occurred_at,
                breakdown,
            });
        }

        Ok(SellerStatement {
            seller_id,
            platform_fee_percent: percent,
            lines,
            gross_cents: gross,
            platform_fee_cents: platform,
            seller_payout_cents: payout,
            computed_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_reference_split() {
        let b = compute_breakdown(10_000, 320, Some(0), 15).unwrap();
        assert_eq!(b.net_receipts_cents(), 9_680);
        assert_eq!(b.platform_fee_cents, 1_452);
        assert_eq!(b.seller_payout_cents, 8_228);
    }

    #[test]
    fn test_platform_fee_floors() {
        // 999 * 15 / 100 = 149.85
        let b = compute_breakdown(999, 0, None, 15).unwrap();
        assert_eq!(b.platform_fee_cents, 149);
        assert_eq!(b.seller_payout_cents, 850);
    }

    #[test]
    fn test_fees_exceeding_gross_clamp_to_zero() {
        let b = compute_breakdown(100, 80, Some(50), 15).unwrap();
        assert_eq!(b.platform_fee_cents, 0);
        assert_eq!(b.seller_payout_cents, 0);
    }

    #[test]
    fn test_identity_holds_across_inputs() {
        let grosses = [0_i64, 1, 99, 100, 101, 9_999, 10_000, 123_457, 5_000_000];
        let fees = [0_i64, 1, 30, 320, 10_000];
        let taxes = [0_i64, 7, 800, 1_000_000];
        for gross in grosses {
            for fee in fees {
                for tax in taxes {
                    for pct in [0, 5, 13, 15, 30, 100] {
                        let b = compute_breakdown(gross, fee, Some(tax), pct).unwrap();
                        assert_eq!(
                            b.seller_payout_cents + b.platform_fee_cents,
                            (gross - fee - tax).max(0)
                        );
                        assert!(b.platform_fee_cents >= 0);
                        assert!(b.seller_payout_cents >= 0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_negative_inputs_rejected() {
        assert!(matches!(
            compute_breakdown(-1, 0, None, 15),
            Err(BillingError::NegativeAmount("gross_cents"))
        ));
        assert!(matches!(
            compute_breakdown(100, -1, None, 15),
            Err(BillingError::NegativeAmount("processor_fees_cents"))
        ));
        assert!(matches!(
            compute_breakdown(100, 0, Some(-5), 15),
            Err(BillingError::NegativeAmount("taxes_cents"))
        ));
    }

    #[test]
    fn test_promo_applies_strictly_before_end() {
        let policy = FeePolicy::default();
        let ends = datetime!(2026-03-01 00:00 UTC);
        let settings = SellerFeeSettings {
            seller_id: Uuid::new_v4(),
            fee_percent_override: None,
            promo_ends_at: Some(ends),
        };

        let before = ends - time::Duration::seconds(1);
        assert_eq!(effective_platform_fee_percent(&policy, &settings, before), 13);
        assert_eq!(effective_platform_fee_percent(&policy, &settings, ends), 15);
        let after = ends + time::Duration::days(30);
        assert_eq!(effective_platform_fee_percent(&policy, &settings, after), 15);
    }

    #[test]
    fn test_override_is_clamped_into_band() {
        let policy = FeePolicy::default();
        let now = datetime!(2026-01-01 00:00 UTC);
        let mut settings = SellerFeeSettings::standard(Uuid::new_v4());

        settings.fee_percent_override = Some(2);
        assert_eq!(effective_platform_fee_percent(&policy, &settings, now), 5);
        settings.fee_percent_override = Some(45);
        assert_eq!(effective_platform_fee_percent(&policy, &settings, now), 30);
        settings.fee_percent_override = Some(20);
        assert_eq!(effective_platform_fee_percent(&policy, &settings, now), 20);
    }

    #[test]
    fn test_override_wins_over_active_promo() {
        let policy = FeePolicy::default();
        let now = datetime!(2026-01-01 00:00 UTC);
        let settings = SellerFeeSettings {
            seller_id: Uuid::new_v4(),
            fee_percent_override: Some(10),
            promo_ends_at: Some(now + time::Duration::days(1)),
        };
        assert_eq!(effective_platform_fee_percent(&policy, &settings, now), 10);
    }

    #[test]
    fn test_policy_validation() {
        assert!(FeePolicy::default().validate().is_ok());
        let inverted = FeePolicy {
            min_percent: 30,
            max_percent: 5,
            ..FeePolicy::default()
        };
        assert!(inverted.validate().is_err());
        let promo_outside = FeePolicy {
            promo_percent: 2,
            ..FeePolicy::default()
        };
        assert!(promo_outside.validate().is_err());
    }

    #[test]
    fn test_processor_fee_estimate() {
        let est = ProcessorFeeEstimate::default();
        // 10000 * 290 / 10000 = 290, + 30
        assert_eq!(est.estimate(10_000), 320);
        assert_eq!(est.estimate(0), 0);
        // never more than the payment itself
        assert_eq!(est.estimate(20), 20);
    }

    #[tokio::test]
    async fn test_statement_keeps_promo_rate_after_promo_ends() {
        use crate::store::memory::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        let seller = Uuid::new_v4();
        let promo_ends = datetime!(2026-05-01 00:00 UTC);
        let service = RevenueService::new(store.clone(), FeePolicy::default());
        service
            .set_fee_settings(SellerFeeSettings {
                seller_id: seller,
                fee_percent_override: None,
                promo_ends_at: Some(promo_ends),
            })
            .await
            .unwrap();

        let settled_at = promo_ends - time::Duration::days(3);
        store
            .seed_sale(SaleRecord {
                source_ref: "cs_1".to_string(),
                seller_id: seller,
                gross_cents: 10_000,
                processor_fee_cents: 320,
                tax_cents: 0,
                platform_fee_percent: service.effective_percent(seller, settled_at).await.unwrap(),
                currency: "usd".to_string(),
                occurred_at: settled_at,
            })
            .await;

        let during = service.seller_statement(seller, settled_at).await.unwrap();
        assert_eq!(during.platform_fee_percent, 13);
        // 9680 * 13 / 100 = 1258.4
        assert_eq!(during.platform_fee_cents, 1_258);
        assert_eq!(during.seller_payout_cents, 8_422);

        let after = service
            .seller_statement(seller, promo_ends + time::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(after.platform_fee_percent, 15);
        assert_eq!(after.lines[0].breakdown.platform_fee_percent, 13);
        assert_eq!(after.seller_payout_cents, 8_422);
        assert_eq!(after.lines, during.lines);
    }
}

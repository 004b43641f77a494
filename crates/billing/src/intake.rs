//! Deposit-bearing intakes
//!
//! A site-build intake is priced from its budget tier. The deposit is a
//! percentage of the tier amount and, once paid, stays paid.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Tier amount used when the intake names a tier we do not price.
pub const FALLBACK_TIER_AMOUNT_CENTS: i64 = 500_000;

const TIER_AMOUNTS: &[(&str, i64)] = &[
    ("under-5k", 250_000),
    ("5k-10k", 750_000),
    ("10k-25k", 1_750_000),
    ("25k-50k", 3_750_000),
    ("50k-plus", 7_500_000),
];

pub fn tier_amount_cents(budget_tier: &str) -> i64 {
    TIER_AMOUNTS
        .iter()
        .find(|(tier, _)| *tier == budget_tier)
        .map(|(_, amount)| *amount)
        .unwrap_or(FALLBACK_TIER_AMOUNT_CENTS)
}

/// `round(tier * percent / 100)`, half up, integers only.
pub fn deposit_amount_cents(budget_tier: &str, deposit_percent: u32) -> i64 {
    let tier = i128::from(tier_amount_cents(budget_tier));
    ((tier * i128::from(deposit_percent) + 50) / 100) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntakeStatus {
    New,
    InProgress,
}

impl IntakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeStatus::New => "new",
            IntakeStatus::InProgress => "in-progress",
        }
    }
}

impl fmt::Display for IntakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntakeStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(IntakeStatus::New),
            "in-progress" => Ok(IntakeStatus::InProgress),
            other => Err(BillingError::invalid_enum("intake status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intake {
    pub id: Uuid,
    pub budget_tier: String,
    /// Zero until a deposit checkout has been created.
    pub deposit_amount_cents: i64,
    pub deposit_paid: bool,
    pub status: IntakeStatus,
    pub external_session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Intake {
    pub fn new(budget_tier: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            budget_tier: budget_tier.into(),
            deposit_amount_cents: 0,
            deposit_paid: false,
            status: IntakeStatus::New,
            external_session_id: None,
            created_at: now,
        }
    }

    /// Apply a confirmed deposit payment. Returns `false` when already latched.
    pub fn latch_deposit(&mut self, session_id: &str) -> bool {
        if self.deposit_paid {
            return false;
        }
        self.deposit_paid = true;
        self.status = IntakeStatus::InProgress;
        if self.external_session_id.is_none() {
            self.external_session_id = Some(session_id.to_string());
        }
        true
    }

    pub fn ensure_deposit_open(&self) -> BillingResult<()> {
        if self.deposit_paid {
            return Err(BillingError::Conflict(format!(
                "deposit for intake {} is already paid",
                self.id
            )));
        }
        Ok(())
    }
}

//! Postgres store
//!
//! `commit_event` claims the event id with `INSERT ... ON CONFLICT DO NOTHING`
//! inside the same transaction that applies the effects. A concurrent
//! duplicate blocks on the unique key and then sees zero rows.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AuditSnapshot, BillingStore, CommitOutcome, ProcessedEvent};
use crate::checkout::{CheckoutSessionRecord, PurposeKind};
use crate::dispatch::EventEffect;
use crate::error::{BillingError, BillingResult};
use crate::intake::Intake;
use crate::orders::{Order, OrderItem, OrderStatus, OrderStatusHistoryEntry};
use crate::payouts::{PayoutPreferences, PayoutRequest, PayoutStatus};
use crate::revenue::{SaleRecord, SellerFeeSettings};
use crate::subscriptions::{Plan, SubscriptionMirror};
use crate::webhooks::WebhookFailureRecord;

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

// --- row types -------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    seller_id: Uuid,
    name: String,
    price_cents: i64,
    currency: String,
    billing_period: String,
    active: bool,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Plan {
            id: row.id,
            seller_id: row.seller_id,
            name: row.name,
            price_cents: row.price_cents,
            currency: row.currency,
            billing_period: row.billing_period.parse()?,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IntakeRow {
    id: Uuid,
    budget_tier: String,
    deposit_amount_cents: i64,
    deposit_paid: bool,
    status: String,
    external_session_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<IntakeRow> for Intake {
    type Error = BillingError;

    fn try_from(row: IntakeRow) -> Result<Self, Self::Error> {
        Ok(Intake {
            id: row.id,
            budget_tier: row.budget_tier,
            deposit_amount_cents: row.deposit_amount_cents,
            deposit_paid: row.deposit_paid,
            status: row.status.parse()?,
            external_session_id: row.external_session_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    purpose_kind: String,
    subject_id: Uuid,
    amount_cents: i64,
    currency: String,
    metadata: Json<HashMap<String, String>>,
    created_at: OffsetDateTime,
}

impl TryFrom<SessionRow> for CheckoutSessionRecord {
    type Error = BillingError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(CheckoutSessionRecord {
            session_id: row.session_id,
            purpose_kind: row.purpose_kind.parse()?,
            subject_id: row.subject_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    external_subscription_id: String,
    plan_id: Option<Uuid>,
    seller_id: Option<Uuid>,
    customer_ref: Option<String>,
    status: String,
    last_event_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionMirror {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionMirror {
            external_subscription_id: row.external_subscription_id,
            plan_id: row.plan_id,
            seller_id: row.seller_id,
            customer_ref: row.customer_ref,
            status: row.status.parse()?,
            last_event_at: row.last_event_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    status: String,
    items: Json<Vec<OrderItem>>,
    total_cents: i64,
    currency: String,
    customer_ref: Option<String>,
    seller_id: Option<Uuid>,
    external_session_id: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = BillingError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            status: row.status.parse()?,
            items: row.items.0,
            total_cents: row.total_cents,
            currency: row.currency,
            customer_ref: row.customer_ref,
            seller_id: row.seller_id,
            external_session_id: row.external_session_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    order_id: Uuid,
    status: String,
    note: Option<String>,
    occurred_at: OffsetDateTime,
}

impl TryFrom<HistoryRow> for OrderStatusHistoryEntry {
    type Error = BillingError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(OrderStatusHistoryEntry {
            order_id: row.order_id,
            status: row.status.parse()?,
            note: row.note,
            occurred_at: row.occurred_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FeeSettingsRow {
    seller_id: Uuid,
    fee_percent_override: Option<i32>,
    promo_ends_at: Option<OffsetDateTime>,
}

impl TryFrom<FeeSettingsRow> for SellerFeeSettings {
    type Error = BillingError;

    fn try_from(row: FeeSettingsRow) -> Result<Self, Self::Error> {
        let fee_percent_override = row
            .fee_percent_override
            .map(u32::try_from)
            .transpose()
            .map_err(|_| BillingError::Database("negative fee override stored".to_string()))?;
        Ok(SellerFeeSettings {
            seller_id: row.seller_id,
            fee_percent_override,
            promo_ends_at: row.promo_ends_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PreferencesRow {
    seller_id: Uuid,
    cadence: String,
    method: String,
    updated_at: Option<OffsetDateTime>,
}

impl TryFrom<PreferencesRow> for PayoutPreferences {
    type Error = BillingError;

    fn try_from(row: PreferencesRow) -> Result<Self, Self::Error> {
        Ok(PayoutPreferences {
            seller_id: row.seller_id,
            cadence: row.cadence.parse()?,
            method: row.method.parse()?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    seller_id: Uuid,
    amount_cents: Option<i64>,
    method: String,
    cadence: String,
    status: String,
    notes: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PayoutRow> for PayoutRequest {
    type Error = BillingError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        Ok(PayoutRequest {
            id: row.id,
            seller_id: row.seller_id,
            amount_cents: row.amount_cents,
            method: row.method.parse()?,
            cadence: row.cadence.parse()?,
            status: row.status.parse()?,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const ORDER_COLUMNS: &str = "id, status, items, total_cents, currency, customer_ref, seller_id, \
                             external_session_id, created_at, updated_at";
const PAYOUT_COLUMNS: &str =
    "id, seller_id, amount_cents, method, cadence, status, notes, created_at, updated_at";

// --- effect application ----------------------------------------------------

async fn insert_history(conn: &mut PgConnection, entry: &OrderStatusHistoryEntry) -> BillingResult<()> {
    sqlx::query(
        "INSERT INTO order_status_history (order_id, status, note, occurred_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(entry.order_id)
    .bind(entry.status.as_str())
    .bind(&entry.note)
    .bind(entry.occurred_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn apply_effect(conn: &mut PgConnection, effect: &EventEffect) -> BillingResult<()> {
    match effect {
        EventEffect::LatchDeposit {
            intake_id,
            session_id,
        } => {
            let latched = sqlx::query(
                r#"
                UPDATE intakes
                SET deposit_paid = TRUE,
                    status = 'in-progress',
                    external_session_id = COALESCE(external_session_id, $2)
                WHERE id = $1 AND deposit_paid = FALSE
                "#,
            )
            .bind(intake_id)
            .bind(session_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if latched == 0 {
                let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM intakes WHERE id = $1)")
                    .bind(intake_id)
                    .fetch_one(&mut *conn)
                    .await?;
                if !exists {
                    return Err(BillingError::NotFound(format!("intake {}", intake_id)));
                }
                tracing::info!(intake_id = %intake_id, "Deposit already latched, skipping");
            }
        }
        EventEffect::CreateOrder { order, opening } => {
            let inserted = sqlx::query(
                r#"
                INSERT INTO orders
                    (id, status, items, total_cents, currency, customer_ref, seller_id,
                     external_session_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (external_session_id) DO NOTHING
                "#,
            )
            .bind(order.id)
            .bind(order.status.as_str())
            .bind(Json(&order.items))
            .bind(order.total_cents)
            .bind(&order.currency)
            .bind(&order.customer_ref)
            .bind(order.seller_id)
            .bind(&order.external_session_id)
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if inserted == 1 {
                insert_history(conn, opening).await?;
            }
        }
        EventEffect::MirrorSubscription(mirror) => {
            let applied = sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (external_subscription_id, plan_id, seller_id, customer_ref, status, last_event_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (external_subscription_id) DO UPDATE SET
                    plan_id = COALESCE(EXCLUDED.plan_id, subscriptions.plan_id),
                    seller_id = COALESCE(EXCLUDED.seller_id, subscriptions.seller_id),
                    customer_ref = COALESCE(EXCLUDED.customer_ref, subscriptions.customer_ref),
                    status = EXCLUDED.status,
                    last_event_at = EXCLUDED.last_event_at
                WHERE subscriptions.last_event_at <= EXCLUDED.last_event_at
                  AND (subscriptions.status NOT IN ('canceled', 'incomplete_expired')
                       OR subscriptions.status = EXCLUDED.status)
                "#,
            )
            .bind(&mirror.external_subscription_id)
            .bind(mirror.plan_id)
            .bind(mirror.seller_id)
            .bind(&mirror.customer_ref)
            .bind(mirror.status.as_str())
            .bind(mirror.last_event_at)
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if applied == 0 {
                tracing::info!(
                    subscription_id = %mirror.external_subscription_id,
                    "Stale subscription event, keeping newer state"
                );
            }
        }
        EventEffect::RecordSale(sale) => {
            let percent = i32::try_from(sale.platform_fee_percent)
                .map_err(|_| BillingError::InvalidInput("platform fee percent out of range".to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO sales
                    (source_ref, seller_id, gross_cents, processor_fee_cents, tax_cents,
                     platform_fee_percent, currency, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (source_ref) DO NOTHING
                "#,
            )
            .bind(&sale.source_ref)
            .bind(sale.seller_id)
            .bind(sale.gross_cents)
            .bind(sale.processor_fee_cents)
            .bind(sale.tax_cents)
            .bind(percent)
            .bind(&sale.currency)
            .bind(sale.occurred_at)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        sqlx::query_as::<_, PlanRow>(
            "SELECT id, seller_id, name, price_cents, currency, billing_period, active FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Plan::try_from)
        .transpose()
    }

    async fn upsert_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, seller_id, name, price_cents, currency, billing_period, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                price_cents = EXCLUDED.price_cents,
                currency = EXCLUDED.currency,
                billing_period = EXCLUDED.billing_period,
                active = EXCLUDED.active
            "#,
        )
        .bind(plan.id)
        .bind(plan.seller_id)
        .bind(&plan.name)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.billing_period.as_str())
        .bind(plan.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_known_seller(&self, seller_id: Uuid) -> BillingResult<bool> {
        let known: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM plans WHERE seller_id = $1)
                OR EXISTS (SELECT 1 FROM seller_fee_settings WHERE seller_id = $1)
            "#,
        )
        .bind(seller_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(known)
    }

    async fn get_intake(&self, intake_id: Uuid) -> BillingResult<Option<Intake>> {
        sqlx::query_as::<_, IntakeRow>(
            r#"
            SELECT id, budget_tier, deposit_amount_cents, deposit_paid, status,
                   external_session_id, created_at
            FROM intakes WHERE id = $1
            "#,
        )
        .bind(intake_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Intake::try_from)
        .transpose()
    }

    async fn insert_intake(&self, intake: &Intake) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO intakes
                (id, budget_tier, deposit_amount_cents, deposit_paid, status, external_session_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(intake.id)
        .bind(&intake.budget_tier)
        .bind(intake.deposit_amount_cents)
        .bind(intake.deposit_paid)
        .bind(intake.status.as_str())
        .bind(&intake.external_session_id)
        .bind(intake.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_checkout_session(&self, record: &CheckoutSessionRecord) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO checkout_sessions
                (session_id, purpose_kind, subject_id, amount_cents, currency, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(&record.session_id)
        .bind(record.purpose_kind.as_str())
        .bind(record.subject_id)
        .bind(record.amount_cents)
        .bind(&record.currency)
        .bind(Json(&record.metadata))
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        if record.purpose_kind == PurposeKind::Deposit {
            let updated = sqlx::query(
                "UPDATE intakes SET external_session_id = $2, deposit_amount_cents = $3 WHERE id = $1",
            )
            .bind(record.subject_id)
            .bind(&record.session_id)
            .bind(record.amount_cents)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                return Err(BillingError::NotFound(format!("intake {}", record.subject_id)));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<Option<CheckoutSessionRecord>> {
        sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, purpose_kind, subject_id, amount_cents, currency, metadata, created_at
            FROM checkout_sessions WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(CheckoutSessionRecord::try_from)
        .transpose()
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn commit_event(&self, event: &ProcessedEvent, effects: &[EventEffect]) -> BillingResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, event_created_at, processed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.event_created_at)
        .bind(event.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.event_id,
                error = %e,
                "Failed to claim webhook event"
            );
            BillingError::from(e)
        })?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::Duplicate);
        }

        for effect in effects {
            apply_effect(&mut tx, effect).await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Applied)
    }

    async fn record_webhook_failure(&self, failure: &WebhookFailureRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_failures (event_id, event_type, error_kind, error_message, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&failure.event_id)
        .bind(&failure.event_type)
        .bind(&failure.error_kind)
        .bind(&failure.error_message)
        .bind(failure.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_webhook_failures(&self, limit: i64) -> BillingResult<Vec<WebhookFailureRecord>> {
        let rows = sqlx::query_as::<_, WebhookFailureRecord>(
            r#"
            SELECT event_id, event_type, error_kind, error_message, occurred_at
            FROM webhook_failures
            ORDER BY occurred_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_subscription(&self, external_subscription_id: &str) -> BillingResult<Option<SubscriptionMirror>> {
        sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT external_subscription_id, plan_id, seller_id, customer_ref, status, last_event_at
            FROM subscriptions WHERE external_subscription_id = $1
            "#,
        )
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .map(SubscriptionMirror::try_from)
        .transpose()
    }

    async fn insert_order(&self, order: &Order, opening: &OrderStatusHistoryEntry) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, status, items, total_cents, currency, customer_ref, seller_id,
                 external_session_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id)
        .bind(order.status.as_str())
        .bind(Json(&order.items))
        .bind(order.total_cents)
        .bind(&order.currency)
        .bind(&order.customer_ref)
        .bind(order.seller_id)
        .bind(&order.external_session_id)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;
        insert_history(&mut tx, opening).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        sqlx::query_as::<_, OrderRow>(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    async fn find_order_by_session(&self, session_id: &str) -> BillingResult<Option<Order>> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE external_session_id = $1",
            ORDER_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn order_history(&self, order_id: Uuid) -> BillingResult<Vec<OrderStatusHistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT order_id, status, note, occurred_at FROM order_status_history WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        entry: &OrderStatusHistoryEntry,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE orders SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2")
            .bind(order_id)
            .bind(expected.as_str())
            .bind(entry.status.as_str())
            .bind(entry.occurred_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_history(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_fee_settings(&self, seller_id: Uuid) -> BillingResult<Option<SellerFeeSettings>> {
        sqlx::query_as::<_, FeeSettingsRow>(
            "SELECT seller_id, fee_percent_override, promo_ends_at FROM seller_fee_settings WHERE seller_id = $1",
        )
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?
        .map(SellerFeeSettings::try_from)
        .transpose()
    }

    async fn upsert_fee_settings(&self, settings: &SellerFeeSettings) -> BillingResult<()> {
        let override_pct = settings
            .fee_percent_override
            .map(i32::try_from)
            .transpose()
            .map_err(|_| BillingError::InvalidInput("fee override out of range".to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO seller_fee_settings (seller_id, fee_percent_override, promo_ends_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (seller_id) DO UPDATE SET
                fee_percent_override = EXCLUDED.fee_percent_override,
                promo_ends_at = EXCLUDED.promo_ends_at
            "#,
        )
        .bind(settings.seller_id)
        .bind(override_pct)
        .bind(settings.promo_ends_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_sales(&self, seller_id: Uuid) -> BillingResult<Vec<SaleRecord>> {
        let rows = sqlx::query_as::<_, SaleRecord>(
            r#"
            SELECT source_ref, seller_id, gross_cents, processor_fee_cents, tax_cents,
                   platform_fee_percent, currency, occurred_at
            FROM sales WHERE seller_id = $1
            ORDER BY occurred_at
            "#,
        )
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_payout_preferences(&self, seller_id: Uuid) -> BillingResult<Option<PayoutPreferences>> {
        sqlx::query_as::<_, PreferencesRow>(
            "SELECT seller_id, cadence, method, updated_at FROM payout_preferences WHERE seller_id = $1",
        )
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?
        .map(PayoutPreferences::try_from)
        .transpose()
    }

    async fn upsert_payout_preferences(&self, prefs: &PayoutPreferences) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payout_preferences (seller_id, cadence, method, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (seller_id) DO UPDATE SET
                cadence = EXCLUDED.cadence,
                method = EXCLUDED.method,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(prefs.seller_id)
        .bind(prefs.cadence.as_str())
        .bind(prefs.method.as_str())
        .bind(prefs.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_payout_request(&self, request: &PayoutRequest) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO payout_requests ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            PAYOUT_COLUMNS
        ))
        .bind(request.id)
        .bind(request.seller_id)
        .bind(request.amount_cents)
        .bind(request.method.as_str())
        .bind(request.cadence.as_str())
        .bind(request.status.as_str())
        .bind(&request.notes)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payout_request(&self, request_id: Uuid) -> BillingResult<Option<PayoutRequest>> {
        sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {} FROM payout_requests WHERE id = $1",
            PAYOUT_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?
        .map(PayoutRequest::try_from)
        .transpose()
    }

    async fn list_payout_requests(&self, seller_id: Uuid) -> BillingResult<Vec<PayoutRequest>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {} FROM payout_requests WHERE seller_id = $1 ORDER BY created_at DESC",
            PAYOUT_COLUMNS
        ))
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn update_payout_request(&self, request: &PayoutRequest, expected: PayoutStatus) -> BillingResult<bool> {
        let updated = sqlx::query(
            "UPDATE payout_requests SET status = $3, notes = $4, updated_at = $5 WHERE id = $1 AND status = $2",
        )
        .bind(request.id)
        .bind(expected.as_str())
        .bind(request.status.as_str())
        .bind(&request.notes)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn audit_snapshot(&self) -> BillingResult<AuditSnapshot> {
        let orders: Vec<Order> = convert_all(
            sqlx::query_as::<_, OrderRow>(&format!("SELECT {} FROM orders", ORDER_COLUMNS))
                .fetch_all(&self.pool)
                .await?,
        )?;
        let history: Vec<OrderStatusHistoryEntry> = convert_all(
            sqlx::query_as::<_, HistoryRow>(
                "SELECT order_id, status, note, occurred_at FROM order_status_history ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?,
        )?;
        let mut by_order: HashMap<Uuid, Vec<OrderStatusHistoryEntry>> = HashMap::new();
        for entry in history {
            by_order.entry(entry.order_id).or_default().push(entry);
        }

        let intakes = convert_all(
            sqlx::query_as::<_, IntakeRow>(
                "SELECT id, budget_tier, deposit_amount_cents, deposit_paid, status, external_session_id, created_at FROM intakes",
            )
            .fetch_all(&self.pool)
            .await?,
        )?;
        let checkout_sessions = convert_all(
            sqlx::query_as::<_, SessionRow>(
                "SELECT session_id, purpose_kind, subject_id, amount_cents, currency, metadata, created_at FROM checkout_sessions",
            )
            .fetch_all(&self.pool)
            .await?,
        )?;
        let sales = sqlx::query_as::<_, SaleRecord>(
            "SELECT source_ref, seller_id, gross_cents, processor_fee_cents, tax_cents, platform_fee_percent, currency, occurred_at FROM sales",
        )
        .fetch_all(&self.pool)
        .await?;
        let payout_requests = convert_all(
            sqlx::query_as::<_, PayoutRow>(&format!("SELECT {} FROM payout_requests", PAYOUT_COLUMNS))
                .fetch_all(&self.pool)
                .await?,
        )?;

        Ok(AuditSnapshot {
            orders: orders
                .into_iter()
                .map(|order| {
                    let history = by_order.remove(&order.id).unwrap_or_default();
                    (order, history)
                })
                .collect(),
            intakes,
            checkout_sessions,
            sales,
            payout_requests,
        })
    }
}

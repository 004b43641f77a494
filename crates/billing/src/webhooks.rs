//! Payment webhook ingestion
//!
//! Verifies the processor signature, rejects already-processed events before
//! any handler runs, then commits the event id and the handler's effects
//! together. Handler failures go to the failure sidecar and come back as
//! errors so the processor redelivers.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::alerting::{FailureNotifier, HandlerFailure};
use crate::dispatch::{Dispatch, EventDispatcher, WebhookEvent};
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, CommitOutcome, ProcessedEvent};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Result of a delivery that the processor should treat as accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Effects applied.
    Processed,
    /// Logged, nothing to apply (unknown type, unsettled payment).
    Ignored,
    /// Event id already in the processed log.
    Duplicate,
}

/// Operator-visible record of a failed delivery. Never consulted for dedup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookFailureRecord {
    pub event_id: String,
    pub event_type: String,
    pub error_kind: String,
    pub error_message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Verifies `t=<unix>,v1=<hex>[,v1=<hex>...]` signature headers.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Expected `v1` value for a payload signed at `timestamp`.
    ///
    /// The processor keys the HMAC with the whole secret, `whsec_` prefix included.
    pub fn sign(&self, timestamp: i64, payload: &str) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, payload: &str, header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_at(&self, payload: &str, header: &str, now: i64) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let skew_secs = (now - timestamp).abs();
        if skew_secs > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                skew_secs = skew_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookTimestampExpired { skew_secs });
        }

        let expected = self.sign(timestamp, payload)?;
        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
        if !matched {
            tracing::warn!(candidates = candidates.len(), "Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        Ok(())
    }
}

/// Webhook entry point
#[derive(Clone)]
pub struct WebhookGateway {
    store: Arc<dyn BillingStore>,
    verifier: SignatureVerifier,
    dispatcher: EventDispatcher,
    notifier: FailureNotifier,
}

impl WebhookGateway {
    pub fn new(
        store: Arc<dyn BillingStore>,
        verifier: SignatureVerifier,
        dispatcher: EventDispatcher,
        notifier: FailureNotifier,
    ) -> Self {
        Self {
            store,
            verifier,
            dispatcher,
            notifier,
        }
    }

    /// Verify the signature and parse the envelope. Nothing is written.
    pub fn verify_event(&self, payload: &str, signature: Option<&str>) -> BillingResult<WebhookEvent> {
        let signature = signature.ok_or_else(|| {
            tracing::warn!("Webhook delivered without signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        self.verifier.verify(payload, signature)?;
        WebhookEvent::parse(payload)
    }

    /// Full ingestion path for one delivery.
    pub async fn handle(&self, payload: &str, signature: Option<&str>) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(event).await
    }

    /// Process an already-verified event.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, already processed"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        match self.process(&event).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.report_failure(&event, &err).await;
                Err(err)
            }
        }
    }

    async fn process(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let (effects, outcome) = match self.dispatcher.dispatch(event, self.store.as_ref()).await? {
            Dispatch::Handled(effects) => (effects, WebhookOutcome::Processed),
            Dispatch::Ignored(reason) => {
                tracing::info!(event_id = %event.id, reason = reason, "Webhook event acknowledged without effects");
                (Vec::new(), WebhookOutcome::Ignored)
            }
        };

        let record = ProcessedEvent {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            event_created_at: event.created,
            processed_at: OffsetDateTime::now_utc(),
        };

        match self.store.commit_event(&record, &effects).await? {
            CommitOutcome::Applied => {
                tracing::info!(
                    event_id = %event.id,
                    effects = effects.len(),
                    "Webhook event committed"
                );
                Ok(outcome)
            }
            CommitOutcome::Duplicate => {
                tracing::info!(
                    event_id = %event.id,
                    "Concurrent delivery committed first, treating as duplicate"
                );
                Ok(WebhookOutcome::Duplicate)
            }
        }
    }

    async fn report_failure(&self, event: &WebhookEvent, err: &BillingError) {
        let failure = HandlerFailure {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            error_kind: err.kind(),
            error_message: err.to_string(),
            retryable: err.is_retryable(),
        };
        self.notifier.notify(&failure).await;

        let record = WebhookFailureRecord {
            event_id: failure.event_id.clone(),
            event_type: failure.event_type.clone(),
            error_kind: failure.error_kind.to_string(),
            error_message: failure.error_message.clone(),
            occurred_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.store.record_webhook_failure(&record).await {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to persist webhook failure record"
            );
        }
    }

    /// Most recent failed deliveries for operators.
    pub async fn list_failures(&self, limit: i64) -> BillingResult<Vec<WebhookFailureRecord>> {
        self.store.list_webhook_failures(limit.clamp(1, 500)).await
    }
}

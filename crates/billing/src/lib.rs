// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::InvalidTransition carries both endpoints
#![allow(clippy::too_many_arguments)] // Order construction takes every column
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storefront Billing Engine
//!
//! Reconciles payment-processor events with local orders, deposits,
//! subscriptions and seller revenue.
//!
//! ## Features
//!
//! - **Checkout**: Hosted checkout sessions for subscriptions, deposits and carts
//! - **Webhooks**: Signature verification and exactly-once event application
//! - **Dispatch**: One handler per event type; unknown types are acknowledged
//! - **Orders**: Forward-only status machine with append-only history
//! - **Revenue**: Platform fee and seller payout split with promo windows
//! - **Payouts**: Seller requests against accrued balance, admin approval
//! - **Alerts**: Slack and email notification of handler failures
//! - **Invariants**: Read-only consistency checks for operators

pub mod alerting;
pub mod checkout;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod intake;
pub mod invariants;
pub mod orders;
pub mod payouts;
pub mod revenue;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Alerting
pub use alerting::{AlertConfig, FailureNotifier, HandlerFailure, SlackAlerter};

// Checkout
pub use checkout::{
    CheckoutIntent, CheckoutMetadata, CheckoutResponse, CheckoutService, CheckoutSessionRecord,
    PurposeKind,
};

// Client
pub use client::{
    HostedCheckoutMode, HostedCheckoutProvider, HostedCheckoutRequest, HostedLineItem,
    HostedSession, RecurringInterval, StripeClient, StripeConfig,
};

// Config
pub use config::BillingConfig;

// Dispatch
pub use dispatch::{Dispatch, EventDispatcher, EventEffect, WebhookEvent};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Intake
pub use intake::{deposit_amount_cents, Intake, IntakeStatus};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Orders
pub use orders::{
    Order, OrderItem, OrderService, OrderStatus, OrderStatusHistoryEntry, OrderWithHistory,
};

// Payouts
pub use payouts::{
    AdminPayoutUpdate, NewPayoutRequest, PayoutBalance, PayoutCadence, PayoutMethod,
    PayoutPreferences, PayoutPreferencesUpdate, PayoutRequest, PayoutService, PayoutStatus,
};

// Revenue
pub use revenue::{
    compute_breakdown, effective_platform_fee_percent, FeePolicy, ProcessorFeeEstimate,
    RevenueBreakdown, RevenueService, SaleRecord, SellerFeeSettings, SellerStatement,
};

// Store
pub use store::{BillingStore, MemoryStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{BillingPeriod, Plan, SubscriptionMirror, SubscriptionService, SubscriptionStatus};

// Webhooks
pub use webhooks::{
    SignatureVerifier, WebhookFailureRecord, WebhookGateway, WebhookOutcome, SIGNATURE_HEADER,
};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub checkout: CheckoutService,
    pub webhooks: WebhookGateway,
    pub orders: OrderService,
    pub payouts: PayoutService,
    pub revenue: RevenueService,
    pub subscriptions: SubscriptionService,
    pub invariants: InvariantChecker,
    store: Arc<dyn BillingStore>,
}

impl BillingService {
    /// Wire every service over one store and one checkout provider.
    pub fn new(
        config: &BillingConfig,
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn HostedCheckoutProvider>,
        http: reqwest::Client,
    ) -> Self {
        let revenue = RevenueService::new(store.clone(), config.fee_policy);
        let notifier = FailureNotifier::from_config(http, &config.alerts, &config.email);
        let verifier = SignatureVerifier::new(
            config.stripe.webhook_secret.clone(),
            config.webhook_tolerance_secs,
        );

        Self {
            checkout: CheckoutService::new(
                store.clone(),
                provider,
                config.deposit_percent,
                config.stripe.success_url.clone(),
                config.stripe.cancel_url.clone(),
            ),
            webhooks: WebhookGateway::new(
                store.clone(),
                verifier,
                EventDispatcher::new(config.processor_fee, config.fee_policy),
                notifier,
            ),
            orders: OrderService::new(store.clone()),
            payouts: PayoutService::new(store.clone(), revenue.clone()),
            subscriptions: SubscriptionService::new(store.clone()),
            invariants: InvariantChecker::new(store.clone()),
            revenue,
            store,
        }
    }

    /// Production wiring: Stripe-hosted checkout from the same config.
    pub fn with_stripe(config: &BillingConfig, store: Arc<dyn BillingStore>, http: reqwest::Client) -> Self {
        let provider = Arc::new(StripeClient::new(config.stripe.clone()));
        Self::new(config, store, provider, http)
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }
}

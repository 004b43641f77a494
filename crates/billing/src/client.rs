//! Hosted-checkout transport
//!
//! The factory never talks to the processor directly. It hands a
//! [`HostedCheckoutRequest`] to a [`HostedCheckoutProvider`]; production uses
//! [`StripeClient`], tests use an in-process fake.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval,
    CreateCheckoutSessionSubscriptionData, Currency,
};

use crate::error::{BillingError, BillingResult};

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let public_url =
            std::env::var("PUBLIC_APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let success_url = std::env::var("CHECKOUT_SUCCESS_URL")
            .unwrap_or_else(|_| format!("{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}", public_url));
        let cancel_url = std::env::var("CHECKOUT_CANCEL_URL")
            .unwrap_or_else(|_| format!("{}/checkout/cancelled", public_url));

        Ok(Self {
            secret_key,
            webhook_secret,
            success_url,
            cancel_url,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostedCheckoutMode {
    Payment,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringInterval {
    Week,
    Month,
    Year,
}

/// One priced line; amounts are already resolved server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedLineItem {
    pub name: String,
    pub unit_amount_cents: i64,
    pub quantity: u64,
    pub recurring: Option<RecurringInterval>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedCheckoutRequest {
    pub mode: HostedCheckoutMode,
    pub currency: String,
    pub line_items: Vec<HostedLineItem>,
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedSession {
    pub session_id: String,
    pub redirect_url: String,
}

#[async_trait]
pub trait HostedCheckoutProvider: Send + Sync {
    async fn create_session(&self, request: &HostedCheckoutRequest) -> BillingResult<HostedSession>;
}

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(&config.secret_key);
        Self { inner, config }
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

fn stripe_interval(interval: RecurringInterval) -> CreateCheckoutSessionLineItemsPriceDataRecurringInterval {
    match interval {
        RecurringInterval::Week => CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Week,
        RecurringInterval::Month => CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
        RecurringInterval::Year => CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Year,
    }
}

#[async_trait]
impl HostedCheckoutProvider for StripeClient {
    async fn create_session(&self, request: &HostedCheckoutRequest) -> BillingResult<HostedSession> {
        let currency: Currency = request
            .currency
            .parse()
            .map_err(|_| BillingError::invalid_enum("currency", request.currency.clone()))?;

        let mut params = CreateCheckoutSession::new();
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.metadata = Some(request.metadata.clone());

        match request.mode {
            HostedCheckoutMode::Payment => {
                params.mode = Some(CheckoutSessionMode::Payment);
            }
            HostedCheckoutMode::Subscription => {
                params.mode = Some(CheckoutSessionMode::Subscription);
                // Subscription objects carry their own metadata; mirror it so
                // customer.subscription.* events resolve plan and seller.
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(request.metadata.clone()),
                    ..Default::default()
                });
            }
        }

        let line_items = request
            .line_items
            .iter()
            .map(|item| CreateCheckoutSessionLineItems {
                price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                    currency,
                    product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                        name: item.name.clone(),
                        ..Default::default()
                    }),
                    recurring: item.recurring.map(|interval| {
                        CreateCheckoutSessionLineItemsPriceDataRecurring {
                            interval: stripe_interval(interval),
                            interval_count: None,
                        }
                    }),
                    unit_amount: Some(item.unit_amount_cents),
                    ..Default::default()
                }),
                quantity: Some(item.quantity),
                ..Default::default()
            })
            .collect();
        params.line_items = Some(line_items);

        let session = CheckoutSession::create(&self.inner, params).await.map_err(|e| {
            tracing::error!(error = %e, mode = ?request.mode, "Failed to create Stripe checkout session");
            BillingError::from(e)
        })?;

        let redirect_url = session.url.ok_or_else(|| {
            BillingError::StripeApi("checkout session returned without a URL".to_string())
        })?;

        Ok(HostedSession {
            session_id: session.id.to_string(),
            redirect_url,
        })
    }
}

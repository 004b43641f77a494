//! Failure notification sidecar
//!
//! Every webhook handler failure is logged at error level, posted to Slack
//! when a webhook URL is configured, and emailed to the operator when email is
//! configured. Delivery problems are logged and swallowed; they never replace
//! the handler error the gateway returns.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::email::{BillingEmailService, EmailConfig};
use crate::error::{BillingError, BillingResult, ErrorKind};

const SLACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct AlertConfig {
    pub slack_webhook_url: Option<String>,
}

impl AlertConfig {
    pub fn from_env() -> Self {
        Self {
            slack_webhook_url: std::env::var("SLACK_ALERT_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
        }
    }
}

/// What went wrong while handling one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerFailure {
    pub event_id: String,
    pub event_type: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub retryable: bool,
}

impl HandlerFailure {
    pub fn summary(&self) -> String {
        format!(
            "Webhook handler failed: {} ({}) [{}{}]: {}",
            self.event_type,
            self.event_id,
            self.error_kind,
            if self.retryable { ", will be redelivered" } else { "" },
            self.error_message
        )
    }
}

/// Slack incoming-webhook channel
#[derive(Clone)]
pub struct SlackAlerter {
    http: reqwest::Client,
    webhook_url: String,
    max_retries: usize,
}

impl SlackAlerter {
    pub fn new(http: reqwest::Client, webhook_url: String) -> Self {
        Self {
            http,
            webhook_url,
            max_retries: 2,
        }
    }

    async fn post_once(&self, body: &serde_json::Value) -> BillingResult<()> {
        let response = self
            .http
            .post(&self.webhook_url)
            .timeout(SLACK_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("slack request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "slack responded with {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn send(&self, failure: &HandlerFailure) -> BillingResult<()> {
        let body = json!({
            "text": failure.summary(),
            "blocks": [
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!(
                            ":rotating_light: *Webhook handler failure*\n*Event:* `{}`\n*Type:* `{}`\n*Kind:* {}\n*Error:* {}",
                            failure.event_id, failure.event_type, failure.error_kind, failure.error_message
                        )
                    }
                }
            ]
        });

        let strategy = ExponentialBackoff::from_millis(100)
            .map(jitter)
            .take(self.max_retries);
        Retry::spawn(strategy, || self.post_once(&body)).await
    }
}

#[derive(Clone, Default)]
pub struct FailureNotifier {
    slack: Option<SlackAlerter>,
    email: Option<BillingEmailService>,
}

impl FailureNotifier {
    pub fn new(slack: Option<SlackAlerter>, email: Option<BillingEmailService>) -> Self {
        Self { slack, email }
    }

    /// Build every configured channel from config.
    pub fn from_config(
        http: reqwest::Client,
        alerts: &AlertConfig,
        email: &EmailConfig,
    ) -> Self {
        let slack = alerts
            .slack_webhook_url
            .clone()
            .map(|url| SlackAlerter::new(http.clone(), url));
        if slack.is_none() {
            tracing::warn!("Webhook failure alerts have no Slack channel (missing SLACK_ALERT_WEBHOOK_URL)");
        }
        let email = BillingEmailService::from_config(http, email);
        Self::new(slack, email)
    }

    pub async fn notify(&self, failure: &HandlerFailure) {
        tracing::error!(
            event_id = %failure.event_id,
            event_type = %failure.event_type,
            error_kind = %failure.error_kind,
            error = %failure.error_message,
            retryable = failure.retryable,
            "Webhook handler failure"
        );

        if let Some(slack) = &self.slack {
            if let Err(e) = slack.send(failure).await {
                tracing::warn!(
                    event_id = %failure.event_id,
                    error = %e,
                    "Failed to deliver Slack alert"
                );
            }
        }

        if let Some(email) = &self.email {
            if let Err(e) = email.send_handler_failure(failure).await {
                tracing::warn!(
                    event_id = %failure.event_id,
                    error = %e,
                    "Failed to deliver operator alert email"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> HandlerFailure {
        HandlerFailure {
            event_id: "evt_1".to_string(),
            event_type: "invoice.paid".to_string(),
            error_kind: ErrorKind::Transient,
            error_message: "Database error: connection reset".to_string(),
            retryable: true,
        }
    }

    #[test]
    fn test_summary_mentions_event_and_kind() {
        let summary = failure().summary();
        assert!(summary.contains("invoice.paid"));
        assert!(summary.contains("evt_1"));
        assert!(summary.contains("transient"));
    }

    #[tokio::test]
    async fn test_slack_alert_posted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::Regex("evt_1".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let slack = SlackAlerter::new(reqwest::Client::new(), format!("{}/hook", server.url()));
        slack.send(&failure()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_slack_retries_then_gives_up() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let slack = SlackAlerter::new(reqwest::Client::new(), format!("{}/hook", server.url()));
        assert!(slack.send(&failure()).await.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_swallows_channel_errors() {
        let slack = SlackAlerter::new(reqwest::Client::new(), "http://127.0.0.1:9/unreachable".to_string());
        let notifier = FailureNotifier::new(Some(slack), None);
        notifier.notify(&failure()).await;
    }
}

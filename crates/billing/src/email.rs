//! Operator alert email via the Resend HTTP API

use std::time::Duration;

use serde_json::json;

use crate::alerting::HandlerFailure;
use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: Option<String>,
    pub operator_email: Option<String>,
    pub from_address: String,
    pub api_base_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            resend_api_key: None,
            operator_email: None,
            from_address: "Storefront Billing <billing@storefront.local>".to_string(),
            api_base_url: RESEND_API_URL.to_string(),
        }
    }
}

impl EmailConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            resend_api_key: non_empty("RESEND_API_KEY"),
            operator_email: non_empty("OPERATOR_ALERT_EMAIL"),
            from_address: non_empty("ALERT_FROM_EMAIL").unwrap_or(defaults.from_address),
            api_base_url: non_empty("RESEND_API_URL").unwrap_or(defaults.api_base_url),
        }
    }
}

#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    api_key: String,
    to: String,
    from: String,
    base_url: String,
}

impl BillingEmailService {
    /// `None` unless both the API key and the recipient are set.
    pub fn from_config(http: reqwest::Client, config: &EmailConfig) -> Option<Self> {
        match (&config.resend_api_key, &config.operator_email) {
            (Some(api_key), Some(to)) => Some(Self {
                http,
                api_key: api_key.clone(),
                to: to.clone(),
                from: config.from_address.clone(),
                base_url: config.api_base_url.trim_end_matches('/').to_string(),
            }),
            _ => {
                tracing::info!("Operator alert email disabled (RESEND_API_KEY or OPERATOR_ALERT_EMAIL unset)");
                None
            }
        }
    }

    pub async fn send_handler_failure(&self, failure: &HandlerFailure) -> BillingResult<()> {
        let subject = format!("[billing] {} failed ({})", failure.event_type, failure.error_kind);
        let body = format!(
            "<p>A payment webhook could not be applied.</p>\
             <ul><li>Event: <code>{}</code></li><li>Type: <code>{}</code></li>\
             <li>Kind: {}</li><li>Redelivered: {}</li></ul><pre>{}</pre>",
            failure.event_id,
            failure.event_type,
            failure.error_kind,
            if failure.retryable { "yes" } else { "no" },
            failure.error_message
        );

        let response = self
            .http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .json(&json!({
                "from": self.from,
                "to": [self.to],
                "subject": subject,
                "html": body,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("resend request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BillingError::Internal(format!(
                "resend responded with {}: {}",
                status, text
            )));
        }

        tracing::info!(event_id = %failure.event_id, "Operator alert email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_disabled_without_recipient() {
        let config = EmailConfig {
            resend_api_key: Some("re_123".to_string()),
            ..EmailConfig::default()
        };
        assert!(BillingEmailService::from_config(reqwest::Client::new(), &config).is_none());
    }

    #[tokio::test]
    async fn test_sends_to_resend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_123")
            .match_body(mockito::Matcher::Regex("ops@shop.test".to_string()))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let config = EmailConfig {
            resend_api_key: Some("re_123".to_string()),
            operator_email: Some("ops@shop.test".to_string()),
            api_base_url: server.url(),
            ..EmailConfig::default()
        };
        let service = BillingEmailService::from_config(reqwest::Client::new(), &config).unwrap();
        service
            .send_handler_failure(&HandlerFailure {
                event_id: "evt_9".to_string(),
                event_type: "checkout.session.completed".to_string(),
                error_kind: ErrorKind::BusinessRule,
                error_message: "Not found: intake".to_string(),
                retryable: false,
            })
            .await
            .unwrap();
        mock.assert_async().await;
    }
}

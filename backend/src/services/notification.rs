//! Outbound alert notifications
//!
//! Alerts are pushed to a Slack-compatible incoming webhook. Delivery is
//! best effort: a failed push is reported to the caller but never changes
//! the alerts that were computed.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use shared::{Alert, AlertThresholds, StockFilter};

use super::ReportingService;
use crate::config::{AlertsConfig, NotificationsConfig};
use crate::error::{AppError, AppResult};

// ============================================================================
// Payload
// ============================================================================

/// Incoming-webhook message
#[derive(Debug, Clone, Serialize)]
pub struct WebhookMessage {
    /// Plain text fallback
    pub text: String,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { text: Text },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Text {
    Mrkdwn { text: String },
}

impl WebhookMessage {
    /// Message listing every alert for one product
    pub fn for_alerts(product_id: Option<Uuid>, alerts: &[Alert]) -> Self {
        let title = format!(":rotating_light: *Inventory Alerts* ({})", alerts.len());
        let mut lines = vec![title.clone()];
        if let Some(product_id) = product_id {
            lines.push(format!("Product `{}`", product_id));
        }
        lines.extend(
            alerts
                .iter()
                .map(|a| format!("- `{}`: {}", a.kind.as_str(), a.message)),
        );

        Self {
            text: title,
            blocks: vec![Block::Section {
                text: Text::Mrkdwn {
                    text: lines.join("\n"),
                },
            }],
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Webhook client for alert pushes
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("webhook_url", &"[REDACTED]")
            .finish()
    }
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let webhook_url = webhook_url.into();
        if webhook_url.trim().is_empty() {
            return Err(AppError::Configuration("webhook url is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("webhook client: {}", e)))?;

        Ok(Self {
            client,
            webhook_url,
        })
    }

    /// Notifier for the configured webhook, `None` when notifications are off
    pub fn from_config(config: &NotificationsConfig) -> AppResult<Option<Self>> {
        match config.webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(Some(Self::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?)),
            _ => Ok(None),
        }
    }

    /// Push alerts to the webhook
    pub async fn send_alerts(&self, product_id: Option<Uuid>, alerts: &[Alert]) -> AppResult<()> {
        if alerts.is_empty() {
            return Err(AppError::validation("alerts", "No alerts to send"));
        }

        let message = WebhookMessage::for_alerts(product_id, alerts);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        tracing::info!(count = alerts.len(), "Alerts pushed to webhook");
        Ok(())
    }
}

// ============================================================================
// Background watcher
// ============================================================================

/// Periodic alert check over a fixed list of products
pub struct AlertWatcher {
    reporting: ReportingService,
    notifier: WebhookNotifier,
    thresholds: AlertThresholds,
    products: Vec<Uuid>,
    interval: Duration,
}

impl AlertWatcher {
    pub fn new(reporting: ReportingService, notifier: WebhookNotifier, config: &AlertsConfig) -> Self {
        Self {
            reporting,
            notifier,
            thresholds: config.thresholds(),
            products: config.watch_products.clone(),
            interval: Duration::from_secs(config.check_interval_secs.max(1)),
        }
    }

    /// Run forever, checking on every tick
    pub async fn run(self) {
        tracing::info!(
            products = self.products.len(),
            interval_secs = self.interval.as_secs(),
            "Alert watcher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            let pushed = self.check_once().await;
            if pushed > 0 {
                tracing::debug!(pushed, "Alert check finished");
            }
        }
    }

    /// One pass over every watched product; returns how many products had
    /// alerts pushed. Failures are logged and skipped.
    pub async fn check_once(&self) -> usize {
        let mut pushed = 0;
        for product_id in &self.products {
            let filter = StockFilter::for_product(*product_id);
            let alerts = match self.reporting.check_alerts(filter, &self.thresholds).await {
                Ok(alerts) => alerts,
                Err(e) => {
                    tracing::error!(product_id = %product_id, error = %e, "Alert check failed");
                    continue;
                }
            };
            if alerts.is_empty() {
                continue;
            }
            match self.notifier.send_alerts(Some(*product_id), &alerts).await {
                Ok(()) => pushed += 1,
                Err(e) => {
                    tracing::warn!(product_id = %product_id, error = %e, "Alert push failed")
                }
            }
        }
        pushed
    }
}

//! HTTP handlers for stock alerts

use axum::{
    extract::{Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{Alert, AlertThresholds, StockFilter};
use uuid::Uuid;

use crate::config::AlertsConfig;
use crate::error::{AppError, AppResult};
use crate::services::ReportingService;
use crate::AppState;

/// Alert check parameters; thresholds fall back to configuration
#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub product_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub min_stock: Option<Decimal>,
    pub min_coverage_days: Option<u32>,
    pub lookback_days: Option<u32>,
}

impl AlertQuery {
    fn filter(&self) -> StockFilter {
        StockFilter::for_product(self.product_id)
            .with_batch(self.batch_id)
            .with_location(self.location_id)
    }

    fn thresholds(&self, defaults: &AlertsConfig) -> AlertThresholds {
        AlertThresholds {
            min_stock: self.min_stock.unwrap_or(defaults.min_stock),
            min_coverage_days: self.min_coverage_days.unwrap_or(defaults.min_coverage_days),
            lookback_days: self.lookback_days.unwrap_or(defaults.lookback_days),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub sent: bool,
    pub alerts: Vec<Alert>,
    /// Delivery failure, when the webhook could not be reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Check stock alerts for a product
pub async fn check_stock_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> AppResult<Json<Vec<Alert>>> {
    let thresholds = query.thresholds(&state.config.alerts);
    let service = ReportingService::new(state.store);
    let alerts = service.check_alerts(query.filter(), &thresholds).await?;
    Ok(Json(alerts))
}

/// Check stock alerts and push them to the configured webhook.
///
/// Alerts are returned even when delivery fails; `sent` reports whether the
/// webhook accepted them.
pub async fn notify_stock_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> AppResult<Json<NotifyResponse>> {
    let thresholds = query.thresholds(&state.config.alerts);
    let service = ReportingService::new(state.store);
    let alerts = service.check_alerts(query.filter(), &thresholds).await?;

    if alerts.is_empty() {
        return Ok(Json(NotifyResponse {
            sent: false,
            alerts,
            error: None,
        }));
    }

    let notifier = state
        .notifier
        .ok_or_else(|| AppError::validation("webhook", "No notification webhook is configured"))?;

    match notifier.send_alerts(Some(query.product_id), &alerts).await {
        Ok(()) => Ok(Json(NotifyResponse {
            sent: true,
            alerts,
            error: None,
        })),
        Err(e) => {
            tracing::warn!(product_id = %query.product_id, error = %e, "Alert delivery failed");
            Ok(Json(NotifyResponse {
                sent: false,
                alerts,
                error: Some(e.to_string()),
            }))
        }
    }
}

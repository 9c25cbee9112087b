//! Reporting tests
//!
//! Tests for stock reports including:
//! - Physical, reserved, available and consumed sums
//! - History replay per location and overall
//! - Depletion forecast
//! - Threshold alerts

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{
    AlertKind, AlertSeverity, AlertThresholds, CreateMovementRequest, CreateReservationRequest,
    StockFilter, TimeWindow,
};
use stockroom::services::{MovementService, ReportingService, ReservationService};
use stockroom::store::{MemoryStore, Store};
use stockroom::AppError;

// Helper to create Decimal from string
fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    store: Arc<dyn Store>,
    product: Uuid,
    batch: Uuid,
    site_a: Uuid,
    site_b: Uuid,
    now: DateTime<Utc>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::with_default_catalog()),
            product: Uuid::new_v4(),
            batch: Uuid::new_v4(),
            site_a: Uuid::new_v4(),
            site_b: Uuid::new_v4(),
            now: Utc::now(),
        }
    }

    fn reporting(&self) -> ReportingService {
        ReportingService::new(self.store.clone())
    }

    fn filter(&self) -> StockFilter {
        StockFilter::for_product(self.product)
    }

    /// Record a movement `days_ago` days before the fixture's clock
    async fn movement(
        &self,
        code: &str,
        movement_type: &str,
        from: Option<Uuid>,
        to: Option<Uuid>,
        quantity: &str,
        days_ago: i64,
    ) {
        let request = CreateMovementRequest {
            code: code.to_string(),
            movement_type: movement_type.to_string(),
            product_id: self.product,
            batch_id: self.batch,
            from_location_id: from,
            to_location_id: to,
            reason: "stock_count".to_string(),
            requested_by: None,
            executed_by: None,
            quantity: dec(quantity),
            occurred_at: Some(self.now - Duration::days(days_ago)),
        };
        MovementService::new(self.store.clone())
            .record(request, None)
            .await
            .unwrap();
    }

    /// In 100 at A, transfer 40 to B, out 10 from B
    async fn seed_flows(&self) {
        self.movement("IN-1", "inbound", None, Some(self.site_a), "100", 3).await;
        self.movement("TR-1", "transfer", Some(self.site_a), Some(self.site_b), "40", 2).await;
        self.movement("OUT-1", "outbound", Some(self.site_b), None, "10", 1).await;
    }

    fn thresholds(&self, min_stock: &str, min_coverage_days: u32) -> AlertThresholds {
        AlertThresholds {
            min_stock: dec(min_stock),
            min_coverage_days,
            lookback_days: 30,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[tokio::test]
    async fn test_summary_sums_every_component() {
        let fx = Fixture::new();
        fx.seed_flows().await;
        ReservationService::new(fx.store.clone())
            .create(
                CreateReservationRequest {
                    product_id: fx.product,
                    batch_id: fx.batch,
                    location_id: fx.site_a,
                    quantity: dec("20"),
                    reserved_until: None,
                },
                None,
            )
            .await
            .unwrap();

        let summary = fx.reporting().stock_summary(fx.filter()).await.unwrap();

        assert_eq!(summary.physical, dec("90"));
        assert_eq!(summary.reserved, dec("20"));
        assert_eq!(summary.available, dec("70"));
        assert_eq!(summary.consumed, dec("50"));
    }

    #[tokio::test]
    async fn test_summary_for_one_location() {
        let fx = Fixture::new();
        fx.seed_flows().await;

        let summary = fx
            .reporting()
            .stock_summary(fx.filter().with_location(Some(fx.site_b)))
            .await
            .unwrap();

        assert_eq!(summary.physical, dec("30"));
        assert_eq!(summary.reserved, Decimal::ZERO);
        assert_eq!(summary.consumed, dec("10"));
    }

    #[tokio::test]
    async fn test_history_at_one_location() {
        let fx = Fixture::new();
        fx.seed_flows().await;

        let history = fx
            .reporting()
            .stock_history(fx.product, None, Some(fx.site_a), TimeWindow::default())
            .await
            .unwrap();

        let balances: Vec<Decimal> = history.points().map(|p| p.balance).collect();
        assert_eq!(balances, vec![dec("100"), dec("60")]);
    }

    #[tokio::test]
    async fn test_history_across_locations() {
        let fx = Fixture::new();
        fx.seed_flows().await;

        let history = fx
            .reporting()
            .stock_history(fx.product, Some(fx.batch), None, TimeWindow::default())
            .await
            .unwrap();

        let balances: Vec<Decimal> = history.points().map(|p| p.balance).collect();
        assert_eq!(balances, vec![dec("100"), dec("100"), dec("90")]);
        // Restartable
        assert_eq!(history.points().count(), 3);
    }

    #[tokio::test]
    async fn test_history_window_bounds() {
        let fx = Fixture::new();
        fx.seed_flows().await;
        let reporting = fx.reporting();

        let recent = reporting
            .stock_history(
                fx.product,
                None,
                None,
                TimeWindow::new(Some(fx.now - Duration::hours(36)), None),
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);

        let err = reporting
            .stock_history(
                fx.product,
                None,
                None,
                TimeWindow::new(Some(fx.now), Some(fx.now - Duration::days(1))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { ref field, .. } if field == "end"));
    }

    #[tokio::test]
    async fn test_forecast_from_recent_consumption() {
        let fx = Fixture::new();
        fx.movement("IN-1", "inbound", None, Some(fx.site_a), "130", 40).await;
        fx.movement("OUT-1", "outbound", Some(fx.site_a), None, "30", 10).await;

        let forecast = fx
            .reporting()
            .stock_forecast_at(fx.filter(), 30, fx.now)
            .await
            .unwrap();

        assert_eq!(forecast.stock, dec("100"));
        assert_eq!(forecast.avg_daily_consumption, dec("1"));
        assert_eq!(forecast.coverage_days, Some(dec("100")));
        assert_eq!(forecast.depletion_date, Some(fx.now + Duration::days(100)));
    }

    #[tokio::test]
    async fn test_forecast_ignores_old_consumption() {
        let fx = Fixture::new();
        fx.movement("IN-1", "inbound", None, Some(fx.site_a), "130", 90).await;
        fx.movement("OUT-1", "outbound", Some(fx.site_a), None, "30", 60).await;

        let forecast = fx
            .reporting()
            .stock_forecast_at(fx.filter(), 30, fx.now)
            .await
            .unwrap();

        assert_eq!(forecast.avg_daily_consumption, Decimal::ZERO);
        assert_eq!(forecast.coverage_days, None);
        assert_eq!(forecast.depletion_date, None);
    }

    #[tokio::test]
    async fn test_forecast_needs_stock() {
        let fx = Fixture::new();
        fx.movement("IN-1", "inbound", None, Some(fx.site_a), "10", 5).await;
        fx.movement("OUT-1", "outbound", Some(fx.site_a), None, "10", 1).await;

        let err = fx
            .reporting()
            .stock_forecast_at(fx.filter(), 30, fx.now)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NoStockForForecast));
    }

    #[tokio::test]
    async fn test_zero_lookback_rejected() {
        let fx = Fixture::new();
        fx.movement("IN-1", "inbound", None, Some(fx.site_a), "10", 5).await;
        let reporting = fx.reporting();

        let forecast = reporting.stock_forecast(fx.filter(), 0).await.unwrap_err();
        let mut thresholds = fx.thresholds("1", 1);
        thresholds.lookback_days = 0;
        let alerts = reporting.check_alerts(fx.filter(), &thresholds).await.unwrap_err();

        assert!(matches!(forecast, AppError::Validation { .. }));
        assert!(matches!(alerts, AppError::Validation { .. }));
    }

    /// Stock 5 after consuming 15 in 30 days: low stock and low coverage
    #[tokio::test]
    async fn test_alerts_for_low_stock_and_coverage() {
        let fx = Fixture::new();
        fx.movement("IN-1", "inbound", None, Some(fx.site_a), "20", 40).await;
        fx.movement("OUT-1", "outbound", Some(fx.site_a), None, "15", 5).await;

        let alerts = fx
            .reporting()
            .check_alerts_at(fx.filter(), &fx.thresholds("10", 14), fx.now)
            .await
            .unwrap();

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, AlertKind::LowStock);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[1].kind, AlertKind::LowCoverage);
        assert!(alerts[1].message.ends_with("below minimum 14"));
    }

    #[tokio::test]
    async fn test_empty_stock_is_critical() {
        let fx = Fixture::new();
        fx.movement("IN-1", "inbound", None, Some(fx.site_a), "10", 40).await;
        fx.movement("OUT-1", "outbound", Some(fx.site_a), None, "10", 50).await;

        let alerts = fx
            .reporting()
            .check_alerts_at(fx.filter(), &fx.thresholds("1", 0), fx.now)
            .await
            .unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowStock);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_healthy_stock_has_no_alerts() {
        let fx = Fixture::new();
        fx.movement("IN-1", "inbound", None, Some(fx.site_a), "500", 40).await;
        fx.movement("OUT-1", "outbound", Some(fx.site_a), None, "30", 5).await;

        let alerts = fx
            .reporting()
            .check_alerts_at(fx.filter(), &fx.thresholds("10", 14), fx.now)
            .await
            .unwrap();

        assert!(alerts.is_empty());
    }
}

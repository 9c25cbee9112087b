//! Stock reports, depletion forecast and threshold alerts
//!
//! Read-only. Each call reads its sums in one unit of work and discards it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{
    evaluate_alerts, validate_lookback_days, Alert, AlertThresholds, Forecast, StockFilter,
    StockHistory, StockSummary, TimeWindow,
};

use crate::error::{AppError, AppResult};
use crate::store::{Store, UnitOfWork};

/// Reporting service
#[derive(Clone)]
pub struct ReportingService {
    store: Arc<dyn Store>,
}

impl ReportingService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Physical, reserved, available and consumed quantities under the filter
    pub async fn stock_summary(&self, filter: StockFilter) -> AppResult<StockSummary> {
        let mut uow = self.store.begin().await?;
        let result = summary_in(uow.as_mut(), &filter).await;
        discard(uow).await;
        result
    }

    /// Running balance of one product replayed from its movements
    pub async fn stock_history(
        &self,
        product_id: Uuid,
        batch_id: Option<Uuid>,
        location_id: Option<Uuid>,
        window: TimeWindow,
    ) -> AppResult<StockHistory> {
        if let (Some(start), Some(end)) = (window.start, window.end) {
            if end < start {
                return Err(AppError::validation("end", "end must not be before start"));
            }
        }

        let filter = StockFilter::for_product(product_id)
            .with_batch(batch_id)
            .with_location(location_id);
        let mut uow = self.store.begin().await?;
        let flows = uow.movement_flows(&filter, &window).await;
        discard(uow).await;
        let flows = flows?;

        Ok(StockHistory::new(flows, location_id))
    }

    /// Depletion forecast from consumption over the last `lookback_days`
    pub async fn stock_forecast(
        &self,
        filter: StockFilter,
        lookback_days: u32,
    ) -> AppResult<Forecast> {
        self.stock_forecast_at(filter, lookback_days, Utc::now()).await
    }

    pub async fn stock_forecast_at(
        &self,
        filter: StockFilter,
        lookback_days: u32,
        now: DateTime<Utc>,
    ) -> AppResult<Forecast> {
        validate_lookback_days(lookback_days)
            .map_err(|msg| AppError::validation("lookback_days", msg))?;

        let (stock, consumed) = self.stock_and_consumption(filter, lookback_days, now).await?;
        Ok(Forecast::project(stock, consumed, lookback_days, now)?)
    }

    /// Threshold alerts for the filter. Never writes.
    pub async fn check_alerts(
        &self,
        filter: StockFilter,
        thresholds: &AlertThresholds,
    ) -> AppResult<Vec<Alert>> {
        self.check_alerts_at(filter, thresholds, Utc::now()).await
    }

    pub async fn check_alerts_at(
        &self,
        filter: StockFilter,
        thresholds: &AlertThresholds,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Alert>> {
        validate_lookback_days(thresholds.lookback_days)
            .map_err(|msg| AppError::validation("lookback_days", msg))?;

        let (stock, consumed) = self
            .stock_and_consumption(filter, thresholds.lookback_days, now)
            .await?;
        Ok(evaluate_alerts(stock, consumed, thresholds))
    }

    async fn stock_and_consumption(
        &self,
        filter: StockFilter,
        lookback_days: u32,
        now: DateTime<Utc>,
    ) -> AppResult<(Decimal, Decimal)> {
        let since = now - Duration::days(i64::from(lookback_days));
        let mut uow = self.store.begin().await?;
        let result = consumption_in(uow.as_mut(), &filter, since).await;
        discard(uow).await;
        result
    }
}

async fn summary_in(uow: &mut dyn UnitOfWork, filter: &StockFilter) -> AppResult<StockSummary> {
    let physical = uow.physical_stock(filter).await?;
    let reserved = uow.reserved_stock(filter).await?;
    let consumed = uow.consumed_stock(filter, None).await?;
    Ok(StockSummary::new(physical, reserved, consumed))
}

async fn consumption_in(
    uow: &mut dyn UnitOfWork,
    filter: &StockFilter,
    since: DateTime<Utc>,
) -> AppResult<(Decimal, Decimal)> {
    let stock = uow.physical_stock(filter).await?;
    let consumed = uow.consumed_stock(filter, Some(since)).await?;
    Ok((stock, consumed))
}

/// Reports never write; end the unit without committing
async fn discard(uow: Box<dyn UnitOfWork>) {
    if let Err(err) = uow.rollback().await {
        tracing::warn!(error = %err, "Rollback after report failed");
    }
}

//! HTTP handlers for stock reports

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::{Forecast, StockFilter, StockPoint, StockSummary, TimeWindow};
use uuid::Uuid;

use crate::error::AppResult;
use crate::services::ReportingService;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub product_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ForecastQuery {
    pub product_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub lookback_days: Option<u32>,
}

/// Stock summary under the filter
pub async fn stock_summary(
    State(state): State<AppState>,
    Query(filter): Query<StockFilter>,
) -> AppResult<Json<StockSummary>> {
    let service = ReportingService::new(state.store);
    let summary = service.stock_summary(filter).await?;
    Ok(Json(summary))
}

/// Replayed balance history of one product
pub async fn stock_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<StockPoint>>> {
    let service = ReportingService::new(state.store);
    let history = service
        .stock_history(
            query.product_id,
            query.batch_id,
            query.location_id,
            TimeWindow::new(query.start, query.end),
        )
        .await?;
    Ok(Json(history.points().collect()))
}

/// Depletion forecast of one product
pub async fn stock_forecast(
    State(state): State<AppState>,
    Query(query): Query<ForecastQuery>,
) -> AppResult<Json<Forecast>> {
    let lookback_days = query
        .lookback_days
        .unwrap_or(state.config.alerts.lookback_days);
    let filter = StockFilter::for_product(query.product_id)
        .with_batch(query.batch_id)
        .with_location(query.location_id);

    let service = ReportingService::new(state.store);
    let forecast = service.stock_forecast(filter, lookback_days).await?;
    Ok(Json(forecast))
}

//! HTTP handlers for ledger reads

use axum::{
    extract::{Query, State},
    Json,
};
use shared::{InventoryRecord, StockFilter};

use crate::error::AppResult;
use crate::services::LedgerService;
use crate::AppState;

/// List ledger rows
pub async fn list_inventory(
    State(state): State<AppState>,
    Query(filter): Query<StockFilter>,
) -> AppResult<Json<Vec<InventoryRecord>>> {
    let service = LedgerService::new(state.store);
    let records = service.list(&filter).await?;
    Ok(Json(records))
}

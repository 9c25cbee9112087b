//! HTTP handlers for movements

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use shared::{CreateMovementRequest, Movement, StockFilter};

use crate::error::AppResult;
use crate::middleware::CurrentUser;
use crate::services::MovementService;
use crate::AppState;

/// Record a movement
pub async fn create_movement(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(input): Json<CreateMovementRequest>,
) -> AppResult<(StatusCode, Json<Movement>)> {
    let service = MovementService::new(state.store);
    let movement = service.record(input, current_user.id()).await?;
    Ok((StatusCode::CREATED, Json(movement)))
}

/// List movements touching the filter
pub async fn list_movements(
    State(state): State<AppState>,
    Query(filter): Query<StockFilter>,
) -> AppResult<Json<Vec<Movement>>> {
    let service = MovementService::new(state.store);
    let movements = service.list(&filter).await?;
    Ok(Json(movements))
}

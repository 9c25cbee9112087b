//! HTTP handlers for reservations

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use shared::{CreateReservationRequest, Reservation, ReservationStatus};
use uuid::Uuid;

use crate::error::AppResult;
use crate::middleware::CurrentUser;
use crate::services::reservation::{ExpirySweep, Fulfillment};
use crate::services::ReservationService;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ReservationListQuery {
    pub status: Option<ReservationStatus>,
}

/// Create a reservation
pub async fn create_reservation(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(input): Json<CreateReservationRequest>,
) -> AppResult<(StatusCode, Json<Reservation>)> {
    let service = ReservationService::new(state.store);
    let reservation = service.create(input, current_user.id()).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

/// List reservations, optionally by status
pub async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<ReservationListQuery>,
) -> AppResult<Json<Vec<Reservation>>> {
    let service = ReservationService::new(state.store);
    let reservations = service.list(query.status).await?;
    Ok(Json(reservations))
}

/// Get a reservation by ID
pub async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let service = ReservationService::new(state.store);
    let reservation = service.get(id).await?;
    Ok(Json(reservation))
}

/// Release a reservation
pub async fn release_reservation(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let service = ReservationService::new(state.store);
    let reservation = service.release(id, current_user.id()).await?;
    Ok(Json(reservation))
}

/// Fulfill a reservation with an outbound movement
pub async fn fulfill_reservation(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Fulfillment>> {
    let service = ReservationService::new(state.store);
    let fulfillment = service.fulfill_with_movement(id, current_user.id()).await?;
    Ok(Json(fulfillment))
}

/// Expire overdue reservations
pub async fn expire_reservations(State(state): State<AppState>) -> AppResult<Json<ExpirySweep>> {
    let service = ReservationService::new(state.store);
    let sweep = service.expire_reservations().await?;
    Ok(Json(sweep))
}

//! Reservation engine
//!
//! Reservations earmark ledger quantity without moving it. Capacity is checked
//! against `ledger - active reservations` with the ledger row locked, so two
//! reservations on one triplet cannot both pass the check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use shared::{
    reservation_capacity, validate_reservation_window, CreateReservationRequest, Movement,
    MovementReason, NewAuditEntry, NewMovement, NewReservation, Reservation, ReservationStatus,
    Transition, Triplet,
};

use super::audit::entity;
use super::{finish, movement};
use crate::error::{AppError, AppResult};
use crate::store::{Store, UnitOfWork};

/// Movement type used to take fulfilled stock out
pub const FULFILLMENT_MOVEMENT_TYPE: &str = "outbound";

/// Preferred reason for fulfillment movements
pub const FULFILLMENT_REASON: &str = "reservation_fulfillment";

/// Result of fulfilling a reservation
#[derive(Debug, Clone, Serialize)]
pub struct Fulfillment {
    pub reservation: Reservation,
    pub movement: Movement,
}

/// Result of an expiry sweep
#[derive(Debug, Clone, Serialize)]
pub struct ExpirySweep {
    pub expired: usize,
}

/// Reservation service
#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn Store>,
}

impl ReservationService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Check that `quantity` fits the triplet's free capacity.
    ///
    /// Returns the capacity left after such a reservation. Writes nothing.
    pub async fn validate_reservation(&self, key: Triplet, quantity: Decimal) -> AppResult<Decimal> {
        let mut uow = self.store.begin().await?;
        let result = check_capacity(uow.as_mut(), &key, quantity).await;
        // Read-only: always discard
        if let Err(err) = uow.rollback().await {
            tracing::warn!(error = %err, "Rollback after capacity check failed");
        }
        result
    }

    /// Create an active reservation
    pub async fn create(
        &self,
        request: CreateReservationRequest,
        performed_by: Option<Uuid>,
    ) -> AppResult<Reservation> {
        request.validate()?;

        let reserved_from = Utc::now();
        validate_reservation_window(reserved_from, request.reserved_until)
            .map_err(|msg| AppError::validation("reserved_until", msg))?;

        let new = NewReservation {
            key: request.triplet(),
            quantity: request.quantity,
            reserved_from,
            reserved_until: request.reserved_until,
        };

        let mut uow = self.store.begin().await?;
        let result = create_in(uow.as_mut(), &new, performed_by).await;
        finish(uow, result).await
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Reservation> {
        let mut uow = self.store.begin().await?;
        let result = uow.get_reservation(id).await;
        finish(uow, result)
            .await?
            .ok_or_else(|| AppError::NotFound("Reservation".to_string()))
    }

    pub async fn list(&self, status: Option<ReservationStatus>) -> AppResult<Vec<Reservation>> {
        let mut uow = self.store.begin().await?;
        let result = uow.list_reservations(status).await;
        finish(uow, result).await
    }

    /// Release an active reservation. Releasing a finished one is a no-op.
    pub async fn release(&self, id: Uuid, performed_by: Option<Uuid>) -> AppResult<Reservation> {
        let mut uow = self.store.begin().await?;
        let result = release_in(uow.as_mut(), id, performed_by).await;
        finish(uow, result).await
    }

    /// Expire every active reservation whose window has passed
    pub async fn expire_reservations(&self) -> AppResult<ExpirySweep> {
        self.expire_reservations_at(Utc::now()).await
    }

    pub async fn expire_reservations_at(&self, now: DateTime<Utc>) -> AppResult<ExpirySweep> {
        let mut uow = self.store.begin().await?;
        let result = expire_in(uow.as_mut(), now).await;
        let expired = finish(uow, result).await?;

        if expired > 0 {
            tracing::info!(count = expired, "Expired overdue reservations");
        }
        Ok(ExpirySweep { expired })
    }

    /// Fulfill an active reservation by recording an outbound movement for it.
    ///
    /// The movement, the ledger decrease, the status change and the audit
    /// entry commit together or not at all.
    pub async fn fulfill_with_movement(
        &self,
        id: Uuid,
        executed_by: Option<Uuid>,
    ) -> AppResult<Fulfillment> {
        let mut uow = self.store.begin().await?;
        let result = fulfill_in(uow.as_mut(), id, executed_by).await;
        finish(uow, result).await
    }
}

async fn check_capacity(
    uow: &mut dyn UnitOfWork,
    key: &Triplet,
    quantity: Decimal,
) -> AppResult<Decimal> {
    let physical = uow
        .lock_inventory(key)
        .await?
        .map(|r| r.quantity)
        .unwrap_or(Decimal::ZERO);
    let reserved = uow.active_reserved_quantity(key).await?;
    Ok(reservation_capacity(physical, reserved, quantity)?)
}

async fn create_in(
    uow: &mut dyn UnitOfWork,
    new: &NewReservation,
    performed_by: Option<Uuid>,
) -> AppResult<Reservation> {
    let remaining = check_capacity(uow, &new.key, new.quantity).await?;
    let reservation = uow.insert_reservation(new).await?;

    let entry = NewAuditEntry::new(entity::RESERVATION, reservation.id, "create")
        .with_changes(json!({
            "quantity": reservation.quantity,
            "reserved_until": reservation.reserved_until,
            "remaining_available": remaining,
        }))
        .performed_by(performed_by);
    uow.append_audit(&entry).await?;

    tracing::info!(
        reservation_id = %reservation.id,
        quantity = %reservation.quantity,
        remaining = %remaining,
        "Reservation created"
    );
    Ok(reservation)
}

async fn release_in(
    uow: &mut dyn UnitOfWork,
    id: Uuid,
    performed_by: Option<Uuid>,
) -> AppResult<Reservation> {
    let current = uow
        .lock_reservation(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Reservation".to_string()))?;

    match current.status.transition(ReservationStatus::Released) {
        Transition::Unchanged(status) => {
            tracing::debug!(reservation_id = %id, status = status.as_str(), "Release is a no-op");
            Ok(current)
        }
        Transition::Applied(target) => {
            let released = uow
                .transition_reservation(id, target, Utc::now())
                .await?
                .ok_or_else(|| {
                    AppError::InvalidStateTransition(format!(
                        "Reservation {} is no longer active",
                        id
                    ))
                })?;
            let entry = NewAuditEntry::new(entity::RESERVATION, id, "release")
                .with_changes(json!({ "status": { "before": "active", "after": target.as_str() } }))
                .performed_by(performed_by);
            uow.append_audit(&entry).await?;
            Ok(released)
        }
    }
}

async fn expire_in(uow: &mut dyn UnitOfWork, now: DateTime<Utc>) -> AppResult<usize> {
    let expired = uow.expire_overdue_reservations(now).await?;
    for id in &expired {
        let entry = NewAuditEntry::new(entity::RESERVATION, *id, "expire")
            .with_changes(json!({ "status": { "before": "active", "after": "expired" } }));
        uow.append_audit(&entry).await?;
    }
    Ok(expired.len())
}

/// Reason for a fulfillment movement: the dedicated one, else any in the catalog
async fn fulfillment_reason(uow: &mut dyn UnitOfWork) -> AppResult<MovementReason> {
    if let Some(reason) = uow.find_movement_reason(FULFILLMENT_REASON).await? {
        return Ok(reason);
    }
    uow.any_movement_reason()
        .await?
        .ok_or_else(|| AppError::Configuration("no movement reason is configured".to_string()))
}

async fn fulfill_in(
    uow: &mut dyn UnitOfWork,
    id: Uuid,
    executed_by: Option<Uuid>,
) -> AppResult<Fulfillment> {
    let reservation = uow
        .lock_reservation(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Reservation".to_string()))?;

    if reservation.status != ReservationStatus::Active {
        return Err(AppError::InvalidStateTransition(format!(
            "Reservation is {}, only active reservations can be fulfilled",
            reservation.status.as_str()
        )));
    }

    let movement_type = uow
        .find_movement_type(FULFILLMENT_MOVEMENT_TYPE)
        .await?
        .ok_or_else(|| {
            AppError::Configuration(format!(
                "movement type '{}' is missing from the catalog",
                FULFILLMENT_MOVEMENT_TYPE
            ))
        })?;
    let reason = fulfillment_reason(uow).await?;

    let new_movement = NewMovement {
        code: format!("RES-{}", reservation.id.simple()),
        movement_type,
        reason,
        product_id: reservation.product_id,
        batch_id: reservation.batch_id,
        from_location_id: Some(reservation.location_id),
        to_location_id: None,
        requested_by: None,
        executed_by,
        quantity: reservation.quantity,
        occurred_at: Utc::now(),
    };
    let movement = movement::apply_movement(uow, &new_movement, executed_by).await?;

    let fulfilled = uow
        .transition_reservation(id, ReservationStatus::Fulfilled, Utc::now())
        .await?
        .ok_or_else(|| {
            AppError::InvalidStateTransition(format!("Reservation {} is no longer active", id))
        })?;

    let entry = NewAuditEntry::new(entity::RESERVATION, id, "fulfill")
        .with_changes(json!({
            "status": { "before": "active", "after": "fulfilled" },
            "movement_id": movement.id,
            "movement_code": movement.code,
            "quantity": movement.quantity,
        }))
        .performed_by(executed_by);
    uow.append_audit(&entry).await?;

    tracing::info!(
        reservation_id = %id,
        movement_id = %movement.id,
        quantity = %movement.quantity,
        "Reservation fulfilled"
    );

    Ok(Fulfillment {
        reservation: fulfilled,
        movement,
    })
}

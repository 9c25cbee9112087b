//! Movement recording
//!
//! A movement is resolved against the catalog, checked for a unique code and
//! then split into ledger legs. All legs run in one unit of work: a transfer
//! whose destination fails leaves the source untouched.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use shared::{
    validate_movement_code, CreateMovementRequest, Movement, MovementKind, NewAuditEntry,
    NewMovement, StockFilter, Triplet,
};

use super::audit::entity;
use super::{finish, ledger};
use crate::error::{AppError, AppResult};
use crate::store::{Store, UnitOfWork};

/// Movement service
#[derive(Clone)]
pub struct MovementService {
    store: Arc<dyn Store>,
}

impl MovementService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a movement and apply its ledger legs
    pub async fn record(
        &self,
        request: CreateMovementRequest,
        performed_by: Option<Uuid>,
    ) -> AppResult<Movement> {
        request.validate()?;
        validate_movement_code(&request.code).map_err(|msg| AppError::validation("code", msg))?;

        let mut uow = self.store.begin().await?;
        let result = record_request(uow.as_mut(), request, performed_by).await;
        finish(uow, result).await
    }

    /// Movements touching the filter, oldest first
    pub async fn list(&self, filter: &StockFilter) -> AppResult<Vec<Movement>> {
        let mut uow = self.store.begin().await?;
        let result = uow.list_movements(filter).await;
        finish(uow, result).await
    }
}

async fn record_request(
    uow: &mut dyn UnitOfWork,
    request: CreateMovementRequest,
    performed_by: Option<Uuid>,
) -> AppResult<Movement> {
    let movement_type = uow
        .find_movement_type(&request.movement_type)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Movement type '{}'", request.movement_type)))?;
    let reason = uow
        .find_movement_reason(&request.reason)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Movement reason '{}'", request.reason)))?;

    let movement = NewMovement {
        code: request.code,
        movement_type,
        reason,
        product_id: request.product_id,
        batch_id: request.batch_id,
        from_location_id: request.from_location_id,
        to_location_id: request.to_location_id,
        requested_by: request.requested_by,
        executed_by: request.executed_by,
        quantity: request.quantity,
        occurred_at: request.occurred_at.unwrap_or_else(Utc::now),
    };

    apply_movement(uow, &movement, performed_by).await
}

/// Insert a movement and apply its legs inside the caller's unit of work.
///
/// A duplicate code is rejected before any ledger effect. Shortfalls on an
/// outgoing leg propagate as `InsufficientStock` unchanged.
pub async fn apply_movement(
    uow: &mut dyn UnitOfWork,
    movement: &NewMovement,
    performed_by: Option<Uuid>,
) -> AppResult<Movement> {
    let kind = MovementKind::from_code(&movement.movement_type.code).ok_or_else(|| {
        AppError::validation(
            "movement_type",
            format!(
                "Movement type '{}' is not inbound, outbound, transfer or adjustment",
                movement.movement_type.code
            ),
        )
    })?;
    let legs = kind.legs(movement.from_location_id, movement.to_location_id)?;

    if uow.movement_code_exists(&movement.code).await? {
        return Err(AppError::DuplicateEntry("movement code".to_string()));
    }

    let recorded = uow.insert_movement(movement).await?;

    for leg in &legs {
        let key = Triplet::new(movement.product_id, movement.batch_id, leg.location_id);
        ledger::apply_delta(
            uow,
            &key,
            movement.quantity,
            leg.direction.ledger_direction(),
            performed_by,
        )
        .await?;
    }

    let entry = NewAuditEntry::new(entity::MOVEMENT, recorded.id, "create")
        .with_changes(json!({
            "code": recorded.code,
            "movement_type": recorded.movement_type,
            "reason": recorded.reason,
            "quantity": recorded.quantity,
            "from_location_id": recorded.from_location_id,
            "to_location_id": recorded.to_location_id,
            "legs": legs.iter().map(|l| l.direction.as_str()).collect::<Vec<_>>(),
        }))
        .performed_by(performed_by);
    uow.append_audit(&entry).await?;

    tracing::info!(
        movement_id = %recorded.id,
        code = %recorded.code,
        kind = kind.as_str(),
        quantity = %recorded.quantity,
        "Movement recorded"
    );

    Ok(recorded)
}

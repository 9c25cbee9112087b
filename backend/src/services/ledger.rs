//! Inventory ledger service
//!
//! The ledger holds one quantity per (product, batch, location). Increases are
//! a single upsert; decreases lock the row and write only if it still holds
//! enough, so the quantity never goes below zero.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use shared::{
    next_quantity, InventoryRecord, LedgerAction, LedgerDirection, NewAuditEntry, StockFilter,
    Triplet,
};

use super::audit::entity;
use super::finish;
use crate::error::{AppError, AppResult};
use crate::store::{Store, UnitOfWork};

/// Ledger reads and standalone deltas
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn Store>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply one delta in its own unit of work
    pub async fn apply_delta(
        &self,
        key: Triplet,
        quantity: Decimal,
        direction: LedgerDirection,
        performed_by: Option<Uuid>,
    ) -> AppResult<InventoryRecord> {
        let mut uow = self.store.begin().await?;
        let result = apply_delta(uow.as_mut(), &key, quantity, direction, performed_by).await;
        finish(uow, result).await
    }

    /// Ledger rows under the filter
    pub async fn list(&self, filter: &StockFilter) -> AppResult<Vec<InventoryRecord>> {
        let mut uow = self.store.begin().await?;
        let result = uow.list_inventory(filter).await;
        finish(uow, result).await
    }
}

/// Apply a delta to one triplet inside the caller's unit of work.
///
/// Writes one audit entry (`create`, `increase` or `decrease`) on success.
/// A short decrease fails with `InsufficientStock` and writes nothing.
pub async fn apply_delta(
    uow: &mut dyn UnitOfWork,
    key: &Triplet,
    quantity: Decimal,
    direction: LedgerDirection,
    performed_by: Option<Uuid>,
) -> AppResult<InventoryRecord> {
    if quantity <= Decimal::ZERO {
        return Err(AppError::validation(
            "quantity",
            "Quantity must be greater than zero",
        ));
    }

    let (record, before, action) = match direction {
        LedgerDirection::Increase => {
            let (record, created) = uow.upsert_increase(key, quantity).await?;
            if created {
                (record, None, LedgerAction::Create)
            } else {
                let before = record.quantity - quantity;
                (record, Some(before), LedgerAction::Increase)
            }
        }
        LedgerDirection::Decrease => {
            let current = uow.lock_inventory(key).await?;
            let current_quantity = current.as_ref().map(|r| r.quantity);
            let (_, action) = next_quantity(current_quantity, quantity, direction)?;

            // next_quantity only succeeds on an existing row
            let id = current.map(|r| r.id).ok_or_else(|| {
                AppError::Internal("ledger row vanished during decrease".to_string())
            })?;

            let record = uow.guarded_decrease(id, quantity).await?.ok_or(
                AppError::InsufficientStock {
                    available: current_quantity.unwrap_or(Decimal::ZERO),
                    requested: quantity,
                },
            )?;
            (record, current_quantity, action)
        }
    };

    tracing::debug!(
        inventory_id = %record.id,
        action = action.as_str(),
        quantity = %quantity,
        balance = %record.quantity,
        "Ledger updated"
    );

    let entry = NewAuditEntry::new(entity::INVENTORY, record.id, action.as_str())
        .with_changes(json!({
            "product_id": key.product_id,
            "batch_id": key.batch_id,
            "location_id": key.location_id,
            "delta": quantity,
            "before": before,
            "after": record.quantity,
        }))
        .performed_by(performed_by);
    uow.append_audit(&entry).await?;

    Ok(record)
}

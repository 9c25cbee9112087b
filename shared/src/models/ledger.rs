//! Inventory ledger models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::Triplet;

/// Quantity held for one (product, batch, location) triplet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub location_id: Uuid,
    pub quantity: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryRecord {
    pub fn triplet(&self) -> Triplet {
        Triplet::new(self.product_id, self.batch_id, self.location_id)
    }
}

/// Direction of a ledger delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerDirection {
    Increase,
    Decrease,
}

/// Audit action written for a ledger change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerAction {
    Create,
    Increase,
    Decrease,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAction::Create => "create",
            LedgerAction::Increase => "increase",
            LedgerAction::Decrease => "decrease",
        }
    }
}

/// Requested quantity exceeds what is available
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient stock: available {available}, requested {requested}")]
pub struct StockShortfall {
    pub available: Decimal,
    pub requested: Decimal,
}

/// Quantity left after taking `delta` from `current`, never below zero
pub fn checked_decrease(current: Decimal, delta: Decimal) -> Result<Decimal, StockShortfall> {
    if current < delta {
        return Err(StockShortfall {
            available: current,
            requested: delta,
        });
    }
    Ok(current - delta)
}

/// Next ledger quantity for a delta applied to an existing (or absent) record.
///
/// An absent record behaves as zero for decreases and is created by increases.
pub fn next_quantity(
    current: Option<Decimal>,
    delta: Decimal,
    direction: LedgerDirection,
) -> Result<(Decimal, LedgerAction), StockShortfall> {
    match (current, direction) {
        (None, LedgerDirection::Increase) => Ok((delta, LedgerAction::Create)),
        (Some(q), LedgerDirection::Increase) => Ok((q + delta, LedgerAction::Increase)),
        (None, LedgerDirection::Decrease) => Err(StockShortfall {
            available: Decimal::ZERO,
            requested: delta,
        }),
        (Some(q), LedgerDirection::Decrease) => {
            checked_decrease(q, delta).map(|left| (left, LedgerAction::Decrease))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_on_absent_record_creates_it() {
        let (qty, action) = next_quantity(None, Decimal::from(100), LedgerDirection::Increase).unwrap();
        assert_eq!(qty, Decimal::from(100));
        assert_eq!(action, LedgerAction::Create);
    }

    #[test]
    fn test_decrease_on_absent_record_is_shortfall() {
        let err = next_quantity(None, Decimal::ONE, LedgerDirection::Decrease).unwrap_err();
        assert_eq!(err.available, Decimal::ZERO);
        assert_eq!(err.requested, Decimal::ONE);
    }

    #[test]
    fn test_decrease_to_exactly_zero_is_allowed() {
        let left = checked_decrease(Decimal::from(5), Decimal::from(5)).unwrap();
        assert_eq!(left, Decimal::ZERO);
    }

    #[test]
    fn test_decrease_beyond_current_is_rejected() {
        let err = checked_decrease(Decimal::from(100), Decimal::from(150)).unwrap_err();
        assert_eq!(err.to_string(), "insufficient stock: available 100, requested 150");
    }
}

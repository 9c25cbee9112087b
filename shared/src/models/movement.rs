//! Stock movement models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use super::ledger::LedgerDirection;
use crate::validation::validate_positive_quantity;

/// Kind of movement, resolved from the movement type catalog code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Inbound,
    Outbound,
    Transfer,
    Adjustment,
}

impl MovementKind {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "inbound" => Some(MovementKind::Inbound),
            "outbound" => Some(MovementKind::Outbound),
            "transfer" => Some(MovementKind::Transfer),
            "adjustment" => Some(MovementKind::Adjustment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Inbound => "inbound",
            MovementKind::Outbound => "outbound",
            MovementKind::Transfer => "transfer",
            MovementKind::Adjustment => "adjustment",
        }
    }

    /// Ledger legs a movement of this kind produces, in application order.
    ///
    /// Transfers always take stock out of the source before crediting the
    /// destination, so a short source fails before anything is credited.
    pub fn legs(
        &self,
        from_location_id: Option<Uuid>,
        to_location_id: Option<Uuid>,
    ) -> Result<Vec<LedgerLeg>, MovementLayoutError> {
        match (self, from_location_id, to_location_id) {
            (MovementKind::Inbound, None, Some(to)) => Ok(vec![LedgerLeg::new(to, MovementDirection::In)]),
            (MovementKind::Outbound, Some(from), None) => {
                Ok(vec![LedgerLeg::new(from, MovementDirection::Out)])
            }
            (MovementKind::Transfer, Some(from), Some(to)) if from == to => {
                Err(MovementLayoutError::SameLocation)
            }
            (MovementKind::Transfer, Some(from), Some(to)) => Ok(vec![
                LedgerLeg::new(from, MovementDirection::TransferOut),
                LedgerLeg::new(to, MovementDirection::TransferIn),
            ]),
            (MovementKind::Adjustment, None, Some(to)) => {
                Ok(vec![LedgerLeg::new(to, MovementDirection::In)])
            }
            (MovementKind::Adjustment, Some(from), None) => {
                Ok(vec![LedgerLeg::new(from, MovementDirection::Out)])
            }
            (_, None, None) => Err(MovementLayoutError::NoLocation),
            (kind, _, _) => Err(MovementLayoutError::Mismatch(kind.as_str())),
        }
    }
}

/// Per-location ledger direction of a movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementDirection {
    In,
    Out,
    TransferIn,
    TransferOut,
}

impl MovementDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementDirection::In => "in",
            MovementDirection::Out => "out",
            MovementDirection::TransferIn => "transfer_in",
            MovementDirection::TransferOut => "transfer_out",
        }
    }

    pub fn ledger_direction(&self) -> LedgerDirection {
        match self {
            MovementDirection::In | MovementDirection::TransferIn => LedgerDirection::Increase,
            MovementDirection::Out | MovementDirection::TransferOut => LedgerDirection::Decrease,
        }
    }
}

/// One ledger operation of a movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLeg {
    pub location_id: Uuid,
    pub direction: MovementDirection,
}

impl LedgerLeg {
    pub fn new(location_id: Uuid, direction: MovementDirection) -> Self {
        Self {
            location_id,
            direction,
        }
    }
}

/// Location layout does not fit the movement kind
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MovementLayoutError {
    #[error("movement has no location")]
    NoLocation,
    #[error("transfer source and destination must differ")]
    SameLocation,
    #[error("location layout does not match movement type '{0}'")]
    Mismatch(&'static str),
}

/// Movement type catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementType {
    pub id: Uuid,
    pub code: String,
    pub description: Option<String>,
}

/// Movement reason catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementReason {
    pub id: Uuid,
    pub code: String,
    pub description: Option<String>,
    pub requires_approval: bool,
}

/// A recorded movement. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub id: Uuid,
    pub code: String,
    pub movement_type_id: Uuid,
    pub movement_type: String,
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub from_location_id: Option<Uuid>,
    pub to_location_id: Option<Uuid>,
    pub reason_id: Uuid,
    pub reason: String,
    pub requires_approval: bool,
    pub requested_by: Option<Uuid>,
    pub executed_by: Option<Uuid>,
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Resolved movement ready to be inserted
#[derive(Debug, Clone)]
pub struct NewMovement {
    pub code: String,
    pub movement_type: MovementType,
    pub reason: MovementReason,
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub from_location_id: Option<Uuid>,
    pub to_location_id: Option<Uuid>,
    pub requested_by: Option<Uuid>,
    pub executed_by: Option<Uuid>,
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Input for recording a movement
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateMovementRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    /// Movement type catalog code
    #[validate(length(min = 1))]
    pub movement_type: String,
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub from_location_id: Option<Uuid>,
    pub to_location_id: Option<Uuid>,
    /// Movement reason catalog code
    #[validate(length(min = 1))]
    pub reason: String,
    pub requested_by: Option<Uuid>,
    pub executed_by: Option<Uuid>,
    #[validate(custom = "validate_positive_quantity")]
    pub quantity: Decimal,
    pub occurred_at: Option<DateTime<Utc>>,
}

/// The slice of a movement needed to replay stock history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementFlow {
    pub occurred_at: DateTime<Utc>,
    pub quantity: Decimal,
    pub from_location_id: Option<Uuid>,
    pub to_location_id: Option<Uuid>,
}

impl From<&Movement> for MovementFlow {
    fn from(m: &Movement) -> Self {
        Self {
            occurred_at: m.occurred_at,
            quantity: m.quantity,
            from_location_id: m.from_location_id,
            to_location_id: m.to_location_id,
        }
    }
}

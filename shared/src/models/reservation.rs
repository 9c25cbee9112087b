//! Reservation models and lifecycle

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::ledger::StockShortfall;
use crate::types::Triplet;
use crate::validation::validate_positive_quantity;

/// Reservation status.
///
/// `Active` is the only state that accepts a transition; the other three are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Released,
    Fulfilled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Released => "released",
            ReservationStatus::Fulfilled => "fulfilled",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ReservationStatus::Active),
            "released" => Some(ReservationStatus::Released),
            "fulfilled" => Some(ReservationStatus::Fulfilled),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    /// Outcome of asking this status to move to `target`
    pub fn transition(self, target: ReservationStatus) -> Transition {
        if self == ReservationStatus::Active && target.is_terminal() {
            Transition::Applied(target)
        } else {
            Transition::Unchanged(self)
        }
    }
}

/// Result of a lifecycle call. `Unchanged` is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied(ReservationStatus),
    Unchanged(ReservationStatus),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// An earmark of ledger quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub location_id: Uuid,
    pub quantity: Decimal,
    pub reserved_from: DateTime<Utc>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn triplet(&self) -> Triplet {
        Triplet::new(self.product_id, self.batch_id, self.location_id)
    }

    /// Active and past its `reserved_until`
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.reserved_until.map_or(false, |u| u < now)
    }
}

/// Input for creating a reservation
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateReservationRequest {
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub location_id: Uuid,
    #[validate(custom = "validate_positive_quantity")]
    pub quantity: Decimal,
    pub reserved_until: Option<DateTime<Utc>>,
}

impl CreateReservationRequest {
    pub fn triplet(&self) -> Triplet {
        Triplet::new(self.product_id, self.batch_id, self.location_id)
    }
}

/// Validated reservation ready to be inserted
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub key: Triplet,
    pub quantity: Decimal,
    pub reserved_from: DateTime<Utc>,
    pub reserved_until: Option<DateTime<Utc>>,
}

/// Reservation capacity check: `physical - active_reserved` must cover `requested`.
///
/// Returns what is still free after the reservation.
pub fn reservation_capacity(
    physical: Decimal,
    active_reserved: Decimal,
    requested: Decimal,
) -> Result<Decimal, StockShortfall> {
    let available = physical - active_reserved;
    if requested > available {
        return Err(StockShortfall {
            available,
            requested,
        });
    }
    Ok(available - requested)
}

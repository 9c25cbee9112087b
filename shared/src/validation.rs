//! Validation helpers shared by request models and services

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use validator::ValidationError;

// ============================================================================
// Field Validators (validator derive)
// ============================================================================

/// Quantities on movements and reservations must be strictly positive
pub fn validate_positive_quantity(quantity: &Decimal) -> Result<(), ValidationError> {
    if *quantity <= Decimal::ZERO {
        let mut err = ValidationError::new("positive_quantity");
        err.message = Some("Quantity must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

// ============================================================================
// Service-Level Checks
// ============================================================================

/// A reservation window must end after it starts
pub fn validate_reservation_window(
    reserved_from: DateTime<Utc>,
    reserved_until: Option<DateTime<Utc>>,
) -> Result<(), &'static str> {
    match reserved_until {
        Some(until) if until <= reserved_from => {
            Err("reserved_until must be after reserved_from")
        }
        _ => Ok(()),
    }
}

/// Lookback window for forecasts and alerts, in days
pub fn validate_lookback_days(days: u32) -> Result<(), &'static str> {
    if days == 0 {
        return Err("Lookback must be at least 1 day");
    }
    if days > 3650 {
        return Err("Lookback must be at most 3650 days");
    }
    Ok(())
}

/// Movement codes are free-form but must not carry surrounding whitespace
pub fn validate_movement_code(code: &str) -> Result<(), &'static str> {
    if code.trim().is_empty() {
        return Err("Movement code must not be blank");
    }
    if code.trim() != code {
        return Err("Movement code must not have leading or trailing whitespace");
    }
    Ok(())
}

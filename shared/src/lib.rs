//! Shared types and models for the stockroom inventory core
//!
//! Pure domain rules live here: ledger arithmetic, movement layouts,
//! reservation lifecycle, forecasting and retention. The backend crate
//! adds storage and transport around them.

pub mod models;
pub mod types;
pub mod validation;

pub use models::*;
pub use types::*;
pub use validation::*;

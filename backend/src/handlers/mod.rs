//! HTTP handlers for the stockroom API

pub mod alerts;
pub mod audit;
pub mod health;
pub mod inventory;
pub mod movement;
pub mod reporting;
pub mod reservation;

pub use alerts::*;
pub use audit::*;
pub use health::*;
pub use inventory::*;
pub use movement::*;
pub use reporting::*;
pub use reservation::*;

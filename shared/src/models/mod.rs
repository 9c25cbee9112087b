//! Domain models for the stockroom inventory core

mod archive;
mod audit;
mod ledger;
mod movement;
mod report;
mod reservation;

pub use archive::*;
pub use audit::*;
pub use ledger::*;
pub use movement::*;
pub use report::*;
pub use reservation::*;

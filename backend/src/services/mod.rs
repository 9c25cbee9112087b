//! Business logic services for the stockroom inventory core

pub mod archival;
pub mod audit;
pub mod ledger;
pub mod movement;
pub mod notification;
pub mod reporting;
pub mod reservation;

pub use archival::ArchivalJob;
pub use audit::AuditService;
pub use ledger::LedgerService;
pub use movement::MovementService;
pub use notification::{AlertWatcher, WebhookNotifier};
pub use reporting::ReportingService;
pub use reservation::ReservationService;

use crate::error::AppResult;
use crate::store::UnitOfWork;

/// Commit the unit of work on success, roll it back on failure.
///
/// A failed rollback is logged; the caller still sees the original error.
pub(crate) async fn finish<T>(uow: Box<dyn UnitOfWork>, result: AppResult<T>) -> AppResult<T> {
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                tracing::error!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

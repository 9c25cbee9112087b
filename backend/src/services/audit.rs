//! Audit log reads

use std::sync::Arc;

use shared::{AuditEntry, AuditQuery};

use super::finish;
use crate::error::AppResult;
use crate::store::Store;

/// Entity names written to the audit log
pub mod entity {
    pub const INVENTORY: &str = "inventory";
    pub const MOVEMENT: &str = "movement";
    pub const RESERVATION: &str = "reservation";
    pub const MAINTENANCE_JOB: &str = "maintenance_job";
}

/// Read access to the append-only audit log.
///
/// Writes happen inside the unit of work of the operation being audited.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn Store>,
}

impl AuditService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Audit entries matching the query, newest first
    pub async fn list(&self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>> {
        let mut uow = self.store.begin().await?;
        let result = uow.list_audit(query).await;
        finish(uow, result).await
    }
}

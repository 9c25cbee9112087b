//! HTTP handlers for the audit log

use axum::{
    extract::{Query, State},
    Json,
};
use shared::{AuditEntry, AuditQuery};

use crate::error::AppResult;
use crate::services::AuditService;
use crate::AppState;

/// List audit entries, newest first
pub async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> AppResult<Json<Vec<AuditEntry>>> {
    let service = AuditService::new(state.store);
    let entries = service.list(&query).await?;
    Ok(Json(entries))
}

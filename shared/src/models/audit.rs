//! Audit trail models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// An append-only audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: String,
    pub changes: Option<JsonValue>,
    pub performed_by: Option<Uuid>,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Audit entry to append
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAuditEntry {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: String,
    pub changes: Option<JsonValue>,
    pub performed_by: Option<Uuid>,
    pub reason: Option<String>,
}

impl NewAuditEntry {
    pub fn new(entity_type: impl Into<String>, entity_id: Uuid, action: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            action: action.into(),
            changes: None,
            performed_by: None,
            reason: None,
        }
    }

    pub fn with_changes(mut self, changes: JsonValue) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn performed_by(mut self, user_id: Option<Uuid>) -> Self {
        self.performed_by = user_id;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Audit listing filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub limit: Option<i64>,
}

impl AuditQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity_type
            .as_deref()
            .map_or(true, |t| t == entry.entity_type)
            && self.entity_id.map_or(true, |id| id == entry.entity_id)
    }
}

//! Archival and retention models

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Live tables that are relocated into archive siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveEntity {
    Reservation,
    Movement,
    Serial,
    Batch,
}

impl ArchiveEntity {
    /// Children before parents
    pub const PROCESSING_ORDER: [ArchiveEntity; 4] = [
        ArchiveEntity::Reservation,
        ArchiveEntity::Movement,
        ArchiveEntity::Serial,
        ArchiveEntity::Batch,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            ArchiveEntity::Reservation => "reservation",
            ArchiveEntity::Movement => "movement",
            ArchiveEntity::Serial => "serial",
            ArchiveEntity::Batch => "batch",
        }
    }

    pub fn archive_table(&self) -> &'static str {
        match self {
            ArchiveEntity::Reservation => "reservation_archive",
            ArchiveEntity::Movement => "movement_archive",
            ArchiveEntity::Serial => "serial_archive",
            ArchiveEntity::Batch => "batch_archive",
        }
    }
}

/// Per-entity retention windows, in days
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub reservation_days: u32,
    pub movement_days: u32,
    pub serial_days: u32,
    pub batch_days: u32,
    pub audit_log_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            reservation_days: 365 * 2,
            movement_days: 365 * 3,
            serial_days: 365 * 3,
            batch_days: 365 * 5,
            audit_log_days: 365 * 7,
        }
    }
}

impl RetentionPolicy {
    pub fn days_for(&self, entity: ArchiveEntity) -> u32 {
        match entity {
            ArchiveEntity::Reservation => self.reservation_days,
            ArchiveEntity::Movement => self.movement_days,
            ArchiveEntity::Serial => self.serial_days,
            ArchiveEntity::Batch => self.batch_days,
        }
    }

    /// Rows whose retention column is older than this are eligible
    pub fn cutoff(&self, entity: ArchiveEntity, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.days_for(entity)))
    }

    pub fn audit_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.audit_log_days))
    }
}

/// Candidate ids that may be deleted from the live table: only those
/// confirmed present in the archive, in candidate order.
pub fn confirmed_archived(candidates: &[Uuid], present_in_archive: &HashSet<Uuid>) -> Vec<Uuid> {
    candidates
        .iter()
        .filter(|id| present_in_archive.contains(id))
        .copied()
        .collect()
}

/// Moved row counts per entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTotals {
    pub reservation: u64,
    pub movement: u64,
    pub serial: u64,
    pub batch: u64,
}

impl ArchiveTotals {
    pub fn add(&mut self, entity: ArchiveEntity, count: usize) {
        let count = count as u64;
        match entity {
            ArchiveEntity::Reservation => self.reservation += count,
            ArchiveEntity::Movement => self.movement += count,
            ArchiveEntity::Serial => self.serial += count,
            ArchiveEntity::Batch => self.batch += count,
        }
    }

    pub fn get(&self, entity: ArchiveEntity) -> u64 {
        match entity {
            ArchiveEntity::Reservation => self.reservation,
            ArchiveEntity::Movement => self.movement,
            ArchiveEntity::Serial => self.serial,
            ArchiveEntity::Batch => self.batch,
        }
    }

    pub fn total(&self) -> u64 {
        self.reservation + self.movement + self.serial + self.batch
    }
}

/// How an archival run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    DryRun,
    LockUnavailable,
    Failed,
}

/// Result of one archival run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub outcome: RunOutcome,
    pub dry_run: bool,
    /// Eligible rows per entity, filled in dry-run mode
    pub candidates: ArchiveTotals,
    pub moved: ArchiveTotals,
    pub purged_audit_logs: u64,
    pub errors: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MaintenanceReport {
    pub fn new(dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome: if dry_run {
                RunOutcome::DryRun
            } else {
                RunOutcome::Completed
            },
            dry_run,
            candidates: ArchiveTotals::default(),
            moved: ArchiveTotals::default(),
            purged_audit_logs: 0,
            errors: 0,
            started_at,
            finished_at: started_at,
        }
    }

    /// Payload of the summary audit entry
    pub fn summary_changes(&self) -> serde_json::Value {
        json!({
            "moved_reservations": self.moved.reservation,
            "moved_movements": self.moved.movement,
            "moved_serials": self.moved.serial,
            "moved_batches": self.moved.batch,
            "purged_audit_logs": self.purged_audit_logs,
            "errors": self.errors,
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_confirmed_ids_are_deletable() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let present: HashSet<Uuid> = [ids[0], ids[2], Uuid::new_v4()].into_iter().collect();

        assert_eq!(confirmed_archived(&ids, &present), vec![ids[0], ids[2]]);
        assert!(confirmed_archived(&ids, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_audit_retention_is_longest() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();
        for entity in ArchiveEntity::PROCESSING_ORDER {
            assert!(policy.audit_cutoff(now) < policy.cutoff(entity, now));
        }
    }

    #[test]
    fn test_children_processed_before_batches() {
        let order = ArchiveEntity::PROCESSING_ORDER;
        assert_eq!(order.last(), Some(&ArchiveEntity::Batch));
        assert_eq!(order.first(), Some(&ArchiveEntity::Reservation));
    }
}

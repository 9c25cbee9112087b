//! Archive and purge job
//!
//! Moves soft-deleted rows older than their retention window from the live
//! tables into archive siblings, children before parents, then purges old
//! audit entries. Only one run may hold the maintenance lease at a time.
//!
//! Every move is copy-then-delete in one storage batch, and only ids
//! confirmed present in the archive are deleted, so a run can be repeated
//! after a crash without losing or duplicating rows.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use shared::{
    ArchiveEntity, MaintenanceReport, NewAuditEntry, RetentionPolicy, RunOutcome,
};

use super::audit::entity;
use crate::config::ArchivalConfig;
use crate::error::AppResult;
use crate::store::{ArchiveStore, Lease};

pub const SUMMARY_ACTION: &str = "archive_and_purge";
pub const SUMMARY_REASON: &str = "scheduled archive_and_purge";

/// Knobs for one job instance
#[derive(Debug, Clone)]
pub struct ArchivalSettings {
    pub batch_size: u32,
    pub lease_name: String,
    pub lease_ttl: Duration,
    /// Passes spent clearing residual batch children before batches that are
    /// still referenced are left for the next run
    pub max_child_passes: u32,
    pub retention: RetentionPolicy,
}

impl ArchivalSettings {
    pub fn from_config(config: &ArchivalConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            lease_name: config.lease_name.clone(),
            lease_ttl: Duration::seconds(config.lease_ttl_secs),
            max_child_passes: config.max_child_passes,
            retention: RetentionPolicy::from(&config.retention),
        }
    }
}

impl Default for ArchivalSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease_name: SUMMARY_ACTION.to_string(),
            lease_ttl: Duration::hours(1),
            max_child_passes: 3,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Phases of the batch pass
#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchPhase {
    ScanCandidates,
    ArchiveChildren(Vec<Uuid>),
    ArchiveParents,
    Done,
}

/// The archive and purge job
pub struct ArchivalJob {
    store: Arc<dyn ArchiveStore>,
    settings: ArchivalSettings,
}

impl ArchivalJob {
    pub fn new(store: Arc<dyn ArchiveStore>, settings: ArchivalSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &ArchivalSettings {
        &self.settings
    }

    /// Run the job. `dry_run` only counts candidates.
    pub async fn run(&self, dry_run: bool) -> MaintenanceReport {
        self.run_at(dry_run, Utc::now()).await
    }

    /// Run with retention cutoffs measured from `now`
    pub async fn run_at(&self, dry_run: bool, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::new(dry_run, Utc::now());
        let lease = Lease {
            name: self.settings.lease_name.clone(),
            owner: Uuid::new_v4(),
            acquired_at: report.started_at,
            expires_at: report.started_at + self.settings.lease_ttl,
        };

        match self.store.try_acquire_lease(&lease).await {
            Ok(true) => {
                tracing::debug!(lease = %lease.name, owner = %lease.owner, "Maintenance lease acquired");
            }
            Ok(false) => {
                tracing::error!(lease = %lease.name, "Could not acquire maintenance lease. Aborting.");
                report.outcome = RunOutcome::LockUnavailable;
                report.finished_at = Utc::now();
                return report;
            }
            Err(e) => {
                tracing::error!(lease = %lease.name, error = %e, "Maintenance lease check failed");
                report.errors += 1;
                report.outcome = RunOutcome::Failed;
                report.finished_at = Utc::now();
                return report;
            }
        }

        if dry_run {
            self.count_candidates(&mut report, now).await;
        } else {
            self.archive_all(&mut report, now).await;
        }

        report.finished_at = Utc::now();

        // Summary goes in while the lease is still held
        if !dry_run && report.errors == 0 {
            if let Err(e) = self.write_summary(&report).await {
                tracing::error!(error = %e, "Failed writing maintenance summary");
                report.errors += 1;
            }
        }
        if report.errors > 0 {
            report.outcome = RunOutcome::Failed;
        }

        if let Err(e) = self.store.release_lease(&lease.name, lease.owner).await {
            tracing::warn!(lease = %lease.name, error = %e, "Failed releasing maintenance lease; it expires on its own");
        }

        tracing::info!(
            dry_run,
            outcome = ?report.outcome,
            reservations = report.moved.reservation,
            movements = report.moved.movement,
            serials = report.moved.serial,
            batches = report.moved.batch,
            purged_audit_logs = report.purged_audit_logs,
            errors = report.errors,
            "Maintenance finished"
        );
        report
    }

    // ========================================================================
    // Dry run
    // ========================================================================

    async fn count_candidates(&self, report: &mut MaintenanceReport, now: DateTime<Utc>) {
        let retention = &self.settings.retention;
        for entity in ArchiveEntity::PROCESSING_ORDER {
            let cutoff = retention.cutoff(entity, now);
            match self.store.count_candidates(entity, cutoff).await {
                Ok(count) => {
                    tracing::info!(table = entity.table(), count, "[dry-run] archive candidates");
                    report.candidates.add(entity, count as usize);
                }
                Err(e) => {
                    tracing::error!(table = entity.table(), error = %e, "Candidate count failed");
                    report.errors += 1;
                }
            }
        }

        match self.store.count_audit_before(retention.audit_cutoff(now)).await {
            Ok(count) => {
                tracing::info!(count, "[dry-run] audit entries to purge");
                report.purged_audit_logs = count;
            }
            Err(e) => {
                tracing::error!(error = %e, "Audit count failed");
                report.errors += 1;
            }
        }
    }

    // ========================================================================
    // Commit run
    // ========================================================================

    async fn archive_all(&self, report: &mut MaintenanceReport, now: DateTime<Utc>) {
        for entity in ArchiveEntity::PROCESSING_ORDER {
            let result = match entity {
                ArchiveEntity::Batch => self.archive_batches(report, now).await,
                _ => self.archive_table(report, entity, now).await,
            };
            if let Err(e) = result {
                tracing::error!(table = entity.table(), error = %e, "Archiving failed; batch rolled back");
                report.errors += 1;
            }
        }

        let cutoff = self.settings.retention.audit_cutoff(now);
        match self.store.purge_audit_before(cutoff).await {
            Ok(purged) => {
                tracing::info!(purged, "Purged audit entries");
                report.purged_audit_logs = purged;
            }
            Err(e) => {
                tracing::error!(error = %e, "Audit purge failed");
                report.errors += 1;
            }
        }
    }

    /// Move batches of one table until a batch comes back empty
    async fn archive_table(
        &self,
        report: &mut MaintenanceReport,
        entity: ArchiveEntity,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let cutoff = self.settings.retention.cutoff(entity, now);
        loop {
            let moved = self
                .store
                .move_batch(entity, cutoff, self.settings.batch_size)
                .await?;
            if moved.is_empty() {
                return Ok(());
            }
            tracing::info!(table = entity.table(), count = moved.len(), ids = ?moved, "Moved rows");
            report.moved.add(entity, moved.len());
        }
    }

    /// Batches are parents of movements and serials. Residual children of
    /// candidate batches are moved first, for a bounded number of passes.
    async fn archive_batches(&self, report: &mut MaintenanceReport, now: DateTime<Utc>) -> AppResult<()> {
        let retention = &self.settings.retention;
        let limit = self.settings.batch_size;
        let batch_cutoff = retention.cutoff(ArchiveEntity::Batch, now);

        let mut child_passes = 0;
        let mut phase = BatchPhase::ScanCandidates;

        while phase != BatchPhase::Done {
            phase = match phase {
                BatchPhase::ScanCandidates => {
                    let candidates = self.store.batch_candidates(batch_cutoff, limit).await?;
                    if candidates.is_empty() {
                        BatchPhase::Done
                    } else {
                        let blocked = self.store.batches_with_live_children(&candidates).await?;
                        if blocked.is_empty() {
                            BatchPhase::ArchiveParents
                        } else if child_passes >= self.settings.max_child_passes {
                            tracing::warn!(
                                count = blocked.len(),
                                "Batches still referenced after residual passes; leaving them for the next run"
                            );
                            BatchPhase::ArchiveParents
                        } else {
                            tracing::warn!(
                                ids = ?blocked,
                                "Found residual children for batch ids, moving them first"
                            );
                            BatchPhase::ArchiveChildren(blocked)
                        }
                    }
                }
                BatchPhase::ArchiveChildren(batch_ids) => {
                    child_passes += 1;
                    let mut moved_any = false;
                    for child in [ArchiveEntity::Movement, ArchiveEntity::Serial] {
                        let moved = self
                            .store
                            .move_children(child, &batch_ids, retention.cutoff(child, now), limit)
                            .await?;
                        if !moved.is_empty() {
                            tracing::info!(table = child.table(), ids = ?moved, "Moved residual children");
                            report.moved.add(child, moved.len());
                            moved_any = true;
                        }
                    }
                    if moved_any {
                        BatchPhase::ScanCandidates
                    } else {
                        BatchPhase::ArchiveParents
                    }
                }
                BatchPhase::ArchiveParents => {
                    let moved = self
                        .store
                        .move_batch(ArchiveEntity::Batch, batch_cutoff, limit)
                        .await?;
                    if moved.is_empty() {
                        BatchPhase::Done
                    } else {
                        tracing::info!(table = "batch", count = moved.len(), ids = ?moved, "Moved rows");
                        report.moved.add(ArchiveEntity::Batch, moved.len());
                        BatchPhase::ScanCandidates
                    }
                }
                BatchPhase::Done => BatchPhase::Done,
            };
        }
        Ok(())
    }

    async fn write_summary(&self, report: &MaintenanceReport) -> AppResult<()> {
        let run_id = Uuid::new_v4();
        let entry = NewAuditEntry::new(entity::MAINTENANCE_JOB, run_id, SUMMARY_ACTION)
            .with_changes(report.summary_changes())
            .with_reason(SUMMARY_REASON);
        self.store.write_summary(&entry).await?;
        Ok(())
    }
}

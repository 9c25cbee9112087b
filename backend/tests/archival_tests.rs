//! Archive and purge job tests
//!
//! Tests for the maintenance job including:
//! - Dry runs count without touching rows
//! - The maintenance lease excludes concurrent runs
//! - Moves are repeatable after an interrupted run
//! - Batches go after their children, with bounded residual passes
//! - Audit purge and the run summary

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{
    ArchiveEntity, AuditEntry, CreateMovementRequest, CreateReservationRequest, LedgerDirection,
    NewAuditEntry, RunOutcome, Triplet,
};
use stockroom::services::archival::{ArchivalJob, ArchivalSettings, SUMMARY_ACTION, SUMMARY_REASON};
use stockroom::services::{LedgerService, MovementService, ReservationService};
use stockroom::store::{ArchiveStore, Lease, MemoryStore, Store};
use stockroom::AppResult;

// Helper to create Decimal from string
fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    store: MemoryStore,
    now: DateTime<Utc>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: MemoryStore::with_default_catalog(),
            now: Utc::now(),
        }
    }

    fn shared_store(&self) -> Arc<dyn Store> {
        Arc::new(self.store.clone())
    }

    fn job(&self) -> ArchivalJob {
        let store: Arc<dyn ArchiveStore> = Arc::new(self.store.clone());
        ArchivalJob::new(store, ArchivalSettings::default())
    }

    fn job_with(&self, settings: ArchivalSettings) -> ArchivalJob {
        let store: Arc<dyn ArchiveStore> = Arc::new(self.store.clone());
        ArchivalJob::new(store, settings)
    }

    fn long_ago(&self) -> DateTime<Utc> {
        self.now - Duration::days(365 * 6)
    }

    /// Create `count` reservations and soft-delete them at `deleted_at`
    async fn deleted_reservations(&self, count: usize, deleted_at: DateTime<Utc>) -> Vec<Uuid> {
        let key = Triplet::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        LedgerService::new(self.shared_store())
            .apply_delta(key, dec("1000"), LedgerDirection::Increase, None)
            .await
            .unwrap();

        let service = ReservationService::new(self.shared_store());
        let mut ids = Vec::new();
        for _ in 0..count {
            let reservation = service
                .create(
                    CreateReservationRequest {
                        product_id: key.product_id,
                        batch_id: key.batch_id,
                        location_id: key.location_id,
                        quantity: dec("1"),
                        reserved_until: None,
                    },
                    None,
                )
                .await
                .unwrap();
            assert!(
                self.store
                    .soft_delete(ArchiveEntity::Reservation, reservation.id, deleted_at)
                    .await
            );
            ids.push(reservation.id);
        }
        ids
    }

    /// Aged deleted batch with `count` aged deleted serials under it
    async fn deleted_batch_with_serials(&self, code: &str, count: usize) -> (Uuid, Vec<Uuid>) {
        let product = Uuid::new_v4();
        let batch = self.store.add_batch(product, code).await;
        assert!(self.store.soft_delete(ArchiveEntity::Batch, batch, self.long_ago()).await);
        let mut serials = Vec::new();
        for n in 0..count {
            let serial = self
                .store
                .add_serial(product, batch, &format!("{code}-SN-{n}"))
                .await;
            assert!(self.store.soft_delete(ArchiveEntity::Serial, serial, self.long_ago()).await);
            serials.push(serial);
        }
        (batch, serials)
    }

    /// Inbound movement into `batch_id`. Also opens a ledger row for the batch.
    async fn movement_in_batch(&self, product_id: Uuid, batch_id: Uuid, code: &str) -> Uuid {
        let request = CreateMovementRequest {
            code: code.to_string(),
            movement_type: "inbound".to_string(),
            product_id,
            batch_id,
            from_location_id: None,
            to_location_id: Some(Uuid::new_v4()),
            reason: "purchase".to_string(),
            requested_by: None,
            executed_by: None,
            quantity: dec("1"),
            occurred_at: None,
        };
        MovementService::new(self.shared_store())
            .record(request, None)
            .await
            .unwrap()
            .id
    }

    async fn summaries(&self) -> usize {
        self.store
            .audit_entries()
            .await
            .iter()
            .filter(|e| e.entity_type == "maintenance_job")
            .count()
    }
}

/// Store that records whether the maintenance lease was held when the
/// summary was written
struct SummaryWitness {
    inner: MemoryStore,
    lease_name: String,
    held_at_summary: Arc<AtomicBool>,
}

#[async_trait]
impl ArchiveStore for SummaryWitness {
    async fn try_acquire_lease(&self, lease: &Lease) -> AppResult<bool> {
        self.inner.try_acquire_lease(lease).await
    }

    async fn release_lease(&self, name: &str, owner: Uuid) -> AppResult<()> {
        self.inner.release_lease(name, owner).await
    }

    async fn count_candidates(&self, entity: ArchiveEntity, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.inner.count_candidates(entity, cutoff).await
    }

    async fn move_batch(
        &self,
        entity: ArchiveEntity,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>> {
        self.inner.move_batch(entity, cutoff, limit).await
    }

    async fn batch_candidates(&self, cutoff: DateTime<Utc>, limit: u32) -> AppResult<Vec<Uuid>> {
        self.inner.batch_candidates(cutoff, limit).await
    }

    async fn batches_with_live_children(&self, batch_ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        self.inner.batches_with_live_children(batch_ids).await
    }

    async fn move_children(
        &self,
        entity: ArchiveEntity,
        batch_ids: &[Uuid],
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>> {
        self.inner.move_children(entity, batch_ids, cutoff, limit).await
    }

    async fn count_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.inner.count_audit_before(cutoff).await
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.inner.purge_audit_before(cutoff).await
    }

    async fn write_summary(&self, entry: &NewAuditEntry) -> AppResult<AuditEntry> {
        let held = self.inner.lease(&self.lease_name).await.is_some();
        self.held_at_summary.store(held, Ordering::SeqCst);
        self.inner.write_summary(entry).await
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod unit_tests {
    use super::*;

    /// Five aged deleted reservations: a dry run counts them and moves nothing
    #[tokio::test]
    async fn test_dry_run_only_counts() {
        let fx = Fixture::new();
        let ids = fx.deleted_reservations(5, fx.long_ago()).await;

        let report = fx.job().run_at(true, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::DryRun);
        assert_eq!(report.candidates.reservation, 5);
        assert_eq!(report.moved.total(), 0);
        assert_eq!(report.errors, 0);
        let live = fx.store.live_ids(ArchiveEntity::Reservation).await;
        assert!(ids.iter().all(|id| live.contains(id)));
        assert!(fx.store.archived_ids(ArchiveEntity::Reservation).await.is_empty());
        assert_eq!(fx.summaries().await, 0);
    }

    /// A lease held by another run aborts before any work
    #[tokio::test]
    async fn test_held_lease_aborts_run() {
        let fx = Fixture::new();
        let ids = fx.deleted_reservations(3, fx.long_ago()).await;
        let other = Uuid::new_v4();
        fx.store
            .hold_lease(&ArchivalSettings::default().lease_name, other, Duration::minutes(30))
            .await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::LockUnavailable);
        assert_eq!(report.moved.total(), 0);
        assert_eq!(report.purged_audit_logs, 0);
        assert_eq!(fx.store.live_ids(ArchiveEntity::Reservation).await.len(), ids.len());
        assert_eq!(fx.summaries().await, 0);

        let lease = fx.store.lease(&ArchivalSettings::default().lease_name).await.unwrap();
        assert_eq!(lease.owner, other);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let fx = Fixture::new();
        fx.deleted_reservations(2, fx.long_ago()).await;
        let lease_name = ArchivalSettings::default().lease_name;
        fx.store
            .hold_lease(&lease_name, Uuid::new_v4(), Duration::seconds(-10))
            .await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.moved.reservation, 2);
        assert!(fx.store.lease(&lease_name).await.is_none());
    }

    #[tokio::test]
    async fn test_commit_moves_only_aged_rows() {
        let fx = Fixture::new();
        let aged = fx.deleted_reservations(4, fx.long_ago()).await;
        let recent = fx.deleted_reservations(2, fx.now - Duration::days(10)).await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.moved.reservation, 4);

        let live = fx.store.live_ids(ArchiveEntity::Reservation).await;
        let archived = fx.store.archived_ids(ArchiveEntity::Reservation).await;
        assert!(aged.iter().all(|id| archived.contains(id) && !live.contains(id)));
        assert!(recent.iter().all(|id| live.contains(id) && !archived.contains(id)));
    }

    #[tokio::test]
    async fn test_small_batches_drain_the_table() {
        let fx = Fixture::new();
        fx.deleted_reservations(7, fx.long_ago()).await;
        let store: Arc<dyn ArchiveStore> = Arc::new(fx.store.clone());
        let settings = ArchivalSettings {
            batch_size: 2,
            ..ArchivalSettings::default()
        };

        let report = ArchivalJob::new(store, settings).run_at(false, fx.now).await;

        assert_eq!(report.moved.reservation, 7);
        assert!(fx.store.live_ids(ArchiveEntity::Reservation).await.is_empty());
    }

    /// Rows already copied by an interrupted run are removed, not duplicated
    #[tokio::test]
    async fn test_rerun_after_partial_copy() {
        let fx = Fixture::new();
        let ids = fx.deleted_reservations(3, fx.long_ago()).await;
        fx.store.copy_to_archive(ArchiveEntity::Reservation, ids[0]).await;

        let first = fx.job().run_at(false, fx.now).await;
        let second = fx.job().run_at(false, fx.now).await;

        assert_eq!(first.moved.reservation, 3);
        assert_eq!(second.moved.reservation, 0);
        assert_eq!(second.outcome, RunOutcome::Completed);
        assert!(fx.store.live_ids(ArchiveEntity::Reservation).await.is_empty());
        assert_eq!(fx.store.archived_ids(ArchiveEntity::Reservation).await.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_follows_its_children() {
        let fx = Fixture::new();
        let (batch, _) = fx.deleted_batch_with_serials("B-001", 2).await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.moved.serial, 2);
        assert_eq!(report.moved.batch, 1);
        assert!(fx.store.archived_ids(ArchiveEntity::Batch).await.contains(&batch));
        assert!(fx.store.live_ids(ArchiveEntity::Serial).await.is_empty());
    }

    /// The ledger row opened by a movement keeps the batch after the
    /// movement itself is archived
    #[tokio::test]
    async fn test_ledger_row_keeps_batch_live() {
        let fx = Fixture::new();
        let product = Uuid::new_v4();
        let batch = fx.store.add_batch(product, "B-004").await;
        let movement = fx.movement_in_batch(product, batch, "IN-B4").await;
        fx.store.soft_delete(ArchiveEntity::Movement, movement, fx.long_ago()).await;
        fx.store.soft_delete(ArchiveEntity::Batch, batch, fx.long_ago()).await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.errors, 0);
        assert_eq!(report.moved.movement, 1);
        assert_eq!(report.moved.batch, 0);
        assert!(fx.store.live_ids(ArchiveEntity::Batch).await.contains(&batch));
        assert!(fx.store.archived_ids(ArchiveEntity::Batch).await.is_empty());
    }

    /// Serials missed by their own table sweep are picked up before the batch
    #[tokio::test]
    async fn test_residual_children_moved_before_batch() {
        let fx = Fixture::new();
        let (batch, serials) = fx.deleted_batch_with_serials("B-005", 2).await;
        fx.store.fail_archival_of(ArchiveEntity::Serial).await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.errors, 1);
        assert_eq!(report.moved.serial, 2);
        assert_eq!(report.moved.batch, 1);
        let archived = fx.store.archived_ids(ArchiveEntity::Serial).await;
        assert!(serials.iter().all(|id| archived.contains(id)));
        assert!(fx.store.archived_ids(ArchiveEntity::Batch).await.contains(&batch));
    }

    /// One child per pass and three passes: two serials and the batch wait
    #[tokio::test]
    async fn test_residual_passes_are_capped() {
        let fx = Fixture::new();
        let (batch, _) = fx.deleted_batch_with_serials("B-006", 5).await;
        fx.store.fail_archival_of(ArchiveEntity::Serial).await;
        let settings = ArchivalSettings {
            batch_size: 1,
            max_child_passes: 3,
            ..ArchivalSettings::default()
        };

        let report = fx.job_with(settings).run_at(false, fx.now).await;

        assert_eq!(report.moved.serial, 3);
        assert_eq!(report.moved.batch, 0);
        assert_eq!(fx.store.live_ids(ArchiveEntity::Serial).await.len(), 2);
        assert!(fx.store.live_ids(ArchiveEntity::Batch).await.contains(&batch));
        assert!(fx.store.lease(&ArchivalSettings::default().lease_name).await.is_none());
    }

    #[tokio::test]
    async fn test_referenced_batch_stays_live() {
        let fx = Fixture::new();
        let product = Uuid::new_v4();
        let batch = fx.store.add_batch(product, "B-002").await;
        // Live child
        fx.store.add_serial(product, batch, "SN-2").await;
        fx.store.soft_delete(ArchiveEntity::Batch, batch, fx.long_ago()).await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.moved.batch, 0);
        assert!(fx.store.live_ids(ArchiveEntity::Batch).await.contains(&batch));
    }

    #[tokio::test]
    async fn test_audit_purge_and_summary() {
        let fx = Fixture::new();
        let old = fx.store.seed_audit("inventory", fx.now - Duration::days(365 * 8)).await;
        let fresh = fx.store.seed_audit("inventory", fx.now - Duration::days(30)).await;

        let dry = fx.job().run_at(true, fx.now).await;
        assert_eq!(dry.purged_audit_logs, 1);
        assert_eq!(fx.store.audit_entries().await.len(), 2);

        let report = fx.job().run_at(false, fx.now).await;
        assert_eq!(report.purged_audit_logs, 1);

        let entries = fx.store.audit_entries().await;
        assert!(entries.iter().all(|e| e.id != old));
        assert!(entries.iter().any(|e| e.id == fresh));

        let summary = entries
            .iter()
            .find(|e| e.entity_type == "maintenance_job")
            .unwrap();
        assert_eq!(summary.action, SUMMARY_ACTION);
        assert_eq!(summary.reason.as_deref(), Some(SUMMARY_REASON));
        let changes = summary.changes.as_ref().unwrap();
        assert_eq!(changes["purged_audit_logs"], 1);
        assert_eq!(changes["errors"], 0);

        assert!(fx.store.lease(&ArchivalSettings::default().lease_name).await.is_none());
    }

    #[tokio::test]
    async fn test_summary_written_under_lease() {
        let fx = Fixture::new();
        fx.deleted_reservations(1, fx.long_ago()).await;
        let settings = ArchivalSettings::default();
        let held_at_summary = Arc::new(AtomicBool::new(false));
        let store: Arc<dyn ArchiveStore> = Arc::new(SummaryWitness {
            inner: fx.store.clone(),
            lease_name: settings.lease_name.clone(),
            held_at_summary: held_at_summary.clone(),
        });

        let report = ArchivalJob::new(store, settings.clone()).run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(fx.summaries().await, 1);
        assert!(held_at_summary.load(Ordering::SeqCst));
        assert!(fx.store.lease(&settings.lease_name).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_table_is_counted_and_skipped() {
        let fx = Fixture::new();
        fx.deleted_reservations(2, fx.long_ago()).await;
        let product = Uuid::new_v4();
        let batch = fx.store.add_batch(product, "B-003").await;
        let movement = fx.movement_in_batch(product, batch, "IN-B3").await;
        fx.store.soft_delete(ArchiveEntity::Movement, movement, fx.long_ago()).await;
        fx.store.fail_archival_of(ArchiveEntity::Movement).await;

        let report = fx.job().run_at(false, fx.now).await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(report.errors > 0);
        // Other tables still processed
        assert_eq!(report.moved.reservation, 2);
        assert!(fx.store.live_ids(ArchiveEntity::Movement).await.contains(&movement));
        assert_eq!(fx.summaries().await, 0);
        assert!(fx.store.lease(&ArchivalSettings::default().lease_name).await.is_none());
    }
}

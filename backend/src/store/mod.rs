//! Storage seam for the inventory core
//!
//! Services talk to storage only through these traits. Every mutating
//! operation runs inside one [`UnitOfWork`] which is either committed or
//! rolled back as a whole; dropping it without `commit` discards its writes.
//!
//! Two backends implement the seam: [`PgStore`] over PostgreSQL and
//! [`MemoryStore`] for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{
    ArchiveEntity, AuditEntry, AuditQuery, InventoryRecord, Movement, MovementFlow,
    MovementReason, MovementType, NewAuditEntry, NewMovement, NewReservation, Reservation,
    ReservationStatus, StockFilter, TimeWindow, Triplet,
};

use crate::error::AppResult;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Entry point for transactional work
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a unit of work
    async fn begin(&self) -> AppResult<Box<dyn UnitOfWork>>;

    /// Whether the backing storage answers
    async fn ping(&self) -> bool;
}

/// One atomic unit of reads and writes.
///
/// Reads of live rows never return soft-deleted rows.
#[async_trait]
pub trait UnitOfWork: Send {
    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    /// Fetch the ledger row for a triplet, locking it until the unit ends
    async fn lock_inventory(&mut self, key: &Triplet) -> AppResult<Option<InventoryRecord>>;

    /// Add `quantity` to the triplet, creating the row if absent.
    ///
    /// Returns the row after the write and whether it was created.
    async fn upsert_increase(
        &mut self,
        key: &Triplet,
        quantity: Decimal,
    ) -> AppResult<(InventoryRecord, bool)>;

    /// Take `quantity` from a ledger row only if it holds at least that much.
    ///
    /// `None` means the guard rejected the write and nothing changed.
    async fn guarded_decrease(
        &mut self,
        id: Uuid,
        quantity: Decimal,
    ) -> AppResult<Option<InventoryRecord>>;

    async fn list_inventory(&mut self, filter: &StockFilter) -> AppResult<Vec<InventoryRecord>>;

    // ------------------------------------------------------------------
    // Movement catalog and movements
    // ------------------------------------------------------------------

    async fn find_movement_type(&mut self, code: &str) -> AppResult<Option<MovementType>>;

    async fn find_movement_reason(&mut self, code: &str) -> AppResult<Option<MovementReason>>;

    /// First reason in the catalog, by code
    async fn any_movement_reason(&mut self) -> AppResult<Option<MovementReason>>;

    async fn movement_code_exists(&mut self, code: &str) -> AppResult<bool>;

    async fn insert_movement(&mut self, movement: &NewMovement) -> AppResult<Movement>;

    /// Movements of matching product/batch that touch the filtered location
    async fn list_movements(&mut self, filter: &StockFilter) -> AppResult<Vec<Movement>>;

    // ------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------

    /// Sum of `active` reservation quantity on one triplet
    async fn active_reserved_quantity(&mut self, key: &Triplet) -> AppResult<Decimal>;

    async fn insert_reservation(&mut self, reservation: &NewReservation) -> AppResult<Reservation>;

    async fn get_reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>>;

    /// Fetch a reservation, locking it until the unit ends
    async fn lock_reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>>;

    /// Move an `active` reservation to `status`.
    ///
    /// `None` when the reservation is missing or no longer active.
    async fn transition_reservation(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Reservation>>;

    /// Flip every active reservation whose `reserved_until` is before `now`
    /// to `expired`, returning the ids flipped.
    async fn expire_overdue_reservations(&mut self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>>;

    async fn list_reservations(
        &mut self,
        status: Option<ReservationStatus>,
    ) -> AppResult<Vec<Reservation>>;

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    async fn append_audit(&mut self, entry: &NewAuditEntry) -> AppResult<AuditEntry>;

    /// Newest first
    async fn list_audit(&mut self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>>;

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Sum of ledger quantity under the filter
    async fn physical_stock(&mut self, filter: &StockFilter) -> AppResult<Decimal>;

    /// Sum of active reservation quantity under the filter
    async fn reserved_stock(&mut self, filter: &StockFilter) -> AppResult<Decimal>;

    /// Sum of movement quantity leaving a location (the filtered one, if any),
    /// optionally only since a point in time
    async fn consumed_stock(
        &mut self,
        filter: &StockFilter,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Decimal>;

    /// Movements touching the filtered location inside the window
    async fn movement_flows(
        &mut self,
        filter: &StockFilter,
        window: &TimeWindow,
    ) -> AppResult<Vec<MovementFlow>>;

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

/// Named maintenance lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage operations used by the archive and purge job.
///
/// Each `move_*` call is one atomic batch: copy candidates into the archive
/// (keeping rows already there), then delete from the live table only the
/// candidates confirmed present in the archive.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Take the lease if it is free or expired
    async fn try_acquire_lease(&self, lease: &Lease) -> AppResult<bool>;

    /// Drop the lease if `owner` still holds it
    async fn release_lease(&self, name: &str, owner: Uuid) -> AppResult<()>;

    /// Rows soft-deleted before `cutoff`
    async fn count_candidates(&self, entity: ArchiveEntity, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Move up to `limit` rows soft-deleted before `cutoff`, returning the ids
    /// removed from the live table. Batches still referenced by a row in the
    /// inventory, reservation, movement or serial table are never selected.
    async fn move_batch(
        &self,
        entity: ArchiveEntity,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>>;

    /// Batch ids eligible by age, ignoring their children
    async fn batch_candidates(&self, cutoff: DateTime<Utc>, limit: u32) -> AppResult<Vec<Uuid>>;

    /// Subset of `batch_ids` still referenced from the inventory, reservation,
    /// movement or serial table
    async fn batches_with_live_children(&self, batch_ids: &[Uuid]) -> AppResult<Vec<Uuid>>;

    /// Move child rows (movements or serials) of the given batches that are
    /// themselves older than `cutoff`
    async fn move_children(
        &self,
        entity: ArchiveEntity,
        batch_ids: &[Uuid],
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>>;

    async fn count_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    async fn write_summary(&self, entry: &NewAuditEntry) -> AppResult<AuditEntry>;
}

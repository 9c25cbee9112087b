//! In-process store
//!
//! Units of work are serialized by an async mutex. Each one works on a copy
//! of the committed state which replaces it only on `commit`, so a rollback
//! or a dropped unit leaves nothing behind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use shared::{
    confirmed_archived, ArchiveEntity, AuditEntry, AuditQuery, InventoryRecord, Movement,
    MovementFlow, MovementReason, MovementType, NewAuditEntry, NewMovement, NewReservation,
    Reservation, ReservationStatus, StockFilter, TimeWindow, Triplet,
};

use super::{ArchiveStore, Lease, Store, UnitOfWork};
use crate::error::{AppError, AppResult};

/// Movement type codes seeded by [`MemoryStore::with_default_catalog`]
pub const DEFAULT_MOVEMENT_TYPES: [&str; 4] = ["inbound", "outbound", "transfer", "adjustment"];

/// Movement reason codes seeded by [`MemoryStore::with_default_catalog`]
pub const DEFAULT_MOVEMENT_REASONS: [&str; 3] = ["purchase", "reservation_fulfillment", "stock_count"];

/// A stored row with its soft-delete marker
#[derive(Debug, Clone)]
struct Row<T> {
    data: T,
    deleted_at: Option<DateTime<Utc>>,
}

impl<T> Row<T> {
    fn live(data: T) -> Self {
        Self {
            data,
            deleted_at: None,
        }
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    fn deleted_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.deleted_at.map_or(false, |at| at < cutoff)
    }
}

/// Rows not soft-deleted
fn live<T>(rows: &[Row<T>]) -> impl Iterator<Item = &T> {
    rows.iter().filter(|r| r.is_live()).map(|r| &r.data)
}

fn live_mut<T>(rows: &mut [Row<T>]) -> impl Iterator<Item = &mut T> {
    rows.iter_mut().filter(|r| r.is_live()).map(|r| &mut r.data)
}

/// Batch master row, kept only as far as archival needs it
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub code: String,
}

/// Serial master row, kept only as far as archival needs it
#[derive(Debug, Clone, Serialize)]
pub struct SerialRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub serial_number: String,
}

/// Rows that can be relocated to an archive table
trait Archivable: Serialize {
    fn id(&self) -> Uuid;
    fn parent_batch(&self) -> Option<Uuid>;
}

impl Archivable for Reservation {
    fn id(&self) -> Uuid {
        self.id
    }
    fn parent_batch(&self) -> Option<Uuid> {
        Some(self.batch_id)
    }
}

impl Archivable for Movement {
    fn id(&self) -> Uuid {
        self.id
    }
    fn parent_batch(&self) -> Option<Uuid> {
        Some(self.batch_id)
    }
}

impl Archivable for SerialRecord {
    fn id(&self) -> Uuid {
        self.id
    }
    fn parent_batch(&self) -> Option<Uuid> {
        Some(self.batch_id)
    }
}

impl Archivable for BatchRecord {
    fn id(&self) -> Uuid {
        self.id
    }
    fn parent_batch(&self) -> Option<Uuid> {
        None
    }
}

/// Copy-then-delete for one batch of rows.
///
/// Rows already in the archive are kept as they are; only candidates found
/// in the archive afterwards are removed from `rows`.
fn move_rows<T: Archivable>(
    rows: &mut Vec<Row<T>>,
    archive: &mut BTreeMap<Uuid, JsonValue>,
    eligible: impl Fn(&Row<T>) -> bool,
    limit: u32,
) -> Vec<Uuid> {
    let mut candidates: Vec<Uuid> = rows.iter().filter(|r| eligible(*r)).map(|r| r.data.id()).collect();
    candidates.sort();
    candidates.truncate(limit as usize);

    for row in rows.iter().filter(|r| candidates.contains(&r.data.id())) {
        archive
            .entry(row.data.id())
            .or_insert_with(|| json!({ "row": &row.data, "deleted_at": row.deleted_at }));
    }

    let present: HashSet<Uuid> = candidates
        .iter()
        .filter(|id| archive.contains_key(id))
        .copied()
        .collect();
    let moved = confirmed_archived(&candidates, &present);

    rows.retain(|r| !moved.contains(&r.data.id()));
    moved
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    inventory: Vec<Row<InventoryRecord>>,
    movement_types: Vec<MovementType>,
    movement_reasons: Vec<MovementReason>,
    movements: Vec<Row<Movement>>,
    reservations: Vec<Row<Reservation>>,
    batches: Vec<Row<BatchRecord>>,
    serials: Vec<Row<SerialRecord>>,
    audit: Vec<AuditEntry>,
    archive: HashMap<ArchiveEntity, BTreeMap<Uuid, JsonValue>>,
    leases: HashMap<String, Lease>,
    failing_entity: Option<ArchiveEntity>,
}

impl MemoryState {
    /// Batches still referenced from the ledger, reservation, movement or
    /// serial table. Soft-deleted rows count: they keep the foreign key alive.
    fn batches_with_children(&self) -> HashSet<Uuid> {
        self.inventory
            .iter()
            .map(|r| r.data.batch_id)
            .chain(self.reservations.iter().filter_map(|r| r.data.parent_batch()))
            .chain(self.movements.iter().filter_map(|r| r.data.parent_batch()))
            .chain(self.serials.iter().filter_map(|r| r.data.parent_batch()))
            .collect()
    }

    fn soft_delete(&mut self, entity: ArchiveEntity, id: Uuid, at: DateTime<Utc>) -> bool {
        fn mark<T: Archivable>(rows: &mut [Row<T>], id: Uuid, at: DateTime<Utc>) -> bool {
            match rows.iter_mut().find(|r| r.data.id() == id) {
                Some(row) => {
                    row.deleted_at = Some(at);
                    true
                }
                None => false,
            }
        }

        match entity {
            ArchiveEntity::Reservation => mark(&mut self.reservations, id, at),
            ArchiveEntity::Movement => mark(&mut self.movements, id, at),
            ArchiveEntity::Serial => mark(&mut self.serials, id, at),
            ArchiveEntity::Batch => mark(&mut self.batches, id, at),
        }
    }

    fn live_ids(&self, entity: ArchiveEntity) -> Vec<Uuid> {
        fn ids<T: Archivable>(rows: &[Row<T>]) -> Vec<Uuid> {
            rows.iter().map(|r| r.data.id()).collect()
        }

        match entity {
            ArchiveEntity::Reservation => ids(&self.reservations),
            ArchiveEntity::Movement => ids(&self.movements),
            ArchiveEntity::Serial => ids(&self.serials),
            ArchiveEntity::Batch => ids(&self.batches),
        }
    }
}

/// In-memory implementation of [`Store`] and [`ArchiveStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the standard movement types and reasons in its catalog
    pub fn with_default_catalog() -> Self {
        let state = MemoryState {
            movement_types: DEFAULT_MOVEMENT_TYPES
                .iter()
                .map(|code| MovementType {
                    id: Uuid::new_v4(),
                    code: code.to_string(),
                    description: None,
                })
                .collect(),
            movement_reasons: DEFAULT_MOVEMENT_REASONS
                .iter()
                .map(|code| MovementReason {
                    id: Uuid::new_v4(),
                    code: code.to_string(),
                    description: None,
                    requires_approval: false,
                })
                .collect(),
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

// Fixtures for tests, outside the supported API
impl MemoryStore {
    #[doc(hidden)]
    pub async fn add_movement_type(&self, code: &str) -> MovementType {
        let movement_type = MovementType {
            id: Uuid::new_v4(),
            code: code.to_string(),
            description: None,
        };
        self.state.lock().await.movement_types.push(movement_type.clone());
        movement_type
    }

    #[doc(hidden)]
    pub async fn add_movement_reason(&self, code: &str, requires_approval: bool) -> MovementReason {
        let reason = MovementReason {
            id: Uuid::new_v4(),
            code: code.to_string(),
            description: None,
            requires_approval,
        };
        self.state.lock().await.movement_reasons.push(reason.clone());
        reason
    }

    #[doc(hidden)]
    pub async fn remove_movement_type(&self, code: &str) {
        self.state.lock().await.movement_types.retain(|t| t.code != code);
    }

    #[doc(hidden)]
    pub async fn remove_movement_reasons(&self) {
        self.state.lock().await.movement_reasons.clear();
    }

    #[doc(hidden)]
    pub async fn add_batch(&self, product_id: Uuid, code: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.batches.push(Row::live(BatchRecord {
            id,
            product_id,
            code: code.to_string(),
        }));
        id
    }

    #[doc(hidden)]
    pub async fn add_serial(&self, product_id: Uuid, batch_id: Uuid, serial_number: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.serials.push(Row::live(SerialRecord {
            id,
            product_id,
            batch_id,
            serial_number: serial_number.to_string(),
        }));
        id
    }

    /// Mark a row deleted at `at`; false when no such row exists
    #[doc(hidden)]
    pub async fn soft_delete(&self, entity: ArchiveEntity, id: Uuid, at: DateTime<Utc>) -> bool {
        self.state.lock().await.soft_delete(entity, id, at)
    }

    /// Ids still in the live table, deleted or not
    #[doc(hidden)]
    pub async fn live_ids(&self, entity: ArchiveEntity) -> Vec<Uuid> {
        self.state.lock().await.live_ids(entity)
    }

    #[doc(hidden)]
    pub async fn archived_ids(&self, entity: ArchiveEntity) -> Vec<Uuid> {
        self.state
            .lock()
            .await
            .archive
            .get(&entity)
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Put a copy of a live row into the archive without deleting it,
    /// as an interrupted earlier run would have left it
    #[doc(hidden)]
    pub async fn copy_to_archive(&self, entity: ArchiveEntity, id: Uuid) {
        self.state
            .lock()
            .await
            .archive
            .entry(entity)
            .or_default()
            .insert(id, json!({ "row": { "id": id } }));
    }

    #[doc(hidden)]
    pub async fn hold_lease(&self, name: &str, owner: Uuid, ttl: Duration) {
        let now = Utc::now();
        self.state.lock().await.leases.insert(
            name.to_string(),
            Lease {
                name: name.to_string(),
                owner,
                acquired_at: now,
                expires_at: now + ttl,
            },
        );
    }

    #[doc(hidden)]
    pub async fn lease(&self, name: &str) -> Option<Lease> {
        self.state.lock().await.leases.get(name).cloned()
    }

    /// Append an audit entry with an explicit timestamp
    #[doc(hidden)]
    pub async fn seed_audit(&self, entity_type: &str, occurred_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.audit.push(AuditEntry {
            id,
            entity_type: entity_type.to_string(),
            entity_id: Uuid::new_v4(),
            action: "seed".to_string(),
            changes: None,
            performed_by: None,
            reason: None,
            occurred_at,
        });
        id
    }

    #[doc(hidden)]
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    /// Make every table sweep batch for `entity` fail. Residual child moves
    /// for batches still go through.
    #[doc(hidden)]
    pub async fn fail_archival_of(&self, entity: ArchiveEntity) {
        self.state.lock().await.failing_entity = Some(entity);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> AppResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Unit of work over a private copy of the state
pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryUnitOfWork {
    fn find_inventory(&mut self, key: &Triplet) -> Option<&mut InventoryRecord> {
        live_mut(&mut self.working.inventory).find(|r| r.triplet() == *key)
    }

    fn movements_touching<'a>(&'a self, filter: &'a StockFilter) -> impl Iterator<Item = &'a Movement> {
        live(&self.working.movements).filter(move |m| {
            filter.matches_product_batch(m.product_id, m.batch_id)
                && filter.location_id.map_or(true, |loc| {
                    m.from_location_id == Some(loc) || m.to_location_id == Some(loc)
                })
        })
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_inventory(&mut self, key: &Triplet) -> AppResult<Option<InventoryRecord>> {
        Ok(self.find_inventory(key).map(|r| r.clone()))
    }

    async fn upsert_increase(
        &mut self,
        key: &Triplet,
        quantity: Decimal,
    ) -> AppResult<(InventoryRecord, bool)> {
        let now = Utc::now();
        if let Some(record) = self.find_inventory(key) {
            record.quantity += quantity;
            record.updated_at = now;
            return Ok((record.clone(), false));
        }

        let record = InventoryRecord {
            id: Uuid::new_v4(),
            product_id: key.product_id,
            batch_id: key.batch_id,
            location_id: key.location_id,
            quantity,
            created_at: now,
            updated_at: now,
        };
        self.working.inventory.push(Row::live(record.clone()));
        Ok((record, true))
    }

    async fn guarded_decrease(
        &mut self,
        id: Uuid,
        quantity: Decimal,
    ) -> AppResult<Option<InventoryRecord>> {
        let record = live_mut(&mut self.working.inventory).find(|r| r.id == id);
        match record {
            Some(record) if record.quantity >= quantity => {
                record.quantity -= quantity;
                record.updated_at = Utc::now();
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_inventory(&mut self, filter: &StockFilter) -> AppResult<Vec<InventoryRecord>> {
        let mut rows: Vec<InventoryRecord> = live(&self.working.inventory)
            .filter(|r| filter.matches(&r.triplet()))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn find_movement_type(&mut self, code: &str) -> AppResult<Option<MovementType>> {
        Ok(self
            .working
            .movement_types
            .iter()
            .find(|t| t.code == code)
            .cloned())
    }

    async fn find_movement_reason(&mut self, code: &str) -> AppResult<Option<MovementReason>> {
        Ok(self
            .working
            .movement_reasons
            .iter()
            .find(|r| r.code == code)
            .cloned())
    }

    async fn any_movement_reason(&mut self) -> AppResult<Option<MovementReason>> {
        Ok(self
            .working
            .movement_reasons
            .iter()
            .min_by(|a, b| a.code.cmp(&b.code))
            .cloned())
    }

    async fn movement_code_exists(&mut self, code: &str) -> AppResult<bool> {
        Ok(self.working.movements.iter().any(|m| m.data.code == code))
    }

    async fn insert_movement(&mut self, movement: &NewMovement) -> AppResult<Movement> {
        if self.working.movements.iter().any(|m| m.data.code == movement.code) {
            return Err(AppError::DuplicateEntry("movement code".to_string()));
        }

        let stored = Movement {
            id: Uuid::new_v4(),
            code: movement.code.clone(),
            movement_type_id: movement.movement_type.id,
            movement_type: movement.movement_type.code.clone(),
            product_id: movement.product_id,
            batch_id: movement.batch_id,
            from_location_id: movement.from_location_id,
            to_location_id: movement.to_location_id,
            reason_id: movement.reason.id,
            reason: movement.reason.code.clone(),
            requires_approval: movement.reason.requires_approval,
            requested_by: movement.requested_by,
            executed_by: movement.executed_by,
            quantity: movement.quantity,
            occurred_at: movement.occurred_at,
        };
        self.working.movements.push(Row::live(stored.clone()));
        Ok(stored)
    }

    async fn list_movements(&mut self, filter: &StockFilter) -> AppResult<Vec<Movement>> {
        let mut movements: Vec<Movement> = self.movements_touching(filter).cloned().collect();
        movements.sort_by_key(|m| m.occurred_at);
        Ok(movements)
    }

    async fn active_reserved_quantity(&mut self, key: &Triplet) -> AppResult<Decimal> {
        Ok(live(&self.working.reservations)
            .filter(|r| r.status == ReservationStatus::Active && r.triplet() == *key)
            .map(|r| r.quantity)
            .sum())
    }

    async fn insert_reservation(&mut self, reservation: &NewReservation) -> AppResult<Reservation> {
        let now = Utc::now();
        let stored = Reservation {
            id: Uuid::new_v4(),
            product_id: reservation.key.product_id,
            batch_id: reservation.key.batch_id,
            location_id: reservation.key.location_id,
            quantity: reservation.quantity,
            reserved_from: reservation.reserved_from,
            reserved_until: reservation.reserved_until,
            status: ReservationStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.working.reservations.push(Row::live(stored.clone()));
        Ok(stored)
    }

    async fn get_reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>> {
        Ok(live(&self.working.reservations).find(|r| r.id == id).cloned())
    }

    async fn lock_reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>> {
        self.get_reservation(id).await
    }

    async fn transition_reservation(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Reservation>> {
        let reservation = live_mut(&mut self.working.reservations)
            .find(|r| r.id == id && r.status == ReservationStatus::Active);
        Ok(reservation.map(|r| {
            r.status = status;
            r.updated_at = at;
            r.clone()
        }))
    }

    async fn expire_overdue_reservations(&mut self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let mut expired = Vec::new();
        for reservation in live_mut(&mut self.working.reservations) {
            if reservation.is_overdue(now) {
                reservation.status = ReservationStatus::Expired;
                reservation.updated_at = now;
                expired.push(reservation.id);
            }
        }
        Ok(expired)
    }

    async fn list_reservations(
        &mut self,
        status: Option<ReservationStatus>,
    ) -> AppResult<Vec<Reservation>> {
        let mut reservations: Vec<Reservation> = live(&self.working.reservations)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.created_at);
        Ok(reservations)
    }

    async fn append_audit(&mut self, entry: &NewAuditEntry) -> AppResult<AuditEntry> {
        let stored = AuditEntry {
            id: Uuid::new_v4(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id,
            action: entry.action.clone(),
            changes: entry.changes.clone(),
            performed_by: entry.performed_by,
            reason: entry.reason.clone(),
            occurred_at: Utc::now(),
        };
        self.working.audit.push(stored.clone());
        Ok(stored)
    }

    async fn list_audit(&mut self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .working
            .audit
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        entries.truncate(query.effective_limit() as usize);
        Ok(entries)
    }

    async fn physical_stock(&mut self, filter: &StockFilter) -> AppResult<Decimal> {
        Ok(live(&self.working.inventory)
            .filter(|r| filter.matches(&r.triplet()))
            .map(|r| r.quantity)
            .sum())
    }

    async fn reserved_stock(&mut self, filter: &StockFilter) -> AppResult<Decimal> {
        Ok(live(&self.working.reservations)
            .filter(|r| r.status == ReservationStatus::Active && filter.matches(&r.triplet()))
            .map(|r| r.quantity)
            .sum())
    }

    async fn consumed_stock(
        &mut self,
        filter: &StockFilter,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Decimal> {
        Ok(live(&self.working.movements)
            .filter(|m| filter.matches_product_batch(m.product_id, m.batch_id))
            .filter(|m| match filter.location_id {
                Some(loc) => m.from_location_id == Some(loc),
                None => m.from_location_id.is_some(),
            })
            .filter(|m| since.map_or(true, |s| m.occurred_at >= s))
            .map(|m| m.quantity)
            .sum())
    }

    async fn movement_flows(
        &mut self,
        filter: &StockFilter,
        window: &TimeWindow,
    ) -> AppResult<Vec<MovementFlow>> {
        Ok(self
            .movements_touching(filter)
            .filter(|m| window.contains(m.occurred_at))
            .map(MovementFlow::from)
            .collect())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn try_acquire_lease(&self, lease: &Lease) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        if let Some(held) = state.leases.get(&lease.name) {
            if held.owner != lease.owner && !held.is_expired(lease.acquired_at) {
                return Ok(false);
            }
        }
        state.leases.insert(lease.name.clone(), lease.clone());
        Ok(true)
    }

    async fn release_lease(&self, name: &str, owner: Uuid) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.leases.get(name).map_or(false, |l| l.owner == owner) {
            state.leases.remove(name);
        }
        Ok(())
    }

    async fn count_candidates(&self, entity: ArchiveEntity, cutoff: DateTime<Utc>) -> AppResult<u64> {
        fn count<T>(rows: &[Row<T>], cutoff: DateTime<Utc>) -> u64 {
            rows.iter().filter(|r| r.deleted_before(cutoff)).count() as u64
        }

        let state = self.state.lock().await;
        Ok(match entity {
            ArchiveEntity::Reservation => count(&state.reservations, cutoff),
            ArchiveEntity::Movement => count(&state.movements, cutoff),
            ArchiveEntity::Serial => count(&state.serials, cutoff),
            ArchiveEntity::Batch => count(&state.batches, cutoff),
        })
    }

    async fn move_batch(
        &self,
        entity: ArchiveEntity,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>> {
        let mut guard = self.state.lock().await;
        if guard.failing_entity == Some(entity) {
            return Err(AppError::Internal(format!(
                "archive batch for {} failed",
                entity.table()
            )));
        }

        let blocked = guard.batches_with_children();
        let state = &mut *guard;
        let archive = state.archive.entry(entity).or_default();

        Ok(match entity {
            ArchiveEntity::Reservation => {
                move_rows(&mut state.reservations, archive, |r| r.deleted_before(cutoff), limit)
            }
            ArchiveEntity::Movement => {
                move_rows(&mut state.movements, archive, |r| r.deleted_before(cutoff), limit)
            }
            ArchiveEntity::Serial => {
                move_rows(&mut state.serials, archive, |r| r.deleted_before(cutoff), limit)
            }
            ArchiveEntity::Batch => move_rows(
                &mut state.batches,
                archive,
                |r| r.deleted_before(cutoff) && !blocked.contains(&r.data.id),
                limit,
            ),
        })
    }

    async fn batch_candidates(&self, cutoff: DateTime<Utc>, limit: u32) -> AppResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<Uuid> = state
            .batches
            .iter()
            .filter(|r| r.deleted_before(cutoff))
            .map(|r| r.data.id)
            .collect();
        ids.sort();
        ids.truncate(limit as usize);
        Ok(ids)
    }

    async fn batches_with_live_children(&self, batch_ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let referenced = state.batches_with_children();
        Ok(batch_ids
            .iter()
            .filter(|id| referenced.contains(id))
            .copied()
            .collect())
    }

    async fn move_children(
        &self,
        entity: ArchiveEntity,
        batch_ids: &[Uuid],
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let archive = state.archive.entry(entity).or_default();
        match entity {
            ArchiveEntity::Movement => Ok(move_rows(
                &mut state.movements,
                archive,
                |r| r.deleted_before(cutoff) && batch_ids.contains(&r.data.batch_id),
                limit,
            )),
            ArchiveEntity::Serial => Ok(move_rows(
                &mut state.serials,
                archive,
                |r| r.deleted_before(cutoff) && batch_ids.contains(&r.data.batch_id),
                limit,
            )),
            other => Err(AppError::Internal(format!(
                "{} rows are not batch children",
                other.table()
            ))),
        }
    }

    async fn count_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let state = self.state.lock().await;
        Ok(state.audit.iter().filter(|e| e.occurred_at < cutoff).count() as u64)
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.audit.len();
        state.audit.retain(|e| e.occurred_at >= cutoff);
        Ok((before - state.audit.len()) as u64)
    }

    async fn write_summary(&self, entry: &NewAuditEntry) -> AppResult<AuditEntry> {
        let stored = AuditEntry {
            id: entry.entity_id,
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id,
            action: entry.action.clone(),
            changes: entry.changes.clone(),
            performed_by: entry.performed_by,
            reason: entry.reason.clone(),
            occurred_at: Utc::now(),
        };
        self.state.lock().await.audit.push(stored.clone());
        Ok(stored)
    }
}

//! PostgreSQL store
//!
//! A unit of work is one database transaction. Ledger decreases lock the
//! triplet row and are guarded by `quantity >= delta`; increases are a single
//! upsert on the triplet unique key. Reservation transitions only touch rows
//! still `active`.
//!
//! Live-row reads go through [`live`] so the soft-delete predicate is visible
//! at each call site. Archive queries look at deleted rows on purpose and do
//! not use it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use shared::{
    confirmed_archived, ArchiveEntity, AuditEntry, AuditQuery, InventoryRecord, Movement,
    MovementFlow, MovementReason, MovementType, NewAuditEntry, NewMovement, NewReservation,
    Reservation, ReservationStatus, StockFilter, TimeWindow, Triplet,
};

use super::{ArchiveStore, Lease, Store, UnitOfWork};
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};

/// Soft-delete predicate for a table alias
fn live(alias: &str) -> String {
    format!("{alias}.deleted_at IS NULL")
}

/// Columns copied into each archive table
fn archive_columns(entity: ArchiveEntity) -> &'static str {
    match entity {
        ArchiveEntity::Reservation => {
            "id, product_id, batch_id, location_id, event_id, cost_center_id, quantity, \
             reserved_from, reserved_until, status, created_at, updated_at, deleted_at"
        }
        ArchiveEntity::Movement => {
            "id, code, movement_type_id, product_id, batch_id, from_location_id, to_location_id, \
             reason_id, requested_by_user_id, executed_by_user_id, quantity, occurred_at, \
             created_at, updated_at, deleted_at"
        }
        ArchiveEntity::Serial => {
            "id, product_id, batch_id, serial_number, location_id, status, created_at, \
             updated_at, deleted_at"
        }
        ArchiveEntity::Batch => {
            "id, product_id, code, expiration_date, origin_type, origin_id, quarantined, \
             created_at, updated_at, deleted_at"
        }
    }
}

const INVENTORY_COLUMNS: &str =
    "i.id, i.product_id, i.batch_id, i.location_id, i.quantity, i.created_at, i.updated_at";

const RESERVATION_COLUMNS: &str = "r.id, r.product_id, r.batch_id, r.location_id, r.quantity, \
     r.reserved_from, r.reserved_until, r.status, r.created_at, r.updated_at";

const AUDIT_COLUMNS: &str = "a.id, a.entity_name AS entity_type, a.entity_id, a.action, a.changes, \
     a.performed_by_user_id AS performed_by, a.reason, a.occurred_at";

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, FromRow)]
struct InventoryRow {
    id: Uuid,
    product_id: Uuid,
    batch_id: Uuid,
    location_id: Uuid,
    quantity: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<InventoryRow> for InventoryRecord {
    fn from(row: InventoryRow) -> Self {
        InventoryRecord {
            id: row.id,
            product_id: row.product_id,
            batch_id: row.batch_id,
            location_id: row.location_id,
            quantity: row.quantity,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    record: InventoryRow,
    created: bool,
}

#[derive(Debug, FromRow)]
struct MovementTypeRow {
    id: Uuid,
    code: String,
    description: Option<String>,
}

#[derive(Debug, FromRow)]
struct MovementReasonRow {
    id: Uuid,
    code: String,
    description: Option<String>,
    requires_approval: bool,
}

#[derive(Debug, FromRow)]
struct MovementRow {
    id: Uuid,
    code: String,
    movement_type_id: Uuid,
    movement_type: String,
    product_id: Uuid,
    batch_id: Uuid,
    from_location_id: Option<Uuid>,
    to_location_id: Option<Uuid>,
    reason_id: Uuid,
    reason: String,
    requires_approval: bool,
    requested_by: Option<Uuid>,
    executed_by: Option<Uuid>,
    quantity: Decimal,
    occurred_at: DateTime<Utc>,
}

impl From<MovementRow> for Movement {
    fn from(row: MovementRow) -> Self {
        Movement {
            id: row.id,
            code: row.code,
            movement_type_id: row.movement_type_id,
            movement_type: row.movement_type,
            product_id: row.product_id,
            batch_id: row.batch_id,
            from_location_id: row.from_location_id,
            to_location_id: row.to_location_id,
            reason_id: row.reason_id,
            reason: row.reason,
            requires_approval: row.requires_approval,
            requested_by: row.requested_by,
            executed_by: row.executed_by,
            quantity: row.quantity,
            occurred_at: row.occurred_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct FlowRow {
    occurred_at: DateTime<Utc>,
    quantity: Decimal,
    from_location_id: Option<Uuid>,
    to_location_id: Option<Uuid>,
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: Uuid,
    product_id: Uuid,
    batch_id: Uuid,
    location_id: Uuid,
    quantity: Decimal,
    reserved_from: DateTime<Utc>,
    reserved_until: Option<DateTime<Utc>>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = AppError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let status = ReservationStatus::parse(&row.status).ok_or_else(|| {
            AppError::Integrity(format!(
                "reservation {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;
        Ok(Reservation {
            id: row.id,
            product_id: row.product_id,
            batch_id: row.batch_id,
            location_id: row.location_id,
            quantity: row.quantity,
            reserved_from: row.reserved_from,
            reserved_until: row.reserved_until,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    action: String,
    changes: Option<JsonValue>,
    performed_by: Option<Uuid>,
    reason: Option<String>,
    occurred_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        AuditEntry {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            action: row.action,
            changes: row.changes,
            performed_by: row.performed_by,
            reason: row.reason,
            occurred_at: row.occurred_at,
        }
    }
}

fn map_unique_violation(err: sqlx::Error, field: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::DuplicateEntry(field.to_string())
        }
        _ => AppError::DatabaseError(err),
    }
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL implementation of [`Store`] and [`ArchiveStore`]
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool for the configured database
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Copy candidates into the archive, then delete the confirmed ones.
    async fn move_candidates(
        tx: &mut Transaction<'static, Postgres>,
        entity: ArchiveEntity,
        candidates: Vec<Uuid>,
    ) -> AppResult<Vec<Uuid>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let columns = archive_columns(entity);
        let insert = format!(
            "INSERT INTO {archive} ({columns}) \
             SELECT {columns} FROM {table} WHERE id = ANY($1) \
             ON CONFLICT (id) DO NOTHING",
            archive = entity.archive_table(),
            table = entity.table(),
        );
        sqlx::query(&insert)
            .bind(&candidates)
            .execute(&mut **tx)
            .await?;

        let present: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(&format!(
            "SELECT id FROM {} WHERE id = ANY($1)",
            entity.archive_table()
        ))
        .bind(&candidates)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .collect();

        let confirmed = confirmed_archived(&candidates, &present);
        if confirmed.is_empty() {
            return Ok(confirmed);
        }

        let deleted = sqlx::query_scalar::<_, Uuid>(&format!(
            "DELETE FROM {} WHERE id = ANY($1) RETURNING id",
            entity.table()
        ))
        .bind(&confirmed)
        .fetch_all(&mut **tx)
        .await?;

        Ok(deleted)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> AppResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Unit of work over one transaction
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    async fn fetch_reservation(&mut self, id: Uuid, for_update: bool) -> AppResult<Option<Reservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservation r WHERE r.id = $1 AND {}{}",
            live("r"),
            if for_update { " FOR UPDATE" } else { "" }
        );
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Reservation::try_from)
            .transpose()
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_inventory(&mut self, key: &Triplet) -> AppResult<Option<InventoryRecord>> {
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory i \
             WHERE i.product_id = $1 AND i.batch_id = $2 AND i.location_id = $3 AND {} \
             FOR UPDATE",
            live("i")
        );
        let row = sqlx::query_as::<_, InventoryRow>(&sql)
            .bind(key.product_id)
            .bind(key.batch_id)
            .bind(key.location_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn upsert_increase(
        &mut self,
        key: &Triplet,
        quantity: Decimal,
    ) -> AppResult<(InventoryRecord, bool)> {
        let row = sqlx::query_as::<_, UpsertRow>(
            r#"
            INSERT INTO inventory AS i (id, product_id, batch_id, location_id, quantity)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (product_id, batch_id, location_id)
            DO UPDATE SET quantity = i.quantity + EXCLUDED.quantity,
                          updated_at = now(),
                          deleted_at = NULL
            RETURNING i.id, i.product_id, i.batch_id, i.location_id, i.quantity,
                      i.created_at, i.updated_at, (xmax = 0) AS created
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.product_id)
        .bind(key.batch_id)
        .bind(key.location_id)
        .bind(quantity)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok((row.record.into(), row.created))
    }

    async fn guarded_decrease(
        &mut self,
        id: Uuid,
        quantity: Decimal,
    ) -> AppResult<Option<InventoryRecord>> {
        let sql = format!(
            "UPDATE inventory i SET quantity = i.quantity - $2, updated_at = now() \
             WHERE i.id = $1 AND i.quantity >= $2 AND {} \
             RETURNING {INVENTORY_COLUMNS}",
            live("i")
        );
        let row = sqlx::query_as::<_, InventoryRow>(&sql)
            .bind(id)
            .bind(quantity)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_inventory(&mut self, filter: &StockFilter) -> AppResult<Vec<InventoryRecord>> {
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory i \
             WHERE ($1::uuid IS NULL OR i.product_id = $1) \
               AND ($2::uuid IS NULL OR i.batch_id = $2) \
               AND ($3::uuid IS NULL OR i.location_id = $3) \
               AND {} \
             ORDER BY i.created_at",
            live("i")
        );
        let rows = sqlx::query_as::<_, InventoryRow>(&sql)
            .bind(filter.product_id)
            .bind(filter.batch_id)
            .bind(filter.location_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_movement_type(&mut self, code: &str) -> AppResult<Option<MovementType>> {
        let sql = format!(
            "SELECT t.id, t.code, t.description FROM movement_type t WHERE t.code = $1 AND {}",
            live("t")
        );
        let row = sqlx::query_as::<_, MovementTypeRow>(&sql)
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|r| MovementType {
            id: r.id,
            code: r.code,
            description: r.description,
        }))
    }

    async fn find_movement_reason(&mut self, code: &str) -> AppResult<Option<MovementReason>> {
        let sql = format!(
            "SELECT m.id, m.code, m.description, m.requires_approval \
             FROM movement_reason m WHERE m.code = $1 AND {}",
            live("m")
        );
        let row = sqlx::query_as::<_, MovementReasonRow>(&sql)
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(reason_from_row))
    }

    async fn any_movement_reason(&mut self) -> AppResult<Option<MovementReason>> {
        let sql = format!(
            "SELECT m.id, m.code, m.description, m.requires_approval \
             FROM movement_reason m WHERE {} ORDER BY m.code LIMIT 1",
            live("m")
        );
        let row = sqlx::query_as::<_, MovementReasonRow>(&sql)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(reason_from_row))
    }

    async fn movement_code_exists(&mut self, code: &str) -> AppResult<bool> {
        // Deleted movements keep their code reserved
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM movement WHERE code = $1)",
        )
        .bind(code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_movement(&mut self, movement: &NewMovement) -> AppResult<Movement> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO movement (
                id, code, movement_type_id, product_id, batch_id, from_location_id,
                to_location_id, reason_id, requested_by_user_id, executed_by_user_id,
                quantity, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&movement.code)
        .bind(movement.movement_type.id)
        .bind(movement.product_id)
        .bind(movement.batch_id)
        .bind(movement.from_location_id)
        .bind(movement.to_location_id)
        .bind(movement.reason.id)
        .bind(movement.requested_by)
        .bind(movement.executed_by)
        .bind(movement.quantity)
        .bind(movement.occurred_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_unique_violation(e, "movement code"))?;

        Ok(Movement {
            id,
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
        })
    }

    async fn list_movements(&mut self, filter: &StockFilter) -> AppResult<Vec<Movement>> {
        let sql = format!(
            "SELECT m.id, m.code, m.movement_type_id, t.code AS movement_type, m.product_id, \
                    m.batch_id, m.from_location_id, m.to_location_id, m.reason_id, \
                    r.code AS reason, r.requires_approval, \
                    m.requested_by_user_id AS requested_by, m.executed_by_user_id AS executed_by, \
                    m.quantity, m.occurred_at \
             FROM movement m \
             JOIN movement_type t ON t.id = m.movement_type_id \
             JOIN movement_reason r ON r.id = m.reason_id \
             WHERE ($1::uuid IS NULL OR m.product_id = $1) \
               AND ($2::uuid IS NULL OR m.batch_id = $2) \
               AND ($3::uuid IS NULL OR m.from_location_id = $3 OR m.to_location_id = $3) \
               AND {} \
             ORDER BY m.occurred_at",
            live("m")
        );
        let rows = sqlx::query_as::<_, MovementRow>(&sql)
            .bind(filter.product_id)
            .bind(filter.batch_id)
            .bind(filter.location_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn active_reserved_quantity(&mut self, key: &Triplet) -> AppResult<Decimal> {
        let sql = format!(
            "SELECT COALESCE(SUM(r.quantity), 0) FROM reservation r \
             WHERE r.status = 'active' AND r.product_id = $1 AND r.batch_id = $2 \
               AND r.location_id = $3 AND {}",
            live("r")
        );
        let total = sqlx::query_scalar::<_, Decimal>(&sql)
            .bind(key.product_id)
            .bind(key.batch_id)
            .bind(key.location_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(total)
    }

    async fn insert_reservation(&mut self, reservation: &NewReservation) -> AppResult<Reservation> {
        let sql = format!(
            "INSERT INTO reservation AS r \
                 (id, product_id, batch_id, location_id, quantity, reserved_from, reserved_until, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'active') \
             RETURNING {RESERVATION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(reservation.key.product_id)
            .bind(reservation.key.batch_id)
            .bind(reservation.key.location_id)
            .bind(reservation.quantity)
            .bind(reservation.reserved_from)
            .bind(reservation.reserved_until)
            .fetch_one(&mut *self.tx)
            .await?;
        row.try_into()
    }

    async fn get_reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>> {
        self.fetch_reservation(id, false).await
    }

    async fn lock_reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>> {
        self.fetch_reservation(id, true).await
    }

    async fn transition_reservation(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Reservation>> {
        let sql = format!(
            "UPDATE reservation r SET status = $2, updated_at = $3 \
             WHERE r.id = $1 AND r.status = 'active' AND {} \
             RETURNING {RESERVATION_COLUMNS}",
            live("r")
        );
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(at)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Reservation::try_from)
            .transpose()
    }

    async fn expire_overdue_reservations(&mut self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let sql = format!(
            "UPDATE reservation r SET status = 'expired', updated_at = $1 \
             WHERE r.status = 'active' AND r.reserved_until IS NOT NULL \
               AND r.reserved_until < $1 AND {} \
             RETURNING r.id",
            live("r")
        );
        let ids = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(ids)
    }

    async fn list_reservations(
        &mut self,
        status: Option<ReservationStatus>,
    ) -> AppResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservation r \
             WHERE ($1::text IS NULL OR r.status = $1) AND {} \
             ORDER BY r.created_at",
            live("r")
        );
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(Reservation::try_from)
            .collect()
    }

    async fn append_audit(&mut self, entry: &NewAuditEntry) -> AppResult<AuditEntry> {
        let sql = format!(
            "INSERT INTO audit_log AS a \
                 (id, entity_name, entity_id, action, changes, performed_by_user_id, reason, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
             RETURNING {AUDIT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, AuditRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&entry.entity_type)
            .bind(entry.entity_id)
            .bind(&entry.action)
            .bind(&entry.changes)
            .bind(entry.performed_by)
            .bind(&entry.reason)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row.into())
    }

    async fn list_audit(&mut self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log a \
             WHERE ($1::text IS NULL OR a.entity_name = $1) \
               AND ($2::uuid IS NULL OR a.entity_id = $2) \
             ORDER BY a.occurred_at DESC \
             LIMIT $3"
        );
        let rows = sqlx::query_as::<_, AuditRow>(&sql)
            .bind(&query.entity_type)
            .bind(query.entity_id)
            .bind(query.effective_limit())
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn physical_stock(&mut self, filter: &StockFilter) -> AppResult<Decimal> {
        let sql = format!(
            "SELECT COALESCE(SUM(i.quantity), 0) FROM inventory i \
             WHERE ($1::uuid IS NULL OR i.product_id = $1) \
               AND ($2::uuid IS NULL OR i.batch_id = $2) \
               AND ($3::uuid IS NULL OR i.location_id = $3) \
               AND {}",
            live("i")
        );
        let total = sqlx::query_scalar::<_, Decimal>(&sql)
            .bind(filter.product_id)
            .bind(filter.batch_id)
            .bind(filter.location_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(total)
    }

    async fn reserved_stock(&mut self, filter: &StockFilter) -> AppResult<Decimal> {
        let sql = format!(
            "SELECT COALESCE(SUM(r.quantity), 0) FROM reservation r \
             WHERE r.status = 'active' \
               AND ($1::uuid IS NULL OR r.product_id = $1) \
               AND ($2::uuid IS NULL OR r.batch_id = $2) \
               AND ($3::uuid IS NULL OR r.location_id = $3) \
               AND {}",
            live("r")
        );
        let total = sqlx::query_scalar::<_, Decimal>(&sql)
            .bind(filter.product_id)
            .bind(filter.batch_id)
            .bind(filter.location_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(total)
    }

    async fn consumed_stock(
        &mut self,
        filter: &StockFilter,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Decimal> {
        let sql = format!(
            "SELECT COALESCE(SUM(m.quantity), 0) FROM movement m \
             WHERE m.from_location_id IS NOT NULL \
               AND ($1::uuid IS NULL OR m.product_id = $1) \
               AND ($2::uuid IS NULL OR m.batch_id = $2) \
               AND ($3::uuid IS NULL OR m.from_location_id = $3) \
               AND ($4::timestamptz IS NULL OR m.occurred_at >= $4) \
               AND {}",
            live("m")
        );
        let total = sqlx::query_scalar::<_, Decimal>(&sql)
            .bind(filter.product_id)
            .bind(filter.batch_id)
            .bind(filter.location_id)
            .bind(since)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(total)
    }

    async fn movement_flows(
        &mut self,
        filter: &StockFilter,
        window: &TimeWindow,
    ) -> AppResult<Vec<MovementFlow>> {
        let sql = format!(
            "SELECT m.occurred_at, m.quantity, m.from_location_id, m.to_location_id \
             FROM movement m \
             WHERE ($1::uuid IS NULL OR m.product_id = $1) \
               AND ($2::uuid IS NULL OR m.batch_id = $2) \
               AND ($3::uuid IS NULL OR m.from_location_id = $3 OR m.to_location_id = $3) \
               AND ($4::timestamptz IS NULL OR m.occurred_at >= $4) \
               AND ($5::timestamptz IS NULL OR m.occurred_at <= $5) \
               AND {} \
             ORDER BY m.occurred_at ASC",
            live("m")
        );
        let rows = sqlx::query_as::<_, FlowRow>(&sql)
            .bind(filter.product_id)
            .bind(filter.batch_id)
            .bind(filter.location_id)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| MovementFlow {
                occurred_at: r.occurred_at,
                quantity: r.quantity,
                from_location_id: r.from_location_id,
                to_location_id: r.to_location_id,
            })
            .collect())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn reason_from_row(r: MovementReasonRow) -> MovementReason {
    MovementReason {
        id: r.id,
        code: r.code,
        description: r.description,
        requires_approval: r.requires_approval,
    }
}

// ============================================================================
// Archival
// ============================================================================

#[async_trait]
impl ArchiveStore for PgStore {
    async fn try_acquire_lease(&self, lease: &Lease) -> AppResult<bool> {
        let acquired = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO maintenance_lease AS l (name, owner, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
                SET owner = EXCLUDED.owner,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE l.expires_at <= EXCLUDED.acquired_at OR l.owner = EXCLUDED.owner
            RETURNING l.name
            "#,
        )
        .bind(&lease.name)
        .bind(lease.owner)
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn release_lease(&self, name: &str, owner: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM maintenance_lease WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_candidates(&self, entity: ArchiveEntity, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT count(*) FROM {} WHERE deleted_at < $1",
            entity.table()
        ))
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn move_batch(
        &self,
        entity: ArchiveEntity,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>> {
        let children_guard = match entity {
            ArchiveEntity::Batch => {
                " AND NOT EXISTS (SELECT 1 FROM inventory i WHERE i.batch_id = t.id) \
                  AND NOT EXISTS (SELECT 1 FROM reservation r WHERE r.batch_id = t.id) \
                  AND NOT EXISTS (SELECT 1 FROM movement m WHERE m.batch_id = t.id) \
                  AND NOT EXISTS (SELECT 1 FROM serial s WHERE s.batch_id = t.id)"
            }
            _ => "",
        };
        let select = format!(
            "SELECT t.id FROM {} t WHERE t.deleted_at < $1{children_guard} ORDER BY t.id LIMIT $2",
            entity.table()
        );

        let mut tx = self.pool.begin().await?;
        let candidates = sqlx::query_scalar::<_, Uuid>(&select)
            .bind(cutoff)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await?;
        let moved = Self::move_candidates(&mut tx, entity, candidates).await?;
        tx.commit().await?;
        Ok(moved)
    }

    async fn batch_candidates(&self, cutoff: DateTime<Utc>, limit: u32) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM batch WHERE deleted_at < $1 ORDER BY id LIMIT $2",
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn batches_with_live_children(&self, batch_ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT batch_id FROM inventory WHERE batch_id = ANY($1)
            UNION
            SELECT DISTINCT batch_id FROM reservation WHERE batch_id = ANY($1)
            UNION
            SELECT DISTINCT batch_id FROM movement WHERE batch_id = ANY($1)
            UNION
            SELECT DISTINCT batch_id FROM serial WHERE batch_id = ANY($1)
            "#,
        )
        .bind(batch_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn move_children(
        &self,
        entity: ArchiveEntity,
        batch_ids: &[Uuid],
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Uuid>> {
        if !matches!(entity, ArchiveEntity::Movement | ArchiveEntity::Serial) {
            return Err(AppError::Internal(format!(
                "{} rows are not batch children",
                entity.table()
            )));
        }

        let select = format!(
            "SELECT id FROM {} WHERE batch_id = ANY($1) AND deleted_at < $2 ORDER BY id LIMIT $3",
            entity.table()
        );

        let mut tx = self.pool.begin().await?;
        let candidates = sqlx::query_scalar::<_, Uuid>(&select)
            .bind(batch_ids)
            .bind(cutoff)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await?;
        let moved = Self::move_candidates(&mut tx, entity, candidates).await?;
        tx.commit().await?;
        Ok(moved)
    }

    async fn count_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM audit_log WHERE occurred_at < $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_summary(&self, entry: &NewAuditEntry) -> AppResult<AuditEntry> {
        let sql = format!(
            "INSERT INTO audit_log AS a \
                 (id, entity_name, entity_id, action, changes, performed_by_user_id, reason, occurred_at) \
             VALUES ($1, $2, $1, $3, $4, $5, $6, now()) \
             RETURNING {AUDIT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, AuditRow>(&sql)
            .bind(entry.entity_id)
            .bind(&entry.entity_type)
            .bind(&entry.action)
            .bind(&entry.changes)
            .bind(entry.performed_by)
            .bind(&entry.reason)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }
}

//! # Shift Repository
//!
//! Persistence of the shift lifecycle.
//!
//! ## Atomic Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  open        INSERT guarded by partial unique index                    │
//! │              (device_id) WHERE status = 'open'                          │
//! │                                                                         │
//! │  add totals  UPDATE ... SET total_x = total_x + ?                       │
//! │              WHERE id = ? AND status = 'open'                           │
//! │                                                                         │
//! │  close       UPDATE ... SET status = 'closed'                           │
//! │              WHERE id = ? AND status = 'open'                           │
//! │                AND NOT EXISTS (live queue items for the shift)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//! Every rule is a single statement, so two workers can never both win.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::queue::LIVE_FOR_SHIFT;
use super::{from_millis, opt_from_millis, to_millis};
use crate::error::{DbError, DbResult};
use vendfisc_core::{CoreError, FiscalShift, Money, ShiftStatus, ShiftTotals};

const SHIFT_COLUMNS: &str = "id, device_id, sequence, cashier, status, total_sales, total_refunds, \
     total_cash, total_card, total_other, receipt_count, provider_shift_number, z_report_ref, \
     opened_at, closed_at";

#[derive(sqlx::FromRow)]
struct ShiftRow {
    id: String,
    device_id: String,
    sequence: i64,
    cashier: String,
    status: ShiftStatus,
    total_sales: i64,
    total_refunds: i64,
    total_cash: i64,
    total_card: i64,
    total_other: i64,
    receipt_count: i64,
    provider_shift_number: Option<i64>,
    z_report_ref: Option<String>,
    opened_at: i64,
    closed_at: Option<i64>,
}

impl From<ShiftRow> for FiscalShift {
    fn from(row: ShiftRow) -> Self {
        FiscalShift {
            id: row.id,
            device_id: row.device_id,
            sequence: row.sequence,
            cashier: row.cashier,
            status: row.status,
            totals: ShiftTotals {
                sales: Money::from_minor(row.total_sales),
                refunds: Money::from_minor(row.total_refunds),
                cash: Money::from_minor(row.total_cash),
                card: Money::from_minor(row.total_card),
                other: Money::from_minor(row.total_other),
                receipt_count: row.receipt_count,
            },
            provider_shift_number: row.provider_shift_number,
            z_report_ref: row.z_report_ref,
            opened_at: from_millis(row.opened_at),
            closed_at: opt_from_millis(row.closed_at),
        }
    }
}

/// Repository for shift operations.
#[derive(Debug, Clone)]
pub struct ShiftRepository {
    pool: SqlitePool,
}

impl ShiftRepository {
    /// Creates a new ShiftRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ShiftRepository { pool }
    }

    /// Gets a shift by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<FiscalShift>> {
        let mut conn = self.pool.acquire().await?;
        fetch_shift(&mut conn, id).await
    }

    /// Gets a shift by ID or fails with NotFound.
    pub async fn require(&self, id: &str) -> DbResult<FiscalShift> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalShift", id))
    }

    /// The device's OPEN shift, if any.
    pub async fn current_open(&self, device_id: &str) -> DbResult<Option<FiscalShift>> {
        let mut conn = self.pool.acquire().await?;
        current_open(&mut conn, device_id).await
    }

    /// The device's most recent shift (highest sequence), open or closed.
    pub async fn latest(&self, device_id: &str) -> DbResult<Option<FiscalShift>> {
        let sql = format!(
            "SELECT {SHIFT_COLUMNS} FROM fiscal_shifts WHERE device_id = ?1 ORDER BY sequence DESC LIMIT 1"
        );
        let row: Option<ShiftRow> = sqlx::query_as(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FiscalShift::from))
    }

    /// Shifts of a device, newest first.
    pub async fn list_for_device(&self, device_id: &str, limit: u32) -> DbResult<Vec<FiscalShift>> {
        let sql = format!(
            "SELECT {SHIFT_COLUMNS} FROM fiscal_shifts WHERE device_id = ?1 ORDER BY sequence DESC LIMIT ?2"
        );
        let rows: Vec<ShiftRow> = sqlx::query_as(&sql)
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FiscalShift::from).collect())
    }

    /// Opens a new shift: sequence = previous + 1, zero totals.
    ///
    /// Fails with `ShiftAlreadyOpen` if the device has an OPEN shift.
    pub async fn open(
        &self,
        device_id: &str,
        cashier: &str,
        provider_shift_number: Option<i64>,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalShift> {
        let mut conn = self.pool.acquire().await?;
        open_shift(&mut conn, device_id, cashier, provider_shift_number, now).await
    }

    /// Closes a shift, freezing its totals.
    ///
    /// `closing_item` is the `shift_close` queue item performing the close;
    /// it is excluded from the pending-operations check.
    pub async fn close(
        &self,
        shift_id: &str,
        z_report_ref: Option<&str>,
        closing_item: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalShift> {
        let mut conn = self.pool.acquire().await?;
        close_shift(&mut conn, shift_id, z_report_ref, closing_item, now).await
    }

    /// Number of live queue items that keep the shift from closing.
    pub async fn pending_operations(&self, shift_id: &str, excluding: Option<&str>) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        pending_operations(&mut conn, shift_id, excluding).await
    }
}

// =============================================================================
// Connection-level operations (usable inside a transaction)
// =============================================================================

pub(crate) async fn fetch_shift(
    conn: &mut SqliteConnection,
    id: &str,
) -> DbResult<Option<FiscalShift>> {
    let sql = format!("SELECT {SHIFT_COLUMNS} FROM fiscal_shifts WHERE id = ?1");
    let row: Option<ShiftRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(FiscalShift::from))
}

pub(crate) async fn current_open(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> DbResult<Option<FiscalShift>> {
    let sql = format!(
        "SELECT {SHIFT_COLUMNS} FROM fiscal_shifts WHERE device_id = ?1 AND status = 'open'"
    );
    let row: Option<ShiftRow> = sqlx::query_as(&sql)
        .bind(device_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(FiscalShift::from))
}

pub(crate) async fn open_shift(
    conn: &mut SqliteConnection,
    device_id: &str,
    cashier: &str,
    provider_shift_number: Option<i64>,
    now: DateTime<Utc>,
) -> DbResult<FiscalShift> {
    let current = current_open(conn, device_id).await?;
    FiscalShift::ensure_can_open(device_id, current.as_ref())?;

    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        r#"
        INSERT INTO fiscal_shifts (id, device_id, sequence, cashier, status, provider_shift_number, opened_at)
        SELECT ?1, ?2, COALESCE(MAX(sequence), 0) + 1, ?3, 'open', ?4, ?5
        FROM fiscal_shifts WHERE device_id = ?2
        "#,
    )
    .bind(&id)
    .bind(device_id)
    .bind(cashier)
    .bind(provider_shift_number)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => {}
        // Lost a race against another opener: the partial index refused us
        Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE constraint failed") => {
            let winner = current_open(conn, device_id).await?;
            return Err(CoreError::ShiftAlreadyOpen {
                device_id: device_id.to_string(),
                shift_id: winner.map(|s| s.id).unwrap_or_default(),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    }

    let shift = fetch_shift(conn, &id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalShift", &id))?;

    info!(
        shift_id = %shift.id,
        device_id = %device_id,
        sequence = shift.sequence,
        cashier = %cashier,
        "Shift opened"
    );
    Ok(shift)
}

/// Adds a receipt's contribution. `ShiftNotOpen` when the shift is closed.
pub(crate) async fn add_totals(
    conn: &mut SqliteConnection,
    shift_id: &str,
    delta: &ShiftTotals,
) -> DbResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE fiscal_shifts SET
            total_sales   = total_sales + ?2,
            total_refunds = total_refunds + ?3,
            total_cash    = total_cash + ?4,
            total_card    = total_card + ?5,
            total_other   = total_other + ?6,
            receipt_count = receipt_count + ?7
        WHERE id = ?1 AND status = 'open'
        "#,
    )
    .bind(shift_id)
    .bind(delta.sales.minor())
    .bind(delta.refunds.minor())
    .bind(delta.cash.minor())
    .bind(delta.card.minor())
    .bind(delta.other.minor())
    .bind(delta.receipt_count)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::ShiftNotOpen {
            shift_id: shift_id.to_string(),
        }
        .into());
    }

    debug!(shift_id = %shift_id, sales = %delta.sales, refunds = %delta.refunds, "Shift totals updated");
    Ok(())
}

pub(crate) async fn pending_operations(
    conn: &mut SqliteConnection,
    shift_id: &str,
    excluding: Option<&str>,
) -> DbResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM fiscal_queue q WHERE {LIVE_FOR_SHIFT}");
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(shift_id)
        .bind(excluding)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub(crate) async fn close_shift(
    conn: &mut SqliteConnection,
    shift_id: &str,
    z_report_ref: Option<&str>,
    closing_item: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<FiscalShift> {
    let sql = format!(
        r#"
        UPDATE fiscal_shifts SET
            status = 'closed',
            z_report_ref = ?3,
            closed_at = ?4
        WHERE id = ?1 AND status = 'open'
          AND NOT EXISTS (SELECT 1 FROM fiscal_queue q WHERE {LIVE_FOR_SHIFT})
        "#
    );
    let result = sqlx::query(&sql)
        .bind(shift_id)
        .bind(closing_item)
        .bind(z_report_ref)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        // Explain the refusal with the same rules the core applies
        let shift = fetch_shift(conn, shift_id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalShift", shift_id))?;
        let pending = pending_operations(conn, shift_id, closing_item).await?;
        shift.ensure_can_close(pending)?;
        return Err(DbError::conflict(
            "FiscalShift",
            shift_id,
            "shift changed while closing",
        ));
    }

    let shift = fetch_shift(conn, shift_id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalShift", shift_id))?;

    info!(
        shift_id = %shift.id,
        device_id = %shift.device_id,
        sales = %shift.totals.sales,
        refunds = %shift.totals.refunds,
        receipts = shift.totals.receipt_count,
        "Shift closed"
    );
    Ok(shift)
}

/// Closes a shift the provider has already closed, without the pending
/// operations check.
pub(crate) async fn finalize_close(
    conn: &mut SqliteConnection,
    shift_id: &str,
    z_report_ref: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<FiscalShift> {
    let result = sqlx::query(
        "UPDATE fiscal_shifts SET status = 'closed', z_report_ref = ?2, closed_at = ?3 \
         WHERE id = ?1 AND status = 'open'",
    )
    .bind(shift_id)
    .bind(z_report_ref)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::ShiftNotOpen {
            shift_id: shift_id.to_string(),
        }
        .into());
    }

    let shift = fetch_shift(conn, shift_id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalShift", shift_id))?;
    info!(
        shift_id = %shift.id,
        device_id = %shift.device_id,
        sales = %shift.totals.sales,
        refunds = %shift.totals.refunds,
        receipts = shift.totals.receipt_count,
        "Shift closed"
    );
    Ok(shift)
}

/// Stores the Z-report reference of a CLOSED shift.
pub(crate) async fn record_z_report(
    conn: &mut SqliteConnection,
    shift_id: &str,
    z_report_ref: Option<&str>,
) -> DbResult<FiscalShift> {
    let result = sqlx::query(
        "UPDATE fiscal_shifts SET z_report_ref = ?2 WHERE id = ?1 AND status = 'closed'",
    )
    .bind(shift_id)
    .bind(z_report_ref)
    .execute(&mut *conn)
    .await?;

    let shift = fetch_shift(conn, shift_id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalShift", shift_id))?;
    if result.rows_affected() == 0 {
        return Err(DbError::conflict(
            "FiscalShift",
            shift_id,
            "Z-report filed for a shift that is still open",
        ));
    }
    Ok(shift)
}

// =============================================================================
// Unit Tests
// =============================================================================

//! # Fiscal Queue Repository
//!
//! Durable, priority-ordered store of fiscal operations.
//!
//! ## Transition Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. SELECT the row                    (status = RETRY, retry_count = 2) │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  2. vendfisc-core decides the next state                               │
//! │     item.begin_processing(now)?       (status = PROCESSING)             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  3. UPDATE ... WHERE id = ? AND status = 'retry' AND retry_count = 2   │
//! │       │                                                                 │
//! │       ├── 1 row  → transition committed                                │
//! │       └── 0 rows → DbError::Conflict (another worker got there first)  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Deduplication
//! A partial unique index allows one live (PENDING/PROCESSING/RETRY) item
//! per idempotency key. Once that item is terminal, the key is free again
//! and a new, distinct item can be admitted.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{from_millis, opt_from_millis, to_millis};
use crate::error::{DbError, DbResult};
use vendfisc_core::{
    CoreResult, FailureClass, FiscalQueueItem, OperationKind, QueuePayload, QueueStats,
    QueueStatus,
};

pub(crate) const QUEUE_COLUMNS: &str = "seq, id, device_id, operation, idempotency_key, payload, \
     status, priority, retry_count, max_retries, next_retry_at, last_error, last_error_class, \
     result, shift_id, receipt_id, created_at, updated_at, processing_started_at, processed_at, \
     acknowledged_at, acknowledged_by";

/// Live items that belong to shift `?1`, excluding item `?2`.
///
/// Receipts not yet bound to a shift belong to the device's open shift,
/// because that is where the worker will bind them.
pub(crate) const LIVE_FOR_SHIFT: &str = r#"
    q.status IN ('pending', 'processing', 'retry')
    AND (?2 IS NULL OR q.id != ?2)
    AND (
          q.shift_id = ?1
       OR (q.shift_id IS NULL
           AND q.operation IN ('receipt_sale', 'receipt_refund')
           AND q.device_id = (SELECT device_id FROM fiscal_shifts WHERE id = ?1))
    )
"#;

/// Eligible for dispatch at `?1`.
const ELIGIBLE: &str = "(q.status = 'pending' OR (q.status = 'retry' AND q.next_retry_at <= ?1))";

/// Only devices that are ACTIVE and not retired are drained.
const OPERATIONAL_DEVICE: &str = "q.device_id IN \
     (SELECT id FROM fiscal_devices WHERE status = 'active' AND retired_at IS NULL)";

/// Admission input.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub payload: QueuePayload,
    pub priority: i32,
    pub max_retries: u32,
}

impl NewQueueItem {
    pub fn new(payload: QueuePayload, priority: i32, max_retries: u32) -> Self {
        NewQueueItem {
            payload,
            priority,
            max_retries,
        }
    }

    pub fn operation(&self) -> OperationKind {
        self.payload.kind()
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    seq: i64,
    id: String,
    device_id: String,
    operation: OperationKind,
    idempotency_key: String,
    payload: String,
    status: QueueStatus,
    priority: i64,
    retry_count: i64,
    max_retries: i64,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    last_error_class: Option<FailureClass>,
    result: Option<String>,
    shift_id: Option<String>,
    receipt_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    processing_started_at: Option<i64>,
    processed_at: Option<i64>,
    acknowledged_at: Option<i64>,
    acknowledged_by: Option<String>,
}

impl TryFrom<QueueRow> for FiscalQueueItem {
    type Error = DbError;

    fn try_from(row: QueueRow) -> DbResult<Self> {
        let payload: QueuePayload = serde_json::from_str(&row.payload)?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(FiscalQueueItem {
            id: row.id,
            seq: row.seq,
            device_id: row.device_id,
            operation: row.operation,
            idempotency_key: row.idempotency_key,
            payload,
            status: row.status,
            priority: row.priority as i32,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            next_retry_at: opt_from_millis(row.next_retry_at),
            last_error: row.last_error,
            last_error_class: row.last_error_class,
            result,
            shift_id: row.shift_id,
            receipt_id: row.receipt_id,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            processing_started_at: opt_from_millis(row.processing_started_at),
            processed_at: opt_from_millis(row.processed_at),
            acknowledged_at: opt_from_millis(row.acknowledged_at),
            acknowledged_by: row.acknowledged_by,
        })
    }
}

fn rows_to_items(rows: Vec<QueueRow>) -> DbResult<Vec<FiscalQueueItem>> {
    rows.into_iter().map(FiscalQueueItem::try_from).collect()
}

/// Repository for fiscal queue operations.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Creates a new QueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admits an item, deduplicated by idempotency key.
    ///
    /// ## Returns
    /// `(item, created)`: the new item, or the existing live item with the
    /// same key and `created = false`.
    pub async fn enqueue(
        &self,
        new: &NewQueueItem,
        now: DateTime<Utc>,
    ) -> DbResult<(FiscalQueueItem, bool)> {
        let mut conn = self.pool.acquire().await?;
        enqueue(&mut conn, new, now).await
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<FiscalQueueItem>> {
        let mut conn = self.pool.acquire().await?;
        fetch_item(&mut conn, id).await
    }

    pub async fn require(&self, id: &str) -> DbResult<FiscalQueueItem> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalQueueItem", id))
    }

    /// The live item holding `key`, if any.
    pub async fn find_live_by_key(&self, key: &str) -> DbResult<Option<FiscalQueueItem>> {
        let mut conn = self.pool.acquire().await?;
        find_live_by_key(&mut conn, key).await
    }

    /// Every item ever admitted under `key`, oldest first.
    pub async fn history(&self, key: &str) -> DbResult<Vec<FiscalQueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM fiscal_queue WHERE idempotency_key = ?1 ORDER BY seq"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows_to_items(rows)
    }

    /// Items fiscalizing a receipt, oldest first.
    pub async fn list_for_receipt(&self, receipt_id: &str) -> DbResult<Vec<FiscalQueueItem>> {
        let sql =
            format!("SELECT {QUEUE_COLUMNS} FROM fiscal_queue WHERE receipt_id = ?1 ORDER BY seq");
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(receipt_id)
            .fetch_all(&self.pool)
            .await?;
        rows_to_items(rows)
    }

    /// Live items that keep `shift_id` from closing.
    pub async fn pending_for_shift(
        &self,
        shift_id: &str,
        excluding: Option<&str>,
    ) -> DbResult<Vec<FiscalQueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM fiscal_queue q WHERE {LIVE_FOR_SHIFT} ORDER BY q.seq"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(shift_id)
            .bind(excluding)
            .fetch_all(&self.pool)
            .await?;
        rows_to_items(rows)
    }

    /// FAILED items of a device, newest first.
    pub async fn list_failed(
        &self,
        device_id: &str,
        unacknowledged_only: bool,
    ) -> DbResult<Vec<FiscalQueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM fiscal_queue \
             WHERE device_id = ?1 AND status = 'failed' \
               AND (?2 = 0 OR acknowledged_at IS NULL) \
             ORDER BY seq DESC"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(device_id)
            .bind(unacknowledged_only)
            .fetch_all(&self.pool)
            .await?;
        rows_to_items(rows)
    }

    /// FAILED items of every device of an organization, newest first.
    pub async fn list_failed_for_organization(
        &self,
        organization_id: &str,
        unacknowledged_only: bool,
    ) -> DbResult<Vec<FiscalQueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM fiscal_queue \
             WHERE status = 'failed' \
               AND device_id IN (SELECT id FROM fiscal_devices WHERE organization_id = ?1) \
               AND (?2 = 0 OR acknowledged_at IS NULL) \
             ORDER BY seq DESC"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(organization_id)
            .bind(unacknowledged_only)
            .fetch_all(&self.pool)
            .await?;
        rows_to_items(rows)
    }

    /// Counters per status for one device.
    pub async fn stats(&self, device_id: &str) -> DbResult<QueueStats> {
        let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(status = 'pending'), 0),
                COALESCE(SUM(status = 'processing'), 0),
                COALESCE(SUM(status = 'retry'), 0),
                COALESCE(SUM(status = 'success'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'failed' AND acknowledged_at IS NULL), 0)
            FROM fiscal_queue
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            device_id: device_id.to_string(),
            pending: row.0,
            processing: row.1,
            retry: row.2,
            success: row.3,
            failed: row.4,
            unacknowledged_failed: row.5,
        })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Next eligible item: highest priority, then oldest.
    ///
    /// Only items of operational devices are returned. `device_id = None`
    /// considers every device.
    pub async fn next_eligible(
        &self,
        device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<FiscalQueueItem>> {
        let mut conn = self.pool.acquire().await?;
        next_eligible(&mut conn, device_id, now).await
    }

    /// Dequeues the next eligible item and marks it PROCESSING.
    pub async fn claim_next(
        &self,
        device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<FiscalQueueItem>> {
        let mut conn = self.pool.acquire().await?;
        // A lost race only means another worker claimed that item; look again
        for _ in 0..3 {
            let Some(mut item) = next_eligible(&mut conn, device_id, now).await? else {
                return Ok(None);
            };
            let (status, retry_count) = (item.status, item.retry_count);
            item.begin_processing(now)?;
            match write_transition(&mut conn, status, retry_count, &item).await {
                Ok(()) => {
                    debug!(item_id = %item.id, device_id = %item.device_id, operation = %item.operation, "Claimed queue item");
                    return Ok(Some(item));
                }
                Err(DbError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Devices with at least one eligible item, in order of their oldest item.
    pub async fn devices_with_ready_work(&self, now: DateTime<Utc>) -> DbResult<Vec<String>> {
        let sql = format!(
            "SELECT q.device_id FROM fiscal_queue q \
             WHERE {ELIGIBLE} AND {OPERATIONAL_DEVICE} \
             GROUP BY q.device_id ORDER BY MIN(q.seq)"
        );
        let devices: Vec<String> = sqlx::query_scalar(&sql)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// PENDING/RETRY → PROCESSING for a specific item.
    pub async fn mark_processing(&self, id: &str, now: DateTime<Utc>) -> DbResult<FiscalQueueItem> {
        self.apply(id, |item| item.begin_processing(now)).await
    }

    /// PROCESSING → SUCCESS with a result payload.
    pub async fn mark_success(
        &self,
        id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalQueueItem> {
        self.apply(id, |item| item.succeed(result, now)).await
    }

    /// PROCESSING → RETRY.
    ///
    /// Fails with `Domain(RetryLimitExceeded)` when the budget is spent;
    /// the item is left PROCESSING for the caller to mark FAILED.
    pub async fn mark_retry(
        &self,
        id: &str,
        error: &str,
        class: FailureClass,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalQueueItem> {
        self.apply(id, |item| item.schedule_retry(error, class, next_retry_at, now))
            .await
    }

    /// PROCESSING → FAILED.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalQueueItem> {
        self.apply(id, |item| item.fail(error, class, now)).await
    }

    /// Operator cancellation of a never-attempted PENDING item.
    pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> DbResult<FiscalQueueItem> {
        self.apply(id, |item| item.cancel(now)).await
    }

    /// Operator acknowledgement of a FAILED item.
    pub async fn acknowledge(
        &self,
        id: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalQueueItem> {
        self.apply(id, |item| item.acknowledge(operator, now)).await
    }

    /// Records which shift a receipt item is fiscalized into.
    pub async fn bind_shift(
        &self,
        id: &str,
        shift_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalQueueItem> {
        let shift_id = shift_id.to_string();
        self.apply(id, move |item| {
            item.shift_id = Some(shift_id);
            item.updated_at = now;
            Ok(())
        })
        .await
    }

    /// Returns PROCESSING items claimed at or before `claimed_before` to
    /// RETRY (one unit of budget) or FAILED when no budget is left.
    pub async fn recover_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<FiscalQueueItem>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM fiscal_queue WHERE status = 'processing' \
             AND (processing_started_at IS NULL OR processing_started_at <= ?1) ORDER BY seq",
        )
        .bind(to_millis(claimed_before))
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self
                .apply(&id, |item| {
                    if item.has_retry_budget() {
                        item.schedule_retry(
                            "stale processing claim recovered",
                            FailureClass::Transient,
                            now,
                            now,
                        )
                    } else {
                        item.fail(
                            "stale processing claim, retry budget exhausted",
                            FailureClass::Transient,
                            now,
                        )
                    }
                })
                .await;
            match outcome {
                Ok(item) => {
                    warn!(item_id = %item.id, device_id = %item.device_id, status = %item.status, "Recovered stale processing item");
                    recovered.push(item);
                }
                Err(DbError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    async fn apply<F>(&self, id: &str, f: F) -> DbResult<FiscalQueueItem>
    where
        F: FnOnce(&mut FiscalQueueItem) -> CoreResult<()>,
    {
        let mut conn = self.pool.acquire().await?;
        apply_transition(&mut conn, id, f).await
    }
}

// =============================================================================
// Connection-level operations (usable inside a transaction)
// =============================================================================

pub(crate) async fn fetch_item(
    conn: &mut SqliteConnection,
    id: &str,
) -> DbResult<Option<FiscalQueueItem>> {
    let sql = format!("SELECT {QUEUE_COLUMNS} FROM fiscal_queue WHERE id = ?1");
    let row: Option<QueueRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FiscalQueueItem::try_from).transpose()
}

pub(crate) async fn find_live_by_key(
    conn: &mut SqliteConnection,
    key: &str,
) -> DbResult<Option<FiscalQueueItem>> {
    let sql = format!(
        "SELECT {QUEUE_COLUMNS} FROM fiscal_queue \
         WHERE idempotency_key = ?1 AND status IN ('pending', 'processing', 'retry')"
    );
    let row: Option<QueueRow> = sqlx::query_as(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FiscalQueueItem::try_from).transpose()
}

async fn next_eligible(
    conn: &mut SqliteConnection,
    device_id: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<Option<FiscalQueueItem>> {
    let sql = format!(
        "SELECT {QUEUE_COLUMNS} FROM fiscal_queue q \
         WHERE {ELIGIBLE} AND (?2 IS NULL OR q.device_id = ?2) AND {OPERATIONAL_DEVICE} \
         ORDER BY q.priority DESC, q.seq ASC LIMIT 1"
    );
    let row: Option<QueueRow> = sqlx::query_as(&sql)
        .bind(to_millis(now))
        .bind(device_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FiscalQueueItem::try_from).transpose()
}

/// Inserts unless a live item holds the key. `None` on a key conflict.
pub(crate) async fn insert_item(
    conn: &mut SqliteConnection,
    new: &NewQueueItem,
    now: DateTime<Utc>,
) -> DbResult<Option<FiscalQueueItem>> {
    let id = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&new.payload)?;

    let result = sqlx::query(
        r#"
        INSERT INTO fiscal_queue (
            id, device_id, operation, idempotency_key, payload, status,
            priority, retry_count, max_retries, shift_id, receipt_id,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, ?7, ?8, ?9, ?10, ?10)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&id)
    .bind(&new.payload.device_id)
    .bind(new.operation())
    .bind(&new.payload.idempotency_key)
    .bind(&payload)
    .bind(new.priority)
    .bind(new.max_retries)
    .bind(&new.payload.shift_id)
    .bind(&new.payload.receipt_id)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    fetch_item(conn, &id).await
}

pub(crate) async fn enqueue(
    conn: &mut SqliteConnection,
    new: &NewQueueItem,
    now: DateTime<Utc>,
) -> DbResult<(FiscalQueueItem, bool)> {
    // The live holder can turn terminal between our INSERT and SELECT;
    // a second round then inserts successfully.
    for _ in 0..2 {
        if let Some(item) = insert_item(conn, new, now).await? {
            debug!(
                item_id = %item.id,
                device_id = %item.device_id,
                operation = %item.operation,
                key = %item.idempotency_key,
                priority = item.priority,
                "Enqueued fiscal operation"
            );
            return Ok((item, true));
        }
        if let Some(existing) = find_live_by_key(conn, &new.payload.idempotency_key).await? {
            debug!(item_id = %existing.id, key = %existing.idempotency_key, "Deduplicated enqueue");
            return Ok((existing, false));
        }
    }
    Err(DbError::conflict(
        "FiscalQueueItem",
        &new.payload.idempotency_key,
        "idempotency key contended",
    ))
}

/// Compare-and-set write of every mutable column.
pub(crate) async fn write_transition(
    conn: &mut SqliteConnection,
    expected_status: QueueStatus,
    expected_retry_count: u32,
    item: &FiscalQueueItem,
) -> DbResult<()> {
    let result_json = item
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE fiscal_queue SET
            status = ?4,
            retry_count = ?5,
            next_retry_at = ?6,
            last_error = ?7,
            last_error_class = ?8,
            result = ?9,
            shift_id = ?10,
            updated_at = ?11,
            processing_started_at = ?12,
            processed_at = ?13,
            acknowledged_at = ?14,
            acknowledged_by = ?15
        WHERE id = ?1 AND status = ?2 AND retry_count = ?3
        "#,
    )
    .bind(&item.id)
    .bind(expected_status)
    .bind(expected_retry_count)
    .bind(item.status)
    .bind(item.retry_count)
    .bind(item.next_retry_at.map(to_millis))
    .bind(&item.last_error)
    .bind(item.last_error_class)
    .bind(result_json)
    .bind(&item.shift_id)
    .bind(to_millis(item.updated_at))
    .bind(item.processing_started_at.map(to_millis))
    .bind(item.processed_at.map(to_millis))
    .bind(item.acknowledged_at.map(to_millis))
    .bind(&item.acknowledged_by)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict(
            "FiscalQueueItem",
            &item.id,
            format!("expected {expected_status} with {expected_retry_count} retries"),
        ));
    }
    Ok(())
}

/// Load, let the core state machine transition, then compare-and-set.
pub(crate) async fn apply_transition<F>(
    conn: &mut SqliteConnection,
    id: &str,
    f: F,
) -> DbResult<FiscalQueueItem>
where
    F: FnOnce(&mut FiscalQueueItem) -> CoreResult<()>,
{
    let mut item = fetch_item(conn, id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalQueueItem", id))?;
    let (status, retry_count) = (item.status, item.retry_count);
    f(&mut item)?;
    write_transition(conn, status, retry_count, &item).await?;
    Ok(item)
}

// =============================================================================
// Unit Tests
// =============================================================================

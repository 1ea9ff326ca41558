//! # Receipt Repository
//!
//! Receipts and their admission into the fiscal queue.
//!
//! ## Admission
//! ```text
//! admit(draft)
//!   │
//!   ├── live item with key "sale:<saleId>" exists  → return it (no new rows)
//!   ├── SUCCESS receipt for (saleId, type) exists  → return it (no new rows)
//!   └── otherwise, in one transaction:
//!         INSERT fiscal_receipts (PENDING)
//!         INSERT fiscal_queue    (PENDING, receipt_id = new receipt)
//! ```
//! A receipt and the item that fiscalizes it are therefore never observed
//! apart.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::queue::{fetch_item, find_live_by_key, insert_item, NewQueueItem};
use super::shift::current_open;
use super::{from_millis, opt_from_millis, to_millis};
use crate::error::{DbError, DbResult};
use vendfisc_core::operation::FiscalOperation;
use vendfisc_core::queue::CANCELLED_BY_OPERATOR;
use vendfisc_core::{
    FiscalQueueItem, FiscalReceipt, FiscalSignature, QueuePayload, QueueStatus, ReceiptDraft,
    ReceiptStatus, ReceiptType,
};

const RECEIPT_COLUMNS: &str = "id, device_id, shift_id, sale_id, machine_id, receipt_type, status, \
     draft, fiscal_number, fiscal_sign, receipt_url, last_error, shift_applied, created_at, \
     updated_at, fiscalized_at";

#[derive(sqlx::FromRow)]
struct ReceiptRow {
    id: String,
    device_id: String,
    shift_id: Option<String>,
    sale_id: String,
    machine_id: String,
    receipt_type: ReceiptType,
    status: ReceiptStatus,
    draft: String,
    fiscal_number: Option<String>,
    fiscal_sign: Option<String>,
    receipt_url: Option<String>,
    last_error: Option<String>,
    shift_applied: bool,
    created_at: i64,
    updated_at: i64,
    fiscalized_at: Option<i64>,
}

impl TryFrom<ReceiptRow> for FiscalReceipt {
    type Error = DbError;

    fn try_from(row: ReceiptRow) -> DbResult<Self> {
        let draft: ReceiptDraft = serde_json::from_str(&row.draft)?;
        let fiscal = match (row.fiscal_number, row.fiscal_sign) {
            (Some(fiscal_number), Some(fiscal_sign)) => Some(FiscalSignature {
                fiscal_number,
                fiscal_sign,
                receipt_url: row.receipt_url,
            }),
            _ => None,
        };

        Ok(FiscalReceipt {
            id: row.id,
            device_id: row.device_id,
            shift_id: row.shift_id,
            sale_id: row.sale_id,
            machine_id: row.machine_id,
            receipt_type: row.receipt_type,
            status: row.status,
            draft,
            fiscal,
            last_error: row.last_error,
            shift_applied: row.shift_applied,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            fiscalized_at: opt_from_millis(row.fiscalized_at),
        })
    }
}

/// Result of [`ReceiptRepository::admit`].
#[derive(Debug, Clone)]
pub struct ReceiptAdmission {
    pub receipt: FiscalReceipt,
    pub item: FiscalQueueItem,

    /// `false` when an existing receipt/item was returned.
    pub created: bool,
}

/// Repository for receipt operations.
#[derive(Debug, Clone)]
pub struct ReceiptRepository {
    pool: SqlitePool,
}

impl ReceiptRepository {
    /// Creates a new ReceiptRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReceiptRepository { pool }
    }

    /// Admits a receipt draft and its queue item atomically.
    ///
    /// Shift binding is lazy. The receipt and its item take the device's
    /// OPEN shift when one exists at admission. With no open shift both
    /// keep `shift_id = NULL`, and the worker binds them to the shift that
    /// is open right before the provider call, opening one if needed.
    pub async fn admit(
        &self,
        draft: &ReceiptDraft,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> DbResult<ReceiptAdmission> {
        let key = draft.idempotency_key();
        let mut tx = self.pool.begin().await?;

        if let Some(item) = find_live_by_key(&mut *tx, &key).await? {
            let receipt = receipt_of(&mut *tx, &item).await?;
            tx.commit().await?;
            debug!(receipt_id = %receipt.id, item_id = %item.id, key = %key, "Receipt already queued");
            return Ok(ReceiptAdmission {
                receipt,
                item,
                created: false,
            });
        }

        if let Some(receipt) = find_success(&mut *tx, &draft.sale_id, draft.receipt_type).await? {
            let item = latest_item_for_receipt(&mut *tx, &receipt.id).await?;
            tx.commit().await?;
            debug!(receipt_id = %receipt.id, key = %key, "Receipt already fiscalized");
            return Ok(ReceiptAdmission {
                receipt,
                item,
                created: false,
            });
        }

        let shift_id = current_open(&mut *tx, &draft.device_id).await?.map(|s| s.id);
        let receipt_id = Uuid::new_v4().to_string();
        let draft_json = serde_json::to_string(draft)?;

        sqlx::query(
            r#"
            INSERT INTO fiscal_receipts (
                id, device_id, shift_id, sale_id, machine_id, receipt_type, status,
                draft, total, shift_applied, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, 0, ?9, ?9)
            "#,
        )
        .bind(&receipt_id)
        .bind(&draft.device_id)
        .bind(&shift_id)
        .bind(&draft.sale_id)
        .bind(&draft.machine_id)
        .bind(draft.receipt_type)
        .bind(&draft_json)
        .bind(draft.total.minor())
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;

        let body = match draft.receipt_type {
            ReceiptType::Sale => FiscalOperation::ReceiptSale(draft.clone()),
            ReceiptType::Refund => FiscalOperation::ReceiptRefund(draft.clone()),
        };
        let mut payload = QueuePayload::new(&draft.device_id, &key, body).with_receipt(&receipt_id);
        if let Some(shift_id) = &shift_id {
            payload = payload.with_shift(shift_id);
        }

        let Some(item) =
            insert_item(&mut *tx, &NewQueueItem::new(payload, priority, max_retries), now).await?
        else {
            // Another admission took the key after our lookup
            tx.rollback().await?;
            return Err(DbError::conflict("FiscalReceipt", &key, "concurrent admission"));
        };

        let receipt = fetch_receipt(&mut *tx, &receipt_id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalReceipt", &receipt_id))?;
        tx.commit().await?;

        info!(
            receipt_id = %receipt.id,
            item_id = %item.id,
            device_id = %receipt.device_id,
            sale_id = %receipt.sale_id,
            receipt_type = %receipt.receipt_type,
            total = %receipt.draft.total,
            "Receipt admitted"
        );
        Ok(ReceiptAdmission {
            receipt,
            item,
            created: true,
        })
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<FiscalReceipt>> {
        let mut conn = self.pool.acquire().await?;
        fetch_receipt(&mut conn, id).await
    }

    pub async fn require(&self, id: &str) -> DbResult<FiscalReceipt> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalReceipt", id))
    }

    /// Every receipt issued for a sale (sale and refund), oldest first.
    pub async fn find_by_sale(&self, sale_id: &str) -> DbResult<Vec<FiscalReceipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM fiscal_receipts WHERE sale_id = ?1 ORDER BY created_at, rowid"
        );
        let rows: Vec<ReceiptRow> = sqlx::query_as(&sql)
            .bind(sale_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FiscalReceipt::try_from).collect()
    }

    /// The fiscalized receipt for `(sale_id, receipt_type)`, if any.
    pub async fn find_success(
        &self,
        sale_id: &str,
        receipt_type: ReceiptType,
    ) -> DbResult<Option<FiscalReceipt>> {
        let mut conn = self.pool.acquire().await?;
        find_success(&mut conn, sale_id, receipt_type).await
    }

    /// The most recent receipt for `(sale_id, receipt_type)` in any status.
    pub async fn latest_for_sale(
        &self,
        sale_id: &str,
        receipt_type: ReceiptType,
    ) -> DbResult<Option<FiscalReceipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM fiscal_receipts \
             WHERE sale_id = ?1 AND receipt_type = ?2 ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let row: Option<ReceiptRow> = sqlx::query_as(&sql)
            .bind(sale_id)
            .bind(receipt_type)
            .fetch_optional(&self.pool)
            .await?;
        row.map(FiscalReceipt::try_from).transpose()
    }

    /// Receipts fiscalized into a shift.
    pub async fn list_for_shift(&self, shift_id: &str) -> DbResult<Vec<FiscalReceipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM fiscal_receipts WHERE shift_id = ?1 ORDER BY created_at, rowid"
        );
        let rows: Vec<ReceiptRow> = sqlx::query_as(&sql)
            .bind(shift_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FiscalReceipt::try_from).collect()
    }

    /// Brings the receipt status in line with its queue item.
    pub async fn mirror_item(
        &self,
        item: &FiscalQueueItem,
        now: DateTime<Utc>,
    ) -> DbResult<Option<FiscalReceipt>> {
        let mut conn = self.pool.acquire().await?;
        mirror_item(&mut conn, item, now).await
    }

    /// Records the shift a receipt is fiscalized into.
    pub async fn bind_shift(
        &self,
        receipt_id: &str,
        shift_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        bind_shift(&mut conn, receipt_id, shift_id, now).await
    }
}

// =============================================================================
// Connection-level operations (usable inside a transaction)
// =============================================================================

pub(crate) async fn fetch_receipt(
    conn: &mut SqliteConnection,
    id: &str,
) -> DbResult<Option<FiscalReceipt>> {
    let sql = format!("SELECT {RECEIPT_COLUMNS} FROM fiscal_receipts WHERE id = ?1");
    let row: Option<ReceiptRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FiscalReceipt::try_from).transpose()
}

async fn find_success(
    conn: &mut SqliteConnection,
    sale_id: &str,
    receipt_type: ReceiptType,
) -> DbResult<Option<FiscalReceipt>> {
    let sql = format!(
        "SELECT {RECEIPT_COLUMNS} FROM fiscal_receipts \
         WHERE sale_id = ?1 AND receipt_type = ?2 AND status = 'success' LIMIT 1"
    );
    let row: Option<ReceiptRow> = sqlx::query_as(&sql)
        .bind(sale_id)
        .bind(receipt_type)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FiscalReceipt::try_from).transpose()
}

async fn receipt_of(conn: &mut SqliteConnection, item: &FiscalQueueItem) -> DbResult<FiscalReceipt> {
    let receipt_id = item
        .receipt_id
        .as_deref()
        .ok_or_else(|| DbError::Internal(format!("receipt item {} has no receipt", item.id)))?;
    fetch_receipt(conn, receipt_id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalReceipt", receipt_id))
}

async fn latest_item_for_receipt(
    conn: &mut SqliteConnection,
    receipt_id: &str,
) -> DbResult<FiscalQueueItem> {
    let item_id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM fiscal_queue WHERE receipt_id = ?1 ORDER BY seq DESC LIMIT 1",
    )
    .bind(receipt_id)
    .fetch_optional(&mut *conn)
    .await?;
    let item_id = item_id.ok_or_else(|| DbError::not_found("FiscalQueueItem", receipt_id))?;
    fetch_item(conn, &item_id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalQueueItem", &item_id))
}

pub(crate) async fn bind_shift(
    conn: &mut SqliteConnection,
    receipt_id: &str,
    shift_id: &str,
    now: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        "UPDATE fiscal_receipts SET shift_id = ?2, updated_at = ?3 \
         WHERE id = ?1 AND shift_applied = 0",
    )
    .bind(receipt_id)
    .bind(shift_id)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// SUCCESS with the provider's fiscal attributes. Never overwrites an
/// earlier success.
pub(crate) async fn record_signature(
    conn: &mut SqliteConnection,
    receipt_id: &str,
    signature: &FiscalSignature,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE fiscal_receipts SET
            status = 'success',
            fiscal_number = ?2,
            fiscal_sign = ?3,
            receipt_url = ?4,
            last_error = NULL,
            updated_at = ?5,
            fiscalized_at = ?5
        WHERE id = ?1 AND status != 'success'
        "#,
    )
    .bind(receipt_id)
    .bind(&signature.fiscal_number)
    .bind(&signature.fiscal_sign)
    .bind(&signature.receipt_url)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict(
            "FiscalReceipt",
            receipt_id,
            "receipt is already fiscalized",
        ));
    }
    Ok(())
}

/// Flags the receipt's totals as applied to `shift_id`.
///
/// Returns `false` if they were applied before.
pub(crate) async fn mark_shift_applied(
    conn: &mut SqliteConnection,
    receipt_id: &str,
    shift_id: &str,
) -> DbResult<bool> {
    let result = sqlx::query(
        "UPDATE fiscal_receipts SET shift_applied = 1, shift_id = ?2 \
         WHERE id = ?1 AND shift_applied = 0",
    )
    .bind(receipt_id)
    .bind(shift_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Receipt status that mirrors a queue item. `None` for SUCCESS, which is
/// only ever written together with the fiscal signature.
fn mirrored_status(item: &FiscalQueueItem) -> Option<ReceiptStatus> {
    match item.status {
        QueueStatus::Pending | QueueStatus::Retry => Some(ReceiptStatus::Pending),
        QueueStatus::Processing => Some(ReceiptStatus::Processing),
        QueueStatus::Failed if item.last_error.as_deref() == Some(CANCELLED_BY_OPERATOR) => {
            Some(ReceiptStatus::Cancelled)
        }
        QueueStatus::Failed => Some(ReceiptStatus::Failed),
        QueueStatus::Success => None,
    }
}

pub(crate) async fn mirror_item(
    conn: &mut SqliteConnection,
    item: &FiscalQueueItem,
    now: DateTime<Utc>,
) -> DbResult<Option<FiscalReceipt>> {
    let Some(receipt_id) = item.receipt_id.as_deref() else {
        return Ok(None);
    };
    if let Some(status) = mirrored_status(item) {
        sqlx::query(
            "UPDATE fiscal_receipts SET status = ?2, last_error = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status != 'success'",
        )
        .bind(receipt_id)
        .bind(status)
        .bind(&item.last_error)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;
    }
    fetch_receipt(conn, receipt_id).await
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{db, device, t0};
    use vendfisc_core::receipt::{build, PaymentSplit, SaleEvent, SaleLine, TaxTable};
    use vendfisc_core::{Money, VatRate};

    fn draft(device_id: &str, sale_id: &str, amount: i64) -> ReceiptDraft {
        let table = TaxTable::new().with_rate("vat20", VatRate::from_bps(2000));
        let sale = SaleEvent {
            sale_id: sale_id.to_string(),
            machine_id: "vm-7".to_string(),
            device_id: device_id.to_string(),
            receipt_type: ReceiptType::Sale,
            lines: vec![SaleLine {
                name: "Coffee".to_string(),
                sku: None,
                quantity: 1,
                unit_price: Money::from_minor(amount),
                tax_code: Some("vat20".to_string()),
            }],
            payment: PaymentSplit {
                card: Money::from_minor(amount),
                ..Default::default()
            },
        };
        build(&sale, &table).unwrap()
    }

    #[tokio::test]
    async fn test_admit_creates_receipt_and_item() {
        let db = db().await;
        let d = device(&db, "D1").await;

        let admission = db.receipts().admit(&draft(&d.id, "sale-42", 100000), 5, 10, t0()).await.unwrap();
        assert!(admission.created);
        assert_eq!(admission.receipt.status, ReceiptStatus::Pending);
        assert_eq!(admission.receipt.shift_id, None);
        assert_eq!(admission.item.shift_id, None);
        assert_eq!(admission.item.idempotency_key, "sale:sale-42");
        assert_eq!(admission.item.receipt_id.as_deref(), Some(admission.receipt.id.as_str()));
        assert_eq!(admission.item.max_retries, 10);
    }

    #[tokio::test]
    async fn test_admit_is_idempotent_while_live() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let first = db.receipts().admit(&draft(&d.id, "sale-42", 100000), 5, 10, t0()).await.unwrap();
        let again = db.receipts().admit(&draft(&d.id, "sale-42", 100000), 5, 10, t0()).await.unwrap();

        assert!(!again.created);
        assert_eq!(again.receipt.id, first.receipt.id);
        assert_eq!(again.item.id, first.item.id);
        assert_eq!(db.receipts().find_by_sale("sale-42").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_admit_binds_open_shift() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let shift = db.shifts().open(&d.id, "Anna", None, t0()).await.unwrap();

        let admission = db.receipts().admit(&draft(&d.id, "sale-1", 500), 5, 10, t0()).await.unwrap();
        assert_eq!(admission.receipt.shift_id.as_deref(), Some(shift.id.as_str()));
        assert_eq!(admission.item.shift_id.as_deref(), Some(shift.id.as_str()));
        assert_eq!(db.shifts().pending_operations(&shift.id, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mirror_item_tracks_queue_status() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let admission = db.receipts().admit(&draft(&d.id, "sale-1", 500), 5, 10, t0()).await.unwrap();

        let cancelled = db.queue().cancel(&admission.item.id, t0()).await.unwrap();
        let receipt = db.receipts().mirror_item(&cancelled, t0()).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Cancelled);

        // A cancelled sale can be submitted again as a new receipt
        let retry = db.receipts().admit(&draft(&d.id, "sale-1", 500), 5, 10, t0()).await.unwrap();
        assert!(retry.created);
        assert_ne!(retry.receipt.id, admission.receipt.id);
    }
}

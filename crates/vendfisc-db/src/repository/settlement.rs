//! # Settlement Repository
//!
//! Outcomes that touch more than one table, each applied in a single
//! transaction.
//!
//! ## Receipt Success
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BEGIN                                                                  │
//! │    fiscal_receipts  status = success, fiscal number/sign/url            │
//! │    fiscal_shifts    totals += receipt  (only if shift_applied = 0       │
//! │                                         and the shift is still OPEN)    │
//! │    fiscal_receipts  shift_applied = 1                                   │
//! │    fiscal_queue     PROCESSING → SUCCESS (compare-and-set)              │
//! │  COMMIT                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//! If the shift closed underneath us the fiscal signature is still stored,
//! because the provider has fiscalized the receipt, but the item goes to
//! FAILED with an invariant violation for an operator to resolve.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, error, info};

use super::queue::{apply_transition, enqueue, fetch_item, NewQueueItem};
use super::receipt::{fetch_receipt, mark_shift_applied, mirror_item, record_signature};
use super::shift::{
    add_totals, close_shift, current_open, finalize_close, open_shift, record_z_report,
};
use crate::error::{DbError, DbResult};
use vendfisc_core::{
    CoreError, FailureClass, FiscalQueueItem, FiscalReceipt, FiscalShift, FiscalSignature,
    ReceiptStatus, ShiftTotals,
};

/// Result of [`SettlementRepository::settle_receipt`].
#[derive(Debug, Clone)]
pub enum ReceiptSettlement {
    /// Receipt SUCCESS, totals applied, item SUCCESS.
    Applied {
        receipt: FiscalReceipt,
        item: FiscalQueueItem,
    },
    /// Receipt SUCCESS but the shift was no longer OPEN; item FAILED.
    ShiftNotOpen {
        receipt: FiscalReceipt,
        item: FiscalQueueItem,
    },
}

impl ReceiptSettlement {
    pub fn item(&self) -> &FiscalQueueItem {
        match self {
            ReceiptSettlement::Applied { item, .. } | ReceiptSettlement::ShiftNotOpen { item, .. } => {
                item
            }
        }
    }

    pub fn receipt(&self) -> &FiscalReceipt {
        match self {
            ReceiptSettlement::Applied { receipt, .. }
            | ReceiptSettlement::ShiftNotOpen { receipt, .. } => receipt,
        }
    }
}

/// Result of [`SettlementRepository::settle_shift_open`].
#[derive(Debug, Clone)]
pub struct ShiftOpenSettlement {
    pub shift: FiscalShift,
    pub item: FiscalQueueItem,

    /// `false` when the device already had an OPEN shift.
    pub opened: bool,
}

/// Repository for multi-table outcomes.
#[derive(Debug, Clone)]
pub struct SettlementRepository {
    pool: SqlitePool,
}

impl SettlementRepository {
    /// Creates a new SettlementRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SettlementRepository { pool }
    }

    /// Applies a successful provider response for a receipt item.
    pub async fn settle_receipt(
        &self,
        item_id: &str,
        shift_id: &str,
        signature: &FiscalSignature,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> DbResult<ReceiptSettlement> {
        let mut tx = self.pool.begin().await?;
        let item = require_item(&mut *tx, item_id).await?;
        let receipt_id = item
            .receipt_id
            .clone()
            .ok_or_else(|| DbError::Internal(format!("receipt item {item_id} has no receipt")))?;

        record_signature(&mut *tx, &receipt_id, signature, now).await?;
        let receipt = fetch_receipt(&mut *tx, &receipt_id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalReceipt", &receipt_id))?;

        let mut shift_open = true;
        if !receipt.shift_applied {
            match add_totals(&mut *tx, shift_id, &ShiftTotals::delta_for(&receipt.draft)).await {
                Ok(()) => {
                    mark_shift_applied(&mut *tx, &receipt_id, shift_id).await?;
                }
                Err(DbError::Domain(CoreError::ShiftNotOpen { .. })) => shift_open = false,
                Err(e) => return Err(e),
            }
        }

        let bound = shift_id.to_string();
        let item = apply_transition(&mut *tx, item_id, move |item| {
            item.shift_id = Some(bound);
            if shift_open {
                item.succeed(result, now)
            } else {
                item.fail(
                    "receipt fiscalized after its shift closed, totals not applied",
                    FailureClass::InvariantViolation,
                    now,
                )
            }
        })
        .await?;

        let receipt = fetch_receipt(&mut *tx, &receipt_id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalReceipt", &receipt_id))?;
        tx.commit().await?;

        if shift_open {
            info!(
                item_id = %item.id,
                receipt_id = %receipt.id,
                shift_id = %shift_id,
                fiscal_number = %signature.fiscal_number,
                total = %receipt.draft.total,
                "Receipt fiscalized"
            );
            Ok(ReceiptSettlement::Applied { receipt, item })
        } else {
            error!(
                alert = true,
                item_id = %item.id,
                receipt_id = %receipt.id,
                shift_id = %shift_id,
                fiscal_number = %signature.fiscal_number,
                "Receipt fiscalized into a shift that is no longer open"
            );
            Ok(ReceiptSettlement::ShiftNotOpen { receipt, item })
        }
    }

    /// Adds a fiscalized receipt's totals to a shift, at most once.
    ///
    /// Returns `false` when the totals were already applied. Fails with
    /// `ShiftNotOpen` when the shift has closed.
    pub async fn apply_receipt_to_shift(
        &self,
        receipt_id: &str,
        shift_id: &str,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let receipt = fetch_receipt(&mut *tx, receipt_id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalReceipt", receipt_id))?;
        if receipt.status != ReceiptStatus::Success {
            return Err(DbError::conflict(
                "FiscalReceipt",
                receipt_id,
                "receipt is not fiscalized",
            ));
        }
        if receipt.shift_applied {
            return Ok(false);
        }

        add_totals(&mut *tx, shift_id, &ShiftTotals::delta_for(&receipt.draft)).await?;
        let applied = mark_shift_applied(&mut *tx, receipt_id, shift_id).await?;
        tx.commit().await?;

        debug!(receipt_id = %receipt_id, shift_id = %shift_id, applied, "Receipt applied to shift");
        Ok(applied)
    }

    /// Opens the shift the provider just opened and completes the item.
    ///
    /// If the device already has an OPEN shift it is returned unchanged.
    pub async fn settle_shift_open(
        &self,
        item_id: &str,
        device_id: &str,
        cashier: &str,
        provider_shift_number: Option<i64>,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> DbResult<ShiftOpenSettlement> {
        let mut tx = self.pool.begin().await?;

        let (shift, opened) = match current_open(&mut *tx, device_id).await? {
            Some(existing) => (existing, false),
            None => (
                open_shift(&mut *tx, device_id, cashier, provider_shift_number, now).await?,
                true,
            ),
        };

        let shift_id = shift.id.clone();
        let item = apply_transition(&mut *tx, item_id, move |item| {
            item.shift_id = Some(shift_id);
            item.succeed(result, now)
        })
        .await?;
        tx.commit().await?;

        Ok(ShiftOpenSettlement {
            shift,
            item,
            opened,
        })
    }

    /// Closes the shift the provider just closed and completes the item.
    ///
    /// The caller checks pending operations before asking the provider.
    /// Receipts admitted while the provider was closing the shift have not
    /// been fiscalized into it; they are unbound and will bind to the next
    /// shift.
    pub async fn settle_shift_close(
        &self,
        item_id: &str,
        shift_id: &str,
        z_report_ref: Option<&str>,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> DbResult<(FiscalShift, FiscalQueueItem)> {
        let mut tx = self.pool.begin().await?;

        let released = unbind_waiting_receipts(&mut *tx, shift_id, item_id).await?;
        if released > 0 {
            info!(shift_id = %shift_id, released, "Unbound receipts admitted during close");
        }

        let shift = finalize_close(&mut *tx, shift_id, z_report_ref, now).await?;
        let item = apply_transition(&mut *tx, item_id, |item| item.succeed(result, now)).await?;
        tx.commit().await?;

        Ok((shift, item))
    }

    /// Closes an OPEN shift locally and queues the `shift_close` item that
    /// files its Z-report, both or neither.
    ///
    /// Fails with `ShiftNotOpen` or `PendingOperations`, queueing nothing.
    pub async fn close_with_z_report(
        &self,
        shift_id: &str,
        z_report: &NewQueueItem,
        now: DateTime<Utc>,
    ) -> DbResult<(FiscalShift, FiscalQueueItem)> {
        let mut tx = self.pool.begin().await?;
        let shift = close_shift(&mut *tx, shift_id, None, None, now).await?;
        let (item, _) = enqueue(&mut *tx, z_report, now).await?;
        tx.commit().await?;
        Ok((shift, item))
    }

    /// Stores the Z-report of a locally closed shift and completes the item.
    pub async fn settle_z_report(
        &self,
        item_id: &str,
        shift_id: &str,
        z_report_ref: Option<&str>,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> DbResult<(FiscalShift, FiscalQueueItem)> {
        let mut tx = self.pool.begin().await?;
        let shift = record_z_report(&mut *tx, shift_id, z_report_ref).await?;
        let item = apply_transition(&mut *tx, item_id, |item| item.succeed(result, now)).await?;
        tx.commit().await?;
        Ok((shift, item))
    }

    /// PROCESSING → RETRY when `next_retry_at` is given and budget remains,
    /// otherwise PROCESSING → FAILED. The receipt (if any) follows.
    pub async fn record_failure(
        &self,
        item_id: &str,
        message: &str,
        class: FailureClass,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalQueueItem> {
        let mut tx = self.pool.begin().await?;
        let item = apply_transition(&mut *tx, item_id, |item| match next_retry_at {
            Some(at) if item.has_retry_budget() => item.schedule_retry(message, class, at, now),
            _ => item.fail(message, class, now),
        })
        .await?;
        mirror_item(&mut *tx, &item, now).await?;
        tx.commit().await?;
        Ok(item)
    }

    /// Operator cancellation; the receipt becomes CANCELLED.
    pub async fn cancel_item(&self, item_id: &str, now: DateTime<Utc>) -> DbResult<FiscalQueueItem> {
        let mut tx = self.pool.begin().await?;
        let item = apply_transition(&mut *tx, item_id, |item| item.cancel(now)).await?;
        mirror_item(&mut *tx, &item, now).await?;
        tx.commit().await?;
        Ok(item)
    }
}

async fn require_item(conn: &mut SqliteConnection, item_id: &str) -> DbResult<FiscalQueueItem> {
    fetch_item(conn, item_id)
        .await?
        .ok_or_else(|| DbError::not_found("FiscalQueueItem", item_id))
}

async fn unbind_waiting_receipts(
    conn: &mut SqliteConnection,
    shift_id: &str,
    closing_item: &str,
) -> DbResult<u64> {
    let items = sqlx::query(
        r#"
        UPDATE fiscal_queue SET shift_id = NULL
        WHERE shift_id = ?1 AND id != ?2
          AND status IN ('pending', 'retry')
          AND operation IN ('receipt_sale', 'receipt_refund')
        "#,
    )
    .bind(shift_id)
    .bind(closing_item)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE fiscal_receipts SET shift_id = NULL
        WHERE shift_id = ?1 AND shift_applied = 0 AND status IN ('pending', 'processing')
          AND id IN (SELECT receipt_id FROM fiscal_queue
                     WHERE receipt_id IS NOT NULL AND shift_id IS NULL
                       AND status IN ('pending', 'retry'))
        "#,
    )
    .bind(shift_id)
    .execute(&mut *conn)
    .await?;

    Ok(items.rows_affected())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{db, device, t0};
    use vendfisc_core::receipt::{build, PaymentSplit, SaleEvent, SaleLine, TaxTable};
    use vendfisc_core::{Money, QueueStatus, ReceiptDraft, ReceiptStatus, ReceiptType, VatRate};

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
                cash: Money::from_minor(amount),
                ..Default::default()
            },
        };
        build(&sale, &table).unwrap()
    }

    fn signature(n: &str) -> FiscalSignature {
        FiscalSignature {
            fiscal_number: n.to_string(),
            fiscal_sign: format!("sign-{n}"),
            receipt_url: None,
        }
    }

    #[tokio::test]
    async fn test_settle_receipt_applies_totals_once() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let shift = db.shifts().open(&d.id, "Anna", None, t0()).await.unwrap();
        let admission = db.receipts().admit(&draft(&d.id, "sale-42", 100000), 5, 10, t0()).await.unwrap();
        db.queue().mark_processing(&admission.item.id, t0()).await.unwrap();

        let settled = db
            .settlements()
            .settle_receipt(&admission.item.id, &shift.id, &signature("FN-1"), serde_json::json!({}), t0())
            .await
            .unwrap();
        assert!(matches!(settled, ReceiptSettlement::Applied { .. }));
        assert_eq!(settled.item().status, QueueStatus::Success);
        assert_eq!(settled.receipt().status, ReceiptStatus::Success);
        assert!(settled.receipt().shift_applied);
        assert_eq!(settled.receipt().fiscal.as_ref().unwrap().fiscal_number, "FN-1");

        let shift = db.shifts().require(&shift.id).await.unwrap();
        assert_eq!(shift.totals.sales.minor(), 100000);
        assert_eq!(shift.totals.cash.minor(), 100000);
        assert_eq!(shift.totals.receipt_count, 1);

        // A second settlement of the same item cannot fiscalize twice
        assert!(db
            .settlements()
            .settle_receipt(&admission.item.id, &shift.id, &signature("FN-2"), serde_json::json!({}), t0())
            .await
            .is_err());
        let shift = db.shifts().require(&shift.id).await.unwrap();
        assert_eq!(shift.totals.receipt_count, 1);
    }

    #[tokio::test]
    async fn test_settle_receipt_into_closed_shift() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let shift = db.shifts().open(&d.id, "Anna", None, t0()).await.unwrap();
        db.shifts().close(&shift.id, None, None, t0()).await.unwrap();

        let admission = db.receipts().admit(&draft(&d.id, "sale-1", 500), 5, 10, t0()).await.unwrap();
        db.queue().mark_processing(&admission.item.id, t0()).await.unwrap();

        let settled = db
            .settlements()
            .settle_receipt(&admission.item.id, &shift.id, &signature("FN-9"), serde_json::json!({}), t0())
            .await
            .unwrap();
        assert!(matches!(settled, ReceiptSettlement::ShiftNotOpen { .. }));
        assert_eq!(settled.item().status, QueueStatus::Failed);
        assert_eq!(settled.item().last_error_class, Some(FailureClass::InvariantViolation));
        assert_eq!(settled.receipt().status, ReceiptStatus::Success);
        assert!(!settled.receipt().shift_applied);

        let shift = db.shifts().require(&shift.id).await.unwrap();
        assert_eq!(shift.totals.receipt_count, 0);
    }

    #[tokio::test]
    async fn test_apply_receipt_to_shift_is_idempotent() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let shift = db.shifts().open(&d.id, "Anna", None, t0()).await.unwrap();
        let admission = db.receipts().admit(&draft(&d.id, "sale-9", 2500), 5, 10, t0()).await.unwrap();

        // Not fiscalized yet
        assert!(db
            .settlements()
            .apply_receipt_to_shift(&admission.receipt.id, &shift.id)
            .await
            .is_err());

        db.queue().mark_processing(&admission.item.id, t0()).await.unwrap();
        db.settlements()
            .settle_receipt(&admission.item.id, &shift.id, &signature("FN-9"), serde_json::json!({}), t0())
            .await
            .unwrap();

        let applied = db
            .settlements()
            .apply_receipt_to_shift(&admission.receipt.id, &shift.id)
            .await
            .unwrap();
        assert!(!applied);
        let shift = db.shifts().require(&shift.id).await.unwrap();
        assert_eq!(shift.totals.sales.minor(), 2500);
        assert_eq!(shift.totals.receipt_count, 1);
    }

    #[tokio::test]
    async fn test_settle_shift_open_is_noop_when_open() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let existing = db.shifts().open(&d.id, "Anna", None, t0()).await.unwrap();

        let payload = vendfisc_core::QueuePayload::new(
            &d.id,
            "shift_open:x",
            vendfisc_core::FiscalOperation::ShiftOpen(vendfisc_core::operation::ShiftOpenRequest {
                cashier: "Anna".to_string(),
                trigger: vendfisc_core::operation::ShiftTrigger::Manual,
            }),
        );
        let (item, _) = db
            .queue()
            .enqueue(&crate::repository::queue::NewQueueItem::new(payload, 10, 20), t0())
            .await
            .unwrap();
        db.queue().mark_processing(&item.id, t0()).await.unwrap();

        let settled = db
            .settlements()
            .settle_shift_open(&item.id, &d.id, "Anna", None, serde_json::json!({}), t0())
            .await
            .unwrap();
        assert!(!settled.opened);
        assert_eq!(settled.shift.id, existing.id);
        assert_eq!(settled.item.status, QueueStatus::Success);
        assert_eq!(settled.item.shift_id.as_deref(), Some(existing.id.as_str()));
    }

    #[tokio::test]
    async fn test_record_failure_mirrors_receipt() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let admission = db.receipts().admit(&draft(&d.id, "sale-1", 500), 5, 2, t0()).await.unwrap();
        db.queue().mark_processing(&admission.item.id, t0()).await.unwrap();

        let item = db
            .settlements()
            .record_failure(&admission.item.id, "timeout", FailureClass::Transient, Some(t0()), t0())
            .await
            .unwrap();
        assert_eq!(item.status, QueueStatus::Retry);
        let receipt = db.receipts().require(&admission.receipt.id).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);
        assert_eq!(receipt.last_error.as_deref(), Some("timeout"));

        db.queue().mark_processing(&item.id, t0()).await.unwrap();
        let item = db
            .settlements()
            .record_failure(&item.id, "timeout", FailureClass::Transient, Some(t0()), t0())
            .await
            .unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 1);
        let receipt = db.receipts().require(&admission.receipt.id).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
    }

    #[tokio::test]
    async fn test_settle_shift_close_unbinds_late_receipts() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let shift = db.shifts().open(&d.id, "Anna", None, t0()).await.unwrap();

        let payload = vendfisc_core::QueuePayload::new(
            &d.id,
            vendfisc_core::operation::shift_close_key(&shift.id),
            vendfisc_core::FiscalOperation::ShiftClose(vendfisc_core::operation::ShiftCloseRequest {
                shift_id: shift.id.clone(),
                cashier: "Anna".to_string(),
                trigger: vendfisc_core::operation::ShiftTrigger::Manual,
                z_report_only: false,
            }),
        )
        .with_shift(&shift.id);
        let (close_item, _) = db
            .queue()
            .enqueue(&crate::repository::queue::NewQueueItem::new(payload, 1, 20), t0())
            .await
            .unwrap();
        db.queue().mark_processing(&close_item.id, t0()).await.unwrap();

        // Admitted while the provider was closing the shift
        let late = db.receipts().admit(&draft(&d.id, "sale-7", 500), 5, 10, t0()).await.unwrap();
        assert_eq!(late.item.shift_id.as_deref(), Some(shift.id.as_str()));

        let (closed, item) = db
            .settlements()
            .settle_shift_close(&close_item.id, &shift.id, Some("Z-1"), serde_json::json!({}), t0())
            .await
            .unwrap();
        assert_eq!(closed.status, vendfisc_core::ShiftStatus::Closed);
        assert_eq!(closed.z_report_ref.as_deref(), Some("Z-1"));
        assert_eq!(item.status, QueueStatus::Success);

        let late_item = db.queue().require(&late.item.id).await.unwrap();
        assert_eq!(late_item.shift_id, None);
        let late_receipt = db.receipts().require(&late.receipt.id).await.unwrap();
        assert_eq!(late_receipt.shift_id, None);
    }

    fn z_report_item(device_id: &str, shift_id: &str) -> NewQueueItem {
        let payload = vendfisc_core::QueuePayload::new(
            device_id,
            vendfisc_core::operation::shift_close_key(shift_id),
            vendfisc_core::FiscalOperation::ShiftClose(vendfisc_core::operation::ShiftCloseRequest {
                shift_id: shift_id.to_string(),
                cashier: "Anna".to_string(),
                trigger: vendfisc_core::operation::ShiftTrigger::Manual,
                z_report_only: true,
            }),
        )
        .with_shift(shift_id);
        NewQueueItem::new(payload, 1, 20)
    }

    #[tokio::test]
    async fn test_close_with_z_report_is_all_or_nothing() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let shift = db.shifts().open(&d.id, "Anna", None, t0()).await.unwrap();
        let pending = db.receipts().admit(&draft(&d.id, "sale-1", 500), 5, 10, t0()).await.unwrap();

        let err = db
            .settlements()
            .close_with_z_report(&shift.id, &z_report_item(&d.id, &shift.id), t0())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::Domain(CoreError::PendingOperations { pending: 1, .. })
        ));
        assert!(db.shifts().require(&shift.id).await.unwrap().is_open());
        assert_eq!(db.queue().stats(&d.id).await.unwrap().pending, 1);

        db.settlements().cancel_item(&pending.item.id, t0()).await.unwrap();
        let (closed, item) = db
            .settlements()
            .close_with_z_report(&shift.id, &z_report_item(&d.id, &shift.id), t0())
            .await
            .unwrap();
        assert_eq!(closed.status, vendfisc_core::ShiftStatus::Closed);
        assert_eq!(closed.z_report_ref, None);
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.shift_id.as_deref(), Some(shift.id.as_str()));

        db.queue().mark_processing(&item.id, t0()).await.unwrap();
        let (filed, done) = db
            .settlements()
            .settle_z_report(&item.id, &shift.id, Some("Z-9"), serde_json::json!({}), t0())
            .await
            .unwrap();
        assert_eq!(filed.z_report_ref.as_deref(), Some("Z-9"));
        assert_eq!(filed.status, vendfisc_core::ShiftStatus::Closed);
        assert_eq!(done.status, QueueStatus::Success);
    }
}

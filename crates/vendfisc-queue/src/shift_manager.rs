//! # Shift Manager
//!
//! OPEN/CLOSED lifecycle of fiscal shifts.
//!
//! ## Flow
//! ```text
//!  request_open ──► shift_open item ──► worker ──► provider ──► OPEN shift
//!                                                               │
//!        receipts fiscalized into it, totals applied once ◄─────┘
//!                                                               │
//!  request_close ─► shift_close item ─► worker waits for the    │
//!                                       shift's live items ──► CLOSED + Z-report
//! ```
//!
//! Status changes never happen behind the queue's back: operator and
//! scheduled opens/closes are queue items, processed in priority order with
//! the receipts of the device.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use vendfisc_core::operation::{
    shift_close_key, shift_open_key, x_report_key, ShiftCloseRequest, ShiftOpenRequest,
    ShiftTrigger, XReportRequest,
};
use vendfisc_core::validation::validate_cashier;
use vendfisc_core::{
    CoreError, FiscalOperation, FiscalQueueItem, FiscalShift, OperationKind, QueuePayload,
    ShiftTotals,
};
use vendfisc_db::{Database, NewQueueItem};

use crate::error::QueueResult;
use crate::fiscal_queue::FiscalQueue;

/// Shift lifecycle service.
#[derive(Debug, Clone)]
pub struct ShiftManager {
    queue: FiscalQueue,
    max_shift_duration: chrono::Duration,
}

impl ShiftManager {
    pub fn new(queue: FiscalQueue, max_shift_duration: chrono::Duration) -> Self {
        ShiftManager {
            queue,
            max_shift_duration,
        }
    }

    fn db(&self) -> &Database {
        self.queue.db()
    }

    pub fn max_shift_duration(&self) -> chrono::Duration {
        self.max_shift_duration
    }

    // =========================================================================
    // Local transitions
    // =========================================================================

    /// Opens a shift locally: sequence = previous + 1, zero totals.
    ///
    /// Fails with `ShiftAlreadyOpen` when the device has an OPEN shift.
    pub async fn open_shift(
        &self,
        device_id: &str,
        cashier: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalShift> {
        validate_cashier(cashier).map_err(CoreError::from)?;
        Ok(self.db().shifts().open(device_id, cashier, None, now).await?)
    }

    /// Closes a shift locally and freezes its totals.
    ///
    /// Fails with `ShiftNotOpen` or `PendingOperations`. On success the
    /// returned `shift_close` item is queued in the same transaction; the
    /// worker files the Z-report with the provider and stores its number
    /// on the closed shift.
    pub async fn close_shift(
        &self,
        shift_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<(FiscalShift, FiscalQueueItem)> {
        let shift = self.db().shifts().require(shift_id).await?;
        shift.ensure_open()?;

        let payload = QueuePayload::new(
            &shift.device_id,
            shift_close_key(shift_id),
            FiscalOperation::ShiftClose(ShiftCloseRequest {
                shift_id: shift_id.to_string(),
                cashier: shift.cashier.clone(),
                trigger: ShiftTrigger::Manual,
                z_report_only: true,
            }),
        )
        .with_shift(shift_id);
        let kind = OperationKind::ShiftClose;
        let z_report = NewQueueItem::new(
            payload,
            self.queue.priority(kind),
            self.queue.policy(kind).max_retries,
        );

        let (closed, item) = self
            .db()
            .settlements()
            .close_with_z_report(shift_id, &z_report, now)
            .await?;
        info!(shift_id = %shift_id, device_id = %closed.device_id, item_id = %item.id, "Shift closed locally, Z-report queued");
        Ok((closed, item))
    }

    /// Adds a fiscalized receipt to the shift's totals, at most once.
    ///
    /// The worker applies totals inside its success transaction
    /// (`settle_receipt`); this is the operator repair path for a receipt
    /// whose totals were never applied. `ShiftNotOpen` here is an
    /// invariant violation and is never retried.
    pub async fn apply_receipt_to_shift(
        &self,
        shift_id: &str,
        receipt_id: &str,
    ) -> QueueResult<bool> {
        Ok(self
            .db()
            .settlements()
            .apply_receipt_to_shift(receipt_id, shift_id)
            .await?)
    }

    // =========================================================================
    // Queued requests
    // =========================================================================

    /// Queues a `shift_open` for the device.
    ///
    /// The key is bound to the next shift sequence, so repeated requests
    /// before the shift opens collapse into one item.
    pub async fn request_open(
        &self,
        device_id: &str,
        cashier: Option<&str>,
        trigger: ShiftTrigger,
        now: DateTime<Utc>,
    ) -> QueueResult<(FiscalQueueItem, bool)> {
        let device = self.db().devices().require(device_id).await?;
        let current = self.db().shifts().current_open(device_id).await?;
        FiscalShift::ensure_can_open(device_id, current.as_ref())?;

        let cashier = cashier.unwrap_or(&device.default_cashier).to_string();
        validate_cashier(&cashier).map_err(CoreError::from)?;

        let latest = self.db().shifts().latest(device_id).await?;
        let sequence = FiscalShift::next_sequence(latest.as_ref());
        let payload = QueuePayload::new(
            device_id,
            shift_open_key(device_id, sequence),
            FiscalOperation::ShiftOpen(ShiftOpenRequest { cashier, trigger }),
        );

        let (item, created) = self.queue.enqueue(payload, None, None, now).await?;
        if created {
            info!(device_id = %device_id, sequence, trigger = ?trigger, item_id = %item.id, "Shift open requested");
        }
        Ok((item, created))
    }

    /// Queues a `shift_close` for an OPEN shift.
    ///
    /// The item waits (precondition retries) until no other live item
    /// references the shift.
    pub async fn request_close(
        &self,
        shift_id: &str,
        cashier: Option<&str>,
        trigger: ShiftTrigger,
        now: DateTime<Utc>,
    ) -> QueueResult<(FiscalQueueItem, bool)> {
        let shift = self.db().shifts().require(shift_id).await?;
        shift.ensure_open()?;

        let cashier = cashier.unwrap_or(&shift.cashier).to_string();
        validate_cashier(&cashier).map_err(CoreError::from)?;

        let payload = QueuePayload::new(
            &shift.device_id,
            shift_close_key(shift_id),
            FiscalOperation::ShiftClose(ShiftCloseRequest {
                shift_id: shift_id.to_string(),
                cashier,
                trigger,
                z_report_only: false,
            }),
        )
        .with_shift(shift_id);

        let (item, created) = self.queue.enqueue(payload, None, None, now).await?;
        if created {
            info!(shift_id = %shift_id, device_id = %shift.device_id, trigger = ?trigger, item_id = %item.id, "Shift close requested");
        }
        Ok((item, created))
    }

    /// Queues an interim X-report for the device's OPEN shift.
    ///
    /// `request_id` makes the request idempotent; a fresh one is generated
    /// when absent.
    pub async fn request_x_report(
        &self,
        device_id: &str,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<(FiscalQueueItem, bool)> {
        let device = self.db().devices().require(device_id).await?;
        let shift = self
            .db()
            .shifts()
            .current_open(device_id)
            .await?
            .ok_or_else(|| CoreError::NoOpenShift {
                device_id: device_id.to_string(),
            })?;

        let request_id = request_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let payload = QueuePayload::new(
            device_id,
            x_report_key(device_id, &request_id),
            FiscalOperation::XReport(XReportRequest {
                cashier: device.default_cashier,
            }),
        )
        .with_shift(&shift.id);

        self.queue.enqueue(payload, None, None, now).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn current_shift(&self, device_id: &str) -> QueueResult<Option<FiscalShift>> {
        Ok(self.db().shifts().current_open(device_id).await?)
    }

    pub async fn get_shift(&self, shift_id: &str) -> QueueResult<FiscalShift> {
        Ok(self.db().shifts().require(shift_id).await?)
    }

    pub async fn shift_totals(&self, shift_id: &str) -> QueueResult<ShiftTotals> {
        Ok(self.get_shift(shift_id).await?.totals)
    }

    /// Recent shifts of a device, newest first.
    pub async fn shift_history(&self, device_id: &str, limit: u32) -> QueueResult<Vec<FiscalShift>> {
        Ok(self.db().shifts().list_for_device(device_id, limit).await?)
    }

    /// Live items that keep the shift from closing.
    pub async fn pending_operations(&self, shift_id: &str) -> QueueResult<i64> {
        Ok(self.db().shifts().pending_operations(shift_id, None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::testing::{device, draft, receipt_payload, setup, t0};
    use vendfisc_core::{OperationKind, QueueStatus};

    fn manager(queue: &FiscalQueue) -> ShiftManager {
        ShiftManager::new(queue.clone(), chrono::Duration::hours(24))
    }

    #[tokio::test]
    async fn test_open_and_close_locally() {
        let (db, queue) = setup().await;
        let d = device(&db, "D1").await;
        let shifts = manager(&queue);

        let s1 = shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        assert_eq!(s1.sequence, 1);
        let err = shifts.open_shift(&d.id, "Anna", t0()).await.unwrap_err();
        assert!(matches!(err, QueueError::Domain(CoreError::ShiftAlreadyOpen { .. })));

        let (closed, z_report) = shifts.close_shift(&s1.id, t0()).await.unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.z_report_ref, None);
        let err = shifts.close_shift(&s1.id, t0()).await.unwrap_err();
        assert!(matches!(err, QueueError::Domain(CoreError::ShiftNotOpen { .. })));

        // The Z-report is owed to the provider through the queue
        assert_eq!(z_report.operation, OperationKind::ShiftClose);
        assert_eq!(z_report.status, QueueStatus::Pending);
        assert_eq!(z_report.shift_id.as_deref(), Some(s1.id.as_str()));
        assert_eq!(z_report.idempotency_key, format!("shift_close:{}", s1.id));
        assert!(matches!(
            &z_report.payload.body,
            FiscalOperation::ShiftClose(ShiftCloseRequest { z_report_only: true, .. })
        ));
        assert_eq!(queue.stats(&d.id).await.unwrap().pending, 1);

        let s2 = shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        assert_eq!(s2.sequence, 2);
    }

    #[tokio::test]
    async fn test_close_refused_with_pending_operations() {
        let (db, queue) = setup().await;
        let d = device(&db, "D1").await;
        let shifts = manager(&queue);
        let s1 = shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();

        queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();
        assert_eq!(shifts.pending_operations(&s1.id).await.unwrap(), 1);

        let err = shifts.close_shift(&s1.id, t0()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Domain(CoreError::PendingOperations { pending: 1, .. })
        ));
        assert!(shifts.get_shift(&s1.id).await.unwrap().is_open());
        // Only the receipt; no Z-report was queued
        assert_eq!(queue.stats(&d.id).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_request_open_collapses_repeats() {
        let (db, queue) = setup().await;
        let d = device(&db, "D1").await;
        let shifts = manager(&queue);

        let (a, created_a) = shifts
            .request_open(&d.id, None, ShiftTrigger::Manual, t0())
            .await
            .unwrap();
        let (b, created_b) = shifts
            .request_open(&d.id, Some("Anna"), ShiftTrigger::Scheduled, t0())
            .await
            .unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
        assert_eq!(a.operation, OperationKind::ShiftOpen);
        assert_eq!(a.priority, 10);
        assert_eq!(a.idempotency_key, format!("shift_open:{}:1", d.id));
    }

    #[tokio::test]
    async fn test_request_close_and_x_report_need_open_shift() {
        let (db, queue) = setup().await;
        let d = device(&db, "D1").await;
        let shifts = manager(&queue);

        let err = shifts.request_x_report(&d.id, Some("r1"), t0()).await.unwrap_err();
        assert!(matches!(err, QueueError::Domain(CoreError::NoOpenShift { .. })));

        let s1 = shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        let (report, _) = shifts.request_x_report(&d.id, Some("r1"), t0()).await.unwrap();
        assert_eq!(report.shift_id.as_deref(), Some(s1.id.as_str()));

        let (close, created) = shifts
            .request_close(&s1.id, None, ShiftTrigger::Manual, t0())
            .await
            .unwrap();
        assert!(created);
        assert_eq!(close.status, QueueStatus::Pending);
        assert_eq!(close.priority, 1);
        assert_eq!(close.shift_id.as_deref(), Some(s1.id.as_str()));

        shifts.close_shift(&s1.id, t0()).await.unwrap_err();
        let closed = db.shifts().close(&s1.id, None, Some(&close.id), t0()).await;
        // The X-report item is still live
        assert!(closed.is_err());
    }
}

//! # Queue Worker
//!
//! Drains the fiscal queue, one device at a time per worker task.
//!
//! ## Item Processing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        QueueWorker::process_next                        │
//! │                                                                         │
//! │  1. Claim      highest priority, oldest eligible item → PROCESSING     │
//! │                                                                         │
//! │  2. Gate       receipt_*     needs an OPEN shift                        │
//! │                              (auto-open devices open one in place)      │
//! │                shift_close   waits until the shift has no live items    │
//! │                x_report      needs an OPEN shift                        │
//! │                                                                         │
//! │  3. Provider   submit(payload, idempotency key) under a timeout         │
//! │                                                                         │
//! │  4. Settle     success   → one transaction (receipt, totals, item)      │
//! │                failure   → RETRY with backoff or FAILED by class         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pool
//! ```text
//!  worker 0 ──┐                       ┌── lease(D1) ── drain ≤ batch ── release
//!  worker 1 ──┼── devices with work ──┼── lease(D2) ── drain ≤ batch ── release
//!  worker N ──┘                       └── lease busy → next device
//! ```
//! A device lease carries a fencing token and an expiry, so a crashed
//! worker's devices are picked up again once the lease runs out.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use vendfisc_core::operation::{ShiftCloseRequest, ShiftOpenRequest, ShiftTrigger};
use vendfisc_core::{
    CoreError, FiscalDevice, FiscalOperation, FiscalQueueItem, FiscalShift, ReceiptStatus,
};
use vendfisc_db::Database;

use crate::config::WorkerSettings;
use crate::error::{QueueError, QueueResult};
use crate::fiscal_queue::FiscalQueue;
use crate::provider::{FiscalProvider, ProviderRequest, ProviderResponse};
use crate::shift_manager::ShiftManager;

// =============================================================================
// Queue Worker
// =============================================================================

/// Processes queue items against a fiscal provider.
#[derive(Clone)]
pub struct QueueWorker {
    queue: FiscalQueue,
    shifts: ShiftManager,
    provider: Arc<dyn FiscalProvider>,
    provider_timeout: Duration,
}

impl QueueWorker {
    pub fn new(
        queue: FiscalQueue,
        shifts: ShiftManager,
        provider: Arc<dyn FiscalProvider>,
        provider_timeout: Duration,
    ) -> Self {
        QueueWorker {
            queue,
            shifts,
            provider,
            provider_timeout,
        }
    }

    fn db(&self) -> &Database {
        self.queue.db()
    }

    /// Claims and processes the next eligible item.
    ///
    /// Every outcome of a claimed item is a queue transition; the returned
    /// item is in its post-processing state. `Ok(None)` means nothing was
    /// eligible.
    pub async fn process_next(
        &self,
        device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<FiscalQueueItem>> {
        let Some(item) = self.queue.dequeue_next(device_id, now).await? else {
            return Ok(None);
        };
        debug!(item_id = %item.id, device_id = %item.device_id, operation = %item.operation, attempt = item.retry_count + 1, "Processing queue item");

        match self.handle(&item, now).await {
            Ok(done) => Ok(Some(done)),
            Err(err) => {
                let updated = self
                    .queue
                    .record_failure(&item, &err.to_string(), err.failure_class(), now)
                    .await?;
                Ok(Some(updated))
            }
        }
    }

    async fn handle(&self, item: &FiscalQueueItem, now: DateTime<Utc>) -> QueueResult<FiscalQueueItem> {
        let device = self.db().devices().require(&item.device_id).await?;
        match &item.payload.body {
            FiscalOperation::ReceiptSale(_) | FiscalOperation::ReceiptRefund(_) => {
                self.fiscalize_receipt(&device, item, now).await
            }
            FiscalOperation::ShiftOpen(request) => {
                self.open_shift(&device, item, request, now).await
            }
            FiscalOperation::ShiftClose(request) => self.close_shift(item, request, now).await,
            FiscalOperation::XReport(_) => self.x_report(&device, item, now).await,
        }
    }

    // =========================================================================
    // Receipts
    // =========================================================================

    async fn fiscalize_receipt(
        &self,
        device: &FiscalDevice,
        item: &FiscalQueueItem,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let receipt_id = item
            .receipt_id
            .as_deref()
            .ok_or_else(|| QueueError::Internal(format!("receipt item {} has no receipt", item.id)))?;
        let receipt = self.db().receipts().require(receipt_id).await?;

        // Re-admitted after success: never fiscalize twice
        if receipt.status == ReceiptStatus::Success {
            debug!(item_id = %item.id, receipt_id = %receipt.id, "Receipt already fiscalized");
            let result = json!({
                "already_fiscalized": true,
                "receipt_id": receipt.id,
                "fiscal_number": receipt.fiscal.as_ref().map(|f| f.fiscal_number.clone()),
            });
            return self.queue.mark_success(&item.id, result, now).await;
        }

        let shift = match self.shifts.current_shift(&device.id).await? {
            Some(shift) => shift,
            None if device.auto_open_shift => self.open_on_demand(device, now).await?,
            None => {
                return Err(CoreError::NoOpenShift {
                    device_id: device.id.clone(),
                }
                .into())
            }
        };

        if item.shift_id.as_deref() != Some(shift.id.as_str()) {
            self.db().queue().bind_shift(&item.id, &shift.id, now).await?;
            self.db().receipts().bind_shift(receipt_id, &shift.id, now).await?;
        }

        let response = self.submit(device, item).await?;
        let signature = response.signature()?;
        let settlement = self
            .db()
            .settlements()
            .settle_receipt(&item.id, &shift.id, &signature, response.to_result(), now)
            .await?;
        Ok(settlement.item().clone())
    }

    /// Opens a shift for an auto-open device through a `shift_open` item
    /// processed in place.
    async fn open_on_demand(&self, device: &FiscalDevice, now: DateTime<Utc>) -> QueueResult<FiscalShift> {
        let no_shift = || -> QueueError {
            CoreError::NoOpenShift {
                device_id: device.id.clone(),
            }
            .into()
        };

        let (open_item, _) = self
            .shifts
            .request_open(&device.id, None, ShiftTrigger::OnDemand, now)
            .await?;
        if !open_item.is_eligible(now) {
            return Err(no_shift());
        }

        let claimed = self.queue.mark_processing(&open_item.id, now).await?;
        let FiscalOperation::ShiftOpen(request) = &claimed.payload.body else {
            return Err(QueueError::Internal(format!(
                "item {} is not a shift_open",
                claimed.id
            )));
        };

        info!(device_id = %device.id, item_id = %claimed.id, "Opening shift on demand");
        if let Err(err) = self.open_shift(device, &claimed, request, now).await {
            self.queue
                .record_failure(&claimed, &err.to_string(), err.failure_class(), now)
                .await?;
            return Err(no_shift());
        }

        self.shifts.current_shift(&device.id).await?.ok_or_else(no_shift)
    }

    // =========================================================================
    // Shifts
    // =========================================================================

    async fn open_shift(
        &self,
        device: &FiscalDevice,
        item: &FiscalQueueItem,
        request: &ShiftOpenRequest,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        if let Some(current) = self.shifts.current_shift(&device.id).await? {
            let result = json!({ "already_open": true, "shift_id": current.id });
            let settled = self
                .db()
                .settlements()
                .settle_shift_open(&item.id, &device.id, &request.cashier, None, result, now)
                .await?;
            debug!(item_id = %item.id, shift_id = %settled.shift.id, "Shift already open");
            return Ok(settled.item);
        }

        let response = self.submit(device, item).await?;
        let settled = self
            .db()
            .settlements()
            .settle_shift_open(
                &item.id,
                &device.id,
                &request.cashier,
                response.shift_number,
                response.to_result(),
                now,
            )
            .await?;
        info!(
            device_id = %device.id,
            shift_id = %settled.shift.id,
            sequence = settled.shift.sequence,
            provider_shift_number = ?settled.shift.provider_shift_number,
            trigger = ?request.trigger,
            "Shift opened"
        );
        Ok(settled.item)
    }

    async fn close_shift(
        &self,
        item: &FiscalQueueItem,
        request: &ShiftCloseRequest,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let shift = self.shifts.get_shift(&request.shift_id).await?;
        if request.z_report_only {
            return self.file_z_report(&shift, item, now).await;
        }
        if !shift.is_open() {
            let result = json!({ "already_closed": true, "shift_id": shift.id });
            return self.queue.mark_success(&item.id, result, now).await;
        }

        let pending = self.queue.pending_for_shift(&shift.id, Some(&item.id)).await?;
        if !pending.is_empty() {
            return Err(CoreError::PendingOperations {
                shift_id: shift.id,
                pending: pending.len() as i64,
            }
            .into());
        }

        let device = self.db().devices().require(&shift.device_id).await?;
        let response = self.submit(&device, item).await?;
        let (closed, done) = self
            .db()
            .settlements()
            .settle_shift_close(
                &item.id,
                &shift.id,
                response.z_report_number.as_deref(),
                response.to_result(),
                now,
            )
            .await?;
        info!(
            device_id = %closed.device_id,
            shift_id = %closed.id,
            z_report = ?closed.z_report_ref,
            receipts = closed.totals.receipt_count,
            sales = %closed.totals.sales,
            trigger = ?request.trigger,
            "Shift closed"
        );
        Ok(done)
    }

    /// Files the Z-report of a shift that was closed locally.
    async fn file_z_report(
        &self,
        shift: &FiscalShift,
        item: &FiscalQueueItem,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        if shift.is_open() {
            return Err(QueueError::Internal(format!(
                "Z-report requested for open shift {}",
                shift.id
            )));
        }
        if let Some(z_report) = &shift.z_report_ref {
            let result = json!({ "already_filed": true, "shift_id": shift.id, "z_report": z_report });
            return self.queue.mark_success(&item.id, result, now).await;
        }

        let device = self.db().devices().require(&shift.device_id).await?;
        let response = self.submit(&device, item).await?;
        let (filed, done) = self
            .db()
            .settlements()
            .settle_z_report(
                &item.id,
                &shift.id,
                response.z_report_number.as_deref(),
                response.to_result(),
                now,
            )
            .await?;
        info!(
            device_id = %filed.device_id,
            shift_id = %filed.id,
            z_report = ?filed.z_report_ref,
            "Z-report filed"
        );
        Ok(done)
    }

    async fn x_report(
        &self,
        device: &FiscalDevice,
        item: &FiscalQueueItem,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        if self.shifts.current_shift(&device.id).await?.is_none() {
            return Err(CoreError::NoOpenShift {
                device_id: device.id.clone(),
            }
            .into());
        }
        let response = self.submit(device, item).await?;
        self.queue.mark_success(&item.id, response.to_result(), now).await
    }

    // =========================================================================
    // Provider
    // =========================================================================

    async fn submit(
        &self,
        device: &FiscalDevice,
        item: &FiscalQueueItem,
    ) -> QueueResult<ProviderResponse> {
        let request = ProviderRequest::for_item(device, item);
        match tokio::time::timeout(self.provider_timeout, self.provider.submit(&request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(QueueError::ProviderTimeout(
                self.provider_timeout.as_millis() as u64,
            )),
        }
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("provider", &self.provider.name())
            .field("provider_timeout", &self.provider_timeout)
            .finish()
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Spawns and drives the worker tasks.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    worker: QueueWorker,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(worker: QueueWorker, settings: WorkerSettings, shutdown: watch::Receiver<bool>) -> Self {
        WorkerPool {
            worker,
            settings,
            shutdown,
        }
    }

    /// Lease holder name of worker `index`.
    pub fn holder(&self, index: usize) -> String {
        format!("{}-w{index}", self.settings.holder_id)
    }

    /// Starts `pool_size` worker tasks. They stop when `true` is sent on
    /// the shutdown channel, after finishing their current item.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        info!(workers = self.settings.pool_size, holder = %self.settings.holder_id, "Starting worker pool");
        (0..self.settings.pool_size)
            .map(|index| {
                let pool = self.clone();
                tokio::spawn(async move { pool.run(index).await })
            })
            .collect()
    }

    async fn run(mut self, index: usize) {
        let holder = self.holder(index);
        info!(holder = %holder, "Queue worker starting");

        let mut interval = tokio::time::interval(self.settings.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.drain_once(index, Utc::now()).await {
                        error!(?e, holder = %holder, "Drain cycle failed");
                    }
                }

                _ = self.shutdown.changed() => {
                    info!(holder = %holder, "Queue worker shutting down");
                    break;
                }
            }
        }

        info!(holder = %holder, "Queue worker stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One drain cycle of worker `index`: every device with ready work whose
    /// lease it can take gets up to `drain_batch` items processed.
    ///
    /// Workers start at different devices so they spread out.
    pub async fn drain_once(&self, index: usize, now: DateTime<Utc>) -> QueueResult<usize> {
        let devices = self.worker.queue.devices_with_ready_work(now).await?;
        if devices.is_empty() {
            return Ok(0);
        }

        let holder = self.holder(index);
        let started = Instant::now();
        let offset = index % devices.len();
        let mut processed = 0;

        for device_id in devices.iter().cycle().skip(offset).take(devices.len()) {
            if self.stopping() {
                break;
            }
            let at = now + elapsed(started);
            processed += self.drain_device(device_id, &holder, started, now, at).await?;
        }
        Ok(processed)
    }

    async fn drain_device(
        &self,
        device_id: &str,
        holder: &str,
        started: Instant,
        now: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> QueueResult<usize> {
        let leases = self.worker.db().leases();
        let ttl = self.settings.lease_ttl();
        let Some(token) = leases.acquire(device_id, holder, ttl, at).await? else {
            debug!(device_id = %device_id, holder = %holder, "Device leased elsewhere");
            return Ok(0);
        };

        let mut processed = 0;
        let mut lease_held = true;
        while processed < self.settings.drain_batch && !self.stopping() {
            let at = now + elapsed(started);
            match self.worker.process_next(Some(device_id), at).await {
                Ok(Some(_)) => processed += 1,
                Ok(None) => break,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Queue item could not be settled");
                    break;
                }
            }
            if !leases.renew(device_id, holder, token, ttl, now + elapsed(started)).await? {
                warn!(device_id = %device_id, holder = %holder, token, "Device lease lost");
                lease_held = false;
                break;
            }
        }

        if lease_held {
            leases.release(device_id, holder, token).await?;
        }
        if processed > 0 {
            debug!(device_id = %device_id, holder = %holder, processed, "Device drained");
        }
        Ok(processed)
    }
}

fn elapsed(started: Instant) -> chrono::Duration {
    chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ScriptedOutcome, ScriptedProvider};
    use crate::testing::{device, draft, receipt_payload, refund_draft, setup, t0};
    use chrono::Duration as ChronoDuration;
    use vendfisc_core::operation::shift_open_key;
    use vendfisc_core::{FailureClass, OperationKind, QueuePayload, QueueStatus};
    use vendfisc_db::NewDevice;

    struct Harness {
        db: Database,
        queue: FiscalQueue,
        shifts: ShiftManager,
        provider: Arc<ScriptedProvider>,
        worker: QueueWorker,
    }

    async fn harness(script: Vec<ScriptedOutcome>) -> Harness {
        let (db, queue) = setup().await;
        let shifts = ShiftManager::new(queue.clone(), ChronoDuration::hours(24));
        let provider = Arc::new(ScriptedProvider::new(script));
        let worker = QueueWorker::new(
            queue.clone(),
            shifts.clone(),
            provider.clone(),
            Duration::from_millis(50),
        );
        Harness {
            db,
            queue,
            shifts,
            provider,
            worker,
        }
    }

    fn hang() -> ScriptedOutcome {
        ScriptedOutcome::Hang(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_timeouts_then_success() {
        let h = harness(vec![ScriptedOutcome::Succeed, hang(), hang()]).await;
        let d = device(&h.db, "D1").await;

        h.shifts
            .request_open(&d.id, None, ShiftTrigger::Manual, t0())
            .await
            .unwrap();
        let opened = h.worker.process_next(Some(&d.id), t0()).await.unwrap().unwrap();
        assert_eq!(opened.status, QueueStatus::Success);
        let s1 = h.shifts.current_shift(&d.id).await.unwrap().unwrap();
        assert_eq!(s1.sequence, 1);
        assert_eq!(s1.provider_shift_number, Some(1));

        let sale = draft(&d.id, "sale-42", 100_000);
        let (item, _) = h
            .queue
            .enqueue(receipt_payload(&sale), None, None, t0())
            .await
            .unwrap();

        let first = h.worker.process_next(Some(&d.id), t0()).await.unwrap().unwrap();
        assert_eq!(first.status, QueueStatus::Retry);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.last_error_class, Some(FailureClass::Transient));
        assert!(first.last_error.as_deref().unwrap().contains("timeout"));

        // Not eligible before its backoff elapses
        assert!(h.worker.process_next(Some(&d.id), t0()).await.unwrap().is_none());

        let second = h
            .worker
            .process_next(Some(&d.id), t0() + ChronoDuration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.status, QueueStatus::Retry);
        assert_eq!(second.retry_count, 2);

        let third = h
            .worker
            .process_next(Some(&d.id), t0() + ChronoDuration::minutes(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.id, item.id);
        assert_eq!(third.status, QueueStatus::Success);
        assert_eq!(third.retry_count, 2);
        assert_eq!(third.shift_id.as_deref(), Some(s1.id.as_str()));

        let receipt = h.db.receipts().require(item.receipt_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert!(receipt.fiscal.is_some());
        let totals = h.shifts.shift_totals(&s1.id).await.unwrap();
        assert_eq!(totals.sales.minor(), 100_000);
        assert_eq!(totals.receipt_count, 1);

        // Re-admission after success: new item, no second fiscalization
        let (again, created) = h
            .queue
            .enqueue(receipt_payload(&sale), None, None, t0() + ChronoDuration::minutes(3))
            .await
            .unwrap();
        assert!(created);
        assert_ne!(again.id, item.id);
        assert_eq!(again.receipt_id, item.receipt_id);

        let calls_before = h.provider.call_count().await;
        let done = h
            .worker
            .process_next(Some(&d.id), t0() + ChronoDuration::minutes(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.id, again.id);
        assert_eq!(done.status, QueueStatus::Success);
        assert_eq!(h.provider.call_count().await, calls_before);
        assert_eq!(h.shifts.shift_totals(&s1.id).await.unwrap().sales.minor(), 100_000);
        assert_eq!(h.queue.history("sale:sale-42").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_item() {
        let transient = || ScriptedOutcome::Fail(ProviderError::transient("503 from OFD"));
        let h = harness(vec![transient(), transient(), transient()]).await;
        let d = device(&h.db, "D1").await;
        h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();

        let (item, _) = h
            .queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, Some(3), t0())
            .await
            .unwrap();

        let mut now = t0();
        let mut last = None;
        for _ in 0..3 {
            last = h.worker.process_next(Some(&d.id), now).await.unwrap();
            now += ChronoDuration::hours(1);
        }
        let last = last.unwrap();
        assert_eq!(last.id, item.id);
        assert_eq!(last.status, QueueStatus::Failed);
        assert!(last.last_error.as_deref().unwrap().contains("503 from OFD"));
        assert!(h.worker.process_next(Some(&d.id), now).await.unwrap().is_none());

        let receipt = h.db.receipts().require(item.receipt_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert_eq!(h.queue.list_failed(&d.id, true).await.unwrap().len(), 1);
        assert_eq!(h.provider.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_sales_and_refunds_settle_into_shift_totals() {
        let transient = ScriptedOutcome::Fail(ProviderError::transient("502 from OFD"));
        let h = harness(vec![ScriptedOutcome::Succeed, ScriptedOutcome::Succeed, transient]).await;
        let d = device(&h.db, "D1").await;
        let s1 = h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();

        for payload in [
            receipt_payload(&draft(&d.id, "sale-1", 1_000)),
            receipt_payload(&draft(&d.id, "sale-2", 2_500)),
            receipt_payload(&refund_draft(&d.id, "sale-1", 700)),
        ] {
            h.queue.enqueue(payload, None, None, t0()).await.unwrap();
        }

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let item = h.worker.process_next(Some(&d.id), t0()).await.unwrap().unwrap();
            statuses.push((item.operation, item.status));
        }
        assert_eq!(
            statuses,
            vec![
                (OperationKind::ReceiptSale, QueueStatus::Success),
                (OperationKind::ReceiptSale, QueueStatus::Success),
                (OperationKind::ReceiptRefund, QueueStatus::Retry),
            ]
        );

        // A failed attempt leaves the totals untouched
        let totals = h.shifts.shift_totals(&s1.id).await.unwrap();
        assert_eq!(totals.refunds.minor(), 0);
        assert_eq!(totals.receipt_count, 2);

        let refund = h
            .worker
            .process_next(Some(&d.id), t0() + ChronoDuration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refund.operation, OperationKind::ReceiptRefund);
        assert_eq!(refund.status, QueueStatus::Success);

        let totals = h.shifts.shift_totals(&s1.id).await.unwrap();
        assert_eq!(totals.sales.minor(), 3_500);
        assert_eq!(totals.refunds.minor(), 700);
        assert_eq!(totals.net().minor(), 2_800);
        assert_eq!(totals.receipt_count, 3);
        assert_eq!(totals.cash.minor(), 4_200);

        let refund_receipt = h
            .db
            .receipts()
            .require(refund.receipt_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(refund_receipt.status, ReceiptStatus::Success);
        assert!(refund_receipt.shift_applied);
    }

    #[tokio::test]
    async fn test_permanent_rejection_fails_immediately() {
        let h = harness(vec![ScriptedOutcome::Fail(ProviderError::permanent(
            "invalid tax code",
        ))])
        .await;
        let d = device(&h.db, "D1").await;
        h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        h.queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();

        let item = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.last_error_class, Some(FailureClass::Permanent));
    }

    #[tokio::test]
    async fn test_receipt_waits_for_shift_on_manual_device() {
        let h = harness(vec![]).await;
        let d = device(&h.db, "D1").await;
        h.queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();

        let item = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Retry);
        assert_eq!(item.last_error_class, Some(FailureClass::Precondition));
        let wait = item.next_retry_at.unwrap() - t0();
        assert!(wait <= ChronoDuration::milliseconds(2_500));
        assert_eq!(h.provider.call_count().await, 0);

        // Once a shift is open the receipt goes through and binds to it
        let s1 = h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        let done = h
            .worker
            .process_next(None, t0() + ChronoDuration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, QueueStatus::Success);
        assert_eq!(done.shift_id.as_deref(), Some(s1.id.as_str()));
        let receipt = h.db.receipts().require(done.receipt_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(receipt.shift_id.as_deref(), Some(s1.id.as_str()));
    }

    #[tokio::test]
    async fn test_auto_open_device_opens_shift_in_place() {
        let h = harness(vec![]).await;
        let d = h
            .db
            .devices()
            .register(NewDevice::sandbox("org-1", "D2").with_auto_shifts(None, None), t0())
            .await
            .unwrap();
        h.queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 700)), None, None, t0())
            .await
            .unwrap();

        let item = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Success);

        let shift = h.shifts.current_shift(&d.id).await.unwrap().unwrap();
        assert_eq!(shift.totals.sales.minor(), 700);
        let opens = h.queue.history(&shift_open_key(&d.id, 1)).await.unwrap();
        assert_eq!(opens.len(), 1);
        assert_eq!(opens[0].status, QueueStatus::Success);
        assert_eq!(h.provider.calls().await, vec![shift_open_key(&d.id, 1), "sale:sale-1".to_string()]);
    }

    #[tokio::test]
    async fn test_shift_close_waits_for_receipts() {
        let h = harness(vec![ScriptedOutcome::Fail(ProviderError::transient("rate limited"))]).await;
        let d = device(&h.db, "D1").await;
        let s1 = h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();

        h.queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();
        let (close, _) = h
            .shifts
            .request_close(&s1.id, None, ShiftTrigger::Manual, t0())
            .await
            .unwrap();

        let receipt_item = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(receipt_item.status, QueueStatus::Retry);

        let waiting = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(waiting.id, close.id);
        assert_eq!(waiting.status, QueueStatus::Retry);
        assert_eq!(waiting.last_error_class, Some(FailureClass::Precondition));
        assert!(h.shifts.get_shift(&s1.id).await.unwrap().is_open());

        let later = t0() + ChronoDuration::minutes(1);
        let receipt_done = h.worker.process_next(None, later).await.unwrap().unwrap();
        assert_eq!(receipt_done.id, receipt_item.id);
        assert_eq!(receipt_done.status, QueueStatus::Success);

        let closed_item = h.worker.process_next(None, later).await.unwrap().unwrap();
        assert_eq!(closed_item.id, close.id);
        assert_eq!(closed_item.status, QueueStatus::Success);

        let closed = h.shifts.get_shift(&s1.id).await.unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.z_report_ref.as_deref(), Some("Z00000001"));
        assert_eq!(closed.totals.sales.minor(), 500);
    }

    #[tokio::test]
    async fn test_shift_operations_are_noops_when_already_done() {
        let h = harness(vec![]).await;
        let d = device(&h.db, "D1").await;
        let s1 = h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();

        let open_payload = QueuePayload::new(
            &d.id,
            shift_open_key(&d.id, 1),
            FiscalOperation::ShiftOpen(ShiftOpenRequest {
                cashier: "Anna".to_string(),
                trigger: ShiftTrigger::Manual,
            }),
        );
        h.queue.enqueue(open_payload, None, None, t0()).await.unwrap();
        let (close, _) = h
            .shifts
            .request_close(&s1.id, None, ShiftTrigger::Manual, t0())
            .await
            .unwrap();

        let open_item = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(open_item.status, QueueStatus::Success);
        assert_eq!(open_item.shift_id.as_deref(), Some(s1.id.as_str()));

        h.shifts.close_shift(&s1.id, t0()).await.unwrap_err();
        h.db.shifts().close(&s1.id, None, Some(&close.id), t0()).await.unwrap();
        let close_item = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(close_item.status, QueueStatus::Success);
        assert_eq!(close_item.result.unwrap()["already_closed"], true);
        assert_eq!(h.provider.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_local_close_files_z_report_through_queue() {
        let h = harness(vec![hang()]).await;
        let d = device(&h.db, "D1").await;
        let s1 = h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();

        let (closed, z_item) = h.shifts.close_shift(&s1.id, t0()).await.unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.z_report_ref, None);

        let first = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(first.id, z_item.id);
        assert_eq!(first.status, QueueStatus::Retry);
        assert_eq!(first.last_error_class, Some(FailureClass::Transient));

        let filed = h
            .worker
            .process_next(None, t0() + ChronoDuration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filed.id, z_item.id);
        assert_eq!(filed.status, QueueStatus::Success);

        let shift = h.shifts.get_shift(&s1.id).await.unwrap();
        assert!(!shift.is_open());
        assert_eq!(shift.z_report_ref.as_deref(), Some("Z00000001"));
        assert_eq!(h.provider.call_count().await, 2);
    }

    #[tokio::test]
    async fn test_x_report_goes_through_provider() {
        let h = harness(vec![]).await;
        let d = device(&h.db, "D1").await;
        h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        let (report, _) = h.shifts.request_x_report(&d.id, Some("r1"), t0()).await.unwrap();

        let done = h.worker.process_next(None, t0()).await.unwrap().unwrap();
        assert_eq!(done.id, report.id);
        assert_eq!(done.status, QueueStatus::Success);
        assert_eq!(h.provider.call_count().await, 1);
    }

    fn pool(h: &Harness, shutdown: watch::Receiver<bool>) -> WorkerPool {
        let settings = WorkerSettings {
            holder_id: "test".to_string(),
            drain_batch: 10,
            ..WorkerSettings::default()
        };
        WorkerPool::new(h.worker.clone(), settings, shutdown)
    }

    #[tokio::test]
    async fn test_pool_drains_every_device_and_releases_leases() {
        let h = harness(vec![]).await;
        let (_tx, rx) = watch::channel(false);
        let pool = pool(&h, rx);

        let mut devices = Vec::new();
        for name in ["D1", "D2"] {
            let d = device(&h.db, name).await;
            h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
            for sale in ["a", "b"] {
                h.queue
                    .enqueue(
                        receipt_payload(&draft(&d.id, &format!("{name}-{sale}"), 100)),
                        None,
                        None,
                        t0(),
                    )
                    .await
                    .unwrap();
            }
            devices.push(d);
        }

        assert_eq!(pool.drain_once(0, t0()).await.unwrap(), 4);
        for d in &devices {
            let stats = h.queue.stats(&d.id).await.unwrap();
            assert_eq!(stats.success, 2);
            let token = h
                .db
                .leases()
                .acquire(&d.id, "someone-else", ChronoDuration::seconds(30), t0())
                .await
                .unwrap();
            assert!(token.is_some());
        }
    }

    #[tokio::test]
    async fn test_pool_skips_leased_device() {
        let h = harness(vec![]).await;
        let (_tx, rx) = watch::channel(false);
        let pool = pool(&h, rx);
        let d = device(&h.db, "D1").await;
        h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        h.queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 100)), None, None, t0())
            .await
            .unwrap();

        h.db.leases()
            .acquire(&d.id, "other-host-w0", ChronoDuration::seconds(90), t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.drain_once(0, t0()).await.unwrap(), 0);
        assert_eq!(h.queue.stats(&d.id).await.unwrap().pending, 1);

        // Expired leases are taken over
        let later = t0() + ChronoDuration::minutes(5);
        assert_eq!(pool.drain_once(0, later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pool_stops_on_shutdown() {
        let h = harness(vec![]).await;
        let (tx, rx) = watch::channel(false);
        let pool = pool(&h, rx);
        let d = device(&h.db, "D1").await;
        h.shifts.open_shift(&d.id, "Anna", t0()).await.unwrap();
        h.queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 100)), None, None, t0())
            .await
            .unwrap();

        tx.send(true).unwrap();
        assert_eq!(pool.drain_once(0, t0()).await.unwrap(), 0);

        let handles = pool.spawn();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

//! # Fiscal Service
//!
//! Entry point for the rest of the vending platform.
//!
//! ```text
//!  sale / refund event ──► submit_sale ──► ReceiptDraft ──► receipt + queue item
//!                               │
//!                               └── returns immediately; fiscalization is async
//!
//!  operators ──► failed_items / acknowledge_failed / cancel_pending_receipt
//!                shift_totals / receipt_status / queue_stats
//! ```
//!
//! Sales never wait on the provider: `submit_sale` only builds and persists.

use chrono::{DateTime, NaiveTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use vendfisc_core::operation::ShiftTrigger;
use vendfisc_core::receipt::build;
use vendfisc_core::{
    CoreError, DeviceStatus, FiscalDevice, FiscalQueueItem, FiscalReceipt, FiscalShift,
    OperationKind, QueueStats, ReceiptType, SaleEvent, ShiftTotals, TaxTable,
};
use vendfisc_db::{Database, NewDevice, ReceiptAdmission};

use crate::config::FiscalConfig;
use crate::error::QueueResult;
use crate::fiscal_queue::FiscalQueue;
use crate::provider::FiscalProvider;
use crate::scheduler::ShiftScheduler;
use crate::shift_manager::ShiftManager;
use crate::worker::{QueueWorker, WorkerPool};

/// Facade over the queue runtime.
#[derive(Debug, Clone)]
pub struct FiscalService {
    db: Database,
    config: FiscalConfig,
    queue: FiscalQueue,
    shifts: ShiftManager,
    worker: QueueWorker,
}

impl FiscalService {
    /// Wires the queue, shift manager and worker from configuration.
    pub fn new(db: Database, config: FiscalConfig, provider: Arc<dyn FiscalProvider>) -> Self {
        let queue = FiscalQueue::new(
            db.clone(),
            config.retry.policies(),
            config.priorities.clone(),
        );
        let shifts = ShiftManager::new(queue.clone(), config.shifts.max_shift_duration());
        let worker = QueueWorker::new(
            queue.clone(),
            shifts.clone(),
            provider,
            config.worker.provider_timeout(),
        );
        FiscalService {
            db,
            config,
            queue,
            shifts,
            worker,
        }
    }

    pub fn queue(&self) -> &FiscalQueue {
        &self.queue
    }

    pub fn shifts(&self) -> &ShiftManager {
        &self.shifts
    }

    pub fn worker(&self) -> &QueueWorker {
        &self.worker
    }

    pub fn worker_pool(&self, shutdown: watch::Receiver<bool>) -> WorkerPool {
        WorkerPool::new(self.worker.clone(), self.config.worker.clone(), shutdown)
    }

    pub fn scheduler(&self) -> ShiftScheduler {
        ShiftScheduler::new(
            self.queue.clone(),
            self.shifts.clone(),
            self.config.shifts.scheduler_interval(),
            self.config.worker.stale_after(),
        )
    }

    // =========================================================================
    // Device Registry
    // =========================================================================

    pub async fn register_device(&self, new: NewDevice, now: DateTime<Utc>) -> QueueResult<FiscalDevice> {
        Ok(self.db.devices().register(new, now).await?)
    }

    pub async fn device(&self, device_id: &str) -> QueueResult<FiscalDevice> {
        Ok(self.db.devices().require(device_id).await?)
    }

    pub async fn devices(&self, organization_id: &str) -> QueueResult<Vec<FiscalDevice>> {
        Ok(self.db.devices().list_by_organization(organization_id).await?)
    }

    /// Only ACTIVE devices are drained; items of other devices wait.
    pub async fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalDevice> {
        let device = self.db.devices().set_status(device_id, status, now).await?;
        info!(device_id = %device.id, status = ?device.status, "Device status changed");
        Ok(device)
    }

    pub async fn update_schedule(
        &self,
        device_id: &str,
        auto_open_shift: bool,
        auto_close_shift: bool,
        open_at: Option<NaiveTime>,
        close_at: Option<NaiveTime>,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalDevice> {
        Ok(self
            .db
            .devices()
            .update_schedule(device_id, auto_open_shift, auto_close_shift, open_at, close_at, now)
            .await?)
    }

    pub async fn retire_device(&self, device_id: &str, now: DateTime<Utc>) -> QueueResult<FiscalDevice> {
        Ok(self.db.devices().retire(device_id, now).await?)
    }

    // =========================================================================
    // Sales
    // =========================================================================

    /// Builds the fiscal receipt for a sale or refund and queues it.
    ///
    /// Idempotent per `(sale_id, type)`: a live or already fiscalized
    /// receipt is returned with `created = false`. Receipts that FAILED or
    /// were cancelled can be submitted again.
    pub async fn submit_sale(
        &self,
        sale: &SaleEvent,
        tax_table: &TaxTable,
        now: DateTime<Utc>,
    ) -> QueueResult<ReceiptAdmission> {
        let draft = build(sale, tax_table)?;

        let device = self.db.devices().require(&draft.device_id).await?;
        if device.is_retired() {
            return Err(CoreError::DeviceNotOperational {
                device_id: device.id,
            }
            .into());
        }

        let kind = match draft.receipt_type {
            ReceiptType::Sale => OperationKind::ReceiptSale,
            ReceiptType::Refund => OperationKind::ReceiptRefund,
        };
        let admission = self
            .db
            .receipts()
            .admit(
                &draft,
                self.queue.priority(kind),
                self.queue.policy(kind).max_retries,
                now,
            )
            .await?;
        Ok(admission)
    }

    /// Latest receipt for a sale, in any status.
    pub async fn receipt_status(
        &self,
        sale_id: &str,
        receipt_type: ReceiptType,
    ) -> QueueResult<Option<FiscalReceipt>> {
        Ok(self.db.receipts().latest_for_sale(sale_id, receipt_type).await?)
    }

    /// Cancels a receipt whose queue item has never been attempted.
    ///
    /// Anything that may have reached the provider is refused with
    /// `InvalidTransition`.
    pub async fn cancel_pending_receipt(
        &self,
        receipt_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalReceipt> {
        let receipt = self.db.receipts().require(receipt_id).await?;
        let items = self.db.queue().list_for_receipt(&receipt.id).await?;
        let Some(latest) = items.last() else {
            return Err(vendfisc_db::DbError::not_found("FiscalQueueItem", receipt_id).into());
        };

        let item = self.db.settlements().cancel_item(&latest.id, now).await?;
        info!(receipt_id = %receipt.id, item_id = %item.id, "Receipt cancelled by operator");
        Ok(self.db.receipts().require(receipt_id).await?)
    }

    // =========================================================================
    // Shifts
    // =========================================================================

    pub async fn request_shift_open(
        &self,
        device_id: &str,
        cashier: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let (item, _) = self
            .shifts
            .request_open(device_id, cashier, ShiftTrigger::Manual, now)
            .await?;
        Ok(item)
    }

    pub async fn request_shift_close(
        &self,
        shift_id: &str,
        cashier: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let (item, _) = self
            .shifts
            .request_close(shift_id, cashier, ShiftTrigger::Manual, now)
            .await?;
        Ok(item)
    }

    pub async fn request_x_report(
        &self,
        device_id: &str,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let (item, _) = self.shifts.request_x_report(device_id, request_id, now).await?;
        Ok(item)
    }

    pub async fn current_shift(&self, device_id: &str) -> QueueResult<Option<FiscalShift>> {
        self.shifts.current_shift(device_id).await
    }

    pub async fn shift_totals(&self, shift_id: &str) -> QueueResult<ShiftTotals> {
        self.shifts.shift_totals(shift_id).await
    }

    // =========================================================================
    // Operator Surface
    // =========================================================================

    /// FAILED items of a device that nobody has acknowledged yet.
    pub async fn failed_items(&self, device_id: &str) -> QueueResult<Vec<FiscalQueueItem>> {
        self.queue.list_failed(device_id, true).await
    }

    pub async fn failed_items_for_organization(
        &self,
        organization_id: &str,
    ) -> QueueResult<Vec<FiscalQueueItem>> {
        self.queue.list_failed_for_organization(organization_id, true).await
    }

    pub async fn acknowledge_failed(
        &self,
        item_id: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        self.queue.acknowledge(item_id, operator, now).await
    }

    pub async fn queue_stats(&self, device_id: &str) -> QueueResult<QueueStats> {
        self.queue.stats(device_id).await
    }
}

//! # Fiscal Queue
//!
//! Admission and bookkeeping of fiscal operations on top of the queue
//! repository: validation, default priorities and budgets, receipt
//! mirroring and backoff scheduling.
//!
//! ## Item Lifecycle
//! ```text
//!  enqueue ──► PENDING ──► PROCESSING ──► SUCCESS
//!                            │    ▲
//!                  mark_retry│    │dequeue_next (next_retry_at ≤ now)
//!                            ▼    │
//!                           RETRY ┘
//!                            │
//!           budget exhausted ▼
//!                          FAILED ──► acknowledge (operator)
//! ```
//!
//! A key may only have one live (non-terminal) item. Enqueueing a key whose
//! previous item is terminal creates a new item.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use vendfisc_core::validation::{validate_idempotency_key, validate_max_retries};
use vendfisc_core::{
    CoreError, FailureClass, FiscalQueueItem, OperationKind, QueuePayload, QueueStats, QueueStatus,
    ValidationError,
};
use vendfisc_db::{Database, NewQueueItem};

use crate::config::PrioritySettings;
use crate::error::{QueueError, QueueResult};
use crate::retry::{RetryPolicies, RetryPolicy};

/// Queue service shared by the worker pool, shift manager and facade.
#[derive(Debug, Clone)]
pub struct FiscalQueue {
    db: Database,
    policies: RetryPolicies,
    priorities: PrioritySettings,
}

impl FiscalQueue {
    pub fn new(db: Database, policies: RetryPolicies, priorities: PrioritySettings) -> Self {
        FiscalQueue {
            db,
            policies,
            priorities,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn policy(&self, kind: OperationKind) -> &RetryPolicy {
        self.policies.for_operation(kind)
    }

    pub fn priority(&self, kind: OperationKind) -> i32 {
        self.priorities.for_operation(kind)
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admits an operation, deduplicated by its idempotency key while a
    /// same-key item is live.
    ///
    /// `priority` and `max_retries` default to the configured values for
    /// the operation kind.
    ///
    /// Receipt operations also need a receipt row: a receipt that is
    /// already fiscalized gets a new item attached (the worker completes it
    /// without calling the provider), otherwise the receipt is admitted
    /// together with its item.
    ///
    /// ## Returns
    /// `(item, created)`
    pub async fn enqueue(
        &self,
        payload: QueuePayload,
        priority: Option<i32>,
        max_retries: Option<u32>,
        now: DateTime<Utc>,
    ) -> QueueResult<(FiscalQueueItem, bool)> {
        let kind = payload.kind();
        let priority = priority.unwrap_or_else(|| self.priority(kind));
        let max_retries = max_retries.unwrap_or_else(|| self.policy(kind).max_retries);

        validate_idempotency_key(&payload.idempotency_key).map_err(CoreError::from)?;
        validate_max_retries(max_retries).map_err(CoreError::from)?;

        let device = self.db.devices().require(&payload.device_id).await?;
        if device.is_retired() {
            return Err(CoreError::DeviceNotOperational {
                device_id: device.id,
            }
            .into());
        }

        let Some(draft) = payload.body.receipt().cloned() else {
            let (item, created) = self
                .db
                .queue()
                .enqueue(&NewQueueItem::new(payload, priority, max_retries), now)
                .await?;
            log_admission(&item, created);
            return Ok((item, created));
        };

        if draft.device_id != payload.device_id {
            return Err(invalid("device_id", format!("receipt belongs to device {}", draft.device_id)));
        }
        if payload.idempotency_key != draft.idempotency_key() {
            return Err(invalid(
                "idempotency_key",
                format!("receipt key must be {}", draft.idempotency_key()),
            ));
        }

        if let Some(item) = self
            .db
            .queue()
            .find_live_by_key(&payload.idempotency_key)
            .await?
        {
            debug!(item_id = %item.id, key = %item.idempotency_key, "Operation already queued");
            return Ok((item, false));
        }

        if let Some(receipt) = self
            .db
            .receipts()
            .find_success(&draft.sale_id, draft.receipt_type)
            .await?
        {
            let payload = payload.with_receipt(&receipt.id);
            let (item, created) = self
                .db
                .queue()
                .enqueue(&NewQueueItem::new(payload, priority, max_retries), now)
                .await?;
            log_admission(&item, created);
            return Ok((item, created));
        }

        let admission = self
            .db
            .receipts()
            .admit(&draft, priority, max_retries, now)
            .await?;
        log_admission(&admission.item, admission.created);
        Ok((admission.item, admission.created))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Claims the next eligible item (highest priority, then oldest) and
    /// marks it PROCESSING. `None` considers every operational device.
    pub async fn dequeue_next(
        &self,
        device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<FiscalQueueItem>> {
        let Some(item) = self.db.queue().claim_next(device_id, now).await? else {
            return Ok(None);
        };
        self.db.receipts().mirror_item(&item, now).await?;
        Ok(Some(item))
    }

    pub async fn devices_with_ready_work(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
        Ok(self.db.queue().devices_with_ready_work(now).await?)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    pub async fn mark_processing(
        &self,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let item = self.db.queue().mark_processing(item_id, now).await?;
        self.db.receipts().mirror_item(&item, now).await?;
        Ok(item)
    }

    /// PROCESSING → SUCCESS for operations without a receipt or shift
    /// side effect.
    pub async fn mark_success(
        &self,
        item_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let item = self.db.queue().mark_success(item_id, result, now).await?;
        info!(item_id = %item.id, device_id = %item.device_id, operation = %item.operation, "Queue item succeeded");
        Ok(item)
    }

    /// PROCESSING → RETRY with the operation's backoff.
    ///
    /// Fails with `RetryLimitExceeded` when the budget is exhausted.
    pub async fn mark_retry(
        &self,
        item_id: &str,
        error: &str,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let current = self.db.queue().require(item_id).await?;
        let next = self
            .policy(current.operation)
            .next_retry_at(current.retry_count, class, now);
        let item = self
            .db
            .queue()
            .mark_retry(item_id, error, class, next, now)
            .await?;
        self.db.receipts().mirror_item(&item, now).await?;
        Ok(item)
    }

    pub async fn mark_failed(
        &self,
        item_id: &str,
        error: &str,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let item = self.db.queue().mark_failed(item_id, error, class, now).await?;
        self.db.receipts().mirror_item(&item, now).await?;
        Ok(item)
    }

    /// Applies the failure policy to a PROCESSING item: retryable classes
    /// go to RETRY while budget remains, everything else to FAILED.
    pub async fn record_failure(
        &self,
        item: &FiscalQueueItem,
        error: &str,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let next_retry_at = class.is_retryable().then(|| {
            self.policy(item.operation)
                .next_retry_at(item.retry_count, class, now)
        });
        let updated = self
            .db
            .settlements()
            .record_failure(&item.id, error, class, next_retry_at, now)
            .await?;

        match (updated.status, class) {
            (QueueStatus::Retry, _) => warn!(
                item_id = %updated.id,
                device_id = %updated.device_id,
                operation = %updated.operation,
                retry_count = updated.retry_count,
                max_retries = updated.max_retries,
                class = %class,
                error = %error,
                next_retry_at = ?updated.next_retry_at,
                "Queue item scheduled for retry"
            ),
            (_, FailureClass::InvariantViolation) => error!(
                alert = true,
                item_id = %updated.id,
                device_id = %updated.device_id,
                operation = %updated.operation,
                error = %error,
                "Queue item failed on an invariant violation"
            ),
            _ => error!(
                item_id = %updated.id,
                device_id = %updated.device_id,
                operation = %updated.operation,
                retry_count = updated.retry_count,
                class = %class,
                error = %error,
                "Queue item failed"
            ),
        }
        Ok(updated)
    }

    /// Returns abandoned PROCESSING claims to RETRY, or FAILED when their
    /// budget is spent.
    pub async fn recover_stale(
        &self,
        stale_after: chrono::Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<FiscalQueueItem>> {
        let recovered = self.db.queue().recover_stale(now - stale_after, now).await?;
        for item in &recovered {
            self.db.receipts().mirror_item(item, now).await?;
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered stale queue items");
        }
        Ok(recovered)
    }

    /// Operator acknowledgement of a FAILED item. Never resets it.
    pub async fn acknowledge(
        &self,
        item_id: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<FiscalQueueItem> {
        let item = self.db.queue().acknowledge(item_id, operator, now).await?;
        info!(item_id = %item.id, operator = %operator, "Failed item acknowledged");
        Ok(item)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, item_id: &str) -> QueueResult<FiscalQueueItem> {
        Ok(self.db.queue().require(item_id).await?)
    }

    /// Every item ever admitted under a key, oldest first.
    pub async fn history(&self, idempotency_key: &str) -> QueueResult<Vec<FiscalQueueItem>> {
        Ok(self.db.queue().history(idempotency_key).await?)
    }

    /// Live items that keep a shift from closing.
    pub async fn pending_for_shift(
        &self,
        shift_id: &str,
        excluding: Option<&str>,
    ) -> QueueResult<Vec<FiscalQueueItem>> {
        Ok(self.db.queue().pending_for_shift(shift_id, excluding).await?)
    }

    pub async fn list_failed(
        &self,
        device_id: &str,
        unacknowledged_only: bool,
    ) -> QueueResult<Vec<FiscalQueueItem>> {
        Ok(self.db.queue().list_failed(device_id, unacknowledged_only).await?)
    }

    pub async fn list_failed_for_organization(
        &self,
        organization_id: &str,
        unacknowledged_only: bool,
    ) -> QueueResult<Vec<FiscalQueueItem>> {
        Ok(self
            .db
            .queue()
            .list_failed_for_organization(organization_id, unacknowledged_only)
            .await?)
    }

    pub async fn stats(&self, device_id: &str) -> QueueResult<QueueStats> {
        Ok(self.db.queue().stats(device_id).await?)
    }
}

fn invalid(field: &str, reason: String) -> QueueError {
    CoreError::from(ValidationError::InvalidFormat {
        field: field.to_string(),
        reason,
    })
    .into()
}

fn log_admission(item: &FiscalQueueItem, created: bool) {
    if created {
        info!(
            item_id = %item.id,
            device_id = %item.device_id,
            operation = %item.operation,
            key = %item.idempotency_key,
            priority = item.priority,
            "Operation queued"
        );
    } else {
        debug!(item_id = %item.id, key = %item.idempotency_key, "Operation already queued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{draft, receipt_payload, setup, t0, x_report_payload};
    use chrono::Duration;
    use vendfisc_core::ReceiptStatus;

    #[tokio::test]
    async fn test_enqueue_dedups_live_key() {
        let (db, queue) = setup().await;
        let d = crate::testing::device(&db, "D1").await;

        let (first, created) = queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.priority, 5);
        assert_eq!(first.max_retries, 10);

        let (again, created) = queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_enqueue_validates_input() {
        let (db, queue) = setup().await;
        let d = crate::testing::device(&db, "D1").await;

        let err = queue
            .enqueue(x_report_payload(&d.id, "r1"), None, Some(0), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Domain(CoreError::Validation(_))));

        let err = queue
            .enqueue(x_report_payload("missing-device", "r1"), None, None, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Database(vendfisc_db::DbError::NotFound { .. })));

        db.devices().retire(&d.id, t0()).await.unwrap();
        let err = queue
            .enqueue(x_report_payload(&d.id, "r2"), None, None, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Domain(CoreError::DeviceNotOperational { .. })));
    }

    #[tokio::test]
    async fn test_mark_retry_until_budget_exhausted() {
        let (db, queue) = setup().await;
        let d = crate::testing::device(&db, "D1").await;
        let (item, _) = queue
            .enqueue(x_report_payload(&d.id, "r1"), None, Some(2), t0())
            .await
            .unwrap();

        let claimed = queue.dequeue_next(Some(&d.id), t0()).await.unwrap().unwrap();
        assert_eq!(claimed.id, item.id);
        let retried = queue
            .mark_retry(&item.id, "503", FailureClass::Transient, t0())
            .await
            .unwrap();
        assert_eq!(retried.status, QueueStatus::Retry);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.next_retry_at.unwrap() > t0());

        // Not eligible before its backoff elapses
        assert!(queue.dequeue_next(Some(&d.id), t0()).await.unwrap().is_none());
        let later = t0() + Duration::hours(1);
        queue.dequeue_next(Some(&d.id), later).await.unwrap().unwrap();

        let err = queue
            .mark_retry(&item.id, "503", FailureClass::Transient, later)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Domain(CoreError::RetryLimitExceeded { .. })));

        let failed = queue
            .mark_failed(&item.id, "503", FailureClass::Transient, later)
            .await
            .unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(queue.list_failed(&d.id, true).await.unwrap().len(), 1);

        queue.acknowledge(&item.id, "ops@example.com", later).await.unwrap();
        assert!(queue.list_failed(&d.id, true).await.unwrap().is_empty());
        assert_eq!(queue.get(&item.id).await.unwrap().status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_record_failure_routes_by_class() {
        let (db, queue) = setup().await;
        let d = crate::testing::device(&db, "D1").await;
        let (item, _) = queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();

        let claimed = queue.dequeue_next(None, t0()).await.unwrap().unwrap();
        let receipt = db.receipts().require(item.receipt_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Processing);

        let failed = queue
            .record_failure(&claimed, "tax code rejected", FailureClass::Permanent, t0())
            .await
            .unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        let receipt = db.receipts().require(&receipt.id).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
    }

    #[tokio::test]
    async fn test_recover_stale_mirrors_receipt() {
        let (db, queue) = setup().await;
        let d = crate::testing::device(&db, "D1").await;
        let (item, _) = queue
            .enqueue(receipt_payload(&draft(&d.id, "sale-1", 500)), None, None, t0())
            .await
            .unwrap();
        queue.dequeue_next(None, t0()).await.unwrap().unwrap();

        let recovered = queue
            .recover_stale(Duration::minutes(5), t0() + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, QueueStatus::Retry);
        assert_eq!(recovered[0].retry_count, 1);

        let receipt = db.receipts().require(item.receipt_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);
    }
}

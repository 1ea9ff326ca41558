//! # Queue Item State Machine
//!
//! Legal transitions of a [`FiscalQueueItem`] and the retry budget rule.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   PENDING ──claim──► PROCESSING ──ok──────► SUCCESS   (terminal)        │
//! │                        │  ▲    │                                        │
//! │          transient /   │  │    └─permanent─► FAILED    (terminal)       │
//! │          precondition  ▼  │claim              ▲                         │
//! │                       RETRY ──budget spent────┘                         │
//! │                                                                         │
//! │   PROCESSING → PROCESSING is never legal (no double claim).             │
//! │   PENDING → FAILED only through operator cancellation.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Retry Budget
//! An attempt that fails while `retry_count + 1 < max_retries` goes to
//! RETRY and increments the counter; otherwise the item is FAILED and the
//! counter is left as is. With `max_retries = 3`:
//!
//! ```text
//! attempt 1 fails → RETRY (1)
//! attempt 2 fails → RETRY (2)
//! attempt 3 fails → FAILED (2)       exactly max_retries failures
//! attempt 3 ok    → SUCCESS (2)      retry_count = attempt - 1
//! ```

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::error::{CoreError, CoreResult, FailureClass};
use crate::types::{FiscalQueueItem, QueueStatus};

/// Error text recorded on items cancelled by an operator.
pub const CANCELLED_BY_OPERATOR: &str = "cancelled by operator";

// =============================================================================
// Status Transitions
// =============================================================================

impl QueueStatus {
    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Retry, Processing)
                | (Processing, Success)
                | (Processing, Retry)
                | (Processing, Failed)
                | (Pending, Failed)
        )
    }
}

// =============================================================================
// Item Transitions
// =============================================================================

impl FiscalQueueItem {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// PENDING, or RETRY whose `next_retry_at` has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Retry => self.next_retry_at.map(|at| at <= now).unwrap_or(true),
            _ => false,
        }
    }

    /// Whether one more failed attempt can still be retried.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count + 1 < self.max_retries
    }

    /// Never claimed by a worker.
    pub fn never_attempted(&self) -> bool {
        self.status == QueueStatus::Pending
            && self.retry_count == 0
            && self.processing_started_at.is_none()
    }

    fn transition(&mut self, next: QueueStatus, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "queue item",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// PENDING/RETRY → PROCESSING.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(QueueStatus::Processing, now)?;
        self.next_retry_at = None;
        self.processing_started_at = Some(now);
        Ok(())
    }

    /// PROCESSING → SUCCESS.
    pub fn succeed(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(QueueStatus::Success, now)?;
        self.result = Some(result);
        self.processed_at = Some(now);
        self.last_error = None;
        self.last_error_class = None;
        Ok(())
    }

    /// PROCESSING → RETRY, consuming one unit of budget.
    ///
    /// Fails with `RetryLimitExceeded` (item untouched) when the budget is
    /// spent; the caller then marks the item FAILED.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        class: FailureClass,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.status == QueueStatus::Processing && !self.has_retry_budget() {
            return Err(CoreError::RetryLimitExceeded {
                item_id: self.id.clone(),
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.transition(QueueStatus::Retry, now)?;
        self.retry_count += 1;
        self.next_retry_at = Some(next_retry_at);
        self.last_error = Some(error.into());
        self.last_error_class = Some(class);
        self.processing_started_at = None;
        Ok(())
    }

    /// PROCESSING → FAILED.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.status == QueueStatus::Pending {
            return Err(CoreError::InvalidTransition {
                entity: "queue item",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: QueueStatus::Failed.to_string(),
            });
        }
        self.transition(QueueStatus::Failed, now)?;
        self.next_retry_at = None;
        self.last_error = Some(error.into());
        self.last_error_class = Some(class);
        self.processed_at = Some(now);
        Ok(())
    }

    /// PENDING → FAILED for an item no worker has touched.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.never_attempted() {
            return Err(CoreError::InvalidTransition {
                entity: "queue item",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: "cancelled".to_string(),
            });
        }
        self.transition(QueueStatus::Failed, now)?;
        self.last_error = Some(CANCELLED_BY_OPERATOR.to_string());
        self.last_error_class = Some(FailureClass::Permanent);
        self.processed_at = Some(now);
        Ok(())
    }

    /// Operator acknowledgement of a FAILED item. Does not change status.
    pub fn acknowledge(&mut self, operator: impl Into<String>, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != QueueStatus::Failed {
            return Err(CoreError::InvalidTransition {
                entity: "queue item",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: "acknowledged".to_string(),
            });
        }
        self.acknowledged_at = Some(now);
        self.acknowledged_by = Some(operator.into());
        self.updated_at = now;
        Ok(())
    }

    /// Whether a PROCESSING item has been claimed for longer than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == QueueStatus::Processing
            && self
                .processing_started_at
                .map(|started| now - started >= stale_after)
                .unwrap_or(true)
    }
}

/// Dispatch order within a device: higher priority first, then insertion.
pub fn dispatch_order(a: &FiscalQueueItem, b: &FiscalQueueItem) -> Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

// =============================================================================
// Unit Tests
// =============================================================================

//! # Shift Rules
//!
//! Pure shift lifecycle rules: sequencing, totals accumulation, close
//! safety and the automatic open/close schedule.
//!
//! ```text
//!            open (sequence = prev + 1)
//!   (none) ─────────────────────────────► OPEN ──► CLOSED
//!                                           │
//!                         receipts add to   │  close refused while
//!                         totals only here  │  operations are pending
//! ```
//!
//! Persistence applies the same rules atomically; these functions are the
//! single definition of what the rules are.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::receipt::ReceiptDraft;
use crate::types::{FiscalDevice, FiscalShift, ReceiptType, ShiftStatus, ShiftTotals};

// =============================================================================
// Totals
// =============================================================================

impl ShiftTotals {
    /// Contribution of one successful receipt.
    ///
    /// Every component is non-negative, so applying a delta can only grow
    /// the totals.
    pub fn delta_for(draft: &ReceiptDraft) -> ShiftTotals {
        let (sales, refunds) = match draft.receipt_type {
            ReceiptType::Sale => (draft.total, Money::zero()),
            ReceiptType::Refund => (Money::zero(), draft.total),
        };
        ShiftTotals {
            sales,
            refunds,
            cash: draft.payment.cash,
            card: draft.payment.card,
            other: draft.payment.other,
            receipt_count: 1,
        }
    }

    pub fn add(&mut self, delta: &ShiftTotals) {
        self.sales += delta.sales;
        self.refunds += delta.refunds;
        self.cash += delta.cash;
        self.card += delta.card;
        self.other += delta.other;
        self.receipt_count += delta.receipt_count;
    }

    /// Sales minus refunds.
    pub fn net(&self) -> Money {
        self.sales - self.refunds
    }
}

// =============================================================================
// Shift Lifecycle
// =============================================================================

impl FiscalShift {
    pub fn is_open(&self) -> bool {
        self.status == ShiftStatus::Open
    }

    /// Sequence number for the next shift on a device.
    pub fn next_sequence(last: Option<&FiscalShift>) -> i64 {
        last.map(|s| s.sequence + 1).unwrap_or(1)
    }

    /// Fails with `ShiftAlreadyOpen` when `current` is an open shift.
    pub fn ensure_can_open(device_id: &str, current: Option<&FiscalShift>) -> CoreResult<()> {
        match current {
            Some(shift) if shift.is_open() => Err(CoreError::ShiftAlreadyOpen {
                device_id: device_id.to_string(),
                shift_id: shift.id.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::ShiftNotOpen {
                shift_id: self.id.clone(),
            })
        }
    }

    /// Adds a successful receipt to the running totals.
    ///
    /// A closed shift refuses with `ShiftNotOpen`; the worker treats that
    /// as an invariant violation.
    pub fn apply_receipt(&mut self, draft: &ReceiptDraft) -> CoreResult<()> {
        self.ensure_open()?;
        self.totals.add(&ShiftTotals::delta_for(draft));
        Ok(())
    }

    /// Checks that the shift may close given the number of non-terminal
    /// queue items still referencing it.
    pub fn ensure_can_close(&self, pending: i64) -> CoreResult<()> {
        self.ensure_open()?;
        if pending > 0 {
            return Err(CoreError::PendingOperations {
                shift_id: self.id.clone(),
                pending,
            });
        }
        Ok(())
    }

    /// Freezes the totals and records the Z-report.
    pub fn close(
        &mut self,
        pending: i64,
        z_report_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.ensure_can_close(pending)?;
        self.status = ShiftStatus::Closed;
        self.z_report_ref = z_report_ref;
        self.closed_at = Some(now);
        Ok(())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }
}

// =============================================================================
// Automatic Schedule
// =============================================================================

/// Most recent UTC instant at or before `now` whose time of day is `at`.
pub fn latest_occurrence(at: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today <= now {
        today
    } else {
        today - Duration::days(1)
    }
}

/// Whether the scheduler should enqueue a `shift_open` for the device.
///
/// ```text
///  open_at occurrence         now
///        │                     │
///  ──────┼─────────────────────┼────►
///        └─ no shift opened or closed since → due
/// ```
///
/// A shift closed after the occurrence (manual close mid-day) suppresses
/// reopening until the next occurrence.
pub fn auto_open_due(device: &FiscalDevice, last: Option<&FiscalShift>, now: DateTime<Utc>) -> bool {
    if !device.is_operational() || !device.auto_open_shift {
        return false;
    }
    let Some(open_at) = device.open_at else {
        return false;
    };
    let occurrence = latest_occurrence(open_at, now);
    match last {
        None => true,
        Some(shift) if shift.is_open() => false,
        Some(shift) => {
            let last_activity = shift.closed_at.unwrap_or(shift.opened_at);
            last_activity < occurrence
        }
    }
}

/// Why the scheduler wants a shift closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCloseReason {
    Scheduled,
    MaxDuration,
}

/// Whether the scheduler should enqueue a `shift_close` for the shift.
///
/// Due when the scheduled close time passed since the shift opened, or the
/// shift reached `max_duration` (fiscal law caps a shift at 24 hours).
pub fn auto_close_due(
    device: &FiscalDevice,
    shift: &FiscalShift,
    now: DateTime<Utc>,
    max_duration: Duration,
) -> Option<AutoCloseReason> {
    if !device.is_operational() || !device.auto_close_shift || !shift.is_open() {
        return None;
    }
    if shift.age(now) >= max_duration {
        return Some(AutoCloseReason::MaxDuration);
    }
    match device.close_at {
        Some(close_at) if latest_occurrence(close_at, now) > shift.opened_at => {
            Some(AutoCloseReason::Scheduled)
        }
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

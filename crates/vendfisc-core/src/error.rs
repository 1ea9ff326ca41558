//! # Error Types
//!
//! Domain-specific error types for vendfisc-core, plus the failure
//! taxonomy the queue worker uses to decide what happens to an item.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  vendfisc-core errors (this file)                                      │
//! │  ├── CoreError        - Domain rule violations                         │
//! │  ├── ValidationError  - Input validation failures                      │
//! │  └── FailureClass     - Transient / Permanent / Precondition /         │
//! │                         InvariantViolation                             │
//! │                                                                         │
//! │  vendfisc-db errors (separate crate)                                   │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  vendfisc-queue errors (separate crate)                                │
//! │  └── QueueError       - Worker / provider / config failures            │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → QueueError → item row   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Taxonomy
//! ```text
//! ┌────────────────────┬─────────────────────────┬──────────────────────────┐
//! │ Class              │ Examples                │ Queue outcome            │
//! ├────────────────────┼─────────────────────────┼──────────────────────────┤
//! │ Transient          │ timeout, 5xx, 429       │ RETRY with backoff       │
//! │ Permanent          │ bad payload, rejected   │ FAILED immediately       │
//! │ Precondition       │ no open shift, pending  │ RETRY with short delay   │
//! │ InvariantViolation │ shift closed under us   │ FAILED + alert           │
//! └────────────────────┴─────────────────────────┴──────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use ts_rs::TS;

use crate::money::Money;

// =============================================================================
// Failure Class
// =============================================================================

/// How a failed attempt is treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FailureClass {
    /// Network trouble, provider 5xx, rate limiting, timeouts.
    Transient,
    /// Validation or business rejection. Retrying cannot help.
    Permanent,
    /// The world is not ready yet (no open shift, pending operations).
    Precondition,
    /// Something that must never happen did. Fatal and alerting.
    InvariantViolation,
}

impl FailureClass {
    /// Whether an item failing with this class goes back to RETRY.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Precondition)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
            FailureClass::Precondition => "precondition",
            FailureClass::InvariantViolation => "invariant_violation",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Fiscal domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The device already has an OPEN shift.
    ///
    /// ## When This Occurs
    /// - Operator presses "open shift" twice
    /// - Scheduled open fires while a manual shift is still running
    #[error("Device {device_id} already has open shift {shift_id}")]
    ShiftAlreadyOpen { device_id: String, shift_id: String },

    /// The shift is not OPEN.
    ///
    /// ## When This Occurs
    /// - Closing a shift that is already closed
    /// - Applying receipt totals after the shift closed (invariant violation)
    #[error("Shift {shift_id} is not open")]
    ShiftNotOpen { shift_id: String },

    /// The device has no OPEN shift to fiscalize into.
    #[error("Device {device_id} has no open shift")]
    NoOpenShift { device_id: String },

    /// Queue items referencing the shift are still in flight.
    ///
    /// ## User Workflow
    /// ```text
    /// Close shift S1
    ///      │
    ///      ▼
    /// Check queue: 2 items PENDING/PROCESSING/RETRY for S1
    ///      │
    ///      ▼
    /// PendingOperations { shift_id: "S1", pending: 2 }
    ///      │
    ///      ▼
    /// shift_close item retries until the receipts settle
    /// ```
    #[error("Shift {shift_id} has {pending} pending operations")]
    PendingOperations { shift_id: String, pending: i64 },

    /// A sale line has no resolvable tax classification.
    #[error("Line {line} ({name}) has no resolvable tax code: {tax_code:?}")]
    MissingTaxCode {
        line: usize,
        name: String,
        tax_code: Option<String>,
    },

    /// The payment split does not cover the receipt total.
    #[error("Payment {actual} does not match receipt total {expected}")]
    PaymentMismatch { expected: Money, actual: Money },

    /// A sale with no lines cannot be fiscalized.
    #[error("Receipt has no lines")]
    EmptyReceipt,

    /// No retry budget left for the item.
    #[error("Queue item {item_id} exhausted its retries ({retry_count}/{max_retries})")]
    RetryLimitExceeded {
        item_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    /// A status change the state machine does not allow.
    #[error("{entity} {id}: cannot transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// The device is inactive, in maintenance, errored or retired.
    #[error("Device {device_id} is not operational")]
    DeviceNotOperational { device_id: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Queue treatment of this error when it surfaces while processing.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            CoreError::NoOpenShift { .. }
            | CoreError::PendingOperations { .. }
            | CoreError::DeviceNotOperational { .. } => FailureClass::Precondition,
            CoreError::ShiftNotOpen { .. } | CoreError::InvalidTransition { .. } => {
                FailureClass::InvariantViolation
            }
            CoreError::ShiftAlreadyOpen { .. }
            | CoreError::MissingTaxCode { .. }
            | CoreError::PaymentMismatch { .. }
            | CoreError::EmptyReceipt
            | CoreError::RetryLimitExceeded { .. }
            | CoreError::Validation(_) => FailureClass::Permanent,
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any business logic runs; always permanent.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Invalid format (e.g., invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

//! # vendfisc-core: Pure Fiscal Domain Logic
//!
//! This crate holds every fiscal rule of Vendfisc as pure functions with
//! zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Vendfisc Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Sale backend (upstream)                         │   │
//! │  │         sale/refund events ──► FiscalService::submit_sale        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            vendfisc-queue (worker pool, provider port)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ vendfisc-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  receipt  │  │   shift   │  │   queue   │  │ operation │  │   │
//! │  │   │  builder  │  │  totals   │  │   state   │  │  payload  │  │   │
//! │  │   │  VAT      │  │  schedule │  │  machine  │  │  schema   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO CLOCK                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 vendfisc-db (Database Layer)                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entities (device, shift, receipt, queue item) and statuses
//! - [`money`] - Integer money with VAT-inclusive extraction
//! - [`receipt`] - Receipt builder (sale → draft)
//! - [`operation`] - Closed set of fiscal operations and the payload envelope
//! - [`shift`] - Shift totals, close safety, automatic schedule
//! - [`queue`] - Queue item state machine and retry budget
//! - [`error`] - Domain errors and failure classification
//! - [`validation`] - Input validation
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: same input, same output; time is always a parameter
//! 2. **Integer Money**: every amount is in minor units (i64)
//! 3. **Explicit Errors**: typed, classified, never panics

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod money;
pub mod operation;
pub mod queue;
pub mod receipt;
pub mod shift;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, FailureClass, ValidationError};
pub use money::Money;
pub use operation::{FiscalOperation, OperationKind, QueuePayload};
pub use receipt::{PaymentSplit, ReceiptDraft, SaleEvent, SaleLine, TaxTable};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum lines on one receipt (terminal buffer limit).
pub const MAX_RECEIPT_LINES: usize = 100;

/// Maximum quantity of a single line.
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Largest amount accepted for a price, a line, a tender or a receipt
/// total, in minor units (one billion major units).
pub const MAX_AMOUNT_MINOR: i64 = 100_000_000_000;

/// Allowed difference between payment split and receipt total, in minor units.
pub const PAYMENT_TOLERANCE_MINOR: i64 = 1;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Upper bound for any configured retry budget.
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// Legal maximum duration of a fiscal shift.
pub const DEFAULT_MAX_SHIFT_HOURS: i64 = 24;

//! # Repository Module
//!
//! Database repository implementations for Vendfisc.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  Queue worker / service                                                │
//! │       │                                                                 │
//! │       │  db.queue().claim_next("D1", now)                              │
//! │       ▼                                                                 │
//! │  QueueRepository                                                       │
//! │  ├── enqueue(&self, new_item, now)                                     │
//! │  ├── claim_next(&self, device, now)                                    │
//! │  ├── mark_retry / mark_failed / mark_success                           │
//! │  └── recover_stale(&self, cutoff, now)                                 │
//! │       │                                                                 │
//! │       │  Conditional UPDATE ... WHERE status = <expected>              │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  The core state machine decides the next state; the repository        │
//! │  writes it only if nobody changed the row in between.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`DeviceRepository`](device::DeviceRepository) - Fiscal device registry
//! - [`ShiftRepository`](shift::ShiftRepository) - Shift lifecycle and totals
//! - [`ReceiptRepository`](receipt::ReceiptRepository) - Receipts and admission
//! - [`QueueRepository`](queue::QueueRepository) - Queue items and transitions
//! - [`LeaseRepository`](lease::LeaseRepository) - Per-device worker leases
//! - [`SettlementRepository`](settlement::SettlementRepository) - Multi-table success paths

pub mod device;
pub mod lease;
pub mod queue;
pub mod receipt;
pub mod settlement;
pub mod shift;

use chrono::{DateTime, Utc};

/// Timestamps are stored as unix milliseconds.
pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Shared fixtures for repository tests.
#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, TimeZone, Utc};

    use crate::repository::device::NewDevice;
    use crate::{Database, DbConfig};
    use vendfisc_core::FiscalDevice;

    pub async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    /// Fixed clock, millisecond precision like the columns.
    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    pub async fn device(db: &Database, name: &str) -> FiscalDevice {
        db.devices()
            .register(NewDevice::sandbox("org-1", name), t0())
            .await
            .unwrap()
    }
}

//! # vendfisc-db: Database Layer for Vendfisc
//!
//! Durable state of the fiscal queue: devices, shifts, receipts, queue
//! items and worker leases, stored in SQLite through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Vendfisc Data Flow                               │
//! │                                                                         │
//! │  FiscalService::submit_sale / QueueWorker::process                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   vendfisc-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ DeviceRepo    │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ ShiftRepo     │    │ 001_fiscal_  │  │   │
//! │  │   │ WAL + busy    │    │ ReceiptRepo   │    │ schema.sql   │  │   │
//! │  │   │ timeout       │    │ QueueRepo     │    │              │  │   │
//! │  │   │               │    │ LeaseRepo     │    │              │  │   │
//! │  │   │               │    │ SettlementRepo│    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   ~/.local/share/fiscald/fiscal.db                              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vendfisc_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fiscal.db")).await?;
//!
//! let admission = db.receipts().admit(&draft, 5, 10, Utc::now()).await?;
//! let next = db.queue().claim_next(Some(&device_id), Utc::now()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::device::{DeviceRepository, NewDevice};
pub use repository::lease::{DeviceLease, LeaseRepository};
pub use repository::queue::{NewQueueItem, QueueRepository};
pub use repository::receipt::{ReceiptAdmission, ReceiptRepository};
pub use repository::settlement::{ReceiptSettlement, SettlementRepository, ShiftOpenSettlement};
pub use repository::shift::ShiftRepository;

//! # vendfisc-queue: Fiscal Queue Runtime
//!
//! Turns queued fiscal operations into provider calls, one device at a time,
//! with retries and shift bookkeeping.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Fiscal Queue Runtime                              │
//! │                                                                         │
//! │  FiscalService (service.rs)                                            │
//! │    submit_sale ─► receipt::build ─► receipts().admit                    │
//! │    operator reads, acknowledgements, cancellation                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌───────────────┐   ┌───────────────┐   ┌──────────────────────────┐ │
//! │  │ FiscalQueue   │   │ ShiftManager  │   │ ShiftScheduler           │ │
//! │  │ enqueue/dedup │   │ open / close  │   │ auto open/close,         │ │
//! │  │ retry policy  │◄──│ requests      │◄──│ stale claim recovery     │ │
//! │  └───────┬───────┘   └───────────────┘   └──────────────────────────┘ │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  ┌───────────────┐   ┌───────────────┐   ┌──────────────────────────┐ │
//! │  │ WorkerPool    │──►│ QueueWorker   │──►│ dyn FiscalProvider       │ │
//! │  │ device leases │   │ gate, call,   │   │ (timeout = transient)    │ │
//! │  │               │   │ settle        │   │                          │ │
//! │  └───────────────┘   └───────────────┘   └──────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Daemon configuration (TOML + environment)
//! - [`error`] - Runtime error types
//! - [`fiscal_queue`] - Admission, dispatch and retry bookkeeping
//! - [`provider`] - Provider port, sandbox and scripted adapters
//! - [`retry`] - Backoff policies per operation family
//! - [`scheduler`] - Automatic shifts and stale claim recovery
//! - [`service`] - Facade for sales and operators
//! - [`shift_manager`] - Shift lifecycle
//! - [`worker`] - Queue worker and worker pool

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod fiscal_queue;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod shift_manager;
pub mod worker;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::FiscalConfig;
pub use error::{QueueError, QueueResult};
pub use fiscal_queue::FiscalQueue;
pub use provider::{
    FiscalProvider, ProviderError, ProviderRequest, ProviderResponse, SandboxProvider,
    ScriptedOutcome, ScriptedProvider,
};
pub use retry::{RetryPolicies, RetryPolicy};
pub use scheduler::{SchedulerReport, ShiftScheduler};
pub use service::FiscalService;
pub use shift_manager::ShiftManager;
pub use worker::{QueueWorker, WorkerPool};

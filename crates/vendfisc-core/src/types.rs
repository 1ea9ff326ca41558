//! # Domain Types
//!
//! Entities and status enums shared by every Vendfisc crate.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  FiscalDevice   │ 1 │  FiscalShift    │ 1 │  FiscalReceipt  │       │
//! │  │  ─────────────  │──N│  ─────────────  │──N│  ─────────────  │       │
//! │  │  id (UUID)      │   │  sequence       │   │  sale_id        │       │
//! │  │  provider       │   │  status         │   │  status         │       │
//! │  │  credentials 🔒 │   │  totals         │   │  draft          │       │
//! │  │  auto-shift     │   │  z_report_ref   │   │  fiscal sign    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │           │                                                             │
//! │           │ 1..N       ┌─────────────────────────────────────┐         │
//! │           └───────────►│  FiscalQueueItem                     │         │
//! │                        │  operation + payload (immutable)     │         │
//! │                        │  status, priority, retry bookkeeping │         │
//! │                        └─────────────────────────────────────┘         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Enums
//! Every status is persisted as lowercase text. With the `sqlx` feature the
//! enums derive `sqlx::Type` so rows decode straight into them.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::FailureClass;
use crate::money::Money;
use crate::operation::{OperationKind, QueuePayload};
use crate::receipt::ReceiptDraft;

// =============================================================================
// VAT Rate
// =============================================================================

/// VAT rate in basis points (2000 = 20%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VatRate(u32);

impl VatRate {
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        VatRate(bps)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// "Without VAT" classification.
    #[inline]
    pub const fn zero() -> Self {
        VatRate(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Default for VatRate {
    fn default() -> Self {
        VatRate::zero()
    }
}

// =============================================================================
// Fiscal Device
// =============================================================================

/// Administrative status of a tax terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
    Error,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Inactive
    }
}

/// Whether the device talks to the provider's sandbox or production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ProviderMode {
    Sandbox,
    Live,
}

impl Default for ProviderMode {
    fn default() -> Self {
        ProviderMode::Sandbox
    }
}

/// Opaque provider credentials.
///
/// Never serialized and redacted in `Debug` so it cannot leak into logs or
/// queue payloads.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Credentials(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(<redacted {} bytes>)", self.0.len())
    }
}

/// Configuration of one tax terminal belonging to an organization.
///
/// Devices are never hard-deleted; `retired_at` marks a soft retire.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalDevice {
    pub id: String,
    pub organization_id: String,
    pub name: String,

    /// Provider adapter name ("sandbox", "atol", ...).
    pub provider: String,

    #[serde(skip)]
    #[ts(skip)]
    pub credentials: Credentials,

    pub mode: ProviderMode,
    pub status: DeviceStatus,

    /// Open a shift automatically (on schedule and on demand for receipts).
    pub auto_open_shift: bool,

    /// Close the shift automatically (on schedule and at max duration).
    pub auto_close_shift: bool,

    /// Scheduled UTC time of day for automatic opening.
    #[ts(as = "Option<String>")]
    pub open_at: Option<NaiveTime>,

    /// Scheduled UTC time of day for automatic closing.
    #[ts(as = "Option<String>")]
    pub close_at: Option<NaiveTime>,

    /// Cashier name printed on automatically opened/closed shifts.
    pub default_cashier: String,

    #[ts(as = "Option<String>")]
    pub retired_at: Option<DateTime<Utc>>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl FiscalDevice {
    /// Only active, non-retired devices have their queues drained.
    pub fn is_operational(&self) -> bool {
        self.status == DeviceStatus::Active && self.retired_at.is_none()
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }
}

// =============================================================================
// Fiscal Shift
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ShiftStatus {
    Open,
    Closed,
}

/// Running totals of a shift.
///
/// Every field only grows while the shift is OPEN. Tender totals are gross
/// turnover per tender (sales and refunds both add to them).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ShiftTotals {
    pub sales: Money,
    pub refunds: Money,
    pub cash: Money,
    pub card: Money,
    pub other: Money,
    pub receipt_count: i64,
}

/// A fiscal shift: the period between opening and closing on one device.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalShift {
    pub id: String,
    pub device_id: String,

    /// Previous shift's sequence + 1, starting at 1 per device.
    pub sequence: i64,

    pub cashier: String,
    pub status: ShiftStatus,
    pub totals: ShiftTotals,

    /// Shift number reported by the provider when opening.
    pub provider_shift_number: Option<i64>,

    /// Z-report reference obtained through the `shift_close` operation.
    pub z_report_ref: Option<String>,

    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,

    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Fiscal Receipt
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ReceiptType {
    Sale,
    Refund,
}

impl ReceiptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptType::Sale => "sale",
            ReceiptType::Refund => "refund",
        }
    }
}

impl fmt::Display for ReceiptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receipt lifecycle. Mirrors the queue item that fiscalizes it.
///
/// ```text
/// PENDING ──► PROCESSING ──► SUCCESS (immutable)
///    ▲   │         │
///    │   │         ├──► PENDING (retry scheduled)
///    │   │         └──► FAILED
///    └───┘
///    │
///    └──► CANCELLED (operator, never attempted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ReceiptStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl ReceiptStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ReceiptStatus::Success | ReceiptStatus::Failed | ReceiptStatus::Cancelled
        )
    }
}

/// Fields the provider returns for a fiscalized receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalSignature {
    pub fiscal_number: String,
    pub fiscal_sign: String,
    pub receipt_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalReceipt {
    pub id: String,
    pub device_id: String,

    /// Bound when the receipt is fiscalized inside a shift.
    pub shift_id: Option<String>,

    pub sale_id: String,
    pub machine_id: String,
    pub receipt_type: ReceiptType,
    pub status: ReceiptStatus,

    /// Lines, VAT breakdown, payment split and totals.
    pub draft: ReceiptDraft,

    /// Present once SUCCESS.
    pub fiscal: Option<FiscalSignature>,

    pub last_error: Option<String>,

    /// Totals were added to the shift (guards double application).
    pub shift_applied: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    #[ts(as = "Option<String>")]
    pub fiscalized_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Fiscal Queue Item
// =============================================================================

/// Queue item lifecycle.
///
/// ```text
/// PENDING ──► PROCESSING ──► SUCCESS (terminal)
///                 │    ▲
///                 │    │
///                 ▼    │
///               RETRY ─┘
///                 │
///                 ▼
///              FAILED (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum QueueStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Retry,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Success => "success",
            QueueStatus::Failed => "failed",
            QueueStatus::Retry => "retry",
        }
    }

    /// SUCCESS and FAILED never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Success | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable fiscal operation.
///
/// `payload` is immutable after creation. `shift_id` and `receipt_id` are
/// binding metadata kept outside the payload so the worker can record which
/// shift a receipt ended up in.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalQueueItem {
    pub id: String,

    /// Insertion order, FIFO tie-break within a priority.
    pub seq: i64,

    pub device_id: String,
    pub operation: OperationKind,
    pub idempotency_key: String,
    pub payload: QueuePayload,
    pub status: QueueStatus,

    /// Higher is dispatched sooner.
    pub priority: i32,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Meaningful only in RETRY.
    #[ts(as = "Option<String>")]
    pub next_retry_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
    pub last_error_class: Option<FailureClass>,

    /// Provider result (or local outcome) recorded on SUCCESS.
    pub result: Option<serde_json::Value>,

    pub shift_id: Option<String>,
    pub receipt_id: Option<String>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    #[ts(as = "Option<String>")]
    pub processing_started_at: Option<DateTime<Utc>>,

    #[ts(as = "Option<String>")]
    pub processed_at: Option<DateTime<Utc>>,

    #[ts(as = "Option<String>")]
    pub acknowledged_at: Option<DateTime<Utc>>,

    pub acknowledged_by: Option<String>,
}

/// Per-device queue counters for the operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueStats {
    pub device_id: String,
    pub pending: i64,
    pub processing: i64,
    pub retry: i64,
    pub success: i64,
    pub failed: i64,
    /// FAILED items nobody has acknowledged yet.
    pub unacknowledged_failed: i64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn device(status: DeviceStatus) -> FiscalDevice {
        let now = Utc::now();
        FiscalDevice {
            id: "dev-1".to_string(),
            organization_id: "org-1".to_string(),
            name: "Lobby kiosk".to_string(),
            provider: "sandbox".to_string(),
            credentials: Credentials::new(b"secret-token".to_vec()),
            mode: ProviderMode::Sandbox,
            status,
            auto_open_shift: false,
            auto_close_shift: false,
            open_at: None,
            close_at: None,
            default_cashier: "auto".to_string(),
            retired_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_device_operational_only_when_active_and_not_retired() {
        assert!(device(DeviceStatus::Active).is_operational());
        assert!(!device(DeviceStatus::Maintenance).is_operational());

        let mut retired = device(DeviceStatus::Active);
        retired.retired_at = Some(Utc::now());
        assert!(!retired.is_operational());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let d = device(DeviceStatus::Active);
        let debug = format!("{:?}", d);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("redacted 12 bytes"));

        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("credentials"));
    }

    #[test]
    fn test_queue_status_terminal() {
        assert!(QueueStatus::Success.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(!QueueStatus::Retry.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert_eq!(QueueStatus::Retry.to_string(), "retry");
    }

    #[test]
    fn test_status_serialization_is_lowercase() {
        assert_eq!(serde_json::to_string(&ReceiptStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(serde_json::to_string(&ShiftStatus::Open).unwrap(), "\"open\"");
        assert_eq!(serde_json::to_string(&ProviderMode::Live).unwrap(), "\"live\"");
    }
}

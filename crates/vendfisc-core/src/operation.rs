//! # Fiscal Operations
//!
//! The closed set of operations the queue can carry, and the payload
//! envelope stored with every queue item.
//!
//! ## Payload Schema
//! ```text
//! {
//!   "device_id": "…",
//!   "shift_id": "…" | null,          ← target shift (close, x-report)
//!   "receipt_id": "…" | null,        ← receipt row being fiscalized
//!   "idempotency_key": "sale:sale-42",
//!   "body": {
//!     "operation": "receipt_sale",
//!     "data": { …ReceiptDraft… }
//!   }
//! }
//! ```
//!
//! The envelope is written once at enqueue time and never rewritten.
//! New variants may be added; existing ones keep their shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::receipt::ReceiptDraft;

// =============================================================================
// Operation Kind
// =============================================================================

/// Discriminant persisted in the `operation` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum OperationKind {
    ReceiptSale,
    ReceiptRefund,
    ShiftOpen,
    ShiftClose,
    XReport,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::ReceiptSale,
        OperationKind::ReceiptRefund,
        OperationKind::ShiftOpen,
        OperationKind::ShiftClose,
        OperationKind::XReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ReceiptSale => "receipt_sale",
            OperationKind::ReceiptRefund => "receipt_refund",
            OperationKind::ShiftOpen => "shift_open",
            OperationKind::ShiftClose => "shift_close",
            OperationKind::XReport => "x_report",
        }
    }

    pub fn is_receipt(&self) -> bool {
        matches!(self, OperationKind::ReceiptSale | OperationKind::ReceiptRefund)
    }

    pub fn is_shift(&self) -> bool {
        !self.is_receipt()
    }

    /// Dispatch priority when the caller does not supply one.
    ///
    /// Opening beats receipts (they need the shift), receipts beat reports,
    /// and closing goes last so it finds the shift drained.
    pub fn default_priority(&self) -> i32 {
        match self {
            OperationKind::ShiftOpen => 10,
            OperationKind::ReceiptSale | OperationKind::ReceiptRefund => 5,
            OperationKind::XReport => 3,
            OperationKind::ShiftClose => 1,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Operation Bodies
// =============================================================================

/// What initiated a shift operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ShiftTrigger {
    /// Operator request.
    Manual,
    /// Device open/close schedule.
    Scheduled,
    /// Receipt arrived with no open shift on an auto-open device.
    OnDemand,
    /// Shift reached the maximum legal duration.
    MaxDuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ShiftOpenRequest {
    pub cashier: String,
    pub trigger: ShiftTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ShiftCloseRequest {
    pub shift_id: String,
    pub cashier: String,
    pub trigger: ShiftTrigger,
    /// The shift was already closed locally; the item only files its
    /// Z-report with the provider.
    #[serde(default)]
    pub z_report_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct XReportRequest {
    pub cashier: String,
}

/// Closed, typed set of fiscal operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "operation", content = "data", rename_all = "snake_case")]
#[ts(export)]
pub enum FiscalOperation {
    ReceiptSale(ReceiptDraft),
    ReceiptRefund(ReceiptDraft),
    ShiftOpen(ShiftOpenRequest),
    ShiftClose(ShiftCloseRequest),
    XReport(XReportRequest),
}

impl FiscalOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            FiscalOperation::ReceiptSale(_) => OperationKind::ReceiptSale,
            FiscalOperation::ReceiptRefund(_) => OperationKind::ReceiptRefund,
            FiscalOperation::ShiftOpen(_) => OperationKind::ShiftOpen,
            FiscalOperation::ShiftClose(_) => OperationKind::ShiftClose,
            FiscalOperation::XReport(_) => OperationKind::XReport,
        }
    }

    /// Receipt body, for receipt operations.
    pub fn receipt(&self) -> Option<&ReceiptDraft> {
        match self {
            FiscalOperation::ReceiptSale(draft) | FiscalOperation::ReceiptRefund(draft) => {
                Some(draft)
            }
            _ => None,
        }
    }
}

// =============================================================================
// Queue Payload
// =============================================================================

/// Immutable envelope persisted with every queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueuePayload {
    pub device_id: String,
    pub shift_id: Option<String>,
    pub receipt_id: Option<String>,
    pub idempotency_key: String,
    pub body: FiscalOperation,
}

impl QueuePayload {
    pub fn new(
        device_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        body: FiscalOperation,
    ) -> Self {
        QueuePayload {
            device_id: device_id.into(),
            shift_id: None,
            receipt_id: None,
            idempotency_key: idempotency_key.into(),
            body,
        }
    }

    pub fn with_shift(mut self, shift_id: impl Into<String>) -> Self {
        self.shift_id = Some(shift_id.into());
        self
    }

    pub fn with_receipt(mut self, receipt_id: impl Into<String>) -> Self {
        self.receipt_id = Some(receipt_id.into());
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.body.kind()
    }
}

// =============================================================================
// Idempotency Keys
// =============================================================================

/// `"{type}:{saleId}"`, e.g. `sale:sale-42` or `refund:sale-42`.
pub fn receipt_key(receipt_type: crate::types::ReceiptType, sale_id: &str) -> String {
    format!("{}:{}", receipt_type.as_str(), sale_id)
}

/// One key per (device, shift sequence) so two opens of the same shift
/// collapse into one item.
pub fn shift_open_key(device_id: &str, sequence: i64) -> String {
    format!("shift_open:{}:{}", device_id, sequence)
}

pub fn shift_close_key(shift_id: &str) -> String {
    format!("shift_close:{}", shift_id)
}

pub fn x_report_key(device_id: &str, request_id: &str) -> String {
    format!("x_report:{}:{}", device_id, request_id)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReceiptType;

    #[test]
    fn test_default_priorities_order() {
        assert!(
            OperationKind::ShiftOpen.default_priority()
                > OperationKind::ReceiptSale.default_priority()
        );
        assert!(
            OperationKind::ReceiptRefund.default_priority()
                > OperationKind::XReport.default_priority()
        );
        assert!(
            OperationKind::XReport.default_priority()
                > OperationKind::ShiftClose.default_priority()
        );
    }

    #[test]
    fn test_payload_schema() {
        let payload = QueuePayload::new(
            "D1",
            shift_close_key("S1"),
            FiscalOperation::ShiftClose(ShiftCloseRequest {
                shift_id: "S1".to_string(),
                cashier: "Operator".to_string(),
                trigger: ShiftTrigger::Manual,
                z_report_only: false,
            }),
        )
        .with_shift("S1");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["device_id"], "D1");
        assert_eq!(json["shift_id"], "S1");
        assert_eq!(json["receipt_id"], serde_json::Value::Null);
        assert_eq!(json["idempotency_key"], "shift_close:S1");
        assert_eq!(json["body"]["operation"], "shift_close");
        assert_eq!(json["body"]["data"]["trigger"], "manual");
        assert_eq!(json["body"]["data"]["z_report_only"], false);

        let back: QueuePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.kind(), OperationKind::ShiftClose);
    }

    #[test]
    fn test_idempotency_keys() {
        assert_eq!(receipt_key(ReceiptType::Sale, "sale-42"), "sale:sale-42");
        assert_eq!(receipt_key(ReceiptType::Refund, "sale-42"), "refund:sale-42");
        assert_eq!(shift_open_key("D1", 3), "shift_open:D1:3");
    }

    #[test]
    fn test_operation_kind_strings() {
        for kind in OperationKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}

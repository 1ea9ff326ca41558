//! Shared fixtures for queue tests.

use chrono::{DateTime, TimeZone, Utc};

use vendfisc_core::money::Money;
use vendfisc_core::operation::{x_report_key, XReportRequest};
use vendfisc_core::receipt::{build, PaymentSplit, SaleEvent, SaleLine, TaxTable};
use vendfisc_core::types::{ReceiptType, VatRate};
use vendfisc_core::{FiscalDevice, FiscalOperation, QueuePayload, ReceiptDraft};
use vendfisc_db::{Database, DbConfig, NewDevice};

use crate::config::PrioritySettings;
use crate::fiscal_queue::FiscalQueue;
use crate::retry::RetryPolicies;

pub async fn setup() -> (Database, FiscalQueue) {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let queue = FiscalQueue::new(
        db.clone(),
        RetryPolicies::default(),
        PrioritySettings::default(),
    );
    (db, queue)
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

pub fn tax_table() -> TaxTable {
    TaxTable::new().with_rate("vat20", VatRate::from_bps(2000))
}

/// Single-line cash sale.
pub fn sale(device_id: &str, sale_id: &str, amount: i64) -> SaleEvent {
    SaleEvent {
        sale_id: sale_id.to_string(),
        machine_id: "vm-1".to_string(),
        device_id: device_id.to_string(),
        receipt_type: ReceiptType::Sale,
        lines: vec![SaleLine {
            name: "Espresso".to_string(),
            sku: None,
            quantity: 1,
            unit_price: Money::from_minor(amount),
            tax_code: Some("vat20".to_string()),
        }],
        payment: PaymentSplit {
            cash: Money::from_minor(amount),
            ..Default::default()
        },
    }
}

pub fn draft(device_id: &str, sale_id: &str, amount: i64) -> ReceiptDraft {
    build(&sale(device_id, sale_id, amount), &tax_table()).unwrap()
}

/// Refund of a single-line cash sale.
pub fn refund_draft(device_id: &str, sale_id: &str, amount: i64) -> ReceiptDraft {
    let mut refund = sale(device_id, sale_id, amount);
    refund.receipt_type = ReceiptType::Refund;
    build(&refund, &tax_table()).unwrap()
}

pub fn receipt_payload(draft: &ReceiptDraft) -> QueuePayload {
    let body = match draft.receipt_type {
        ReceiptType::Sale => FiscalOperation::ReceiptSale(draft.clone()),
        ReceiptType::Refund => FiscalOperation::ReceiptRefund(draft.clone()),
    };
    QueuePayload::new(&draft.device_id, draft.idempotency_key(), body)
}

pub fn x_report_payload(device_id: &str, request_id: &str) -> QueuePayload {
    QueuePayload::new(
        device_id,
        x_report_key(device_id, request_id),
        FiscalOperation::XReport(XReportRequest {
            cashier: "Vending Machine".to_string(),
        }),
    )
}

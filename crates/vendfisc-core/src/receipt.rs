//! # Receipt Builder
//!
//! Turns an upstream sale or refund into a self-contained fiscal receipt
//! draft: lines with per-line VAT, a VAT breakdown, a normalized payment
//! split and totals.
//!
//! ## Build Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SaleEvent ──► validate ──► resolve tax ──► line VAT ──► breakdown      │
//! │                  │              │                            │          │
//! │                  ▼              ▼                            ▼          │
//! │            ValidationError  MissingTaxCode          payment normalize   │
//! │                                                              │          │
//! │                                                              ▼          │
//! │                                          PaymentMismatch | ReceiptDraft │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rounding
//! Prices are VAT-inclusive. VAT is extracted once per line (half-up) and
//! the breakdown sums the already-rounded line amounts, so the breakdown
//! always matches the lines exactly.
//!
//! ## Payment Tolerance
//! A payment split may differ from the total by at most one minor unit
//! (coin rounding in some bill acceptors). The difference is folded into
//! the largest tender so the stored split sums exactly to the total.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::operation::receipt_key;
use crate::types::{ReceiptType, VatRate};
use crate::validation;
use crate::{MAX_RECEIPT_LINES, PAYMENT_TOLERANCE_MINOR};

// =============================================================================
// Input: upstream sale
// =============================================================================

/// A completed sale or refund as reported by the machine backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleEvent {
    pub sale_id: String,
    pub machine_id: String,
    pub device_id: String,
    pub receipt_type: ReceiptType,
    pub lines: Vec<SaleLine>,
    pub payment: PaymentSplit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleLine {
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    /// VAT-inclusive shelf price.
    pub unit_price: Money,
    /// Tax classification code, resolved against the [`TaxTable`].
    pub tax_code: Option<String>,
}

/// How the customer paid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentSplit {
    pub cash: Money,
    pub card: Money,
    pub other: Money,
}

impl PaymentSplit {
    /// Sum of the tenders. Callers bound each tender first.
    pub fn total(&self) -> Money {
        self.cash + self.card + self.other
    }

    /// Adds `delta` to the largest tender (cash wins ties, then card).
    fn adjust_largest(&mut self, delta: Money) {
        if self.cash >= self.card && self.cash >= self.other {
            self.cash += delta;
        } else if self.card >= self.other {
            self.card += delta;
        } else {
            self.other += delta;
        }
    }
}

// =============================================================================
// Tax Table
// =============================================================================

/// Tax code → VAT rate lookup, consumed as reference data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxTable {
    rates: BTreeMap<String, VatRate>,
}

impl TaxTable {
    pub fn new() -> Self {
        TaxTable::default()
    }

    pub fn with_rate(mut self, code: impl Into<String>, rate: VatRate) -> Self {
        self.insert(code, rate);
        self
    }

    pub fn insert(&mut self, code: impl Into<String>, rate: VatRate) {
        self.rates.insert(code.into(), rate);
    }

    pub fn resolve(&self, code: &str) -> Option<VatRate> {
        self.rates.get(code).copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

// =============================================================================
// Output: receipt draft
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReceiptLine {
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price: Money,
    pub total: Money,
    pub tax_code: String,
    pub vat_rate: VatRate,
    pub vat_amount: Money,
}

/// VAT aggregated per tax code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VatBreakdown {
    pub tax_code: String,
    pub vat_rate: VatRate,
    /// Sum of VAT-inclusive line totals under this code.
    pub gross: Money,
    pub vat: Money,
}

/// Self-contained fiscal receipt body, ready to be queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReceiptDraft {
    pub sale_id: String,
    pub machine_id: String,
    pub device_id: String,
    pub receipt_type: ReceiptType,
    pub lines: Vec<ReceiptLine>,
    pub vat_breakdown: Vec<VatBreakdown>,
    pub payment: PaymentSplit,
    pub total: Money,
    pub total_vat: Money,
}

impl ReceiptDraft {
    /// `"{type}:{saleId}"`.
    pub fn idempotency_key(&self) -> String {
        receipt_key(self.receipt_type, &self.sale_id)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`ReceiptDraft`] from a sale. Pure and deterministic.
///
/// ## Example
/// ```rust
/// use vendfisc_core::money::Money;
/// use vendfisc_core::receipt::{build, PaymentSplit, SaleEvent, SaleLine, TaxTable};
/// use vendfisc_core::types::{ReceiptType, VatRate};
///
/// let table = TaxTable::new().with_rate("vat20", VatRate::from_bps(2000));
/// let sale = SaleEvent {
///     sale_id: "sale-1".into(),
///     machine_id: "vm-7".into(),
///     device_id: "dev-1".into(),
///     receipt_type: ReceiptType::Sale,
///     lines: vec![SaleLine {
///         name: "Water 0.5L".into(),
///         sku: None,
///         quantity: 2,
///         unit_price: Money::from_minor(4550),
///         tax_code: Some("vat20".into()),
///     }],
///     payment: PaymentSplit { card: Money::from_minor(9100), ..Default::default() },
/// };
///
/// let draft = build(&sale, &table).unwrap();
/// assert_eq!(draft.total.minor(), 9100);
/// assert_eq!(draft.total_vat.minor(), 1517);
/// assert_eq!(draft.idempotency_key(), "sale:sale-1");
/// ```
pub fn build(sale: &SaleEvent, tax_table: &TaxTable) -> CoreResult<ReceiptDraft> {
    validation::validate_identifier("sale_id", &sale.sale_id)?;
    validation::validate_identifier("machine_id", &sale.machine_id)?;
    validation::validate_identifier("device_id", &sale.device_id)?;

    if sale.lines.is_empty() {
        return Err(CoreError::EmptyReceipt);
    }
    validation::validate_line_count(sale.lines.len(), MAX_RECEIPT_LINES)?;

    let mut lines = Vec::with_capacity(sale.lines.len());
    for (index, line) in sale.lines.iter().enumerate() {
        lines.push(build_line(index, line, tax_table)?);
    }

    let total = lines
        .iter()
        .try_fold(Money::zero(), |acc, l| acc.checked_add(l.total))
        .ok_or_else(|| validation::amount_out_of_range("total"))?;
    validation::validate_amount("total", total)?;

    let vat_breakdown = breakdown(&lines);
    let total_vat: Money = vat_breakdown.iter().map(|b| b.vat).sum();
    let payment = normalize_payment(sale.payment, total)?;

    Ok(ReceiptDraft {
        sale_id: sale.sale_id.clone(),
        machine_id: sale.machine_id.clone(),
        device_id: sale.device_id.clone(),
        receipt_type: sale.receipt_type,
        lines,
        vat_breakdown,
        payment,
        total,
        total_vat,
    })
}

fn build_line(index: usize, line: &SaleLine, tax_table: &TaxTable) -> CoreResult<ReceiptLine> {
    validation::validate_line_name(&line.name)?;
    validation::validate_quantity(line.quantity)?;
    validation::validate_amount("unit_price", line.unit_price)?;

    let (tax_code, vat_rate) = match line.tax_code.as_deref() {
        Some(code) => match tax_table.resolve(code) {
            Some(rate) => (code.to_string(), rate),
            None => return Err(missing_tax_code(index, line)),
        },
        None => return Err(missing_tax_code(index, line)),
    };

    let total = line
        .unit_price
        .checked_multiply_quantity(line.quantity)
        .ok_or_else(|| validation::amount_out_of_range("line.total"))?;
    validation::validate_amount("line.total", total)?;
    Ok(ReceiptLine {
        name: line.name.clone(),
        sku: line.sku.clone(),
        quantity: line.quantity,
        unit_price: line.unit_price,
        total,
        tax_code,
        vat_rate,
        vat_amount: total.vat_included(vat_rate),
    })
}

fn missing_tax_code(index: usize, line: &SaleLine) -> CoreError {
    CoreError::MissingTaxCode {
        line: index,
        name: line.name.clone(),
        tax_code: line.tax_code.clone(),
    }
}

/// Groups lines by tax code. BTreeMap keeps the output order stable.
fn breakdown(lines: &[ReceiptLine]) -> Vec<VatBreakdown> {
    let mut groups: BTreeMap<&str, VatBreakdown> = BTreeMap::new();
    for line in lines {
        let entry = groups
            .entry(line.tax_code.as_str())
            .or_insert_with(|| VatBreakdown {
                tax_code: line.tax_code.clone(),
                vat_rate: line.vat_rate,
                gross: Money::zero(),
                vat: Money::zero(),
            });
        entry.gross += line.total;
        entry.vat += line.vat_amount;
    }
    groups.into_values().collect()
}

fn normalize_payment(payment: PaymentSplit, total: Money) -> CoreResult<PaymentSplit> {
    validation::validate_amount("payment.cash", payment.cash)?;
    validation::validate_amount("payment.card", payment.card)?;
    validation::validate_amount("payment.other", payment.other)?;

    let paid = payment.total();
    let delta = total - paid;
    if delta.is_zero() {
        return Ok(payment);
    }
    if delta.abs().minor() > PAYMENT_TOLERANCE_MINOR {
        return Err(CoreError::PaymentMismatch {
            expected: total,
            actual: paid,
        });
    }

    let mut normalized = payment;
    normalized.adjust_largest(delta);
    if normalized.cash.is_negative() || normalized.card.is_negative() || normalized.other.is_negative()
    {
        return Err(CoreError::PaymentMismatch {
            expected: total,
            actual: paid,
        });
    }
    Ok(normalized)
}

// =============================================================================
// Unit Tests
// =============================================================================

//! # Money Module
//!
//! Provides the `Money` type for every amount that ends up on a fiscal
//! receipt or in shift totals.
//!
//! ## Why Integer Minor Units?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  FISCAL AMOUNTS MUST RECONCILE TO THE LAST MINOR UNIT                   │
//! │                                                                         │
//! │  The tax authority compares our shift totals with the Z-report the     │
//! │  terminal prints. A drift of 0.01 is a reportable discrepancy.         │
//! │                                                                         │
//! │  OUR SOLUTION: Integer minor units (kopecks, cents, tiyn)              │
//! │    unit price 45.50 × 2  = 4550 × 2 = 9100 minor units                 │
//! │    VAT-inclusive 20%     = 9100 × 2000 / 12000 = 1516.67 → 1517        │
//! │    Rounding happens ONCE per line, explicitly, half-up.                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use vendfisc_core::money::Money;
//! use vendfisc_core::types::VatRate;
//!
//! let price = Money::from_minor(4550); // 45.50
//! let line_total = price.multiply_quantity(2); // 91.00
//! let vat = line_total.vat_included(VatRate::from_bps(2000));
//! assert_eq!(vat.minor(), 1517);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};
use ts_rs::TS;

use crate::types::VatRate;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit.
///
/// ## Design Decisions
/// - **i64 (signed)**: differences (payment minus total) can be negative
/// - **Single field tuple struct**: zero-cost wrapper over i64
/// - **Serialized as a bare integer**: queue payloads stay compact
///
/// ## Where Money Flows
/// ```text
/// SaleLine.unit_price ──► ReceiptLine.total ──► ReceiptDraft.total
///                               │                     │
///                               ▼                     ▼
///                         VAT breakdown         ShiftTotals.sales
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from minor units.
    ///
    /// ## Example
    /// ```rust
    /// use vendfisc_core::money::Money;
    ///
    /// let price = Money::from_minor(1099);
    /// assert_eq!(price.minor(), 1099);
    /// ```
    #[inline]
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Creates a Money value from major and minor parts.
    ///
    /// For negative amounts only the major part carries the sign:
    /// `from_major_minor(-5, 50)` is -5.50.
    #[inline]
    pub const fn from_major_minor(major: i64, minor: i64) -> Self {
        if major < 0 {
            Money(major * 100 - minor)
        } else {
            Money(major * 100 + minor)
        }
    }

    /// Returns the value in minor units.
    #[inline]
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Returns the major part (truncated toward zero).
    #[inline]
    pub const fn major(&self) -> i64 {
        self.0 / 100
    }

    /// Returns the minor part (always 0-99).
    #[inline]
    pub const fn minor_part(&self) -> i64 {
        (self.0 % 100).abs()
    }

    /// Zero.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Returns the absolute value.
    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Extracts the VAT contained in a VAT-inclusive amount.
    ///
    /// ## Formula
    /// ```text
    /// vat = amount × bps / (10000 + bps)     rounded half away from zero
    ///
    /// 9100 at 20%  → 9100 × 2000 / 12000 = 1516.67 → 1517
    /// 6000 at 10%  → 6000 × 1000 / 11000 =  545.45 →  545
    /// ```
    ///
    /// Vending prices are shelf prices, so VAT is always carved out of the
    /// total rather than added on top of it.
    ///
    /// ## Example
    /// ```rust
    /// use vendfisc_core::money::Money;
    /// use vendfisc_core::types::VatRate;
    ///
    /// let total = Money::from_minor(6000);
    /// assert_eq!(total.vat_included(VatRate::from_bps(1000)).minor(), 545);
    /// assert_eq!(total.vat_included(VatRate::zero()).minor(), 0);
    /// ```
    pub fn vat_included(&self, rate: VatRate) -> Money {
        if rate.is_zero() {
            return Money::zero();
        }
        // i128 keeps large shift totals from overflowing mid-calculation
        let numerator = self.0 as i128 * rate.bps() as i128;
        let denominator = 10_000i128 + rate.bps() as i128;
        let half = denominator / 2;
        let vat = if numerator >= 0 {
            (numerator + half) / denominator
        } else {
            (numerator - half) / denominator
        };
        Money::from_minor(vat as i64)
    }

    /// Multiplies money by a quantity.
    ///
    /// ## Example
    /// ```rust
    /// use vendfisc_core::money::Money;
    ///
    /// let unit_price = Money::from_minor(299);
    /// assert_eq!(unit_price.multiply_quantity(3).minor(), 897);
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Multiplies by a quantity, `None` on overflow.
    #[inline]
    pub const fn checked_multiply_quantity(&self, qty: i64) -> Option<Self> {
        match self.0.checked_mul(qty) {
            Some(v) => Some(Money(v)),
            None => None,
        }
    }

    /// Adds two amounts, `None` on overflow.
    #[inline]
    pub const fn checked_add(&self, other: Money) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Money(v)),
            None => None,
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Plain decimal rendering (`45.50`, `-5.50`). Currency symbols are the
/// dashboard's concern.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}{}.{:02}", sign, self.major().abs(), self.minor_part())
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Neg for Money {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

/// Multiplication by i64 (quantities).
impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + *m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_minor() {
        let money = Money::from_minor(1099);
        assert_eq!(money.minor(), 1099);
        assert_eq!(money.major(), 10);
        assert_eq!(money.minor_part(), 99);
    }

    #[test]
    fn test_from_major_minor() {
        assert_eq!(Money::from_major_minor(45, 50).minor(), 4550);
        assert_eq!(Money::from_major_minor(-5, 50).minor(), -550);
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_minor(4550).to_string(), "45.50");
        assert_eq!(Money::from_minor(500).to_string(), "5.00");
        assert_eq!(Money::from_minor(-550).to_string(), "-5.50");
        assert_eq!(Money::zero().to_string(), "0.00");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_minor(1000);
        let b = Money::from_minor(500);

        assert_eq!((a + b).minor(), 1500);
        assert_eq!((a - b).minor(), 500);
        assert_eq!((a * 3).minor(), 3000);
        assert_eq!((-a).minor(), -1000);
    }

    #[test]
    fn test_checked_arithmetic() {
        let big = Money::from_minor(i64::MAX / 2 + 1);
        assert_eq!(big.checked_multiply_quantity(2), None);
        assert_eq!(Money::from_minor(i64::MAX).checked_add(Money::from_minor(1)), None);
        assert_eq!(
            Money::from_minor(299).checked_multiply_quantity(3),
            Some(Money::from_minor(897))
        );
        assert_eq!(
            Money::from_minor(100).checked_add(Money::from_minor(1)),
            Some(Money::from_minor(101))
        );
    }

    #[test]
    fn test_sum() {
        let amounts = vec![Money::from_minor(100), Money::from_minor(250), Money::from_minor(1)];
        let total: Money = amounts.iter().sum();
        assert_eq!(total.minor(), 351);
        let empty: Money = Vec::<Money>::new().into_iter().sum();
        assert!(empty.is_zero());
    }

    #[test]
    fn test_vat_included_rounds_half_up() {
        // 9100 × 2000 / 12000 = 1516.666…
        assert_eq!(Money::from_minor(9100).vat_included(VatRate::from_bps(2000)).minor(), 1517);
        // 6000 × 1000 / 11000 = 545.45…
        assert_eq!(Money::from_minor(6000).vat_included(VatRate::from_bps(1000)).minor(), 545);
        // 12 × 2000 / 12000 = 2 exactly
        assert_eq!(Money::from_minor(12).vat_included(VatRate::from_bps(2000)).minor(), 2);
        // 3 × 2000 / 12000 = 0.5 → 1
        assert_eq!(Money::from_minor(3).vat_included(VatRate::from_bps(2000)).minor(), 1);
    }

    #[test]
    fn test_vat_included_zero_rate() {
        assert!(Money::from_minor(9999).vat_included(VatRate::zero()).is_zero());
    }

    #[test]
    fn test_vat_included_negative_is_symmetric() {
        let rate = VatRate::from_bps(2000);
        let positive = Money::from_minor(9100).vat_included(rate);
        let negative = Money::from_minor(-9100).vat_included(rate);
        assert_eq!(negative, -positive);
    }

    #[test]
    fn test_zero_and_checks() {
        assert!(Money::zero().is_zero());
        assert!(Money::from_minor(1).is_positive());
        assert!(Money::from_minor(-1).is_negative());
        assert_eq!(Money::from_minor(-42).abs().minor(), 42);
    }
}

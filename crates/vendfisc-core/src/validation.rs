//! # Validation Module
//!
//! Input validation for everything that enters the fiscal queue.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Sale backend (upstream)                                      │
//! │  └── Shape of the sale event                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Receipt builder / queue admission                            │
//! │  └── THIS MODULE: identifiers, quantities, amounts, keys, budgets      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── CHECK constraints on status columns                               │
//! │  └── Partial UNIQUE indexes (open shift, live idempotency key)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A validation failure is always a permanent failure: the item is never
//! queued, or is failed immediately.

use crate::error::ValidationError;
use crate::money::Money;
use crate::{MAX_AMOUNT_MINOR, MAX_IDEMPOTENCY_KEY_LEN, MAX_ITEM_QUANTITY, MAX_RETRIES_LIMIT};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates an external identifier (sale id, machine id, device id).
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - No whitespace or ':' (the key separator)
///
/// ## Example
/// ```rust
/// use vendfisc_core::validation::validate_identifier;
///
/// assert!(validate_identifier("sale_id", "sale-42").is_ok());
/// assert!(validate_identifier("sale_id", "").is_err());
/// assert!(validate_identifier("sale_id", "a:b").is_err());
/// ```
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > 64 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 64,
        });
    }

    if value.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain whitespace or ':'".to_string(),
        });
    }

    Ok(())
}

/// Validates an idempotency key.
pub fn validate_idempotency_key(key: &str) -> ValidationResult<()> {
    if key.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "idempotency_key".to_string(),
        });
    }

    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "idempotency_key".to_string(),
            max: MAX_IDEMPOTENCY_KEY_LEN,
        });
    }

    Ok(())
}

/// Validates a cashier name printed on shift documents.
pub fn validate_cashier(cashier: &str) -> ValidationResult<()> {
    let cashier = cashier.trim();
    if cashier.is_empty() {
        return Err(ValidationError::Required {
            field: "cashier".to_string(),
        });
    }
    if cashier.chars().count() > 64 {
        return Err(ValidationError::TooLong {
            field: "cashier".to_string(),
            max: 64,
        });
    }
    Ok(())
}

/// Validates a receipt line name (printed, 128 chars max on most terminals).
pub fn validate_line_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "line.name".to_string(),
        });
    }
    if name.chars().count() > 128 {
        return Err(ValidationError::TooLong {
            field: "line.name".to_string(),
            max: 128,
        });
    }
    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a line quantity.
///
/// ## Example
/// ```rust
/// use vendfisc_core::validation::validate_quantity;
///
/// assert!(validate_quantity(1).is_ok());
/// assert!(validate_quantity(0).is_err());
/// assert!(validate_quantity(-1).is_err());
/// ```
pub fn validate_quantity(quantity: i64) -> ValidationResult<()> {
    if quantity <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if quantity > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

pub fn validate_non_negative(field: &str, amount: Money) -> ValidationResult<()> {
    if amount.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a money amount: not negative and at most [`MAX_AMOUNT_MINOR`].
///
/// ## Example
/// ```rust
/// use vendfisc_core::money::Money;
/// use vendfisc_core::validation::validate_amount;
///
/// assert!(validate_amount("unit_price", Money::from_minor(4550)).is_ok());
/// assert!(validate_amount("unit_price", Money::from_minor(-1)).is_err());
/// assert!(validate_amount("unit_price", Money::from_minor(i64::MAX)).is_err());
/// ```
pub fn validate_amount(field: &str, amount: Money) -> ValidationResult<()> {
    validate_non_negative(field, amount)?;
    if amount.minor() > MAX_AMOUNT_MINOR {
        return Err(amount_out_of_range(field));
    }
    Ok(())
}

/// The error for an amount above [`MAX_AMOUNT_MINOR`] or one that overflows.
pub fn amount_out_of_range(field: &str) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        min: 0,
        max: MAX_AMOUNT_MINOR,
    }
}

pub fn validate_line_count(count: usize, max: usize) -> ValidationResult<()> {
    if count > max {
        return Err(ValidationError::OutOfRange {
            field: "lines".to_string(),
            min: 1,
            max: max as i64,
        });
    }
    Ok(())
}

/// Validates a retry budget supplied at enqueue.
pub fn validate_max_retries(max_retries: u32) -> ValidationResult<()> {
    if max_retries == 0 || max_retries > MAX_RETRIES_LIMIT {
        return Err(ValidationError::OutOfRange {
            field: "max_retries".to_string(),
            min: 1,
            max: MAX_RETRIES_LIMIT as i64,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier() {
        assert!(validate_identifier("device_id", "D1").is_ok());
        assert!(matches!(
            validate_identifier("device_id", "   "),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            validate_identifier("device_id", &"x".repeat(65)),
            Err(ValidationError::TooLong { .. })
        ));
        assert!(validate_identifier("device_id", "has space").is_err());
    }

    #[test]
    fn test_idempotency_key() {
        assert!(validate_idempotency_key("sale:sale-42").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(&"k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_quantity_bounds() {
        assert!(validate_quantity(MAX_ITEM_QUANTITY).is_ok());
        assert!(matches!(
            validate_quantity(MAX_ITEM_QUANTITY + 1),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_cashier() {
        assert!(validate_cashier("Ivanova A.").is_ok());
        assert!(validate_cashier("").is_err());
    }

    #[test]
    fn test_max_retries() {
        assert!(validate_max_retries(1).is_ok());
        assert!(validate_max_retries(0).is_err());
        assert!(validate_max_retries(MAX_RETRIES_LIMIT + 1).is_err());
    }

    #[test]
    fn test_amount_bounds() {
        assert!(validate_amount("payment.cash", Money::zero()).is_ok());
        assert!(validate_amount("payment.cash", Money::from_minor(MAX_AMOUNT_MINOR)).is_ok());
        assert!(matches!(
            validate_amount("payment.cash", Money::from_minor(MAX_AMOUNT_MINOR + 1)),
            Err(ValidationError::OutOfRange { max: MAX_AMOUNT_MINOR, .. })
        ));
        assert!(matches!(
            validate_amount("payment.cash", Money::from_minor(-5)),
            Err(ValidationError::MustNotBeNegative { .. })
        ));
    }
}

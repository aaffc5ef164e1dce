//! Input validation helpers.
//!
//! Everything here runs before a ledger touches its state, so a rejected
//! input never leaves a partial mutation behind.

use crate::error::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// AMOUNT VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate that an amount is non-zero
pub fn validate_non_zero(amount: u64, field: &str) -> Result<()> {
    if amount == 0 {
        return Err(Error::zero_amount(field));
    }
    Ok(())
}

/// Validate that an amount is non-zero and at least `minimum`
pub fn validate_minimum(amount: u64, minimum: u64, field: &str) -> Result<()> {
    validate_non_zero(amount, field)?;

    if amount < minimum {
        return Err(Error::BelowMinimum {
            field: field.into(),
            amount,
            minimum,
        });
    }

    Ok(())
}

/// Validate a withdrawal against what is available
pub fn validate_withdrawal(requested: u64, available: u64) -> Result<()> {
    if requested > available {
        return Err(Error::InsufficientBalance {
            requested,
            available,
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// RATIO VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate collateral ratio
pub fn validate_collateral_ratio(ratio: u64, minimum: u64) -> Result<()> {
    if ratio < minimum {
        return Err(Error::CollateralRatioTooLow {
            current: ratio,
            minimum,
        });
    }
    Ok(())
}

/// Validate that a caller-supplied price is usable
pub fn validate_price(price: u64) -> Result<()> {
    if price == 0 {
        return Err(Error::InvalidParameter {
            name: "price".into(),
            reason: "price cannot be zero".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_non_zero() {
        assert!(validate_non_zero(1, "deposit").is_ok());
        assert!(matches!(
            validate_non_zero(0, "deposit"),
            Err(Error::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_validate_minimum() {
        assert!(validate_minimum(10, 10, "debt").is_ok());
        assert!(matches!(
            validate_minimum(9, 10, "debt"),
            Err(Error::BelowMinimum { amount: 9, minimum: 10, .. })
        ));
        assert!(matches!(
            validate_minimum(0, 10, "debt"),
            Err(Error::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_validate_withdrawal() {
        assert!(validate_withdrawal(5, 5).is_ok());
        assert_eq!(
            validate_withdrawal(6, 5),
            Err(Error::InsufficientBalance { requested: 6, available: 5 })
        );
    }

    #[test]
    fn test_validate_ratio_and_price() {
        assert!(validate_collateral_ratio(150, 110).is_ok());
        assert!(validate_collateral_ratio(100, 110).is_err());
        assert!(validate_price(1).is_ok());
        assert!(validate_price(0).is_err());
    }
}

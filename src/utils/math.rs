//! Fixed-point arithmetic and mathematical utilities.
//!
//! Every division in the ledgers floors. Products that can exceed 128 bits
//! go through [`U256`]; nothing here touches floating point.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::{Add, Mul, Sub};

use crate::error::{Error, Result};
use crate::utils::constants::{COLLATERAL_BASE_UNIT, DECIMAL_PRECISION, RATIO_PRECISION};

// ═══════════════════════════════════════════════════════════════════════════════
// 256-BIT INTEGER
// ═══════════════════════════════════════════════════════════════════════════════

#[allow(missing_docs)]
mod wide {
    uint::construct_uint! {
        /// 256-bit unsigned integer, four little-endian 64-bit words
        pub struct U256(4);
    }
}

pub use wide::U256;

impl U256 {
    /// Narrow to u128, failing instead of truncating
    pub fn to_u128_checked(&self, operation: &str) -> Result<u128> {
        if self.bits() > 128 {
            return Err(Error::Overflow {
                operation: operation.into(),
            });
        }
        Ok(self.low_u128())
    }

    /// Narrow to u64, failing instead of truncating
    pub fn to_u64_checked(&self, operation: &str) -> Result<u64> {
        if self.bits() > 64 {
            return Err(Error::Overflow {
                operation: operation.into(),
            });
        }
        Ok(self.low_u64())
    }
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let words = <[u64; 4]>::deserialize(deserializer)?;
        Ok(U256(words))
    }
}

/// Checked `a * b / c` over 256 bits, floored
pub fn mul_div_u256(a: U256, b: U256, c: U256, operation: &str) -> Result<U256> {
    if c.is_zero() {
        return Err(Error::InvalidParameter {
            name: "divisor".into(),
            reason: format!("division by zero in {}", operation),
        });
    }
    let product = a.checked_mul(b).ok_or_else(|| Error::Overflow {
        operation: operation.into(),
    })?;
    Ok(product / c)
}

/// Checked `a * b / c` with a 256-bit intermediate, floored, narrowed to u128
pub fn mul_div_u128(a: u128, b: u128, c: u128, operation: &str) -> Result<u128> {
    mul_div_u256(U256::from(a), U256::from(b), U256::from(c), operation)?
        .to_u128_checked(operation)
}

// ═══════════════════════════════════════════════════════════════════════════════
// FIXED POINT TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed-point number with 18 decimal places precision
///
/// Used for the pool product `P`, per-unit losses and gains, and the
/// redistribution accumulators.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FixedPoint(u128);

impl FixedPoint {
    /// Scale factor: 10^18
    pub const SCALE: u128 = DECIMAL_PRECISION;

    /// Zero value
    pub const ZERO: Self = Self(0);

    /// One (1.0)
    pub const ONE: Self = Self(Self::SCALE);

    /// Create a new FixedPoint from raw value
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Create from an integer (scales up)
    pub fn from_integer(value: u64) -> Self {
        Self((value as u128) * Self::SCALE)
    }

    /// `numerator / denominator` as a fraction, floored
    pub fn from_ratio(numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 {
            return Err(Error::InvalidParameter {
                name: "denominator".into(),
                reason: "division by zero".into(),
            });
        }
        Ok(Self((numerator as u128) * Self::SCALE / (denominator as u128)))
    }

    /// Get the raw underlying value
    pub fn raw(&self) -> u128 {
        self.0
    }

    /// Convert to u64, rounding down (truncating)
    pub fn to_u64_floor(&self) -> u64 {
        (self.0 / Self::SCALE) as u64
    }

    /// Check if value is zero
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition
    pub fn checked_add(self, other: Self) -> Result<Self> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or_else(|| Error::Overflow {
                operation: format!("fixed {} + {}", self.0, other.0),
            })
    }

    /// Checked subtraction
    pub fn checked_sub(self, other: Self) -> Result<Self> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or_else(|| Error::Underflow {
                operation: format!("fixed {} - {}", self.0, other.0),
            })
    }

    /// Checked fixed-point product, floored
    pub fn checked_mul(self, other: Self) -> Result<Self> {
        mul_div_u128(self.0, other.0, Self::SCALE, "fixed mul").map(Self)
    }

    /// Checked fixed-point quotient, floored
    pub fn checked_div(self, other: Self) -> Result<Self> {
        mul_div_u128(self.0, Self::SCALE, other.0, "fixed div").map(Self)
    }

    /// Multiply the raw value by a plain integer factor
    pub fn checked_scale_up(self, factor: u128) -> Result<Self> {
        self.0
            .checked_mul(factor)
            .map(Self)
            .ok_or_else(|| Error::Overflow {
                operation: format!("fixed {} * {}", self.0, factor),
            })
    }

    /// `amount * self`, floored to whole base units
    pub fn mul_amount_floor(self, amount: u64) -> Result<u64> {
        mul_div_u256(
            U256::from(amount),
            U256::from(self.0),
            U256::from(Self::SCALE),
            "fixed mul amount",
        )?
        .to_u64_checked("fixed mul amount")
    }

    /// Saturating subtraction
    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl std::fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:018}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

impl Add for FixedPoint {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for FixedPoint {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Mul for FixedPoint {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        Self((self.0 * rhs.0) / Self::SCALE)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SAFE ARITHMETIC OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Safe addition with overflow check
pub fn safe_add(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b).ok_or(Error::Overflow {
        operation: format!("{} + {}", a, b),
    })
}

/// Safe subtraction with underflow check
pub fn safe_sub(a: u64, b: u64) -> Result<u64> {
    a.checked_sub(b).ok_or(Error::Underflow {
        operation: format!("{} - {}", a, b),
    })
}

/// Safe multiplication then division, floored
/// Computes (a * b) / c with u128 intermediate to prevent overflow
pub fn safe_mul_div(a: u64, b: u64, c: u64) -> Result<u64> {
    if c == 0 {
        return Err(Error::InvalidParameter {
            name: "divisor".into(),
            reason: "division by zero".into(),
        });
    }
    let result = (a as u128) * (b as u128) / (c as u128);
    if result > u64::MAX as u128 {
        return Err(Error::Overflow {
            operation: format!("({} * {}) / {}", a, b, c),
        });
    }
    Ok(result as u64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION CALCULATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Calculate collateral ratio as a percentage
///
/// # Arguments
/// * `collateral` - Collateral in base units
/// * `price` - Stable base units per whole collateral token
/// * `debt` - Debt in stable base units
///
/// # Returns
/// Collateral ratio as percentage (e.g., 150 = 150%), `u64::MAX` with no debt
pub fn calculate_collateral_ratio(collateral: u64, price: u64, debt: u64) -> Result<u64> {
    if debt == 0 {
        return Ok(u64::MAX);
    }

    let numerator = (collateral as u128) * (price as u128) * (RATIO_PRECISION as u128);
    let denominator = (COLLATERAL_BASE_UNIT as u128) * (debt as u128);

    let ratio = numerator / denominator;

    if ratio > u64::MAX as u128 {
        return Ok(u64::MAX);
    }

    Ok(ratio as u64)
}

/// Collateral value in stable base units
pub fn calculate_collateral_value(collateral: u64, price: u64) -> Result<u64> {
    safe_mul_div(collateral, price, COLLATERAL_BASE_UNIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::constants::STABLE_BASE_UNIT;

    #[test]
    fn test_fixed_point_basic() {
        let a = FixedPoint::from_integer(10);
        let b = FixedPoint::from_integer(5);

        assert_eq!((a + b).to_u64_floor(), 15);
        assert_eq!((a - b).to_u64_floor(), 5);
        assert_eq!((a * b).to_u64_floor(), 50);
        assert_eq!(a.checked_div(b).unwrap().to_u64_floor(), 2);
    }

    #[test]
    fn test_fixed_point_floors() {
        let third = FixedPoint::from_ratio(1, 3).unwrap();
        assert_eq!(third.raw(), 333_333_333_333_333_333);
        // 3 * floor(1/3) falls one unit short of ONE
        assert_eq!(third.mul_amount_floor(3).unwrap(), 0);
        assert_eq!(FixedPoint::ONE.checked_sub(third * FixedPoint::from_integer(3)).unwrap().raw(), 1);
    }

    #[test]
    fn test_fixed_point_checked_errors() {
        assert!(matches!(
            FixedPoint::ZERO.checked_sub(FixedPoint::ONE),
            Err(Error::Underflow { .. })
        ));
        assert!(matches!(
            FixedPoint::from_raw(u128::MAX).checked_add(FixedPoint::ONE),
            Err(Error::Overflow { .. })
        ));
        assert!(FixedPoint::from_ratio(1, 0).is_err());
    }

    #[test]
    fn test_fixed_point_display() {
        assert_eq!(FixedPoint::ONE.to_string(), "1.000000000000000000");
        assert_eq!(FixedPoint::from_raw(5).to_string(), "0.000000000000000005");
    }

    #[test]
    fn test_mul_div_wide() {
        // 1e30 * 1e30 / 1e30 overflows u128 in the middle but not at the end
        let big = 10u128.pow(30);
        assert_eq!(mul_div_u128(big, big, big, "test").unwrap(), big);
        assert!(mul_div_u128(u128::MAX, 2, 1, "test").is_err());
        assert!(mul_div_u128(1, 1, 0, "test").is_err());
    }

    #[test]
    fn test_u256_narrowing() {
        let x = U256::from(u64::MAX) + U256::one();
        assert!(x.to_u64_checked("test").is_err());
        assert_eq!(x.to_u128_checked("test").unwrap(), u64::MAX as u128 + 1);
    }

    #[test]
    fn test_u256_serde() {
        let x = U256::from(u128::MAX) * U256::from(7u64);
        let bytes = bincode::serialize(&x).unwrap();
        let back: U256 = bincode::deserialize(&bytes).unwrap();
        assert_eq!(x, back);
    }

    #[test]
    fn test_safe_operations() {
        assert_eq!(safe_add(5, 3).unwrap(), 8);
        assert!(safe_add(u64::MAX, 1).is_err());

        assert_eq!(safe_sub(5, 3).unwrap(), 2);
        assert!(safe_sub(3, 5).is_err());

        assert_eq!(safe_mul_div(100, 3, 4).unwrap(), 75);
        assert!(safe_mul_div(1, 1, 0).is_err());
    }

    #[test]
    fn test_collateral_ratio() {
        // 1 collateral at 2,000 against 1,000 debt = 200%
        let price = 2_000 * STABLE_BASE_UNIT;
        let ratio =
            calculate_collateral_ratio(COLLATERAL_BASE_UNIT, price, 1_000 * STABLE_BASE_UNIT)
                .unwrap();
        assert_eq!(ratio, 200);
        assert_eq!(calculate_collateral_ratio(1, price, 0).unwrap(), u64::MAX);
    }

    #[test]
    fn test_collateral_value() {
        let price = 2_000 * STABLE_BASE_UNIT;
        let value = calculate_collateral_value(COLLATERAL_BASE_UNIT / 2, price).unwrap();
        assert_eq!(value, 1_000 * STABLE_BASE_UNIT);
    }
}

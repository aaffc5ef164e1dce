//! Strongly-typed amounts.
//!
//! Stable-token and collateral amounts are both plain base-unit integers,
//! wrapped so the two can never be mixed up in ledger arithmetic.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::utils::constants::*;

macro_rules! amount_type {
    ($(#[$meta:meta])* $name:ident, $decimals:expr, $base:expr, $symbol:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Zero amount
            pub const ZERO: Self = Self(0);

            /// Create from base units
            pub const fn from_units(units: u64) -> Self {
                Self(units)
            }

            /// Create from whole tokens
            pub fn from_whole(whole: u64) -> Self {
                Self(whole.saturating_mul($base))
            }

            /// Raw base units
            pub fn units(&self) -> u64 {
                self.0
            }

            /// Check if zero
            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }

            /// Saturating addition
            pub fn saturating_add(self, other: Self) -> Self {
                Self(self.0.saturating_add(other.0))
            }

            /// Saturating subtraction
            pub fn saturating_sub(self, other: Self) -> Self {
                Self(self.0.saturating_sub(other.0))
            }

            /// Checked addition
            pub fn checked_add(self, other: Self) -> Option<Self> {
                self.0.checked_add(other.0).map(Self)
            }

            /// Checked subtraction
            pub fn checked_sub(self, other: Self) -> Option<Self> {
                self.0.checked_sub(other.0).map(Self)
            }

            /// Addition that reports overflow as a ledger error
            pub fn try_add(self, other: Self) -> Result<Self> {
                self.checked_add(other).ok_or_else(|| Error::Overflow {
                    operation: format!("{} {} + {}", $symbol, self.0, other.0),
                })
            }

            /// Subtraction that reports underflow as a ledger error
            pub fn try_sub(self, other: Self) -> Result<Self> {
                self.checked_sub(other).ok_or_else(|| Error::Underflow {
                    operation: format!("{} {} - {}", $symbol, self.0, other.0),
                })
            }

            /// Exact decimal value in whole tokens
            pub fn to_decimal(&self) -> Decimal {
                Decimal::from_i128_with_scale(self.0 as i128, $decimals)
            }

            /// Parse a human amount such as `"6666.67"` into base units
            ///
            /// Rejects negative values and more fractional digits than the
            /// token carries.
            pub fn parse(input: &str) -> Result<Self> {
                let invalid = |reason: String| Error::InvalidAmount {
                    field: $symbol.into(),
                    reason,
                };
                let value = Decimal::from_str(input.trim())
                    .map_err(|e| invalid(format!("'{}': {}", input, e)))?;
                if value.is_sign_negative() {
                    return Err(invalid(format!("'{}' is negative", input)));
                }
                if value.scale() > $decimals {
                    return Err(invalid(format!(
                        "'{}' has more than {} decimals",
                        input, $decimals
                    )));
                }
                value
                    .checked_mul(Decimal::from($base))
                    .and_then(|units| units.to_u64())
                    .map(Self)
                    .ok_or_else(|| invalid(format!("'{}' is out of range", input)))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{} {}", self.to_decimal(), $symbol)
            }
        }

        impl From<u64> for $name {
            fn from(units: u64) -> Self {
                Self(units)
            }
        }

        impl From<$name> for u64 {
            fn from(amount: $name) -> Self {
                amount.0
            }
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN AMOUNT
// ═══════════════════════════════════════════════════════════════════════════════

amount_type!(
    /// Stable-token amount in base units (6 decimals)
    TokenAmount,
    STABLE_DECIMALS,
    STABLE_BASE_UNIT,
    "STABLE"
);

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERAL AMOUNT
// ═══════════════════════════════════════════════════════════════════════════════

amount_type!(
    /// Collateral amount in base units (8 decimals)
    CollateralAmount,
    COLLATERAL_DECIMALS,
    COLLATERAL_BASE_UNIT,
    "COLL"
);

// ═══════════════════════════════════════════════════════════════════════════════
// REWARD AMOUNT
// ═══════════════════════════════════════════════════════════════════════════════

amount_type!(
    /// Secondary reward-token amount in base units (6 decimals)
    RewardAmount,
    REWARD_DECIMALS,
    REWARD_BASE_UNIT,
    "REWARD"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_amount_units() {
        let amount = TokenAmount::from_whole(10_000);
        assert_eq!(amount.units(), 10_000 * STABLE_BASE_UNIT);
        assert_eq!(amount.to_string(), "10000.000000 STABLE");
    }

    #[test]
    fn test_collateral_amount_units() {
        let amount = CollateralAmount::from_whole(2);
        assert_eq!(amount.units(), 200_000_000);
        assert_eq!(CollateralAmount::from_units(1).to_string(), "0.00000001 COLL");
    }

    #[test]
    fn test_parse_amounts() {
        assert_eq!(
            TokenAmount::parse("6666.67").unwrap(),
            TokenAmount::from_units(6_666_670_000)
        );
        assert_eq!(
            CollateralAmount::parse("0.5").unwrap(),
            CollateralAmount::from_units(50_000_000)
        );
        assert!(TokenAmount::parse("-1").is_err());
        assert!(TokenAmount::parse("1.0000001").is_err());
        assert!(TokenAmount::parse("ten").is_err());
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = TokenAmount::from_units(5);
        let b = TokenAmount::from_units(7);
        assert_eq!(a.try_add(b).unwrap().units(), 12);
        assert!(matches!(a.try_sub(b), Err(Error::Underflow { .. })));
        assert_eq!(a.saturating_sub(b), TokenAmount::ZERO);
        assert!(TokenAmount::from_units(u64::MAX).try_add(a).is_err());
    }
}

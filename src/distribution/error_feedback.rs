//! Per-unit division with carried rounding error.
//!
//! Dividing an event amount by the total stake floors, and the dropped
//! remainder is fed into the numerator of the next event. Over many
//! events the accumulated per-unit value then tracks the exact total to
//! within one unit of the last division.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::constants::DECIMAL_PRECISION;
use crate::utils::math::FixedPoint;

/// Result of splitting an amount across a total stake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerUnitShare {
    /// Amount per unit of stake, 18 decimals
    pub per_unit: FixedPoint,
    /// Carry to store once the event is committed
    pub carry: ErrorFeedback,
}

/// Rounding remainder carried between distribution events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFeedback {
    remainder: u128,
}

impl ErrorFeedback {
    /// Remainder currently carried
    pub fn remainder(&self) -> u128 {
        self.remainder
    }

    fn scaled(amount: u64) -> u128 {
        // u64 * 1e18 stays below u128::MAX / 10
        (amount as u128) * DECIMAL_PRECISION
    }

    fn require_stake(total: u64) -> Result<()> {
        if total == 0 {
            return Err(Error::InvariantViolation(
                "distribution over zero total stake".into(),
            ));
        }
        Ok(())
    }

    /// Floor share of a gain: `(amount * 1e18 + remainder) / total`
    ///
    /// Never distributes more than exists; the dust moves forward.
    pub fn share_floor(&self, amount: u64, total: u64) -> Result<PerUnitShare> {
        Self::require_stake(total)?;
        let numerator = Self::scaled(amount)
            .checked_add(self.remainder)
            .ok_or_else(|| Error::Overflow {
                operation: "share_floor numerator".into(),
            })?;
        let per_unit = numerator / (total as u128);
        let remainder = numerator - per_unit * (total as u128);

        Ok(PerUnitShare {
            per_unit: FixedPoint::from_raw(per_unit),
            carry: ErrorFeedback { remainder },
        })
    }

    /// Ceiling share of a loss: `(amount * 1e18 - remainder) / total + 1`
    ///
    /// Rounds the loss up so holders are never left with value that does
    /// not exist; the over-charge is credited back on the next loss.
    pub fn share_ceil(&self, amount: u64, total: u64) -> Result<PerUnitShare> {
        Self::require_stake(total)?;
        let numerator = Self::scaled(amount).saturating_sub(self.remainder);
        let per_unit = numerator / (total as u128) + 1;
        let remainder = per_unit * (total as u128) - numerator;

        Ok(PerUnitShare {
            per_unit: FixedPoint::from_raw(per_unit),
            carry: ErrorFeedback { remainder },
        })
    }
}

//! Protocol parameters.
//!
//! The ledgers themselves have no tunables beyond their fixed-point
//! constants; these parameters govern the thin lifecycle and liquidation
//! layers wrapped around them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::constants::*;

// ═══════════════════════════════════════════════════════════════════════════════
// PROTOCOL PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters fixed when the protocol state is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Minimum collateral ratio (MCR), percent
    /// Below this, positions can be liquidated
    pub min_collateral_ratio: u64,

    /// Minimum debt of an open position, stable base units
    pub min_debt: u64,

    /// Minimum stability pool deposit, stable base units
    pub min_pool_deposit: u64,

    /// Maximum positions processed per liquidation batch
    pub max_batch_size: usize,

    /// Liquidation events kept in memory
    pub max_retained_events: usize,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            min_collateral_ratio: MIN_COLLATERAL_RATIO,
            min_debt: MIN_DEBT,
            min_pool_deposit: MIN_POOL_DEPOSIT,
            max_batch_size: MAX_LIQUIDATIONS_PER_BATCH,
            max_retained_events: MAX_RETAINED_EVENTS,
        }
    }
}

impl ProtocolParams {
    /// Validate parameter consistency
    pub fn validate(&self) -> Result<()> {
        if self.min_collateral_ratio <= RATIO_PRECISION {
            return Err(Error::InvalidParameter {
                name: "min_collateral_ratio".into(),
                reason: format!(
                    "{}% must be above {}%",
                    self.min_collateral_ratio, RATIO_PRECISION
                ),
            });
        }
        if self.min_pool_deposit == 0 {
            return Err(Error::InvalidParameter {
                name: "min_pool_deposit".into(),
                reason: "must be at least one base unit".into(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidParameter {
                name: "max_batch_size".into(),
                reason: "cannot be zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_params_default() {
        let params = ProtocolParams::default();
        assert_eq!(params.min_collateral_ratio, 110);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = ProtocolParams {
            min_collateral_ratio: 100,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(Error::InvalidParameter { .. })
        ));

        let params = ProtocolParams {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_params_json_roundtrip() {
        let params = ProtocolParams::default();
        let json = serde_json::to_string(&params).unwrap();
        let back: ProtocolParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }
}

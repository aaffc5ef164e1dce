//! Ledger operations as data.
//!
//! Every public transition of [`Protocol`](super::Protocol) has a matching
//! [`LedgerOperation`], so a sequence of operations can be stored,
//! replayed and diffed. Each operation executes atomically.

use serde::{Deserialize, Serialize};

use crate::core::amount::{CollateralAmount, RewardAmount, TokenAmount};
use crate::core::position::PositionUpdate;
use crate::liquidation::engine::LiquidationEvent;
use crate::liquidation::stability_pool::DepositorPayout;
use crate::utils::hash::{AccountId, PositionId};

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// A single ledger transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOperation {
    /// Move to a block height
    AdvanceBlock {
        /// New height, never lower than the current one
        height: u64,
    },
    /// Set the collateral price used by ratio checks
    SetPrice {
        /// Stable base units per whole collateral token
        price: u64,
    },
    /// Deposit into the Stability Pool
    Deposit {
        /// Depositor
        depositor: AccountId,
        /// Amount to add
        amount: TokenAmount,
    },
    /// Withdraw from the Stability Pool
    Withdraw {
        /// Depositor
        depositor: AccountId,
        /// Amount to remove
        amount: TokenAmount,
    },
    /// Withdraw the whole compounded deposit
    WithdrawAll {
        /// Depositor
        depositor: AccountId,
    },
    /// Claim pool gains without moving principal
    ClaimGains {
        /// Depositor
        depositor: AccountId,
    },
    /// Spread reward tokens over depositors
    IssueReward {
        /// Amount to distribute
        amount: RewardAmount,
    },
    /// Open a position
    OpenPosition {
        /// Owner
        owner: AccountId,
        /// Initial collateral
        collateral: CollateralAmount,
        /// Initial debt
        debt: TokenAmount,
    },
    /// Add collateral to a position
    AddCollateral {
        /// Position
        position: PositionId,
        /// Amount
        amount: CollateralAmount,
    },
    /// Withdraw collateral from a position
    WithdrawCollateral {
        /// Position
        position: PositionId,
        /// Amount
        amount: CollateralAmount,
    },
    /// Draw more debt
    Borrow {
        /// Position
        position: PositionId,
        /// Amount
        amount: TokenAmount,
    },
    /// Repay debt
    Repay {
        /// Position
        position: PositionId,
        /// Amount
        amount: TokenAmount,
    },
    /// Close a position
    ClosePosition {
        /// Position
        position: PositionId,
    },
    /// Liquidate one position
    Liquidate {
        /// Position
        position: PositionId,
    },
    /// Liquidate every position below the minimum ratio
    LiquidateAll,
}

impl LedgerOperation {
    /// Get the operation type name
    pub fn operation_type(&self) -> &'static str {
        match self {
            Self::AdvanceBlock { .. } => "AdvanceBlock",
            Self::SetPrice { .. } => "SetPrice",
            Self::Deposit { .. } => "Deposit",
            Self::Withdraw { .. } => "Withdraw",
            Self::WithdrawAll { .. } => "WithdrawAll",
            Self::ClaimGains { .. } => "ClaimGains",
            Self::IssueReward { .. } => "IssueReward",
            Self::OpenPosition { .. } => "OpenPosition",
            Self::AddCollateral { .. } => "AddCollateral",
            Self::WithdrawCollateral { .. } => "WithdrawCollateral",
            Self::Borrow { .. } => "Borrow",
            Self::Repay { .. } => "Repay",
            Self::ClosePosition { .. } => "ClosePosition",
            Self::Liquidate { .. } => "Liquidate",
            Self::LiquidateAll => "LiquidateAll",
        }
    }

    /// Whether the operation needs a price to be set first
    pub fn requires_price(&self) -> bool {
        matches!(
            self,
            Self::OpenPosition { .. }
                | Self::WithdrawCollateral { .. }
                | Self::Borrow { .. }
                | Self::Liquidate { .. }
                | Self::LiquidateAll
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOMES
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of an executed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// Block height or price updated
    Updated,
    /// Depositor balances settled
    Payout(DepositorPayout),
    /// Reward distributed; zero when the pool was empty
    RewardIssued(RewardAmount),
    /// Position opened
    Opened(PositionId),
    /// Position adjusted
    Adjusted(PositionUpdate),
    /// Position closed
    Closed {
        /// Collateral released
        collateral: CollateralAmount,
        /// Debt settled
        debt: TokenAmount,
    },
    /// Positions liquidated
    Liquidated(Vec<LiquidationEvent>),
}

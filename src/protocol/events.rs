//! Ledger events for state change notifications.
//!
//! Every successful state change appends one or more events, so a client
//! can follow deposits, liquidations and pool resets without diffing
//! snapshots. Failed operations emit nothing.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::core::amount::{CollateralAmount, RewardAmount, TokenAmount};
use crate::liquidation::engine::LiquidationEvent;
use crate::liquidation::redistribution::PendingRewards;
use crate::liquidation::stability_pool::{DepositorPayout, PoolTransition};
use crate::utils::hash::{merkle_root, AccountId, Hash, PositionId};
use crate::utils::math::FixedPoint;

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// All ledger event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    // Stability Pool Events
    /// Deposit to the pool
    PoolDeposit(PoolDepositEvent),
    /// Withdrawal from the pool
    PoolWithdraw(PoolWithdrawEvent),
    /// Gains paid out without moving principal
    GainsClaimed(GainsClaimedEvent),
    /// Reward tokens spread over depositors
    RewardIssued(RewardIssuedEvent),
    /// Debt cancelled against pool deposits
    Offset(OffsetEvent),
    /// Pool emptied and a new epoch started
    EpochAdvanced(EpochAdvancedEvent),
    /// Product factor rescaled
    ScaleAdvanced(ScaleAdvancedEvent),
    /// Unabsorbed debt and collateral spread over positions
    Redistribution(RedistributionEvent),

    // Position Events
    /// Position was opened
    PositionOpened(PositionOpenedEvent),
    /// Position collateral or debt changed
    PositionAdjusted(PositionAdjustedEvent),
    /// Position was closed by its owner
    PositionClosed(PositionClosedEvent),
    /// Position was liquidated
    PositionLiquidated(LiquidationEvent),
}

impl LedgerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PoolDeposit(_) => "PoolDeposit",
            Self::PoolWithdraw(_) => "PoolWithdraw",
            Self::GainsClaimed(_) => "GainsClaimed",
            Self::RewardIssued(_) => "RewardIssued",
            Self::Offset(_) => "Offset",
            Self::EpochAdvanced(_) => "EpochAdvanced",
            Self::ScaleAdvanced(_) => "ScaleAdvanced",
            Self::Redistribution(_) => "Redistribution",
            Self::PositionOpened(_) => "PositionOpened",
            Self::PositionAdjusted(_) => "PositionAdjusted",
            Self::PositionClosed(_) => "PositionClosed",
            Self::PositionLiquidated(_) => "PositionLiquidated",
        }
    }

    /// Get the block height
    pub fn block_height(&self) -> u64 {
        match self {
            Self::PoolDeposit(e) => e.block_height,
            Self::PoolWithdraw(e) => e.block_height,
            Self::GainsClaimed(e) => e.block_height,
            Self::RewardIssued(e) => e.block_height,
            Self::Offset(e) => e.block_height,
            Self::EpochAdvanced(e) => e.block_height,
            Self::ScaleAdvanced(e) => e.block_height,
            Self::Redistribution(e) => e.block_height,
            Self::PositionOpened(e) => e.block_height,
            Self::PositionAdjusted(e) => e.block_height,
            Self::PositionClosed(e) => e.block_height,
            Self::PositionLiquidated(e) => e.block_height,
        }
    }

    /// Compute event hash
    ///
    /// Every field serializes infallibly with bincode; should that ever
    /// fail the debug representation is hashed instead.
    pub fn hash(&self) -> Hash {
        match bincode::serialize(self) {
            Ok(data) => Hash::sha256(&data),
            Err(_) => Hash::sha256(format!("{:?}", self).as_bytes()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Event emitted on a pool deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDepositEvent {
    /// Depositor
    pub depositor: AccountId,
    /// Amount added
    pub amount: TokenAmount,
    /// Balances and gains settled by the deposit
    pub payout: DepositorPayout,
    /// Pool total after the deposit
    pub total_deposits: TokenAmount,
    /// Block height
    pub block_height: u64,
}

/// Event emitted on a pool withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolWithdrawEvent {
    /// Depositor
    pub depositor: AccountId,
    /// Balances and gains settled by the withdrawal
    pub payout: DepositorPayout,
    /// Pool total after the withdrawal
    pub total_deposits: TokenAmount,
    /// Block height
    pub block_height: u64,
}

/// Event emitted when gains are claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GainsClaimedEvent {
    /// Depositor
    pub depositor: AccountId,
    /// Collateral paid
    pub collateral: CollateralAmount,
    /// Reward tokens paid
    pub reward: RewardAmount,
    /// Block height
    pub block_height: u64,
}

/// Event emitted when reward tokens are issued to the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardIssuedEvent {
    /// Amount distributed
    pub amount: RewardAmount,
    /// Deposits it was spread over
    pub total_deposits: TokenAmount,
    /// Block height
    pub block_height: u64,
}

/// Event emitted when debt is offset against the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetEvent {
    /// Debt cancelled
    pub debt: TokenAmount,
    /// Collateral handed to depositors
    pub collateral: CollateralAmount,
    /// Pool total after the offset
    pub total_deposits: TokenAmount,
    /// Block height
    pub block_height: u64,
}

/// Event emitted when an offset empties the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochAdvancedEvent {
    /// The new epoch
    pub epoch: u64,
    /// Block height
    pub block_height: u64,
}

/// Event emitted when an offset rescales the product factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleAdvancedEvent {
    /// The new scale
    pub scale: u64,
    /// Product factor after rescaling
    pub p: FixedPoint,
    /// Block height
    pub block_height: u64,
}

/// Event emitted when a remainder is redistributed over positions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributionEvent {
    /// Debt redistributed
    pub debt: TokenAmount,
    /// Collateral redistributed
    pub collateral: CollateralAmount,
    /// Collateral per unit stake after the event
    pub l_collateral: FixedPoint,
    /// Debt per unit stake after the event
    pub l_debt: FixedPoint,
    /// Block height
    pub block_height: u64,
}

impl LedgerEvent {
    /// Pool transition event for an offset outcome, if the pool moved
    pub fn for_transition(
        transition: PoolTransition,
        p: FixedPoint,
        block_height: u64,
    ) -> Option<Self> {
        match transition {
            PoolTransition::Unchanged => None,
            PoolTransition::EpochAdvanced(epoch) => {
                Some(Self::EpochAdvanced(EpochAdvancedEvent { epoch, block_height }))
            }
            PoolTransition::ScaleAdvanced(scale) => Some(Self::ScaleAdvanced(ScaleAdvancedEvent {
                scale,
                p,
                block_height,
            })),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Event emitted when a position is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    /// Position identifier
    pub position_id: PositionId,
    /// Owner
    pub owner: AccountId,
    /// Initial collateral
    pub collateral: CollateralAmount,
    /// Initial debt
    pub debt: TokenAmount,
    /// Stake assigned
    pub stake: u64,
    /// Block height
    pub block_height: u64,
}

/// Kind of position adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Adjustment {
    /// Collateral added
    AddCollateral(CollateralAmount),
    /// Collateral withdrawn
    WithdrawCollateral(CollateralAmount),
    /// Debt drawn
    Borrow(TokenAmount),
    /// Debt repaid
    Repay(TokenAmount),
}

/// Event emitted when a position's collateral or debt changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionAdjustedEvent {
    /// Position identifier
    pub position_id: PositionId,
    /// What changed
    pub adjustment: Adjustment,
    /// Redistribution rewards materialized first
    pub rewards_applied: PendingRewards,
    /// Collateral after the change
    pub collateral: CollateralAmount,
    /// Debt after the change
    pub debt: TokenAmount,
    /// Stake after the change
    pub stake: u64,
    /// Block height
    pub block_height: u64,
}

/// Event emitted when a position is closed by its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    /// Position identifier
    pub position_id: PositionId,
    /// Collateral released
    pub collateral: CollateralAmount,
    /// Debt settled
    pub debt: TokenAmount,
    /// Block height
    pub block_height: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT LOG
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded, ordered log of ledger events
///
/// Oldest events are dropped once `max_retained` is exceeded; the
/// sequence counter keeps counting so consumers can detect the gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    events: VecDeque<LedgerEvent>,
    max_retained: usize,
    total_recorded: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(crate::utils::constants::MAX_RETAINED_EVENTS)
    }
}

impl EventLog {
    /// Create an empty log keeping at most `max_retained` events
    pub fn new(max_retained: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_retained: max_retained.max(1),
            total_recorded: 0,
        }
    }

    /// Add an event to the log
    pub fn push(&mut self, event: LedgerEvent) {
        self.events.push_back(event);
        self.total_recorded += 1;
        while self.events.len() > self.max_retained {
            self.events.pop_front();
        }
    }

    /// Add several events in order
    pub fn extend(&mut self, events: impl IntoIterator<Item = LedgerEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Retained events, oldest first
    pub fn events(&self) -> impl Iterator<Item = &LedgerEvent> {
        self.events.iter()
    }

    /// The `n` most recent events, oldest first
    pub fn recent(&self, n: usize) -> Vec<&LedgerEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).collect()
    }

    /// Get events of a specific type
    pub fn filter_by_type(&self, event_type: &str) -> Vec<&LedgerEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    /// Events recorded at or after `block_height`
    pub fn since(&self, block_height: u64) -> Vec<&LedgerEvent> {
        self.events
            .iter()
            .filter(|e| e.block_height() >= block_height)
            .collect()
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events ever recorded, including dropped ones
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Clear retained events
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Compute merkle root of retained events
    pub fn merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.events.iter().map(LedgerEvent::hash).collect();
        merkle_root(&hashes)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

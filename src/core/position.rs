//! Position book.
//!
//! This module implements the position side of the protocol:
//! - Opening, adjusting and closing positions
//! - Collateral ratio checks against a caller-supplied price
//! - Driving the redistribution ledger in the required order: pending
//!   rewards applied before a position is read or written, stake updated
//!   after its collateral changes
//!
//! Every operation works on copies of the position and the ledger and
//! commits both only once it has fully succeeded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::amount::{CollateralAmount, TokenAmount};
use crate::core::config::ProtocolParams;
use crate::distribution::{checkpoint, Participant};
use crate::error::{Error, Result};
use crate::liquidation::redistribution::{
    EntireDebtAndCollateral, PendingRewards, RedistributionState, RewardSnapshot,
};
use crate::utils::math::*;
use crate::utils::validation::*;

pub use crate::utils::hash::{AccountId, Hash, PositionId};

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Open and carrying stake
    Active,
    /// Closed by its owner
    ClosedByOwner,
    /// Closed by liquidation
    Liquidated,
}

impl PositionStatus {
    /// Check if the position is closed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Active)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PositionStatus::Active => "active",
            PositionStatus::ClosedByOwner => "closed",
            PositionStatus::Liquidated => "liquidated",
        };
        f.write_str(label)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION
// ═══════════════════════════════════════════════════════════════════════════════

/// A collateralized debt position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier
    pub id: PositionId,
    /// Owner
    pub owner: AccountId,
    /// Raw collateral, excluding pending rewards
    pub collateral: CollateralAmount,
    /// Raw debt, excluding pending rewards
    pub debt: TokenAmount,
    /// Redistribution weight
    pub stake: u64,
    /// Accumulators at the last materialization
    pub snapshot: RewardSnapshot,
    /// Lifecycle state
    pub status: PositionStatus,
    /// Block height when opened
    pub created_at: u64,
    /// Block height of last modification
    pub updated_at: u64,
}

impl Position {
    /// Create an empty active position
    pub fn new(owner: AccountId, nonce: u64, block_height: u64) -> Self {
        Self {
            id: PositionId::generate(&owner, nonce),
            owner,
            collateral: CollateralAmount::ZERO,
            debt: TokenAmount::ZERO,
            stake: 0,
            snapshot: RewardSnapshot::default(),
            status: PositionStatus::Active,
            created_at: block_height,
            updated_at: block_height,
        }
    }

    /// Check if the position is open
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// Fail unless the position is open
    pub fn ensure_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::PositionNotActive(self.id.to_hex()));
        }
        Ok(())
    }

    /// Ratio of the raw amounts, percent
    pub fn raw_ratio(&self, price: u64) -> u64 {
        calculate_collateral_ratio(self.collateral.units(), price, self.debt.units())
            .unwrap_or(u64::MAX)
    }
}

impl Participant for Position {
    type Snapshot = RewardSnapshot;

    fn stake(&self) -> u64 {
        self.stake
    }

    fn snapshot(&self) -> &RewardSnapshot {
        &self.snapshot
    }

    fn set_snapshot(&mut self, snapshot: RewardSnapshot) {
        self.snapshot = snapshot;
    }
}

/// Result of a lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdate {
    /// Position touched
    pub id: PositionId,
    /// Rewards materialized before the change
    pub applied: PendingRewards,
    /// Collateral after the change
    pub collateral: CollateralAmount,
    /// Debt after the change
    pub debt: TokenAmount,
    /// Stake after the change
    pub stake: u64,
}

impl PositionUpdate {
    fn of(position: &Position, applied: PendingRewards) -> Self {
        Self {
            id: position.id,
            applied,
            collateral: position.collateral,
            debt: position.debt,
            stake: position.stake,
        }
    }
}

/// A liquidation's effect on the position book, ready to commit
#[derive(Debug, Clone)]
pub struct PositionLiquidation {
    position: Position,
    ledger: RedistributionState,
    /// Collateral removed from the position, pending rewards included
    pub collateral: CollateralAmount,
    /// Debt removed from the position, pending rewards included
    pub debt: TokenAmount,
    /// Debt spread over the remaining positions
    pub redistributed_debt: TokenAmount,
    /// Collateral spread over the remaining positions
    pub redistributed_collateral: CollateralAmount,
}

impl PositionLiquidation {
    /// Position being liquidated
    pub fn position_id(&self) -> PositionId {
        self.position.id
    }

    /// Owner of the position
    pub fn owner(&self) -> AccountId {
        self.position.owner
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Manager for all positions and the redistribution ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionManager {
    /// All positions indexed by id
    positions: HashMap<PositionId, Position>,
    /// Positions indexed by owner
    owner_positions: HashMap<AccountId, Vec<PositionId>>,
    /// Next nonce per owner
    nonces: HashMap<AccountId, u64>,
    /// Redistribution ledger
    ledger: RedistributionState,
    /// Minimum collateral ratio, percent
    min_collateral_ratio: u64,
    /// Minimum debt of an open position
    min_debt: u64,
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new(&ProtocolParams::default())
    }
}

impl PositionManager {
    /// Create an empty position book
    pub fn new(params: &ProtocolParams) -> Self {
        Self {
            positions: HashMap::new(),
            owner_positions: HashMap::new(),
            nonces: HashMap::new(),
            ledger: RedistributionState::new(),
            min_collateral_ratio: params.min_collateral_ratio,
            min_debt: params.min_debt,
        }
    }

    fn require(&self, id: &PositionId) -> Result<&Position> {
        self.positions
            .get(id)
            .ok_or_else(|| Error::PositionNotFound(id.to_hex()))
    }

    /// Run `f` on copies of the position and ledger, committing on success
    fn transact<T>(
        &mut self,
        id: &PositionId,
        f: impl FnOnce(&mut RedistributionState, &mut Position) -> Result<T>,
    ) -> Result<T> {
        let mut position = self.require(id)?.clone();
        let mut ledger = self.ledger.clone();

        let out = f(&mut ledger, &mut position)?;

        self.ledger = ledger;
        self.positions.insert(*id, position);
        Ok(out)
    }

    fn check_ratio(
        collateral: CollateralAmount,
        debt: TokenAmount,
        price: u64,
        min_ratio: u64,
    ) -> Result<()> {
        if debt.is_zero() {
            return Ok(());
        }
        let ratio = calculate_collateral_ratio(collateral.units(), price, debt.units())?;
        validate_collateral_ratio(ratio, min_ratio)
    }

    fn check_min_debt(debt: TokenAmount, min_debt: u64) -> Result<()> {
        if !debt.is_zero() && debt.units() < min_debt {
            return Err(Error::BelowMinimum {
                field: "debt".into(),
                amount: debt.units(),
                minimum: min_debt,
            });
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a position with initial collateral and debt
    pub fn open(
        &mut self,
        owner: AccountId,
        collateral: CollateralAmount,
        debt: TokenAmount,
        price: u64,
        block_height: u64,
    ) -> Result<PositionId> {
        validate_non_zero(collateral.units(), "collateral")?;
        validate_minimum(debt.units(), self.min_debt, "debt")?;
        validate_price(price)?;
        Self::check_ratio(collateral, debt, price, self.min_collateral_ratio)?;

        let nonce = self.nonces.get(&owner).copied().unwrap_or(0);
        let mut position = Position::new(owner, nonce, block_height);
        if self.positions.contains_key(&position.id) {
            return Err(Error::PositionAlreadyExists(position.id.to_hex()));
        }
        position.collateral = collateral;
        position.debt = debt;

        let mut ledger = self.ledger.clone();
        checkpoint(&ledger, &mut position);
        ledger.increase_active(collateral, debt)?;
        ledger.update_stake_and_totals(&mut position)?;

        let id = position.id;
        tracing::debug!(
            position = %id,
            owner = %owner,
            collateral = collateral.units(),
            debt = debt.units(),
            stake = position.stake,
            "position opened"
        );

        self.ledger = ledger;
        self.positions.insert(id, position);
        self.owner_positions.entry(owner).or_default().push(id);
        self.nonces.insert(owner, nonce + 1);
        Ok(id)
    }

    /// Add collateral to a position
    pub fn add_collateral(
        &mut self,
        id: &PositionId,
        amount: CollateralAmount,
        block_height: u64,
    ) -> Result<PositionUpdate> {
        validate_non_zero(amount.units(), "collateral")?;

        self.transact(id, |ledger, position| {
            let applied = ledger.apply_pending_rewards(position)?;
            position.collateral = position.collateral.try_add(amount)?;
            ledger.increase_active(amount, TokenAmount::ZERO)?;
            ledger.update_stake_and_totals(position)?;
            position.updated_at = block_height;
            Ok(PositionUpdate::of(position, applied))
        })
    }

    /// Withdraw collateral, keeping the position above the minimum ratio
    pub fn withdraw_collateral(
        &mut self,
        id: &PositionId,
        amount: CollateralAmount,
        price: u64,
        block_height: u64,
    ) -> Result<PositionUpdate> {
        validate_non_zero(amount.units(), "collateral")?;
        validate_price(price)?;
        let min_ratio = self.min_collateral_ratio;

        self.transact(id, |ledger, position| {
            let applied = ledger.apply_pending_rewards(position)?;
            validate_withdrawal(amount.units(), position.collateral.units())?;

            let collateral = position.collateral.try_sub(amount)?;
            Self::check_ratio(collateral, position.debt, price, min_ratio)?;

            position.collateral = collateral;
            ledger.decrease_active(amount, TokenAmount::ZERO)?;
            ledger.update_stake_and_totals(position)?;
            position.updated_at = block_height;
            Ok(PositionUpdate::of(position, applied))
        })
    }

    /// Draw more debt against a position
    pub fn borrow(
        &mut self,
        id: &PositionId,
        amount: TokenAmount,
        price: u64,
        block_height: u64,
    ) -> Result<PositionUpdate> {
        validate_non_zero(amount.units(), "debt")?;
        validate_price(price)?;
        let (min_ratio, min_debt) = (self.min_collateral_ratio, self.min_debt);

        self.transact(id, |ledger, position| {
            let applied = ledger.apply_pending_rewards(position)?;

            let debt = position.debt.try_add(amount)?;
            Self::check_min_debt(debt, min_debt)?;
            Self::check_ratio(position.collateral, debt, price, min_ratio)?;

            position.debt = debt;
            ledger.increase_active(CollateralAmount::ZERO, amount)?;
            position.updated_at = block_height;
            Ok(PositionUpdate::of(position, applied))
        })
    }

    /// Repay debt
    ///
    /// Whatever debt remains must be zero or at least the minimum.
    pub fn repay(
        &mut self,
        id: &PositionId,
        amount: TokenAmount,
        block_height: u64,
    ) -> Result<PositionUpdate> {
        validate_non_zero(amount.units(), "repayment")?;
        let min_debt = self.min_debt;

        self.transact(id, |ledger, position| {
            let applied = ledger.apply_pending_rewards(position)?;
            validate_withdrawal(amount.units(), position.debt.units())?;

            let debt = position.debt.try_sub(amount)?;
            Self::check_min_debt(debt, min_debt)?;

            position.debt = debt;
            ledger.decrease_active(CollateralAmount::ZERO, amount)?;
            position.updated_at = block_height;
            Ok(PositionUpdate::of(position, applied))
        })
    }

    /// Close a position
    ///
    /// Returns the collateral released and the debt the owner settles.
    pub fn close(
        &mut self,
        id: &PositionId,
        block_height: u64,
    ) -> Result<(CollateralAmount, TokenAmount)> {
        let closed = self.transact(id, |ledger, position| {
            ledger.apply_pending_rewards(position)?;
            let closed = ledger.close(position, PositionStatus::ClosedByOwner)?;
            position.updated_at = block_height;
            Ok(closed)
        })?;

        tracing::debug!(
            position = %id,
            collateral = closed.0.units(),
            debt = closed.1.units(),
            "position closed"
        );
        Ok(closed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Compute the removal of a position and the redistribution of its
    /// unabsorbed remainder, without mutating the book
    pub fn plan_liquidation(
        &self,
        id: &PositionId,
        redistributed_debt: TokenAmount,
        redistributed_collateral: CollateralAmount,
        block_height: u64,
    ) -> Result<PositionLiquidation> {
        let mut position = self.require(id)?.clone();
        let mut ledger = self.ledger.clone();

        ledger.apply_pending_rewards(&mut position)?;
        let (collateral, debt) = ledger.close(&mut position, PositionStatus::Liquidated)?;
        position.updated_at = block_height;

        if redistributed_debt > debt || redistributed_collateral > collateral {
            return Err(Error::InvariantViolation(format!(
                "redistributing {} / {} from a position holding {} / {}",
                redistributed_debt, redistributed_collateral, debt, collateral
            )));
        }

        let remainder = !redistributed_debt.is_zero() || !redistributed_collateral.is_zero();
        if remainder && ledger.total_stakes == 0 {
            return Err(Error::LastPosition(id.to_hex()));
        }

        let plan = ledger.plan_redistribution(redistributed_debt, redistributed_collateral)?;
        ledger.commit_redistribution(&plan)?;
        ledger.update_system_snapshots()?;

        Ok(PositionLiquidation {
            position,
            ledger,
            collateral,
            debt,
            redistributed_debt,
            redistributed_collateral,
        })
    }

    /// Commit a liquidation produced by [`plan_liquidation`](Self::plan_liquidation)
    pub fn commit_liquidation(&mut self, liquidation: PositionLiquidation) {
        self.ledger = liquidation.ledger;
        self.positions
            .insert(liquidation.position.id, liquidation.position);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Get a position by id
    pub fn get(&self, id: &PositionId) -> Option<&Position> {
        self.positions.get(id)
    }

    /// All positions of an owner
    pub fn get_by_owner(&self, owner: &AccountId) -> Vec<&Position> {
        self.owner_positions
            .get(owner)
            .map(|ids| ids.iter().filter_map(|id| self.positions.get(id)).collect())
            .unwrap_or_default()
    }

    /// All open positions
    pub fn active_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_active())
    }

    /// Raw amounts plus pending rewards
    pub fn entire_debt_and_collateral(&self, id: &PositionId) -> Result<EntireDebtAndCollateral> {
        let position = self.require(id)?;
        position.ensure_active()?;
        self.ledger.entire_debt_and_collateral(position)
    }

    /// Pending rewards of a position
    pub fn pending_rewards(&self, id: &PositionId) -> Result<PendingRewards> {
        self.ledger.pending_rewards(self.require(id)?)
    }

    /// Collateral ratio including pending rewards, percent
    pub fn current_ratio(&self, id: &PositionId, price: u64) -> Result<u64> {
        let entire = self.entire_debt_and_collateral(id)?;
        calculate_collateral_ratio(entire.collateral.units(), price, entire.debt.units())
    }

    /// Whether a position is open, indebted and below the minimum ratio
    pub fn is_liquidatable(&self, id: &PositionId, price: u64) -> Result<bool> {
        let entire = self.entire_debt_and_collateral(id)?;
        if entire.debt.is_zero() {
            return Ok(false);
        }
        let ratio =
            calculate_collateral_ratio(entire.collateral.units(), price, entire.debt.units())?;
        Ok(ratio < self.min_collateral_ratio)
    }

    /// Liquidatable positions, lowest ratio first
    pub fn get_liquidatable(&self, price: u64) -> Vec<(PositionId, u64)> {
        let mut found: Vec<_> = self
            .active_positions()
            .filter_map(|p| {
                let entire = self.ledger.entire_debt_and_collateral(p).ok()?;
                if entire.debt.is_zero() {
                    return None;
                }
                let ratio = calculate_collateral_ratio(
                    entire.collateral.units(),
                    price,
                    entire.debt.units(),
                )
                .ok()?;
                (ratio < self.min_collateral_ratio).then_some((p.id, ratio))
            })
            .collect();

        found.sort_by_key(|(id, ratio)| (*ratio, *id));
        found
    }

    /// Redistribution ledger
    pub fn ledger(&self) -> &RedistributionState {
        &self.ledger
    }

    /// Minimum collateral ratio, percent
    pub fn min_collateral_ratio(&self) -> u64 {
        self.min_collateral_ratio
    }

    /// Number of positions ever opened
    pub fn total_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of open positions
    pub fn active_count(&self) -> usize {
        self.active_positions().count()
    }

    /// Aggregate statistics
    pub fn statistics(&self, price: u64) -> PositionStats {
        let total_collateral = self.ledger.total_system_collateral();
        let total_debt = self.ledger.total_system_debt();
        let system_ratio = if total_debt.is_zero() {
            0
        } else {
            calculate_collateral_ratio(total_collateral.units(), price, total_debt.units())
                .unwrap_or(0)
        };

        PositionStats {
            total_positions: self.positions.len() as u64,
            active_positions: self.active_count() as u64,
            total_collateral,
            total_debt,
            pending_collateral: self.ledger.pending_collateral,
            pending_debt: self.ledger.pending_debt,
            total_stakes: self.ledger.total_stakes,
            system_ratio,
            liquidatable_positions: self.get_liquidatable(price).len() as u64,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Aggregate position statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionStats {
    /// Positions ever opened
    pub total_positions: u64,
    /// Open positions
    pub active_positions: u64,
    /// Active plus pending collateral
    pub total_collateral: CollateralAmount,
    /// Active plus pending debt
    pub total_debt: TokenAmount,
    /// Redistributed collateral not yet materialized
    pub pending_collateral: CollateralAmount,
    /// Redistributed debt not yet materialized
    pub pending_debt: TokenAmount,
    /// Sum of stakes
    pub total_stakes: u64,
    /// System-wide collateral ratio, percent; zero with no debt
    pub system_ratio: u64,
    /// Positions below the minimum ratio at the given price
    pub liquidatable_positions: u64,
}

//! Redistribution ledger.
//!
//! Debt and collateral the Stability Pool cannot absorb are spread over
//! every open position in proportion to its stake. Two per-unit-stake
//! accumulators (`L_collateral`, `L_debt`) move in O(1) per liquidation;
//! a position's share is `stake * (L - snapshot)`, materialized into its
//! raw fields whenever it is touched.
//!
//! Until materialized, redistributed amounts are held in the pending
//! pool. Stakes are normalized against the collateral snapshot taken
//! after the last liquidation so that positions opened later are not
//! over-weighted relative to positions still carrying pending rewards.

use serde::{Deserialize, Serialize};

use crate::core::amount::{CollateralAmount, TokenAmount};
use crate::core::position::{Position, PositionStatus};
use crate::distribution::{checkpoint, pending_for, Accumulator, ErrorFeedback, Participant};
use crate::error::{Error, Result};
use crate::utils::hash::Hash;
use crate::utils::math::*;

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Accumulator values a position last materialized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSnapshot {
    /// Collateral per unit stake
    pub collateral_per_stake: FixedPoint,
    /// Debt per unit stake
    pub debt_per_stake: FixedPoint,
}

/// Redistributed amounts a position has not yet materialized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRewards {
    /// Collateral
    pub collateral: CollateralAmount,
    /// Debt
    pub debt: TokenAmount,
}

impl PendingRewards {
    /// Check if nothing is pending
    pub fn is_zero(&self) -> bool {
        self.collateral.is_zero() && self.debt.is_zero()
    }
}

/// A position's raw amounts plus everything pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntireDebtAndCollateral {
    /// Raw debt plus pending debt
    pub debt: TokenAmount,
    /// Raw collateral plus pending collateral
    pub collateral: CollateralAmount,
    /// The pending part
    pub pending: PendingRewards,
}

/// A redistribution computed but not yet applied
#[derive(Debug, Clone)]
pub struct RedistributionPlan {
    debt: TokenAmount,
    collateral: CollateralAmount,
    l_collateral: FixedPoint,
    l_debt: FixedPoint,
    collateral_carry: ErrorFeedback,
    debt_carry: ErrorFeedback,
}

impl RedistributionPlan {
    /// Debt the plan spreads
    pub fn debt(&self) -> TokenAmount {
        self.debt
    }

    /// Collateral the plan spreads
    pub fn collateral(&self) -> CollateralAmount {
        self.collateral
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDISTRIBUTION STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Global state of the redistribution ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributionState {
    /// Sum of the stakes of all active positions
    pub total_stakes: u64,
    /// `total_stakes` after the last liquidation
    pub total_stakes_snapshot: u64,
    /// System collateral after the last liquidation
    pub total_collateral_snapshot: u64,
    /// Collateral redistributed per unit stake
    pub l_collateral: FixedPoint,
    /// Debt redistributed per unit stake
    pub l_debt: FixedPoint,
    /// Rounding carry of redistributed collateral
    pub collateral_carry: ErrorFeedback,
    /// Rounding carry of redistributed debt
    pub debt_carry: ErrorFeedback,
    /// Collateral recorded on active positions
    pub active_collateral: CollateralAmount,
    /// Debt recorded on active positions
    pub active_debt: TokenAmount,
    /// Redistributed collateral not yet materialized
    pub pending_collateral: CollateralAmount,
    /// Redistributed debt not yet materialized
    pub pending_debt: TokenAmount,
}

impl Accumulator for RedistributionState {
    type Snapshot = RewardSnapshot;
    type Pending = PendingRewards;

    fn current_snapshot(&self) -> RewardSnapshot {
        RewardSnapshot {
            collateral_per_stake: self.l_collateral,
            debt_per_stake: self.l_debt,
        }
    }

    fn pending(&self, stake: u64, snapshot: &RewardSnapshot) -> Result<PendingRewards> {
        if stake == 0 {
            return Ok(PendingRewards::default());
        }

        let behind = |current: FixedPoint, seen: FixedPoint| {
            current.checked_sub(seen).map_err(|_| {
                Error::InvariantViolation(format!(
                    "reward snapshot {} ahead of accumulator {}",
                    seen, current
                ))
            })
        };
        let collateral_delta = behind(self.l_collateral, snapshot.collateral_per_stake)?;
        let debt_delta = behind(self.l_debt, snapshot.debt_per_stake)?;

        Ok(PendingRewards {
            collateral: CollateralAmount::from_units(collateral_delta.mul_amount_floor(stake)?),
            debt: TokenAmount::from_units(debt_delta.mul_amount_floor(stake)?),
        })
    }
}

impl RedistributionState {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Stake for `collateral` at the current snapshot ratio
    ///
    /// Stake equals collateral until a snapshot with a non-zero stake
    /// exists. A snapshot taken with only pending dust left carries no ratio.
    pub fn compute_stake(&self, collateral: CollateralAmount) -> Result<u64> {
        if self.total_collateral_snapshot == 0 || self.total_stakes_snapshot == 0 {
            return Ok(collateral.units());
        }
        mul_div_u128(
            collateral.units() as u128,
            self.total_stakes_snapshot as u128,
            self.total_collateral_snapshot as u128,
            "stake",
        )
        .and_then(|stake| {
            u64::try_from(stake).map_err(|_| Error::Overflow {
                operation: "stake".into(),
            })
        })
    }

    /// Pending rewards of `position`, read fresh
    pub fn pending_rewards(&self, position: &Position) -> Result<PendingRewards> {
        pending_for(self, position)
    }

    /// Whether `position` has missed any redistribution since its snapshot
    pub fn has_pending_rewards(&self, position: &Position) -> bool {
        position.stake > 0 && position.snapshot != self.current_snapshot()
    }

    fn require_applied(&self, position: &Position) -> Result<()> {
        if self.has_pending_rewards(position) {
            return Err(Error::PendingRewardsNotApplied(position.id.to_hex()));
        }
        Ok(())
    }

    /// Raw amounts plus pending rewards; does not touch the position
    pub fn entire_debt_and_collateral(&self, position: &Position) -> Result<EntireDebtAndCollateral> {
        let pending = self.pending_rewards(position)?;
        Ok(EntireDebtAndCollateral {
            debt: position.debt.try_add(pending.debt)?,
            collateral: position.collateral.try_add(pending.collateral)?,
            pending,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // POSITION OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Materialize pending rewards into the position's raw fields
    ///
    /// Must run before any read or write of the position's collateral or
    /// debt. Moves the amounts from the pending pool to the active pool.
    pub fn apply_pending_rewards(&mut self, position: &mut Position) -> Result<PendingRewards> {
        position.ensure_active()?;

        let pending = self.pending_rewards(position)?;
        if pending.is_zero() {
            checkpoint(self, position);
            return Ok(pending);
        }

        let collateral = position.collateral.try_add(pending.collateral)?;
        let debt = position.debt.try_add(pending.debt)?;
        let pending_collateral = self
            .pending_collateral
            .try_sub(pending.collateral)
            .map_err(|_| {
                Error::InvariantViolation(format!(
                    "pending collateral {} exceeds pool {}",
                    pending.collateral, self.pending_collateral
                ))
            })?;
        let pending_debt = self.pending_debt.try_sub(pending.debt).map_err(|_| {
            Error::InvariantViolation(format!(
                "pending debt {} exceeds pool {}",
                pending.debt, self.pending_debt
            ))
        })?;
        let active_collateral = self.active_collateral.try_add(pending.collateral)?;
        let active_debt = self.active_debt.try_add(pending.debt)?;

        position.collateral = collateral;
        position.debt = debt;
        checkpoint(self, position);
        self.pending_collateral = pending_collateral;
        self.pending_debt = pending_debt;
        self.active_collateral = active_collateral;
        self.active_debt = active_debt;

        tracing::trace!(
            position = %position.id,
            collateral = pending.collateral.units(),
            debt = pending.debt.units(),
            "pending rewards applied"
        );
        Ok(pending)
    }

    /// Recompute the position's stake from its raw collateral
    ///
    /// Returns the new stake. Pending rewards must already be applied.
    pub fn update_stake_and_totals(&mut self, position: &mut Position) -> Result<u64> {
        position.ensure_active()?;
        self.require_applied(position)?;

        let new_stake = self.compute_stake(position.collateral)?;
        let total_stakes = self
            .total_stakes
            .checked_sub(position.stake)
            .and_then(|rest| rest.checked_add(new_stake))
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "stake {} inconsistent with total {}",
                    position.stake, self.total_stakes
                ))
            })?;

        position.stake = new_stake;
        self.total_stakes = total_stakes;
        Ok(new_stake)
    }

    /// Record raw amounts added to an active position
    pub fn increase_active(&mut self, collateral: CollateralAmount, debt: TokenAmount) -> Result<()> {
        let active_collateral = self.active_collateral.try_add(collateral)?;
        let active_debt = self.active_debt.try_add(debt)?;
        self.active_collateral = active_collateral;
        self.active_debt = active_debt;
        Ok(())
    }

    /// Record raw amounts removed from an active position
    pub fn decrease_active(&mut self, collateral: CollateralAmount, debt: TokenAmount) -> Result<()> {
        let active_collateral = self.active_collateral.try_sub(collateral).map_err(|_| {
            Error::InvariantViolation(format!(
                "removing {} from active collateral {}",
                collateral, self.active_collateral
            ))
        })?;
        let active_debt = self.active_debt.try_sub(debt).map_err(|_| {
            Error::InvariantViolation(format!(
                "removing {} from active debt {}",
                debt, self.active_debt
            ))
        })?;
        self.active_collateral = active_collateral;
        self.active_debt = active_debt;
        Ok(())
    }

    /// Remove a position from the active set
    ///
    /// Zeroes its stake and raw amounts and returns the collateral and
    /// debt it held. Pending rewards must already be applied.
    pub fn close(
        &mut self,
        position: &mut Position,
        status: PositionStatus,
    ) -> Result<(CollateralAmount, TokenAmount)> {
        position.ensure_active()?;
        if status == PositionStatus::Active {
            return Err(Error::InvalidParameter {
                name: "status".into(),
                reason: "a closed position cannot stay active".into(),
            });
        }
        self.require_applied(position)?;

        let total_stakes = self.total_stakes.checked_sub(position.stake).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "stake {} above total {}",
                position.stake, self.total_stakes
            ))
        })?;
        let removed = (position.collateral, position.debt);
        self.decrease_active(removed.0, removed.1)?;

        self.total_stakes = total_stakes;
        position.stake = 0;
        position.collateral = CollateralAmount::ZERO;
        position.debt = TokenAmount::ZERO;
        position.status = status;
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REDISTRIBUTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Compute a redistribution over the current stakes without applying it
    pub fn plan_redistribution(
        &self,
        debt: TokenAmount,
        collateral: CollateralAmount,
    ) -> Result<RedistributionPlan> {
        let unchanged = RedistributionPlan {
            debt,
            collateral,
            l_collateral: self.l_collateral,
            l_debt: self.l_debt,
            collateral_carry: self.collateral_carry,
            debt_carry: self.debt_carry,
        };
        if debt.is_zero() && collateral.is_zero() {
            return Ok(unchanged);
        }

        if self.total_stakes == 0 {
            tracing::error!(
                debt = debt.units(),
                collateral = collateral.units(),
                "redistribution with no stake"
            );
            return Err(Error::InvariantViolation(
                "redistribution over zero total stake".into(),
            ));
        }

        let collateral_share = self
            .collateral_carry
            .share_floor(collateral.units(), self.total_stakes)?;
        let debt_share = self.debt_carry.share_floor(debt.units(), self.total_stakes)?;

        Ok(RedistributionPlan {
            l_collateral: self.l_collateral.checked_add(collateral_share.per_unit)?,
            l_debt: self.l_debt.checked_add(debt_share.per_unit)?,
            collateral_carry: collateral_share.carry,
            debt_carry: debt_share.carry,
            ..unchanged
        })
    }

    /// Apply a plan from [`plan_redistribution`](Self::plan_redistribution)
    pub fn commit_redistribution(&mut self, plan: &RedistributionPlan) -> Result<()> {
        let pending_collateral = self.pending_collateral.try_add(plan.collateral)?;
        let pending_debt = self.pending_debt.try_add(plan.debt)?;

        self.l_collateral = plan.l_collateral;
        self.l_debt = plan.l_debt;
        self.collateral_carry = plan.collateral_carry;
        self.debt_carry = plan.debt_carry;
        self.pending_collateral = pending_collateral;
        self.pending_debt = pending_debt;
        Ok(())
    }

    /// Spread `debt` and `collateral` over all active stakes
    pub fn redistribute(&mut self, debt: TokenAmount, collateral: CollateralAmount) -> Result<()> {
        let plan = self.plan_redistribution(debt, collateral)?;
        self.commit_redistribution(&plan)?;

        tracing::debug!(
            debt = debt.units(),
            collateral = collateral.units(),
            total_stakes = self.total_stakes,
            l_debt = %self.l_debt,
            l_collateral = %self.l_collateral,
            "redistributed"
        );
        Ok(())
    }

    /// Capture the stake/collateral ratio used for new stakes
    ///
    /// Runs after every liquidation.
    pub fn update_system_snapshots(&mut self) -> Result<()> {
        let total_collateral = self.active_collateral.try_add(self.pending_collateral)?;
        self.total_stakes_snapshot = self.total_stakes;
        self.total_collateral_snapshot = total_collateral.units();

        tracing::trace!(
            total_stakes = self.total_stakes_snapshot,
            total_collateral = self.total_collateral_snapshot,
            "system snapshots updated"
        );
        Ok(())
    }

    /// Collateral held by the system, active plus pending
    ///
    /// Positions materialize floored shares of each redistribution, so the
    /// pending pool can keep a few base units no position will ever claim.
    /// That residue counts toward the collateral snapshot but never toward
    /// any stake.
    pub fn total_system_collateral(&self) -> CollateralAmount {
        self.active_collateral.saturating_add(self.pending_collateral)
    }

    /// Debt owed to the system, active plus pending
    pub fn total_system_debt(&self) -> TokenAmount {
        self.active_debt.saturating_add(self.pending_debt)
    }

    /// Hash of the ledger state
    pub fn state_hash(&self) -> Result<Hash> {
        let bytes = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Hash::sha256(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::constants::COLLATERAL_BASE_UNIT;
    use crate::utils::hash::AccountId;

    fn open(state: &mut RedistributionState, name: &str, coll_whole: u64, debt_whole: u64) -> Position {
        let mut position = Position::new(AccountId::from_name(name), 0, 1);
        position.collateral = CollateralAmount::from_whole(coll_whole);
        position.debt = TokenAmount::from_whole(debt_whole);
        checkpoint(state, &mut position);
        state.increase_active(position.collateral, position.debt).unwrap();
        state.update_stake_and_totals(&mut position).unwrap();
        position
    }

    #[test]
    fn test_initial_stake_equals_collateral() {
        let mut state = RedistributionState::new();
        let position = open(&mut state, "alice", 20, 1000);
        assert_eq!(position.stake, 20 * COLLATERAL_BASE_UNIT);
        assert_eq!(state.total_stakes, 20 * COLLATERAL_BASE_UNIT);
    }

    #[test]
    fn test_redistribute_proportional_to_stake() {
        let mut state = RedistributionState::new();
        let mut a = open(&mut state, "alice", 20, 1000);
        let mut b = open(&mut state, "bob", 10, 500);

        state
            .redistribute(TokenAmount::from_whole(300), CollateralAmount::from_whole(3))
            .unwrap();

        let pending_a = state.pending_rewards(&a).unwrap();
        let pending_b = state.pending_rewards(&b).unwrap();
        assert_eq!(pending_a.debt, TokenAmount::from_whole(200));
        assert_eq!(pending_a.collateral, CollateralAmount::from_whole(2));
        assert_eq!(pending_b.debt, TokenAmount::from_whole(100));
        assert_eq!(pending_b.collateral, CollateralAmount::from_whole(1));

        state.apply_pending_rewards(&mut a).unwrap();
        state.apply_pending_rewards(&mut b).unwrap();
        assert_eq!(a.debt, TokenAmount::from_whole(1200));
        assert_eq!(b.collateral, CollateralAmount::from_whole(11));
        assert!(state.pending_debt.is_zero());
        assert_eq!(state.active_debt, TokenAmount::from_whole(1800));
    }

    #[test]
    fn test_apply_twice_is_noop() {
        let mut state = RedistributionState::new();
        let mut a = open(&mut state, "alice", 7, 700);
        let _b = open(&mut state, "bob", 3, 300);

        state
            .redistribute(TokenAmount::from_whole(100), CollateralAmount::from_whole(1))
            .unwrap();

        let first = state.apply_pending_rewards(&mut a).unwrap();
        assert!(!first.is_zero());
        let second = state.apply_pending_rewards(&mut a).unwrap();
        assert!(second.is_zero());
    }

    #[test]
    fn test_redistribute_without_stake_is_invariant() {
        let mut state = RedistributionState::new();
        let before = state.clone();

        let result = state.redistribute(TokenAmount::from_whole(1), CollateralAmount::ZERO);
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
        assert_eq!(state, before);

        // nothing to spread is always fine
        assert!(state
            .redistribute(TokenAmount::ZERO, CollateralAmount::ZERO)
            .is_ok());
    }

    #[test]
    fn test_stake_update_requires_applied_rewards() {
        let mut state = RedistributionState::new();
        let mut a = open(&mut state, "alice", 10, 100);
        let _b = open(&mut state, "bob", 10, 100);
        state
            .redistribute(TokenAmount::from_whole(10), CollateralAmount::from_whole(1))
            .unwrap();

        assert!(matches!(
            state.update_stake_and_totals(&mut a),
            Err(Error::PendingRewardsNotApplied(_))
        ));
        assert!(matches!(
            state.close(&mut a, PositionStatus::ClosedByOwner),
            Err(Error::PendingRewardsNotApplied(_))
        ));

        state.apply_pending_rewards(&mut a).unwrap();
        assert!(state.update_stake_and_totals(&mut a).is_ok());
    }

    #[test]
    fn test_stake_uses_system_snapshot() {
        let mut state = RedistributionState::new();
        let _a = open(&mut state, "alice", 20, 1000);
        let _b = open(&mut state, "bob", 10, 500);
        state
            .redistribute(TokenAmount::from_whole(300), CollateralAmount::from_whole(3))
            .unwrap();
        state.update_system_snapshots().unwrap();

        // 30 stake per 33 collateral
        assert_eq!(state.total_stakes_snapshot, 30 * COLLATERAL_BASE_UNIT);
        assert_eq!(state.total_collateral_snapshot, 33 * COLLATERAL_BASE_UNIT);

        let c = open(&mut state, "carol", 11, 100);
        assert_eq!(c.stake, 10 * COLLATERAL_BASE_UNIT);

        // carol joined after the redistribution and gets none of it
        assert!(state.pending_rewards(&c).unwrap().is_zero());
    }

    #[test]
    fn test_stake_restarts_after_all_stake_left() {
        let mut state = RedistributionState::new();
        // Every position gone, a unit of redistribution dust still pending
        state.pending_collateral = CollateralAmount::from_units(1);
        state.update_system_snapshots().unwrap();
        assert_eq!(state.total_stakes_snapshot, 0);
        assert_eq!(state.total_collateral_snapshot, 1);

        let e = open(&mut state, "erin", 5, 100);
        assert_eq!(e.stake, 5 * COLLATERAL_BASE_UNIT);
        assert_eq!(state.total_stakes, 5 * COLLATERAL_BASE_UNIT);

        // and the newcomer can take a redistribution again
        state
            .redistribute(TokenAmount::from_whole(10), CollateralAmount::from_units(1_000))
            .unwrap();
        assert!(!state.pending_rewards(&e).unwrap().is_zero());
    }

    #[test]
    fn test_close_removes_stake() {
        let mut state = RedistributionState::new();
        let mut a = open(&mut state, "alice", 5, 100);
        let _b = open(&mut state, "bob", 5, 100);

        let (collateral, debt) = state.close(&mut a, PositionStatus::ClosedByOwner).unwrap();
        assert_eq!(collateral, CollateralAmount::from_whole(5));
        assert_eq!(debt, TokenAmount::from_whole(100));
        assert_eq!(a.stake, 0);
        assert_eq!(a.status, PositionStatus::ClosedByOwner);
        assert_eq!(state.total_stakes, 5 * COLLATERAL_BASE_UNIT);

        assert!(matches!(
            state.apply_pending_rewards(&mut a),
            Err(Error::PositionNotActive(_))
        ));
    }

    #[test]
    fn test_rounding_dust_is_carried() {
        let mut state = RedistributionState::new();
        let mut positions: Vec<Position> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                let mut p = Position::new(AccountId::from_name(name), 0, 1);
                p.collateral = CollateralAmount::from_units(1);
                checkpoint(&state, &mut p);
                state.increase_active(p.collateral, p.debt).unwrap();
                state.update_stake_and_totals(&mut p).unwrap();
                p
            })
            .collect();

        // one unit of debt over three units of stake, three times
        for _ in 0..3 {
            state
                .redistribute(TokenAmount::from_units(1), CollateralAmount::ZERO)
                .unwrap();
        }

        let mut total = 0;
        for p in positions.iter_mut() {
            total += state.apply_pending_rewards(p).unwrap().debt.units();
        }
        assert_eq!(total, 3);
        assert!(state.pending_debt.is_zero());
    }

    #[test]
    fn test_entire_debt_and_collateral_is_pure() {
        let mut state = RedistributionState::new();
        let a = open(&mut state, "alice", 10, 100);
        let _b = open(&mut state, "bob", 10, 100);
        state
            .redistribute(TokenAmount::from_whole(50), CollateralAmount::from_whole(2))
            .unwrap();

        let entire = state.entire_debt_and_collateral(&a).unwrap();
        assert_eq!(entire.debt, TokenAmount::from_whole(125));
        assert_eq!(entire.collateral, CollateralAmount::from_whole(11));
        assert_eq!(a.debt, TokenAmount::from_whole(100));
    }
}

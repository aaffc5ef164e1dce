//! Stability Pool ledger.
//!
//! Depositors pool stable tokens that absorb the debt of liquidated
//! positions, and receive the seized collateral in return. Each offset is
//! one O(1) update of the global accumulators:
//!
//! - `P`: product of `(1 - loss per unit)` factors, the fraction of a
//!   deposit made at the origin that survives
//! - `S[epoch][scale]`: sum of `gain per unit * P`, the collateral gain
//! - `G[epoch][scale]`: same as `S` for the secondary reward token
//!
//! A depositor's compounded deposit is `initial * P / P_snapshot` and its
//! gain is `initial * (S - S_snapshot) / P_snapshot`. When an offset
//! empties the pool the epoch advances and every older deposit is worth
//! zero. When `P` would drop below [`SCALE_FACTOR`] it is multiplied back
//! up and the scale advances; a deposit that sees more than one scale step
//! compounds to zero.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::amount::{CollateralAmount, RewardAmount, TokenAmount};
use crate::distribution::{
    checkpoint, pending_for, Accumulator, EpochScaleSums, ErrorFeedback, Participant,
};
use crate::error::{Error, Result};
use crate::utils::constants::*;
use crate::utils::hash::{AccountId, Hash};
use crate::utils::math::*;
use crate::utils::validation::{validate_minimum, validate_non_zero, validate_withdrawal};

// ═══════════════════════════════════════════════════════════════════════════════
// DEPOSITOR SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Global pool state captured when a depositor last checkpointed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSnapshot {
    /// Product factor
    pub p: FixedPoint,
    /// Collateral gain sum at `(epoch, scale)`
    pub s: U256,
    /// Reward gain sum at `(epoch, scale)`
    pub g: U256,
    /// Epoch
    pub epoch: u64,
    /// Scale
    pub scale: u64,
}

impl Default for DepositSnapshot {
    fn default() -> Self {
        Self {
            p: FixedPoint::ONE,
            s: U256::zero(),
            g: U256::zero(),
            epoch: 0,
            scale: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEPOSIT
// ═══════════════════════════════════════════════════════════════════════════════

/// A depositor's record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Depositor
    pub owner: AccountId,
    /// Deposit value at the last checkpoint
    pub initial_amount: TokenAmount,
    /// Global state at the last checkpoint
    pub snapshot: DepositSnapshot,
    /// Block of the first deposit
    pub deposited_at: u64,
    /// Block of the last checkpoint
    pub updated_at: u64,
}

impl Participant for Deposit {
    type Snapshot = DepositSnapshot;

    fn stake(&self) -> u64 {
        self.initial_amount.units()
    }

    fn snapshot(&self) -> &DepositSnapshot {
        &self.snapshot
    }

    fn set_snapshot(&mut self, snapshot: DepositSnapshot) {
        self.snapshot = snapshot;
    }
}

/// What a deposit is worth right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositorGains {
    /// Deposit after losses
    pub compounded: TokenAmount,
    /// Collateral earned since the checkpoint
    pub collateral_gain: CollateralAmount,
    /// Reward tokens earned since the checkpoint
    pub reward_gain: RewardAmount,
}

/// Result of a depositor operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositorPayout {
    /// Compounded deposit before the operation
    pub compounded_before: TokenAmount,
    /// Deposit after the operation
    pub new_deposit: TokenAmount,
    /// Stable tokens returned to the depositor
    pub withdrawn: TokenAmount,
    /// Collateral paid out
    pub collateral_gain: CollateralAmount,
    /// Reward tokens paid out
    pub reward_gain: RewardAmount,
}

// ═══════════════════════════════════════════════════════════════════════════════
// OFFSET PLANNING
// ═══════════════════════════════════════════════════════════════════════════════

/// How an offset moved the pool's epoch and scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolTransition {
    /// Same epoch and scale
    Unchanged,
    /// `P` was rescaled; carries the new scale
    ScaleAdvanced(u64),
    /// The pool was emptied; carries the new epoch
    EpochAdvanced(u64),
}

/// Outcome of a committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetOutcome {
    /// Debt cancelled against deposits
    pub debt_absorbed: TokenAmount,
    /// Collateral handed to depositors
    pub collateral_added: CollateralAmount,
    /// Epoch/scale movement
    pub transition: PoolTransition,
    /// Product factor after the offset
    pub new_p: FixedPoint,
}

/// Fully computed offset, ready to commit
///
/// Building a plan never mutates the pool, so a caller coordinating
/// several ledgers can plan everything first and commit only when every
/// plan succeeded.
#[derive(Debug, Clone)]
pub struct OffsetPlan {
    debt: TokenAmount,
    collateral: CollateralAmount,
    new_s: U256,
    new_p: FixedPoint,
    new_total: TokenAmount,
    collateral_carry: ErrorFeedback,
    loss_carry: ErrorFeedback,
    transition: PoolTransition,
}

impl OffsetPlan {
    /// Debt the plan absorbs
    pub fn debt(&self) -> TokenAmount {
        self.debt
    }

    /// Epoch/scale movement the plan will cause
    pub fn transition(&self) -> PoolTransition {
        self.transition
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL POOL STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Global accumulators of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityPoolState {
    /// Sum of all live compounded deposits
    pub total_deposits: TokenAmount,
    /// Product factor
    pub p: FixedPoint,
    /// Incremented whenever the pool is emptied
    pub current_epoch: u64,
    /// Incremented whenever `P` is rescaled
    pub current_scale: u64,
    /// Collateral gain sums
    pub collateral_sums: EpochScaleSums,
    /// Reward gain sums
    pub reward_sums: EpochScaleSums,
    /// Rounding carry of the collateral gain
    pub collateral_carry: ErrorFeedback,
    /// Rounding carry of the debt loss
    pub loss_carry: ErrorFeedback,
    /// Rounding carry of the reward gain
    pub reward_carry: ErrorFeedback,
}

impl Default for StabilityPoolState {
    fn default() -> Self {
        Self {
            total_deposits: TokenAmount::ZERO,
            p: FixedPoint::ONE,
            current_epoch: 0,
            current_scale: 0,
            collateral_sums: EpochScaleSums::default(),
            reward_sums: EpochScaleSums::default(),
            collateral_carry: ErrorFeedback::default(),
            loss_carry: ErrorFeedback::default(),
            reward_carry: ErrorFeedback::default(),
        }
    }
}

impl StabilityPoolState {
    fn check_snapshot(&self, snapshot: &DepositSnapshot) -> Result<()> {
        if snapshot.epoch > self.current_epoch
            || (snapshot.epoch == self.current_epoch && snapshot.scale > self.current_scale)
        {
            return Err(Error::InvariantViolation(format!(
                "snapshot at epoch {} scale {} is ahead of the pool (epoch {} scale {})",
                snapshot.epoch, snapshot.scale, self.current_epoch, self.current_scale
            )));
        }
        if snapshot.p.is_zero() {
            return Err(Error::InvariantViolation("snapshot with zero P".into()));
        }
        Ok(())
    }

    /// Deposit of `initial` checkpointed at `snapshot`, after losses
    pub fn compounded_deposit(
        &self,
        initial: TokenAmount,
        snapshot: &DepositSnapshot,
    ) -> Result<TokenAmount> {
        if initial.is_zero() {
            return Ok(TokenAmount::ZERO);
        }
        self.check_snapshot(snapshot)?;

        // Emptied by an offset after the snapshot
        if snapshot.epoch < self.current_epoch {
            return Ok(TokenAmount::ZERO);
        }

        let ratio_applied = || {
            mul_div_u128(
                initial.units() as u128,
                self.p.raw(),
                snapshot.p.raw(),
                "compounded deposit",
            )
        };

        let compounded = match self.current_scale - snapshot.scale {
            0 => ratio_applied()?,
            1 => ratio_applied()? / SCALE_FACTOR,
            // Below representable precision
            _ => 0,
        };

        u64::try_from(compounded)
            .map(TokenAmount::from_units)
            .map_err(|_| Error::Overflow {
                operation: "compounded deposit".into(),
            })
    }

    fn gain_from_sums(
        &self,
        sums: &EpochScaleSums,
        initial: TokenAmount,
        snapshot: &DepositSnapshot,
        snapshot_sum: U256,
        operation: &str,
    ) -> Result<u64> {
        if initial.is_zero() {
            return Ok(0);
        }
        self.check_snapshot(snapshot)?;

        // Gains earned in the snapshot's scale, plus those earned after
        // exactly one rescale (stored at 1/SCALE_FACTOR of their weight)
        let first_portion = sums
            .get(snapshot.epoch, snapshot.scale)
            .checked_sub(snapshot_sum)
            .ok_or_else(|| {
                Error::InvariantViolation(format!("{} sum below depositor snapshot", operation))
            })?;
        let second_portion =
            sums.get(snapshot.epoch, snapshot.scale + 1) / U256::from(SCALE_FACTOR);

        let weighted = first_portion
            .checked_add(second_portion)
            .ok_or_else(|| Error::Overflow {
                operation: operation.into(),
            })?;

        let gain = mul_div_u256(
            U256::from(initial.units()),
            weighted,
            U256::from(snapshot.p.raw()),
            operation,
        )? / U256::from(DECIMAL_PRECISION);

        gain.to_u64_checked(operation)
    }

    /// Collateral gain of `initial` since `snapshot`
    pub fn collateral_gain(
        &self,
        initial: TokenAmount,
        snapshot: &DepositSnapshot,
    ) -> Result<CollateralAmount> {
        self.gain_from_sums(
            &self.collateral_sums,
            initial,
            snapshot,
            snapshot.s,
            "collateral gain",
        )
        .map(CollateralAmount::from_units)
    }

    /// Reward gain of `initial` since `snapshot`
    pub fn reward_gain(
        &self,
        initial: TokenAmount,
        snapshot: &DepositSnapshot,
    ) -> Result<RewardAmount> {
        self.gain_from_sums(&self.reward_sums, initial, snapshot, snapshot.g, "reward gain")
            .map(RewardAmount::from_units)
    }

    /// Compute an offset without applying it
    pub fn plan_offset(
        &self,
        debt: TokenAmount,
        collateral: CollateralAmount,
    ) -> Result<OffsetPlan> {
        let total = self.total_deposits;

        if debt > total {
            tracing::error!(
                debt = debt.units(),
                total = total.units(),
                "offset exceeds pool deposits"
            );
            return Err(Error::InvariantViolation(format!(
                "offset of {} exceeds pool deposits {}",
                debt, total
            )));
        }

        if total.is_zero() && !collateral.is_zero() {
            tracing::error!(collateral = collateral.units(), "collateral offset against empty pool");
            return Err(Error::InvariantViolation(
                "collateral distributed to an empty pool".into(),
            ));
        }

        let unchanged = OffsetPlan {
            debt,
            collateral,
            new_s: self.collateral_sums.get(self.current_epoch, self.current_scale),
            new_p: self.p,
            new_total: total,
            collateral_carry: self.collateral_carry,
            loss_carry: self.loss_carry,
            transition: PoolTransition::Unchanged,
        };

        if total.is_zero() || (debt.is_zero() && collateral.is_zero()) {
            return Ok(unchanged);
        }

        // Per-unit gain, weighted by the current P
        let gain = self.collateral_carry.share_floor(collateral.units(), total.units())?;
        let marginal_gain = U256::from(gain.per_unit.raw())
            .checked_mul(U256::from(self.p.raw()))
            .ok_or_else(|| Error::Overflow {
                operation: "marginal collateral gain".into(),
            })?;
        let new_s = unchanged
            .new_s
            .checked_add(marginal_gain)
            .ok_or_else(|| Error::Overflow {
                operation: "collateral sum".into(),
            })?;

        // Per-unit loss, rounded up
        let (loss_per_unit, loss_carry) = if debt == total {
            (FixedPoint::ONE, ErrorFeedback::default())
        } else if debt.is_zero() {
            (FixedPoint::ZERO, self.loss_carry)
        } else {
            let loss = self.loss_carry.share_ceil(debt.units(), total.units())?;
            (loss.per_unit, loss.carry)
        };

        let decay = FixedPoint::ONE.checked_sub(loss_per_unit).map_err(|_| {
            Error::InvariantViolation(format!("loss per unit {} above one", loss_per_unit))
        })?;

        let (new_p, new_total, transition) = if decay.is_zero() {
            (
                FixedPoint::ONE,
                TokenAmount::ZERO,
                PoolTransition::EpochAdvanced(self.current_epoch + 1),
            )
        } else {
            // Rescale from the unfloored product to keep the low digits,
            // as many times as it takes to lift P back over the threshold
            let mut product = U256::from(self.p.raw())
                .checked_mul(U256::from(decay.raw()))
                .ok_or_else(|| Error::Overflow {
                    operation: "decayed P".into(),
                })?;
            let mut scale = self.current_scale;
            let mut new_p = (product / U256::from(DECIMAL_PRECISION)).to_u128_checked("decayed P")?;
            while new_p < SCALE_FACTOR {
                product = product
                    .checked_mul(U256::from(SCALE_FACTOR))
                    .ok_or_else(|| Error::Overflow {
                        operation: "rescaled P".into(),
                    })?;
                scale += 1;
                new_p = (product / U256::from(DECIMAL_PRECISION)).to_u128_checked("rescaled P")?;
            }

            let transition = if scale == self.current_scale {
                PoolTransition::Unchanged
            } else {
                PoolTransition::ScaleAdvanced(scale)
            };
            (FixedPoint::from_raw(new_p), total.try_sub(debt)?, transition)
        };

        // Every slot the commit writes must be writable
        let (e, s) = (self.current_epoch, self.current_scale);
        let next_slot = match transition {
            PoolTransition::Unchanged => (e, s),
            PoolTransition::ScaleAdvanced(_) => (e, s + 1),
            PoolTransition::EpochAdvanced(epoch) => (epoch, 0),
        };
        for sums in [&self.collateral_sums, &self.reward_sums] {
            if !sums.can_write(e, s) || !sums.can_write(next_slot.0, next_slot.1) {
                return Err(Error::InvariantViolation(format!(
                    "gain sums not open at epoch {} scale {}",
                    e, s
                )));
            }
        }

        Ok(OffsetPlan {
            debt,
            collateral,
            new_s,
            new_p,
            new_total,
            collateral_carry: gain.carry,
            loss_carry,
            transition,
        })
    }

    /// Apply a plan produced by [`plan_offset`](Self::plan_offset) on this state
    pub fn commit_offset(&mut self, plan: &OffsetPlan) -> Result<()> {
        let (e, s) = (self.current_epoch, self.current_scale);
        self.collateral_sums.set(e, s, plan.new_s)?;

        match plan.transition {
            PoolTransition::Unchanged => {}
            PoolTransition::ScaleAdvanced(scale) => {
                // Skipped scales stay at zero
                for next in s + 1..=scale {
                    self.collateral_sums.set(e, next, U256::zero())?;
                    self.reward_sums.set(e, next, U256::zero())?;
                }
                self.current_scale = scale;
            }
            PoolTransition::EpochAdvanced(epoch) => {
                self.collateral_sums.set(epoch, 0, U256::zero())?;
                self.reward_sums.set(epoch, 0, U256::zero())?;
                self.current_epoch = epoch;
                self.current_scale = 0;
            }
        }

        self.p = plan.new_p;
        self.total_deposits = plan.new_total;
        self.collateral_carry = plan.collateral_carry;
        self.loss_carry = plan.loss_carry;
        Ok(())
    }
}

impl Accumulator for StabilityPoolState {
    type Snapshot = DepositSnapshot;
    type Pending = DepositorGains;

    fn current_snapshot(&self) -> DepositSnapshot {
        DepositSnapshot {
            p: self.p,
            s: self.collateral_sums.get(self.current_epoch, self.current_scale),
            g: self.reward_sums.get(self.current_epoch, self.current_scale),
            epoch: self.current_epoch,
            scale: self.current_scale,
        }
    }

    fn pending(&self, stake: u64, snapshot: &DepositSnapshot) -> Result<DepositorGains> {
        let initial = TokenAmount::from_units(stake);
        Ok(DepositorGains {
            compounded: self.compounded_deposit(initial, snapshot)?,
            collateral_gain: self.collateral_gain(initial, snapshot)?,
            reward_gain: self.reward_gain(initial, snapshot)?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// The Stability Pool ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityPool {
    /// Global accumulators
    state: StabilityPoolState,
    /// Depositor records
    deposits: HashMap<AccountId, Deposit>,
    /// Collateral held for depositors
    collateral_balance: CollateralAmount,
    /// Reward tokens held for depositors
    reward_balance: RewardAmount,
    /// Minimum deposit
    min_deposit: u64,
    /// Offsets absorbed
    total_liquidations: u64,
    /// Debt absorbed over the pool's lifetime
    total_debt_absorbed: TokenAmount,
    /// Collateral received over the pool's lifetime
    total_collateral_received: CollateralAmount,
}

impl Default for StabilityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StabilityPool {
    /// Create an empty pool accepting deposits of any size
    pub fn new() -> Self {
        Self::with_min_deposit(MIN_POOL_DEPOSIT)
    }

    /// Create an empty pool with a minimum deposit
    pub fn with_min_deposit(min_deposit: u64) -> Self {
        Self {
            state: StabilityPoolState::default(),
            deposits: HashMap::new(),
            collateral_balance: CollateralAmount::ZERO,
            reward_balance: RewardAmount::ZERO,
            min_deposit,
            total_liquidations: 0,
            total_debt_absorbed: TokenAmount::ZERO,
            total_collateral_received: CollateralAmount::ZERO,
        }
    }

    fn pending_of(&self, owner: &AccountId) -> Result<DepositorGains> {
        match self.deposits.get(owner) {
            Some(deposit) => pending_for(&self.state, deposit),
            None => Ok(DepositorGains::default()),
        }
    }

    /// Build the record that replaces `owner`'s after a checkpoint
    fn checkpointed(&self, owner: AccountId, amount: TokenAmount, block_height: u64) -> Deposit {
        let deposited_at = self
            .deposits
            .get(&owner)
            .map_or(block_height, |d| d.deposited_at);
        let mut deposit = Deposit {
            owner,
            initial_amount: amount,
            snapshot: DepositSnapshot::default(),
            deposited_at,
            updated_at: block_height,
        };
        checkpoint(&self.state, &mut deposit);
        deposit
    }

    /// Move `owner` to a new deposit value, paying out pending gains
    fn settle(
        &mut self,
        owner: AccountId,
        pending: DepositorGains,
        new_deposit: TokenAmount,
        new_total: TokenAmount,
        block_height: u64,
    ) -> Result<(CollateralAmount, RewardAmount)> {
        let collateral_balance = self
            .collateral_balance
            .try_sub(pending.collateral_gain)
            .map_err(|_| {
                Error::InvariantViolation(format!(
                    "collateral gain {} exceeds pool balance {}",
                    pending.collateral_gain, self.collateral_balance
                ))
            })?;
        let reward_balance = self
            .reward_balance
            .try_sub(pending.reward_gain)
            .map_err(|_| {
                Error::InvariantViolation(format!(
                    "reward gain {} exceeds pool balance {}",
                    pending.reward_gain, self.reward_balance
                ))
            })?;

        if new_deposit.is_zero() {
            self.deposits.remove(&owner);
        } else {
            let record = self.checkpointed(owner, new_deposit, block_height);
            self.deposits.insert(owner, record);
        }
        self.state.total_deposits = new_total;
        self.collateral_balance = collateral_balance;
        self.reward_balance = reward_balance;

        Ok((pending.collateral_gain, pending.reward_gain))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DEPOSITS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Deposit stable tokens
    ///
    /// Pending gains are paid out and the existing deposit is compounded
    /// before `amount` is added.
    pub fn deposit(
        &mut self,
        owner: AccountId,
        amount: TokenAmount,
        block_height: u64,
    ) -> Result<DepositorPayout> {
        validate_minimum(amount.units(), self.min_deposit, "deposit")?;

        let pending = self.pending_of(&owner)?;
        let new_deposit = pending.compounded.try_add(amount)?;
        let new_total = self.state.total_deposits.try_add(amount)?;

        let (collateral_gain, reward_gain) =
            self.settle(owner, pending, new_deposit, new_total, block_height)?;

        tracing::debug!(
            depositor = %owner,
            amount = amount.units(),
            compounded = pending.compounded.units(),
            total = new_total.units(),
            "pool deposit"
        );

        Ok(DepositorPayout {
            compounded_before: pending.compounded,
            new_deposit,
            withdrawn: TokenAmount::ZERO,
            collateral_gain,
            reward_gain,
        })
    }

    /// Withdraw stable tokens from the compounded deposit
    pub fn withdraw(
        &mut self,
        owner: &AccountId,
        amount: TokenAmount,
        block_height: u64,
    ) -> Result<DepositorPayout> {
        validate_non_zero(amount.units(), "withdrawal")?;

        let pending = self.pending_of(owner)?;
        validate_withdrawal(amount.units(), pending.compounded.units())?;

        let new_deposit = pending.compounded.try_sub(amount)?;
        let new_total = self.state.total_deposits.try_sub(amount).map_err(|_| {
            Error::InvariantViolation(format!(
                "withdrawal {} exceeds pool deposits {}",
                amount, self.state.total_deposits
            ))
        })?;

        let (collateral_gain, reward_gain) =
            self.settle(*owner, pending, new_deposit, new_total, block_height)?;

        tracing::debug!(
            depositor = %owner,
            amount = amount.units(),
            remaining = new_deposit.units(),
            total = new_total.units(),
            "pool withdrawal"
        );

        Ok(DepositorPayout {
            compounded_before: pending.compounded,
            new_deposit,
            withdrawn: amount,
            collateral_gain,
            reward_gain,
        })
    }

    /// Withdraw the whole compounded deposit and all gains
    pub fn withdraw_all(&mut self, owner: &AccountId, block_height: u64) -> Result<DepositorPayout> {
        let compounded = self.get_compounded_deposit(owner)?;
        if compounded.is_zero() {
            return self.claim_gains(owner, block_height);
        }
        self.withdraw(owner, compounded, block_height)
    }

    /// Pay out pending gains without moving principal
    ///
    /// A depositor whose deposit has compounded to zero is removed.
    pub fn claim_gains(&mut self, owner: &AccountId, block_height: u64) -> Result<DepositorPayout> {
        if !self.deposits.contains_key(owner) {
            return Ok(DepositorPayout::default());
        }

        let pending = self.pending_of(owner)?;
        let total = self.state.total_deposits;
        let (collateral_gain, reward_gain) =
            self.settle(*owner, pending, pending.compounded, total, block_height)?;

        tracing::debug!(
            depositor = %owner,
            collateral = collateral_gain.units(),
            reward = reward_gain.units(),
            "pool gains claimed"
        );

        Ok(DepositorPayout {
            compounded_before: pending.compounded,
            new_deposit: pending.compounded,
            withdrawn: TokenAmount::ZERO,
            collateral_gain,
            reward_gain,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OFFSETS AND REWARDS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cancel `debt` against deposits and hand `collateral` to depositors
    pub fn offset(
        &mut self,
        debt: TokenAmount,
        collateral: CollateralAmount,
    ) -> Result<OffsetOutcome> {
        let plan = self.plan_offset(debt, collateral)?;
        self.commit_offset(plan)
    }

    /// Compute an offset without applying it
    pub fn plan_offset(
        &self,
        debt: TokenAmount,
        collateral: CollateralAmount,
    ) -> Result<OffsetPlan> {
        // Balance update must not fail after the accumulators move
        self.collateral_balance.try_add(collateral)?;
        self.state.plan_offset(debt, collateral)
    }

    /// Apply a previously computed offset
    pub fn commit_offset(&mut self, plan: OffsetPlan) -> Result<OffsetOutcome> {
        let collateral_balance = self.collateral_balance.try_add(plan.collateral)?;
        self.state.commit_offset(&plan)?;

        self.collateral_balance = collateral_balance;
        if !plan.debt.is_zero() {
            self.total_liquidations += 1;
        }
        self.total_debt_absorbed = self.total_debt_absorbed.saturating_add(plan.debt);
        self.total_collateral_received =
            self.total_collateral_received.saturating_add(plan.collateral);

        match plan.transition {
            PoolTransition::EpochAdvanced(epoch) => {
                tracing::info!(epoch, debt = plan.debt.units(), "stability pool emptied, new epoch");
            }
            PoolTransition::ScaleAdvanced(scale) => {
                tracing::info!(scale, p = %plan.new_p, "stability pool product rescaled");
            }
            PoolTransition::Unchanged => {}
        }
        tracing::debug!(
            debt = plan.debt.units(),
            collateral = plan.collateral.units(),
            total = self.state.total_deposits.units(),
            p = %self.state.p,
            "pool offset"
        );

        Ok(OffsetOutcome {
            debt_absorbed: plan.debt,
            collateral_added: plan.collateral,
            transition: plan.transition,
            new_p: plan.new_p,
        })
    }

    /// Spread reward tokens across current depositors
    ///
    /// Returns the amount distributed; nothing is distributed while the
    /// pool is empty.
    pub fn distribute_reward(&mut self, amount: RewardAmount) -> Result<RewardAmount> {
        validate_non_zero(amount.units(), "reward")?;

        let total = self.state.total_deposits;
        if total.is_zero() {
            tracing::debug!(amount = amount.units(), "reward skipped, pool empty");
            return Ok(RewardAmount::ZERO);
        }

        let (e, s) = (self.state.current_epoch, self.state.current_scale);
        let share = self.state.reward_carry.share_floor(amount.units(), total.units())?;
        let new_g = U256::from(share.per_unit.raw())
            .checked_mul(U256::from(self.state.p.raw()))
            .and_then(|marginal| self.state.reward_sums.get(e, s).checked_add(marginal))
            .ok_or_else(|| Error::Overflow {
                operation: "reward sum".into(),
            })?;
        let reward_balance = self.reward_balance.try_add(amount)?;

        self.state.reward_sums.set(e, s, new_g)?;
        self.state.reward_carry = share.carry;
        self.reward_balance = reward_balance;

        tracing::debug!(amount = amount.units(), total = total.units(), "pool reward distributed");
        Ok(amount)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current compounded deposit of `owner`
    pub fn get_compounded_deposit(&self, owner: &AccountId) -> Result<TokenAmount> {
        match self.deposits.get(owner) {
            Some(d) => self.state.compounded_deposit(d.initial_amount, &d.snapshot),
            None => Ok(TokenAmount::ZERO),
        }
    }

    /// Collateral gain `owner` could claim now
    pub fn get_collateral_gain(&self, owner: &AccountId) -> Result<CollateralAmount> {
        match self.deposits.get(owner) {
            Some(d) => self.state.collateral_gain(d.initial_amount, &d.snapshot),
            None => Ok(CollateralAmount::ZERO),
        }
    }

    /// Reward gain `owner` could claim now
    pub fn get_reward_gain(&self, owner: &AccountId) -> Result<RewardAmount> {
        match self.deposits.get(owner) {
            Some(d) => self.state.reward_gain(d.initial_amount, &d.snapshot),
            None => Ok(RewardAmount::ZERO),
        }
    }

    /// Everything `owner` is owed right now
    pub fn get_depositor_gains(&self, owner: &AccountId) -> Result<DepositorGains> {
        self.pending_of(owner)
    }

    /// Global accumulators
    pub fn state(&self) -> &StabilityPoolState {
        &self.state
    }

    /// Total deposits
    pub fn total_deposits(&self) -> TokenAmount {
        self.state.total_deposits
    }

    /// Collateral held for depositors
    pub fn collateral_balance(&self) -> CollateralAmount {
        self.collateral_balance
    }

    /// Reward tokens held for depositors
    pub fn reward_balance(&self) -> RewardAmount {
        self.reward_balance
    }

    /// Current product factor
    pub fn p(&self) -> FixedPoint {
        self.state.p
    }

    /// Current epoch
    pub fn current_epoch(&self) -> u64 {
        self.state.current_epoch
    }

    /// Current scale
    pub fn current_scale(&self) -> u64 {
        self.state.current_scale
    }

    /// Depositor record
    pub fn get_deposit(&self, owner: &AccountId) -> Option<&Deposit> {
        self.deposits.get(owner)
    }

    /// All depositor records
    pub fn deposits(&self) -> impl Iterator<Item = &Deposit> {
        self.deposits.values()
    }

    /// Number of depositors
    pub fn depositor_count(&self) -> usize {
        self.deposits.len()
    }

    /// Whether the pool could absorb `debt` in full
    pub fn can_absorb(&self, debt: TokenAmount) -> bool {
        self.state.total_deposits >= debt
    }

    /// Pool statistics
    pub fn statistics(&self) -> PoolStats {
        PoolStats {
            total_deposits: self.state.total_deposits,
            collateral_balance: self.collateral_balance,
            reward_balance: self.reward_balance,
            depositor_count: self.deposits.len() as u64,
            total_liquidations: self.total_liquidations,
            total_debt_absorbed: self.total_debt_absorbed,
            total_collateral_received: self.total_collateral_received,
            p: self.state.p,
            current_epoch: self.state.current_epoch,
            current_scale: self.state.current_scale,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SERIALIZATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Hash of the global state and balances
    pub fn state_hash(&self) -> Result<Hash> {
        let mut data = bincode::serialize(&self.state)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        data.extend_from_slice(&self.collateral_balance.units().to_be_bytes());
        data.extend_from_slice(&self.reward_balance.units().to_be_bytes());
        Ok(Hash::sha256(&data))
    }
}

/// Stability pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Sum of live deposits
    pub total_deposits: TokenAmount,
    /// Collateral held for depositors
    pub collateral_balance: CollateralAmount,
    /// Reward tokens held for depositors
    pub reward_balance: RewardAmount,
    /// Number of depositors
    pub depositor_count: u64,
    /// Offsets absorbed
    pub total_liquidations: u64,
    /// Lifetime debt absorbed
    pub total_debt_absorbed: TokenAmount,
    /// Lifetime collateral received
    pub total_collateral_received: CollateralAmount,
    /// Product factor
    pub p: FixedPoint,
    /// Epoch
    pub current_epoch: u64,
    /// Scale
    pub current_scale: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> AccountId {
        AccountId::from_name("alice")
    }

    fn bob() -> AccountId {
        AccountId::from_name("bob")
    }

    fn carol() -> AccountId {
        AccountId::from_name("carol")
    }

    fn pool_with(deposits: &[(AccountId, u64)]) -> StabilityPool {
        let mut pool = StabilityPool::new();
        for (owner, whole) in deposits {
            pool.deposit(*owner, TokenAmount::from_whole(*whole), 1).unwrap();
        }
        pool
    }

    fn units_close(a: u64, b: u64, tolerance: u64) -> bool {
        a.max(b) - a.min(b) <= tolerance
    }

    #[test]
    fn test_deposit() {
        let pool = pool_with(&[(alice(), 1000)]);

        assert_eq!(pool.total_deposits(), TokenAmount::from_whole(1000));
        assert_eq!(pool.depositor_count(), 1);
        assert_eq!(
            pool.get_compounded_deposit(&alice()).unwrap(),
            TokenAmount::from_whole(1000)
        );
    }

    #[test]
    fn test_deposit_zero_rejected() {
        let mut pool = StabilityPool::new();
        let result = pool.deposit(alice(), TokenAmount::ZERO, 1);
        assert!(matches!(result, Err(Error::InvalidAmount { .. })));
        assert_eq!(pool.depositor_count(), 0);
    }

    #[test]
    fn test_deposit_minimum() {
        let mut pool = StabilityPool::with_min_deposit(STABLE_BASE_UNIT);
        let result = pool.deposit(alice(), TokenAmount::from_units(10), 1);
        assert!(matches!(result, Err(Error::BelowMinimum { .. })));
    }

    #[test]
    fn test_withdraw() {
        let mut pool = pool_with(&[(alice(), 1000)]);

        let payout = pool
            .withdraw(&alice(), TokenAmount::from_whole(400), 2)
            .unwrap();

        assert_eq!(payout.withdrawn, TokenAmount::from_whole(400));
        assert_eq!(payout.new_deposit, TokenAmount::from_whole(600));
        assert_eq!(pool.total_deposits(), TokenAmount::from_whole(600));
    }

    #[test]
    fn test_withdraw_exceeding_balance_changes_nothing() {
        let mut pool = pool_with(&[(alice(), 1000)]);
        let before = pool.state_hash().unwrap();

        let result = pool.withdraw(&alice(), TokenAmount::from_whole(1001), 2);
        assert_eq!(
            result,
            Err(Error::InsufficientBalance {
                requested: 1001 * STABLE_BASE_UNIT,
                available: 1000 * STABLE_BASE_UNIT,
            })
        );
        assert_eq!(pool.state_hash().unwrap(), before);

        // no record at all
        assert!(matches!(
            pool.withdraw(&bob(), TokenAmount::from_units(1), 2),
            Err(Error::InsufficientBalance { available: 0, .. })
        ));
    }

    #[test]
    fn test_full_withdrawal_removes_record() {
        let mut pool = pool_with(&[(alice(), 1000)]);
        pool.withdraw(&alice(), TokenAmount::from_whole(1000), 2).unwrap();
        assert!(pool.get_deposit(&alice()).is_none());
        assert!(pool.total_deposits().is_zero());
    }

    #[test]
    fn test_three_depositor_offset() {
        let mut pool = pool_with(&[(alice(), 10_000), (bob(), 10_000), (carol(), 10_000)]);

        pool.offset(TokenAmount::from_whole(20_000), CollateralAmount::from_whole(200))
            .unwrap();

        for owner in [alice(), bob(), carol()] {
            let compounded = pool.get_compounded_deposit(&owner).unwrap();
            let gain = pool.get_collateral_gain(&owner).unwrap();

            // each keeps a third of the remaining 10,000 and lost ~6,666.67
            assert!(units_close(compounded.units(), 3_333_333_333, 1));
            let lost = TokenAmount::from_whole(10_000).units() - compounded.units();
            assert!(units_close(lost, 6_666_666_667, 1));
            assert!(units_close(gain.units(), 6_666_666_666, 1));
        }
        assert_eq!(pool.total_deposits(), TokenAmount::from_whole(10_000));
    }

    #[test]
    fn test_full_depletion_starts_new_epoch() {
        let mut pool = pool_with(&[(alice(), 500), (bob(), 1500)]);

        let outcome = pool
            .offset(TokenAmount::from_whole(2000), CollateralAmount::from_whole(20))
            .unwrap();

        assert_eq!(outcome.transition, PoolTransition::EpochAdvanced(1));
        assert_eq!(pool.current_epoch(), 1);
        assert_eq!(pool.current_scale(), 0);
        assert_eq!(pool.p(), FixedPoint::ONE);
        assert!(pool.total_deposits().is_zero());
        assert_eq!(pool.get_compounded_deposit(&alice()).unwrap(), TokenAmount::ZERO);
        assert_eq!(pool.get_compounded_deposit(&bob()).unwrap(), TokenAmount::ZERO);

        // gains from the emptying offset are still owed
        assert_eq!(
            pool.get_collateral_gain(&alice()).unwrap(),
            CollateralAmount::from_whole(5)
        );
        assert_eq!(
            pool.get_collateral_gain(&bob()).unwrap(),
            CollateralAmount::from_whole(15)
        );
    }

    #[test]
    fn test_epoch_refill() {
        let mut pool = pool_with(&[(alice(), 10_000)]);
        pool.offset(TokenAmount::from_whole(10_000), CollateralAmount::from_whole(100))
            .unwrap();

        pool.deposit(bob(), TokenAmount::from_whole(5_000), 2).unwrap();
        assert_eq!(pool.get_compounded_deposit(&alice()).unwrap(), TokenAmount::ZERO);

        pool.offset(TokenAmount::from_whole(5_000), CollateralAmount::from_whole(60))
            .unwrap();

        assert_eq!(pool.current_epoch(), 2);
        assert_eq!(pool.get_compounded_deposit(&alice()).unwrap(), TokenAmount::ZERO);
        assert_eq!(pool.get_compounded_deposit(&bob()).unwrap(), TokenAmount::ZERO);
        assert_eq!(
            pool.get_collateral_gain(&bob()).unwrap(),
            CollateralAmount::from_whole(60)
        );
        assert_eq!(
            pool.get_collateral_gain(&alice()).unwrap(),
            CollateralAmount::from_whole(100)
        );
    }

    #[test]
    fn test_scale_crossing_keeps_one_billionth() {
        let initial = 1_000_000_000_000_000u64;
        let mut pool = StabilityPool::new();
        pool.deposit(alice(), TokenAmount::from_units(initial), 1).unwrap();

        // leave exactly initial / SCALE_FACTOR in the pool
        let debt = initial - initial / SCALE_FACTOR as u64;
        let outcome = pool
            .offset(TokenAmount::from_units(debt), CollateralAmount::from_units(1))
            .unwrap();

        assert_eq!(outcome.transition, PoolTransition::ScaleAdvanced(1));
        assert_eq!(pool.current_scale(), 1);
        assert!(pool.p().raw() >= SCALE_FACTOR);

        let compounded = pool.get_compounded_deposit(&alice()).unwrap().units();
        assert!(units_close(compounded, initial / SCALE_FACTOR as u64, 1));
        assert!(compounded <= pool.total_deposits().units());
    }

    #[test]
    fn test_two_scale_crossings_compound_to_zero() {
        let initial = 1_000_000_000_000_000u64;
        let mut pool = StabilityPool::new();
        pool.deposit(alice(), TokenAmount::from_units(initial), 1).unwrap();
        pool.offset(
            TokenAmount::from_units(initial - initial / SCALE_FACTOR as u64),
            CollateralAmount::ZERO,
        )
        .unwrap();

        pool.deposit(bob(), TokenAmount::from_units(initial), 2).unwrap();
        let total = pool.total_deposits().units();
        let outcome = pool
            .offset(TokenAmount::from_units(total - 500_000), CollateralAmount::ZERO)
            .unwrap();

        assert_eq!(outcome.transition, PoolTransition::ScaleAdvanced(2));
        assert_eq!(pool.get_compounded_deposit(&alice()).unwrap(), TokenAmount::ZERO);

        let bob_left = pool.get_compounded_deposit(&bob()).unwrap().units();
        assert!((499_000..=500_000).contains(&bob_left));
    }

    #[test]
    fn test_repeated_near_total_offsets_keep_p_representable() {
        let mut pool = StabilityPool::new();

        for round in 0..10u64 {
            let owner = AccountId::from_name(&format!("depositor-{}", round));
            pool.deposit(owner, TokenAmount::from_units(10_000_000_000_000), round + 1)
                .unwrap();

            let scale_before = pool.current_scale();
            let total = pool.total_deposits().units();
            let outcome = pool
                .offset(TokenAmount::from_units(total - 1), CollateralAmount::from_units(1_000))
                .unwrap();

            assert!(pool.p().raw() >= SCALE_FACTOR, "round {}: P = {}", round, pool.p());
            assert_eq!(pool.total_deposits(), TokenAmount::from_units(1));
            match outcome.transition {
                PoolTransition::ScaleAdvanced(scale) => {
                    assert!(scale > scale_before);
                    assert_eq!(pool.current_scale(), scale);
                }
                other => panic!("round {}: expected a rescale, got {:?}", round, other),
            }
        }

        // Earliest depositor has seen many crossings
        let first = AccountId::from_name("depositor-0");
        assert_eq!(pool.get_compounded_deposit(&first).unwrap(), TokenAmount::ZERO);
    }

    #[test]
    fn test_offset_exceeding_deposits_is_invariant() {
        let mut pool = pool_with(&[(alice(), 100)]);
        let before = pool.state_hash().unwrap();

        let result = pool.offset(TokenAmount::from_whole(101), CollateralAmount::from_whole(1));
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
        assert!(result.unwrap_err().is_critical());
        assert_eq!(pool.state_hash().unwrap(), before);
    }

    #[test]
    fn test_collateral_to_empty_pool_is_invariant() {
        let mut pool = StabilityPool::new();
        assert!(matches!(
            pool.offset(TokenAmount::ZERO, CollateralAmount::from_units(5)),
            Err(Error::InvariantViolation(_))
        ));
        // nothing to do at all is fine
        assert!(pool.offset(TokenAmount::ZERO, CollateralAmount::ZERO).is_ok());
    }

    #[test]
    fn test_late_depositor_gets_no_earlier_gain() {
        let mut pool = pool_with(&[(alice(), 1000)]);
        pool.offset(TokenAmount::from_whole(100), CollateralAmount::from_whole(1))
            .unwrap();

        pool.deposit(bob(), TokenAmount::from_whole(900), 2).unwrap();
        assert_eq!(pool.get_collateral_gain(&bob()).unwrap(), CollateralAmount::ZERO);

        // both now hold 900; the next gain splits evenly
        pool.offset(TokenAmount::from_whole(180), CollateralAmount::from_whole(2))
            .unwrap();
        let alice_gain = pool.get_collateral_gain(&alice()).unwrap().units();
        let bob_gain = pool.get_collateral_gain(&bob()).unwrap().units();
        assert!(units_close(alice_gain, COLLATERAL_BASE_UNIT * 2, 2));
        assert!(units_close(bob_gain, COLLATERAL_BASE_UNIT, 2));
    }

    #[test]
    fn test_topup_pays_gains_and_compounds() {
        let mut pool = pool_with(&[(alice(), 1000)]);
        pool.offset(TokenAmount::from_whole(250), CollateralAmount::from_whole(3))
            .unwrap();

        let payout = pool.deposit(alice(), TokenAmount::from_whole(250), 5).unwrap();

        // the loss is rounded up, so 750 may come back one unit short
        assert!(units_close(payout.compounded_before.units(), 750 * STABLE_BASE_UNIT, 1));
        assert_eq!(
            payout.new_deposit,
            payout.compounded_before.saturating_add(TokenAmount::from_whole(250))
        );
        assert_eq!(payout.collateral_gain, CollateralAmount::from_whole(3));
        assert_eq!(pool.get_collateral_gain(&alice()).unwrap(), CollateralAmount::ZERO);
        assert_eq!(pool.collateral_balance(), CollateralAmount::ZERO);

        let record = pool.get_deposit(&alice()).unwrap();
        assert_eq!(record.deposited_at, 1);
        assert_eq!(record.updated_at, 5);
    }

    #[test]
    fn test_claim_gains() {
        let mut pool = pool_with(&[(alice(), 1000)]);
        pool.offset(TokenAmount::from_whole(1000), CollateralAmount::from_whole(11))
            .unwrap();

        let payout = pool.claim_gains(&alice(), 3).unwrap();
        assert_eq!(payout.collateral_gain, CollateralAmount::from_whole(11));
        // wiped deposit is removed once its gains are out
        assert!(pool.get_deposit(&alice()).is_none());

        let nothing = pool.claim_gains(&bob(), 3).unwrap();
        assert_eq!(nothing, DepositorPayout::default());
    }

    #[test]
    fn test_distribute_reward() {
        let mut pool = pool_with(&[(alice(), 1000), (bob(), 3000)]);

        let distributed = pool.distribute_reward(RewardAmount::from_whole(40)).unwrap();
        assert_eq!(distributed, RewardAmount::from_whole(40));
        assert_eq!(pool.get_reward_gain(&alice()).unwrap(), RewardAmount::from_whole(10));
        assert_eq!(pool.get_reward_gain(&bob()).unwrap(), RewardAmount::from_whole(30));

        // rewards never shrink deposits
        assert_eq!(
            pool.get_compounded_deposit(&bob()).unwrap(),
            TokenAmount::from_whole(3000)
        );
    }

    #[test]
    fn test_reward_on_empty_pool_is_noop() {
        let mut pool = StabilityPool::new();
        let distributed = pool.distribute_reward(RewardAmount::from_whole(5)).unwrap();
        assert!(distributed.is_zero());
        assert!(pool.reward_balance().is_zero());
    }

    #[test]
    fn test_withdraw_all() {
        let mut pool = pool_with(&[(alice(), 1000), (bob(), 1000)]);
        pool.offset(TokenAmount::from_whole(500), CollateralAmount::from_whole(4))
            .unwrap();

        let payout = pool.withdraw_all(&alice(), 9).unwrap();
        assert!(units_close(payout.withdrawn.units(), 750 * STABLE_BASE_UNIT, 1));
        assert!(payout.new_deposit.is_zero());
        assert_eq!(payout.collateral_gain, CollateralAmount::from_whole(2));
        assert!(pool.get_deposit(&alice()).is_none());
    }

    #[test]
    fn test_serialization() {
        let mut pool = pool_with(&[(alice(), 1000)]);
        pool.offset(TokenAmount::from_whole(10), CollateralAmount::from_whole(1))
            .unwrap();

        let bytes = pool.to_bytes().unwrap();
        let restored = StabilityPool::from_bytes(&bytes).unwrap();

        assert_eq!(restored.state(), pool.state());
        assert_eq!(restored.state_hash().unwrap(), pool.state_hash().unwrap());
        assert_eq!(
            restored.get_compounded_deposit(&alice()).unwrap(),
            pool.get_compounded_deposit(&alice()).unwrap()
        );
    }
}

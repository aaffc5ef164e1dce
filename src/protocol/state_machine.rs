//! Protocol state machine - core orchestration.
//!
//! [`Protocol`] owns both ledgers, the liquidation engine and the event
//! log, and is the single entry point hosts drive. Each public method is
//! one atomic transition: it either commits every ledger change and its
//! events, or returns an error and leaves everything untouched.

use std::sync::{Arc, Mutex};

use crate::core::amount::{CollateralAmount, RewardAmount, TokenAmount};
use crate::core::config::ProtocolParams;
use crate::core::position::{Position, PositionManager, PositionUpdate};
use crate::error::{Error, Result};
use crate::liquidation::engine::LiquidationEngine;
use crate::liquidation::engine::LiquidationEvent;
use crate::liquidation::redistribution::EntireDebtAndCollateral;
use crate::liquidation::stability_pool::{DepositorGains, DepositorPayout, StabilityPool};
use crate::protocol::events::*;
use crate::protocol::operations::{LedgerOperation, OperationOutcome};
use crate::storage::backend::{InMemoryStore, StorageBackend};
use crate::storage::state::{LedgerMeta, SnapshotRef, StateManager};
use crate::utils::hash::{AccountId, PositionId};
use crate::utils::validation::validate_price;

// ═══════════════════════════════════════════════════════════════════════════════
// STATE MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Protocol state machine - orchestrates all ledger operations
pub struct Protocol<B: StorageBackend> {
    /// State manager for persistence
    state_manager: StateManager<B>,
    /// Protocol parameters
    params: ProtocolParams,
    /// Stability pool
    pool: StabilityPool,
    /// Positions and redistribution ledger
    positions: PositionManager,
    /// Liquidation engine
    engine: LiquidationEngine,
    /// Recent events
    events: EventLog,
    /// Current collateral price
    price: Option<u64>,
    /// Current block height
    block_height: u64,
}

impl Protocol<InMemoryStore> {
    /// Create a protocol that is never persisted
    pub fn ephemeral(params: ProtocolParams) -> Result<Self> {
        Self::create(InMemoryStore::new(), params)
    }
}

impl<B: StorageBackend> Protocol<B> {
    /// Create a fresh protocol on an empty store
    pub fn create(backend: B, params: ProtocolParams) -> Result<Self> {
        let state_manager = StateManager::new(backend);
        if state_manager.has_state()? {
            return Err(Error::Config("store already holds a ledger".into()));
        }
        Self::fresh(state_manager, params)
    }

    /// Load a protocol previously saved to `backend`
    pub fn open(backend: B) -> Result<Self> {
        Self::restore(StateManager::new(backend))
    }

    /// Load the saved protocol, or create one with `params`
    pub fn open_or_create(backend: B, params: ProtocolParams) -> Result<Self> {
        let state_manager = StateManager::new(backend);
        if state_manager.has_state()? {
            Self::restore(state_manager)
        } else {
            Self::fresh(state_manager, params)
        }
    }

    fn fresh(state_manager: StateManager<B>, params: ProtocolParams) -> Result<Self> {
        params.validate()?;
        tracing::info!(
            min_collateral_ratio = params.min_collateral_ratio,
            min_debt = params.min_debt,
            "protocol created"
        );

        Ok(Self {
            state_manager,
            pool: StabilityPool::with_min_deposit(params.min_pool_deposit),
            positions: PositionManager::new(&params),
            engine: LiquidationEngine::with_max_events(params.max_retained_events),
            events: EventLog::new(params.max_retained_events),
            params,
            price: None,
            block_height: 0,
        })
    }

    fn restore(state_manager: StateManager<B>) -> Result<Self> {
        let snapshot = state_manager
            .load_snapshot()?
            .ok_or_else(|| Error::StateNotFound("no ledger snapshot in store".into()))?;

        tracing::info!(
            block_height = snapshot.meta.block_height,
            positions = snapshot.positions.active_count(),
            depositors = snapshot.pool.depositor_count(),
            "protocol loaded"
        );

        Ok(Self {
            state_manager,
            params: snapshot.params,
            pool: snapshot.pool,
            positions: snapshot.positions,
            engine: snapshot.engine,
            events: snapshot.events,
            price: snapshot.meta.price,
            block_height: snapshot.meta.block_height,
        })
    }

    /// Persist the current state
    pub fn save(&self) -> Result<LedgerMeta> {
        self.state_manager.save_snapshot(SnapshotRef {
            params: &self.params,
            pool: &self.pool,
            positions: &self.positions,
            engine: &self.engine,
            events: &self.events,
            block_height: self.block_height,
            price: self.price,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BLOCK AND PRICE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Move to a new block height
    pub fn advance_block(&mut self, height: u64) -> Result<()> {
        if height < self.block_height {
            return Err(Error::InvalidParameter {
                name: "block_height".into(),
                reason: format!("{} is below current height {}", height, self.block_height),
            });
        }
        self.block_height = height;
        Ok(())
    }

    /// Set the collateral price, stable base units per whole collateral
    pub fn set_price(&mut self, price: u64) -> Result<()> {
        validate_price(price)?;
        tracing::debug!(price, "price updated");
        self.price = Some(price);
        Ok(())
    }

    fn require_price(&self) -> Result<u64> {
        self.price.ok_or_else(|| Error::InvalidParameter {
            name: "price".into(),
            reason: "no price has been set".into(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STABILITY POOL OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Deposit into the Stability Pool
    pub fn deposit(&mut self, depositor: AccountId, amount: TokenAmount) -> Result<DepositorPayout> {
        let payout = self.pool.deposit(depositor, amount, self.block_height)?;
        self.events.push(LedgerEvent::PoolDeposit(PoolDepositEvent {
            depositor,
            amount,
            payout,
            total_deposits: self.pool.total_deposits(),
            block_height: self.block_height,
        }));
        Ok(payout)
    }

    /// Withdraw from the Stability Pool
    pub fn withdraw(&mut self, depositor: &AccountId, amount: TokenAmount) -> Result<DepositorPayout> {
        let payout = self.pool.withdraw(depositor, amount, self.block_height)?;
        self.record_withdrawal(*depositor, payout);
        Ok(payout)
    }

    /// Withdraw the whole compounded deposit and all gains
    pub fn withdraw_all(&mut self, depositor: &AccountId) -> Result<DepositorPayout> {
        let payout = self.pool.withdraw_all(depositor, self.block_height)?;
        self.record_withdrawal(*depositor, payout);
        Ok(payout)
    }

    /// Claim pool gains without moving principal
    pub fn claim_gains(&mut self, depositor: &AccountId) -> Result<DepositorPayout> {
        let payout = self.pool.claim_gains(depositor, self.block_height)?;
        self.record_gains(*depositor, &payout);
        Ok(payout)
    }

    /// Spread reward tokens over current depositors
    pub fn issue_reward(&mut self, amount: RewardAmount) -> Result<RewardAmount> {
        let issued = self.pool.distribute_reward(amount)?;
        if !issued.is_zero() {
            self.events.push(LedgerEvent::RewardIssued(RewardIssuedEvent {
                amount: issued,
                total_deposits: self.pool.total_deposits(),
                block_height: self.block_height,
            }));
        }
        Ok(issued)
    }

    fn record_withdrawal(&mut self, depositor: AccountId, payout: DepositorPayout) {
        if payout.withdrawn.is_zero() {
            self.record_gains(depositor, &payout);
            return;
        }
        self.events.push(LedgerEvent::PoolWithdraw(PoolWithdrawEvent {
            depositor,
            payout,
            total_deposits: self.pool.total_deposits(),
            block_height: self.block_height,
        }));
    }

    fn record_gains(&mut self, depositor: AccountId, payout: &DepositorPayout) {
        if payout.collateral_gain.is_zero() && payout.reward_gain.is_zero() {
            return;
        }
        self.events.push(LedgerEvent::GainsClaimed(GainsClaimedEvent {
            depositor,
            collateral: payout.collateral_gain,
            reward: payout.reward_gain,
            block_height: self.block_height,
        }));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // POSITION OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a position at the current price
    pub fn open_position(
        &mut self,
        owner: AccountId,
        collateral: CollateralAmount,
        debt: TokenAmount,
    ) -> Result<PositionId> {
        let price = self.require_price()?;
        let id = self
            .positions
            .open(owner, collateral, debt, price, self.block_height)?;

        let stake = self.positions.get(&id).map_or(0, |p| p.stake);
        self.events.push(LedgerEvent::PositionOpened(PositionOpenedEvent {
            position_id: id,
            owner,
            collateral,
            debt,
            stake,
            block_height: self.block_height,
        }));
        Ok(id)
    }

    /// Add collateral to a position
    pub fn add_collateral(&mut self, id: &PositionId, amount: CollateralAmount) -> Result<PositionUpdate> {
        let update = self.positions.add_collateral(id, amount, self.block_height)?;
        self.record_adjustment(Adjustment::AddCollateral(amount), update);
        Ok(update)
    }

    /// Withdraw collateral from a position at the current price
    pub fn withdraw_collateral(
        &mut self,
        id: &PositionId,
        amount: CollateralAmount,
    ) -> Result<PositionUpdate> {
        let price = self.require_price()?;
        let update = self
            .positions
            .withdraw_collateral(id, amount, price, self.block_height)?;
        self.record_adjustment(Adjustment::WithdrawCollateral(amount), update);
        Ok(update)
    }

    /// Draw more debt at the current price
    pub fn borrow(&mut self, id: &PositionId, amount: TokenAmount) -> Result<PositionUpdate> {
        let price = self.require_price()?;
        let update = self.positions.borrow(id, amount, price, self.block_height)?;
        self.record_adjustment(Adjustment::Borrow(amount), update);
        Ok(update)
    }

    /// Repay debt
    pub fn repay(&mut self, id: &PositionId, amount: TokenAmount) -> Result<PositionUpdate> {
        let update = self.positions.repay(id, amount, self.block_height)?;
        self.record_adjustment(Adjustment::Repay(amount), update);
        Ok(update)
    }

    /// Close a position, returning the collateral released and debt settled
    pub fn close_position(&mut self, id: &PositionId) -> Result<(CollateralAmount, TokenAmount)> {
        let (collateral, debt) = self.positions.close(id, self.block_height)?;
        self.events.push(LedgerEvent::PositionClosed(PositionClosedEvent {
            position_id: *id,
            collateral,
            debt,
            block_height: self.block_height,
        }));
        Ok((collateral, debt))
    }

    fn record_adjustment(&mut self, adjustment: Adjustment, update: PositionUpdate) {
        self.events.push(LedgerEvent::PositionAdjusted(PositionAdjustedEvent {
            position_id: update.id,
            adjustment,
            rewards_applied: update.applied,
            collateral: update.collateral,
            debt: update.debt,
            stake: update.stake,
            block_height: self.block_height,
        }));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Liquidate one position at the current price
    pub fn liquidate(&mut self, id: &PositionId) -> Result<LiquidationEvent> {
        let price = self.require_price()?;
        let event = self.engine.liquidate(
            &mut self.positions,
            &mut self.pool,
            id,
            price,
            self.block_height,
        )?;
        self.record_liquidation(&event);
        Ok(event)
    }

    /// Liquidate every position below the minimum ratio, lowest first
    ///
    /// At most `max_batch_size` positions are processed. A position that
    /// fails is logged and skipped; the others still go through.
    pub fn liquidate_all(&mut self) -> Result<Vec<LiquidationEvent>> {
        let price = self.require_price()?;
        let liquidated = self.engine.liquidate_all(
            &mut self.positions,
            &mut self.pool,
            price,
            self.block_height,
            self.params.max_batch_size,
        )?;
        for event in &liquidated {
            self.record_liquidation(event);
        }

        tracing::info!(liquidated = liquidated.len(), price, "liquidation batch finished");
        Ok(liquidated)
    }

    fn record_liquidation(&mut self, event: &LiquidationEvent) {
        let block_height = self.block_height;
        if !event.debt_offset.is_zero() {
            self.events.push(LedgerEvent::Offset(OffsetEvent {
                debt: event.debt_offset,
                collateral: event.collateral_to_pool,
                total_deposits: self.pool.total_deposits(),
                block_height,
            }));
        }
        if let Some(transition) =
            LedgerEvent::for_transition(event.pool_transition, self.pool.p(), block_height)
        {
            self.events.push(transition);
        }
        if !event.debt_redistributed.is_zero() || !event.collateral_redistributed.is_zero() {
            let ledger = self.positions.ledger();
            self.events.push(LedgerEvent::Redistribution(RedistributionEvent {
                debt: event.debt_redistributed,
                collateral: event.collateral_redistributed,
                l_collateral: ledger.l_collateral,
                l_debt: ledger.l_debt,
                block_height,
            }));
        }
        self.events.push(LedgerEvent::PositionLiquidated(event.clone()));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPERATION DISPATCH
    // ═══════════════════════════════════════════════════════════════════════════

    /// Execute a ledger operation
    pub fn execute(&mut self, op: LedgerOperation) -> Result<OperationOutcome> {
        tracing::debug!(op = op.operation_type(), block_height = self.block_height, "executing");

        let outcome = match op {
            LedgerOperation::AdvanceBlock { height } => {
                self.advance_block(height)?;
                OperationOutcome::Updated
            }
            LedgerOperation::SetPrice { price } => {
                self.set_price(price)?;
                OperationOutcome::Updated
            }
            LedgerOperation::Deposit { depositor, amount } => {
                OperationOutcome::Payout(self.deposit(depositor, amount)?)
            }
            LedgerOperation::Withdraw { depositor, amount } => {
                OperationOutcome::Payout(self.withdraw(&depositor, amount)?)
            }
            LedgerOperation::WithdrawAll { depositor } => {
                OperationOutcome::Payout(self.withdraw_all(&depositor)?)
            }
            LedgerOperation::ClaimGains { depositor } => {
                OperationOutcome::Payout(self.claim_gains(&depositor)?)
            }
            LedgerOperation::IssueReward { amount } => {
                OperationOutcome::RewardIssued(self.issue_reward(amount)?)
            }
            LedgerOperation::OpenPosition { owner, collateral, debt } => {
                OperationOutcome::Opened(self.open_position(owner, collateral, debt)?)
            }
            LedgerOperation::AddCollateral { position, amount } => {
                OperationOutcome::Adjusted(self.add_collateral(&position, amount)?)
            }
            LedgerOperation::WithdrawCollateral { position, amount } => {
                OperationOutcome::Adjusted(self.withdraw_collateral(&position, amount)?)
            }
            LedgerOperation::Borrow { position, amount } => {
                OperationOutcome::Adjusted(self.borrow(&position, amount)?)
            }
            LedgerOperation::Repay { position, amount } => {
                OperationOutcome::Adjusted(self.repay(&position, amount)?)
            }
            LedgerOperation::ClosePosition { position } => {
                let (collateral, debt) = self.close_position(&position)?;
                OperationOutcome::Closed { collateral, debt }
            }
            LedgerOperation::Liquidate { position } => {
                OperationOutcome::Liquidated(vec![self.liquidate(&position)?])
            }
            LedgerOperation::LiquidateAll => OperationOutcome::Liquidated(self.liquidate_all()?),
        };
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INVARIANTS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Check the cross-ledger accounting invariants
    ///
    /// - Compounded deposits never exceed the pool total
    /// - Depositor gains never exceed what the pool holds
    /// - Raw position amounts add up to the active pool totals
    pub fn check_invariants(&self) -> Result<()> {
        let mut compounded = 0u128;
        let mut collateral_gains = 0u128;
        for deposit in self.pool.deposits() {
            let gains = self.pool.get_depositor_gains(&deposit.owner)?;
            compounded += u128::from(gains.compounded.units());
            collateral_gains += u128::from(gains.collateral_gain.units());
        }
        let total = u128::from(self.pool.total_deposits().units());
        if compounded > total {
            return Self::violation(format!(
                "compounded deposits {} exceed pool total {}",
                compounded, total
            ));
        }
        let held = u128::from(self.pool.collateral_balance().units());
        if collateral_gains > held {
            return Self::violation(format!(
                "collateral gains {} exceed pool balance {}",
                collateral_gains, held
            ));
        }

        let (mut raw_collateral, mut raw_debt) = (0u128, 0u128);
        for position in self.positions.active_positions() {
            raw_collateral += u128::from(position.collateral.units());
            raw_debt += u128::from(position.debt.units());
        }
        let ledger = self.positions.ledger();
        if raw_collateral != u128::from(ledger.active_collateral.units())
            || raw_debt != u128::from(ledger.active_debt.units())
        {
            return Self::violation(format!(
                "positions hold {}/{} but active pool records {}/{}",
                raw_collateral, raw_debt, ledger.active_collateral, ledger.active_debt
            ));
        }
        Ok(())
    }

    fn violation(message: String) -> Result<()> {
        tracing::error!(%message, "invariant violated");
        Err(Error::InvariantViolation(message))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Protocol parameters
    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// Current block height
    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    /// Current price, if set
    pub fn price(&self) -> Option<u64> {
        self.price
    }

    /// The Stability Pool
    pub fn pool(&self) -> &StabilityPool {
        &self.pool
    }

    /// The position book
    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    /// The liquidation engine
    pub fn engine(&self) -> &LiquidationEngine {
        &self.engine
    }

    /// Recent events
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Compounded deposit of `depositor`
    pub fn compounded_deposit(&self, depositor: &AccountId) -> Result<TokenAmount> {
        self.pool.get_compounded_deposit(depositor)
    }

    /// Compounded deposit and pending gains of `depositor`
    pub fn depositor_gains(&self, depositor: &AccountId) -> Result<DepositorGains> {
        self.pool.get_depositor_gains(depositor)
    }

    /// A position by id
    pub fn position(&self, id: &PositionId) -> Result<&Position> {
        self.positions
            .get(id)
            .ok_or_else(|| Error::PositionNotFound(id.to_hex()))
    }

    /// A position's debt and collateral including pending rewards
    pub fn entire_debt_and_collateral(&self, id: &PositionId) -> Result<EntireDebtAndCollateral> {
        self.positions.entire_debt_and_collateral(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED PROTOCOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Thread-safe handle serializing every transition behind one lock
pub struct SharedProtocol<B: StorageBackend> {
    inner: Arc<Mutex<Protocol<B>>>,
}

impl<B: StorageBackend> Clone for SharedProtocol<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: StorageBackend> SharedProtocol<B> {
    /// Wrap a protocol
    pub fn new(protocol: Protocol<B>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(protocol)),
        }
    }

    /// Run `f` with exclusive access to the protocol
    pub fn with<T>(&self, f: impl FnOnce(&mut Protocol<B>) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().map_err(|_| Error::Lock)?;
        f(&mut guard)
    }

    /// Execute one operation under the lock
    pub fn execute(&self, op: LedgerOperation) -> Result<OperationOutcome> {
        self.with(|protocol| protocol.execute(op))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

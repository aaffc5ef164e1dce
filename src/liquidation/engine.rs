//! Liquidation engine.
//!
//! This module liquidates positions below the minimum collateral ratio:
//! - Detection of liquidatable positions, including pending rewards
//! - Offset of as much debt as the Stability Pool holds
//! - Redistribution of the remainder over the other open positions
//!
//! Both ledgers are planned first and committed only when every plan
//! succeeded, so a failed liquidation leaves no trace.

use serde::{Deserialize, Serialize};

use crate::core::amount::{CollateralAmount, TokenAmount};
use crate::core::position::{AccountId, PositionId, PositionManager};
use crate::error::{Error, Result};
use crate::liquidation::stability_pool::{PoolTransition, StabilityPool};
use crate::utils::constants::*;
use crate::utils::math::*;
use crate::utils::validation::validate_price;

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION EVENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Record of a liquidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    /// Position that was liquidated
    pub position_id: PositionId,
    /// Owner of the liquidated position
    pub owner: AccountId,
    /// Debt removed, pending rewards included
    pub debt: TokenAmount,
    /// Collateral seized, pending rewards included
    pub collateral: CollateralAmount,
    /// Debt cancelled against the Stability Pool
    pub debt_offset: TokenAmount,
    /// Collateral sent to the Stability Pool
    pub collateral_to_pool: CollateralAmount,
    /// Debt spread over the other positions
    pub debt_redistributed: TokenAmount,
    /// Collateral spread over the other positions
    pub collateral_redistributed: CollateralAmount,
    /// Price used
    pub price: u64,
    /// Collateralization ratio at liquidation
    pub ratio_at_liquidation: u64,
    /// Pool epoch/scale movement
    pub pool_transition: PoolTransition,
    /// Block height
    pub block_height: u64,
}

impl LiquidationEvent {
    /// Whether the pool absorbed the whole debt
    pub fn fully_offset(&self) -> bool {
        self.debt_redistributed.is_zero() && self.collateral_redistributed.is_zero()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION SPLIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Division of a liquidated position between pool and redistribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationSplit {
    /// Debt the pool absorbs
    pub debt_offset: TokenAmount,
    /// Collateral the pool receives
    pub collateral_to_pool: CollateralAmount,
    /// Debt left for redistribution
    pub debt_redistributed: TokenAmount,
    /// Collateral left for redistribution
    pub collateral_redistributed: CollateralAmount,
}

impl LiquidationSplit {
    /// Offset as much debt as the pool holds, with the proportional
    /// (floored) share of collateral; the rest is redistributed
    pub fn compute(
        debt: TokenAmount,
        collateral: CollateralAmount,
        pool_deposits: TokenAmount,
    ) -> Result<Self> {
        let debt_offset = debt.min(pool_deposits);
        let collateral_to_pool = if debt_offset == debt {
            collateral
        } else {
            CollateralAmount::from_units(safe_mul_div(
                collateral.units(),
                debt_offset.units(),
                debt.units(),
            )?)
        };

        Ok(Self {
            debt_offset,
            collateral_to_pool,
            debt_redistributed: debt.try_sub(debt_offset)?,
            collateral_redistributed: collateral.try_sub(collateral_to_pool)?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine for liquidating undercollateralized positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEngine {
    /// Events history
    events: Vec<LiquidationEvent>,
    /// Maximum events to keep
    max_events: usize,
    /// Total liquidations performed
    total_liquidations: u64,
    /// Total debt liquidated
    total_debt_liquidated: TokenAmount,
    /// Total collateral seized
    total_collateral_seized: CollateralAmount,
    /// Debt absorbed by the pool
    total_debt_offset: TokenAmount,
    /// Debt redistributed to positions
    total_debt_redistributed: TokenAmount,
}

impl Default for LiquidationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LiquidationEngine {
    /// Create a new liquidation engine
    pub fn new() -> Self {
        Self::with_max_events(MAX_RETAINED_EVENTS)
    }

    /// Create an engine keeping at most `max_events` events
    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            events: Vec::new(),
            max_events,
            total_liquidations: 0,
            total_debt_liquidated: TokenAmount::ZERO,
            total_collateral_seized: CollateralAmount::ZERO,
            total_debt_offset: TokenAmount::ZERO,
            total_debt_redistributed: TokenAmount::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION EXECUTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Liquidate one position
    pub fn liquidate(
        &mut self,
        positions: &mut PositionManager,
        pool: &mut StabilityPool,
        id: &PositionId,
        price: u64,
        block_height: u64,
    ) -> Result<LiquidationEvent> {
        validate_price(price)?;

        let entire = positions.entire_debt_and_collateral(id)?;
        let ratio = calculate_collateral_ratio(
            entire.collateral.units(),
            price,
            entire.debt.units(),
        )?;
        if entire.debt.is_zero() || ratio >= positions.min_collateral_ratio() {
            return Err(Error::PositionHealthy(id.to_hex()));
        }

        let split = LiquidationSplit::compute(entire.debt, entire.collateral, pool.total_deposits())?;

        // Plan both ledgers before touching either
        let pool_plan = if split.debt_offset.is_zero() {
            None
        } else {
            Some(pool.plan_offset(split.debt_offset, split.collateral_to_pool)?)
        };
        let removal = positions.plan_liquidation(
            id,
            split.debt_redistributed,
            split.collateral_redistributed,
            block_height,
        )?;
        if removal.debt != entire.debt || removal.collateral != entire.collateral {
            return Err(Error::InvariantViolation(format!(
                "position {} changed between read and plan",
                id
            )));
        }

        let pool_transition = match pool_plan {
            Some(plan) => pool.commit_offset(plan)?.transition,
            None => PoolTransition::Unchanged,
        };
        let owner = removal.owner();
        positions.commit_liquidation(removal);

        let event = LiquidationEvent {
            position_id: *id,
            owner,
            debt: entire.debt,
            collateral: entire.collateral,
            debt_offset: split.debt_offset,
            collateral_to_pool: split.collateral_to_pool,
            debt_redistributed: split.debt_redistributed,
            collateral_redistributed: split.collateral_redistributed,
            price,
            ratio_at_liquidation: ratio,
            pool_transition,
            block_height,
        };

        tracing::info!(
            position = %id,
            ratio,
            debt = entire.debt.units(),
            offset = split.debt_offset.units(),
            redistributed = split.debt_redistributed.units(),
            "position liquidated"
        );

        self.total_liquidations += 1;
        self.total_debt_liquidated = self.total_debt_liquidated.saturating_add(entire.debt);
        self.total_collateral_seized = self
            .total_collateral_seized
            .saturating_add(entire.collateral);
        self.total_debt_offset = self.total_debt_offset.saturating_add(split.debt_offset);
        self.total_debt_redistributed = self
            .total_debt_redistributed
            .saturating_add(split.debt_redistributed);
        self.add_event(event.clone());

        Ok(event)
    }

    /// Liquidate several positions, each on its own
    ///
    /// A position that fails is logged and skipped; the others still go
    /// through.
    pub fn liquidate_batch(
        &mut self,
        positions: &mut PositionManager,
        pool: &mut StabilityPool,
        ids: &[PositionId],
        price: u64,
        block_height: u64,
        max_liquidations: usize,
    ) -> Result<Vec<LiquidationEvent>> {
        validate_price(price)?;

        let mut events = Vec::new();
        for id in ids.iter().take(max_liquidations) {
            match self.liquidate(positions, pool, id, price, block_height) {
                Ok(event) => events.push(event),
                Err(e) if e.is_critical() => {
                    tracing::error!(position = %id, error = %e, "liquidation aborted");
                }
                Err(e) => {
                    tracing::warn!(position = %id, error = %e, "liquidation skipped");
                }
            }
        }

        Ok(events)
    }

    /// Liquidate every liquidatable position, lowest ratio first
    pub fn liquidate_all(
        &mut self,
        positions: &mut PositionManager,
        pool: &mut StabilityPool,
        price: u64,
        block_height: u64,
        max_liquidations: usize,
    ) -> Result<Vec<LiquidationEvent>> {
        let ids: Vec<PositionId> = positions
            .get_liquidatable(price)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        self.liquidate_batch(positions, pool, &ids, price, block_height, max_liquidations)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Get total liquidations
    pub fn total_liquidations(&self) -> u64 {
        self.total_liquidations
    }

    /// Get total debt liquidated
    pub fn total_debt_liquidated(&self) -> TokenAmount {
        self.total_debt_liquidated
    }

    /// Get total collateral seized
    pub fn total_collateral_seized(&self) -> CollateralAmount {
        self.total_collateral_seized
    }

    /// Get recent events
    pub fn recent_events(&self) -> &[LiquidationEvent] {
        &self.events
    }

    /// Get events for a specific position
    pub fn events_for_position(&self, id: &PositionId) -> Vec<&LiquidationEvent> {
        self.events.iter().filter(|e| e.position_id == *id).collect()
    }

    /// Get statistics
    pub fn statistics(&self) -> LiquidationStats {
        let avg_ratio = if !self.events.is_empty() {
            let sum: u64 = self.events.iter().map(|e| e.ratio_at_liquidation).sum();
            sum / self.events.len() as u64
        } else {
            0
        };

        let fully_offset = self.events.iter().filter(|e| e.fully_offset()).count() as u64;

        LiquidationStats {
            total_liquidations: self.total_liquidations,
            total_debt_liquidated: self.total_debt_liquidated,
            total_collateral_seized: self.total_collateral_seized,
            total_debt_offset: self.total_debt_offset,
            total_debt_redistributed: self.total_debt_redistributed,
            average_ratio_at_liquidation: avg_ratio,
            fully_offset_count: fully_offset,
            redistribution_count: (self.events.len() as u64).saturating_sub(fully_offset),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INTERNAL
    // ═══════════════════════════════════════════════════════════════════════════

    /// Add an event (with pruning)
    fn add_event(&mut self, event: LiquidationEvent) {
        self.events.push(event);

        if self.events.len() > self.max_events {
            self.events.drain(0..self.events.len() - self.max_events);
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

/// Liquidation statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationStats {
    /// Liquidations performed
    pub total_liquidations: u64,
    /// Debt removed from liquidated positions
    pub total_debt_liquidated: TokenAmount,
    /// Collateral seized from liquidated positions
    pub total_collateral_seized: CollateralAmount,
    /// Debt absorbed by the Stability Pool
    pub total_debt_offset: TokenAmount,
    /// Debt redistributed to positions
    pub total_debt_redistributed: TokenAmount,
    /// Mean ratio over retained events
    pub average_ratio_at_liquidation: u64,
    /// Retained events fully absorbed by the pool
    pub fully_offset_count: u64,
    /// Retained events with a redistributed remainder
    pub redistribution_count: u64,
}

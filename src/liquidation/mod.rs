//! Liquidation module.
//!
//! This module handles the two loss-absorbing ledgers and the engine
//! that routes a liquidated position through them:
//! - Stability pool that burns deposits against liquidated debt
//! - Redistribution ledger that spreads the remainder over active stakes
//! - Liquidation engine that splits each liquidation between the two

pub mod engine;
pub mod redistribution;
pub mod stability_pool;

pub use engine::*;
pub use redistribution::*;
pub use stability_pool::*;

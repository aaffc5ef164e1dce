//! # cdp-ledger
//!
//! Loss and gain distribution for a collateralized debt protocol. When a
//! position falls below the minimum collateral ratio its debt and
//! collateral are absorbed by Stability Pool depositors and, for the
//! remainder, spread over the other positions. Both ledgers do this in
//! constant time per event, without iterating participants.
//!
//! ## Architecture
//!
//! - **Distribution**: error-feedback division and the accumulator and
//!   participant contract shared by both ledgers
//! - **Liquidation**: the Stability Pool (product `P`, sums `S`/`G`,
//!   epochs and scales), the redistribution ledger (`L_coll`, `L_debt`,
//!   stakes) and the orchestrator that splits each liquidation
//! - **Core**: amounts, positions and protocol parameters
//! - **Protocol**: one atomic, persistable state machine over all of it
//! - **Storage**: key/value backends and snapshot persistence
//!
//! ## Example
//!
//! ```rust,ignore
//! use cdp_ledger::prelude::*;
//!
//! let mut protocol = Protocol::ephemeral(ProtocolParams::default())?;
//! protocol.deposit(AccountId::from_name("alice"), TokenAmount::from_whole(10_000))?;
//! protocol.set_price(2_000 * STABLE_BASE_UNIT)?;
//!
//! let id = protocol.open_position(
//!     AccountId::from_name("bob"),
//!     CollateralAmount::from_whole(1),
//!     TokenAmount::from_whole(1_500),
//! )?;
//! protocol.set_price(1_500 * STABLE_BASE_UNIT)?;
//! let event = protocol.liquidate(&id)?;
//! assert!(event.fully_offset());
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications
)]

pub mod cli;
pub mod core;
pub mod distribution;
pub mod error;
pub mod liquidation;
pub mod protocol;
pub mod storage;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        amount::{CollateralAmount, RewardAmount, TokenAmount},
        config::ProtocolParams,
        position::{Position, PositionManager, PositionStatus, PositionUpdate},
    };
    pub use crate::error::{Error, Result};
    pub use crate::liquidation::{
        engine::{LiquidationEngine, LiquidationEvent},
        redistribution::{EntireDebtAndCollateral, PendingRewards, RedistributionState},
        stability_pool::{DepositorGains, DepositorPayout, PoolTransition, StabilityPool},
    };
    pub use crate::protocol::{
        EventLog, LedgerEvent, LedgerOperation, OperationOutcome, Protocol, SharedProtocol,
    };
    pub use crate::storage::{BinaryStore, FileStore, InMemoryStore, StateManager, StorageBackend};
    pub use crate::utils::{
        constants::{COLLATERAL_BASE_UNIT, REWARD_BASE_UNIT, STABLE_BASE_UNIT},
        hash::{AccountId, Hash, PositionId},
        math::FixedPoint,
    };
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Protocol module - state machine and orchestration.
//!
//! This module ties both ledgers and the liquidation engine together
//! behind one atomic, persistable entry point:
//! - `Protocol`: the state machine
//! - `LedgerOperation`: every transition as serializable data
//! - `LedgerEvent` / `EventLog`: what each transition did

pub mod events;
pub mod operations;
pub mod state_machine;

pub use events::*;
pub use operations::*;
pub use state_machine::*;

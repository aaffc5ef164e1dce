//! Core types shared by both ledgers.
//!
//! - Strongly-typed token, collateral and reward amounts
//! - Protocol parameters
//! - Positions and the position book

pub mod amount;
pub mod config;
pub mod position;

pub use amount::*;
pub use config::*;
pub use position::*;

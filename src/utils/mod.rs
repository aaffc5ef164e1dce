//! Utility modules shared by both ledgers.
//!
//! - Fixed-point and 256-bit arithmetic
//! - Hashes and identifiers
//! - Validation helpers
//! - Constants

pub mod constants;
pub mod hash;
pub mod math;
pub mod validation;

pub use constants::*;
pub use hash::*;
pub use math::*;
pub use validation::*;

//! Ledger constants and magic numbers.
//!
//! All protocol-wide constants are defined here for easy auditing and modification.

// ═══════════════════════════════════════════════════════════════════════════════
// FIXED-POINT CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Precision of every per-unit quantity (18 decimals)
pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Factor applied to `P` when it falls below [`SCALE_FACTOR`]
///
/// `P` is never allowed to drop below this value while deposits remain,
/// so it keeps at least nine significant digits.
pub const SCALE_FACTOR: u128 = 1_000_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable token decimals
pub const STABLE_DECIMALS: u32 = 6;

/// Base units per whole stable token
pub const STABLE_BASE_UNIT: u64 = 1_000_000;

/// Collateral decimals
pub const COLLATERAL_DECIMALS: u32 = 8;

/// Base units per whole collateral token
pub const COLLATERAL_BASE_UNIT: u64 = 100_000_000;

/// Secondary reward token decimals
pub const REWARD_DECIMALS: u32 = 6;

/// Base units per whole reward token
pub const REWARD_BASE_UNIT: u64 = 1_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum Collateral Ratio (MCR) - 110%
/// Below this ratio, a position can be liquidated
pub const MIN_COLLATERAL_RATIO: u64 = 110;

/// Ratio precision (100 = 100%)
pub const RATIO_PRECISION: u64 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// LIMITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum debt per position - 10 stable tokens
pub const MIN_DEBT: u64 = 10 * STABLE_BASE_UNIT;

/// Minimum stability pool deposit - 1 base unit
pub const MIN_POOL_DEPOSIT: u64 = 1;

/// Maximum positions processed in one liquidation batch
pub const MAX_LIQUIDATIONS_PER_BATCH: usize = 50;

/// Liquidation events retained in memory
pub const MAX_RETAINED_EVENTS: usize = 1000;

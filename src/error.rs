//! Error types for the ledger engine.
//!
//! Every ledger operation validates before it mutates, so any error
//! returned here means the ledger state was left untouched.

use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the ledger engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ═══════════════════════════════════════════════════════════════════
    // Amount Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Zero, negative or malformed amount supplied by the caller
    #[error("Invalid amount for {field}: {reason}")]
    InvalidAmount {
        /// Which input was rejected
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Withdrawal exceeds the caller's compounded balance
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Requested amount in base units
        requested: u64,
        /// Available amount in base units
        available: u64,
    },

    /// Amount below a protocol minimum
    #[error("{field} amount {amount} below minimum {minimum}")]
    BelowMinimum {
        /// Which input was rejected
        field: String,
        /// Supplied amount
        amount: u64,
        /// Protocol minimum
        minimum: u64,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Position Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Position not found
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// Position already exists
    #[error("Position already exists: {0}")]
    PositionAlreadyExists(String),

    /// Position is closed or liquidated
    #[error("Position is not active: {0}")]
    PositionNotActive(String),

    /// Position is above the minimum ratio and cannot be liquidated
    #[error("Position {0} is healthy and cannot be liquidated")]
    PositionHealthy(String),

    /// Collateral ratio below the minimum
    #[error("Collateral ratio {current}% below minimum {minimum}%")]
    CollateralRatioTooLow {
        /// Resulting ratio percentage
        current: u64,
        /// Minimum ratio percentage
        minimum: u64,
    },

    /// Redistribution would have no remaining stake to land on
    #[error("Cannot redistribute position {0}: no other stake in the system")]
    LastPosition(String),

    /// Raw position fields touched while rewards were still pending
    #[error("Pending rewards not applied for position {0}")]
    PendingRewardsNotApplied(String),

    // ═══════════════════════════════════════════════════════════════════
    // Ledger Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Internal accounting impossibility
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Overflow in calculation
    #[error("Arithmetic overflow in {operation}")]
    Overflow {
        /// Operation that overflowed
        operation: String,
    },

    /// Underflow in calculation
    #[error("Arithmetic underflow in {operation}")]
    Underflow {
        /// Operation that underflowed
        operation: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Configuration Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Invalid parameter
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Configuration could not be loaded or saved
    #[error("Config error: {0}")]
    Config(String),

    // ═══════════════════════════════════════════════════════════════════
    // Persistence Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// No persisted state under the expected key
    #[error("State not found: {0}")]
    StateNotFound(String),

    // ═══════════════════════════════════════════════════════════════════
    // Internal Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Lock acquisition failed
    #[error("Failed to acquire lock")]
    Lock,
}

impl Error {
    /// Shorthand for a zero-amount rejection
    pub fn zero_amount(field: &str) -> Self {
        Error::InvalidAmount {
            field: field.into(),
            reason: "amount cannot be zero".into(),
        }
    }

    /// Returns true if the caller can fix the input and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidAmount { .. }
                | Error::InsufficientBalance { .. }
                | Error::BelowMinimum { .. }
                | Error::CollateralRatioTooLow { .. }
                | Error::PositionHealthy(_)
        )
    }

    /// Returns true if this is a critical error requiring immediate attention
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_)
                | Error::Internal(_)
                | Error::Overflow { .. }
                | Error::Underflow { .. }
        )
    }

    /// Returns the error code for external systems
    pub fn code(&self) -> u32 {
        match self {
            // Amount errors: 1xxx
            Error::InvalidAmount { .. } => 1001,
            Error::InsufficientBalance { .. } => 1002,
            Error::BelowMinimum { .. } => 1003,

            // Position errors: 2xxx
            Error::PositionNotFound(_) => 2001,
            Error::PositionAlreadyExists(_) => 2002,
            Error::PositionNotActive(_) => 2003,
            Error::PositionHealthy(_) => 2004,
            Error::CollateralRatioTooLow { .. } => 2005,
            Error::LastPosition(_) => 2006,
            Error::PendingRewardsNotApplied(_) => 2007,

            // Ledger errors: 3xxx
            Error::InvariantViolation(_) => 3001,
            Error::Overflow { .. } => 3002,
            Error::Underflow { .. } => 3003,

            // Configuration errors: 4xxx
            Error::InvalidParameter { .. } => 4001,
            Error::Config(_) => 4002,

            // Persistence errors: 5xxx
            Error::Serialization(_) => 5001,
            Error::Deserialization(_) => 5002,
            Error::Storage(_) => 5003,
            Error::StateNotFound(_) => 5004,

            // Internal errors: 9xxx
            Error::Internal(_) => 9001,
            Error::Lock => 9002,
        }
    }
}

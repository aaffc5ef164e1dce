//! Replayable ledger scenarios.
//!
//! A scenario is a JSON file of steps written in human units: accounts by
//! name, amounts as decimals, positions by a label bound when they are
//! opened. Steps turn into [`LedgerOperation`]s and run one at a time;
//! `expect_*` steps check the ledger instead of changing it.
//!
//! ```json
//! {
//!   "name": "three depositors",
//!   "steps": [
//!     { "action": "price", "price": "120" },
//!     { "action": "deposit", "account": "carol", "amount": "10000" },
//!     { "action": "open", "account": "vic", "label": "v", "collateral": "200", "debt": "20000" },
//!     { "action": "price", "price": "100" },
//!     { "action": "liquidate", "position": "v" },
//!     { "action": "expect_deposit", "account": "carol", "amount": "3333.33", "tolerance": "0.01" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::core::amount::{CollateralAmount, RewardAmount, TokenAmount};
use crate::core::config::ProtocolParams;
use crate::error::Error as LedgerError;
use crate::protocol::operations::{LedgerOperation, OperationOutcome};
use crate::protocol::state_machine::Protocol;
use crate::storage::backend::StorageBackend;
use crate::utils::hash::{AccountId, PositionId};

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Scenario failures
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// File could not be read
    #[error("Cannot read scenario: {0}")]
    Io(String),

    /// File is not a valid scenario
    #[error("Invalid scenario: {0}")]
    Parse(String),

    /// Step refers to a position label never opened
    #[error("Step {step}: unknown position '{reference}'")]
    UnknownPosition {
        /// Step index, zero-based
        step: usize,
        /// Label or id as written
        reference: String,
    },

    /// Step rejected by the ledger
    #[error("Step {step} ({action}): {source}")]
    Ledger {
        /// Step index, zero-based
        step: usize,
        /// Step action name
        action: &'static str,
        /// Ledger error
        #[source]
        source: LedgerError,
    },

    /// Expectation did not hold
    #[error("Step {step}: expected {expected}, found {actual}")]
    Expectation {
        /// Step index, zero-based
        step: usize,
        /// Expected value
        expected: String,
        /// Observed value
        actual: String,
    },
}

/// Scenario result
pub type ScenarioResult<T> = std::result::Result<T, ScenarioError>;

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIO FORMAT
// ═══════════════════════════════════════════════════════════════════════════════

/// A named list of steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Params used when the scenario creates a fresh ledger
    #[serde(default)]
    pub params: Option<ProtocolParams>,
    /// Steps in order
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Parse from JSON text
    pub fn from_json(json: &str) -> ScenarioResult<Self> {
        serde_json::from_str(json).map_err(|e| ScenarioError::Parse(e.to_string()))
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> ScenarioResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ScenarioError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if there is nothing to run
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One scenario step, amounts in whole-token decimals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Move to a block height
    Block {
        /// Height
        height: u64,
    },
    /// Set the collateral price, stable tokens per collateral token
    Price {
        /// Price
        price: String,
    },
    /// Deposit into the Stability Pool
    Deposit {
        /// Depositor name
        account: String,
        /// Stable amount
        amount: String,
    },
    /// Withdraw from the Stability Pool; everything when no amount is given
    Withdraw {
        /// Depositor name
        account: String,
        /// Stable amount
        #[serde(default)]
        amount: Option<String>,
    },
    /// Claim pool gains
    Claim {
        /// Depositor name
        account: String,
    },
    /// Spread reward tokens over depositors
    Reward {
        /// Reward amount
        amount: String,
    },
    /// Open a position and bind it to a label
    Open {
        /// Owner name
        account: String,
        /// Label later steps use
        label: String,
        /// Collateral amount
        collateral: String,
        /// Debt amount
        debt: String,
    },
    /// Add collateral
    AddCollateral {
        /// Label or hex id
        position: String,
        /// Collateral amount
        amount: String,
    },
    /// Withdraw collateral
    WithdrawCollateral {
        /// Label or hex id
        position: String,
        /// Collateral amount
        amount: String,
    },
    /// Draw more debt
    Borrow {
        /// Label or hex id
        position: String,
        /// Stable amount
        amount: String,
    },
    /// Repay debt
    Repay {
        /// Label or hex id
        position: String,
        /// Stable amount
        amount: String,
    },
    /// Close a position
    Close {
        /// Label or hex id
        position: String,
    },
    /// Liquidate one position
    Liquidate {
        /// Label or hex id
        position: String,
    },
    /// Liquidate everything below the minimum ratio
    LiquidateAll,
    /// Check a compounded deposit
    ExpectDeposit {
        /// Depositor name
        account: String,
        /// Expected stable amount
        amount: String,
        /// Allowed absolute difference
        #[serde(default)]
        tolerance: Option<String>,
    },
    /// Check a pending collateral gain
    ExpectCollateralGain {
        /// Depositor name
        account: String,
        /// Expected collateral amount
        amount: String,
        /// Allowed absolute difference
        #[serde(default)]
        tolerance: Option<String>,
    },
}

impl Step {
    /// Action name as written in the file
    pub fn action(&self) -> &'static str {
        match self {
            Step::Block { .. } => "block",
            Step::Price { .. } => "price",
            Step::Deposit { .. } => "deposit",
            Step::Withdraw { .. } => "withdraw",
            Step::Claim { .. } => "claim",
            Step::Reward { .. } => "reward",
            Step::Open { .. } => "open",
            Step::AddCollateral { .. } => "add_collateral",
            Step::WithdrawCollateral { .. } => "withdraw_collateral",
            Step::Borrow { .. } => "borrow",
            Step::Repay { .. } => "repay",
            Step::Close { .. } => "close",
            Step::Liquidate { .. } => "liquidate",
            Step::LiquidateAll => "liquidate_all",
            Step::ExpectDeposit { .. } => "expect_deposit",
            Step::ExpectCollateralGain { .. } => "expect_collateral_gain",
        }
    }
}

/// What one executed step produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    /// Step index, zero-based
    pub index: usize,
    /// Step action name
    pub action: &'static str,
    /// Ledger outcome; `None` for checks
    pub outcome: Option<OperationOutcome>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNNER
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs steps against a protocol, tracking position labels
#[derive(Debug, Default)]
pub struct ScenarioRunner {
    labels: HashMap<String, PositionId>,
}

impl ScenarioRunner {
    /// Create a runner with no labels bound
    pub fn new() -> Self {
        Self::default()
    }

    /// Position bound to a label
    pub fn label(&self, label: &str) -> Option<PositionId> {
        self.labels.get(label).copied()
    }

    /// Translate a step into a ledger operation; `None` for checks
    pub fn operation(&self, index: usize, step: &Step) -> ScenarioResult<Option<LedgerOperation>> {
        let ledger = |source| ScenarioError::Ledger {
            step: index,
            action: step.action(),
            source,
        };
        let position = |reference: &str| self.resolve(index, reference);

        let op = match step {
            Step::Block { height } => LedgerOperation::AdvanceBlock { height: *height },
            Step::Price { price } => LedgerOperation::SetPrice {
                price: TokenAmount::parse(price).map_err(ledger)?.units(),
            },
            Step::Deposit { account, amount } => LedgerOperation::Deposit {
                depositor: AccountId::from_name(account),
                amount: TokenAmount::parse(amount).map_err(ledger)?,
            },
            Step::Withdraw { account, amount: Some(amount) } => LedgerOperation::Withdraw {
                depositor: AccountId::from_name(account),
                amount: TokenAmount::parse(amount).map_err(ledger)?,
            },
            Step::Withdraw { account, amount: None } => LedgerOperation::WithdrawAll {
                depositor: AccountId::from_name(account),
            },
            Step::Claim { account } => LedgerOperation::ClaimGains {
                depositor: AccountId::from_name(account),
            },
            Step::Reward { amount } => LedgerOperation::IssueReward {
                amount: RewardAmount::parse(amount).map_err(ledger)?,
            },
            Step::Open { account, collateral, debt, .. } => LedgerOperation::OpenPosition {
                owner: AccountId::from_name(account),
                collateral: CollateralAmount::parse(collateral).map_err(ledger)?,
                debt: TokenAmount::parse(debt).map_err(ledger)?,
            },
            Step::AddCollateral { position: p, amount } => LedgerOperation::AddCollateral {
                position: position(p)?,
                amount: CollateralAmount::parse(amount).map_err(ledger)?,
            },
            Step::WithdrawCollateral { position: p, amount } => {
                LedgerOperation::WithdrawCollateral {
                    position: position(p)?,
                    amount: CollateralAmount::parse(amount).map_err(ledger)?,
                }
            }
            Step::Borrow { position: p, amount } => LedgerOperation::Borrow {
                position: position(p)?,
                amount: TokenAmount::parse(amount).map_err(ledger)?,
            },
            Step::Repay { position: p, amount } => LedgerOperation::Repay {
                position: position(p)?,
                amount: TokenAmount::parse(amount).map_err(ledger)?,
            },
            Step::Close { position: p } => LedgerOperation::ClosePosition { position: position(p)? },
            Step::Liquidate { position: p } => LedgerOperation::Liquidate { position: position(p)? },
            Step::LiquidateAll => LedgerOperation::LiquidateAll,
            Step::ExpectDeposit { .. } | Step::ExpectCollateralGain { .. } => return Ok(None),
        };
        Ok(Some(op))
    }

    /// Run one step
    pub fn apply<B: StorageBackend>(
        &mut self,
        protocol: &mut Protocol<B>,
        index: usize,
        step: &Step,
    ) -> ScenarioResult<StepReport> {
        let ledger = |source| ScenarioError::Ledger {
            step: index,
            action: step.action(),
            source,
        };

        let outcome = match self.operation(index, step)? {
            Some(op) => {
                let outcome = protocol.execute(op).map_err(ledger)?;
                if let (Step::Open { label, .. }, OperationOutcome::Opened(id)) = (step, &outcome) {
                    self.labels.insert(label.clone(), *id);
                }
                Some(outcome)
            }
            None => {
                self.check(protocol, index, step)?;
                None
            }
        };

        Ok(StepReport {
            index,
            action: step.action(),
            outcome,
        })
    }

    /// Run every step, stopping at the first failure
    pub fn run<B: StorageBackend>(
        &mut self,
        protocol: &mut Protocol<B>,
        scenario: &Scenario,
        mut on_step: impl FnMut(&StepReport),
    ) -> ScenarioResult<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(scenario.len());
        for (index, step) in scenario.steps.iter().enumerate() {
            let report = self.apply(protocol, index, step)?;
            on_step(&report);
            reports.push(report);
        }
        tracing::info!(name = %scenario.name, steps = reports.len(), "scenario complete");
        Ok(reports)
    }

    fn resolve(&self, index: usize, reference: &str) -> ScenarioResult<PositionId> {
        self.label(reference)
            .or_else(|| PositionId::from_hex(reference).ok())
            .ok_or_else(|| ScenarioError::UnknownPosition {
                step: index,
                reference: reference.to_string(),
            })
    }

    fn check<B: StorageBackend>(
        &self,
        protocol: &Protocol<B>,
        index: usize,
        step: &Step,
    ) -> ScenarioResult<()> {
        let ledger = |source| ScenarioError::Ledger {
            step: index,
            action: step.action(),
            source,
        };

        let (expected, actual, tolerance) = match step {
            Step::ExpectDeposit { account, amount, tolerance } => {
                let actual = protocol
                    .compounded_deposit(&AccountId::from_name(account))
                    .map_err(ledger)?;
                let expected = TokenAmount::parse(amount).map_err(ledger)?;
                let tolerance = tolerance
                    .as_deref()
                    .map(TokenAmount::parse)
                    .transpose()
                    .map_err(ledger)?
                    .unwrap_or_default();
                (expected.units(), actual.units(), tolerance.units())
            }
            Step::ExpectCollateralGain { account, amount, tolerance } => {
                let actual = protocol
                    .depositor_gains(&AccountId::from_name(account))
                    .map_err(ledger)?
                    .collateral_gain;
                let expected = CollateralAmount::parse(amount).map_err(ledger)?;
                let tolerance = tolerance
                    .as_deref()
                    .map(CollateralAmount::parse)
                    .transpose()
                    .map_err(ledger)?
                    .unwrap_or_default();
                (expected.units(), actual.units(), tolerance.units())
            }
            _ => return Ok(()),
        };

        if expected.abs_diff(actual) > tolerance {
            return Err(ScenarioError::Expectation {
                step: index,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

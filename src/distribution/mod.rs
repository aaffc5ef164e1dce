//! Scalable reward distribution without iteration.
//!
//! Both ledgers follow the same shape: a global accumulator that moves in
//! O(1) per event, and per-participant snapshots of it. A participant's
//! entitlement is always derived from its stake and the distance between
//! its snapshot and the current accumulator, so no event ever touches
//! another participant's record.
//!
//! - [`ErrorFeedback`]: per-unit division that carries rounding dust
//!   into the next event
//! - [`EpochScaleSums`]: the `(epoch, scale) -> sum` map of the pool
//! - [`Accumulator`] / [`Participant`]: the shared snapshot contract

pub mod epoch_scale;
pub mod error_feedback;

pub use epoch_scale::EpochScaleSums;
pub use error_feedback::{ErrorFeedback, PerUnitShare};

use crate::error::Result;

/// Global accumulator state participants checkpoint against
pub trait Accumulator {
    /// Snapshot of the accumulator stored on each participant
    type Snapshot: Clone;

    /// What a participant has accrued since its snapshot
    type Pending;

    /// Capture the current accumulator values
    fn current_snapshot(&self) -> Self::Snapshot;

    /// Entitlement of `stake` accrued since `snapshot`
    ///
    /// Always computed fresh from the current global state.
    fn pending(&self, stake: u64, snapshot: &Self::Snapshot) -> Result<Self::Pending>;
}

/// An entity holding a stake and a snapshot of some accumulator
pub trait Participant {
    /// Snapshot type, matching the accumulator's
    type Snapshot;

    /// Stake the accumulator's per-unit values are multiplied by
    fn stake(&self) -> u64;

    /// Snapshot taken at the last checkpoint
    fn snapshot(&self) -> &Self::Snapshot;

    /// Replace the snapshot
    fn set_snapshot(&mut self, snapshot: Self::Snapshot);
}

/// Pending entitlement of `participant` against `accumulator`
pub fn pending_for<A, P>(accumulator: &A, participant: &P) -> Result<A::Pending>
where
    A: Accumulator,
    P: Participant<Snapshot = A::Snapshot>,
{
    accumulator.pending(participant.stake(), participant.snapshot())
}

/// Refresh `participant`'s snapshot to the current accumulator state
pub fn checkpoint<A, P>(accumulator: &A, participant: &mut P)
where
    A: Accumulator,
    P: Participant<Snapshot = A::Snapshot>,
{
    participant.set_snapshot(accumulator.current_snapshot());
}

//! Cumulative sums keyed by `(epoch, scale)`.
//!
//! Only the latest epoch and its latest scale are ever written; older
//! entries are frozen once the pool moves past them but stay readable,
//! since depositors with old snapshots still collect gains from them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::math::U256;

/// Append-only `(epoch, scale) -> sum` map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochScaleSums {
    epochs: Vec<Vec<U256>>,
}

impl Default for EpochScaleSums {
    fn default() -> Self {
        Self {
            epochs: vec![vec![U256::zero()]],
        }
    }
}

impl EpochScaleSums {
    /// Sum at `(epoch, scale)`; zero for entries never written
    pub fn get(&self, epoch: u64, scale: u64) -> U256 {
        self.epochs
            .get(epoch as usize)
            .and_then(|scales| scales.get(scale as usize))
            .copied()
            .unwrap_or_else(U256::zero)
    }

    /// Latest epoch that has an entry
    pub fn latest_epoch(&self) -> u64 {
        (self.epochs.len() as u64).saturating_sub(1)
    }

    /// Number of scales recorded for `epoch`
    pub fn scales_in(&self, epoch: u64) -> usize {
        self.epochs.get(epoch as usize).map_or(0, Vec::len)
    }

    /// Whether `(epoch, scale)` is the latest slot or directly after it
    pub fn can_write(&self, epoch: u64, scale: u64) -> bool {
        let (e, s) = (epoch as usize, scale as usize);
        let last = self.epochs.len() - 1;
        if e == last {
            let len = self.epochs[last].len();
            s + 1 == len || s == len
        } else {
            e == last + 1 && s == 0
        }
    }

    /// Write the sum at the latest slot, or open the next one
    ///
    /// A new scale is appended to the latest epoch; a new epoch starts at
    /// scale 0. Anything else would rewrite history and is refused.
    pub fn set(&mut self, epoch: u64, scale: u64, sum: U256) -> Result<()> {
        if !self.can_write(epoch, scale) {
            return Err(Error::InvariantViolation(format!(
                "sum write at epoch {} scale {} out of order (latest epoch {}, {} scales)",
                epoch,
                scale,
                self.latest_epoch(),
                self.scales_in(self.latest_epoch())
            )));
        }

        let e = epoch as usize;
        if e == self.epochs.len() {
            self.epochs.push(vec![sum]);
            return Ok(());
        }

        let scales = &mut self.epochs[e];
        if scale as usize == scales.len() {
            scales.push(sum);
        } else {
            scales[scale as usize] = sum;
        }
        Ok(())
    }

    /// Total number of stored sums
    pub fn len(&self) -> usize {
        self.epochs.iter().map(Vec::len).sum()
    }

    /// Always false; the map starts with the `(0, 0)` slot
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_origin_slot() {
        let sums = EpochScaleSums::default();
        assert_eq!(sums.get(0, 0), U256::zero());
        assert_eq!(sums.len(), 1);
        assert_eq!(sums.latest_epoch(), 0);
    }

    #[test]
    fn test_missing_entries_read_zero() {
        let sums = EpochScaleSums::default();
        assert_eq!(sums.get(0, 1), U256::zero());
        assert_eq!(sums.get(7, 3), U256::zero());
    }

    #[test]
    fn test_append_scale_then_epoch() {
        let mut sums = EpochScaleSums::default();
        sums.set(0, 0, U256::from(5u64)).unwrap();
        sums.set(0, 1, U256::from(6u64)).unwrap();
        sums.set(1, 0, U256::zero()).unwrap();
        sums.set(1, 0, U256::from(9u64)).unwrap();

        assert_eq!(sums.get(0, 0), U256::from(5u64));
        assert_eq!(sums.get(0, 1), U256::from(6u64));
        assert_eq!(sums.get(1, 0), U256::from(9u64));
        assert_eq!(sums.len(), 3);
    }

    #[test]
    fn test_rewriting_history_is_refused() {
        let mut sums = EpochScaleSums::default();
        sums.set(0, 1, U256::one()).unwrap();
        sums.set(1, 0, U256::one()).unwrap();

        assert!(matches!(
            sums.set(0, 1, U256::zero()),
            Err(Error::InvariantViolation(_))
        ));
        assert!(sums.set(1, 2, U256::one()).is_err());
        assert!(sums.set(3, 0, U256::one()).is_err());
        assert!(sums.set(2, 1, U256::one()).is_err());
    }
}

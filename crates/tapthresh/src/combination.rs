//! k-of-n subset enumeration.
//!
//! Every script leaf of a policy is bound to one k-element subset of the
//! (sorted) signer set. Subsets are produced in lexicographic order so that
//! two policies built from the same key set always line up leaf for leaf.

use serde::{Deserialize, Serialize};

use crate::error::ThreshError;

/// Default ceiling on C(n, k).
pub const DEFAULT_MAX_COMBINATIONS: u64 = 1_000_000;

/// A strictly increasing sequence of 0-based signer indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Combination(Vec<usize>);

impl Combination {
    /// Build a combination, rejecting sequences that are not strictly increasing.
    pub fn new(indices: Vec<usize>) -> Result<Self, ThreshError> {
        if indices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ThreshError::InvalidPolicy(format!(
                "combination {:?} is not strictly increasing",
                indices
            )));
        }
        Ok(Self(indices))
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, signer: usize) -> bool {
        self.0.binary_search(&signer).is_ok()
    }

    /// Position of `signer` inside this combination.
    pub fn position_of(&self, signer: usize) -> Option<usize> {
        self.0.binary_search(&signer).ok()
    }

    /// True if every index of this combination appears in `signers` (sorted).
    pub fn is_within(&self, signers: &[usize]) -> bool {
        self.0.iter().all(|i| signers.binary_search(i).is_ok())
    }

    /// True if every index of `signers` (sorted) appears in this combination.
    pub fn covers(&self, signers: &[usize]) -> bool {
        signers.iter().all(|i| self.contains(*i))
    }

    fn complement(&self, n: usize) -> Combination {
        Combination((0..n).filter(|i| !self.contains(*i)).collect())
    }
}

/// Count C(n, k) by incremental multiplication.
///
/// Returns `None` when the result does not fit in a `u64`.
pub fn count_combinations(n: usize, k: usize) -> Option<u64> {
    if k > n {
        return Some(0);
    }
    let k = k.min(n - k);
    let mut acc: u128 = 1;
    for i in 0..k {
        // acc * (n - i) / (i + 1) is always an integer: acc is C(n, i) here.
        acc = acc.checked_mul((n - i) as u128)? / (i as u128 + 1);
        if acc > u64::MAX as u128 {
            return None;
        }
    }
    Some(acc as u64)
}

/// Enumerates k-subsets of `0..n` under a cardinality ceiling.
#[derive(Debug, Clone, Copy)]
pub struct CombinationEngine {
    max_combinations: u64,
}

impl Default for CombinationEngine {
    fn default() -> Self {
        Self {
            max_combinations: DEFAULT_MAX_COMBINATIONS,
        }
    }
}

impl CombinationEngine {
    pub fn new(max_combinations: u64) -> Self {
        Self { max_combinations }
    }

    pub fn max_combinations(&self) -> u64 {
        self.max_combinations
    }

    /// Generate every k-subset of `0..n` in lexicographic order.
    pub fn generate(&self, n: usize, k: usize) -> Result<Vec<Combination>, ThreshError> {
        if k == 0 || k > n {
            return Err(ThreshError::InvalidPolicy(format!(
                "threshold k = {} must be in [1, {}]",
                k, n
            )));
        }

        let count = count_combinations(n, k);
        let too_many = ThreshError::TooManyCombinations {
            n,
            k,
            count,
            limit: self.max_combinations,
        };
        let total = match count {
            Some(c) if c <= self.max_combinations => c,
            _ => return Err(too_many),
        };

        // The ceiling may exceed what this machine can hold.
        let capacity = usize::try_from(total).map_err(|_| too_many.clone())?;
        let mut out: Vec<Combination> = Vec::new();
        out.try_reserve_exact(capacity).map_err(|_| too_many)?;

        if k == n {
            out.push(Combination((0..n).collect()));
            return Ok(out);
        }

        let m = n - k;
        if k > m {
            // Complementation reverses lexicographic order.
            lexicographic(n, m, &mut out);
            for c in out.iter_mut() {
                *c = c.complement(n);
            }
            out.reverse();
            return Ok(out);
        }

        lexicographic(n, k, &mut out);
        Ok(out)
    }
}

/// Iterative lexicographic stepping over k-subsets of `0..n` (1 <= k < n).
fn lexicographic(n: usize, k: usize, out: &mut Vec<Combination>) {
    let mut current: Vec<usize> = (0..k).collect();

    loop {
        out.push(Combination(current.clone()));

        // Rightmost position that can still be advanced.
        let mut pos = k;
        while pos > 0 {
            pos -= 1;
            if current[pos] < n - k + pos {
                current[pos] += 1;
                for j in pos + 1..k {
                    current[j] = current[j - 1] + 1;
                }
                break;
            }
            if pos == 0 {
                return;
            }
        }
    }
}

//! Exact virtual-size estimation for key-path and script-path spends.
//!
//! Estimates are computed by attaching a synthetic witness of the exact shape
//! the signed transaction will carry (64-byte Schnorr signatures, the real
//! leaf script, the real control block) and measuring the serialized result.
//! Only the signature bytes are fake, so the estimate matches the broadcast
//! transaction byte for byte as long as the default sighash type is used.

use bitcoin::{Transaction, Witness};
use serde::Serialize;

use crate::error::ThreshError;
use crate::policy::{MultiSigPolicy, Scheme};

/// Length of a BIP-340 signature under `SIGHASH_DEFAULT`.
pub const SCHNORR_SIG_LEN: usize = 64;

/// Scale `size` by `(100 + pct) / 100`, rounding up.
pub fn buffered(size: u64, pct: u32) -> Result<u64, ThreshError> {
    if pct > 100 {
        return Err(ThreshError::InvalidBuffer(pct));
    }
    let scaled = (size as u128 * (100 + pct as u128)).div_ceil(100);
    Ok(scaled as u64)
}

/// Which way an input is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SpendPath {
    KeyPath,
    Leaf(usize),
}

/// Serialized size of one fully-witnessed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxSize {
    /// Bytes without witness data.
    pub base_size: usize,
    /// Bytes with witness data.
    pub total_size: usize,
}

impl TxSize {
    pub fn weight(&self) -> u64 {
        (3 * self.base_size + self.total_size) as u64
    }

    pub fn vsize(&self) -> u64 {
        self.weight().div_ceil(4)
    }

    pub fn buffered_vsize(&self, pct: u32) -> Result<u64, ThreshError> {
        buffered(self.vsize(), pct)
    }
}

/// Per-path sizes for one input of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeEstimate {
    pub input_index: usize,
    pub key_path: TxSize,
    /// Indexed by leaf index.
    pub leaves: Vec<TxSize>,
}

impl SizeEstimate {
    pub fn leaf(&self, leaf_index: usize) -> Result<&TxSize, ThreshError> {
        self.leaves.get(leaf_index).ok_or(ThreshError::LeafOutOfRange {
            leaf_index,
            leaves: self.leaves.len(),
        })
    }

    pub fn get(&self, path: SpendPath) -> Result<&TxSize, ThreshError> {
        match path {
            SpendPath::KeyPath => Ok(&self.key_path),
            SpendPath::Leaf(i) => self.leaf(i),
        }
    }

    pub fn buffered_vsize(&self, path: SpendPath, pct: u32) -> Result<u64, ThreshError> {
        self.get(path)?.buffered_vsize(pct)
    }
}

/// Size estimation over one policy.
pub struct SizeEstimator<'a> {
    policy: &'a MultiSigPolicy,
}

impl<'a> SizeEstimator<'a> {
    pub fn new(policy: &'a MultiSigPolicy) -> Self {
        Self { policy }
    }

    /// Sizes of `tx` when `input_index` is spent via the key path and via
    /// every leaf. Other inputs are measured with empty witnesses.
    pub fn estimate(
        &self,
        tx: &Transaction,
        input_index: usize,
    ) -> Result<SizeEstimate, ThreshError> {
        check_input(tx, input_index)?;
        let mut stripped = strip_witnesses(tx);

        let key_path = self.measure(&mut stripped, input_index, SpendPath::KeyPath)?;
        let leaves = (0..self.policy.leaves().len())
            .map(|i| self.measure(&mut stripped, input_index, SpendPath::Leaf(i)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SizeEstimate {
            input_index,
            key_path,
            leaves,
        })
    }

    /// Size of `tx` with `path` applied to every listed input.
    ///
    /// Inputs not listed keep an empty witness.
    pub fn estimate_transaction(
        &self,
        tx: &Transaction,
        paths: &[(usize, SpendPath)],
    ) -> Result<TxSize, ThreshError> {
        let mut stripped = strip_witnesses(tx);
        for (input_index, path) in paths {
            check_input(tx, *input_index)?;
            stripped.input[*input_index].witness = self.synthetic_witness(*path)?;
        }
        Ok(measure_tx(&stripped))
    }

    /// Leaf usable by `signers` with the smallest spend, ties to lowest index.
    ///
    /// MuSig2 leaves must match `signers` exactly. Threshold leaves qualify
    /// when they contain every one of `signers`.
    pub fn cheapest_leaf_for_signers(
        &self,
        tx: &Transaction,
        input_index: usize,
        signers: &[usize],
    ) -> Result<(usize, TxSize), ThreshError> {
        check_input(tx, input_index)?;
        let mut wanted = signers.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let scheme = self.policy.scheme();
        let mut stripped = strip_witnesses(tx);
        let mut best: Option<(usize, TxSize)> = None;

        for leaf in self.policy.leaves() {
            let eligible = match scheme {
                Scheme::MuSig2 => leaf.combination.indices() == wanted.as_slice(),
                Scheme::Threshold => leaf.combination.covers(&wanted),
            };
            if !eligible {
                continue;
            }
            let size = self.measure(&mut stripped, input_index, SpendPath::Leaf(leaf.index))?;
            if best.map_or(true, |(_, b)| size.vsize() < b.vsize()) {
                best = Some((leaf.index, size));
            }
        }

        best.ok_or(ThreshError::NoMatchingLeaf {
            signers: wanted,
            k: self.policy.threshold(),
        })
    }

    /// A witness with the exact item lengths of a real spend along `path`.
    pub fn synthetic_witness(&self, path: SpendPath) -> Result<Witness, ThreshError> {
        let dummy_sig = [0u8; SCHNORR_SIG_LEN];
        let mut witness = Witness::new();
        match path {
            SpendPath::KeyPath => witness.push(dummy_sig),
            SpendPath::Leaf(i) => {
                let leaf = self.policy.leaf(i)?;
                let sig_count = match self.policy.scheme() {
                    Scheme::Threshold => leaf.combination.len(),
                    Scheme::MuSig2 => 1,
                };
                for _ in 0..sig_count {
                    witness.push(dummy_sig);
                }
                witness.push(leaf.script.as_bytes());
                witness.push(self.policy.control_block(i)?.serialize());
            }
        }
        Ok(witness)
    }

    fn measure(
        &self,
        stripped: &mut Transaction,
        input_index: usize,
        path: SpendPath,
    ) -> Result<TxSize, ThreshError> {
        stripped.input[input_index].witness = self.synthetic_witness(path)?;
        let size = measure_tx(stripped);
        stripped.input[input_index].witness.clear();
        Ok(size)
    }
}

fn check_input(tx: &Transaction, input_index: usize) -> Result<(), ThreshError> {
    if input_index >= tx.input.len() {
        return Err(ThreshError::InputOutOfRange {
            input_index,
            inputs: tx.input.len(),
        });
    }
    Ok(())
}

fn strip_witnesses(tx: &Transaction) -> Transaction {
    let mut stripped = tx.clone();
    for input in &mut stripped.input {
        input.witness.clear();
    }
    stripped
}

fn measure_tx(tx: &Transaction) -> TxSize {
    TxSize {
        base_size: tx.base_size(),
        total_size: tx.total_size(),
    }
}

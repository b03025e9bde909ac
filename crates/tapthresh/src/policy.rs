//! k-of-n Taproot spending policies.
//!
//! # Taproot Structure
//!
//! ```text
//! Output key = taptweak(owner_key, merkle_root)
//!   Key path:    owner                       <- spends alone, any time
//!   Script path: one leaf per k-subset S of the signer set
//!     Threshold: <pk_1> CHECKSIG <pk_2> CHECKSIGADD ... <pk_k> CHECKSIGADD <k> NUMEQUAL
//!     MuSig2:    <KeyAgg(S)> CHECKSIG
//! ```
//!
//! Signer keys are sorted before subsets are enumerated, so the address only
//! depends on the key *set*. All leaves carry the same Huffman weight.

use std::fmt;

use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_NUMEQUAL};
use bitcoin::psbt::Psbt;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::taproot::{
    ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TapTweakHash, TaprootBuilder,
    TaprootSpendInfo,
};
use bitcoin::{Address, Network, ScriptBuf, Transaction, TxOut};
use musig2::KeyAggContext;
use serde::{Deserialize, Serialize};

use crate::combination::{Combination, CombinationEngine};
use crate::error::ThreshError;
use crate::musig;

/// How each script leaf is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// k individual Schnorr signatures, accumulated with `OP_CHECKSIGADD`.
    Threshold,
    /// One signature under the MuSig2 aggregate of the leaf's k keys.
    MuSig2,
}

impl Scheme {
    pub fn name(&self) -> &'static str {
        match self {
            Scheme::Threshold => "threshold",
            Scheme::MuSig2 => "musig2",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Scheme {
    type Err = ThreshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threshold" | "plain" | "multi_a" => Ok(Scheme::Threshold),
            "musig2" | "musig" => Ok(Scheme::MuSig2),
            other => Err(ThreshError::InvalidPolicy(format!("unknown scheme: {}", other))),
        }
    }
}

/// The owner key plus the canonically sorted, deduplicated signer keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerSet {
    owner: PublicKey,
    signers: Vec<PublicKey>,
}

impl SignerSet {
    pub fn new(
        owner: PublicKey,
        signers: impl IntoIterator<Item = PublicKey>,
    ) -> Result<Self, ThreshError> {
        let mut signers: Vec<PublicKey> = signers.into_iter().collect();
        signers.sort_by_key(|pk| pk.serialize());
        signers.dedup();

        if signers.is_empty() {
            return Err(ThreshError::InvalidPolicy("signer set is empty".into()));
        }

        let owner_xonly = owner.x_only_public_key().0;
        let mut xonly: Vec<XOnlyPublicKey> = Vec::with_capacity(signers.len());
        for pk in &signers {
            let x = pk.x_only_public_key().0;
            if x == owner_xonly {
                return Err(ThreshError::InvalidPolicy(format!(
                    "owner key {} is also a signer",
                    owner
                )));
            }
            xonly.push(x);
        }
        xonly.sort();
        if xonly.windows(2).any(|w| w[0] == w[1]) {
            return Err(ThreshError::InvalidPolicy(
                "two signer keys share an x-only coordinate".into(),
            ));
        }

        Ok(Self { owner, signers })
    }

    pub fn owner(&self) -> &PublicKey {
        &self.owner
    }

    pub fn owner_xonly(&self) -> XOnlyPublicKey {
        self.owner.x_only_public_key().0
    }

    /// Signer keys in canonical (sorted) order.
    pub fn signers(&self) -> &[PublicKey] {
        &self.signers
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    /// Canonical index of a signer key.
    pub fn index_of(&self, pubkey: &PublicKey) -> Option<usize> {
        let needle = pubkey.serialize();
        self.signers
            .binary_search_by_key(&needle, |pk| pk.serialize())
            .ok()
    }
}

/// One committed script bound to one signer subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub index: usize,
    pub combination: Combination,
    pub script: ScriptBuf,
    pub leaf_hash: TapLeafHash,
    /// MuSig2 aggregate of the subset's keys (MuSig2 scheme only).
    pub aggregated_key: Option<XOnlyPublicKey>,
}

/// An immutable k-of-n spending policy anchored at the owner's key.
#[derive(Debug, Clone)]
pub struct MultiSigPolicy {
    signer_set: SignerSet,
    threshold: usize,
    scheme: Scheme,
    network: Network,
    leaves: Vec<Leaf>,
    spend_info: TaprootSpendInfo,
    address: Address,
}

impl MultiSigPolicy {
    /// Build the script tree for `signer_set` at threshold `k`.
    pub fn build(
        signer_set: SignerSet,
        k: usize,
        scheme: Scheme,
        network: Network,
        engine: &CombinationEngine,
    ) -> Result<Self, ThreshError> {
        let n = signer_set.len();
        if k == 0 || k > n {
            return Err(ThreshError::InvalidPolicy(format!(
                "threshold k = {} must be in [1, {}]",
                k, n
            )));
        }

        let combinations = engine.generate(n, k)?;
        let mut leaves = Vec::with_capacity(combinations.len());
        for (index, combination) in combinations.into_iter().enumerate() {
            let keys: Vec<PublicKey> = combination
                .indices()
                .iter()
                .map(|i| signer_set.signers[*i])
                .collect();

            let (script, aggregated_key) = match scheme {
                Scheme::Threshold => {
                    let xonly: Vec<XOnlyPublicKey> =
                        keys.iter().map(|pk| pk.x_only_public_key().0).collect();
                    (threshold_script(&xonly, k), None)
                }
                Scheme::MuSig2 => {
                    let (_, agg) = musig::key_agg(&keys)?;
                    (musig_script(&agg), Some(agg))
                }
            };

            let leaf_hash = TapLeafHash::from_script(&script, LeafVersion::TapScript);
            leaves.push(Leaf {
                index,
                combination,
                script,
                leaf_hash,
                aggregated_key,
            });
        }

        let secp = Secp256k1::new();
        let internal_key = signer_set.owner_xonly();
        let spend_info = build_taproot_tree(&secp, internal_key, &leaves)?;
        let address = Address::p2tr(&secp, internal_key, spend_info.merkle_root(), network);

        log::info!(
            "built {}-of-{} {} policy: {} leaves, address {}",
            k,
            n,
            scheme,
            leaves.len(),
            address
        );

        Ok(Self {
            signer_set,
            threshold: k,
            scheme,
            network,
            leaves,
            spend_info,
            address,
        })
    }

    pub fn signer_set(&self) -> &SignerSet {
        &self.signer_set
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn signer_count(&self) -> usize {
        self.signer_set.len()
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// The single commitment-output address for this policy.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    /// Leaf scripts in leaf-index order.
    pub fn scripts(&self) -> impl Iterator<Item = &ScriptBuf> {
        self.leaves.iter().map(|l| &l.script)
    }

    pub fn leaf(&self, leaf_index: usize) -> Result<&Leaf, ThreshError> {
        self.leaves
            .get(leaf_index)
            .ok_or(ThreshError::LeafOutOfRange {
                leaf_index,
                leaves: self.leaves.len(),
            })
    }

    pub fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.spend_info.internal_key()
    }

    pub fn merkle_root(&self) -> Option<TapNodeHash> {
        self.spend_info.merkle_root()
    }

    /// The tweak applied to the owner's key for key-path spending.
    pub fn owner_tweak(&self) -> TapTweakHash {
        self.spend_info.tap_tweak()
    }

    pub fn output_key(&self) -> XOnlyPublicKey {
        self.spend_info.output_key().to_x_only_public_key()
    }

    /// Control block proving `leaf_index` is committed in the output key.
    pub fn control_block(&self, leaf_index: usize) -> Result<ControlBlock, ThreshError> {
        let leaf = self.leaf(leaf_index)?;
        self.spend_info
            .control_block(&(leaf.script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| {
                ThreshError::Taproot(format!("control block not found for leaf {}", leaf_index))
            })
    }

    /// Key aggregation context of a MuSig2 leaf, keys in canonical order.
    pub fn key_agg_context(&self, leaf_index: usize) -> Result<KeyAggContext, ThreshError> {
        if self.scheme != Scheme::MuSig2 {
            return Err(ThreshError::WrongScheme { expected: "musig2" });
        }
        let keys: Vec<PublicKey> = self
            .leaf(leaf_index)?
            .combination
            .indices()
            .iter()
            .map(|i| self.signer_set.signers[*i])
            .collect();
        let (ctx, _) = musig::key_agg(&keys)?;
        Ok(ctx)
    }

    pub fn signer_index(&self, pubkey: &PublicKey) -> Option<usize> {
        self.signer_set.index_of(pubkey)
    }

    pub fn signer_pubkey(&self, signer_index: usize) -> Option<&PublicKey> {
        self.signer_set.signers.get(signer_index)
    }

    /// Map keys to sorted, deduplicated signer indices.
    pub fn resolve_participants(&self, keys: &[PublicKey]) -> Result<Vec<usize>, ThreshError> {
        let mut indices = keys
            .iter()
            .map(|pk| {
                self.signer_index(pk)
                    .ok_or_else(|| ThreshError::UnknownSigner(pk.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    /// Leaves whose subset includes `signer_index`.
    pub fn leaves_containing(&self, signer_index: usize) -> impl Iterator<Item = &Leaf> {
        self.leaves
            .iter()
            .filter(move |l| l.combination.contains(signer_index))
    }

    /// Leaves whose subset lies entirely inside `participants` (sorted).
    pub fn leaves_within<'a>(&'a self, participants: &'a [usize]) -> impl Iterator<Item = &'a Leaf> {
        self.leaves
            .iter()
            .filter(move |l| l.combination.is_within(participants))
    }

    /// The leaf bound to exactly `signers` (sorted indices).
    pub fn leaf_for_signers(&self, signers: &[usize]) -> Result<&Leaf, ThreshError> {
        if signers.len() == self.threshold {
            // Leaves are lexicographic, so an exact subset can be binary searched.
            if let Ok(pos) = self
                .leaves
                .binary_search_by(|l| l.combination.indices().cmp(signers))
            {
                return Ok(&self.leaves[pos]);
            }
        }
        Err(ThreshError::NoMatchingLeaf {
            signers: signers.to_vec(),
            k: self.threshold,
        })
    }

    /// Export an unsigned PSBT for third-party wallets.
    ///
    /// Every input carries the owner's internal key and the merkle root so
    /// the key path can be signed independently. With `leaf` set, the leaf's
    /// script and control block are attached as well.
    pub fn to_psbt(
        &self,
        tx: &Transaction,
        prevouts: &[TxOut],
        leaf: Option<usize>,
    ) -> Result<Psbt, ThreshError> {
        if prevouts.len() != tx.input.len() {
            return Err(ThreshError::Transaction(format!(
                "{} prevouts for {} inputs",
                prevouts.len(),
                tx.input.len()
            )));
        }

        let mut psbt = Psbt::from_unsigned_tx(tx.clone())
            .map_err(|e| ThreshError::Transaction(format!("PSBT creation failed: {}", e)))?;

        let tap_script = match leaf {
            Some(i) => Some((
                self.control_block(i)?,
                (self.leaf(i)?.script.clone(), LeafVersion::TapScript),
            )),
            None => None,
        };

        let own_script = self.script_pubkey();
        for (i, prevout) in prevouts.iter().enumerate() {
            psbt.inputs[i].witness_utxo = Some(prevout.clone());
            if prevout.script_pubkey != own_script {
                continue;
            }
            psbt.inputs[i].tap_internal_key = Some(self.internal_key());
            psbt.inputs[i].tap_merkle_root = self.merkle_root();
            if let Some((control_block, script)) = &tap_script {
                psbt.inputs[i]
                    .tap_scripts
                    .insert(control_block.clone(), script.clone());
            }
        }

        Ok(psbt)
    }
}

/// Step-by-step construction of a [`MultiSigPolicy`].
///
/// # Example
/// ```ignore
/// let policy = PolicyBuilder::new(owner_pk, Network::Regtest)
///     .signer(alice)
///     .signer(bob)
///     .signer(carol)
///     .threshold(2)
///     .scheme(Scheme::MuSig2)
///     .build()?;
/// ```
pub struct PolicyBuilder {
    owner: PublicKey,
    network: Network,
    signers: Vec<PublicKey>,
    threshold: Option<usize>,
    scheme: Scheme,
    engine: CombinationEngine,
}

impl PolicyBuilder {
    pub fn new(owner: PublicKey, network: Network) -> Self {
        Self {
            owner,
            network,
            signers: Vec::new(),
            threshold: None,
            scheme: Scheme::MuSig2,
            engine: CombinationEngine::default(),
        }
    }

    pub fn signer(mut self, key: PublicKey) -> Self {
        self.signers.push(key);
        self
    }

    pub fn signers(mut self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.signers.extend(keys);
        self
    }

    /// Required signer count. Defaults to all signers.
    pub fn threshold(mut self, k: usize) -> Self {
        self.threshold = Some(k);
        self
    }

    /// Leaf scheme. Defaults to MuSig2.
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn max_combinations(mut self, max: u64) -> Self {
        self.engine = CombinationEngine::new(max);
        self
    }

    pub fn engine(mut self, engine: CombinationEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn build(self) -> Result<MultiSigPolicy, ThreshError> {
        let signer_set = SignerSet::new(self.owner, self.signers)?;
        let k = self.threshold.unwrap_or(signer_set.len());
        MultiSigPolicy::build(signer_set, k, self.scheme, self.network, &self.engine)
    }
}

// --- Internal helpers ---

/// `<pk_1> CHECKSIG <pk_2> CHECKSIGADD ... <pk_k> CHECKSIGADD <k> NUMEQUAL`
///
/// `push_int` emits `OP_1..OP_16` for small k and a minimal number push otherwise.
fn threshold_script(keys: &[XOnlyPublicKey], k: usize) -> ScriptBuf {
    let mut builder = Builder::new();
    for (i, key) in keys.iter().enumerate() {
        builder = builder.push_x_only_key(key);
        builder = if i == 0 {
            builder.push_opcode(OP_CHECKSIG)
        } else {
            builder.push_opcode(OP_CHECKSIGADD)
        };
    }
    builder
        .push_int(k as i64)
        .push_opcode(OP_NUMEQUAL)
        .into_script()
}

fn musig_script(aggregated: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(aggregated)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

fn build_taproot_tree(
    secp: &Secp256k1<bitcoin::secp256k1::All>,
    internal_key: XOnlyPublicKey,
    leaves: &[Leaf],
) -> Result<TaprootSpendInfo, ThreshError> {
    let builder = TaprootBuilder::with_huffman_tree(leaves.iter().map(|l| (1u32, l.script.clone())))
        .map_err(|e| ThreshError::Taproot(format!("taproot builder error: {}", e)))?;

    builder
        .finalize(secp, internal_key)
        .map_err(|_| ThreshError::Taproot("taproot finalize failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_policy, make_spend, owner_keypair, signer_keypairs, test_keypair};

    fn build(k: usize, keys: Vec<PublicKey>, scheme: Scheme) -> MultiSigPolicy {
        PolicyBuilder::new(owner_keypair().1, Network::Regtest)
            .signers(keys)
            .threshold(k)
            .scheme(scheme)
            .build()
            .unwrap()
    }

    #[test]
    fn test_two_of_three_musig_policy() {
        let (policy, _) = make_policy(2, 3, Scheme::MuSig2);

        assert!(policy.address().to_string().starts_with("bcrt1p"));
        assert_eq!(policy.leaves().len(), 3);
        assert!(policy.merkle_root().is_some());
        for leaf in policy.leaves() {
            assert_eq!(leaf.combination.len(), 2);
            assert!(leaf.aggregated_key.is_some());
            // <32-byte push> OP_CHECKSIG
            assert_eq!(leaf.script.len(), 34);
        }
    }

    #[test]
    fn test_address_independent_of_signer_order() {
        for scheme in [Scheme::Threshold, Scheme::MuSig2] {
            let keys: Vec<PublicKey> = signer_keypairs(5).into_iter().map(|(_, pk)| pk).collect();
            let mut reversed = keys.clone();
            reversed.reverse();
            let mut rotated = keys.clone();
            rotated.rotate_left(2);

            let a = build(3, keys, scheme);
            let b = build(3, reversed, scheme);
            let c = build(3, rotated, scheme);

            assert_eq!(a.address(), b.address());
            assert_eq!(a.address(), c.address());
            let hashes = |p: &MultiSigPolicy| p.leaves().iter().map(|l| l.leaf_hash).collect::<Vec<_>>();
            assert_eq!(hashes(&a), hashes(&b));
            assert_eq!(hashes(&a), hashes(&c));
        }
    }

    #[test]
    fn test_schemes_produce_different_addresses() {
        let (a, _) = make_policy(2, 3, Scheme::Threshold);
        let (b, _) = make_policy(2, 3, Scheme::MuSig2);
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_threshold_leaf_is_multi_a() {
        use miniscript::{Miniscript, Tap};

        let (policy, _) = make_policy(2, 3, Scheme::Threshold);
        for leaf in policy.leaves() {
            let ms = Miniscript::<XOnlyPublicKey, Tap>::parse(&leaf.script).unwrap();
            assert!(
                ms.to_string().starts_with("multi_a(2,"),
                "unexpected leaf: {}",
                ms
            );
            let asm = leaf.script.to_asm_string();
            assert!(asm.contains("OP_CHECKSIGADD"), "{}", asm);
            assert!(asm.ends_with("OP_PUSHNUM_2 OP_NUMEQUAL"), "{}", asm);
        }
    }

    #[test]
    fn test_threshold_above_sixteen_uses_number_push() {
        let keys: Vec<PublicKey> = signer_keypairs(17).into_iter().map(|(_, pk)| pk).collect();
        let policy = build(17, keys, Scheme::Threshold);
        assert_eq!(policy.leaves().len(), 1);

        let bytes = policy.leaves()[0].script.as_bytes();
        let tail = &bytes[bytes.len() - 3..];
        // OP_PUSHBYTES_1 0x11 OP_NUMEQUAL
        assert_eq!(tail, &[0x01, 0x11, 0x9c]);
    }

    #[test]
    fn test_control_blocks_verify_against_output_key() {
        let (policy, _) = make_policy(3, 5, Scheme::MuSig2);
        let secp = Secp256k1::new();
        for leaf in policy.leaves() {
            let cb = policy.control_block(leaf.index).unwrap();
            assert!(cb.verify_taproot_commitment(&secp, policy.output_key(), &leaf.script));
        }
    }

    #[test]
    fn test_uniform_weights_balance_the_tree() {
        let (policy, _) = make_policy(2, 4, Scheme::MuSig2);
        // 6 leaves under equal weights: depths 2 or 3
        for leaf in policy.leaves() {
            let depth = policy.control_block(leaf.index).unwrap().merkle_branch.len();
            assert!((2..=3).contains(&depth), "leaf {} depth {}", leaf.index, depth);
        }
    }

    #[test]
    fn test_musig_leaf_key_matches_aggregate() {
        let (policy, _) = make_policy(2, 3, Scheme::MuSig2);
        for leaf in policy.leaves() {
            let keys: Vec<PublicKey> = leaf
                .combination
                .indices()
                .iter()
                .map(|i| *policy.signer_pubkey(*i).unwrap())
                .collect();
            let (_, agg) = musig::key_agg(&keys).unwrap();
            assert_eq!(leaf.aggregated_key, Some(agg));
        }
    }

    #[test]
    fn test_single_signer_single_leaf() {
        let keys = vec![test_keypair(50).1];
        let policy = build(1, keys, Scheme::MuSig2);
        assert_eq!(policy.leaves().len(), 1);
        assert_eq!(policy.control_block(0).unwrap().merkle_branch.len(), 0);
    }

    #[test]
    fn test_empty_signer_set_rejected() {
        let err = PolicyBuilder::new(owner_keypair().1, Network::Regtest)
            .threshold(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ThreshError::InvalidPolicy(_)));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let keys: Vec<PublicKey> = signer_keypairs(3).into_iter().map(|(_, pk)| pk).collect();
        for k in [0, 4] {
            let err = PolicyBuilder::new(owner_keypair().1, Network::Regtest)
                .signers(keys.clone())
                .threshold(k)
                .build()
                .unwrap_err();
            assert!(matches!(err, ThreshError::InvalidPolicy(_)), "k={}", k);
        }
    }

    #[test]
    fn test_owner_among_signers_rejected() {
        let err = PolicyBuilder::new(owner_keypair().1, Network::Regtest)
            .signer(owner_keypair().1)
            .signer(test_keypair(10).1)
            .threshold(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ThreshError::InvalidPolicy(_)));
    }

    #[test]
    fn test_duplicate_signers_collapsed() {
        let (_, pk) = test_keypair(10);
        let (_, pk2) = test_keypair(11);
        let policy = PolicyBuilder::new(owner_keypair().1, Network::Regtest)
            .signers([pk, pk2, pk])
            .threshold(2)
            .build()
            .unwrap();
        assert_eq!(policy.signer_count(), 2);
        assert_eq!(policy.leaves().len(), 1);
    }

    #[test]
    fn test_negated_signer_key_rejected() {
        let secp = Secp256k1::new();
        let (_, pk) = test_keypair(10);
        let negated = pk.negate(&secp);
        let err = PolicyBuilder::new(owner_keypair().1, Network::Regtest)
            .signers([pk, negated])
            .threshold(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ThreshError::InvalidPolicy(_)));
    }

    #[test]
    fn test_too_many_combinations_rejected() {
        let keys: Vec<PublicKey> = signer_keypairs(10).into_iter().map(|(_, pk)| pk).collect();
        let err = PolicyBuilder::new(owner_keypair().1, Network::Regtest)
            .signers(keys)
            .threshold(5)
            .max_combinations(100)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ThreshError::TooManyCombinations { n: 10, k: 5, count: Some(252), limit: 100 }
        ));
    }

    #[test]
    fn test_leaf_lookup_helpers() {
        let (policy, _) = make_policy(2, 4, Scheme::MuSig2);

        let leaf = policy.leaf_for_signers(&[1, 3]).unwrap();
        assert_eq!(leaf.combination.indices(), &[1, 3]);
        assert!(policy.leaf_for_signers(&[1]).is_err());
        assert!(policy.leaf_for_signers(&[0, 1, 2]).is_err());

        assert_eq!(policy.leaves_containing(0).count(), 3);
        assert_eq!(policy.leaves_within(&[0, 1, 2]).count(), 3);
    }

    #[test]
    fn test_resolve_participants() {
        let (policy, signers) = make_policy(2, 3, Scheme::MuSig2);
        let idx = policy
            .resolve_participants(&[signers[2].1, signers[0].1, signers[2].1])
            .unwrap();
        assert_eq!(idx.len(), 2);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));

        let stranger = test_keypair(99).1;
        assert!(matches!(
            policy.resolve_participants(&[stranger]),
            Err(ThreshError::UnknownSigner(_))
        ));
    }

    #[test]
    fn test_key_agg_context_requires_musig() {
        let (policy, _) = make_policy(2, 3, Scheme::Threshold);
        assert!(matches!(
            policy.key_agg_context(0),
            Err(ThreshError::WrongScheme { .. })
        ));
    }

    #[test]
    fn test_psbt_export_carries_internal_key_and_merkle_root() {
        let (policy, _) = make_policy(2, 3, Scheme::MuSig2);
        let (tx, prevouts) = make_spend(&policy);

        let psbt = policy.to_psbt(&tx, &prevouts, Some(1)).unwrap();
        let input = &psbt.inputs[0];
        assert_eq!(input.tap_internal_key, Some(owner_keypair().1.x_only_public_key().0));
        assert_eq!(input.tap_merkle_root, policy.merkle_root());
        assert_eq!(input.tap_scripts.len(), 1);
        assert_eq!(input.witness_utxo.as_ref(), Some(&prevouts[0]));

        let bare = policy.to_psbt(&tx, &prevouts, None).unwrap();
        assert!(bare.inputs[0].tap_scripts.is_empty());
    }
}

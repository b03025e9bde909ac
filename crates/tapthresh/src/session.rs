//! Multi-party signing of policy inputs.
//!
//! # Protocol
//!
//! ```text
//! MuSig2 leaves (two rounds):
//!   Created -> NoncesPending -> NoncesComplete -> PartiallySigned -> Complete -> Finalized
//!             generate_nonce /  add_nonces       sign / add_partial_signatures   finalize
//!
//! Threshold leaves (one round):
//!   Created -> PartiallySigned -> Complete -> Finalized
//!             sign / add_partial_signatures   finalize
//!
//! Key path:
//!   Created -> Finalized                      sign_with_owner
//! ```
//!
//! State is tracked per (input, leaf). Every leaf signs its own digest (the
//! leaf hash is part of the BIP-341 script-path sighash), so nonces and
//! signatures are never shared between leaves.
//!
//! Private nonces live in single-use slots: signing moves the nonce out of
//! its slot and leaves a `Consumed` marker, so a second `sign` for the same
//! (signer, leaf, input) fails instead of reusing it.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bitcoin::hashes::Hash as _;
use bitcoin::key::{Keypair, TapTweak as _};
use bitcoin::secp256k1::{schnorr, All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::TapLeafHash;
use bitcoin::{TapSighashType, Transaction, TxOut, Witness};
use musig2::{AggNonce, KeyAggContext, PubNonce};

use crate::bundle::{Contribution, NonceBundle, NonceEntry, PartialSignatureBundle, SignatureEntry};
use crate::error::ThreshError;
use crate::musig::{self, PrivateNonce};
use crate::policy::{Leaf, MultiSigPolicy, Scheme};
use crate::size::SpendPath;

/// Where one input stands in the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// Nothing recorded yet.
    Created,
    /// Some nonces known, no leaf has all of them.
    NoncesPending,
    /// These leaves have every nonce; nobody has signed yet.
    NoncesComplete(Vec<usize>),
    /// These leaves hold at least one contribution; none is complete.
    PartiallySigned(Vec<usize>),
    /// The lowest leaf with every contribution, ready to finalize.
    Complete(usize),
    Finalized(SpendPath),
}

/// Result of a successful [`SigningSession::sign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    /// Contributions produced, but no leaf is complete yet.
    Pending(PartialSignatureBundle),
    /// `leaf_index` is the lowest leaf that now has every contribution.
    Complete {
        leaf_index: usize,
        bundle: PartialSignatureBundle,
    },
}

impl SignOutcome {
    /// The contributions to broadcast to the other co-signers.
    pub fn bundle(&self) -> &PartialSignatureBundle {
        match self {
            SignOutcome::Pending(bundle) | SignOutcome::Complete { bundle, .. } => bundle,
        }
    }

    pub fn into_bundle(self) -> PartialSignatureBundle {
        match self {
            SignOutcome::Pending(bundle) | SignOutcome::Complete { bundle, .. } => bundle,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, SignOutcome::Complete { .. })
    }

    pub fn complete_leaf(&self) -> Option<usize> {
        match self {
            SignOutcome::Complete { leaf_index, .. } => Some(*leaf_index),
            SignOutcome::Pending(_) => None,
        }
    }
}

enum NonceSlot {
    Empty,
    Ready(PrivateNonce),
    Consumed,
}

/// Per (input, leaf) protocol state, indexed by position within the leaf.
struct LeafRound {
    digest: [u8; 32],
    key_agg: Option<KeyAggContext>,
    pub_nonces: Vec<Option<PubNonce>>,
    sec_nonces: Vec<NonceSlot>,
    contributions: Vec<Option<Contribution>>,
}

impl LeafRound {
    fn new(
        policy: &MultiSigPolicy,
        tx: &Transaction,
        prevouts: &[TxOut],
        input_index: usize,
        leaf_index: usize,
    ) -> Result<Self, ThreshError> {
        let leaf = policy.leaf(leaf_index)?;
        let digest = script_digest(tx, prevouts, input_index, leaf.leaf_hash)?;
        let key_agg = match policy.scheme() {
            Scheme::MuSig2 => Some(policy.key_agg_context(leaf_index)?),
            Scheme::Threshold => None,
        };
        let k = leaf.combination.len();
        Ok(Self {
            digest,
            key_agg,
            pub_nonces: vec![None; k],
            sec_nonces: (0..k).map(|_| NonceSlot::Empty).collect(),
            contributions: vec![None; k],
        })
    }

    fn has_nonces(&self) -> bool {
        self.pub_nonces.iter().any(Option::is_some)
    }

    fn nonces_complete(&self) -> bool {
        self.pub_nonces.iter().all(Option::is_some)
    }

    fn has_contributions(&self) -> bool {
        self.contributions.iter().any(Option::is_some)
    }

    fn is_complete(&self) -> bool {
        self.contributions.iter().all(Option::is_some)
    }

    fn agg_nonce(&self) -> Option<AggNonce> {
        let nonces: Option<Vec<PubNonce>> = self.pub_nonces.iter().cloned().collect();
        nonces.map(|n| musig::aggregate_nonces(&n))
    }

    /// Drop every unspent private nonce. Dropping zeroizes it.
    fn discard(&mut self) {
        for slot in &mut self.sec_nonces {
            if matches!(slot, NonceSlot::Ready(_)) {
                *slot = NonceSlot::Consumed;
            }
        }
    }
}

#[derive(Default)]
struct InputState {
    rounds: BTreeMap<usize, LeafRound>,
    finalized: Option<SpendPath>,
}

/// Signing state for one transaction spending one or more policy outputs.
pub struct SigningSession {
    policy: Arc<MultiSigPolicy>,
    tx: Transaction,
    prevouts: Vec<TxOut>,
    participants: Option<Vec<usize>>,
    inputs: Vec<InputState>,
    secp: Secp256k1<All>,
}

impl fmt::Debug for SigningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSession")
            .field("txid", &self.tx.compute_txid())
            .field("inputs", &self.inputs.len())
            .field("participants", &self.participants)
            .finish_non_exhaustive()
    }
}

impl SigningSession {
    /// `prevouts[i]` is the output spent by `tx.input[i]`.
    pub fn new(
        policy: Arc<MultiSigPolicy>,
        tx: Transaction,
        prevouts: Vec<TxOut>,
    ) -> Result<Self, ThreshError> {
        if prevouts.len() != tx.input.len() {
            return Err(ThreshError::Transaction(format!(
                "{} prevouts for {} inputs",
                prevouts.len(),
                tx.input.len()
            )));
        }
        let inputs = (0..tx.input.len()).map(|_| InputState::default()).collect();
        log::debug!(
            "signing session for {} ({} inputs)",
            tx.compute_txid(),
            tx.input.len()
        );
        Ok(Self {
            policy,
            tx,
            prevouts,
            participants: None,
            inputs,
            secp: Secp256k1::new(),
        })
    }

    /// Only work on leaves made entirely of these signers.
    pub fn with_participants(self, keys: &[PublicKey]) -> Result<Self, ThreshError> {
        let indices = self.policy.resolve_participants(keys)?;
        self.with_participant_indices(indices)
    }

    pub fn with_participant_indices(mut self, mut indices: Vec<usize>) -> Result<Self, ThreshError> {
        indices.sort_unstable();
        indices.dedup();
        if let Some(bad) = indices.iter().find(|i| **i >= self.policy.signer_count()) {
            return Err(ThreshError::UnknownSigner(format!("signer index {}", bad)));
        }
        if indices.len() < self.policy.threshold() {
            return Err(ThreshError::NoMatchingLeaf {
                signers: indices,
                k: self.policy.threshold(),
            });
        }
        self.participants = Some(indices);
        Ok(self)
    }

    pub fn policy(&self) -> &Arc<MultiSigPolicy> {
        &self.policy
    }

    pub fn participants(&self) -> Option<&[usize]> {
        self.participants.as_deref()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn into_transaction(self) -> Transaction {
        self.tx
    }

    pub fn prevouts(&self) -> &[TxOut] {
        &self.prevouts
    }

    /// Script-path digest signed for `leaf_index` on `input_index`.
    pub fn digest(&self, input_index: usize, leaf_index: usize) -> Result<[u8; 32], ThreshError> {
        self.check_input(input_index)?;
        let leaf = self.policy.leaf(leaf_index)?;
        script_digest(&self.tx, &self.prevouts, input_index, leaf.leaf_hash)
    }

    // ─── Round 1: nonces ────────────────────────────────────────────────────

    /// Create this signer's nonces for every eligible MuSig2 leaf of an input.
    ///
    /// Nonces are created once per (signer, leaf, input); calling again
    /// re-announces the same public nonces.
    pub fn generate_nonce(
        &mut self,
        signer: &SecretKey,
        input_index: usize,
    ) -> Result<NonceBundle, ThreshError> {
        self.generate_nonces_within(signer, input_index, None)
    }

    /// Like [`generate_nonce`](Self::generate_nonce), limited to leaves drawn
    /// from `participants` (at least k keys).
    pub fn generate_nonce_for(
        &mut self,
        signer: &SecretKey,
        input_index: usize,
        participants: &[PublicKey],
    ) -> Result<NonceBundle, ThreshError> {
        let indices = self.policy.resolve_participants(participants)?;
        if indices.len() < self.policy.threshold() {
            return Err(ThreshError::NoMatchingLeaf {
                signers: indices,
                k: self.policy.threshold(),
            });
        }
        self.generate_nonces_within(signer, input_index, Some(&indices))
    }

    fn generate_nonces_within(
        &mut self,
        seckey: &SecretKey,
        input_index: usize,
        restrict: Option<&[usize]>,
    ) -> Result<NonceBundle, ThreshError> {
        self.require_scheme(Scheme::MuSig2)?;
        self.check_input(input_index)?;
        let signer = self.signer_of(seckey)?;
        let leaves = self.candidate_leaves(signer, restrict);
        if leaves.is_empty() {
            return Err(self.no_leaf_error(signer));
        }

        let mut bundle = NonceBundle::new(input_index);
        for leaf_index in leaves {
            let pos = self.position_in_leaf(leaf_index, signer)?;
            let round = round_mut(
                &mut self.inputs,
                &self.policy,
                &self.tx,
                &self.prevouts,
                input_index,
                leaf_index,
            )?;

            if matches!(round.sec_nonces[pos], NonceSlot::Empty) {
                if round.pub_nonces[pos].is_some() {
                    // Someone already announced a nonce for this signer.
                    return Err(ThreshError::DuplicateNonce {
                        input_index,
                        leaf_index,
                        signer_index: signer,
                    });
                }
                let ctx = round
                    .key_agg
                    .as_ref()
                    .ok_or(ThreshError::WrongScheme { expected: "musig2" })?;
                let (secret, public) = musig::generate_nonce(seckey, ctx, &round.digest)?;
                round.sec_nonces[pos] = NonceSlot::Ready(secret);
                round.pub_nonces[pos] = Some(public);
            }

            if let Some(public) = &round.pub_nonces[pos] {
                bundle.entries.push(NonceEntry {
                    leaf_index,
                    signer_index: signer,
                    digest: round.digest,
                    pub_nonce: public.clone(),
                });
            }
        }

        log::debug!(
            "input {}: signer {} announced nonces for {} leaves",
            input_index,
            signer,
            bundle.entries.len()
        );
        Ok(bundle)
    }

    /// Merge public nonces received from other co-signers.
    ///
    /// Returns the leaves that became nonce-complete with this bundle.
    /// Re-delivering an identical nonce is a no-op; a different nonce for a
    /// slot that is already filled is rejected.
    pub fn add_nonces(&mut self, bundle: &NonceBundle) -> Result<Vec<usize>, ThreshError> {
        self.require_scheme(Scheme::MuSig2)?;
        let input_index = bundle.input_index;
        self.check_input(input_index)?;

        // Validate everything before merging anything.
        let mut seen: BTreeMap<(usize, usize), &PubNonce> = BTreeMap::new();
        for entry in &bundle.entries {
            let pos = self.position_in_leaf(entry.leaf_index, entry.signer_index)?;
            let conflict = ThreshError::DuplicateNonce {
                input_index,
                leaf_index: entry.leaf_index,
                signer_index: entry.signer_index,
            };
            match seen.entry((entry.leaf_index, entry.signer_index)) {
                Entry::Occupied(e) if **e.get() != entry.pub_nonce => return Err(conflict),
                Entry::Occupied(_) => {}
                Entry::Vacant(e) => {
                    e.insert(&entry.pub_nonce);
                }
            }
            let round = round_mut(
                &mut self.inputs,
                &self.policy,
                &self.tx,
                &self.prevouts,
                input_index,
                entry.leaf_index,
            )?;
            if round.digest != entry.digest {
                return Err(ThreshError::DigestMismatch {
                    input_index,
                    leaf_index: entry.leaf_index,
                });
            }
            if let Some(existing) = &round.pub_nonces[pos] {
                if *existing != entry.pub_nonce {
                    return Err(conflict);
                }
            }
        }

        let mut completed = Vec::new();
        for entry in &bundle.entries {
            let pos = self.position_in_leaf(entry.leaf_index, entry.signer_index)?;
            let round = round_mut(
                &mut self.inputs,
                &self.policy,
                &self.tx,
                &self.prevouts,
                input_index,
                entry.leaf_index,
            )?;
            if round.pub_nonces[pos].is_some() {
                continue;
            }
            round.pub_nonces[pos] = Some(entry.pub_nonce.clone());
            if round.nonces_complete() {
                completed.push(entry.leaf_index);
            }
        }

        completed.sort_unstable();
        completed.dedup();
        if !completed.is_empty() {
            log::debug!("input {}: leaves {:?} nonce-complete", input_index, completed);
        }
        Ok(completed)
    }

    // ─── Round 2: signatures ────────────────────────────────────────────────

    /// Sign every eligible leaf of an input with `signer`.
    ///
    /// MuSig2: signs each leaf whose nonces are complete and whose private
    /// nonce for this signer is still unspent. Fails with `NoncesIncomplete`
    /// if no such leaf exists, or `NonceConsumed` if every candidate nonce was
    /// already spent.
    ///
    /// Threshold: signs each leaf containing the signer. Signing again
    /// re-announces the existing signatures.
    pub fn sign(&mut self, signer: &SecretKey, input_index: usize) -> Result<SignOutcome, ThreshError> {
        self.check_input(input_index)?;
        let signer_index = self.signer_of(signer)?;
        let leaves = self.candidate_leaves(signer_index, None);
        if leaves.is_empty() {
            return Err(self.no_leaf_error(signer_index));
        }

        let bundle = match self.policy.scheme() {
            Scheme::Threshold => self.sign_threshold(signer, signer_index, input_index, &leaves)?,
            Scheme::MuSig2 => self.sign_musig(signer, signer_index, input_index, &leaves)?,
        };

        log::debug!(
            "input {}: signer {} contributed to {} leaves",
            input_index,
            signer_index,
            bundle.entries.len()
        );
        Ok(match self.complete_leaf(input_index) {
            Some(leaf_index) => SignOutcome::Complete { leaf_index, bundle },
            None => SignOutcome::Pending(bundle),
        })
    }

    fn sign_threshold(
        &mut self,
        seckey: &SecretKey,
        signer: usize,
        input_index: usize,
        leaves: &[usize],
    ) -> Result<PartialSignatureBundle, ThreshError> {
        let keypair = Keypair::from_secret_key(&self.secp, seckey);
        let mut bundle = PartialSignatureBundle::new(input_index);

        for &leaf_index in leaves {
            let pos = self.position_in_leaf(leaf_index, signer)?;
            let round = round_mut(
                &mut self.inputs,
                &self.policy,
                &self.tx,
                &self.prevouts,
                input_index,
                leaf_index,
            )?;
            let contribution = match round.contributions[pos] {
                Some(existing) => existing,
                None => {
                    let msg = Message::from_digest(round.digest);
                    let sig = Contribution::Schnorr(self.secp.sign_schnorr(&msg, &keypair));
                    round.contributions[pos] = Some(sig);
                    sig
                }
            };
            bundle.entries.push(SignatureEntry {
                leaf_index,
                signer_index: signer,
                digest: round.digest,
                contribution,
            });
        }
        Ok(bundle)
    }

    fn sign_musig(
        &mut self,
        seckey: &SecretKey,
        signer: usize,
        input_index: usize,
        leaves: &[usize],
    ) -> Result<PartialSignatureBundle, ThreshError> {
        let mut bundle = PartialSignatureBundle::new(input_index);
        let mut spent: Option<usize> = None;

        for &leaf_index in leaves {
            let pos = self.position_in_leaf(leaf_index, signer)?;
            let round = round_mut(
                &mut self.inputs,
                &self.policy,
                &self.tx,
                &self.prevouts,
                input_index,
                leaf_index,
            )?;
            if !round.nonces_complete() {
                continue;
            }

            // Take the nonce out first: it is spent even if signing fails.
            let nonce = match std::mem::replace(&mut round.sec_nonces[pos], NonceSlot::Consumed) {
                NonceSlot::Ready(nonce) => nonce,
                NonceSlot::Consumed => {
                    spent.get_or_insert(leaf_index);
                    continue;
                }
                NonceSlot::Empty => {
                    round.sec_nonces[pos] = NonceSlot::Empty;
                    continue;
                }
            };

            let ctx = round
                .key_agg
                .as_ref()
                .ok_or(ThreshError::WrongScheme { expected: "musig2" })?;
            let agg_nonce = round.agg_nonce().ok_or(ThreshError::NoncesIncomplete {
                input_index,
                signer_index: signer,
            })?;
            let partial = musig::partial_sign(seckey, nonce, ctx, &agg_nonce, &round.digest)?;
            round.contributions[pos] = Some(Contribution::MuSig(partial));

            bundle.entries.push(SignatureEntry {
                leaf_index,
                signer_index: signer,
                digest: round.digest,
                contribution: Contribution::MuSig(partial),
            });
        }

        if bundle.is_empty() {
            return Err(match spent {
                Some(leaf_index) => ThreshError::NonceConsumed {
                    input_index,
                    leaf_index,
                    signer_index: signer,
                },
                None => ThreshError::NoncesIncomplete {
                    input_index,
                    signer_index: signer,
                },
            });
        }
        Ok(bundle)
    }

    /// Merge and verify contributions from other co-signers.
    ///
    /// Every entry is checked before any is merged, so a rejected bundle
    /// leaves the session untouched. Returns the lowest complete leaf, if any.
    pub fn add_partial_signatures(
        &mut self,
        bundle: &PartialSignatureBundle,
    ) -> Result<Option<usize>, ThreshError> {
        let input_index = bundle.input_index;
        self.check_input(input_index)?;
        let scheme = self.policy.scheme();

        let mut accepted: BTreeMap<(usize, usize), (usize, Contribution)> = BTreeMap::new();
        for entry in &bundle.entries {
            let pos = self.position_in_leaf(entry.leaf_index, entry.signer_index)?;
            let signer_pk = *self
                .policy
                .signer_pubkey(entry.signer_index)
                .ok_or_else(|| ThreshError::UnknownSigner(format!("signer index {}", entry.signer_index)))?;
            let conflict = ThreshError::DuplicateContribution {
                input_index,
                leaf_index: entry.leaf_index,
                signer_index: entry.signer_index,
            };
            let round = round_mut(
                &mut self.inputs,
                &self.policy,
                &self.tx,
                &self.prevouts,
                input_index,
                entry.leaf_index,
            )?;

            if round.digest != entry.digest {
                return Err(ThreshError::DigestMismatch {
                    input_index,
                    leaf_index: entry.leaf_index,
                });
            }
            if let Some((_, earlier)) = accepted.get(&(entry.leaf_index, entry.signer_index)) {
                if *earlier != entry.contribution {
                    return Err(conflict);
                }
                continue;
            }
            if let Some(existing) = round.contributions[pos] {
                if existing == entry.contribution {
                    continue;
                }
                return Err(conflict);
            }

            let valid = match (scheme, &entry.contribution) {
                (Scheme::Threshold, Contribution::Schnorr(sig)) => {
                    let msg = Message::from_digest(round.digest);
                    let xonly = signer_pk.x_only_public_key().0;
                    self.secp.verify_schnorr(sig, &msg, &xonly).is_ok()
                }
                (Scheme::MuSig2, Contribution::MuSig(partial)) => {
                    let ctx = round
                        .key_agg
                        .as_ref()
                        .ok_or(ThreshError::WrongScheme { expected: "musig2" })?;
                    let agg_nonce = round.agg_nonce().ok_or(ThreshError::NoncesIncomplete {
                        input_index,
                        signer_index: entry.signer_index,
                    })?;
                    match &round.pub_nonces[pos] {
                        Some(signer_nonce) => musig::verify_partial_signature(
                            ctx,
                            partial,
                            &agg_nonce,
                            &signer_pk,
                            signer_nonce,
                            &round.digest,
                        ),
                        None => false,
                    }
                }
                (Scheme::Threshold, Contribution::MuSig(_)) => {
                    return Err(ThreshError::WrongScheme { expected: "musig2" })
                }
                (Scheme::MuSig2, Contribution::Schnorr(_)) => {
                    return Err(ThreshError::WrongScheme { expected: "threshold" })
                }
            };

            if !valid {
                log::warn!(
                    "input {}: rejected contribution from signer {} for leaf {}",
                    input_index,
                    entry.signer_index,
                    entry.leaf_index
                );
                return Err(ThreshError::InvalidContribution {
                    input_index,
                    leaf_index: entry.leaf_index,
                    signer_index: entry.signer_index,
                });
            }
            accepted.insert((entry.leaf_index, entry.signer_index), (pos, entry.contribution));
        }

        for ((leaf_index, _), (pos, contribution)) in accepted {
            let round = round_mut(
                &mut self.inputs,
                &self.policy,
                &self.tx,
                &self.prevouts,
                input_index,
                leaf_index,
            )?;
            round.contributions[pos] = Some(contribution);
        }

        Ok(self.complete_leaf(input_index))
    }

    // ─── Finalization ───────────────────────────────────────────────────────

    /// Write the witness for the lowest complete leaf into the input.
    ///
    /// Calling again after success returns the same path without changes.
    pub fn finalize(&mut self, input_index: usize) -> Result<SpendPath, ThreshError> {
        self.check_input(input_index)?;
        if let Some(path) = self.inputs[input_index].finalized {
            return Ok(path);
        }

        let (leaf_index, round) = self.inputs[input_index]
            .rounds
            .iter()
            .find(|(_, r)| r.is_complete())
            .ok_or(ThreshError::IncompleteSignature { input_index })?;
        let leaf_index = *leaf_index;
        let leaf = self.policy.leaf(leaf_index)?;

        let mut witness = Witness::new();
        match self.policy.scheme() {
            Scheme::Threshold => {
                // CHECKSIGADD chains pop the last key's signature first.
                for contribution in round.contributions.iter().rev() {
                    match contribution {
                        Some(Contribution::Schnorr(sig)) => witness.push(sig.serialize()),
                        _ => return Err(ThreshError::IncompleteSignature { input_index }),
                    }
                }
            }
            Scheme::MuSig2 => {
                let partials = round
                    .contributions
                    .iter()
                    .map(|c| match c {
                        Some(Contribution::MuSig(p)) => Ok(*p),
                        _ => Err(ThreshError::IncompleteSignature { input_index }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let ctx = round
                    .key_agg
                    .as_ref()
                    .ok_or(ThreshError::WrongScheme { expected: "musig2" })?;
                let agg_nonce = round
                    .agg_nonce()
                    .ok_or(ThreshError::IncompleteSignature { input_index })?;
                let sig = musig::aggregate_signatures(ctx, &agg_nonce, &partials, &round.digest)?;

                let agg_key = leaf
                    .aggregated_key
                    .ok_or_else(|| ThreshError::Taproot(format!("leaf {} has no aggregate key", leaf_index)))?;
                let schnorr_sig = schnorr::Signature::from_slice(&sig)
                    .map_err(|e| ThreshError::Musig(format!("aggregate signature: {}", e)))?;
                self.secp
                    .verify_schnorr(&schnorr_sig, &Message::from_digest(round.digest), &agg_key)
                    .map_err(|_| ThreshError::Musig("aggregate signature does not verify".into()))?;
                witness.push(sig);
            }
        }
        witness.push(leaf.script.as_bytes());
        witness.push(self.policy.control_block(leaf_index)?.serialize());

        log::info!(
            "input {}: finalized via leaf {} {:?}",
            input_index,
            leaf_index,
            leaf.combination.indices()
        );
        self.tx.input[input_index].witness = witness;
        self.mark_finalized(input_index, SpendPath::Leaf(leaf_index));
        Ok(SpendPath::Leaf(leaf_index))
    }

    /// Spend an input through the key path with the owner's key.
    pub fn sign_with_owner(&mut self, owner: &SecretKey, input_index: usize) -> Result<(), ThreshError> {
        self.check_input(input_index)?;
        let keypair = Keypair::from_secret_key(&self.secp, owner);
        if keypair.x_only_public_key().0 != self.policy.internal_key() {
            return Err(ThreshError::UnknownSigner(format!(
                "{} is not the policy owner",
                keypair.public_key()
            )));
        }

        let tweaked = keypair.tap_tweak(&self.secp, self.policy.merkle_root());
        let sighash = SighashCache::new(&self.tx)
            .taproot_key_spend_signature_hash(
                input_index,
                &Prevouts::All(&self.prevouts),
                TapSighashType::Default,
            )
            .map_err(|e| ThreshError::Transaction(e.to_string()))?;

        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = self.secp.sign_schnorr(&msg, &tweaked.to_inner());
        self.tx.input[input_index].witness = Witness::p2tr_key_spend(&bitcoin::taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        });
        self.mark_finalized(input_index, SpendPath::KeyPath);
        log::info!("input {}: finalized via owner key path", input_index);
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn phase(&self, input_index: usize) -> Result<SessionPhase, ThreshError> {
        self.check_input(input_index)?;
        let state = &self.inputs[input_index];
        if let Some(path) = state.finalized {
            return Ok(SessionPhase::Finalized(path));
        }
        if let Some(leaf) = self.complete_leaf(input_index) {
            return Ok(SessionPhase::Complete(leaf));
        }

        let signed: Vec<usize> = state
            .rounds
            .iter()
            .filter(|(_, r)| r.has_contributions())
            .map(|(i, _)| *i)
            .collect();
        if !signed.is_empty() {
            return Ok(SessionPhase::PartiallySigned(signed));
        }

        let ready: Vec<usize> = state
            .rounds
            .iter()
            .filter(|(_, r)| r.nonces_complete())
            .map(|(i, _)| *i)
            .collect();
        if !ready.is_empty() {
            return Ok(SessionPhase::NoncesComplete(ready));
        }
        if state.rounds.values().any(LeafRound::has_nonces) {
            return Ok(SessionPhase::NoncesPending);
        }
        Ok(SessionPhase::Created)
    }

    /// True when every input spending this policy has a witness.
    pub fn is_fully_signed(&self) -> bool {
        let own_script = self.policy.script_pubkey();
        self.inputs
            .iter()
            .zip(&self.prevouts)
            .filter(|(_, prevout)| prevout.script_pubkey == own_script)
            .all(|(state, _)| state.finalized.is_some())
    }

    /// Wipe every unspent private nonce in the session.
    pub fn discard_secrets(&mut self) {
        for state in &mut self.inputs {
            for round in state.rounds.values_mut() {
                round.discard();
            }
        }
    }

    // ─── Internal helpers ───────────────────────────────────────────────────

    fn require_scheme(&self, expected: Scheme) -> Result<(), ThreshError> {
        if self.policy.scheme() != expected {
            return Err(ThreshError::WrongScheme {
                expected: expected.name(),
            });
        }
        Ok(())
    }

    fn check_input(&self, input_index: usize) -> Result<(), ThreshError> {
        let prevout = self
            .prevouts
            .get(input_index)
            .ok_or(ThreshError::InputOutOfRange {
                input_index,
                inputs: self.prevouts.len(),
            })?;
        if prevout.script_pubkey != self.policy.script_pubkey() {
            return Err(ThreshError::ForeignInput(input_index));
        }
        Ok(())
    }

    fn signer_of(&self, seckey: &SecretKey) -> Result<usize, ThreshError> {
        let pubkey = seckey.public_key(&self.secp);
        self.policy
            .signer_index(&pubkey)
            .ok_or_else(|| ThreshError::UnknownSigner(pubkey.to_string()))
    }

    fn position_in_leaf(&self, leaf_index: usize, signer_index: usize) -> Result<usize, ThreshError> {
        self.policy
            .leaf(leaf_index)?
            .combination
            .position_of(signer_index)
            .ok_or_else(|| {
                ThreshError::UnknownSigner(format!(
                    "signer {} is not assigned to leaf {}",
                    signer_index, leaf_index
                ))
            })
    }

    fn candidate_leaves(&self, signer: usize, restrict: Option<&[usize]>) -> Vec<usize> {
        self.policy
            .leaves_containing(signer)
            .filter(|leaf| drawn_from(leaf, self.participants.as_deref()) && drawn_from(leaf, restrict))
            .map(|leaf| leaf.index)
            .collect()
    }

    fn no_leaf_error(&self, signer: usize) -> ThreshError {
        ThreshError::NoMatchingLeaf {
            signers: self.participants.clone().unwrap_or_else(|| vec![signer]),
            k: self.policy.threshold(),
        }
    }

    fn complete_leaf(&self, input_index: usize) -> Option<usize> {
        self.inputs[input_index]
            .rounds
            .iter()
            .find(|(_, r)| r.is_complete())
            .map(|(i, _)| *i)
    }

    fn mark_finalized(&mut self, input_index: usize, path: SpendPath) {
        let state = &mut self.inputs[input_index];
        state.finalized = Some(path);
        for round in state.rounds.values_mut() {
            round.discard();
        }
    }
}

fn drawn_from(leaf: &Leaf, participants: Option<&[usize]>) -> bool {
    participants.map_or(true, |p| leaf.combination.is_within(p))
}

fn round_mut<'s>(
    inputs: &'s mut [InputState],
    policy: &MultiSigPolicy,
    tx: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
    leaf_index: usize,
) -> Result<&'s mut LeafRound, ThreshError> {
    match inputs[input_index].rounds.entry(leaf_index) {
        Entry::Occupied(e) => Ok(e.into_mut()),
        Entry::Vacant(e) => {
            let round = LeafRound::new(policy, tx, prevouts, input_index, leaf_index)?;
            Ok(e.insert(round))
        }
    }
}

fn script_digest(
    tx: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
    leaf_hash: TapLeafHash,
) -> Result<[u8; 32], ThreshError> {
    let sighash = SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| ThreshError::Transaction(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

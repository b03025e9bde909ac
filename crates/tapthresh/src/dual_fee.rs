//! Paired base-fee / buffered-fee spends for a fixed participant set.
//!
//! Both transactions spend the same inputs and pay the same destination;
//! only the change output differs. Each gets its own [`SigningSession`]
//! because nonces are bound to the exact digest of one transaction. The two
//! conflict on every input, so at most one can ever confirm.

use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::error::ThreshError;
use crate::policy::MultiSigPolicy;
use crate::session::SigningSession;
use crate::size::{buffered, SizeEstimator, SpendPath};

/// Everything needed to plan one dual-fee spend.
#[derive(Debug, Clone)]
pub struct DualFeeRequest {
    /// Exactly k signer keys; selects the leaf.
    pub participants: Vec<PublicKey>,
    /// Policy coins to spend.
    pub utxos: Vec<(OutPoint, TxOut)>,
    pub destination: ScriptBuf,
    pub amount: Amount,
    pub change: ScriptBuf,
    pub fee_rate: FeeRate,
    /// Extra size margin for the buffered candidate, 0..=100.
    pub buffer_percent: u32,
}

/// One of the two candidate transactions.
#[derive(Debug)]
pub struct FeeCandidate {
    pub fee: Amount,
    /// Virtual size the fee was computed for.
    pub charged_vsize: u64,
    pub change: Amount,
    pub session: SigningSession,
}

#[derive(Debug)]
pub struct DualFeePlan {
    pub leaf_index: usize,
    pub participants: Vec<usize>,
    /// Exact virtual size of the signed spend.
    pub vsize: u64,
    pub base: FeeCandidate,
    pub buffered: FeeCandidate,
}

impl DualFeePlan {
    pub fn fee_difference(&self) -> Amount {
        self.buffered.fee - self.base.fee
    }
}

pub struct DualFeeTransactionBuilder {
    policy: Arc<MultiSigPolicy>,
}

impl DualFeeTransactionBuilder {
    pub fn new(policy: Arc<MultiSigPolicy>) -> Self {
        Self { policy }
    }

    pub fn build(&self, request: &DualFeeRequest) -> Result<DualFeePlan, ThreshError> {
        if request.buffer_percent > 100 {
            return Err(ThreshError::InvalidBuffer(request.buffer_percent));
        }
        if request.utxos.is_empty() {
            return Err(ThreshError::Transaction("no inputs to spend".into()));
        }

        let participants = self.policy.resolve_participants(&request.participants)?;
        let leaf_index = self.policy.leaf_for_signers(&participants)?.index;

        let own_script = self.policy.script_pubkey();
        if let Some(i) = request
            .utxos
            .iter()
            .position(|(_, txout)| txout.script_pubkey != own_script)
        {
            return Err(ThreshError::ForeignInput(i));
        }

        let payment_dust = request.destination.minimal_non_dust();
        if request.amount < payment_dust {
            return Err(ThreshError::DustOutput(request.amount.to_sat()));
        }

        let skeleton = skeleton_tx(request);
        let paths: Vec<(usize, SpendPath)> = (0..skeleton.input.len())
            .map(|i| (i, SpendPath::Leaf(leaf_index)))
            .collect();
        let vsize = SizeEstimator::new(&self.policy)
            .estimate_transaction(&skeleton, &paths)?
            .vsize();
        let buffered_vsize = buffered(vsize, request.buffer_percent)?;

        let prevouts: Vec<TxOut> = request.utxos.iter().map(|(_, txout)| txout.clone()).collect();
        let base = self.candidate(request, &skeleton, &prevouts, &participants, vsize)?;
        let buffered = self.candidate(request, &skeleton, &prevouts, &participants, buffered_vsize)?;

        log::info!(
            "dual-fee plan via leaf {} ({} vB): base fee {} sat, buffered fee {} sat (+{}%)",
            leaf_index,
            vsize,
            base.fee.to_sat(),
            buffered.fee.to_sat(),
            request.buffer_percent
        );

        Ok(DualFeePlan {
            leaf_index,
            participants,
            vsize,
            base,
            buffered,
        })
    }

    fn candidate(
        &self,
        request: &DualFeeRequest,
        skeleton: &Transaction,
        prevouts: &[TxOut],
        participants: &[usize],
        charged_vsize: u64,
    ) -> Result<FeeCandidate, ThreshError> {
        let fee = request
            .fee_rate
            .fee_vb(charged_vsize)
            .ok_or_else(|| ThreshError::Transaction("fee overflow".into()))?;
        let available: Amount = prevouts.iter().map(|txout| txout.value).sum();
        let required = request
            .amount
            .checked_add(fee)
            .ok_or_else(|| ThreshError::Transaction("amount overflow".into()))?;

        let change = available
            .checked_sub(required)
            .ok_or(ThreshError::InsufficientFunds {
                available: available.to_sat(),
                required: required.to_sat(),
            })?;
        if change < request.change.minimal_non_dust() {
            return Err(ThreshError::DustOutput(change.to_sat()));
        }

        let mut tx = skeleton.clone();
        tx.output[1].value = change;
        let session = SigningSession::new(self.policy.clone(), tx, prevouts.to_vec())?
            .with_participant_indices(participants.to_vec())?;

        Ok(FeeCandidate {
            fee,
            charged_vsize,
            change,
            session,
        })
    }
}

/// Payment first, change second; change value filled in per candidate.
fn skeleton_tx(request: &DualFeeRequest) -> Transaction {
    let input = request
        .utxos
        .iter()
        .map(|(outpoint, _)| TxIn {
            previous_output: *outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        })
        .collect();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output: vec![
            TxOut {
                value: request.amount,
                script_pubkey: request.destination.clone(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: request.change.clone(),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Scheme;
    use crate::test_utils::{make_policy, test_outpoint};

    fn request(policy: &MultiSigPolicy, participants: &[usize], value: u64) -> DualFeeRequest {
        DualFeeRequest {
            participants: participants
                .iter()
                .map(|i| *policy.signer_pubkey(*i).unwrap())
                .collect(),
            utxos: vec![(
                test_outpoint(0),
                TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: policy.script_pubkey(),
                },
            )],
            destination: policy.script_pubkey(),
            amount: Amount::from_sat(50_000),
            change: policy.script_pubkey(),
            fee_rate: FeeRate::from_sat_per_vb(10).unwrap(),
            buffer_percent: 50,
        }
    }

    #[test]
    fn test_three_of_five_half_buffer() {
        let (policy, _) = make_policy(3, 5, Scheme::MuSig2);
        let plan = DualFeeTransactionBuilder::new(policy.clone())
            .build(&request(&policy, &[0, 2, 4], 100_000))
            .unwrap();

        assert_eq!(plan.participants, vec![0, 2, 4]);
        assert_eq!(policy.leaves()[plan.leaf_index].combination.indices(), &[0, 2, 4]);
        assert_eq!(plan.base.fee, Amount::from_sat(10 * plan.vsize));

        // buffered fee is base + 50%, up to one vbyte of rounding
        let half = plan.base.fee.to_sat() / 2;
        let diff = plan.fee_difference().to_sat();
        assert!(diff >= half && diff <= half + 10, "diff {} half {}", diff, half);
        assert_eq!(plan.base.change - plan.buffered.change, plan.fee_difference());

        let base_tx = plan.base.session.transaction();
        let buffered_tx = plan.buffered.session.transaction();
        assert_eq!(base_tx.input, buffered_tx.input);
        assert_eq!(base_tx.output[0], buffered_tx.output[0]);
        assert_ne!(base_tx.compute_txid(), buffered_tx.compute_txid());
        assert_eq!(plan.base.session.participants(), Some(&[0usize, 2, 4][..]));
    }

    #[test]
    fn test_sessions_have_distinct_digests() {
        let (policy, _) = make_policy(3, 5, Scheme::MuSig2);
        let plan = DualFeeTransactionBuilder::new(policy.clone())
            .build(&request(&policy, &[0, 2, 4], 100_000))
            .unwrap();
        let a = plan.base.session.digest(0, plan.leaf_index).unwrap();
        let b = plan.buffered.session.digest(0, plan.leaf_index).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_zero_buffer_gives_equal_fees() {
        let (policy, _) = make_policy(2, 3, Scheme::Threshold);
        let mut req = request(&policy, &[0, 1], 100_000);
        req.buffer_percent = 0;
        let plan = DualFeeTransactionBuilder::new(policy.clone()).build(&req).unwrap();
        assert_eq!(plan.base.fee, plan.buffered.fee);
    }

    #[test]
    fn test_participant_count_must_be_k() {
        let (policy, _) = make_policy(3, 5, Scheme::MuSig2);
        let err = DualFeeTransactionBuilder::new(policy.clone())
            .build(&request(&policy, &[0, 2], 100_000))
            .unwrap_err();
        assert!(matches!(err, ThreshError::NoMatchingLeaf { k: 3, .. }));
    }

    #[test]
    fn test_buffer_out_of_range() {
        let (policy, _) = make_policy(2, 3, Scheme::MuSig2);
        let mut req = request(&policy, &[0, 1], 100_000);
        req.buffer_percent = 150;
        assert_eq!(
            DualFeeTransactionBuilder::new(policy.clone()).build(&req).unwrap_err(),
            ThreshError::InvalidBuffer(150)
        );
    }

    #[test]
    fn test_insufficient_funds() {
        let (policy, _) = make_policy(2, 3, Scheme::MuSig2);
        let err = DualFeeTransactionBuilder::new(policy.clone())
            .build(&request(&policy, &[0, 1], 50_500))
            .unwrap_err();
        assert!(matches!(err, ThreshError::InsufficientFunds { available: 50_500, .. }));
    }

    #[test]
    fn test_dust_change_rejected() {
        let (policy, _) = make_policy(2, 3, Scheme::MuSig2);
        let probe = DualFeeTransactionBuilder::new(policy.clone())
            .build(&request(&policy, &[0, 1], 100_000))
            .unwrap();
        // leave 100 sat of change on the base candidate
        let value = 50_000 + probe.base.fee.to_sat() + 100;
        let err = DualFeeTransactionBuilder::new(policy.clone())
            .build(&request(&policy, &[0, 1], value))
            .unwrap_err();
        assert!(matches!(err, ThreshError::DustOutput(_)));
    }

    #[test]
    fn test_foreign_utxo_rejected() {
        let (policy, _) = make_policy(2, 3, Scheme::MuSig2);
        let mut req = request(&policy, &[0, 1], 100_000);
        req.utxos[0].1.script_pubkey = ScriptBuf::new();
        assert_eq!(
            DualFeeTransactionBuilder::new(policy.clone()).build(&req).unwrap_err(),
            ThreshError::ForeignInput(0)
        );
    }
}

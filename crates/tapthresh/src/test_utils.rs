//! Shared test utilities.
//!
//! Deterministic keypairs, funding outpoints and small policies used across
//! the unit test modules.

use std::sync::Arc;

use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::{Transaction, TxIn, Version};
use bitcoin::{absolute, Amount, Network, OutPoint, ScriptBuf, Sequence, TxOut, Txid, Witness};

use crate::policy::{MultiSigPolicy, PolicyBuilder, Scheme};

/// Generate a deterministic keypair from a seed byte.
///
/// The secret key is `[0x01, 0x00, ..., 0x00, seed]` (32 bytes).
pub fn test_keypair(seed_byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut secret_bytes = [0u8; 32];
    secret_bytes[31] = seed_byte;
    secret_bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&secret_bytes).unwrap();
    let pk = sk.public_key(&secp);
    (sk, pk)
}

/// Owner keypair used by every test policy.
pub fn owner_keypair() -> (SecretKey, PublicKey) {
    test_keypair(1)
}

/// `n` signer keypairs, seeds 10, 11, ...
pub fn signer_keypairs(n: usize) -> Vec<(SecretKey, PublicKey)> {
    (0..n).map(|i| test_keypair(10 + i as u8)).collect()
}

/// Build a k-of-n regtest policy with the standard test keys.
pub fn make_policy(k: usize, n: usize, scheme: Scheme) -> (Arc<MultiSigPolicy>, Vec<(SecretKey, PublicKey)>) {
    let signers = signer_keypairs(n);
    let policy = PolicyBuilder::new(owner_keypair().1, Network::Regtest)
        .signers(signers.iter().map(|(_, pk)| *pk))
        .threshold(k)
        .scheme(scheme)
        .build()
        .unwrap();
    (Arc::new(policy), signers)
}

pub fn test_outpoint(vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([0xAB; 32]),
        vout,
    }
}

/// One-input, one-output spend of a 100k sat policy coin.
pub fn make_spend(policy: &MultiSigPolicy) -> (Transaction, Vec<TxOut>) {
    let prevout = TxOut {
        value: Amount::from_sat(100_000),
        script_pubkey: policy.script_pubkey(),
    };
    let tx = Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: test_outpoint(0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(99_000),
            script_pubkey: policy.script_pubkey(),
        }],
    };
    (tx, vec![prevout])
}

//! Error taxonomy shared by every module.
//!
//! Variants carry the parameters needed to debug a protocol run (k, n,
//! indices, session ids) and never any secret material.

use thiserror::Error;

use crate::store::SessionId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThreshError {
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error(
        "Too many combinations: C({n},{k}) = {} exceeds ceiling {limit}",
        count_label(.count)
    )]
    TooManyCombinations {
        n: usize,
        k: usize,
        /// `None` when the count overflowed before it could be completed.
        count: Option<u64>,
        limit: u64,
    },

    #[error("Unknown signer: {0}")]
    UnknownSigner(String),

    #[error("Nonces incomplete for input {input_index}: no leaf with signer {signer_index} has every nonce")]
    NoncesIncomplete {
        input_index: usize,
        signer_index: usize,
    },

    #[error("Incomplete signature for input {input_index}: no leaf has all of its contributions")]
    IncompleteSignature { input_index: usize },

    #[error("Private nonce already consumed: input {input_index}, leaf {leaf_index}, signer {signer_index}")]
    NonceConsumed {
        input_index: usize,
        leaf_index: usize,
        signer_index: usize,
    },

    #[error("Duplicate nonce: input {input_index}, leaf {leaf_index}, signer {signer_index}")]
    DuplicateNonce {
        input_index: usize,
        leaf_index: usize,
        signer_index: usize,
    },

    #[error("Duplicate contribution: input {input_index}, leaf {leaf_index}, signer {signer_index}")]
    DuplicateContribution {
        input_index: usize,
        leaf_index: usize,
        signer_index: usize,
    },

    #[error("Digest mismatch on input {input_index}, leaf {leaf_index}: peers are signing different transactions")]
    DigestMismatch {
        input_index: usize,
        leaf_index: usize,
    },

    #[error("Invalid contribution: input {input_index}, leaf {leaf_index}, signer {signer_index}")]
    InvalidContribution {
        input_index: usize,
        leaf_index: usize,
        signer_index: usize,
    },

    #[error("No leaf matches signers {signers:?} (k = {k})")]
    NoMatchingLeaf { signers: Vec<usize>, k: usize },

    #[error("Invalid buffer: {0}% is outside [0, 100]")]
    InvalidBuffer(u32),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Operation requires the {expected} scheme")]
    WrongScheme { expected: &'static str },

    #[error("Input {input_index} out of range ({inputs} inputs)")]
    InputOutOfRange { input_index: usize, inputs: usize },

    #[error("Input {0} does not spend this policy's output")]
    ForeignInput(usize),

    #[error("Leaf {leaf_index} out of range ({leaves} leaves)")]
    LeafOutOfRange { leaf_index: usize, leaves: usize },

    #[error("Insufficient funds: have {available} sat, need {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Output of {0} sat is below the dust limit")]
    DustOutput(u64),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("MuSig2 error: {0}")]
    Musig(String),

    #[error("Taproot construction failed: {0}")]
    Taproot(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn count_label(count: &Option<u64>) -> String {
    match count {
        Some(c) => c.to_string(),
        None => "more than u64::MAX".to_string(),
    }
}

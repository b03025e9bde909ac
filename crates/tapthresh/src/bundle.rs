//! Messages exchanged between co-signers.
//!
//! # Message Types
//!
//! - [`NonceBundle`]: round 1, public nonces for MuSig2 leaves
//! - [`PartialSignatureBundle`]: round 2, partial signatures (MuSig2) or
//!   per-leaf Schnorr signatures (threshold leaves)
//!
//! Both travel as opaque blobs: versioned JSON with a `msg_type` tag and
//! hex-encoded fields, wrapped in standard base64. Every entry carries the
//! signature digest it was produced for so that a receiver can detect a peer
//! signing a different transaction before mixing its data in.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::secp256k1::schnorr;
use musig2::{PartialSignature, PubNonce};
use serde::{Deserialize, Serialize};

use crate::error::ThreshError;
use crate::musig;

/// Current wire version.
pub const BUNDLE_VERSION: u8 = 1;

const NONCE_MSG_TYPE: &str = "nonce_bundle";
const SIG_MSG_TYPE: &str = "partial_signature_bundle";

// ─── Domain types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceEntry {
    pub leaf_index: usize,
    pub signer_index: usize,
    pub digest: [u8; 32],
    pub pub_nonce: PubNonce,
}

/// One signer's (or several signers') public nonces for one input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NonceBundle {
    pub input_index: usize,
    pub entries: Vec<NonceEntry>,
}

/// A signer's contribution to one leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    /// Full BIP-340 signature for a threshold leaf.
    Schnorr(schnorr::Signature),
    /// MuSig2 partial signature for an aggregated-key leaf.
    MuSig(PartialSignature),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEntry {
    pub leaf_index: usize,
    pub signer_index: usize,
    pub digest: [u8; 32],
    pub contribution: Contribution,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialSignatureBundle {
    pub input_index: usize,
    pub entries: Vec<SignatureEntry>,
}

impl NonceBundle {
    pub fn new(input_index: usize) -> Self {
        Self {
            input_index,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_blob(&self) -> Result<String, ThreshError> {
        let wire = NonceBundleMessage {
            version: BUNDLE_VERSION,
            msg_type: NONCE_MSG_TYPE.into(),
            input_index: self.input_index,
            entries: self
                .entries
                .iter()
                .map(|e| NonceEntryMessage {
                    leaf_index: e.leaf_index,
                    signer_index: e.signer_index,
                    digest: hex::encode(e.digest),
                    pub_nonce: hex::encode(musig::pubnonce_to_bytes(&e.pub_nonce)),
                })
                .collect(),
        };
        encode_blob(&wire)
    }

    pub fn from_blob(blob: &str) -> Result<Self, ThreshError> {
        let wire: NonceBundleMessage = decode_blob(blob)?;
        check_header(wire.version, &wire.msg_type, NONCE_MSG_TYPE)?;

        let entries = wire
            .entries
            .into_iter()
            .map(|e| {
                let nonce_bytes = hex::decode(&e.pub_nonce).map_err(|err| {
                    ThreshError::Serialization(format!("invalid pub_nonce hex: {}", err))
                })?;
                Ok(NonceEntry {
                    leaf_index: e.leaf_index,
                    signer_index: e.signer_index,
                    digest: decode_digest(&e.digest)?,
                    pub_nonce: musig::pubnonce_from_bytes(&nonce_bytes)?,
                })
            })
            .collect::<Result<Vec<_>, ThreshError>>()?;

        Ok(Self {
            input_index: wire.input_index,
            entries,
        })
    }
}

impl PartialSignatureBundle {
    pub fn new(input_index: usize) -> Self {
        Self {
            input_index,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_blob(&self) -> Result<String, ThreshError> {
        let wire = SignatureBundleMessage {
            version: BUNDLE_VERSION,
            msg_type: SIG_MSG_TYPE.into(),
            input_index: self.input_index,
            entries: self
                .entries
                .iter()
                .map(|e| {
                    let (kind, bytes) = match &e.contribution {
                        Contribution::Schnorr(sig) => (ContributionKind::Schnorr, sig.serialize().to_vec()),
                        Contribution::MuSig(partial) => (
                            ContributionKind::Musig2,
                            musig::partial_sig_to_bytes(partial).to_vec(),
                        ),
                    };
                    SignatureEntryMessage {
                        leaf_index: e.leaf_index,
                        signer_index: e.signer_index,
                        digest: hex::encode(e.digest),
                        kind,
                        signature: hex::encode(bytes),
                    }
                })
                .collect(),
        };
        encode_blob(&wire)
    }

    pub fn from_blob(blob: &str) -> Result<Self, ThreshError> {
        let wire: SignatureBundleMessage = decode_blob(blob)?;
        check_header(wire.version, &wire.msg_type, SIG_MSG_TYPE)?;

        let entries = wire
            .entries
            .into_iter()
            .map(|e| {
                let bytes = hex::decode(&e.signature).map_err(|err| {
                    ThreshError::Serialization(format!("invalid signature hex: {}", err))
                })?;
                let contribution = match e.kind {
                    ContributionKind::Schnorr => Contribution::Schnorr(
                        schnorr::Signature::from_slice(&bytes).map_err(|err| {
                            ThreshError::Serialization(format!("invalid schnorr sig: {}", err))
                        })?,
                    ),
                    ContributionKind::Musig2 => {
                        Contribution::MuSig(musig::partial_sig_from_bytes(&bytes)?)
                    }
                };
                Ok(SignatureEntry {
                    leaf_index: e.leaf_index,
                    signer_index: e.signer_index,
                    digest: decode_digest(&e.digest)?,
                    contribution,
                })
            })
            .collect::<Result<Vec<_>, ThreshError>>()?;

        Ok(Self {
            input_index: wire.input_index,
            entries,
        })
    }
}

// ─── Wire format ────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug)]
struct NonceBundleMessage {
    version: u8,
    msg_type: String,
    input_index: usize,
    entries: Vec<NonceEntryMessage>,
}

#[derive(Serialize, Deserialize, Debug)]
struct NonceEntryMessage {
    leaf_index: usize,
    signer_index: usize,
    /// Hex-encoded 32-byte signature digest
    digest: String,
    /// Hex-encoded 66-byte public nonce
    pub_nonce: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct SignatureBundleMessage {
    version: u8,
    msg_type: String,
    input_index: usize,
    entries: Vec<SignatureEntryMessage>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum ContributionKind {
    Schnorr,
    Musig2,
}

#[derive(Serialize, Deserialize, Debug)]
struct SignatureEntryMessage {
    leaf_index: usize,
    signer_index: usize,
    digest: String,
    kind: ContributionKind,
    /// 64-byte Schnorr signature or 32-byte partial signature, hex
    signature: String,
}

fn encode_blob<T: Serialize>(message: &T) -> Result<String, ThreshError> {
    let json =
        serde_json::to_vec(message).map_err(|e| ThreshError::Serialization(e.to_string()))?;
    Ok(BASE64.encode(json))
}

fn decode_blob<T: for<'de> Deserialize<'de>>(blob: &str) -> Result<T, ThreshError> {
    let json = BASE64
        .decode(blob.trim())
        .map_err(|e| ThreshError::Serialization(format!("invalid base64: {}", e)))?;
    serde_json::from_slice(&json).map_err(|e| ThreshError::Serialization(e.to_string()))
}

fn check_header(version: u8, msg_type: &str, expected: &str) -> Result<(), ThreshError> {
    if version != BUNDLE_VERSION {
        return Err(ThreshError::Serialization(format!(
            "unsupported version: {}",
            version
        )));
    }
    if msg_type != expected {
        return Err(ThreshError::Serialization(format!(
            "unexpected message type: {}",
            msg_type
        )));
    }
    Ok(())
}

fn decode_digest(hex_str: &str) -> Result<[u8; 32], ThreshError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ThreshError::Serialization(format!("invalid digest hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ThreshError::Serialization("digest must be 32 bytes".into()))
}

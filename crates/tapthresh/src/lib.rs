//! # tapthresh
//!
//! k-of-n threshold spending policies on a single Taproot output.
//!
//! The owner key is the Taproot internal key and can always spend through the
//! key path. Every k-element subset of the signer set gets its own script
//! leaf, so any k signers can spend through the script path. Two leaf schemes
//! share the same tree construction:
//!
//! - **Threshold**: `multi_a`-style leaf checked with `OP_CHECKSIGADD`,
//!   spent with k individual Schnorr signatures.
//! - **MuSig2**: the leaf key is the BIP-327 aggregate of its k signers,
//!   spent with one signature produced by a two-round protocol.
//!
//! # Flow
//!
//! ```text
//! CombinationEngine -> MultiSigPolicy -> SizeEstimator
//!                                     -> SigningSession -> DualFeeTransactionBuilder
//!                                          (held in a SessionStore when long-lived)
//! ```

pub mod bundle;
pub mod combination;
pub mod config;
pub mod dual_fee;
pub mod error;
pub mod musig;
pub mod policy;
pub mod session;
pub mod size;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use bundle::{Contribution, NonceBundle, NonceEntry, PartialSignatureBundle, SignatureEntry};
pub use combination::{count_combinations, Combination, CombinationEngine};
pub use config::Settings;
pub use dual_fee::{DualFeePlan, DualFeeRequest, DualFeeTransactionBuilder, FeeCandidate};
pub use error::ThreshError;
pub use policy::{Leaf, MultiSigPolicy, PolicyBuilder, Scheme, SignerSet};
pub use session::{SessionPhase, SignOutcome, SigningSession};
pub use size::{buffered, SizeEstimate, SizeEstimator, SpendPath, TxSize};
pub use store::{SessionId, SessionStore, SharedSession};

//! MuSig2 (BIP-327) primitives for aggregated-key script leaves.
//!
//! Bridges between `bitcoin`'s secp256k1 types and the musig2 crate's types
//! via byte serialization. Both use libsecp256k1 underneath.
//!
//! Leaf keys are never taproot-tweaked: an aggregated key only appears as the
//! `<key> OP_CHECKSIG` operand of a tapscript, so partial signatures are made
//! against the plain aggregate.

use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use musig2::{AggNonce, KeyAggContext, LiftedSignature, PartialSignature, PubNonce, SecNonce};
use zeroize::Zeroizing;

use crate::error::ThreshError;

// ─── Type conversion helpers ────────────────────────────────────────────────

fn pubkey_to_musig(pk: &PublicKey) -> Result<musig2::secp256k1::PublicKey, ThreshError> {
    musig2::secp256k1::PublicKey::from_slice(&pk.serialize())
        .map_err(|e| ThreshError::Musig(format!("pubkey conversion: {}", e)))
}

fn seckey_to_musig(sk: &SecretKey) -> Result<musig2::secp256k1::SecretKey, ThreshError> {
    #[allow(deprecated)]
    musig2::secp256k1::SecretKey::from_slice(&sk.secret_bytes())
        .map_err(|e| ThreshError::Musig(format!("seckey conversion: {}", e)))
}

// ─── Private nonce ──────────────────────────────────────────────────────────

/// A MuSig2 secret nonce that can be spent exactly once.
///
/// Not `Clone`. The serialized nonce lives in zeroizing memory and the only
/// way to use it is [`partial_sign`], which takes it by value.
pub struct PrivateNonce(Zeroizing<[u8; 64]>);

impl PrivateNonce {
    fn from_sec_nonce(secnonce: SecNonce) -> Self {
        Self(Zeroizing::new(secnonce.serialize()))
    }

    fn into_sec_nonce(self) -> Result<SecNonce, ThreshError> {
        SecNonce::from_bytes(&self.0[..])
            .map_err(|e| ThreshError::Musig(format!("secnonce decode: {}", e)))
    }
}

impl std::fmt::Debug for PrivateNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateNonce(..)")
    }
}

// ─── Key Aggregation ────────────────────────────────────────────────────────

/// Aggregate public keys (in the given order) with MuSig2 key aggregation.
///
/// Returns the KeyAggContext (needed for signing) and the aggregated x-only key.
pub fn key_agg(pubkeys: &[PublicKey]) -> Result<(KeyAggContext, XOnlyPublicKey), ThreshError> {
    let keys = pubkeys
        .iter()
        .map(pubkey_to_musig)
        .collect::<Result<Vec<_>, _>>()?;

    let key_agg_ctx = KeyAggContext::new(keys)
        .map_err(|e| ThreshError::Musig(format!("key aggregation: {}", e)))?;

    let agg_pk: musig2::secp256k1::PublicKey = key_agg_ctx.aggregated_pubkey();
    let (xonly, _parity) = agg_pk.x_only_public_key();

    let our_xonly = XOnlyPublicKey::from_slice(&xonly.serialize())
        .map_err(|e| ThreshError::Musig(format!("xonly conversion: {}", e)))?;

    Ok((key_agg_ctx, our_xonly))
}

// ─── Nonce Generation ───────────────────────────────────────────────────────

/// Generate a nonce pair bound to the signer's key, the aggregate and `message`.
///
/// The returned [`PrivateNonce`] must be spent by exactly one [`partial_sign`].
pub fn generate_nonce(
    seckey: &SecretKey,
    key_agg_ctx: &KeyAggContext,
    message: &[u8; 32],
) -> Result<(PrivateNonce, PubNonce), ThreshError> {
    let sk_m = seckey_to_musig(seckey)?;
    let agg_pk: musig2::secp256k1::PublicKey = key_agg_ctx.aggregated_pubkey();

    let mut nonce_seed = Zeroizing::new([0u8; 32]);
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce_seed[..]);

    let secnonce = SecNonce::build(*nonce_seed)
        .with_seckey(sk_m)
        .with_aggregated_pubkey(agg_pk)
        .with_message(message)
        .build();
    let pubnonce = secnonce.public_nonce();

    Ok((PrivateNonce::from_sec_nonce(secnonce), pubnonce))
}

/// Compute the aggregate nonce from every participant's public nonce.
pub fn aggregate_nonces(pubnonces: &[PubNonce]) -> AggNonce {
    AggNonce::sum(pubnonces)
}

// ─── Partial Signing ────────────────────────────────────────────────────────

/// Produce a partial signature, consuming the private nonce.
pub fn partial_sign(
    seckey: &SecretKey,
    nonce: PrivateNonce,
    key_agg_ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    message: &[u8; 32],
) -> Result<PartialSignature, ThreshError> {
    let sk_m = seckey_to_musig(seckey)?;
    let secnonce = nonce.into_sec_nonce()?;

    musig2::sign_partial(key_agg_ctx, sk_m, secnonce, agg_nonce, message)
        .map_err(|e| ThreshError::Musig(format!("partial sign: {}", e)))
}

/// Verify a partial signature from a specific signer.
pub fn verify_partial_signature(
    key_agg_ctx: &KeyAggContext,
    partial_sig: &PartialSignature,
    agg_nonce: &AggNonce,
    signer_pubkey: &PublicKey,
    signer_pubnonce: &PubNonce,
    message: &[u8; 32],
) -> bool {
    let pk_m = match pubkey_to_musig(signer_pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };

    musig2::verify_partial(
        key_agg_ctx,
        *partial_sig,
        agg_nonce,
        pk_m,
        signer_pubnonce,
        message,
    )
    .is_ok()
}

// ─── Signature Aggregation ──────────────────────────────────────────────────

/// Aggregate partial signatures into a final 64-byte BIP-340 signature.
pub fn aggregate_signatures(
    key_agg_ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    partial_sigs: &[PartialSignature],
    message: &[u8; 32],
) -> Result<[u8; 64], ThreshError> {
    let sig: LiftedSignature = musig2::aggregate_partial_signatures(
        key_agg_ctx,
        agg_nonce,
        partial_sigs.iter().copied(),
        message,
    )
    .map_err(|e| ThreshError::Musig(format!("sig aggregation: {}", e)))?;

    Ok(sig.serialize())
}

// ─── Serialization helpers for transport ────────────────────────────────────

pub fn pubnonce_to_bytes(pubnonce: &PubNonce) -> Vec<u8> {
    pubnonce.serialize().to_vec()
}

pub fn pubnonce_from_bytes(bytes: &[u8]) -> Result<PubNonce, ThreshError> {
    PubNonce::from_bytes(bytes)
        .map_err(|e| ThreshError::Serialization(format!("invalid pubnonce: {}", e)))
}

pub fn partial_sig_to_bytes(sig: &PartialSignature) -> [u8; 32] {
    sig.serialize()
}

pub fn partial_sig_from_bytes(bytes: &[u8]) -> Result<PartialSignature, ThreshError> {
    PartialSignature::from_slice(bytes)
        .map_err(|e| ThreshError::Serialization(format!("invalid partial sig: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_keypair;
    use bitcoin::secp256k1::Secp256k1;

    fn verify_bip340(xonly: &XOnlyPublicKey, sig: &[u8; 64], message: &[u8; 32]) -> bool {
        let secp = Secp256k1::verification_only();
        let sig = match bitcoin::secp256k1::schnorr::Signature::from_slice(sig) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let msg = bitcoin::secp256k1::Message::from_digest(*message);
        secp.verify_schnorr(&sig, &msg, xonly).is_ok()
    }

    #[test]
    fn test_key_agg_deterministic_and_order_sensitive() {
        let (_, pk1) = test_keypair(1);
        let (_, pk2) = test_keypair(2);
        let (_, pk3) = test_keypair(3);

        let (_, a) = key_agg(&[pk1, pk2, pk3]).unwrap();
        let (_, b) = key_agg(&[pk1, pk2, pk3]).unwrap();
        assert_eq!(a, b);

        // BIP-327 aggregation depends on key order; callers must sort
        let (_, c) = key_agg(&[pk3, pk2, pk1]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_three_party_signing_roundtrip() {
        let parties: Vec<_> = (10..13).map(test_keypair).collect();
        let pubkeys: Vec<PublicKey> = parties.iter().map(|(_, pk)| *pk).collect();
        let (ctx, agg_xonly) = key_agg(&pubkeys).unwrap();
        let message = [0x5Au8; 32];

        let mut secnonces = Vec::new();
        let mut pubnonces = Vec::new();
        for (sk, _) in &parties {
            let (sec, public) = generate_nonce(sk, &ctx, &message).unwrap();
            secnonces.push(sec);
            pubnonces.push(public);
        }
        let agg_nonce = aggregate_nonces(&pubnonces);

        let partials: Vec<PartialSignature> = parties
            .iter()
            .zip(secnonces)
            .map(|((sk, _), sec)| partial_sign(sk, sec, &ctx, &agg_nonce, &message).unwrap())
            .collect();

        for (i, (_, pk)) in parties.iter().enumerate() {
            assert!(verify_partial_signature(
                &ctx,
                &partials[i],
                &agg_nonce,
                pk,
                &pubnonces[i],
                &message,
            ));
        }

        let sig = aggregate_signatures(&ctx, &agg_nonce, &partials, &message).unwrap();
        assert!(verify_bip340(&agg_xonly, &sig, &message));
    }

    #[test]
    fn test_partial_from_wrong_signer_rejected() {
        let (sk1, pk1) = test_keypair(1);
        let (_sk2, pk2) = test_keypair(2);
        let (ctx, _) = key_agg(&[pk1, pk2]).unwrap();
        let message = [0xABu8; 32];

        let (sec1, pub1) = generate_nonce(&sk1, &ctx, &message).unwrap();
        let (_sec2, pub2) = generate_nonce(&test_keypair(2).0, &ctx, &message).unwrap();
        let agg_nonce = aggregate_nonces(&[pub1.clone(), pub2]);

        let partial = partial_sign(&sk1, sec1, &ctx, &agg_nonce, &message).unwrap();
        assert!(verify_partial_signature(&ctx, &partial, &agg_nonce, &pk1, &pub1, &message));
        assert!(!verify_partial_signature(&ctx, &partial, &agg_nonce, &pk2, &pub1, &message));
    }

    #[test]
    fn test_mismatched_messages_fail_aggregation() {
        let (sk1, pk1) = test_keypair(1);
        let (sk2, pk2) = test_keypair(2);
        let (ctx, _) = key_agg(&[pk1, pk2]).unwrap();
        let message = [0xABu8; 32];
        let other = [0xFFu8; 32];

        let (sec1, pub1) = generate_nonce(&sk1, &ctx, &message).unwrap();
        let (sec2, pub2) = generate_nonce(&sk2, &ctx, &message).unwrap();
        let agg_nonce = aggregate_nonces(&[pub1, pub2]);

        let p1 = partial_sign(&sk1, sec1, &ctx, &agg_nonce, &message).unwrap();
        let p2 = partial_sign(&sk2, sec2, &ctx, &agg_nonce, &other).unwrap();
        assert!(aggregate_signatures(&ctx, &agg_nonce, &[p1, p2], &message).is_err());
    }

    #[test]
    fn test_pubnonce_and_partial_bytes_roundtrip() {
        let (sk1, pk1) = test_keypair(1);
        let (sk2, pk2) = test_keypair(2);
        let (ctx, _) = key_agg(&[pk1, pk2]).unwrap();
        let message = [0x01u8; 32];

        let (sec1, pub1) = generate_nonce(&sk1, &ctx, &message).unwrap();
        let (_sec2, pub2) = generate_nonce(&sk2, &ctx, &message).unwrap();

        let recovered = pubnonce_from_bytes(&pubnonce_to_bytes(&pub1)).unwrap();
        assert_eq!(recovered, pub1);

        let agg_nonce = aggregate_nonces(&[pub1, pub2]);
        let partial = partial_sign(&sk1, sec1, &ctx, &agg_nonce, &message).unwrap();
        let bytes = partial_sig_to_bytes(&partial);
        assert_eq!(partial_sig_from_bytes(&bytes).unwrap(), partial);
    }

    #[test]
    fn test_garbage_pubnonce_rejected() {
        assert!(pubnonce_from_bytes(&[0u8; 10]).is_err());
    }
}

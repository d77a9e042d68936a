//! crypto helpers for weft: sha3 digests + ed25519 signing over digests
//!
//! Every signature in weft is an ed25519 signature over the sha3-256 digest
//! of a canonical challenge string, hex-encoded on the wire. Twins sign
//! reservations and delete requests; the node signs the results it produces.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hex::encode as hex_encode;
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use thiserror::Error;

/// Errors from key decoding and signature verification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key or signature bytes are not valid hex or have the wrong length.
    #[error("malformed {0}: {1}")]
    Malformed(&'static str, String),

    /// The signature does not verify under the given key.
    #[error("signature verification failed")]
    BadSignature,
}

/// compute sha3-256 raw bytes (32 bytes)
pub fn sha3_256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// compute sha3-256 hex string of bytes
pub fn sha3_256_hex(data: &[u8]) -> String {
    hex_encode(sha3_256_bytes(data))
}

/// Generate a fresh ed25519 keypair.
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Decode a 32-byte hex secret into a signing key.
pub fn signing_key_from_hex(s: &str) -> Result<SigningKey, CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::Malformed("secret key", e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::Malformed("secret key", "expected 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Decode a 32-byte hex public key into a verifying key.
pub fn verifying_key_from_hex(s: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::Malformed("public key", e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::Malformed("public key", "expected 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| CryptoError::Malformed("public key", e.to_string()))
}

/// Hex encoding of the public half of a signing key.
pub fn public_key_hex(key: &SigningKey) -> String {
    hex_encode(key.verifying_key().to_bytes())
}

/// Sign the sha3-256 digest of `challenge`; returns the hex signature.
pub fn sign_challenge(key: &SigningKey, challenge: &[u8]) -> String {
    let digest = sha3_256_bytes(challenge);
    hex_encode(key.sign(&digest).to_bytes())
}

/// Verify a hex signature over the sha3-256 digest of `challenge`.
pub fn verify_challenge(
    key: &VerifyingKey,
    challenge: &[u8],
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let bytes = hex::decode(signature_hex.trim())
        .map_err(|e| CryptoError::Malformed("signature", e.to_string()))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| CryptoError::Malformed("signature", "expected 64 bytes".into()))?;
    let sig = Signature::from_bytes(&bytes);
    let digest = sha3_256_bytes(challenge);
    key.verify(&digest, &sig).map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let key = generate_keypair();
        let sig = sign_challenge(&key, b"hello fabric");
        verify_challenge(&key.verifying_key(), b"hello fabric", &sig).expect("must verify");
    }

    #[test]
    fn test_verify_rejects_tampered_challenge() {
        let key = generate_keypair();
        let sig = sign_challenge(&key, b"original");
        let err = verify_challenge(&key.verifying_key(), b"tampered", &sig).unwrap_err();
        assert_eq!(err, CryptoError::BadSignature);
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let key = generate_keypair();
        let other = generate_keypair();
        let sig = sign_challenge(&key, b"msg");
        assert!(verify_challenge(&other.verifying_key(), b"msg", &sig).is_err());
    }

    #[test]
    fn test_key_hex_roundtrip() {
        let key = generate_keypair();
        let pk = public_key_hex(&key);
        let decoded = verifying_key_from_hex(&pk).expect("decode");
        assert_eq!(decoded, key.verifying_key());

        assert!(verifying_key_from_hex("not-hex").is_err());
        assert!(verifying_key_from_hex("abcd").is_err());
    }
}

//! `crypto.ecdh(privA, pubB, algo) -> shared` and `crypto.hkdfSha256(shared)
//! -> key[:16]`, and the two named derivation algorithms.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::KeyMaterial;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationAlgorithm {
    /// HKDF-SHA256(shared, salt=None, info=None), truncated to 16 bytes -> AES-128-GCM.
    EcdhCurve25519_16bSha256,
    /// Raw 32-byte X25519 shared secret used directly as an AES-256-GCM key.
    EcdhCurve25519_32b,
}

/// Performs the Curve25519 ECDH exchange (`crypto.ecdh`).
pub fn ecdh_shared_secret(private: &StaticSecret, their_public: &PublicKey) -> [u8; 32] {
    private.diffie_hellman(their_public).to_bytes()
}

/// Turns a raw ECDH shared secret into AES-GCM key material per the two
/// enumerated derivation algorithms.
pub fn derive_key(algorithm: DerivationAlgorithm, shared_secret: &[u8; 32]) -> KeyMaterial {
    match algorithm {
        DerivationAlgorithm::EcdhCurve25519_16bSha256 => {
            let hk = Hkdf::<Sha256>::new(None, shared_secret);
            let mut okm = [0u8; 16];
            hk.expand(&[], &mut okm).expect("16 bytes is a valid HKDF-SHA256 output length");
            KeyMaterial::Bits128(okm)
        }
        DerivationAlgorithm::EcdhCurve25519_32b => KeyMaterial::Bits256(*shared_secret),
    }
}

//! Cryptographic primitive contracts consumed by the Secret Manager.

mod aead;
mod kdf;
mod nonce;

pub use aead::{AeadCipher, AesGcmCipher};
pub use kdf::{derive_key, DerivationAlgorithm};
pub use nonce::{nonce_for, Direction};

/// `{ algorithm, keyBits, material, epoch }`.
#[derive(Clone)]
pub struct DecryptionKey {
    pub algorithm: AeadAlgorithm,
    pub material: KeyMaterial,
    pub epoch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    AesGcm128,
    AesGcm256,
}

impl AeadAlgorithm {
    pub fn key_bits(&self) -> u16 {
        match self {
            AeadAlgorithm::AesGcm128 => 128,
            AeadAlgorithm::AesGcm256 => 256,
        }
    }
}

#[derive(Clone)]
pub enum KeyMaterial {
    Bits128([u8; 16]),
    Bits256([u8; 32]),
}

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KeyMaterial::Bits128(b) => b,
            KeyMaterial::Bits256(b) => b,
        }
    }
}

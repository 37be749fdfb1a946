//! `crypto.aeadEncrypt/Decrypt(key, iv, pt|ct, aad, tag)`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};

use crate::error::AiaError;
use crate::wire::TAG_LEN;

use super::{AeadAlgorithm, DecryptionKey, KeyMaterial};

pub trait AeadCipher: Send + Sync {
    fn encrypt(&self, key: &DecryptionKey, nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, [u8; TAG_LEN]), AiaError>;

    fn decrypt(&self, key: &DecryptionKey, nonce: &[u8; 12], ciphertext: &[u8], tag: &[u8; TAG_LEN], aad: &[u8]) -> Result<Vec<u8>, AiaError>;
}

/// AES-GCM 128/256, selected per `DecryptionKey::algorithm`.
#[derive(Default)]
pub struct AesGcmCipher;

impl AeadCipher for AesGcmCipher {
    fn encrypt(&self, key: &DecryptionKey, nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, [u8; TAG_LEN]), AiaError> {
        let sealed = match key.algorithm {
            AeadAlgorithm::AesGcm128 => {
                let cipher = Aes128Gcm::new_from_slice(key.material.as_bytes())
                    .map_err(|e| AiaError::Internal(format!("bad AES-128 key: {e}")))?;
                cipher.encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            }
            AeadAlgorithm::AesGcm256 => {
                let cipher = Aes256Gcm::new_from_slice(key.material.as_bytes())
                    .map_err(|e| AiaError::Internal(format!("bad AES-256 key: {e}")))?;
                cipher.encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            }
        }
        .map_err(|_| AiaError::Internal("AEAD encrypt failed".into()))?;

        let split_at = sealed.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&sealed[split_at..]);
        Ok((sealed[..split_at].to_vec(), tag))
    }

    fn decrypt(&self, key: &DecryptionKey, nonce: &[u8; 12], ciphertext: &[u8], tag: &[u8; TAG_LEN], aad: &[u8]) -> Result<Vec<u8>, AiaError> {
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let opened = match key.algorithm {
            AeadAlgorithm::AesGcm128 => {
                let cipher = Aes128Gcm::new_from_slice(key.material.as_bytes())
                    .map_err(|e| AiaError::Internal(format!("bad AES-128 key: {e}")))?;
                cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: &sealed, aad })
            }
            AeadAlgorithm::AesGcm256 => {
                let cipher = Aes256Gcm::new_from_slice(key.material.as_bytes())
                    .map_err(|e| AiaError::Internal(format!("bad AES-256 key: {e}")))?;
                cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: &sealed, aad })
            }
        };
        opened.map_err(|_| AiaError::AuthFail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{nonce_for, Direction};
    use crate::topic::Topic;

    fn key128() -> DecryptionKey {
        DecryptionKey { algorithm: AeadAlgorithm::AesGcm128, material: KeyMaterial::Bits128([0x42; 16]), epoch: 0 }
    }

    fn key256() -> DecryptionKey {
        DecryptionKey { algorithm: AeadAlgorithm::AesGcm256, material: KeyMaterial::Bits256([0x24; 32]), epoch: 0 }
    }

    #[test]
    fn roundtrip_128() {
        let cipher = AesGcmCipher;
        let key = key128();
        let nonce = nonce_for(Topic::Directive, Direction::Inbound, 7);
        let (ct, tag) = cipher.encrypt(&key, &nonce, b"hello directive", b"aad").unwrap();
        let pt = cipher.decrypt(&key, &nonce, &ct, &tag, b"aad").unwrap();
        assert_eq!(pt, b"hello directive");
    }

    #[test]
    fn roundtrip_256() {
        let cipher = AesGcmCipher;
        let key = key256();
        let nonce = nonce_for(Topic::Speaker, Direction::Inbound, 1);
        let (ct, tag) = cipher.encrypt(&key, &nonce, b"pcm frame bytes", b"").unwrap();
        let pt = cipher.decrypt(&key, &nonce, &ct, &tag, b"").unwrap();
        assert_eq!(pt, b"pcm frame bytes");
    }

    #[test]
    fn fails_when_ciphertext_perturbed() {
        let cipher = AesGcmCipher;
        let key = key128();
        let nonce = nonce_for(Topic::Directive, Direction::Inbound, 7);
        let (mut ct, tag) = cipher.encrypt(&key, &nonce, b"hello", b"").unwrap();
        ct[0] ^= 0xff;
        assert!(cipher.decrypt(&key, &nonce, &ct, &tag, b"").is_err());
    }

    #[test]
    fn fails_when_tag_perturbed() {
        let cipher = AesGcmCipher;
        let key = key128();
        let nonce = nonce_for(Topic::Directive, Direction::Inbound, 7);
        let (ct, mut tag) = cipher.encrypt(&key, &nonce, b"hello", b"").unwrap();
        tag[0] ^= 0xff;
        assert!(cipher.decrypt(&key, &nonce, &ct, &tag, b"").is_err());
    }

    #[test]
    fn fails_when_sequence_number_perturbed() {
        let cipher = AesGcmCipher;
        let key = key128();
        let nonce_sent = nonce_for(Topic::Directive, Direction::Inbound, 7);
        let nonce_received = nonce_for(Topic::Directive, Direction::Inbound, 8);
        let (ct, tag) = cipher.encrypt(&key, &nonce_sent, b"hello", b"").unwrap();
        assert!(cipher.decrypt(&key, &nonce_received, &ct, &tag, b"").is_err());
    }

    #[test]
    fn fails_when_topic_perturbed() {
        let cipher = AesGcmCipher;
        let key = key128();
        let nonce_sent = nonce_for(Topic::Directive, Direction::Inbound, 7);
        let nonce_received = nonce_for(Topic::Speaker, Direction::Inbound, 7);
        let (ct, tag) = cipher.encrypt(&key, &nonce_sent, b"hello", b"").unwrap();
        assert!(cipher.decrypt(&key, &nonce_received, &ct, &tag, b"").is_err());
    }
}

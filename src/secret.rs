//! Holds the current (and, during rotation, previous) symmetric key and
//! performs per-topic AEAD encrypt/decrypt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::{nonce_for, AeadAlgorithm, AeadCipher, DecryptionKey, Direction, KeyMaterial};
use crate::error::AiaError;
use crate::topic::Topic;
use crate::wire::TAG_LEN;

struct SecretState {
    current: Option<DecryptionKey>,
    previous: Option<DecryptionKey>,
    /// Per-topic rotation boundary: seq < boundary decrypts with `previous`.
    boundaries: HashMap<Topic, u32>,
    /// Topics for which a message with `seq >= boundary` has been observed;
    /// once this covers every key in `boundaries`, `previous` is dropped.
    crossed: HashSet<Topic>,
}

pub struct SecretManager {
    cipher: Arc<dyn AeadCipher>,
    state: Mutex<SecretState>,
}

impl SecretManager {
    pub fn new(cipher: Arc<dyn AeadCipher>) -> Self {
        Self {
            cipher,
            state: Mutex::new(SecretState { current: None, previous: None, boundaries: HashMap::new(), crossed: HashSet::new() }),
        }
    }

    /// Installs the key derived from the ECDH handshake at epoch 0. Before
    /// this is called, every encrypt/decrypt call fails with `NoKey`.
    pub fn install_key(&self, algorithm: AeadAlgorithm, material: KeyMaterial) {
        let mut s = self.state.lock();
        s.current = Some(DecryptionKey { algorithm, material, epoch: 0 });
        s.previous = None;
        s.boundaries.clear();
        s.crossed.clear();
    }

    /// Installs a new key following a `RotateSecret` directive, retaining
    /// the outgoing key as `previous` until every topic in `boundaries` has
    /// crossed its rotation sequence number.
    pub fn rotate(&self, algorithm: AeadAlgorithm, material: KeyMaterial, boundaries: HashMap<Topic, u32>) -> Result<(), AiaError> {
        let mut s = self.state.lock();
        let outgoing = s.current.take().ok_or(AiaError::Internal("rotate called with no installed key".into()))?;
        let next_epoch = outgoing.epoch.wrapping_add(1);
        s.previous = Some(outgoing);
        s.current = Some(DecryptionKey { algorithm, material, epoch: next_epoch });
        s.boundaries = boundaries;
        s.crossed.clear();
        Ok(())
    }

    pub fn decrypt(&self, topic: Topic, seq: u32, ciphertext: &[u8], tag: &[u8; TAG_LEN], aad: &[u8]) -> Result<Vec<u8>, AiaError> {
        let nonce = nonce_for(topic, Direction::Inbound, seq);
        let key = self.select_decrypt_key(topic, seq)?;
        self.cipher.decrypt(&key, &nonce, ciphertext, tag, aad)
    }

    pub fn encrypt(&self, topic: Topic, seq: u32, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, [u8; TAG_LEN]), AiaError> {
        let nonce = nonce_for(topic, Direction::Outbound, seq);
        let key = self.state.lock().current.clone().ok_or(AiaError::NoKey(topic))?;
        self.cipher.encrypt(&key, &nonce, plaintext, aad)
    }

    fn select_decrypt_key(&self, topic: Topic, seq: u32) -> Result<DecryptionKey, AiaError> {
        let mut s = self.state.lock();
        let boundary = s.boundaries.get(&topic).copied();
        let key = match boundary {
            Some(b) if seq < b => s.previous.clone().ok_or(AiaError::NoKey(topic))?,
            Some(_) => {
                s.crossed.insert(topic);
                s.current.clone().ok_or(AiaError::NoKey(topic))?
            }
            None => s.current.clone().ok_or(AiaError::NoKey(topic))?,
        };

        if !s.boundaries.is_empty() && s.boundaries.keys().all(|t| s.crossed.contains(t)) {
            s.previous = None;
            s.boundaries.clear();
            s.crossed.clear();
        }

        Ok(key)
    }
}

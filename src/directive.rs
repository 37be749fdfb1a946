//! JSON directive wire shapes and dispatch.
//!
//! A single decrypted `Directive`-topic payload carries an envelope of one
//! or more directives; each is addressed by its position (`index`) within
//! the envelope for diagnostics when one directive is malformed but its
//! siblings are not. The wire shape separates `header` (name + message id)
//! from `payload` (the directive's own fields), so parsing goes through an
//! intermediate `RawDirective` rather than a single `#[serde(tag = ...)]`
//! enum: the tag lives in a sibling object, not inside the payload itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::crypto::{AeadAlgorithm, KeyMaterial};
use crate::error::AiaError;
use crate::secret::SecretManager;
use crate::speaker::SpeakerManager;
use crate::topic::Topic;
use crate::ux::{AttentionState as UxAttentionState, UxManager};

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    directives: Vec<RawDirective>,
}

#[derive(Debug, Deserialize)]
struct RawDirective {
    header: DirectiveHeader,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DirectiveHeader {
    name: String,
    #[serde(rename = "messageId")]
    #[allow(dead_code)]
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct OpenSpeakerPayload {
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct CloseSpeakerPayload {
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct SetVolumePayload {
    offset: u64,
    volume: f32,
}

#[derive(Debug, Deserialize)]
struct SetAttentionStatePayload {
    state: DirectiveAttentionState,
}

#[derive(Debug, Deserialize)]
struct RotateSecretPayload {
    algorithm: DirectiveKeyAlgorithm,
    key: Vec<u8>,
    boundaries: HashMap<Topic, u32>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectiveAttentionState {
    Idle,
    Thinking,
    Speaking,
    Alerting,
    NotificationAvailable,
    DoNotDisturb,
}

impl From<DirectiveAttentionState> for UxAttentionState {
    fn from(s: DirectiveAttentionState) -> Self {
        match s {
            DirectiveAttentionState::Idle => UxAttentionState::Idle,
            DirectiveAttentionState::Thinking => UxAttentionState::Thinking,
            DirectiveAttentionState::Speaking => UxAttentionState::Speaking,
            DirectiveAttentionState::Alerting => UxAttentionState::Alerting,
            DirectiveAttentionState::NotificationAvailable => UxAttentionState::NotificationAvailable,
            DirectiveAttentionState::DoNotDisturb => UxAttentionState::DoNotDisturb,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectiveKeyAlgorithm {
    AesGcm128,
    AesGcm256,
}

/// Dispatches a decrypted `Directive`-topic payload to the engines it
/// addresses. Never panics on a malformed directive: the caller reports
/// per-index failures to the `Regulator` via the returned errors.
pub struct DirectiveDispatcher {
    speaker: Arc<SpeakerManager>,
    ux: Arc<UxManager>,
    secret: Arc<SecretManager>,
}

impl DirectiveDispatcher {
    pub fn new(speaker: Arc<SpeakerManager>, ux: Arc<UxManager>, secret: Arc<SecretManager>) -> Self {
        Self { speaker, ux, secret }
    }

    /// Parses and applies every directive in `payload`, returning one
    /// `AiaError::MalformedMessage` (carrying the failing `index`) per
    /// directive that could not be parsed or applied, without aborting
    /// the remaining directives in the envelope.
    pub fn dispatch(&self, sequence_number: u32, payload: &[u8]) -> Vec<AiaError> {
        let envelope: RawEnvelope = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => return vec![AiaError::malformed(Topic::Directive, sequence_number, None, e.to_string())],
        };

        let mut errors = Vec::new();
        for (index, directive) in envelope.directives.into_iter().enumerate() {
            if let Err(reason) = self.apply(directive) {
                errors.push(AiaError::malformed(Topic::Directive, sequence_number, Some(index), reason));
            }
        }
        errors
    }

    fn apply(&self, directive: RawDirective) -> Result<(), String> {
        let name = directive.header.name.as_str();
        match name {
            "OpenSpeaker" => {
                let p: OpenSpeakerPayload = serde_json::from_value(directive.payload).map_err(|e| e.to_string())?;
                self.speaker.open_speaker(p.offset);
                Ok(())
            }
            "CloseSpeaker" => {
                let p: CloseSpeakerPayload = serde_json::from_value(directive.payload).map_err(|e| e.to_string())?;
                self.speaker.close_speaker(p.offset);
                Ok(())
            }
            "SetVolume" => {
                let p: SetVolumePayload = serde_json::from_value(directive.payload).map_err(|e| e.to_string())?;
                self.speaker.set_volume_at(p.offset, p.volume);
                Ok(())
            }
            "SetAttentionState" => {
                let p: SetAttentionStatePayload = serde_json::from_value(directive.payload).map_err(|e| e.to_string())?;
                self.ux.set_attention(p.state.into());
                Ok(())
            }
            "RotateSecret" => {
                let p: RotateSecretPayload = serde_json::from_value(directive.payload).map_err(|e| e.to_string())?;
                let material = match (p.algorithm, p.key.len()) {
                    (DirectiveKeyAlgorithm::AesGcm128, 16) => {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(&p.key);
                        KeyMaterial::Bits128(bytes)
                    }
                    (DirectiveKeyAlgorithm::AesGcm256, 32) => {
                        let mut bytes = [0u8; 32];
                        bytes.copy_from_slice(&p.key);
                        KeyMaterial::Bits256(bytes)
                    }
                    (_, len) => return Err(format!("key length {len} does not match the declared algorithm")),
                };
                let algo = match p.algorithm {
                    DirectiveKeyAlgorithm::AesGcm128 => AeadAlgorithm::AesGcm128,
                    DirectiveKeyAlgorithm::AesGcm256 => AeadAlgorithm::AesGcm256,
                };
                self.secret.rotate(algo, material, p.boundaries).map_err(|e| e.to_string())
            }
            other => Err(format!("unknown directive name {other:?}")),
        }
    }
}

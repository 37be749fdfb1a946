//! Crate-wide error taxonomy.
//!
//! Per-message failures never escalate into a `Result` the application has
//! to unwrap: the ingestion path converts an `AiaError` into an
//! `ExceptionEvent` and hands it to the `Regulator`, then keeps going.
//! Only the caller-facing setup/config APIs return `AiaError` directly.

use thiserror::Error;

use crate::topic::Topic;

/// Reason code carried on `ExceptionEncountered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedMessage,
    InternalError,
    Transport,
    Unauthorized,
    SequenceTimeout,
}

#[derive(Debug, Error)]
pub enum AiaError {
    #[error("malformed message on {topic:?} seq={sequence_number:?} index={index:?}: {reason}")]
    MalformedMessage {
        topic: Option<Topic>,
        sequence_number: Option<u32>,
        index: Option<usize>,
        reason: String,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("transport dropped")]
    Transport,

    #[error("connection rejected/unauthorized: {0}")]
    Unauthorized(String),

    #[error("sequence timeout waiting for {expected} on {topic:?}")]
    SequenceTimeout { topic: Topic, expected: u32 },

    #[error("no key installed for topic {0:?}")]
    NoKey(Topic),

    #[error("AEAD authentication failed")]
    AuthFail,
}

impl AiaError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AiaError::MalformedMessage { .. } | AiaError::NoKey(_) | AiaError::AuthFail => {
                ErrorCode::MalformedMessage
            }
            AiaError::Internal(_) => ErrorCode::InternalError,
            AiaError::Transport => ErrorCode::Transport,
            AiaError::Unauthorized(_) => ErrorCode::Unauthorized,
            AiaError::SequenceTimeout { .. } => ErrorCode::SequenceTimeout,
        }
    }

    pub fn malformed(topic: Topic, sequence_number: u32, index: Option<usize>, reason: impl Into<String>) -> Self {
        AiaError::MalformedMessage {
            topic: Some(topic),
            sequence_number: Some(sequence_number),
            index,
            reason: reason.into(),
        }
    }
}

/// Outbound `ExceptionEncountered` event shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExceptionEvent {
    pub error: ExceptionErrorField,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ExceptionMessageField>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExceptionErrorField {
    pub code: ErrorCode,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExceptionMessageField {
    pub topic: Topic,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u32,
    pub index: Option<usize>,
}

impl From<&AiaError> for ExceptionEvent {
    fn from(err: &AiaError) -> Self {
        let code = err.code();
        let message = match err {
            AiaError::MalformedMessage {
                topic: Some(topic),
                sequence_number: Some(sequence_number),
                index,
                ..
            } => Some(ExceptionMessageField {
                topic: *topic,
                sequence_number: *sequence_number,
                index: *index,
            }),
            AiaError::SequenceTimeout { topic, expected } => Some(ExceptionMessageField {
                topic: *topic,
                sequence_number: *expected,
                index: None,
            }),
            _ => None,
        };
        ExceptionEvent {
            error: ExceptionErrorField { code },
            message,
        }
    }
}

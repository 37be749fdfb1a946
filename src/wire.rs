//! On-wire framing for channel messages.
//!
//! ```text
//! [ topic(1) | seqNum(4 BE) | length(4 BE) ]
//! [ IV (12 bytes) ] [ ciphertext (length) ] [ tag (16 bytes) ]
//! ```

use crate::error::AiaError;
use crate::topic::Topic;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 4 + 4;

/// A single message received on a topic-scoped channel, still encrypted.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub topic: Topic,
    pub sequence_number: u32,
    pub nonce: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl ChannelMessage {
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Associated data bound into the AEAD tag: the common header fields,
    /// so a tampered topic id, sequence number, or length is caught by
    /// authentication even though none of them are themselves encrypted.
    pub fn aad(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.topic.wire_id();
        out[1..5].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[5..9].copy_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out
    }

    /// Parses a full wire frame. `topic` is
    /// supplied by the subscriber binding (the MQTT topic the bytes
    /// arrived on), not re-derived from the header id, though both must
    /// agree for the frame to be accepted.
    pub fn parse(topic: Topic, bytes: &[u8]) -> Result<Self, AiaError> {
        if bytes.len() < HEADER_LEN {
            return Err(AiaError::Internal("frame shorter than common header".into()));
        }
        let wire_topic = bytes[0];
        let sequence_number = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let length = u32::from_be_bytes(bytes[5..9].try_into().unwrap()) as usize;

        let parsed_topic = Topic::from_wire_id(wire_topic)
            .ok_or_else(|| AiaError::malformed(topic, sequence_number, None, "unknown topic id in header"))?;
        if parsed_topic != topic {
            return Err(AiaError::malformed(topic, sequence_number, None, "topic id mismatch"));
        }

        let body = &bytes[HEADER_LEN..];
        if body.len() != IV_LEN + length + TAG_LEN {
            return Err(AiaError::malformed(topic, sequence_number, None, "length field does not match frame size"));
        }

        let mut nonce = [0u8; IV_LEN];
        nonce.copy_from_slice(&body[..IV_LEN]);
        let ciphertext = body[IV_LEN..IV_LEN + length].to_vec();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&body[IV_LEN + length..]);

        Ok(ChannelMessage { topic, sequence_number, nonce, ciphertext, tag })
    }

    /// Serializes into the wire format; used by tests and by outbound
    /// mirrors of event topics.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + IV_LEN + self.ciphertext.len() + TAG_LEN);
        out.push(self.topic.wire_id());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_roundtrip() {
        let msg = ChannelMessage {
            topic: Topic::Directive,
            sequence_number: 42,
            nonce: [7u8; IV_LEN],
            ciphertext: vec![1, 2, 3, 4, 5],
            tag: [9u8; TAG_LEN],
        };
        let bytes = msg.encode();
        let parsed = ChannelMessage::parse(Topic::Directive, &bytes).unwrap();
        assert_eq!(parsed.sequence_number, 42);
        assert_eq!(parsed.ciphertext, vec![1, 2, 3, 4, 5]);
        assert_eq!(parsed.nonce, [7u8; IV_LEN]);
        assert_eq!(parsed.tag, [9u8; TAG_LEN]);
    }

    #[test]
    fn rejects_topic_mismatch() {
        let msg = ChannelMessage {
            topic: Topic::Directive,
            sequence_number: 1,
            nonce: [0u8; IV_LEN],
            ciphertext: vec![],
            tag: [0u8; TAG_LEN],
        };
        let bytes = msg.encode();
        assert!(ChannelMessage::parse(Topic::Speaker, &bytes).is_err());
    }

    #[test]
    fn rejects_truncated_frame() {
        assert!(ChannelMessage::parse(Topic::Directive, &[0u8; 4]).is_err());
    }
}

//! Channel identifiers and device topic root construction.

use std::fmt;

/// Channel identifier. Each variant corresponds to one MQTT topic suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Topic {
    CapabilitiesAck,
    ConnectionFromService,
    Directive,
    /// Binary PCM stream; plaintext is a concatenation of `AudioFrame`s.
    Speaker,
    /// Outbound mirror used for events/exceptions.
    Event,
}

impl Topic {
    /// All topics that the device subscribes to and runs through the
    /// Sequencer -> SecretManager pipeline.
    pub const INBOUND: [Topic; 3] = [Topic::ConnectionFromService, Topic::Directive, Topic::Speaker];

    /// Wire name, lower camel-ish segment used in the topic path.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Topic::CapabilitiesAck => "capabilitiesAck",
            Topic::ConnectionFromService => "connectionFromService",
            Topic::Directive => "directive",
            Topic::Speaker => "speaker",
            Topic::Event => "event",
        }
    }

    /// 1-byte wire identifier used in nonce construction and
    /// in the common header. Stable and never reused across
    /// topic additions.
    pub fn wire_id(&self) -> u8 {
        match self {
            Topic::CapabilitiesAck => 0,
            Topic::ConnectionFromService => 1,
            Topic::Directive => 2,
            Topic::Speaker => 3,
            Topic::Event => 4,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Topic::CapabilitiesAck),
            1 => Some(Topic::ConnectionFromService),
            2 => Some(Topic::Directive),
            3 => Some(Topic::Speaker),
            4 => Some(Topic::Event),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Builds `<storedRoot>/ais/<apiVersion>/<iotClientId>/<topic>`.
pub fn device_topic_root(stored_root: &str, api_version: &str, iot_client_id: &str) -> String {
    format!("{stored_root}/ais/{api_version}/{iot_client_id}/")
}

pub fn full_topic_name(stored_root: &str, api_version: &str, iot_client_id: &str, topic: Topic) -> String {
    format!("{}{}", device_topic_root(stored_root, api_version, iot_client_id), topic.wire_name())
}

//! Demultiplexes raw wire bytes arriving per topic into the
//! Sequencer -> SecretManager -> engine pipeline.
//!
//! The router never touches an MQTT client directly: bytes reach it via
//! [`TopicRouter::ingest_wire_bytes`], called by whatever glues a concrete
//! `MqttTransport` subscription to this crate. One [`Sequencer`] is kept
//! per inbound topic so a gap on `Speaker` never blocks `Directive`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::collaborators::{Regulator, TaskPool};
use crate::connection::{ConnectionManager, DisconnectCode};
use crate::directive::DirectiveDispatcher;
use crate::error::AiaError;
use crate::secret::SecretManager;
use crate::sequencer::Sequencer;
use crate::speaker::SpeakerManager;
use crate::topic::Topic;
use crate::wire::ChannelMessage;

#[derive(Debug, serde::Deserialize)]
struct ConnectionAckPayload {
    #[serde(rename = "connectMessageId")]
    connect_message_id: String,
    code: String,
    #[allow(dead_code)]
    description: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ConnectionDisconnectPayload {
    code: String,
    #[allow(dead_code)]
    description: Option<String>,
}

pub struct TopicRouter {
    sequencers: Mutex<HashMap<Topic, Arc<Sequencer<ChannelMessage>>>>,
    secret: Arc<SecretManager>,
    directive: Arc<DirectiveDispatcher>,
    speaker: Arc<SpeakerManager>,
    connection: Arc<ConnectionManager>,
    regulator: Arc<dyn Regulator>,
    self_weak: Mutex<Weak<TopicRouter>>,
}

impl TopicRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        secret: Arc<SecretManager>,
        directive: Arc<DirectiveDispatcher>,
        speaker: Arc<SpeakerManager>,
        connection: Arc<ConnectionManager>,
        regulator: Arc<dyn Regulator>,
        task_pool: Arc<dyn TaskPool>,
        max_slots: usize,
        sequence_timeout: Duration,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            sequencers: Mutex::new(HashMap::new()),
            secret,
            directive,
            speaker,
            connection,
            regulator,
            self_weak: Mutex::new(Weak::new()),
        });
        *router.self_weak.lock() = Arc::downgrade(&router);

        let mut sequencers = HashMap::new();
        for topic in Topic::INBOUND {
            let weak_delivered = router.self_weak.lock().clone();
            let weak_timed_out = router.self_weak.lock().clone();
            let seq = Sequencer::create(
                move |msg: ChannelMessage| {
                    if let Some(r) = weak_delivered.upgrade() {
                        r.handle_sequenced(topic, msg);
                    }
                },
                move |expected: u32| {
                    if let Some(r) = weak_timed_out.upgrade() {
                        r.regulator.write_exception((&AiaError::SequenceTimeout { topic, expected }).into());
                    }
                },
                |msg: &ChannelMessage| Some(msg.sequence_number()),
                0,
                max_slots,
                sequence_timeout,
                task_pool.clone(),
            );
            sequencers.insert(topic, seq);
        }
        *router.sequencers.lock() = sequencers;

        router
    }

    /// Entry point for a raw frame that arrived on `topic`. Parses the
    /// common header/returns an exception on a malformed frame, then
    /// hands the still-encrypted message to that topic's sequencer.
    pub fn ingest_wire_bytes(&self, topic: Topic, bytes: &[u8]) {
        let message = match ChannelMessage::parse(topic, bytes) {
            Ok(m) => m,
            Err(e) => {
                self.regulator.write_exception((&e).into());
                return;
            }
        };

        let sequencer = self.sequencers.lock().get(&topic).cloned();
        let Some(sequencer) = sequencer else {
            warn!(?topic, "no sequencer registered for topic");
            return;
        };

        let seq = message.sequence_number();
        if let Err(e) = sequencer.enqueue(message) {
            trace!(?topic, error = %e, "sequencer rejected message");
            let reason = e.to_string();
            self.regulator.write_exception((&AiaError::malformed(topic, seq, None, reason)).into());
        }
    }

    /// Resets the sequencer for `topic` to `next_expected`, e.g. after a
    /// reconnect establishes a fresh starting sequence number.
    pub fn reset_topic(&self, topic: Topic, next_expected: u32) {
        if let Some(seq) = self.sequencers.lock().get(&topic) {
            seq.reset_to(next_expected);
        }
    }

    fn handle_sequenced(&self, topic: Topic, message: ChannelMessage) {
        let seq = message.sequence_number();
        let aad = message.aad();
        let plaintext = match self.secret.decrypt(topic, seq, &message.ciphertext, &message.tag, &aad) {
            Ok(pt) => pt,
            Err(e) => {
                self.regulator.write_exception((&e).into());
                return;
            }
        };
        self.dispatch_plaintext(topic, seq, plaintext);
    }

    fn dispatch_plaintext(&self, topic: Topic, seq: u32, plaintext: Vec<u8>) {
        match topic {
            Topic::Directive => {
                for err in self.directive.dispatch(seq, &plaintext) {
                    self.regulator.write_exception((&err).into());
                }
            }
            Topic::Speaker => self.speaker.ingest_audio(&plaintext),
            Topic::ConnectionFromService => self.dispatch_connection_payload(topic, seq, &plaintext),
            Topic::CapabilitiesAck => trace!(seq, "capabilities ack received"),
            Topic::Event => {
                warn!(seq, "unexpected inbound message on outbound-only event topic");
            }
        }
    }

    /// `ConnectionFromService` carries two distinct shapes: a connect
    /// acknowledgement (`{connectMessageId, code, description?}`) or a
    /// server-initiated disconnect (`{code, description?}`). The ack shape
    /// is tried first since it's the only one with a required field the
    /// other lacks.
    fn dispatch_connection_payload(&self, topic: Topic, seq: u32, plaintext: &[u8]) {
        if let Ok(ack) = serde_json::from_slice::<ConnectionAckPayload>(plaintext) {
            match Uuid::parse_str(&ack.connect_message_id) {
                Ok(id) => self.connection.handle_ack(id, &ack.code),
                Err(_) => {
                    self.regulator
                        .write_exception((&AiaError::malformed(topic, seq, None, "connectMessageId is not a uuid")).into());
                }
            }
            return;
        }

        match serde_json::from_slice::<ConnectionDisconnectPayload>(plaintext) {
            Ok(d) => self.connection.handle_server_disconnect(DisconnectCode::from_wire(&d.code)),
            Err(e) => {
                self.regulator.write_exception((&AiaError::malformed(topic, seq, None, e.to_string())).into());
            }
        }
    }
}

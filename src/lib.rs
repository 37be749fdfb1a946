//! Device-side ingestion and playback pipeline for a cloud voice service
//! carried over MQTT: reorders and decrypts inbound channel messages, then
//! dispatches them into directive handling, speaker playback, connection
//! handshake, and UX state.
//!
//! The crate owns no transport, crypto-library, or storage dependency
//! beyond the two named AEAD/KDF primitives; every other side effect
//! crosses one of the [`collaborators`] traits, so [`AiaClient::init`] is
//! the single place that wires a concrete integration together.

pub mod backoff;
pub mod collaborators;
pub mod connection;
pub mod crypto;
pub mod directive;
pub mod error;
pub mod router;
pub mod secret;
pub mod sequencer;
pub mod speaker;
pub mod task_pool;
pub mod topic;
pub mod ux;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::FullJitterBackoff;
use crate::collaborators::{Regulator, TaskPool};
use crate::connection::{ConnectSender, ConnectionManager, ConnectionObserver};
use crate::crypto::AeadCipher;
use crate::directive::DirectiveDispatcher;
use crate::router::TopicRouter;
use crate::secret::SecretManager;
use crate::speaker::{BufferStateEvent, BufferStateObserver, SpeakerManager};
use crate::topic::{device_topic_root, Topic};
use crate::ux::{UXObserver, UxManager};

/// Fixed sizing/timing parameters an integrator supplies once at startup.
/// Everything here is a constructor argument rather than a lazily-computed
/// default, matching the resolved design-note decision that global state
/// is owned explicitly rather than initialized behind the scenes.
pub struct AiaClientConfig {
    pub stored_root: String,
    pub api_version: String,
    pub iot_client_id: String,
    pub speaker_buffer_bytes: usize,
    pub speaker_overrun_warning_threshold: usize,
    pub speaker_underrun_warning_threshold: usize,
    pub sequencer_max_slots: usize,
    pub sequencer_timeout: Duration,
    pub connection_handshake_timeout: Duration,
    pub connection_backoff_base: Duration,
    pub connection_backoff_max: Duration,
}

/// The observers/sinks an integrator supplies; each crosses exactly one
/// collaborator trait boundary so the engines stay testable with fakes.
#[allow(clippy::too_many_arguments)]
pub struct AiaClientCallbacks<
    PlaySpeakerData: Fn(&[u8]) + Send + Sync + 'static,
    SetVolume: Fn(f32) + Send + Sync + 'static,
    PlayOfflineAlert: Fn() + Send + Sync + 'static,
    StopOfflineAlert: Fn() + Send + Sync + 'static,
> {
    pub play_speaker_data: PlaySpeakerData,
    pub set_volume: SetVolume,
    pub play_offline_alert: PlayOfflineAlert,
    pub stop_offline_alert: StopOfflineAlert,
    pub buffer_state_observer: Arc<dyn BufferStateObserver>,
    pub ux_observer: Arc<dyn UXObserver>,
    pub connect_sender: Arc<dyn ConnectSender>,
    pub connection_observer: Arc<dyn ConnectionObserver>,
    pub regulator: Arc<dyn Regulator>,
}

/// The fully-wired pipeline: one [`TopicRouter`] demultiplexing inbound
/// bytes into the four engines, constructed once and shared behind `Arc`
/// for the lifetime of a connection to the service.
pub struct AiaClient {
    pub router: Arc<TopicRouter>,
    pub speaker: Arc<SpeakerManager>,
    pub connection: Arc<ConnectionManager>,
    pub ux: Arc<UxManager>,
    pub secret: Arc<SecretManager>,
    topic_root: String,
}

impl AiaClient {
    #[allow(clippy::too_many_arguments)]
    pub fn init<P, V, A, S>(
        config: AiaClientConfig,
        cipher: Arc<dyn AeadCipher>,
        callbacks: AiaClientCallbacks<P, V, A, S>,
        task_pool: Arc<dyn TaskPool>,
    ) -> Arc<Self>
    where
        P: Fn(&[u8]) + Send + Sync + 'static,
        V: Fn(f32) + Send + Sync + 'static,
        A: Fn() + Send + Sync + 'static,
        S: Fn() + Send + Sync + 'static,
    {
        let topic_root = device_topic_root(&config.stored_root, &config.api_version, &config.iot_client_id);

        let secret = Arc::new(SecretManager::new(cipher));

        let ux = Arc::new(UxManager::new(callbacks.ux_observer));

        let speaker = SpeakerManager::create(
            config.speaker_buffer_bytes,
            config.speaker_overrun_warning_threshold,
            config.speaker_underrun_warning_threshold,
            callbacks.play_speaker_data,
            callbacks.set_volume,
            callbacks.play_offline_alert,
            callbacks.stop_offline_alert,
            Arc::new(SpeakerUxBridge { inner: callbacks.buffer_state_observer, ux: ux.clone() }),
            callbacks.regulator.clone(),
            task_pool.clone(),
        );

        let directive = Arc::new(DirectiveDispatcher::new(speaker.clone(), ux.clone(), secret.clone()));

        let connection = ConnectionManager::create(
            callbacks.connect_sender,
            callbacks.connection_observer,
            Arc::new(FullJitterBackoff::new(config.connection_backoff_base, config.connection_backoff_max)),
            task_pool.clone(),
            config.connection_handshake_timeout,
        );

        let router = TopicRouter::create(
            secret.clone(),
            directive,
            speaker.clone(),
            connection.clone(),
            callbacks.regulator,
            task_pool,
            config.sequencer_max_slots,
            config.sequencer_timeout,
        );

        Arc::new(Self { router, speaker, connection, ux, secret, topic_root })
    }

    /// Full wire name for `topic` under this client's configured device
    /// topic root.
    pub fn full_topic(&self, topic: Topic) -> String {
        format!("{}{}", self.topic_root, topic.wire_name())
    }
}

/// Forwards every buffer-state event to the integrator's own observer, and
/// additionally feeds the speaker's play/idle transitions into the UX
/// reducer, which needs them as one of its reduction inputs.
struct SpeakerUxBridge {
    inner: Arc<dyn BufferStateObserver>,
    ux: Arc<UxManager>,
}

impl BufferStateObserver for SpeakerUxBridge {
    fn on_buffer_state_changed(&self, event: BufferStateEvent) {
        match event {
            BufferStateEvent::PlaybackStarted => self.ux.set_speaker_playing(true),
            BufferStateEvent::Idle => self.ux.set_speaker_playing(false),
            _ => {}
        }
        self.inner.on_buffer_state_changed(event);
    }
}

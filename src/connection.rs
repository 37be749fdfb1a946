//! Connection handshake state machine: connect/disconnect, stale-ACK
//! rejection by `connectMessageId`, and backoff-driven retry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::collaborators::{TaskHandle, TaskPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Wire-level disconnect/rejection reason. The enumerated values are the
/// ones named on the wire; `Transport` is a local-only sentinel for a
/// transport drop with no accompanying server message, and `Other` carries
/// forward any reason code this crate doesn't yet recognize by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCode {
    UnexpectedSequenceNumber,
    MessageTampered,
    ApiVersionDeprecated,
    EncryptionError,
    GoingOffline,
    /// The transport reported the link dropped with no server message.
    Transport,
    Other(String),
}

impl DisconnectCode {
    pub fn from_wire(code: &str) -> Self {
        match code {
            "UNEXPECTED_SEQUENCE_NUMBER" => Self::UnexpectedSequenceNumber,
            "MESSAGE_TAMPERED" => Self::MessageTampered,
            "API_VERSION_DEPRECATED" => Self::ApiVersionDeprecated,
            "ENCRYPTION_ERROR" => Self::EncryptionError,
            "GOING_OFFLINE" => Self::GoingOffline,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_wire_str(&self) -> &str {
        match self {
            Self::UnexpectedSequenceNumber => "UNEXPECTED_SEQUENCE_NUMBER",
            Self::MessageTampered => "MESSAGE_TAMPERED",
            Self::ApiVersionDeprecated => "API_VERSION_DEPRECATED",
            Self::EncryptionError => "ENCRYPTION_ERROR",
            Self::GoingOffline => "GOING_OFFLINE",
            Self::Transport => "TRANSPORT",
            Self::Other(s) => s,
        }
    }
}

pub trait ConnectionObserver: Send + Sync {
    fn on_state_changed(&self, state: ConnectionState);
    /// The cloud service rejected a connect attempt (ACK with a non-success
    /// code, or no ACK within the handshake timeout).
    fn on_connection_rejected(&self, code: DisconnectCode);
    fn on_disconnected(&self, code: DisconnectCode);
}

/// `connectionManager.sendConnect(messageId)` / `sendDisconnect(code, desc)`:
/// publishes the request; the caller supplies how that actually reaches the
/// transport so this module stays free of topic/wire-format knowledge.
pub trait ConnectSender: Send + Sync {
    fn send_connect(&self, message_id: Uuid);
    fn send_disconnect(&self, code: DisconnectCode, description: Option<String>);
}

struct State {
    state: ConnectionState,
    pending_message_id: Option<Uuid>,
    pending_disconnect_code: Option<DisconnectCode>,
    attempt: u32,
    handshake_timer: Option<TaskHandle>,
    retry_timer: Option<TaskHandle>,
    generation: u64,
}

pub struct ConnectionManager {
    state: Mutex<State>,
    sender: Arc<dyn ConnectSender>,
    observer: Arc<dyn ConnectionObserver>,
    backoff: Arc<dyn Backoff>,
    task_pool: Arc<dyn TaskPool>,
    handshake_timeout: Duration,
    self_weak: Mutex<std::sync::Weak<ConnectionManager>>,
}

impl ConnectionManager {
    pub fn create(
        sender: Arc<dyn ConnectSender>,
        observer: Arc<dyn ConnectionObserver>,
        backoff: Arc<dyn Backoff>,
        task_pool: Arc<dyn TaskPool>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        let mgr = Arc::new(Self {
            state: Mutex::new(State {
                state: ConnectionState::Disconnected,
                pending_message_id: None,
                pending_disconnect_code: None,
                attempt: 0,
                handshake_timer: None,
                retry_timer: None,
                generation: 0,
            }),
            sender,
            observer,
            backoff,
            task_pool,
            handshake_timeout,
            self_weak: Mutex::new(std::sync::Weak::new()),
        });
        *mgr.self_weak.lock() = Arc::downgrade(&mgr);
        mgr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    /// Initiates a connect attempt from DISCONNECTED. A no-op from any
    /// other state.
    pub fn connect(&self) {
        let mut s = self.state.lock();
        if s.state != ConnectionState::Disconnected {
            return;
        }
        s.attempt = 0;
        drop(s);
        self.begin_attempt();
    }

    fn begin_attempt(&self) {
        let message_id = Uuid::new_v4();
        let (generation, timeout) = {
            let mut s = self.state.lock();
            s.state = ConnectionState::Connecting;
            s.pending_message_id = Some(message_id);
            s.generation = s.generation.wrapping_add(1);
            (s.generation, self.handshake_timeout)
        };
        self.observer.on_state_changed(ConnectionState::Connecting);
        self.sender.send_connect(message_id);

        let weak = self.self_weak.lock().clone();
        let handle = self.task_pool.schedule(
            timeout,
            Box::new(move || {
                if let Some(mgr) = weak.upgrade() {
                    mgr.handshake_timed_out(generation);
                }
            }),
        );
        self.state.lock().handshake_timer = Some(handle);
    }

    /// Connection ack from the cloud, carrying the raw wire `code` (e.g.
    /// `"SUCCESS"` or a [`DisconnectCode`] name). Acks whose `message_id`
    /// does not match the currently pending attempt are stale (a prior
    /// attempt's late response, or a replay) and are rejected without
    /// changing state.
    pub fn handle_ack(&self, message_id: Uuid, code: &str) {
        let mut s = self.state.lock();
        if s.pending_message_id != Some(message_id) {
            warn!(?message_id, "rejecting stale or unexpected connection ack");
            return;
        }
        if let Some(handle) = s.handshake_timer.take() {
            self.task_pool.cancel(handle);
        }
        s.pending_message_id = None;

        match s.state {
            ConnectionState::Connecting => {
                drop(s);
                if code == "SUCCESS" {
                    let mut s = self.state.lock();
                    s.state = ConnectionState::Connected;
                    s.attempt = 0;
                    drop(s);
                    self.observer.on_state_changed(ConnectionState::Connected);
                    info!("connected");
                } else {
                    self.reject_and_retry(DisconnectCode::from_wire(code));
                }
            }
            ConnectionState::Disconnecting => {
                let sent_code = s.pending_disconnect_code.take().unwrap_or(DisconnectCode::Transport);
                s.state = ConnectionState::Disconnected;
                drop(s);
                self.observer.on_state_changed(ConnectionState::Disconnected);
                self.observer.on_disconnected(sent_code);
            }
            _ => {}
        }
    }

    fn handshake_timed_out(&self, generation: u64) {
        let still_pending = {
            let mut s = self.state.lock();
            if s.generation != generation || s.state != ConnectionState::Connecting {
                false
            } else {
                s.handshake_timer = None;
                true
            }
        };
        if still_pending {
            self.reject_and_retry(DisconnectCode::Other("HANDSHAKE_TIMEOUT".into()));
        }
    }

    /// A connect attempt failed (rejected ack or handshake timeout):
    /// notifies `onConnectionRejected` and schedules a retry.
    fn reject_and_retry(&self, code: DisconnectCode) {
        let attempt = {
            let mut s = self.state.lock();
            s.state = ConnectionState::Disconnected;
            s.pending_message_id = None;
            let a = s.attempt;
            s.attempt = s.attempt.saturating_add(1);
            a
        };
        self.observer.on_state_changed(ConnectionState::Disconnected);
        self.observer.on_connection_rejected(code);
        self.schedule_retry(attempt);
    }

    fn schedule_retry(&self, attempt: u32) {
        let delay = self.backoff.get_backoff(attempt);
        let weak = self.self_weak.lock().clone();
        let handle = self.task_pool.schedule(
            delay,
            Box::new(move || {
                if let Some(mgr) = weak.upgrade() {
                    mgr.retry_connect();
                }
            }),
        );
        self.state.lock().retry_timer = Some(handle);
    }

    fn retry_connect(&self) {
        let should_retry = {
            let mut s = self.state.lock();
            if s.state != ConnectionState::Disconnected {
                false
            } else {
                s.retry_timer = None;
                true
            }
        };
        if should_retry {
            self.begin_attempt();
        }
    }

    /// Notifies the manager that the transport reported a lost connection
    /// while CONNECTED.
    pub fn connection_lost(&self) {
        let (was_connected, attempt) = {
            let mut s = self.state.lock();
            if s.state == ConnectionState::Connected {
                s.state = ConnectionState::Disconnected;
                let a = s.attempt;
                s.attempt = s.attempt.saturating_add(1);
                (true, a)
            } else {
                (false, 0)
            }
        };
        if was_connected {
            self.observer.on_state_changed(ConnectionState::Disconnected);
            self.observer.on_disconnected(DisconnectCode::Transport);
            self.schedule_retry(attempt);
        }
    }

    /// The cloud service sent a server-initiated disconnect while CONNECTED.
    pub fn handle_server_disconnect(&self, code: DisconnectCode) {
        let (was_connected, attempt) = {
            let mut s = self.state.lock();
            if s.state == ConnectionState::Connected {
                s.state = ConnectionState::Disconnected;
                let a = s.attempt;
                s.attempt = s.attempt.saturating_add(1);
                (true, a)
            } else {
                (false, 0)
            }
        };
        if was_connected {
            self.observer.on_state_changed(ConnectionState::Disconnected);
            self.observer.on_disconnected(code);
            self.schedule_retry(attempt);
        }
    }

    /// Integrator-initiated graceful disconnect, carrying the reason the
    /// application is disconnecting (e.g. `GOING_OFFLINE`) and an optional
    /// human-readable description. Completes when the cloud acks the
    /// disconnect or the handshake timeout elapses, whichever comes first.
    pub fn disconnect(&self, code: DisconnectCode, description: Option<String>) {
        let message_id = Uuid::new_v4();
        let generation = {
            let mut s = self.state.lock();
            if s.state != ConnectionState::Connected {
                return;
            }
            s.state = ConnectionState::Disconnecting;
            s.pending_message_id = Some(message_id);
            s.pending_disconnect_code = Some(code.clone());
            s.generation = s.generation.wrapping_add(1);
            s.generation
        };
        self.observer.on_state_changed(ConnectionState::Disconnecting);
        self.sender.send_disconnect(code, description);

        let weak = self.self_weak.lock().clone();
        let handle = self.task_pool.schedule(
            self.handshake_timeout,
            Box::new(move || {
                if let Some(mgr) = weak.upgrade() {
                    mgr.disconnect_timed_out(generation);
                }
            }),
        );
        self.state.lock().handshake_timer = Some(handle);
    }

    fn disconnect_timed_out(&self, generation: u64) {
        let completed = {
            let mut s = self.state.lock();
            if s.generation != generation || s.state != ConnectionState::Disconnecting {
                None
            } else {
                s.handshake_timer = None;
                s.pending_message_id = None;
                s.state = ConnectionState::Disconnected;
                Some(s.pending_disconnect_code.take().unwrap_or(DisconnectCode::Transport))
            }
        };
        if let Some(code) = completed {
            self.observer.on_state_changed(ConnectionState::Disconnected);
            self.observer.on_disconnected(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_pool::ThreadTaskPool;
    use std::sync::mpsc;

    struct RecordingSender {
        connects: Mutex<Vec<Uuid>>,
        disconnects: Mutex<Vec<DisconnectCode>>,
    }
    impl ConnectSender for RecordingSender {
        fn send_connect(&self, message_id: Uuid) {
            self.connects.lock().push(message_id);
        }
        fn send_disconnect(&self, code: DisconnectCode, _description: Option<String>) {
            self.disconnects.lock().push(code);
        }
    }

    enum ObserverEvent {
        State(ConnectionState),
        Rejected(DisconnectCode),
        Disconnected(DisconnectCode),
    }

    struct RecordingObserver {
        tx: mpsc::Sender<ObserverEvent>,
    }
    impl ConnectionObserver for RecordingObserver {
        fn on_state_changed(&self, state: ConnectionState) {
            let _ = self.tx.send(ObserverEvent::State(state));
        }
        fn on_connection_rejected(&self, code: DisconnectCode) {
            let _ = self.tx.send(ObserverEvent::Rejected(code));
        }
        fn on_disconnected(&self, code: DisconnectCode) {
            let _ = self.tx.send(ObserverEvent::Disconnected(code));
        }
    }

    struct ZeroBackoff;
    impl Backoff for ZeroBackoff {
        fn get_backoff(&self, _n: u32) -> Duration {
            Duration::from_millis(1)
        }
    }

    fn harness() -> (Arc<ConnectionManager>, Arc<RecordingSender>, mpsc::Receiver<ObserverEvent>) {
        let sender = Arc::new(RecordingSender { connects: Mutex::new(Vec::new()), disconnects: Mutex::new(Vec::new()) });
        let (tx, rx) = mpsc::channel();
        let observer = Arc::new(RecordingObserver { tx });
        let mgr = ConnectionManager::create(
            sender.clone(),
            observer,
            Arc::new(ZeroBackoff),
            Arc::new(ThreadTaskPool::new(2)),
            Duration::from_millis(200),
        );
        (mgr, sender, rx)
    }

    fn expect_state(rx: &mpsc::Receiver<ObserverEvent>, want: ConnectionState) {
        match rx.recv_timeout(Duration::from_millis(500)).unwrap() {
            ObserverEvent::State(s) => assert_eq!(s, want),
            _ => panic!("expected a state-changed event"),
        }
    }

    #[test]
    fn connect_then_accepted_ack_reaches_connected() {
        let (mgr, sender, events) = harness();
        mgr.connect();
        expect_state(&events, ConnectionState::Connecting);
        let id = sender.connects.lock()[0];
        mgr.handle_ack(id, "SUCCESS");
        expect_state(&events, ConnectionState::Connected);
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn stale_ack_with_wrong_message_id_is_rejected() {
        let (mgr, _sender, events) = harness();
        mgr.connect();
        expect_state(&events, ConnectionState::Connecting);
        mgr.handle_ack(Uuid::new_v4(), "SUCCESS");
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn rejected_ack_reports_the_wire_code_and_schedules_a_retry() {
        let (mgr, sender, events) = harness();
        mgr.connect();
        expect_state(&events, ConnectionState::Connecting);
        let id = sender.connects.lock()[0];
        mgr.handle_ack(id, "API_VERSION_DEPRECATED");

        expect_state(&events, ConnectionState::Disconnected);
        match events.recv_timeout(Duration::from_millis(500)).unwrap() {
            ObserverEvent::Rejected(code) => assert_eq!(code, DisconnectCode::ApiVersionDeprecated),
            _ => panic!("expected a connection-rejected event"),
        }
        // Retry fires quickly with the zero backoff and reaches Connecting again.
        expect_state(&events, ConnectionState::Connecting);
        assert_eq!(sender.connects.lock().len(), 2);
    }

    #[test]
    fn server_initiated_disconnect_while_connected_reports_its_code() {
        let (mgr, sender, events) = harness();
        mgr.connect();
        expect_state(&events, ConnectionState::Connecting);
        let id = sender.connects.lock()[0];
        mgr.handle_ack(id, "SUCCESS");
        expect_state(&events, ConnectionState::Connected);

        mgr.handle_server_disconnect(DisconnectCode::GoingOffline);
        expect_state(&events, ConnectionState::Disconnected);
        match events.recv_timeout(Duration::from_millis(500)).unwrap() {
            ObserverEvent::Disconnected(code) => assert_eq!(code, DisconnectCode::GoingOffline),
            _ => panic!("expected a disconnected event"),
        }
    }

    #[test]
    fn integrator_disconnect_completes_with_its_own_code_once_the_timeout_elapses() {
        let (mgr, sender, events) = harness();
        mgr.connect();
        expect_state(&events, ConnectionState::Connecting);
        let id = sender.connects.lock()[0];
        mgr.handle_ack(id, "SUCCESS");
        expect_state(&events, ConnectionState::Connected);

        mgr.disconnect(DisconnectCode::GoingOffline, Some("shutting down".into()));
        expect_state(&events, ConnectionState::Disconnecting);
        assert_eq!(sender.disconnects.lock()[0], DisconnectCode::GoingOffline);

        // No disconnect ack ever arrives; the handshake timeout completes it.
        expect_state(&events, ConnectionState::Disconnected);
        match events.recv_timeout(Duration::from_millis(500)).unwrap() {
            ObserverEvent::Disconnected(code) => assert_eq!(code, DisconnectCode::GoingOffline),
            _ => panic!("expected a disconnected event"),
        }
    }

    #[test]
    fn transport_drop_while_connected_reports_transport_code() {
        let (mgr, sender, events) = harness();
        mgr.connect();
        expect_state(&events, ConnectionState::Connecting);
        let id = sender.connects.lock()[0];
        mgr.handle_ack(id, "SUCCESS");
        expect_state(&events, ConnectionState::Connected);

        mgr.connection_lost();
        expect_state(&events, ConnectionState::Disconnected);
        match events.recv_timeout(Duration::from_millis(500)).unwrap() {
            ObserverEvent::Disconnected(code) => assert_eq!(code, DisconnectCode::Transport),
            _ => panic!("expected a disconnected event"),
        }
    }
}

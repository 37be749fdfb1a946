//! Pure attention-state reduction plus a thin observer wrapper. `reduce` is
//! a free function: no locks, no I/O, trivially tested against a truth
//! table.

use std::sync::Arc;

use parking_lot::Mutex;

/// Last attention value received from the server via `SetAttentionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionState {
    Idle,
    Thinking,
    Speaking,
    Alerting,
    NotificationAvailable,
    DoNotDisturb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneState {
    Closed,
    Open,
}

/// The single presented state, distinct from `AttentionState`: it folds in
/// the microphone and speaker-playing signals rather than just passing the
/// server's attention value through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UXState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Alerting,
    NotificationAvailable,
    DoNotDisturb,
}

/// Priority order, highest first: an open microphone always reads as
/// `Listening`; otherwise the server saying `Thinking` wins; otherwise
/// actively streaming speaker audio reads as `Speaking`; otherwise the
/// server's own `Alerting`/`DoNotDisturb`/`NotificationAvailable` pass
/// through; otherwise `Idle`.
pub fn reduce(attention: AttentionState, microphone: MicrophoneState, speaker_playing: bool) -> UXState {
    if microphone == MicrophoneState::Open {
        return UXState::Listening;
    }
    match attention {
        AttentionState::Thinking => UXState::Thinking,
        _ if speaker_playing => UXState::Speaking,
        AttentionState::Alerting => UXState::Alerting,
        AttentionState::DoNotDisturb => UXState::DoNotDisturb,
        AttentionState::NotificationAvailable => UXState::NotificationAvailable,
        AttentionState::Idle | AttentionState::Speaking => UXState::Idle,
    }
}

pub trait UXObserver: Send + Sync {
    fn on_ux_state_changed(&self, state: UXState);
}

struct Inputs {
    attention: AttentionState,
    microphone: MicrophoneState,
    speaker_playing: bool,
    last_emitted: Option<UXState>,
}

/// Wraps `reduce` with the mutable inputs that feed it, firing the
/// observer exactly once per distinct resulting `UXState`.
pub struct UxManager {
    inputs: Mutex<Inputs>,
    observer: Arc<dyn UXObserver>,
}

impl UxManager {
    pub fn new(observer: Arc<dyn UXObserver>) -> Self {
        Self {
            inputs: Mutex::new(Inputs {
                attention: AttentionState::Idle,
                microphone: MicrophoneState::Closed,
                speaker_playing: false,
                last_emitted: None,
            }),
            observer,
        }
    }

    pub fn current(&self) -> UXState {
        let i = self.inputs.lock();
        reduce(i.attention, i.microphone, i.speaker_playing)
    }

    pub fn set_attention(&self, attention: AttentionState) {
        let mut i = self.inputs.lock();
        i.attention = attention;
        self.recompute_and_notify(&mut i);
    }

    pub fn set_microphone(&self, microphone: MicrophoneState) {
        let mut i = self.inputs.lock();
        i.microphone = microphone;
        self.recompute_and_notify(&mut i);
    }

    pub fn set_speaker_playing(&self, playing: bool) {
        let mut i = self.inputs.lock();
        i.speaker_playing = playing;
        self.recompute_and_notify(&mut i);
    }

    fn recompute_and_notify(&self, i: &mut Inputs) {
        let next = reduce(i.attention, i.microphone, i.speaker_playing);
        let changed = i.last_emitted != Some(next);
        if changed {
            i.last_emitted = Some(next);
            self.observer.on_ux_state_changed(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn open_microphone_wins_over_everything_else() {
        let state = reduce(AttentionState::Alerting, MicrophoneState::Open, true);
        assert_eq!(state, UXState::Listening);
    }

    #[test]
    fn thinking_wins_over_speaking_when_mic_closed() {
        let state = reduce(AttentionState::Thinking, MicrophoneState::Closed, true);
        assert_eq!(state, UXState::Thinking);
    }

    #[test]
    fn speaking_wins_over_alerting_when_mic_closed_and_not_thinking() {
        let state = reduce(AttentionState::Alerting, MicrophoneState::Closed, true);
        assert_eq!(state, UXState::Speaking);
    }

    #[test]
    fn server_attention_passes_through_when_idle_and_not_speaking() {
        let state = reduce(AttentionState::DoNotDisturb, MicrophoneState::Closed, false);
        assert_eq!(state, UXState::DoNotDisturb);
    }

    #[test]
    fn falls_back_to_idle_with_no_active_signal() {
        let state = reduce(AttentionState::Idle, MicrophoneState::Closed, false);
        assert_eq!(state, UXState::Idle);
    }

    struct RecordingObserver {
        tx: mpsc::Sender<UXState>,
    }
    impl UXObserver for RecordingObserver {
        fn on_ux_state_changed(&self, state: UXState) {
            let _ = self.tx.send(state);
        }
    }

    #[test]
    fn manager_notifies_exactly_once_per_distinct_state() {
        let (tx, rx) = mpsc::channel();
        let mgr = UxManager::new(Arc::new(RecordingObserver { tx }));

        mgr.set_attention(AttentionState::Thinking);
        mgr.set_attention(AttentionState::Thinking); // no-op, must not notify again
        mgr.set_microphone(MicrophoneState::Open); // Listening overrides Thinking
        mgr.set_microphone(MicrophoneState::Closed); // back to Thinking

        let seen: Vec<UXState> = rx.try_iter().collect();
        assert_eq!(seen, vec![UXState::Thinking, UXState::Listening, UXState::Thinking]);
    }
}

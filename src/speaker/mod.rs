//! Byte-addressed playback buffer, offset-scheduled action set, and the
//! OpenSpeaker/CloseSpeaker/barge-in state machine.
//!
//! Emission is driven explicitly: the owner calls [`SpeakerManager::tick`]
//! once per playback frame (in production, from a `TaskPool`-scheduled
//! repeating job; see [`SpeakerManager::start_playback_loop`]). This keeps
//! the ingestion path (`ingest_audio`) free of any assumption about how
//! fast the sink actually drains, which is what makes the overrun/underrun
//! thresholds meaningful: buffered bytes can genuinely accumulate
//! (ingestion outpacing playback) or run dry (playback outpacing ingestion).

mod ring;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::collaborators::{Regulator, TaskHandle, TaskPool};
use ring::AudioRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Pending,
    Playing,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStateEvent {
    OverrunWarning,
    UnderrunWarning,
    PlaybackStarted,
    Idle,
}

pub trait BufferStateObserver: Send + Sync {
    fn on_buffer_state_changed(&self, event: BufferStateEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionHandle(u64);

enum ScheduledAction {
    Start(ActionHandle),
    Stop(ActionHandle),
    SetVolume(ActionHandle, f32),
    User(ActionHandle, Option<Box<dyn FnOnce(bool) + Send>>),
}

impl ScheduledAction {
    fn handle(&self) -> ActionHandle {
        match self {
            ScheduledAction::Start(h) | ScheduledAction::Stop(h) | ScheduledAction::SetVolume(h, _) => *h,
            ScheduledAction::User(h, _) => *h,
        }
    }

    /// Invokes the user-supplied callback (if any) with `valid`, consuming it.
    fn invalidate(self) {
        if let ScheduledAction::User(_, Some(cb)) = self {
            cb(false);
        }
    }
}

struct Inner {
    ring: AudioRing,
    state: PlaybackState,
    actions: BTreeMap<u64, Vec<ScheduledAction>>,
    by_handle: std::collections::HashMap<ActionHandle, u64>,
    overrun_latched: bool,
    underrun_latched: bool,
    tick_timer: Option<TaskHandle>,
}

pub struct SpeakerManager {
    inner: Mutex<Inner>,
    overrun_threshold: usize,
    underrun_threshold: usize,
    play_speaker_data: Box<dyn Fn(&[u8]) + Send + Sync>,
    set_volume: Box<dyn Fn(f32) + Send + Sync>,
    play_offline_alert: Box<dyn Fn() + Send + Sync>,
    stop_offline_alert: Box<dyn Fn() + Send + Sync>,
    buffer_state_observer: Arc<dyn BufferStateObserver>,
    regulator: Arc<dyn Regulator>,
    task_pool: Arc<dyn TaskPool>,
    next_handle: AtomicU64,
    self_weak: Mutex<Weak<SpeakerManager>>,
}

impl SpeakerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        buffer_size: usize,
        overrun_warning_threshold: usize,
        underrun_warning_threshold: usize,
        play_speaker_data: impl Fn(&[u8]) + Send + Sync + 'static,
        set_volume: impl Fn(f32) + Send + Sync + 'static,
        play_offline_alert: impl Fn() + Send + Sync + 'static,
        stop_offline_alert: impl Fn() + Send + Sync + 'static,
        buffer_state_observer: Arc<dyn BufferStateObserver>,
        regulator: Arc<dyn Regulator>,
        task_pool: Arc<dyn TaskPool>,
    ) -> Arc<Self> {
        assert!(buffer_size > 0, "a speaker buffer needs positive capacity");
        let mgr = Arc::new(Self {
            inner: Mutex::new(Inner {
                ring: AudioRing::new(buffer_size),
                state: PlaybackState::Idle,
                actions: BTreeMap::new(),
                by_handle: std::collections::HashMap::new(),
                overrun_latched: false,
                underrun_latched: false,
                tick_timer: None,
            }),
            overrun_threshold: overrun_warning_threshold,
            underrun_threshold: underrun_warning_threshold,
            play_speaker_data: Box::new(play_speaker_data),
            set_volume: Box::new(set_volume),
            play_offline_alert: Box::new(play_offline_alert),
            stop_offline_alert: Box::new(stop_offline_alert),
            buffer_state_observer,
            regulator,
            task_pool,
            next_handle: AtomicU64::new(1),
            self_weak: Mutex::new(Weak::new()),
        });
        *mgr.self_weak.lock() = Arc::downgrade(&mgr);
        mgr
    }

    pub fn current_offset(&self) -> u64 {
        self.inner.lock().ring.play_offset()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    /// Plays the local offline-indication tone. Called by the connection
    /// layer when the cloud link drops, since the alert itself is audio
    /// routed through this same speaker path.
    pub fn play_offline_alert(&self) {
        (self.play_offline_alert)();
    }

    pub fn stop_offline_alert(&self) {
        (self.stop_offline_alert)();
    }

    /// Schedules a repeating tick on the owned `TaskPool`; production use
    /// calls this once after construction. Tests drive `tick` directly
    /// instead, for determinism.
    pub fn start_playback_loop(self: &Arc<Self>, frame_duration: Duration, frame_bytes: usize) {
        let weak = Arc::downgrade(self);
        self.schedule_next_tick(weak, frame_duration, frame_bytes);
    }

    fn schedule_next_tick(&self, weak: Weak<SpeakerManager>, frame_duration: Duration, frame_bytes: usize) {
        let handle = self.task_pool.schedule(
            frame_duration,
            Box::new(move || {
                if let Some(mgr) = weak.upgrade() {
                    mgr.tick(frame_bytes);
                    mgr.schedule_next_tick(weak.clone(), frame_duration, frame_bytes);
                }
            }),
        );
        self.inner.lock().tick_timer = Some(handle);
    }

    pub fn ingest_audio(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let admitted = inner.ring.push(bytes);
        if admitted < bytes.len() {
            warn!(dropped = bytes.len() - admitted, "speaker ring buffer overrun, audio discarded");
        }
        self.check_overrun_locked(&mut inner);
        if matches!(inner.state, PlaybackState::Playing | PlaybackState::Stopping) {
            self.check_underrun_locked(&mut inner);
        }
    }

    /// One playback frame. Pops up to `frame_bytes`, firing any actions
    /// whose trigger offset falls within the bytes consumed this tick.
    pub fn tick(&self, frame_bytes: usize) {
        let mut to_invoke: Vec<ScheduledAction> = Vec::new();
        let mut data_to_emit: Vec<u8> = Vec::new();
        let mut became_idle = false;
        let mut became_playing = false;

        {
            let mut inner = self.inner.lock();
            let mut budget = frame_bytes;

            loop {
                self.fire_ready_actions_locked(&mut inner, &mut to_invoke, &mut became_idle, &mut became_playing);
                if budget == 0 {
                    break;
                }

                let play_offset = inner.ring.play_offset();
                let write_offset = inner.ring.write_offset();
                let available = ((write_offset - play_offset) as usize).min(budget);
                if available == 0 {
                    if matches!(inner.state, PlaybackState::Playing | PlaybackState::Stopping) {
                        self.check_underrun_locked(&mut inner);
                    }
                    break;
                }

                let next_action_offset = inner.actions.keys().next().copied();
                let take = match next_action_offset {
                    Some(off) if off > play_offset => ((off - play_offset) as usize).min(available),
                    _ => available,
                };

                match inner.state {
                    PlaybackState::Idle | PlaybackState::Pending => {
                        inner.ring.skip(take);
                    }
                    PlaybackState::Playing | PlaybackState::Stopping => {
                        let chunk = inner.ring.pop(take);
                        data_to_emit.extend_from_slice(&chunk);
                        self.check_underrun_locked(&mut inner);
                    }
                }
                budget -= take;
            }

            self.check_overrun_locked(&mut inner);
        }

        if !data_to_emit.is_empty() {
            (self.play_speaker_data)(&data_to_emit);
        }
        for action in to_invoke {
            action.invalidate_as_fired();
        }
        if became_playing {
            self.buffer_state_observer.on_buffer_state_changed(BufferStateEvent::PlaybackStarted);
        }
        if became_idle {
            self.buffer_state_observer.on_buffer_state_changed(BufferStateEvent::Idle);
        }
    }

    /// Fires (and removes) every scheduled action whose trigger offset has
    /// already been reached by the play cursor. Called both from `tick`
    /// (as the cursor advances) and right after scheduling (so an offset at
    /// or behind the current cursor fires without waiting for a tick).
    fn fire_ready_actions_locked(
        &self,
        inner: &mut Inner,
        to_invoke: &mut Vec<ScheduledAction>,
        became_idle: &mut bool,
        became_playing: &mut bool,
    ) {
        loop {
            let play_offset = inner.ring.play_offset();
            let Some(&off) = inner.actions.keys().next() else { break };
            if off > play_offset {
                break;
            }
            let actions = inner.actions.remove(&off).expect("key came from the map");
            for a in &actions {
                inner.by_handle.remove(&a.handle());
            }
            for action in actions {
                self.apply_action_locked(inner, action, to_invoke, became_idle, became_playing);
            }
        }
    }

    /// Applies the manager-internal effect of a fired action and queues any
    /// user callback invocation for after the lock is released.
    fn apply_action_locked(
        &self,
        inner: &mut Inner,
        action: ScheduledAction,
        to_invoke: &mut Vec<ScheduledAction>,
        became_idle: &mut bool,
        became_playing: &mut bool,
    ) {
        match action {
            ScheduledAction::Start(_) => {
                if inner.state == PlaybackState::Pending || inner.state == PlaybackState::Stopping {
                    inner.state = PlaybackState::Playing;
                    *became_playing = true;
                }
            }
            ScheduledAction::Stop(_) => {
                if inner.state == PlaybackState::Playing || inner.state == PlaybackState::Stopping {
                    inner.state = PlaybackState::Idle;
                    *became_idle = true;
                }
            }
            ScheduledAction::SetVolume(_, vol) => {
                (self.set_volume)(vol);
            }
            ScheduledAction::User(..) => {
                to_invoke.push(action);
            }
        }
    }

    fn check_overrun_locked(&self, inner: &mut Inner) {
        let buffered = inner.ring.buffered_bytes();
        let capacity = inner.ring.capacity();
        let over = buffered > capacity.saturating_sub(self.overrun_threshold);
        if over && !inner.overrun_latched {
            inner.overrun_latched = true;
            self.buffer_state_observer.on_buffer_state_changed(BufferStateEvent::OverrunWarning);
        } else if !over {
            inner.overrun_latched = false;
        }
    }

    fn check_underrun_locked(&self, inner: &mut Inner) {
        let buffered = inner.ring.buffered_bytes();
        let under = buffered < self.underrun_threshold;
        if under && !inner.underrun_latched {
            inner.underrun_latched = true;
            self.buffer_state_observer.on_buffer_state_changed(BufferStateEvent::UnderrunWarning);
        } else if !under {
            inner.underrun_latched = false;
        }
    }

    /// `OpenSpeaker{offset}` directive.
    pub fn open_speaker(&self, offset: u64) {
        let mut inner = self.inner.lock();
        self.cancel_kind_locked(&mut inner, |a| matches!(a, ScheduledAction::Start(_)));
        let state = inner.state;
        if state == PlaybackState::Idle || state == PlaybackState::Stopping {
            inner.state = PlaybackState::Pending;
        }
        let handle = self.alloc_handle();
        self.insert_action_locked(&mut inner, offset, ScheduledAction::Start(handle));
        drop(inner);
        self.fire_due_immediately();
    }

    /// `CloseSpeaker{offset}` directive.
    pub fn close_speaker(&self, offset: u64) {
        let mut inner = self.inner.lock();
        let state = inner.state;
        if state == PlaybackState::Idle {
            debug!("CloseSpeaker received while idle, ignoring");
            drop(inner);
            let err = crate::error::AiaError::Internal("CloseSpeaker received while speaker is idle".into());
            self.regulator.write_exception((&err).into());
            return;
        }
        self.cancel_kind_locked(&mut inner, |a| matches!(a, ScheduledAction::Stop(_)));
        if state == PlaybackState::Playing {
            inner.state = PlaybackState::Stopping;
        }
        let handle = self.alloc_handle();
        self.insert_action_locked(&mut inner, offset, ScheduledAction::Stop(handle));
        drop(inner);
        self.fire_due_immediately();
    }

    /// `SetVolume` directive, delivered as an offset-scheduled action
    ///.
    pub fn set_volume_at(&self, offset: u64, volume: f32) -> ActionHandle {
        let handle = self.alloc_handle();
        let mut inner = self.inner.lock();
        self.insert_action_locked(&mut inner, offset, ScheduledAction::SetVolume(handle, volume));
        drop(inner);
        self.fire_due_immediately();
        handle
    }

    /// Public `invokeAtOffset` API: runs `callback(true)` once the play
    /// cursor reaches `offset`, or `callback(false)` if cancelled/barged-in
    /// on first.
    pub fn invoke_at_offset(&self, offset: u64, callback: impl FnOnce(bool) + Send + 'static) -> ActionHandle {
        let handle = self.alloc_handle();
        let mut inner = self.inner.lock();
        self.insert_action_locked(&mut inner, offset, ScheduledAction::User(handle, Some(Box::new(callback))));
        drop(inner);
        self.fire_due_immediately();
        handle
    }

    pub fn cancel(&self, handle: ActionHandle) {
        let mut inner = self.inner.lock();
        let Some(offset) = inner.by_handle.remove(&handle) else { return };
        let Some(actions) = inner.actions.get_mut(&offset) else { return };
        if let Some(pos) = actions.iter().position(|a| a.handle() == handle) {
            let action = actions.remove(pos);
            if actions.is_empty() {
                inner.actions.remove(&offset);
            }
            drop(inner);
            action.invalidate();
        }
    }

    /// Barge-in: invalidates every pending action, drops all buffered
    /// audio, and resets offsets and state to IDLE.
    pub fn barge_in(&self) {
        let mut drained: Vec<ScheduledAction> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (_, actions) in inner.actions.iter_mut() {
                drained.append(actions);
            }
            inner.actions.clear();
            inner.by_handle.clear();
            inner.ring.reset();
            inner.state = PlaybackState::Idle;
            inner.overrun_latched = false;
            inner.underrun_latched = false;
        }
        for action in drained {
            action.invalidate();
        }
    }

    fn alloc_handle(&self) -> ActionHandle {
        ActionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn insert_action_locked(&self, inner: &mut Inner, offset: u64, action: ScheduledAction) {
        let handle = action.handle();
        inner.by_handle.insert(handle, offset);
        inner.actions.entry(offset).or_default().push(action);
    }

    fn cancel_kind_locked(&self, inner: &mut Inner, pred: impl Fn(&ScheduledAction) -> bool) {
        let mut to_invalidate = Vec::new();
        let offsets: Vec<u64> = inner.actions.keys().copied().collect();
        for off in offsets {
            if let Some(actions) = inner.actions.get_mut(&off) {
                let mut i = 0;
                while i < actions.len() {
                    if pred(&actions[i]) {
                        let a = actions.remove(i);
                        inner.by_handle.remove(&a.handle());
                        to_invalidate.push(a);
                    } else {
                        i += 1;
                    }
                }
                if actions.is_empty() {
                    inner.actions.remove(&off);
                }
            }
        }
        for a in to_invalidate {
            a.invalidate();
        }
    }

    /// Fires any action just inserted at or behind the current play cursor
    /// immediately, rather than waiting for a tick that may never advance
    /// past it.
    fn fire_due_immediately(&self) {
        let mut to_invoke: Vec<ScheduledAction> = Vec::new();
        let mut became_idle = false;
        let mut became_playing = false;
        {
            let mut inner = self.inner.lock();
            self.fire_ready_actions_locked(&mut inner, &mut to_invoke, &mut became_idle, &mut became_playing);
        }
        for action in to_invoke {
            action.invalidate_as_fired();
        }
        if became_playing {
            self.buffer_state_observer.on_buffer_state_changed(BufferStateEvent::PlaybackStarted);
        }
        if became_idle {
            self.buffer_state_observer.on_buffer_state_changed(BufferStateEvent::Idle);
        }
    }
}

impl ScheduledAction {
    fn invalidate_as_fired(self) {
        if let ScheduledAction::User(_, Some(cb)) = self {
            cb(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_pool::ThreadTaskPool;
    use std::sync::mpsc;

    struct RecordingObserver {
        tx: Mutex<mpsc::Sender<BufferStateEvent>>,
    }

    impl BufferStateObserver for RecordingObserver {
        fn on_buffer_state_changed(&self, event: BufferStateEvent) {
            let _ = self.tx.lock().send(event);
        }
    }

    struct NullRegulator;
    impl Regulator for NullRegulator {
        fn write_exception(&self, _event: crate::error::ExceptionEvent) {}
    }

    fn harness(
        buffer_size: usize,
        overrun: usize,
        underrun: usize,
    ) -> (Arc<SpeakerManager>, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<BufferStateEvent>) {
        let (played_tx, played_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let observer = Arc::new(RecordingObserver { tx: Mutex::new(events_tx) });
        let mgr = SpeakerManager::create(
            buffer_size,
            overrun,
            underrun,
            move |bytes: &[u8]| {
                let _ = played_tx.send(bytes.to_vec());
            },
            |_vol: f32| {},
            || {},
            || {},
            observer,
            Arc::new(NullRegulator),
            Arc::new(ThreadTaskPool::new(2)),
        );
        (mgr, played_rx, events_rx)
    }

    #[test]
    fn open_at_zero_then_data_then_close_plays_once() {
        let (mgr, played, events) = harness(4096, 512, 64);
        mgr.open_speaker(0);
        assert_eq!(mgr.state(), PlaybackState::Playing);
        mgr.ingest_audio(&[7u8; 1024]);
        mgr.tick(1024);
        mgr.close_speaker(1024);

        let chunk = played.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(chunk.len(), 1024);
        assert!(played.try_recv().is_err());
        assert_eq!(mgr.state(), PlaybackState::Idle);

        let mut saw_idle = false;
        while let Ok(ev) = events.try_recv() {
            if ev == BufferStateEvent::Idle {
                saw_idle = true;
            }
        }
        assert!(saw_idle);
    }

    #[test]
    fn open_speaker_at_current_offset_fires_playback_started_immediately() {
        let (mgr, _played, events) = harness(4096, 512, 64);
        mgr.open_speaker(0);
        assert_eq!(events.recv_timeout(Duration::from_millis(500)).unwrap(), BufferStateEvent::PlaybackStarted);
    }

    #[test]
    fn data_arriving_before_open_is_discarded_not_played() {
        let (mgr, played, _events) = harness(4096, 512, 64);
        mgr.ingest_audio(&[1u8; 256]);
        mgr.tick(256);
        assert_eq!(mgr.current_offset(), 256);
        assert!(played.try_recv().is_err());

        mgr.open_speaker(256);
        mgr.ingest_audio(&[2u8; 64]);
        mgr.tick(64);
        let chunk = played.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(chunk, vec![2u8; 64]);
    }

    #[test]
    fn barge_in_invalidates_pending_actions_and_resets_offset() {
        let (mgr, _played, _events) = harness(4096, 512, 64);
        mgr.ingest_audio(&[9u8; 512]);
        mgr.tick(512);

        let (tx, rx) = mpsc::channel();
        mgr.invoke_at_offset(1000, move |valid| {
            let _ = tx.send(valid);
        });

        mgr.barge_in();

        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), false);
        assert_eq!(mgr.current_offset(), 0);
        assert_eq!(mgr.state(), PlaybackState::Idle);
    }

    #[test]
    fn overrun_warning_latches_once_until_it_clears() {
        let (mgr, _played, events) = harness(100, 20, 5);
        mgr.ingest_audio(&[0u8; 90]); // buffered=90 > 100-20=80 -> warn
        mgr.ingest_audio(&[0u8; 1]); // still over threshold, must not re-fire
        assert_eq!(events.recv_timeout(Duration::from_millis(200)).unwrap(), BufferStateEvent::OverrunWarning);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn underrun_warning_fires_while_playing_with_little_buffered() {
        let (mgr, _played, events) = harness(4096, 512, 100);
        mgr.open_speaker(0);
        mgr.ingest_audio(&[5u8; 10]);
        mgr.tick(10);
        mgr.tick(10); // nothing left buffered, armed and starved
        let ev = events.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(ev, BufferStateEvent::UnderrunWarning);
    }

    #[test]
    fn underrun_warning_fires_while_still_nonempty_but_below_threshold() {
        let (mgr, _played, events) = harness(4096, 512, 100);
        mgr.open_speaker(0);
        mgr.ingest_audio(&[5u8; 200]);
        mgr.tick(128); // buffered drops from 200 to 72, still nonempty but under 100
        let ev = events.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(ev, BufferStateEvent::UnderrunWarning);
    }

    #[test]
    fn underrun_latch_clears_on_refill_and_refires_on_a_second_episode() {
        let (mgr, _played, events) = harness(4096, 512, 100);
        mgr.open_speaker(0);
        mgr.ingest_audio(&[5u8; 10]);
        mgr.tick(10);
        mgr.tick(10); // drained to 0, latches the warning
        assert_eq!(events.recv_timeout(Duration::from_millis(500)).unwrap(), BufferStateEvent::UnderrunWarning);

        mgr.ingest_audio(&[5u8; 500]); // refills well above the threshold, clears the latch
        assert!(events.try_recv().is_err());

        mgr.tick(500); // drains to 0 again: a second episode must warn again
        assert_eq!(events.recv_timeout(Duration::from_millis(500)).unwrap(), BufferStateEvent::UnderrunWarning);
    }

    #[test]
    fn cancel_invokes_callback_with_false() {
        let (mgr, _played, _events) = harness(4096, 512, 64);
        let (tx, rx) = mpsc::channel();
        let handle = mgr.invoke_at_offset(500, move |valid| {
            let _ = tx.send(valid);
        });
        mgr.cancel(handle);
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), false);
    }

    #[test]
    fn reopen_while_stopping_schedules_new_start_and_returns_to_pending() {
        let (mgr, _played, _events) = harness(4096, 512, 64);
        mgr.open_speaker(0);
        mgr.ingest_audio(&[1u8; 50]);
        mgr.tick(50); // play_offset = 50, still Playing
        mgr.close_speaker(100); // stop offset not reached yet -> Stopping
        assert_eq!(mgr.state(), PlaybackState::Stopping);

        mgr.open_speaker(150); // reopen before the pending stop fires
        assert_eq!(mgr.state(), PlaybackState::Pending);

        mgr.ingest_audio(&[2u8; 100]);
        mgr.tick(100); // crosses both the stop@100 and start@150 boundaries
        assert_eq!(mgr.state(), PlaybackState::Playing);
    }
}

//! Per-topic reorder buffer with timeout on missing numbers.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::collaborators::{TaskHandle, TaskPool};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequencerError {
    #[error("sequence number {0} is outside the current window")]
    OutOfWindow(u32),
    #[error("message carries no extractable sequence number")]
    Malformed,
    #[error("sequencer has been destroyed")]
    Destroyed,
}

/// What `enqueue` did with the message, for diagnostics/tests. Only
/// `Duplicate`/`OutOfWindow` represent "discarded" outcomes;
/// `Buffered`/`Delivered` are both successful acceptances.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Stored, not yet deliverable (a gap remains in front of it).
    Buffered,
    /// Stored and immediately delivered (possibly along with a run of
    /// previously-buffered contiguous messages).
    Delivered,
    /// `n < nextExpected`; silently dropped as a duplicate.
    Duplicate,
}

struct Window<T> {
    next_expected: u32,
    /// `slots[i]` holds the message for sequence number `next_expected + i`.
    slots: VecDeque<Option<T>>,
    timer: Option<TaskHandle>,
    /// Bumped on every (re)arm/disarm/reset so a fired timer can detect
    /// it refers to a stale arming and ignore itself.
    generation: u64,
    destroyed: bool,
}

pub struct Sequencer<T> {
    window: Mutex<Window<T>>,
    max_slots: usize,
    timeout: Duration,
    task_pool: Arc<dyn TaskPool>,
    on_sequenced: Box<dyn Fn(T) + Send + Sync>,
    on_timeout: Box<dyn Fn(u32) + Send + Sync>,
    extract_seq: Box<dyn Fn(&T) -> Option<u32> + Send + Sync>,
    self_weak: Mutex<Weak<Sequencer<T>>>,
}

impl<T: Send + 'static> Sequencer<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        on_sequenced: impl Fn(T) + Send + Sync + 'static,
        on_timeout: impl Fn(u32) + Send + Sync + 'static,
        extract_seq: impl Fn(&T) -> Option<u32> + Send + Sync + 'static,
        next_expected: u32,
        max_slots: usize,
        sequence_timeout: Duration,
        task_pool: Arc<dyn TaskPool>,
    ) -> Arc<Self> {
        assert!(max_slots > 0, "a sequencer needs at least one slot");
        let mut slots = VecDeque::with_capacity(max_slots);
        slots.resize_with(max_slots, || None);
        let seq = Arc::new(Self {
            window: Mutex::new(Window { next_expected, slots, timer: None, generation: 0, destroyed: false }),
            max_slots,
            timeout: sequence_timeout,
            task_pool,
            on_sequenced: Box::new(on_sequenced),
            on_timeout: Box::new(on_timeout),
            extract_seq: Box::new(extract_seq),
            self_weak: Mutex::new(Weak::new()),
        });
        *seq.self_weak.lock() = Arc::downgrade(&seq);
        seq
    }

    /// Non-blocking: accepts the message in any arrival order, buffers it,
    /// and drains any now-contiguous run starting at `nextExpected`.
    pub fn enqueue(&self, message: T) -> Result<EnqueueOutcome, SequencerError> {
        let n = (self.extract_seq)(&message).ok_or(SequencerError::Malformed)?;

        let mut to_deliver: Vec<T> = Vec::new();
        let outcome;
        {
            let mut w = self.window.lock();
            if w.destroyed {
                return Err(SequencerError::Destroyed);
            }
            if n < w.next_expected {
                trace!(seq = n, next_expected = w.next_expected, "duplicate/late message dropped");
                return Ok(EnqueueOutcome::Duplicate);
            }
            let offset = (n - w.next_expected) as usize;
            if offset >= self.max_slots {
                warn!(seq = n, next_expected = w.next_expected, max_slots = self.max_slots, "sequence number out of window");
                return Err(SequencerError::OutOfWindow(n));
            }
            w.slots[offset] = Some(message);

            // Drain: while slot 0 is present, take it, advance, shift window.
            while let Some(slot) = w.slots.front_mut() {
                if slot.is_none() {
                    break;
                }
                let msg = slot.take().unwrap();
                to_deliver.push(msg);
                w.slots.pop_front();
                w.slots.push_back(None);
                w.next_expected = w.next_expected.wrapping_add(1);
            }

            outcome = if to_deliver.is_empty() { EnqueueOutcome::Buffered } else { EnqueueOutcome::Delivered };

            self.rearm_or_disarm_locked(&mut w);
        }

        // Invoke callbacks with the lock released.
        for msg in to_deliver {
            (self.on_sequenced)(msg);
        }

        Ok(outcome)
    }

    /// Clears all slots, sets `nextExpected = n`, disarms the timer.
    /// Callable from the timeout callback or a reconnect path.
    pub fn reset_to(&self, n: u32) {
        let mut w = self.window.lock();
        if w.destroyed {
            return;
        }
        for slot in w.slots.iter_mut() {
            *slot = None;
        }
        w.next_expected = n;
        self.disarm_locked(&mut w);
    }

    /// Stops scheduled work and releases slots. Idempotent.
    pub fn destroy(&self) {
        let mut w = self.window.lock();
        if w.destroyed {
            return;
        }
        let dropped = w.slots.iter().filter(|s| s.is_some()).count();
        if dropped > 0 {
            debug!(dropped, "sequencer destroyed with buffered messages still pending");
        }
        for slot in w.slots.iter_mut() {
            *slot = None;
        }
        self.disarm_locked(&mut w);
        w.destroyed = true;
    }

    pub fn next_expected(&self) -> u32 {
        self.window.lock().next_expected
    }

    fn disarm_locked(&self, w: &mut Window<T>) {
        if let Some(handle) = w.timer.take() {
            self.task_pool.cancel(handle);
        }
        w.generation = w.generation.wrapping_add(1);
    }

    /// Arms once (no reset-on-rearm) if a gap remains with later data
    /// buffered; disarms if the window is empty.
    fn rearm_or_disarm_locked(&self, w: &mut Window<T>) {
        let gap_remains = w.slots.front().map(|s| s.is_none()).unwrap_or(false);
        let any_buffered = w.slots.iter().any(|s| s.is_some());

        if !gap_remains {
            // Either fully drained (front present can't happen post-drain)
            // or window empty entirely.
            if !any_buffered {
                self.disarm_locked(w);
            }
            return;
        }

        if w.timer.is_some() {
            // Already armed: do not reset the timer on a rearm.
            return;
        }

        let expected_at_arm = w.next_expected;
        w.generation = w.generation.wrapping_add(1);
        let generation = w.generation;
        let weak = self.self_weak.lock().clone();
        let handle = self.task_pool.schedule(
            self.timeout,
            Box::new(move || {
                if let Some(seq) = weak.upgrade() {
                    seq.fire_timeout(generation, expected_at_arm);
                }
            }),
        );
        w.timer = Some(handle);
    }

    fn fire_timeout(&self, generation: u64, expected_at_arm: u32) {
        let still_relevant = {
            let mut w = self.window.lock();
            if w.destroyed || w.generation != generation {
                false
            } else {
                // The timer fired; it is now spent regardless of outcome.
                w.timer = None;
                true
            }
        };
        if still_relevant {
            (self.on_timeout)(expected_at_arm);
        }
    }
}

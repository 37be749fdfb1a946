//! External collaborator contracts.
//!
//! The core never depends on a concrete MQTT/crypto-library/storage crate
//! beyond the two named AEAD/KDF primitives. Every other side-effecting
//! dependency crosses this trait boundary so the engines stay
//! unit-testable with fakes.

use std::time::Duration;

use crate::error::{AiaError, ExceptionEvent};

/// `taskPool.schedule(fn, delayMs) -> handle` / `cancel(handle)`.
///
/// Implementations must treat `schedule` as non-blocking: the call enqueues
/// work and returns immediately, and the scheduled closure runs on a worker
/// thread (or embedded task context), never inline.
pub trait TaskPool: Send + Sync {
    fn schedule(&self, delay: Duration, job: Box<dyn FnOnce() + Send>) -> TaskHandle;
    fn cancel(&self, handle: TaskHandle);
}

/// Opaque handle into a `TaskPool`. `0` is never issued by a real pool, so
/// it doubles as an "invalid/none" sentinel for callers that want one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

impl TaskHandle {
    pub const INVALID: TaskHandle = TaskHandle(0);
}

/// `regulator.write(event)` for outbound events.
pub trait Regulator: Send + Sync {
    fn write_exception(&self, event: ExceptionEvent);
}

/// `random.fill(buf, n)`.
pub trait SecureRandom: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// `blobStore.store/load(key, bytes)`, used for the persisted
/// topic-root key (`AiaTopicRootKey`).
pub trait BlobStore: Send + Sync {
    fn load(&self, key: &str) -> Option<Vec<u8>>;
    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), AiaError>;
}

/// `mqtt.publish(topic, bytes)` / `mqtt.subscribe(topic, cb)`.
///
/// The core is handed already-demultiplexed inbound bytes via a channel
/// (see `router::TopicRouter`); this trait exists so an integrator has a
/// single place to wire a concrete MQTT client to the crate, and so tests
/// can assert on what got published without a broker.
pub trait MqttTransport: Send + Sync {
    fn publish(&self, topic: &str, bytes: &[u8]) -> Result<(), AiaError>;
    fn subscribe(&self, topic: &str) -> Result<(), AiaError>;
}

//! Default `TaskPool`: a small bounded worker-thread pool plus a delay
//! thread, following a one-thread-per-duty model generalized into a
//! reusable scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::collaborators::{TaskHandle, TaskPool};

struct PendingJob {
    fire_at: Instant,
    job: Option<Box<dyn FnOnce() + Send>>,
    cancelled: bool,
}

/// Single dispatcher thread that sleeps until the next deadline, plus a
/// fixed worker pool that actually runs the fired jobs so a slow callback
/// never stalls the timer thread.
pub struct ThreadTaskPool {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, PendingJob>>>,
    running: Arc<AtomicBool>,
    wake_tx: crossbeam_channel::Sender<()>,
    workers: crossbeam_channel::Sender<Box<dyn FnOnce() + Send>>,
    _dispatcher: thread::JoinHandle<()>,
    _worker_handles: Vec<thread::JoinHandle<()>>,
}

impl ThreadTaskPool {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let pending: Arc<Mutex<HashMap<u64, PendingJob>>> = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded::<()>();
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<Box<dyn FnOnce() + Send>>();

        let worker_handles: Vec<_> = (0..worker_count.max(1))
            .map(|_| {
                let rx = work_rx.clone();
                thread::spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
            })
            .collect();

        let dispatcher = {
            let pending = pending.clone();
            let running = running.clone();
            let work_tx = work_tx.clone();
            thread::spawn(move || Self::dispatch_loop(pending, running, wake_rx, work_tx))
        };

        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending,
            running,
            wake_tx,
            workers: work_tx,
            _dispatcher: dispatcher,
            _worker_handles: worker_handles,
        })
    }

    fn dispatch_loop(
        pending: Arc<Mutex<HashMap<u64, PendingJob>>>,
        running: Arc<AtomicBool>,
        wake_rx: crossbeam_channel::Receiver<()>,
        work_tx: crossbeam_channel::Sender<Box<dyn FnOnce() + Send>>,
    ) {
        while running.load(Ordering::Acquire) {
            let next_deadline = {
                let guard = pending.lock();
                guard.values().filter(|j| !j.cancelled).map(|j| j.fire_at).min()
            };
            let timeout = match next_deadline {
                Some(at) => at.saturating_duration_since(Instant::now()),
                None => Duration::from_millis(200),
            };
            let _ = wake_rx.recv_timeout(timeout);
            if !running.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();
            let mut fired = Vec::new();
            {
                let mut guard = pending.lock();
                let due: Vec<u64> = guard
                    .iter()
                    .filter(|(_, j)| !j.cancelled && j.fire_at <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in due {
                    if let Some(mut job) = guard.remove(&id) {
                        if let Some(f) = job.job.take() {
                            fired.push(f);
                        }
                    }
                }
            }
            for job in fired {
                let _ = work_tx.send(job);
            }
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.wake_tx.send(());
    }
}

impl Drop for ThreadTaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TaskPool for ThreadTaskPool {
    fn schedule(&self, delay: Duration, job: Box<dyn FnOnce() + Send>) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(
            id,
            PendingJob { fire_at: Instant::now() + delay, job: Some(job), cancelled: false },
        );
        let _ = self.wake_tx.send(());
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) {
        if let Some(job) = self.pending.lock().get_mut(&handle.0) {
            job.cancelled = true;
            job.job = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay_on_worker_thread() {
        let pool = ThreadTaskPool::new(2);
        let (tx, rx) = mpsc::channel();
        pool.schedule(Duration::from_millis(20), Box::new(move || {
            tx.send(()).unwrap();
        }));
        rx.recv_timeout(Duration::from_secs(2)).expect("job should fire");
    }

    #[test]
    fn cancel_prevents_firing() {
        let pool = ThreadTaskPool::new(1);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = pool.schedule(Duration::from_millis(50), Box::new(move || {
            tx.send(()).unwrap();
        }));
        pool.cancel(handle);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}

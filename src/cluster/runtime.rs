//! Bounded worker pool for candidate search.
//!
//! Embedding and store lookups are the only blocking calls in a batch. They
//! run on a small thread pool fed by a bounded channel, so the caller can
//! wait on each one with a deadline and a slow embedding service fails one
//! mention instead of stalling the batch.
//!
//! A task's deadline starts when a worker picks it up, not when it is
//! queued. A task that overruns its deadline keeps its worker until it
//! returns, so the pool starts a replacement worker for it; the overrunning
//! worker retires once its task finishes.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const ABANDONED: u8 = 3;

struct Job {
    state: Arc<AtomicU8>,
    started: Sender<Instant>,
    run: Box<dyn FnOnce() + Send + 'static>,
}

/// Why a pooled task produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolError {
    QueueFull { capacity: usize },
    Disconnected,
    Timeout { duration_ms: u64 },
}

struct Shared {
    rx: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    stuck: AtomicUsize,
}

impl Shared {
    fn spawn_worker(self: &Arc<Self>) -> io::Result<()> {
        let idx = self.spawned.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("kyro-resolve-search-{idx}"))
            .spawn(move || shared.work(idx))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    fn work(&self, idx: usize) {
        while let Ok(job) = self.rx.recv() {
            // Skipped: its waiter went away before a worker got to it.
            if job
                .state
                .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let _ = job.started.send(Instant::now());
            if panic::catch_unwind(AssertUnwindSafe(job.run)).is_err() {
                tracing::error!(worker = idx, "search task panicked");
            }
            if job
                .state
                .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // A replacement already took this worker's place.
                let stuck = self.stuck.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                tracing::debug!(worker = idx, stuck, "retiring worker after overrunning task");
                break;
            }
        }
    }

    fn replace_stuck_worker(self: &Arc<Self>) {
        let stuck = self.stuck.load(Ordering::Acquire);
        tracing::warn!(stuck, "search task overran its deadline, starting a replacement worker");
        if let Err(err) = self.spawn_worker() {
            tracing::error!(error = %err, "failed to start replacement search worker");
        }
    }
}

pub(crate) struct SearchPool {
    tx: Option<Sender<Job>>,
    shared: Arc<Shared>,
    queue_capacity: usize,
}

impl SearchPool {
    pub(crate) fn start(workers: usize, queue_capacity: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let shared = Arc::new(Shared {
            rx,
            workers: Mutex::new(Vec::with_capacity(workers)),
            spawned: AtomicUsize::new(0),
            stuck: AtomicUsize::new(0),
        });
        for _ in 0..workers {
            shared.spawn_worker()?;
        }

        Ok(Self {
            tx: Some(tx),
            shared,
            queue_capacity,
        })
    }

    pub(crate) const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Queues `f` without blocking.
    pub(crate) fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let Some(tx) = self.tx.as_ref() else {
            return Err(PoolError::Disconnected);
        };
        let (reply, rx) = bounded::<T>(1);
        let (started_tx, started) = bounded::<Instant>(1);
        let state = Arc::new(AtomicU8::new(QUEUED));
        let job = Job {
            state: Arc::clone(&state),
            started: started_tx,
            run: Box::new(move || {
                // The waiter may have timed out and gone.
                let _ = reply.send(f());
            }),
        };
        match tx.try_send(job) {
            Ok(()) => Ok(TaskHandle {
                rx,
                started,
                state,
                shared: Arc::clone(&self.shared),
                settled: false,
            }),
            Err(TrySendError::Full(_)) => Err(PoolError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Disconnected),
        }
    }

    #[cfg(test)]
    fn stuck_workers(&self) -> usize {
        self.shared.stuck.load(Ordering::Acquire)
    }
}

impl Drop for SearchPool {
    fn drop(&mut self) {
        // Close the channel: workers drain queued tasks then exit.
        drop(self.tx.take());
        loop {
            let handles = std::mem::take(
                &mut *self
                    .shared
                    .workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

/// Pending result of a pooled task.
pub(crate) struct TaskHandle<T> {
    rx: Receiver<T>,
    started: Receiver<Instant>,
    state: Arc<AtomicU8>,
    shared: Arc<Shared>,
    settled: bool,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("settled", &self.settled).finish_non_exhaustive()
    }
}

impl<T> TaskHandle<T> {
    #[cfg(test)]
    pub(crate) fn join(mut self) -> Result<T, PoolError> {
        self.settled = true;
        self.rx.recv().map_err(|_| PoolError::Disconnected)
    }

    /// Waits until the task has run for at most `timeout`. Time spent in the
    /// queue does not count. After a timeout the task keeps running on its
    /// worker and its result is discarded.
    pub(crate) fn join_timeout(mut self, timeout: Duration) -> Result<T, PoolError> {
        let Ok(started_at) = self.started.recv() else {
            self.settled = true;
            return Err(PoolError::Disconnected);
        };
        match self.rx.recv_deadline(started_at + timeout) {
            Ok(value) => {
                self.settled = true;
                Ok(value)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.settled = true;
                Err(PoolError::Disconnected)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.settled = true;
                if self.abandon() {
                    Err(PoolError::Timeout {
                        #[allow(clippy::cast_possible_truncation)]
                        duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                    })
                } else {
                    // Finished right at the deadline.
                    self.rx.try_recv().map_err(|_| PoolError::Disconnected)
                }
            }
        }
    }

    /// Gives up on the task. A queued task is skipped; a running one gets a
    /// replacement worker. Returns false when the task had already finished.
    fn abandon(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current != QUEUED && current != RUNNING {
                return current == ABANDONED;
            }
            // Counted before the swap so the retiring worker never sees zero.
            if current == RUNNING {
                self.shared.stuck.fetch_add(1, Ordering::AcqRel);
            }
            match self
                .state
                .compare_exchange(current, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if current == RUNNING {
                        self.shared.replace_stuck_worker();
                    }
                    return true;
                }
                Err(actual) => {
                    if current == RUNNING {
                        self.shared.stuck.fetch_sub(1, Ordering::AcqRel);
                    }
                    current = actual;
                }
            }
        }
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_tasks_and_returns_results() {
        let pool = SearchPool::start(2, 8).unwrap();
        let handles: Vec<_> = (0..4).map(|i| pool.submit(move || i * 10).unwrap()).collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![0, 10, 20, 30]);
    }

    #[test]
    fn join_timeout_reports_timeout() {
        let pool = SearchPool::start(1, 4).unwrap();
        let handle = pool
            .submit(|| thread::sleep(Duration::from_millis(200)))
            .unwrap();
        let started = Instant::now();
        let err = handle.join_timeout(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, PoolError::Timeout { duration_ms: 20 });
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(pool.stuck_workers(), 1);
    }

    #[test]
    fn full_queue_is_reported() {
        let pool = SearchPool::start(1, 1).unwrap();
        let (started_tx, started_rx) = bounded::<()>(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        // Occupy the only worker until the gate opens.
        let busy = pool
            .submit(move || {
                let _ = started_tx.send(());
                let _ = gate_rx.recv_timeout(Duration::from_secs(2));
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let queued = pool.submit(|| 1u8).unwrap();
        let err = pool.submit(|| 2u8).unwrap_err();
        assert_eq!(err, PoolError::QueueFull { capacity: 1 });

        gate_tx.send(()).unwrap();
        busy.join().unwrap();
        assert_eq!(queued.join().unwrap(), 1);
    }

    #[test]
    fn panicking_task_disconnects_only_its_handle() {
        let pool = SearchPool::start(1, 4).unwrap();
        let bad = pool.submit(|| -> u8 { panic!("boom") }).unwrap();
        assert_eq!(bad.join().unwrap_err(), PoolError::Disconnected);
        let good = pool.submit(|| 7u8).unwrap();
        assert_eq!(good.join().unwrap(), 7);
    }

    #[test]
    fn panicking_task_reports_disconnected_not_timeout() {
        let pool = SearchPool::start(1, 4).unwrap();
        let bad = pool.submit(|| -> u8 { panic!("boom") }).unwrap();
        assert_eq!(
            bad.join_timeout(Duration::from_millis(500)).unwrap_err(),
            PoolError::Disconnected
        );
        assert_eq!(pool.stuck_workers(), 0);
    }

    #[test]
    fn queue_time_does_not_count_against_the_deadline() {
        let pool = SearchPool::start(1, 4).unwrap();
        let slow = pool.submit(|| thread::sleep(Duration::from_millis(120))).unwrap();
        let fast = pool.submit(|| 5u8).unwrap();
        // The fast task waits ~120ms in the queue, far longer than its budget.
        slow.join().unwrap();
        assert_eq!(fast.join_timeout(Duration::from_millis(30)).unwrap(), 5);
    }

    #[test]
    fn overrunning_tasks_do_not_starve_later_tasks() {
        let pool = SearchPool::start(2, 8).unwrap();
        let slow: Vec<_> = (0..3)
            .map(|_| pool.submit(|| thread::sleep(Duration::from_millis(400))).unwrap())
            .collect();
        let fast: Vec<_> = (0..3u8).map(|i| pool.submit(move || i).unwrap()).collect();

        let budget = Duration::from_millis(50);
        for handle in slow {
            assert_eq!(
                handle.join_timeout(budget).unwrap_err(),
                PoolError::Timeout { duration_ms: 50 }
            );
        }
        let results: Vec<u8> = fast
            .into_iter()
            .map(|h| h.join_timeout(budget).unwrap())
            .collect();
        assert_eq!(results, vec![0, 1, 2]);
    }

    #[test]
    fn overrunning_worker_retires_after_its_task() {
        let pool = SearchPool::start(1, 4).unwrap();
        let slow = pool.submit(|| thread::sleep(Duration::from_millis(60))).unwrap();
        slow.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert_eq!(pool.stuck_workers(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.stuck_workers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.stuck_workers(), 0);
        assert_eq!(pool.submit(|| 9u8).unwrap().join().unwrap(), 9);
    }
}

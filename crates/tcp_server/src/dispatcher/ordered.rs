//! Worker pool with one FIFO queue per thread.

use super::DispatchError;
use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A unit of work. Errors are logged by the worker that ran it.
pub type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Counters reported by [`OrderedDispatcher::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs that ran, successfully or not.
    pub executed: u64,
    /// Jobs that returned an error or panicked.
    pub failed: u64,
    /// Jobs dropped because the grace period ran out.
    pub discarded: u64,
}

#[derive(Default)]
struct WorkerStats {
    deadline: OnceLock<Instant>,
    executed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl WorkerStats {
    fn past_deadline(&self) -> bool {
        self.deadline.get().is_some_and(|d| Instant::now() >= *d)
    }

    fn report(&self) -> ShutdownReport {
        ShutdownReport {
            executed: self.executed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            discarded: self.discarded.load(Ordering::Acquire),
        }
    }
}

/// Fixed pool of worker threads, one FIFO queue each.
///
/// `dispatch(key, job)` routes to worker `key % workers`, so all jobs for a
/// key are serialised on one thread. A failing or panicking job is logged and
/// the worker carries on with the next one.
pub struct OrderedDispatcher {
    name: String,
    queues: RwLock<Option<Vec<Sender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<WorkerStats>,
    size: usize,
}

impl OrderedDispatcher {
    /// Spawns `size` worker threads named `{name}-worker-{i}`.
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let stats = Arc::new(WorkerStats::default());
        let mut queues = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = channel::unbounded::<Job>();
            let stats = Arc::clone(&stats);
            let spawned = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(index, rx, stats));

            match spawned {
                Ok(handle) => {
                    queues.push(tx);
                    workers.push(handle);
                }
                Err(e) => {
                    // Let the threads already running exit before failing.
                    drop(queues);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        debug!("🧵 Dispatcher '{}' started with {} workers", name, size);
        Ok(Self {
            name: name.to_string(),
            queues: RwLock::new(Some(queues)),
            workers: Mutex::new(workers),
            stats,
            size,
        })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.size
    }

    /// Queues `job` on the worker owning `key`.
    pub fn dispatch(&self, key: u64, job: Job) -> Result<(), DispatchError> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let queues = queues.as_ref().ok_or(DispatchError::ShuttingDown)?;
        let index = (key % queues.len() as u64) as usize;
        queues[index].send(job).map_err(|_| DispatchError::ShuttingDown)
    }

    /// Stops accepting jobs and waits for the workers to exit.
    ///
    /// Queued jobs keep running until `grace` elapses; whatever is still
    /// queued after that is discarded. A job already running is allowed to
    /// finish. This call blocks; async callers should run it on a blocking
    /// thread. Calling it again returns the same counters.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let queues = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if queues.is_none() {
            return self.stats.report();
        }

        let _ = self.stats.deadline.set(Instant::now() + grace);
        drop(queues);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("❌ Dispatcher '{}' worker exited abnormally", self.name);
            }
        }

        let report = self.stats.report();
        if report.discarded > 0 {
            warn!(
                "⚠️ Dispatcher '{}' discarded {} queued jobs after the {:?} grace period",
                self.name, report.discarded, grace
            );
        }
        info!(
            "🛑 Dispatcher '{}' stopped: {} executed, {} failed",
            self.name, report.executed, report.failed
        );
        report
    }
}

impl Drop for OrderedDispatcher {
    fn drop(&mut self) {
        // Closing the queues lets detached workers exit on their own.
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn worker_loop(index: usize, jobs: Receiver<Job>, stats: Arc<WorkerStats>) {
    for job in jobs.iter() {
        if stats.past_deadline() {
            stats.discarded.fetch_add(1, Ordering::AcqRel);
            continue;
        }

        let outcome = catch_unwind(AssertUnwindSafe(job));
        stats.executed.fetch_add(1, Ordering::AcqRel);
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::AcqRel);
                warn!(worker = index, "Job failed: {:#}", e);
            }
            Err(panic) => {
                stats.failed.fetch_add(1, Ordering::AcqRel);
                error!(worker = index, "💥 Job panicked: {}", panic_message(&*panic));
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const LONG_GRACE: Duration = Duration::from_secs(10);

    #[test]
    fn test_jobs_for_one_key_run_in_order() {
        let dispatcher = OrderedDispatcher::new("order", 4).unwrap();
        let seen: Arc<Mutex<HashMap<u64, Vec<u32>>>> = Arc::default();

        for seq in 0..100u32 {
            for key in 0..8u64 {
                let seen = Arc::clone(&seen);
                dispatcher
                    .dispatch(
                        key,
                        Box::new(move || {
                            seen.lock().unwrap().entry(key).or_default().push(seq);
                            Ok(())
                        }),
                    )
                    .unwrap();
            }
        }

        let report = dispatcher.shutdown(LONG_GRACE);
        assert_eq!(report.executed, 800);
        assert_eq!(report.discarded, 0);

        let seen = seen.lock().unwrap();
        let expected: Vec<u32> = (0..100).collect();
        for key in 0..8u64 {
            assert_eq!(seen[&key], expected, "key {key} out of order");
        }
    }

    #[test]
    fn test_different_keys_run_concurrently() {
        let dispatcher = OrderedDispatcher::new("concurrent", 2).unwrap();
        let (a_tx, a_rx) = channel::bounded::<()>(1);
        let (b_tx, b_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::unbounded::<bool>();

        // Each job signals the other and waits for the reply; this only
        // completes if both run at the same time.
        let done = done_tx.clone();
        dispatcher
            .dispatch(
                0,
                Box::new(move || {
                    a_tx.send(()).unwrap();
                    done.send(b_rx.recv_timeout(Duration::from_secs(5)).is_ok()).unwrap();
                    Ok(())
                }),
            )
            .unwrap();
        dispatcher
            .dispatch(
                1,
                Box::new(move || {
                    b_tx.send(()).unwrap();
                    done_tx.send(a_rx.recv_timeout(Duration::from_secs(5)).is_ok()).unwrap();
                    Ok(())
                }),
            )
            .unwrap();

        assert!(done_rx.recv_timeout(Duration::from_secs(10)).unwrap());
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).unwrap());
        dispatcher.shutdown(LONG_GRACE);
    }

    #[test]
    fn test_failing_and_panicking_jobs_do_not_stop_worker() {
        let dispatcher = OrderedDispatcher::new("faults", 1).unwrap();
        let (tx, rx) = channel::unbounded();

        dispatcher
            .dispatch(7, Box::new(|| Err(anyhow::anyhow!("handler failed"))))
            .unwrap();
        dispatcher
            .dispatch(
                7,
                Box::new(|| -> anyhow::Result<()> { panic!("handler panicked") }),
            )
            .unwrap();
        dispatcher
            .dispatch(
                7,
                Box::new(move || {
                    tx.send("still alive").unwrap();
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still alive");
        let report = dispatcher.shutdown(LONG_GRACE);
        assert_eq!(report.executed, 3);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn test_shutdown_discards_after_grace() {
        let dispatcher = OrderedDispatcher::new("drain", 1).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(1);
        let (started_tx, started_rx) = channel::bounded::<()>(1);

        dispatcher
            .dispatch(
                0,
                Box::new(move || {
                    started_tx.send(()).unwrap();
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                    Ok(())
                }),
            )
            .unwrap();
        for _ in 0..10 {
            dispatcher.dispatch(0, Box::new(|| Ok(()))).unwrap();
        }
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = release_tx.send(());
        });
        let report = dispatcher.shutdown(Duration::ZERO);
        releaser.join().unwrap();

        assert_eq!(report.executed, 1);
        assert_eq!(report.discarded, 10);
    }

    #[test]
    fn test_dispatch_after_shutdown_is_rejected() {
        let dispatcher = OrderedDispatcher::new("closed", 2).unwrap();
        let first = dispatcher.shutdown(LONG_GRACE);

        let err = dispatcher.dispatch(1, Box::new(|| Ok(()))).unwrap_err();
        assert_eq!(err, DispatchError::ShuttingDown);
        assert_eq!(dispatcher.shutdown(LONG_GRACE), first);
    }
}

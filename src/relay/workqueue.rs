//! Shared deferred-work executor
//!
//! All ports schedule their connect and modem-write work on one executor:
//! a dedicated tokio runtime whose blocking pool is sized by configuration,
//! not by port count. Work items behave like kernel work structs:
//! - scheduling an item that is already pending is a no-op
//! - an item never runs concurrently with itself
//! - scheduling an item while it runs makes the running task go again,
//!   so one item never holds more than one executor thread

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// How long teardown waits for running work before abandoning it
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkState {
    Idle,
    /// Spawned, not started yet
    Pending,
    Running,
    /// Scheduled again while running
    Rerun,
}

/// A deferred unit of work
pub struct Work {
    name: &'static str,
    state: Mutex<WorkState>,
    func: Box<dyn Fn() + Send + Sync>,
}

impl Work {
    pub fn new<F>(name: &'static str, func: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            name,
            state: Mutex::new(WorkState::Idle),
            func: Box::new(func),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a run is scheduled but has not started yet
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), WorkState::Pending | WorkState::Rerun)
    }

    /// Mark the item scheduled; `Some(true)` means the caller must spawn it
    fn schedule(&self) -> Option<bool> {
        let mut state = self.state.lock();
        match *state {
            WorkState::Idle => {
                *state = WorkState::Pending;
                Some(true)
            }
            WorkState::Running => {
                *state = WorkState::Rerun;
                Some(false)
            }
            WorkState::Pending | WorkState::Rerun => None,
        }
    }

    fn run(&self) {
        *self.state.lock() = WorkState::Running;
        loop {
            (self.func)();

            let mut state = self.state.lock();
            if *state == WorkState::Rerun {
                *state = WorkState::Running;
                continue;
            }
            *state = WorkState::Idle;
            break;
        }
    }
}

/// Executor shared by every port of a relay service
pub struct WorkQueue {
    name: String,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    tracker: TaskTracker,
    flush_lock: Mutex<()>,
    destroyed: AtomicBool,
}

impl WorkQueue {
    /// Create the executor with at most `workers` work items running at once
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(RelayError::InvalidArgument(
                "workqueue needs at least one worker".to_string(),
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name(name)
            .enable_time()
            .build()
            .map_err(|e| {
                RelayError::ResourceExhausted(format!("unable to create workqueue {}: {}", name, e))
            })?;
        let handle = runtime.handle().clone();

        info!("Workqueue {} created with {} workers", name, workers);
        Ok(Self {
            name: name.to_string(),
            runtime: Mutex::new(Some(runtime)),
            handle,
            tracker: TaskTracker::new(),
            flush_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule a work item
    ///
    /// Returns `false` if the item was already pending or the executor has
    /// been destroyed. An item scheduled while it runs is rerun by the
    /// task already running it.
    pub fn queue(&self, work: &Arc<Work>) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            warn!("{}: dropping work {} after destroy", self.name, work.name());
            return false;
        }
        match work.schedule() {
            None => return false,
            Some(false) => return true,
            Some(true) => {}
        }

        let work = work.clone();
        self.tracker
            .spawn_blocking_on(move || work.run(), &self.handle);
        true
    }

    /// Number of scheduled or running work items
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every scheduled work item, including ones scheduled while
    /// waiting, has finished
    ///
    /// Must be called from outside any tokio runtime; from inside one it
    /// logs and returns without waiting.
    pub fn flush(&self) {
        if Handle::try_current().is_ok() {
            warn!("{}: flush from runtime context skipped", self.name);
            return;
        }
        let _flush = self.flush_lock.lock();
        self.tracker.close();
        self.handle.block_on(self.tracker.wait());
        self.tracker.reopen();
    }

    /// Flush outstanding work and shut the executor down
    ///
    /// Idempotent. Callers must make sure nothing reschedules work
    /// afterwards; later `queue` calls are refused.
    pub fn destroy(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        self.flush();
        self.destroyed.store(true, Ordering::Release);

        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        debug!("Workqueue {} destroyed", self.name);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_queue_runs_work() {
        let wq = WorkQueue::new("test_wq", 1).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let work = Work::new("count", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wq.queue(&work));
        wq.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!work.is_pending());
    }

    #[test]
    fn test_pending_work_is_coalesced() {
        let wq = WorkQueue::new("test_wq", 1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let count = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker so the next item stays pending
        let blocker = Work::new("blocker", move || {
            let _ = gate_rx.lock().recv();
        });
        let c = count.clone();
        let work = Work::new("count", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wq.queue(&blocker));
        assert!(wq.queue(&work));
        assert!(!wq.queue(&work));
        assert!(!wq.queue(&work));

        gate_tx.send(()).unwrap();
        wq.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_work_can_requeue_itself_once() {
        let wq = Arc::new(WorkQueue::new("test_wq", 2).unwrap());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let wq_ref = Arc::downgrade(&wq);
        let slot: Arc<Mutex<Option<Arc<Work>>>> = Arc::new(Mutex::new(None));
        let slot_ref = slot.clone();
        let work = Work::new("requeue", move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                if let (Some(wq), Some(work)) = (wq_ref.upgrade(), slot_ref.lock().clone()) {
                    assert!(wq.queue(&work));
                }
            }
        });
        *slot.lock() = Some(work.clone());

        wq.queue(&work);
        wq.flush();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        slot.lock().take();
    }

    #[test]
    fn test_requeue_while_running_reuses_thread() {
        let wq = WorkQueue::new("test_wq", 2).unwrap();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let gate_rx = Mutex::new(gate_rx);
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let work = Work::new("slow", move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = started_tx.lock().send(());
                let _ = gate_rx.lock().recv();
            }
        });

        assert!(wq.queue(&work));
        started_rx.recv().unwrap();
        // Running: the reschedule is absorbed by the running task
        assert!(wq.queue(&work));
        assert!(!wq.queue(&work));
        assert!(work.is_pending());
        assert_eq!(wq.in_flight(), 1);

        gate_tx.send(()).unwrap();
        wq.flush();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!work.is_pending());
    }

    #[test]
    fn test_destroy_refuses_new_work() {
        let wq = WorkQueue::new("test_wq", 1).unwrap();
        let work = Work::new("noop", || {});
        wq.destroy();
        assert!(wq.is_destroyed());
        assert!(!wq.queue(&work));
        // Second destroy is a no-op
        wq.destroy();
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkQueue::new("test_wq", 0),
            Err(RelayError::InvalidArgument(_))
        ));
    }
}

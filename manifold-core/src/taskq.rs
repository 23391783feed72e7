//! Completion task queue.
//!
//! AIO callbacks never run on the thread that finished the operation: they
//! are queued here and executed by a small pool of worker threads. This keeps
//! providers from re-entering themselves through a callback that resubmits,
//! and bounds stack depth for long callback chains (send → recv → send ...).

use flume::{Receiver, Sender};
use once_cell::sync::Lazy;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide callback executor.
pub(crate) struct TaskQueue {
    tx: Sender<Task>,
    workers: usize,
}

static TASKQ: Lazy<TaskQueue> = Lazy::new(|| TaskQueue::start(num_cpus::get().max(2)));

impl TaskQueue {
    fn start(count: usize) -> Self {
        let (tx, rx) = flume::unbounded::<Task>();
        let mut workers = 0;
        for id in 0..count {
            let rx = rx.clone();
            match thread::Builder::new()
                .name(format!("manifold-taskq-{id}"))
                .spawn(move || worker(id, rx))
            {
                Ok(_) => workers += 1,
                Err(e) => error!("[TASKQ] Failed to spawn worker {}: {}", id, e),
            }
        }
        debug!(workers, "[TASKQ] Started");
        Self { tx, workers }
    }

    fn dispatch(&self, task: Task) {
        if self.workers == 0 {
            // No executor threads could be spawned; degrade to inline execution.
            run_task(task);
            return;
        }
        if let Err(flume::SendError(task)) = self.tx.send(task) {
            warn!("[TASKQ] Queue disconnected, running task inline");
            run_task(task);
        }
    }
}

fn worker(id: usize, rx: Receiver<Task>) {
    debug!("[TASKQ] Worker {} running", id);
    while let Ok(task) = rx.recv() {
        run_task(task);
    }
    debug!("[TASKQ] Worker {} stopped", id);
}

fn run_task(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("[TASKQ] Completion callback panicked");
    }
}

/// Queue a task for execution on a worker thread.
pub(crate) fn dispatch(task: impl FnOnce() + Send + 'static) {
    TASKQ.dispatch(Box::new(task));
}

/// Number of worker threads executing callbacks.
#[must_use]
pub fn worker_count() -> usize {
    TASKQ.workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_off_thread() {
        let caller = thread::current().id();
        let (tx, rx) = flume::bounded(1);
        dispatch(move || {
            tx.send(thread::current().id()).unwrap();
        });
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn test_panicking_task_does_not_kill_pool() {
        for _ in 0..worker_count() {
            dispatch(|| panic!("boom"));
        }
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::bounded(1);
        let c = counter.clone();
        dispatch(move || {
            c.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

//! I/O threads for the stream transports.
//!
//! TCP and IPC sockets are driven by a small pool of threads, each running
//! its own `compio` runtime. Work is handed over as closures that build the
//! future on the I/O thread, so sockets and tasks never cross threads.
//! Connections are spread round-robin over the pool.
//!
//! Everything that may block on the network (accepts, dials, handshakes,
//! frame reads) runs under a [`CloseSignal`]. Firing the signal drops the
//! pending future, which cancels the operation and releases the socket.

use crate::error::{ManifoldError, Result};
use flume::{Receiver, Sender};
use futures::future::{self, Either};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

const IO_THREADS: usize = 2;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Reactor {
    workers: Vec<Sender<Job>>,
    next: AtomicUsize,
}

static REACTOR: Lazy<Reactor> = Lazy::new(|| Reactor::start(IO_THREADS));

impl Reactor {
    fn start(count: usize) -> Self {
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = flume::unbounded::<Job>();
            match thread::Builder::new()
                .name(format!("manifold-io-{id}"))
                .spawn(move || io_thread(id, rx))
            {
                Ok(_) => workers.push(tx),
                Err(e) => error!("[REACTOR] Failed to spawn I/O thread {}: {}", id, e),
            }
        }
        debug!(threads = workers.len(), "[REACTOR] Started");
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.workers.is_empty() {
            return Err(ManifoldError::Closed);
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[slot]
            .send(job)
            .map_err(|_| ManifoldError::Closed)
    }
}

fn io_thread(id: usize, rx: Receiver<Job>) {
    let rt = match compio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("[REACTOR] I/O thread {} failed to create runtime: {}", id, e);
            return;
        }
    };
    debug!("[REACTOR] I/O thread {} running", id);
    rt.block_on(async move {
        while let Ok(job) = rx.recv_async().await {
            job();
        }
    });
    debug!("[REACTOR] I/O thread {} stopped", id);
}

/// Run the future built by `make` as a detached task on an I/O thread.
///
/// # Errors
///
/// `Closed` if no I/O thread is available.
pub(crate) fn spawn<F, Fut>(make: F) -> Result<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    REACTOR.submit(Box::new(move || {
        compio::runtime::spawn(make()).detach();
    }))
}

/// Spawn a detached task on the current I/O thread. Only valid from code
/// already running on one.
pub(crate) fn spawn_local<Fut>(fut: Fut)
where
    Fut: Future<Output = ()> + 'static,
{
    compio::runtime::spawn(fut).detach();
}

/// Run the future built by `make` on an I/O thread and block the calling
/// thread for its output. Must not be called from an I/O thread.
///
/// # Errors
///
/// The future's own error, or `Closed` if the I/O thread went away.
pub(crate) fn block_on<T, F, Fut>(make: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    let (tx, rx) = flume::bounded(1);
    spawn(move || async move {
        let _ = tx.send(make().await);
    })?;
    rx.recv().map_err(|_| ManifoldError::Closed)?
}

/// One-shot close notification usable from any thread.
///
/// Firing drops the only sender, which wakes every [`wait`](Self::wait).
#[derive(Clone)]
pub(crate) struct CloseSignal {
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub(crate) fn fire(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Resolve once the signal fires.
    pub(crate) async fn wait(&self) {
        // Nothing is ever sent: the only wakeup is the sender going away.
        let _ = self.rx.recv_async().await;
    }
}

/// Drive `fut` until it completes or `signal` fires, whichever is first.
///
/// # Errors
///
/// `Closed` if the signal fired first; otherwise the future's own result.
pub(crate) async fn or_closed<T, Fut>(signal: &CloseSignal, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    if signal.is_fired() {
        return Err(ManifoldError::Closed);
    }
    match future::select(pin!(fut), pin!(signal.wait())).await {
        Either::Left((out, _)) => out,
        Either::Right(((), _)) => Err(ManifoldError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_block_on_returns_output() {
        let out = block_on(|| async { Ok::<_, ManifoldError>(21 * 2) }).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_fired_signal_aborts_pending_future() {
        let signal = CloseSignal::new();
        let s = signal.clone();
        let waiter = thread::spawn(move || {
            block_on(move || async move {
                or_closed(&s, async {
                    compio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<(), ManifoldError>(())
                })
                .await
            })
        });
        thread::sleep(Duration::from_millis(20));
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(matches!(waiter.join().unwrap(), Err(ManifoldError::Closed)));
    }

    #[test]
    fn test_fired_signal_refuses_new_work() {
        let signal = CloseSignal::new();
        signal.fire();
        assert!(signal.is_fired());
        let s = signal.clone();
        let out = block_on(move || async move {
            or_closed(&s, async { Ok::<_, ManifoldError>(1) }).await
        });
        assert!(matches!(out, Err(ManifoldError::Closed)));
    }
}

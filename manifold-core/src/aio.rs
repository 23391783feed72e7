//! Asynchronous operations (AIO).
//!
//! An [`Aio`] represents one in-flight send, receive or queue operation. It
//! carries an optional completion callback, the result of the last
//! operation, an attached [`Message`], and an optional timeout.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──begin()──▶ Started ──finish(result)──▶ Done { Ok | Err | Canceled | Expired }
//!                      ▲                          │
//!                      └──────────begin()─────────┘
//! ```
//!
//! The submitter calls [`Aio::begin`]. A provider (queue, pipe, transport)
//! that cannot complete immediately registers a cancel hook with
//! [`Aio::schedule`] and keeps the AIO on an [`AioList`]. Whoever removes the
//! AIO from that list under the provider's lock owns the right to call
//! [`Aio::finish`], which makes cancellation and natural completion mutually
//! exclusive: exactly one of them is ever observed.
//!
//! Callbacks run on the shared task queue, never on the finishing thread.
//!
//! ```rust
//! use manifold_core::aio::Aio;
//! use manifold_core::msgqueue::MsgQueue;
//! use manifold_core::message::Message;
//!
//! let queue = MsgQueue::new(4);
//! queue.push_nowait(Message::from("ping")).unwrap();
//!
//! let aio = Aio::new();
//! queue.pop_aio(&aio).unwrap();
//! aio.wait();
//! assert!(aio.result().is_ok());
//! assert_eq!(aio.take_msg().unwrap().body(), b"ping");
//! ```

use crate::error::{ManifoldError, Result};
use crate::expire;
use crate::message::Message;
use crate::taskq;
use crate::waitblock::Waitblock;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::trace;

/// Identifier of an AIO, unique for the process lifetime.
pub type AioId = u64;

static NEXT_AIO_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// Marks the current task queue thread as running a completion callback and
/// settles the AIO when the callback returns or unwinds.
struct CallbackScope<'a> {
    aio: &'a Aio,
    generation: u64,
    outer: bool,
}

impl<'a> CallbackScope<'a> {
    fn enter(aio: &'a Aio, generation: u64) -> Self {
        let outer = IN_CALLBACK.with(|c| c.replace(true));
        Self {
            aio,
            generation,
            outer,
        }
    }
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        IN_CALLBACK.with(|c| c.set(self.outer));
        self.aio.settle(self.generation);
    }
}

type Callback = Arc<dyn Fn(&Aio) + Send + Sync>;

/// Provider hook invoked when a scheduled AIO is canceled or expires.
///
/// Receives the AIO, the generation it was scheduled under, and the error
/// to complete it with. The hook must only finish the AIO if it is still on
/// the provider's wait list for that generation.
pub type CancelFn = Box<dyn FnOnce(&Aio, u64, ManifoldError) + Send>;

/// Observable phase of an AIO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioPhase {
    Idle,
    Started,
    Done,
}

struct AioState {
    phase: AioPhase,
    generation: u64,
    result: Result<()>,
    msg: Option<Message>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: Option<CancelFn>,
    pending_abort: Option<ManifoldError>,
    expire_seq: Option<u64>,
    /// Generation whose completion callback is queued or running.
    callback_pending: Option<u64>,
    closed: bool,
}

struct AioInner {
    id: AioId,
    state: Mutex<AioState>,
    callback: Mutex<Option<Callback>>,
    wb: Waitblock,
    waker: AtomicWaker,
}

/// Handle to an asynchronous operation. Clones share the same operation.
#[derive(Clone)]
pub struct Aio {
    inner: Arc<AioInner>,
}

/// Non-owning AIO handle, for callbacks that refer to sibling AIOs.
#[derive(Clone)]
pub struct WeakAio {
    inner: Weak<AioInner>,
}

impl WeakAio {
    #[must_use]
    pub fn upgrade(&self) -> Option<Aio> {
        self.inner.upgrade().map(|inner| Aio { inner })
    }
}

impl Default for Aio {
    fn default() -> Self {
        Self::new()
    }
}

impl Aio {
    /// Create an AIO without a callback; completion is observed with
    /// [`wait`](Self::wait) or [`completion`](Self::completion).
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an AIO whose `callback` runs once per completed submission.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&Aio) + Send + Sync + 'static,
    {
        Self::build(Some(Arc::new(callback)))
    }

    fn build(callback: Option<Callback>) -> Self {
        let wb = Waitblock::new();
        // An idle AIO has nothing outstanding; waiting on it returns at once.
        wb.done();
        Self {
            inner: Arc::new(AioInner {
                id: NEXT_AIO_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(AioState {
                    phase: AioPhase::Idle,
                    generation: 0,
                    result: Ok(()),
                    msg: None,
                    timeout: None,
                    deadline: None,
                    cancel: None,
                    pending_abort: None,
                    expire_seq: None,
                    callback_pending: None,
                    closed: false,
                }),
                callback: Mutex::new(callback),
                wb,
                waker: AtomicWaker::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> AioId {
        self.inner.id
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakAio {
        WeakAio {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Set the relative timeout applied to subsequent submissions.
    /// `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.lock().timeout = timeout;
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.state.lock().timeout
    }

    /// Attach a message, replacing (and dropping) any previous one.
    pub fn set_msg(&self, msg: Message) {
        self.inner.state.lock().msg = Some(msg);
    }

    /// Take the attached message. A received message is handed out once.
    pub fn take_msg(&self) -> Option<Message> {
        self.inner.state.lock().msg.take()
    }

    #[must_use]
    pub fn has_msg(&self) -> bool {
        self.inner.state.lock().msg.is_some()
    }

    /// Result of the most recent completion (`Ok` while idle).
    pub fn result(&self) -> Result<()> {
        self.inner.state.lock().result.clone()
    }

    #[must_use]
    pub fn phase(&self) -> AioPhase {
        self.inner.state.lock().phase
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// True from submission until the completion callback has returned.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.inner.wb.is_done()
    }

    /// Block until the current submission completed and its callback ran.
    ///
    /// Must not be called from the AIO's own callback.
    pub fn wait(&self) {
        self.inner.wb.wait();
    }

    // --- submitter / provider side ---------------------------------------

    /// Mark the AIO as started. Called by every submission entry point.
    ///
    /// # Errors
    ///
    /// `InvalidState` if a previous submission is still in flight, or if its
    /// completion callback has not returned yet and the caller is not itself
    /// running inside a completion callback. `Closed` if the AIO was closed
    /// or stopped.
    ///
    /// Callbacks may resubmit their own AIO, and callback chains may
    /// resubmit each other's; such a callback must have consumed the result
    /// and message of the AIO it was handed before starting work that
    /// resubmits it.
    pub fn begin(&self) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.closed {
            return Err(ManifoldError::Closed);
        }
        if st.phase == AioPhase::Started {
            return Err(ManifoldError::InvalidState);
        }
        if st.callback_pending.is_some() && !in_callback() {
            return Err(ManifoldError::InvalidState);
        }
        st.phase = AioPhase::Started;
        st.generation += 1;
        st.result = Ok(());
        st.cancel = None;
        st.pending_abort = None;
        // A deadline past the clock's range means no deadline.
        st.deadline = st.timeout.and_then(|t| Instant::now().checked_add(t));
        self.inner.wb.reset();
        Ok(())
    }

    /// Register the provider's cancel hook and arm the deadline.
    ///
    /// # Errors
    ///
    /// Returns the error the AIO must be finished with right away: a
    /// cancellation that arrived before scheduling, or `Expired` if the
    /// deadline already passed (zero timeouts).
    pub fn schedule(&self, cancel: CancelFn) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.phase != AioPhase::Started {
            return Err(ManifoldError::InvalidState);
        }
        if let Some(e) = st.pending_abort.take() {
            return Err(e);
        }
        if let Some(deadline) = st.deadline {
            if deadline <= Instant::now() {
                return Err(ManifoldError::Expired);
            }
            st.expire_seq = Some(expire::arm(self.downgrade(), deadline, st.generation));
        }
        st.cancel = Some(cancel);
        Ok(())
    }

    /// Complete the current submission. Returns `false` if it was not in
    /// flight, in which case nothing happens.
    pub fn finish(&self, result: Result<()>) -> bool {
        let (generation, callback) = {
            let mut st = self.inner.state.lock();
            if st.phase != AioPhase::Started {
                return false;
            }
            st.phase = AioPhase::Done;
            st.result = result;
            st.cancel = None;
            st.pending_abort = None;
            if let Some(seq) = st.expire_seq.take() {
                expire::disarm(seq);
            }
            let callback = self.inner.callback.lock().clone();
            if callback.is_some() {
                st.callback_pending = Some(st.generation);
            }
            (st.generation, callback)
        };
        trace!(aio = self.id(), generation, "[AIO] Finished");
        self.inner.waker.wake();

        match callback {
            Some(cb) => {
                let aio = self.clone();
                taskq::dispatch(move || {
                    let _scope = CallbackScope::enter(&aio, generation);
                    cb(&aio);
                });
            }
            None => self.settle(generation),
        }
        true
    }

    /// Complete with an error, attaching nothing.
    pub fn finish_error(&self, err: ManifoldError) -> bool {
        self.finish(Err(err))
    }

    /// Release waiters, unless the callback already resubmitted the AIO.
    fn settle(&self, generation: u64) {
        let mut st = self.inner.state.lock();
        if st.callback_pending == Some(generation) {
            st.callback_pending = None;
        }
        if st.phase == AioPhase::Done && st.generation == generation {
            self.inner.wb.done();
        }
    }

    // --- cancellation -----------------------------------------------------

    /// Cancel the operation in flight; it completes with `Canceled`.
    /// No-op if nothing is in flight.
    pub fn cancel(&self) {
        self.abort(ManifoldError::Canceled);
    }

    /// Abort the operation in flight with `err`.
    pub fn abort(&self, err: ManifoldError) {
        self.abort_generation(None, err);
    }

    pub(crate) fn expire(&self, generation: u64) {
        self.abort_generation(Some(generation), ManifoldError::Expired);
    }

    fn abort_generation(&self, only: Option<u64>, err: ManifoldError) {
        let (hook, generation) = {
            let mut st = self.inner.state.lock();
            if st.phase != AioPhase::Started {
                return;
            }
            if only.is_some_and(|g| g != st.generation) {
                return;
            }
            match st.cancel.take() {
                Some(hook) => (hook, st.generation),
                None => {
                    // Not scheduled yet: the provider picks this up in schedule().
                    st.pending_abort = Some(err);
                    return;
                }
            }
        };
        hook(self, generation, err);
    }

    /// Abort any operation with `Closed` and refuse further submissions.
    /// Does not wait; safe to call from callbacks.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.abort(ManifoldError::Closed);
    }

    /// Close the AIO, wait for an outstanding callback, and drop the callback.
    ///
    /// Must not be called from the AIO's own callback.
    pub fn stop(&self) {
        self.close();
        self.wait();
        self.inner.callback.lock().take();
    }

    // --- blocking and async adapters ---------------------------------------

    /// Run one operation to completion on the calling thread.
    ///
    /// A fresh AIO is created with `timeout` and `msg`, handed to `submit`,
    /// and waited on. Returns the result (with `Expired` reported as
    /// `Timeout`) together with whatever message the AIO holds afterwards:
    /// the received message on success, or the unsent message on failure.
    pub fn run_blocking<F>(
        timeout: Option<Duration>,
        msg: Option<Message>,
        submit: F,
    ) -> (Result<()>, Option<Message>)
    where
        F: FnOnce(&Aio) -> Result<()>,
    {
        let aio = Aio::new();
        aio.set_timeout(timeout);
        if let Some(msg) = msg {
            aio.set_msg(msg);
        }
        if let Err(e) = submit(&aio) {
            return (Err(e), aio.take_msg());
        }
        aio.wait();
        let result = aio.result().map_err(ManifoldError::into_blocking);
        (result, aio.take_msg())
    }

    /// Future resolving when the current submission completes.
    ///
    /// Dropping the future before completion cancels the operation.
    #[must_use]
    pub fn completion(self) -> AioFuture {
        let generation = self.generation();
        AioFuture {
            aio: self,
            generation,
            early: None,
            finished: false,
        }
    }
}

impl fmt::Debug for Aio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Aio")
            .field("id", &self.inner.id)
            .field("phase", &st.phase)
            .field("generation", &st.generation)
            .field("result", &st.result)
            .finish()
    }
}

/// Future over an [`Aio`] submission, resolving to the received message
/// (if any) on success.
pub struct AioFuture {
    aio: Aio,
    generation: u64,
    early: Option<ManifoldError>,
    finished: bool,
}

impl AioFuture {
    /// A future that resolves immediately with `err` (submission refused).
    #[must_use]
    pub fn failed(aio: Aio, err: ManifoldError) -> Self {
        Self {
            aio,
            generation: 0,
            early: Some(err),
            finished: false,
        }
    }
}

impl Future for AioFuture {
    type Output = Result<Option<Message>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(e) = self.early.take() {
            self.finished = true;
            return Poll::Ready(Err(e));
        }
        self.aio.inner.waker.register(cx.waker());
        let mut st = self.aio.inner.state.lock();
        if st.phase == AioPhase::Done && st.generation == self.generation {
            let out = st.result.clone().map(|()| st.msg.take());
            drop(st);
            self.finished = true;
            return Poll::Ready(out);
        }
        Poll::Pending
    }
}

impl Drop for AioFuture {
    fn drop(&mut self) {
        if !self.finished {
            self.aio.cancel();
        }
    }
}

/// FIFO of scheduled AIOs kept by a provider.
///
/// Entries remember the generation they were queued under, so a late cancel
/// hook can never remove a resubmitted operation.
#[derive(Default)]
pub struct AioList {
    items: VecDeque<(Aio, u64)>,
}

impl AioList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, aio: Aio) {
        let generation = aio.generation();
        self.items.push_back((aio, generation));
    }

    pub fn pop_front(&mut self) -> Option<Aio> {
        self.items.pop_front().map(|(aio, _)| aio)
    }

    #[must_use]
    pub fn front(&self) -> Option<&Aio> {
        self.items.front().map(|(aio, _)| aio)
    }

    /// Remove `aio` if it is queued under `generation`.
    pub fn remove(&mut self, aio: &Aio, generation: u64) -> bool {
        match self
            .items
            .iter()
            .position(|(a, g)| a.id() == aio.id() && *g == generation)
        {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Aio> + '_ {
        self.items.drain(..).map(|(aio, _)| aio)
    }
}

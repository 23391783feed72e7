//! Bounded, closable message queue.
//!
//! [`MsgQueue`] is the hand-off point between application and protocol (the
//! socket's upper read and write queues) and between the two ends of an
//! inproc connection. It is an AIO provider: [`push_aio`](MsgQueue::push_aio)
//! and [`pop_aio`](MsgQueue::pop_aio) park operations that cannot complete
//! yet, and the blocking forms are just "submit and wait".
//!
//! Guarantees:
//! - never more than `capacity` messages held
//! - strict FIFO: messages leave in the order their push completed
//! - `close` is permanent, wakes every parked operation with `Closed`, and
//!   keeps already-queued messages available to `pop`

use crate::aio::{Aio, AioList, CancelFn};
use crate::error::{ManifoldError, Result};
use crate::message::Message;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

/// A push that did not happen. The message is handed back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PushError {
    pub error: ManifoldError,
    pub msg: Message,
}

impl PushError {
    /// Recover the message that was not queued.
    #[must_use]
    pub fn into_msg(self) -> Message {
        self.msg
    }
}

impl From<PushError> for ManifoldError {
    fn from(e: PushError) -> Self {
        e.error
    }
}

type Completions = SmallVec<[(Aio, Result<()>); 4]>;

#[derive(Clone, Copy)]
enum Side {
    Get,
    Put,
}

struct QueueState {
    items: VecDeque<Message>,
    cap: usize,
    closed: bool,
    getters: AioList,
    putters: AioList,
}

struct QueueInner {
    state: Mutex<QueueState>,
    drained: Condvar,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        for aio in st.getters.drain().chain(st.putters.drain()) {
            aio.finish_error(ManifoldError::Closed);
        }
    }
}

/// Handle to a shared message queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct MsgQueue {
    inner: Arc<QueueInner>,
}

impl MsgQueue {
    /// Create a queue holding at most `capacity` messages (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(cap.min(1024)),
                    cap,
                    closed: false,
                    getters: AioList::new(),
                    putters: AioList::new(),
                }),
                drained: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().cap
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn cancel_hook(&self, side: Side) -> CancelFn {
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        Box::new(move |aio, generation, err| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let removed = {
                let mut st = inner.state.lock();
                match side {
                    Side::Get => st.getters.remove(aio, generation),
                    Side::Put => st.putters.remove(aio, generation),
                }
            };
            if removed {
                trace!(aio = aio.id(), "[MSGQ] Parked operation aborted");
                aio.finish_error(err);
            }
        })
    }

    /// Submit a push of the message attached to `aio`.
    ///
    /// Completes when the message is queued (or handed straight to a waiting
    /// pop), on timeout with `Expired`, or with `Closed`. On failure the
    /// message stays attached to the AIO.
    ///
    /// # Errors
    ///
    /// Only submission errors from [`Aio::begin`].
    pub fn push_aio(&self, aio: &Aio) -> Result<()> {
        aio.begin()?;
        let mut done = Completions::new();
        {
            let mut st = self.inner.state.lock();
            if st.closed {
                done.push((aio.clone(), Err(ManifoldError::Closed)));
            } else if !aio.has_msg() {
                done.push((aio.clone(), Err(ManifoldError::invalid_value("message"))));
            } else if let Some(getter) = st.getters.pop_front() {
                if let Some(msg) = aio.take_msg() {
                    getter.set_msg(msg);
                }
                done.push((getter, Ok(())));
                done.push((aio.clone(), Ok(())));
            } else if st.items.len() < st.cap {
                if let Some(msg) = aio.take_msg() {
                    st.items.push_back(msg);
                }
                done.push((aio.clone(), Ok(())));
            } else {
                match aio.schedule(self.cancel_hook(Side::Put)) {
                    Ok(()) => st.putters.push_back(aio.clone()),
                    Err(e) => done.push((aio.clone(), Err(e))),
                }
            }
        }
        complete(done);
        Ok(())
    }

    /// Submit a pop; on success the message is attached to `aio`.
    ///
    /// # Errors
    ///
    /// Only submission errors from [`Aio::begin`].
    pub fn pop_aio(&self, aio: &Aio) -> Result<()> {
        aio.begin()?;
        let mut done = Completions::new();
        {
            let mut st = self.inner.state.lock();
            if let Some(msg) = self.take_front(&mut st, &mut done) {
                aio.set_msg(msg);
                done.push((aio.clone(), Ok(())));
            } else if st.closed {
                done.push((aio.clone(), Err(ManifoldError::Closed)));
            } else {
                match aio.schedule(self.cancel_hook(Side::Get)) {
                    Ok(()) => st.getters.push_back(aio.clone()),
                    Err(e) => done.push((aio.clone(), Err(e))),
                }
            }
        }
        complete(done);
        Ok(())
    }

    /// Pop the head message and refill from the first parked push.
    fn take_front(&self, st: &mut QueueState, done: &mut Completions) -> Option<Message> {
        let msg = st.items.pop_front()?;
        if let Some(putter) = st.putters.pop_front() {
            if let Some(next) = putter.take_msg() {
                st.items.push_back(next);
            }
            done.push((putter, Ok(())));
        }
        if st.items.is_empty() {
            self.inner.drained.notify_all();
        }
        Some(msg)
    }

    /// Queue `msg` without waiting.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if the queue is full, `Closed` if closed. The message is
    /// returned inside the error.
    pub fn push_nowait(&self, msg: Message) -> std::result::Result<(), PushError> {
        let mut done = Completions::new();
        let outcome = {
            let mut st = self.inner.state.lock();
            if st.closed {
                Err(PushError {
                    error: ManifoldError::Closed,
                    msg,
                })
            } else if let Some(getter) = st.getters.pop_front() {
                getter.set_msg(msg);
                done.push((getter, Ok(())));
                Ok(())
            } else if st.items.len() < st.cap {
                st.items.push_back(msg);
                Ok(())
            } else {
                Err(PushError {
                    error: ManifoldError::WouldBlock,
                    msg,
                })
            }
        };
        complete(done);
        outcome
    }

    /// Take the head message without waiting.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if empty, `Closed` if empty and closed.
    pub fn pop_nowait(&self) -> Result<Message> {
        let mut done = Completions::new();
        let outcome = {
            let mut st = self.inner.state.lock();
            match self.take_front(&mut st, &mut done) {
                Some(msg) => Ok(msg),
                None if st.closed => Err(ManifoldError::Closed),
                None => Err(ManifoldError::WouldBlock),
            }
        };
        complete(done);
        outcome
    }

    /// Queue `msg`, waiting up to `timeout` (`None` = forever) for room.
    ///
    /// # Errors
    ///
    /// `Timeout` or `Closed`, with the message handed back.
    pub fn push(&self, msg: Message, timeout: Option<Duration>) -> std::result::Result<(), PushError> {
        match Aio::run_blocking(timeout, Some(msg), |aio| self.push_aio(aio)) {
            (Ok(()), _) => Ok(()),
            (Err(error), msg) => Err(PushError {
                error,
                msg: msg.unwrap_or_default(),
            }),
        }
    }

    /// Take the head message, waiting up to `timeout` (`None` = forever).
    ///
    /// # Errors
    ///
    /// `Timeout`, or `Closed` once the queue is closed and empty.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Message> {
        let (result, msg) = Aio::run_blocking(timeout, None, |aio| self.pop_aio(aio));
        result?;
        msg.ok_or(ManifoldError::Closed)
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        let mut done = Completions::new();
        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            if st.closed {
                return;
            }
            st.closed = true;
            let parked: SmallVec<[Aio; 4]> = st.getters.drain().chain(st.putters.drain()).collect();
            done.extend(parked.into_iter().map(|aio| (aio, Err(ManifoldError::Closed))));
            self.inner.drained.notify_all();
        }
        trace!(woken = done.len(), "[MSGQ] Closed");
        complete(done);
    }

    /// Change the capacity (minimum 1). Messages already queued beyond a
    /// smaller capacity are kept; pushes wait until the queue shrinks.
    pub fn resize(&self, capacity: usize) {
        let mut done = Completions::new();
        {
            let mut st = self.inner.state.lock();
            st.cap = capacity.max(1);
            while st.items.len() < st.cap {
                let Some(putter) = st.putters.pop_front() else {
                    break;
                };
                if let Some(msg) = putter.take_msg() {
                    st.items.push_back(msg);
                }
                done.push((putter, Ok(())));
            }
        }
        complete(done);
    }

    /// Wait until the queue is empty or closed, up to `timeout`.
    ///
    /// Returns `true` if the queue emptied.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        // A deadline past the clock's range means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut st = self.inner.state.lock();
        while !st.items.is_empty() && !st.closed {
            match deadline {
                Some(deadline) => {
                    if self.inner.drained.wait_until(&mut st, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.drained.wait(&mut st),
            }
        }
        st.items.is_empty()
    }
}

fn complete(done: Completions) {
    for (aio, result) in done {
        aio.finish(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nowait_full_and_empty() {
        let q = MsgQueue::new(2);
        assert!(matches!(q.pop_nowait(), Err(ManifoldError::WouldBlock)));
        q.push_nowait(Message::from("a")).unwrap();
        q.push_nowait(Message::from("b")).unwrap();
        let err = q.push_nowait(Message::from("c")).unwrap_err();
        assert!(matches!(err.error, ManifoldError::WouldBlock));
        assert_eq!(err.into_msg().body(), b"c");
        assert_eq!(q.pop_nowait().unwrap().body(), b"a");
        assert_eq!(q.pop_nowait().unwrap().body(), b"b");
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let q = MsgQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.push_nowait(Message::new()).unwrap();
        assert!(q.push_nowait(Message::new()).is_err());
    }

    #[test]
    fn test_close_keeps_queued_messages() {
        let q = MsgQueue::new(4);
        q.push_nowait(Message::from("left")).unwrap();
        q.close();
        q.close();
        let err = q.push_nowait(Message::from("late")).unwrap_err();
        assert!(matches!(err.error, ManifoldError::Closed));
        assert_eq!(q.pop_nowait().unwrap().body(), b"left");
        assert!(matches!(q.pop_nowait(), Err(ManifoldError::Closed)));
        assert!(matches!(q.pop(None), Err(ManifoldError::Closed)));
    }

    #[test]
    fn test_pop_timeout() {
        let q = MsgQueue::new(1);
        let start = Instant::now();
        assert!(matches!(
            q.pop(Some(Duration::from_millis(30))),
            Err(ManifoldError::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_push_timeout_returns_message() {
        let q = MsgQueue::new(1);
        q.push_nowait(Message::from("fill")).unwrap();
        let err = q
            .push(Message::from("spill"), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err.error, ManifoldError::Timeout));
        assert_eq!(err.msg.body(), b"spill");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_parked_pop_gets_direct_handoff() {
        let q = MsgQueue::new(1);
        let aio = Aio::new();
        q.pop_aio(&aio).unwrap();
        assert!(aio.is_busy());
        q.push_nowait(Message::from("direct")).unwrap();
        aio.wait();
        assert_eq!(aio.take_msg().unwrap().body(), b"direct");
        assert!(q.is_empty());
    }

    #[test]
    fn test_parked_push_refills_on_pop() {
        let q = MsgQueue::new(1);
        q.push_nowait(Message::from("first")).unwrap();
        let aio = Aio::new();
        aio.set_msg(Message::from("second"));
        q.push_aio(&aio).unwrap();
        assert!(aio.is_busy());
        assert_eq!(q.pop_nowait().unwrap().body(), b"first");
        aio.wait();
        assert!(aio.result().is_ok());
        assert_eq!(q.pop_nowait().unwrap().body(), b"second");
    }

    #[test]
    fn test_resize_releases_parked_pushes() {
        let q = MsgQueue::new(1);
        q.push_nowait(Message::from("1")).unwrap();
        let aio = Aio::new();
        aio.set_msg(Message::from("2"));
        q.push_aio(&aio).unwrap();
        q.resize(2);
        aio.wait();
        assert!(aio.result().is_ok());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_push_aio_without_message() {
        let q = MsgQueue::new(1);
        let aio = Aio::new();
        q.push_aio(&aio).unwrap();
        aio.wait();
        assert!(matches!(aio.result(), Err(ManifoldError::InvalidValue(_))));
    }

    #[test]
    fn test_wait_drained() {
        let q = MsgQueue::new(4);
        q.push_nowait(Message::from("x")).unwrap();
        assert!(!q.wait_drained(Duration::from_millis(10)));
        let q2 = q.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            q2.pop_nowait().unwrap();
        });
        assert!(q.wait_drained(Duration::from_secs(5)));
        h.join().unwrap();
    }
}

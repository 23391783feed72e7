//! Integration tests for bounded message queues

use manifold_core::aio::Aio;
use manifold_core::error::ManifoldError;
use manifold_core::message::Message;
use manifold_core::msgqueue::MsgQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_capacity_and_fifo() {
    let q = MsgQueue::new(3);
    for i in 0..3u8 {
        q.push_nowait(Message::from(vec![i])).unwrap();
    }
    let err = q.push_nowait(Message::from("overflow")).unwrap_err();
    assert!(matches!(err.error, ManifoldError::WouldBlock));
    assert_eq!(err.into_msg().body(), b"overflow");

    for i in 0..3u8 {
        assert_eq!(q.pop_nowait().unwrap().body(), &[i]);
    }
    assert!(matches!(q.pop_nowait(), Err(ManifoldError::WouldBlock)));
}

#[test]
fn test_parked_push_completes_when_room_appears() {
    let q = MsgQueue::new(1);
    q.push_nowait(Message::from("first")).unwrap();

    let pusher = Aio::new();
    pusher.set_msg(Message::from("second"));
    q.push_aio(&pusher).unwrap();
    assert!(pusher.is_busy());

    assert_eq!(q.pop_nowait().unwrap().body(), b"first");
    pusher.wait();
    assert!(pusher.result().is_ok());
    assert_eq!(q.pop_nowait().unwrap().body(), b"second");
}

#[test]
fn test_close_wakes_every_blocked_thread_once() {
    const WAITERS: usize = 8;
    let q = MsgQueue::new(4);
    let closed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let q = q.clone();
            let closed = closed.clone();
            thread::spawn(move || {
                if matches!(q.pop(None), Err(ManifoldError::Closed)) {
                    closed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    q.close();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(closed.load(Ordering::SeqCst), WAITERS);
}

#[test]
fn test_items_survive_close() {
    let q = MsgQueue::new(4);
    q.push_nowait(Message::from("kept")).unwrap();
    q.close();
    assert!(q.push_nowait(Message::from("late")).is_err());
    assert_eq!(q.pop_nowait().unwrap().body(), b"kept");
    assert!(matches!(q.pop_nowait(), Err(ManifoldError::Closed)));
}

#[test]
fn test_pop_timeout() {
    let q = MsgQueue::new(1);
    assert!(matches!(
        q.pop(Some(Duration::from_millis(20))),
        Err(ManifoldError::Timeout)
    ));
}

#[test]
fn test_grow_releases_parked_pushes() {
    let q = MsgQueue::new(1);
    q.push_nowait(Message::from("a")).unwrap();
    let pusher = Aio::new();
    pusher.set_msg(Message::from("b"));
    q.push_aio(&pusher).unwrap();

    q.resize(2);
    pusher.wait();
    assert!(pusher.result().is_ok());
    assert_eq!(q.len(), 2);
}

#[test]
fn test_cancel_parked_pop() {
    let q = MsgQueue::new(1);
    let aio = Aio::new();
    q.pop_aio(&aio).unwrap();
    aio.cancel();
    aio.wait();
    assert!(matches!(aio.result(), Err(ManifoldError::Canceled)));

    // The canceled pop must not swallow the next message.
    q.push_nowait(Message::from("after")).unwrap();
    assert_eq!(q.pop_nowait().unwrap().body(), b"after");
}

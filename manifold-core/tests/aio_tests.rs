//! Integration tests for AIO completion rules

use manifold_core::aio::{Aio, AioPhase};
use manifold_core::error::ManifoldError;
use manifold_core::message::Message;
use manifold_core::msgqueue::MsgQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_timeout_expires_parked_operation() {
    let q = MsgQueue::new(1);
    let aio = Aio::new();
    aio.set_timeout(Some(Duration::from_millis(30)));

    let start = Instant::now();
    q.pop_aio(&aio).unwrap();
    aio.wait();
    assert!(matches!(aio.result(), Err(ManifoldError::Expired)));
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn test_zero_timeout_never_parks() {
    let q = MsgQueue::new(1);
    let aio = Aio::new();
    aio.set_timeout(Some(Duration::ZERO));
    q.pop_aio(&aio).unwrap();
    aio.wait();
    assert!(matches!(aio.result(), Err(ManifoldError::Expired)));
}

#[test]
fn test_busy_aio_refuses_resubmission() {
    let q = MsgQueue::new(1);
    let aio = Aio::new();
    q.pop_aio(&aio).unwrap();
    assert_eq!(aio.phase(), AioPhase::Started);
    assert!(matches!(q.pop_aio(&aio), Err(ManifoldError::InvalidState)));
    aio.cancel();
    aio.wait();
}

#[test]
fn test_callback_runs_once_per_completion() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let aio = Aio::with_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let q = MsgQueue::new(4);

    for _ in 0..3 {
        q.push_nowait(Message::from("x")).unwrap();
        q.pop_aio(&aio).unwrap();
        aio.wait();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_callback_chain_resubmits() {
    let q = MsgQueue::new(16);
    for i in 0..10u8 {
        q.push_nowait(Message::from(vec![i])).unwrap();
    }
    let seen = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(manifold_core::waitblock::Waitblock::new());

    let (q2, seen2, done2) = (q.clone(), seen.clone(), done.clone());
    let aio = Aio::with_callback(move |aio| {
        if aio.result().is_err() {
            return;
        }
        aio.take_msg();
        if seen2.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
            done2.done();
            return;
        }
        let _ = q2.pop_aio(aio);
    });
    q.pop_aio(&aio).unwrap();
    assert!(done.wait_timeout(Duration::from_secs(5)));
    assert_eq!(seen.load(Ordering::SeqCst), 10);
}

#[test]
fn test_stop_refuses_further_work() {
    let q = MsgQueue::new(1);
    let aio = Aio::with_callback(|_| {});
    q.pop_aio(&aio).unwrap();
    aio.stop();
    assert!(matches!(aio.result(), Err(ManifoldError::Closed)));
    assert!(matches!(q.pop_aio(&aio), Err(ManifoldError::Closed)));
}

#[test]
fn test_completion_future() {
    let q = MsgQueue::new(1);
    q.push_nowait(Message::from("async")).unwrap();
    let aio = Aio::new();
    q.pop_aio(&aio).unwrap();
    let msg = futures::executor::block_on(aio.completion()).unwrap();
    assert_eq!(msg.unwrap().body(), b"async");
}

#[test]
fn test_run_blocking_returns_unsent_message() {
    let q = MsgQueue::new(1);
    q.close();
    let (result, msg) = Aio::run_blocking(None, Some(Message::from("back")), |aio| q.push_aio(aio));
    assert!(matches!(result, Err(ManifoldError::Closed)));
    assert_eq!(msg.unwrap().body(), b"back");
}

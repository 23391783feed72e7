//! AIO expiration timer.
//!
//! One background thread keeps a min-heap of deadlines and aborts overdue
//! AIOs with [`ManifoldError::Expired`](crate::error::ManifoldError::Expired).
//! Entries hold weak AIO handles plus the generation they were armed for, so
//! an AIO that completed (or was resubmitted) in the meantime is left alone.

use crate::aio::WeakAio;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, trace};

#[derive(Default)]
struct ExpireState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, (WeakAio, u64)>,
    next_seq: u64,
}

pub(crate) struct Expirer {
    state: Mutex<ExpireState>,
    cv: Condvar,
}

static EXPIRER: Lazy<Arc<Expirer>> = Lazy::new(|| {
    let expirer = Arc::new(Expirer {
        state: Mutex::new(ExpireState::default()),
        cv: Condvar::new(),
    });
    let runner = expirer.clone();
    if let Err(e) = thread::Builder::new()
        .name("manifold-expire".into())
        .spawn(move || runner.run())
    {
        error!("[EXPIRE] Failed to spawn timer thread: {}", e);
    }
    expirer
});

impl Expirer {
    fn run(&self) {
        debug!("[EXPIRE] Timer thread running");
        let mut due: SmallVec<[(WeakAio, u64); 8]> = SmallVec::new();
        loop {
            {
                let mut st = self.state.lock();
                loop {
                    let now = Instant::now();
                    while let Some(&Reverse((deadline, seq))) = st.heap.peek() {
                        if deadline > now {
                            break;
                        }
                        st.heap.pop();
                        if let Some(entry) = st.pending.remove(&seq) {
                            due.push(entry);
                        }
                    }
                    if !due.is_empty() {
                        break;
                    }
                    match st.heap.peek() {
                        Some(&Reverse((deadline, _))) => {
                            self.cv.wait_until(&mut st, deadline);
                        }
                        None => self.cv.wait(&mut st),
                    }
                }
            }

            for (weak, generation) in due.drain(..) {
                if let Some(aio) = weak.upgrade() {
                    trace!(aio = aio.id(), "[EXPIRE] Deadline reached");
                    aio.expire(generation);
                }
            }
        }
    }
}

/// Arm a deadline for `aio` at `generation`; returns a handle for [`disarm`].
pub(crate) fn arm(aio: WeakAio, deadline: Instant, generation: u64) -> u64 {
    let expirer = &*EXPIRER;
    let mut st = expirer.state.lock();
    let seq = st.next_seq;
    st.next_seq += 1;
    st.heap.push(Reverse((deadline, seq)));
    st.pending.insert(seq, (aio, generation));
    expirer.cv.notify_one();
    seq
}

/// Forget an armed deadline. The heap slot is discarded lazily, and the heap
/// is compacted once stale slots clearly outnumber live ones.
pub(crate) fn disarm(seq: u64) {
    EXPIRER.state.lock().disarm(seq);
}

/// Heap slack tolerated before disarmed slots are purged.
const COMPACT_SLACK: usize = 64;

impl ExpireState {
    fn disarm(&mut self, seq: u64) {
        self.pending.remove(&seq);
        if self.heap.len() > 2 * self.pending.len() + COMPACT_SLACK {
            let pending = &self.pending;
            self.heap.retain(|Reverse((_, seq))| pending.contains_key(seq));
            trace!(live = self.heap.len(), "[EXPIRE] Compacted deadline heap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::Aio;
    use std::time::Duration;

    fn arm_local(st: &mut ExpireState, aio: &Aio, deadline: Instant) -> u64 {
        let seq = st.next_seq;
        st.next_seq += 1;
        st.heap.push(Reverse((deadline, seq)));
        st.pending.insert(seq, (aio.downgrade(), 1));
        seq
    }

    #[test]
    fn test_disarm_bounds_heap_growth() {
        let mut st = ExpireState::default();
        let aio = Aio::new();
        let far = Instant::now() + Duration::from_secs(3600);
        let keep = arm_local(&mut st, &aio, far);
        for _ in 0..10_000 {
            let seq = arm_local(&mut st, &aio, far);
            st.disarm(seq);
        }
        assert_eq!(st.pending.len(), 1);
        assert!(st.heap.len() <= 2 * st.pending.len() + COMPACT_SLACK + 1);
        assert!(st.heap.iter().any(|Reverse((_, seq))| *seq == keep));
    }

    #[test]
    fn test_armed_deadline_expires_aio() {
        let aio = Aio::new();
        aio.set_timeout(Some(Duration::from_millis(20)));
        aio.begin().unwrap();
        aio.schedule(Box::new(|aio, _, err| {
            aio.finish_error(err);
        }))
        .unwrap();
        aio.wait();
        assert!(matches!(
            aio.result(),
            Err(crate::error::ManifoldError::Expired)
        ));
    }
}

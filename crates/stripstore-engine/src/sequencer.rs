//! Op submission and sequencing
//!
//! Submission hands out monotonically increasing op numbers under a mutex
//! that stays held until the op is enqueued on its sequencer, so enqueue
//! order always equals op-number order. Each sequencer serializes its own
//! ops with an apply lock; a worker pool drains sequencers in parallel, and
//! two completion threads fire the readable and on-disk callbacks off the
//! caller's threads.

use crate::transaction::Transaction;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Completion callback; receives the op result code.
pub type Completion = Box<dyn FnOnce(i32) + Send + 'static>;

/// The three completion handles submitted with an op.
///
/// `on_readable_sync` runs inline on the worker once the op is readable;
/// `on_readable` runs on the readable completion thread; `on_disk` runs on
/// the on-disk completion thread after commit and is dropped if the op
/// failed.
#[derive(Default)]
pub struct OpCallbacks {
    pub on_readable: Option<Completion>,
    pub on_readable_sync: Option<Completion>,
    pub on_disk: Option<Completion>,
}

/// A submitted op: its number, transaction list, and completions.
pub(crate) struct Op {
    pub op: u64,
    pub tls: Vec<Transaction>,
    pub on_readable: Option<Completion>,
    pub on_readable_sync: Option<Completion>,
    pub on_disk: Option<Completion>,
    pub start: Instant,
}

struct SubmitState {
    op_seq: u64,
    op_submitted: u64,
}

/// Hands out op numbers; the mutex is held from [`SubmitManager::start`]
/// until [`SubmitManager::finish`] so no later-numbered op can be enqueued
/// in between.
pub(crate) struct SubmitManager {
    state: Mutex<SubmitState>,
}

/// Two-phase submit ticket. Holding it holds the submit mutex.
pub(crate) struct SubmitTicket<'a> {
    guard: MutexGuard<'a, SubmitState>,
    op: u64,
}

impl SubmitTicket<'_> {
    pub fn op(&self) -> u64 {
        self.op
    }
}

impl SubmitManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SubmitState {
                op_seq: 0,
                op_submitted: 0,
            }),
        }
    }

    /// Assign the next op number; the returned ticket keeps the submit mutex
    /// locked across the caller's enqueue.
    pub fn start(&self) -> SubmitTicket<'_> {
        let mut guard = self.state.lock();
        guard.op_seq += 1;
        let op = guard.op_seq;
        debug!(op, "op submit start");
        SubmitTicket { guard, op }
    }

    /// Record the op as submitted and release the mutex.
    ///
    /// # Panics
    /// Panics if ops finish out of order; that would mean the submit mutex
    /// was not held across the enqueue.
    pub fn finish(&self, ticket: SubmitTicket<'_>) {
        let mut guard = ticket.guard;
        assert_eq!(
            ticket.op,
            guard.op_submitted + 1,
            "out of order op submit finish"
        );
        guard.op_submitted = ticket.op;
        debug!(op = ticket.op, "op submit finish");
    }
}

/// Per-caller FIFO of pending ops plus the apply lock that serializes their
/// execution.
pub(crate) struct OpSequencer {
    name: String,
    q: Mutex<VecDeque<Op>>,
    pub apply_lock: Mutex<()>,
}

impl OpSequencer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            q: Mutex::new(VecDeque::new()),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self, op: Op) {
        self.q.lock().push_back(op);
    }

    /// Take the head op's transaction list for execution; the op itself
    /// stays queued until [`Self::dequeue`].
    pub fn take_head_work(&self) -> (u64, Vec<Transaction>) {
        let mut q = self.q.lock();
        let head = q.front_mut().expect("sequencer queued without a head op");
        (head.op, std::mem::take(&mut head.tls))
    }

    pub fn dequeue(&self) -> Op {
        self.q
            .lock()
            .pop_front()
            .expect("sequencer dequeued while empty")
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.q.lock().len()
    }
}

/// Public handle to a sequencer. Ops queued through the same handle commit
/// in submission order; different handles may run in parallel.
pub struct Sequencer {
    pub(crate) inner: Arc<OpSequencer>,
}

impl Sequencer {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(OpSequencer::new(name)),
        }
    }

    /// Name given at creation
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Background completion thread with a FIFO of callbacks.
pub(crate) struct Finisher {
    name: String,
    shared: Arc<FinisherShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

struct FinisherShared {
    q: Mutex<VecDeque<(Completion, i32)>>,
    cond: Condvar,
    stop: AtomicBool,
}

impl Finisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(FinisherShared {
                q: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        shared.stop.store(false, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || loop {
                let next = {
                    let mut q = shared.q.lock();
                    while q.is_empty() && !shared.stop.load(Ordering::Relaxed) {
                        shared.cond.wait(&mut q);
                    }
                    match q.pop_front() {
                        Some(item) => item,
                        None => return, // stopped and drained
                    }
                };
                let (callback, r) = next;
                callback(r);
            })
            .expect("spawn finisher thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn queue(&self, callback: Completion, r: i32) {
        let mut q = self.shared.q.lock();
        q.push_back((callback, r));
        self.shared.cond.notify_one();
    }

    /// Stop after draining queued callbacks.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Queue of sequencers with pending work, drained by the worker pool.
pub(crate) struct OpWorkQueue {
    q: Mutex<VecDeque<Arc<OpSequencer>>>,
    cond: Condvar,
    stop: AtomicBool,
}

impl OpWorkQueue {
    pub fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn queue(&self, osr: Arc<OpSequencer>) {
        let mut q = self.q.lock();
        q.push_back(osr);
        self.cond.notify_one();
    }

    /// Blocking dequeue; `None` once stopped and drained.
    pub fn dequeue(&self) -> Option<Arc<OpSequencer>> {
        let mut q = self.q.lock();
        loop {
            if let Some(osr) = q.pop_front() {
                return Some(osr);
            }
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }
            self.cond.wait(&mut q);
        }
    }

    pub fn start(&self) {
        self.stop.store(false, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.cond.notify_all();
    }
}

/// Worker progress watchdog. Workers tick it between transactions and
/// between ops; a tick after a long silence is logged.
pub(crate) struct Watchdog {
    last: Mutex<Instant>,
    grace: Duration,
}

impl Watchdog {
    pub fn new(grace: Duration) -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            grace,
        }
    }

    pub fn tick(&self) {
        let mut last = self.last.lock();
        let gap = last.elapsed();
        if gap > self.grace {
            warn!(gap_secs = gap.as_secs(), "op worker stalled past watchdog grace");
        }
        *last = Instant::now();
    }
}

//! Unbounded blocking FIFO with in-flight tracking.
//!
//! A [`WorkQueue`] separates "item removed from the queue" ([`WorkQueue::pop`])
//! from "item's work finished" ([`WorkQueue::task_done`]). The in-flight
//! count covers both queued items and popped items whose processing has not
//! been marked done, which is what drain detection relies on.
//!
//! ```text
//! push ──▶ [ queued ] ──pop──▶ [ being processed ] ──task_done──▶ gone
//!          └──────────── in_flight ─────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Pipeline-wide change signal.
///
/// Every queue of a pipeline notifies the same `Progress` whenever an item is
/// pushed, marked done, or the queue is closed. The collector evaluates its
/// drain predicate while holding the signal's lock, so a change made between
/// the check and the wait cannot be missed.
///
/// Notifiers only take the lock while a waiter is registered. A waiter
/// registers before its first check, and every state change it observes is
/// `SeqCst` or mutex-ordered, so a notifier that sees no waiter made its
/// change before that check.
#[derive(Default)]
pub struct Progress {
    lock: Mutex<()>,
    cond: Condvar,
    waiters: AtomicUsize,
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake every waiter so it re-evaluates its condition.
    pub fn notify(&self) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `check` yields a value.
    ///
    /// `check` is re-run after every notification.
    pub fn wait_for<R>(&self, mut check: impl FnMut() -> Option<R>) -> R {
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            if let Some(result) = check() {
                break result;
            }
            self.cond.wait(&mut guard);
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe unbounded FIFO shared by two adjacent stages.
pub struct WorkQueue<T> {
    id: u64,
    state: Mutex<QueueState<T>>,
    available: Condvar,
    in_flight: AtomicUsize,
    progress: Option<Arc<Progress>>,
}

impl<T> WorkQueue<T> {
    /// Create a standalone queue.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a queue that reports changes to a shared [`Progress`] signal.
    pub fn with_progress(progress: Arc<Progress>) -> Self {
        Self::build(Some(progress))
    }

    fn build(progress: Option<Arc<Progress>>) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            progress,
        }
    }

    /// Process-unique identity of this queue.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append an item and count it as in flight.
    ///
    /// Items pushed after [`close`](Self::close) are discarded.
    pub fn push(&self, item: T) {
        {
            let mut state = self.state.lock();
            if state.closed {
                tracing::trace!(queue = self.id, "push on closed queue discarded");
                return;
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            state.items.push_back(item);
        }
        self.available.notify_one();
        self.signal();
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue has been closed. The popped item stays
    /// in flight until [`task_done`](Self::task_done) is called for it.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.available.wait(&mut state);
        }
    }

    /// Remove the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Mark one previously popped item as processed.
    ///
    /// Extra calls beyond the number of pushed items are ignored.
    pub fn task_done(&self) {
        let result = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result.is_err() {
            tracing::warn!(queue = self.id, "task_done called more times than items pushed");
            return;
        }
        self.signal();
    }

    /// Items pushed but not yet marked done.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Items currently waiting to be popped.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Close the queue, waking every blocked `pop` with `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
        self.signal();
    }

    fn signal(&self) {
        if let Some(progress) = &self.progress {
            progress.notify();
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Type-erased view of a [`WorkQueue`].
///
/// The pipeline keeps its differently-typed queues in one list through this
/// trait; drain detection only needs counts, never the items themselves.
pub trait QueueProbe: Send + Sync {
    fn id(&self) -> u64;
    fn in_flight(&self) -> usize;
    fn close(&self);
}

impl<T: Send> QueueProbe for WorkQueue<T> {
    fn id(&self) -> u64 {
        WorkQueue::id(self)
    }

    fn in_flight(&self) -> usize {
        WorkQueue::in_flight(self)
    }

    fn close(&self) {
        WorkQueue::close(self)
    }
}

//! Ordered Work Queue
//!
//! Time-sorted pending work for one event loop. Owns the synchronization
//! barriers and idle callbacks, and is the only place the loop's shared
//! state is locked.
//!
//! Items are kept sorted by scheduled time, FIFO among equal times. Front
//! insertion places an item at the head regardless of time. A barrier is an item
//! without a target; while one sits at the head, only asynchronous items
//! behind it can be taken.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ExecError, Result, panic_message};
use crate::item::WorkItem;
use crate::parker::{Parker, PollTimeout};
use crate::pool::WorkPool;

/// Callback run when the queue runs out of due work
///
/// Returning `false` deregisters it. Equality is reference identity, so
/// keep a clone around to remove it later.
#[derive(Clone)]
pub struct IdleCallback(Arc<dyn Fn() -> bool + Send + Sync>);

impl IdleCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Run the callback; returns whether it stays registered
    pub fn run(&self) -> bool {
        (self.0)()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for IdleCallback {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for IdleCallback {}

impl fmt::Debug for IdleCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdleCallback({:p})", self.addr())
    }
}

/// Result of a non-blocking poll
#[derive(Debug)]
pub enum QueuePoll {
    /// A due item, detached from the queue
    Ready(Box<WorkItem>),
    /// Nothing is due right now
    Pending,
    /// The queue quit and has been disposed
    Quit,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Box<WorkItem>>,
    idle_callbacks: Vec<IdleCallback>,
    next_barrier_token: i32,
    quitting: bool,
    /// Owner is parked waiting for work
    blocked: bool,
    disposed: bool,
}

impl QueueState {
    fn insert_position(&self, when: u64) -> usize {
        self.items.partition_point(|p| p.when <= when)
    }

    /// Index of the next item that may be taken, skipping past a head barrier
    fn candidate(&self) -> Option<usize> {
        let head = self.items.front()?;
        if head.is_barrier() {
            self.items
                .iter()
                .skip(1)
                .position(|p| p.is_async())
                .map(|i| i + 1)
        } else {
            Some(0)
        }
    }

    fn head_not_due(&self, now: u64) -> bool {
        self.items.front().map_or(true, |head| now < head.when)
    }

    fn remove_future(&mut self, now: u64) -> Vec<Box<WorkItem>> {
        let keep = self.items.partition_point(|p| p.when <= now);
        self.items.split_off(keep).into()
    }

    fn dispose(&mut self) -> Vec<Box<WorkItem>> {
        self.disposed = true;
        self.blocked = false;
        self.idle_callbacks.clear();
        self.items.drain(..).collect()
    }
}

fn recycle_all(items: Vec<Box<WorkItem>>) {
    let pool = WorkPool::global();
    for item in items {
        pool.recycle_unchecked(item);
    }
}

/// Time-ordered queue of pending work items
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    parker: Parker,
    clock: Arc<dyn Clock>,
    quit_allowed: bool,
}

impl WorkQueue {
    pub fn new(quit_allowed: bool) -> Self {
        Self::with_clock(quit_allowed, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(quit_allowed: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            parker: Parker::new(),
            clock,
            quit_allowed,
        }
    }

    /// Current time on this queue's clock
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_quit_allowed(&self) -> bool {
        self.quit_allowed
    }

    /// Insert `item` to run at `when`, after everything already due by then.
    ///
    /// Returns `Ok(false)` if the queue is quitting; the item is recycled.
    pub fn enqueue(&self, item: Box<WorkItem>, when: u64) -> Result<bool> {
        self.insert(item, Some(when))
    }

    /// Insert `item` at the head, ahead of everything pending.
    ///
    /// The item is recorded with a scheduled time of 0, so it is due at once.
    pub fn enqueue_at_front(&self, item: Box<WorkItem>) -> Result<bool> {
        self.insert(item, None)
    }

    /// `None` means front insertion
    fn insert(&self, mut item: Box<WorkItem>, when: Option<u64>) -> Result<bool> {
        if item.target.is_none() {
            return Err(ExecError::MissingTarget);
        }
        let mut state = self.state.lock();
        if item.is_in_use() {
            return Err(ExecError::ItemInUse);
        }
        if state.quitting {
            drop(state);
            tracing::warn!(
                target: "fos_exec::queue",
                item = %item,
                "sending work to a looper on a dead thread"
            );
            WorkPool::global().recycle_unchecked(item);
            return Ok(false);
        }

        item.mark_in_use();
        item.when = when.unwrap_or(0);
        let pos = match when {
            Some(when) => state.insert_position(when),
            None => 0,
        };
        let need_wake = if pos == 0 {
            state.blocked
        } else {
            // Stalled behind a barrier: only wake for the earliest async item.
            state.blocked
                && state.items[0].is_barrier()
                && item.is_async()
                && !state.items.range(1..pos).any(|p| p.is_async())
        };
        tracing::trace!(target: "fos_exec::queue", item = %item, pos, "enqueued");
        state.items.insert(pos, item);
        drop(state);

        if need_wake {
            self.parker.wake();
        }
        Ok(true)
    }

    /// Block until an item is due and detach it.
    ///
    /// Owning thread only. Returns `None` once the queue has quit; the queue
    /// is disposed at that point and never yields again.
    pub fn take_next(&self) -> Option<Box<WorkItem>> {
        match self.next_item(true) {
            QueuePoll::Ready(item) => Some(item),
            QueuePoll::Pending | QueuePoll::Quit => None,
        }
    }

    /// Like [`WorkQueue::take_next`] but never blocks.
    pub fn poll_next(&self) -> QueuePoll {
        self.next_item(false)
    }

    fn next_item(&self, blocking: bool) -> QueuePoll {
        if self.state.lock().disposed {
            return QueuePoll::Quit;
        }

        // None until the first pass decides whether idle callbacks run.
        let mut pending_idle: Option<usize> = None;
        let mut timeout = PollTimeout::Immediate;
        loop {
            self.parker.poll_once(timeout);

            let idlers = {
                let mut state = self.state.lock();
                let now = self.clock.now_millis();

                match state.candidate() {
                    Some(index) => {
                        let when = state.items[index].when;
                        if now < when {
                            timeout = PollTimeout::After(Duration::from_millis(when - now));
                        } else {
                            state.blocked = false;
                            if let Some(mut item) = state.items.remove(index) {
                                item.mark_in_use();
                                tracing::trace!(target: "fos_exec::queue", item = %item, "returning");
                                return QueuePoll::Ready(item);
                            }
                        }
                    }
                    None => timeout = PollTimeout::Forever,
                }

                if state.quitting {
                    let leftovers = state.dispose();
                    drop(state);
                    recycle_all(leftovers);
                    tracing::debug!(target: "fos_exec::queue", "queue disposed");
                    return QueuePoll::Quit;
                }

                if pending_idle.is_none() && state.head_not_due(now) {
                    pending_idle = Some(state.idle_callbacks.len());
                }
                if pending_idle.unwrap_or(0) == 0 {
                    if !blocking {
                        return QueuePoll::Pending;
                    }
                    state.blocked = true;
                    continue;
                }
                state.idle_callbacks.clone()
            };

            self.run_idle_callbacks(idlers);

            // Idle callbacks may have posted work; look again without waiting.
            pending_idle = Some(0);
            timeout = PollTimeout::Immediate;
        }
    }

    fn run_idle_callbacks(&self, idlers: Vec<IdleCallback>) {
        for idler in idlers {
            let keep = match panic::catch_unwind(AssertUnwindSafe(|| idler.run())) {
                Ok(keep) => keep,
                Err(panic) => {
                    tracing::error!(
                        target: "fos_exec::queue",
                        "idle callback panicked: {}",
                        panic_message(panic.as_ref())
                    );
                    false
                }
            };
            if !keep {
                self.remove_idle_callback(&idler);
            }
        }
    }

    /// Stop the queue.
    ///
    /// `safe` keeps items that are already due so they still get taken;
    /// otherwise everything pending is dropped. Wakes the owner either way.
    pub fn quit(&self, safe: bool) -> Result<()> {
        if !safe && !self.quit_allowed {
            return Err(ExecError::QuitNotAllowed);
        }
        let removed = {
            let mut state = self.state.lock();
            if state.quitting {
                return Ok(());
            }
            state.quitting = true;
            if safe {
                let now = self.clock.now_millis();
                state.remove_future(now)
            } else {
                state.items.drain(..).collect()
            }
        };
        tracing::debug!(
            target: "fos_exec::queue",
            safe,
            dropped = removed.len(),
            "quit requested"
        );
        recycle_all(removed);
        self.parker.wake();
        Ok(())
    }

    /// Post a barrier at the current time
    pub fn post_barrier_now(&self) -> i32 {
        self.post_barrier(self.clock.now_millis())
    }

    /// Post a barrier at `when`, stalling synchronous items scheduled after it.
    ///
    /// Does not wake the owner. Returns the token for `remove_barrier`.
    pub fn post_barrier(&self, when: u64) -> i32 {
        let mut barrier = WorkPool::global().obtain();
        barrier.mark_in_use();
        barrier.when = when;

        let mut state = self.state.lock();
        let token = state.next_barrier_token;
        state.next_barrier_token = state.next_barrier_token.wrapping_add(1);
        barrier.arg1 = token;
        let pos = state.insert_position(when);
        state.items.insert(pos, barrier);
        tracing::trace!(target: "fos_exec::queue", token, when, pos, "barrier posted");
        token
    }

    /// Remove the barrier identified by `token`.
    pub fn remove_barrier(&self, token: i32) -> Result<()> {
        let (barrier, need_wake) = {
            let mut state = self.state.lock();
            let index = state
                .items
                .iter()
                .position(|p| p.is_barrier() && p.arg1 == token)
                .ok_or(ExecError::UnknownBarrier(token))?;
            let barrier = state.items.remove(index);
            // Only a head barrier was stalling the owner.
            let need_wake = index == 0
                && state.items.front().map_or(true, |head| !head.is_barrier())
                && !state.quitting;
            (barrier, need_wake)
        };
        if let Some(barrier) = barrier {
            WorkPool::global().recycle_unchecked(barrier);
        }
        tracing::trace!(target: "fos_exec::queue", token, "barrier removed");
        if need_wake {
            self.parker.wake();
        }
        Ok(())
    }

    /// Remove every pending item matching `pred`; returns how many.
    ///
    /// Barriers are never matched. `pred` runs under the queue lock and must
    /// not call back into this queue.
    pub fn remove_matching<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&WorkItem) -> bool,
    {
        let removed = {
            let mut state = self.state.lock();
            let mut removed = Vec::new();
            let mut kept = VecDeque::with_capacity(state.items.len());
            for item in state.items.drain(..) {
                if !item.is_barrier() && pred(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            state.items = kept;
            removed
        };
        let count = removed.len();
        recycle_all(removed);
        count
    }

    /// Whether any pending item matches `pred`
    pub fn has_matching<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&WorkItem) -> bool,
    {
        let state = self.state.lock();
        state.items.iter().any(|p| !p.is_barrier() && pred(p))
    }

    pub fn add_idle_callback(&self, callback: IdleCallback) {
        self.state.lock().idle_callbacks.push(callback);
    }

    pub fn remove_idle_callback(&self, callback: &IdleCallback) {
        let mut state = self.state.lock();
        if let Some(index) = state.idle_callbacks.iter().position(|c| c == callback) {
            state.idle_callbacks.remove(index);
        }
    }

    /// True if nothing is due right now
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.head_not_due(self.clock.now_millis())
    }

    /// True while the owner is parked waiting for work
    pub fn is_polling(&self) -> bool {
        let state = self.state.lock();
        !state.quitting && state.blocked
    }

    pub fn is_quitting(&self) -> bool {
        self.state.lock().quitting
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Number of pending items, barriers included
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn wake(&self) {
        self.parker.wake();
    }
}

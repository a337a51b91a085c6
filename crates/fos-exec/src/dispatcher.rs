//! Dispatcher
//!
//! Handle bound to one event loop. Schedules work onto the loop's queue
//! from any thread and receives dispatch callbacks on the loop's thread.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ExecError, Result};
use crate::item::{Payload, Runnable, Work, WorkItem};
use crate::looper::Looper;
use crate::messenger::Messenger;
use crate::pool::WorkPool;
use crate::queue::WorkQueue;
use crate::registry::ThreadRegistry;

/// Receives message items that no callback claimed
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, item: &WorkItem);
}

/// Runs before the [`MessageHandler`]; returning `true` marks the item handled
pub type HandlerCallback = Arc<dyn Fn(&WorkItem) -> bool + Send + Sync>;

struct DispatcherInner {
    looper: Arc<Looper>,
    callback: Option<HandlerCallback>,
    handler: Option<Arc<dyn MessageHandler>>,
    asynchronous: bool,
}

/// Scheduling handle for one event loop
///
/// Cloning yields the same dispatcher; equality is handle identity.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    fn build(
        looper: &Arc<Looper>,
        callback: Option<HandlerCallback>,
        handler: Option<Arc<dyn MessageHandler>>,
        asynchronous: bool,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                looper: looper.clone(),
                callback,
                handler,
                asynchronous,
            }),
        }
    }

    pub fn new(looper: &Arc<Looper>) -> Self {
        Self::build(looper, None, None, false)
    }

    pub fn with_callback<F>(looper: &Arc<Looper>, callback: F) -> Self
    where
        F: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        Self::build(looper, Some(Arc::new(callback)), None, false)
    }

    pub fn with_handler(looper: &Arc<Looper>, handler: Arc<dyn MessageHandler>) -> Self {
        Self::build(looper, None, Some(handler), false)
    }

    /// Dispatcher whose items bypass synchronization barriers
    pub fn new_async(looper: &Arc<Looper>) -> Self {
        Self::build(looper, None, None, true)
    }

    pub fn new_async_with_callback<F>(looper: &Arc<Looper>, callback: F) -> Self
    where
        F: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        Self::build(looper, Some(Arc::new(callback)), None, true)
    }

    /// Dispatcher for the loop prepared on the calling thread
    pub fn for_current_thread(registry: &ThreadRegistry) -> Result<Self> {
        registry
            .lookup()
            .map(|looper| Self::new(&looper))
            .ok_or_else(|| ExecError::NotPrepared(thread::current().id()))
    }

    pub fn looper(&self) -> &Arc<Looper> {
        &self.inner.looper
    }

    fn queue(&self) -> &WorkQueue {
        self.inner.looper.queue()
    }

    pub fn is_async(&self) -> bool {
        self.inner.asynchronous
    }

    /// Send-only handle to this dispatcher
    pub fn messenger(&self) -> Messenger {
        Messenger::new(self)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Deliver an item: its callback, else the handler callback, else the handler.
    pub fn dispatch(&self, item: &WorkItem) {
        match &item.work {
            Work::Callback(runnable) => runnable.run(),
            Work::Message => {
                if let Some(callback) = &self.inner.callback {
                    if callback(item) {
                        return;
                    }
                }
                if let Some(handler) = &self.inner.handler {
                    handler.handle_message(item);
                }
            }
        }
    }

    /// Human-readable name of an item for diagnostics
    pub fn message_name(&self, item: &WorkItem) -> String {
        match &item.work {
            Work::Callback(runnable) => format!("{:?}", runnable),
            Work::Message => format!("{:#x}", item.what),
        }
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    pub fn obtain_message(&self, what: i32) -> Box<WorkItem> {
        let mut item = WorkItem::obtain_for(self);
        item.what = what;
        item
    }

    pub fn obtain_message_with(
        &self,
        what: i32,
        arg1: i32,
        arg2: i32,
        payload: Option<Payload>,
    ) -> Box<WorkItem> {
        let mut item = self.obtain_message(what);
        item.arg1 = arg1;
        item.arg2 = arg2;
        item.payload = payload;
        item
    }

    fn callback_item(runnable: Runnable) -> Box<WorkItem> {
        let mut item = WorkItem::obtain();
        item.set_callback(runnable);
        item
    }

    // ------------------------------------------------------------------
    // Posting callbacks
    // ------------------------------------------------------------------

    pub fn post(&self, runnable: Runnable) -> Result<bool> {
        self.send_delayed(Self::callback_item(runnable), Duration::ZERO)
    }

    pub fn post_with_what(&self, runnable: Runnable, what: i32) -> Result<bool> {
        let mut item = Self::callback_item(runnable);
        item.what = what;
        self.send_delayed(item, Duration::ZERO)
    }

    /// Run `runnable` at an absolute queue-clock time
    pub fn post_at_time(&self, runnable: Runnable, when: u64) -> Result<bool> {
        self.send_at_time(Self::callback_item(runnable), when)
    }

    pub fn post_at_time_with_token(
        &self,
        runnable: Runnable,
        token: Payload,
        when: u64,
    ) -> Result<bool> {
        let mut item = Self::callback_item(runnable);
        item.payload = Some(token);
        self.send_at_time(item, when)
    }

    pub fn post_delayed(&self, runnable: Runnable, delay: Duration) -> Result<bool> {
        self.send_delayed(Self::callback_item(runnable), delay)
    }

    pub fn post_delayed_with_token(
        &self,
        runnable: Runnable,
        token: Payload,
        delay: Duration,
    ) -> Result<bool> {
        let mut item = Self::callback_item(runnable);
        item.payload = Some(token);
        self.send_delayed(item, delay)
    }

    /// Run `runnable` before everything else queued.
    ///
    /// Can starve other work; meant for rare, latency-critical cases.
    pub fn post_at_front(&self, runnable: Runnable) -> Result<bool> {
        self.send_at_front(Self::callback_item(runnable))
    }

    // ------------------------------------------------------------------
    // Sending items
    // ------------------------------------------------------------------

    pub fn send(&self, item: Box<WorkItem>) -> Result<bool> {
        self.send_delayed(item, Duration::ZERO)
    }

    pub fn send_empty(&self, what: i32) -> Result<bool> {
        self.send_empty_delayed(what, Duration::ZERO)
    }

    pub fn send_empty_delayed(&self, what: i32, delay: Duration) -> Result<bool> {
        let mut item = WorkItem::obtain();
        item.what = what;
        self.send_delayed(item, delay)
    }

    pub fn send_empty_at_time(&self, what: i32, when: u64) -> Result<bool> {
        let mut item = WorkItem::obtain();
        item.what = what;
        self.send_at_time(item, when)
    }

    pub fn send_delayed(&self, item: Box<WorkItem>, delay: Duration) -> Result<bool> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let when = self.queue().now().saturating_add(delay_ms);
        self.send_at_time(item, when)
    }

    /// Enqueue `item` at an absolute queue-clock time.
    ///
    /// `Ok(true)` only means the item was queued; a safe quit can still drop
    /// it before it runs.
    pub fn send_at_time(&self, item: Box<WorkItem>, when: u64) -> Result<bool> {
        self.queue().enqueue(self.claim(item), when)
    }

    /// Enqueue `item` ahead of everything else queued.
    pub fn send_at_front(&self, item: Box<WorkItem>) -> Result<bool> {
        self.queue().enqueue_at_front(self.claim(item))
    }

    /// Dispatch right away when called on the loop's thread, else send.
    pub fn execute_or_send(&self, mut item: Box<WorkItem>) -> Result<bool> {
        if self.inner.looper.is_current_thread() {
            item.target = Some(self.clone());
            self.dispatch(&item);
            WorkPool::global().recycle_unchecked(item);
            return Ok(true);
        }
        self.send(item)
    }

    fn claim(&self, mut item: Box<WorkItem>) -> Box<WorkItem> {
        item.target = Some(self.clone());
        if self.inner.asynchronous {
            item.set_async(true);
        }
        item
    }

    // ------------------------------------------------------------------
    // Removal and queries
    // ------------------------------------------------------------------

    fn owns(&self, item: &WorkItem) -> bool {
        item.target.as_ref() == Some(self)
    }

    pub fn remove_callbacks(&self, runnable: &Runnable) -> usize {
        self.queue().remove_matching(|p| self.owns(p) && p.callback() == Some(runnable))
    }

    pub fn remove_callbacks_with_token(&self, runnable: &Runnable, token: &Payload) -> usize {
        self.queue().remove_matching(|p| {
            self.owns(p) && p.callback() == Some(runnable) && same_payload(p, token)
        })
    }

    pub fn remove_callbacks_with_what(&self, runnable: &Runnable, what: i32) -> usize {
        self.queue().remove_matching(|p| {
            self.owns(p) && p.callback() == Some(runnable) && p.what == what
        })
    }

    /// Remove pending items with code `what`
    pub fn remove_messages(&self, what: i32) -> usize {
        self.queue().remove_matching(|p| self.owns(p) && p.what == what)
    }

    /// Remove pending items with code `what` carrying this exact payload
    pub fn remove_messages_with_payload(&self, what: i32, payload: &Payload) -> usize {
        self.queue().remove_matching(|p| self.owns(p) && p.what == what && same_payload(p, payload))
    }

    /// Remove pending items with code `what` whose payload equals `value`
    pub fn remove_equal_messages<T>(&self, what: i32, value: &T) -> usize
    where
        T: Any + PartialEq,
    {
        self.queue().remove_matching(|p| self.owns(p) && p.what == what && equal_payload(p, value))
    }

    /// Remove every pending item of this dispatcher, or only those carrying `token`
    pub fn remove_callbacks_and_messages(&self, token: Option<&Payload>) -> usize {
        self.queue().remove_matching(|p| {
            self.owns(p) && token.map_or(true, |token| same_payload(p, token))
        })
    }

    pub fn remove_callbacks_and_equal_messages<T>(&self, value: &T) -> usize
    where
        T: Any + PartialEq,
    {
        self.queue().remove_matching(|p| self.owns(p) && equal_payload(p, value))
    }

    pub fn has_messages(&self, what: i32) -> bool {
        self.queue().has_matching(|p| self.owns(p) && p.what == what)
    }

    pub fn has_messages_with_payload(&self, what: i32, payload: &Payload) -> bool {
        self.queue().has_matching(|p| self.owns(p) && p.what == what && same_payload(p, payload))
    }

    pub fn has_equal_messages<T>(&self, what: i32, value: &T) -> bool
    where
        T: Any + PartialEq,
    {
        self.queue().has_matching(|p| self.owns(p) && p.what == what && equal_payload(p, value))
    }

    pub fn has_callbacks(&self, runnable: &Runnable) -> bool {
        self.queue().has_matching(|p| self.owns(p) && p.callback() == Some(runnable))
    }

    pub fn has_messages_or_callbacks(&self) -> bool {
        self.queue().has_matching(|p| self.owns(p))
    }

    // ------------------------------------------------------------------
    // Blocking calls
    // ------------------------------------------------------------------

    /// Run `task` on the loop's thread and wait for it to finish.
    ///
    /// On the loop's own thread the task runs inline. Elsewhere this waits
    /// up to `timeout` (zero waits forever). Returns `false` if the post
    /// failed, the wait timed out, or the task never completed because it
    /// panicked or was dropped by a quit. A timed-out task still runs later.
    pub fn run_blocking<F>(&self, task: F, timeout: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.looper.is_current_thread() {
            task();
            return true;
        }

        let completion = Arc::new(Completion::default());
        // Dropped with the queued item, so a discarded task still releases the waiter.
        let signal = DropSignal(completion.clone());
        let slot: Mutex<Option<Box<dyn FnOnce() + Send>>> = Mutex::new(Some(Box::new(task)));
        let runnable = Runnable::new(move || {
            if let Some(task) = slot.lock().take() {
                task();
                signal.0.finish(true);
            }
        });

        match self.post(runnable) {
            Ok(true) => completion.wait(timeout),
            _ => false,
        }
    }
}

fn same_payload(item: &WorkItem, token: &Payload) -> bool {
    item.payload
        .as_ref()
        .is_some_and(|p| Arc::as_ptr(p) as *const () == Arc::as_ptr(token) as *const ())
}

fn equal_payload<T: Any + PartialEq>(item: &WorkItem, value: &T) -> bool {
    item.payload_as::<T>().is_some_and(|p| p == value)
}

/// Completion state for `run_blocking`: `Some(true)` once the task ran
#[derive(Default)]
struct Completion {
    outcome: Mutex<Option<bool>>,
    condvar: Condvar,
}

impl Completion {
    /// Record the first outcome and release the waiter
    fn finish(&self, ran: bool) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(ran);
            self.condvar.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut outcome = self.outcome.lock();
        if timeout.is_zero() {
            while outcome.is_none() {
                self.condvar.wait(&mut outcome);
            }
        } else {
            let deadline = Instant::now() + timeout;
            while outcome.is_none() {
                if self.condvar.wait_until(&mut outcome, deadline).timed_out() {
                    break;
                }
            }
        }
        *outcome == Some(true)
    }
}

/// Settles the completion as "not run" if nothing settled it first
struct DropSignal(Arc<Completion>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.finish(false);
    }
}

impl PartialEq for Dispatcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Dispatcher {}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &Arc::as_ptr(&self.inner))
            .field("async", &self.inner.asynchronous)
            .field("has_callback", &self.inner.callback.is_some())
            .field("has_handler", &self.inner.handler.is_some())
            .finish()
    }
}

impl fmt::Display for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dispatcher {{{:p}}}", Arc::as_ptr(&self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::QueuePoll;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached(now: u64) -> (Arc<ManualClock>, Arc<Looper>) {
        let clock = Arc::new(ManualClock::new(now));
        let looper = Looper::detached(true, clock.clone());
        (clock, looper)
    }

    fn drain(looper: &Looper) -> Vec<i32> {
        let mut seen = Vec::new();
        while let QueuePoll::Ready(item) = looper.queue().poll_next() {
            seen.push(item.what);
            if let Some(target) = item.target() {
                target.dispatch(&item);
            }
        }
        seen
    }

    struct Recorder(Mutex<Vec<i32>>);

    impl MessageHandler for Recorder {
        fn handle_message(&self, item: &WorkItem) {
            self.0.lock().push(item.what);
        }
    }

    #[test]
    fn test_callback_claims_before_handler() {
        let (_clock, looper) = detached(100);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let d = Dispatcher::build(
            &looper,
            Some(Arc::new(|item: &WorkItem| item.what == 1)),
            Some(recorder.clone()),
            false,
        );
        d.send_empty(1).unwrap();
        d.send_empty(2).unwrap();
        assert_eq!(drain(&looper), vec![1, 2]);
        assert_eq!(*recorder.0.lock(), vec![2]);
    }

    #[test]
    fn test_item_callback_bypasses_handler() {
        let (_clock, looper) = detached(100);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let d = Dispatcher::with_handler(&looper, recorder.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        d.post_with_what(
            Runnable::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            9,
        )
        .unwrap();
        drain(&looper);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_post_delayed_uses_queue_clock() {
        let (clock, looper) = detached(1_000);
        let d = Dispatcher::new(&looper);
        d.send_empty_delayed(5, Duration::from_millis(50)).unwrap();
        assert!(drain(&looper).is_empty());
        clock.advance(50);
        assert_eq!(drain(&looper), vec![5]);
    }

    #[test]
    fn test_post_at_front_jumps_queue() {
        let (_clock, looper) = detached(100);
        let d = Dispatcher::new(&looper);
        d.send_empty(1).unwrap();
        d.send_empty(2).unwrap();
        let mut urgent = d.obtain_message(3);
        urgent.arg1 = 1;
        d.send_at_front(urgent).unwrap();
        assert_eq!(drain(&looper), vec![3, 1, 2]);
    }

    #[test]
    fn test_clock_at_zero_keeps_post_order() {
        let looper = Looper::detached(true, Arc::new(ManualClock::default()));
        let d = Dispatcher::new(&looper);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            d.post(Runnable::new(move || order.lock().push(tag))).unwrap();
        }
        let urgent = order.clone();
        d.post_at_front(Runnable::new(move || urgent.lock().push("front")))
            .unwrap();

        looper.run_ui().unwrap();
        assert_eq!(*order.lock(), vec!["front", "a", "b", "c"]);
    }

    #[test]
    fn test_async_dispatcher_marks_items() {
        let (_clock, looper) = detached(100);
        let d = Dispatcher::new_async(&looper);
        assert!(d.is_async());
        d.send_empty(1).unwrap();
        match looper.queue().poll_next() {
            QueuePoll::Ready(item) => assert!(item.is_async()),
            other => panic!("expected item, got {:?}", other),
        }
    }

    #[test]
    fn test_removal_scoped_to_dispatcher() {
        let (_clock, looper) = detached(100);
        let a = Dispatcher::new(&looper);
        let b = Dispatcher::new(&looper);
        a.send_empty_delayed(3, Duration::from_millis(50)).unwrap();
        b.send_empty_delayed(3, Duration::from_millis(50)).unwrap();

        assert_eq!(a.remove_messages(3), 1);
        assert!(!a.has_messages(3));
        assert!(b.has_messages(3));
    }

    #[test]
    fn test_payload_reference_vs_value() {
        let (_clock, looper) = detached(100);
        let d = Dispatcher::new(&looper);
        let first: Payload = Arc::new(String::from("key"));
        let twin: Payload = Arc::new(String::from("key"));
        d.send(d.obtain_message_with(4, 0, 0, Some(first.clone()))).unwrap();

        assert!(d.has_messages_with_payload(4, &first));
        assert!(!d.has_messages_with_payload(4, &twin));
        assert!(d.has_equal_messages(4, &String::from("key")));
        assert_eq!(d.remove_messages_with_payload(4, &twin), 0);
        assert_eq!(d.remove_equal_messages(4, &String::from("key")), 1);
        assert!(!d.has_messages_or_callbacks());
    }

    #[test]
    fn test_remove_callbacks_by_identity() {
        let (_clock, looper) = detached(100);
        let d = Dispatcher::new(&looper);
        let kept = Runnable::new(|| {});
        let dropped = Runnable::new(|| {});
        let token: Payload = Arc::new(1u8);
        d.post_delayed(kept.clone(), Duration::from_millis(10)).unwrap();
        d.post_delayed_with_token(dropped.clone(), token.clone(), Duration::from_millis(10))
            .unwrap();

        assert_eq!(d.remove_callbacks_with_token(&dropped, &token), 1);
        assert!(d.has_callbacks(&kept));
        assert!(!d.has_callbacks(&dropped));
        assert_eq!(d.remove_callbacks_and_messages(None), 1);
    }

    #[test]
    fn test_run_blocking_inline_on_owner() {
        let (_clock, looper) = detached(100);
        let d = Dispatcher::new(&looper);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        assert!(d.run_blocking(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::ZERO,
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(looper.queue().is_empty());
    }

    #[test]
    fn test_execute_or_send_inline() {
        let (_clock, looper) = detached(100);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let d = Dispatcher::with_handler(&looper, recorder.clone());
        assert!(d.execute_or_send(d.obtain_message(8)).unwrap());
        assert_eq!(*recorder.0.lock(), vec![8]);
        assert!(looper.queue().is_empty());
    }

    #[test]
    fn test_equality_is_identity() {
        let (_clock, looper) = detached(100);
        let a = Dispatcher::new(&looper);
        let b = Dispatcher::new(&looper);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}

//! Event Loop
//!
//! A looper owns one work queue and is bound to the thread that prepared
//! it. Driving it (`run` or `run_ui`) takes due items off the queue,
//! dispatches them through their dispatcher and returns them to the pool.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crate::clock::Clock;
use crate::config::LooperConfig;
use crate::error::{DispatchError, ExecError, Result};
use crate::item::WorkItem;
use crate::observer::{ObserverSlot, ObserverToken};
use crate::pool::WorkPool;
use crate::queue::{QueuePoll, WorkQueue};

/// Lateness at or below which a slow-delivery backlog counts as drained (ms)
const DRAINED_THRESHOLD_MS: u64 = 10;

/// Lifecycle of a looper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Prepared but not being driven
    Created,
    /// Inside `run` or `run_ui`
    Running,
    /// Quit requested; remaining due work may still be taken
    Quitting,
    /// Queue torn down; the looper will never yield again
    Disposed,
}

/// Outcome of one `run_ui` pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiDrain {
    /// Everything due has been dispatched; the looper is still alive
    Idle,
    /// The looper has quit
    Quit,
}

/// Per-thread event loop
pub struct Looper {
    queue: WorkQueue,
    thread: ThreadId,
    thread_name: Option<String>,
    in_loop: AtomicBool,
    slow_dispatch_ms: AtomicU64,
    slow_delivery_ms: AtomicU64,
    slow_delivery_detected: AtomicBool,
    observer: Arc<ObserverSlot>,
}

impl Looper {
    pub(crate) fn bind_current(
        quit_allowed: bool,
        config: &LooperConfig,
        clock: Arc<dyn Clock>,
        observer: Arc<ObserverSlot>,
    ) -> Arc<Self> {
        let current = thread::current();
        Arc::new(Self {
            queue: WorkQueue::with_clock(quit_allowed, clock),
            thread: current.id(),
            thread_name: current.name().map(str::to_owned),
            in_loop: AtomicBool::new(false),
            slow_dispatch_ms: AtomicU64::new(config.slow_dispatch_threshold_ms),
            slow_delivery_ms: AtomicU64::new(config.slow_delivery_threshold_ms),
            slow_delivery_detected: AtomicBool::new(false),
            observer,
        })
    }

    /// Looper bound to the calling thread without registering it anywhere.
    ///
    /// Useful for hosts that keep their own thread bookkeeping and for
    /// driving a queue against a [`ManualClock`](crate::ManualClock).
    pub fn detached(quit_allowed: bool, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::bind_current(
            quit_allowed,
            &LooperConfig::default(),
            clock,
            Arc::new(ObserverSlot::default()),
        )
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn state(&self) -> LoopState {
        if self.queue.is_disposed() {
            LoopState::Disposed
        } else if self.queue.is_quitting() {
            LoopState::Quitting
        } else if self.in_loop.load(Ordering::Acquire) {
            LoopState::Running
        } else {
            LoopState::Created
        }
    }

    /// Adjust the slow-dispatch and slow-delivery warnings (ms, 0 = off)
    pub fn set_slow_log_thresholds(&self, dispatch_ms: u64, delivery_ms: u64) {
        self.slow_dispatch_ms.store(dispatch_ms, Ordering::Relaxed);
        self.slow_delivery_ms.store(delivery_ms, Ordering::Relaxed);
    }

    /// Quit immediately, dropping everything still pending.
    ///
    /// Refused for the main looper; use [`Looper::quit_safely`] there.
    pub fn quit(&self) -> Result<()> {
        self.queue.quit(false)
    }

    /// Quit after the work that is already due has been dispatched.
    pub fn quit_safely(&self) -> Result<()> {
        self.queue.quit(true)
    }

    fn check_owner(&self) -> Result<()> {
        if !self.is_current_thread() {
            return Err(ExecError::WrongThread);
        }
        Ok(())
    }

    /// Drive the loop on the owning thread until it quits.
    ///
    /// A handler panic stops the loop with `Err(ExecError::Dispatch)`; the
    /// looper is left intact and may be run again.
    pub fn run(&self) -> Result<()> {
        self.check_owner()?;
        if self.queue.is_disposed() {
            return Err(ExecError::Disposed);
        }
        let in_loop = InLoop::enter(&self.in_loop);
        if in_loop.nested {
            tracing::warn!(
                target: "fos_exec::looper",
                looper = %self,
                "loop entered again; queued items will run before the current one completes"
            );
        }
        self.slow_delivery_detected.store(false, Ordering::Relaxed);

        while let Some(item) = self.queue.take_next() {
            self.dispatch_item(item)?;
        }
        tracing::debug!(target: "fos_exec::looper", looper = %self, "loop finished");
        Ok(())
    }

    /// Dispatch everything currently due without blocking.
    ///
    /// Intended to be called once per frame by a UI host. A call made while
    /// this looper is already being driven returns `Idle` without doing
    /// anything. Once the looper has quit every call returns `Quit`.
    pub fn run_ui(&self) -> Result<UiDrain> {
        self.check_owner()?;
        if self.in_loop.load(Ordering::Acquire) {
            return Ok(UiDrain::Idle);
        }
        let _in_loop = InLoop::enter(&self.in_loop);

        loop {
            match self.queue.poll_next() {
                QueuePoll::Ready(item) => self.dispatch_item(item)?,
                QueuePoll::Pending => return Ok(UiDrain::Idle),
                QueuePoll::Quit => return Ok(UiDrain::Quit),
            }
        }
    }

    fn dispatch_item(&self, item: Box<WorkItem>) -> Result<()> {
        let Some(target) = item.target.clone() else {
            // Barriers never leave the queue.
            WorkPool::global().recycle_unchecked(item);
            return Ok(());
        };

        let observer = self.observer.get();
        let dispatch_ms = self.slow_dispatch_ms.load(Ordering::Relaxed);
        let delivery_ms = self.slow_delivery_ms.load(Ordering::Relaxed);
        let log_slow_delivery = delivery_ms > 0 && item.when > 0;
        let log_slow_dispatch = dispatch_ms > 0;
        let start = if log_slow_delivery || log_slow_dispatch {
            self.queue.now()
        } else {
            0
        };

        let token = observer
            .as_ref()
            .map_or(ObserverToken::default(), |o| o.dispatch_starting());
        tracing::trace!(
            target: "fos_exec::looper",
            dispatcher = %target,
            item = %target.message_name(&item),
            what = item.what,
            ">>>>> dispatching"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| target.dispatch(&item)));
        let result = match outcome {
            Ok(()) => {
                if let Some(observer) = &observer {
                    observer.dispatch_completed(token, &item);
                }
                Ok(())
            }
            Err(panic) => {
                let error = DispatchError::from_panic(item.to_string(), panic);
                if let Some(observer) = &observer {
                    observer.dispatch_failed(token, &item, &error);
                }
                tracing::debug!(target: "fos_exec::looper", %error, "dispatch failed");
                Err(ExecError::Dispatch(error))
            }
        };

        if log_slow_delivery || log_slow_dispatch {
            let end = self.queue.now();
            if log_slow_delivery {
                let lateness = start.saturating_sub(item.when);
                if self.slow_delivery_detected.load(Ordering::Relaxed) {
                    if lateness <= DRAINED_THRESHOLD_MS {
                        tracing::warn!(target: "fos_exec::looper", looper = %self, "drained");
                        self.slow_delivery_detected.store(false, Ordering::Relaxed);
                    }
                } else if lateness >= delivery_ms {
                    tracing::warn!(
                        target: "fos_exec::looper",
                        dispatcher = %target,
                        item = %target.message_name(&item),
                        what = item.what,
                        late_ms = lateness,
                        "slow delivery"
                    );
                    // Stay quiet until the backlog has drained.
                    self.slow_delivery_detected.store(true, Ordering::Relaxed);
                }
            }
            let took = end.saturating_sub(start);
            if log_slow_dispatch && took >= dispatch_ms {
                tracing::warn!(
                    target: "fos_exec::looper",
                    dispatcher = %target,
                    item = %target.message_name(&item),
                    what = item.what,
                    took_ms = took,
                    "slow dispatch"
                );
            }
        }

        tracing::trace!(target: "fos_exec::looper", dispatcher = %target, "<<<<< finished");
        WorkPool::global().recycle_unchecked(item);
        result
    }
}

/// Marks a looper as being driven for the lifetime of the guard
struct InLoop<'a> {
    flag: &'a AtomicBool,
    nested: bool,
}

impl<'a> InLoop<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let nested = flag.swap(true, Ordering::AcqRel);
        Self { flag, nested }
    }
}

impl Drop for InLoop<'_> {
    fn drop(&mut self) {
        self.flag.store(self.nested, Ordering::Release);
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("thread", &self.thread)
            .field("thread_name", &self.thread_name)
            .field("state", &self.state())
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl fmt::Display for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Looper ({}, {:?}) {{{:p}}}",
            self.thread_name.as_deref().unwrap_or("unnamed"),
            self.thread,
            self as *const Self
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatcher::Dispatcher;
    use crate::item::Runnable;
    use crate::observer::DispatchObserver;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fixture(now: u64) -> (Arc<ManualClock>, Arc<Looper>, Dispatcher) {
        let clock = Arc::new(ManualClock::new(now));
        let looper = Looper::detached(true, clock.clone());
        let dispatcher = Dispatcher::new(&looper);
        (clock, looper, dispatcher)
    }

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
        next: AtomicU64,
    }

    impl DispatchObserver for Journal {
        fn dispatch_starting(&self) -> ObserverToken {
            let token = ObserverToken(self.next.fetch_add(1, Ordering::SeqCst));
            self.events.lock().push(format!("start {}", token.0));
            token
        }

        fn dispatch_completed(&self, token: ObserverToken, item: &WorkItem) {
            self.events.lock().push(format!("done {} what={}", token.0, item.what));
        }

        fn dispatch_failed(&self, token: ObserverToken, _item: &WorkItem, error: &DispatchError) {
            self.events.lock().push(format!("failed {} {}", token.0, error.message));
        }
    }

    #[test]
    fn test_run_ui_drains_due_work() {
        let (clock, looper, d) = fixture(100);
        let hits = Arc::new(AtomicUsize::new(0));
        for delay in [0, 0, 30] {
            let counter = hits.clone();
            d.post_delayed(
                Runnable::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(delay),
            )
            .unwrap();
        }

        assert_eq!(looper.run_ui().unwrap(), UiDrain::Idle);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        clock.advance(30);
        assert_eq!(looper.run_ui().unwrap(), UiDrain::Idle);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(looper.state(), LoopState::Created);
    }

    #[test]
    fn test_run_ui_reports_quit() {
        let (_clock, looper, _d) = fixture(100);
        looper.quit_safely().unwrap();
        assert_eq!(looper.state(), LoopState::Quitting);
        assert_eq!(looper.run_ui().unwrap(), UiDrain::Quit);
        assert_eq!(looper.state(), LoopState::Disposed);
        assert_eq!(looper.run_ui().unwrap(), UiDrain::Quit);
        assert!(matches!(looper.run(), Err(ExecError::Disposed)));
    }

    #[test]
    fn test_run_ui_nested_call_ignored() {
        let (_clock, looper, d) = fixture(100);
        let inner = looper.clone();
        let nested = Arc::new(Mutex::new(None));
        let slot = nested.clone();
        d.post(Runnable::new(move || {
            *slot.lock() = Some(inner.run_ui().unwrap());
        }))
        .unwrap();
        d.send_empty(1).unwrap();

        assert_eq!(looper.run_ui().unwrap(), UiDrain::Idle);
        assert_eq!(*nested.lock(), Some(UiDrain::Idle));
        assert!(looper.queue().is_empty());
    }

    #[test]
    fn test_run_until_quit() {
        let (_clock, looper, d) = fixture(100);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let order = order.clone();
            d.post(Runnable::new(move || order.lock().push(tag))).unwrap();
        }
        let quitter = looper.clone();
        d.post(Runnable::new(move || quitter.quit().unwrap())).unwrap();

        looper.run().unwrap();
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(looper.state(), LoopState::Disposed);
    }

    #[test]
    fn test_run_from_other_thread_rejected() {
        let (_clock, looper, _d) = fixture(100);
        let remote = looper.clone();
        let result = thread::spawn(move || remote.run()).join().unwrap();
        assert!(matches!(result, Err(ExecError::WrongThread)));
    }

    #[test]
    fn test_panic_surfaces_and_loop_resumes() {
        let (_clock, looper, d) = fixture(100);
        let journal = Arc::new(Journal::default());
        looper.observer.set(journal.clone());

        d.post(Runnable::new(|| panic!("handler failure"))).unwrap();
        d.send_empty(7).unwrap();

        let err = looper.run_ui().unwrap_err();
        match err {
            ExecError::Dispatch(e) => assert_eq!(e.message, "handler failure"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(looper.state(), LoopState::Created);

        assert_eq!(looper.run_ui().unwrap(), UiDrain::Idle);
        assert_eq!(
            *journal.events.lock(),
            vec![
                "start 0".to_string(),
                "failed 0 handler failure".to_string(),
                "start 1".to_string(),
                "done 1 what=7".to_string(),
            ]
        );
    }

    #[test]
    fn test_dispatched_items_return_to_pool() {
        let (_clock, looper, d) = fixture(100);
        let payload: Arc<u32> = Arc::new(9);
        d.send(d.obtain_message_with(2, 0, 0, Some(payload.clone())))
            .unwrap();
        assert_eq!(Arc::strong_count(&payload), 2);
        looper.run_ui().unwrap();
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    /// Shared sink for a test subscriber's output
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_warnings(f: impl FnOnce()) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_slow_delivery_latch() {
        let (clock, looper, d) = fixture(100);
        looper.set_slow_log_thresholds(0, 50);
        d.send_empty_at_time(1, 10).unwrap();
        d.send_empty_at_time(2, 20).unwrap();
        let logs = capture_warnings(|| {
            looper.run_ui().unwrap();
        });
        assert!(looper.slow_delivery_detected.load(Ordering::Relaxed));
        assert_eq!(logs.matches("slow delivery").count(), 1);
        assert!(logs.contains("late_ms=90"));

        clock.set(200);
        d.send_empty_at_time(3, 195).unwrap();
        let logs = capture_warnings(|| {
            looper.run_ui().unwrap();
        });
        assert!(!looper.slow_delivery_detected.load(Ordering::Relaxed));
        assert!(logs.contains("drained"));
    }

    #[test]
    fn test_slow_dispatch_warning() {
        let (clock, looper, d) = fixture(100);
        looper.set_slow_log_thresholds(50, 0);
        let stall = clock.clone();
        d.post(Runnable::new(move || stall.advance(80))).unwrap();
        d.send_empty(3).unwrap();

        let logs = capture_warnings(|| {
            assert_eq!(looper.run_ui().unwrap(), UiDrain::Idle);
        });
        assert_eq!(logs.matches("slow dispatch").count(), 1);
        assert!(logs.contains("took_ms=80"));
        assert!(!logs.contains("what=3"));
    }

    #[test]
    fn test_display_names_thread() {
        let (_clock, looper, _d) = fixture(100);
        let text = looper.to_string();
        assert!(text.starts_with("Looper ("));
        assert!(text.contains(&format!("{:?}", thread::current().id())));
    }
}

//! Pending Actions
//!
//! Buffers callbacks for a component that has no dispatcher yet, then
//! flushes them into one once it is attached.

use std::time::Duration;

use parking_lot::Mutex;

use crate::dispatcher::Dispatcher;
use crate::item::Runnable;

#[derive(Debug, Clone)]
struct PendingAction {
    runnable: Runnable,
    delay: Duration,
}

/// Callbacks waiting for a dispatcher
#[derive(Debug, Default)]
pub struct PendingActions {
    actions: Mutex<Vec<PendingAction>>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, runnable: Runnable) {
        self.post_delayed(runnable, Duration::ZERO);
    }

    pub fn post_delayed(&self, runnable: Runnable, delay: Duration) {
        self.actions.lock().push(PendingAction { runnable, delay });
    }

    /// Drop every buffered instance of `runnable`
    pub fn remove_callbacks(&self, runnable: &Runnable) {
        self.actions.lock().retain(|a| a.runnable != *runnable);
    }

    /// Post every buffered action to `dispatcher` with its delay, then clear.
    ///
    /// Delays count from this call, not from when the action was buffered.
    pub fn execute_actions(&self, dispatcher: &Dispatcher) {
        let actions = std::mem::take(&mut *self.actions.lock());
        for action in actions {
            match dispatcher.post_delayed(action.runnable, action.delay) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(target: "fos_exec::pending", "looper quitting; pending action dropped");
                }
                Err(error) => {
                    tracing::warn!(target: "fos_exec::pending", %error, "failed to flush pending action");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runnable of the `index`-th buffered action
    pub fn runnable(&self, index: usize) -> Option<Runnable> {
        self.actions.lock().get(index).map(|a| a.runnable.clone())
    }

    /// Delay of the `index`-th buffered action
    pub fn delay(&self, index: usize) -> Option<Duration> {
        self.actions.lock().get(index).map(|a| a.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::looper::Looper;
    use std::sync::Arc;

    #[test]
    fn test_buffer_and_remove() {
        let pending = PendingActions::new();
        let a = Runnable::new(|| {});
        let b = Runnable::new(|| {});
        pending.post(a.clone());
        pending.post_delayed(b.clone(), Duration::from_millis(40));
        pending.post(a.clone());
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.delay(1), Some(Duration::from_millis(40)));

        pending.remove_callbacks(&a);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.runnable(0), Some(b));
        assert_eq!(pending.runnable(1), None);
    }

    #[test]
    fn test_execute_actions_flushes() {
        let looper = Looper::detached(true, Arc::new(ManualClock::new(100)));
        let dispatcher = Dispatcher::new(&looper);
        let pending = PendingActions::new();
        let r = Runnable::new(|| {});
        pending.post(r.clone());
        pending.post_delayed(Runnable::new(|| {}), Duration::from_millis(25));

        pending.execute_actions(&dispatcher);
        assert!(pending.is_empty());
        assert_eq!(looper.queue().len(), 2);
        assert!(dispatcher.has_callbacks(&r));
    }
}

//! Work Items
//!
//! The schedulable unit. An item is either a callback to invoke or a tagged
//! message (`what`, `arg1`, `arg2`, `payload`) routed through its target
//! dispatcher. Items are boxed and moved between the caller, the pool and
//! the queue, so at any instant exactly one of them owns an item.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::{ExecError, Result};
use crate::messenger::Messenger;
use crate::pool::WorkPool;

/// Opaque application payload
pub type Payload = Arc<dyn Any + Send + Sync>;

const FLAG_IN_USE: u8 = 1 << 0;
const FLAG_ASYNCHRONOUS: u8 = 1 << 1;

/// Cloneable callback with reference identity
///
/// Two runnables are equal only if they are clones of the same handle,
/// which is what `remove_callbacks` matches on.
#[derive(Clone)]
pub struct Runnable(Arc<dyn Fn() + Send + Sync>);

impl Runnable {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the callback
    pub fn run(&self) {
        (self.0)()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Runnable {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Runnable {}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runnable({:p})", self.addr())
    }
}

/// What a work item does when it is dispatched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Work {
    /// Routed through the target dispatcher's handlers
    #[default]
    Message,
    /// Invoked directly, bypassing the dispatcher's handlers
    Callback(Runnable),
}

/// A timestamped unit of deferred work
pub struct WorkItem {
    /// Application-defined message code
    pub what: i32,
    /// First integer argument
    pub arg1: i32,
    /// Second integer argument
    pub arg2: i32,
    /// Arbitrary payload, also used as a removal token for callbacks
    pub payload: Option<Payload>,
    /// Where replies to this item should be sent, if anywhere
    pub reply_to: Option<Messenger>,
    pub(crate) work: Work,
    pub(crate) when: u64,
    pub(crate) target: Option<Dispatcher>,
    pub(crate) flags: u8,
}

impl WorkItem {
    pub(crate) fn empty() -> Self {
        Self {
            what: 0,
            arg1: 0,
            arg2: 0,
            payload: None,
            reply_to: None,
            work: Work::Message,
            when: 0,
            target: None,
            flags: 0,
        }
    }

    /// Take a zeroed item from the global pool
    pub fn obtain() -> Box<Self> {
        WorkPool::global().obtain()
    }

    /// Take a zeroed item already aimed at `target`
    pub fn obtain_for(target: &Dispatcher) -> Box<Self> {
        let mut item = Self::obtain();
        item.target = Some(target.clone());
        item
    }

    /// Take an item from the pool and copy `orig`'s content and target into it
    pub fn obtain_copy(orig: &WorkItem) -> Box<Self> {
        let mut item = Self::obtain();
        item.what = orig.what;
        item.arg1 = orig.arg1;
        item.arg2 = orig.arg2;
        item.payload = orig.payload.clone();
        item.reply_to = orig.reply_to.clone();
        item.target = orig.target.clone();
        item.work = orig.work.clone();
        item
    }

    /// Copy message content from `other`, keeping this item's target and work
    pub fn copy_from(&mut self, other: &WorkItem) {
        self.flags = other.flags & !FLAG_IN_USE;
        self.what = other.what;
        self.arg1 = other.arg1;
        self.arg2 = other.arg2;
        self.payload = other.payload.clone();
        self.reply_to = other.reply_to.clone();
    }

    /// Scheduled time in queue-clock milliseconds
    pub fn when(&self) -> u64 {
        self.when
    }

    pub fn target(&self) -> Option<&Dispatcher> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: &Dispatcher) {
        self.target = Some(target.clone());
    }

    pub fn work(&self) -> &Work {
        &self.work
    }

    /// The callback, if this item is a callback item
    pub fn callback(&self) -> Option<&Runnable> {
        match &self.work {
            Work::Callback(r) => Some(r),
            Work::Message => None,
        }
    }

    pub fn set_callback(&mut self, runnable: Runnable) {
        self.work = Work::Callback(runnable);
    }

    /// Downcast the payload
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }

    /// Asynchronous items are not stalled by barriers
    pub fn is_async(&self) -> bool {
        self.flags & FLAG_ASYNCHRONOUS != 0
    }

    pub fn set_async(&mut self, asynchronous: bool) {
        if asynchronous {
            self.flags |= FLAG_ASYNCHRONOUS;
        } else {
            self.flags &= !FLAG_ASYNCHRONOUS;
        }
    }

    /// True from enqueue until the item is recycled
    pub fn is_in_use(&self) -> bool {
        self.flags & FLAG_IN_USE != 0
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.flags |= FLAG_IN_USE;
    }

    pub(crate) fn is_barrier(&self) -> bool {
        self.target.is_none()
    }

    /// Send this item to its target dispatcher
    pub fn send_to_target(self: Box<Self>) -> Result<bool> {
        match self.target.clone() {
            Some(target) => target.send(self),
            None => Err(ExecError::MissingTarget),
        }
    }

    /// Zero every field; the item counts as in use while it sits in a pool.
    pub(crate) fn reset(&mut self) {
        self.flags = FLAG_IN_USE;
        self.what = 0;
        self.arg1 = 0;
        self.arg2 = 0;
        self.payload = None;
        self.reply_to = None;
        self.work = Work::Message;
        self.when = 0;
        self.target = None;
    }

    pub(crate) fn clear_flags(&mut self) {
        self.flags = 0;
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("when", &self.when)
            .field("what", &self.what)
            .field("arg1", &self.arg1)
            .field("arg2", &self.arg2)
            .field("has_payload", &self.payload.is_some())
            .field("work", &self.work)
            .field("target", &self.target)
            .field("async", &self.is_async())
            .field("in_use", &self.is_in_use())
            .finish()
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ when={}", self.when)?;
        match (&self.target, &self.work) {
            (None, _) => write!(f, " barrier={}", self.arg1)?,
            (Some(target), Work::Callback(r)) => write!(f, " callback={:?} target={}", r, target)?,
            (Some(target), Work::Message) => {
                write!(f, " what={}", self.what)?;
                if self.arg1 != 0 {
                    write!(f, " arg1={}", self.arg1)?;
                }
                if self.arg2 != 0 {
                    write!(f, " arg2={}", self.arg2)?;
                }
                write!(f, " target={}", target)?;
            }
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runnable_identity() {
        let a = Runnable::new(|| {});
        let b = Runnable::new(|| {});
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_async_flag_toggle() {
        let mut item = WorkItem::empty();
        assert!(!item.is_async());
        item.set_async(true);
        assert!(item.is_async());
        item.set_async(false);
        assert!(!item.is_async());
    }

    #[test]
    fn test_reset_clears_content() {
        let mut item = WorkItem::empty();
        item.what = 7;
        item.arg1 = 1;
        item.arg2 = 2;
        item.when = 99;
        item.payload = Some(Arc::new(5u32));
        item.set_callback(Runnable::new(|| {}));
        item.set_async(true);

        item.reset();
        assert_eq!(item.what, 0);
        assert_eq!(item.arg1, 0);
        assert_eq!(item.arg2, 0);
        assert_eq!(item.when, 0);
        assert!(item.payload.is_none());
        assert!(item.callback().is_none());
        assert!(!item.is_async());
        assert!(item.is_in_use());
    }

    #[test]
    fn test_copy_from_drops_in_use() {
        let mut src = WorkItem::empty();
        src.what = 3;
        src.payload = Some(Arc::new("token"));
        src.set_async(true);
        src.mark_in_use();

        let mut dst = WorkItem::empty();
        dst.copy_from(&src);
        assert_eq!(dst.what, 3);
        assert!(dst.is_async());
        assert!(!dst.is_in_use());
        assert_eq!(dst.payload_as::<&str>(), Some(&"token"));
    }

    #[test]
    fn test_send_without_target_fails() {
        let item = Box::new(WorkItem::empty());
        assert!(matches!(item.send_to_target(), Err(ExecError::MissingTarget)));
    }
}

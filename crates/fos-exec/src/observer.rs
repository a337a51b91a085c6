//! Dispatch Observation
//!
//! Optional hook bracketing every dispatch a looper performs. Observers are
//! advisory: they see items but cannot change how they are handled.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::DispatchError;
use crate::item::WorkItem;

/// Opaque value handed from `dispatch_starting` to the matching completion call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObserverToken(pub u64);

/// Receives dispatch start and end notifications, on the looper's thread
pub trait DispatchObserver: Send + Sync {
    /// Called before an item is dispatched
    fn dispatch_starting(&self) -> ObserverToken;

    /// Called after `item` was handled normally
    fn dispatch_completed(&self, token: ObserverToken, item: &WorkItem);

    /// Called when handling `item` panicked
    fn dispatch_failed(&self, token: ObserverToken, item: &WorkItem, error: &DispatchError);
}

/// Shared, replaceable observer reference
#[derive(Default)]
pub(crate) struct ObserverSlot {
    observer: RwLock<Option<Arc<dyn DispatchObserver>>>,
}

impl ObserverSlot {
    pub(crate) fn set(&self, observer: Arc<dyn DispatchObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub(crate) fn clear(&self) {
        *self.observer.write() = None;
    }

    /// Snapshot of the current observer
    pub(crate) fn get(&self) -> Option<Arc<dyn DispatchObserver>> {
        self.observer.read().clone()
    }
}

impl fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSlot")
            .field("installed", &self.observer.read().is_some())
            .finish()
    }
}

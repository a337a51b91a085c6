//! Messenger
//!
//! Send-only handle to a dispatcher, suitable for handing to producers that
//! should be able to deliver work but not remove or inspect it.

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::item::WorkItem;

/// Cloneable send-only reference to a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Messenger {
    target: Dispatcher,
}

impl Messenger {
    pub fn new(target: &Dispatcher) -> Self {
        Self {
            target: target.clone(),
        }
    }

    /// Deliver `item` to the dispatcher as an immediate send
    pub fn send(&self, item: Box<WorkItem>) -> Result<bool> {
        self.target.send(item)
    }

    pub fn target(&self) -> &Dispatcher {
        &self.target
    }
}

//! Work Item Pooling
//!
//! Reuse dispatched work items to reduce allocation churn.
//! The pool is an optimization: overflow is silently dropped.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::error::{ExecError, Result};
use crate::item::WorkItem;

/// Default number of items a pool keeps around
pub const MAX_POOL_SIZE: usize = 50;

static GLOBAL_POOL: OnceLock<WorkPool> = OnceLock::new();

/// Bounded free-list of work items
#[derive(Debug)]
pub struct WorkPool {
    inner: Mutex<PoolInner>,
    max_size: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<Box<WorkItem>>,
    allocations_saved: u64,
    discarded: u64,
}

impl WorkPool {
    pub fn new() -> Self {
        Self::with_max_size(MAX_POOL_SIZE)
    }

    pub fn with_max_size(max: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::with_capacity(max),
                ..PoolInner::default()
            }),
            max_size: max,
        }
    }

    /// The process-wide pool used by the queues
    pub fn global() -> &'static WorkPool {
        GLOBAL_POOL.get_or_init(WorkPool::new)
    }

    /// Get a zeroed item, reusing a pooled one when available
    pub fn obtain(&self) -> Box<WorkItem> {
        let pooled = {
            let mut inner = self.inner.lock();
            let item = inner.free.pop();
            if item.is_some() {
                inner.allocations_saved += 1;
            }
            item
        };
        match pooled {
            Some(mut item) => {
                item.clear_flags();
                item
            }
            None => Box::new(WorkItem::empty()),
        }
    }

    /// Return an item that is no longer in use
    pub fn recycle(&self, item: Box<WorkItem>) -> Result<()> {
        if item.is_in_use() {
            return Err(ExecError::ItemInUse);
        }
        self.recycle_unchecked(item);
        Ok(())
    }

    /// Zero and return an item regardless of its in-use state
    ///
    /// Used by the queue and loop after dispatch and during teardown.
    pub fn recycle_unchecked(&self, mut item: Box<WorkItem>) {
        // Drop payload and target references before taking the lock.
        item.reset();
        let mut inner = self.inner.lock();
        if inner.free.len() < self.max_size {
            inner.free.push(item);
        } else {
            inner.discarded += 1;
        }
    }

    /// Number of pooled items
    pub fn len(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            pooled: inner.free.len(),
            allocations_saved: inner.allocations_saved,
            discarded: inner.discarded,
        }
    }
}

impl Default for WorkPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pooled: usize,
    pub allocations_saved: u64,
    pub discarded: u64,
}

//! Thread Registry
//!
//! Explicit map from OS thread to its looper, plus the main looper slot and
//! the observer shared by every looper the registry prepares.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::clock::{Clock, MonotonicClock};
use crate::config::LooperConfig;
use crate::error::{ExecError, Result};
use crate::looper::Looper;
use crate::observer::{DispatchObserver, ObserverSlot};

static GLOBAL_REGISTRY: OnceLock<ThreadRegistry> = OnceLock::new();

/// Thread to looper bindings
#[derive(Debug)]
pub struct ThreadRegistry {
    loopers: Mutex<HashMap<ThreadId, Arc<Looper>>>,
    main: Mutex<Option<Arc<Looper>>>,
    observer: Arc<ObserverSlot>,
    config: LooperConfig,
    clock: Arc<dyn Clock>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::with_config(LooperConfig::default(), Arc::new(MonotonicClock::new()))
    }

    pub fn with_config(config: LooperConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            loopers: Mutex::new(HashMap::new()),
            main: Mutex::new(None),
            observer: Arc::new(ObserverSlot::default()),
            config,
            clock,
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static ThreadRegistry {
        GLOBAL_REGISTRY.get_or_init(ThreadRegistry::new)
    }

    pub fn config(&self) -> &LooperConfig {
        &self.config
    }

    /// Bind a new quittable looper to the calling thread.
    ///
    /// Loopers of other threads that have been disposed are dropped from
    /// the registry here. A looper that never quits stays registered until
    /// [`ThreadRegistry::release`] is called on its thread.
    pub fn prepare(&self) -> Result<Arc<Looper>> {
        self.prepare_with(true)
    }

    /// Bind the main looper to the calling thread.
    ///
    /// The main looper refuses [`Looper::quit`]; only a safe quit stops it.
    pub fn prepare_main(&self) -> Result<Arc<Looper>> {
        let mut main = self.main.lock();
        if main.is_some() {
            return Err(ExecError::MainAlreadyPrepared);
        }
        let looper = self.prepare_with(false)?;
        *main = Some(looper.clone());
        Ok(looper)
    }

    fn prepare_with(&self, quit_allowed: bool) -> Result<Arc<Looper>> {
        let id = thread::current().id();
        let mut loopers = self.loopers.lock();
        if loopers.contains_key(&id) {
            return Err(ExecError::AlreadyPrepared);
        }
        let before = loopers.len();
        loopers.retain(|_, looper| !looper.queue().is_disposed());
        if loopers.len() < before {
            tracing::debug!(
                target: "fos_exec::registry",
                swept = before - loopers.len(),
                "dropped disposed loopers"
            );
        }
        let looper = Looper::bind_current(
            quit_allowed,
            &self.config,
            self.clock.clone(),
            self.observer.clone(),
        );
        loopers.insert(id, looper.clone());
        tracing::debug!(target: "fos_exec::registry", looper = %looper, quit_allowed, "prepared");
        Ok(looper)
    }

    /// Looper of the calling thread
    pub fn lookup(&self) -> Option<Arc<Looper>> {
        self.lookup_thread(thread::current().id())
    }

    pub fn lookup_thread(&self, id: ThreadId) -> Option<Arc<Looper>> {
        self.loopers.lock().get(&id).cloned()
    }

    pub fn main_looper(&self) -> Option<Arc<Looper>> {
        self.main.lock().clone()
    }

    /// Forget the calling thread's looper so the thread may prepare again
    pub fn release(&self) -> Option<Arc<Looper>> {
        let id = thread::current().id();
        let looper = self.loopers.lock().remove(&id)?;
        let mut main = self.main.lock();
        if main.as_ref().is_some_and(|m| Arc::ptr_eq(m, &looper)) {
            *main = None;
        }
        tracing::debug!(target: "fos_exec::registry", looper = %looper, "released");
        Some(looper)
    }

    /// Install the observer notified around every dispatch
    pub fn set_observer(&self, observer: Arc<dyn DispatchObserver>) {
        self.observer.set(observer);
    }

    pub fn clear_observer(&self) {
        self.observer.clear();
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

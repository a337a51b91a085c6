//! fOS Exec - Thread-bound Event Loops
//!
//! This crate provides the cooperative scheduler the fOS UI thread and its
//! workers run on:
//! - Per-thread loopers driving a time-ordered work queue
//! - Dispatchers for posting, removing and querying work from any thread
//! - Synchronization barriers and asynchronous items
//! - Idle callbacks run when the queue has nothing due
//! - Bounded pooling of work items
//! - Safe and immediate shutdown

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod item;
pub mod looper;
pub mod messenger;
pub mod observer;
pub mod parker;
pub mod pending;
pub mod pool;
pub mod queue;
pub mod registry;

pub use clock::{Clock, ManualClock, MonotonicClock, uptime_millis};
pub use config::LooperConfig;
pub use dispatcher::{Dispatcher, HandlerCallback, MessageHandler};
pub use error::{DispatchError, ExecError, Result};
pub use item::{Payload, Runnable, Work, WorkItem};
pub use looper::{LoopState, Looper, UiDrain};
pub use messenger::Messenger;
pub use observer::{DispatchObserver, ObserverToken};
pub use parker::{Parker, PollTimeout};
pub use pending::PendingActions;
pub use pool::{MAX_POOL_SIZE, PoolStats, WorkPool};
pub use queue::{IdleCallback, QueuePoll, WorkQueue};
pub use registry::ThreadRegistry;

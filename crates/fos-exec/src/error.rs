//! Error Types
//!
//! Usage errors are returned immediately as `Err`. Shutdown races are not
//! errors: posting to a quitting loop reports `Ok(false)` instead.

use std::any::Any;
use std::thread::ThreadId;

/// Scheduler error
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Only one looper may be prepared per thread")]
    AlreadyPrepared,

    #[error("The main looper has already been prepared")]
    MainAlreadyPrepared,

    #[error("No looper prepared on thread {0:?}")]
    NotPrepared(ThreadId),

    #[error("Work item must have a target dispatcher")]
    MissingTarget,

    #[error("Work item is still in use")]
    ItemInUse,

    #[error("Barrier token {0} has not been posted or has already been removed")]
    UnknownBarrier(i32),

    #[error("This looper is not allowed to quit")]
    QuitNotAllowed,

    #[error("Looper has been disposed and cannot run again")]
    Disposed,

    #[error("Looper can only be driven from its owning thread")]
    WrongThread,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// A handler panicked while a work item was being dispatched.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Dispatch of {item} panicked: {message}")]
pub struct DispatchError {
    /// Description of the item that was being dispatched
    pub item: String,
    /// Panic message, when it was a string
    pub message: String,
}

impl DispatchError {
    pub(crate) fn from_panic(item: String, panic: Box<dyn Any + Send>) -> Self {
        Self {
            item,
            message: panic_message(panic.as_ref()),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_dispatch_error_converts() {
        let err = DispatchError::from_panic("item".into(), Box::new("boom"));
        let exec: ExecError = err.into();
        assert!(matches!(exec, ExecError::Dispatch(_)));
        assert_eq!(exec.to_string(), "Dispatch of item panicked: boom");
    }
}

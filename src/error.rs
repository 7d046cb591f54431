//! The failure type carried by [`Outcome`][crate::Outcome]s and returned by blocking operations.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    error::Error as StdError,
    sync::Arc,
};

use thiserror::Error;

/// A type-erased error returned by a task body.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Everything that can go wrong while running or awaiting a task.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// The task body panicked. The panic was contained at the thread boundary.
    ///
    /// The backtrace is only part of the message if one was actually captured (see
    /// [`Backtrace::capture`]).
    #[error("recovered panic: {message}{}", captured(.backtrace))]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
        /// Backtrace captured where the panic was contained.
        backtrace: Arc<Backtrace>,
    },

    /// The task body returned an error.
    #[error("{0}")]
    Failed(BoxError),

    /// The channel was closed without yielding an outcome.
    #[error("channel is closed")]
    ChannelClosed,

    /// The context was canceled.
    #[error("context canceled")]
    Canceled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// Wraps an arbitrary error as [`Error::Failed`].
    pub fn failed<E: Into<BoxError>>(error: E) -> Self {
        Error::Failed(error.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        Error::Panicked {
            message,
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Panicked { .. } => "task_panicked",
            Error::Failed(_) => "task_failed",
            Error::ChannelClosed => "channel_closed",
            Error::Canceled => "context_canceled",
            Error::DeadlineExceeded => "context_deadline_exceeded",
        }
    }

    /// Returns `true` if this error was caused by the context ending, rather than by a task.
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    /// Attempts to view the error returned by a task body as a concrete type.
    ///
    /// Returns [`None`] for every variant other than [`Error::Failed`], or if the type doesn't
    /// match.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Error::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

fn captured(backtrace: &Backtrace) -> String {
    match backtrace.status() {
        BacktraceStatus::Captured => format!("\n{backtrace}"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        panic::{catch_unwind, resume_unwind},
    };

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl StdError for Boom {}

    #[test]
    fn failed_displays_inner() {
        let err = Error::failed(Boom);
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.downcast_ref::<Boom>(), Some(&Boom));
        assert_eq!(err.as_label(), "task_failed");
    }

    #[test]
    fn failed_from_str() {
        let err = Error::failed("plain message");
        assert_eq!(err.to_string(), "plain message");
        assert!(err.downcast_ref::<Boom>().is_none());
    }

    #[test]
    fn panic_payload_message() {
        let payload = catch_unwind(|| resume_unwind(Box::new("static str"))).unwrap_err();
        match Error::from_panic(payload) {
            Error::Panicked { message, .. } => assert_eq!(message, "static str"),
            other => panic!("unexpected {other:?}"),
        }

        let payload = catch_unwind(|| resume_unwind(Box::new(format!("formatted {}", 42)))).unwrap_err();
        let err = Error::from_panic(payload);
        assert!(err.to_string().starts_with("recovered panic: formatted 42"));

        let err = Error::from_panic(Box::new(7_u32));
        assert!(err.to_string().contains("unknown panic"));
    }

    #[test]
    fn panic_without_backtrace_is_just_the_message() {
        let err = Error::Panicked {
            message: "boom".into(),
            backtrace: Arc::new(Backtrace::disabled()),
        };
        assert_eq!(err.to_string(), "recovered panic: boom");
    }

    #[test]
    fn context_errors() {
        assert!(Error::Canceled.is_context());
        assert!(Error::DeadlineExceeded.is_context());
        assert!(!Error::ChannelClosed.is_context());
        assert!(Error::Canceled.downcast_ref::<Boom>().is_none());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}

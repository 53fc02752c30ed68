//! Contains the `Error` and `Result` types that `graphdb-client` uses.

use std::sync::Arc;

use thiserror::Error;

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `graphdb-client` crate. The inner [`ErrorKind`] is wrapped in
/// an `Arc` so that `Error` can be cheaply cloned to hand the same failure both to the caller
/// awaiting a task and to an observability event.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub(crate) fn not_ready() -> Self {
        Self::new(ErrorKind::NotReady)
    }

    pub(crate) fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    pub(crate) fn enqueue_full() -> Self {
        Self::new(ErrorKind::EnqueueFull)
    }

    pub(crate) fn closed() -> Self {
        Self::new(ErrorKind::Closed)
    }

    pub(crate) fn authentication_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationRejected {
            message: message.into(),
        })
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport {
            message: message.into(),
        })
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            message: message.into(),
        })
    }

    pub(crate) fn server(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError {
            code,
            message: message.into(),
        })
    }

    /// Returns the server-side error code carried by this error, if any.
    pub fn server_code(&self) -> Option<i32> {
        match &*self.kind {
            ErrorKind::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(err)))
    }
}

/// The taxonomy of errors this crate can surface: transport faults, authentication faults,
/// session-invalidated faults, query-level errors, task timeouts, queue overflow, and shutdown.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided at pool construction or to `execute`.
    #[error("an invalid argument was provided: {message}")]
    InvalidArgument { message: String },

    /// The session bound to a connection is invalid or the connection is not yet ready to accept
    /// work.
    #[error("session invalid or connection not ready")]
    NotReady,

    /// The task's `executeTimeout` elapsed before a reply was received.
    #[error("task timed out before a reply was received")]
    Timeout,

    /// The task queue was already at `bufferSize` when `execute` was called.
    #[error("connection pool task queue is full")]
    EnqueueFull,

    /// The pool has been closed; no new tasks are dispatched.
    #[error("connection pool is closed")]
    Closed,

    /// Authentication against a server was rejected.
    #[error("authentication rejected: {message}")]
    AuthenticationRejected { message: String },

    /// A transport-level fault occurred (connect failed, mid-connection close, frame I/O error).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned a non-zero `error_code` that does not invalidate the session.
    /// Passthrough of the server-side `error_code`/`error_msg`.
    #[error("server returned error {code}: {message}")]
    ServerError { code: i32, message: String },

    /// An internal invariant was violated. Should never surface to a well-behaved caller.
    #[error("internal error: {message}")]
    Internal { message: String },
}

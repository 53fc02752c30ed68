//! The unit of work that crosses the pool boundary.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::{error::Result, rpc::ExecuteResponse};

/// The outcome of a successfully executed statement, returned to the caller of
/// [`Pool::execute`](crate::Pool::execute).
#[derive(Clone, Debug)]
pub struct ExecuteOutcome {
    /// The raw RPC response, unmodified. Row-to-value parsing is outside this crate's scope;
    /// callers that need structured values decode `data` themselves or via a higher-level crate
    /// built on top of this one.
    pub response: ExecuteResponse,

    /// Time in milliseconds the server reported spending executing the statement, if the server
    /// supplied metrics.
    pub execute_millis: Option<u64>,

    /// Time in milliseconds the server reported spending on graph traversal, if the server
    /// supplied metrics.
    pub traverse_millis: Option<u64>,

    /// The id of the Connection that served this task.
    pub connection_id: u32,
}

/// A caller request dispatched onto a free Connection.
pub(crate) struct Task {
    pub statement: Vec<u8>,
    pub deadline: Instant,
    pub reply: oneshot::Sender<Result<ExecuteOutcome>>,
}

impl Task {
    pub(crate) fn new(
        statement: Vec<u8>,
        execute_timeout: Duration,
    ) -> (Self, oneshot::Receiver<Result<ExecuteOutcome>>) {
        let (reply, rx) = oneshot::channel();
        let task = Self {
            statement,
            deadline: Instant::now() + execute_timeout,
            reply,
        };
        (task, rx)
    }

    /// Fails the task and consumes it. Ignores a dropped receiver (the caller gave up waiting).
    pub(crate) fn fail(self, err: crate::error::Error) {
        let _ = self.reply.send(Err(err));
    }
}

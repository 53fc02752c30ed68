//! The stateless public entry point: a thin, cheaply-cloneable wrapper around [`Pool`] that
//! validates caller input, assembles a task, and awaits the result. Mirrors the way
//! `mongodb::Client` is a thin `Arc`-wrapped handle around the real work done by `cmap`/`sdam`.

use std::sync::Arc;

use crate::{
    error::{Error, Result},
    event::PoolEventHandler,
    options::PoolOptions,
    pool::{ExecuteOptions, Pool, PoolStats},
    task::ExecuteOutcome,
};

/// A client for a distributed graph database, backed by a pool of persistent authenticated
/// sessions.
///
/// `GraphClient` uses [`Arc`] internally, so cloning it is cheap and every clone shares the same
/// underlying pool. Construct one with [`GraphClient::new`], issue statements with
/// [`GraphClient::execute`], and release its resources with [`GraphClient::close`] once it is no
/// longer needed.
///
/// ```no_run
/// # use graphdb_client::{GraphClient, PoolOptions, ServerAddress};
/// # async fn run() -> graphdb_client::Result<()> {
/// let options = PoolOptions::new(vec![ServerAddress::new("127.0.0.1", 9669)], "root", "nebula");
/// let client = GraphClient::new(options)?;
/// let result = client.execute("YIELD 1", Default::default()).await?;
/// println!("served by connection {}", result.connection_id);
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GraphClient {
    pool: Arc<Pool>,
}

impl GraphClient {
    /// Constructs a client and eagerly begins authenticating its pool of Connections. Returns an
    /// error if `options` fails validation (see [`PoolOptions`]); does not wait for any Connection
    /// to finish authenticating before returning.
    pub fn new(options: PoolOptions) -> Result<Self> {
        Ok(Self {
            pool: Arc::new(Pool::new(options, None)?),
        })
    }

    /// Constructs a client with an observability handler registered for the lifetime of the pool.
    pub fn with_event_handler(
        options: PoolOptions,
        handler: Arc<dyn PoolEventHandler>,
    ) -> Result<Self> {
        Ok(Self {
            pool: Arc::new(Pool::new(options, Some(handler))?),
        })
    }

    /// Executes a statement on a free Connection and awaits its result.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`](crate::error::ErrorKind::InvalidArgument) if
    /// `statement` is empty, with [`ErrorKind::EnqueueFull`](crate::error::ErrorKind::EnqueueFull)
    /// if the pool's task queue is already at capacity, and with
    /// [`ErrorKind::Closed`](crate::error::ErrorKind::Closed) if the client has already been
    /// closed.
    pub async fn execute(
        &self,
        statement: impl Into<Vec<u8>>,
        opts: ExecuteOptions,
    ) -> Result<ExecuteOutcome> {
        let statement = statement.into();
        if statement.is_empty() {
            return Err(Error::invalid_argument("statement must not be empty"));
        }
        self.pool.execute(statement, opts).await
    }

    /// A point-in-time snapshot of pool and session-monitor counters, useful for dashboards and
    /// diagnostics.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes the underlying pool: stops the heartbeat and monitor tickers, attempts to sign out
    /// every Connection's session regardless of readiness, and rejects any task still queued.
    /// Idempotent: a second call observes the pool already closed and returns immediately.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

//! The connection pool: constructs Connections, dispatches tasks onto idle
//! Connections with bounded waiting, runs the heartbeat and session-monitor tickers, and tears
//! down cleanly. The rough counterpart to `mongodb`'s `cmap::Pool` plus `cmap::manager`, folded
//! into one type since this crate doesn't need the full checkout/check-in connection-pool
//! abstraction a pooled-client model would otherwise need.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Instant,
};

use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    connection::{self, ConnectionHandle, TaskQueue},
    error::{Error, Result},
    event::{PoolEventEmitter, PoolEventHandler},
    monitor::{self, MonitorStats},
    options::{PoolOptions, ServerAddress},
    rpc::{BincodeRpcStub, RpcStub},
    runtime::{self, JoinHandle},
    task::{ExecuteOutcome, Task},
    transport::{TcpTransport, Transport},
};

#[cfg(test)]
mod tests;

pub(crate) type TransportFactory = Arc<dyn Fn(&ServerAddress) -> Box<dyn Transport> + Send + Sync>;
pub(crate) type RpcFactory = Arc<dyn Fn(&PoolOptions) -> Box<dyn RpcStub> + Send + Sync>;

/// Options accepted by [`Pool::execute`]. Row-to-value parsing is out of this crate's scope (see
/// `ExecuteOutcome::response`), so there is currently nothing to configure here; the struct exists
/// so a caller-facing option can be added later without changing `execute`'s signature.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct ExecuteOptions {}

/// A pool of authenticated sessions to one or more backend servers. Construct one
/// with [`Pool::new`]; `execute` and `close` may both be called from any thread of control.
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    options: Arc<PoolOptions>,
    connections: Vec<ConnectionHandle>,
    queue: TaskQueue,
    events: PoolEventEmitter,
    closed: AtomicBool,
    close_lock: AsyncMutex<()>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
    monitor_stats: StdMutex<MonitorStats>,
}

/// A point-in-time snapshot of pool-level counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    /// Total Connections currently in the pool.
    pub connection_count: usize,
    /// Total Connections currently ready and idle (immediately dispatchable).
    pub idle_count: usize,
    /// Total tasks currently queued awaiting a free Connection.
    pub queued_count: usize,
    /// Cumulative session-monitor counters.
    pub monitor: MonitorStats,
    /// Cumulative reconnect attempts across all Connections.
    pub reconnect_attempts: u64,
    /// Cumulative cleanup failures across all Connections.
    pub failed_cleanups: u64,
}

impl Pool {
    /// Constructs a pool against real TCP transports and the reference `bincode` RPC stub.
    /// Non-optional fields in `options` are validated eagerly; invalid configuration is rejected
    /// here rather than on first use.
    pub fn new(options: PoolOptions, handler: Option<Arc<dyn PoolEventHandler>>) -> Result<Self> {
        let transport_factory: TransportFactory =
            Arc::new(|addr: &ServerAddress| Box::new(TcpTransport::new(addr.clone())) as Box<dyn Transport>);
        let rpc_factory: RpcFactory = Arc::new(|options: &PoolOptions| {
            Box::new(BincodeRpcStub {
                session_invalidated_codes: options.session_invalidated_codes.clone(),
            }) as Box<dyn RpcStub>
        });
        Self::with_factories(options, handler, transport_factory, rpc_factory)
    }

    /// Constructs a pool against caller-supplied transport/RPC factories. Internal: exercised
    /// directly by this crate's tests to substitute mock transports and stubs.
    pub(crate) fn with_factories(
        options: PoolOptions,
        handler: Option<Arc<dyn PoolEventHandler>>,
        transport_factory: TransportFactory,
        rpc_factory: RpcFactory,
    ) -> Result<Self> {
        options.validate()?;
        let options = Arc::new(options);
        let events = PoolEventEmitter::new(handler);
        let epoch = Instant::now();
        let queue: TaskQueue = Arc::new(StdMutex::new(std::collections::VecDeque::new()));

        let mut connections = Vec::with_capacity(options.pool_size as usize * options.servers.len());
        let mut next_id = 0u32;
        // Round-robin distribution across servers: for
        // `poolSize` rounds, assign one Connection per server in order, rather than grouping all
        // of a server's Connections together. Either ordering satisfies the
        // `poolSize * |servers|` total, but round-robin construction order means an early
        // `close()` during slow startup still spans every server, which is easier to reason
        // about when debugging a partially-initialized pool.
        for _round in 0..options.pool_size {
            for server in &options.servers {
                let id = next_id;
                next_id += 1;
                let transport = transport_factory(server);
                let rpc = rpc_factory(&options);
                let handle = connection::spawn_connection(
                    id,
                    server.clone(),
                    options.clone(),
                    epoch,
                    transport,
                    rpc,
                    queue.clone(),
                    events.clone(),
                );
                connections.push(handle);
            }
        }

        let inner = Arc::new(PoolInner {
            options,
            connections,
            queue,
            events,
            closed: AtomicBool::new(false),
            close_lock: AsyncMutex::new(()),
            heartbeat: StdMutex::new(None),
            monitor: StdMutex::new(None),
            monitor_stats: StdMutex::new(MonitorStats::default()),
        });

        inner.start_tickers();

        Ok(Self { inner })
    }

    /// Executes a statement on a free Connection.
    pub async fn execute(
        &self,
        statement: impl Into<Vec<u8>>,
        opts: ExecuteOptions,
    ) -> Result<ExecuteOutcome> {
        let _ = opts;
        self.inner.execute(statement.into()).await
    }

    /// Closes the pool: stops the tickers, closes every Connection (signout-attempting
    /// regardless of readiness), and rejects any task still queued. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// A point-in-time snapshot of pool and monitor counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

impl PoolInner {
    fn start_tickers(self: &Arc<Self>) {
        let heartbeat_inner = self.clone();
        let heartbeat = runtime::spawn(async move {
            let mut ticker = runtime::Ticker::new(heartbeat_inner.options.ping_interval);
            loop {
                ticker.tick().await;
                if heartbeat_inner.closed.load(Ordering::Acquire) {
                    return;
                }
                heartbeat_inner.run_heartbeat().await;
            }
        });
        *self.heartbeat.lock().unwrap() = Some(heartbeat);

        let monitor_inner = self.clone();
        let monitor_task = runtime::spawn(async move {
            let mut ticker = runtime::Ticker::new(monitor_inner.options.monitor_interval);
            loop {
                ticker.tick().await;
                if monitor_inner.closed.load(Ordering::Acquire) {
                    return;
                }
                let mut stats = *monitor_inner.monitor_stats.lock().unwrap();
                monitor::sweep(
                    &monitor_inner.connections,
                    &monitor_inner.options,
                    &monitor_inner.events,
                    &mut stats,
                )
                .await;
                *monitor_inner.monitor_stats.lock().unwrap() = stats;
            }
        });
        *self.monitor.lock().unwrap() = Some(monitor_task);
    }

    async fn run_heartbeat(&self) {
        for handle in &self.connections {
            if handle.shared.is_busy() {
                continue;
            }
            // A failed ping does not itself quarantine the Connection -- it relies on the
            // transport's own error events -- but session-invalidated pings do flip readiness
            // (handled inside the Connection) so the monitor observes it on the next sweep.
            let _ = handle.ping(self.options.execute_timeout).await;
        }
    }

    fn pick_idle(&self) -> Option<ConnectionHandle> {
        let n = self.connections.len();
        if n == 0 {
            return None;
        }
        // Uniform random selection: pick a random start index, then scan the full ring from
        // there. Every ready/idle Connection is reachable in one call, avoiding starvation under
        // skewed load.
        let start = rand::rng().random_range(0..n);
        for offset in 0..n {
            let idx = (start + offset) % n;
            let handle = &self.connections[idx];
            if handle.shared.try_claim() {
                return Some(handle.clone());
            }
        }
        None
    }

    async fn execute(&self, statement: Vec<u8>) -> Result<ExecuteOutcome> {
        if statement.is_empty() {
            return Err(Error::invalid_argument("statement must not be empty"));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed());
        }

        let (task, rx) = Task::new(statement, self.options.execute_timeout);

        if let Some(handle) = self.pick_idle() {
            handle.dispatch(task);
        } else {
            let mut queue = self.queue.lock().unwrap();
            if self.closed.load(Ordering::Acquire) {
                drop(queue);
                return Err(Error::closed());
            }
            if queue.len() >= self.options.buffer_size {
                drop(queue);
                return Err(Error::enqueue_full());
            }
            queue.push_back(task);
        }

        rx.await.unwrap_or_else(|_| Err(Error::closed()))
    }

    async fn close(&self) {
        // Idempotent: a second call observes `closed` already set and returns once the first
        // call's teardown has finished.
        let _guard = self.close_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }

        let closes = self.connections.iter().map(|c| c.close());
        futures_util::future::join_all(closes).await;

        let mut queue = self.queue.lock().unwrap();
        for task in queue.drain(..) {
            task.fail(Error::closed());
        }
        drop(queue);

        self.events.close();
    }

    fn stats(&self) -> PoolStats {
        let idle_count = self
            .connections
            .iter()
            .filter(|c| c.shared.is_ready() && !c.shared.is_busy())
            .count();
        let reconnect_attempts = self
            .connections
            .iter()
            .map(|c| c.shared.reconnect_attempts.load(Ordering::Relaxed))
            .sum();
        let failed_cleanups = self
            .connections
            .iter()
            .map(|c| c.shared.failed_cleanups.load(Ordering::Relaxed))
            .sum();
        PoolStats {
            connection_count: self.connections.len(),
            idle_count,
            queued_count: self.queue.lock().unwrap().len(),
            monitor: *self.monitor_stats.lock().unwrap(),
            reconnect_attempts,
            failed_cleanups,
        }
    }
}

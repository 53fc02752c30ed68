//! Hand-rolled test doubles for [`Transport`](crate::transport::Transport) and
//! [`RpcStub`](crate::rpc::RpcStub), mirroring `mongodb`'s `cmap::test::event` test doubles rather
//! than a mocking framework. `#[cfg(test)]`-only; not part of the public API.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    connection::{self, ConnectionHandle},
    error::{Error, Result},
    event::PoolEventEmitter,
    options::{PoolOptions, ServerAddress},
    pool::{Pool, RpcFactory, TransportFactory},
    rpc::{AuthenticateResponse, ExecuteResponse, QueryMetrics, RpcStub, SessionId},
    transport::{Transport, TransportEvent},
};

/// Shared, inspectable state behind every [`MockRpcStub`] handed out by one [`MockBackend`]. All
/// Connections constructed from the same backend share one of these, so assertions can see totals
/// across the whole pool (e.g. "2 signout attempts across the 2 Connections").
#[derive(Default)]
pub(crate) struct MockState {
    next_session_id: i64,
    pub auth_delay: Duration,
    pub auth_error: Option<String>,
    pub signout_log: Vec<SessionId>,
    pub signout_should_fail: bool,
    pub execute_log: Vec<(SessionId, Vec<u8>)>,
    /// Scripted per-call responses for `execute`, consumed in order; once exhausted, falls back
    /// to `default_execute_code`.
    pub execute_script: std::collections::VecDeque<i32>,
    pub default_execute_code: i32,
    /// When set, every `execute` call blocks on this notification instead of returning, to
    /// simulate an RPC that never resolves (used to exercise queue overflow).
    pub block_execute: Option<Arc<tokio::sync::Notify>>,
    /// Extra artificial latency every `execute` call spends "in flight", widening the window in
    /// which a mutual-exclusion violation (two concurrent calls against the same session) would
    /// be observable.
    pub execute_delay: Duration,
    /// Sessions with a call currently in flight. `execute` panics if it would insert a session
    /// already present here, directly enforcing that at most one `execute` call is outstanding
    /// per session at any instant.
    pub active_sessions: std::collections::HashSet<SessionId>,
    /// When set, every `Transport::connect` blocks on this notification instead of returning, to
    /// simulate a server that never accepts a connection.
    pub block_connect: Option<Arc<tokio::sync::Notify>>,
}

/// Owns the [`MockState`] and produces `transport_factory`/`rpc_factory` closures suitable for
/// [`Pool::with_factories`].
pub(crate) struct MockBackend {
    pub state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub(crate) fn transport_factory(&self) -> TransportFactory {
        let state = self.state.clone();
        Arc::new(move |_addr: &ServerAddress| {
            Box::new(MockTransport::new(state.clone())) as Box<dyn Transport>
        })
    }

    pub(crate) fn rpc_factory(&self) -> RpcFactory {
        let state = self.state.clone();
        Arc::new(move |_opts: &PoolOptions| {
            Box::new(MockRpcStub {
                state: state.clone(),
            }) as Box<dyn RpcStub>
        })
    }

    pub(crate) fn build_pool(&self, options: PoolOptions) -> Result<Pool> {
        Pool::with_factories(options, None, self.transport_factory(), self.rpc_factory())
    }

    pub(crate) fn signout_count(&self) -> usize {
        self.state.lock().unwrap().signout_log.len()
    }
}

/// A transport that "connects" instantly and never emits spontaneous faults unless the test
/// explicitly sends one through [`MockTransport::fault_sender`]. Frame send/recv are never
/// exercised because [`MockRpcStub`] answers calls directly rather than encoding them.
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl MockTransport {
    pub(crate) fn new(state: Arc<Mutex<MockState>>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state,
            events_tx,
            events_rx,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        let block = self.state.lock().unwrap().block_connect.clone();
        if let Some(notify) = block {
            notify.notified().await;
        }
        let _ = self.events_tx.send(TransportEvent::Connect);
        Ok(())
    }

    async fn send_frame(&mut self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        // Never actually reached: `MockRpcStub` never calls `send_frame`/`recv_frame`.
        std::future::pending().await
    }

    fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TransportEvent> {
        &mut self.events_rx
    }

    fn end(&mut self) {
        let _ = self.events_tx.send(TransportEvent::Close);
    }
}

/// An [`RpcStub`] that answers every call from scripted [`MockState`] rather than encoding
/// anything onto the (ignored) transport. Mirrors the shape of the real `authenticate`/
/// `execute`/`signout` calls without a server on the other end.
pub(crate) struct MockRpcStub {
    pub state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl RpcStub for MockRpcStub {
    async fn authenticate(
        &self,
        _transport: &mut dyn Transport,
        _user: &str,
        _password: &str,
        _deadline: Instant,
    ) -> Result<AuthenticateResponse> {
        let delay = { self.state.lock().unwrap().auth_delay };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.auth_error.clone() {
            return Ok(AuthenticateResponse {
                error_code: -1,
                error_msg: message,
                session_id: None,
            });
        }
        state.next_session_id += 1;
        let session_id = state.next_session_id;
        Ok(AuthenticateResponse {
            error_code: 0,
            error_msg: String::new(),
            session_id: Some(session_id),
        })
    }

    async fn execute(
        &self,
        _transport: &mut dyn Transport,
        session_id: SessionId,
        statement: &[u8],
        _deadline: Instant,
    ) -> Result<ExecuteResponse> {
        // Removes `session_id` from `active_sessions` on every exit path, including the call
        // being cancelled mid-flight by the Connection's own `executeTimeout`, so a dropped (not
        // completed) call can never leave a false mutual-exclusion violation for the next caller.
        struct InFlightGuard(Arc<Mutex<MockState>>, SessionId);
        impl Drop for InFlightGuard {
            fn drop(&mut self) {
                self.0.lock().unwrap().active_sessions.remove(&self.1);
            }
        }

        let (delay, block) = {
            let mut state = self.state.lock().unwrap();
            assert!(
                state.active_sessions.insert(session_id),
                "mutual exclusion violated: two execute calls outstanding against session {session_id}"
            );
            state.execute_log.push((session_id, statement.to_vec()));
            (state.execute_delay, state.block_execute.clone())
        };
        let _guard = InFlightGuard(self.state.clone(), session_id);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(notify) = block {
            notify.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        let code = state
            .execute_script
            .pop_front()
            .unwrap_or(state.default_execute_code);
        Ok(ExecuteResponse {
            error_code: code,
            error_msg: if code == 0 {
                String::new()
            } else {
                format!("mock error {code}")
            },
            data: Vec::new(),
            metrics: Some(QueryMetrics {
                execute_millis: 1,
                traverse_millis: 0,
            }),
        })
    }

    async fn signout(
        &self,
        _transport: &mut dyn Transport,
        session_id: SessionId,
        _deadline: Instant,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.signout_log.push(session_id);
        if state.signout_should_fail {
            return Err(Error::transport("mock signout failure"));
        }
        Ok(())
    }
}

/// A short-fused [`PoolOptions`] so tests don't wait real-world seconds for the defaults.
pub(crate) fn fast_options(pool_size: u32, buffer_size: usize) -> PoolOptions {
    let mut options = PoolOptions::new(
        vec![ServerAddress::new("mock", 9669)],
        "root",
        "nebula",
    );
    options.space = "test".to_string();
    options.pool_size = pool_size;
    options.buffer_size = buffer_size;
    options.execute_timeout = Duration::from_millis(200);
    options.ping_interval = Duration::from_secs(3600);
    options.monitor_interval = Duration::from_secs(3600);
    options.idle_zombie_threshold = Duration::from_millis(60);
    options.medium_zombie_threshold = Duration::from_millis(90);
    options.deep_zombie_threshold = Duration::from_millis(120);
    options
}

/// Polls `condition` until it is true or `timeout` elapses, to avoid guessing fixed sleeps for
/// async state transitions driven by background tasks (prepare loops, monitor ticks).
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Spawns a single Connection against `backend` and waits for it to reach ready/idle, for tests
/// that want a live Connection task without going through a whole [`Pool`].
pub(crate) async fn spawn_ready_connection(
    backend: &MockBackend,
    options: Arc<PoolOptions>,
) -> ConnectionHandle {
    let queue = Arc::new(Mutex::new(std::collections::VecDeque::new()));
    let events = PoolEventEmitter::new(None);
    let address = options.servers[0].clone();
    let handle = connection::spawn_connection(
        0,
        address.clone(),
        options.clone(),
        Instant::now(),
        backend.transport_factory()(&address),
        backend.rpc_factory()(&options),
        queue,
        events,
    );
    assert!(
        wait_until(Duration::from_secs(1), || handle.shared.is_ready()).await,
        "connection never became ready"
    );
    handle
}

//! The per-session worker: owns one transport, one server-issued session, and serializes exactly
//! one task at a time on it. Mirrors the way `mongodb`'s `cmap::conn::Connection` owns a single
//! `AsyncStream` and is leased out one task at a time, except here the Connection runs as its own
//! `tokio::task` (an owned object whose methods run on its own scheduler) rather than being
//! checked in/out of the pool.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, ErrorKind, Result},
    event::{ErrorSource, PoolEventEmitter},
    options::{PoolOptions, ServerAddress},
    rpc::{RpcStub, SessionId, YIELD_ONE},
    runtime,
    task::{ExecuteOutcome, Task},
    transport::{Transport, TransportEvent},
};


/// The initial back-off before a failed `prepare()` (authentication, space selection) is
/// retried. Doubles on each consecutive failure up to
/// [`crate::transport::MAX_RECONNECT_DELAY`].
const INITIAL_PREPARE_BACKOFF: Duration = Duration::from_secs(1);

/// The tiers the session monitor can force onto a Connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ZombieTier {
    Light,
    Medium,
    Deep,
}

/// Flags and timestamps read by the Pool (for dispatch selection) and the Session Monitor (for
/// zombie classification) without going through the Connection's own task, so that neither ever
/// blocks in-flight RPC progress. Mutation of `session_id` is guarded by a small blocking mutex
/// because it is touched far less often than `is_ready`/`is_busy`; everything else is a plain
/// atomic.
pub(crate) struct ConnectionShared {
    pub id: u32,
    pub address: ServerAddress,
    epoch: Instant,
    is_ready: AtomicBool,
    is_busy: AtomicBool,
    marked_zombie: AtomicBool,
    last_activity_ms: AtomicU64,
    session_id: StdMutex<Option<SessionId>>,
    pub reconnect_attempts: AtomicU64,
    pub failed_cleanups: AtomicU64,
}

impl ConnectionShared {
    fn new(id: u32, address: ServerAddress, epoch: Instant) -> Arc<Self> {
        Arc::new(Self {
            id,
            address,
            epoch,
            is_ready: AtomicBool::new(false),
            is_busy: AtomicBool::new(true), // "initializing" counts as busy
            marked_zombie: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
            session_id: StdMutex::new(None),
            reconnect_attempts: AtomicU64::new(0),
            failed_cleanups: AtomicU64::new(0),
        })
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.is_busy.load(Ordering::Acquire)
    }

    pub(crate) fn session_id(&self) -> Option<SessionId> {
        *self.session_id.lock().unwrap()
    }

    pub(crate) fn is_marked_zombie(&self) -> bool {
        self.marked_zombie.load(Ordering::Acquire)
    }

    fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Release);
    }

    fn set_session_id(&self, id: Option<SessionId>) {
        *self.session_id.lock().unwrap() = id;
    }

    fn touch(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(millis, Ordering::Release);
    }

    /// How long it has been since the last successful interaction (auth, execute, ping).
    pub(crate) fn idle_for(&self) -> Duration {
        let millis = self.last_activity_ms.load(Ordering::Acquire);
        self.epoch
            .elapsed()
            .saturating_sub(Duration::from_millis(millis))
    }

    /// Attempts to atomically claim this Connection for dispatch: succeeds only if it is ready
    /// and not already busy. This is the sole mutual-exclusion point: the Pool never hands the
    /// same Connection to two concurrent callers, and at most one task runs on it at a time.
    pub(crate) fn try_claim(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.is_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Commands accepted by a Connection's task loop.
pub(crate) enum ConnectionCommand {
    Run(Task),
    Ping(Duration, oneshot::Sender<bool>),
    ForceCleanup(oneshot::Sender<()>),
    Quarantine(ZombieTier, oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// A cheaply-cloneable reference to a running Connection, held by the Pool and the Session
/// Monitor. The actual transport and RPC stub are owned exclusively by the Connection's task and
/// are never reached through this handle.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub shared: Arc<ConnectionShared>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub(crate) fn id(&self) -> u32 {
        self.shared.id
    }

    /// Dispatches a task that the caller has already claimed this Connection for (via
    /// [`ConnectionShared::try_claim`]).
    pub(crate) fn dispatch(&self, task: Task) {
        if self.commands.send(ConnectionCommand::Run(task)).is_err() {
            // The connection's task loop has exited (pool shutting down); there is nothing left
            // to dispatch to, so fail the task rather than losing it silently.
        }
    }

    pub(crate) async fn ping(&self, budget: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(ConnectionCommand::Ping(budget, tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub(crate) async fn force_cleanup(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(ConnectionCommand::ForceCleanup(tx))
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    pub(crate) async fn quarantine(&self, tier: ZombieTier) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(ConnectionCommand::Quarantine(tier, tx))
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(ConnectionCommand::Close(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// Shared queue of tasks awaiting a free Connection. Connections self-serve from this queue the
/// instant they become idle, so the Pool never needs a back-reference into its Connections to
/// redispatch.
pub(crate) type TaskQueue = Arc<StdMutex<std::collections::VecDeque<Task>>>;

pub(crate) fn spawn_connection(
    id: u32,
    address: ServerAddress,
    options: Arc<PoolOptions>,
    epoch: Instant,
    transport: Box<dyn Transport>,
    rpc: Box<dyn RpcStub>,
    queue: TaskQueue,
    events: PoolEventEmitter,
) -> ConnectionHandle {
    let shared = ConnectionShared::new(id, address, epoch);
    let (tx, rx) = mpsc::unbounded_channel();

    let worker = ConnectionWorker {
        shared: shared.clone(),
        options,
        transport,
        rpc,
        queue,
        events,
        commands: rx,
        prepare_backoff: INITIAL_PREPARE_BACKOFF,
    };

    runtime::spawn(worker.run());

    ConnectionHandle {
        shared,
        commands: tx,
    }
}

struct ConnectionWorker {
    shared: Arc<ConnectionShared>,
    options: Arc<PoolOptions>,
    transport: Box<dyn Transport>,
    rpc: Box<dyn RpcStub>,
    queue: TaskQueue,
    events: PoolEventEmitter,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    prepare_backoff: Duration,
}

enum PrepareOutcome {
    Ready,
    Shutdown,
}

impl ConnectionWorker {
    fn id(&self) -> u32 {
        self.shared.id
    }

    async fn run(mut self) {
        loop {
            match self.prepare_loop().await {
                PrepareOutcome::Shutdown => return,
                PrepareOutcome::Ready => {}
            }

            self.shared.set_busy(false);
            if self.drain_queue().await {
                continue;
            }

            match self.idle_loop().await {
                IdleOutcome::Reprepare => continue,
                IdleOutcome::Shutdown => return,
            }
        }
    }

    /// `initializing -> authenticating -> selecting-space -> idle`, retrying with back-off on
    /// any failure. Also the reconnect path entered from quarantine.
    async fn prepare_loop(&mut self) -> PrepareOutcome {
        loop {
            // A stale sessionId from a prior generation must be cleaned up before a new one is
            // adopted -- "signout before adopt" for the prior generation's session.
            if self.shared.session_id().is_some() {
                self.force_cleanup_inner().await;
            }

            if self.connect_or_shutdown().await.is_err() {
                // Either the transport gave up (told to end) or a `Close` command arrived while
                // still connecting.
                return PrepareOutcome::Shutdown;
            }
            self.events.connected(self.id(), self.shared.address.clone());

            match self.authenticate().await {
                Ok(session_id) => {
                    self.shared.set_session_id(Some(session_id));
                    self.events.authorized(self.id(), self.shared.address.clone());
                }
                Err(err) => {
                    self.events
                        .error(ErrorSource::Authentication, Some(self.id()), err);
                    if self.back_off_or_shutdown().await {
                        return PrepareOutcome::Shutdown;
                    }
                    continue;
                }
            }

            match self.select_space().await {
                Ok(()) => {
                    self.shared.touch();
                    self.shared.set_ready(true);
                    self.shared.marked_zombie.store(false, Ordering::Release);
                    self.prepare_backoff = INITIAL_PREPARE_BACKOFF;
                    self.events.ready(self.id(), self.shared.address.clone());
                    return PrepareOutcome::Ready;
                }
                Err(err) => {
                    self.events.error(ErrorSource::Prepare, Some(self.id()), err);
                    // The session we just authenticated is now orphaned; clean it up before
                    // retrying rather than letting it accumulate across reconnect storms.
                    self.force_cleanup_inner().await;
                    if self.back_off_or_shutdown().await {
                        return PrepareOutcome::Shutdown;
                    }
                    continue;
                }
            }
        }
    }

    /// Drives the transport's own (internally-retrying) `connect()` to completion while staying
    /// responsive to a `Close` command -- an unreachable server can otherwise keep `connect()`
    /// retrying forever with nothing else ever polling `self.commands`. Dropping the in-flight
    /// connect future on early return is enough to stop it; nothing further needs tearing down.
    async fn connect_or_shutdown(&mut self) -> Result<()> {
        let connect_fut = self.transport.connect();
        tokio::pin!(connect_fut);
        loop {
            tokio::select! {
                res = &mut connect_fut => return res,
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Close(reply)) => {
                            let _ = reply.send(());
                            return Err(Error::closed());
                        }
                        // Nothing else is actionable while still connecting; answer the same way
                        // `back_off_or_shutdown` does.
                        Some(ConnectionCommand::Ping(_, reply)) => { let _ = reply.send(false); }
                        Some(ConnectionCommand::ForceCleanup(reply)) => { let _ = reply.send(()); }
                        Some(ConnectionCommand::Quarantine(_, reply)) => { let _ = reply.send(()); }
                        Some(ConnectionCommand::Run(task)) => task.fail(Error::not_ready()),
                        None => return Err(Error::closed()),
                    }
                }
            }
        }
    }

    /// Sleeps for the current back-off, doubling it (capped) for next time. Returns `true` if a
    /// `Close` command arrived while waiting, meaning the caller should give up on preparing.
    async fn back_off_or_shutdown(&mut self) -> bool {
        self.shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        self.events.reconnecting(
            self.id(),
            self.prepare_backoff,
            self.shared.reconnect_attempts.load(Ordering::Relaxed) as u32,
        );
        let sleep = runtime::sleep(self.prepare_backoff);
        tokio::pin!(sleep);
        let shutdown = loop {
            tokio::select! {
                _ = &mut sleep => break false,
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Close(reply)) => {
                            let _ = reply.send(());
                            break true;
                        }
                        // Nothing else is actionable while not ready; a Ping/ForceCleanup/Run
                        // arriving here just gets the "not ready" answer immediately.
                        Some(ConnectionCommand::Ping(_, reply)) => { let _ = reply.send(false); }
                        Some(ConnectionCommand::ForceCleanup(reply)) => { let _ = reply.send(()); }
                        Some(ConnectionCommand::Quarantine(_, reply)) => { let _ = reply.send(()); }
                        Some(ConnectionCommand::Run(task)) => task.fail(Error::not_ready()),
                        None => break true,
                    }
                }
            }
        };
        self.prepare_backoff = std::cmp::min(
            self.prepare_backoff * 2,
            crate::transport::MAX_RECONNECT_DELAY,
        );
        shutdown
    }

    async fn authenticate(&mut self) -> Result<SessionId> {
        let deadline = Instant::now() + self.options.execute_timeout;
        let resp = self
            .rpc
            .authenticate(
                self.transport.as_mut(),
                &self.options.user_name,
                &self.options.password,
                deadline,
            )
            .await?;
        if resp.error_code != 0 {
            return Err(Error::authentication_rejected(resp.error_msg));
        }
        resp.session_id
            .ok_or_else(|| Error::authentication_rejected("server accepted credentials but returned no session id"))
    }

    async fn select_space(&mut self) -> Result<()> {
        if self.options.space.is_empty() {
            return Ok(());
        }
        let session_id = self
            .shared
            .session_id()
            .ok_or_else(|| Error::new(ErrorKind::Internal {
                message: "select_space called without a session id".into(),
            }))?;
        let statement = format!("USE {}", self.options.space).into_bytes();
        let deadline = Instant::now() + self.options.execute_timeout;
        let resp = self
            .rpc
            .execute(self.transport.as_mut(), session_id, &statement, deadline)
            .await?;
        if resp.error_code != 0 {
            return Err(Error::server(resp.error_code, resp.error_msg));
        }
        Ok(())
    }

    /// Drains queued tasks onto this Connection for as long as it remains ready and idle and the
    /// queue is non-empty. Called whenever the Connection transitions to idle: right after
    /// `prepare()` succeeds and after each `run()` completes. Returns `true` if a drained task's
    /// outcome left the Connection not-ready (session-invalidated), so the caller can re-enter the
    /// prepare loop immediately instead of sitting idle with no session.
    async fn drain_queue(&mut self) -> bool {
        loop {
            if !self.shared.is_ready() {
                return true;
            }
            let task = {
                let mut q = self.queue.lock().unwrap();
                if q.is_empty() {
                    return false;
                }
                // We are not currently marked busy (the caller guarantees this), so claiming is
                // just flipping the flag; no contention is possible from the Pool's fast path
                // since that path only ever transitions false -> true via try_claim, same as us.
                if self
                    .shared
                    .is_busy
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return false;
                }
                q.pop_front().expect("checked non-empty above")
            };
            self.run_task(task).await;
            if !self.shared.is_ready() {
                return true;
            }
        }
    }

    async fn idle_loop(&mut self) -> IdleOutcome {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        None => return IdleOutcome::Shutdown,
                        Some(ConnectionCommand::Close(reply)) => {
                            self.handle_close().await;
                            let _ = reply.send(());
                            return IdleOutcome::Shutdown;
                        }
                        Some(ConnectionCommand::Run(task)) => {
                            // Already marked busy by whoever claimed us (Pool fast path).
                            self.run_task(task).await;
                            if !self.shared.is_ready() {
                                // A session-invalidated response during `run_task` already
                                // quarantined and cleaned up this Connection; re-enter the
                                // prepare loop immediately rather than waiting for the monitor's
                                // next sweep to notice.
                                return IdleOutcome::Reprepare;
                            }
                            if self.drain_queue().await {
                                return IdleOutcome::Reprepare;
                            }
                        }
                        Some(ConnectionCommand::Ping(budget, reply)) => {
                            let ok = self.handle_ping(budget).await;
                            let _ = reply.send(ok);
                            if !ok && !self.shared.is_ready() {
                                return IdleOutcome::Reprepare;
                            }
                        }
                        Some(ConnectionCommand::ForceCleanup(reply)) => {
                            self.force_cleanup_inner().await;
                            let _ = reply.send(());
                            return IdleOutcome::Reprepare;
                        }
                        Some(ConnectionCommand::Quarantine(tier, reply)) => {
                            self.apply_tier(tier).await;
                            let _ = reply.send(());
                            return IdleOutcome::Reprepare;
                        }
                    }
                }

                event = self.transport.events().recv() => {
                    match event {
                        Some(TransportEvent::Error(message)) => {
                            self.events.error(ErrorSource::Transport, Some(self.id()), Error::transport(message));
                            self.quarantine_for_transport_fault().await;
                            return IdleOutcome::Reprepare;
                        }
                        Some(TransportEvent::Close) => {
                            self.quarantine_for_transport_fault().await;
                            return IdleOutcome::Reprepare;
                        }
                        Some(TransportEvent::Reconnecting { delay, attempt }) => {
                            self.events.reconnecting(self.id(), delay, attempt);
                        }
                        Some(TransportEvent::Connect) | None => {}
                    }
                }
            }
        }
    }

    /// Transport error event while idle/busy: `isReady` becomes false and `isBusy` becomes true
    /// (quarantined) until prepare completes.
    async fn quarantine_for_transport_fault(&mut self) {
        self.shared.set_ready(false);
        self.shared.is_busy.store(true, Ordering::Release);
        if self.shared.session_id().is_some() {
            self.force_cleanup_inner().await;
        }
    }

    async fn apply_tier(&mut self, tier: ZombieTier) {
        self.shared.set_ready(false);
        self.force_cleanup_inner().await;
        match tier {
            ZombieTier::Light => {}
            ZombieTier::Medium => {
                self.transport.end();
            }
            ZombieTier::Deep => {
                self.transport.end();
                self.prepare_backoff = INITIAL_PREPARE_BACKOFF;
                self.shared.reconnect_attempts.store(0, Ordering::Relaxed);
                self.shared.failed_cleanups.store(0, Ordering::Relaxed);
            }
        }
        self.shared.is_busy.store(true, Ordering::Release);
    }

    /// Runs one task to completion. `isBusy` is assumed already `true` on entry (set by whoever
    /// claimed the Connection); this function's deferred cleanup always clears it before
    /// returning regardless of outcome. On a session-invalidated outcome, `isBusy` is deliberately
    /// held `true` (and `isReady` flipped false) across the cleanup RPC, the same quarantine
    /// discipline as a transport error event, so the Pool can never claim this Connection while
    /// its session is being signed out from under it.
    async fn run_task(&mut self, task: Task) {
        let outcome = self.run_task_inner(&task).await;
        match outcome {
            Ok(result) => {
                self.shared.is_busy.store(false, Ordering::Release);
                self.events.free(self.id());
                let _ = task.reply.send(Ok(result));
            }
            Err(RunError::Failed(err)) => {
                self.shared.is_busy.store(false, Ordering::Release);
                self.events.free(self.id());
                task.fail(err);
            }
            Err(RunError::SessionInvalidated(err)) => {
                // Quarantined, same as a transport error event: `isReady=false` and
                // `isBusy=true` until `prepare_loop` completes. `run()`'s `set_busy(false)`
                // call after `prepare_loop` returns `Ready` is what actually clears it, so the
                // monitor's `is_busy` guard (monitor.rs) keeps skipping this Connection for the
                // whole reconnect window instead of racing a `Quarantine` command against the
                // freshly-authenticated session.
                self.shared.set_ready(false);
                self.shared.is_busy.store(true, Ordering::Release);
                task.fail(err);
                self.force_cleanup_inner().await;
            }
        }
    }

    async fn run_task_inner(&mut self, task: &Task) -> std::result::Result<ExecuteOutcome, RunError> {
        let session_id = match self.shared.session_id() {
            Some(id) if self.shared.is_ready() => id,
            _ => return Err(RunError::Failed(Error::not_ready())),
        };

        let deadline = task.deadline;
        let call = self.rpc.execute(
            self.transport.as_mut(),
            session_id,
            &task.statement,
            deadline,
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        let resp = match runtime::timeout(remaining, call).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => return Err(RunError::Failed(err)),
            Err(_elapsed) => return Err(RunError::Failed(Error::timeout())),
        };

        self.shared.touch();

        if self
            .options
            .session_invalidated_codes
            .contains(&resp.error_code)
        {
            return Err(RunError::SessionInvalidated(Error::server(
                resp.error_code,
                resp.error_msg,
            )));
        }

        if !resp.is_success() {
            // Query-level error that does not invalidate the session: surfaced verbatim, the
            // Connection stays idle.
            return Err(RunError::Failed(Error::server(resp.error_code, resp.error_msg)));
        }

        let execute_millis = resp.metrics.map(|m| m.execute_millis);
        let traverse_millis = resp.metrics.map(|m| m.traverse_millis);
        Ok(ExecuteOutcome {
            response: resp,
            execute_millis,
            traverse_millis,
            connection_id: self.id(),
        })
    }

    async fn handle_ping(&mut self, budget: Duration) -> bool {
        let Some(session_id) = self.shared.session_id() else {
            return false;
        };
        if !self.shared.is_ready() {
            return false;
        }
        let deadline = Instant::now() + budget;
        match runtime::timeout(
            budget,
            self.rpc
                .execute(self.transport.as_mut(), session_id, YIELD_ONE, deadline),
        )
        .await
        {
            Ok(Ok(resp)) if self.options.session_invalidated_codes.contains(&resp.error_code) => {
                self.shared.set_ready(false);
                self.force_cleanup_inner().await;
                false
            }
            Ok(Ok(resp)) if resp.is_success() => {
                self.shared.touch();
                true
            }
            Ok(Ok(_)) => true, // a query-level error on `YIELD 1` still proves the session answers
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// `forceCleanup()`: best-effort signout, swallow any failure, null out the local session id.
    /// Never throws.
    async fn force_cleanup_inner(&mut self) {
        let Some(session_id) = self.shared.session_id() else {
            return;
        };
        let deadline = Instant::now() + self.options.execute_timeout;
        let result = self
            .rpc
            .signout(self.transport.as_mut(), session_id, deadline)
            .await;
        self.shared.set_session_id(None);
        match result {
            Ok(()) => {}
            Err(err) => {
                self.shared.failed_cleanups.fetch_add(1, Ordering::Relaxed);
                self.events
                    .error(ErrorSource::Monitor, Some(self.id()), err);
            }
        }
    }

    /// `close()`: must attempt signout whenever a sessionId is present, without predicating on
    /// `isReady`. Waits for an in-flight task up to `executeTimeout` before tearing the
    /// Connection down regardless.
    async fn handle_close(&mut self) {
        if self.shared.is_busy() {
            let waited = runtime::timeout(self.options.execute_timeout, async {
                while self.shared.is_busy() {
                    runtime::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            let _ = waited;
        }
        self.shared.set_ready(false);
        self.force_cleanup_inner().await;
        self.transport.end();
    }
}

enum RunError {
    Failed(Error),
    SessionInvalidated(Error),
}

enum IdleOutcome {
    Reprepare,
    Shutdown,
}

impl ConnectionShared {
    fn set_busy(&self, busy: bool) {
        self.is_busy.store(busy, Ordering::Release);
    }
}

#[cfg(test)]
impl ConnectionShared {
    /// Flips `isReady` to false without going through any RPC or transport event, so tests can
    /// manufacture the "Connection lost readiness while still holding a session" condition the
    /// session monitor is meant to detect, without racing the live prepare loop to do it.
    pub(crate) fn force_not_ready_for_test(&self) {
        self.set_ready(false);
    }
}

//! Observability events emitted by the pool. Mirrors the way `mongodb`'s `event::cmap` module
//! exposes a typed handler trait with one method per lifecycle event, so a caller can subscribe
//! to exactly the events it cares about without parsing log lines.

use std::sync::Arc;

use crate::{error::Error, options::ServerAddress};

/// Emitted when a Connection's transport signals `connect`.
#[derive(Clone, Debug)]
pub struct ConnectedEvent {
    pub connection_id: u32,
    pub address: ServerAddress,
}

/// Emitted when a Connection successfully authenticates and selects its space.
#[derive(Clone, Debug)]
pub struct AuthorizedEvent {
    pub connection_id: u32,
    pub address: ServerAddress,
}

/// Emitted when a Connection becomes idle and able to accept work for the first time (or again,
/// after reconnecting).
#[derive(Clone, Debug)]
pub struct ReadyEvent {
    pub connection_id: u32,
    pub address: ServerAddress,
}

/// Emitted when a Connection finishes a task and returns to idle, becoming free for dispatch.
#[derive(Clone, Debug)]
pub struct FreeEvent {
    pub connection_id: u32,
}

/// Emitted once the pool has fully closed.
#[derive(Clone, Debug)]
pub struct CloseEvent;

/// Emitted when a Connection's transport begins a reconnect attempt.
#[derive(Clone, Debug)]
pub struct ReconnectingEvent {
    pub connection_id: u32,
    pub delay: std::time::Duration,
    pub attempt: u32,
}

/// The source component an [`ErrorEvent`] originated from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorSource {
    Transport,
    Authentication,
    Prepare,
    Monitor,
}

/// Emitted when a fault occurs that is not surfaced directly to a caller: transport faults,
/// authentication faults, and prepare-loop errors are all observability-only, since nothing in
/// the pool's public API is waiting on a Connection's own reconnect attempts.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub source: ErrorSource,
    pub connection_id: Option<u32>,
    pub error: Error,
}

/// Emitted by the session monitor each time it flags a Connection as holding a zombie session.
#[derive(Clone, Debug)]
pub struct ZombieDetectedEvent {
    pub connection_id: u32,
    pub idle_for: std::time::Duration,
}

/// Emitted by the session monitor after it attempts cleanup of a zombie Connection.
#[derive(Clone, Debug)]
pub struct ZombieCleanedEvent {
    pub connection_id: u32,
    pub succeeded: bool,
}

/// Handler for pool observability events. All methods have empty default implementations so
/// implementors only need to override the events they care about, the same contract as
/// `mongodb`'s `CmapEventHandler`.
pub trait PoolEventHandler: Send + Sync {
    /// A Connection's transport finished connecting.
    fn handle_connected(&self, _event: ConnectedEvent) {}
    /// A Connection finished authenticating and selecting its space.
    fn handle_authorized(&self, _event: AuthorizedEvent) {}
    /// A Connection became idle and dispatchable for the first time, or again after reconnecting.
    fn handle_ready(&self, _event: ReadyEvent) {}
    /// A Connection finished a task and returned to idle.
    fn handle_free(&self, _event: FreeEvent) {}
    /// The pool finished closing.
    fn handle_close(&self, _event: CloseEvent) {}
    /// A Connection's transport began a reconnect attempt.
    fn handle_reconnecting(&self, _event: ReconnectingEvent) {}
    /// A fault occurred that is not surfaced directly to a caller.
    fn handle_error(&self, _event: ErrorEvent) {}
    /// The session monitor flagged a Connection as holding a zombie session.
    fn handle_zombie_detected(&self, _event: ZombieDetectedEvent) {}
    /// The session monitor finished attempting cleanup of a zombie Connection.
    fn handle_zombie_cleaned(&self, _event: ZombieCleanedEvent) {}
}

/// Thin emitter that forwards events to an optional user-supplied handler and, when the
/// `tracing-unstable` feature is enabled, to `tracing` as well. Internal to the crate; the public
/// surface is [`PoolEventHandler`].
#[derive(Clone)]
pub(crate) struct PoolEventEmitter {
    handler: Option<Arc<dyn PoolEventHandler>>,
}

impl PoolEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn PoolEventHandler>>) -> Self {
        Self { handler }
    }

    pub(crate) fn connected(&self, connection_id: u32, address: ServerAddress) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(connection_id, %address, "connection transport connected");
        if let Some(h) = &self.handler {
            h.handle_connected(ConnectedEvent {
                connection_id,
                address,
            });
        }
    }

    pub(crate) fn authorized(&self, connection_id: u32, address: ServerAddress) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(connection_id, %address, "connection authorized");
        if let Some(h) = &self.handler {
            h.handle_authorized(AuthorizedEvent {
                connection_id,
                address,
            });
        }
    }

    pub(crate) fn ready(&self, connection_id: u32, address: ServerAddress) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(connection_id, %address, "connection ready");
        if let Some(h) = &self.handler {
            h.handle_ready(ReadyEvent {
                connection_id,
                address,
            });
        }
    }

    pub(crate) fn free(&self, connection_id: u32) {
        if let Some(h) = &self.handler {
            h.handle_free(FreeEvent { connection_id });
        }
    }

    pub(crate) fn close(&self) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!("pool closed");
        if let Some(h) = &self.handler {
            h.handle_close(CloseEvent);
        }
    }

    pub(crate) fn reconnecting(&self, connection_id: u32, delay: std::time::Duration, attempt: u32) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(connection_id, attempt, ?delay, "connection reconnecting");
        if let Some(h) = &self.handler {
            h.handle_reconnecting(ReconnectingEvent {
                connection_id,
                delay,
                attempt,
            });
        }
    }

    pub(crate) fn error(&self, source: ErrorSource, connection_id: Option<u32>, error: Error) {
        #[cfg(feature = "tracing-unstable")]
        tracing::warn!(?source, connection_id, %error, "pool error event");
        if let Some(h) = &self.handler {
            h.handle_error(ErrorEvent {
                source,
                connection_id,
                error,
            });
        }
    }

    pub(crate) fn zombie_detected(&self, connection_id: u32, idle_for: std::time::Duration) {
        if let Some(h) = &self.handler {
            h.handle_zombie_detected(ZombieDetectedEvent {
                connection_id,
                idle_for,
            });
        }
    }

    pub(crate) fn zombie_cleaned(&self, connection_id: u32, succeeded: bool) {
        if let Some(h) = &self.handler {
            h.handle_zombie_cleaned(ZombieCleanedEvent {
                connection_id,
                succeeded,
            });
        }
    }
}

//! Configuration accepted at [`Pool`](crate::Pool) construction.

use std::{
    collections::HashSet,
    fmt,
    time::Duration,
};

use crate::error::{Error, Result};

/// The default sentinel the server uses to signal that a session must be recreated. NebulaGraph
/// hardcodes `-1005` for this; this crate exposes the full set of codes that trigger
/// session-invalidated recovery as configuration instead, defaulting to just this one.
pub const DEFAULT_SESSION_INVALIDATED_CODE: i32 = -1005;

/// A `(host, port)` endpoint for one backend server.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ServerAddress {
    /// The server's hostname or IP address.
    pub host: String,

    /// The server's port.
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl ServerAddress {
    /// Constructs an endpoint from a `(host, port)` pair.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Configuration for a [`Pool`](crate::Pool), set once at construction and read-only thereafter.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Ordered sequence of `(host, port)` endpoints. Must be non-empty.
    pub servers: Vec<ServerAddress>,

    /// Credential applied to every session.
    pub user_name: String,

    /// Credential applied to every session.
    pub password: String,

    /// Logical namespace selected on each new session via `USE <space>`. May be empty, in which
    /// case no space-selection statement is sent during `prepare`.
    pub space: String,

    /// Number of Connections per server. Total Connections is `pool_size * servers.len()`.
    pub pool_size: u32,

    /// Maximum number of queued tasks awaiting a free Connection before `execute` fails fast
    /// with [`ErrorKind::EnqueueFull`](crate::error::ErrorKind::EnqueueFull).
    pub buffer_size: usize,

    /// Per-task budget from dispatch to result.
    pub execute_timeout: Duration,

    /// Heartbeat period.
    pub ping_interval: Duration,

    /// Period between session-monitor sweeps.
    pub monitor_interval: Duration,

    /// Lower bound of the "light" zombie cleanup tier.
    pub idle_zombie_threshold: Duration,

    /// Lower bound of the "medium" zombie cleanup tier.
    pub medium_zombie_threshold: Duration,

    /// Lower bound of the "deep" zombie cleanup tier.
    pub deep_zombie_threshold: Duration,

    /// The set of server `error_code` values that indicate a session has been invalidated and
    /// must be recreated. Defaults to `{-1005}`.
    pub session_invalidated_codes: HashSet<i32>,
}

impl PoolOptions {
    /// Constructs a builder-free options struct with reasonable defaults for the monitor
    /// constants, leaving the non-optional fields for the caller to fill in.
    pub fn new(
        servers: Vec<ServerAddress>,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            servers,
            user_name: user_name.into(),
            password: password.into(),
            space: String::new(),
            pool_size: 1,
            buffer_size: 64,
            execute_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(3),
            monitor_interval: Duration::from_secs(30),
            idle_zombie_threshold: Duration::from_secs(60),
            medium_zombie_threshold: Duration::from_secs(90),
            deep_zombie_threshold: Duration::from_secs(120),
            session_invalidated_codes: HashSet::from([DEFAULT_SESSION_INVALIDATED_CODE]),
        }
    }

    /// Validates the non-optional fields, rejecting the options at construction rather than
    /// failing lazily on first use.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::invalid_argument(
                "at least one server endpoint is required",
            ));
        }
        if self.user_name.is_empty() {
            return Err(Error::invalid_argument("user_name must not be empty"));
        }
        if self.pool_size == 0 {
            return Err(Error::invalid_argument("pool_size must be at least 1"));
        }
        if self.idle_zombie_threshold >= self.medium_zombie_threshold
            || self.medium_zombie_threshold >= self.deep_zombie_threshold
        {
            return Err(Error::invalid_argument(
                "zombie thresholds must be strictly increasing: idle < medium < deep",
            ));
        }
        Ok(())
    }
}

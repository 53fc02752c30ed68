//! A thin wrapper around the async primitives the rest of the crate needs, so that `tokio` is
//! named in exactly one place. Unlike `mongodb`'s `runtime` module, this crate doesn't need to
//! abstract over multiple async runtimes; the wrapper exists purely to keep the naming and
//! spawn/timeout idiom consistent across the crate.

use std::{future::Future, time::Duration};

pub(crate) use tokio::task::JoinHandle;

/// Spawns a future onto the runtime, returning a handle that can be awaited or dropped.
pub(crate) fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::task::spawn(fut)
}

/// Runs `fut`, returning `Err` if it does not complete within `duration`.
pub(crate) async fn timeout<F, T>(duration: Duration, fut: F) -> Result<T, tokio::time::error::Elapsed>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut).await
}

/// Sleeps for `duration`. Cancel-safe: dropping the returned future cancels the sleep.
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// A periodic ticker. Each `tick()` call resolves once per period; the first tick resolves
/// immediately, matching `tokio::time::interval`'s default behavior.
pub(crate) struct Ticker {
    interval: tokio::time::Interval,
}

impl Ticker {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            interval: tokio::time::interval(period),
        }
    }

    pub(crate) async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

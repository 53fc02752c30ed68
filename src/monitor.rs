//! The session monitor: periodically walks every Connection, classifies zombie
//! sessions, and runs tiered cleanup. Mirrors the shape of `mongodb`'s `cmap::background` sweep,
//! except the thing being swept here is session staleness rather than idle-connection eviction.

use std::time::Duration;

use crate::{
    connection::{ConnectionHandle, ZombieTier},
    event::PoolEventEmitter,
    options::PoolOptions,
};


/// Cumulative counters the monitor maintains across its lifetime, exposed via
/// [`Pool::stats`](crate::Pool::stats).
#[derive(Clone, Copy, Debug, Default)]
pub struct MonitorStats {
    /// Total Connections ever classified as holding a zombie session.
    pub zombies_detected: u64,
    /// Total cleanups that completed without the RPC signout call erroring.
    pub zombies_cleaned: u64,
    /// Total cleanups where the signout call itself failed (still counted as cleaned, since
    /// `forceCleanup` swallows the failure and nulls the local session id regardless).
    pub cleanup_failures: u64,
}

/// One sweep over every Connection in the pool. Returns updated stats deltas folded into the
/// running total by the caller.
pub(crate) async fn sweep(
    connections: &[ConnectionHandle],
    options: &PoolOptions,
    events: &PoolEventEmitter,
    stats: &mut MonitorStats,
) {
    for handle in connections {
        // "A Connection in busy is skipped this tick" -- the monitor never interleaves cleanup
        // with an in-flight run for the same Connection.
        if handle.shared.is_busy() {
            continue;
        }

        let Some(classification) = classify(handle, options) else {
            continue;
        };

        stats.zombies_detected += 1;
        events.zombie_detected(handle.id(), classification.idle_for);

        handle.quarantine(classification.tier).await;

        let cleaned = handle.shared.session_id().is_none();
        if cleaned {
            stats.zombies_cleaned += 1;
        } else {
            stats.cleanup_failures += 1;
        }
        events.zombie_cleaned(handle.id(), cleaned);
    }
}

struct Classification {
    tier: ZombieTier,
    idle_for: Duration,
}

/// Classifies a single Connection as a zombie candidate:
///
/// - `sessionId != null && !isReady` is the primary signal.
/// - `sessionId != null && isReady && (now - lastActivityTime > idleZombieThreshold)` catches the
///   server-side expiration window.
///
/// This function is a pure read of the Connection's shared state, so two consecutive calls with
/// no intervening state change always produce the same classification.
fn classify(handle: &ConnectionHandle, options: &PoolOptions) -> Option<Classification> {
    let shared = &handle.shared;
    let session_present = shared.session_id().is_some();
    if !session_present {
        return None;
    }

    let is_ready = shared.is_ready();
    let idle_for = shared.idle_for();

    let is_candidate = !is_ready || idle_for > options.idle_zombie_threshold;
    if !is_candidate {
        return None;
    }

    let tier = if idle_for >= options.deep_zombie_threshold {
        ZombieTier::Deep
    } else if idle_for >= options.medium_zombie_threshold {
        ZombieTier::Medium
    } else {
        ZombieTier::Light
    };

    Some(Classification { tier, idle_for })
}

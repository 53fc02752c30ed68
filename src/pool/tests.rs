use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use crate::{
    error::ErrorKind,
    test_support::{fast_options, wait_until, MockBackend},
};

use super::ExecuteOptions;

/// Happy path: construct a pool, run a statement, and close it. Every Connection that ever got a
/// session signs out exactly once.
#[tokio::test]
async fn happy_path_execute_then_close_signs_out_every_connection() {
    let backend = MockBackend::new();
    let options = fast_options(2, 4);
    let pool = backend.build_pool(options).unwrap();

    assert!(
        wait_until(Duration::from_secs(1), || pool.stats().idle_count == 2).await,
        "both connections should become ready"
    );

    let outcome = pool
        .execute(b"YIELD 1".to_vec(), ExecuteOptions::default())
        .await
        .expect("execute should succeed");
    assert_eq!(outcome.response.error_code, 0);
    assert!((0..2).contains(&outcome.connection_id));

    pool.close().await;
    assert_eq!(backend.signout_count(), 2);

    // Idempotent: a second close must not hang or double-signout.
    pool.close().await;
    assert_eq!(backend.signout_count(), 2);
}

/// Close during not-ready: closing while authenticate is still in flight must still sign out
/// whatever session each Connection manages to acquire before tearing down. This is the core
/// server-session-leak fix over a design that gated signout on readiness.
#[tokio::test]
async fn close_while_authenticating_still_signs_out_acquired_sessions() {
    let backend = MockBackend::new();
    backend.state.lock().unwrap().auth_delay = Duration::from_millis(30);
    let options = fast_options(2, 4);
    let pool = backend.build_pool(options).unwrap();

    // Close immediately: every Connection is still racing through `authenticate`.
    pool.close().await;

    let state = backend.state.lock().unwrap();
    assert_eq!(
        state.signout_log.len() as i64,
        state.next_session_id,
        "every session id that was ever handed out must have had signout attempted"
    );
}

/// Queue overflow: with `bufferSize=4` and `poolSize=2`, issuing 7 concurrent calls against a
/// pool whose Connections never free up yields exactly 2 dispatched + 4 queued + 1 rejection.
#[tokio::test]
async fn queue_overflow_rejects_exactly_the_excess() {
    let backend = MockBackend::new();
    backend.state.lock().unwrap().block_execute = Some(Arc::new(tokio::sync::Notify::new()));
    let options = fast_options(2, 4);
    let pool = Arc::new(backend.build_pool(options).unwrap());

    assert!(wait_until(Duration::from_secs(1), || pool.stats().idle_count == 2).await);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.execute(b"YIELD 1".to_vec(), ExecuteOptions::default())
                .await
        }));
    }

    // Give the first 6 a moment to land as 2 dispatched + 4 queued.
    assert!(wait_until(Duration::from_secs(1), || pool.stats().queued_count == 4).await);

    let seventh = pool
        .execute(b"YIELD 1".to_vec(), ExecuteOptions::default())
        .await;
    let err = seventh.expect_err("the 7th call must be rejected");
    assert!(matches!(&*err.kind, ErrorKind::EnqueueFull));

    for h in handles {
        h.abort();
    }
}

/// Bounded queue: `bufferSize + k` concurrent calls against a fully busy pool reject exactly `k`
/// with `ENQUEUE_FULL`; the other `bufferSize` are dispatched or queued.
#[tokio::test]
async fn bounded_queue_rejects_exactly_k_over_capacity() {
    let backend = MockBackend::new();
    backend.state.lock().unwrap().block_execute = Some(Arc::new(tokio::sync::Notify::new()));
    let pool_size = 1;
    let buffer_size = 2;
    let options = fast_options(pool_size, buffer_size);
    let pool = Arc::new(backend.build_pool(options).unwrap());

    assert!(wait_until(Duration::from_secs(1), || pool.stats().idle_count == 1).await);

    let capacity = pool_size as usize + buffer_size;
    let k = 3;
    let mut handles = Vec::new();
    for _ in 0..capacity {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.execute(b"YIELD 1".to_vec(), ExecuteOptions::default())
                .await
        }));
    }
    assert!(wait_until(Duration::from_secs(1), || pool.stats().queued_count == buffer_size).await);

    let mut rejected = 0;
    for _ in 0..k {
        let result = pool
            .execute(b"YIELD 1".to_vec(), ExecuteOptions::default())
            .await;
        if matches!(&result, Err(e) if matches!(&*e.kind, ErrorKind::EnqueueFull)) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, k);

    for h in handles {
        h.abort();
    }
}

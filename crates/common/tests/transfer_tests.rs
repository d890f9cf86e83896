//! Transfer handshake integration tests
//!
//! The completer/in-flight pair is what keeps a session's pending map
//! honest: exactly one of "completed" and "cancelled" may win for each
//! transfer, no matter how the device layer and the session race. These
//! tests drive the pair from concurrent tasks and threads the way the
//! backends and the session do.
//!
//! Run with: `cargo test -p common --test transfer_tests`

use bytes::Bytes;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::usb_types::{TransferError, TransferOutcome, transfer_pair};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[tokio::test]
async fn test_completion_from_another_thread() {
    let (completer, inflight) = transfer_pair();

    // The hardware backend completes from a blocking worker thread
    let worker = thread::spawn(move || {
        completer.complete(Ok(TransferOutcome::received(Bytes::from_static(&[
            0xde, 0xad,
        ]))))
    });

    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, inflight.complete())
        .await
        .expect("completion must arrive")
        .expect("transfer succeeded");
    assert_eq!(outcome.actual_length, 2);
    assert_eq!(outcome.data.as_ref(), &[0xde, 0xad]);
    assert!(worker.join().unwrap());
}

#[tokio::test]
async fn test_cancel_unblocks_waiting_task() {
    let (completer, inflight) = transfer_pair();
    let handle = inflight.cancel_handle();

    let waiter = tokio::spawn(inflight.complete());

    // Let the waiter park on the transfer before cancelling it
    tokio::task::yield_now().await;
    assert!(handle.cancel());

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, waiter)
        .await
        .expect("cancel must wake the waiter")
        .unwrap();
    assert_eq!(result, Err(TransferError::Cancelled));

    // The backend still holds its half; its late result is discarded
    assert!(completer.is_cancelled());
    assert!(!completer.complete(Ok(TransferOutcome::written(8))));
}

#[tokio::test]
async fn test_exactly_one_canceller_wins() {
    let (_completer, inflight) = transfer_pair();
    let handle = inflight.cancel_handle();

    let wins = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let handle = handle.clone();
        let wins = wins.clone();
        tasks.push(tokio::spawn(async move {
            if handle.cancel() {
                wins.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_complete_race_has_one_winner() {
    // Race the two sides head-on from separate threads, repeatedly;
    // whatever the interleaving, their claimed outcomes must disagree
    for _ in 0..64 {
        let (completer, inflight) = transfer_pair();
        let handle = inflight.cancel_handle();

        let completing = thread::spawn(move || completer.complete(Ok(TransferOutcome::written(1))));
        let cancelling = thread::spawn(move || handle.cancel());

        let completed = completing.join().unwrap();
        let cancelled = cancelling.join().unwrap();
        assert_ne!(completed, cancelled, "both sides claimed the transfer");

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, inflight.complete())
            .await
            .expect("the winning side must resolve the transfer");
        match result {
            Ok(_) => assert!(completed),
            Err(TransferError::Cancelled) => assert!(cancelled),
            Err(other) => panic!("unexpected outcome: {}", other),
        }
    }
}

#[tokio::test]
async fn test_is_cancelled_visible_to_backend() {
    let (completer, inflight) = transfer_pair();
    assert!(!completer.is_cancelled());

    inflight.cancel_handle().cancel();
    assert!(completer.is_cancelled());
}

#[tokio::test]
async fn test_cancel_before_wait_still_resolves() {
    // The session may cancel during teardown before anything awaits the
    // transfer; a later await must not hang on a missed wakeup
    let (_completer, inflight) = transfer_pair();
    assert!(inflight.cancel_handle().cancel());

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, inflight.complete())
        .await
        .expect("permit stored by cancel must be consumed");
    assert_eq!(result, Err(TransferError::Cancelled));
}

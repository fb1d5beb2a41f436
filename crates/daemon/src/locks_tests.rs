// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use photon_core::FakeClock;
use std::time::Duration;

fn manager() -> (LockManager<FakeClock>, FakeClock) {
    let clock = FakeClock::new();
    clock.set_epoch_ms(1_000_000);
    (LockManager::new(clock.clone()), clock)
}

fn session(s: &str) -> SessionId {
    SessionId::new(s)
}

fn assert_acquired(outcome: AcquireOutcome) -> u64 {
    match outcome {
        AcquireOutcome::Acquired { expires_at, .. } => expires_at,
        AcquireOutcome::Busy { holder } => panic!("busy, held by {}", holder),
        AcquireOutcome::Queued(_) => panic!("unexpectedly queued"),
    }
}

#[test]
fn acquire_absent_lock_succeeds() {
    let (locks, _clock) = manager();
    let expires = assert_acquired(locks.acquire("r", &session("a"), 5000, false));
    assert_eq!(expires, 1_005_000);

    let listed = locks.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "r");
    assert_eq!(listed[0].holder, "a");
}

#[test]
fn acquire_held_lock_reports_holder() {
    let (locks, _clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    match locks.acquire("r", &session("b"), 5000, false) {
        AcquireOutcome::Busy { holder } => assert_eq!(holder, "a"),
        _ => panic!("expected busy"),
    }
}

#[test]
fn same_holder_reacquire_renews_expiry() {
    let (locks, clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    clock.advance(Duration::from_millis(3000));
    match locks.acquire("r", &session("a"), 5000, false) {
        AcquireOutcome::Acquired { expires_at, renewed } => {
            assert!(renewed);
            assert_eq!(expires_at, 1_008_000);
        }
        _ => panic!("expected renewal"),
    }
}

#[test]
fn expired_lock_is_treated_as_absent() {
    let (locks, clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    clock.advance(Duration::from_millis(5001));
    assert!(locks.list().is_empty());

    match locks.acquire("r", &session("b"), 5000, false) {
        AcquireOutcome::Acquired { renewed, .. } => assert!(!renewed),
        _ => panic!("expected acquire after expiry"),
    }
}

#[test]
fn release_by_holder_succeeds_once() {
    let (locks, _clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    assert_eq!(locks.release("r", &session("a")), ReleaseOutcome::Released);
    // Second release: nobody holds it, so the requester is not the holder.
    assert_eq!(locks.release("r", &session("a")), ReleaseOutcome::NotHolder);
}

#[test]
fn release_by_non_holder_is_rejected() {
    let (locks, _clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    assert_eq!(locks.release("r", &session("b")), ReleaseOutcome::NotHolder);
    // Still held by a
    assert_eq!(locks.list()[0].holder, "a");
}

#[tokio::test]
async fn waiters_are_granted_in_fifo_order() {
    let (locks, _clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    let rx_b = match locks.acquire("r", &session("b"), 5000, true) {
        AcquireOutcome::Queued(rx) => rx,
        _ => panic!("expected queue"),
    };
    let rx_c = match locks.acquire("r", &session("c"), 5000, true) {
        AcquireOutcome::Queued(rx) => rx,
        _ => panic!("expected queue"),
    };

    locks.release("r", &session("a"));
    let granted = rx_b.await.expect("b should be granted");
    assert!(granted.expires_at > 0);
    assert_eq!(locks.list()[0].holder, "b");

    locks.release("r", &session("b"));
    rx_c.await.expect("c should be granted");
    assert_eq!(locks.list()[0].holder, "c");
}

#[tokio::test]
async fn abandoned_waiter_is_skipped() {
    let (locks, _clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    let rx_b = match locks.acquire("r", &session("b"), 5000, true) {
        AcquireOutcome::Queued(rx) => rx,
        _ => panic!("expected queue"),
    };
    let rx_c = match locks.acquire("r", &session("c"), 5000, true) {
        AcquireOutcome::Queued(rx) => rx,
        _ => panic!("expected queue"),
    };

    drop(rx_b); // b's deadline elapsed client-side
    locks.release("r", &session("a"));

    rx_c.await.expect("c should be granted despite b ahead");
    assert_eq!(locks.list()[0].holder, "c");
}

#[tokio::test]
async fn sweep_wakes_waiter_after_expiry() {
    let (locks, clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 1000, false));

    let rx_b = match locks.acquire("r", &session("b"), 5000, true) {
        AcquireOutcome::Queued(rx) => rx,
        _ => panic!("expected queue"),
    };

    clock.advance(Duration::from_millis(1500));
    locks.sweep();

    rx_b.await.expect("b should be granted after expiry sweep");
    assert_eq!(locks.list()[0].holder, "b");
}

#[test]
fn release_all_frees_every_lease_of_a_session() {
    let (locks, _clock) = manager();
    assert_acquired(locks.acquire("r1", &session("a"), 5000, false));
    assert_acquired(locks.acquire("r2", &session("a"), 5000, false));
    assert_acquired(locks.acquire("r3", &session("b"), 5000, false));

    assert_eq!(locks.release_all(&session("a")), 2);

    let listed = locks.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "r3");
}

#[test]
fn holder_never_changes_without_release_or_expiry() {
    let (locks, _clock) = manager();
    assert_acquired(locks.acquire("r", &session("a"), 5000, false));

    // Failed acquires and failed releases leave the record untouched.
    let _ = locks.acquire("r", &session("b"), 5000, false);
    let _ = locks.release("r", &session("b"));

    let listed = locks.list();
    assert_eq!(listed[0].holder, "a");
    assert_eq!(listed[0].acquired_at, 1_000_000);
}

#[test]
fn timeout_validation_bounds() {
    assert!(!valid_timeout_ms(0));
    assert!(valid_timeout_ms(1));
    assert!(valid_timeout_ms(30_000));
    assert!(valid_timeout_ms(86_400_000));
    assert!(!valid_timeout_ms(86_400_001));
}

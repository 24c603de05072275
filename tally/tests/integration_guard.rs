//! Integration tests for the fast-fail guard.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tally::clock::ManualClock;
use tally::error::StoreError;
use tally::{BreakerConfig, FastFailGuard, TallyError};

fn setup(config: BreakerConfig) -> (Arc<FastFailGuard>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap(),
    ));
    let guard = Arc::new(FastFailGuard::new(config, clock.clone()).unwrap());
    (guard, clock)
}

#[test]
fn test_cooldown_expires_without_success() {
    let (guard, clock) = setup(BreakerConfig::default());

    let delay = guard.mark_failure();
    assert!(!guard.proceed());

    clock.advance(delay);
    assert!(guard.proceed());
}

#[test]
fn test_delays_double_up_to_cap() {
    let (guard, _clock) = setup(BreakerConfig {
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
    });

    let delays: Vec<u64> = (0..8)
        .map(|_| u64::try_from(guard.mark_failure().as_millis()).unwrap())
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000, 1_000, 1_000]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    guard.mark_success();
    assert_eq!(guard.mark_failure(), Duration::from_millis(100));
}

#[test]
fn test_multiplier_never_wraps() {
    let (guard, _clock) = setup(BreakerConfig::default());
    for _ in 0..200 {
        guard.mark_failure();
    }
    assert_eq!(guard.multiplier(), u64::MAX);
    assert_eq!(guard.mark_failure(), Duration::from_millis(30_000));
}

#[test]
fn test_probe_after_cooldown() {
    let (guard, clock) = setup(BreakerConfig::default());

    guard
        .call(|| Err::<(), _>(StoreError::unavailable("connection refused")))
        .unwrap_err();

    let err = guard.call(|| Ok::<_, StoreError>(())).unwrap_err();
    let TallyError::BackendUnavailable { retry_after } = err else {
        panic!("expected a short circuit, got {err:?}");
    };
    assert_eq!(retry_after, Duration::from_millis(1_000));

    // A failed probe reopens with a longer cool-down.
    clock.advance(retry_after);
    guard
        .call(|| Err::<(), _>(StoreError::unavailable("connection refused")))
        .unwrap_err();
    assert_eq!(guard.retry_after(), Duration::from_millis(2_000));

    // A successful probe closes the guard.
    clock.advance(Duration::from_millis(2_000));
    guard.call(|| Ok::<_, StoreError>(())).unwrap();
    assert!(!guard.is_in_failure_mode());
    assert_eq!(guard.multiplier(), 1);
}

#[test]
fn test_concurrent_failures_are_all_counted() {
    let (guard, _clock) = setup(BreakerConfig {
        initial_delay_ms: 1,
        max_delay_ms: u64::MAX,
    });

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                guard.mark_failure();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(guard.multiplier(), 1 << 8);
    assert!(guard.is_in_failure_mode());
}

#[test]
fn test_concurrent_success_and_failure_leave_consistent_state() {
    let (guard, _clock) = setup(BreakerConfig::default());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                if i % 2 == 0 {
                    guard.mark_failure();
                } else {
                    guard.mark_success();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Whatever the interleaving, the multiplier is a power of two and agrees
    // with the failure flag.
    let multiplier = guard.multiplier();
    assert!(multiplier.is_power_of_two());
    assert_eq!(guard.is_in_failure_mode(), multiplier > 1);
}

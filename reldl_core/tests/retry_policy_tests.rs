use std::time::Duration;

use reldl_core::downloader::retry_policy::{RetryDecision, RetryPolicy};
use reldl_core::types::error::{ErrorKind, TransportError};

fn policy(max_attempts: u32, jitter: f64) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(100),
        Duration::from_millis(1000),
        jitter,
    )
}

#[test]
fn test_backoff_doubles_until_cap() {
    let p = policy(10, 0.0);
    assert_eq!(p.backoff(1), Duration::from_millis(100));
    assert_eq!(p.backoff(2), Duration::from_millis(200));
    assert_eq!(p.backoff(3), Duration::from_millis(400));
    assert_eq!(p.backoff(4), Duration::from_millis(800));
    assert_eq!(p.backoff(5), Duration::from_millis(1000));
    assert_eq!(p.backoff(60), Duration::from_millis(1000));
}

#[test]
fn test_transient_is_retried_without_jitter_exactly() {
    let p = policy(3, 0.0);
    assert_eq!(
        p.should_retry(1, ErrorKind::Transient),
        RetryDecision::Retry(Duration::from_millis(100))
    );
    assert_eq!(
        p.should_retry(2, ErrorKind::Transient),
        RetryDecision::Retry(Duration::from_millis(200))
    );
}

#[test]
fn test_gives_up_once_attempts_are_spent() {
    let p = policy(3, 0.0);
    assert_eq!(p.should_retry(3, ErrorKind::Transient), RetryDecision::GiveUp);
    assert_eq!(p.should_retry(4, ErrorKind::Transient), RetryDecision::GiveUp);
}

#[test]
fn test_permanent_is_never_retried() {
    let p = policy(5, 0.0);
    assert_eq!(p.should_retry(1, ErrorKind::Permanent), RetryDecision::GiveUp);
}

#[test]
fn test_single_attempt_policy_never_retries() {
    let p = policy(1, 0.0);
    assert_eq!(p.should_retry(1, ErrorKind::Transient), RetryDecision::GiveUp);
}

#[test]
fn test_jitter_stays_within_bounds() {
    let p = policy(10, 0.5);
    for _ in 0..200 {
        match p.should_retry(3, ErrorKind::Transient) {
            RetryDecision::Retry(delay) => {
                assert!(delay <= Duration::from_millis(400), "{:?}", delay);
                assert!(delay >= Duration::from_millis(200), "{:?}", delay);
            }
            RetryDecision::GiveUp => panic!("expected a retry"),
        }
    }
}

#[test]
fn test_status_classification() {
    for status in [408u16, 425, 429, 500, 502, 503, 504] {
        assert_eq!(TransportError::from_status(status, "GET").kind(), ErrorKind::Transient);
    }
    for status in [400u16, 401, 403, 404, 410] {
        assert_eq!(TransportError::from_status(status, "GET").kind(), ErrorKind::Permanent);
    }
    assert_eq!(
        TransportError::RangeNotSatisfiable { start: 0, end: 1 }.kind(),
        ErrorKind::Permanent
    );
}

//! Backoff scheduling and message cache tests
//!
//! Tests focus on the observable contracts: delay bounds, reset behavior,
//! identifier allocation and expiry sweeps.

use bytes::Bytes;
use device_link::transport::mqtt::{BackoffError, BackoffScheduler, CachedMessage, MessageCache};
use proptest::prelude::*;
use rumqttc::mqttbytes::QoS;
use std::time::{Duration, Instant};

fn subscription(topic: &str) -> CachedMessage {
    CachedMessage::Subscription {
        topic: topic.to_string(),
        max_qos: QoS::AtLeastOnce,
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[test]
fn test_backoff_delays_double_until_cutoff() {
    // Arrange: 1s multiplier, 8s cutoff
    let mut backoff = BackoffScheduler::new(1_000, 8_000).unwrap();
    let expected_centers = [1_000u64, 2_000, 4_000, 8_000, 8_000, 8_000];

    // Act / Assert: every delay is within one multiplier of its center
    for center in expected_centers {
        let delay = backoff.next_delay().as_millis() as u64;
        assert!(
            (center - 1_000..=center + 1_000).contains(&delay),
            "delay {delay}ms outside {center}ms +/- 1000ms"
        );
    }
}

#[test]
fn test_backoff_reset_restarts_sequence() {
    let mut backoff = BackoffScheduler::new(500, 60_000).unwrap();
    for _ in 0..10 {
        backoff.next_delay();
    }

    backoff.reset();

    assert!(backoff.next_delay() <= Duration::from_millis(1_000));
}

#[test]
fn test_backoff_rejects_invalid_coefficients() {
    assert!(matches!(
        BackoffScheduler::new(0, 1_000),
        Err(BackoffError::ZeroMultiplier)
    ));
    assert!(matches!(
        BackoffScheduler::new(1_000, 0),
        Err(BackoffError::ZeroCutoff)
    ));
    assert!(matches!(
        BackoffScheduler::new(2_000, 1_000),
        Err(BackoffError::CutoffBelowMultiplier { .. })
    ));
}

#[test]
fn test_backoff_accepts_equal_coefficients() {
    let mut backoff = BackoffScheduler::new(1_000, 1_000).unwrap();
    assert_eq!(backoff.multiplier(), Duration::from_secs(1));
    assert_eq!(backoff.cutoff(), Duration::from_secs(1));
    for _ in 0..5 {
        assert!(backoff.next_delay() <= Duration::from_millis(2_000));
    }
}

proptest! {
    #[test]
    fn prop_backoff_never_exceeds_cutoff_plus_jitter(
        multiplier in 1u64..10_000,
        factor in 1u64..100,
        attempts in 1usize..40,
    ) {
        let cutoff = multiplier * factor;
        let mut backoff = BackoffScheduler::new(multiplier, cutoff).unwrap();
        for _ in 0..attempts {
            let delay = backoff.next_delay().as_millis() as u64;
            prop_assert!(delay <= cutoff + multiplier);
        }
    }
}

// ---------------------------------------------------------------------------
// Message cache
// ---------------------------------------------------------------------------

#[test]
fn test_cache_sweep_reports_only_expired_entries() {
    // Arrange
    let ttl = Duration::from_secs(10);
    let start = Instant::now();
    let mut cache = MessageCache::new(ttl);
    cache.insert(1, subscription("/old"), start).unwrap();
    cache
        .insert(
            2,
            CachedMessage::Publish {
                topic: "/new".to_string(),
                payload: Bytes::from_static(b"x"),
                qos: QoS::ExactlyOnce,
            },
            start + Duration::from_secs(5),
        )
        .unwrap();

    // Act
    let mut reported = Vec::new();
    cache.sweep_expired(start + Duration::from_secs(11), |id, _| reported.push(id));

    // Assert
    assert_eq!(reported, vec![1]);

    // The reported entry got a fresh ttl, the other one is due now
    reported.clear();
    cache.sweep_expired(start + Duration::from_secs(16), |id, _| reported.push(id));
    assert_eq!(reported, vec![2]);
}

#[test]
fn test_cache_refresh_expiry_postpones_retransmission() {
    let ttl = Duration::from_secs(10);
    let start = Instant::now();
    let mut cache = MessageCache::new(ttl);
    cache.insert(4, subscription("/a"), start).unwrap();
    assert_eq!(cache.ttl(), ttl);

    cache.refresh_expiry(4, start + Duration::from_secs(8));

    let mut reported = Vec::new();
    cache.sweep_expired(start + Duration::from_secs(12), |id, _| reported.push(id));
    assert!(reported.is_empty());
}

#[test]
fn test_cache_rejects_duplicate_ids() {
    let mut cache = MessageCache::new(Duration::from_secs(1));
    let now = Instant::now();
    cache.insert(9, subscription("/a"), now).unwrap();

    assert!(cache.insert(9, subscription("/b"), now).is_err());
    assert_eq!(cache.get(9), Some(&subscription("/a")));
}

#[test]
fn test_cache_ids_wrap_and_skip_zero() {
    let mut cache = MessageCache::new(Duration::from_secs(1));
    let now = Instant::now();

    let mut last = 0;
    for _ in 0..u16::MAX {
        last = cache.next_free_id().unwrap();
    }
    assert_eq!(last, u16::MAX);

    // Counter wraps to 1, skipping ids still in use
    cache.insert(1, subscription("/busy"), now).unwrap();
    assert_eq!(cache.next_free_id().unwrap(), 2);
}

#[test]
fn test_cache_remove_returns_message() {
    let mut cache = MessageCache::new(Duration::from_secs(1));
    cache
        .insert(3, subscription("/x"), Instant::now())
        .unwrap();

    assert_eq!(cache.remove(3), Some(subscription("/x")));
    assert_eq!(cache.remove(3), None);
    assert!(cache.is_empty());
}

//! Redis Integration Tests
//!
//! Tests the Redis fast tier against a live server, focusing on:
//! - `SET NX EX` claim semantics
//! - Expiry handled by Redis
//! - Concurrent claims from many threads
//! - Failure surfacing as `CacheUnavailable`
//!
//! Set the environment variable `EVENTDEDUP_TEST_REDIS_URL` to enable these tests:
//!
//! ```bash
//! export EVENTDEDUP_TEST_REDIS_URL="redis://localhost:6379"
//! cargo test --features redis redis_integration
//! ```

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::doc_markdown)]
#![cfg(feature = "redis")]

use eventdedup::storage::{MemoryLedger, RedisFastTier};
use eventdedup::{
    Canonicalizer, DeduplicationConfig, DeduplicationService, Error, Event, FastTier, Fingerprint,
};
use std::env;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const REDIS_URL_ENV: &str = "EVENTDEDUP_TEST_REDIS_URL";

fn get_redis_url() -> Option<String> {
    env::var(REDIS_URL_ENV).ok()
}

/// Macro to skip tests when Redis is not available.
macro_rules! require_redis {
    () => {
        match get_redis_url() {
            Some(url) => url,
            None => {
                eprintln!(
                    "Skipping test: {} not set. Set this environment variable to run Redis tests.",
                    REDIS_URL_ENV
                );
                return;
            },
        }
    };
}

/// An event nobody has claimed before, so reruns against one server stay independent.
fn unique_event(label: &str) -> Event {
    let nonce = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    Event::new(label, "2024-01-01T10:00:00Z")
        .with_client_id(format!("{}-{nonce}", std::process::id()))
}

fn fingerprint(event: &Event) -> Fingerprint {
    Canonicalizer::default().fingerprint(event).unwrap()
}

#[test]
fn test_redis_ping() {
    let url = require_redis!();
    let tier = RedisFastTier::new(&url, Duration::from_secs(2)).unwrap();
    tier.ping().unwrap();
    assert_eq!(tier.backend_name(), "redis");
}

#[test]
fn test_redis_claim_is_insert_if_absent() {
    let url = require_redis!();
    let tier = RedisFastTier::new(&url, Duration::from_secs(2)).unwrap();
    let fp = fingerprint(&unique_event("claim"));

    assert!(!tier.exists(&fp).unwrap());
    assert!(tier.claim(&fp, Duration::from_secs(60)).unwrap());
    assert!(tier.exists(&fp).unwrap());
    assert!(!tier.claim(&fp, Duration::from_secs(60)).unwrap());
}

#[test]
fn test_redis_records_expire() {
    let url = require_redis!();
    let tier = RedisFastTier::new(&url, Duration::from_secs(2)).unwrap();
    let fp = fingerprint(&unique_event("expiry"));

    assert!(tier.claim(&fp, Duration::from_secs(1)).unwrap());
    thread::sleep(Duration::from_millis(2100));
    assert!(!tier.exists(&fp).unwrap());
    assert!(tier.claim(&fp, Duration::from_secs(60)).unwrap());
}

#[test]
fn test_redis_seed_counts_new_records() {
    let url = require_redis!();
    let tier = RedisFastTier::new(&url, Duration::from_secs(2)).unwrap();
    let first = fingerprint(&unique_event("seed-a"));
    let second = fingerprint(&unique_event("seed-b"));

    assert!(tier.claim(&first, Duration::from_secs(60)).unwrap());
    let created = tier
        .seed(&[first.clone(), second.clone()], Duration::from_secs(60))
        .unwrap();
    assert_eq!(created, 1);
    assert!(tier.exists(&second).unwrap());
}

#[test]
fn test_redis_concurrent_claims_accept_once() {
    const CALLERS: usize = 8;

    let url = require_redis!();
    let tier = Arc::new(RedisFastTier::new(&url, Duration::from_secs(2)).unwrap());
    let service = Arc::new(DeduplicationService::new(
        tier,
        Arc::new(MemoryLedger::new()),
        DeduplicationConfig::default().with_ttl(Duration::from_secs(60)),
    ));
    let event = unique_event("race");
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let service = service.clone();
            let barrier = barrier.clone();
            let event = event.clone();
            thread::spawn(move || {
                barrier.wait();
                service.is_duplicate_and_claim(&event).unwrap()
            })
        })
        .collect();

    let accepted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|outcome| !outcome.is_duplicate())
        .count();
    assert_eq!(accepted, 1);
}

#[test]
fn test_unreachable_redis_is_unavailable() {
    // Port 1 is never a Redis server; the failure must not become a verdict.
    let tier = RedisFastTier::new("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();
    let fp = fingerprint(&Event::new("x", "2024-01-01T00:00:00Z"));

    let err = tier.claim(&fp, Duration::from_secs(60)).unwrap_err();
    assert!(matches!(err, Error::CacheUnavailable { .. }));
    assert!(err.is_retryable());
}

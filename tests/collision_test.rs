//! Idempotency Collision Tests
//!
//! Runs the collision scenario end to end over HTTP against mock APIs.

mod common;

use std::collections::HashMap;
use wiremock::MockServer;

use payments_loadtest_rs::metrics::Counter;
use payments_loadtest_rs::scenarios::collision::{self, CollisionPlan};
use payments_loadtest_rs::shutdown::RunHalt;

use common::{gateway_for, mount_create, settings_for, DedupApi, DuplicatingApi};

const WORKERS: usize = 4;
const ITERATIONS: u64 = 5;
const PAIRS: u64 = WORKERS as u64 * ITERATIONS;

fn plan(server: &MockServer) -> CollisionPlan {
    let mut settings = settings_for(server);
    settings.collision.workers = WORKERS;
    settings.collision.iterations = ITERATIONS;
    CollisionPlan::from_settings(&settings.collision).expect("plan")
}

#[tokio::test]
async fn test_deduplicating_api_passes() {
    let server = MockServer::start().await;
    mount_create(&server, DedupApi::default()).await;

    let outcome = collision::run(plan(&server), gateway_for(&server), RunHalt::new())
        .await
        .unwrap();

    assert_eq!(outcome.snapshot.counter(Counter::IdempotencySamePaymentId), PAIRS);
    assert_eq!(outcome.snapshot.counter(Counter::IdempotencyMismatchPaymentId), 0);
    assert_eq!(outcome.snapshot.counter(Counter::HttpReqFailed), 0);
    assert_eq!(outcome.summary.iterations_completed, PAIRS);
    assert!(outcome.passed());

    println!("✅ Deduplicating API: {} pairs resolved to one payment each", PAIRS);
}

#[tokio::test]
async fn test_duplicating_api_is_caught() {
    let server = MockServer::start().await;
    mount_create(&server, DuplicatingApi::default()).await;

    let outcome = collision::run(plan(&server), gateway_for(&server), RunHalt::new())
        .await
        .unwrap();

    assert_eq!(outcome.snapshot.counter(Counter::IdempotencyMismatchPaymentId), PAIRS);
    assert_eq!(outcome.snapshot.counter(Counter::IdempotencySamePaymentId), 0);
    assert!(!outcome.passed());
    assert!(outcome
        .failed_thresholds()
        .any(|t| t.metric == "idempotency_mismatch_payment_id_total"));

    println!("✅ Duplicating API: all {} pairs flagged as mismatches", PAIRS);
}

#[tokio::test]
async fn test_pairs_are_byte_identical_on_the_wire() {
    let server = MockServer::start().await;
    mount_create(&server, DedupApi::default()).await;

    collision::run(plan(&server), gateway_for(&server), RunHalt::new())
        .await
        .unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len() as u64, PAIRS * 2);

    let mut by_key: HashMap<String, Vec<_>> = HashMap::new();
    for request in &received {
        let key = request
            .headers
            .get("Idempotency-Key")
            .and_then(|v| v.to_str().ok())
            .expect("every call carries a key")
            .to_string();
        by_key.entry(key).or_default().push(request);
    }

    assert_eq!(by_key.len() as u64, PAIRS, "one key per pair");
    for (key, calls) in by_key {
        assert_eq!(calls.len(), 2, "key {} should be sent exactly twice", key);
        assert_eq!(calls[0].body, calls[1].body);
        for name in ["X-Merchant-Id", "X-Customer-Id", "X-Account-Id", "Content-Type"] {
            assert_eq!(calls[0].headers.get(name), calls[1].headers.get(name), "{}", name);
        }
        let body: serde_json::Value = serde_json::from_slice(&calls[0].body).unwrap();
        assert_eq!(body["method"], "PIX");
        assert_eq!(body["currency"], "BRL");
        assert_eq!(body["amount"].as_f64(), Some(99.5));
    }

    println!("✅ Both calls of every pair carried identical bytes and headers");
}

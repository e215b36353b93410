//! Shared mock payments APIs for integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use payments_loadtest_rs::config::Settings;
use payments_loadtest_rs::issuer::{HttpGateway, PaymentsGateway};

pub const BLOCKED_DESTINATION: &str = "dest-blocked-001";

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

fn accepted(payment_id: &str, status: &str) -> ResponseTemplate {
    ResponseTemplate::new(202).set_body_json(json!({
        "payment_id": payment_id,
        "status": status,
    }))
}

/// Honors `Idempotency-Key`: a repeated key returns the original payment.
#[derive(Default)]
pub struct DedupApi {
    next_id: AtomicU64,
    by_key: Mutex<HashMap<String, String>>,
}

impl Respond for DedupApi {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(key) = header(request, "Idempotency-Key") else {
            return ResponseTemplate::new(400);
        };
        let id = self
            .by_key
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| format!("pay-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
            .clone();
        accepted(&id, "RECEIVED")
    }
}

/// Ignores the key and mints a new payment for every call.
#[derive(Default)]
pub struct DuplicatingApi {
    next_id: AtomicU64,
}

impl Respond for DuplicatingApi {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        accepted(
            &format!("pay-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            "RECEIVED",
        )
    }
}

/// Blocks the known-bad destination, accepts everything else. Never 429s.
#[derive(Default)]
pub struct PolicyApi {
    next_id: AtomicU64,
}

impl Respond for PolicyApi {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let status = if body["destination"] == BLOCKED_DESTINATION {
            "BLOCKED"
        } else {
            "RECEIVED"
        };
        accepted(
            &format!("pay-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            status,
        )
    }
}

pub async fn mount_create(server: &MockServer, responder: impl Respond + 'static) {
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(responder)
        .mount(server)
        .await;
}

pub async fn mount_status(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/payments/[^/]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "RECEIVED"})))
        .mount(server)
        .await;
}

pub async fn mount_slow_create(server: &MockServer, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(
            ResponseTemplate::new(202)
                .set_body_json(json!({"payment_id": "pay-slow", "status": "RECEIVED"}))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

pub fn gateway_for(server: &MockServer) -> Arc<dyn PaymentsGateway> {
    let url = Url::parse(&server.uri()).expect("mock server uri");
    Arc::new(HttpGateway::new(&url, Duration::from_secs(5)).expect("gateway"))
}

pub fn settings_for(server: &MockServer) -> Settings {
    let mut settings = Settings::defaults().expect("defaults");
    settings.base_url = server.uri();
    settings
}

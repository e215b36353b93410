use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use crate::classifier::is_failed_request;
use crate::error::{HarnessError, ParseError, TransportError};
use crate::metrics::{Counter, IterationRecord, Trend};
use crate::model::{ParsedBody, PreparedPayment};

pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";
pub const HEADER_MERCHANT_ID: &str = "X-Merchant-Id";
pub const HEADER_CUSTOMER_ID: &str = "X-Customer-Id";
pub const HEADER_ACCOUNT_ID: &str = "X-Account-Id";

/// Status and raw bytes of an answered call.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The payments API as seen by the harness.
#[async_trait]
pub trait PaymentsGateway: Send + Sync {
    async fn create_payment(&self, payment: &PreparedPayment) -> Result<RawResponse, TransportError>;
    async fn get_payment(&self, payment_id: &str) -> Result<RawResponse, TransportError>;
}

pub struct HttpGateway {
    payments_url: Url,
    client: Client,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, HarnessError> {
        let payments_url = Url::parse(&format!(
            "{}/payments",
            base_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| HarnessError::invalid("base_url", e.to_string()))?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            payments_url,
            client,
            timeout,
        })
    }

    pub fn payments_url(&self) -> &Url {
        &self.payments_url
    }

    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }

    async fn read(&self, response: reqwest::Response) -> Result<RawResponse, TransportError> {
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl PaymentsGateway for HttpGateway {
    async fn create_payment(&self, payment: &PreparedPayment) -> Result<RawResponse, TransportError> {
        let identity = &payment.identity;
        let response = self
            .client
            .post(self.payments_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_IDEMPOTENCY_KEY, identity.idempotency_key.as_str())
            .header(HEADER_MERCHANT_ID, identity.merchant_id.as_str())
            .header(HEADER_CUSTOMER_ID, identity.customer_id.as_str())
            .header(HEADER_ACCOUNT_ID, identity.account_id.as_str())
            .body(payment.body.clone())
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.read(response).await
    }

    async fn get_payment(&self, payment_id: &str) -> Result<RawResponse, TransportError> {
        let mut url = self.payments_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Request(format!("cannot extend {}", self.payments_url)))?
            .push(payment_id);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.read(response).await
    }
}

/// Outcome of one call. A transport failure leaves `status` empty; body
/// parsing is best-effort and never aborts the iteration.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub status: Option<u16>,
    pub body: Result<ParsedBody, ParseError>,
    pub latency: Duration,
    pub transport_error: Option<TransportError>,
}

impl CallResult {
    pub fn from_response(response: Result<RawResponse, TransportError>, latency: Duration) -> Self {
        match response {
            Ok(raw) => Self {
                status: Some(raw.status),
                body: ParsedBody::parse(&raw.body),
                latency,
                transport_error: None,
            },
            Err(e) => Self {
                status: None,
                body: Err(ParseError::EmptyBody),
                latency,
                transport_error: Some(e),
            },
        }
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.body.as_ref().ok().and_then(|b| b.payment_id.as_deref())
    }

    pub fn failed(&self) -> bool {
        is_failed_request(self.status)
    }

    /// Adds the request-level samples every call contributes.
    pub fn record_http(&self, record: &mut IterationRecord) {
        record.count(Counter::HttpReqs);
        record.observe(Trend::HttpReqDuration, self.latency);
        if self.failed() {
            record.count(Counter::HttpReqFailed);
        }
        if self.transport_error.is_some() {
            record.count(Counter::TransportErrors);
        }
        if matches!(self.body, Err(ParseError::Json(_))) {
            record.count(Counter::ResponseParseErrors);
        }
    }
}

/// Times gateway calls and turns them into [`CallResult`]s.
#[derive(Clone)]
pub struct RequestIssuer {
    gateway: Arc<dyn PaymentsGateway>,
}

impl RequestIssuer {
    pub fn new(gateway: Arc<dyn PaymentsGateway>) -> Self {
        Self { gateway }
    }

    pub async fn create(&self, payment: &PreparedPayment) -> CallResult {
        let start = Instant::now();
        let response = self.gateway.create_payment(payment).await;
        let result = CallResult::from_response(response, start.elapsed());
        if let Some(e) = &result.transport_error {
            debug!(key = %payment.identity.idempotency_key, "create failed: {}", e);
        }
        result
    }

    pub async fn status(&self, payment_id: &str) -> CallResult {
        let start = Instant::now();
        let response = self.gateway.get_payment(payment_id).await;
        let result = CallResult::from_response(response, start.elapsed());
        if let Some(e) = &result.transport_error {
            debug!(payment_id, "status query failed: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PaymentMethod, PaymentRequest, RequestIdentity};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payment() -> PreparedPayment {
        PreparedPayment::new(
            PaymentRequest::new(dec!(99.5), PaymentMethod::Pix, "dest-1"),
            RequestIdentity {
                merchant_id: "merchant-7".into(),
                customer_id: "customer-basic-001".into(),
                account_id: "account-9".into(),
                idempotency_key: "key-1".into(),
            },
        )
        .unwrap()
    }

    fn issuer_for(uri: &str, timeout: Duration) -> RequestIssuer {
        let url = Url::parse(uri).unwrap();
        RequestIssuer::new(Arc::new(HttpGateway::new(&url, timeout).unwrap()))
    }

    #[tokio::test]
    async fn test_create_sends_headers_and_frozen_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(header("Content-Type", "application/json"))
            .and(header("Idempotency-Key", "key-1"))
            .and(header("X-Merchant-Id", "merchant-7"))
            .and(header("X-Customer-Id", "customer-basic-001"))
            .and(header("X-Account-Id", "account-9"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({"payment_id": "pay-1", "status": "RECEIVED"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let prepared = payment();
        let result = issuer_for(&server.uri(), Duration::from_secs(5)).create(&prepared).await;

        assert_eq!(result.status, Some(202));
        assert_eq!(result.payment_id(), Some("pay-1"));
        assert!(result.transport_error.is_none());

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].body, prepared.body);
    }

    #[tokio::test]
    async fn test_status_query_hits_payment_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/pay-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"payment_id": "pay-42"})))
            .expect(1)
            .mount(&server)
            .await;

        let result = issuer_for(&server.uri(), Duration::from_secs(5)).status("pay-42").await;
        assert_eq!(result.status, Some(200));
        assert!(!result.failed());
    }

    #[tokio::test]
    async fn test_base_url_with_trailing_slash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let uri = format!("{}/", server.uri());
        let result = issuer_for(&uri, Duration::from_secs(5)).create(&payment()).await;
        assert_eq!(result.status, Some(429));
        assert_eq!(result.body, Err(ParseError::EmptyBody));
        assert!(result.failed());
    }

    #[tokio::test]
    async fn test_unparseable_body_is_kept_as_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let result = issuer_for(&server.uri(), Duration::from_secs(5)).create(&payment()).await;
        assert_eq!(result.status, Some(202));
        assert!(matches!(result.body, Err(ParseError::Json(_))));
        assert_eq!(result.payment_id(), None);
    }

    #[tokio::test]
    async fn test_timeout_becomes_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let result = issuer_for(&server.uri(), Duration::from_millis(50)).create(&payment()).await;
        assert_eq!(result.status, None);
        assert_eq!(result.transport_error, Some(TransportError::Timeout(50)));
        assert!(result.failed());
        assert!(result.latency >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_connection_refused_becomes_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = issuer_for(&format!("http://{}", addr), Duration::from_secs(2))
            .create(&payment())
            .await;
        assert_eq!(result.status, None);
        assert!(matches!(result.transport_error, Some(TransportError::Connect(_))));
    }

    #[test]
    fn test_record_http_counts() {
        let metrics = crate::metrics::MetricsAggregator::new().unwrap();
        let mut record = IterationRecord::new();

        CallResult::from_response(
            Ok(RawResponse { status: 202, body: b"{}".to_vec() }),
            Duration::from_millis(3),
        )
        .record_http(&mut record);
        CallResult::from_response(Err(TransportError::Connect("refused".into())), Duration::from_millis(1))
            .record_http(&mut record);
        CallResult::from_response(
            Ok(RawResponse { status: 500, body: b"not json".to_vec() }),
            Duration::from_millis(2),
        )
        .record_http(&mut record);
        record.commit(&metrics);

        assert_eq!(metrics.counter(Counter::HttpReqs), 3);
        assert_eq!(metrics.counter(Counter::HttpReqFailed), 2);
        assert_eq!(metrics.counter(Counter::TransportErrors), 1);
        assert_eq!(metrics.counter(Counter::ResponseParseErrors), 1);
        assert_eq!(metrics.samples(Trend::HttpReqDuration).len(), 3);
    }
}

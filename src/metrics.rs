//! Run-scoped metrics aggregation.
//!
//! One [`MetricsAggregator`] is created per run and shared by every worker.
//! Counters are atomic, distribution appends go through a lock-free queue
//! and are merged into the retained sample set when a snapshot is taken.

use chrono::{DateTime, Utc};
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::model::ResponseOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    PaymentAllow,
    PaymentBlocked,
    PaymentReview,
    PaymentRateLimited,
    PaymentValidationError,
    PaymentServerError,
    PaymentUnclassified,
    IdempotencySamePaymentId,
    IdempotencyMismatchPaymentId,
    IdempotencyPairExcluded,
    HttpReqs,
    HttpReqFailed,
    TransportErrors,
    ResponseParseErrors,
    Iterations,
    DroppedIterations,
    ChecksPassed,
    ChecksFailed,
}

impl Counter {
    pub const ALL: [Counter; 18] = [
        Counter::PaymentAllow,
        Counter::PaymentBlocked,
        Counter::PaymentReview,
        Counter::PaymentRateLimited,
        Counter::PaymentValidationError,
        Counter::PaymentServerError,
        Counter::PaymentUnclassified,
        Counter::IdempotencySamePaymentId,
        Counter::IdempotencyMismatchPaymentId,
        Counter::IdempotencyPairExcluded,
        Counter::HttpReqs,
        Counter::HttpReqFailed,
        Counter::TransportErrors,
        Counter::ResponseParseErrors,
        Counter::Iterations,
        Counter::DroppedIterations,
        Counter::ChecksPassed,
        Counter::ChecksFailed,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::PaymentAllow => "payment_allow_total",
            Counter::PaymentBlocked => "payment_blocked_total",
            Counter::PaymentReview => "payment_review_total",
            Counter::PaymentRateLimited => "payment_rate_limited_total",
            Counter::PaymentValidationError => "payment_validation_error_total",
            Counter::PaymentServerError => "payment_server_error_total",
            Counter::PaymentUnclassified => "payment_unclassified_total",
            Counter::IdempotencySamePaymentId => "idempotency_same_payment_id_total",
            Counter::IdempotencyMismatchPaymentId => "idempotency_mismatch_payment_id_total",
            Counter::IdempotencyPairExcluded => "idempotency_pair_excluded_total",
            Counter::HttpReqs => "http_reqs_total",
            Counter::HttpReqFailed => "http_req_failed_total",
            Counter::TransportErrors => "transport_errors_total",
            Counter::ResponseParseErrors => "response_parse_errors_total",
            Counter::Iterations => "iterations_total",
            Counter::DroppedIterations => "dropped_iterations_total",
            Counter::ChecksPassed => "checks_passed_total",
            Counter::ChecksFailed => "checks_failed_total",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Counter::PaymentAllow => "Create calls accepted without a block or review",
            Counter::PaymentBlocked => "Create calls accepted with status BLOCKED",
            Counter::PaymentReview => "Create calls accepted with status IN_REVIEW",
            Counter::PaymentRateLimited => "Create calls rejected with 429",
            Counter::PaymentValidationError => "Create calls rejected with 400, 403 or 422",
            Counter::PaymentServerError => "Create calls answered with 5xx",
            Counter::PaymentUnclassified => "Create calls outside the outcome taxonomy",
            Counter::IdempotencySamePaymentId => "Collision pairs that resolved to one payment",
            Counter::IdempotencyMismatchPaymentId => "Collision pairs that resolved to different payments",
            Counter::IdempotencyPairExcluded => "Collision pairs skipped because a call was not accepted",
            Counter::HttpReqs => "HTTP calls issued",
            Counter::HttpReqFailed => "HTTP calls with no response or status >= 400",
            Counter::TransportErrors => "HTTP calls that failed before a response",
            Counter::ResponseParseErrors => "Response bodies that were not valid JSON",
            Counter::Iterations => "Completed iterations",
            Counter::DroppedIterations => "Arrivals dropped because the worker pool was saturated",
            Counter::ChecksPassed => "Response checks that passed",
            Counter::ChecksFailed => "Response checks that failed",
        }
    }

    pub fn for_outcome(outcome: ResponseOutcome) -> Counter {
        match outcome {
            ResponseOutcome::Allowed => Counter::PaymentAllow,
            ResponseOutcome::Blocked => Counter::PaymentBlocked,
            ResponseOutcome::InReview => Counter::PaymentReview,
            ResponseOutcome::RateLimited => Counter::PaymentRateLimited,
            ResponseOutcome::ValidationError => Counter::PaymentValidationError,
            ResponseOutcome::ServerError => Counter::PaymentServerError,
            ResponseOutcome::Unclassified => Counter::PaymentUnclassified,
        }
    }

    pub fn from_name(name: &str) -> Option<Counter> {
        Counter::ALL.iter().copied().find(|c| c.name() == name)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trend {
    PaymentCreateLatency,
    PaymentStatusQueryLatency,
    IdempotencyCollisionLatency,
    HttpReqDuration,
}

impl Trend {
    pub const ALL: [Trend; 4] = [
        Trend::PaymentCreateLatency,
        Trend::PaymentStatusQueryLatency,
        Trend::IdempotencyCollisionLatency,
        Trend::HttpReqDuration,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Trend::PaymentCreateLatency => "payment_create_latency",
            Trend::PaymentStatusQueryLatency => "payment_status_query_latency",
            Trend::IdempotencyCollisionLatency => "idempotency_collision_latency",
            Trend::HttpReqDuration => "http_req_duration",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Trend::PaymentCreateLatency => "POST /payments latency",
            Trend::PaymentStatusQueryLatency => "GET /payments/{id} latency",
            Trend::IdempotencyCollisionLatency => "Latency of calls in an idempotency pair",
            Trend::HttpReqDuration => "Latency of every HTTP call",
        }
    }

    pub fn from_name(name: &str) -> Option<Trend> {
        Trend::ALL.iter().copied().find(|t| t.name() == name)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Ratios derived from a pair of counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateMetric {
    HttpReqFailed,
    Checks,
}

impl RateMetric {
    pub const ALL: [RateMetric; 2] = [RateMetric::HttpReqFailed, RateMetric::Checks];

    pub fn name(&self) -> &'static str {
        match self {
            RateMetric::HttpReqFailed => "http_req_failed",
            RateMetric::Checks => "checks",
        }
    }

    pub fn from_name(name: &str) -> Option<RateMetric> {
        RateMetric::ALL.iter().copied().find(|r| r.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricKind {
    Counter,
    Distribution,
}

/// A single measurement waiting to be committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricSample {
    Counter { counter: Counter, value: u64 },
    Distribution { trend: Trend, value_ms: f64 },
}

impl MetricSample {
    pub fn name(&self) -> &'static str {
        match self {
            MetricSample::Counter { counter, .. } => counter.name(),
            MetricSample::Distribution { trend, .. } => trend.name(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSample::Counter { .. } => MetricKind::Counter,
            MetricSample::Distribution { .. } => MetricKind::Distribution,
        }
    }
}

/// Samples produced by one iteration. Nothing reaches the aggregator until
/// [`IterationRecord::commit`], so an abandoned iteration leaves no trace.
#[derive(Debug, Default)]
pub struct IterationRecord {
    samples: Vec<MetricSample>,
    merchant: Option<(String, ResponseOutcome)>,
}

impl IterationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&mut self, counter: Counter) {
        self.samples.push(MetricSample::Counter { counter, value: 1 });
    }

    pub fn observe(&mut self, trend: Trend, latency: Duration) {
        self.samples.push(MetricSample::Distribution {
            trend,
            value_ms: latency.as_secs_f64() * 1000.0,
        });
    }

    pub fn check(&mut self, passed: bool) {
        self.count(if passed {
            Counter::ChecksPassed
        } else {
            Counter::ChecksFailed
        });
    }

    pub fn merchant_outcome(&mut self, merchant_id: &str, outcome: ResponseOutcome) {
        self.merchant = Some((merchant_id.to_string(), outcome));
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn commit(self, aggregator: &MetricsAggregator) {
        for sample in &self.samples {
            aggregator.apply(sample);
        }
        if let Some((merchant, outcome)) = &self.merchant {
            aggregator.record_merchant(merchant, *outcome);
        }
        aggregator.increment(Counter::Iterations);
    }
}

struct Distribution {
    pending: SegQueue<f64>,
    retained: Mutex<Vec<f64>>,
    histogram: Histogram,
}

impl Distribution {
    fn append(&self, value_ms: f64) {
        self.pending.push(value_ms);
        self.histogram.observe(value_ms / 1000.0);
    }

    /// Drains the lock-free buffer into the retained set and returns a copy.
    fn merged(&self) -> Vec<f64> {
        let mut retained = self.retained.lock();
        while let Some(value) = self.pending.pop() {
            retained.push(value);
        }
        retained.clone()
    }
}

#[derive(Default)]
struct MerchantTally {
    requests: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MerchantStats {
    pub merchant_id: String,
    pub requests: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RateValue {
    pub hits: u64,
    pub total: u64,
}

impl RateValue {
    pub fn ratio(&self) -> Option<f64> {
        (self.total > 0).then(|| self.hits as f64 / self.total as f64)
    }
}

/// Point-in-time view of every metric. Distributions are sorted ascending.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub counters: BTreeMap<&'static str, u64>,
    pub distributions: BTreeMap<&'static str, Vec<f64>>,
    pub rates: BTreeMap<&'static str, RateValue>,
}

impl MetricsSnapshot {
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.get(counter.name()).copied().unwrap_or(0)
    }

    pub fn distribution(&self, trend: Trend) -> &[f64] {
        self.distributions
            .get(trend.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn rate(&self, metric: RateMetric) -> RateValue {
        self.rates
            .get(metric.name())
            .copied()
            .unwrap_or(RateValue { hits: 0, total: 0 })
    }
}

pub struct MetricsAggregator {
    registry: Registry,
    counters: Vec<IntCounter>,
    distributions: Vec<Distribution>,
    merchants: DashMap<String, MerchantTally>,
    started: Instant,
}

impl MetricsAggregator {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let mut counters = Vec::with_capacity(Counter::ALL.len());
        for counter in Counter::ALL {
            let c = IntCounter::new(counter.name(), counter.help())?;
            registry.register(Box::new(c.clone()))?;
            counters.push(c);
        }

        let mut distributions = Vec::with_capacity(Trend::ALL.len());
        for trend in Trend::ALL {
            let opts = HistogramOpts::new(format!("{}_seconds", trend.name()), trend.help())
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);
            let histogram = Histogram::with_opts(opts)?;
            registry.register(Box::new(histogram.clone()))?;
            distributions.push(Distribution {
                pending: SegQueue::new(),
                retained: Mutex::new(Vec::new()),
                histogram,
            });
        }

        Ok(Self {
            registry,
            counters,
            distributions,
            merchants: DashMap::new(),
            started: Instant::now(),
        })
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: u64) {
        self.counters[counter.index()].inc_by(value);
    }

    pub fn observe_ms(&self, trend: Trend, value_ms: f64) {
        self.distributions[trend.index()].append(value_ms);
    }

    pub fn apply(&self, sample: &MetricSample) {
        match *sample {
            MetricSample::Counter { counter, value } => self.add(counter, value),
            MetricSample::Distribution { trend, value_ms } => self.observe_ms(trend, value_ms),
        }
    }

    pub fn record_merchant(&self, merchant_id: &str, outcome: ResponseOutcome) {
        let tally = self.merchants.entry(merchant_id.to_string()).or_default();
        tally.requests.fetch_add(1, Ordering::Relaxed);
        if outcome == ResponseOutcome::RateLimited {
            tally.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].get()
    }

    pub fn samples(&self, trend: Trend) -> Vec<f64> {
        self.distributions[trend.index()].merged()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = Counter::ALL
            .iter()
            .map(|c| (c.name(), self.counter(*c)))
            .collect::<BTreeMap<_, _>>();

        let distributions = Trend::ALL
            .iter()
            .map(|t| {
                let mut values = self.samples(*t);
                values.sort_by(f64::total_cmp);
                (t.name(), values)
            })
            .collect();

        let reqs = self.counter(Counter::HttpReqs);
        let passed = self.counter(Counter::ChecksPassed);
        let failed_checks = self.counter(Counter::ChecksFailed);
        let mut rates = BTreeMap::new();
        rates.insert(
            RateMetric::HttpReqFailed.name(),
            RateValue {
                hits: self.counter(Counter::HttpReqFailed),
                total: reqs,
            },
        );
        rates.insert(
            RateMetric::Checks.name(),
            RateValue {
                hits: passed,
                total: passed + failed_checks,
            },
        );

        MetricsSnapshot {
            taken_at: Utc::now(),
            elapsed: self.elapsed(),
            counters,
            distributions,
            rates,
        }
    }

    /// Merchants ordered by rate-limited count, then request count.
    pub fn merchant_breakdown(&self) -> Vec<MerchantStats> {
        let mut stats: Vec<MerchantStats> = self
            .merchants
            .iter()
            .map(|entry| MerchantStats {
                merchant_id: entry.key().clone(),
                requests: entry.requests.load(Ordering::Relaxed),
                rate_limited: entry.rate_limited.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| {
            b.rate_limited
                .cmp(&a.rate_limited)
                .then(b.requests.cmp(&a.requests))
                .then(a.merchant_id.cmp(&b.merchant_id))
        });
        stats
    }

    /// Prometheus text exposition of the run registry.
    pub fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = MetricsAggregator::new().unwrap();
        let snapshot = metrics.snapshot();
        for counter in Counter::ALL {
            assert_eq!(snapshot.counter(counter), 0, "{}", counter.name());
        }
        assert!(snapshot.distribution(Trend::PaymentCreateLatency).is_empty());
        assert_eq!(snapshot.rate(RateMetric::HttpReqFailed).ratio(), None);
    }

    #[test]
    fn test_two_aggregators_do_not_share_state() {
        let a = MetricsAggregator::new().unwrap();
        let b = MetricsAggregator::new().unwrap();
        a.increment(Counter::PaymentAllow);
        assert_eq!(a.counter(Counter::PaymentAllow), 1);
        assert_eq!(b.counter(Counter::PaymentAllow), 0);
    }

    #[test]
    fn test_record_commit_applies_everything() {
        let metrics = MetricsAggregator::new().unwrap();
        let mut record = IterationRecord::new();
        record.count(Counter::HttpReqs);
        record.count(Counter::PaymentBlocked);
        record.observe(Trend::PaymentCreateLatency, Duration::from_millis(120));
        record.check(true);
        record.merchant_outcome("merchant-1", ResponseOutcome::Blocked);

        assert_eq!(metrics.counter(Counter::HttpReqs), 0, "nothing recorded before commit");
        record.commit(&metrics);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(Counter::HttpReqs), 1);
        assert_eq!(snapshot.counter(Counter::PaymentBlocked), 1);
        assert_eq!(snapshot.counter(Counter::Iterations), 1);
        assert_eq!(snapshot.rate(RateMetric::Checks).ratio(), Some(1.0));
        assert_eq!(snapshot.distribution(Trend::PaymentCreateLatency), &[120.0]);
        assert_eq!(metrics.merchant_breakdown()[0].requests, 1);
    }

    #[test]
    fn test_dropped_record_leaves_no_samples() {
        let metrics = MetricsAggregator::new().unwrap();
        {
            let mut record = IterationRecord::new();
            record.count(Counter::HttpReqs);
            record.observe(Trend::HttpReqDuration, Duration::from_millis(5));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(Counter::HttpReqs), 0);
        assert!(snapshot.distribution(Trend::HttpReqDuration).is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_commutative() {
        let metrics = Arc::new(MetricsAggregator::new().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        metrics.increment(Counter::HttpReqs);
                        metrics.observe_ms(Trend::HttpReqDuration, (t * 1_000 + i) as f64);
                        metrics.record_merchant(&format!("merchant-{}", i % 10), ResponseOutcome::Allowed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(Counter::HttpReqs), 8_000);
        let values = snapshot.distribution(Trend::HttpReqDuration);
        assert_eq!(values.len(), 8_000);
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "snapshot must be sorted");

        let merchants = metrics.merchant_breakdown();
        assert_eq!(merchants.len(), 10);
        assert!(merchants.iter().all(|m| m.requests == 800 && m.rate_limited == 0));
    }

    #[test]
    fn test_snapshots_accumulate_across_drains() {
        let metrics = MetricsAggregator::new().unwrap();
        metrics.observe_ms(Trend::PaymentCreateLatency, 3.0);
        assert_eq!(metrics.samples(Trend::PaymentCreateLatency).len(), 1);
        metrics.observe_ms(Trend::PaymentCreateLatency, 1.0);
        assert_eq!(metrics.snapshot().distribution(Trend::PaymentCreateLatency), &[1.0, 3.0]);
    }

    #[test]
    fn test_rate_limited_merchants_sort_first() {
        let metrics = MetricsAggregator::new().unwrap();
        metrics.record_merchant("merchant-a", ResponseOutcome::Allowed);
        metrics.record_merchant("merchant-a", ResponseOutcome::Allowed);
        metrics.record_merchant("merchant-b", ResponseOutcome::RateLimited);

        let breakdown = metrics.merchant_breakdown();
        assert_eq!(breakdown[0].merchant_id, "merchant-b");
        assert_eq!(breakdown[0].rate_limited, 1);
        assert_eq!(breakdown[1].requests, 2);
    }

    #[test]
    fn test_prometheus_exposition_names() {
        let metrics = MetricsAggregator::new().unwrap();
        metrics.increment(Counter::IdempotencyMismatchPaymentId);
        metrics.observe_ms(Trend::IdempotencyCollisionLatency, 250.0);

        let text = metrics.render_prometheus().unwrap();
        assert!(text.contains("idempotency_mismatch_payment_id_total 1"));
        assert!(text.contains("idempotency_collision_latency_seconds_count 1"));
    }

    #[test]
    fn test_counter_name_lookup() {
        for counter in Counter::ALL {
            assert_eq!(Counter::from_name(counter.name()), Some(counter));
        }
        for trend in Trend::ALL {
            assert_eq!(Trend::from_name(trend.name()), Some(trend));
        }
        assert_eq!(Counter::from_name("nope"), None);
    }
}

//! Mixed-rail traffic at a constant arrival rate.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use tracing::{error, info};

use super::{finish, resolve_thresholds, RunOutcome, ScenarioKind};
use crate::classifier::{classify, is_controlled, STATUS_ACCEPTED};
use crate::config::{parse_duration_field, MixedSettings};
use crate::context::HarnessContext;
use crate::error::HarnessError;
use crate::issuer::{PaymentsGateway, RequestIssuer};
use crate::metrics::{Counter, IterationRecord, MetricsAggregator, Trend};
use crate::scheduler::{ExecutorPlan, Scenario, Scheduler};
use crate::shutdown::RunHalt;
use crate::thresholds::{mixed_defaults, Threshold};
use crate::workload::{MixedWorkload, RailTable};

const STATUS_OK: u16 = 200;

#[derive(Debug, Clone)]
pub struct MixedPlan {
    pub executor: ExecutorPlan,
    pub workload: MixedWorkload,
    pub status_query_ratio: f64,
    pub thresholds: Vec<Threshold>,
}

fn ratio(field: &str, value: f64) -> Result<f64, HarnessError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(HarnessError::invalid(field, format!("{} is outside [0, 1]", value)))
    }
}

impl MixedPlan {
    pub fn from_settings(settings: &MixedSettings) -> Result<Self, HarnessError> {
        let status_query_ratio = ratio("mixed.status_query_ratio", settings.status_query_ratio)?;
        let workload = MixedWorkload::new(
            RailTable::new(settings.resolved_rails())?,
            settings.destination_block_ratio,
            settings.blocked_destination.clone(),
            settings.merchant_cardinality,
            settings.account_cardinality,
        )?;
        if !(settings.target_rps.is_finite() && settings.target_rps > 0.0) {
            return Err(HarnessError::invalid("mixed.target_rps", "must be positive"));
        }

        let executor = ExecutorPlan::ConstantArrivalRate {
            rate: settings.target_rps,
            time_unit: parse_duration_field("mixed.time_unit", &settings.time_unit)?,
            duration: parse_duration_field("mixed.duration", &settings.duration)?,
            preallocated_workers: settings.resolved_preallocated(),
            max_workers: settings.resolved_max_workers(),
            graceful_stop: parse_duration_field("mixed.graceful_stop", &settings.graceful_stop)?,
        };
        executor.validate()?;

        Ok(Self {
            executor,
            workload,
            status_query_ratio,
            thresholds: resolve_thresholds(&settings.thresholds, mixed_defaults)?,
        })
    }
}

pub struct MixedScenario {
    workload: MixedWorkload,
    status_query_ratio: f64,
    issuer: RequestIssuer,
    context: HarnessContext,
    metrics: Arc<MetricsAggregator>,
}

impl MixedScenario {
    pub fn new(
        workload: MixedWorkload,
        status_query_ratio: f64,
        issuer: RequestIssuer,
        context: HarnessContext,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            workload,
            status_query_ratio,
            issuer,
            context,
            metrics,
        }
    }
}

#[async_trait]
impl Scenario for MixedScenario {
    type Worker = StdRng;

    fn spawn_worker(&self, worker_index: u64) -> StdRng {
        self.context.rng.for_worker(worker_index)
    }

    async fn iteration(&self, rng: &mut StdRng, worker_index: u64, iteration: u64) {
        let mut record = IterationRecord::new();
        let payment = match self.workload.next(worker_index, iteration, rng) {
            Ok(payment) => payment,
            Err(e) => {
                error!(worker = worker_index, iteration, "Failed to build payment: {}", e);
                record.check(false);
                record.commit(&self.metrics);
                return;
            }
        };

        // Drawn every iteration so later payloads do not depend on responses.
        let query_status = rng.gen_bool(self.status_query_ratio);

        let created = self.issuer.create(&payment).await;
        created.record_http(&mut record);
        record.observe(Trend::PaymentCreateLatency, created.latency);

        let outcome = classify(created.status, &created.body);
        record.count(Counter::for_outcome(outcome));
        record.merchant_outcome(&payment.identity.merchant_id, outcome);
        record.check(is_controlled(created.status));

        if created.status == Some(STATUS_ACCEPTED) {
            if let Some(payment_id) = created.payment_id().filter(|_| query_status) {
                let queried = self.issuer.status(payment_id).await;
                queried.record_http(&mut record);
                record.observe(Trend::PaymentStatusQueryLatency, queried.latency);
                record.check(queried.status == Some(STATUS_OK));
            }
        }

        record.commit(&self.metrics);
    }
}

pub async fn run(
    plan: MixedPlan,
    gateway: Arc<dyn PaymentsGateway>,
    context: HarnessContext,
    halt: RunHalt,
) -> Result<RunOutcome, HarnessError> {
    info!(
        rails = plan.workload.rails().rails().len(),
        block_ratio = plan.workload.block_ratio(),
        status_query_ratio = plan.status_query_ratio,
        "🚦 Starting mixed rails scenario"
    );
    let metrics = Arc::new(MetricsAggregator::new()?);
    let scenario = Arc::new(MixedScenario::new(
        plan.workload,
        plan.status_query_ratio,
        RequestIssuer::new(gateway),
        context,
        metrics.clone(),
    ));
    let summary = Scheduler::new(plan.executor, halt, metrics.clone())
        .run(scenario)
        .await?;

    let outcome = finish(ScenarioKind::Mixed, summary, metrics, &plan.thresholds);
    info!(
        allowed = outcome.snapshot.counter(Counter::PaymentAllow),
        blocked = outcome.snapshot.counter(Counter::PaymentBlocked),
        review = outcome.snapshot.counter(Counter::PaymentReview),
        rate_limited = outcome.snapshot.counter(Counter::PaymentRateLimited),
        validation = outcome.snapshot.counter(Counter::PaymentValidationError),
        server_error = outcome.snapshot.counter(Counter::PaymentServerError),
        "Mixed traffic outcomes"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::TransportError;
    use crate::issuer::RawResponse;
    use crate::model::PreparedPayment;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Blocks the known-bad destination, rate-limits every fifth merchant.
    struct PolicyApi {
        creates: AtomicU64,
        queries: AtomicU64,
    }

    #[async_trait]
    impl PaymentsGateway for PolicyApi {
        async fn create_payment(&self, payment: &PreparedPayment) -> Result<RawResponse, TransportError> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            if payment.identity.merchant_id == "merchant-5" {
                return Ok(RawResponse { status: 429, body: Vec::new() });
            }
            let status = if payment.request.destination == "dest-blocked-001" {
                "BLOCKED"
            } else {
                "RECEIVED"
            };
            Ok(RawResponse {
                status: 202,
                body: format!(r#"{{"payment_id":"pay-{}","status":"{}"}}"#, n, status).into_bytes(),
            })
        }

        async fn get_payment(&self, _payment_id: &str) -> Result<RawResponse, TransportError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(RawResponse { status: 200, body: b"{}".to_vec() })
        }
    }

    /// Answers every create with one fixed status and keeps the bodies.
    struct FixedStatusApi {
        status: u16,
        bodies: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl PaymentsGateway for FixedStatusApi {
        async fn create_payment(&self, payment: &PreparedPayment) -> Result<RawResponse, TransportError> {
            let mut bodies = self.bodies.lock();
            bodies.push(payment.body.clone());
            Ok(RawResponse {
                status: self.status,
                body: format!(r#"{{"payment_id":"pay-{}","status":"RECEIVED"}}"#, bodies.len()).into_bytes(),
            })
        }

        async fn get_payment(&self, _payment_id: &str) -> Result<RawResponse, TransportError> {
            Ok(RawResponse { status: 200, body: b"{}".to_vec() })
        }
    }

    async fn bodies_for_status(status: u16) -> Vec<Vec<u8>> {
        let mut settings = Settings::defaults().unwrap().mixed;
        settings.status_query_ratio = 0.5;
        settings.destination_block_ratio = 0.3;
        let plan = MixedPlan::from_settings(&settings).unwrap();
        let api = Arc::new(FixedStatusApi {
            status,
            bodies: parking_lot::Mutex::new(Vec::new()),
        });
        let scenario = MixedScenario::new(
            plan.workload,
            plan.status_query_ratio,
            RequestIssuer::new(api.clone()),
            HarnessContext::new_seeded(7),
            Arc::new(MetricsAggregator::new().unwrap()),
        );

        let mut rng = scenario.spawn_worker(0);
        for iteration in 0..20 {
            scenario.iteration(&mut rng, 0, iteration).await;
        }
        let bodies = api.bodies.lock().clone();
        bodies
    }

    #[tokio::test]
    async fn test_seeded_payloads_ignore_server_responses() {
        let accepted = bodies_for_status(202).await;
        let limited = bodies_for_status(429).await;

        assert_eq!(accepted.len(), 20);
        assert_eq!(accepted, limited);
    }

    fn short_settings() -> MixedSettings {
        let mut settings = Settings::defaults().unwrap().mixed;
        settings.target_rps = 100.0;
        settings.duration = "300ms".into();
        settings.preallocated_workers = Some(1);
        settings.max_workers = Some(8);
        settings.graceful_stop = "2s".into();
        settings.merchant_cardinality = 5;
        settings
    }

    #[tokio::test]
    async fn test_blocked_destinations_and_rate_limited_merchant() {
        let mut settings = short_settings();
        settings.destination_block_ratio = 1.0;
        settings.status_query_ratio = 1.0;
        let api = Arc::new(PolicyApi {
            creates: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        });

        let outcome = run(
            MixedPlan::from_settings(&settings).unwrap(),
            api.clone(),
            HarnessContext::new_seeded(3),
            RunHalt::new(),
        )
        .await
        .unwrap();

        let snap = &outcome.snapshot;
        let creates = api.creates.load(Ordering::SeqCst);
        assert!(creates > 0);
        assert_eq!(snap.counter(Counter::PaymentAllow), 0);
        assert_eq!(
            snap.counter(Counter::PaymentBlocked) + snap.counter(Counter::PaymentRateLimited),
            creates
        );
        // Every accepted payment was queried.
        assert_eq!(api.queries.load(Ordering::SeqCst), snap.counter(Counter::PaymentBlocked));
        assert_eq!(
            snap.distribution(Trend::PaymentStatusQueryLatency).len() as u64,
            snap.counter(Counter::PaymentBlocked)
        );

        let top = &outcome.merchants[0];
        assert_eq!(top.merchant_id, "merchant-5");
        assert_eq!(top.rate_limited, top.requests);
    }

    #[tokio::test]
    async fn test_status_queries_disabled() {
        let mut settings = short_settings();
        settings.status_query_ratio = 0.0;
        let api = Arc::new(PolicyApi {
            creates: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        });

        let outcome = run(
            MixedPlan::from_settings(&settings).unwrap(),
            api.clone(),
            HarnessContext::new_seeded(3),
            RunHalt::new(),
        )
        .await
        .unwrap();

        assert_eq!(api.queries.load(Ordering::SeqCst), 0);
        assert!(outcome.snapshot.distribution(Trend::PaymentStatusQueryLatency).is_empty());
        assert_eq!(outcome.snapshot.counter(Counter::ChecksFailed), 0);
    }

    #[test]
    fn test_plan_validation() {
        let base = Settings::defaults().unwrap().mixed;

        let mut s = base.clone();
        s.status_query_ratio = 1.5;
        assert!(MixedPlan::from_settings(&s).is_err());

        let mut s = base.clone();
        s.destination_block_ratio = -0.1;
        assert!(MixedPlan::from_settings(&s).is_err());

        let mut s = base.clone();
        s.target_rps = 0.0;
        assert!(MixedPlan::from_settings(&s).is_err());

        let mut s = base.clone();
        s.target_rps = 1e-30;
        assert!(MixedPlan::from_settings(&s).is_err());

        let mut s = base.clone();
        s.duration = "1e20".into();
        assert!(MixedPlan::from_settings(&s).is_err());

        let mut s = base.clone();
        s.preallocated_workers = Some(50);
        s.max_workers = Some(10);
        assert!(MixedPlan::from_settings(&s).is_err());

        let mut s = base.clone();
        s.rails = Some(Vec::new());
        assert!(MixedPlan::from_settings(&s).is_err());

        let plan = MixedPlan::from_settings(&base).unwrap();
        assert_eq!(plan.executor.tick_period(), Some(Duration::from_millis(5)));
        assert_eq!(plan.thresholds.len(), 7);
    }
}

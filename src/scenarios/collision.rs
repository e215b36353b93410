//! Idempotency collision: every iteration sends the same request twice with
//! the same key and checks both calls resolve to one payment.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

use super::{finish, resolve_thresholds, RunOutcome, ScenarioKind};
use crate::classifier::{classify, compare_pair, PairSide, STATUS_ACCEPTED};
use crate::config::{parse_duration_field, CollisionSettings};
use crate::error::HarnessError;
use crate::issuer::{CallResult, PaymentsGateway, RequestIssuer};
use crate::metrics::{Counter, IterationRecord, MetricsAggregator, Trend};
use crate::model::PairVerdict;
use crate::scheduler::{ExecutorPlan, Scenario, Scheduler};
use crate::shutdown::RunHalt;
use crate::thresholds::{collision_defaults, Threshold};
use crate::workload::CollisionWorkload;

#[derive(Debug, Clone)]
pub struct CollisionPlan {
    pub executor: ExecutorPlan,
    pub workload: CollisionWorkload,
    pub thresholds: Vec<Threshold>,
}

impl CollisionPlan {
    pub fn from_settings(settings: &CollisionSettings) -> Result<Self, HarnessError> {
        if settings.amount <= Decimal::ZERO || settings.amount.normalize().scale() > 2 {
            return Err(HarnessError::invalid(
                "collision.amount",
                "must be positive with at most 2 decimal places",
            ));
        }
        if settings.key_prefix.trim().is_empty() {
            return Err(HarnessError::invalid("collision.key_prefix", "must not be empty"));
        }
        if settings.identity_cardinality == 0 || settings.destination_cardinality == 0 {
            return Err(HarnessError::invalid(
                "collision.identity_cardinality",
                "cardinalities must be at least 1",
            ));
        }

        let executor = ExecutorPlan::PerWorkerIterations {
            workers: settings.workers,
            iterations: settings.iterations,
            max_duration: parse_duration_field("collision.max_duration", &settings.max_duration)?,
        };
        executor.validate()?;

        Ok(Self {
            executor,
            workload: CollisionWorkload {
                amount: settings.amount,
                key_prefix: settings.key_prefix.clone(),
                identity_cardinality: settings.identity_cardinality,
                destination_cardinality: settings.destination_cardinality,
            },
            thresholds: resolve_thresholds(&settings.thresholds, collision_defaults)?,
        })
    }
}

pub struct CollisionScenario {
    workload: CollisionWorkload,
    issuer: RequestIssuer,
    metrics: Arc<MetricsAggregator>,
}

impl CollisionScenario {
    pub fn new(workload: CollisionWorkload, issuer: RequestIssuer, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            workload,
            issuer,
            metrics,
        }
    }

    fn record_call(record: &mut IterationRecord, call: &CallResult) {
        call.record_http(record);
        record.observe(Trend::IdempotencyCollisionLatency, call.latency);
        record.count(Counter::for_outcome(classify(call.status, &call.body)));
        record.check(call.status == Some(STATUS_ACCEPTED));
    }
}

#[async_trait]
impl Scenario for CollisionScenario {
    type Worker = ();

    fn spawn_worker(&self, _worker_index: u64) -> Self::Worker {}

    async fn iteration(&self, _worker: &mut (), worker_index: u64, iteration: u64) {
        let mut record = IterationRecord::new();
        let payment = match self.workload.pair(worker_index, iteration) {
            Ok(payment) => payment,
            Err(e) => {
                error!(worker = worker_index, iteration, "Failed to build collision pair: {}", e);
                record.check(false);
                record.commit(&self.metrics);
                return;
            }
        };

        // Program order: the second call is only sent once the first returned.
        let first = self.issuer.create(&payment).await;
        let second = self.issuer.create(&payment).await;
        Self::record_call(&mut record, &first);
        Self::record_call(&mut record, &second);

        let verdict = compare_pair(
            PairSide {
                status: first.status,
                payment_id: first.payment_id(),
            },
            PairSide {
                status: second.status,
                payment_id: second.payment_id(),
            },
        );
        match verdict {
            PairVerdict::SameResource(_) => record.count(Counter::IdempotencySamePaymentId),
            PairVerdict::Mismatch(result) => {
                error!(
                    idempotency_key = %payment.identity.idempotency_key,
                    first_payment_id = ?result.first_payment_id,
                    second_payment_id = ?result.second_payment_id,
                    "❌ Idempotency mismatch: one key produced two payments"
                );
                record.count(Counter::IdempotencyMismatchPaymentId);
            }
            PairVerdict::Excluded => record.count(Counter::IdempotencyPairExcluded),
        }

        record.commit(&self.metrics);
    }
}

pub async fn run(
    plan: CollisionPlan,
    gateway: Arc<dyn PaymentsGateway>,
    halt: RunHalt,
) -> Result<RunOutcome, HarnessError> {
    info!(
        key_prefix = %plan.workload.key_prefix,
        amount = %plan.workload.amount,
        "🔁 Starting idempotency collision scenario"
    );
    let metrics = Arc::new(MetricsAggregator::new()?);
    let scenario = Arc::new(CollisionScenario::new(
        plan.workload,
        RequestIssuer::new(gateway),
        metrics.clone(),
    ));
    let summary = Scheduler::new(plan.executor, halt, metrics.clone())
        .run(scenario)
        .await?;

    let outcome = finish(ScenarioKind::Collision, summary, metrics, &plan.thresholds);
    info!(
        same = outcome.snapshot.counter(Counter::IdempotencySamePaymentId),
        mismatch = outcome.snapshot.counter(Counter::IdempotencyMismatchPaymentId),
        excluded = outcome.snapshot.counter(Counter::IdempotencyPairExcluded),
        "Collision pairs evaluated"
    );
    Ok(outcome)
}

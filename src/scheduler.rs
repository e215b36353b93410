//! Iteration pacing.
//!
//! Two executor shapes drive a [`Scenario`]: a fixed pool where every worker
//! runs a fixed number of iterations back to back, and an open model that
//! starts iterations at a constant arrival rate on an elastic, bounded pool.

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::HarnessError;
use crate::metrics::{Counter, MetricsAggregator};
use crate::shutdown::RunHalt;

const MIN_TICK: Duration = Duration::from_micros(1);

fn arrival_period(rate: f64, time_unit: Duration) -> Result<Duration, HarnessError> {
    Duration::try_from_secs_f64(time_unit.as_secs_f64() / rate).map_err(|_| {
        HarnessError::invalid(
            "target_rps",
            format!("{} per {:?} gives no representable arrival period", rate, time_unit),
        )
    })
}

/// One unit of scenario work. `Worker` is the per-worker state (its RNG,
/// typically) and travels with the worker slot.
#[async_trait]
pub trait Scenario: Send + Sync + 'static {
    type Worker: Send + 'static;

    fn spawn_worker(&self, worker_index: u64) -> Self::Worker;

    async fn iteration(&self, worker: &mut Self::Worker, worker_index: u64, iteration: u64);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorPlan {
    PerWorkerIterations {
        workers: usize,
        iterations: u64,
        max_duration: Duration,
    },
    ConstantArrivalRate {
        rate: f64,
        time_unit: Duration,
        duration: Duration,
        preallocated_workers: usize,
        max_workers: usize,
        graceful_stop: Duration,
    },
}

impl ExecutorPlan {
    pub fn validate(&self) -> Result<(), HarnessError> {
        match self {
            ExecutorPlan::PerWorkerIterations {
                workers,
                iterations,
                max_duration,
            } => {
                if *workers == 0 {
                    return Err(HarnessError::invalid("workers", "must be at least 1"));
                }
                if *iterations == 0 {
                    return Err(HarnessError::invalid("iterations", "must be at least 1"));
                }
                if max_duration.is_zero() {
                    return Err(HarnessError::invalid("max_duration", "must be positive"));
                }
            }
            ExecutorPlan::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                preallocated_workers,
                max_workers,
                ..
            } => {
                if !(rate.is_finite() && *rate > 0.0) {
                    return Err(HarnessError::invalid("target_rps", "must be positive"));
                }
                if time_unit.is_zero() {
                    return Err(HarnessError::invalid("time_unit", "must be positive"));
                }
                if arrival_period(*rate, *time_unit)? < MIN_TICK {
                    return Err(HarnessError::invalid("target_rps", "rate is too high for the timer"));
                }
                if duration.is_zero() {
                    return Err(HarnessError::invalid("duration", "must be positive"));
                }
                if *max_workers == 0 {
                    return Err(HarnessError::invalid("max_workers", "must be at least 1"));
                }
                if max_workers < preallocated_workers {
                    return Err(HarnessError::invalid(
                        "max_workers",
                        format!("{} is below preallocated_workers {}", max_workers, preallocated_workers),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Time between arrivals for the open model.
    pub fn tick_period(&self) -> Option<Duration> {
        match self {
            ExecutorPlan::ConstantArrivalRate { rate, time_unit, .. } => {
                arrival_period(*rate, *time_unit).ok()
            }
            ExecutorPlan::PerWorkerIterations { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub iterations_started: u64,
    pub iterations_completed: u64,
    pub iterations_aborted: u64,
    pub dropped_iterations: u64,
    pub workers_allocated: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub hard_stopped: bool,
}

impl ExecutionSummary {
    pub fn saturated(&self) -> bool {
        self.dropped_iterations > 0
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// An idle worker. Owned by the dispatcher while idle and by the iteration
/// task while busy, so the iteration index needs no shared counter.
struct WorkerSlot<W> {
    worker_index: u64,
    next_iteration: u64,
    state: W,
}

#[derive(Default)]
struct Tally {
    started: AtomicU64,
    completed: AtomicU64,
}

pub struct Scheduler {
    plan: ExecutorPlan,
    halt: RunHalt,
    metrics: Arc<MetricsAggregator>,
}

impl Scheduler {
    pub fn new(plan: ExecutorPlan, halt: RunHalt, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            plan,
            halt,
            metrics,
        }
    }

    pub fn plan(&self) -> &ExecutorPlan {
        &self.plan
    }

    pub async fn run<S: Scenario>(&self, scenario: Arc<S>) -> Result<ExecutionSummary, HarnessError> {
        self.plan.validate()?;
        let summary = match self.plan.clone() {
            ExecutorPlan::PerWorkerIterations {
                workers,
                iterations,
                max_duration,
            } => {
                self.run_per_worker(scenario, workers, iterations, max_duration)
                    .await
            }
            ExecutorPlan::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                preallocated_workers,
                max_workers,
                graceful_stop,
            } => {
                let period = arrival_period(rate, time_unit)?;
                self.run_arrival_rate(
                    scenario,
                    period,
                    duration,
                    preallocated_workers,
                    max_workers,
                    graceful_stop,
                )
                .await
            }
        };
        info!(
            started = summary.iterations_started,
            completed = summary.iterations_completed,
            aborted = summary.iterations_aborted,
            dropped = summary.dropped_iterations,
            workers = summary.workers_allocated,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Executor finished"
        );
        Ok(summary)
    }

    async fn run_per_worker<S: Scenario>(
        &self,
        scenario: Arc<S>,
        workers: usize,
        iterations: u64,
        max_duration: Duration,
    ) -> ExecutionSummary {
        info!(workers, iterations, ?max_duration, "Starting per-worker iterations executor");
        let start = Instant::now();
        let tally = Arc::new(Tally::default());
        let mut set = JoinSet::new();

        for worker_index in 0..workers as u64 {
            let scenario = scenario.clone();
            let tally = tally.clone();
            let halt = self.halt.clone();
            set.spawn(async move {
                let mut state = scenario.spawn_worker(worker_index);
                for iteration in 0..iterations {
                    if halt.is_halted() {
                        break;
                    }
                    tally.started.fetch_add(1, Ordering::Relaxed);
                    scenario.iteration(&mut state, worker_index, iteration).await;
                    tally.completed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        let hard_stop = tokio::time::sleep(max_duration);
        tokio::pin!(hard_stop);
        let mut hard_stopped = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(result) => log_join(result),
                    None => break,
                },
                _ = &mut hard_stop => {
                    warn!(?max_duration, in_flight = set.len(), "⏱️ Max duration reached, aborting workers");
                    hard_stopped = true;
                    set.abort_all();
                    break;
                }
            }
        }
        while let Some(result) = set.join_next().await {
            log_join(result);
        }

        summarize(&tally, 0, workers, start.elapsed(), hard_stopped)
    }

    async fn run_arrival_rate<S: Scenario>(
        &self,
        scenario: Arc<S>,
        period: Duration,
        duration: Duration,
        preallocated: usize,
        max_workers: usize,
        graceful_stop: Duration,
    ) -> ExecutionSummary {
        info!(
            period_us = period.as_micros() as u64,
            ?duration,
            preallocated,
            max_workers,
            "Starting constant arrival rate executor"
        );
        let start = Instant::now();
        let tally = Arc::new(Tally::default());
        let mut set = JoinSet::new();
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<WorkerSlot<S::Worker>>();

        let mut allocated = 0usize;
        let new_slot = |allocated: &mut usize| {
            let worker_index = *allocated as u64;
            *allocated += 1;
            WorkerSlot {
                worker_index,
                next_iteration: 0,
                state: scenario.spawn_worker(worker_index),
            }
        };
        for _ in 0..preallocated {
            let _ = idle_tx.send(new_slot(&mut allocated));
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let run_end = tokio::time::sleep(duration);
        tokio::pin!(run_end);
        let halted = self.halt.halted();
        tokio::pin!(halted);
        let mut dropped = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = &mut run_end => break,
                _ = &mut halted => {
                    info!("Dispatch stopped by halt");
                    break;
                }
                Some(result) = set.join_next(), if !set.is_empty() => log_join(result),
                _ = ticker.tick() => {
                    let slot = match idle_rx.try_recv() {
                        Ok(slot) => Some(slot),
                        Err(_) if allocated < max_workers => {
                            let slot = new_slot(&mut allocated);
                            debug!(worker = slot.worker_index, allocated, "Allocated worker");
                            Some(slot)
                        }
                        Err(_) => None,
                    };
                    match slot {
                        Some(mut slot) => {
                            let scenario = scenario.clone();
                            let tally = tally.clone();
                            let idle_tx = idle_tx.clone();
                            tally.started.fetch_add(1, Ordering::Relaxed);
                            set.spawn(async move {
                                let iteration = slot.next_iteration;
                                slot.next_iteration += 1;
                                scenario
                                    .iteration(&mut slot.state, slot.worker_index, iteration)
                                    .await;
                                tally.completed.fetch_add(1, Ordering::Relaxed);
                                let _ = idle_tx.send(slot);
                            });
                        }
                        None => {
                            dropped += 1;
                            self.metrics.increment(Counter::DroppedIterations);
                            if dropped == 1 || dropped % 1_000 == 0 {
                                warn!(
                                    dropped,
                                    max_workers,
                                    "⚠️ Worker pool saturated, dropping arrivals"
                                );
                            }
                        }
                    }
                }
            }
        }

        // Let in-flight iterations finish, then cut them off.
        let grace = tokio::time::sleep(graceful_stop);
        tokio::pin!(grace);
        let mut hard_stopped = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(result) => log_join(result),
                    None => break,
                },
                _ = &mut grace => {
                    warn!(?graceful_stop, in_flight = set.len(), "⏱️ Graceful stop expired, aborting iterations");
                    hard_stopped = true;
                    set.abort_all();
                    break;
                }
            }
        }
        while let Some(result) = set.join_next().await {
            log_join(result);
        }

        summarize(&tally, dropped, allocated, start.elapsed(), hard_stopped)
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Iteration task panicked: {}", e);
        }
    }
}

fn summarize(
    tally: &Tally,
    dropped: u64,
    workers: usize,
    elapsed: Duration,
    hard_stopped: bool,
) -> ExecutionSummary {
    let started = tally.started.load(Ordering::Relaxed);
    let completed = tally.completed.load(Ordering::Relaxed);
    ExecutionSummary {
        iterations_started: started,
        iterations_completed: completed,
        iterations_aborted: started.saturating_sub(completed),
        dropped_iterations: dropped,
        workers_allocated: workers,
        elapsed,
        hard_stopped,
    }
}

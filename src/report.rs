use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::HarnessError;
use crate::metrics::MerchantStats;
use crate::scenarios::{RunOutcome, ScenarioKind};
use crate::scheduler::ExecutionSummary;
use crate::thresholds::{percentile_nearest_rank, ThresholdResult};

const TOP_MERCHANTS: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DistributionSummary {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl DistributionSummary {
    /// `sorted` must be ascending.
    pub fn from_sorted(sorted: &[f64]) -> Self {
        let avg = (!sorted.is_empty()).then(|| sorted.iter().sum::<f64>() / sorted.len() as f64);
        Self {
            count: sorted.len(),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            avg,
            p50: percentile_nearest_rank(sorted, 50.0),
            p90: percentile_nearest_rank(sorted, 90.0),
            p95: percentile_nearest_rank(sorted, 95.0),
            p99: percentile_nearest_rank(sorted, 99.0),
        }
    }
}

/// Machine-readable result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scenario: ScenarioKind,
    pub generated_at: DateTime<Utc>,
    pub base_url: String,
    pub seed: Option<u64>,
    pub execution: ExecutionSummary,
    pub counters: BTreeMap<String, u64>,
    pub rates: BTreeMap<String, Option<f64>>,
    pub distributions: BTreeMap<String, DistributionSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub top_rate_limited_merchants: Vec<MerchantStats>,
    pub warnings: Vec<String>,
    pub passed: bool,
}

impl RunReport {
    pub fn from_outcome(outcome: &RunOutcome, base_url: &str, seed: Option<u64>) -> Self {
        let snapshot = &outcome.snapshot;
        let summary = &outcome.summary;

        let mut warnings = Vec::new();
        if summary.saturated() {
            warnings.push(format!(
                "worker pool saturated at {} workers: {} arrivals dropped",
                summary.workers_allocated, summary.dropped_iterations
            ));
        }
        if summary.hard_stopped {
            warnings.push(format!(
                "run was cut off: {} iterations aborted",
                summary.iterations_aborted
            ));
        }
        if summary.iterations_completed == 0 {
            warnings.push("no iteration completed".to_string());
        }

        Self {
            run_id: Uuid::new_v4(),
            scenario: outcome.kind,
            generated_at: snapshot.taken_at,
            base_url: base_url.to_string(),
            seed,
            execution: summary.clone(),
            counters: snapshot
                .counters
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            rates: snapshot
                .rates
                .iter()
                .map(|(name, value)| (name.to_string(), value.ratio()))
                .collect(),
            distributions: snapshot
                .distributions
                .iter()
                .map(|(name, values)| (name.to_string(), DistributionSummary::from_sorted(values)))
                .collect(),
            thresholds: outcome.thresholds.clone(),
            top_rate_limited_merchants: outcome
                .merchants
                .iter()
                .filter(|m| m.rate_limited > 0)
                .take(TOP_MERCHANTS)
                .cloned()
                .collect(),
            warnings,
            passed: outcome.passed(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), HarnessError> {
        write_file(path, self.to_json()?.as_bytes())?;
        info!(path = %path.display(), "📝 Run report written");
        Ok(())
    }
}

/// Writes the Prometheus text exposition of the run registry.
pub fn write_prometheus(outcome: &RunOutcome, path: &Path) -> Result<(), HarnessError> {
    let text = outcome.metrics.render_prometheus()?;
    write_file(path, text.as_bytes())?;
    info!(path = %path.display(), "📈 Prometheus exposition written");
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

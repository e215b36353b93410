pub mod collision;
pub mod mixed;

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ThresholdTable;
use crate::error::HarnessError;
use crate::metrics::{MerchantStats, MetricsAggregator, MetricsSnapshot};
use crate::scheduler::ExecutionSummary;
use crate::thresholds::{compile, evaluate, Threshold, ThresholdResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    Collision,
    Mixed,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::Collision => "collision",
            ScenarioKind::Mixed => "mixed",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a finished run produced.
pub struct RunOutcome {
    pub kind: ScenarioKind,
    pub summary: ExecutionSummary,
    pub snapshot: MetricsSnapshot,
    pub thresholds: Vec<ThresholdResult>,
    pub merchants: Vec<MerchantStats>,
    pub metrics: Arc<MetricsAggregator>,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

/// Configured thresholds when present, the scenario defaults otherwise.
pub(crate) fn resolve_thresholds(
    configured: &Option<ThresholdTable>,
    defaults: fn() -> ThresholdTable,
) -> Result<Vec<Threshold>, HarnessError> {
    let table = configured.clone().unwrap_or_else(defaults);
    Ok(compile(&table)?)
}

pub(crate) fn finish(
    kind: ScenarioKind,
    summary: ExecutionSummary,
    metrics: Arc<MetricsAggregator>,
    thresholds: &[Threshold],
) -> RunOutcome {
    let snapshot = metrics.snapshot();
    let results = evaluate(thresholds, &snapshot);

    if summary.saturated() {
        warn!(
            dropped = summary.dropped_iterations,
            workers = summary.workers_allocated,
            "⚠️ Target rate was not sustained: worker pool saturated"
        );
    }
    for result in &results {
        if result.passed {
            info!(metric = %result.metric, observed = ?result.observed, "✅ {}", result.expression);
        } else {
            error!(
                metric = %result.metric,
                observed = ?result.observed,
                note = ?result.note,
                "❌ Threshold violated: {}: {}",
                result.metric,
                result.expression
            );
        }
    }

    RunOutcome {
        kind,
        summary,
        snapshot,
        thresholds: results,
        merchants: metrics.merchant_breakdown(),
        metrics,
    }
}

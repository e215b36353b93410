//! Pass/fail predicates evaluated against a metrics snapshot at run end.
//!
//! Expressions follow the `aggregate op value` shape, e.g. `p(95)<1200`,
//! `rate<0.02` or `count==0`, attached to a metric name.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::config::ThresholdTable;
use crate::error::ThresholdError;
use crate::metrics::{Counter, MetricsSnapshot, RateMetric, Trend};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl FromStr for Aggregate {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "count" => Ok(Aggregate::Count),
            "rate" => Ok(Aggregate::Rate),
            "avg" => Ok(Aggregate::Avg),
            "min" => Ok(Aggregate::Min),
            "max" => Ok(Aggregate::Max),
            "med" => Ok(Aggregate::Med),
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| ThresholdError::UnknownAggregate(s.to_string()))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| ThresholdError::UnknownAggregate(s.to_string()))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(ThresholdError::PercentileRange(p));
                }
                Ok(Aggregate::Percentile(p))
            }
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Count => f.write_str("count"),
            Aggregate::Rate => f.write_str("rate"),
            Aggregate::Avg => f.write_str("avg"),
            Aggregate::Min => f.write_str("min"),
            Aggregate::Max => f.write_str("max"),
            Aggregate::Med => f.write_str("med"),
            Aggregate::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }

    pub fn holds(&self, observed: f64, target: f64) -> bool {
        match self {
            Comparison::Lt => observed < target,
            Comparison::Le => observed <= target,
            Comparison::Gt => observed > target,
            Comparison::Ge => observed >= target,
            Comparison::Eq => observed == target,
            Comparison::Ne => observed != target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub aggregate: Aggregate,
    pub comparison: Comparison,
    pub target: f64,
}

impl FromStr for ThresholdExpr {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ThresholdError::Malformed(s.to_string());
        let op_start = s.find(['<', '>', '=', '!']).ok_or_else(malformed)?;
        let (lhs, rest) = s.split_at(op_start);

        let (comparison, op_len) = if rest.starts_with("<=") {
            (Comparison::Le, 2)
        } else if rest.starts_with(">=") {
            (Comparison::Ge, 2)
        } else if rest.starts_with("==") {
            (Comparison::Eq, 2)
        } else if rest.starts_with("!=") {
            (Comparison::Ne, 2)
        } else if rest.starts_with('<') {
            (Comparison::Lt, 1)
        } else if rest.starts_with('>') {
            (Comparison::Gt, 1)
        } else {
            return Err(malformed());
        };

        let target: f64 = rest[op_len..].trim().parse().map_err(|_| malformed())?;
        if !target.is_finite() {
            return Err(malformed());
        }

        Ok(Self {
            aggregate: lhs.parse()?,
            comparison,
            target,
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregate, self.comparison.as_str(), self.target)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expr: ThresholdExpr,
    source: String,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ThresholdError> {
        Ok(Self {
            metric: metric.trim().to_string(),
            expr: expression.parse()?,
            source: expression.trim().to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.source)
    }
}

pub fn compile(table: &ThresholdTable) -> Result<Vec<Threshold>, ThresholdError> {
    let mut thresholds = Vec::new();
    for (metric, expressions) in table {
        for expression in expressions {
            thresholds.push(Threshold::parse(metric, expression)?);
        }
    }
    Ok(thresholds)
}

fn table(entries: &[(&str, &[&str])]) -> ThresholdTable {
    entries
        .iter()
        .map(|(metric, exprs)| {
            (
                metric.to_string(),
                exprs.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect()
}

pub fn collision_defaults() -> ThresholdTable {
    table(&[
        ("http_req_failed", &["rate<0.02"]),
        ("idempotency_collision_latency", &["p(95)<1200", "p(99)<2500"]),
        ("idempotency_mismatch_payment_id_total", &["count==0"]),
    ])
}

pub fn mixed_defaults() -> ThresholdTable {
    table(&[
        ("http_req_failed", &["rate<0.03"]),
        ("http_req_duration", &["p(95)<1500", "p(99)<3000"]),
        ("payment_create_latency", &["p(95)<1200", "p(99)<2500"]),
        ("payment_status_query_latency", &["p(95)<800", "p(99)<1500"]),
    ])
}

/// Nearest-rank percentile over ascending `sorted`.
pub fn percentile_nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((p * n as f64) / 100.0).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

enum Observation {
    Value(f64),
    NoSamples,
    Invalid(String),
}

fn observe(metric: &str, aggregate: Aggregate, snapshot: &MetricsSnapshot) -> Observation {
    if let Some(trend) = Trend::from_name(metric) {
        let values = snapshot.distribution(trend);
        if aggregate == Aggregate::Count {
            return Observation::Value(values.len() as f64);
        }
        if values.is_empty() {
            return Observation::NoSamples;
        }
        let value = match aggregate {
            Aggregate::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregate::Min => values[0],
            Aggregate::Max => values[values.len() - 1],
            Aggregate::Med => percentile_nearest_rank(values, 50.0).unwrap_or(f64::NAN),
            Aggregate::Percentile(p) => percentile_nearest_rank(values, p).unwrap_or(f64::NAN),
            Aggregate::Count | Aggregate::Rate => {
                return Observation::Invalid(format!("{} does not apply to a distribution", aggregate));
            }
        };
        return Observation::Value(value);
    }

    if let Some(rate) = RateMetric::from_name(metric) {
        let value = snapshot.rate(rate);
        return match aggregate {
            Aggregate::Rate => value.ratio().map_or(Observation::NoSamples, Observation::Value),
            Aggregate::Count => Observation::Value(value.hits as f64),
            other => Observation::Invalid(format!("{} does not apply to a rate", other)),
        };
    }

    if let Some(counter) = Counter::from_name(metric) {
        let value = snapshot.counter(counter) as f64;
        return match aggregate {
            Aggregate::Count => Observation::Value(value),
            Aggregate::Rate => {
                let secs = snapshot.elapsed.as_secs_f64();
                if secs > 0.0 {
                    Observation::Value(value / secs)
                } else {
                    Observation::NoSamples
                }
            }
            other => Observation::Invalid(format!("{} does not apply to a counter", other)),
        };
    }

    Observation::Invalid(format!("unknown metric '{}'", metric))
}

/// Evaluates every threshold. A distribution without samples passes with no
/// observed value; an unknown metric or a mismatched aggregate fails.
pub fn evaluate(thresholds: &[Threshold], snapshot: &MetricsSnapshot) -> Vec<ThresholdResult> {
    thresholds
        .iter()
        .map(|t| {
            let (observed, passed, note) = match observe(&t.metric, t.expr.aggregate, snapshot) {
                Observation::Value(v) => (Some(v), t.expr.comparison.holds(v, t.expr.target), None),
                Observation::NoSamples => (None, true, Some("no samples".to_string())),
                Observation::Invalid(reason) => (None, false, Some(reason)),
            };
            ThresholdResult {
                metric: t.metric.clone(),
                expression: t.source.clone(),
                observed,
                passed,
                note,
            }
        })
        .collect()
}

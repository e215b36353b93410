use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::error::HarnessError;
use crate::model::{default_rails, Rail};

pub type ThresholdTable = BTreeMap<String, Vec<String>>;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub base_url: String,
    pub request_timeout: String,
    #[serde(default)]
    pub seed: Option<u64>,
    pub log_format: String,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub prometheus_path: Option<String>,
    pub collision: CollisionSettings,
    pub mixed: MixedSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollisionSettings {
    pub workers: usize,
    pub iterations: u64,
    pub max_duration: String,
    pub amount: Decimal,
    pub key_prefix: String,
    pub identity_cardinality: u64,
    pub destination_cardinality: u64,
    #[serde(default)]
    pub thresholds: Option<ThresholdTable>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MixedSettings {
    pub target_rps: f64,
    pub time_unit: String,
    pub duration: String,
    #[serde(default)]
    pub preallocated_workers: Option<usize>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    pub graceful_stop: String,
    pub status_query_ratio: f64,
    pub destination_block_ratio: f64,
    pub blocked_destination: String,
    pub merchant_cardinality: u64,
    pub account_cardinality: u64,
    #[serde(default)]
    pub rails: Option<Vec<Rail>>,
    #[serde(default)]
    pub thresholds: Option<ThresholdTable>,
}

impl Settings {
    /// Load settings: defaults, then optional files, then `LOADTEST_*` env.
    pub fn new() -> Result<Self, ConfigError> {
        let s = Self::defaults_builder()?
            // 1. Project config from config/loadtest.{toml,json}
            .add_source(File::with_name("config/loadtest").required(false))
            // 2. Local overrides from config/local.{toml,json} (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 3. Environment overrides
            // e.g. LOADTEST_MIXED__DESTINATION_BLOCK_RATIO=1.0
            .add_source(
                Environment::with_prefix("LOADTEST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        // 4. Bare k6-style names (DESTINATION_BLOCK_RATIO=1.0) win over everything.
        let s = with_env_aliases(s, |name| std::env::var(name).ok())?.build()?;

        s.try_deserialize()
    }

    pub fn defaults_builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("base_url", "http://localhost:8080")?
            .set_default("request_timeout", "30s")?
            .set_default("log_format", "text")?
            .set_default("collision.workers", 120_i64)?
            .set_default("collision.iterations", 150_i64)?
            .set_default("collision.max_duration", "10m")?
            .set_default("collision.amount", 99.5_f64)?
            .set_default("collision.key_prefix", "collision-key")?
            .set_default("collision.identity_cardinality", 50_i64)?
            .set_default("collision.destination_cardinality", 100_i64)?
            .set_default("mixed.target_rps", 200.0_f64)?
            .set_default("mixed.time_unit", "1s")?
            .set_default("mixed.duration", "2m")?
            .set_default("mixed.graceful_stop", "30s")?
            .set_default("mixed.status_query_ratio", 0.1_f64)?
            .set_default("mixed.destination_block_ratio", 0.01_f64)?
            .set_default("mixed.blocked_destination", "dest-blocked-001")?
            .set_default("mixed.merchant_cardinality", 200_i64)?
            .set_default("mixed.account_cardinality", 500_i64)
    }

    pub fn defaults() -> Result<Self, ConfigError> {
        Self::defaults_builder()?.build()?.try_deserialize()
    }

    pub fn base_url(&self) -> Result<Url, HarnessError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| HarnessError::invalid("base_url", e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(HarnessError::invalid(
                "base_url",
                format!("unsupported scheme '{}'", other),
            )),
        }
    }

    pub fn request_timeout(&self) -> Result<Duration, HarnessError> {
        parse_duration_field("request_timeout", &self.request_timeout)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Checks everything that is independent of the chosen scenario.
    pub fn validate(&self) -> Result<(), HarnessError> {
        self.base_url()?;
        let timeout = self.request_timeout()?;
        if timeout.is_zero() {
            return Err(HarnessError::invalid("request_timeout", "must be positive"));
        }
        match self.log_format.to_ascii_lowercase().as_str() {
            "text" | "json" => Ok(()),
            other => Err(HarnessError::invalid(
                "log_format",
                format!("expected 'text' or 'json', got '{}'", other),
            )),
        }
    }
}

/// Unprefixed variable names accepted for compatibility with the k6 scripts.
pub const ENV_ALIASES: &[(&str, &str)] = &[
    ("BASE_URL", "base_url"),
    ("TARGET_RPS", "mixed.target_rps"),
    ("TEST_DURATION", "mixed.duration"),
    ("PREALLOCATED_VUS", "mixed.preallocated_workers"),
    ("MAX_VUS", "mixed.max_workers"),
    ("STATUS_QUERY_RATIO", "mixed.status_query_ratio"),
    ("DESTINATION_BLOCK_RATIO", "mixed.destination_block_ratio"),
    ("IDEMPOTENCY_VUS", "collision.workers"),
    ("IDEMPOTENCY_ITERATIONS", "collision.iterations"),
];

/// Overrides keys from [`ENV_ALIASES`]. Unset or blank variables are skipped.
pub fn with_env_aliases<F>(
    mut builder: ConfigBuilder<DefaultState>,
    lookup: F,
) -> Result<ConfigBuilder<DefaultState>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for (name, key) in ENV_ALIASES {
        let value = lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        builder = builder.set_override_option(*key, value)?;
    }
    Ok(builder)
}

impl MixedSettings {
    /// Pre-allocated pool: at least 300 workers, or one per target request
    /// per second when the rate is higher.
    pub fn resolved_preallocated(&self) -> usize {
        self.preallocated_workers
            .unwrap_or_else(|| 300.max(self.target_rps.ceil() as usize))
    }

    /// Ceiling for elastic growth: double the pool or three times the rate.
    pub fn resolved_max_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            self.resolved_preallocated()
                .saturating_mul(2)
                .max((self.target_rps * 3.0).ceil() as usize)
        })
    }

    pub fn resolved_rails(&self) -> Vec<Rail> {
        self.rails.clone().unwrap_or_else(default_rails)
    }
}

pub fn parse_duration_field(field: &str, raw: &str) -> Result<Duration, HarnessError> {
    parse_duration(raw).ok_or_else(|| {
        HarnessError::invalid(field, format!("'{}' is not a duration (try 500ms, 30s, 2m, 1h)", raw))
    })
}

/// Parses `500ms`, `30s`, `2m`, `1h`, compounds like `1m30s`, or bare seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_secs = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total = total.checked_add(Duration::try_from_secs_f64(value * unit_secs).ok()?)?;
    }
    Some(total)
}

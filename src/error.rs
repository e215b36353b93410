use thiserror::Error;

/// Failures that prevent a run from starting. Anything that can happen
/// while traffic is flowing is recorded as a sample instead.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting { field: String, reason: String },
    #[error("Threshold error: {0}")]
    Threshold(#[from] ThresholdError),
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        HarnessError::InvalidSetting {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Transport-level failure of a single call. Never fatal to the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Request error: {0}")]
    Request(String),
}

/// Best-effort body parsing failure. Routed to the unclassified bucket.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Empty response body")]
    EmptyBody,
    #[error("Malformed JSON body: {0}")]
    Json(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("Threshold expression '{0}' is malformed")]
    Malformed(String),
    #[error("Unknown aggregate '{0}'")]
    UnknownAggregate(String),
    #[error("Percentile {0} is outside 0..=100")]
    PercentileRange(f64),
}

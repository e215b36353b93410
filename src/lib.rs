pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod issuer;
pub mod metrics;
pub mod model;
pub mod report;
pub mod scenarios;
pub mod scheduler;
pub mod shutdown;
pub mod thresholds;
pub mod workload;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use payments_loadtest_rs::config::Settings;

#[derive(Parser, Debug)]
#[command(name = "payments-loadtest")]
#[command(about = "Synthetic traffic harness for the payments acceptance API", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub scenario: ScenarioCommand,

    /// Payments API base URL (overrides LOADTEST_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Seed for reproducible traffic
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Write the JSON run report here
    #[arg(long, global = true)]
    pub report: Option<PathBuf>,

    /// Write the Prometheus text exposition here
    #[arg(long, global = true)]
    pub prometheus: Option<PathBuf>,

    /// Debug logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ScenarioCommand {
    /// Send every request twice with the same idempotency key
    Collision(CollisionArgs),
    /// Mixed-rail traffic at a constant arrival rate
    Mixed(MixedArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CollisionArgs {
    /// Concurrent workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Pairs per worker
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Hard stop (e.g. 10m)
    #[arg(long)]
    pub max_duration: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct MixedArgs {
    /// Target create requests per second
    #[arg(long)]
    pub rps: Option<f64>,

    /// Run duration (e.g. 2m)
    #[arg(long)]
    pub duration: Option<String>,

    /// Pre-allocated workers
    #[arg(long)]
    pub preallocated_workers: Option<usize>,

    /// Worker ceiling
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Share of accepted payments followed by a status query
    #[arg(long)]
    pub status_query_ratio: Option<f64>,

    /// Share of requests sent to the known-blocked destination
    #[arg(long)]
    pub block_ratio: Option<f64>,
}

impl Cli {
    /// Command-line flags win over files and environment.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.base_url {
            settings.base_url = url.clone();
        }
        if self.seed.is_some() {
            settings.seed = self.seed;
        }
        if let Some(path) = &self.report {
            settings.report_path = Some(path.display().to_string());
        }
        if let Some(path) = &self.prometheus {
            settings.prometheus_path = Some(path.display().to_string());
        }

        match &self.scenario {
            ScenarioCommand::Collision(args) => {
                let c = &mut settings.collision;
                if let Some(v) = args.workers {
                    c.workers = v;
                }
                if let Some(v) = args.iterations {
                    c.iterations = v;
                }
                if let Some(v) = &args.max_duration {
                    c.max_duration = v.clone();
                }
            }
            ScenarioCommand::Mixed(args) => {
                let m = &mut settings.mixed;
                if let Some(v) = args.rps {
                    m.target_rps = v;
                }
                if let Some(v) = &args.duration {
                    m.duration = v.clone();
                }
                if args.preallocated_workers.is_some() {
                    m.preallocated_workers = args.preallocated_workers;
                }
                if args.max_workers.is_some() {
                    m.max_workers = args.max_workers;
                }
                if let Some(v) = args.status_query_ratio {
                    m.status_query_ratio = v;
                }
                if let Some(v) = args.block_ratio {
                    m.destination_block_ratio = v;
                }
            }
        }
    }
}

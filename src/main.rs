use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use payments_loadtest_rs::config::Settings;
use payments_loadtest_rs::context::HarnessContext;
use payments_loadtest_rs::error::HarnessError;
use payments_loadtest_rs::issuer::HttpGateway;
use payments_loadtest_rs::report::{write_prometheus, RunReport};
use payments_loadtest_rs::scenarios::{collision, mixed};
use payments_loadtest_rs::shutdown::RunHalt;

mod cli;

use cli::{Cli, ScenarioCommand};

const EXIT_THRESHOLDS_FAILED: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {}", e);
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    init_tracing(&settings, cli.verbose)?;

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║               PAYMENTS LOADTEST RS                            ║");
    info!("║               Idempotency & Admission Verification            ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");
    info!("Target: {}", settings.base_url);
    info!("Seed: {}", settings.seed.map_or("entropy".to_string(), |s| s.to_string()));

    match run(&cli, &settings).await {
        Ok(true) => {
            info!("✅ All thresholds passed");
            Ok(ExitCode::SUCCESS)
        }
        Ok(false) => {
            error!("❌ Run failed thresholds");
            Ok(ExitCode::from(EXIT_THRESHOLDS_FAILED))
        }
        Err(e) => {
            error!("❌ {}", e);
            Ok(ExitCode::from(EXIT_CONFIG_ERROR))
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings, HarnessError> {
    let mut settings = Settings::new()?;
    cli.apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn init_tracing(settings: &Settings, verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    if settings.json_logs() {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

async fn run(cli: &Cli, settings: &Settings) -> Result<bool, HarnessError> {
    let gateway = Arc::new(HttpGateway::new(&settings.base_url()?, settings.request_timeout()?)?);
    info!("Payments endpoint: {}", gateway.payments_url());

    let halt = RunHalt::new();
    let ctrl_c = halt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.halt("Ctrl-C received");
        }
    });

    let outcome = match &cli.scenario {
        ScenarioCommand::Collision(_) => {
            let plan = collision::CollisionPlan::from_settings(&settings.collision)?;
            info!("  Workers: {}", settings.collision.workers);
            info!("  Iterations per worker: {}", settings.collision.iterations);
            collision::run(plan, gateway, halt).await?
        }
        ScenarioCommand::Mixed(_) => {
            let plan = mixed::MixedPlan::from_settings(&settings.mixed)?;
            info!("  Target rate: {}/s", settings.mixed.target_rps);
            info!("  Duration: {}", settings.mixed.duration);
            info!(
                "  Workers: {} preallocated, {} max",
                settings.mixed.resolved_preallocated(),
                settings.mixed.resolved_max_workers()
            );
            let context = HarnessContext::from_seed(settings.seed);
            mixed::run(plan, gateway, context, halt).await?
        }
    };

    let report = RunReport::from_outcome(&outcome, &settings.base_url, settings.seed);
    if let Some(path) = &settings.report_path {
        report.write_to(Path::new(path))?;
    } else {
        println!("{}", report.to_json()?);
    }
    if let Some(path) = &settings.prometheus_path {
        write_prometheus(&outcome, Path::new(path))?;
    }

    for warning in &report.warnings {
        tracing::warn!("⚠️ {}", warning);
    }
    Ok(report.passed)
}

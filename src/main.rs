//! revflow CLI
//!
//! Exit codes: 0 success, 1 configuration error, 2 run failed, 3 gates
//! failed in strict mode.

use anyhow::Context;
use clap::Parser;
use revflow::orchestrator::Orchestrator;
use revflow::phases::standard_registry;
use revflow::providers::offline::offline_provider_set_for;
use revflow::state::run_registry::RunStatus;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "revflow", about = "Systematic literature review pipeline", version)]
struct Cli {
    /// Path to the review configuration file (YAML)
    #[arg(long, env = "CONFIG_FILE")]
    config: PathBuf,

    /// Resume a specific run instead of discovering one by topic
    #[arg(long)]
    run_id: Option<String>,

    /// Skip phases with an ordinal below this value
    #[arg(long)]
    resume_from: Option<u32>,

    /// Print the phase execution plan and exit
    #[arg(long)]
    plan: bool,

    /// Run against deterministic offline providers (no network)
    #[arg(long)]
    offline: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match revflow::ReviewConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };
    if let Some(run_id) = cli.run_id {
        config.resume_run_id = Some(run_id);
    }
    if let Some(ordinal) = cli.resume_from {
        config.start_from = Some(ordinal);
    }

    if cli.plan {
        return match print_plan() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "cannot compute execution plan");
                ExitCode::from(1)
            }
        };
    }

    if !cli.offline {
        // Concrete connectors live outside this crate; the binary only
        // ships the offline harness.
        error!("no providers wired; embed the library or pass --offline");
        return ExitCode::from(1);
    }
    let providers = offline_provider_set_for(&config.databases, config.max_results_per_db);
    let strict = config.gates.strict;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            ctrl_c_cancel.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config, providers);
    match orchestrator.run(cancel).await {
        Ok(result) => {
            info!(
                run_id = %result.run_id,
                status = %result.status,
                "run finished"
            );
            for warning in &result.warnings {
                info!("warning: {}", warning);
            }
            match result.status {
                RunStatus::Completed => ExitCode::SUCCESS,
                RunStatus::Failed if strict && gates_rejected(&result) => ExitCode::from(3),
                _ => ExitCode::from(2),
            }
        }
        Err(e) => {
            error!(error = %e, "run could not start");
            ExitCode::from(1)
        }
    }
}

fn gates_rejected(result: &revflow::RunResult) -> bool {
    result
        .failure
        .as_ref()
        .map_or(false, |f| f.message.contains("gate"))
}

fn print_plan() -> anyhow::Result<()> {
    let registry = standard_registry();
    let order = registry
        .execution_order()
        .context("phase registry is invalid")?;
    for name in order {
        let phase = registry
            .get(&name)
            .context("phase vanished from registry")?;
        let deps: Vec<String> = phase.dependencies.iter().cloned().collect();
        println!(
            "{:>2}. {:<28} deps: [{}]",
            phase.ordinal,
            phase.name,
            deps.join(", ")
        );
    }
    Ok(())
}

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use checkrun::checks::CheckRegistry;
use checkrun::config::Config;
use checkrun::coordinator::{Coordinator, RunRequest};
use checkrun::model::{CheckStatus, Run, RunDetail, RunStatus};

#[derive(Parser)]
#[command(
    name = "checkrun",
    about = "On-demand verification runs against a live deployment",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (coordinator + HTTP API)
    Serve {
        /// Bind address, overriding server.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a suite and wait for it to finish (Ctrl-C cancels)
    Run {
        /// Suite name: api, integration, security, performance,
        /// data-integrity, e2e, monitoring, accessibility or all
        suite: String,

        /// Run only this check from the suite
        #[arg(long)]
        check: Option<String>,

        /// Execute checks concurrently
        #[arg(long)]
        parallel: bool,

        /// Actor id recorded as the run's initiator
        #[arg(long, default_value = "0")]
        actor: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List suites and their checks
    Suites {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recent runs, newest first
    History {
        #[arg(long, default_value = "20")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one run with its results and log tail
    Show {
        /// Run id
        id: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref())?;
    checkrun::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting checkrun daemon");
            checkrun::serve(&config).await?;
        }
        Commands::Run {
            suite,
            check,
            parallel,
            actor,
            json,
        } => {
            let coordinator = Coordinator::from_config(&config)?;
            let run = coordinator.run_suite(RunRequest {
                suite,
                check,
                actor_id: actor,
                parallel,
            })?;
            tracing::info!(run_id = run.id, suite = %run.suite, "Run started");

            let finished = tokio::select! {
                done = coordinator.wait_for(run.id) => done?,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("Cancelling run {}...", run.id);
                    let outcome = coordinator.cancel_run(run.id).await;
                    tracing::info!(run_id = run.id, ?outcome, "Cancel finished");
                    coordinator.get_run_status(run.id)?
                }
            };

            let detail = coordinator.get_run_detail(finished.id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                print_detail(&detail);
            }

            if detail.run.status != RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Suites { json } => {
            let registry = CheckRegistry::builtin(&config, reqwest::Client::new());
            let suites = registry.suites();
            if json {
                println!("{}", serde_json::to_string_pretty(&suites)?);
            } else {
                for (category, checks) in suites {
                    println!("{} ({})", category, checks.len());
                    for check in checks {
                        println!("  {:<34} {}", check.name, check.description);
                    }
                }
                println!("all ({})", registry.len());
            }
        }
        Commands::History { limit, offset } => {
            let coordinator = Coordinator::from_config(&config)?;
            let runs = coordinator.list_runs(limit, offset)?;
            if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                println!(
                    "{:<6} | {:<15} | {:<10} | {:<25} | Passed/Failed/Skipped",
                    "ID", "Suite", "Status", "Started"
                );
                println!("{:-<6}-|-{:-<15}-|-{:-<10}-|-{:-<25}-|-{:-<21}", "", "", "", "", "");
                for run in runs {
                    print_run_row(&run);
                }
            }
        }
        Commands::Show { id, json } => {
            let coordinator = Coordinator::from_config(&config)?;
            let detail = coordinator.get_run_detail(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                print_detail(&detail);
            }
        }
    }

    Ok(())
}

fn print_run_row(run: &Run) {
    println!(
        "{:<6} | {:<15} | {:<10} | {:<25} | {}/{}/{}",
        run.id,
        run.suite,
        run.status.as_str(),
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        run.counts.passed,
        run.counts.failed,
        run.counts.skipped
    );
}

fn print_detail(detail: &RunDetail) {
    let run = &detail.run;
    println!("\n=== Run {} ({}) ===", run.id, run.correlation_id);
    println!("Suite:    {}", run.suite);
    println!("Status:   {}", run.status);
    if let Some(ms) = run.duration_ms {
        println!("Duration: {}ms", ms);
    }
    if let Some(outcome) = run.metadata.get("outcome").and_then(|v| v.as_str()) {
        println!("Outcome:  {}", outcome);
    }
    println!(
        "Checks:   {} total, {} passed, {} failed, {} skipped",
        run.counts.total, run.counts.passed, run.counts.failed, run.counts.skipped
    );

    if !detail.results.is_empty() {
        println!();
        println!("{:<34} | {:<6} | {:>8} | Details", "Check", "Status", "Time");
        println!("{:-<34}-|-{:-<6}-|-{:->8}-|-{:-<30}", "", "", "", "");
        for r in &detail.results {
            let status = match r.status {
                CheckStatus::Passed => "PASS",
                CheckStatus::Failed => "FAIL",
                CheckStatus::Skipped => "SKIP",
            };
            println!(
                "{:<34} | {:<6} | {:>6}ms | {}",
                r.check_name,
                status,
                r.duration_ms,
                r.error.as_deref().unwrap_or("")
            );
        }
    }
    println!();
}

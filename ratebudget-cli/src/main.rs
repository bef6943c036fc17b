//! Operator CLI over a ratebudget state file.
//!
//! Every invocation is a separate process; the state file's advisory lock keeps concurrent
//! invocations (and long-running services sharing the file) from losing updates.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ratebudget::{BudgetManager, BudgetTable, Decision, FileStateStore, RateLimitInfo};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Inspect and update a shared API request budget.
#[derive(Parser, Debug)]
#[command(name = "ratebudget")]
#[command(about = "Priority request budgets for a shared upstream API")]
#[command(version)]
struct Cli {
    /// Path to the persisted state file
    #[arg(long, env = "RATEBUDGET_STATE", default_value = "rate-budget.json")]
    state: PathBuf,

    /// Optional JSON budget table; built-in defaults when absent
    #[arg(long, env = "RATEBUDGET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current usage report
    Status,
    /// Ask whether a consumer may call upstream now (exit 0 live, 1 denied, 3 cache only)
    Check {
        consumer: String,
    },
    /// Count a successful upstream request
    Record {
        consumer: String,
        endpoint: String,
        /// Upstream-reported request count for its current window
        #[arg(long, requires = "limit")]
        count: Option<u32>,
        /// Upstream-reported limit for its current window
        #[arg(long, requires = "count")]
        limit: Option<u32>,
    },
    /// Count a failed upstream request
    Error,
    /// Block until burst spacing allows the next request
    Wait,
}

fn load_table(path: Option<&PathBuf>) -> Result<BudgetTable> {
    match path {
        Some(path) => BudgetTable::from_path(path)
            .with_context(|| format!("loading budget table from {}", path.display())),
        None => Ok(BudgetTable::default()),
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let table = load_table(cli.config.as_ref())?;
    let manager = BudgetManager::new(FileStateStore::new(&cli.state), table);
    tracing::debug!(state = %cli.state.display(), "Using state file");

    match cli.command {
        Command::Status => {
            print!("{}", manager.status()?);
        }
        Command::Check { consumer } => {
            let check = manager.check(&consumer)?;
            println!("{}", serde_json::to_string_pretty(&check)?);
            return Ok(match Decision::from(&check) {
                Decision::Allowed { .. } => ExitCode::SUCCESS,
                Decision::CacheOnly { .. } => ExitCode::from(3),
                Decision::Denied { .. } => ExitCode::from(1),
            });
        }
        Command::Record { consumer, endpoint, count, limit } => {
            let info = count.zip(limit).map(|(count, limit)| RateLimitInfo::from_counts(count, limit));
            manager.record_request(&consumer, &endpoint, info)?;
            println!("Recorded {endpoint} for {consumer}");
        }
        Command::Error => {
            if manager.record_error()? {
                println!("Circuit breaker tripped");
            } else {
                println!("Error recorded");
            }
        }
        Command::Wait => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .context("building runtime")?;
            runtime.block_on(manager.wait_for_burst())?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(4)
        }
    }
}

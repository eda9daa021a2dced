//! `epi_warehouse` — load the epidemiological datasets into the warehouse.
//!
//! # Usage
//!
//! ```text
//! epi_warehouse                      # same as `run`
//! epi_warehouse --config prod.toml run
//! epi_warehouse verify --json
//! epi_warehouse fetch
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use epi_warehouse::config::EtlConfig;
use epi_warehouse::ingest::download;
use epi_warehouse::logging;
use epi_warehouse::pipeline::Pipeline;
use epi_warehouse::verify;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "epi_warehouse", about = "Epidemiological warehouse ETL")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "etl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive the raw sources and load the warehouse (default).
    Run,
    /// Report which source countries have no canonical location.
    Verify {
        /// Print the report as JSON instead of a text summary.
        #[arg(long)]
        json: bool,
    },
    /// Download every source that has a `url` configured.
    Fetch,
}

fn main() -> ExitCode {
    logging::init_logging();
    let args = Args::parse();

    match dispatch(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(args: Args) -> Result<ExitCode> {
    let config = EtlConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config),
        Command::Verify { json } => {
            let report = verify::run_verification(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                verify::print_summary(&report);
            }
            verify::enforce(&report, config.validation)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Fetch => {
            let outcomes = download::fetch_all(&config)?;
            let failed = download::print_summary(&outcomes);
            Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

fn run(config: EtlConfig) -> Result<ExitCode> {
    let mut pipeline = Pipeline::from_config(config)?;
    match pipeline.run_postgres() {
        Ok(report) => {
            report.print_summary();
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            failure.report.print_summary();
            Err(failure).context("run aborted")
        }
    }
}

//! Multi-source Backup Tool
//!
//! Archives configured file trees and metrics snapshots into one tar.gz,
//! uploads it to S3-compatible object storage and reports the outcome.

// backuptool/src/main.rs
mod backup;
mod config;
mod errors;
mod metrics;
mod utils;

use anyhow::{Context, Result};
use backup::s3_upload::{self, S3ObjectStore};
use backup::RunResult;
use chrono::Local;
use clap::{CommandFactory, Parser};
use config::AppConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use utils::shutdown;

/// Exit status after printing usage with `--help`.
const HELP_EXIT_CODE: u8 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "File backup tool", long_about = None, disable_help_flag = true)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Show help text
    #[arg(short, long)]
    help: bool,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.help {
        let _ = Args::command().print_help();
        println!();
        return ExitCode::from(HELP_EXIT_CODE);
    }

    let app_config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&app_config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("❌ Error: failed to initialize logging: {:?}", e);
        return ExitCode::FAILURE;
    }

    let mut run = RunResult::default();
    if let Err(e) = run_app(&app_config, &mut run).await {
        run.abort();
        error!("❌ Error: {:#}", e);
    }

    // Fires on every path once configuration is loaded.
    metrics::report(&app_config.metrics, &run).await;

    if run.success {
        info!("✅ Backup completed successfully.");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn load_config(args: &Args) -> Result<AppConfig> {
    match &args.config {
        Some(path) => AppConfig::load_from_json(path),
        None => AppConfig::load_default(),
    }
}

async fn run_app(app_config: &AppConfig, run: &mut RunResult) -> Result<()> {
    let started_at = Local::now();
    let object_name = s3_upload::object_name(&app_config.upload, started_at)
        .context("Failed to compute archive name")?;
    info!(
        "🚀 Starting backup {} with {} sources",
        object_name,
        app_config.sources.len()
    );

    let store = S3ObjectStore::connect(&app_config.upload).await;

    backup::run_backup_flow(
        app_config,
        &store,
        &object_name,
        run,
        shutdown::wait_for_signal(),
    )
    .await
    .context("Backup process failed")
}

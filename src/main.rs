//! throng: staged virtual-user load generator for HTTP APIs.
//!
//! Ramps a population of virtual users through a stage plan, records every
//! request and judges the run against pass/fail thresholds.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Staged virtual-user HTTP load generator
#[derive(Parser)]
#[command(name = "throng")]
#[command(about = "Load test HTTP APIs with ramping virtual users and thresholds", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();
    cli.command.execute()
}

/// Logs go to stderr so stdout carries only the verdict report.
fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

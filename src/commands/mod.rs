//! `throng` CLI subcommands.
//!
//! Provides `run` (execute a load test) and `init` (generate starter config).

mod init;
mod run;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use std::process::ExitCode;

use throng::loadtest::config::Stage;
use throng::scenarios::BuiltinScenario;

/// Exit status when the run completed but a threshold failed.
pub const THRESHOLDS_FAILED: u8 = 99;

/// Load test commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test against an HTTP API
    ///
    /// Executes the stage plan and thresholds defined in .throng/loadtest.toml
    /// (or a custom config path) with one of the built-in scenarios, then
    /// prints the threshold verdicts. Exits with 99 if any threshold failed.
    Run {
        /// Base URL of the target API, e.g. http://localhost:8080
        url: String,

        /// Path to config file (default: auto-discover .throng/loadtest.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Workload to run
        #[arg(long, value_enum, default_value_t = BuiltinScenario::Auth)]
        scenario: BuiltinScenario,

        /// Replace the configured stage plan, e.g. `--stage 30s:10 --stage 1m:0`
        #[arg(long = "stage", value_parser = parse_stage)]
        stages: Vec<Stage>,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Generate a starter load test config file
    ///
    /// Creates .throng/loadtest.toml with the ramp 1m:500, 2m:1000, 1m:0 and
    /// the p(95)<50 / rate<0.0001 thresholds.
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

impl Command {
    /// Execute the selected subcommand.
    pub fn execute(self) -> Result<ExitCode> {
        match self {
            Command::Run {
                url,
                config,
                scenario,
                stages,
                no_color,
            } => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(run::execute_run(url, config, scenario, stages, no_color))
            },
            Command::Init { force } => {
                init::execute_init(force)?;
                Ok(ExitCode::SUCCESS)
            },
        }
    }
}

/// Parse a `<duration>:<target>` stage such as `30s:10` or `1m30s:500`.
fn parse_stage(value: &str) -> Result<Stage, String> {
    let (duration, target) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <duration>:<target>, got '{value}'"))?;
    let duration = humantime_serde::re::humantime::parse_duration(duration.trim())
        .map_err(|e| format!("invalid stage duration '{duration}': {e}"))?;
    let target = target
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid stage target '{target}': {e}"))?;
    Ok(Stage::new(duration, target))
}

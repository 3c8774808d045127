//! `throng run` command implementation.

use anyhow::Result;
use colored::Colorize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use throng::loadtest::config::{LoadTestConfig, Stage};
use throng::loadtest::engine::{LoadTestRunner, RunReport};
use throng::scenarios::BuiltinScenario;

use super::THRESHOLDS_FAILED;

/// Execute the `run` command.
///
/// Loads config (via explicit path or auto-discovery), applies CLI overrides,
/// runs the load test and prints the threshold verdicts.
pub async fn execute_run(
    url: String,
    config_path: Option<PathBuf>,
    scenario: BuiltinScenario,
    stages: Vec<Stage>,
    no_color: bool,
) -> Result<ExitCode> {
    let mut config = load_config(config_path, !stages.is_empty())?;
    apply_overrides(&mut config, stages);
    config.validate()?;

    let runner = LoadTestRunner::with_reqwest(config, scenario.build(&url))?.with_ctrl_c(true);
    tracing::info!(%url, ?scenario, "starting load test");
    let report = runner.run().await?;

    if no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    println!("{}", render_verdicts(&report));

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}

/// Resolve the config file. Without one, `--stage` flags alone are enough
/// to run with default settings.
fn load_config(config_path: Option<PathBuf>, has_stage_flags: bool) -> Result<LoadTestConfig> {
    let config_file = match config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: {}\nUse `throng init` to create one.",
                    path.display()
                );
            }
            path
        },
        None => match discover_config() {
            Some(path) => path,
            None if has_stage_flags => return Ok(LoadTestConfig::default()),
            None => {
                anyhow::bail!(
                    "No load test config found.\n\
                     Run `throng init` to create .throng/loadtest.toml,\n\
                     use `--config path/to/file.toml` to specify one,\n\
                     or pass the plan directly with `--stage 30s:10`."
                );
            },
        },
    };

    tracing::info!(path = %config_file.display(), "loading config");
    LoadTestConfig::load(&config_file)
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", config_file.display(), e))
}

/// Apply CLI flag overrides to a loaded config.
///
/// Any `--stage` flag replaces the whole configured plan.
fn apply_overrides(config: &mut LoadTestConfig, stages: Vec<Stage>) {
    if !stages.is_empty() {
        if !config.stage.is_empty() {
            tracing::warn!(
                configured = config.stage.len(),
                "--stage flags replace the configured stage plan"
            );
        }
        config.stage = stages;
    }
}

/// Discover `.throng/loadtest.toml` by walking parent directories.
///
/// Starts from the current working directory and walks up until either
/// the file is found or the filesystem root is reached.
fn discover_config() -> Option<PathBuf> {
    discover_config_from(&std::env::current_dir().ok()?)
}

fn discover_config_from(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(".throng").join("loadtest.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn render_verdicts(report: &RunReport) -> String {
    let summary = &report.summary;
    let mut out = String::new();

    out.push_str(&format!(
        "requests: {} ({} failed, {:.2}%)  iterations: {}  p(95): {:.2}ms  elapsed: {:.1}s  peak VUs: {}\n",
        summary.total_requests,
        summary.failed_requests,
        summary.error_rate * 100.0,
        summary.iterations,
        summary.duration.percentile(95.0),
        report.elapsed.as_secs_f64(),
        report.peak_vus,
    ));
    if let Some(reason) = &report.aborted {
        out.push_str(&format!("{} {reason}\n", "aborted:".yellow()));
    }

    for (name, verdict) in &report.verdicts {
        let mark = if verdict.is_pass() {
            "PASS".green()
        } else {
            "FAIL".red()
        };
        out.push_str(&format!("  {mark} {name}\n"));
    }

    let result = if report.passed() {
        "thresholds passed".green().bold()
    } else {
        "thresholds failed".red().bold()
    };
    out.push_str(&result.to_string());
    out
}

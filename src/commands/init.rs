//! `throng init` command implementation.

use anyhow::Result;

/// Execute the `init` command.
///
/// Creates `.throng/loadtest.toml` in the current directory.
pub fn execute_init(force: bool) -> Result<()> {
    let config_dir = std::env::current_dir()?.join(".throng");
    let config_path = config_dir.join("loadtest.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use `--force` to overwrite.",
            config_path.display()
        );
    }

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    std::fs::write(&config_path, generate_default_template())?;
    eprintln!("Created {}", config_path.display());
    eprintln!("Edit the file to customize the stage plan and thresholds.");

    Ok(())
}

fn generate_default_template() -> String {
    r#"# throng load test configuration
#
# Run with: throng run http://localhost:8080 --scenario auth
#
# The target URL is passed on the command line, not stored here.

[settings]
# Per-request timeout
timeout = "60s"
# Pause between iterations of the same virtual user
think_time = "1s"
# Uniform jitter around think_time (0s disables it)
think_time_jitter = "0s"
# How often the VU count is reconciled with the stage plan
tick_interval = "1s"
# Uncomment to enable coordinated omission correction
# expected_interval = "100ms"

# The VU target moves linearly from the previous stage's target to this one.
[[stage]]
duration = "1m"
target = 500

[[stage]]
duration = "2m"
target = 1000

[[stage]]
duration = "1m"
target = 0

[thresholds]
http_req_duration = ["p(95)<50"]
http_req_failed = ["rate<0.0001"]
# Long form stops the run as soon as the threshold fails:
# checks = [{ threshold = "rate>0.99", abort_on_fail = true }]
"#
    .to_string()
}

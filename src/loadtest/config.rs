//! TOML-based load test configuration.
//!
//! Defines typed structs for parsing a stage plan, execution settings and
//! named threshold expressions from TOML config files.
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! timeout = "10s"
//! think_time = "1s"
//!
//! [[stage]]
//! duration = "1m"
//! target = 500
//!
//! [[stage]]
//! duration = "2m"
//! target = 1000
//!
//! [[stage]]
//! duration = "1m"
//! target = 0
//!
//! [thresholds]
//! http_req_duration = ["p(95)<50"]
//! http_req_failed = [{ threshold = "rate<0.0001", abort_on_fail = true }]
//! ```
//!
//! Note: The target base URL is NOT part of the config file. It is provided
//! via the `url` CLI argument.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::threshold::{self, Threshold};

/// A load-shaping stage defining a target VU count and duration.
///
/// Stages are defined as `[[stage]]` blocks in the TOML config. The scheduler
/// linearly moves the VU target from the previous stage's `target` (0 for the
/// first stage) to this stage's `target` over `duration`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Length of this stage, e.g. `"30s"` or `"2m"`.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Target number of virtual users at the end of this stage.
    pub target: u32,
}

impl Stage {
    /// Convenience constructor used by tests and the CLI `--stage` override.
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Top-level load test configuration parsed from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoadTestConfig {
    /// General execution settings.
    #[serde(default)]
    pub settings: Settings,
    /// Load-shaping stages. An empty plan yields a run that completes immediately.
    ///
    /// The field name is `stage` (not `stages`) because TOML `[[stage]]`
    /// array-of-tables syntax creates a key called `stage`.
    #[serde(default)]
    pub stage: Vec<Stage>,
    /// Threshold expressions keyed by metric name (optionally with a
    /// `{name:tag}` filter), e.g. `http_req_duration = ["p(95)<50"]`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,
}

/// A single threshold entry: either a bare expression or the long form with
/// `abort_on_fail`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ThresholdSpec {
    /// `"p(95)<50"`
    Expression(String),
    /// `{ threshold = "p(95)<50", abort_on_fail = true }`
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

impl ThresholdSpec {
    /// The expression text regardless of form.
    pub fn expression(&self) -> &str {
        match self {
            Self::Expression(expr) => expr,
            Self::Detailed { threshold, .. } => threshold,
        }
    }

    /// Whether a failure of this threshold stops the run early.
    pub fn abort_on_fail(&self) -> bool {
        match self {
            Self::Expression(_) => false,
            Self::Detailed { abort_on_fail, .. } => *abort_on_fail,
        }
    }
}

/// General load test settings controlling execution parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Default per-request timeout. Every request is bounded by it unless the
    /// request carries its own.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause between two iterations of the same virtual user.
    #[serde(with = "humantime_serde")]
    pub think_time: Duration,
    /// Uniform jitter applied around `think_time` (`think_time +/- jitter`).
    #[serde(with = "humantime_serde")]
    pub think_time_jitter: Duration,
    /// How often the runner reconciles the live VU count with the stage plan.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Expected interval between consecutive requests from a single VU.
    ///
    /// When set, latencies are recorded with HdrHistogram's
    /// `record_correct()` for coordinated omission correction.
    #[serde(with = "humantime_serde")]
    pub expected_interval: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            think_time: Duration::from_secs(1),
            think_time_jitter: Duration::ZERO,
            tick_interval: Duration::from_secs(1),
            expected_interval: None,
        }
    }
}

impl LoadTestConfig {
    /// Parse a TOML string into a validated [`LoadTestConfig`].
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a [`LoadTestConfig`] from a file path.
    ///
    /// Returns [`LoadTestError::ConfigIo`] if the file cannot be read,
    /// [`LoadTestError::ConfigParse`] if the TOML is malformed, or
    /// [`LoadTestError::ConfigValidation`] / [`LoadTestError::Threshold`] if
    /// validation fails.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Returns the sum of all stage durations (zero if no stages), saturating
    /// at [`Duration::MAX`].
    pub fn total_duration(&self) -> Duration {
        self.stage
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration))
    }

    /// Parse every configured threshold expression.
    pub fn parsed_thresholds(&self) -> Result<Vec<Threshold>, LoadTestError> {
        let mut parsed = Vec::new();
        for (metric, specs) in &self.thresholds {
            for spec in specs {
                parsed.push(threshold::parse(
                    metric,
                    spec.expression(),
                    spec.abort_on_fail(),
                )?);
            }
        }
        Ok(parsed)
    }

    /// Validate that the config is semantically correct.
    ///
    /// Checks:
    /// - each stage has a positive duration
    /// - the stage durations add up without overflowing
    /// - the request timeout and tick interval are positive
    /// - every threshold expression parses and applies to its metric
    pub fn validate(&self) -> Result<(), LoadTestError> {
        for (i, stage) in self.stage.iter().enumerate() {
            if stage.duration.is_zero() {
                return Err(LoadTestError::ConfigValidation {
                    message: format!(
                        "Stage {} has a zero duration; each stage must have a positive duration",
                        i + 1
                    ),
                });
            }
        }

        let total = self
            .stage
            .iter()
            .try_fold(Duration::ZERO, |total, s| total.checked_add(s.duration));
        if total.is_none() {
            return Err(LoadTestError::ConfigValidation {
                message: "Total stage duration is too large".to_string(),
            });
        }

        if self.settings.timeout.is_zero() {
            return Err(LoadTestError::ConfigValidation {
                message: "settings.timeout must be greater than 0".to_string(),
            });
        }

        if self.settings.tick_interval.is_zero() {
            return Err(LoadTestError::ConfigValidation {
                message: "settings.tick_interval must be greater than 0".to_string(),
            });
        }

        if matches!(self.settings.expected_interval, Some(d) if d.is_zero()) {
            return Err(LoadTestError::ConfigValidation {
                message: "settings.expected_interval must be greater than 0 when set".to_string(),
            });
        }

        self.parsed_thresholds()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_auth_ramp_plan() {
        let toml_str = r#"
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
"#;
        let config = LoadTestConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.stage.len(), 3);
        assert_eq!(config.stage[0], Stage::new(Duration::from_secs(60), 500));
        assert_eq!(config.stage[1], Stage::new(Duration::from_secs(120), 1000));
        assert_eq!(config.stage[2], Stage::new(Duration::from_secs(60), 0));
        assert_eq!(config.total_duration(), Duration::from_secs(240));
        assert_eq!(config.parsed_thresholds().unwrap().len(), 2);
    }

    #[test]
    fn test_settings_defaults_when_table_missing() {
        let config = LoadTestConfig::from_toml("").unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.think_time, Duration::from_secs(1));
        assert_eq!(config.settings.timeout, Duration::from_secs(60));
        assert!(config.stage.is_empty());
        assert!(config.thresholds.is_empty());
    }

    #[test]
    fn test_parse_custom_settings() {
        let toml_str = r#"
[settings]
timeout = "5s"
think_time = "500ms"
think_time_jitter = "100ms"
tick_interval = "250ms"
expected_interval = "100ms"
"#;
        let config = LoadTestConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.settings.timeout, Duration::from_secs(5));
        assert_eq!(config.settings.think_time, Duration::from_millis(500));
        assert_eq!(config.settings.think_time_jitter, Duration::from_millis(100));
        assert_eq!(config.settings.tick_interval, Duration::from_millis(250));
        assert_eq!(
            config.settings.expected_interval,
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_parse_detailed_threshold_form() {
        let toml_str = r#"
[thresholds]
http_req_failed = [{ threshold = "rate<0.01", abort_on_fail = true }, "count<10"]
"#;
        let config = LoadTestConfig::from_toml(toml_str).unwrap();
        let specs = &config.thresholds["http_req_failed"];
        assert_eq!(specs.len(), 2);
        assert!(specs[0].abort_on_fail());
        assert_eq!(specs[0].expression(), "rate<0.01");
        assert!(!specs[1].abort_on_fail());
        assert_eq!(specs[1].expression(), "count<10");
    }

    #[test]
    fn test_validate_stage_with_zero_duration_fails() {
        let config = LoadTestConfig {
            stage: vec![
                Stage::new(Duration::from_secs(30), 10),
                Stage::new(Duration::ZERO, 20),
            ],
            ..Default::default()
        };
        let result = config.validate();
        let err_msg = format!("{}", result.unwrap_err());
        assert!(
            err_msg.contains("Stage 2"),
            "Error should name the offending stage: {err_msg}"
        );
    }

    #[test]
    fn test_validate_overflowing_stage_total_fails() {
        let toml_str = r#"
[[stage]]
duration = "300000000000y"
target = 1

[[stage]]
duration = "300000000000y"
target = 1
"#;
        let err = LoadTestConfig::from_toml(toml_str).unwrap_err();
        assert!(
            matches!(err, LoadTestError::ConfigValidation { ref message } if message.contains("too large")),
            "unexpected error: {err}"
        );

        let config = LoadTestConfig {
            stage: vec![Stage::new(Duration::MAX, 1), Stage::new(Duration::MAX, 1)],
            ..Default::default()
        };
        assert_eq!(config.total_duration(), Duration::MAX);
    }

    #[test]
    fn test_validate_zero_timeout_fails() {
        let mut config = LoadTestConfig::default();
        config.settings.timeout = Duration::ZERO;
        assert!(matches!(
            config.validate().unwrap_err(),
            LoadTestError::ConfigValidation { .. }
        ));
    }

    #[test]
    fn test_validate_malformed_threshold_fails() {
        let toml_str = r#"
[thresholds]
http_req_duration = ["p95 under 50"]
"#;
        let result = LoadTestConfig::from_toml(toml_str);
        assert!(matches!(
            result.unwrap_err(),
            LoadTestError::Threshold { .. }
        ));
    }

    #[test]
    fn test_invalid_duration_string_is_parse_error() {
        let toml_str = r#"
[[stage]]
duration = "soon"
target = 1
"#;
        assert!(matches!(
            LoadTestConfig::from_toml(toml_str).unwrap_err(),
            LoadTestError::ConfigParse { .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let toml_content = r#"
[[stage]]
duration = "10s"
target = 5
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        tmpfile.write_all(toml_content.as_bytes()).unwrap();
        tmpfile.flush().unwrap();

        let config = LoadTestConfig::load(tmpfile.path()).unwrap();
        assert_eq!(config.stage.len(), 1);
        assert_eq!(config.stage[0].target, 5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = LoadTestConfig::load(Path::new("/nonexistent/path.toml"));
        assert!(matches!(
            result.unwrap_err(),
            LoadTestError::ConfigIo { .. }
        ));
    }

    #[test]
    fn test_total_duration_empty_plan() {
        assert_eq!(LoadTestConfig::default().total_duration(), Duration::ZERO);
    }
}

//! Pass/fail thresholds over a [`RunSummary`].
//!
//! Thresholds use the k6 expression grammar: a metric key, optionally
//! filtered by request tag, mapped to expressions such as `p(95)<50` or
//! `rate<0.0001`.
//!
//! | Metric               | Kind    | Aggregations                    |
//! |----------------------|---------|---------------------------------|
//! | `http_req_duration`  | trend   | `p(N)` `avg` `min` `max` `med`  |
//! | `iteration_duration` | trend   | `p(N)` `avg` `min` `max` `med`  |
//! | `http_req_failed`    | rate    | `rate` `count`                  |
//! | `http_req_timeouts`  | rate    | `rate` `count`                  |
//! | `checks`             | rate    | `rate` `count`                  |
//! | `http_reqs`          | counter | `count` `rate` (per second)     |
//! | `iterations`         | counter | `count` `rate` (per second)     |
//!
//! Request metrics accept a `{name:<tag>}` filter, e.g.
//! `http_req_duration{name:auth}`. Durations are in milliseconds.
//!
//! Evaluation is pure. With no samples every aggregation resolves to 0, so
//! an idle run passes `p(95)<50` and fails `count>0`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{LatencyStats, RunSummary};

static METRIC_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([a-z_]+)\s*(?:\{\s*name\s*:\s*([^}]+?)\s*\})?\s*$").expect("valid regex")
});

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(p\(\s*(\d+(?:\.\d+)?)\s*\)|avg|min|max|med|rate|count)\s*(<=|>=|==|!=|<|>)\s*(-?\d+(?:\.\d+)?)\s*$",
    )
    .expect("valid regex")
});

/// Metrics that thresholds can inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Request round-trip time.
    HttpReqDuration,
    /// Failed-request rate.
    HttpReqFailed,
    /// Share of requests that hit the request timeout.
    HttpReqTimeouts,
    /// Request counter.
    HttpReqs,
    /// Completed-iteration counter.
    Iterations,
    /// Scenario iteration time.
    IterationDuration,
    /// Check pass rate.
    Checks,
}

impl Metric {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "http_req_duration" => Self::HttpReqDuration,
            "http_req_failed" => Self::HttpReqFailed,
            "http_req_timeouts" => Self::HttpReqTimeouts,
            "http_reqs" => Self::HttpReqs,
            "iterations" => Self::Iterations,
            "iteration_duration" => Self::IterationDuration,
            "checks" => Self::Checks,
            _ => return None,
        })
    }

    fn accepts_tag(self) -> bool {
        matches!(
            self,
            Self::HttpReqDuration | Self::HttpReqFailed | Self::HttpReqs
        )
    }

    fn accepts(self, aggregation: Aggregation) -> bool {
        use Aggregation as A;
        match self {
            Self::HttpReqDuration | Self::IterationDuration => matches!(
                aggregation,
                A::Percentile(_) | A::Avg | A::Min | A::Max | A::Med
            ),
            Self::HttpReqFailed
            | Self::HttpReqTimeouts
            | Self::Checks
            | Self::HttpReqs
            | Self::Iterations => matches!(aggregation, A::Rate | A::Count),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HttpReqDuration => "http_req_duration",
            Self::HttpReqFailed => "http_req_failed",
            Self::HttpReqTimeouts => "http_req_timeouts",
            Self::HttpReqs => "http_reqs",
            Self::Iterations => "iterations",
            Self::IterationDuration => "iteration_duration",
            Self::Checks => "checks",
        };
        f.write_str(s)
    }
}

/// How a metric is reduced to one number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// `p(N)` with N in 0..=100.
    Percentile(f64),
    /// `avg`
    Avg,
    /// `min`
    Min,
    /// `max`
    Max,
    /// `med`
    Med,
    /// `rate`
    Rate,
    /// `count`
    Count,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl Comparison {
    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            _ => return None,
        })
    }

    /// Returns `true` if `observed <op> limit` holds.
    pub fn holds(self, observed: f64, limit: f64) -> bool {
        match self {
            Self::Lt => observed < limit,
            Self::Le => observed <= limit,
            Self::Gt => observed > limit,
            Self::Ge => observed >= limit,
            Self::Eq => observed == limit,
            Self::Ne => observed != limit,
        }
    }
}

/// A parsed threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Display name: `"<metric key>: <expression>"`.
    pub name: String,
    /// Metric inspected.
    pub metric: Metric,
    /// Request tag filter from `{name:<tag>}`.
    pub tag: Option<String>,
    /// Reduction applied to the metric.
    pub aggregation: Aggregation,
    /// Operator.
    pub comparison: Comparison,
    /// Right-hand side.
    pub value: f64,
    /// Stop the run as soon as this threshold fails.
    pub abort_on_fail: bool,
}

/// Outcome of evaluating one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The comparison held.
    Pass,
    /// The comparison did not hold.
    Fail,
}

impl Verdict {
    /// Returns `true` for [`Verdict::Pass`].
    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        })
    }
}

/// Parse `expression` for the metric key `metric_key`.
///
/// Fails with [`LoadTestError::Threshold`] for unknown metrics, malformed
/// expressions, aggregations that don't apply to the metric, tag filters on
/// metrics that aren't per-request, and percentiles outside 0..=100.
pub fn parse(
    metric_key: &str,
    expression: &str,
    abort_on_fail: bool,
) -> Result<Threshold, LoadTestError> {
    let invalid = |message: String| LoadTestError::Threshold {
        metric: metric_key.to_string(),
        expression: expression.to_string(),
        message,
    };

    let key = METRIC_KEY
        .captures(metric_key)
        .ok_or_else(|| invalid("metric must look like `name` or `name{name:tag}`".into()))?;
    let metric = Metric::from_name(&key[1])
        .ok_or_else(|| invalid(format!("unknown metric '{}'", &key[1])))?;
    let tag = key.get(2).map(|m| m.as_str().to_string());
    if tag.is_some() && !metric.accepts_tag() {
        return Err(invalid(format!("metric '{metric}' does not support a name filter")));
    }

    let expr = EXPRESSION.captures(expression).ok_or_else(|| {
        invalid("expected `<aggregation> <operator> <number>`, e.g. `p(95)<50`".into())
    })?;

    let aggregation = match &expr[1] {
        "avg" => Aggregation::Avg,
        "min" => Aggregation::Min,
        "max" => Aggregation::Max,
        "med" => Aggregation::Med,
        "rate" => Aggregation::Rate,
        "count" => Aggregation::Count,
        _ => {
            let p: f64 = expr[2]
                .parse()
                .map_err(|_| invalid("percentile is not a number".into()))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(invalid(format!("percentile {p} is outside 0..=100")));
            }
            Aggregation::Percentile(p)
        },
    };
    if !metric.accepts(aggregation) {
        return Err(invalid(format!(
            "aggregation '{}' does not apply to metric '{metric}'",
            &expr[1]
        )));
    }

    let comparison = Comparison::from_symbol(&expr[3])
        .ok_or_else(|| invalid(format!("unknown operator '{}'", &expr[3])))?;
    let value: f64 = expr[4]
        .parse()
        .map_err(|_| invalid(format!("'{}' is not a number", &expr[4])))?;

    Ok(Threshold {
        name: format!("{}: {}", metric_key.trim(), expression.trim()),
        metric,
        tag,
        aggregation,
        comparison,
        value,
        abort_on_fail,
    })
}

fn trend_value(stats: &LatencyStats, aggregation: Aggregation) -> f64 {
    match aggregation {
        Aggregation::Percentile(p) => stats.percentile(p),
        Aggregation::Avg => stats.mean(),
        Aggregation::Min => stats.min(),
        Aggregation::Max => stats.max(),
        Aggregation::Med => stats.med(),
        Aggregation::Rate | Aggregation::Count => stats.count() as f64,
    }
}

/// The number `threshold` compares against its limit.
pub fn observed_value(summary: &RunSummary, threshold: &Threshold) -> f64 {
    let endpoint = threshold
        .tag
        .as_deref()
        .map(|tag| summary.endpoint(tag));
    let is_count = threshold.aggregation == Aggregation::Count;

    match threshold.metric {
        Metric::HttpReqDuration => match endpoint {
            Some(Some(e)) => trend_value(&e.duration, threshold.aggregation),
            Some(None) => 0.0,
            None => trend_value(&summary.duration, threshold.aggregation),
        },
        Metric::IterationDuration => trend_value(&summary.iteration_duration, threshold.aggregation),
        Metric::HttpReqFailed => {
            let (failed, rate) = match endpoint {
                Some(Some(e)) => (e.failed_requests, e.error_rate()),
                Some(None) => (0, 0.0),
                None => (summary.failed_requests, summary.error_rate),
            };
            if is_count {
                failed as f64
            } else {
                rate
            }
        },
        Metric::HttpReqTimeouts => {
            let timeouts = summary.error_categories.get("timeout").copied().unwrap_or(0);
            if is_count {
                timeouts as f64
            } else if summary.total_requests == 0 {
                0.0
            } else {
                timeouts as f64 / summary.total_requests as f64
            }
        },
        Metric::HttpReqs => {
            let total = match endpoint {
                Some(Some(e)) => e.total_requests,
                Some(None) => 0,
                None => summary.total_requests,
            };
            if is_count {
                total as f64
            } else {
                summary.per_second(total)
            }
        },
        Metric::Iterations => {
            if is_count {
                summary.iterations as f64
            } else {
                summary.iteration_rate()
            }
        },
        Metric::Checks => {
            let (passes, fails) = summary.check_totals();
            if is_count {
                passes as f64
            } else if passes + fails == 0 {
                0.0
            } else {
                passes as f64 / (passes + fails) as f64
            }
        },
    }
}

/// Evaluate one threshold.
pub fn verdict(summary: &RunSummary, threshold: &Threshold) -> Verdict {
    let observed = observed_value(summary, threshold);
    if threshold.comparison.holds(observed, threshold.value) {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

/// Evaluate every threshold against `summary`, keyed by threshold name.
pub fn evaluate(summary: &RunSummary, thresholds: &[Threshold]) -> BTreeMap<String, Verdict> {
    thresholds
        .iter()
        .map(|t| (t.name.clone(), verdict(summary, t)))
        .collect()
}

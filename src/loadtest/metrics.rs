//! HdrHistogram-based metrics pipeline.
//!
//! [`MetricsRecorder`] is a single-owner accumulator. Each virtual user keeps
//! its own recorder for the iteration in flight and merges it into the shared
//! [`MetricsAggregator`] at the iteration boundary, so the aggregator lock is
//! taken once per iteration rather than once per request.
//!
//! Latencies are stored in microseconds with 3 significant figures; all
//! values exposed through [`LatencyStats`] are milliseconds.
//!
//! A request counts as failed when it never produced a status (network error,
//! timeout) or when its status is 400 or above. Failed requests still
//! contribute to the all-requests duration histogram; a separate
//! success-only histogram is kept alongside it.

use std::collections::BTreeMap;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::loadtest::error::RequestError;

/// Record of one completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    /// Tag from [`Request::name`](crate::loadtest::executor::Request::name).
    pub name: Option<String>,
    /// When the request was started.
    pub timestamp: Instant,
    /// Round-trip time.
    pub duration: Duration,
    /// HTTP status, or the reason no status was received.
    pub result: Result<u16, RequestError>,
    /// Response body size in bytes.
    pub bytes: u64,
}

impl RequestOutcome {
    /// An outcome for a request that received a response.
    pub fn response(
        name: Option<String>,
        timestamp: Instant,
        duration: Duration,
        status: u16,
        bytes: u64,
    ) -> Self {
        Self {
            name,
            timestamp,
            duration,
            result: Ok(status),
            bytes,
        }
    }

    /// An outcome for a request that failed before a response arrived.
    pub fn error(
        name: Option<String>,
        timestamp: Instant,
        duration: Duration,
        err: RequestError,
    ) -> Self {
        Self {
            name,
            timestamp,
            duration,
            result: Err(err),
            bytes: 0,
        }
    }

    /// Synthetic outcome for a scenario that returned an error or panicked.
    pub fn scenario_error(message: impl Into<String>) -> Self {
        Self::error(
            None,
            Instant::now(),
            Duration::ZERO,
            RequestError::Scenario {
                message: message.into(),
            },
        )
    }

    /// HTTP status if one was received.
    pub fn status(&self) -> Option<u16> {
        self.result.as_ref().ok().copied()
    }

    /// Returns `true` for transport errors and statuses >= 400.
    pub fn is_failure(&self) -> bool {
        match self.result {
            Ok(status) => status >= 400,
            Err(_) => true,
        }
    }

    /// Failure category: the [`RequestError`] category, or `"http"` for an
    /// error status. `None` for successful requests.
    pub fn error_category(&self) -> Option<&'static str> {
        match &self.result {
            Ok(status) if *status >= 400 => Some("http"),
            Ok(_) => None,
            Err(err) => Some(err.error_category()),
        }
    }

    fn is_scenario_error(&self) -> bool {
        matches!(self.result, Err(RequestError::Scenario { .. }))
    }
}

fn new_histogram() -> Histogram<u64> {
    let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
    histogram.auto(true);
    histogram
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Latency distribution. All accessors return milliseconds, 0.0 when empty.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    histogram: Histogram<u64>,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            histogram: new_histogram(),
        }
    }
}

impl LatencyStats {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        Self {
            histogram: histogram.clone(),
        }
    }

    /// Number of recorded values, including coordinated-omission fill-ins.
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Value at percentile `p` (0..=100).
    pub fn percentile(&self, p: f64) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        self.histogram.value_at_quantile(quantile) as f64 / 1000.0
    }

    /// Median.
    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }

    /// Smallest recorded value.
    pub fn min(&self) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        self.histogram.min() as f64 / 1000.0
    }

    /// Largest recorded value.
    pub fn max(&self) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        self.histogram.max() as f64 / 1000.0
    }

    /// Arithmetic mean.
    pub fn mean(&self) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        self.histogram.mean() / 1000.0
    }
}

/// Pass/fail tally of one named check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    /// Check name, e.g. `"status is 200"`.
    pub name: String,
    /// Times the check held.
    pub passes: u64,
    /// Times the check did not hold.
    pub fails: u64,
}

impl CheckSummary {
    /// Fraction of evaluations that passed (0.0 when never evaluated).
    pub fn pass_rate(&self) -> f64 {
        let total = self.passes + self.fails;
        if total == 0 {
            return 0.0;
        }
        self.passes as f64 / total as f64
    }
}

/// Request metrics for one `name` tag.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSummary {
    /// The request tag.
    pub name: String,
    /// Requests carrying this tag.
    pub total_requests: u64,
    /// Failed requests carrying this tag.
    pub failed_requests: u64,
    /// Duration distribution for this tag.
    pub duration: LatencyStats,
}

impl EndpointSummary {
    /// `failed_requests / total_requests`, or 0.0 when empty.
    pub fn error_rate(&self) -> f64 {
        ratio(self.failed_requests, self.total_requests)
    }
}

/// Point-in-time copy of all aggregated metrics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    /// Requests recorded, successful or not.
    pub total_requests: u64,
    /// Requests that errored or returned a status >= 400.
    pub failed_requests: u64,
    /// `failed_requests / total_requests`, 0.0 when no request was made.
    pub error_rate: f64,
    /// Duration of every request that reached the network.
    pub duration: LatencyStats,
    /// Duration of successful requests only.
    pub success_duration: LatencyStats,
    /// Sum of response body sizes.
    pub bytes_received: u64,
    /// Responses by HTTP status.
    pub status_counts: BTreeMap<u16, u64>,
    /// Failures by category (`network`, `timeout`, `scenario`, `http`).
    pub error_categories: BTreeMap<String, u64>,
    /// Completed scenario iterations.
    pub iterations: u64,
    /// Scenario iteration durations, think time excluded.
    pub iteration_duration: LatencyStats,
    /// Check tallies, sorted by name.
    pub checks: Vec<CheckSummary>,
    /// Per-tag request metrics, sorted by name.
    pub per_endpoint: Vec<EndpointSummary>,
    /// Time from the start of the run to the latest recorded activity, or
    /// to the end of the run once stopped.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Requests per second over `elapsed`.
    pub fn request_rate(&self) -> f64 {
        self.per_second(self.total_requests)
    }

    /// Iterations per second over `elapsed`.
    pub fn iteration_rate(&self) -> f64 {
        self.per_second(self.iterations)
    }

    /// `count` spread over `elapsed`, 0.0 before any time has passed.
    pub fn per_second(&self, count: u64) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        count as f64 / secs
    }

    /// Metrics for the requests tagged `name`.
    pub fn endpoint(&self, name: &str) -> Option<&EndpointSummary> {
        self.per_endpoint.iter().find(|e| e.name == name)
    }

    /// Total passes and fails across every check.
    pub fn check_totals(&self) -> (u64, u64) {
        self.checks
            .iter()
            .fold((0, 0), |(p, f), c| (p + c.passes, f + c.fails))
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64
}

struct EndpointMetrics {
    duration: Histogram<u64>,
    total: u64,
    failed: u64,
}

impl EndpointMetrics {
    fn new() -> Self {
        Self {
            duration: new_histogram(),
            total: 0,
            failed: 0,
        }
    }
}

/// Single-owner metrics accumulator.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use throng::loadtest::metrics::{MetricsRecorder, RequestOutcome};
///
/// let mut recorder = MetricsRecorder::new(None);
/// let outcome = RequestOutcome::response(
///     None,
///     tokio::time::Instant::now(),
///     Duration::from_millis(42),
///     200,
///     128,
/// );
/// recorder.record(&outcome);
///
/// let summary = recorder.summary(Duration::from_secs(1));
/// assert_eq!(summary.total_requests, 1);
/// assert!((summary.duration.med() - 42.0).abs() < 0.1);
/// ```
pub struct MetricsRecorder {
    duration: Histogram<u64>,
    success_duration: Histogram<u64>,
    iteration_duration: Histogram<u64>,
    /// Expected interval in microseconds for `record_correct()`.
    expected_interval_us: Option<u64>,
    total_requests: u64,
    failed_requests: u64,
    bytes_received: u64,
    status_counts: BTreeMap<u16, u64>,
    error_categories: BTreeMap<String, u64>,
    iterations: u64,
    checks: BTreeMap<String, (u64, u64)>,
    per_endpoint: BTreeMap<String, EndpointMetrics>,
}

impl MetricsRecorder {
    /// Creates an empty recorder.
    ///
    /// With `expected_interval` set, durations longer than the interval are
    /// recorded with coordinated omission correction.
    pub fn new(expected_interval: Option<Duration>) -> Self {
        Self {
            duration: new_histogram(),
            success_duration: new_histogram(),
            iteration_duration: new_histogram(),
            expected_interval_us: expected_interval.map(micros).filter(|us| *us > 0),
            total_requests: 0,
            failed_requests: 0,
            bytes_received: 0,
            status_counts: BTreeMap::new(),
            error_categories: BTreeMap::new(),
            iterations: 0,
            checks: BTreeMap::new(),
            per_endpoint: BTreeMap::new(),
        }
    }

    fn record_latency(histogram: &mut Histogram<u64>, value: u64, expected: Option<u64>) {
        let _ = match expected {
            Some(interval) => histogram.record_correct(value, interval),
            None => histogram.record(value),
        };
    }

    /// Record one request outcome.
    ///
    /// Scenario errors count as failed requests but carry no latency.
    pub fn record(&mut self, outcome: &RequestOutcome) {
        self.total_requests += 1;
        let failed = outcome.is_failure();
        if failed {
            self.failed_requests += 1;
        }
        if let Some(category) = outcome.error_category() {
            *self
                .error_categories
                .entry(category.to_owned())
                .or_insert(0) += 1;
        }
        if let Ok(status) = outcome.result {
            *self.status_counts.entry(status).or_insert(0) += 1;
            self.bytes_received += outcome.bytes;
        }

        if outcome.is_scenario_error() {
            return;
        }

        let us = micros(outcome.duration);
        let expected = self.expected_interval_us;
        Self::record_latency(&mut self.duration, us, expected);
        if !failed {
            Self::record_latency(&mut self.success_duration, us, expected);
        }

        if let Some(ref name) = outcome.name {
            let endpoint = self
                .per_endpoint
                .entry(name.clone())
                .or_insert_with(EndpointMetrics::new);
            Self::record_latency(&mut endpoint.duration, us, expected);
            endpoint.total += 1;
            if failed {
                endpoint.failed += 1;
            }
        }
    }

    /// Record one evaluation of a named check.
    pub fn record_check(&mut self, name: &str, passed: bool) {
        let entry = self.checks.entry(name.to_owned()).or_insert((0, 0));
        if passed {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    /// Record one completed scenario iteration.
    pub fn record_iteration(&mut self, duration: Duration) {
        self.iterations += 1;
        let _ = self.iteration_duration.record(micros(duration));
    }

    /// Requests recorded so far (logical count, one per `record()` call).
    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Failed requests recorded so far.
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests
    }

    /// Returns `true` if nothing has been recorded since creation or the last
    /// merge.
    pub fn is_empty(&self) -> bool {
        self.total_requests == 0 && self.iterations == 0 && self.checks.is_empty()
    }

    /// Move everything recorded in `other` into `self`, leaving `other` empty.
    pub fn merge_from(&mut self, other: &mut MetricsRecorder) {
        let _ = self.duration.add(&other.duration);
        let _ = self.success_duration.add(&other.success_duration);
        let _ = self.iteration_duration.add(&other.iteration_duration);
        self.total_requests += other.total_requests;
        self.failed_requests += other.failed_requests;
        self.bytes_received += other.bytes_received;
        self.iterations += other.iterations;

        for (status, count) in &other.status_counts {
            *self.status_counts.entry(*status).or_insert(0) += count;
        }
        for (category, count) in &other.error_categories {
            *self.error_categories.entry(category.clone()).or_insert(0) += count;
        }
        for (name, (passes, fails)) in &other.checks {
            let entry = self.checks.entry(name.clone()).or_insert((0, 0));
            entry.0 += passes;
            entry.1 += fails;
        }
        for (name, theirs) in &other.per_endpoint {
            let ours = self
                .per_endpoint
                .entry(name.clone())
                .or_insert_with(EndpointMetrics::new);
            let _ = ours.duration.add(&theirs.duration);
            ours.total += theirs.total;
            ours.failed += theirs.failed;
        }

        other.clear();
    }

    fn clear(&mut self) {
        self.duration.reset();
        self.success_duration.reset();
        self.iteration_duration.reset();
        self.total_requests = 0;
        self.failed_requests = 0;
        self.bytes_received = 0;
        self.iterations = 0;
        self.status_counts.clear();
        self.error_categories.clear();
        self.checks.clear();
        self.per_endpoint.clear();
    }

    /// Copy the current state into a [`RunSummary`].
    pub fn summary(&self, elapsed: Duration) -> RunSummary {
        let checks = self
            .checks
            .iter()
            .map(|(name, (passes, fails))| CheckSummary {
                name: name.clone(),
                passes: *passes,
                fails: *fails,
            })
            .collect();

        // BTreeMap iteration keeps this sorted by tag name.
        let per_endpoint = self
            .per_endpoint
            .iter()
            .map(|(name, endpoint)| EndpointSummary {
                name: name.clone(),
                total_requests: endpoint.total,
                failed_requests: endpoint.failed,
                duration: LatencyStats::from_histogram(&endpoint.duration),
            })
            .collect();

        RunSummary {
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            error_rate: ratio(self.failed_requests, self.total_requests),
            duration: LatencyStats::from_histogram(&self.duration),
            success_duration: LatencyStats::from_histogram(&self.success_duration),
            bytes_received: self.bytes_received,
            status_counts: self.status_counts.clone(),
            error_categories: self.error_categories.clone(),
            iterations: self.iterations,
            iteration_duration: LatencyStats::from_histogram(&self.iteration_duration),
            checks,
            per_endpoint,
            elapsed,
        }
    }
}

struct AggregatorState {
    recorder: MetricsRecorder,
    started: Option<Instant>,
    /// Last record or merge while running.
    touched: Option<Instant>,
    stopped: Option<Instant>,
}

impl AggregatorState {
    fn touch(&mut self) {
        if self.started.is_some() && self.stopped.is_none() {
            self.touched = Some(Instant::now());
        }
    }
}

/// Thread-safe aggregator shared by every virtual user of a run.
///
/// `elapsed` only advances when something is recorded, so two snapshots
/// with nothing recorded in between are equal.
pub struct MetricsAggregator {
    state: Mutex<AggregatorState>,
}

impl MetricsAggregator {
    /// Creates an empty aggregator.
    pub fn new(expected_interval: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(AggregatorState {
                recorder: MetricsRecorder::new(expected_interval),
                started: None,
                touched: None,
                stopped: None,
            }),
        }
    }

    /// Marks the start of the run; `elapsed` is measured from here.
    pub fn start(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.started = Some(now);
        state.touched = Some(now);
        state.stopped = None;
    }

    /// Freezes `elapsed` at the current time.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.started.is_some() && state.stopped.is_none() {
            state.stopped = Some(Instant::now());
        }
    }

    /// Record a single outcome directly.
    pub fn record(&self, outcome: &RequestOutcome) {
        let mut state = self.state.lock();
        state.recorder.record(outcome);
        state.touch();
    }

    /// Record a check evaluation directly.
    pub fn record_check(&self, name: &str, passed: bool) {
        let mut state = self.state.lock();
        state.recorder.record_check(name, passed);
        state.touch();
    }

    /// Record a completed iteration directly.
    pub fn record_iteration(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.recorder.record_iteration(duration);
        state.touch();
    }

    /// Drain a worker-local recorder into the shared one.
    pub fn merge(&self, local: &mut MetricsRecorder) {
        if local.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.recorder.merge_from(local);
        state.touch();
    }

    /// Consistent copy of everything recorded so far.
    pub fn snapshot(&self) -> RunSummary {
        let state = self.state.lock();
        let elapsed = match (state.started, state.stopped.or(state.touched)) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        };
        state.recorder.summary(elapsed)
    }
}

//! Load test runner: lifecycle, stage scheduling and graceful shutdown.
//!
//! [`LoadTestRunner`] is the top-level orchestrator that:
//! - Reconciles the live VU count with the [`StageScheduler`] target on every
//!   tick, spawning VU tasks via [`tokio_util::task::TaskTracker`]
//! - Shares one [`MetricsAggregator`] with every VU
//! - Publishes its [`RunState`] through a watch channel
//! - Drains on completion, external abort, Ctrl+C or a failed
//!   `abort_on_fail` threshold, then evaluates thresholds on the final
//!   snapshot
//!
//! The lifecycle is `Idle -> Ramping -> Draining -> Completed`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::executor::RequestExecutor;
use crate::loadtest::metrics::{MetricsAggregator, RunSummary};
use crate::loadtest::scenario::Scenario;
use crate::loadtest::scheduler::{StageScheduler, VuPool};
use crate::loadtest::threshold::{self, Threshold, Verdict};
use crate::loadtest::vu::{vu_loop, ActiveVuCounter, VuShared};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, not started.
    Idle,
    /// Following the stage plan.
    Ramping,
    /// Waiting for in-flight iterations to finish.
    Draining,
    /// Final report produced.
    Completed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Ramping => "ramping",
            Self::Draining => "draining",
            Self::Completed => "completed",
        })
    }
}

/// Why a run stopped before the end of its stage plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The abort handle was cancelled or Ctrl+C was received.
    Interrupted,
    /// The named `abort_on_fail` threshold failed.
    Threshold(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => f.write_str("interrupted"),
            Self::Threshold(name) => write!(f, "threshold '{name}' failed"),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final metrics snapshot.
    pub summary: RunSummary,
    /// Verdict per threshold name.
    pub verdicts: BTreeMap<String, Verdict>,
    /// Wall-clock run time, drain included.
    pub elapsed: Duration,
    /// Set when the run stopped early.
    pub aborted: Option<AbortReason>,
    /// Highest number of VUs alive at once.
    pub peak_vus: u32,
}

impl RunReport {
    /// Returns `true` if every threshold passed (vacuously with none).
    pub fn passed(&self) -> bool {
        self.verdicts.values().all(|v| v.is_pass())
    }

    /// Names of the thresholds that failed.
    pub fn failed_thresholds(&self) -> Vec<&str> {
        self.verdicts
            .iter()
            .filter(|(_, v)| !v.is_pass())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Drives one load test from a validated configuration.
pub struct LoadTestRunner {
    config: LoadTestConfig,
    thresholds: Vec<Threshold>,
    scenario: Arc<dyn Scenario>,
    executor: Arc<RequestExecutor>,
    aggregator: Arc<MetricsAggregator>,
    abort: CancellationToken,
    state_tx: watch::Sender<RunState>,
    ctrl_c: bool,
}

impl LoadTestRunner {
    /// Validates `config` and parses its thresholds.
    ///
    /// Fails with a configuration error before anything is spawned.
    pub fn new(
        config: LoadTestConfig,
        scenario: Arc<dyn Scenario>,
        executor: RequestExecutor,
    ) -> Result<Self, LoadTestError> {
        config.validate()?;
        let thresholds = config.parsed_thresholds()?;
        let aggregator = Arc::new(MetricsAggregator::new(config.settings.expected_interval));
        let (state_tx, _) = watch::channel(RunState::Idle);

        Ok(Self {
            config,
            thresholds,
            scenario,
            executor: Arc::new(executor),
            aggregator,
            abort: CancellationToken::new(),
            state_tx,
            ctrl_c: false,
        })
    }

    /// Like [`LoadTestRunner::new`] with a reqwest-backed executor using
    /// `settings.timeout`.
    pub fn with_reqwest(
        config: LoadTestConfig,
        scenario: Arc<dyn Scenario>,
    ) -> Result<Self, LoadTestError> {
        let executor = RequestExecutor::reqwest(config.settings.timeout);
        Self::new(config, scenario, executor)
    }

    /// Treat Ctrl+C as an abort request.
    pub fn with_ctrl_c(mut self, enabled: bool) -> Self {
        self.ctrl_c = enabled;
        self
    }

    /// Token that stops the run when cancelled.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Subscribe to lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Shared metrics, for live snapshots while the run is in progress.
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        self.aggregator.clone()
    }

    /// The validated configuration.
    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    /// Parsed thresholds, in configuration order.
    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    fn set_state(&self, state: RunState) {
        tracing::info!(%state, "load test state changed");
        self.state_tx.send_replace(state);
    }

    fn failed_abort_threshold(&self) -> Option<String> {
        let abortable: Vec<&Threshold> =
            self.thresholds.iter().filter(|t| t.abort_on_fail).collect();
        if abortable.is_empty() {
            return None;
        }
        let summary = self.aggregator.snapshot();
        abortable
            .into_iter()
            .find(|t| !threshold::verdict(&summary, t).is_pass())
            .map(|t| t.name.clone())
    }

    /// Run the load test to completion and evaluate thresholds.
    ///
    /// Always produces a report once started, even if every request failed.
    pub async fn run(self) -> Result<RunReport, LoadTestError> {
        self.config.validate()?;

        let scheduler = StageScheduler::new(self.config.stage.clone());
        let settings = &self.config.settings;
        let tracker = TaskTracker::new();
        let active_vus = ActiveVuCounter::new();
        let vus_cancel = CancellationToken::new();
        let mut pool = VuPool::new(vus_cancel.clone());
        let shared = Arc::new(VuShared {
            scenario: self.scenario.clone(),
            executor: self.executor.clone(),
            aggregator: self.aggregator.clone(),
            think_time: settings.think_time,
            think_time_jitter: settings.think_time_jitter,
            expected_interval: settings.expected_interval,
        });

        let done = CancellationToken::new();
        if self.ctrl_c {
            tokio::spawn(handle_ctrl_c(self.abort.clone(), done.clone()));
        }

        tracing::info!(
            stages = scheduler.stage_count(),
            duration = ?scheduler.total_duration(),
            peak_vus = scheduler.peak_target(),
            thresholds = self.thresholds.len(),
            "load test started"
        );
        self.aggregator.start();
        let start = Instant::now();
        self.set_state(RunState::Ramping);

        let mut tick = tokio::time::interval(settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut aborted = None;
        let mut current_stage = None;
        let mut peak_vus = 0u32;

        loop {
            tokio::select! {
                biased;

                _ = self.abort.cancelled() => {
                    tracing::warn!("abort requested, draining");
                    aborted = Some(AbortReason::Interrupted);
                    break;
                }
                _ = tick.tick() => {}
            }

            let elapsed = start.elapsed();
            if scheduler.is_complete(elapsed) || !scheduler.has_load_ahead(elapsed) {
                break;
            }

            let stage = scheduler.stage_index(elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    tracing::info!(
                        stage = %format!("{}/{}", i + 1, scheduler.stage_count()),
                        target = self.config.stage[i].target,
                        "entering stage"
                    );
                }
                current_stage = stage;
            }

            let target = scheduler.current_target(elapsed);
            let change = pool.reconcile(target, |id, token| {
                tracker.spawn(vu_loop(id, shared.clone(), token, active_vus.clone()));
            });
            peak_vus = peak_vus.max(pool.live());
            tracing::debug!(
                ?elapsed,
                target,
                live = pool.live(),
                active = active_vus.get(),
                spawned = change.spawned,
                retired = change.retired,
                "tick"
            );

            if let Some(name) = self.failed_abort_threshold() {
                tracing::warn!(threshold = %name, "abort-on-fail threshold failed, draining");
                aborted = Some(AbortReason::Threshold(name));
                break;
            }
        }

        self.set_state(RunState::Draining);
        let retiring = pool.retire_all();
        vus_cancel.cancel();
        tracker.close();
        tracing::debug!(retiring, "waiting for in-flight iterations");
        tracker.wait().await;
        self.aggregator.stop();
        done.cancel();

        let summary = self.aggregator.snapshot();
        let verdicts = threshold::evaluate(&summary, &self.thresholds);
        let elapsed = summary.elapsed;
        tracing::info!(
            requests = summary.total_requests,
            failed = summary.failed_requests,
            iterations = summary.iterations,
            ?elapsed,
            "load test finished"
        );
        self.set_state(RunState::Completed);

        Ok(RunReport {
            summary,
            verdicts,
            elapsed,
            aborted,
            peak_vus,
        })
    }
}

/// Cancels `abort` on Ctrl+C. Exits quietly once `done` fires.
async fn handle_ctrl_c(abort: CancellationToken, done: CancellationToken) {
    tokio::select! {
        _ = done.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                tracing::warn!("received Ctrl+C, stopping gracefully");
                abort.cancel();
            },
            Err(err) => {
                tracing::warn!(error = %err, "failed to install Ctrl+C handler");
            },
        },
    }
}

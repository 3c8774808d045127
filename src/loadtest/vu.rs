//! Virtual user (VU) task loop.
//!
//! Each VU repeatedly runs the [`Scenario`] with a fresh [`VuContext`],
//! merges its local metrics into the shared aggregator and then pauses for
//! the think time. Cancellation is checked between iterations and raced
//! against the think-time sleep; an iteration in flight always completes.
//!
//! A scenario that returns `Err` or panics is contained here: the failure is
//! logged and the VU moves on. If the iteration already recorded a failed
//! request, that request stands for the failure; otherwise a synthetic
//! scenario error outcome is recorded.
//!
//! Think time is applied after every iteration, failed ones included.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use rand::RngExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::loadtest::executor::RequestExecutor;
use crate::loadtest::metrics::{MetricsAggregator, MetricsRecorder, RequestOutcome};
use crate::loadtest::scenario::{Scenario, VuContext};

/// Atomic counter tracking the number of currently active virtual users.
///
/// Lightweight wrapper around `Arc<AtomicU32>` for clone-friendly sharing
/// across VU tasks and the runner.
#[derive(Clone)]
pub struct ActiveVuCounter(Arc<AtomicU32>);

impl ActiveVuCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(0)))
    }

    /// Increments the active VU count by one.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the active VU count by one.
    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the current number of active VUs.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for ActiveVuCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a VU shares with its siblings.
pub struct VuShared {
    /// The work performed each iteration.
    pub scenario: Arc<dyn Scenario>,
    /// Request executor (one HTTP connection pool for the whole run).
    pub executor: Arc<RequestExecutor>,
    /// Run-wide metrics.
    pub aggregator: Arc<MetricsAggregator>,
    /// Pause between iterations.
    pub think_time: Duration,
    /// Uniform jitter around `think_time`.
    pub think_time_jitter: Duration,
    /// Coordinated omission interval for the local recorder.
    pub expected_interval: Option<Duration>,
}

/// `base` moved by a uniformly random offset in `-jitter..=jitter`,
/// floored at zero.
pub fn think_time_with_jitter(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let jitter_us = i64::try_from(jitter.as_micros()).unwrap_or(i64::MAX);
    let base_us = i64::try_from(base.as_micros()).unwrap_or(i64::MAX);
    let offset = rand::rng().random_range(-jitter_us..=jitter_us);
    Duration::from_micros(base_us.saturating_add(offset).max(0) as u64)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "scenario panicked".to_string()
    }
}

/// Main virtual user task loop.
///
/// The `active_vus` counter is incremented on entry and decremented on exit.
/// Returns the number of iterations this VU completed.
pub async fn vu_loop(
    vu_id: u32,
    shared: Arc<VuShared>,
    cancel: CancellationToken,
    active_vus: ActiveVuCounter,
) -> u64 {
    active_vus.increment();
    tracing::debug!(vu = vu_id, "virtual user started");

    let iterations = vu_loop_inner(vu_id, &shared, &cancel).await;

    tracing::debug!(vu = vu_id, iterations, "virtual user stopped");
    active_vus.decrement();
    iterations
}

async fn vu_loop_inner(vu_id: u32, shared: &VuShared, cancel: &CancellationToken) -> u64 {
    let local = Arc::new(Mutex::new(MetricsRecorder::new(shared.expected_interval)));
    let mut iteration = 0u64;

    loop {
        if cancel.is_cancelled() {
            return iteration;
        }

        let ctx = VuContext::new(vu_id, iteration, shared.executor.clone(), local.clone());
        let start = Instant::now();
        let result = AssertUnwindSafe(shared.scenario.run(ctx))
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        {
            let mut recorder = local.lock();
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
            };
            if let Some(message) = failure {
                tracing::warn!(vu = vu_id, iteration, error = %message, "scenario iteration failed");
                if recorder.failed_requests() == 0 {
                    recorder.record(&RequestOutcome::scenario_error(message));
                }
            }
            recorder.record_iteration(elapsed);
            shared.aggregator.merge(&mut recorder);
        }
        iteration += 1;

        let pause = think_time_with_jitter(shared.think_time, shared.think_time_jitter);
        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {},
            _ = cancel.cancelled() => return iteration,
        }
    }
}

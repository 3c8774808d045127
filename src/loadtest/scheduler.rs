//! Stage scheduler and virtual-user pool reconciliation.
//!
//! [`StageScheduler`] turns a `[[stage]]` plan into a target VU count as a
//! pure function of elapsed run time. Within a stage the target moves linearly
//! from the previous stage's target (0 for the first stage) to the stage's own
//! target, so ramps are gradual rather than step changes.
//!
//! [`VuPool`] tracks the live workers and reconciles them against the target
//! on every tick: it spawns when below target and retires the most recently
//! spawned workers first (LIFO) when above it. LIFO keeps the longest-lived
//! workers, and with them any long-running iterations, undisturbed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::loadtest::config::Stage;

/// Piecewise-linear VU target over elapsed run time.
#[derive(Debug, Clone)]
pub struct StageScheduler {
    stages: Vec<Stage>,
    total: Duration,
}

impl StageScheduler {
    /// Build a scheduler from an ordered stage plan.
    pub fn new(stages: Vec<Stage>) -> Self {
        let total = stages
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration));
        Self { stages, total }
    }

    /// Sum of all stage durations, saturating at [`Duration::MAX`].
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Number of stages in the plan.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Highest target in the plan (0 for an empty plan).
    pub fn peak_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Returns `true` once elapsed time has reached the end of the plan.
    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.total
    }

    /// Target number of concurrently active VUs at `elapsed`.
    ///
    /// Returns 0 at and after the total duration. At a stage boundary the
    /// new stage's origin (the previous stage's target) is used. Fractional
    /// targets are rounded to the nearest integer.
    pub fn current_target(&self, elapsed: Duration) -> u32 {
        if self.is_complete(elapsed) {
            return 0;
        }

        let mut from = 0u32;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start.saturating_add(stage.duration);
            if elapsed < stage_end {
                let progress =
                    (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let value = f64::from(from) + (f64::from(stage.target) - f64::from(from)) * progress;
                return value.round().max(0.0) as u32;
            }
            from = stage.target;
            stage_start = stage_end;
        }
        0
    }

    /// Zero-based index of the stage active at `elapsed`, or `None` once the
    /// plan is complete.
    pub fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            stage_end = stage_end.saturating_add(stage.duration);
            if elapsed < stage_end {
                return Some(i);
            }
        }
        None
    }

    /// Returns `true` if the target is above zero now or anywhere later in
    /// the plan. Once this is `false` the run can start draining.
    pub fn has_load_ahead(&self, elapsed: Duration) -> bool {
        if self.current_target(elapsed) > 0 {
            return true;
        }
        let mut stage_end = Duration::ZERO;
        for stage in &self.stages {
            stage_end = stage_end.saturating_add(stage.duration);
            if stage_end > elapsed && stage.target > 0 {
                return true;
            }
        }
        false
    }
}

/// Result of one [`VuPool::reconcile`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reconciliation {
    /// Workers started by this call.
    pub spawned: u32,
    /// Workers signalled to stop by this call.
    pub retired: u32,
}

/// Live virtual-user handles, ordered oldest first.
///
/// The pool only owns cancellation tokens; spawning is delegated to the
/// caller so the pool stays independent of the task runtime.
pub struct VuPool {
    live: Vec<(u32, CancellationToken)>,
    next_id: u32,
    parent: CancellationToken,
}

impl VuPool {
    /// Creates an empty pool. Every worker token is a child of `parent`.
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            live: Vec::new(),
            next_id: 0,
            parent,
        }
    }

    /// Number of workers that have been spawned and not yet retired.
    pub fn live(&self) -> u32 {
        self.live.len() as u32
    }

    /// Ids of the live workers, oldest first.
    pub fn live_ids(&self) -> Vec<u32> {
        self.live.iter().map(|(id, _)| *id).collect()
    }

    /// Bring the live count to `target`.
    ///
    /// `spawn` is called once per new worker with its id and token. Retired
    /// workers get their token cancelled, newest first; they finish their
    /// current iteration before exiting.
    pub fn reconcile<F>(&mut self, target: u32, mut spawn: F) -> Reconciliation
    where
        F: FnMut(u32, CancellationToken),
    {
        let mut result = Reconciliation::default();
        let live = self.live();

        if target > live {
            for _ in live..target {
                let id = self.next_id;
                self.next_id += 1;
                let token = self.parent.child_token();
                self.live.push((id, token.clone()));
                spawn(id, token);
                result.spawned += 1;
            }
        } else if target < live {
            for _ in target..live {
                if let Some((id, token)) = self.live.pop() {
                    tracing::debug!(vu = id, "retiring virtual user");
                    token.cancel();
                    result.retired += 1;
                }
            }
        }
        result
    }

    /// Cancel every live worker. Returns how many were signalled.
    pub fn retire_all(&mut self) -> u32 {
        let count = self.live();
        for (_, token) in self.live.drain(..).rev() {
            token.cancel();
        }
        count
    }
}

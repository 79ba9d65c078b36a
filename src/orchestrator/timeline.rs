//! Progress and ETA derived from the current stage and the nominal stage table.
//!
//! Nominal durations are estimates only; the engine decides when a stage
//! boundary is crossed. The terminal stage is excluded from every total
//! because it has no end.

use crate::model::{Stage, StageDurations};
use crate::store::AnimationState;
use serde::Serialize;
use std::time::Duration;

/// Number of stages that have a nominal length.
const TIMED_STAGES: usize = Stage::ALL.len() - 1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StageTimeline {
    durations: StageDurations,
}

/// What the UI needs to draw progress bars and an ETA.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub stage: Option<Stage>,
    pub stage_progress: f64,
    pub total_progress: f64,
    #[serde(with = "humantime_serde")]
    pub estimated_remaining: Option<Duration>,
}

impl StageTimeline {
    pub fn new(durations: StageDurations) -> Self {
        Self { durations }
    }

    /// `(index + progress) / timed`, capped at 1.0; 0.0 before any stage.
    pub fn total_progress(&self, stage: Option<Stage>, progress: f64) -> f64 {
        let Some(stage) = stage else {
            return 0.0;
        };
        if stage.is_terminal() {
            return 1.0;
        }
        let n = TIMED_STAGES as f64;
        let p = progress.clamp(0.0, 1.0);
        ((stage.index() as f64 + p) / n).min(1.0)
    }

    /// Remaining time in the current stage plus every later timed stage.
    /// `None` before a run starts and in the terminal stage.
    pub fn estimated_remaining(&self, stage: Option<Stage>, progress: f64) -> Option<Duration> {
        let stage = stage?;
        let current = self.durations.get(stage)?;
        let left_here = current.mul_f64(1.0 - progress.clamp(0.0, 1.0));
        let later: Duration = std::iter::successors(stage.next(), |s| s.next())
            .filter_map(|s| self.durations.get(s))
            .sum();
        Some(left_here + later)
    }

    pub fn report(&self, s: &AnimationState) -> ProgressReport {
        ProgressReport {
            stage: s.current_stage,
            stage_progress: s.progress,
            total_progress: self.total_progress(s.current_stage, s.progress),
            estimated_remaining: self.estimated_remaining(s.current_stage, s.progress),
        }
    }
}

pub fn is_at_stage(s: &AnimationState, stage: Stage) -> bool {
    s.current_stage == Some(stage)
}

pub fn has_reached_stage(s: &AnimationState, stage: Stage) -> bool {
    s.current_stage
        .is_some_and(|current| current.index() >= stage.index())
}

/// 1.0 for completed stages, live progress for the current one, 0.0 otherwise.
pub fn stage_progress(s: &AnimationState, stage: Stage) -> f64 {
    match s.current_stage {
        Some(current) if current == stage => s.progress,
        Some(current) if current.index() > stage.index() => 1.0,
        _ => 0.0,
    }
}

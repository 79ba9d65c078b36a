//! Run report assembled from state snapshots while a session is followed.

use crate::metrics::{self, FpsStats};
use crate::model::{EngineFault, ImageInfo, Stage, StartupResult, WatermarkConfig};
use crate::store::AnimationState;
use serde::Serialize;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    pub stage: Stage,
    /// Offset from the start of the run.
    pub entered_after_ms: u64,
    /// `None` for the stage the run ended in.
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub engine: String,
    pub engine_version: Option<String>,
    pub process_id: Option<u32>,
    pub startup_ms: Option<u64>,
    pub image: Option<ImageInfo>,
    pub watermark: Option<WatermarkConfig>,
    pub stages: Vec<StageTiming>,
    pub reached_final: bool,
    pub skipped: bool,
    pub run_duration_ms: u64,
    pub fps: Option<FpsStats>,
    pub particle_count: Option<u64>,
    pub recognition_accuracy: Option<f64>,
    /// Every engine fault seen during the run, oldest first.
    pub faults: Vec<EngineFault>,
    pub error: Option<String>,
}

/// What changed since the previous snapshot, for live output.
#[derive(Debug, Default)]
pub struct Observed {
    pub entered: Option<Stage>,
    pub new_faults: Vec<EngineFault>,
}

pub struct RunRecorder {
    engine: String,
    started_at: OffsetDateTime,
    run_start: Option<Instant>,
    startup: Option<StartupResult>,
    stages: Vec<(Stage, Instant)>,
    last_metrics: Option<crate::model::Metrics>,
    fps: Vec<f64>,
    last_fault: Option<EngineFault>,
    faults: Vec<EngineFault>,
    skipped: bool,
    ended: Option<Instant>,
}

impl RunRecorder {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            started_at: OffsetDateTime::now_utc(),
            run_start: None,
            startup: None,
            stages: Vec::new(),
            last_metrics: None,
            fps: Vec::new(),
            last_fault: None,
            faults: Vec::new(),
            skipped: false,
            ended: None,
        }
    }

    pub fn engine_started(&mut self, startup: &StartupResult) {
        self.startup = Some(startup.clone());
    }

    pub fn run_started(&mut self, at: Instant) {
        self.run_start = Some(at);
    }

    pub fn skipped(&mut self) {
        self.skipped = true;
    }

    pub fn run_ended(&mut self, at: Instant) {
        self.ended.get_or_insert(at);
    }

    pub fn observe(&mut self, s: &AnimationState, at: Instant) -> Observed {
        let mut observed = Observed::default();

        if let Some(stage) = s.current_stage {
            if self.stages.last().map(|(last, _)| *last) != Some(stage) {
                self.stages.push((stage, at));
                observed.entered = Some(stage);
            }
        }

        if s.metrics.is_some() && s.metrics != self.last_metrics {
            if let Some(m) = &s.metrics {
                if m.fps.is_finite() {
                    self.fps.push(m.fps);
                }
            }
            self.last_metrics = s.metrics.clone();
        }

        // The store keeps newest first; anything ahead of the last one we saw is new.
        let fresh: Vec<EngineFault> = s
            .engine_errors
            .iter()
            .take_while(|f| Some(*f) != self.last_fault.as_ref())
            .cloned()
            .collect();
        if let Some(front) = s.engine_errors.front() {
            self.last_fault = Some(front.clone());
        }
        observed.new_faults = fresh.into_iter().rev().collect();
        self.faults.extend(observed.new_faults.iter().cloned());

        observed
    }

    pub fn finish(self, s: &AnimationState, error: Option<String>) -> RunReport {
        let finished = Instant::now();
        let end = self.ended.unwrap_or(finished);
        let run_start = self.run_start.or(self.stages.first().map(|(_, t)| *t));
        let since_start = |t: Instant| -> u64 {
            run_start.map_or(0, |r| t.saturating_duration_since(r).as_millis() as u64)
        };

        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, (stage, entered))| StageTiming {
                stage: *stage,
                entered_after_ms: since_start(*entered),
                duration_ms: self
                    .stages
                    .get(i + 1)
                    .map(|(_, next)| next.saturating_duration_since(*entered).as_millis() as u64),
            })
            .collect();

        let startup = self.startup.as_ref();
        RunReport {
            started_at: rfc3339(self.started_at),
            finished_at: rfc3339(OffsetDateTime::now_utc()),
            engine: self.engine,
            engine_version: startup.and_then(|s| s.version.clone()),
            process_id: startup.and_then(|s| s.process_id),
            startup_ms: startup.map(|s| s.startup_time.as_millis() as u64),
            image: s.loaded_image.clone(),
            watermark: s.watermark_config.clone(),
            stages,
            reached_final: self
                .stages
                .iter()
                .any(|(stage, _)| *stage == Stage::FinalBreathing),
            skipped: self.skipped,
            run_duration_ms: run_start.map_or(0, |r| end.saturating_duration_since(r).as_millis() as u64),
            fps: metrics::fps_stats(&self.fps),
            particle_count: self.last_metrics.as_ref().map(|m| m.particle_count),
            recognition_accuracy: self
                .last_metrics
                .as_ref()
                .and_then(|m| m.recognition_accuracy),
            faults: self.faults,
            error,
        }
    }
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metrics;
    use std::time::Duration;

    fn running(stage: Stage) -> AnimationState {
        AnimationState {
            is_engine_running: true,
            is_animation_running: true,
            current_stage: Some(stage),
            ..Default::default()
        }
    }

    fn fault(code: &str, ts: u64) -> EngineFault {
        EngineFault {
            code: code.into(),
            message: "boom".into(),
            details: None,
            timestamp: ts,
        }
    }

    #[test]
    fn records_stage_entries_once() {
        let t0 = Instant::now();
        let mut r = RunRecorder::new("sim");
        r.run_started(t0);
        assert_eq!(r.observe(&running(Stage::PreStart), t0).entered, Some(Stage::PreStart));
        assert_eq!(r.observe(&running(Stage::PreStart), t0).entered, None);
        let t1 = t0 + Duration::from_millis(200);
        assert_eq!(r.observe(&running(Stage::Burst), t1).entered, Some(Stage::Burst));

        let report = r.finish(&running(Stage::Burst), None);
        assert_eq!(report.stages.len(), 2);
        assert_eq!(report.stages[0].duration_ms, Some(200));
        assert_eq!(report.stages[1].entered_after_ms, 200);
        assert_eq!(report.stages[1].duration_ms, None);
        assert!(!report.reached_final);
    }

    #[test]
    fn new_faults_are_reported_oldest_first() {
        let now = Instant::now();
        let mut r = RunRecorder::new("sim");
        let mut s = running(Stage::Chaos);
        s.engine_errors.push_front(fault("A", 1));
        let seen = r.observe(&s, now).new_faults;
        assert_eq!(seen.len(), 1);

        s.engine_errors.push_front(fault("B", 2));
        s.engine_errors.push_front(fault("C", 3));
        let seen: Vec<String> = r.observe(&s, now).new_faults.into_iter().map(|f| f.code).collect();
        assert_eq!(seen, ["B", "C"]);
        assert!(r.observe(&s, now).new_faults.is_empty());

        let report = r.finish(&s, Some("stopped".into()));
        let all: Vec<&str> = report.faults.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(all, ["A", "B", "C"]);
        assert_eq!(report.error.as_deref(), Some("stopped"));
    }

    #[test]
    fn fps_samples_come_from_metric_changes() {
        let now = Instant::now();
        let mut r = RunRecorder::new("sim");
        for fps in [58.0, 58.0, 60.0, 59.0] {
            let mut s = running(Stage::FinalBreathing);
            s.metrics = Some(Metrics {
                fps,
                particle_count: 5_000,
                memory_usage: 100.0,
                recognition_accuracy: Some(0.9),
            });
            r.observe(&s, now);
        }
        let report = r.finish(&AnimationState::default(), None);
        assert_eq!(report.fps.as_ref().map(|f| f.samples), Some(3));
        assert_eq!(report.particle_count, Some(5_000));
        assert_eq!(report.recognition_accuracy, Some(0.9));
        assert!(report.reached_final);
        assert!(report.started_at.contains('T'));
    }
}

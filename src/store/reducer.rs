//! The transition function. No I/O, no clocks: anything time-dependent
//! arrives inside the action.

use super::action::Action;
use super::{AnimationState, ENGINE_ERROR_CAPACITY};

/// Compute the state that follows `state` once `action` is applied.
pub fn apply(state: &AnimationState, action: Action) -> AnimationState {
    let mut s = state.clone();
    match action {
        Action::EngineStartRequested => {
            s.is_starting_engine = true;
            s.error = None;
        }
        Action::EngineStarted { health } => {
            s.is_engine_running = true;
            s.engine_health = Some(health);
            s.is_starting_engine = false;
        }
        Action::EngineStartFailed { error } => {
            clear_engine_scope(&mut s);
            s.error = Some(error);
        }
        Action::EngineStopped => clear_engine_scope(&mut s),
        Action::EngineHealthUpdate { health } => {
            if s.is_engine_running {
                s.engine_health = Some(health);
            }
        }
        Action::EngineError { fault } => {
            s.engine_errors.push_front(fault);
            s.engine_errors.truncate(ENGINE_ERROR_CAPACITY);
        }

        Action::ImageLoadRequested => {
            s.is_loading_image = true;
            s.error = None;
        }
        Action::ImageLoaded { image } => {
            s.is_loading_image = false;
            s.loaded_image = Some(image);
        }
        Action::ImageLoadFailed { error } => {
            s.is_loading_image = false;
            s.error = Some(error);
        }

        Action::AnimationStartRequested => {
            clear_animation_scope(&mut s);
            s.is_starting_animation = true;
            s.is_processing_command = true;
            s.error = None;
        }
        Action::AnimationStarted => {
            // A stage reported by the engine while the start was in flight is kept.
            if !s.is_starting_animation {
                s.current_stage = None;
            }
            s.is_starting_animation = false;
            s.is_processing_command = false;
            s.is_animation_running = true;
            s.is_paused = false;
            s.progress = 0.0;
            s.elapsed_time = 0;
        }
        Action::AnimationStartFailed { error } => {
            clear_animation_scope(&mut s);
            s.is_processing_command = false;
            s.error = Some(error);
        }
        Action::AnimationPaused => {
            // Pause only exists inside a run.
            if s.is_animation_running {
                s.is_paused = true;
            }
        }
        Action::AnimationResumed => s.is_paused = false,
        Action::AnimationStopped => clear_animation_scope(&mut s),
        Action::SkippedToFinal => {
            if s.is_animation_running {
                s.current_stage = Some(crate::model::Stage::FinalBreathing);
                s.progress = 0.0;
            }
        }

        Action::StageChanged { stage } => {
            if s.is_animation_running || s.is_starting_animation {
                s.current_stage = Some(stage);
            }
        }
        Action::ProgressUpdate {
            progress,
            elapsed_time,
        } => {
            if s.is_animation_running {
                s.progress = if progress.is_finite() {
                    progress.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                if let Some(t) = elapsed_time {
                    s.elapsed_time = t;
                }
            }
        }
        Action::MetricsUpdated { metrics } => s.metrics = Some(metrics),

        Action::WatermarkChanged { watermark } => s.watermark_config = watermark,

        Action::CommandStart => {
            s.is_processing_command = true;
            s.error = None;
        }
        Action::CommandComplete => s.is_processing_command = false,
        Action::CommandFailed { error } => {
            s.is_processing_command = false;
            s.error = Some(error);
        }

        Action::ClearError => s.error = None,
        Action::ClearEngineErrors => s.engine_errors.clear(),
    }
    s
}

fn clear_animation_scope(s: &mut AnimationState) {
    s.is_animation_running = false;
    s.is_starting_animation = false;
    s.is_paused = false;
    s.current_stage = None;
    s.progress = 0.0;
    s.elapsed_time = 0;
}

/// Everything that only makes sense while an engine process exists.
/// The loaded image and watermark describe user intent and survive.
fn clear_engine_scope(s: &mut AnimationState) {
    s.is_engine_running = false;
    s.is_starting_engine = false;
    s.engine_health = None;
    s.is_processing_command = false;
    s.is_loading_image = false;
    clear_animation_scope(s);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        EngineFault, EngineHealth, ImageFormat, ImageInfo, Stage, WatermarkConfig,
        WatermarkPosition,
    };

    fn health() -> EngineHealth {
        EngineHealth {
            is_responding: true,
            last_heartbeat: 1,
            memory_usage: Some(100.0),
            cpu_usage: None,
        }
    }

    fn image() -> ImageInfo {
        ImageInfo {
            path: "/img/cat.png".into(),
            filename: "cat.png".into(),
            width: 400,
            height: 200,
            size_bytes: 1024,
            format: ImageFormat::Png,
            aspect_ratio: 2.0,
            has_transparency: true,
        }
    }

    fn fault(n: usize) -> EngineFault {
        EngineFault {
            code: format!("E{n}"),
            message: format!("fault {n}"),
            details: None,
            timestamp: n as u64,
        }
    }

    fn running() -> AnimationState {
        let s = apply(&AnimationState::default(), Action::EngineStarted { health: health() });
        let s = apply(&s, Action::ImageLoaded { image: image() });
        apply(&s, Action::AnimationStarted)
    }

    #[test]
    fn initial_state_is_idle() {
        let s = AnimationState::default();
        assert!(!s.is_engine_running);
        assert_eq!(s.current_stage, None);
        assert_eq!(s.progress, 0.0);
        assert!(s.engine_errors.is_empty());
    }

    #[test]
    fn engine_start_lifecycle() {
        let s = AnimationState {
            error: Some("old".into()),
            ..Default::default()
        };
        let s = apply(&s, Action::EngineStartRequested);
        assert!(s.is_starting_engine);
        assert!(s.error.is_none());

        let ok = apply(&s, Action::EngineStarted { health: health() });
        assert!(ok.is_engine_running);
        assert!(!ok.is_starting_engine);
        assert_eq!(ok.engine_health, Some(health()));

        let failed = apply(
            &s,
            Action::EngineStartFailed {
                error: "boom".into(),
            },
        );
        assert!(!failed.is_engine_running);
        assert!(!failed.is_starting_engine);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn engine_stop_keeps_content() {
        let s = running();
        let s = apply(&s, Action::StageChanged { stage: Stage::Chaos });
        let s = apply(
            &s,
            Action::ProgressUpdate {
                progress: 0.4,
                elapsed_time: Some(9_000),
            },
        );
        let wm = WatermarkConfig {
            enabled: true,
            path: "/img/logo.png".into(),
            position: WatermarkPosition::TopLeft,
            opacity: 0.5,
            scale: 0.2,
        };
        let s = apply(
            &s,
            Action::WatermarkChanged {
                watermark: Some(wm.clone()),
            },
        );
        let s = apply(&s, Action::AnimationPaused);

        let stopped = apply(&s, Action::EngineStopped);
        assert!(!stopped.is_engine_running);
        assert!(stopped.engine_health.is_none());
        assert!(!stopped.is_animation_running);
        assert!(!stopped.is_paused);
        assert_eq!(stopped.current_stage, None);
        assert_eq!(stopped.progress, 0.0);
        assert_eq!(stopped.elapsed_time, 0);
        assert_eq!(stopped.loaded_image, Some(image()));
        assert_eq!(stopped.watermark_config, Some(wm));
    }

    #[test]
    fn stage_change_does_not_reset_progress() {
        let s = apply(
            &running(),
            Action::ProgressUpdate {
                progress: 0.7,
                elapsed_time: None,
            },
        );
        let s = apply(&s, Action::StageChanged { stage: Stage::Burst });
        assert_eq!(s.current_stage, Some(Stage::Burst));
        assert_eq!(s.progress, 0.7);
    }

    #[test]
    fn progress_is_clamped() {
        let s = apply(
            &running(),
            Action::ProgressUpdate {
                progress: 1.7,
                elapsed_time: None,
            },
        );
        assert_eq!(s.progress, 1.0);
        let s = apply(
            &s,
            Action::ProgressUpdate {
                progress: -3.0,
                elapsed_time: None,
            },
        );
        assert_eq!(s.progress, 0.0);
        let s = apply(
            &s,
            Action::ProgressUpdate {
                progress: f64::NAN,
                elapsed_time: None,
            },
        );
        assert_eq!(s.progress, 0.0);
    }

    #[test]
    fn animation_start_and_stop_reset_progress() {
        let s = apply(
            &running(),
            Action::ProgressUpdate {
                progress: 0.5,
                elapsed_time: Some(1_000),
            },
        );
        let restarted = apply(&s, Action::AnimationStarted);
        assert_eq!(restarted.progress, 0.0);
        assert_eq!(restarted.elapsed_time, 0);
        let stopped = apply(&s, Action::AnimationStopped);
        assert_eq!(stopped.progress, 0.0);
        assert_eq!(stopped.current_stage, None);
    }

    #[test]
    fn fault_log_keeps_ten_newest_first() {
        let mut s = AnimationState::default();
        for n in 0..15 {
            s = apply(&s, Action::EngineError { fault: fault(n) });
        }
        assert_eq!(s.engine_errors.len(), 10);
        let codes: Vec<_> = s.engine_errors.iter().map(|f| f.code.clone()).collect();
        let expected: Vec<_> = (5..15).rev().map(|n| format!("E{n}")).collect();
        assert_eq!(codes, expected);
        assert!(s.error.is_none(), "streamed faults never set the banner");
    }

    #[test]
    fn pause_requires_running() {
        let s = apply(&AnimationState::default(), Action::AnimationPaused);
        assert!(!s.is_paused);
        let s = apply(&running(), Action::AnimationPaused);
        assert!(s.is_paused && s.is_animation_running);
        let s = apply(&s, Action::AnimationResumed);
        assert!(!s.is_paused);
    }

    #[test]
    fn pause_implies_running_across_every_action() {
        let actions = vec![
            Action::EngineStartRequested,
            Action::EngineStarted { health: health() },
            Action::ImageLoaded { image: image() },
            Action::AnimationStartRequested,
            Action::AnimationStarted,
            Action::AnimationPaused,
            Action::StageChanged { stage: Stage::Chaos },
            Action::AnimationResumed,
            Action::AnimationPaused,
            Action::SkippedToFinal,
            Action::AnimationStopped,
            Action::AnimationPaused,
            Action::AnimationStarted,
            Action::AnimationPaused,
            Action::EngineStopped,
            Action::AnimationPaused,
            Action::CommandStart,
            Action::CommandFailed { error: "x".into() },
        ];
        let mut s = AnimationState::default();
        for a in actions {
            s = apply(&s, a);
            assert!(!s.is_paused || s.is_animation_running, "{s:?}");
        }
    }

    #[test]
    fn stage_reported_during_start_survives_started() {
        let s = apply(&AnimationState::default(), Action::EngineStarted { health: health() });
        let s = apply(&s, Action::AnimationStartRequested);
        let s = apply(&s, Action::StageChanged { stage: Stage::PreStart });
        let s = apply(&s, Action::AnimationStarted);
        assert!(s.is_animation_running);
        assert!(!s.is_starting_animation);
        assert_eq!(s.current_stage, Some(Stage::PreStart));

        let failed = apply(
            &apply(&s, Action::AnimationStartRequested),
            Action::AnimationStartFailed { error: "no".into() },
        );
        assert_eq!(failed.current_stage, None);
        assert!(!failed.is_animation_running);
    }

    #[test]
    fn skip_forces_terminal_stage() {
        let s = apply(&running(), Action::StageChanged {
            stage: Stage::Formation,
        });
        let s = apply(&s, Action::SkippedToFinal);
        assert_eq!(s.current_stage, Some(Stage::FinalBreathing));
    }

    #[test]
    fn command_bracket_sets_busy_and_error() {
        let s = apply(&AnimationState::default(), Action::CommandStart);
        assert!(s.is_processing_command);
        let done = apply(&s, Action::CommandComplete);
        assert!(!done.is_processing_command);
        let failed = apply(&s, Action::CommandFailed { error: "nope".into() });
        assert!(!failed.is_processing_command);
        assert_eq!(failed.error.as_deref(), Some("nope"));
        assert!(apply(&failed, Action::ClearError).error.is_none());
    }

    #[test]
    fn transitions_are_pure() {
        let s = running();
        let a = Action::StageChanged { stage: Stage::Converging };
        assert_eq!(apply(&s, a.clone()), apply(&s, a));
        // The input snapshot is untouched.
        assert_eq!(s.current_stage, None);
    }

    #[test]
    fn health_update_ignored_while_stopped() {
        let s = apply(
            &AnimationState::default(),
            Action::EngineHealthUpdate { health: health() },
        );
        assert!(s.engine_health.is_none());
    }
}

use crate::model::{EngineFault, EngineHealth, ImageInfo, Metrics, Stage, WatermarkConfig};

/// Every way the animation state can change.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    EngineStartRequested,
    EngineStarted { health: EngineHealth },
    EngineStartFailed { error: String },
    EngineStopped,
    EngineHealthUpdate { health: EngineHealth },
    /// A fault streamed by the engine; goes to the fault log, not the banner.
    EngineError { fault: EngineFault },

    ImageLoadRequested,
    ImageLoaded { image: ImageInfo },
    ImageLoadFailed { error: String },

    AnimationStartRequested,
    AnimationStarted,
    AnimationStartFailed { error: String },
    AnimationPaused,
    AnimationResumed,
    AnimationStopped,
    SkippedToFinal,

    StageChanged { stage: Stage },
    /// `progress` is stage-relative; `elapsed_time` is run-relative millis.
    ProgressUpdate { progress: f64, elapsed_time: Option<u64> },
    MetricsUpdated { metrics: Metrics },

    WatermarkChanged { watermark: Option<WatermarkConfig> },

    /// Bracket for commands without a dedicated busy flag.
    CommandStart,
    CommandComplete,
    CommandFailed { error: String },

    ClearError,
    ClearEngineErrors,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::EngineStartRequested => "ENGINE_START_REQUESTED",
            Action::EngineStarted { .. } => "ENGINE_STARTED",
            Action::EngineStartFailed { .. } => "ENGINE_START_FAILED",
            Action::EngineStopped => "ENGINE_STOPPED",
            Action::EngineHealthUpdate { .. } => "ENGINE_HEALTH_UPDATE",
            Action::EngineError { .. } => "ENGINE_ERROR",
            Action::ImageLoadRequested => "IMAGE_LOAD_REQUESTED",
            Action::ImageLoaded { .. } => "IMAGE_LOADED",
            Action::ImageLoadFailed { .. } => "IMAGE_LOAD_FAILED",
            Action::AnimationStartRequested => "ANIMATION_START_REQUESTED",
            Action::AnimationStarted => "ANIMATION_STARTED",
            Action::AnimationStartFailed { .. } => "ANIMATION_START_FAILED",
            Action::AnimationPaused => "ANIMATION_PAUSED",
            Action::AnimationResumed => "ANIMATION_RESUMED",
            Action::AnimationStopped => "ANIMATION_STOPPED",
            Action::SkippedToFinal => "SKIPPED_TO_FINAL",
            Action::StageChanged { .. } => "STAGE_CHANGED",
            Action::ProgressUpdate { .. } => "PROGRESS_UPDATE",
            Action::MetricsUpdated { .. } => "METRICS_UPDATE",
            Action::WatermarkChanged { .. } => "WATERMARK_CHANGED",
            Action::CommandStart => "COMMAND_START",
            Action::CommandComplete => "COMMAND_COMPLETE",
            Action::CommandFailed { .. } => "COMMAND_FAILED",
            Action::ClearError => "CLEAR_ERROR",
            Action::ClearEngineErrors => "CLEAR_ENGINE_ERRORS",
        }
    }
}

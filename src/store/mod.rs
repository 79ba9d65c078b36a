//! Canonical animation state.
//!
//! [`AnimationState`] is only ever replaced by [`apply`]ing an [`Action`].
//! [`Store`] is the shared handle that does this atomically and publishes
//! each new snapshot to watchers.

mod action;
mod reducer;

pub use action::Action;
pub use reducer::apply;

use crate::model::{EngineFault, EngineHealth, ImageInfo, Metrics, Stage, WatermarkConfig};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::watch;
use tracing::trace;

/// The fault log keeps at most this many entries; older ones fall off.
pub const ENGINE_ERROR_CAPACITY: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationState {
    // engine
    pub is_engine_running: bool,
    pub engine_health: Option<EngineHealth>,
    pub is_starting_engine: bool,

    // animation
    pub current_stage: Option<Stage>,
    pub is_animation_running: bool,
    pub is_starting_animation: bool,
    pub is_paused: bool,
    /// Stage-relative progress in `[0, 1]`.
    pub progress: f64,
    /// Milliseconds since the run started, as reported by the engine.
    pub elapsed_time: u64,

    // content
    pub loaded_image: Option<ImageInfo>,
    pub watermark_config: Option<WatermarkConfig>,

    pub metrics: Option<Metrics>,

    /// Latest command-level failure, shown as a dismissible banner.
    pub error: Option<String>,
    /// Streamed engine faults, newest first.
    pub engine_errors: VecDeque<EngineFault>,

    pub is_loading_image: bool,
    pub is_processing_command: bool,
}

/// Shared, clonable handle to the one live [`AnimationState`].
#[derive(Clone)]
pub struct Store {
    tx: watch::Sender<AnimationState>,
}

impl Store {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AnimationState::default());
        Self { tx }
    }

    pub fn dispatch(&self, action: Action) {
        let name = action.name();
        self.tx.send_modify(|state| {
            let next = apply(state, action);
            *state = next;
        });
        trace!(action = name, "state updated");
    }

    pub fn snapshot(&self) -> AnimationState {
        self.tx.borrow().clone()
    }

    /// Read a field without cloning the whole state.
    pub fn read<R>(&self, f: impl FnOnce(&AnimationState) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<AnimationState> {
        self.tx.subscribe()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

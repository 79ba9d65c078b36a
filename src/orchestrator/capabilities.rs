use crate::model::Stage;
use crate::store::AnimationState;
use serde::Serialize;

/// Which user actions are legal right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_start: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_stop: bool,
    pub can_skip: bool,
}

impl Capabilities {
    pub fn of(s: &AnimationState) -> Self {
        Self {
            can_start: !s.is_animation_running && s.is_engine_running && s.loaded_image.is_some(),
            can_pause: s.is_animation_running && !s.is_paused,
            can_resume: s.is_animation_running && s.is_paused,
            can_stop: s.is_animation_running,
            can_skip: s.is_animation_running && s.current_stage != Some(Stage::FinalBreathing),
        }
    }
}

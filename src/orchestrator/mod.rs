//! Application-level orchestration.
//!
//! This module owns the engine and animation lifecycle on behalf of a UI or
//! CLI: capability predicates, progress/ETA derivation, health polling, and
//! the command wrapper that starts (and restarts) the engine on demand. Front
//! ends call into [`Orchestrator`] and read [`crate::store::AnimationState`]
//! snapshots; they never talk to the bridge directly.

mod capabilities;
mod config;
mod controller;
mod health;
mod timeline;

pub use capabilities::Capabilities;
pub use config::{EngineProgram, OrchestratorConfig};
pub use controller::Orchestrator;
pub use timeline::{ProgressReport, StageTimeline};

use super::error::BridgeError;
use super::events::EventHub;
use super::protocol::{EngineCommand, EngineReply};
use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// What a transport learned while bringing the engine up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchInfo {
    pub process_id: Option<u32>,
    pub version: Option<String>,
}

/// The channel the bridge talks to the engine through.
///
/// Implementations publish every unsolicited engine event into the hub they
/// were launched with, including [`crate::model::EngineEvent::Exited`] when the
/// engine goes away on its own.
pub trait EngineTransport: Send + Sync {
    fn launch(&self, hub: Arc<EventHub>) -> BoxFuture<'_, Result<LaunchInfo>>;

    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;

    fn request(&self, command: EngineCommand) -> BoxFuture<'_, Result<EngineReply, BridgeError>>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

//! Wire shapes exchanged with the engine.
//!
//! The process transport writes one JSON object per line on the engine's
//! stdin and reads one per line from its stdout. The simulated transport uses
//! the same command/reply types in memory so both paths share semantics.

use crate::model::{AnimationConfig, EngineEvent, EngineSettings, Envelope, WatermarkConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineCommand {
    Hello,
    Shutdown,
    LoadImage { path: PathBuf },
    StartAnimation { config: AnimationConfig },
    Pause,
    Resume,
    StopAnimation,
    SkipToFinal,
    UpdateSettings { settings: EngineSettings },
    SetWatermark { watermark: Option<WatermarkConfig> },
    Message { envelope: Envelope },
    Broadcast { envelope: Envelope },
}

impl EngineCommand {
    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::Hello => "hello",
            EngineCommand::Shutdown => "shutdown",
            EngineCommand::LoadImage { .. } => "loadImage",
            EngineCommand::StartAnimation { .. } => "startAnimation",
            EngineCommand::Pause => "pause",
            EngineCommand::Resume => "resume",
            EngineCommand::StopAnimation => "stopAnimation",
            EngineCommand::SkipToFinal => "skipToFinal",
            EngineCommand::UpdateSettings { .. } => "updateSettings",
            EngineCommand::SetWatermark { .. } => "setWatermark",
            EngineCommand::Message { .. } => "sendMessage",
            EngineCommand::Broadcast { .. } => "broadcastMessage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineReply {
    Ack,
    Hello { version: String },
    ImageLoaded { width: u32, height: u32 },
    /// The command ran and the outcome is negative (bad path, bad settings).
    Failed { error: String },
    Message { payload: serde_json::Value },
}

/// Outbound line: a command tagged with a request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub command: EngineCommand,
}

/// Inbound line: either the reply to a request or an unsolicited event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    Reply { reply_to: u64, reply: EngineReply },
    Event { event: EngineEvent },
}

/// Parse a single stdout line from the engine. Blank lines yield `None`.
pub fn parse_inbound(line: &str) -> Result<Option<InboundFrame>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

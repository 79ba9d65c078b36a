//! Bridge-level errors.
//!
//! Result-typed failures (an image that does not exist, a launch that did not
//! come up) are *not* errors at this layer: they come back as
//! `success: false` values. [`BridgeError`] only covers calls that could not be
//! carried out at all.
//!
//! | Variant | Recoverable by restart |
//! |---------|------------------------|
//! | [`BridgeError::NotRunning`] | Yes |
//! | [`BridgeError::Transport`] | Yes |
//! | [`BridgeError::Timeout`] | Yes |
//! | [`BridgeError::MalformedInput`] | No |
//! | [`BridgeError::Rejected`] | No |

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// A command was sent to an engine that is not running.
    #[error("engine is not running (cannot {0})")]
    NotRunning(&'static str),

    /// Caller handed the bridge something the protocol does not allow.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The engine understood the command and refused it.
    #[error("engine rejected {command}: {reason}")]
    Rejected {
        command: &'static str,
        reason: String,
    },

    /// The channel to the engine broke mid-call.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("engine did not answer {0} in time")]
    Timeout(&'static str),
}

impl BridgeError {
    /// Whether restarting the engine could plausibly make the call succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotRunning(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRunning(_) => "ENGINE_NOT_RUNNING",
            Self::MalformedInput(_) => "MALFORMED_INPUT",
            Self::Rejected { .. } => "COMMAND_REJECTED",
            Self::Transport(_) => "TRANSPORT_FAILURE",
            Self::Timeout(_) => "ENGINE_TIMEOUT",
        }
    }
}

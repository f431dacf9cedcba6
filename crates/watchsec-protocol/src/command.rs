//! Control commands sent by viewers to an agent
//!
//! Pointer coordinates are normalized to `[0, 1]` against the host display,
//! so the same command lands on the same relative spot regardless of the
//! resolution the viewer was looking at.

use serde::{Deserialize, Serialize};

/// Mouse button for click commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Input or session-control command addressed to one agent
///
/// Older agents and dashboards used `mousemove`, `keypress`, `type`,
/// `start_recording` and `stop_recording` as type tags; those are still
/// accepted on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlCommand {
    /// Move the pointer to a normalized position
    #[serde(alias = "mousemove")]
    PointerMove { x: f64, y: f64 },

    /// Click at a normalized position
    Click {
        x: f64,
        y: f64,
        #[serde(default)]
        button: MouseButton,
    },

    /// Press and release a single named key (e.g. `enter`, `a`, `f5`)
    #[serde(alias = "keypress")]
    KeyPress { key: String },

    /// Type a string of text
    #[serde(alias = "type")]
    TypeText { text: String },

    /// Vertical wheel scroll, in notches. Positive scrolls down.
    Scroll { dy: f64 },

    /// Lock the host session
    Lock,

    /// Begin recording the captured stream to local storage
    #[serde(alias = "start_recording")]
    StartRecording,

    /// Finish the recording and hand it to the uploader
    #[serde(alias = "stop_recording")]
    StopRecording,
}

impl ControlCommand {
    /// Short name used in logs and acknowledgements
    pub fn kind(&self) -> &'static str {
        match self {
            ControlCommand::PointerMove { .. } => "pointerMove",
            ControlCommand::Click { .. } => "click",
            ControlCommand::KeyPress { .. } => "keyPress",
            ControlCommand::TypeText { .. } => "typeText",
            ControlCommand::Scroll { .. } => "scroll",
            ControlCommand::Lock => "lock",
            ControlCommand::StartRecording => "startRecording",
            ControlCommand::StopRecording => "stopRecording",
        }
    }
}

/// Agent's acknowledgement of a command that reports back to the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    /// Kind of the acknowledged command
    pub command: String,
    /// Whether the command took effect
    pub ok: bool,
    /// Human-readable detail (failure reason, recording file name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandAck {
    /// Successful acknowledgement
    pub fn ok(command: &ControlCommand, detail: Option<String>) -> Self {
        Self {
            command: command.kind().to_string(),
            ok: true,
            detail,
        }
    }

    /// Failed acknowledgement
    pub fn failed(command: &ControlCommand, reason: impl Into<String>) -> Self {
        Self {
            command: command.kind().to_string(),
            ok: false,
            detail: Some(reason.into()),
        }
    }
}

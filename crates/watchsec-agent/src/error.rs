//! Agent error types

use thiserror::Error;

use watchsec_core::NegotiationError;
use watchsec_protocol::{ConnectionId, ProtocolError};

/// Errors raised while capturing or encoding a frame
#[derive(Error, Debug)]
pub enum CaptureError {
    /// No capture backend is available on this host
    #[error("Screen capture unavailable: {0}")]
    Unavailable(String),

    /// The backend failed to grab the display
    #[error("Capture failed: {0}")]
    Capture(String),

    /// The captured image has no pixels
    #[error("Captured image is empty")]
    EmptyImage,

    /// JPEG encoding failed
    #[error("Encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Errors raised while replaying a viewer command
#[derive(Error, Debug)]
pub enum InputError {
    /// No input backend is available on this host
    #[error("Input injection unavailable: {0}")]
    Unavailable(String),

    /// A coordinate was NaN or infinite
    #[error("Invalid coordinate ({x}, {y})")]
    InvalidCoordinate { x: f64, y: f64 },

    /// The key name is not recognized
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// The OS rejected the injected event
    #[error("Input backend error: {0}")]
    Backend(String),

    /// The session lock call failed or does not exist here
    #[error("Lock failed: {0}")]
    LockFailed(String),
}

/// Errors raised by the session recorder
#[derive(Error, Debug)]
pub enum RecordingError {
    /// A recording is already running
    #[error("Recording already in progress")]
    AlreadyRecording,

    /// There is no recording to stop
    #[error("No recording in progress")]
    NotRecording,

    /// Frame could not be encoded into the recording
    #[error("Recording encode error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while uploading a finished recording
#[derive(Error, Debug)]
pub enum UploadError {
    /// The recording file could not be read
    #[error("Failed to read recording: {0}")]
    Io(#[from] std::io::Error),

    /// The request could not be sent or timed out
    #[error("Upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The storage service answered with a non-2xx status
    #[error("Upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Errors raised by the peer-to-peer negotiator
#[derive(Error, Debug)]
pub enum PeerError {
    /// Peer-to-peer is turned off in the configuration
    #[error("Peer-to-peer disabled")]
    Disabled,

    /// No negotiation is running for the viewer
    #[error("No peer negotiation for viewer {0}")]
    UnknownViewer(ConnectionId),

    /// Illegal state transition
    #[error(transparent)]
    Transition(#[from] NegotiationError),

    /// WebRTC stack error
    #[error("WebRTC error: {0}")]
    Rtc(String),
}

//! Frame source: display capture, downscale and encode

mod encode;
mod source;

use bytes::Bytes;

pub use encode::FrameEncoder;
pub use source::{CaptureLoop, CaptureStats};

/// One encoded capture, before it is numbered for a live session
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// JPEG bytes
    pub payload: Bytes,
    /// Capture time in ms since the Unix epoch
    pub captured_at: u64,
    /// Size of the display at capture time
    pub width: u32,
    pub height: u32,
}

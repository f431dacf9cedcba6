//! OS backends for screen capture, input injection and session lock
//!
//! A [`Backend`] is chosen once at startup by [`select_backend`]. Capture
//! and input handles are opened on the thread that uses them, since the
//! native handles are not all `Send`.

mod desktop;
#[cfg(feature = "native")]
mod native;

use std::process::{Command, Stdio};
use std::sync::Arc;

use image::RgbaImage;

use watchsec_protocol::MouseButton;

use crate::error::{CaptureError, InputError};
use crate::input::NamedKey;

pub use desktop::{LinuxBackend, MacOsBackend, WindowsBackend};

/// Grabs the primary display
pub trait ScreenSource {
    /// Capture one full-resolution image of the display
    fn capture(&mut self) -> Result<RgbaImage, CaptureError>;
}

/// Injects pointer and keyboard events
pub trait InputSink {
    /// Current size of the primary display in pixels
    fn display_size(&mut self) -> Result<(u32, u32), InputError>;

    /// Move the pointer to an absolute pixel position
    fn move_pointer(&mut self, x: i32, y: i32) -> Result<(), InputError>;

    /// Press and release a mouse button at the pointer position
    fn click(&mut self, button: MouseButton) -> Result<(), InputError>;

    /// Press and release a key
    fn key_press(&mut self, key: NamedKey) -> Result<(), InputError>;

    /// Type a string
    fn type_text(&mut self, text: &str) -> Result<(), InputError>;

    /// Scroll the wheel vertically by whole notches, positive is down
    fn scroll(&mut self, notches: i32) -> Result<(), InputError>;
}

/// Platform capabilities used by the agent
pub trait Backend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Open a capture handle for the primary display
    fn open_screen(&self) -> Result<Box<dyn ScreenSource>, CaptureError>;

    /// Open an input injection handle
    fn open_input(&self) -> Result<Box<dyn InputSink>, InputError>;

    /// Lock the interactive session
    fn lock_session(&self) -> Result<(), InputError>;
}

/// Pick the backend for the OS this binary was built for
pub fn select_backend() -> Arc<dyn Backend> {
    #[cfg(target_os = "windows")]
    let backend: Arc<dyn Backend> = Arc::new(WindowsBackend);
    #[cfg(target_os = "macos")]
    let backend: Arc<dyn Backend> = Arc::new(MacOsBackend);
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let backend: Arc<dyn Backend> = Arc::new(LinuxBackend);

    tracing::info!("Using {} platform backend", backend.name());
    backend
}

/// External command that locks the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockCommand {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl LockCommand {
    /// Run the command, mapping a missing binary or non-zero exit to an error
    pub fn run(&self) -> Result<(), InputError> {
        let status = Command::new(self.program)
            .args(self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| InputError::LockFailed(format!("{}: {}", self.program, e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(InputError::LockFailed(format!(
                "{} exited with {}",
                self.program, status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_lock_binary_is_an_error() {
        let cmd = LockCommand {
            program: "watchsec-definitely-not-installed",
            args: &[],
        };
        assert!(matches!(cmd.run(), Err(InputError::LockFailed(_))));
    }

    #[test]
    fn test_backend_is_selected() {
        let backend = select_backend();
        assert!(!backend.name().is_empty());
    }
}

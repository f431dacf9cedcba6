//! Per-OS backends
//!
//! Capture and input go through the cross-platform native layer when the
//! `native` feature is enabled; the lock call is specific to each OS.

use super::{Backend, InputSink, LockCommand, ScreenSource};
use crate::error::{CaptureError, InputError};

/// Windows: `LockWorkStation` through rundll32
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsBackend;

/// macOS: put the display to sleep, which locks when a password is required
#[derive(Debug, Clone, Copy, Default)]
pub struct MacOsBackend;

/// Linux and other unixes: ask logind to lock the session
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxBackend;

impl WindowsBackend {
    pub const LOCK: LockCommand = LockCommand {
        program: "rundll32.exe",
        args: &["user32.dll,LockWorkStation"],
    };
}

impl MacOsBackend {
    pub const LOCK: LockCommand = LockCommand {
        program: "pmset",
        args: &["displaysleepnow"],
    };
}

impl LinuxBackend {
    pub const LOCK: LockCommand = LockCommand {
        program: "loginctl",
        args: &["lock-session"],
    };
}

impl Backend for WindowsBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn open_screen(&self) -> Result<Box<dyn ScreenSource>, CaptureError> {
        open_screen()
    }

    fn open_input(&self) -> Result<Box<dyn InputSink>, InputError> {
        open_input()
    }

    fn lock_session(&self) -> Result<(), InputError> {
        Self::LOCK.run()
    }
}

impl Backend for MacOsBackend {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn open_screen(&self) -> Result<Box<dyn ScreenSource>, CaptureError> {
        open_screen()
    }

    fn open_input(&self) -> Result<Box<dyn InputSink>, InputError> {
        open_input()
    }

    fn lock_session(&self) -> Result<(), InputError> {
        Self::LOCK.run()
    }
}

impl Backend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn open_screen(&self) -> Result<Box<dyn ScreenSource>, CaptureError> {
        open_screen()
    }

    fn open_input(&self) -> Result<Box<dyn InputSink>, InputError> {
        open_input()
    }

    fn lock_session(&self) -> Result<(), InputError> {
        Self::LOCK.run()
    }
}

#[cfg(feature = "native")]
fn open_screen() -> Result<Box<dyn ScreenSource>, CaptureError> {
    super::native::open_screen()
}

#[cfg(not(feature = "native"))]
fn open_screen() -> Result<Box<dyn ScreenSource>, CaptureError> {
    Err(CaptureError::Unavailable(
        "built without the `native` feature".to_string(),
    ))
}

#[cfg(feature = "native")]
fn open_input() -> Result<Box<dyn InputSink>, InputError> {
    super::native::open_input()
}

#[cfg(not(feature = "native"))]
fn open_input() -> Result<Box<dyn InputSink>, InputError> {
    Err(InputError::Unavailable(
        "built without the `native` feature".to_string(),
    ))
}

//! Desktop capture with xcap and input injection with enigo

use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use image::RgbaImage;
use xcap::Monitor;

use watchsec_protocol::MouseButton;

use super::{InputSink, ScreenSource};
use crate::error::{CaptureError, InputError};
use crate::input::NamedKey;

struct MonitorSource {
    monitor: Monitor,
}

pub(super) fn open_screen() -> Result<Box<dyn ScreenSource>, CaptureError> {
    let monitors = Monitor::all().map_err(|e| CaptureError::Unavailable(e.to_string()))?;
    let primary = monitors.iter().position(|m| m.is_primary()).unwrap_or(0);
    let monitor = monitors
        .into_iter()
        .nth(primary)
        .ok_or_else(|| CaptureError::Unavailable("no display found".to_string()))?;

    tracing::debug!(
        "Capturing display {} ({}x{})",
        monitor.name(),
        monitor.width(),
        monitor.height()
    );
    Ok(Box::new(MonitorSource { monitor }))
}

impl ScreenSource for MonitorSource {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
        self.monitor
            .capture_image()
            .map_err(|e| CaptureError::Capture(e.to_string()))
    }
}

struct EnigoSink {
    enigo: Enigo,
}

pub(super) fn open_input() -> Result<Box<dyn InputSink>, InputError> {
    let enigo =
        Enigo::new(&Settings::default()).map_err(|e| InputError::Unavailable(e.to_string()))?;
    Ok(Box::new(EnigoSink { enigo }))
}

fn backend_err(e: impl std::fmt::Display) -> InputError {
    InputError::Backend(e.to_string())
}

fn to_key(key: NamedKey) -> Key {
    match key {
        NamedKey::Enter => Key::Return,
        NamedKey::Escape => Key::Escape,
        NamedKey::Tab => Key::Tab,
        NamedKey::Backspace => Key::Backspace,
        NamedKey::Delete => Key::Delete,
        NamedKey::Space => Key::Space,
        NamedKey::Up => Key::UpArrow,
        NamedKey::Down => Key::DownArrow,
        NamedKey::Left => Key::LeftArrow,
        NamedKey::Right => Key::RightArrow,
        NamedKey::Home => Key::Home,
        NamedKey::End => Key::End,
        NamedKey::PageUp => Key::PageUp,
        NamedKey::PageDown => Key::PageDown,
        NamedKey::Ctrl => Key::Control,
        NamedKey::Alt => Key::Alt,
        NamedKey::Shift => Key::Shift,
        NamedKey::Meta => Key::Meta,
        NamedKey::CapsLock => Key::CapsLock,
        NamedKey::Function(n) => match n {
            1 => Key::F1,
            2 => Key::F2,
            3 => Key::F3,
            4 => Key::F4,
            5 => Key::F5,
            6 => Key::F6,
            7 => Key::F7,
            8 => Key::F8,
            9 => Key::F9,
            10 => Key::F10,
            11 => Key::F11,
            _ => Key::F12,
        },
        NamedKey::Char(c) => Key::Unicode(c),
    }
}

impl InputSink for EnigoSink {
    fn display_size(&mut self) -> Result<(u32, u32), InputError> {
        let (w, h) = self.enigo.main_display().map_err(backend_err)?;
        Ok((w.max(0) as u32, h.max(0) as u32))
    }

    fn move_pointer(&mut self, x: i32, y: i32) -> Result<(), InputError> {
        self.enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(backend_err)
    }

    fn click(&mut self, button: MouseButton) -> Result<(), InputError> {
        let button = match button {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
            MouseButton::Middle => Button::Middle,
        };
        self.enigo
            .button(button, Direction::Click)
            .map_err(backend_err)
    }

    fn key_press(&mut self, key: NamedKey) -> Result<(), InputError> {
        self.enigo
            .key(to_key(key), Direction::Click)
            .map_err(backend_err)
    }

    fn type_text(&mut self, text: &str) -> Result<(), InputError> {
        self.enigo.text(text).map_err(backend_err)
    }

    fn scroll(&mut self, notches: i32) -> Result<(), InputError> {
        self.enigo
            .scroll(notches, Axis::Vertical)
            .map_err(backend_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modifiers_map_to_enigo_keys() {
        for (name, key) in [
            ("ctrl", Key::Control),
            ("alt", Key::Alt),
            ("shift", Key::Shift),
            ("win", Key::Meta),
            ("capslock", Key::CapsLock),
        ] {
            assert_eq!(to_key(NamedKey::parse(name).unwrap()), key, "{}", name);
        }
        assert_eq!(to_key(NamedKey::Function(12)), Key::F12);
    }
}

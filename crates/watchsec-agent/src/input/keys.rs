//! Key names accepted in `keyPress` commands
//!
//! Dashboards send the names their browser-side tooling uses (`enter`,
//! `esc`, `pgdn`, `f5`, single characters). Names are case-insensitive,
//! except for single characters, which are taken literally.

use crate::error::InputError;

/// A key the input backend can press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKey {
    Enter,
    Escape,
    Tab,
    Backspace,
    Delete,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Ctrl,
    Alt,
    Shift,
    /// Windows key on Windows, Command on macOS, Super on Linux
    Meta,
    CapsLock,
    /// F1 through F12
    Function(u8),
    /// Any single printable character
    Char(char),
}

impl NamedKey {
    /// Parse a key name
    pub fn parse(name: &str) -> Result<Self, InputError> {
        let mut chars = name.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if !c.is_control() {
                return Ok(NamedKey::Char(c));
            }
        }

        let lower = name.trim().to_ascii_lowercase();
        let key = match lower.as_str() {
            "enter" | "return" => NamedKey::Enter,
            "esc" | "escape" => NamedKey::Escape,
            "tab" => NamedKey::Tab,
            "backspace" => NamedKey::Backspace,
            "delete" | "del" => NamedKey::Delete,
            "space" => NamedKey::Space,
            "up" | "arrowup" => NamedKey::Up,
            "down" | "arrowdown" => NamedKey::Down,
            "left" | "arrowleft" => NamedKey::Left,
            "right" | "arrowright" => NamedKey::Right,
            "home" => NamedKey::Home,
            "end" => NamedKey::End,
            "pageup" | "pgup" => NamedKey::PageUp,
            "pagedown" | "pgdn" => NamedKey::PageDown,
            "ctrl" | "control" | "ctrlleft" | "ctrlright" => NamedKey::Ctrl,
            "alt" | "altleft" | "altright" | "option" => NamedKey::Alt,
            "shift" | "shiftleft" | "shiftright" => NamedKey::Shift,
            "win" | "winleft" | "winright" | "command" | "cmd" | "meta" | "super" => NamedKey::Meta,
            "capslock" => NamedKey::CapsLock,
            other => match other.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                Some(n @ 1..=12) => NamedKey::Function(n),
                _ => return Err(InputError::UnknownKey(name.to_string())),
            },
        };
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_keys() {
        assert_eq!(NamedKey::parse("enter").unwrap(), NamedKey::Enter);
        assert_eq!(NamedKey::parse("Return").unwrap(), NamedKey::Enter);
        assert_eq!(NamedKey::parse("ESC").unwrap(), NamedKey::Escape);
        assert_eq!(NamedKey::parse("pgdn").unwrap(), NamedKey::PageDown);
        assert_eq!(NamedKey::parse("ArrowLeft").unwrap(), NamedKey::Left);
    }

    #[test]
    fn test_modifier_and_lock_keys() {
        assert_eq!(NamedKey::parse("ctrl").unwrap(), NamedKey::Ctrl);
        assert_eq!(NamedKey::parse("CtrlLeft").unwrap(), NamedKey::Ctrl);
        assert_eq!(NamedKey::parse("alt").unwrap(), NamedKey::Alt);
        assert_eq!(NamedKey::parse("SHIFT").unwrap(), NamedKey::Shift);
        assert_eq!(NamedKey::parse("win").unwrap(), NamedKey::Meta);
        assert_eq!(NamedKey::parse("command").unwrap(), NamedKey::Meta);
        assert_eq!(NamedKey::parse("capslock").unwrap(), NamedKey::CapsLock);
    }

    #[test]
    fn test_function_keys() {
        assert_eq!(NamedKey::parse("f5").unwrap(), NamedKey::Function(5));
        assert_eq!(NamedKey::parse("F12").unwrap(), NamedKey::Function(12));
        assert!(NamedKey::parse("f13").is_err());
        assert!(NamedKey::parse("f0").is_err());
    }

    #[test]
    fn test_single_characters_are_literal() {
        assert_eq!(NamedKey::parse("a").unwrap(), NamedKey::Char('a'));
        assert_eq!(NamedKey::parse("A").unwrap(), NamedKey::Char('A'));
        assert_eq!(NamedKey::parse("é").unwrap(), NamedKey::Char('é'));
        assert_eq!(NamedKey::parse("f").unwrap(), NamedKey::Char('f'));
    }

    #[test]
    fn test_unknown_key() {
        assert!(matches!(
            NamedKey::parse("hyper"),
            Err(InputError::UnknownKey(name)) if name == "hyper"
        ));
        assert!(NamedKey::parse("").is_err());
        assert!(NamedKey::parse("\n").is_err());
    }
}

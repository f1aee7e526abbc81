//! Logical keys usable in a toggle combination.

use std::fmt;
use std::str::FromStr;

/// A key that can be part of a toggle combination.
///
/// Modifier keys are side-agnostic: both the left and right physical keys
/// map to the same logical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToggleKey {
    Shift,
    Ctrl,
    Alt,
    Tab,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
}

const VK_TAB: u16 = 0x09;
const VK_SHIFT: u16 = 0x10;
const VK_CONTROL: u16 = 0x11;
const VK_MENU: u16 = 0x12;
const VK_F1: u16 = 0x70;
const VK_F12: u16 = 0x7B;
const VK_LSHIFT: u16 = 0xA0;
const VK_RSHIFT: u16 = 0xA1;
const VK_LCONTROL: u16 = 0xA2;
const VK_RCONTROL: u16 = 0xA3;
const VK_LMENU: u16 = 0xA4;
const VK_RMENU: u16 = 0xA5;

const FUNCTION_KEYS: [ToggleKey; 12] = [
    ToggleKey::F1,
    ToggleKey::F2,
    ToggleKey::F3,
    ToggleKey::F4,
    ToggleKey::F5,
    ToggleKey::F6,
    ToggleKey::F7,
    ToggleKey::F8,
    ToggleKey::F9,
    ToggleKey::F10,
    ToggleKey::F11,
    ToggleKey::F12,
];

impl ToggleKey {
    /// The Win32 virtual-key code of the key.
    pub fn to_vkey(self) -> u16 {
        match self {
            ToggleKey::Shift => VK_SHIFT,
            ToggleKey::Ctrl => VK_CONTROL,
            ToggleKey::Alt => VK_MENU,
            ToggleKey::Tab => VK_TAB,
            function => {
                let index = FUNCTION_KEYS.iter().position(|&k| k == function).unwrap_or(0);
                VK_F1 + index as u16
            },
        }
    }

    /// Map a Win32 virtual-key code, including side-specific modifiers, to a
    /// logical key.
    pub fn from_vkey(vkey: u16) -> Option<Self> {
        match vkey {
            VK_SHIFT | VK_LSHIFT | VK_RSHIFT => Some(ToggleKey::Shift),
            VK_CONTROL | VK_LCONTROL | VK_RCONTROL => Some(ToggleKey::Ctrl),
            VK_MENU | VK_LMENU | VK_RMENU => Some(ToggleKey::Alt),
            VK_TAB => Some(ToggleKey::Tab),
            VK_F1..=VK_F12 => Some(FUNCTION_KEYS[(vkey - VK_F1) as usize]),
            _ => None,
        }
    }
}

impl fmt::Display for ToggleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToggleKey::Shift => "SHIFT",
            ToggleKey::Ctrl => "CTRL",
            ToggleKey::Alt => "ALT",
            ToggleKey::Tab => "TAB",
            ToggleKey::F1 => "F1",
            ToggleKey::F2 => "F2",
            ToggleKey::F3 => "F3",
            ToggleKey::F4 => "F4",
            ToggleKey::F5 => "F5",
            ToggleKey::F6 => "F6",
            ToggleKey::F7 => "F7",
            ToggleKey::F8 => "F8",
            ToggleKey::F9 => "F9",
            ToggleKey::F10 => "F10",
            ToggleKey::F11 => "F11",
            ToggleKey::F12 => "F12",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an unknown key name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKey(pub String);

impl fmt::Display for UnknownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown toggle key `{}`", self.0)
    }
}

impl std::error::Error for UnknownKey {}

impl FromStr for ToggleKey {
    type Err = UnknownKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "SHIFT" => Ok(ToggleKey::Shift),
            "CTRL" | "CONTROL" => Ok(ToggleKey::Ctrl),
            "ALT" | "MENU" => Ok(ToggleKey::Alt),
            "TAB" => Ok(ToggleKey::Tab),
            _ => upper
                .strip_prefix('F')
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| FUNCTION_KEYS.get(i).copied())
                .ok_or_else(|| UnknownKey(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_specific_modifiers_collapse() {
        assert_eq!(ToggleKey::from_vkey(VK_LSHIFT), Some(ToggleKey::Shift));
        assert_eq!(ToggleKey::from_vkey(VK_RCONTROL), Some(ToggleKey::Ctrl));
        assert_eq!(ToggleKey::from_vkey(VK_LMENU), Some(ToggleKey::Alt));
        assert_eq!(ToggleKey::from_vkey(0x41), None);
    }

    #[test]
    fn function_keys_map_both_ways() {
        for key in FUNCTION_KEYS {
            assert_eq!(ToggleKey::from_vkey(key.to_vkey()), Some(key));
        }
        assert_eq!(ToggleKey::F2.to_vkey(), 0x71);
    }

    #[test]
    fn parse_key_names() {
        assert_eq!("shift".parse(), Ok(ToggleKey::Shift));
        assert_eq!("F12".parse(), Ok(ToggleKey::F12));
        assert!("F13".parse::<ToggleKey>().is_err());
        assert!("F0".parse::<ToggleKey>().is_err());
    }
}

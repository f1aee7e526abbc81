//! Classification of window messages withheld from the host application.

use bitflags::bitflags;

const WM_ACTIVATE: u32 = 0x0006;
const WM_SETFOCUS: u32 = 0x0007;
const WM_KILLFOCUS: u32 = 0x0008;
const WM_ACTIVATEAPP: u32 = 0x001C;
const WM_SETCURSOR: u32 = 0x0020;
const WM_MOUSEACTIVATE: u32 = 0x0021;
const WM_INPUT: u32 = 0x00FF;
const WM_KEYFIRST: u32 = 0x0100;
const WM_KEYLAST: u32 = 0x0109;
const WM_MOUSEFIRST: u32 = 0x0200;
const WM_MOUSELAST: u32 = 0x020E;

bitflags! {
    /// Types of window message withheld from the host while its inputs are
    /// hidden.
    ///
    /// Combine flags with bitwise-or.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct MessageFilter: u32 {
        /// Keyboard messages, `WM_KEYFIRST..=WM_KEYLAST`.
        const InputKeyboard = 1u32 << 0;
        /// Mouse messages, `WM_MOUSEFIRST..=WM_MOUSELAST`.
        const InputMouse = 1u32 << 1;
        /// `WM_INPUT`.
        const InputRaw = 1u32 << 2;
        /// `WM_SETCURSOR`, so the host cannot change the cursor shape.
        const Cursor = 1u32 << 3;

        /// Window gain/lose focus messages.
        const WindowFocus = 1u32 << 8;

        /// Keyboard, mouse and raw input messages.
        const InputAll = Self::InputKeyboard.bits() | Self::InputMouse.bits() | Self::InputRaw.bits();
    }
}

impl Default for MessageFilter {
    fn default() -> Self {
        MessageFilter::InputAll | MessageFilter::Cursor
    }
}

impl MessageFilter {
    /// Whether `message_id` is withheld by this filter.
    pub fn is_blocking(&self, message_id: u32) -> bool {
        match message_id {
            WM_KEYFIRST..=WM_KEYLAST => self.contains(Self::InputKeyboard),
            WM_MOUSEFIRST..=WM_MOUSELAST => self.contains(Self::InputMouse),
            WM_INPUT => self.contains(Self::InputRaw),
            WM_SETCURSOR => self.contains(Self::Cursor),
            WM_MOUSEACTIVATE | WM_ACTIVATEAPP | WM_ACTIVATE | WM_SETFOCUS | WM_KILLFOCUS => {
                self.contains(Self::WindowFocus)
            },
            _ => false,
        }
    }
}

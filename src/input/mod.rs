//! Input observation and the overlay toggle.
//!
//! The [`InputHook`] sits between the windowing hook, which feeds it native
//! events, and the overlay. It derives an edge-triggered toggle signal from a
//! [`ToggleCombination`], queues events for the overlay and tells the window
//! hook which events must be withheld from the host application.
//!
//! Locking: the hook keeps its own lock, never held while the toggle callback
//! runs, so the callback is free to call back into the hook.

use std::collections::{BTreeSet, VecDeque};

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, trace};

mod keys;
mod msg_filter;

pub use keys::{ToggleKey, UnknownKey};
pub use msg_filter::MessageFilter;

/// Callback invoked on every toggle edge. Returns the overlay visibility the
/// caller settled on.
pub type ToggleCallback = Box<dyn FnMut() -> bool + Send>;

const EVENT_QUEUE_CAPACITY: usize = 256;

bitflags! {
    /// Mouse buttons currently held down.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MouseButtons: u8 {
        /// Left button.
        const LEFT = 1 << 0;
        /// Right button.
        const RIGHT = 1 << 1;
        /// Middle button.
        const MIDDLE = 1 << 2;
        /// First extended button.
        const X1 = 1 << 3;
        /// Second extended button.
        const X2 = 1 << 4;
    }
}

/// A native input event, already decoded by the windowing hook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// A key went down or up. `vkey` is a Win32 virtual-key code.
    Key { vkey: u16, pressed: bool },
    /// A text character was produced.
    Character(char),
    /// A mouse button went down or up.
    MouseButton { button: MouseButtons, pressed: bool },
    /// The cursor moved, in client coordinates.
    MouseMove { x: i32, y: i32 },
    /// The wheel turned by `delta` notches.
    Wheel { delta: f32, horizontal: bool },
}

/// Set of keys whose simultaneous press toggles the overlay.
///
/// Membership only: order and duplicates are irrelevant. [`update`] reports
/// `true` exactly once per interval during which all members are held.
///
/// [`update`]: ToggleCombination::update
#[derive(Debug, Clone, Default)]
pub struct ToggleCombination {
    keys: BTreeSet<ToggleKey>,
    pressed: BTreeSet<ToggleKey>,
    fully_pressed: bool,
}

impl ToggleCombination {
    /// Create a combination. An empty combination never fires.
    pub fn new(keys: impl IntoIterator<Item = ToggleKey>) -> Self {
        Self { keys: keys.into_iter().collect(), ..Default::default() }
    }

    /// Configured keys.
    pub fn keys(&self) -> impl Iterator<Item = ToggleKey> + '_ {
        self.keys.iter().copied()
    }

    /// Whether every key of the combination is currently held.
    pub fn is_fully_pressed(&self) -> bool {
        self.fully_pressed
    }

    /// Record a key transition. Returns `true` on the not-fully-pressed to
    /// fully-pressed edge.
    pub fn update(&mut self, key: ToggleKey, pressed: bool) -> bool {
        if !self.keys.contains(&key) {
            return false;
        }

        if pressed {
            self.pressed.insert(key);
        } else {
            self.pressed.remove(&key);
        }

        let now = !self.keys.is_empty() && self.pressed.len() == self.keys.len();
        let edge = now && !self.fully_pressed;
        self.fully_pressed = now;
        edge
    }

    /// Forget every held key, re-arming the combination.
    pub fn reset(&mut self) {
        self.pressed.clear();
        self.fully_pressed = false;
    }
}

struct InputState {
    combination: ToggleCombination,
    app_inputs_hidden: bool,
    overlay_inputs_hidden: bool,
    saved_cursor: (i32, i32),
    events: VecDeque<InputEvent>,
}

/// Cooperative input hook.
pub struct InputHook {
    state: Mutex<InputState>,
    toggle: Mutex<Option<ToggleCallback>>,
}

impl InputHook {
    /// Create a hook toggling on `keys`. Overlay inputs start hidden and
    /// application inputs start visible.
    pub fn new(keys: impl IntoIterator<Item = ToggleKey>, toggle: Option<ToggleCallback>) -> Self {
        Self {
            state: Mutex::new(InputState {
                combination: ToggleCombination::new(keys),
                app_inputs_hidden: false,
                overlay_inputs_hidden: true,
                saved_cursor: (0, 0),
                events: VecDeque::new(),
            }),
            toggle: Mutex::new(toggle),
        }
    }

    /// Replace the toggle callback.
    pub fn set_toggle_callback(&self, toggle: Option<ToggleCallback>) {
        *self.toggle.lock() = toggle;
    }

    /// Record a key transition and fire the toggle callback on the edge.
    ///
    /// The callback runs synchronously on the calling thread. Its result
    /// becomes the overlay visibility: while visible the application inputs
    /// are hidden and the overlay receives inputs, and vice versa.
    pub fn on_key(&self, key: ToggleKey, pressed: bool) {
        let edge = self.state.lock().combination.update(key, pressed);
        if !edge {
            return;
        }

        let visible = match self.toggle.lock().as_mut() {
            Some(toggle) => toggle(),
            None => return,
        };
        debug!("Overlay toggled, visible: {visible}");

        let mut state = self.state.lock();
        state.app_inputs_hidden = visible;
        state.overlay_inputs_hidden = !visible;
        if !visible {
            state.events.clear();
        }
    }

    /// Feed a native event. Returns `true` when the host application must
    /// not see it.
    pub fn on_event(&self, event: InputEvent) -> bool {
        trace!("Input event {event:?}");
        if let InputEvent::Key { vkey, pressed } = event {
            if let Some(key) = ToggleKey::from_vkey(vkey) {
                self.on_key(key, pressed);
            }
        }

        let mut state = self.state.lock();
        if !state.overlay_inputs_hidden {
            if state.events.len() == EVENT_QUEUE_CAPACITY {
                state.events.pop_front();
            }
            state.events.push_back(event);
        }
        state.app_inputs_hidden
    }

    /// Take the events queued for the overlay since the last call.
    pub fn drain_events(&self) -> Vec<InputEvent> {
        self.state.lock().events.drain(..).collect()
    }

    /// Hide or show inputs to the host application.
    pub fn hide_app_inputs(&self, hide: bool) {
        self.state.lock().app_inputs_hidden = hide;
    }

    /// Hide or show inputs to the overlay.
    pub fn hide_overlay_inputs(&self, hide: bool) {
        let mut state = self.state.lock();
        state.overlay_inputs_hidden = hide;
        if hide {
            state.events.clear();
        }
    }

    /// Whether the host application currently receives inputs.
    pub fn app_inputs_hidden(&self) -> bool {
        self.state.lock().app_inputs_hidden
    }

    /// Whether the overlay currently receives inputs.
    pub fn overlay_inputs_hidden(&self) -> bool {
        self.state.lock().overlay_inputs_hidden
    }

    /// Cursor position, in screen coordinates, the host application should
    /// observe. While application inputs are hidden this is the last live
    /// position seen before they stopped being forwarded.
    pub fn cursor_position(&self, live: (i32, i32)) -> (i32, i32) {
        let mut state = self.state.lock();
        if state.app_inputs_hidden {
            state.saved_cursor
        } else {
            state.saved_cursor = live;
            live
        }
    }

    /// Mouse buttons the host application should observe. Nothing is held
    /// while application inputs are hidden.
    pub fn pressed_mouse_buttons(&self, live: MouseButtons) -> MouseButtons {
        if self.state.lock().app_inputs_hidden {
            MouseButtons::empty()
        } else {
            live
        }
    }

    /// Forget held keys and pending events.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.combination.reset();
        state.events.clear();
    }
}

//! Tunables shared by the detector and the render hooks.

use std::time::Duration;

use crate::input::ToggleKey;

/// Default detection timeout used by [`overlay_hook!`](crate::overlay_hook).
pub const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Runtime configuration of the overlay engine.
///
/// ```
/// use std::time::Duration;
///
/// use overlay_hook::input::ToggleKey;
/// use overlay_hook::OverlayConfig;
///
/// let config = OverlayConfig::default()
///     .with_toggle_keys([ToggleKey::Ctrl, ToggleKey::F1])
///     .with_detection_timeout(Duration::from_secs(5));
/// assert_eq!(config.toggle_keys.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Keys that toggle the overlay when pressed together. Used when
    /// `start_hook` is given an empty key set.
    pub toggle_keys: Vec<ToggleKey>,
    /// How long a detection request keeps probing before resolving to `None`.
    pub detection_timeout: Duration,
    /// Delay between two probing rounds of a detection request.
    pub detection_poll_interval: Duration,
    /// Number of descriptors in the shader-visible heap. Slot 0 belongs to
    /// the UI font atlas, the rest back image resources.
    pub texture_descriptor_count: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            toggle_keys: vec![ToggleKey::Shift, ToggleKey::F2],
            detection_timeout: DEFAULT_DETECTION_TIMEOUT,
            detection_poll_interval: Duration::from_millis(100),
            texture_descriptor_count: 64,
        }
    }
}

impl OverlayConfig {
    /// Replace the default toggle combination.
    pub fn with_toggle_keys(mut self, keys: impl IntoIterator<Item = ToggleKey>) -> Self {
        self.toggle_keys = keys.into_iter().collect();
        self
    }

    /// Replace the detection timeout.
    pub fn with_detection_timeout(mut self, timeout: Duration) -> Self {
        self.detection_timeout = timeout;
        self
    }

    /// Replace the delay between probing rounds.
    pub fn with_detection_poll_interval(mut self, interval: Duration) -> Self {
        self.detection_poll_interval = interval;
        self
    }

    /// Replace the size of the shader-visible descriptor heap. Values below 1
    /// are raised to 1 so the font atlas always has a slot.
    pub fn with_texture_descriptor_count(mut self, count: u32) -> Self {
        self.texture_descriptor_count = count.max(1);
        self
    }
}

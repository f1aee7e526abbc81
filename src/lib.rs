//! # overlay-hook
//!
//! This library draws an overlay on top of another process's running
//! graphics pipeline, from inside that process. It:
//!
//! - detects which graphics backend the host uses ([`detector`]);
//! - redirects the backend's present, resize and submission entry points
//!   through a patch primitive ([`mh`]);
//! - lazily builds the GPU objects the overlay needs and rebuilds them
//!   whenever the host resizes its swap chain ([`hooks::dx12`]);
//! - injects the overlay command list into every presented frame;
//! - watches keyboard and mouse input to toggle the overlay ([`input`]).
//!
//! DirectX 12 is the supported backend.
//!
//! ## Fair warning
//!
//! This crate patches live code of a process it does not own. It contains a
//! hefty amount of FFI and `unsafe` code. Every interception path forwards to
//! the original function even when the overlay fails, but a bug in a
//! detour still crashes the host.
//!
//! ## Usage
//!
//! Build your crate as a `cdylib`, implement [`OverlayRenderLoop`] and let
//! [`overlay_hook!`] generate the `DllMain` entry point. The closure receives
//! the detected hook once a backend is found:
//!
//! ```no_run
//! use overlay_hook::hooks::RendererHook;
//! use overlay_hook::{OverlayRenderLoop, RenderContext};
//!
//! struct MyOverlay;
//!
//! impl OverlayRenderLoop for MyOverlay {
//!     fn render(&mut self, _ctx: &mut dyn RenderContext) {
//!         // Build the UI of the frame.
//!     }
//! }
//!
//! # #[cfg(windows)]
//! overlay_hook::overlay_hook!(|hook: std::sync::Arc<dyn RendererHook>| {
//!     let mut visible = false;
//!     hook.set_render_loop(Box::new(MyOverlay));
//!     hook.start_hook(
//!         Box::new(move || {
//!             visible = !visible;
//!             visible
//!         }),
//!         &[],
//!     );
//! });
//! ```
//!
//! Detection, hooking and unloading can also be driven by hand through
//! [`registry::OverlayRegistry`] and [`detector::RendererDetector`].
#![warn(missing_docs)]

use std::sync::Weak;

pub mod config;
pub mod detector;
pub mod hooks;
pub mod input;
pub mod mh;
pub mod registry;
pub mod util;

pub use config::OverlayConfig;
pub use input::{MessageFilter, ToggleCallback, ToggleKey};
pub use tracing;
#[cfg(windows)]
pub use windows;

/// An image uploaded to the GPU for the overlay.
#[derive(Debug)]
pub struct ImageResource {
    id: u64,
    width: u32,
    height: u32,
    slot: u32,
}

impl ImageResource {
    pub(crate) fn new(id: u64, width: u32, height: u32, slot: u32) -> Self {
        Self { id, width, height, slot }
    }

    /// Backend handle of the image. For DirectX 12 this is the GPU
    /// descriptor handle of its shader resource view.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Descriptor slot backing the image.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

/// Texture management available to render loop callbacks.
pub trait RenderContext {
    /// Upload an RGBA8 image. A dead handle is returned on failure.
    fn create_image_resource(&mut self, data: &[u8], width: u32, height: u32) -> Weak<ImageResource>;

    /// Release an image created through this context or the hook.
    fn release_image_resource(&mut self, image: Weak<ImageResource>);
}

/// Callbacks of the overlay.
///
/// All methods run on the host's render thread with the hook locked.
/// Use the provided [`RenderContext`] for texture work; calling back into
/// the [`RendererHook`](hooks::RendererHook) from here deadlocks.
pub trait OverlayRenderLoop: Send {
    /// Called after every successful GPU resource acquisition, before
    /// [`OverlayRenderLoop::hook_ready`]. Images from a previous acquisition
    /// are gone at this point; recreate them here.
    fn initialize(&mut self, _ctx: &mut dyn RenderContext) {}

    /// Called when GPU resources become valid (`true`) or invalid (`false`).
    fn hook_ready(&mut self, _ready: bool) {}

    /// Called once per presented frame. Visibility is up to the
    /// implementation.
    fn render(&mut self, ctx: &mut dyn RenderContext);
}

#[cfg(windows)]
mod entry {
    use std::sync::Arc;
    use std::thread;

    use once_cell::sync::OnceCell;
    use tracing::{error, info};
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::FreeLibraryAndExitThread;

    use crate::detector::RendererDetector;
    use crate::hooks::dx12::native::Dx12Probe;
    use crate::hooks::{wait_for_detours, RendererHook};
    use crate::registry::OverlayRegistry;
    use crate::OverlayConfig;

    static MODULE: OnceCell<isize> = OnceCell::new();

    /// Remember the module handle for [`eject`]. Called by [`overlay_hook!`](crate::overlay_hook).
    pub fn set_module(module: isize) {
        let _ = MODULE.set(module);
    }

    /// Detect the renderer with the default configuration and hand the hook
    /// to `setup`. Called by [`overlay_hook!`](crate::overlay_hook) on a
    /// dedicated thread.
    pub fn attach<F>(setup: F)
    where
        F: FnOnce(Arc<dyn RendererHook>),
    {
        let config = OverlayConfig::default();
        let registry = Arc::clone(OverlayRegistry::global());
        let detector = RendererDetector::new(
            registry,
            vec![Box::new(Dx12Probe::new(config.clone()))],
            config,
        );

        match detector.detect_default().wait() {
            Some(hook) => {
                info!("Renderer detected: {}", hook.library_name());
                setup(hook);
            },
            None => error!("No supported renderer detected"),
        }

        detector.free();
    }

    /// Unhook everything and unload the DLL.
    ///
    /// Call it from anywhere but the render loop callbacks, which run with
    /// the hook locked.
    pub fn eject() {
        thread::spawn(|| unsafe {
            OverlayRegistry::global().unload();
            wait_for_detours();

            let _ = crate::mh::MH_STATUS::from_raw(minhook_sys::MH_Uninitialize() as i32)
                .ok_context("MH_Uninitialize");

            if let Some(&module) = MODULE.get() {
                FreeLibraryAndExitThread(HMODULE(module), 0);
            }
        });
    }
}

#[cfg(windows)]
pub use entry::{attach, eject, set_module};

/// Entry point generator.
///
/// Generates a `DllMain` that, on process attach, detects the renderer on a
/// new thread and passes the resulting hook to the given closure. The
/// closure is expected to register a render loop and call
/// [`RendererHook::start_hook`](hooks::RendererHook::start_hook).
#[cfg(windows)]
#[macro_export]
macro_rules! overlay_hook {
    ($setup:expr) => {
        /// Entry point created by the `overlay-hook` library.
        #[no_mangle]
        pub unsafe extern "system" fn DllMain(
            hmodule: ::overlay_hook::windows::Win32::Foundation::HMODULE,
            reason: u32,
            _: *mut ::std::ffi::c_void,
        ) -> ::overlay_hook::windows::Win32::Foundation::BOOL {
            if reason == ::overlay_hook::windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH {
                ::overlay_hook::tracing::trace!("DllMain()");
                ::overlay_hook::set_module(hmodule.0);
                ::std::thread::spawn(move || ::overlay_hook::attach($setup));
            }
            ::overlay_hook::windows::Win32::Foundation::BOOL(1)
        }
    };
}

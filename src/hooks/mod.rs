//! Render hooks and the contracts they share.
//!
//! A render hook intercepts one graphics backend. The crate ships the
//! DirectX 12 hook in [`dx12`]; other backends implement [`RendererHook`] and
//! plug into the [`RendererDetector`](crate::detector::RendererDetector)
//! through a [`RendererProbe`](crate::detector::RendererProbe).

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::{fmt, hint};

use crate::input::{InputHook, ToggleCallback, ToggleKey};
use crate::{ImageResource, OverlayRenderLoop};

pub mod dx12;
#[cfg(windows)]
pub mod window;

/// Whether the backend entry points are redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    /// Nothing is redirected.
    Unhooked,
    /// The present, resize and submission entry points are redirected.
    Hooked,
}

/// Whether the overlay-owned GPU resources exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// No GPU resources. The next present acquires them.
    Uninitialized,
    /// Every frame resource is valid for the current swap chain.
    Initialized,
}

/// Host contract of a render hook.
///
/// There is at most one live instance per process, owned by the
/// [`OverlayRegistry`](crate::registry::OverlayRegistry).
pub trait RendererHook: Send + Sync {
    /// Redirect the backend entry points and start observing input.
    ///
    /// `toggle` fires on every press edge of `keys`; an empty `keys` selects
    /// the configured default combination. Returns `false` without changing
    /// any state when an entry point is unresolved or patching fails. Calling
    /// it again once hooked is a no-op returning `true`.
    fn start_hook(&self, toggle: ToggleCallback, keys: &[ToggleKey]) -> bool;

    /// Whether [`RendererHook::start_hook`] succeeded.
    fn is_started(&self) -> bool;

    /// Name of the module implementing the hooked backend.
    fn library_name(&self) -> &str;

    /// Register the frame and readiness callbacks.
    fn set_render_loop(&self, render_loop: Box<dyn OverlayRenderLoop>);

    /// Upload an RGBA8 image usable by the overlay. The returned handle dies
    /// when the image is released or the GPU resources are reset. A dead
    /// handle is returned on failure.
    fn create_image_resource(&self, data: &[u8], width: u32, height: u32) -> Weak<ImageResource>;

    /// Release an image created by [`RendererHook::create_image_resource`].
    fn release_image_resource(&self, image: Weak<ImageResource>);

    /// Stop or resume forwarding input to the host application.
    fn hide_app_inputs(&self, hide: bool);

    /// Stop or resume forwarding input to the overlay.
    fn hide_overlay_inputs(&self, hide: bool);

    /// Restore every redirection and release every resource. Terminal.
    fn unhook(&self);
}

/// Native window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WindowHandle(pub isize);

/// Window-level collaborator of a render hook: message interception, input
/// routing and cursor substitution.
pub trait WindowHook: Send + Sync {
    /// Start routing input to `input`. Returns `false` on failure.
    fn start_hook(&self, input: Arc<InputHook>) -> bool;

    /// Called on every presented frame with the window being presented to.
    /// Returning `false` skips the overlay for that frame.
    fn prepare_for_overlay(&self, window: WindowHandle) -> bool;

    /// GPU resources were released; drop anything tied to them.
    fn reset_render_state(&self);

    /// Stop intercepting. Terminal.
    fn unhook(&self);
}

/// Backend entry points redirected by a render hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    /// `IDXGISwapChain::Present`
    Present,
    /// `IDXGISwapChain::ResizeBuffers`
    ResizeBuffers,
    /// `IDXGISwapChain::ResizeTarget`
    ResizeTarget,
    /// `ID3D12CommandQueue::ExecuteCommandLists`
    ExecuteCommandLists,
}

impl EntryPoint {
    /// Every entry point, in installation order.
    pub const ALL: [EntryPoint; 4] = [
        EntryPoint::Present,
        EntryPoint::ResizeTarget,
        EntryPoint::ResizeBuffers,
        EntryPoint::ExecuteCommandLists,
    ];

    fn index(self) -> usize {
        match self {
            EntryPoint::Present => 0,
            EntryPoint::ResizeTarget => 1,
            EntryPoint::ResizeBuffers => 2,
            EntryPoint::ExecuteCommandLists => 3,
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryPoint::Present => "IDXGISwapChain::Present",
            EntryPoint::ResizeBuffers => "IDXGISwapChain::ResizeBuffers",
            EntryPoint::ResizeTarget => "IDXGISwapChain::ResizeTarget",
            EntryPoint::ExecuteCommandLists => "ID3D12CommandQueue::ExecuteCommandLists",
        })
    }
}

/// Address of a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePtr(pub *mut c_void);

// Code addresses are immutable and valid from every thread.
unsafe impl Send for CodePtr {}
unsafe impl Sync for CodePtr {}

impl CodePtr {
    /// Whether the address is null.
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// A resolved entry point and the detour that replaces it.
#[derive(Debug, Clone, Copy)]
pub struct Redirection {
    /// Which entry point.
    pub entry: EntryPoint,
    /// Its resolved address.
    pub target: CodePtr,
    /// The replacement.
    pub detour: CodePtr,
}

/// Trampolines to the original functions, indexed by entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trampolines([Option<CodePtr>; 4]);

impl Trampolines {
    /// Record the trampoline of `entry`.
    pub fn set(&mut self, entry: EntryPoint, trampoline: CodePtr) {
        self.0[entry.index()] = Some(trampoline);
    }

    /// Trampoline of `entry`, if installed.
    pub fn get(&self, entry: EntryPoint) -> Option<CodePtr> {
        self.0[entry.index()]
    }
}

/// Threads currently inside a detour or window procedure of this crate.
pub(crate) static DETOURS: DetourFence = DetourFence::new();

/// Block until no thread is executing code of this crate on behalf of the
/// host. Call it after [`RendererHook::unhook`] and before unloading.
pub fn wait_for_detours() {
    DETOURS.wait();
}

/// Counts the threads currently running a detour.
///
/// Unloading waits on it so no thread is left executing code that is about
/// to be unmapped.
pub struct DetourFence(AtomicUsize);

impl DetourFence {
    /// An idle fence.
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Mark the calling thread as inside a detour until the guard drops.
    pub fn enter(&self) -> DetourGuard<'_> {
        self.0.fetch_add(1, Ordering::SeqCst);
        DetourGuard(self)
    }

    /// Number of threads inside a detour.
    pub fn active(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Spin until every guard is dropped.
    pub fn wait(&self) {
        while self.active() > 0 {
            hint::spin_loop();
        }
    }
}

impl Default for DetourFence {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by [`DetourFence::enter`].
pub struct DetourGuard<'a>(&'a DetourFence);

impl Drop for DetourGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

//! DirectX 12 render hook.
//!
//! [`Dx12Hook`] owns the hook state machine and the frame injection
//! protocol. It talks to the graphics device exclusively through the
//! [`Dx12Api`] trait: the native implementation lives in [`native`], and any
//! other implementation (a recording fake, a different binding) drives the
//! exact same engine.
//!
//! The following entry points are redirected:
//! - `IDXGISwapChain::Present`
//! - `IDXGISwapChain::ResizeBuffers`
//! - `IDXGISwapChain::ResizeTarget`
//! - `ID3D12CommandQueue::ExecuteCommandLists`
//!
//! All hook and GPU state sits behind one mutex, so a resize always observes
//! either the state before an acquisition or the state after it. The command
//! queue observed in `ExecuteCommandLists` has its own short-lived lock, never
//! held across a device call: the overlay's own submissions and uploads
//! re-enter that detour while the state lock is held.
//!
//! Each command allocator carries a fence. A frame waits only for the previous
//! submission recorded on the allocator it is about to reset, never for the
//! one it just submitted.
//!
//! Callbacks run with the state lock held. They receive a [`RenderContext`]
//! for texture work and must not call back into the hook itself.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use scopeguard::ScopeGuard;
use tracing::{debug, error, info, trace, warn};

use crate::config::OverlayConfig;
use crate::hooks::{
    CodePtr, EntryPoint, HookState, Redirection, RendererHook, ResourceState, Trampolines,
    WindowHandle, WindowHook,
};
use crate::input::{InputEvent, InputHook, ToggleCallback, ToggleKey};
use crate::mh::{PatchTransaction, Patcher};
use crate::{ImageResource, OverlayRenderLoop, RenderContext};

#[cfg(windows)]
pub mod native;
mod resources;

pub use resources::{
    CpuDescriptor, DescriptorSlots, FrameResources, GpuDescriptor, HeapKind, RenderTarget,
    RESERVED_DESCRIPTORS,
};

/// Module implementing the hooked backend.
pub const LIBRARY_NAME: &str = "d3d12.dll";

////////////////////////////////////////////////////////////////////////////////////////////////////
// Device abstraction
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Swap chain properties the engine depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainDesc {
    /// Number of back buffers.
    pub buffer_count: u32,
    /// Output window.
    pub window: WindowHandle,
    /// Back buffer width.
    pub width: u32,
    /// Back buffer height.
    pub height: u32,
}

/// Resource states used in back buffer transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// `D3D12_RESOURCE_STATE_PRESENT`
    Present,
    /// `D3D12_RESOURCE_STATE_RENDER_TARGET`
    RenderTarget,
}

/// The slice of Direct3D 12 the engine uses.
///
/// Object types are owning handles: dropping one releases the underlying
/// object. The engine never aliases them outside of [`Dx12Hook`].
pub trait Dx12Api: Send + Sync + 'static {
    /// Host swap chain, borrowed for the duration of a call.
    type SwapChain;
    /// Device.
    type Device: Send;
    /// Descriptor heap.
    type DescriptorHeap: Send;
    /// Command allocator.
    type CommandAllocator: Send;
    /// Graphics command list.
    type CommandList: Send;
    /// Command queue. Equality is object identity.
    type CommandQueue: Clone + PartialEq + Send;
    /// Back buffer.
    type Resource: Send;
    /// Overlay texture.
    type Texture: Send;

    /// Describe the swap chain.
    fn swap_chain_desc(&self, swap_chain: &Self::SwapChain) -> Result<SwapChainDesc>;

    /// Index of the back buffer about to be rendered into.
    fn current_back_buffer_index(&self, swap_chain: &Self::SwapChain) -> u32;

    /// Device that created the swap chain.
    fn device(&self, swap_chain: &Self::SwapChain) -> Result<Self::Device>;

    /// Create a descriptor heap of `count` descriptors.
    fn create_descriptor_heap(
        &self,
        device: &Self::Device,
        kind: HeapKind,
        count: u32,
    ) -> Result<Self::DescriptorHeap>;

    /// Create a direct command allocator.
    fn create_command_allocator(&self, device: &Self::Device) -> Result<Self::CommandAllocator>;

    /// Create a direct command list recording into `allocator`.
    fn create_command_list(
        &self,
        device: &Self::Device,
        allocator: &Self::CommandAllocator,
    ) -> Result<Self::CommandList>;

    /// Back buffer `index` of the swap chain.
    fn back_buffer(&self, swap_chain: &Self::SwapChain, index: u32) -> Result<Self::Resource>;

    /// Write the render-target view of `resource` into slot `index` of `heap`.
    fn create_render_target_view(
        &self,
        device: &Self::Device,
        heap: &Self::DescriptorHeap,
        index: u32,
        resource: &Self::Resource,
    ) -> CpuDescriptor;

    /// Block until the GPU has finished the last submission recorded on
    /// `allocator`.
    fn wait_for_allocator(&self, allocator: &Self::CommandAllocator) -> Result<()>;

    /// Mark the end of the commands recorded on `allocator` on `queue`.
    fn signal_allocator(
        &self,
        queue: &Self::CommandQueue,
        allocator: &Self::CommandAllocator,
    ) -> Result<()>;

    /// Reset an allocator whose previous commands have completed.
    fn reset_allocator(&self, allocator: &Self::CommandAllocator) -> Result<()>;

    /// Reopen a closed command list on `allocator`.
    fn reset_command_list(
        &self,
        list: &Self::CommandList,
        allocator: &Self::CommandAllocator,
    ) -> Result<()>;

    /// Record a transition barrier.
    fn transition(
        &self,
        list: &Self::CommandList,
        resource: &Self::Resource,
        before: BarrierState,
        after: BarrierState,
    );

    /// Bind a single render target.
    fn set_render_target(&self, list: &Self::CommandList, target: CpuDescriptor);

    /// Bind the shader-visible heap.
    fn set_descriptor_heap(&self, list: &Self::CommandList, heap: &Self::DescriptorHeap);

    /// Close a command list.
    fn close(&self, list: &Self::CommandList) -> Result<()>;

    /// Submit a closed command list.
    fn execute(&self, queue: &Self::CommandQueue, list: &Self::CommandList) -> Result<()>;

    /// Whether `queue` accepts direct command lists.
    fn is_direct_queue(&self, queue: &Self::CommandQueue) -> bool;

    /// Create an RGBA8 texture, upload `data` through `queue`, and write its
    /// shader resource view into `slot` of `heap`.
    #[allow(clippy::too_many_arguments)]
    fn create_texture(
        &self,
        device: &Self::Device,
        queue: &Self::CommandQueue,
        heap: &Self::DescriptorHeap,
        slot: u32,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Self::Texture, GpuDescriptor)>;
}

/// The UI library integration that turns overlay draw lists into commands.
pub trait OverlayRenderer<A: Dx12Api>: Send {
    /// Create device objects. Called after every resource acquisition; an
    /// error rolls the acquisition back.
    fn init(
        &mut self,
        api: &A,
        device: &A::Device,
        srv_heap: &A::DescriptorHeap,
        buffer_count: u32,
    ) -> Result<()>;

    /// Start a frame. `events` holds the input routed to the overlay since
    /// the previous frame. Returning `false` skips the frame.
    fn new_frame(&mut self, _window: WindowHandle, _events: &[InputEvent]) -> bool {
        true
    }

    /// Record the draw data of the frame.
    fn render_draw_data(&mut self, api: &A, command_list: &A::CommandList) -> Result<()>;

    /// Release device objects. Called on every resource reset.
    fn shutdown(&mut self) {}
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Hook state machine
////////////////////////////////////////////////////////////////////////////////////////////////////

struct HookInner<A: Dx12Api> {
    hook_state: HookState,
    retired: bool,
    resources: Option<FrameResources<A>>,
    render_loop: Option<Box<dyn OverlayRenderLoop>>,
    renderer: Option<Box<dyn OverlayRenderer<A>>>,
}

struct FrameContext<'a, A: Dx12Api> {
    api: &'a A,
    resources: &'a mut FrameResources<A>,
    queue: &'a A::CommandQueue,
}

impl<A: Dx12Api> RenderContext for FrameContext<'_, A> {
    fn create_image_resource(&mut self, data: &[u8], width: u32, height: u32) -> Weak<ImageResource> {
        match self.resources.create_image(self.api, self.queue, data, width, height) {
            Ok(image) => Arc::downgrade(&image),
            Err(e) => {
                warn!("Couldn't create image resource: {e:?}");
                Weak::new()
            },
        }
    }

    fn release_image_resource(&mut self, image: Weak<ImageResource>) {
        if !self.resources.release_image(&image) {
            debug!("Image resource already released");
        }
    }
}

/// DirectX 12 render hook.
pub struct Dx12Hook<A: Dx12Api> {
    api: A,
    redirections: Vec<Redirection>,
    patcher: Arc<dyn Patcher>,
    window: Arc<dyn WindowHook>,
    config: OverlayConfig,
    input: OnceCell<Arc<InputHook>>,
    trampolines: RwLock<Trampolines>,
    queue: Mutex<Option<A::CommandQueue>>,
    state: Mutex<HookInner<A>>,
}

impl<A: Dx12Api> Dx12Hook<A> {
    /// Create an unhooked instance.
    ///
    /// # Safety
    ///
    /// Every [`Redirection`] must pair a real entry point with a detour of the
    /// exact same signature. They are patched in by
    /// [`RendererHook::start_hook`].
    pub unsafe fn new(
        api: A,
        redirections: Vec<Redirection>,
        patcher: Arc<dyn Patcher>,
        window: Arc<dyn WindowHook>,
        config: OverlayConfig,
    ) -> Self {
        Self {
            api,
            redirections,
            patcher,
            window,
            config,
            input: OnceCell::new(),
            trampolines: RwLock::new(Trampolines::default()),
            queue: Mutex::new(None),
            state: Mutex::new(HookInner {
                hook_state: HookState::Unhooked,
                retired: false,
                resources: None,
                render_loop: None,
                renderer: None,
            }),
        }
    }

    /// The device abstraction.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Current hook state.
    pub fn hook_state(&self) -> HookState {
        self.state.lock().hook_state
    }

    /// Whether [`RendererHook::unhook`] ran. A retired hook never hooks again.
    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// Current resource state.
    pub fn resource_state(&self) -> ResourceState {
        match self.state.lock().resources {
            Some(_) => ResourceState::Initialized,
            None => ResourceState::Uninitialized,
        }
    }

    /// Input hook created by [`RendererHook::start_hook`].
    pub fn input(&self) -> Option<&Arc<InputHook>> {
        self.input.get()
    }

    /// Trampoline to the original function behind `entry`.
    pub fn original(&self, entry: EntryPoint) -> Option<CodePtr> {
        self.trampolines.read().get(entry)
    }

    /// Register the UI library integration. Live resources are reset so the
    /// renderer is initialized with the next acquisition.
    pub fn set_overlay_renderer(&self, renderer: Box<dyn OverlayRenderer<A>>) {
        let mut inner = self.state.lock();
        self.release_resources(&mut inner);
        inner.renderer = Some(renderer);
    }

    /// Per-present entry point: acquire the resources if needed, run the
    /// frame callback and submit the overlay commands.
    pub fn present(&self, swap_chain: &A::SwapChain) {
        let mut inner = self.state.lock();
        if inner.hook_state != HookState::Hooked {
            return;
        }

        let Some(queue) = self.queue.lock().clone() else {
            trace!("No command queue observed yet, skipping frame");
            return;
        };

        if inner.resources.is_none() {
            if let Err(e) = self.acquire(&mut inner, swap_chain, &queue) {
                warn!("Couldn't acquire overlay resources: {e:?}");
                return;
            }
        }

        let HookInner { resources: Some(resources), render_loop, renderer, .. } = &mut *inner
        else {
            return;
        };

        if !self.window.prepare_for_overlay(resources.window()) {
            trace!("Window not ready, skipping frame");
            return;
        }

        let index = self.api.current_back_buffer_index(swap_chain);
        if index >= resources.buffer_count() {
            warn!("Back buffer index {index} out of range ({} buffers)", resources.buffer_count());
            return;
        }

        let events = self.input.get().map(|input| input.drain_events()).unwrap_or_default();
        if let Some(renderer) = renderer.as_mut() {
            if !renderer.new_frame(resources.window(), &events) {
                return;
            }
        }

        if let Some(render_loop) = render_loop.as_mut() {
            render_loop.render(&mut FrameContext {
                api: &self.api,
                resources: &mut *resources,
                queue: &queue,
            });
        }

        if let Err(e) = self.record_and_submit(resources, renderer.as_mut(), index, &queue) {
            warn!("Skipping overlay frame: {e:?}");
        }
    }

    /// Resize interception. Resources depend on the buffers about to change.
    pub fn resize(&self) {
        trace!("Swap chain resize");
        self.reset_render_state();
    }

    /// Submission interception: remember the last direct queue.
    pub fn execute_command_lists(&self, queue: &A::CommandQueue) {
        if !self.api.is_direct_queue(queue) {
            return;
        }

        let mut observed = self.queue.lock();
        if observed.as_ref() != Some(queue) {
            debug!("Observed a new direct command queue");
            *observed = Some(queue.clone());
        }
    }

    /// Release every frame resource and notify the render loop.
    pub fn reset_render_state(&self) {
        let mut inner = self.state.lock();
        self.release_resources(&mut inner);
    }

    fn release_resources(&self, inner: &mut HookInner<A>) {
        let Some(resources) = inner.resources.take() else {
            return;
        };

        if let Some(renderer) = inner.renderer.as_mut() {
            renderer.shutdown();
        }
        self.window.reset_render_state();
        if let Some(render_loop) = inner.render_loop.as_mut() {
            render_loop.hook_ready(false);
        }

        resources.wait_idle(&self.api);
        drop(resources);
        debug!("Overlay resources released");
    }

    fn acquire(
        &self,
        inner: &mut HookInner<A>,
        swap_chain: &A::SwapChain,
        queue: &A::CommandQueue,
    ) -> Result<()> {
        let mut resources =
            FrameResources::acquire(&self.api, swap_chain, self.config.texture_descriptor_count)?;

        if let Some(renderer) = inner.renderer.as_mut() {
            renderer
                .init(&self.api, &resources.device, &resources.srv_heap, resources.buffer_count())
                .context("initializing the overlay renderer")?;
        }

        info!("Overlay resources initialized ({} buffers)", resources.buffer_count());

        if let Some(render_loop) = inner.render_loop.as_mut() {
            render_loop.initialize(&mut FrameContext {
                api: &self.api,
                resources: &mut resources,
                queue,
            });
            render_loop.hook_ready(true);
        }

        inner.resources = Some(resources);
        Ok(())
    }

    fn record_and_submit(
        &self,
        resources: &FrameResources<A>,
        renderer: Option<&mut Box<dyn OverlayRenderer<A>>>,
        index: u32,
        queue: &A::CommandQueue,
    ) -> Result<()> {
        let allocator = &resources.allocators[index as usize];
        let target = &resources.targets[index as usize];

        // Only the previous use of this back buffer has to be finished.
        self.api.wait_for_allocator(allocator).context("waiting for the command allocator")?;
        self.api.reset_allocator(allocator).context("resetting the command allocator")?;
        self.api
            .reset_command_list(&resources.command_list, allocator)
            .context("resetting the command list")?;

        // Leave the list closed if recording bails out.
        let list = scopeguard::guard(&resources.command_list, |list| {
            if let Err(e) = self.api.close(list) {
                warn!("Couldn't close the command list: {e:?}");
            }
        });

        self.api.transition(*list, &target.resource, BarrierState::Present, BarrierState::RenderTarget);
        self.api.set_render_target(*list, target.descriptor);
        self.api.set_descriptor_heap(*list, &resources.srv_heap);

        if let Some(renderer) = renderer {
            renderer.render_draw_data(&self.api, *list).context("recording the draw data")?;
        }

        self.api.transition(*list, &target.resource, BarrierState::RenderTarget, BarrierState::Present);

        let list = ScopeGuard::into_inner(list);
        self.api.close(list).context("closing the command list")?;
        self.api.execute(queue, list).context("submitting the command list")?;
        self.api.signal_allocator(queue, allocator).context("signaling the frame fence")?;

        Ok(())
    }

    fn install(&self) -> Result<()> {
        let mut transaction = PatchTransaction::begin(self.patcher.as_ref())
            .context("beginning the patch transaction")?;

        let mut trampolines = Trampolines::default();
        for redirection in &self.redirections {
            let trampoline =
                unsafe { transaction.redirect(redirection.target.0, redirection.detour.0) }
                    .with_context(|| format!("redirecting {}", redirection.entry))?;
            trampolines.set(redirection.entry, CodePtr(trampoline));
        }

        // Detours go live on commit and need the trampolines right away.
        *self.trampolines.write() = trampolines;
        if let Err(e) = transaction.end() {
            *self.trampolines.write() = Trampolines::default();
            return Err(e).context("committing the patch transaction");
        }

        Ok(())
    }

    fn missing_entry_point(&self) -> Option<EntryPoint> {
        EntryPoint::ALL.into_iter().find(|&entry| {
            !self
                .redirections
                .iter()
                .any(|r| r.entry == entry && !r.target.is_null() && !r.detour.is_null())
        })
    }
}

impl<A: Dx12Api> RendererHook for Dx12Hook<A> {
    fn start_hook(&self, toggle: ToggleCallback, keys: &[ToggleKey]) -> bool {
        let mut inner = self.state.lock();
        if inner.retired {
            error!("Hook already unloaded");
            return false;
        }
        if inner.hook_state == HookState::Hooked {
            debug!("Already hooked");
            return true;
        }

        if let Some(entry) = self.missing_entry_point() {
            error!("Failed to hook DirectX 12: {entry} is unresolved");
            return false;
        }

        if let Err(e) = self.install() {
            error!("Failed to hook DirectX 12: {e:?}");
            return false;
        }

        let keys = if keys.is_empty() { &self.config.toggle_keys[..] } else { keys };
        let input = self
            .input
            .get_or_init(|| Arc::new(InputHook::new(keys.iter().copied(), None)));
        input.set_toggle_callback(Some(toggle));

        if !self.window.start_hook(Arc::clone(input)) {
            warn!("Window hook unavailable, the overlay won't receive input");
        }

        inner.hook_state = HookState::Hooked;
        info!("Hooked DirectX 12");
        true
    }

    fn is_started(&self) -> bool {
        self.hook_state() == HookState::Hooked
    }

    fn library_name(&self) -> &str {
        LIBRARY_NAME
    }

    fn set_render_loop(&self, mut render_loop: Box<dyn OverlayRenderLoop>) {
        let mut inner = self.state.lock();
        if let Some(resources) = inner.resources.as_mut() {
            // Uploads submit through the hooked queue and lock it again.
            let queue = self.queue.lock().clone();
            if let Some(queue) = queue {
                render_loop.initialize(&mut FrameContext { api: &self.api, resources, queue: &queue });
            }
            render_loop.hook_ready(true);
        }
        inner.render_loop = Some(render_loop);
    }

    fn create_image_resource(&self, data: &[u8], width: u32, height: u32) -> Weak<ImageResource> {
        let mut inner = self.state.lock();
        let Some(resources) = inner.resources.as_mut() else {
            warn!("Overlay resources not initialized, can't create image");
            return Weak::new();
        };
        let Some(queue) = self.queue.lock().clone() else {
            warn!("No command queue observed yet, can't create image");
            return Weak::new();
        };

        FrameContext { api: &self.api, resources, queue: &queue }
            .create_image_resource(data, width, height)
    }

    fn release_image_resource(&self, image: Weak<ImageResource>) {
        let mut inner = self.state.lock();
        if let Some(resources) = inner.resources.as_mut() {
            resources.release_image(&image);
        }
    }

    fn hide_app_inputs(&self, hide: bool) {
        if let Some(input) = self.input.get() {
            input.hide_app_inputs(hide);
        }
    }

    fn hide_overlay_inputs(&self, hide: bool) {
        if let Some(input) = self.input.get() {
            input.hide_overlay_inputs(hide);
        }
    }

    fn unhook(&self) {
        let mut inner = self.state.lock();
        if inner.retired {
            return;
        }
        inner.retired = true;

        self.release_resources(&mut inner);
        inner.render_loop = None;
        inner.renderer = None;

        if inner.hook_state == HookState::Hooked {
            let targets: Vec<_> = self.redirections.iter().map(|r| r.target.0).collect();
            if let Err(e) = unsafe { self.patcher.restore(&targets) } {
                error!("Couldn't restore DirectX 12 entry points: {e}");
            }
            self.window.unhook();
            inner.hook_state = HookState::Unhooked;
        }

        *self.queue.lock() = None;
        info!("Unhooked DirectX 12");
    }
}

//! Direct3D 12 bindings of the render hook.
//!
//! [`D3D12Api`] implements [`Dx12Api`] on top of the `windows` crate. The
//! `extern "system"` detours below are what MinHook patches into DXGI and
//! D3D12; each of them hands the call to the [`Dx12Hook`] and forwards to the
//! original function through its trampoline.

use std::ffi::c_void;
use std::mem::{self, ManuallyDrop};
use std::ptr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, trace};
use windows::core::{w, ComInterface, Interface, HRESULT, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, BOOL, E_FAIL, HANDLE};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_NULL, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_11_0,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDeviceAndSwapChain, ID3D11Device, ID3D11DeviceContext, D3D11_CREATE_DEVICE_FLAG,
    D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_UNKNOWN, DXGI_MODE_DESC,
    DXGI_MODE_SCALING_UNSPECIFIED, DXGI_MODE_SCANLINE_ORDER_UNSPECIFIED, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory, IDXGIFactory, IDXGISwapChain, IDXGISwapChain3, DXGI_SWAP_CHAIN_DESC,
    DXGI_SWAP_EFFECT_DISCARD, DXGI_USAGE_RENDER_TARGET_OUTPUT,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::{CreateEventExW, WaitForSingleObjectEx, CREATE_EVENT};
use windows::Win32::System::WindowsProgramming::INFINITE;
use windows::Win32::UI::WindowsAndMessaging::GetDesktopWindow;

use super::{
    BarrierState, CpuDescriptor, Dx12Api, Dx12Hook, GpuDescriptor, HeapKind, SwapChainDesc,
};
use crate::config::OverlayConfig;
use crate::detector::RendererProbe;
use crate::hooks::window::Win32WindowHook;
use crate::hooks::{CodePtr, EntryPoint, Redirection, RendererHook, WindowHandle, DETOURS};
use crate::mh::MinHookPatcher;
use crate::util::{try_out_param, try_out_ptr};

type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT;
type ResizeBuffersFn =
    unsafe extern "system" fn(*mut c_void, u32, u32, u32, DXGI_FORMAT, u32) -> HRESULT;
type ResizeTargetFn = unsafe extern "system" fn(*mut c_void, *const DXGI_MODE_DESC) -> HRESULT;
type ExecuteCommandListsFn = unsafe extern "system" fn(*mut c_void, u32, *const *mut c_void);

static HOOK: OnceCell<Arc<Dx12Hook<D3D12Api>>> = OnceCell::new();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Owning handles
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A COM interface moved between threads.
///
/// The hook serializes every use of the objects it owns, and D3D12 objects
/// are free-threaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Com<T: Interface>(pub T);

unsafe impl<T: Interface> Send for Com<T> {}

/// Descriptor heap and the stride between its descriptors.
#[derive(Debug)]
pub struct DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    increment: u32,
}

unsafe impl Send for DescriptorHeap {}

impl DescriptorHeap {
    fn cpu_handle(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        let start = unsafe { self.heap.GetCPUDescriptorHandleForHeapStart() };
        D3D12_CPU_DESCRIPTOR_HANDLE { ptr: start.ptr + (index * self.increment) as usize }
    }

    fn gpu_handle(&self, index: u32) -> D3D12_GPU_DESCRIPTOR_HANDLE {
        let start = unsafe { self.heap.GetGPUDescriptorHandleForHeapStart() };
        D3D12_GPU_DESCRIPTOR_HANDLE { ptr: start.ptr + (index * self.increment) as u64 }
    }
}

/// Graphics command list.
pub struct CommandList {
    list: ID3D12GraphicsCommandList,
}

unsafe impl Send for CommandList {}

/// Command allocator of one back buffer and the fence marking the end of its
/// last submission.
pub struct CommandAllocator {
    allocator: ID3D12CommandAllocator,
    fence: Mutex<GpuFence>,
}

unsafe impl Send for CommandAllocator {}

struct GpuFence {
    fence: ID3D12Fence,
    value: u64,
    event: HANDLE,
}

impl GpuFence {
    fn new(device: &ID3D12Device) -> Result<Self> {
        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        let event = unsafe { CreateEventExW(None, PCWSTR::null(), CREATE_EVENT(0), 0x1F0003) }?;
        Ok(Self { fence, value: 0, event })
    }

    /// Enqueue the next fence value on `queue`.
    fn signal(&mut self, queue: &ID3D12CommandQueue) -> Result<()> {
        self.value += 1;
        Ok(unsafe { queue.Signal(&self.fence, self.value) }?)
    }

    /// Wait for the GPU to reach the last signaled value.
    fn wait(&self) -> Result<()> {
        unsafe {
            if self.fence.GetCompletedValue() < self.value {
                self.fence.SetEventOnCompletion(self.value, self.event)?;
                WaitForSingleObjectEx(self.event, INFINITE, false);
            }
        }
        Ok(())
    }
}

impl Drop for GpuFence {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.event) };
    }
}

// Borrow a COM pointer into a descriptor struct without touching its
// reference count.
unsafe fn borrow_com<T: Interface>(inf: &T) -> ManuallyDrop<Option<T>> {
    mem::transmute_copy(inf)
}

fn resource_state(state: BarrierState) -> D3D12_RESOURCE_STATES {
    match state {
        BarrierState::Present => D3D12_RESOURCE_STATE_PRESENT,
        BarrierState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { borrow_com(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn committed_resource(
    device: &ID3D12Device,
    heap_type: D3D12_HEAP_TYPE,
    desc: &D3D12_RESOURCE_DESC,
    state: D3D12_RESOURCE_STATES,
) -> Result<ID3D12Resource> {
    try_out_ptr(|v| unsafe {
        device.CreateCommittedResource(
            &D3D12_HEAP_PROPERTIES {
                Type: heap_type,
                CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                CreationNodeMask: Default::default(),
                VisibleNodeMask: Default::default(),
            },
            D3D12_HEAP_FLAG_NONE,
            desc,
            state,
            None,
            v,
        )
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Dx12Api
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [`Dx12Api`] over the real Direct3D 12 runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct D3D12Api;

impl Dx12Api for D3D12Api {
    type SwapChain = IDXGISwapChain3;
    type Device = Com<ID3D12Device>;
    type DescriptorHeap = DescriptorHeap;
    type CommandAllocator = CommandAllocator;
    type CommandList = CommandList;
    type CommandQueue = Com<ID3D12CommandQueue>;
    type Resource = Com<ID3D12Resource>;
    type Texture = Com<ID3D12Resource>;

    fn swap_chain_desc(&self, swap_chain: &IDXGISwapChain3) -> Result<SwapChainDesc> {
        let desc: DXGI_SWAP_CHAIN_DESC = try_out_param(|sd| unsafe { swap_chain.GetDesc(sd) })?;
        Ok(SwapChainDesc {
            buffer_count: desc.BufferCount,
            window: WindowHandle(desc.OutputWindow.0),
            width: desc.BufferDesc.Width,
            height: desc.BufferDesc.Height,
        })
    }

    fn current_back_buffer_index(&self, swap_chain: &IDXGISwapChain3) -> u32 {
        unsafe { swap_chain.GetCurrentBackBufferIndex() }
    }

    fn device(&self, swap_chain: &IDXGISwapChain3) -> Result<Self::Device> {
        Ok(Com(unsafe { swap_chain.GetDevice::<ID3D12Device>() }?))
    }

    fn create_descriptor_heap(
        &self,
        device: &Self::Device,
        kind: HeapKind,
        count: u32,
    ) -> Result<DescriptorHeap> {
        let (heap_type, flags) = match kind {
            HeapKind::ShaderResource => {
                (D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV, D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE)
            },
            HeapKind::RenderTarget => (D3D12_DESCRIPTOR_HEAP_TYPE_RTV, D3D12_DESCRIPTOR_HEAP_FLAG_NONE),
        };

        let heap: ID3D12DescriptorHeap = unsafe {
            device.0.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type,
                NumDescriptors: count,
                Flags: flags,
                NodeMask: 0,
            })
        }?;
        let increment = unsafe { device.0.GetDescriptorHandleIncrementSize(heap_type) };

        Ok(DescriptorHeap { heap, increment })
    }

    fn create_command_allocator(&self, device: &Self::Device) -> Result<Self::CommandAllocator> {
        let allocator: ID3D12CommandAllocator =
            unsafe { device.0.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }?;
        Ok(CommandAllocator { allocator, fence: Mutex::new(GpuFence::new(&device.0)?) })
    }

    fn create_command_list(
        &self,
        device: &Self::Device,
        allocator: &Self::CommandAllocator,
    ) -> Result<CommandList> {
        let list: ID3D12GraphicsCommandList = unsafe {
            device.0.CreateCommandList(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                &allocator.allocator,
                None,
            )
        }?;
        unsafe { list.SetName(w!("overlay-hook Command List")) }?;

        Ok(CommandList { list })
    }

    fn back_buffer(&self, swap_chain: &IDXGISwapChain3, index: u32) -> Result<Self::Resource> {
        Ok(Com(unsafe { swap_chain.GetBuffer::<ID3D12Resource>(index) }?))
    }

    fn create_render_target_view(
        &self,
        device: &Self::Device,
        heap: &DescriptorHeap,
        index: u32,
        resource: &Self::Resource,
    ) -> CpuDescriptor {
        let handle = heap.cpu_handle(index);
        unsafe { device.0.CreateRenderTargetView(&resource.0, None, handle) };
        CpuDescriptor(handle.ptr)
    }

    fn wait_for_allocator(&self, allocator: &CommandAllocator) -> Result<()> {
        allocator.fence.lock().wait()
    }

    fn signal_allocator(
        &self,
        queue: &Self::CommandQueue,
        allocator: &CommandAllocator,
    ) -> Result<()> {
        allocator.fence.lock().signal(&queue.0)
    }

    fn reset_allocator(&self, allocator: &CommandAllocator) -> Result<()> {
        Ok(unsafe { allocator.allocator.Reset() }?)
    }

    fn reset_command_list(
        &self,
        list: &CommandList,
        allocator: &CommandAllocator,
    ) -> Result<()> {
        Ok(unsafe { list.list.Reset(&allocator.allocator, None) }?)
    }

    fn transition(
        &self,
        list: &CommandList,
        resource: &Self::Resource,
        before: BarrierState,
        after: BarrierState,
    ) {
        let barrier =
            transition_barrier(&resource.0, resource_state(before), resource_state(after));
        unsafe { list.list.ResourceBarrier(&[barrier]) };
    }

    fn set_render_target(&self, list: &CommandList, target: CpuDescriptor) {
        let handle = D3D12_CPU_DESCRIPTOR_HANDLE { ptr: target.0 };
        unsafe { list.list.OMSetRenderTargets(1, Some(&handle), false, None) };
    }

    fn set_descriptor_heap(&self, list: &CommandList, heap: &DescriptorHeap) {
        unsafe { list.list.SetDescriptorHeaps(&[Some(heap.heap.clone())]) };
    }

    fn close(&self, list: &CommandList) -> Result<()> {
        Ok(unsafe { list.list.Close() }?)
    }

    fn execute(&self, queue: &Self::CommandQueue, list: &CommandList) -> Result<()> {
        unsafe { queue.0.ExecuteCommandLists(&[Some(list.list.cast()?)]) };
        Ok(())
    }

    fn is_direct_queue(&self, queue: &Self::CommandQueue) -> bool {
        unsafe { queue.0.GetDesc() }.Type == D3D12_COMMAND_LIST_TYPE_DIRECT
    }

    fn create_texture(
        &self,
        device: &Self::Device,
        queue: &Self::CommandQueue,
        heap: &DescriptorHeap,
        slot: u32,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Self::Texture, GpuDescriptor)> {
        let device = &device.0;

        let texture = committed_resource(
            device,
            D3D12_HEAP_TYPE_DEFAULT,
            &D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                Alignment: 0,
                Width: width as _,
                Height: height as _,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                Flags: D3D12_RESOURCE_FLAG_NONE,
            },
            D3D12_RESOURCE_STATE_COPY_DEST,
        )
        .context("creating the texture")?;

        let row_size = width * 4;
        let align = D3D12_TEXTURE_DATA_PITCH_ALIGNMENT;
        let pitch = (row_size + align - 1) / align * align;

        let upload = committed_resource(
            device,
            D3D12_HEAP_TYPE_UPLOAD,
            &D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                Alignment: 0,
                Width: (height * pitch) as _,
                Height: 1,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: DXGI_FORMAT_UNKNOWN,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                Flags: D3D12_RESOURCE_FLAG_NONE,
            },
            D3D12_RESOURCE_STATE_GENERIC_READ,
        )
        .context("creating the upload buffer")?;

        unsafe {
            let mut mapped = ptr::null_mut();
            upload.Map(0, None, Some(&mut mapped))?;
            for y in 0..height as usize {
                let src = data.as_ptr().add(y * row_size as usize);
                let dst = (mapped as *mut u8).add(y * pitch as usize);
                ptr::copy_nonoverlapping(src, dst, row_size as usize);
            }
            upload.Unmap(0, None);
        }

        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }?;
        let list: ID3D12GraphicsCommandList =
            unsafe { device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None) }?;

        let dst = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { borrow_com(&texture) },
            Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: 0 },
        };
        let src = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { borrow_com(&upload) },
            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                    Offset: 0,
                    Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                        Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                        Width: width,
                        Height: height,
                        Depth: 1,
                        RowPitch: pitch,
                    },
                },
            },
        };

        unsafe {
            list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
            list.ResourceBarrier(&[transition_barrier(
                &texture,
                D3D12_RESOURCE_STATE_COPY_DEST,
                D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
            )]);
            list.Close()?;
            queue.0.ExecuteCommandLists(&[Some(list.cast()?)]);
        }
        let mut fence = GpuFence::new(device)?;
        fence.signal(&queue.0)?;
        fence.wait().context("waiting for the upload")?;

        unsafe {
            device.CreateShaderResourceView(
                &texture,
                Some(&D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                    Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                    Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_SRV {
                            MostDetailedMip: 0,
                            MipLevels: 1,
                            PlaneSlice: Default::default(),
                            ResourceMinLODClamp: Default::default(),
                        },
                    },
                }),
                heap.cpu_handle(slot),
            );
        }

        Ok((Com(texture), GpuDescriptor(heap.gpu_handle(slot).ptr)))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Detours
////////////////////////////////////////////////////////////////////////////////////////////////////

fn trampoline<F>(entry: EntryPoint) -> Option<F> {
    let CodePtr(ptr) = HOOK.get()?.original(entry)?;
    Some(unsafe { mem::transmute_copy::<*mut c_void, F>(&ptr) })
}

unsafe extern "system" fn present_impl(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT {
    let _guard = DETOURS.enter();
    trace!("IDXGISwapChain::Present({this:p}, {sync_interval}, {flags}) invoked");

    if let (Some(hook), Some(swap_chain)) = (HOOK.get(), IDXGISwapChain::from_raw_borrowed(&this)) {
        match swap_chain.cast::<IDXGISwapChain3>() {
            Ok(swap_chain) => hook.present(&swap_chain),
            Err(e) => debug!("Swap chain is not an IDXGISwapChain3: {e:?}"),
        }
    }

    match trampoline::<PresentFn>(EntryPoint::Present) {
        Some(original) => original(this, sync_interval, flags),
        None => {
            error!("IDXGISwapChain::Present trampoline missing");
            E_FAIL
        },
    }
}

unsafe extern "system" fn resize_buffers_impl(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: DXGI_FORMAT,
    flags: u32,
) -> HRESULT {
    let _guard = DETOURS.enter();
    trace!("IDXGISwapChain::ResizeBuffers({buffer_count}, {width}x{height}) invoked");

    if let Some(hook) = HOOK.get() {
        hook.resize();
    }

    match trampoline::<ResizeBuffersFn>(EntryPoint::ResizeBuffers) {
        Some(original) => original(this, buffer_count, width, height, format, flags),
        None => {
            error!("IDXGISwapChain::ResizeBuffers trampoline missing");
            E_FAIL
        },
    }
}

unsafe extern "system" fn resize_target_impl(
    this: *mut c_void,
    params: *const DXGI_MODE_DESC,
) -> HRESULT {
    let _guard = DETOURS.enter();
    trace!("IDXGISwapChain::ResizeTarget invoked");

    if let Some(hook) = HOOK.get() {
        hook.resize();
    }

    match trampoline::<ResizeTargetFn>(EntryPoint::ResizeTarget) {
        Some(original) => original(this, params),
        None => {
            error!("IDXGISwapChain::ResizeTarget trampoline missing");
            E_FAIL
        },
    }
}

unsafe extern "system" fn execute_command_lists_impl(
    this: *mut c_void,
    num_command_lists: u32,
    command_lists: *const *mut c_void,
) {
    let _guard = DETOURS.enter();

    if let (Some(hook), Some(queue)) = (HOOK.get(), ID3D12CommandQueue::from_raw_borrowed(&this)) {
        hook.execute_command_lists(&Com(queue.clone()));
    }

    match trampoline::<ExecuteCommandListsFn>(EntryPoint::ExecuteCommandLists) {
        Some(original) => original(this, num_command_lists, command_lists),
        None => error!("ID3D12CommandQueue::ExecuteCommandLists trampoline missing"),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Entry point resolution
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Resolve the entry points from the vtables of a throwaway device, queue
/// and swap chain.
fn resolve_redirections() -> Result<Vec<Redirection>> {
    let factory: IDXGIFactory = unsafe { CreateDXGIFactory() }?;
    let adapter = unsafe { factory.EnumAdapters(0) }?;

    let device: ID3D12Device =
        try_out_ptr(|v| unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, v) })
            .context("creating the dummy D3D12 device")?;

    let queue: ID3D12CommandQueue = unsafe {
        device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            Priority: 0,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            NodeMask: 0,
        })
    }?;

    let mut swap_chain: Option<IDXGISwapChain> = None;
    let mut d3d11_device: Option<ID3D11Device> = None;
    let mut d3d11_context: Option<ID3D11DeviceContext> = None;
    unsafe {
        D3D11CreateDeviceAndSwapChain(
            None,
            D3D_DRIVER_TYPE_NULL,
            None,
            D3D11_CREATE_DEVICE_FLAG(0),
            Some(&[D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_11_0]),
            D3D11_SDK_VERSION,
            Some(&DXGI_SWAP_CHAIN_DESC {
                BufferDesc: DXGI_MODE_DESC {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ScanlineOrdering: DXGI_MODE_SCANLINE_ORDER_UNSPECIFIED,
                    Scaling: DXGI_MODE_SCALING_UNSPECIFIED,
                    ..Default::default()
                },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                BufferCount: 1,
                OutputWindow: GetDesktopWindow(),
                Windowed: BOOL(1),
                SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, ..Default::default() },
                ..Default::default()
            }),
            Some(&mut swap_chain),
            Some(&mut d3d11_device),
            None,
            Some(&mut d3d11_context),
        )
    }
    .context("creating the dummy swap chain")?;
    let swap_chain = swap_chain.ok_or_else(|| anyhow!("dummy swap chain not returned"))?;

    let swap_chain_vtable = swap_chain.vtable();
    let queue_vtable = queue.vtable();

    let redirections = vec![
        Redirection {
            entry: EntryPoint::Present,
            target: CodePtr(swap_chain_vtable.Present as *mut c_void),
            detour: CodePtr(present_impl as PresentFn as *mut c_void),
        },
        Redirection {
            entry: EntryPoint::ResizeTarget,
            target: CodePtr(swap_chain_vtable.ResizeTarget as *mut c_void),
            detour: CodePtr(resize_target_impl as ResizeTargetFn as *mut c_void),
        },
        Redirection {
            entry: EntryPoint::ResizeBuffers,
            target: CodePtr(swap_chain_vtable.ResizeBuffers as *mut c_void),
            detour: CodePtr(resize_buffers_impl as ResizeBuffersFn as *mut c_void),
        },
        Redirection {
            entry: EntryPoint::ExecuteCommandLists,
            target: CodePtr(queue_vtable.ExecuteCommandLists as *mut c_void),
            detour: CodePtr(execute_command_lists_impl as ExecuteCommandListsFn as *mut c_void),
        },
    ];

    for r in &redirections {
        trace!("{:<40} = {:p}", r.entry.to_string(), r.target.0);
    }

    Ok(redirections)
}

/// Detects DirectX 12 by the presence of `d3d12.dll` in the process.
pub struct Dx12Probe {
    config: OverlayConfig,
}

impl Dx12Probe {
    /// Probe building hooks with `config`.
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }
}

impl RendererProbe for Dx12Probe {
    fn name(&self) -> &str {
        "DirectX 12"
    }

    fn probe(&self) -> Result<Option<Arc<dyn RendererHook>>> {
        if unsafe { GetModuleHandleW(w!("d3d12.dll")) }.is_err() {
            return Ok(None);
        }

        let hook = HOOK.get_or_try_init(|| -> Result<_> {
            let redirections = resolve_redirections()?;
            let hook = unsafe {
                Dx12Hook::new(
                    D3D12Api,
                    redirections,
                    Arc::new(MinHookPatcher),
                    Win32WindowHook::instance(),
                    self.config.clone(),
                )
            };
            Ok(Arc::new(hook))
        })?;

        // DirectX 12 is hooked at most once per process.
        if hook.is_retired() {
            debug!("DirectX 12 hook already unloaded");
            return Ok(None);
        }

        Ok(Some(Arc::clone(hook) as Arc<dyn RendererHook>))
    }
}

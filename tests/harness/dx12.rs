use std::collections::{BTreeMap, VecDeque};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use overlay_hook::hooks::dx12::{
    BarrierState, CpuDescriptor, Dx12Api, Dx12Hook, GpuDescriptor, HeapKind, SwapChainDesc,
};
use overlay_hook::hooks::{CodePtr, EntryPoint, Redirection, WindowHandle, WindowHook};
use overlay_hook::mh::Patcher;
use overlay_hook::OverlayConfig;
use parking_lot::Mutex;

use super::{MockPatcher, MockWindowHook};

pub const WINDOW: WindowHandle = WindowHandle(0x4242);

/// Acquisition steps a failure can be injected at.
pub const ACQUISITION_STEPS: u32 = 7;

/// Commands recorded into command lists or submitted to queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    WaitAllocator(u32),
    ResetAllocator(u32),
    ResetList { list: u32, allocator: u32 },
    Transition { resource: u32, before: BarrierState, after: BarrierState },
    SetRenderTarget(CpuDescriptor),
    SetDescriptorHeap(u32),
    Close(u32),
    Execute { queue: u32, list: u32 },
    Signal { queue: u32, allocator: u32 },
    Upload { slot: u32, width: u32, height: u32 },
}

#[derive(Default)]
struct LedgerState {
    next_id: u32,
    live: BTreeMap<&'static str, usize>,
    created: BTreeMap<&'static str, usize>,
    commands: Vec<Command>,
}

/// Shared record of every object created through [`MockDx12`].
#[derive(Default, Clone)]
pub struct Ledger(Arc<Mutex<LedgerState>>);

impl Ledger {
    fn track(&self, kind: &'static str) -> Obj {
        let mut state = self.0.lock();
        state.next_id += 1;
        *state.live.entry(kind).or_default() += 1;
        *state.created.entry(kind).or_default() += 1;
        Obj { kind, id: state.next_id, ledger: self.clone() }
    }

    fn record(&self, command: Command) {
        self.0.lock().commands.push(command);
    }

    /// Live objects of `kind`.
    pub fn live(&self, kind: &str) -> usize {
        self.0.lock().live.get(kind).copied().unwrap_or(0)
    }

    /// Live objects of every kind.
    pub fn live_total(&self) -> usize {
        self.0.lock().live.values().sum()
    }

    /// Objects of `kind` ever created.
    pub fn created(&self, kind: &str) -> usize {
        self.0.lock().created.get(kind).copied().unwrap_or(0)
    }

    /// Take the commands recorded so far.
    pub fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.0.lock().commands)
    }
}

/// An owned fake object. Dropping it releases it in the ledger.
#[derive(Debug)]
pub struct Obj {
    pub kind: &'static str,
    pub id: u32,
    ledger: Ledger,
}

impl Drop for Obj {
    fn drop(&mut self) {
        let mut state = self.ledger.0.lock();
        if let Some(live) = state.live.get_mut(self.kind) {
            *live -= 1;
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.0.lock().live.iter()).finish()
    }
}

pub struct Heap {
    pub obj: Obj,
    pub kind: HeapKind,
    pub count: u32,
}

/// Command queue identity. Not tracked: queues belong to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub id: u32,
    pub direct: bool,
}

impl Queue {
    pub fn direct(id: u32) -> Self {
        Self { id, direct: true }
    }

    pub fn copy(id: u32) -> Self {
        Self { id, direct: false }
    }
}

/// The host swap chain.
pub struct MockSwapChain {
    pub buffer_count: AtomicU32,
    pub window: WindowHandle,
    indices: Mutex<VecDeque<u32>>,
    current: AtomicU32,
}

impl MockSwapChain {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: AtomicU32::new(buffer_count),
            window: WINDOW,
            indices: Mutex::new(VecDeque::new()),
            current: AtomicU32::new(0),
        }
    }

    /// Back buffer indices reported by the next presents, in order.
    pub fn script_indices(&self, indices: impl IntoIterator<Item = u32>) {
        self.indices.lock().extend(indices);
    }

    pub fn set_buffer_count(&self, count: u32) {
        self.buffer_count.store(count, Ordering::SeqCst);
        self.current.store(0, Ordering::SeqCst);
    }

    /// Pop the next scripted index, or rotate through the buffers.
    fn next_index(&self) -> u32 {
        if let Some(index) = self.indices.lock().pop_front() {
            self.current.store(index, Ordering::SeqCst);
            return index;
        }
        let count = self.buffer_count.load(Ordering::SeqCst).max(1);
        let index = self.current.load(Ordering::SeqCst) % count;
        self.current.store((index + 1) % count, Ordering::SeqCst);
        index
    }
}

type SubmitHook = Box<dyn Fn(&Queue) + Send + Sync>;

/// [`Dx12Api`] recording every call into a [`Ledger`].
#[derive(Default)]
pub struct MockDx12 {
    pub ledger: Ledger,
    /// Acquisition step (1..=7) that fails.
    pub fail_step: AtomicU32,
    pub fail_texture: std::sync::atomic::AtomicBool,
    /// Called with the upload queue, like the native upload going through the
    /// hooked `ExecuteCommandLists`.
    pub on_upload: Mutex<Option<SubmitHook>>,
}

impl MockDx12 {
    fn check(&self, step: u32) -> Result<()> {
        if self.fail_step.load(Ordering::SeqCst) == step {
            bail!("injected failure at step {step}");
        }
        Ok(())
    }

    pub fn fail_at(&self, step: u32) {
        self.fail_step.store(step, Ordering::SeqCst);
    }
}

impl Dx12Api for MockDx12 {
    type SwapChain = MockSwapChain;
    type Device = Obj;
    type DescriptorHeap = Heap;
    type CommandAllocator = Obj;
    type CommandList = Obj;
    type CommandQueue = Queue;
    type Resource = Obj;
    type Texture = Obj;

    fn swap_chain_desc(&self, swap_chain: &MockSwapChain) -> Result<SwapChainDesc> {
        self.check(2)?;
        Ok(SwapChainDesc {
            buffer_count: swap_chain.buffer_count.load(Ordering::SeqCst),
            window: swap_chain.window,
            width: 800,
            height: 600,
        })
    }

    fn current_back_buffer_index(&self, swap_chain: &MockSwapChain) -> u32 {
        swap_chain.next_index()
    }

    fn device(&self, _swap_chain: &MockSwapChain) -> Result<Obj> {
        self.check(1)?;
        Ok(self.ledger.track("device"))
    }

    fn create_descriptor_heap(&self, _device: &Obj, kind: HeapKind, count: u32) -> Result<Heap> {
        match kind {
            HeapKind::ShaderResource => self.check(3)?,
            HeapKind::RenderTarget => self.check(4)?,
        }
        Ok(Heap { obj: self.ledger.track("heap"), kind, count })
    }

    fn create_command_allocator(&self, _device: &Obj) -> Result<Obj> {
        // Fail on the second allocator so the first one has to be rolled back.
        if self.fail_step.load(Ordering::SeqCst) == 5 && self.ledger.live("allocator") > 0 {
            bail!("injected failure at step 5");
        }
        Ok(self.ledger.track("allocator"))
    }

    fn create_command_list(&self, _device: &Obj, _allocator: &Obj) -> Result<Obj> {
        self.check(6)?;
        Ok(self.ledger.track("command_list"))
    }

    fn back_buffer(&self, _swap_chain: &MockSwapChain, index: u32) -> Result<Obj> {
        if index > 0 {
            self.check(7)?;
        }
        Ok(self.ledger.track("back_buffer"))
    }

    fn create_render_target_view(
        &self,
        _device: &Obj,
        heap: &Heap,
        index: u32,
        _resource: &Obj,
    ) -> CpuDescriptor {
        assert_eq!(heap.kind, HeapKind::RenderTarget);
        assert!(index < heap.count);
        rtv(heap.obj.id, index)
    }

    fn wait_for_allocator(&self, allocator: &Obj) -> Result<()> {
        self.ledger.record(Command::WaitAllocator(allocator.id));
        Ok(())
    }

    fn signal_allocator(&self, queue: &Queue, allocator: &Obj) -> Result<()> {
        self.ledger.record(Command::Signal { queue: queue.id, allocator: allocator.id });
        Ok(())
    }

    fn reset_allocator(&self, allocator: &Obj) -> Result<()> {
        self.ledger.record(Command::ResetAllocator(allocator.id));
        Ok(())
    }

    fn reset_command_list(&self, list: &Obj, allocator: &Obj) -> Result<()> {
        self.ledger.record(Command::ResetList { list: list.id, allocator: allocator.id });
        Ok(())
    }

    fn transition(&self, _list: &Obj, resource: &Obj, before: BarrierState, after: BarrierState) {
        self.ledger.record(Command::Transition { resource: resource.id, before, after });
    }

    fn set_render_target(&self, _list: &Obj, target: CpuDescriptor) {
        self.ledger.record(Command::SetRenderTarget(target));
    }

    fn set_descriptor_heap(&self, _list: &Obj, heap: &Heap) {
        self.ledger.record(Command::SetDescriptorHeap(heap.obj.id));
    }

    fn close(&self, list: &Obj) -> Result<()> {
        self.ledger.record(Command::Close(list.id));
        Ok(())
    }

    fn execute(&self, queue: &Queue, list: &Obj) -> Result<()> {
        self.ledger.record(Command::Execute { queue: queue.id, list: list.id });
        Ok(())
    }

    fn is_direct_queue(&self, queue: &Queue) -> bool {
        queue.direct
    }

    fn create_texture(
        &self,
        _device: &Obj,
        queue: &Queue,
        heap: &Heap,
        slot: u32,
        _data: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Obj, GpuDescriptor)> {
        assert_eq!(heap.kind, HeapKind::ShaderResource);
        if self.fail_texture.load(Ordering::SeqCst) {
            bail!("injected texture failure");
        }
        self.ledger.record(Command::Upload { slot, width, height });
        if let Some(on_upload) = self.on_upload.lock().as_ref() {
            on_upload(queue);
        }
        Ok((self.ledger.track("texture"), GpuDescriptor(0x10_0000 + slot as u64 * 32)))
    }
}

/// Render-target descriptor the mock writes for slot `index` of heap `heap`.
pub fn rtv(heap: u32, index: u32) -> CpuDescriptor {
    CpuDescriptor(((heap as usize) << 16) + index as usize * 32)
}

/// Fake entry points, all distinct and non-null.
pub fn redirections() -> Vec<Redirection> {
    EntryPoint::ALL
        .into_iter()
        .enumerate()
        .map(|(i, entry)| Redirection {
            entry,
            target: CodePtr(((i + 1) * 0x10) as *mut c_void),
            detour: CodePtr(((i + 1) * 0x10 + 0x8) as *mut c_void),
        })
        .collect()
}

/// A [`Dx12Hook`] over [`MockDx12`] plus handles on its collaborators.
pub struct Dx12Harness {
    pub hook: Dx12Hook<MockDx12>,
    pub patcher: Arc<MockPatcher>,
    pub window: Arc<MockWindowHook>,
    pub swap_chain: MockSwapChain,
}

impl Dx12Harness {
    pub fn new(buffer_count: u32) -> Self {
        Self::with_redirections(buffer_count, redirections())
    }

    pub fn with_redirections(buffer_count: u32, redirections: Vec<Redirection>) -> Self {
        super::setup_tracing();
        let patcher = Arc::new(MockPatcher::default());
        let window = Arc::new(MockWindowHook::default());
        let dyn_patcher: Arc<dyn Patcher> = Arc::clone(&patcher) as Arc<dyn Patcher>;
        let dyn_window: Arc<dyn WindowHook> = Arc::clone(&window) as Arc<dyn WindowHook>;
        let hook = unsafe {
            Dx12Hook::new(
                MockDx12::default(),
                redirections,
                dyn_patcher,
                dyn_window,
                OverlayConfig::default().with_texture_descriptor_count(4),
            )
        };

        Self { hook, patcher, window, swap_chain: MockSwapChain::new(buffer_count) }
    }

    /// A shared harness whose uploads re-enter the submission interception.
    pub fn reentrant(buffer_count: u32) -> Arc<Self> {
        let harness = Arc::new(Self::new(buffer_count));
        let weak = Arc::downgrade(&harness);
        *harness.hook.api().on_upload.lock() = Some(Box::new(move |queue| {
            if let Some(harness) = weak.upgrade() {
                harness.hook.execute_command_lists(queue);
            }
        }));
        harness
    }

    pub fn ledger(&self) -> &Ledger {
        &self.hook.api().ledger
    }

    /// Start the hook with a toggle callback that flips visibility.
    pub fn start(&self) -> bool {
        use overlay_hook::hooks::RendererHook;

        let mut visible = false;
        self.hook.start_hook(
            Box::new(move || {
                visible = !visible;
                visible
            }),
            &[],
        )
    }

    /// Observe the host submitting on a direct queue, then present.
    pub fn frame(&self) {
        self.hook.execute_command_lists(&Queue::direct(1));
        self.hook.present(&self.swap_chain);
    }
}

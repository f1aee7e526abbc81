#![allow(dead_code)]

pub mod dx12;

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};

use overlay_hook::hooks::{WindowHandle, WindowHook};
use overlay_hook::input::InputHook;
use overlay_hook::mh::{Patcher, MH_STATUS};
use overlay_hook::{ImageResource, OverlayRenderLoop, RenderContext};
use parking_lot::Mutex;

/// Install a test subscriber once per test binary.
pub fn setup_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("overlay_hook=trace")
            .try_init();
    });
}

/// Patcher that hands out fake trampolines and counts what it is asked to do.
#[derive(Default)]
pub struct MockPatcher {
    pub transactions: AtomicUsize,
    pub live: Mutex<Vec<usize>>,
    pub staged: Mutex<Vec<usize>>,
    pub restored: AtomicUsize,
    pub fail_commit: AtomicBool,
}

impl MockPatcher {
    pub fn trampoline_of(target: *mut c_void) -> *mut c_void {
        (target as usize + 0x1000) as *mut c_void
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl Patcher for MockPatcher {
    fn begin(&self) -> Result<(), MH_STATUS> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    unsafe fn redirect(
        &self,
        target: *mut c_void,
        _detour: *mut c_void,
    ) -> Result<*mut c_void, MH_STATUS> {
        self.staged.lock().push(target as usize);
        Ok(Self::trampoline_of(target))
    }

    fn commit(&self, targets: &[*mut c_void]) -> Result<(), MH_STATUS> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(MH_STATUS::MH_ERROR_MEMORY_PROTECT);
        }
        let mut staged = self.staged.lock();
        staged.retain(|t| !targets.contains(&(*t as *mut c_void)));
        self.live.lock().extend(targets.iter().map(|&t| t as usize));
        Ok(())
    }

    fn abort(&self, targets: &[*mut c_void]) {
        self.staged.lock().retain(|t| !targets.contains(&(*t as *mut c_void)));
    }

    unsafe fn restore(&self, targets: &[*mut c_void]) -> Result<(), MH_STATUS> {
        self.live.lock().retain(|t| !targets.contains(&(*t as *mut c_void)));
        self.restored.fetch_add(targets.len(), Ordering::SeqCst);
        Ok(())
    }
}

/// Window hook accepting every window and recording the calls it receives.
#[derive(Default)]
pub struct MockWindowHook {
    pub input: Mutex<Option<Arc<InputHook>>>,
    pub prepared: Mutex<Vec<WindowHandle>>,
    pub resets: AtomicUsize,
    pub unhooked: AtomicBool,
    pub refuse_start: AtomicBool,
    pub refuse_frames: AtomicBool,
}

impl WindowHook for MockWindowHook {
    fn start_hook(&self, input: Arc<InputHook>) -> bool {
        if self.refuse_start.load(Ordering::SeqCst) {
            return false;
        }
        *self.input.lock() = Some(input);
        true
    }

    fn prepare_for_overlay(&self, window: WindowHandle) -> bool {
        self.prepared.lock().push(window);
        !self.refuse_frames.load(Ordering::SeqCst)
    }

    fn reset_render_state(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn unhook(&self) {
        self.unhooked.store(true, Ordering::SeqCst);
    }
}

/// What the render loop observed.
#[derive(Debug, Default)]
pub struct LoopLog {
    pub initialized: usize,
    pub ready: Vec<bool>,
    pub frames: usize,
    pub images: Vec<Weak<ImageResource>>,
}

/// Render loop logging every callback. Optionally uploads an image in
/// `initialize`.
pub struct RecordingLoop {
    pub log: Arc<Mutex<LoopLog>>,
    pub image_on_init: Option<(u32, u32)>,
}

impl RecordingLoop {
    pub fn new() -> (Self, Arc<Mutex<LoopLog>>) {
        let log = Arc::new(Mutex::new(LoopLog::default()));
        (Self { log: Arc::clone(&log), image_on_init: None }, log)
    }

    pub fn with_image(mut self, width: u32, height: u32) -> Self {
        self.image_on_init = Some((width, height));
        self
    }
}

impl OverlayRenderLoop for RecordingLoop {
    fn initialize(&mut self, ctx: &mut dyn RenderContext) {
        let mut log = self.log.lock();
        log.initialized += 1;
        if let Some((width, height)) = self.image_on_init {
            let data = vec![0xffu8; (width * height * 4) as usize];
            log.images.push(ctx.create_image_resource(&data, width, height));
        }
    }

    fn hook_ready(&mut self, ready: bool) {
        self.log.lock().ready.push(ready);
    }

    fn render(&mut self, _ctx: &mut dyn RenderContext) {
        self.log.lock().frames += 1;
    }
}

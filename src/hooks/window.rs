//! Win32 window hook.
//!
//! Subclasses the window being presented to so that keyboard and mouse
//! messages reach the [`InputHook`] first, and patches `GetCursorPos` and
//! `GetAsyncKeyState` so the host application cannot see the cursor move or
//! the mouse buttons go down while its inputs are hidden.

use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};
use windows::core::{s, w};
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, LRESULT, POINT, WPARAM};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::UI::Input::KeyboardAndMouse::*;
use windows::Win32::UI::WindowsAndMessaging::*;

use crate::hooks::{CodePtr, WindowHandle, WindowHook, DETOURS};
use crate::input::{InputEvent, InputHook, MessageFilter, MouseButtons};
use crate::mh::{MinHookPatcher, PatchTransaction, Patcher};

type WndProcType =
    unsafe extern "system" fn(hwnd: HWND, umsg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT;
type GetCursorPosFn = unsafe extern "system" fn(*mut POINT) -> BOOL;
type GetAsyncKeyStateFn = unsafe extern "system" fn(i32) -> i16;

static INSTANCE: Lazy<Arc<Win32WindowHook>> =
    Lazy::new(|| Arc::new(Win32WindowHook::new(Arc::new(MinHookPatcher))));

#[derive(Clone, Copy)]
struct CursorTrampolines {
    get_cursor_pos: CodePtr,
    get_async_key_state: CodePtr,
}

/// [`WindowHook`] for Win32 windows. There is one per process.
pub struct Win32WindowHook {
    patcher: Arc<dyn Patcher>,
    filter: MessageFilter,
    input: RwLock<Option<Arc<InputHook>>>,
    trampolines: RwLock<Option<CursorTrampolines>>,
    patched: Mutex<Vec<CodePtr>>,
    subclass: Mutex<()>,
    window: AtomicIsize,
    original_wnd_proc: AtomicIsize,
    retired: AtomicBool,
}

impl Win32WindowHook {
    fn new(patcher: Arc<dyn Patcher>) -> Self {
        Self {
            patcher,
            filter: MessageFilter::default(),
            input: RwLock::new(None),
            trampolines: RwLock::new(None),
            patched: Mutex::new(Vec::new()),
            subclass: Mutex::new(()),
            window: AtomicIsize::new(0),
            original_wnd_proc: AtomicIsize::new(0),
            retired: AtomicBool::new(false),
        }
    }

    /// The process-wide instance.
    pub fn instance() -> Arc<Win32WindowHook> {
        Arc::clone(&INSTANCE)
    }

    fn input(&self) -> Option<Arc<InputHook>> {
        self.input.read().clone()
    }

    fn patch_cursor_functions(&self) -> Result<()> {
        if !self.patched.lock().is_empty() {
            return Ok(());
        }

        let user32 = unsafe { GetModuleHandleW(w!("user32.dll")) }.context("finding user32.dll")?;
        let get_cursor_pos = unsafe { GetProcAddress(user32, s!("GetCursorPos")) }
            .ok_or_else(|| anyhow!("GetCursorPos not found"))?;
        let get_async_key_state = unsafe { GetProcAddress(user32, s!("GetAsyncKeyState")) }
            .ok_or_else(|| anyhow!("GetAsyncKeyState not found"))?;

        let targets = [get_cursor_pos as *mut c_void, get_async_key_state as *mut c_void];

        let mut transaction = PatchTransaction::begin(self.patcher.as_ref())?;
        let get_cursor_pos = unsafe {
            transaction.redirect(targets[0], get_cursor_pos_impl as GetCursorPosFn as *mut c_void)
        }?;
        let get_async_key_state = unsafe {
            transaction
                .redirect(targets[1], get_async_key_state_impl as GetAsyncKeyStateFn as *mut c_void)
        }?;

        *self.trampolines.write() = Some(CursorTrampolines {
            get_cursor_pos: CodePtr(get_cursor_pos),
            get_async_key_state: CodePtr(get_async_key_state),
        });
        transaction.end()?;

        *self.patched.lock() = targets.into_iter().map(CodePtr).collect();
        debug!("Patched GetCursorPos and GetAsyncKeyState");
        Ok(())
    }

    fn restore_wnd_proc(&self) {
        let _subclass = self.subclass.lock();
        let window = self.window.swap(0, Ordering::SeqCst);
        let original = self.original_wnd_proc.load(Ordering::SeqCst);
        if window != 0 && original != 0 {
            unsafe { set_wnd_proc(HWND(window), original) };
            debug!("Restored the window procedure of {window:#x}");
        }
    }
}

impl WindowHook for Win32WindowHook {
    fn start_hook(&self, input: Arc<InputHook>) -> bool {
        if self.retired.load(Ordering::SeqCst) {
            error!("Window hook already unloaded");
            return false;
        }

        *self.input.write() = Some(input);

        if let Err(e) = self.patch_cursor_functions() {
            error!("Couldn't patch the cursor functions: {e:?}");
            *self.input.write() = None;
            return false;
        }

        true
    }

    fn prepare_for_overlay(&self, window: WindowHandle) -> bool {
        if self.retired.load(Ordering::SeqCst) || window.0 == 0 {
            return false;
        }
        if self.window.load(Ordering::SeqCst) == window.0 {
            return true;
        }

        self.restore_wnd_proc();

        let _subclass = self.subclass.lock();
        let original = unsafe { set_wnd_proc(HWND(window.0), wnd_proc as WndProcType as isize) };
        if original == 0 {
            warn!("Couldn't subclass window {:#x}", window.0);
            return false;
        }

        self.original_wnd_proc.store(original, Ordering::SeqCst);
        self.window.store(window.0, Ordering::SeqCst);
        info!("Subclassed window {:#x}", window.0);
        true
    }

    fn reset_render_state(&self) {
        self.restore_wnd_proc();
    }

    fn unhook(&self) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }

        self.restore_wnd_proc();

        let targets: Vec<_> = self.patched.lock().drain(..).map(|CodePtr(ptr)| ptr).collect();
        if !targets.is_empty() {
            if let Err(e) = unsafe { self.patcher.restore(&targets) } {
                error!("Couldn't restore the cursor functions: {e}");
            }
        }

        if let Some(input) = self.input.write().take() {
            input.reset();
        }
    }
}

#[cfg(target_arch = "x86")]
unsafe fn set_wnd_proc(hwnd: HWND, wnd_proc: isize) -> isize {
    SetWindowLongW(hwnd, GWLP_WNDPROC, wnd_proc as i32) as isize
}

#[cfg(not(target_arch = "x86"))]
unsafe fn set_wnd_proc(hwnd: HWND, wnd_proc: isize) -> isize {
    SetWindowLongPtrW(hwnd, GWLP_WNDPROC, wnd_proc)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Message translation
////////////////////////////////////////////////////////////////////////////////////////////////////

// Replication of the Win32 HIWORD macro.
#[inline]
fn hiword(l: u32) -> u16 {
    ((l >> 16) & 0xffff) as u16
}

// Replication of the Win32 LOWORD macro.
#[inline]
fn loword(l: u32) -> u16 {
    (l & 0xffff) as u16
}

fn map_vkey(wparam: u16, lparam: usize) -> VIRTUAL_KEY {
    match VIRTUAL_KEY(wparam) {
        VK_SHIFT => unsafe {
            match MapVirtualKeyW(((lparam & 0x00ff0000) >> 16) as u32, MAPVK_VSC_TO_VK_EX) {
                0 => VIRTUAL_KEY(wparam),
                i => VIRTUAL_KEY(i as _),
            }
        },
        VK_CONTROL => {
            if lparam & 0x01000000 != 0 {
                VK_RCONTROL
            } else {
                VK_LCONTROL
            }
        },
        VK_MENU => {
            if lparam & 0x01000000 != 0 {
                VK_RMENU
            } else {
                VK_LMENU
            }
        },
        _ => VIRTUAL_KEY(wparam),
    }
}

fn x_button(wparam: usize) -> MouseButtons {
    if hiword(wparam as _) == XBUTTON1 {
        MouseButtons::X1
    } else {
        MouseButtons::X2
    }
}

fn translate(umsg: u32, WPARAM(wparam): WPARAM, LPARAM(lparam): LPARAM) -> Option<InputEvent> {
    let button = |button, pressed| Some(InputEvent::MouseButton { button, pressed });

    match umsg {
        state @ (WM_KEYDOWN | WM_SYSKEYDOWN | WM_KEYUP | WM_SYSKEYUP) if wparam < 256 => {
            let pressed = state == WM_KEYDOWN || state == WM_SYSKEYDOWN;
            Some(InputEvent::Key { vkey: map_vkey(wparam as _, lparam as _).0, pressed })
        },
        WM_CHAR => char::from_u32(wparam as u32).map(InputEvent::Character),
        WM_LBUTTONDOWN | WM_LBUTTONDBLCLK => button(MouseButtons::LEFT, true),
        WM_RBUTTONDOWN | WM_RBUTTONDBLCLK => button(MouseButtons::RIGHT, true),
        WM_MBUTTONDOWN | WM_MBUTTONDBLCLK => button(MouseButtons::MIDDLE, true),
        WM_XBUTTONDOWN | WM_XBUTTONDBLCLK => button(x_button(wparam), true),
        WM_LBUTTONUP => button(MouseButtons::LEFT, false),
        WM_RBUTTONUP => button(MouseButtons::RIGHT, false),
        WM_MBUTTONUP => button(MouseButtons::MIDDLE, false),
        WM_XBUTTONUP => button(x_button(wparam), false),
        WM_MOUSEMOVE => Some(InputEvent::MouseMove {
            x: loword(lparam as _) as i16 as i32,
            y: hiword(lparam as _) as i16 as i32,
        }),
        WM_MOUSEWHEEL | WM_MOUSEHWHEEL => Some(InputEvent::Wheel {
            // Equivalent to GET_WHEEL_DELTA_WPARAM.
            delta: hiword(wparam as _) as i16 as f32 / WHEEL_DELTA as f32,
            horizontal: umsg == WM_MOUSEHWHEEL,
        }),
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Detours
////////////////////////////////////////////////////////////////////////////////////////////////////

unsafe extern "system" fn wnd_proc(hwnd: HWND, umsg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    let _guard = DETOURS.enter();
    let hook = &*INSTANCE;

    let original = hook.original_wnd_proc.load(Ordering::SeqCst);
    if original == 0 {
        return DefWindowProcW(hwnd, umsg, wparam, lparam);
    }

    if let Some(input) = hook.input() {
        let hidden = match translate(umsg, wparam, lparam) {
            Some(event) => input.on_event(event),
            None => input.app_inputs_hidden(),
        };
        if hidden && hook.filter.is_blocking(umsg) {
            trace!("Blocking message {umsg:#x}");
            return LRESULT(1);
        }
    }

    let original: WndProcType = mem::transmute(original);
    CallWindowProcW(Some(original), hwnd, umsg, wparam, lparam)
}

unsafe extern "system" fn get_cursor_pos_impl(point: *mut POINT) -> BOOL {
    let _guard = DETOURS.enter();
    let hook = &*INSTANCE;

    let Some(trampolines) = *hook.trampolines.read() else {
        return BOOL(0);
    };
    let original: GetCursorPosFn = mem::transmute(trampolines.get_cursor_pos.0);
    let result = original(point);

    if result.as_bool() && !point.is_null() {
        if let Some(input) = hook.input() {
            let (x, y) = input.cursor_position(((*point).x, (*point).y));
            *point = POINT { x, y };
        }
    }

    result
}

fn mouse_button(vkey: i32) -> Option<MouseButtons> {
    match VIRTUAL_KEY(vkey as u16) {
        VK_LBUTTON => Some(MouseButtons::LEFT),
        VK_RBUTTON => Some(MouseButtons::RIGHT),
        VK_MBUTTON => Some(MouseButtons::MIDDLE),
        VK_XBUTTON1 => Some(MouseButtons::X1),
        VK_XBUTTON2 => Some(MouseButtons::X2),
        _ => None,
    }
}

unsafe extern "system" fn get_async_key_state_impl(vkey: i32) -> i16 {
    let _guard = DETOURS.enter();
    let hook = &*INSTANCE;

    let Some(trampolines) = *hook.trampolines.read() else {
        return 0;
    };
    let original: GetAsyncKeyStateFn = mem::transmute(trampolines.get_async_key_state.0);
    let state = original(vkey);

    let (Some(button), Some(input)) = (mouse_button(vkey), hook.input()) else {
        return state;
    };

    let live = if state as u16 & 0x8000 != 0 { button } else { MouseButtons::empty() };
    if input.pressed_mouse_buttons(live).contains(button) {
        state
    } else {
        0
    }
}

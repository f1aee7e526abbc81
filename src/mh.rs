//! Patch primitive.
//!
//! A [`Patcher`] redirects native entry points to replacement functions and
//! hands back trampolines that still reach the original functions.
//! Redirections are grouped in a [`PatchTransaction`]: either every target of
//! the transaction is rerouted when it ends, or none is.
//!
//! On Windows the primitive is backed by
//! [`minhook`](https://github.com/TsudaKageyu/minhook) through [`MinHookPatcher`].
#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::fmt;

use tracing::error;

/// Status codes of the patch primitive. Mirrors MinHook's `MH_STATUS`.
#[must_use]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MH_STATUS {
    /// Unknown error. Should not be returned.
    MH_UNKNOWN = -1,
    /// Successful.
    MH_OK = 0,
    /// MinHook is already initialized.
    MH_ERROR_ALREADY_INITIALIZED,
    /// MinHook is not initialized yet, or already uninitialized.
    MH_ERROR_NOT_INITIALIZED,
    /// The hook for the specified target function is already created.
    MH_ERROR_ALREADY_CREATED,
    /// The hook for the specified target function is not created yet.
    MH_ERROR_NOT_CREATED,
    /// The hook for the specified target function is already enabled.
    MH_ERROR_ENABLED,
    /// The hook for the specified target function is not enabled yet, or
    /// already disabled.
    MH_ERROR_DISABLED,
    /// The specified pointer is invalid. It points the address of non-allocated
    /// and/or non-executable region.
    MH_ERROR_NOT_EXECUTABLE,
    /// The specified target function cannot be hooked.
    MH_ERROR_UNSUPPORTED_FUNCTION,
    /// Failed to allocate memory.
    MH_ERROR_MEMORY_ALLOC,
    /// Failed to change the memory protection.
    MH_ERROR_MEMORY_PROTECT,
    /// The specified module is not loaded.
    MH_ERROR_MODULE_NOT_FOUND,
    /// The specified function is not found.
    MH_ERROR_FUNCTION_NOT_FOUND,
}

impl MH_STATUS {
    /// Convert a raw status code returned by the native library.
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => MH_STATUS::MH_OK,
            1 => MH_STATUS::MH_ERROR_ALREADY_INITIALIZED,
            2 => MH_STATUS::MH_ERROR_NOT_INITIALIZED,
            3 => MH_STATUS::MH_ERROR_ALREADY_CREATED,
            4 => MH_STATUS::MH_ERROR_NOT_CREATED,
            5 => MH_STATUS::MH_ERROR_ENABLED,
            6 => MH_STATUS::MH_ERROR_DISABLED,
            7 => MH_STATUS::MH_ERROR_NOT_EXECUTABLE,
            8 => MH_STATUS::MH_ERROR_UNSUPPORTED_FUNCTION,
            9 => MH_STATUS::MH_ERROR_MEMORY_ALLOC,
            10 => MH_STATUS::MH_ERROR_MEMORY_PROTECT,
            11 => MH_STATUS::MH_ERROR_MODULE_NOT_FOUND,
            12 => MH_STATUS::MH_ERROR_FUNCTION_NOT_FOUND,
            _ => MH_STATUS::MH_UNKNOWN,
        }
    }

    /// Like [`MH_STATUS::ok`], logging failures under `context`.
    pub fn ok_context(self, context: &str) -> Result<(), MH_STATUS> {
        if self == MH_STATUS::MH_OK {
            Ok(())
        } else {
            error!("{context}: {self:?}");
            Err(self)
        }
    }

    /// Turn the status into a `Result`.
    pub fn ok(self) -> Result<(), MH_STATUS> {
        if self == MH_STATUS::MH_OK {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MH_STATUS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for MH_STATUS {}

/// Backend of the patch primitive.
///
/// Implementors are driven through [`PatchTransaction`]; calling the methods
/// directly bypasses the all-or-nothing guarantee.
pub trait Patcher: Send + Sync {
    /// Prepare the backend for a new transaction.
    fn begin(&self) -> Result<(), MH_STATUS>;

    /// Stage the redirection of `target` to `detour` and return the
    /// trampoline that reaches the original function. The redirection
    /// is not live until [`Patcher::commit`].
    ///
    /// # Safety
    ///
    /// `target` must point to the start of a function and `detour` must have
    /// the exact same signature and calling convention.
    unsafe fn redirect(
        &self,
        target: *mut c_void,
        detour: *mut c_void,
    ) -> Result<*mut c_void, MH_STATUS>;

    /// Make every staged redirection in `targets` live at once.
    fn commit(&self, targets: &[*mut c_void]) -> Result<(), MH_STATUS>;

    /// Forget the staged redirections in `targets`.
    fn abort(&self, targets: &[*mut c_void]);

    /// Disable live redirections. Their trampolines stay callable so that
    /// detours still in flight can return through them.
    ///
    /// # Safety
    ///
    /// No thread may be executing a detour whose module is about to go away.
    unsafe fn restore(&self, targets: &[*mut c_void]) -> Result<(), MH_STATUS>;
}

/// A scoped begin / redirect / end transaction over a [`Patcher`].
///
/// Dropping a transaction without calling [`PatchTransaction::end`] aborts
/// every redirection staged so far.
pub struct PatchTransaction<'a> {
    patcher: &'a dyn Patcher,
    targets: Vec<*mut c_void>,
    finished: bool,
}

impl<'a> PatchTransaction<'a> {
    /// Begin a transaction.
    pub fn begin(patcher: &'a dyn Patcher) -> Result<Self, MH_STATUS> {
        patcher.begin()?;
        Ok(Self { patcher, targets: Vec::new(), finished: false })
    }

    /// Stage a redirection and return the trampoline to the original.
    ///
    /// # Safety
    ///
    /// See [`Patcher::redirect`].
    pub unsafe fn redirect(
        &mut self,
        target: *mut c_void,
        detour: *mut c_void,
    ) -> Result<*mut c_void, MH_STATUS> {
        let trampoline = self.patcher.redirect(target, detour)?;
        self.targets.push(target);
        Ok(trampoline)
    }

    /// Number of staged redirections.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether nothing has been staged yet.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Commit the transaction. On failure every staged redirection is
    /// discarded.
    pub fn end(mut self) -> Result<(), MH_STATUS> {
        self.finished = true;
        let result = self.patcher.commit(&self.targets);
        if result.is_err() {
            self.patcher.abort(&self.targets);
        }
        result
    }
}

impl Drop for PatchTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.patcher.abort(&self.targets);
        }
    }
}

// A hook that was created but could not be queued is removed right away: the
// transaction never learns about its target and would not abort it.
#[cfg_attr(not(windows), allow(dead_code))]
fn stage_hook<T>(
    create: impl FnOnce() -> Result<T, MH_STATUS>,
    queue: impl FnOnce() -> Result<(), MH_STATUS>,
    remove: impl FnOnce(),
) -> Result<T, MH_STATUS> {
    let created = create()?;
    if let Err(e) = queue() {
        remove();
        return Err(e);
    }
    Ok(created)
}

/// [`Patcher`] backed by MinHook.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MinHookPatcher;

#[cfg(windows)]
impl Patcher for MinHookPatcher {
    fn begin(&self) -> Result<(), MH_STATUS> {
        match MH_STATUS::from_raw(unsafe { minhook_sys::MH_Initialize() } as i32) {
            MH_STATUS::MH_OK | MH_STATUS::MH_ERROR_ALREADY_INITIALIZED => Ok(()),
            status => status.ok_context("MH_Initialize"),
        }
    }

    unsafe fn redirect(
        &self,
        target: *mut c_void,
        detour: *mut c_void,
    ) -> Result<*mut c_void, MH_STATUS> {
        stage_hook(
            || {
                let mut trampoline = std::ptr::null_mut();
                MH_STATUS::from_raw(
                    minhook_sys::MH_CreateHook(target, detour, &mut trampoline) as i32
                )
                .ok_context("MH_CreateHook")
                .map(|()| trampoline)
            },
            || {
                MH_STATUS::from_raw(minhook_sys::MH_QueueEnableHook(target) as i32)
                    .ok_context("MH_QueueEnableHook")
            },
            || {
                let _ = MH_STATUS::from_raw(minhook_sys::MH_RemoveHook(target) as i32)
                    .ok_context("MH_RemoveHook");
            },
        )
    }

    fn commit(&self, _targets: &[*mut c_void]) -> Result<(), MH_STATUS> {
        MH_STATUS::from_raw(unsafe { minhook_sys::MH_ApplyQueued() } as i32)
            .ok_context("MH_ApplyQueued")
    }

    fn abort(&self, targets: &[*mut c_void]) {
        for &target in targets {
            let _ = MH_STATUS::from_raw(unsafe { minhook_sys::MH_RemoveHook(target) } as i32)
                .ok_context("MH_RemoveHook");
        }
    }

    unsafe fn restore(&self, targets: &[*mut c_void]) -> Result<(), MH_STATUS> {
        for &target in targets {
            MH_STATUS::from_raw(minhook_sys::MH_QueueDisableHook(target) as i32)
                .ok_context("MH_QueueDisableHook")?;
        }
        MH_STATUS::from_raw(minhook_sys::MH_ApplyQueued() as i32).ok_context("MH_ApplyQueued")
    }
}

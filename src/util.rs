//! Logging setup and small FFI helpers.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "overlay_hook=info";

/// Install a `tracing` subscriber printing to stdout and, if `log_file` is
/// given, to that file.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
/// Fails if a global subscriber is already installed.
pub fn setup_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_names(true)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        },
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(
            fmt::layer().event_format(
                fmt::format()
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_names(true),
            ),
        )
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("installing the tracing subscriber")
}

/// Helper for fallible [`windows`](https://docs.rs/windows) APIs that have an
/// out-param with a default value.
///
/// # Example
///
/// ```ignore
/// let desc = try_out_param(|sd| unsafe { swap_chain.GetDesc(sd) })?;
/// ```
pub fn try_out_param<T, F, E, O>(mut f: F) -> Result<T, E>
where
    T: Default,
    F: FnMut(&mut T) -> Result<O, E>,
{
    let mut t = T::default();
    f(&mut t)?;
    Ok(t)
}

#[cfg(windows)]
pub use self::win::*;

#[cfg(windows)]
mod win {
    use std::path::PathBuf;

    use anyhow::{anyhow, Result};
    use tracing::error;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{GetLastError, HMODULE, MAX_PATH};
    use windows::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    /// Path of the module containing this crate, i.e. the injected DLL.
    pub fn get_dll_path() -> Option<PathBuf> {
        let mut hmodule = HMODULE::default();
        let _ = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT | GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
                PCWSTR(get_dll_path as *const () as *const u16),
                &mut hmodule,
            )
        };

        if hmodule.0 == 0 {
            error!("get_dll_path: GetModuleHandleExW error: {:?}", unsafe { GetLastError() });
            return None;
        }

        let mut filename = [0u16; MAX_PATH as usize];
        let len = unsafe { GetModuleFileNameW(hmodule, &mut filename) } as usize;
        if len == 0 {
            return None;
        }

        Some(PathBuf::from(String::from_utf16_lossy(&filename[..len])))
    }

    /// Default log file: the DLL path with a `.log` extension.
    pub fn default_log_path() -> Option<PathBuf> {
        get_dll_path().map(|mut path| {
            path.set_extension("log");
            path
        })
    }

    /// Helper for fallible [`windows`] APIs that have an optional pointer
    /// out-param.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let dev: ID3D12Device =
    ///     try_out_ptr(|v| unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, v) })?;
    /// ```
    pub fn try_out_ptr<T, F, O>(mut f: F) -> Result<T>
    where
        F: FnMut(&mut Option<T>) -> windows::core::Result<O>,
    {
        let mut t: Option<T> = None;
        f(&mut t)?;
        t.ok_or_else(|| anyhow!("out-param left empty"))
    }
}

//! Process-scoped owner of the live render hook.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::hooks::RendererHook;

static GLOBAL: Lazy<Arc<OverlayRegistry>> = Lazy::new(|| Arc::new(OverlayRegistry::new()));

/// Holds at most one [`RendererHook`] for the process.
///
/// The hook is constructed once, the first time a probe succeeds, and
/// destroyed by [`OverlayRegistry::unload`]. Collaborators receive the
/// registry explicitly; [`OverlayRegistry::global`] exists for native entry
/// points that cannot capture it.
#[derive(Default)]
pub struct OverlayRegistry {
    hook: Mutex<Option<Arc<dyn RendererHook>>>,
    constructed: AtomicUsize,
}

impl OverlayRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used by the DLL entry point.
    pub fn global() -> &'static Arc<OverlayRegistry> {
        &GLOBAL
    }

    /// The live hook, if any.
    pub fn get(&self) -> Option<Arc<dyn RendererHook>> {
        self.hook.lock().clone()
    }

    /// Return the live hook, or run `init` to construct it.
    ///
    /// `init` runs under the registry lock, so concurrent callers never
    /// construct two hooks. `Ok(None)` from `init` leaves the registry empty.
    pub fn get_or_try_init<F>(&self, init: F) -> Result<Option<Arc<dyn RendererHook>>>
    where
        F: FnOnce() -> Result<Option<Arc<dyn RendererHook>>>,
    {
        let mut hook = self.hook.lock();
        if let Some(hook) = hook.as_ref() {
            return Ok(Some(Arc::clone(hook)));
        }

        let created = init()?;
        if let Some(created) = created.as_ref() {
            self.constructed.fetch_add(1, Ordering::SeqCst);
            info!("Registered {} render hook", created.library_name());
            *hook = Some(Arc::clone(created));
        }
        Ok(created)
    }

    /// Number of hooks constructed over the registry lifetime.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    /// Unhook and drop the live hook. A later detection may register another
    /// one if a probe still offers it; the DirectX 12 probe does not, since
    /// its hook is unloaded for the rest of the process.
    pub fn unload(&self) {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            debug!("Unloading {} render hook", hook.library_name());
            hook.unhook();
        }
    }
}

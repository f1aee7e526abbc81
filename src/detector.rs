//! Renderer detection.
//!
//! A [`RendererDetector`] probes candidate backends on a background thread
//! until one of them yields a [`RendererHook`] or the timeout expires. The
//! hook lands in the [`OverlayRegistry`], so every concurrent request
//! resolves to the same instance.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use overlay_hook::detector::RendererDetector;
//! use overlay_hook::registry::OverlayRegistry;
//! use overlay_hook::OverlayConfig;
//!
//! let registry = Arc::new(OverlayRegistry::new());
//! let detector = RendererDetector::new(registry, Vec::new(), OverlayConfig::default());
//! let hook = detector.detect(Duration::from_secs(5)).wait();
//! assert!(hook.is_none());
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::OverlayConfig;
use crate::hooks::RendererHook;
use crate::registry::OverlayRegistry;

/// Outcome of a detection request: the live hook, or `None` on timeout,
/// cancellation or when nothing was found.
pub type Detection = Option<Arc<dyn RendererHook>>;

/// A candidate backend.
pub trait RendererProbe: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &str;

    /// Construct the hook if the backend is active in the process.
    ///
    /// `Ok(None)` means the backend is not there (yet). Errors are logged and
    /// treated the same way.
    fn probe(&self) -> anyhow::Result<Option<Arc<dyn RendererHook>>>;
}

/// Future resolving to a [`Detection`]. Clones resolve to the same value.
#[derive(Clone)]
#[must_use = "detection results are only observable through the future"]
pub struct DetectionFuture {
    inner: Shared<oneshot::Receiver<Detection>>,
}

impl DetectionFuture {
    fn new(receiver: oneshot::Receiver<Detection>) -> Self {
        Self { inner: receiver.shared() }
    }

    fn ready(detection: Detection) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(detection);
        Self::new(receiver)
    }

    /// Block the current thread until the detection resolves.
    pub fn wait(self) -> Detection {
        futures::executor::block_on(self)
    }
}

impl Future for DetectionFuture {
    type Output = Detection;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the worker went away: no hook.
        Pin::new(&mut self.inner).poll(cx).map(|result| result.unwrap_or(None))
    }
}

struct DetectorInner {
    registry: Arc<OverlayRegistry>,
    probes: Mutex<Vec<Box<dyn RendererProbe>>>,
    generation: Mutex<u64>,
    wakeup: Condvar,
    freed: AtomicBool,
    poll_interval: Duration,
}

/// Asynchronous, cancellable backend detection.
pub struct RendererDetector {
    inner: Arc<DetectorInner>,
    default_timeout: Duration,
}

impl RendererDetector {
    /// Create a detector trying `probes` in order.
    pub fn new(
        registry: Arc<OverlayRegistry>,
        probes: Vec<Box<dyn RendererProbe>>,
        config: OverlayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                registry,
                probes: Mutex::new(probes),
                generation: Mutex::new(0),
                wakeup: Condvar::new(),
                freed: AtomicBool::new(false),
                poll_interval: config.detection_poll_interval,
            }),
            default_timeout: config.detection_timeout,
        }
    }

    /// Detect with the configured timeout.
    pub fn detect_default(&self) -> DetectionFuture {
        self.detect(self.default_timeout)
    }

    /// Start a detection request.
    ///
    /// Resolves immediately when a hook is already registered or the detector
    /// was freed. Otherwise a worker thread probes until a hook is found, the
    /// timeout expires or [`RendererDetector::stop`] is called.
    pub fn detect(&self, timeout: Duration) -> DetectionFuture {
        if let Some(hook) = self.inner.registry.get() {
            return DetectionFuture::ready(Some(hook));
        }
        if self.inner.freed.load(Ordering::SeqCst) {
            debug!("Detector freed, nothing to detect");
            return DetectionFuture::ready(None);
        }

        let generation = *self.inner.generation.lock();
        let (sender, receiver) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        let spawned = thread::Builder::new().name("overlay-detector".into()).spawn(move || {
            let detection = inner.run(generation, timeout);
            let _ = sender.send(detection);
        });
        if let Err(e) = spawned {
            error!("Couldn't spawn detection thread: {e}");
        }

        DetectionFuture::new(receiver)
    }

    /// Cancel every detection in flight. They resolve to `None` promptly.
    pub fn stop(&self) {
        let mut generation = self.inner.generation.lock();
        *generation += 1;
        self.inner.wakeup.notify_all();
        debug!("Renderer detection stopped");
    }

    /// Cancel detections in flight and drop the probes. Later requests only
    /// return an already registered hook.
    pub fn free(&self) {
        self.inner.freed.store(true, Ordering::SeqCst);
        self.stop();
        self.inner.probes.lock().clear();
        debug!("Renderer detector freed");
    }
}

impl DetectorInner {
    fn run(&self, generation: u64, timeout: Duration) -> Detection {
        // Too far out to represent: no deadline.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            // `free` may have run after `detect` checked for it.
            if self.freed.load(Ordering::SeqCst) {
                debug!("Detector freed during detection");
                return self.registry.get();
            }
            if self.cancelled(generation) {
                debug!("Detection cancelled");
                return None;
            }

            match self.probe_once() {
                Ok(Some(hook)) => return Some(hook),
                Ok(None) => {},
                Err(e) => warn!("Detection round failed: {e:?}"),
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        info!("No renderer detected within {timeout:?}");
                        return None;
                    }
                    self.poll_interval.min(deadline - now)
                },
                None => self.poll_interval,
            };

            let mut current = self.generation.lock();
            if *current != generation {
                debug!("Detection cancelled");
                return None;
            }
            let _ = self.wakeup.wait_for(&mut current, wait);
        }
    }

    fn probe_once(&self) -> anyhow::Result<Detection> {
        self.registry.get_or_try_init(|| {
            let probes = self.probes.lock();
            for probe in probes.iter() {
                match probe.probe() {
                    Ok(Some(hook)) => {
                        info!("Detected {} renderer", probe.name());
                        return Ok(Some(hook));
                    },
                    Ok(None) => trace!("{} renderer not found", probe.name()),
                    Err(e) => warn!("Probing {} failed: {e:?}", probe.name()),
                }
            }
            Ok(None)
        })
    }

    fn cancelled(&self, generation: u64) -> bool {
        *self.generation.lock() != generation
    }
}

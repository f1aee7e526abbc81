use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use overlay_hook::detector::{RendererDetector, RendererProbe};
use overlay_hook::hooks::RendererHook;
use overlay_hook::input::{ToggleCallback, ToggleKey};
use overlay_hook::registry::OverlayRegistry;
use overlay_hook::{ImageResource, OverlayConfig, OverlayRenderLoop};

#[derive(Default)]
struct StubHook;

impl RendererHook for StubHook {
    fn start_hook(&self, _toggle: ToggleCallback, _keys: &[ToggleKey]) -> bool {
        true
    }

    fn is_started(&self) -> bool {
        false
    }

    fn library_name(&self) -> &str {
        "stub.dll"
    }

    fn set_render_loop(&self, _render_loop: Box<dyn OverlayRenderLoop>) {}

    fn create_image_resource(&self, _data: &[u8], _width: u32, _height: u32) -> Weak<ImageResource> {
        Weak::new()
    }

    fn release_image_resource(&self, _image: Weak<ImageResource>) {}

    fn hide_app_inputs(&self, _hide: bool) {}

    fn hide_overlay_inputs(&self, _hide: bool) {}

    fn unhook(&self) {}
}

/// Probe that finds its backend once `available` is set.
struct StubProbe {
    available: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
    constructed: Arc<AtomicUsize>,
    fail: bool,
}

impl StubProbe {
    fn new(available: bool) -> (Self, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let available = Arc::new(AtomicBool::new(available));
        let constructed = Arc::new(AtomicUsize::new(0));
        let probe = Self {
            available: Arc::clone(&available),
            probes: Arc::default(),
            constructed: Arc::clone(&constructed),
            fail: false,
        };
        (probe, available, constructed)
    }
}

impl RendererProbe for StubProbe {
    fn name(&self) -> &str {
        "stub"
    }

    fn probe(&self) -> anyhow::Result<Option<Arc<dyn RendererHook>>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("probe exploded");
        }
        if !self.available.load(Ordering::SeqCst) {
            return Ok(None);
        }
        // Widen the race window between concurrent requests.
        thread::sleep(Duration::from_millis(20));
        self.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Arc::new(StubHook::default())))
    }
}

fn config() -> OverlayConfig {
    OverlayConfig::default().with_detection_poll_interval(Duration::from_millis(5))
}

fn detector(probes: Vec<Box<dyn RendererProbe>>) -> (RendererDetector, Arc<OverlayRegistry>) {
    let registry = Arc::new(OverlayRegistry::new());
    (RendererDetector::new(Arc::clone(&registry), probes, config()), registry)
}

#[test]
fn concurrent_requests_share_one_hook() {
    let (probe, _, constructed) = StubProbe::new(true);
    let (detector, registry) = detector(vec![Box::new(probe)]);

    let futures: Vec<_> = (0..8).map(|_| detector.detect(Duration::from_secs(5))).collect();
    let hooks: Vec<_> = futures.into_iter().map(|f| f.wait().expect("hook detected")).collect();

    assert_eq!(constructed.load(Ordering::SeqCst), 1);
    assert_eq!(registry.constructed(), 1);
    for hook in &hooks[1..] {
        assert!(Arc::ptr_eq(&hooks[0], hook));
    }
}

#[test]
fn clones_of_a_request_resolve_to_the_same_hook() {
    let (probe, _, _) = StubProbe::new(true);
    let (detector, _) = detector(vec![Box::new(probe)]);

    let first = detector.detect(Duration::from_secs(5));
    let second = first.clone();

    let a = first.wait().expect("hook detected");
    let b = second.wait().expect("hook detected");
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn backend_appearing_later_is_picked_up() {
    let (probe, available, _) = StubProbe::new(false);
    let (detector, _) = detector(vec![Box::new(probe)]);

    let pending = detector.detect(Duration::from_secs(5));
    thread::sleep(Duration::from_millis(30));
    available.store(true, Ordering::SeqCst);

    let hook = pending.wait().expect("hook detected");
    assert_eq!(hook.library_name(), "stub.dll");
}

#[test]
fn timeout_resolves_to_none_and_later_requests_still_work() {
    let (probe, available, _) = StubProbe::new(false);
    let (detector, registry) = detector(vec![Box::new(probe)]);

    assert!(detector.detect(Duration::from_millis(30)).wait().is_none());
    assert!(registry.get().is_none());

    available.store(true, Ordering::SeqCst);
    assert!(detector.detect(Duration::from_secs(5)).wait().is_some());
}

#[test]
fn unbounded_timeout_keeps_probing() {
    let (probe, available, _) = StubProbe::new(false);
    let (detector, _) = detector(vec![Box::new(probe)]);

    let pending = detector.detect(Duration::MAX);
    thread::sleep(Duration::from_millis(30));
    available.store(true, Ordering::SeqCst);

    assert!(pending.wait().is_some());
}

#[test]
fn stop_cancels_an_unbounded_request() {
    let (probe, _, _) = StubProbe::new(false);
    let (detector, _) = detector(vec![Box::new(probe)]);

    let pending = detector.detect(Duration::MAX);
    thread::sleep(Duration::from_millis(20));
    detector.stop();

    assert!(pending.wait().is_none());
}

#[test]
fn stop_cancels_requests_in_flight() {
    let (probe, _, _) = StubProbe::new(false);
    let (detector, _) = detector(vec![Box::new(probe)]);

    let pending: Vec<_> = (0..3).map(|_| detector.detect(Duration::from_secs(60))).collect();
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    detector.stop();
    for request in pending {
        assert!(request.wait().is_none());
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn registered_hook_resolves_immediately() {
    let (probe, _, constructed) = StubProbe::new(false);
    let (detector, registry) = detector(vec![Box::new(probe)]);
    let existing: Arc<dyn RendererHook> = Arc::new(StubHook::default());
    registry
        .get_or_try_init(|| Ok(Some(Arc::clone(&existing))))
        .expect("registration succeeds");

    let hook = detector.detect(Duration::from_millis(1)).wait().expect("registered hook");

    assert!(Arc::ptr_eq(&hook, &existing));
    assert_eq!(constructed.load(Ordering::SeqCst), 0);
}

#[test]
fn freed_detector_only_returns_a_registered_hook() {
    let (probe, _, constructed) = StubProbe::new(true);
    let (detector, registry) = detector(vec![Box::new(probe)]);

    detector.free();
    assert!(detector.detect(Duration::from_secs(5)).wait().is_none());
    assert_eq!(constructed.load(Ordering::SeqCst), 0);

    let existing: Arc<dyn RendererHook> = Arc::new(StubHook::default());
    registry
        .get_or_try_init(|| Ok(Some(Arc::clone(&existing))))
        .expect("registration succeeds");
    assert!(detector.detect(Duration::from_secs(5)).wait().is_some());
}

#[test]
fn failing_probe_does_not_stop_the_others() {
    let probes = Arc::new(AtomicUsize::new(0));
    let failing = StubProbe {
        available: Arc::new(AtomicBool::new(true)),
        probes: Arc::clone(&probes),
        constructed: Arc::default(),
        fail: true,
    };
    let (working, _, constructed) = StubProbe::new(true);
    let (detector, _) = detector(vec![Box::new(failing), Box::new(working)]);

    assert!(detector.detect(Duration::from_secs(5)).wait().is_some());
    assert!(probes.load(Ordering::SeqCst) >= 1);
    assert_eq!(constructed.load(Ordering::SeqCst), 1);
}

#[test]
fn unload_unhooks_and_allows_a_new_hook() {
    let (probe, _, constructed) = StubProbe::new(true);
    let (detector, registry) = detector(vec![Box::new(probe)]);

    let first = detector.detect(Duration::from_secs(5)).wait().expect("hook detected");
    registry.unload();
    assert!(registry.get().is_none());

    let second = detector.detect(Duration::from_secs(5)).wait().expect("hook detected");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(constructed.load(Ordering::SeqCst), 2);
    assert_eq!(registry.constructed(), 2);
}

// SPDX-License-Identifier: GPL-3.0-only

//! Photo and HDR capture through the rig

use pano_rig::backends::camera::{
    CaptureOrchestrator, ChangeResolutionListener, ResolutionRequest, SimulatedDriver,
};
use pano_rig::config::{RigConfig, Timeouts};
use pano_rig::constants::ResolutionClass;
use pano_rig::errors::{ErrorCode, RigResult};
use pano_rig::pipelines::photo::hdr::{
    HdrCapturePipeline, HdrRequest, SoftwareStackingEngine, StackingEngine,
};
use pano_rig::pipelines::photo::{PhotoParams, TakePhotoListener};
use pano_rig::storage::HdrLayout;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

struct RecordingListener {
    starts: Mutex<Vec<usize>>,
    ends: AtomicUsize,
    done: Mutex<mpsc::Sender<RigResult<PathBuf>>>,
}

impl RecordingListener {
    fn new() -> (Arc<Self>, mpsc::Receiver<RigResult<PathBuf>>) {
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            ends: AtomicUsize::new(0),
            done: Mutex::new(tx),
        });
        (listener, rx)
    }
}

impl TakePhotoListener for RecordingListener {
    fn on_take_photo_start(&self, index: usize) {
        self.starts.lock().unwrap().push(index);
    }

    fn on_capture_photo_end(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }

    fn on_take_photo_complete(&self, result: RigResult<PathBuf>) {
        let _ = self.done.lock().unwrap().send(result);
    }
}

struct Fixture {
    driver: SimulatedDriver,
    rig: CaptureOrchestrator,
    dir: tempfile::TempDir,
}

fn config(dir: &Path) -> RigConfig {
    RigConfig {
        timeouts: Timeouts {
            capture_settle_ms: 10,
            capture_reopen_settle_ms: 10,
            update_preview_barrier_ms: 300,
            stack_file_ready_ms: 1000,
            ..Timeouts::uniform(2000)
        },
        output_dir: Some(dir.to_path_buf()),
        ..RigConfig::default()
    }
}

fn fixture_with(engine: Option<Arc<dyn StackingEngine>>, open: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let driver = SimulatedDriver::default();
    let mut rig = CaptureOrchestrator::new(Arc::new(driver.clone()), 2, config(dir.path()));
    if let Some(engine) = engine {
        rig = rig.with_stacking_engine(engine);
    }
    if open {
        let (tx, rx) = mpsc::channel();
        rig.change_resolution(
            ResolutionRequest::new("", 1920, 960, 30),
            ChangeResolutionListener::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv_timeout(WAIT).unwrap().unwrap();
    }
    Fixture { driver, rig, dir }
}

fn fixture() -> Fixture {
    fixture_with(None, true)
}

fn take(fixture: &Fixture, params: PhotoParams) -> (RigResult<PathBuf>, Arc<RecordingListener>) {
    let (listener, rx) = RecordingListener::new();
    let handle = fixture.rig.take_photo(params, listener.clone());
    let result = rx.recv_timeout(WAIT).expect("photo never completed");
    if let Some(handle) = handle {
        handle.join().unwrap();
    }
    (result, listener)
}

fn named_hdr(count: usize) -> PhotoParams {
    PhotoParams {
        basename: Some("pano".into()),
        ..PhotoParams::hdr(count)
    }
}

fn wait_for_panorama(rig: &CaptureOrchestrator) -> bool {
    let deadline = Instant::now() + WAIT;
    while !rig.is_panorama_enabled() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

#[test]
fn test_burst_hdr_writes_stacked_output() {
    let fixture = fixture();
    let (result, listener) = take(&fixture, named_hdr(3));

    let output = result.unwrap();
    assert_eq!(output, fixture.dir.path().join("pano_unstitch_hdr.jpg"));
    assert!(output.is_file());
    assert!(image::open(&output).is_ok());
    assert!(!fixture.dir.path().join(".pano_unstitch.hdr").exists());
    assert!(!fixture.dir.path().join("pano_unstitch.hdr").exists());

    // a burst reports a single start and a single end
    assert_eq!(*listener.starts.lock().unwrap(), vec![0]);
    assert_eq!(listener.ends.load(Ordering::SeqCst), 1);
    assert!(wait_for_panorama(&fixture.rig));
    fixture.rig.release().unwrap();
}

#[test]
fn test_hdr_keeps_sources_when_asked() {
    let fixture = fixture();
    let params = PhotoParams {
        keep_hdr_sources: Some(true),
        ..named_hdr(3)
    };
    take(&fixture, params).0.unwrap();

    let kept = fixture.dir.path().join("pano_unstitch.hdr");
    for index in 0..3 {
        assert!(kept.join(format!("{}.jpg", index)).is_file(), "source {} missing", index);
    }
    assert!(!kept.join("pano.thumb.jpg").exists());
    fixture.rig.release().unwrap();
}

#[test]
fn test_hdr_keeps_disabled_panorama_disabled() {
    let fixture = fixture();
    let camera = Arc::clone(fixture.rig.pipeline(0).unwrap());
    let panorama = Arc::new(AtomicBool::new(false));
    let hdr = HdrCapturePipeline::new(
        Arc::clone(&camera),
        Arc::new(SoftwareStackingEngine::new()),
        fixture.rig.config().timeouts.clone(),
        Arc::clone(&panorama),
    );
    let request = HdrRequest {
        count: 3,
        layout: HdrLayout::new(fixture.dir.path(), "pano"),
        resolution: ResolutionClass::Standard,
        compensate: None,
        keep_sources: false,
        thumbnail: true,
        quality: 90,
        prefer_burst: true,
    };

    let (listener, _rx) = RecordingListener::new();
    hdr.run(&request, listener.as_ref()).unwrap();

    let deadline = Instant::now() + WAIT;
    while !camera.is_previewing() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(camera.is_previewing());
    std::thread::sleep(Duration::from_millis(200));
    assert!(!panorama.load(Ordering::SeqCst), "panorama was enabled by the HDR run");
    fixture.rig.release().unwrap();
}

#[test]
fn test_sequential_hdr_reports_each_exposure() {
    let fixture = fixture();
    fixture.driver.update_config(|c| c.ordered_burst = false);

    let (result, listener) = take(&fixture, named_hdr(3));
    result.unwrap();
    assert_eq!(*listener.starts.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(listener.ends.load(Ordering::SeqCst), 1);
    fixture.rig.release().unwrap();
}

#[test]
fn test_missing_frame_is_lost() {
    let fixture = fixture();
    fixture.driver.update_config(|c| c.drop_still_frame = Some(1));

    let err = take(&fixture, named_hdr(3)).0.unwrap_err();
    assert_eq!(err.code, ErrorCode::HdrPhotoLose);
    assert!(!fixture.dir.path().join(".pano_unstitch.hdr").exists());
    fixture.rig.release().unwrap();
}

#[test]
fn test_capture_failure_restores_preview() {
    let fixture = fixture();
    fixture.driver.update_config(|c| c.fail_still_index = Some(1));

    let err = take(&fixture, named_hdr(3)).0.unwrap_err();
    assert_eq!(err.code, ErrorCode::TakePhotoCaptureFailed);
    assert!(wait_for_panorama(&fixture.rig));
    assert!(!fixture.dir.path().join(".pano_unstitch.hdr").exists());
    assert!(!fixture.dir.path().join("pano_unstitch_hdr.jpg").exists());
    fixture.rig.release().unwrap();
}

#[test]
fn test_invalid_bracket_size_rejected() {
    let fixture = fixture();
    let err = take(&fixture, named_hdr(4)).0.unwrap_err();
    assert_eq!(err.code, ErrorCode::Unknown);
    assert!(err.message.contains("unsupported HDR count"));
    assert!(fixture.rig.is_panorama_enabled());
    fixture.rig.release().unwrap();
}

#[test]
fn test_hdr_without_preview_fails() {
    let fixture = fixture_with(None, false);
    let err = take(&fixture, named_hdr(3)).0.unwrap_err();
    assert_eq!(err.code, ErrorCode::CameraNotOpened);
    fixture.rig.release().unwrap();
}

#[test]
fn test_released_rig_rejects_photo() {
    let fixture = fixture();
    fixture.rig.release().unwrap();

    let (listener, rx) = RecordingListener::new();
    assert!(fixture.rig.take_photo(named_hdr(3), listener).is_none());
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyReleased);
}

struct FailingEngine {
    inner: SoftwareStackingEngine,
}

impl StackingEngine for FailingEngine {
    fn add_image(&self, data: &[u8], width: u32, height: u32, stride: u32) -> i32 {
        self.inner.add_image(data, width, height, stride)
    }

    fn calculate(&self, _: &Path, _: &Path, _: u32, _: u32, _: u32) -> i32 {
        -17
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn inject_thumbnail(&self, _: &Path, _: &Path) -> i32 {
        0
    }
}

#[test]
fn test_engine_status_surfaces_verbatim() {
    let engine = Arc::new(FailingEngine {
        inner: SoftwareStackingEngine::new(),
    });
    let fixture = fixture_with(Some(engine), true);

    let err = take(&fixture, named_hdr(3)).0.unwrap_err();
    assert_eq!(err.code, ErrorCode::Engine(-17));
    assert_eq!(err.code(), -17);
    fixture.rig.release().unwrap();
}

#[test]
fn test_single_photo_uses_basename() {
    let fixture = fixture();
    let params = PhotoParams {
        basename: Some("single".into()),
        ..PhotoParams::single()
    };
    let (result, listener) = take(&fixture, params);

    let path = result.unwrap();
    assert_eq!(path, fixture.dir.path().join("single.jpg"));
    assert!(image::open(&path).is_ok());
    assert_eq!(listener.ends.load(Ordering::SeqCst), 1);
    fixture.rig.release().unwrap();
}

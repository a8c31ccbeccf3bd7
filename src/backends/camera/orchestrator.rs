// SPDX-License-Identifier: GPL-3.0-only

//! Rig-level capture control
//!
//! [`CaptureOrchestrator`] owns the ordered pipeline array and the rig-wide
//! capture state: the in-capture marker, its generation counter, the
//! panorama-enabled flag and the cooperative stop-capture tag.
//!
//! Methods that touch every camera go through the [`SyncCoordinator`], so
//! camera 0 is always dispatched last. Several of them block the caller
//! (settle delay, preview barrier, stop-record wait); call them from a
//! blocking context.

use super::callback::{Callback, ChangeResolutionListener, CommonCallback};
use super::lock;
use super::pipeline::CameraPipeline;
use super::sync::SyncCoordinator;
use super::types::{CameraBehavior, CameraEnvParams, CaptureMode, CaptureSize, OutputTarget, ProParams};
use super::CameraDriver;
use crate::config::RigConfig;
use crate::constants::{self, get_resolution_class};
use crate::errors::{ErrorCode, RigError, RigResult};
use crate::pipelines::photo::hdr::{HdrCapturePipeline, HdrRequest, SoftwareStackingEngine, StackingEngine};
use crate::pipelines::photo::{self, Destination, ImageConsumer, PhotoParams, TakePhotoListener};
use crate::storage::{self, HdrLayout};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requested preview configuration for the whole rig
#[derive(Debug, Clone, Default)]
pub struct ResolutionRequest {
    /// Empty or `ASYNC_DOUBLE` maps every pipeline to its own index
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub capture_mode: CaptureMode,
    /// `None` reuses the last pro params
    pub pro_params: Option<ProParams>,
    pub force_change: bool,
}

impl ResolutionRequest {
    pub fn new(camera_id: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            camera_id: camera_id.into(),
            width,
            height,
            fps,
            ..Default::default()
        }
    }

    fn camera_id_for(&self, index: usize) -> String {
        if self.camera_id.is_empty() || self.camera_id == constants::ASYNC_DOUBLE_CAMERA_ID {
            index.to_string()
        } else {
            self.camera_id.clone()
        }
    }
}

#[derive(Debug, Clone)]
enum CaptureMarker {
    Idle,
    Starting { generation: u64 },
    Capturing { generation: u64, target: OutputTarget },
}

struct RigState {
    marker: Mutex<CaptureMarker>,
    capture_end: Condvar,
    generation: AtomicU64,
    panorama_enabled: Arc<AtomicBool>,
    stop_capture_tag: AtomicBool,
    /// Whether the latest stop asked for the preview to come back
    restart_after_stop: AtomicBool,
}

impl RigState {
    fn new() -> Self {
        Self {
            marker: Mutex::new(CaptureMarker::Idle),
            capture_end: Condvar::new(),
            generation: AtomicU64::new(0),
            panorama_enabled: Arc::new(AtomicBool::new(true)),
            stop_capture_tag: AtomicBool::new(false),
            restart_after_stop: AtomicBool::new(true),
        }
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn begin_capture(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.marker) = CaptureMarker::Starting { generation };
        generation
    }

    /// Record the marker only if no stop happened since `generation` began
    fn mark_capturing(&self, generation: u64, target: OutputTarget) -> bool {
        let mut marker = lock(&self.marker);
        if self.current() != generation {
            debug!(generation, current = self.current(), "Ignoring stale capture start");
            return false;
        }
        *marker = CaptureMarker::Capturing { generation, target };
        true
    }

    fn abandon(&self, generation: u64) {
        let mut marker = lock(&self.marker);
        if matches!(*marker, CaptureMarker::Starting { generation: g } if g == generation) {
            *marker = CaptureMarker::Idle;
        }
    }

    fn end_capture(&self) {
        let mut marker = lock(&self.marker);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *marker = CaptureMarker::Idle;
        self.capture_end.notify_all();
    }

    fn is_capturing(&self, marker: &CaptureMarker) -> bool {
        matches!(marker, CaptureMarker::Capturing { generation, .. } if *generation == self.current())
    }

    /// Wait until no capture is recorded; false on timeout
    fn wait_capture_end(&self, timeout: Duration) -> bool {
        let marker = lock(&self.marker);
        let (_marker, result) = self
            .capture_end
            .wait_timeout_while(marker, timeout, |m| self.is_capturing(m))
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !result.timed_out()
    }
}

/// Controller for a rig of synchronized cameras
pub struct CaptureOrchestrator {
    coordinator: SyncCoordinator,
    config: RigConfig,
    state: Arc<RigState>,
    pro_params: Mutex<Option<ProParams>>,
    engine: Arc<dyn StackingEngine>,
    released: AtomicBool,
}

impl CaptureOrchestrator {
    /// Build a rig of `camera_count` pipelines sharing `driver`
    pub fn new(driver: Arc<dyn CameraDriver>, camera_count: usize, config: RigConfig) -> Self {
        let pipelines = (0..camera_count)
            .map(|index| {
                Arc::new(CameraPipeline::new(
                    index,
                    Arc::clone(&driver),
                    config.timeouts.camera_release(),
                ))
            })
            .collect();
        let coordinator = SyncCoordinator::new(pipelines, config.timeouts.update_preview_barrier());
        info!(camera_count, "Capture orchestrator created");

        Self {
            coordinator,
            config,
            state: Arc::new(RigState::new()),
            pro_params: Mutex::new(None),
            engine: Arc::new(SoftwareStackingEngine::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Replace the HDR stacking engine
    pub fn with_stacking_engine(mut self, engine: Arc<dyn StackingEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn pipelines(&self) -> &[Arc<CameraPipeline>] {
        self.coordinator.pipelines()
    }

    pub fn pipeline(&self, index: usize) -> Option<&Arc<CameraPipeline>> {
        self.coordinator.pipelines().get(index)
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Move every pipeline to the requested preview configuration
    ///
    /// The listener receives camera 0's behavior once every camera has
    /// delivered its first frame in the new configuration.
    pub fn change_resolution(&self, request: ResolutionRequest, listener: ChangeResolutionListener) {
        if self.is_released() {
            listener.complete(Err(ErrorCode::AlreadyReleased.into()));
            return;
        }

        let pro_params = {
            let mut cached = lock(&self.pro_params);
            if let Some(params) = &request.pro_params {
                *cached = Some(params.clone());
            }
            cached.clone()
        };

        let force_switch = self.config.force_switch_on_resolution_change;
        let plans: Vec<(CameraEnvParams, CameraBehavior)> = self
            .pipelines()
            .iter()
            .map(|pipeline| {
                let env = CameraEnvParams {
                    lock_default_preview_fps: self.config.lock_default_preview_fps,
                    ..CameraEnvParams::new(
                        request.camera_id_for(pipeline.index()),
                        request.width,
                        request.height,
                        request.fps,
                    )
                    .with_capture_mode(request.capture_mode)
                };
                let mut behavior = pipeline.resolve_behavior(&env, request.force_change);
                if force_switch && behavior != CameraBehavior::Open {
                    behavior = CameraBehavior::Switch;
                }
                if let Some(params) = &pro_params {
                    pipeline.stage_pro_params(params.clone());
                }
                (env, behavior)
            })
            .collect();

        let primary = plans
            .first()
            .map(|(_, behavior)| *behavior)
            .unwrap_or(CameraBehavior::UpdatePreview);
        info!(
            width = request.width,
            height = request.height,
            fps = request.fps,
            behavior = %primary,
            "Changing rig resolution"
        );
        let done = Callback::new(move |result: RigResult<()>| {
            if let Err(err) = &result {
                warn!(error = %err, "Resolution change failed");
            }
            listener.complete(result.map(|()| primary));
        });

        if plans.iter().all(|(_, behavior)| *behavior == CameraBehavior::UpdatePreview) {
            self.coordinator.update_preview(done, 0);
            return;
        }

        self.coordinator.dispatch_then_update(done, 0, |pipeline, callback| {
            let (env, behavior) = &plans[pipeline.index()];
            match behavior {
                CameraBehavior::Switch => {
                    pipeline.close_device();
                    pipeline.open(env.camera_id.clone(), Some(callback));
                }
                CameraBehavior::Open => pipeline.open(env.camera_id.clone(), Some(callback)),
                CameraBehavior::StartPreview => pipeline.start_preview(Some(callback), false),
                CameraBehavior::UpdatePreview => callback.success(),
            }
        });
    }

    /// Rebuild every preview session, then pass the preview barrier
    pub fn start_preview(&self, callback: Callback) {
        if self.is_released() {
            callback.error(ErrorCode::AlreadyReleased.into());
            return;
        }
        self.coordinator
            .dispatch_then_update(callback, 0, |pipeline, callback| {
                pipeline.start_preview(Some(callback), false)
            });
    }

    /// Apply pro params on every camera
    pub fn set_pro_params(&self, params: ProParams, callback: Callback) {
        if self.is_released() {
            callback.error(ErrorCode::AlreadyReleased.into());
            return;
        }
        {
            let mut cached = lock(&self.pro_params);
            match cached.as_mut() {
                Some(current) => {
                    current.merge(&params);
                }
                None => *cached = Some(params.clone()),
            }
        }
        self.coordinator.dispatch(callback, |pipeline, callback| {
            pipeline.set_pro_params(params.clone(), Some(callback), 0)
        });
    }

    /// Last pro params requested for the rig
    pub fn pro_params(&self) -> Option<ProParams> {
        lock(&self.pro_params).clone()
    }

    /// Subscribe to errors that arrive outside any request
    pub fn set_common_callback(&self, common: Option<CommonCallback>) {
        for pipeline in self.pipelines() {
            pipeline.set_common_callback(common.clone());
        }
    }

    /// Start streaming into `targets`, one per camera in index order
    ///
    /// Blocks for the settle delay. Returns false when nothing was
    /// dispatched; `callback` has then already received the error.
    pub fn start_capture(
        &self,
        targets: &[OutputTarget],
        preview_enabled: bool,
        callback: Callback,
        override_size: Option<CaptureSize>,
    ) -> bool {
        if let Err(err) = self.check_targets(targets) {
            callback.error(err);
            return false;
        }

        self.state.panorama_enabled.store(false, Ordering::Release);
        let generation = self.state.begin_capture();
        let exclusive = override_size.is_some_and(|size| size.exclusive);
        info!(generation, exclusive, preview_enabled, "Starting capture");

        // both streams must be down before the capture session is built
        for pipeline in self.pipelines() {
            if exclusive {
                pipeline.close_device();
            } else {
                pipeline.stop_preview();
            }
        }
        if !exclusive {
            thread::sleep(self.config.timeouts.capture_settle());
        }

        if self.state.stop_capture_tag.swap(false, Ordering::AcqRel) {
            warn!(generation, "Capture stopped before it started");
            self.state.abandon(generation);
            callback.error(RigError::new(
                ErrorCode::Unknown,
                "capture already stopped after start was requested",
            ));
            return false;
        }
        if self.state.current() != generation {
            warn!(generation, current = self.state.current(), "Capture stopped during settle delay");
            self.state.abandon(generation);
            callback.error(RigError::new(
                ErrorCode::Unknown,
                "capture stopped while it was starting",
            ));
            return false;
        }

        self.dispatch_capture(targets, preview_enabled, callback, override_size, generation, exclusive);
        true
    }

    /// Release every camera and reopen straight into capture sessions
    pub fn reopen_in_capture(
        &self,
        targets: &[OutputTarget],
        preview_enabled: bool,
        callback: Callback,
        override_size: Option<CaptureSize>,
    ) {
        if let Err(err) = self.check_targets(targets) {
            callback.error(err);
            return;
        }

        self.state.panorama_enabled.store(false, Ordering::Release);
        let generation = self.state.begin_capture();
        info!(generation, "Reopening cameras in capture");
        for pipeline in self.pipelines() {
            pipeline.close_device();
        }
        thread::sleep(self.config.timeouts.capture_reopen_settle());
        self.dispatch_capture(targets, preview_enabled, callback, override_size, generation, true);
    }

    fn check_targets(&self, targets: &[OutputTarget]) -> RigResult<()> {
        if self.is_released() {
            return Err(ErrorCode::AlreadyReleased.into());
        }
        if targets.len() != self.coordinator.len() {
            return Err(RigError::new(
                ErrorCode::RecordCameraOutSurfaceIllegal,
                format!("{} targets for {} cameras", targets.len(), self.coordinator.len()),
            ));
        }
        if let Some(target) = targets.iter().find(|target| !target.is_alive()) {
            return Err(RigError::new(
                ErrorCode::RecordCameraOutSurfaceIllegal,
                format!("target {} is destroyed", target.name()),
            ));
        }
        Ok(())
    }

    fn dispatch_capture(
        &self,
        targets: &[OutputTarget],
        preview_enabled: bool,
        callback: Callback,
        override_size: Option<CaptureSize>,
        generation: u64,
        reopen: bool,
    ) {
        let state = Arc::clone(&self.state);
        let pipelines = self.pipelines().to_vec();
        let primary = targets[0].clone();
        let done = Callback::new(move |result| match result {
            Ok(()) => {
                if state.mark_capturing(generation, primary) {
                    state.panorama_enabled.store(preview_enabled, Ordering::Release);
                    info!(generation, "Capture started");
                    callback.success();
                    return;
                }
                // a stop landed while the sessions were being built
                warn!(generation, "Capture started after a stop, tearing it down");
                let restart = state.restart_after_stop.load(Ordering::Acquire);
                for pipeline in &pipelines {
                    pipeline.stop_capture(restart, None);
                }
                callback.error(RigError::new(
                    ErrorCode::Unknown,
                    "capture stopped while it was starting",
                ));
            }
            Err(err) => {
                error!(generation, error = %err, "Capture start failed");
                state.abandon(generation);
                callback.error(err);
            }
        });

        self.coordinator.dispatch(done, |pipeline, callback| {
            let target = targets[pipeline.index()].clone();
            if reopen {
                pipeline.reopen_capture(target, Some(callback), override_size);
            } else {
                pipeline.start_capture(target, Some(callback), override_size);
            }
        });
    }

    /// Tear down capture sessions, optionally restarting the preview
    ///
    /// With `sync` and `restart_preview` the call waits for the restarted
    /// preview, up to the stop-record timeout.
    pub fn stop_capture(&self, sync: bool, restart_preview: bool) -> RigResult<()> {
        info!(sync, restart_preview, "Stopping capture");
        self.state
            .restart_after_stop
            .store(restart_preview, Ordering::Release);
        let result = if restart_preview && sync {
            let (callback, rx) = Callback::sync_channel();
            self.coordinator.dispatch_then_update(callback, 0, |pipeline, callback| {
                pipeline.stop_capture(false, None);
                pipeline.start_preview(Some(callback), false);
            });
            let timeout = self.config.timeouts.stop_record();
            rx.recv_timeout(timeout).unwrap_or_else(|_| {
                Err(RigError::new(
                    ErrorCode::TimeOut,
                    format!("preview not restarted within {} ms", timeout.as_millis()),
                ))
            })
        } else {
            for pipeline in self.pipelines() {
                pipeline.stop_capture(restart_preview, None);
            }
            Ok(())
        };

        self.state.end_capture();
        self.state.panorama_enabled.store(true, Ordering::Release);
        if let Err(err) = &result {
            warn!(error = %err, "Stop capture finished with error");
        }
        result
    }

    /// Cancel a pending [`start_capture`](Self::start_capture) during its settle delay
    pub fn stop_capture_tag(&self, enable: bool) {
        self.state.stop_capture_tag.store(enable, Ordering::Release);
        debug!(enable, "Stop capture tag set");
    }

    pub fn is_in_capture(&self) -> bool {
        let marker = lock(&self.state.marker);
        self.state.is_capturing(&marker)
    }

    /// Camera 0's output target while a capture is running
    pub fn capture_target(&self) -> Option<OutputTarget> {
        match &*lock(&self.state.marker) {
            CaptureMarker::Capturing { generation, target } if *generation == self.state.current() => {
                Some(target.clone())
            }
            _ => None,
        }
    }

    /// Wait until the running capture stops; false on timeout
    pub fn wait_capture_end(&self, timeout: Duration) -> bool {
        self.state.wait_capture_end(timeout)
    }

    /// True when every camera delivers preview frames
    pub fn is_camera_previewing(&self) -> bool {
        !self.pipelines().is_empty() && self.pipelines().iter().all(|p| p.is_previewing())
    }

    pub fn is_panorama_enabled(&self) -> bool {
        self.state.panorama_enabled.load(Ordering::Acquire)
    }

    /// Capture generation, bumped by every start and stop
    pub fn generation(&self) -> u64 {
        self.state.current()
    }

    /// Take a photo on camera 0 from a worker thread
    ///
    /// The outcome always reaches `listener.on_take_photo_complete`.
    pub fn take_photo(
        &self,
        params: PhotoParams,
        listener: Arc<dyn TakePhotoListener>,
    ) -> Option<thread::JoinHandle<()>> {
        let camera = match self.pipelines().first() {
            Some(camera) if !self.is_released() => Arc::clone(camera),
            _ => {
                error!("Take photo on a released rig");
                listener.on_take_photo_complete(Err(ErrorCode::AlreadyReleased.into()));
                return None;
            }
        };

        let config = self.config.clone();
        let engine = Arc::clone(&self.engine);
        let panorama = Arc::clone(&self.state.panorama_enabled);
        let worker_listener = Arc::clone(&listener);

        let spawned = thread::Builder::new()
            .name("take-photo".into())
            .spawn(move || {
                let dir = params.output_dir.clone().unwrap_or_else(|| config.photo_dir());
                let result = match params.hdr_count {
                    Some(count) => {
                        let request = hdr_request(&camera, &params, &config, dir, count);
                        HdrCapturePipeline::new(camera, engine, config.timeouts.clone(), panorama)
                            .run(&request, worker_listener.as_ref())
                    }
                    None => {
                        let destination = match &params.basename {
                            Some(name) => {
                                Destination::Path(dir.join(format!("{}.{}", name, params.format.extension())))
                            }
                            None => Destination::Timestamped(dir),
                        };
                        let consumer = ImageConsumer::new(params.format, destination)
                            .with_camera_name(format!("camera {}", camera.index()));
                        photo::capture_single(
                            &camera,
                            &consumer,
                            config.timeouts.still_frame(),
                            worker_listener.as_ref(),
                        )
                    }
                };
                worker_listener.on_take_photo_complete(result);
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to spawn photo worker");
                listener.on_take_photo_complete(Err(RigError::new(
                    ErrorCode::Unknown,
                    format!("failed to spawn photo worker: {}", e),
                )));
                None
            }
        }
    }

    /// Wait for a running capture to end, then release every camera
    ///
    /// Returns the first release error. A second call returns immediately.
    pub fn release(&self) -> RigResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!("Rig already released");
            return Ok(());
        }

        let timeout = self.config.timeouts.camera_release();
        if !self.state.wait_capture_end(timeout) {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Capture still running at release, forcing it closed"
            );
            self.state.end_capture();
        }

        let mut first_error = None;
        for pipeline in self.pipelines() {
            if let Err(err) = pipeline.release()
                && first_error.is_none()
            {
                first_error = Some(err);
            }
        }
        info!(failed = first_error.is_some(), "Rig released");
        first_error.map_or(Ok(()), Err)
    }
}

fn hdr_request(
    camera: &CameraPipeline,
    params: &PhotoParams,
    config: &RigConfig,
    dir: PathBuf,
    count: usize,
) -> HdrRequest {
    let basename = params
        .basename
        .clone()
        .unwrap_or_else(storage::timestamped_basename);
    HdrRequest {
        count,
        layout: HdrLayout::new(dir, basename),
        resolution: get_resolution_class(camera.status().still_size.0),
        compensate: params.compensate,
        keep_sources: params.keep_hdr_sources.unwrap_or(config.hdr.keep_sources),
        thumbnail: config.hdr.thumbnail,
        quality: config.hdr.quality,
        prefer_burst: config.hdr.prefer_burst,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_id_mapping() {
        let request = ResolutionRequest::new("", 1920, 960, 30);
        assert_eq!(request.camera_id_for(1), "1");
        let request = ResolutionRequest::new(constants::ASYNC_DOUBLE_CAMERA_ID, 1920, 960, 30);
        assert_eq!(request.camera_id_for(0), "0");
        let request = ResolutionRequest::new("2", 1920, 960, 30);
        assert_eq!(request.camera_id_for(1), "2");
    }

    #[test]
    fn test_stale_generation_not_recorded() {
        let state = RigState::new();
        let generation = state.begin_capture();
        state.end_capture();
        assert!(!state.mark_capturing(generation, OutputTarget::new("enc0")));
        assert!(!state.is_capturing(&lock(&state.marker)));
    }

    #[test]
    fn test_wait_capture_end_wakes_on_stop() {
        let state = Arc::new(RigState::new());
        let generation = state.begin_capture();
        assert!(state.mark_capturing(generation, OutputTarget::new("enc0")));
        assert!(!state.wait_capture_end(Duration::from_millis(10)));

        let stopper = Arc::clone(&state);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper.end_capture();
        });
        assert!(state.wait_capture_end(Duration::from_secs(2)));
        handle.join().unwrap();
    }
}

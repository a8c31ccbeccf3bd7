// SPDX-License-Identifier: GPL-3.0-only

//! Per-camera pipeline actor
//!
//! A [`CameraPipeline`] is the handle callers hold. Every operation is posted
//! as a message to the pipeline's [`SerialExecutor`], where a single
//! `PipelineCore` owns the device and session handles and handles both
//! caller operations and driver events in FIFO order.
//!
//! ```text
//! CLOSED ─open─▶ OPENING ─opened─▶ IDLE ─session+repeating─▶ PREVIEWING
//!                                                            │    ▲
//!                                              start_capture │    │ stop_capture
//!                                                            ▼    │
//!                                                          CAPTURING
//! any ─release─▶ RELEASING ─▶ CLOSED
//! ```

use super::behavior;
use super::callback::{Callback, CallbackRegistry, CommonCallback, OpKind, Ticket};
use super::capture_failure::CaptureFailureMonitor;
use super::executor::{LoopAction, SerialExecutor};
use super::sync::Latch;
use super::types::*;
use super::{CameraDevice, CameraDriver, CaptureSession, DriverEvent, EventSink, lock};
use crate::constants::{self, still};
use crate::errors::{DriverError, ErrorCode, RigError, RigResult};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot of what a pipeline knows about its camera
#[derive(Debug, Clone, Default)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub device_open: bool,
    pub previewing: bool,
    /// Exposure reported by the latest repeating frame
    pub metered_exposure_ns: Option<u64>,
    pub metered_iso: Option<u32>,
    pub last_timestamp_ns: Option<u64>,
    pub exposure_range: Option<ExposureRange>,
    pub ordered_burst: bool,
    pub still_size: (u32, u32),
}

/// One still exposure; `None` uses auto-exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StillSpec {
    pub index: usize,
    pub exposure_ns: Option<u64>,
}

/// Still capture progress forwarded to the requester
#[derive(Debug)]
pub enum StillEvent {
    Completed(CaptureResult),
    Failed { index: usize, reason: String },
    SequenceCompleted,
    Aborted,
    /// The request could not be submitted at all
    Rejected(RigError),
}

/// Where still events and frames of a request go
#[derive(Clone)]
pub struct StillSink {
    pub events: Sender<StillEvent>,
    pub frames: Sender<FrameBuffer>,
}

enum Command {
    Open {
        camera_id: String,
        callback: Option<Callback>,
    },
    StartPreview {
        callback: Option<Callback>,
        force_reinit_consumer: bool,
    },
    UpdatePreview {
        callback: Option<Callback>,
        skip_frames: u32,
    },
    StartCapture {
        target: OutputTarget,
        callback: Option<Callback>,
        override_size: Option<CaptureSize>,
        reopen: bool,
    },
    StopCapture {
        restart_preview: bool,
        callback: Option<Callback>,
    },
    StopPreview,
    CloseDevice,
    SetProParams {
        params: ProParams,
        callback: Option<Callback>,
        skip_frames: u32,
        apply: bool,
    },
    SetCommon(Option<CommonCallback>),
    CaptureStills {
        specs: Vec<StillSpec>,
        sink: StillSink,
    },
    FinishStills,
    Resolve {
        ticket: Ticket,
        result: RigResult<()>,
    },
    Driver {
        ticket: Ticket,
        event: DriverEvent,
    },
    Release {
        latch: Arc<Latch>,
    },
}

struct Shared {
    env: Mutex<Option<CameraEnvParams>>,
    status: Mutex<PipelineStatus>,
    common: Arc<Mutex<Option<CommonCallback>>>,
}

/// Controller for one physical camera
pub struct CameraPipeline {
    index: usize,
    driver: Arc<dyn CameraDriver>,
    shared: Arc<Shared>,
    executor: Mutex<Option<SerialExecutor<Command>>>,
    release_timeout: Duration,
}

impl CameraPipeline {
    pub fn new(index: usize, driver: Arc<dyn CameraDriver>, release_timeout: Duration) -> Self {
        let status = PipelineStatus {
            still_size: still::DEFAULT_SIZE,
            ..Default::default()
        };
        Self {
            index,
            driver,
            shared: Arc::new(Shared {
                env: Mutex::new(None),
                status: Mutex::new(status),
                common: Arc::new(Mutex::new(None)),
            }),
            executor: Mutex::new(None),
            release_timeout,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> PipelineStatus {
        lock(&self.shared.status).clone()
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.shared.status).state
    }

    pub fn is_previewing(&self) -> bool {
        lock(&self.shared.status).previewing
    }

    /// Last requested configuration
    pub fn env(&self) -> Option<CameraEnvParams> {
        lock(&self.shared.env).clone()
    }

    /// Plan the move to `requested` and record it as the last request
    pub fn resolve_behavior(&self, requested: &CameraEnvParams, force_change: bool) -> CameraBehavior {
        let device_open = lock(&self.shared.status).device_open;
        let mut env = lock(&self.shared.env);
        let behavior = behavior::resolve(&mut env, requested, force_change);
        if !device_open && behavior != CameraBehavior::Switch {
            return CameraBehavior::Open;
        }
        behavior
    }

    /// Open the device, then configure the default preview session
    pub fn open(&self, camera_id: impl Into<String>, callback: Option<Callback>) {
        self.post(Command::Open {
            camera_id: camera_id.into(),
            callback,
        });
    }

    pub fn start_preview(&self, callback: Option<Callback>, force_reinit_consumer: bool) {
        self.post(Command::StartPreview {
            callback,
            force_reinit_consumer,
        });
    }

    /// Swap the repeating request; the callback fires on frame `skip_frames + 1`
    pub fn update_preview(&self, callback: Option<Callback>, skip_frames: u32) {
        self.post(Command::UpdatePreview {
            callback,
            skip_frames,
        });
    }

    pub fn start_capture(
        &self,
        target: OutputTarget,
        callback: Option<Callback>,
        override_size: Option<CaptureSize>,
    ) {
        self.post(Command::StartCapture {
            target,
            callback,
            override_size,
            reopen: false,
        });
    }

    /// Open the device and go straight to a capture session
    pub fn reopen_capture(
        &self,
        target: OutputTarget,
        callback: Option<Callback>,
        override_size: Option<CaptureSize>,
    ) {
        self.post(Command::StartCapture {
            target,
            callback,
            override_size,
            reopen: true,
        });
    }

    pub fn stop_capture(&self, restart_preview: bool, callback: Option<Callback>) {
        self.post(Command::StopCapture {
            restart_preview,
            callback,
        });
    }

    pub fn stop_preview(&self) {
        self.post(Command::StopPreview);
    }

    pub fn close_device(&self) {
        self.post(Command::CloseDevice);
    }

    /// Merge `params` and restart the repeating request when something changed
    pub fn set_pro_params(&self, params: ProParams, callback: Option<Callback>, skip_frames: u32) {
        self.post(Command::SetProParams {
            params,
            callback,
            skip_frames,
            apply: true,
        });
    }

    /// Merge `params` for the next session without touching the current one
    pub fn stage_pro_params(&self, params: ProParams) {
        self.post(Command::SetProParams {
            params,
            callback: None,
            skip_frames: 0,
            apply: false,
        });
    }

    pub fn set_common_callback(&self, common: Option<CommonCallback>) {
        *lock(&self.shared.common) = common.clone();
        if lock(&self.executor).is_some() {
            self.post(Command::SetCommon(common));
        }
    }

    pub fn notify_common(&self, err: RigError) {
        let common = lock(&self.shared.common).clone();
        match common {
            Some(common) => common(err),
            None => warn!(camera = self.index, error = %err, "Dropping unrouted camera error"),
        }
    }

    /// Submit still captures against the current session
    pub fn capture_stills(&self, specs: Vec<StillSpec>, sink: StillSink) {
        self.post(Command::CaptureStills { specs, sink });
    }

    /// Stop forwarding still events and frames
    pub fn finish_stills(&self) {
        self.post(Command::FinishStills);
    }

    pub fn release(&self) -> RigResult<()> {
        self.release_with_timeout(self.release_timeout)
    }

    /// Close session and device, waiting at most `timeout`
    ///
    /// Returns immediately when the pipeline is already closed. On timeout the
    /// teardown keeps running on the pipeline thread.
    pub fn release_with_timeout(&self, timeout: Duration) -> RigResult<()> {
        let Some(executor) = lock(&self.executor).take() else {
            debug!(camera = self.index, "Release on closed pipeline");
            return Ok(());
        };

        info!(camera = self.index, timeout_ms = timeout.as_millis() as u64, "Releasing camera");
        lock(&self.shared.status).state = PipelineState::Releasing;

        let latch = Arc::new(Latch::new());
        if !executor.post(Command::Release {
            latch: Arc::clone(&latch),
        }) {
            executor.detach();
            lock(&self.shared.status).state = PipelineState::Closed;
            return Ok(());
        }

        if latch.wait(timeout) {
            executor.join();
            Ok(())
        } else {
            warn!(camera = self.index, "Camera release timed out");
            executor.detach();
            let err = RigError::new(
                ErrorCode::TimeOut,
                format!("camera {} release timed out", self.index),
            );
            self.notify_common(err.clone());
            Err(err)
        }
    }

    fn post(&self, command: Command) {
        let mut executor = lock(&self.executor);
        let executor = executor.get_or_insert_with(|| self.spawn_executor());
        if !executor.post(command) {
            warn!(camera = self.index, "Pipeline thread is gone, dropping command");
        }
    }

    fn spawn_executor(&self) -> SerialExecutor<Command> {
        let index = self.index;
        let driver = Arc::clone(&self.driver);
        let shared = Arc::clone(&self.shared);
        SerialExecutor::start(
            &format!("camera-{}", index),
            move |sender| PipelineCore::new(index, driver, shared, sender),
            |core, command| core.handle(command),
        )
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        if let Some(executor) = lock(&self.executor).take() {
            executor.post(Command::Release {
                latch: Arc::new(Latch::new()),
            });
            executor.detach();
        }
    }
}

impl std::fmt::Debug for CameraPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraPipeline")
            .field("index", &self.index)
            .field("status", &self.status())
            .finish()
    }
}

struct Repeating {
    ticket: Ticket,
    skip_remaining: u32,
    confirmed: bool,
}

struct PendingCapture {
    target: OutputTarget,
    override_size: Option<CaptureSize>,
}

type Deliver = Arc<dyn Fn(Ticket, DriverEvent) + Send + Sync>;

/// State owned by the pipeline thread
struct PipelineCore {
    index: usize,
    driver: Arc<dyn CameraDriver>,
    shared: Arc<Shared>,
    sender: Sender<Command>,
    deliver: Deliver,
    callbacks: CallbackRegistry,
    device: Option<Box<dyn CameraDevice>>,
    device_ticket: Option<Ticket>,
    session: Option<Box<dyn CaptureSession>>,
    capture_target: Option<OutputTarget>,
    pending_capture: Option<PendingCapture>,
    /// Env values swapped out by a capture size override
    cached_env: Option<CameraEnvParams>,
    pro: ProParams,
    repeating: Option<Repeating>,
    still: Option<(Ticket, StillSink)>,
    failures: CaptureFailureMonitor,
}

impl PipelineCore {
    fn new(
        index: usize,
        driver: Arc<dyn CameraDriver>,
        shared: Arc<Shared>,
        sender: Sender<Command>,
    ) -> Self {
        let deliver_sender = sender.clone();
        let deliver: Deliver = Arc::new(move |ticket, event| {
            let _ = deliver_sender.send(Command::Driver { ticket, event });
        });
        let callbacks = CallbackRegistry::with_common(index, Arc::clone(&shared.common));
        Self {
            index,
            driver,
            shared,
            sender,
            deliver,
            callbacks,
            device: None,
            device_ticket: None,
            session: None,
            capture_target: None,
            pending_capture: None,
            cached_env: None,
            pro: ProParams::default(),
            repeating: None,
            still: None,
            failures: CaptureFailureMonitor::new(),
        }
    }

    fn handle(&mut self, command: Command) -> LoopAction {
        match command {
            Command::Open {
                camera_id,
                callback,
            } => self.open(camera_id, callback, None),
            Command::StartPreview {
                callback,
                force_reinit_consumer,
            } => self.start_preview(callback, force_reinit_consumer),
            Command::UpdatePreview {
                callback,
                skip_frames,
            } => self.update_preview(callback, skip_frames),
            Command::StartCapture {
                target,
                callback,
                override_size,
                reopen,
            } => {
                if reopen {
                    let camera_id = self.camera_id();
                    let pending = PendingCapture {
                        target,
                        override_size,
                    };
                    self.open(camera_id, callback, Some(pending));
                } else {
                    self.start_capture(target, callback, override_size);
                }
            }
            Command::StopCapture {
                restart_preview,
                callback,
            } => self.stop_capture(restart_preview, callback),
            Command::StopPreview => self.stop_preview(),
            Command::CloseDevice => self.close_device(),
            Command::SetProParams {
                params,
                callback,
                skip_frames,
                apply,
            } => self.set_pro_params(params, callback, skip_frames, apply),
            Command::SetCommon(common) => self.callbacks.set_common(common),
            Command::CaptureStills { specs, sink } => self.capture_stills(specs, sink),
            Command::FinishStills => self.finish_stills(),
            Command::Resolve { ticket, result } => self.callbacks.resolve(ticket, result),
            Command::Driver { ticket, event } => self.on_driver_event(ticket, event),
            Command::Release { latch } => {
                self.teardown();
                latch.open();
                return LoopAction::Stop;
            }
        }
        LoopAction::Continue
    }

    // ===== Helpers =====

    fn sink(&self, ticket: Ticket) -> EventSink {
        EventSink::new(ticket, Arc::clone(&self.deliver))
    }

    /// Callback that resolves `ticket` later, on this thread
    fn chain(&self, ticket: Ticket) -> Callback {
        let sender = self.sender.clone();
        Callback::new(move |result| {
            let _ = sender.send(Command::Resolve { ticket, result });
        })
    }

    fn env(&self) -> CameraEnvParams {
        lock(&self.shared.env).clone().unwrap_or_else(|| {
            let (width, height) = constants::DEFAULT_PREVIEW_SIZE;
            CameraEnvParams::new(self.index.to_string(), width, height, constants::DEFAULT_PREVIEW_FPS)
        })
    }

    fn camera_id(&self) -> String {
        match lock(&self.shared.env).as_ref() {
            Some(env) if !env.camera_id.is_empty() => env.camera_id.clone(),
            _ => self.index.to_string(),
        }
    }

    fn update_status<F: FnOnce(&mut PipelineStatus)>(&self, f: F) {
        f(&mut lock(&self.shared.status));
    }

    fn set_state(&self, state: PipelineState) {
        self.update_status(|s| s.state = state);
    }

    fn fail(&mut self, ticket: Ticket, code: ErrorCode, message: impl Into<String>) {
        let err = RigError::new(code, message);
        debug!(camera = self.index, op = ?ticket.op, error = %err, "Operation failed");
        self.callbacks.resolve(ticket, Err(err));
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(camera = self.index, "Closing capture session");
            session.close();
        }
        self.repeating = None;
        if let Some((_, sink)) = self.still.take() {
            let _ = sink.events.send(StillEvent::Aborted);
        }
        self.callbacks.disarm(OpKind::Still);
        self.update_status(|s| s.previewing = false);
    }

    fn session_config(&self, env: &CameraEnvParams, target: Option<&OutputTarget>) -> SessionConfig {
        let mut streams = vec![StreamConfig {
            kind: TargetKind::Preview,
            width: env.width,
            height: env.height,
        }];
        match target {
            Some(target) => streams.push(StreamConfig {
                kind: TargetKind::Output(target.clone()),
                width: env.width,
                height: env.height,
            }),
            None if env.capture_mode == CaptureMode::Photo => {
                let (width, height) = lock(&self.shared.status).still_size;
                streams.push(StreamConfig {
                    kind: TargetKind::Still,
                    width,
                    height,
                });
            }
            None => {}
        }
        SessionConfig {
            streams,
            high_speed: env.fps >= constants::HIGH_FPS,
        }
    }

    fn repeating_request(&self) -> CaptureRequest {
        let env = self.env();
        let mut targets = vec![TargetKind::Preview];
        if let Some(target) = &self.capture_target {
            targets.push(TargetKind::Output(target.clone()));
        }
        let fps_range = if env.lock_default_preview_fps || env.fps >= constants::HIGH_FPS {
            (env.fps, env.fps)
        } else {
            ((env.fps / 2).max(1), env.fps)
        };
        let exposure_time_ns = match self.pro.exposure_time {
            Some(ExposureTime::Manual(ns)) => Some(ns),
            _ => None,
        };
        CaptureRequest {
            template: if self.capture_target.is_some() {
                RequestTemplate::Record
            } else {
                RequestTemplate::Preview
            },
            targets,
            fps_range,
            auto_exposure: !self.pro.is_manual(),
            exposure_time_ns,
            iso: self.pro.iso,
            exposure_compensation: self.pro.compensation_steps(),
            white_balance: self.pro.white_balance.unwrap_or_default(),
            scene_mode: self.pro.scene_mode.unwrap_or_default(),
            index: 0,
        }
    }

    fn still_request(&self, spec: &StillSpec, metered_iso: Option<u32>) -> CaptureRequest {
        let env = self.env();
        let manual = spec.exposure_ns.is_some();
        CaptureRequest {
            template: RequestTemplate::Still,
            targets: vec![TargetKind::Preview, TargetKind::Still],
            fps_range: (env.fps, env.fps),
            auto_exposure: !manual,
            exposure_time_ns: spec.exposure_ns,
            iso: if manual { metered_iso.or(self.pro.iso) } else { self.pro.iso },
            exposure_compensation: if manual { 0 } else { self.pro.compensation_steps() },
            white_balance: self.pro.white_balance.unwrap_or_default(),
            scene_mode: self.pro.scene_mode.unwrap_or_default(),
            index: spec.index,
        }
    }

    // ===== Operations =====

    fn open(&mut self, camera_id: String, callback: Option<Callback>, pending: Option<PendingCapture>) {
        self.close_session();
        self.capture_target = None;
        if let Some(mut device) = self.device.take() {
            debug!(camera = self.index, "Closing device before reopening");
            device.close();
        }
        self.device_ticket = None;
        self.pending_capture = pending;

        let ticket = self.callbacks.arm(OpKind::Open, callback);
        self.update_status(|s| {
            s.state = PipelineState::Opening;
            s.device_open = false;
        });

        info!(camera = self.index, id = %camera_id, "Opening camera");
        if let Err(e) = self.driver.open(&camera_id, self.sink(ticket)) {
            warn!(camera = self.index, error = %e, "Camera open rejected");
            self.pending_capture = None;
            self.set_state(PipelineState::Closed);
            self.fail(ticket, ErrorCode::CameraNotOpened, e.to_string());
        }
    }

    fn start_preview(&mut self, callback: Option<Callback>, force_reinit_consumer: bool) {
        let ticket = self.callbacks.arm(OpKind::StartPreview, callback);
        if self.device.is_none() {
            self.fail(ticket, ErrorCode::CameraNotOpened, "start preview without an open device");
            return;
        }

        self.close_session();
        self.capture_target = None;
        if force_reinit_consumer {
            self.update_status(|s| s.still_size = still::LARGE_SIZE);
        }

        let env = self.env();
        let config = self.session_config(&env, None);
        let sink = self.sink(ticket);
        info!(
            camera = self.index,
            width = env.width,
            height = env.height,
            fps = env.fps,
            high_speed = config.high_speed,
            "Creating preview session"
        );

        let Some(device) = self.device.as_mut() else {
            return;
        };
        if let Err(e) = device.create_session(config, sink) {
            let code = match e {
                DriverError::Access(_) | DriverError::Closed => ErrorCode::CameraNotOpened,
                _ => ErrorCode::CameraSessionConfigureFailed,
            };
            self.fail(ticket, code, e.to_string());
        }
    }

    fn update_preview(&mut self, callback: Option<Callback>, skip_frames: u32) {
        let ticket = self.callbacks.arm(OpKind::UpdatePreview, callback);
        if self.device.is_none() {
            self.fail(ticket, ErrorCode::CameraNotOpened, "update preview without an open device");
            return;
        }

        let request = self.repeating_request();
        let sink = self.sink(ticket);
        let Some(session) = self.session.as_mut() else {
            self.fail(ticket, ErrorCode::CameraSessionNotCreate, "update preview without a session");
            return;
        };

        match session.set_repeating(request, sink) {
            Ok(()) => {
                self.repeating = Some(Repeating {
                    ticket,
                    skip_remaining: skip_frames,
                    confirmed: false,
                });
                self.failures.reset();
                let state = if self.capture_target.is_some() {
                    PipelineState::Capturing
                } else {
                    PipelineState::Previewing
                };
                self.update_status(|s| {
                    s.state = state;
                    s.previewing = true;
                });
                debug!(camera = self.index, skip_frames, "Repeating request submitted");
            }
            Err(e) => {
                let code = match e {
                    DriverError::Access(_) | DriverError::Closed => ErrorCode::CameraNotOpened,
                    _ => ErrorCode::CameraSessionNotCreate,
                };
                self.fail(ticket, code, e.to_string());
            }
        }
    }

    fn start_capture(
        &mut self,
        target: OutputTarget,
        callback: Option<Callback>,
        override_size: Option<CaptureSize>,
    ) {
        let ticket = self.callbacks.arm(OpKind::StartCapture, callback);
        if self.device.is_none() {
            self.fail(ticket, ErrorCode::CameraNotOpened, "start capture without an open device");
            return;
        }
        if !target.is_alive() {
            self.fail(
                ticket,
                ErrorCode::RecordCameraOutSurfaceIllegal,
                format!("output target {} is destroyed", target.name()),
            );
            return;
        }

        if let Some(size) = override_size {
            let current = self.env();
            if self.cached_env.is_none() {
                self.cached_env = Some(current.clone());
            }
            let mut env = lock(&self.shared.env);
            let env = env.get_or_insert(current);
            env.width = size.width;
            env.height = size.height;
            env.fps = size.fps;
            debug!(camera = self.index, ?size, "Capture size override applied");
        }

        self.close_session();
        let env = self.env();
        let config = self.session_config(&env, Some(&target));
        let sink = self.sink(ticket);
        info!(
            camera = self.index,
            target = %target.name(),
            width = env.width,
            height = env.height,
            fps = env.fps,
            "Creating capture session"
        );
        self.capture_target = Some(target);

        let Some(device) = self.device.as_mut() else {
            return;
        };
        if let Err(e) = device.create_session(config, sink) {
            let code = match e {
                DriverError::InvalidTarget(_) => ErrorCode::RecordCameraOutSurfaceIllegal,
                DriverError::Access(_) | DriverError::Closed => ErrorCode::CameraNotOpened,
                DriverError::Other(_) => ErrorCode::CameraSessionConfigureFailed,
            };
            self.capture_target = None;
            self.fail(ticket, code, e.to_string());
        }
    }

    fn stop_capture(&mut self, restart_preview: bool, callback: Option<Callback>) {
        let was_capturing = self.capture_target.take().is_some();
        self.close_session();
        if let Some(cached) = self.cached_env.take() {
            *lock(&self.shared.env) = Some(cached);
            debug!(camera = self.index, "Restored env after capture override");
        }
        info!(camera = self.index, was_capturing, restart_preview, "Stopping capture");

        if !restart_preview {
            if self.device.is_some() {
                self.set_state(PipelineState::Idle);
            }
            if let Some(callback) = callback {
                callback.success();
            }
            return;
        }

        match callback {
            None => self.start_preview(None, false),
            Some(callback) => {
                let sender = self.sender.clone();
                let then_update = Callback::new(move |result| match result {
                    Ok(()) => {
                        let _ = sender.send(Command::UpdatePreview {
                            callback: Some(callback),
                            skip_frames: 0,
                        });
                    }
                    Err(err) => callback.error(err),
                });
                self.start_preview(Some(then_update), false);
            }
        }
    }

    fn stop_preview(&mut self) {
        self.close_session();
        self.capture_target = None;
        if self.device.is_some() {
            self.set_state(PipelineState::Idle);
        }
        debug!(camera = self.index, "Preview stopped");
    }

    fn close_device(&mut self) {
        self.pending_capture = None;
        self.callbacks.cancel(
            OpKind::Open,
            RigError::new(ErrorCode::CameraNotOpened, "device closed while opening"),
        );
        self.close_session();
        self.capture_target = None;
        if let Some(mut device) = self.device.take() {
            info!(camera = self.index, "Closing camera device");
            device.close();
        }
        self.device_ticket = None;
        self.update_status(|s| {
            s.state = PipelineState::Closed;
            s.device_open = false;
        });
    }

    fn set_pro_params(
        &mut self,
        params: ProParams,
        callback: Option<Callback>,
        skip_frames: u32,
        apply: bool,
    ) {
        let changed = self.pro.merge(&params);
        debug!(camera = self.index, changed, apply, "Pro params merged");
        if !apply {
            return;
        }
        if self.device.is_none() {
            warn!(camera = self.index, "Pro params set without an open device");
            if let Some(callback) = callback {
                callback.error(RigError::new(ErrorCode::CameraNotOpened, "no open device"));
            }
            return;
        }
        if changed && self.session.is_some() {
            self.update_preview(callback, skip_frames);
        } else if let Some(callback) = callback {
            callback.success();
        }
    }

    fn capture_stills(&mut self, specs: Vec<StillSpec>, sink: StillSink) {
        let ticket = self.callbacks.arm(OpKind::Still, None);
        let reject = |sink: &StillSink, code: ErrorCode, message: String| {
            let _ = sink.events.send(StillEvent::Rejected(RigError::new(code, message)));
        };

        if self.device.is_none() {
            reject(&sink, ErrorCode::CameraNotOpened, "still capture without an open device".into());
            return;
        }

        let metered_iso = lock(&self.shared.status).metered_iso;
        let requests: Vec<CaptureRequest> = specs
            .iter()
            .map(|spec| self.still_request(spec, metered_iso))
            .collect();
        let event_sink = self.sink(ticket);

        let Some(session) = self.session.as_mut() else {
            reject(&sink, ErrorCode::CameraSessionNotCreate, "still capture without a session".into());
            return;
        };

        info!(camera = self.index, count = requests.len(), "Submitting still capture");
        match session.capture(requests, event_sink) {
            Ok(()) => self.still = Some((ticket, sink)),
            Err(e) => {
                self.callbacks.disarm(OpKind::Still);
                reject(&sink, ErrorCode::TakePhotoCaptureFailed, e.to_string());
            }
        }
    }

    fn finish_stills(&mut self) {
        self.still = None;
        self.callbacks.disarm(OpKind::Still);
    }

    fn teardown(&mut self) {
        self.pending_capture = None;
        self.close_session();
        self.capture_target = None;
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.device_ticket = None;
        self.callbacks.fail_all(&RigError::new(
            ErrorCode::CameraNotOpened,
            "camera released",
        ));
        self.update_status(|s| {
            s.state = PipelineState::Closed;
            s.device_open = false;
            s.previewing = false;
        });
        info!(camera = self.index, "Camera released");
    }

    // ===== Driver events =====

    fn on_driver_event(&mut self, ticket: Ticket, event: DriverEvent) {
        match event {
            DriverEvent::Opened(device) => self.on_opened(ticket, device),
            DriverEvent::Disconnected => self.on_device_lost(ticket, "camera disconnected".into()),
            DriverEvent::DeviceError(code) => {
                self.on_device_lost(ticket, format!("camera device error {}", code))
            }
            DriverEvent::SessionConfigured(session) => self.on_session_configured(ticket, session),
            DriverEvent::SessionConfigureFailed(reason) => {
                self.fail(ticket, ErrorCode::CameraSessionConfigureFailed, reason)
            }
            DriverEvent::CaptureCompleted(result) => self.on_capture_completed(ticket, result),
            DriverEvent::CaptureFailed { index, reason } => {
                self.on_capture_failed(ticket, index, reason)
            }
            DriverEvent::SequenceCompleted => {
                self.forward_still(ticket, StillEvent::SequenceCompleted)
            }
            DriverEvent::SequenceAborted => self.forward_still(ticket, StillEvent::Aborted),
            DriverEvent::ImageAvailable(frame) => self.on_image(ticket, frame),
        }
    }

    fn on_opened(&mut self, ticket: Ticket, mut device: Box<dyn CameraDevice>) {
        if !self.callbacks.is_current(ticket) {
            debug!(camera = self.index, "Closing device from a stale open");
            device.close();
            return;
        }

        let range = device.exposure_range();
        let ordered_burst = device.supports_ordered_burst();
        info!(camera = self.index, id = %device.id(), ordered_burst, "Camera opened");
        self.device = Some(device);
        self.device_ticket = Some(ticket);
        self.update_status(|s| {
            s.state = PipelineState::Idle;
            s.device_open = true;
            s.exposure_range = Some(range);
            s.ordered_burst = ordered_burst;
        });
        if lock(&self.shared.env).is_none() {
            *lock(&self.shared.env) = Some(self.env());
        }

        if let Some(pending) = self.pending_capture.take() {
            let callback = self.callbacks.take(ticket);
            self.start_capture(pending.target, callback, pending.override_size);
            return;
        }

        // open completes once the default preview session is configured
        let done = self.chain(ticket);
        self.start_preview(Some(done), false);
    }

    fn on_device_lost(&mut self, ticket: Ticket, reason: String) {
        let ours = self.device_ticket == Some(ticket) || self.callbacks.is_current(ticket);
        if !ours {
            debug!(camera = self.index, %reason, "Ignoring event from a stale device");
            return;
        }

        warn!(camera = self.index, %reason, "Camera lost");
        self.pending_capture = None;
        self.close_session();
        self.capture_target = None;
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.device_ticket = None;
        self.update_status(|s| {
            s.state = PipelineState::Closed;
            s.device_open = false;
        });

        let err = RigError::new(ErrorCode::CameraNotOpened, reason);
        if !self.callbacks.fail_all(&err) {
            self.callbacks.notify_common(err);
        }
    }

    fn on_session_configured(&mut self, ticket: Ticket, mut session: Box<dyn CaptureSession>) {
        if !self.callbacks.is_current(ticket) || self.device.is_none() {
            debug!(camera = self.index, op = ?ticket.op, "Closing session from a stale request");
            session.close();
            return;
        }

        self.session = Some(session);
        debug!(camera = self.index, op = ?ticket.op, "Session configured");

        match ticket.op {
            OpKind::StartCapture => {
                let callback = self.callbacks.take(ticket);
                self.update_preview(callback, 0);
            }
            _ if self.callbacks.has_callback(ticket) => self.callbacks.resolve(ticket, Ok(())),
            _ => {
                self.callbacks.disarm(ticket.op);
                self.update_preview(None, 0);
            }
        }
    }

    fn on_capture_completed(&mut self, ticket: Ticket, result: CaptureResult) {
        match ticket.op {
            OpKind::UpdatePreview => {
                self.update_status(|s| {
                    s.metered_exposure_ns = Some(result.exposure_time_ns);
                    s.metered_iso = Some(result.iso);
                    s.last_timestamp_ns = Some(result.timestamp_ns);
                });

                let Some(repeating) = self.repeating.as_mut() else {
                    return;
                };
                if repeating.ticket != ticket || repeating.confirmed {
                    return;
                }
                if repeating.skip_remaining > 0 {
                    repeating.skip_remaining -= 1;
                    return;
                }
                repeating.confirmed = true;
                self.callbacks.resolve(ticket, Ok(()));
            }
            OpKind::Still => self.forward_still(ticket, StillEvent::Completed(result)),
            _ => {}
        }
    }

    fn on_capture_failed(&mut self, ticket: Ticket, index: usize, reason: String) {
        if ticket.op == OpKind::Still {
            self.forward_still(ticket, StillEvent::Failed { index, reason });
            return;
        }

        debug!(camera = self.index, %reason, "Repeating capture failed");
        if let Some(verdict) = self.failures.record_failure(Instant::now()) {
            self.failures.reset();
            self.callbacks.notify_common(RigError::new(
                ErrorCode::CameraManyCaptureFailed,
                verdict.message(),
            ));
        }
    }

    fn forward_still(&mut self, ticket: Ticket, event: StillEvent) {
        match &self.still {
            Some((current, sink)) if *current == ticket => {
                let _ = sink.events.send(event);
            }
            _ => debug!(camera = self.index, ?event, "Dropping stale still event"),
        }
    }

    fn on_image(&mut self, ticket: Ticket, frame: FrameBuffer) {
        match &self.still {
            Some((current, sink)) if *current == ticket => {
                if let Err(e) = sink.frames.send(frame) {
                    debug!(camera = self.index, "Frame consumer gone, releasing frame");
                    drop(e.0);
                }
            }
            _ => {
                debug!(camera = self.index, index = frame.index, "Releasing frame from stale request");
                frame.release();
            }
        }
    }
}

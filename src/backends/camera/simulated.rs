// SPDX-License-Identifier: GPL-3.0-only

//! In-process camera driver
//!
//! Produces synthetic JPEG frames whose brightness follows the requested
//! exposure, so bracketed captures stack into something meaningful. Fault
//! switches let tests and the CLI reproduce driver failures per camera id.
//! Every driver call is recorded and can be inspected with
//! [`SimulatedDriver::calls`].

use super::types::*;
use super::{CameraDevice, CameraDriver, CaptureSession, DriverEvent, EventSink, lock};
use crate::errors::DriverError;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Behavior knobs of the simulated rig
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub exposure_range: ExposureRange,
    pub ordered_burst: bool,
    /// Frames reported for every repeating request
    pub frames_per_request: u32,
    pub metered_exposure_ns: u64,
    pub metered_iso: u32,
    pub frame_size: (u32, u32),
    /// Camera ids whose open call is rejected
    pub fail_open: HashSet<String>,
    /// Camera ids whose sessions fail to configure
    pub reject_session: HashSet<String>,
    /// Camera ids whose repeating requests never produce a frame
    pub stall_repeating: HashSet<String>,
    /// Still request index reported as a capture failure
    pub fail_still_index: Option<usize>,
    /// Still request index that completes without delivering an image
    pub drop_still_frame: Option<usize>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            exposure_range: ExposureRange::default(),
            ordered_burst: true,
            frames_per_request: 4,
            metered_exposure_ns: 10_000_000,
            metered_iso: 100,
            frame_size: (64, 32),
            fail_open: HashSet::new(),
            reject_session: HashSet::new(),
            stall_repeating: HashSet::new(),
            fail_still_index: None,
            drop_still_frame: None,
        }
    }
}

/// A recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Open(String),
    CloseDevice(String),
    CreateSession {
        camera: String,
        streams: usize,
        high_speed: bool,
    },
    SetRepeating {
        camera: String,
        template: RequestTemplate,
    },
    Capture {
        camera: String,
        count: usize,
    },
    CloseSession(String),
}

impl DriverCall {
    pub fn camera(&self) -> &str {
        match self {
            DriverCall::Open(camera)
            | DriverCall::CloseDevice(camera)
            | DriverCall::CloseSession(camera) => camera,
            DriverCall::CreateSession { camera, .. }
            | DriverCall::SetRepeating { camera, .. }
            | DriverCall::Capture { camera, .. } => camera,
        }
    }
}

struct Inner {
    config: Mutex<SimulatedConfig>,
    calls: Mutex<Vec<DriverCall>>,
    clock_ns: AtomicU64,
    frame_number: AtomicU64,
    /// Sink of the latest open per camera, used to inject device loss
    device_sinks: Mutex<HashMap<String, EventSink>>,
}

impl Inner {
    fn record(&self, call: DriverCall) {
        debug!(?call, "Simulated driver call");
        lock(&self.calls).push(call);
    }

    fn config(&self) -> SimulatedConfig {
        lock(&self.config).clone()
    }

    /// Advance the shared sensor clock by one frame
    fn tick(&self, fps: u32) -> u64 {
        let step = 1_000_000_000 / u64::from(fps.max(1));
        self.clock_ns.fetch_add(step, Ordering::AcqRel) + step
    }

    fn next_frame_number(&self) -> u64 {
        self.frame_number.fetch_add(1, Ordering::AcqRel)
    }
}

/// Driver for a rig of simulated cameras
#[derive(Clone)]
pub struct SimulatedDriver {
    inner: Arc<Inner>,
}

impl SimulatedDriver {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                calls: Mutex::new(Vec::new()),
                clock_ns: AtomicU64::new(0),
                frame_number: AtomicU64::new(0),
                device_sinks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Change fault switches while the rig is running
    pub fn update_config<F: FnOnce(&mut SimulatedConfig)>(&self, f: F) {
        f(&mut lock(&self.inner.config));
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.inner.calls).clone()
    }

    /// Recorded calls for one camera id
    pub fn calls_for(&self, camera: &str) -> Vec<DriverCall> {
        lock(&self.inner.calls)
            .iter()
            .filter(|call| call.camera() == camera)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.inner.calls).clear();
    }

    /// Report the device behind `camera_id` as disconnected
    pub fn disconnect(&self, camera_id: &str) -> bool {
        let sink = lock(&self.inner.device_sinks).get(camera_id).cloned();
        match sink {
            Some(sink) => {
                sink.emit(DriverEvent::Disconnected);
                true
            }
            None => false,
        }
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl CameraDriver for SimulatedDriver {
    fn open(&self, camera_id: &str, sink: EventSink) -> Result<(), DriverError> {
        self.inner.record(DriverCall::Open(camera_id.to_string()));
        let config = self.inner.config();
        if config.fail_open.contains(camera_id) {
            warn!(camera = %camera_id, "Simulated open failure");
            return Err(DriverError::Access(format!("camera {} unavailable", camera_id)));
        }

        lock(&self.inner.device_sinks).insert(camera_id.to_string(), sink.clone());
        let device = SimulatedDevice {
            id: camera_id.to_string(),
            inner: Arc::clone(&self.inner),
            closed: false,
        };
        sink.emit(DriverEvent::Opened(Box::new(device)));
        Ok(())
    }
}

struct SimulatedDevice {
    id: String,
    inner: Arc<Inner>,
    closed: bool,
}

impl CameraDevice for SimulatedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_session(&mut self, config: SessionConfig, sink: EventSink) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.inner.record(DriverCall::CreateSession {
            camera: self.id.clone(),
            streams: config.streams.len(),
            high_speed: config.high_speed,
        });

        for stream in &config.streams {
            if let TargetKind::Output(target) = &stream.kind
                && !target.is_alive()
            {
                return Err(DriverError::InvalidTarget(target.name().to_string()));
            }
        }

        if self.inner.config().reject_session.contains(&self.id) {
            sink.emit(DriverEvent::SessionConfigureFailed(format!(
                "camera {} rejected the session",
                self.id
            )));
            return Ok(());
        }

        let session = SimulatedSession {
            camera: self.id.clone(),
            inner: Arc::clone(&self.inner),
            closed: false,
        };
        sink.emit(DriverEvent::SessionConfigured(Box::new(session)));
        Ok(())
    }

    fn exposure_range(&self) -> ExposureRange {
        self.inner.config().exposure_range
    }

    fn supports_ordered_burst(&self) -> bool {
        self.inner.config().ordered_burst
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.record(DriverCall::CloseDevice(self.id.clone()));
        }
    }
}

struct SimulatedSession {
    camera: String,
    inner: Arc<Inner>,
    closed: bool,
}

impl SimulatedSession {
    fn still_frame(&self, config: &SimulatedConfig, request: &CaptureRequest, timestamp_ns: u64) -> Option<FrameBuffer> {
        let exposure = request.exposure_time_ns.unwrap_or(config.metered_exposure_ns);
        let iso = request.iso.unwrap_or(config.metered_iso);
        let (width, height) = config.frame_size;
        match synthetic_jpeg(width, height, exposure, config.metered_exposure_ns) {
            Ok(data) => Some(
                FrameBuffer::new(data, width, height, FrameFormat::Jpeg)
                    .with_index(request.index)
                    .with_timestamp(timestamp_ns)
                    .with_exposure(exposure, iso),
            ),
            Err(e) => {
                warn!(camera = %self.camera, error = %e, "Failed to synthesize still frame");
                None
            }
        }
    }
}

impl CaptureSession for SimulatedSession {
    fn set_repeating(&mut self, request: CaptureRequest, sink: EventSink) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.inner.record(DriverCall::SetRepeating {
            camera: self.camera.clone(),
            template: request.template,
        });

        let config = self.inner.config();
        if config.stall_repeating.contains(&self.camera) {
            debug!(camera = %self.camera, "Repeating request stalled");
            return Ok(());
        }

        for _ in 0..config.frames_per_request {
            let timestamp_ns = self.inner.tick(request.fps_range.1);
            sink.emit(DriverEvent::CaptureCompleted(CaptureResult {
                index: 0,
                frame_number: self.inner.next_frame_number(),
                exposure_time_ns: request.exposure_time_ns.unwrap_or(config.metered_exposure_ns),
                iso: request.iso.unwrap_or(config.metered_iso),
                timestamp_ns,
            }));
        }
        Ok(())
    }

    fn capture(&mut self, requests: Vec<CaptureRequest>, sink: EventSink) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.inner.record(DriverCall::Capture {
            camera: self.camera.clone(),
            count: requests.len(),
        });

        let config = self.inner.config();
        for request in &requests {
            if config.fail_still_index == Some(request.index) {
                sink.emit(DriverEvent::CaptureFailed {
                    index: request.index,
                    reason: format!("simulated failure of still {}", request.index),
                });
                continue;
            }

            let timestamp_ns = self.inner.tick(request.fps_range.1);
            let exposure = request.exposure_time_ns.unwrap_or(config.metered_exposure_ns);
            sink.emit(DriverEvent::CaptureCompleted(CaptureResult {
                index: request.index,
                frame_number: self.inner.next_frame_number(),
                exposure_time_ns: exposure,
                iso: request.iso.unwrap_or(config.metered_iso),
                timestamp_ns,
            }));

            if config.drop_still_frame == Some(request.index) {
                continue;
            }
            if let Some(frame) = self.still_frame(&config, request, timestamp_ns) {
                sink.emit(DriverEvent::ImageAvailable(frame));
            }
        }
        sink.emit(DriverEvent::SequenceCompleted);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.record(DriverCall::CloseSession(self.camera.clone()));
        }
    }
}

/// Gradient image brightened or darkened by `exposure / metered`
fn synthetic_jpeg(width: u32, height: u32, exposure: u64, metered: u64) -> Result<Vec<u8>, image::ImageError> {
    let gain = exposure as f32 / metered.max(1) as f32;
    let image = RgbImage::from_fn(width, height, |x, y| {
        let base_r = x as f32 / width.max(1) as f32 * 160.0 + 20.0;
        let base_g = y as f32 / height.max(1) as f32 * 160.0 + 20.0;
        let scale = |v: f32| (v * gain).clamp(0.0, 255.0) as u8;
        image::Rgb([scale(base_r), scale(base_g), scale(96.0)])
    });

    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, 90);
    encoder.encode(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}

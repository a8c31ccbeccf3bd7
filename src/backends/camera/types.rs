// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for camera pipelines and drivers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a pipeline session is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Continuous frames (preview, video, live stream)
    #[default]
    Stream,
    /// Preview plus a still output for photos
    Photo,
}

/// Last requested configuration of one pipeline
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraEnvParams {
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub capture_mode: CaptureMode,
    pub lock_default_preview_fps: bool,
}

impl CameraEnvParams {
    pub fn new(camera_id: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            camera_id: camera_id.into(),
            width,
            height,
            fps,
            capture_mode: CaptureMode::Stream,
            lock_default_preview_fps: false,
        }
    }

    pub fn with_capture_mode(mut self, mode: CaptureMode) -> Self {
        self.capture_mode = mode;
        self
    }
}

/// Action a pipeline must take to reach a requested configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraBehavior {
    /// Open the device from scratch
    Open,
    /// Close and reopen the device
    Switch,
    /// Keep the device, rebuild the session
    StartPreview,
    /// Keep the session, swap the repeating request
    UpdatePreview,
}

impl fmt::Display for CameraBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraBehavior::Open => "OPEN",
            CameraBehavior::Switch => "SWITCH",
            CameraBehavior::StartPreview => "START_PREVIEW",
            CameraBehavior::UpdatePreview => "UPDATE_PREVIEW",
        };
        write!(f, "{}", name)
    }
}

/// Pipeline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Closed,
    Opening,
    Idle,
    Previewing,
    Capturing,
    Releasing,
}

/// Manual exposure time or auto-exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureTime {
    Auto,
    /// Nanoseconds
    Manual(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WhiteBalance {
    #[default]
    Auto,
    Incandescent,
    Fluorescent,
    Daylight,
    Cloudy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SceneMode {
    #[default]
    Auto,
    Hdr,
    Night,
    Sports,
}

/// Professional exposure overlay, `None` fields leave the current value
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProParams {
    pub exposure_time: Option<ExposureTime>,
    /// EV steps, converted to device units as `ev * 6 / 2`
    pub exposure_compensation: Option<i32>,
    pub iso: Option<u32>,
    pub white_balance: Option<WhiteBalance>,
    pub scene_mode: Option<SceneMode>,
}

impl ProParams {
    /// Merge the set fields of `update` into `self`, returns whether anything changed
    pub fn merge(&mut self, update: &ProParams) -> bool {
        fn apply<T: PartialEq + Copy>(slot: &mut Option<T>, value: Option<T>) -> bool {
            match value {
                Some(v) if *slot != Some(v) => {
                    *slot = Some(v);
                    true
                }
                _ => false,
            }
        }

        let mut changed = apply(&mut self.exposure_time, update.exposure_time);
        changed |= apply(&mut self.exposure_compensation, update.exposure_compensation);
        changed |= apply(&mut self.iso, update.iso);
        changed |= apply(&mut self.white_balance, update.white_balance);
        changed |= apply(&mut self.scene_mode, update.scene_mode);
        changed
    }

    /// Device compensation steps for the configured EV
    pub fn compensation_steps(&self) -> i32 {
        self.exposure_compensation.map(|ev| ev * 6 / 2).unwrap_or(0)
    }

    /// Whether auto-exposure has to be turned off
    pub fn is_manual(&self) -> bool {
        matches!(self.exposure_time, Some(ExposureTime::Manual(_))) || self.iso.is_some()
    }
}

/// Capture size that differs from preview, swapped in for a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSize {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// High-fps mode that cannot coexist with the preview stream
    pub exclusive: bool,
}

impl CaptureSize {
    /// 940x940 at 60 fps, needs a full device close
    pub const SQUARE_940_60: CaptureSize = CaptureSize {
        width: 940,
        height: 940,
        fps: 60,
        exclusive: true,
    };

    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            exclusive: false,
        }
    }
}

/// Output a capture session writes into, e.g. an encoder input
///
/// The surface owner flips it to destroyed; pipelines refuse destroyed targets.
#[derive(Clone)]
pub struct OutputTarget {
    name: String,
    alive: Arc<AtomicBool>,
}

impl OutputTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Surface-destroyed signal
    pub fn mark_destroyed(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputTarget")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// One stream of a session
#[derive(Debug, Clone)]
pub enum TargetKind {
    Preview,
    Still,
    Output(OutputTarget),
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub kind: TargetKind,
    pub width: u32,
    pub height: u32,
}

/// Everything a device needs to build a capture session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub streams: Vec<StreamConfig>,
    /// Constrained high-speed session variant
    pub high_speed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
    Record,
    Still,
}

/// A single capture request submitted to a session
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub template: RequestTemplate,
    pub targets: Vec<TargetKind>,
    pub fps_range: (u32, u32),
    pub auto_exposure: bool,
    pub exposure_time_ns: Option<u64>,
    pub iso: Option<u32>,
    pub exposure_compensation: i32,
    pub white_balance: WhiteBalance,
    pub scene_mode: SceneMode,
    /// Position inside a burst, echoed back in results and frames
    pub index: usize,
}

/// Metadata of a completed capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureResult {
    pub index: usize,
    pub frame_number: u64,
    pub exposure_time_ns: u64,
    pub iso: u32,
    pub timestamp_ns: u64,
}

/// Exposure limits reported by a device, in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureRange {
    pub min_ns: u64,
    pub max_ns: u64,
}

impl Default for ExposureRange {
    fn default() -> Self {
        Self {
            min_ns: 10_000,
            max_ns: 1_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Hardware encoded JPEG
    Jpeg,
    /// Bayer sensor data, 16 bits per sample
    Raw16,
}

/// A frame borrowed from the driver's finite pool
///
/// The release hook runs exactly once, either through [`FrameBuffer::release`]
/// or when the buffer is dropped.
pub struct FrameBuffer {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub timestamp_ns: u64,
    pub format: FrameFormat,
    /// Request index inside the burst that produced this frame
    pub index: usize,
    pub exposure_time_ns: Option<u64>,
    pub iso: Option<u32>,
    releaser: Option<Box<dyn FnOnce() + Send>>,
}

impl FrameBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: FrameFormat) -> Self {
        let stride = match format {
            FrameFormat::Jpeg => 0,
            FrameFormat::Raw16 => width * 2,
        };
        Self {
            data,
            width,
            height,
            stride,
            timestamp_ns: 0,
            format,
            index: 0,
            exposure_time_ns: None,
            iso: None,
            releaser: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn with_exposure(mut self, exposure_time_ns: u64, iso: u32) -> Self {
        self.exposure_time_ns = Some(exposure_time_ns);
        self.iso = Some(iso);
        self
    }

    /// Hook returning the buffer to its pool
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.releaser = Some(Box::new(release));
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Return the buffer to its pool
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.releaser.take() {
            release();
        }
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("index", &self.index)
            .field("timestamp_ns", &self.timestamp_ns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_pro_params_merge() {
        let mut current = ProParams {
            iso: Some(100),
            ..Default::default()
        };
        let update = ProParams {
            exposure_compensation: Some(2),
            iso: None,
            ..Default::default()
        };
        assert!(current.merge(&update));
        assert_eq!(current.iso, Some(100));
        assert_eq!(current.exposure_compensation, Some(2));
        assert_eq!(current.compensation_steps(), 6);
        assert!(!current.merge(&update));
    }

    #[test]
    fn test_frame_buffer_releases_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let buffer = FrameBuffer::new(vec![0; 4], 1, 1, FrameFormat::Jpeg).with_release(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        buffer.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        {
            let _buffer = FrameBuffer::new(vec![0; 4], 1, 1, FrameFormat::Jpeg)
                .with_release(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_output_target_destroyed() {
        let target = OutputTarget::new("encoder");
        let clone = target.clone();
        assert!(clone.is_alive());
        target.mark_destroyed();
        assert!(!clone.is_alive());
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Still photo capture
//!
//! ```text
//! CameraPipeline ──StillSink──▶ ImageConsumer ──▶ IMG_<timestamp>.jpg
//!                                     │
//!                       (HDR) .<name>_unstitch.hdr/N.jpg ──▶ stacking
//! ```
//!
//! Single shots and HDR brackets both go through [`CameraPipeline::capture_stills`];
//! the frames are persisted on a separate writer so the camera thread never
//! touches the disk.

pub mod consumer;
pub mod encoding;
pub mod hdr;

pub use consumer::{Destination, ImageConsumer};
pub use encoding::OutputFormat;

use crate::backends::camera::{CameraPipeline, StillSink, StillSpec};
use crate::errors::{ErrorCode, RigError, RigResult};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::info;

/// Progress of a take-photo request
///
/// Methods are called from the photo worker thread.
pub trait TakePhotoListener: Send + Sync {
    /// Exposure `index` is about to be captured
    fn on_take_photo_start(&self, _index: usize) {}

    /// Every exposure has been captured; persisting and stacking may follow
    fn on_capture_photo_end(&self) {}

    fn on_take_photo_complete(&self, result: RigResult<PathBuf>);
}

/// Parameters of one take-photo request
#[derive(Debug, Clone, Default)]
pub struct PhotoParams {
    /// Bracket size; `None` takes a single still
    pub hdr_count: Option<usize>,
    /// Output name without extension, defaults to a timestamp
    pub basename: Option<String>,
    /// Overrides the configured photo directory
    pub output_dir: Option<PathBuf>,
    pub format: OutputFormat,
    /// Overrides the configured source retention
    pub keep_hdr_sources: Option<bool>,
    /// Exposure compensation factor for HDR brackets
    pub compensate: Option<f64>,
}

impl PhotoParams {
    pub fn single() -> Self {
        Self::default()
    }

    pub fn hdr(count: usize) -> Self {
        Self {
            hdr_count: Some(count),
            ..Self::default()
        }
    }

    pub fn is_hdr(&self) -> bool {
        self.hdr_count.is_some()
    }
}

/// Capture one auto-exposed still and persist it with `consumer`
pub fn capture_single(
    camera: &CameraPipeline,
    consumer: &ImageConsumer,
    timeout: Duration,
    listener: &dyn TakePhotoListener,
) -> RigResult<PathBuf> {
    if !camera.status().device_open {
        return Err(RigError::new(
            ErrorCode::CameraNotOpened,
            "take photo without an open camera",
        ));
    }

    let (event_tx, event_rx) = mpsc::channel();
    let (frame_tx, frame_rx) = mpsc::channel();
    listener.on_take_photo_start(0);
    camera.capture_stills(
        vec![StillSpec {
            index: 0,
            exposure_ns: None,
        }],
        StillSink {
            events: event_tx,
            frames: frame_tx,
        },
    );

    let captured = hdr::await_sequence(&event_rx, 1, timeout, || listener.on_capture_photo_end());
    let result = captured.and_then(|()| {
        let frame = frame_rx.recv_timeout(timeout).map_err(|_| {
            RigError::new(ErrorCode::TakePhotoCaptureFailed, "no still frame delivered")
        })?;
        consumer.on_frame(frame)
    });
    camera.finish_stills();

    if let Ok(path) = &result {
        info!(camera = camera.index(), path = %path.display(), "Photo saved");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_constructors() {
        assert!(!PhotoParams::single().is_hdr());
        let params = PhotoParams::hdr(5);
        assert!(params.is_hdr());
        assert_eq!(params.hdr_count, Some(5));
        assert_eq!(params.format, OutputFormat::Jpeg);
    }
}

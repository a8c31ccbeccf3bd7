// SPDX-License-Identifier: GPL-3.0-only

//! Still frame persistence
//!
//! An [`ImageConsumer`] takes ownership of each delivered [`FrameBuffer`],
//! writes it to disk and hands the buffer back to the driver pool. Files are
//! written under a temporary name and renamed into place, so a reader polling
//! the directory never sees a partial image.

use super::encoding::{CameraMetadata, OutputFormat, encode_dng};
use crate::backends::camera::types::{FrameBuffer, FrameFormat};
use crate::errors::{ErrorCode, RigError, RigResult};
use crate::storage;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

/// Where persisted frames go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `<dir>/<index>.jpg`, one file per bracket exposure
    Indexed(PathBuf),
    /// `<dir>/IMG_<timestamp>.<ext>`
    Timestamped(PathBuf),
    /// Exact file path
    Path(PathBuf),
}

/// Persists delivered still frames
#[derive(Debug, Clone)]
pub struct ImageConsumer {
    format: OutputFormat,
    destination: Destination,
    camera_name: Option<String>,
}

impl ImageConsumer {
    pub fn new(format: OutputFormat, destination: Destination) -> Self {
        Self {
            format,
            destination,
            camera_name: None,
        }
    }

    /// Camera name recorded in DNG metadata
    pub fn with_camera_name(mut self, name: impl Into<String>) -> Self {
        self.camera_name = Some(name.into());
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Target path for `frame`
    pub fn path_for(&self, frame: &FrameBuffer) -> PathBuf {
        match &self.destination {
            Destination::Indexed(dir) => dir.join(storage::source_file_name(frame.index)),
            Destination::Timestamped(dir) => dir.join(format!(
                "{}.{}",
                storage::timestamped_basename(),
                self.format.extension()
            )),
            Destination::Path(path) => path.clone(),
        }
    }

    /// Persist `frame` and release it
    ///
    /// The buffer goes back to its pool exactly once whether the write
    /// succeeds or fails.
    pub fn on_frame(&self, frame: FrameBuffer) -> RigResult<PathBuf> {
        let path = self.path_for(&frame);
        let result = self
            .encode(&frame)
            .and_then(|bytes| write_atomically(&path, &bytes).map_err(RigError::from));
        frame.release();

        match &result {
            Ok(()) => debug!(path = %path.display(), "Frame persisted"),
            Err(err) => warn!(path = %path.display(), error = %err, "Failed to persist frame"),
        }
        result.map(|()| path)
    }

    /// Persist frames until every sender is gone, reporting each outcome
    pub fn run<F>(&self, frames: Receiver<FrameBuffer>, mut on_saved: F)
    where
        F: FnMut(usize, RigResult<PathBuf>),
    {
        let mut count = 0usize;
        for frame in frames {
            let index = frame.index;
            on_saved(index, self.on_frame(frame));
            count += 1;
        }
        info!(count, "Image consumer finished");
    }

    fn encode(&self, frame: &FrameBuffer) -> RigResult<Vec<u8>> {
        let decode_error = |message: String| RigError::new(ErrorCode::TakePhotoCaptureFailed, message);
        match (self.format, frame.format) {
            (OutputFormat::Jpeg, FrameFormat::Jpeg) => {
                if !is_jpeg(frame.data()) {
                    return Err(decode_error(format!(
                        "frame {} is not a JPEG bitstream",
                        frame.index
                    )));
                }
                Ok(frame.data().to_vec())
            }
            (OutputFormat::Raw, _) => Ok(frame.data().to_vec()),
            (OutputFormat::Dng, FrameFormat::Raw16) => {
                let metadata = CameraMetadata::from_exposure_ns(
                    self.camera_name.clone(),
                    frame.exposure_time_ns,
                    frame.iso,
                );
                encode_dng(frame.data(), frame.width, frame.height, &metadata).map_err(decode_error)
            }
            (format, source) => Err(decode_error(format!(
                "cannot write {:?} frame as {:?}",
                source, format
            ))),
        }
    }
}

fn is_jpeg(data: &[u8]) -> bool {
    data.starts_with(&[0xFF, 0xD8])
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("part");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tracked(data: Vec<u8>, format: FrameFormat) -> (FrameBuffer, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let frame = FrameBuffer::new(data, 2, 2, format)
            .with_index(3)
            .with_release(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        (frame, count)
    }

    #[test]
    fn test_indexed_jpeg_written_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let consumer = ImageConsumer::new(OutputFormat::Jpeg, Destination::Indexed(dir.path().into()));
        let (frame, released) = tracked(vec![0xFF, 0xD8, 0xFF, 0xD9], FrameFormat::Jpeg);

        let path = consumer.on_frame(frame).unwrap();
        assert_eq!(path, dir.path().join("3.jpg"));
        assert_eq!(fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(!dir.path().join("3.part").exists());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_error_still_releases() {
        let dir = tempfile::tempdir().unwrap();
        let consumer = ImageConsumer::new(OutputFormat::Jpeg, Destination::Indexed(dir.path().into()));
        let (frame, released) = tracked(vec![1, 2, 3], FrameFormat::Jpeg);

        let err = consumer.on_frame(frame).unwrap_err();
        assert_eq!(err.code, ErrorCode::TakePhotoCaptureFailed);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_io_error_still_releases() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        // parent is a regular file, so directory creation fails
        let consumer = ImageConsumer::new(
            OutputFormat::Raw,
            Destination::Path(blocker.join("out.raw")),
        );
        let (frame, released) = tracked(vec![0; 8], FrameFormat::Raw16);

        assert!(consumer.on_frame(frame).is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dng_from_raw16() {
        let dir = tempfile::tempdir().unwrap();
        let consumer = ImageConsumer::new(OutputFormat::Dng, Destination::Timestamped(dir.path().into()))
            .with_camera_name("camera 0");
        let (frame, released) = tracked(vec![0; 8], FrameFormat::Raw16);

        let path = consumer.on_frame(frame).unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("dng"));
        assert!(fs::metadata(&path).unwrap().len() > 8);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}

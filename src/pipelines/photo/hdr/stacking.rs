// SPDX-License-Identifier: GPL-3.0-only

//! HDR stacking of persisted bracket sources
//!
//! ```text
//! wait for N files ─▶ decode (one worker per file) ─▶ add_image × N
//!        │                     │                            │
//!   HDR_PHOTO_LOSE    HDR_PHOTO_STACK_BITMAP      HDR_PHOTO_STACK_FAILED
//!
//! calculate(output, donor) ─▶ inject thumbnail
//!        │
//!   engine code verbatim
//! ```

use crate::backends::camera::lock;
use crate::errors::{ErrorCode, RigError, RigResult};
use crate::pipelines::photo::encoding::encode_jpeg;
use crate::storage::{self, HdrLayout};
use image::RgbaImage;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// External HDR merge engine
///
/// Return values follow the native convention: 0 is success, anything else
/// is an engine specific error code.
pub trait StackingEngine: Send + Sync {
    /// Queue one RGBA exposure, darkest first
    fn add_image(&self, data: &[u8], width: u32, height: u32, stride: u32) -> i32;

    /// Merge the queued exposures into `output`, copying metadata from `donor`
    fn calculate(&self, output: &Path, donor: &Path, width: u32, height: u32, quality: u32) -> i32;

    /// Drop queued exposures
    fn clear(&self);

    fn inject_thumbnail(&self, image: &Path, thumbnail: &Path) -> i32;
}

/// Error codes of [`SoftwareStackingEngine`]
pub mod engine_codes {
    pub const NO_IMAGES: i32 = -2;
    pub const SIZE_MISMATCH: i32 = -3;
    pub const WRITE_FAILED: i32 = -4;
    pub const MISSING_DONOR: i32 = -5;
    pub const BAD_BUFFER: i32 = -6;
}

struct QueuedImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

/// CPU exposure fusion weighted by well-exposedness
#[derive(Default)]
pub struct SoftwareStackingEngine {
    images: Mutex<Vec<QueuedImage>>,
}

impl SoftwareStackingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> usize {
        lock(&self.images).len()
    }

    fn fuse(images: &[QueuedImage], width: u32, height: u32) -> image::RgbImage {
        // gaussian around mid-gray, sigma 0.2
        let weight = |v: f32| (-((v - 0.5) * (v - 0.5)) / 0.08).exp() + 1e-6;
        image::RgbImage::from_fn(width, height, |x, y| {
            let mut acc = [0f32; 3];
            let mut total = 0f32;
            for img in images {
                let at = ((y * img.width + x) * 4) as usize;
                let px = &img.data[at..at + 3];
                let luma = (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) / 255.0;
                let w = weight(luma);
                for (slot, value) in acc.iter_mut().zip(px) {
                    *slot += w * *value as f32;
                }
                total += w;
            }
            image::Rgb(acc.map(|v| (v / total).round().clamp(0.0, 255.0) as u8))
        })
    }
}

impl StackingEngine for SoftwareStackingEngine {
    fn add_image(&self, data: &[u8], width: u32, height: u32, stride: u32) -> i32 {
        let row = width as usize * 4;
        let stride = stride as usize;
        if stride < row || data.len() < stride * height as usize {
            return engine_codes::BAD_BUFFER;
        }

        let mut packed = Vec::with_capacity(row * height as usize);
        for line in data.chunks(stride).take(height as usize) {
            packed.extend_from_slice(&line[..row]);
        }

        let mut images = lock(&self.images);
        if images.first().is_some_and(|first| first.width != width || first.height != height) {
            return engine_codes::SIZE_MISMATCH;
        }
        images.push(QueuedImage {
            data: packed,
            width,
            height,
        });
        0
    }

    fn calculate(&self, output: &Path, donor: &Path, width: u32, height: u32, quality: u32) -> i32 {
        if !donor.is_file() {
            return engine_codes::MISSING_DONOR;
        }
        let images = std::mem::take(&mut *lock(&self.images));
        if images.is_empty() {
            return engine_codes::NO_IMAGES;
        }
        if images.iter().any(|img| img.width != width || img.height != height) {
            return engine_codes::SIZE_MISMATCH;
        }

        let fused = Self::fuse(&images, width, height);
        let quality = quality.min(100) as u8;
        match encode_jpeg(&fused, quality).and_then(|bytes| fs::write(output, bytes).map_err(|e| e.to_string())) {
            Ok(()) => 0,
            Err(e) => {
                warn!(output = %output.display(), error = %e, "Failed to write stacked image");
                engine_codes::WRITE_FAILED
            }
        }
    }

    fn clear(&self) {
        lock(&self.images).clear();
    }

    fn inject_thumbnail(&self, image: &Path, thumbnail: &Path) -> i32 {
        let dest = image.with_extension("thumb.jpg");
        match fs::copy(thumbnail, &dest) {
            Ok(_) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to attach thumbnail");
                engine_codes::WRITE_FAILED
            }
        }
    }
}

/// Poll `dir` until all `count` indexed sources exist
pub fn wait_for_sources(
    dir: &Path,
    count: usize,
    timeout: Duration,
    poll: Duration,
) -> RigResult<Vec<PathBuf>> {
    let deadline = Instant::now() + timeout;
    loop {
        let present = storage::count_source_files(dir, count);
        if present >= count {
            debug!(count, "All HDR sources present");
            return Ok((0..count)
                .map(|index| dir.join(storage::source_file_name(index)))
                .collect());
        }
        if Instant::now() >= deadline {
            warn!(present, count, dir = %dir.display(), "HDR sources missing");
            return Err(RigError::new(
                ErrorCode::HdrPhotoLose,
                format!("{} of {} HDR sources written", present, count),
            ));
        }
        thread::sleep(poll);
    }
}

/// Decode every source on its own worker, all joined before returning
pub fn decode_sources(paths: &[PathBuf]) -> RigResult<Vec<RgbaImage>> {
    let results: Vec<Result<RgbaImage, String>> = thread::scope(|scope| {
        let workers: Vec<_> = paths
            .iter()
            .map(|path| {
                scope.spawn(move || {
                    image::open(path)
                        .map(|img| img.to_rgba8())
                        .map_err(|e| format!("{}: {}", path.display(), e))
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker
                    .join()
                    .unwrap_or_else(|_| Err("decode worker panicked".to_string()))
            })
            .collect()
    });

    let images: Vec<RgbaImage> = results
        .into_iter()
        .collect::<Result<_, _>>()
        .map_err(|e| RigError::new(ErrorCode::HdrPhotoStackBitmap, e))?;

    if let Some(first) = images.first()
        && images.iter().any(|img| img.dimensions() != first.dimensions())
    {
        return Err(RigError::new(
            ErrorCode::HdrPhotoStackBitmap,
            "HDR sources differ in size",
        ));
    }
    Ok(images)
}

/// Parameters of one stacking run
#[derive(Debug, Clone)]
pub struct StackJob {
    pub layout: HdrLayout,
    pub count: usize,
    pub middle_index: usize,
    pub quality: u32,
    /// Thumbnail generated from the middle exposure, if any
    pub thumbnail: Option<PathBuf>,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

/// Wait for, decode and merge the bracket sources
///
/// Returns the stacked output path. The source directory is left alone; the
/// caller finalizes it.
pub fn stack(engine: &dyn StackingEngine, job: &StackJob) -> RigResult<PathBuf> {
    let dir = job.layout.hidden_dir();
    let sources = wait_for_sources(&dir, job.count, job.ready_timeout, job.poll_interval)?;
    let images = decode_sources(&sources)?;

    engine.clear();
    let (width, height) = images.first().map(|img| img.dimensions()).unwrap_or((0, 0));
    for (index, img) in images.iter().enumerate() {
        let code = engine.add_image(img.as_raw(), width, height, width * 4);
        if code != 0 {
            engine.clear();
            return Err(RigError::new(
                ErrorCode::HdrPhotoStackFailed,
                format!("add_image {} returned {}", index, code),
            ));
        }
    }
    drop(images);

    let output = job.layout.output_file();
    let donor = &sources[job.middle_index.min(sources.len().saturating_sub(1))];
    let code = engine.calculate(&output, donor, width, height, job.quality);
    if code != 0 {
        engine.clear();
        return Err(RigError::new(
            ErrorCode::Engine(code),
            format!("HDR calculate returned {}", code),
        ));
    }
    info!(output = %output.display(), width, height, "HDR stacked");

    if let Some(thumbnail) = job.thumbnail.as_ref().filter(|t| t.is_file()) {
        let code = engine.inject_thumbnail(&output, thumbnail);
        if code != 0 {
            warn!(code, "Thumbnail injection failed");
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_source(dir: &Path, index: usize, value: u8) {
        let img = image::RgbImage::from_pixel(4, 2, image::Rgb([value, value, value]));
        img.save_with_format(dir.join(storage::source_file_name(index)), image::ImageFormat::Jpeg)
            .unwrap();
    }

    fn job(layout: HdrLayout) -> StackJob {
        StackJob {
            layout,
            count: 3,
            middle_index: 1,
            quality: 90,
            thumbnail: None,
            ready_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_missing_source_is_lost() {
        let root = tempfile::tempdir().unwrap();
        let layout = HdrLayout::new(root.path(), "IMG_T");
        let dir = storage::create_hdr_dir(&layout).unwrap();
        write_source(&dir, 0, 40);
        write_source(&dir, 1, 128);

        let engine = SoftwareStackingEngine::new();
        let err = stack(&engine, &job(layout)).unwrap_err();
        assert_eq!(err.code, ErrorCode::HdrPhotoLose);
    }

    #[test]
    fn test_all_sources_stack() {
        let root = tempfile::tempdir().unwrap();
        let layout = HdrLayout::new(root.path(), "IMG_T");
        let dir = storage::create_hdr_dir(&layout).unwrap();
        for (index, value) in [20u8, 128, 240].into_iter().enumerate() {
            write_source(&dir, index, value);
        }

        let engine = SoftwareStackingEngine::new();
        let output = stack(&engine, &job(layout.clone())).unwrap();
        assert_eq!(output, layout.output_file());
        let merged = image::open(&output).unwrap();
        assert_eq!((merged.width(), merged.height()), (4, 2));
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn test_corrupt_source_fails_decode() {
        let root = tempfile::tempdir().unwrap();
        let layout = HdrLayout::new(root.path(), "IMG_T");
        let dir = storage::create_hdr_dir(&layout).unwrap();
        write_source(&dir, 0, 40);
        fs::write(dir.join("1.jpg"), b"not a jpeg").unwrap();
        write_source(&dir, 2, 200);

        let engine = SoftwareStackingEngine::new();
        let err = stack(&engine, &job(layout)).unwrap_err();
        assert_eq!(err.code, ErrorCode::HdrPhotoStackBitmap);
    }

    struct FailingEngine(i32);

    impl StackingEngine for FailingEngine {
        fn add_image(&self, _: &[u8], _: u32, _: u32, _: u32) -> i32 {
            0
        }
        fn calculate(&self, _: &Path, _: &Path, _: u32, _: u32, _: u32) -> i32 {
            self.0
        }
        fn clear(&self) {}
        fn inject_thumbnail(&self, _: &Path, _: &Path) -> i32 {
            0
        }
    }

    #[test]
    fn test_engine_code_surfaces_verbatim() {
        let root = tempfile::tempdir().unwrap();
        let layout = HdrLayout::new(root.path(), "IMG_T");
        let dir = storage::create_hdr_dir(&layout).unwrap();
        for index in 0..3 {
            write_source(&dir, index, 100);
        }
        let err = stack(&FailingEngine(-17), &job(layout)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Engine(-17));
        assert_eq!(err.code(), -17);
    }

    #[test]
    fn test_add_image_rejects_short_buffer() {
        let engine = SoftwareStackingEngine::new();
        assert_eq!(engine.add_image(&[0; 4], 2, 2, 8), engine_codes::BAD_BUFFER);
        assert_eq!(engine.add_image(&[0; 16], 2, 2, 8), 0);
        assert_eq!(engine.add_image(&[0; 36], 3, 3, 12), engine_codes::SIZE_MISMATCH);
    }
}

// SPDX-License-Identifier: GPL-3.0-only
//! Bracketed-exposure HDR capture
//!
//! # Flow
//!
//! ```text
//! metered exposure ─▶ ExposureBracket ─▶ still captures (burst or sequential)
//!                                              │
//!                                   ImageConsumer writer thread
//!                                              │
//!                          .<name>_unstitch.hdr/0.jpg .. N-1.jpg
//!                                              │
//!                  wait for sources ─▶ restore preview ─▶ stack ─▶ finalize dir
//! ```
//!
//! Any capture failure aborts the bracket before stacking. The preview is
//! always restored; a restore failure only reaches the common subscription.

pub mod exposure;
pub mod stacking;

pub use exposure::ExposureBracket;
pub use stacking::{SoftwareStackingEngine, StackJob, StackingEngine};

use super::TakePhotoListener;
use super::consumer::{Destination, ImageConsumer};
use super::encoding::OutputFormat;
use crate::backends::camera::{Callback, CameraPipeline, StillEvent, StillSink, StillSpec};
use crate::config::Timeouts;
use crate::constants::{self, ResolutionClass};
use crate::errors::{ErrorCode, RigError, RigResult};
use crate::storage::{self, HdrLayout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest side of the generated thumbnail
const THUMBNAIL_MAX_SIDE: u32 = 320;

/// One HDR capture request
#[derive(Debug, Clone)]
pub struct HdrRequest {
    pub count: usize,
    pub layout: HdrLayout,
    pub resolution: ResolutionClass,
    /// Extra scale applied to every exposure
    pub compensate: Option<f64>,
    pub keep_sources: bool,
    pub thumbnail: bool,
    pub quality: u32,
    /// Use one ordered burst when the device supports it
    pub prefer_burst: bool,
}

/// State of a bracket between capture start and cleanup
#[derive(Debug)]
pub struct HdrTask {
    pub bracket: ExposureBracket,
    pub source_dir: PathBuf,
    pub captured: Vec<Option<PathBuf>>,
    pub middle_index: usize,
    pub keep_sources: bool,
}

impl HdrTask {
    pub fn new(bracket: ExposureBracket, source_dir: PathBuf, keep_sources: bool) -> Self {
        let count = bracket.count;
        let middle_index = bracket.middle_index();
        Self {
            bracket,
            source_dir,
            captured: vec![None; count],
            middle_index,
            keep_sources,
        }
    }

    pub fn specs(&self) -> Vec<StillSpec> {
        self.bracket
            .targets_ns
            .iter()
            .enumerate()
            .map(|(index, ns)| StillSpec {
                index,
                exposure_ns: Some(*ns),
            })
            .collect()
    }

    fn record_saved(&mut self, index: usize, result: RigResult<PathBuf>) {
        match result {
            Ok(path) => {
                if let Some(slot) = self.captured.get_mut(index) {
                    *slot = Some(path);
                }
            }
            Err(err) => warn!(index, error = %err, "HDR source not persisted"),
        }
    }
}

type Saved = (usize, RigResult<PathBuf>);

/// Drives bracketed captures on one camera pipeline
pub struct HdrCapturePipeline {
    camera: Arc<CameraPipeline>,
    engine: Arc<dyn StackingEngine>,
    timeouts: Timeouts,
    panorama_enabled: Arc<AtomicBool>,
}

impl HdrCapturePipeline {
    pub fn new(
        camera: Arc<CameraPipeline>,
        engine: Arc<dyn StackingEngine>,
        timeouts: Timeouts,
        panorama_enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera,
            engine,
            timeouts,
            panorama_enabled,
        }
    }

    /// Capture, stack and clean up one bracket, returning the stacked image
    pub fn run(&self, request: &HdrRequest, listener: &dyn TakePhotoListener) -> RigResult<PathBuf> {
        let status = self.camera.status();
        if !status.device_open {
            return Err(RigError::new(ErrorCode::CameraNotOpened, "HDR capture without an open camera"));
        }
        let base = status
            .metered_exposure_ns
            .ok_or_else(|| RigError::new(ErrorCode::NotInit, "no metered exposure yet"))?;
        let bracket = ExposureBracket::compute(
            request.count,
            base,
            status.exposure_range.unwrap_or_default(),
            request.resolution,
            request.compensate,
        )?;

        let source_dir = storage::create_hdr_dir(&request.layout)?;
        let mut task = HdrTask::new(bracket, source_dir, request.keep_sources);
        let burst = request.prefer_burst && status.ordered_burst;
        info!(
            camera = self.camera.index(),
            count = request.count,
            burst,
            dir = %task.source_dir.display(),
            "Starting HDR capture"
        );

        let (event_tx, event_rx) = mpsc::channel();
        let (frame_tx, frame_rx) = mpsc::channel();
        let (saved_tx, saved_rx) = mpsc::channel::<Saved>();
        let writer = self.spawn_writer(request, &task, frame_rx, saved_tx)?;
        let panorama_before = self.panorama_enabled.swap(false, Ordering::AcqRel);
        let sink = StillSink {
            events: event_tx,
            frames: frame_tx,
        };

        let captured = if burst {
            listener.on_take_photo_start(0);
            self.capture_burst(&task, sink, &event_rx, listener)
        } else {
            self.capture_sequential(&mut task, sink, &event_rx, &saved_rx, listener)
        };

        if let Err(err) = captured {
            error!(error = %err, "HDR capture failed");
            self.finish_capture(writer, &saved_rx, &mut task);
            self.restore_preview(request.resolution, panorama_before);
            if let Err(e) = storage::finalize_hdr_dir(&request.layout, false) {
                warn!(error = %e, "Failed to remove HDR sources");
            }
            return Err(err);
        }

        let ready = stacking::wait_for_sources(
            &task.source_dir,
            task.bracket.count,
            self.timeouts.stack_file_ready(),
            constants::STACK_FILE_POLL_INTERVAL,
        );
        self.finish_capture(writer, &saved_rx, &mut task);
        self.restore_preview(request.resolution, panorama_before);

        let job = StackJob {
            layout: request.layout.clone(),
            count: task.bracket.count,
            middle_index: task.middle_index,
            quality: request.quality,
            thumbnail: request.thumbnail.then(|| request.layout.thumbnail_file()),
            ready_timeout: Duration::ZERO,
            poll_interval: constants::STACK_FILE_POLL_INTERVAL,
        };
        let result = ready.and_then(|_| stacking::stack(self.engine.as_ref(), &job));

        if let Err(e) = storage::finalize_hdr_dir(&request.layout, task.keep_sources) {
            warn!(error = %e, "Failed to finalize HDR directory");
        }
        match &result {
            Ok(path) => info!(output = %path.display(), "HDR photo complete"),
            Err(err) => error!(error = %err, "HDR stacking failed"),
        }
        result
    }

    fn spawn_writer(
        &self,
        request: &HdrRequest,
        task: &HdrTask,
        frames: Receiver<crate::backends::camera::FrameBuffer>,
        saved: mpsc::Sender<Saved>,
    ) -> RigResult<thread::JoinHandle<()>> {
        let consumer = ImageConsumer::new(OutputFormat::Jpeg, Destination::Indexed(task.source_dir.clone()))
            .with_camera_name(format!("camera {}", self.camera.index()));
        let middle = task.middle_index;
        let thumbnail = request.thumbnail.then(|| request.layout.thumbnail_file());

        thread::Builder::new()
            .name("hdr-writer".into())
            .spawn(move || {
                consumer.run(frames, |index, result| {
                    if let (Some(dest), Ok(path)) = (&thumbnail, &result)
                        && index == middle
                        && let Err(e) = storage::create_thumbnail(path, dest, THUMBNAIL_MAX_SIDE)
                    {
                        warn!(error = %e, "Failed to create HDR thumbnail");
                    }
                    let _ = saved.send((index, result));
                });
            })
            .map_err(|e| RigError::new(ErrorCode::Unknown, format!("failed to spawn HDR writer: {}", e)))
    }

    fn capture_burst(
        &self,
        task: &HdrTask,
        sink: StillSink,
        events: &Receiver<StillEvent>,
        listener: &dyn TakePhotoListener,
    ) -> RigResult<()> {
        let count = task.bracket.count;
        self.camera.capture_stills(task.specs(), sink);
        let timeout = self.timeouts.still_frame() * count as u32;
        await_sequence(events, count, timeout, || listener.on_capture_photo_end())
    }

    fn capture_sequential(
        &self,
        task: &mut HdrTask,
        sink: StillSink,
        events: &Receiver<StillEvent>,
        saved: &Receiver<Saved>,
        listener: &dyn TakePhotoListener,
    ) -> RigResult<()> {
        let count = task.bracket.count;
        for spec in task.specs() {
            listener.on_take_photo_start(spec.index);
            self.camera.capture_stills(vec![spec], sink.clone());
            await_sequence(events, 1, self.timeouts.still_frame(), || {
                if spec.index + 1 == count {
                    listener.on_capture_photo_end();
                }
            })?;

            // the next exposure only starts once this one is on disk
            loop {
                match saved.recv_timeout(self.timeouts.still_frame()) {
                    Ok((index, result)) => {
                        let done = index == spec.index;
                        let failed = result.as_ref().err().cloned();
                        task.record_saved(index, result);
                        if let Some(err) = failed.filter(|_| done) {
                            return Err(err);
                        }
                        if done {
                            break;
                        }
                    }
                    Err(_) => {
                        return Err(RigError::new(
                            ErrorCode::TakePhotoCaptureFailed,
                            format!("exposure {} was not persisted", spec.index),
                        ));
                    }
                }
            }
            debug!(index = spec.index, "Sequential exposure persisted");
        }
        Ok(())
    }

    /// Stop still forwarding and wait for the writer to drain
    fn finish_capture(&self, writer: thread::JoinHandle<()>, saved: &Receiver<Saved>, task: &mut HdrTask) {
        self.camera.finish_stills();
        if writer.join().is_err() {
            warn!("HDR writer thread panicked");
        }
        for (index, result) in saved.try_iter() {
            task.record_saved(index, result);
        }
        debug!(
            persisted = task.captured.iter().filter(|p| p.is_some()).count(),
            "HDR writer drained"
        );
    }

    /// Bring the preview back, then reset the panorama flag to its value before the run
    fn restore_preview(&self, resolution: ResolutionClass, panorama_before: bool) {
        let camera = Arc::clone(&self.camera);
        let panorama = Arc::clone(&self.panorama_enabled);
        let done = Callback::new(move |result| {
            if let Err(err) = result {
                warn!(error = %err, "Failed to restore preview after HDR");
                camera.notify_common(RigError::new(
                    ErrorCode::HdrPhotoRestorePreviewError,
                    err.message,
                ));
            }
            panorama.store(panorama_before, Ordering::Release);
        });

        match resolution {
            // the large still consumer needs a fresh session
            ResolutionClass::High => {
                let camera = Arc::clone(&self.camera);
                self.camera.start_preview(
                    Some(Callback::new(move |result| match result {
                        Ok(()) => camera.update_preview(Some(done), constants::HDR_SKIP_FRAME_COUNT),
                        Err(err) => done.error(err),
                    })),
                    false,
                );
            }
            ResolutionClass::Standard => {
                self.camera
                    .update_preview(Some(done), constants::HDR_SKIP_FRAME_COUNT);
            }
        }
    }
}

/// Wait for `expected` completions and the end of the capture sequence
pub(crate) fn await_sequence<F: FnOnce()>(
    events: &Receiver<StillEvent>,
    expected: usize,
    timeout: Duration,
    on_all_completed: F,
) -> RigResult<()> {
    let deadline = Instant::now() + timeout;
    let mut completed = 0usize;
    let mut on_all_completed = Some(on_all_completed);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(StillEvent::Completed(result)) => {
                completed += 1;
                debug!(index = result.index, exposure_ns = result.exposure_time_ns, "Still captured");
                if completed == expected
                    && let Some(f) = on_all_completed.take()
                {
                    f();
                }
            }
            Ok(StillEvent::SequenceCompleted) => {
                if completed < expected {
                    return Err(RigError::new(
                        ErrorCode::TakePhotoCaptureFailed,
                        format!("{} of {} stills completed", completed, expected),
                    ));
                }
                return Ok(());
            }
            Ok(StillEvent::Failed { index, reason }) => {
                return Err(RigError::new(
                    ErrorCode::TakePhotoCaptureFailed,
                    format!("still {} failed: {}", index, reason),
                ));
            }
            Ok(StillEvent::Aborted) => {
                return Err(RigError::new(ErrorCode::TakePhotoCaptureFailed, "capture sequence aborted"));
            }
            Ok(StillEvent::Rejected(err)) => return Err(err),
            Err(RecvTimeoutError::Timeout) => {
                return Err(RigError::new(ErrorCode::TimeOut, "still capture timed out"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(RigError::new(ErrorCode::TakePhotoCaptureFailed, "still events closed"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::CaptureResult;

    #[test]
    fn test_task_specs_follow_bracket() {
        let bracket = ExposureBracket::compute(
            3,
            10_000_000,
            Default::default(),
            ResolutionClass::Standard,
            None,
        )
        .unwrap();
        let task = HdrTask::new(bracket, PathBuf::from("/tmp/x"), false);
        let specs = task.specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1].exposure_ns, Some(10_000_000));
        assert_eq!(task.middle_index, 1);
    }

    #[test]
    fn test_await_sequence_reports_end_once() {
        let (tx, rx) = mpsc::channel();
        for index in 0..3 {
            tx.send(StillEvent::Completed(CaptureResult {
                index,
                ..Default::default()
            }))
            .unwrap();
        }
        tx.send(StillEvent::SequenceCompleted).unwrap();

        let mut ended = 0;
        await_sequence(&rx, 3, Duration::from_secs(1), || ended += 1).unwrap();
        assert_eq!(ended, 1);
    }

    #[test]
    fn test_await_sequence_failure_aborts() {
        let (tx, rx) = mpsc::channel();
        tx.send(StillEvent::Completed(CaptureResult::default())).unwrap();
        tx.send(StillEvent::Failed {
            index: 1,
            reason: "sensor".into(),
        })
        .unwrap();
        let err = await_sequence(&rx, 3, Duration::from_secs(1), || {}).unwrap_err();
        assert_eq!(err.code, ErrorCode::TakePhotoCaptureFailed);
    }

    #[test]
    fn test_await_sequence_times_out() {
        let (_tx, rx) = mpsc::channel::<StillEvent>();
        let err = await_sequence(&rx, 1, Duration::from_millis(20), || {}).unwrap_err();
        assert_eq!(err.code, ErrorCode::TimeOut);
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands driving a rig of simulated cameras
//!
//! Every command builds a [`CaptureOrchestrator`] over the
//! [`SimulatedDriver`], runs the blocking rig calls on tokio's blocking
//! pool and awaits their callbacks with a timeout.

use pano_rig::backends::camera::behavior;
use pano_rig::backends::camera::{
    Callback, CameraBehavior, CameraEnvParams, CaptureOrchestrator, CaptureSize,
    ChangeResolutionListener, OutputTarget, ResolutionRequest, SimulatedConfig, SimulatedDriver,
};
use pano_rig::config::RigConfig;
use pano_rig::errors::RigResult;
use pano_rig::pipelines::photo::{OutputFormat, PhotoParams, TakePhotoListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Preview geometry shared by the commands
#[derive(Debug, Clone, Copy)]
pub struct PreviewArgs {
    pub cameras: usize,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

fn build_rig(config: RigConfig, cameras: usize) -> Arc<CaptureOrchestrator> {
    let driver = SimulatedDriver::new(SimulatedConfig::default());
    Arc::new(CaptureOrchestrator::new(Arc::new(driver), cameras, config))
}

/// Await a callback result, mapping an elapsed wait to an error
async fn await_result<T>(rx: oneshot::Receiver<RigResult<T>>, wait: Duration) -> Result<T, String> {
    match tokio::time::timeout(wait, rx).await {
        Ok(Ok(result)) => result.map_err(|e| e.to_string()),
        Ok(Err(_)) => Err("callback dropped without a result".to_string()),
        Err(_) => Err(format!("no result within {} ms", wait.as_millis())),
    }
}

async fn open_preview(rig: &Arc<CaptureOrchestrator>, args: PreviewArgs) -> Result<CameraBehavior, String> {
    let (listener, rx) = ChangeResolutionListener::channel();
    let request = ResolutionRequest::new("", args.width, args.height, args.fps);
    let worker = Arc::clone(rig);
    tokio::task::spawn_blocking(move || worker.change_resolution(request, listener))
        .await
        .map_err(|e| e.to_string())?;
    await_result(rx, wait_budget(rig.config())).await
}

fn wait_budget(config: &RigConfig) -> Duration {
    config.timeouts.stop_record() + config.timeouts.update_preview_barrier()
}

async fn release(rig: Arc<CaptureOrchestrator>) -> CliResult {
    tokio::task::spawn_blocking(move || rig.release()).await??;
    Ok(())
}

fn print_status(rig: &CaptureOrchestrator) {
    for pipeline in rig.pipelines() {
        let status = pipeline.status();
        println!(
            "  camera {}: {:?}, previewing={}, exposure={:?} ns",
            pipeline.index(),
            status.state,
            status.previewing,
            status.metered_exposure_ns
        );
    }
}

/// Open the rig preview and report the resulting behavior
pub async fn preview(config: RigConfig, args: PreviewArgs) -> CliResult {
    let rig = build_rig(config, args.cameras);
    println!(
        "Opening {} cameras at {}x{}@{}",
        args.cameras, args.width, args.height, args.fps
    );

    let behavior = open_preview(&rig, args).await?;
    println!("Preview running ({})", behavior);
    print_status(&rig);
    release(rig).await
}

/// Capture into simulated encoder targets for `seconds`
pub async fn capture(config: RigConfig, args: PreviewArgs, seconds: u64, exclusive: bool) -> CliResult {
    let rig = build_rig(config, args.cameras);
    open_preview(&rig, args).await?;

    let targets: Vec<OutputTarget> = (0..args.cameras)
        .map(|i| OutputTarget::new(format!("encoder{}", i)))
        .collect();
    let override_size = exclusive.then_some(CaptureSize::SQUARE_940_60);
    let (callback, rx) = Callback::channel();
    let worker = Arc::clone(&rig);
    let dispatched = tokio::task::spawn_blocking(move || {
        worker.start_capture(&targets, !exclusive, callback, override_size)
    })
    .await?;
    await_result(rx, wait_budget(rig.config())).await?;
    println!("Capturing (dispatched={}, in capture={})", dispatched, rig.is_in_capture());

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let worker = Arc::clone(&rig);
    tokio::task::spawn_blocking(move || worker.stop_capture(true, true)).await??;
    println!("Capture stopped, previewing={}", rig.is_camera_previewing());
    release(rig).await
}

struct PrintListener {
    done: std::sync::Mutex<Option<oneshot::Sender<RigResult<PathBuf>>>>,
}

impl TakePhotoListener for PrintListener {
    fn on_take_photo_start(&self, index: usize) {
        println!("  exposure {} ...", index);
    }

    fn on_capture_photo_end(&self) {
        println!("  capture finished, processing");
    }

    fn on_take_photo_complete(&self, result: RigResult<PathBuf>) {
        let sender = self
            .done
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

/// Take a single still, or an HDR bracket of `hdr_count` exposures
pub async fn photo(
    config: RigConfig,
    args: PreviewArgs,
    hdr_count: Option<usize>,
    output: Option<PathBuf>,
    keep_sources: bool,
    dng: bool,
) -> CliResult {
    let rig = build_rig(config, args.cameras);
    open_preview(&rig, args).await?;

    let (tx, rx) = oneshot::channel();
    let listener = Arc::new(PrintListener {
        done: std::sync::Mutex::new(Some(tx)),
    });
    let params = PhotoParams {
        hdr_count,
        output_dir: output,
        keep_hdr_sources: keep_sources.then_some(true),
        format: if dng { OutputFormat::Dng } else { OutputFormat::Jpeg },
        ..PhotoParams::default()
    };

    let handle = rig.take_photo(params, listener);
    let wait = rig.config().timeouts.still_frame() * 10 + rig.config().timeouts.stack_file_ready();
    let result = await_result(rx, wait).await;
    if let Some(handle) = handle {
        tokio::task::spawn_blocking(move || handle.join())
            .await?
            .map_err(|_| "photo worker panicked")?;
    }
    let path = result?;
    println!("Saved {}", path.display());
    release(rig).await
}

/// Print the behavior a resolution change would take
pub fn resolve(current: Option<CameraEnvParams>, requested: CameraEnvParams, force: bool) -> CliResult {
    let mut env = current;
    let behavior = behavior::resolve(&mut env, &requested, force);
    println!("{}", behavior);
    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &RigConfig) -> CliResult {
    println!("{}", config.to_json()?);
    Ok(())
}

/// Parse `id,width,height,fps`
pub fn parse_env(s: &str) -> Result<CameraEnvParams, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [id, width, height, fps] = parts.as_slice() else {
        return Err(format!("expected id,width,height,fps, got '{}'", s));
    };
    let number = |v: &str| v.parse::<u32>().map_err(|e| format!("invalid number '{}': {}", v, e));
    Ok(CameraEnvParams::new(*id, number(*width)?, number(*height)?, number(*fps)?))
}

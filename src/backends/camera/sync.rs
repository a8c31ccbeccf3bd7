// SPDX-License-Identifier: GPL-3.0-only

//! Multi-camera fan-out / fan-in
//!
//! One logical rig operation is dispatched to every pipeline, highest index
//! first, and the per-camera completions are merged back into a single
//! [`Callback`]. Camera 0 is the timing anchor, so it is always started last.

use super::callback::Callback;
use super::lock;
use super::pipeline::CameraPipeline;
use crate::errors::{ErrorCode, RigError, RigResult};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// One-shot gate a thread can wait on with a bound
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        *lock(&self.open) = true;
        self.cond.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.open)
    }

    /// Wait until opened, returns false on timeout
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.open);
        match self.cond.wait_timeout_while(guard, timeout, |open| !*open) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

/// Merges `expected` branch results into one callback
///
/// The callback fires exactly once: when the last branch reports, or
/// earlier through [`FanIn::abort`]. The first recorded error wins.
pub struct FanIn {
    expected: usize,
    completed: AtomicUsize,
    error: Mutex<Option<RigError>>,
    callback: Mutex<Option<Callback>>,
}

impl FanIn {
    pub fn new(expected: usize, callback: Callback) -> Arc<Self> {
        let fan = Arc::new(Self {
            expected,
            completed: AtomicUsize::new(0),
            error: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        });
        if expected == 0 {
            fan.fire();
        }
        fan
    }

    pub fn record(&self, result: RigResult<()>) {
        if let Err(err) = result {
            self.keep_first_error(err);
        }
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if done == self.expected {
            self.fire();
        }
    }

    /// Whether every expected branch has reported
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire) >= self.expected
    }

    /// Fail the aggregate now; later branch results are ignored
    pub fn abort(&self, err: RigError) {
        self.keep_first_error(err);
        self.fire();
    }

    /// Callback feeding one branch result into this aggregate
    pub fn branch(self: &Arc<Self>) -> Callback {
        let fan = Arc::clone(self);
        Callback::new(move |result| fan.record(result))
    }

    fn keep_first_error(&self, err: RigError) {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            *slot = Some(err);
        } else {
            debug!(error = %err, "Dropping later branch error");
        }
    }

    fn fire(&self) {
        let Some(callback) = lock(&self.callback).take() else {
            return;
        };
        match lock(&self.error).clone() {
            Some(err) => callback.error(err),
            None => callback.success(),
        }
    }
}

/// Dispatches rig operations across the ordered pipeline array
#[derive(Clone)]
pub struct SyncCoordinator {
    pipelines: Arc<[Arc<CameraPipeline>]>,
    barrier_timeout: Duration,
}

impl SyncCoordinator {
    pub fn new(pipelines: Vec<Arc<CameraPipeline>>, barrier_timeout: Duration) -> Self {
        Self {
            pipelines: pipelines.into(),
            barrier_timeout,
        }
    }

    pub fn pipelines(&self) -> &[Arc<CameraPipeline>] {
        &self.pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Run `op` on every pipeline in descending index order, merged into `callback`
    pub fn dispatch<F>(&self, callback: Callback, op: F)
    where
        F: Fn(&CameraPipeline, Callback),
    {
        let fan = FanIn::new(self.pipelines.len(), callback);
        for pipeline in self.pipelines.iter().rev() {
            op(pipeline, fan.branch());
        }
    }

    /// Update the repeating request of every pipeline with the ordering barrier
    ///
    /// With two or more cameras, camera 0 is only dispatched after camera 1
    /// confirmed its first frame. If camera 1 does not confirm within the
    /// barrier timeout the aggregate fails and camera 0 is left untouched.
    pub fn update_preview(&self, callback: Callback, skip_frames: u32) {
        let count = self.pipelines.len();
        let fan = FanIn::new(count, callback);
        if count < 2 {
            for pipeline in self.pipelines.iter() {
                pipeline.update_preview(Some(fan.branch()), skip_frames);
            }
            return;
        }

        for pipeline in self.pipelines[2..].iter().rev() {
            pipeline.update_preview(Some(fan.branch()), skip_frames);
        }

        let barrier = Arc::new(Latch::new());
        let gate = Arc::clone(&barrier);
        let branch = fan.branch();
        self.pipelines[1].update_preview(
            Some(Callback::new(move |result| {
                branch.complete(result);
                gate.open();
            })),
            skip_frames,
        );

        if !barrier.wait(self.barrier_timeout) {
            warn!(
                timeout_ms = self.barrier_timeout.as_millis() as u64,
                "Camera 1 missed the update preview barrier"
            );
            fan.abort(RigError::new(
                ErrorCode::CameraSessionUpdateFailed,
                "camera 1 did not confirm preview in time",
            ));
            return;
        }

        debug!("Update preview barrier passed");
        self.pipelines[0].update_preview(Some(fan.branch()), skip_frames);
    }

    /// Run a session phase on every pipeline, then the barrier update
    ///
    /// The update phase runs on a helper thread so no pipeline context ever
    /// blocks on the barrier.
    pub fn dispatch_then_update<F>(&self, callback: Callback, skip_frames: u32, op: F)
    where
        F: Fn(&CameraPipeline, Callback),
    {
        let coordinator = self.clone();
        let then_update = Callback::new(move |result| match result {
            Ok(()) => hand_off(
                callback,
                move |callback| coordinator.update_preview(callback, skip_frames),
                |job| {
                    thread::Builder::new()
                        .name("rig-update-preview".into())
                        .spawn(job)
                        .map(drop)
                },
            ),
            Err(err) => callback.error(err),
        });
        self.dispatch(then_update, op);
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Run `work` through `spawn`, failing `callback` if the job never starts
fn hand_off<W, S>(callback: Callback, work: W, spawn: S)
where
    W: FnOnce(Callback) + Send + 'static,
    S: FnOnce(Job) -> io::Result<()>,
{
    let slot = Arc::new(Mutex::new(Some(callback)));
    let job_slot = Arc::clone(&slot);
    let job: Job = Box::new(move || {
        if let Some(callback) = lock(&job_slot).take() {
            work(callback);
        }
    });

    if let Err(e) = spawn(job) {
        warn!(error = %e, "Failed to spawn update preview thread");
        if let Some(callback) = lock(&slot).take() {
            callback.error(RigError::new(
                ErrorCode::Unknown,
                format!("failed to spawn update preview thread: {}", e),
            ));
        }
    }
}

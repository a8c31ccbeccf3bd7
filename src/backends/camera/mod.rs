// SPDX-License-Identifier: MPL-2.0

//! Camera backend abstraction
//!
//! The physical driver is consumed through three narrow traits. Everything
//! above them is driver agnostic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ CaptureOrchestrator  │  ← capture start/stop, resolution changes
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │   SyncCoordinator    │  ← fan-out / fan-in, camera 1 before camera 0
//! └──────────┬───────────┘
//!            │
//!     ┌──────┴──────┐
//!     ▼             ▼
//! ┌────────┐   ┌────────┐
//! │Pipeline│   │Pipeline│  ← one executor thread per camera
//! └───┬────┘   └───┬────┘
//!     ▼            ▼
//!  CameraDriver / CameraDevice / CaptureSession
//! ```
//!
//! Driver results come back asynchronously as [`DriverEvent`]s through an
//! [`EventSink`], which queues them on the owning pipeline's executor.

pub mod behavior;
pub mod callback;
pub mod capture_failure;
pub mod executor;
pub mod orchestrator;
pub mod pipeline;
pub mod simulated;
pub mod sync;
pub mod types;

pub use callback::{Callback, ChangeResolutionListener, CommonCallback};
pub use orchestrator::{CaptureOrchestrator, ResolutionRequest};
pub use pipeline::{CameraPipeline, PipelineStatus, StillEvent, StillSink, StillSpec};
pub use simulated::{DriverCall, SimulatedConfig, SimulatedDriver};
pub use sync::{FanIn, SyncCoordinator};
pub use types::*;

use crate::errors::DriverError;
use callback::Ticket;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Entry point of a camera driver
pub trait CameraDriver: Send + Sync {
    /// Start opening `camera_id`; the device arrives as [`DriverEvent::Opened`]
    fn open(&self, camera_id: &str, sink: EventSink) -> Result<(), DriverError>;
}

/// An opened camera device
pub trait CameraDevice: Send {
    fn id(&self) -> &str;

    /// Start building a session; it arrives as [`DriverEvent::SessionConfigured`]
    fn create_session(&mut self, config: SessionConfig, sink: EventSink)
    -> Result<(), DriverError>;

    /// Exposure limits of the sensor
    fn exposure_range(&self) -> ExposureRange;

    /// Whether a request list is captured in order without gaps
    fn supports_ordered_burst(&self) -> bool;

    fn close(&mut self);
}

/// A configured capture session
pub trait CaptureSession: Send {
    /// Replace the repeating request; each frame reports through `sink`
    fn set_repeating(&mut self, request: CaptureRequest, sink: EventSink)
    -> Result<(), DriverError>;

    /// Capture `requests` once, in order
    fn capture(&mut self, requests: Vec<CaptureRequest>, sink: EventSink)
    -> Result<(), DriverError>;

    fn close(&mut self);
}

/// Asynchronous driver results
pub enum DriverEvent {
    Opened(Box<dyn CameraDevice>),
    Disconnected,
    DeviceError(i32),
    SessionConfigured(Box<dyn CaptureSession>),
    SessionConfigureFailed(String),
    CaptureCompleted(CaptureResult),
    CaptureFailed { index: usize, reason: String },
    SequenceCompleted,
    SequenceAborted,
    ImageAvailable(FrameBuffer),
}

impl fmt::Debug for DriverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverEvent::Opened(device) => write!(f, "Opened({})", device.id()),
            DriverEvent::Disconnected => write!(f, "Disconnected"),
            DriverEvent::DeviceError(code) => write!(f, "DeviceError({})", code),
            DriverEvent::SessionConfigured(_) => write!(f, "SessionConfigured"),
            DriverEvent::SessionConfigureFailed(reason) => {
                write!(f, "SessionConfigureFailed({})", reason)
            }
            DriverEvent::CaptureCompleted(result) => write!(f, "CaptureCompleted({:?})", result),
            DriverEvent::CaptureFailed { index, reason } => {
                write!(f, "CaptureFailed({}, {})", index, reason)
            }
            DriverEvent::SequenceCompleted => write!(f, "SequenceCompleted"),
            DriverEvent::SequenceAborted => write!(f, "SequenceAborted"),
            DriverEvent::ImageAvailable(frame) => write!(f, "ImageAvailable({:?})", frame),
        }
    }
}

type Deliver = Arc<dyn Fn(Ticket, DriverEvent) + Send + Sync>;

/// Route for driver events back to the pipeline that issued the request
#[derive(Clone)]
pub struct EventSink {
    ticket: Ticket,
    deliver: Deliver,
}

impl EventSink {
    pub(crate) fn new(ticket: Ticket, deliver: Deliver) -> Self {
        Self { ticket, deliver }
    }

    pub fn emit(&self, event: DriverEvent) {
        (self.deliver)(self.ticket, event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("ticket", &self.ticket).finish()
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

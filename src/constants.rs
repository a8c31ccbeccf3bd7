// SPDX-License-Identifier: GPL-3.0-only

//! Rig-wide constants
//!
//! Timeouts here are defaults; [`crate::config::Timeouts`] carries the
//! values actually used at runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded wait for a camera to finish releasing
pub const CAMERA_RELEASE_TIMEOUT: Duration = Duration::from_millis(7000);

/// Bounded wait for capture sessions to stop and preview to come back
pub const STOP_RECORD_TIMEOUT: Duration = Duration::from_millis(8000);

/// Sleep between preview teardown and capture session creation
pub const CAPTURE_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Settle delay on the path that fully closes and reopens the devices
pub const CAPTURE_REOPEN_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Ordering barrier wait on pipeline 1 during update-preview
pub const UPDATE_PREVIEW_BARRIER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Total wait for all HDR source files to appear on disk
pub const STACK_FILE_READY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Poll interval while waiting for HDR source files
pub const STACK_FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded wait for a single still frame to be persisted
pub const STILL_FRAME_TIMEOUT: Duration = Duration::from_millis(3000);

/// Preview size used before any resolution has been requested
pub const DEFAULT_PREVIEW_SIZE: (u32, u32) = (1920, 960);

/// Preview frame rate used before any resolution has been requested
pub const DEFAULT_PREVIEW_FPS: u32 = 30;

/// Frame rate at or above which the high-speed session variant is used
pub const HIGH_FPS: u32 = 120;

/// Allowed timestamp drift between the two sensors, in milliseconds
pub const FRAME_SYNC_DELTA_MS: u64 = 5;

/// Transitional frames dropped after restoring preview from an HDR bracket
pub const HDR_SKIP_FRAME_COUNT: u32 = 2;

/// Default JPEG quality handed to the stacking engine
pub const HDR_DEFAULT_QUALITY: u32 = 95;

/// Camera id placeholder meaning "use the pipeline index"
pub const ASYNC_DOUBLE_CAMERA_ID: &str = "ASYNC_DOUBLE";

/// Capture failure detector limits
pub mod capture_failure {
    use std::time::Duration;

    /// Failures further apart than this restart detection
    pub const CHECK_WINDOW: Duration = Duration::from_secs(10);
    /// Failure count that, inside [`MANY_FAILED_SPACING`], counts as a flood
    pub const MAX_FAILED_COUNT: u32 = 30;
    /// Minimum spacing of failures that form a periodic pattern
    pub const INTERVAL_WINDOW: Duration = Duration::from_secs(8);
    /// Span in which [`MAX_FAILED_COUNT`] failures count as a flood
    pub const MANY_FAILED_SPACING: Duration = Duration::from_secs(3);
    /// Repeats of the same interval that count as periodic
    pub const MAX_INTERVAL_FAILED_COUNT: u32 = 2;
}

/// Sensor resolution class, selects the minimum exposure floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolutionClass {
    /// 5.7K-class modes
    #[default]
    Standard,
    /// 11K/12K-class modes with slower readout
    High,
}

impl ResolutionClass {
    pub const ALL: [ResolutionClass; 2] = [ResolutionClass::Standard, ResolutionClass::High];

    /// Minimum exposure the sensor accepts in this class, in nanoseconds
    pub fn min_exposure_ns(&self) -> u64 {
        match self {
            ResolutionClass::Standard => 65_232,
            ResolutionClass::High => 183_824,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ResolutionClass::Standard => "5.7K",
            ResolutionClass::High => "12K",
        }
    }
}

/// Widths at or above this use the high resolution class
pub const HIGH_RESOLUTION_MIN_WIDTH: u32 = 8000;

/// Get the resolution class for a still width
pub fn get_resolution_class(width: u32) -> ResolutionClass {
    if width >= HIGH_RESOLUTION_MIN_WIDTH {
        ResolutionClass::High
    } else {
        ResolutionClass::Standard
    }
}

/// Still output sizes used when (re)building the still consumer
pub mod still {
    /// Default still size per sensor
    pub const DEFAULT_SIZE: (u32, u32) = (5760, 2880);
    /// Large still size used when the consumer is force-reinitialized
    pub const LARGE_SIZE: (u32, u32) = (11968, 5984);
    /// Frames the still consumer may hold at once
    pub const MAX_IMAGES: u32 = 9;
}

/// Application information utilities
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}

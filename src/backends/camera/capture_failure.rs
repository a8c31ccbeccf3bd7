// SPDX-License-Identifier: GPL-3.0-only

//! Repeated capture failure detection
//!
//! Single capture failures are normal (dropped frames while the sensor
//! settles). Two patterns indicate a broken pipeline instead:
//!
//! - failures recurring at the same long interval (8-10 s apart)
//! - a flood of failures (30+) in a short span

use crate::constants::capture_failure::{
    CHECK_WINDOW, INTERVAL_WINDOW, MANY_FAILED_SPACING, MAX_FAILED_COUNT,
    MAX_INTERVAL_FAILED_COUNT,
};
use std::time::Instant;
use tracing::warn;

/// Why the monitor gave up on the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Failures keep arriving at a fixed interval
    Periodic,
    /// Too many failures in a short span
    Flood,
}

impl FailureVerdict {
    pub fn message(&self) -> &'static str {
        match self {
            FailureVerdict::Periodic => "capture failures at a regular interval",
            FailureVerdict::Flood => "capture failures flooding",
        }
    }
}

#[derive(Debug, Default)]
pub struct CaptureFailureMonitor {
    anchor: Option<Instant>,
    failed_count: u32,
    /// Whole seconds between anchor and failure of the current periodic pattern
    interval_secs: Option<u64>,
    interval_count: u32,
}

impl CaptureFailureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// Record a failure at `now`; `Some` means the pipeline should be reported broken
    pub fn record_failure(&mut self, now: Instant) -> Option<FailureVerdict> {
        let Some(anchor) = self.anchor else {
            self.anchor = Some(now);
            self.failed_count += 1;
            return None;
        };

        let elapsed = now.saturating_duration_since(anchor);
        let secs = (elapsed.as_millis() as f64 / 1000.0).round() as u64;

        if secs > CHECK_WINDOW.as_secs() {
            self.reset();
        } else if secs >= INTERVAL_WINDOW.as_secs() {
            match self.interval_secs {
                None => {
                    self.interval_secs = Some(secs);
                    self.interval_count = 1;
                }
                Some(previous) if previous == secs => {
                    self.interval_count += 1;
                    if self.interval_count >= MAX_INTERVAL_FAILED_COUNT {
                        warn!(interval_secs = secs, "Periodic capture failures");
                        return Some(FailureVerdict::Periodic);
                    }
                }
                Some(_) => {}
            }
            self.anchor = Some(now);
        } else if secs <= MANY_FAILED_SPACING.as_secs() && self.failed_count >= MAX_FAILED_COUNT {
            warn!(count = self.failed_count, "Capture failure flood");
            return Some(FailureVerdict::Flood);
        }

        self.failed_count += 1;
        None
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

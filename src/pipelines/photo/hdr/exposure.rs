// SPDX-License-Identifier: GPL-3.0-only

//! Exposure bracket computation
//!
//! The metered preview exposure is multiplied by a fixed scale table and
//! clamped into what the sensor accepts at the current resolution.

use crate::backends::camera::types::ExposureRange;
use crate::constants::ResolutionClass;
use crate::errors::{ErrorCode, RigError, RigResult};
use tracing::debug;

/// Bracket sizes with a scale table
pub const SUPPORTED_COUNTS: [usize; 4] = [3, 5, 7, 9];

const SCALES_3: [f64; 3] = [1.0 / 4.0, 1.0, 4.0];
const SCALES_5: [f64; 5] = [1.0 / 3.0, 1.0 / 1.5, 1.0, 1.5, 3.0];
const SCALES_7: [f64; 7] = [1.0 / 3.0, 1.0 / 2.0, 1.0 / 1.5, 1.0, 1.5, 2.0, 3.0];
const SCALES_9: [f64; 9] = [
    1.0 / 3.0,
    1.0 / 2.5,
    1.0 / 2.0,
    1.0 / 1.5,
    1.0,
    1.5,
    2.0,
    2.5,
    3.0,
];

/// Scale table for a bracket of `count` exposures
pub fn scale_table(count: usize) -> Option<&'static [f64]> {
    match count {
        3 => Some(&SCALES_3),
        5 => Some(&SCALES_5),
        7 => Some(&SCALES_7),
        9 => Some(&SCALES_9),
        _ => None,
    }
}

/// Immutable exposure plan of one HDR capture
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureBracket {
    pub count: usize,
    pub base_exposure_ns: u64,
    pub scales: &'static [f64],
    /// Unclamped exposures in nanoseconds
    pub raw_ns: Vec<f64>,
    /// Exposures submitted to the sensor, in nanoseconds
    pub targets_ns: Vec<u64>,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl ExposureBracket {
    /// Compute the bracket around `base_exposure_ns`
    ///
    /// The lower clamp is the larger of the device minimum and the floor of
    /// `class`. `compensate` scales every raw value before clamping.
    pub fn compute(
        count: usize,
        base_exposure_ns: u64,
        range: ExposureRange,
        class: ResolutionClass,
        compensate: Option<f64>,
    ) -> RigResult<Self> {
        let scales = scale_table(count).ok_or_else(|| {
            RigError::new(
                ErrorCode::Unknown,
                format!("unsupported HDR count {}, expected one of {:?}", count, SUPPORTED_COUNTS),
            )
        })?;

        let compensate = compensate.filter(|c| c.is_finite() && *c > 0.0).unwrap_or(1.0);
        let max_ns = range.max_ns;
        let min_ns = range.min_ns.max(class.min_exposure_ns()).min(max_ns);

        let raw_ns: Vec<f64> = scales
            .iter()
            .map(|scale| base_exposure_ns as f64 * scale * compensate)
            .collect();
        let targets_ns = raw_ns
            .iter()
            .map(|raw| (*raw as u64).clamp(min_ns, max_ns))
            .collect();

        let bracket = Self {
            count,
            base_exposure_ns,
            scales,
            raw_ns,
            targets_ns,
            min_ns,
            max_ns,
        };
        debug!(
            count,
            base_exposure_ns,
            compensate,
            targets = ?bracket.targets_ns,
            "Computed exposure bracket"
        );
        Ok(bracket)
    }

    /// Index of the unscaled exposure
    pub fn middle_index(&self) -> usize {
        self.count / 2
    }
}

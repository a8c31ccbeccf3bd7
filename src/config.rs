// SPDX-License-Identifier: GPL-3.0-only

use crate::constants;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment override for [`Timeouts::camera_release_ms`]
pub const ENV_RELEASE_TIMEOUT: &str = "PANO_RIG_RELEASE_TIMEOUT_MS";
/// Environment override for [`Timeouts::stop_record_ms`]
pub const ENV_STOP_RECORD_TIMEOUT: &str = "PANO_RIG_STOP_RECORD_TIMEOUT_MS";

/// Bounded waits used across the rig, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub camera_release_ms: u64,
    pub stop_record_ms: u64,
    pub capture_settle_ms: u64,
    pub capture_reopen_settle_ms: u64,
    pub update_preview_barrier_ms: u64,
    pub stack_file_ready_ms: u64,
    pub still_frame_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            camera_release_ms: constants::CAMERA_RELEASE_TIMEOUT.as_millis() as u64,
            stop_record_ms: constants::STOP_RECORD_TIMEOUT.as_millis() as u64,
            capture_settle_ms: constants::CAPTURE_SETTLE_DELAY.as_millis() as u64,
            capture_reopen_settle_ms: constants::CAPTURE_REOPEN_SETTLE_DELAY.as_millis() as u64,
            update_preview_barrier_ms: constants::UPDATE_PREVIEW_BARRIER_TIMEOUT.as_millis()
                as u64,
            stack_file_ready_ms: constants::STACK_FILE_READY_TIMEOUT.as_millis() as u64,
            still_frame_ms: constants::STILL_FRAME_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Timeouts {
    pub fn camera_release(&self) -> Duration {
        Duration::from_millis(self.camera_release_ms)
    }

    pub fn stop_record(&self) -> Duration {
        Duration::from_millis(self.stop_record_ms)
    }

    pub fn capture_settle(&self) -> Duration {
        Duration::from_millis(self.capture_settle_ms)
    }

    pub fn capture_reopen_settle(&self) -> Duration {
        Duration::from_millis(self.capture_reopen_settle_ms)
    }

    pub fn update_preview_barrier(&self) -> Duration {
        Duration::from_millis(self.update_preview_barrier_ms)
    }

    pub fn stack_file_ready(&self) -> Duration {
        Duration::from_millis(self.stack_file_ready_ms)
    }

    pub fn still_frame(&self) -> Duration {
        Duration::from_millis(self.still_frame_ms)
    }

    /// All timeouts set to `ms`, handy for tests that must not wait long
    pub fn uniform(ms: u64) -> Self {
        Self {
            camera_release_ms: ms,
            stop_record_ms: ms,
            capture_settle_ms: ms,
            capture_reopen_settle_ms: ms,
            update_preview_barrier_ms: ms,
            stack_file_ready_ms: ms,
            still_frame_ms: ms,
        }
    }
}

/// HDR bracket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdrSettings {
    /// Keep the per-bracket source frames next to the stacked output
    pub keep_sources: bool,
    /// Use an ordered burst when the device supports it
    pub prefer_burst: bool,
    /// Output quality passed to the stacking engine
    pub quality: u32,
    /// Generate and inject a thumbnail into the stacked output
    pub thumbnail: bool,
}

impl Default for HdrSettings {
    fn default() -> Self {
        Self {
            keep_sources: false,
            prefer_burst: true,
            quality: constants::HDR_DEFAULT_QUALITY,
            thumbnail: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub timeouts: Timeouts,
    pub hdr: HdrSettings,
    /// Lock the preview frame rate to the sensor default
    pub lock_default_preview_fps: bool,
    /// Treat every non-OPEN resolution change as a full SWITCH
    pub force_switch_on_resolution_change: bool,
    /// Photo output directory, defaults to the user's pictures dir
    pub output_dir: Option<PathBuf>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            hdr: HdrSettings::default(),
            lock_default_preview_fps: false,
            force_switch_on_resolution_change: false,
            output_dir: None,
        }
    }
}

impl RigConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pano-rig").join("config.json"))
    }

    /// Load a config from a JSON file
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let config: RigConfig = serde_json::from_str(&text)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
        info!(path = %path.display(), "Loaded rig config");
        Ok(config)
    }

    /// Load from the default location, falling back to defaults,
    /// then apply environment overrides
    pub fn load_or_default() -> Self {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                warn!(error = %e, "Using default rig config");
                Self::default()
            }),
            _ => {
                debug!("No rig config file, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply timeout overrides looked up through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| {
            let value = lookup(key)?;
            match value.trim().parse::<u64>() {
                Ok(ms) => Some(ms),
                Err(_) => {
                    warn!(key, value = %value, "Ignoring invalid timeout override");
                    None
                }
            }
        };
        if let Some(ms) = parse(ENV_RELEASE_TIMEOUT) {
            self.timeouts.camera_release_ms = ms;
        }
        if let Some(ms) = parse(ENV_STOP_RECORD_TIMEOUT) {
            self.timeouts.stop_record_ms = ms;
        }
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))
    }

    /// Directory photos are written to
    pub fn photo_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(crate::storage::default_photo_dir)
    }
}

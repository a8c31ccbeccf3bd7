// SPDX-License-Identifier: GPL-3.0-only

//! Resolution change planning
//!
//! | current vs requested                      | behavior        |
//! |-------------------------------------------|-----------------|
//! | no current env, or empty camera id        | OPEN            |
//! | camera id, fps or fps lock differs        | SWITCH          |
//! | only width, height or capture mode differ | START_PREVIEW   |
//! | nothing differs                           | UPDATE_PREVIEW  |

use super::types::{CameraBehavior, CameraEnvParams};
use tracing::debug;

/// Decide how to move from `current` to `requested`, then store `requested`
///
/// `force_change` turns an UPDATE_PREVIEW into START_PREVIEW so the session
/// is rebuilt even when nothing differs.
pub fn resolve(
    current: &mut Option<CameraEnvParams>,
    requested: &CameraEnvParams,
    force_change: bool,
) -> CameraBehavior {
    let behavior = match current.as_ref() {
        None => CameraBehavior::Open,
        Some(env) if env.camera_id.is_empty() => CameraBehavior::Open,
        Some(env)
            if env.camera_id != requested.camera_id
                || env.fps != requested.fps
                || env.lock_default_preview_fps != requested.lock_default_preview_fps =>
        {
            CameraBehavior::Switch
        }
        Some(env)
            if env.width != requested.width
                || env.height != requested.height
                || env.capture_mode != requested.capture_mode =>
        {
            CameraBehavior::StartPreview
        }
        Some(_) if force_change => CameraBehavior::StartPreview,
        Some(_) => CameraBehavior::UpdatePreview,
    };

    debug!(
        camera = %requested.camera_id,
        width = requested.width,
        height = requested.height,
        fps = requested.fps,
        %behavior,
        "Resolved camera behavior"
    );

    *current = Some(requested.clone());
    behavior
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::CaptureMode;

    fn env(id: &str, w: u32, h: u32, fps: u32) -> CameraEnvParams {
        CameraEnvParams::new(id, w, h, fps)
    }

    #[test]
    fn test_no_env_opens() {
        let mut current = None;
        let requested = env("2", 1920, 1080, 30);
        assert_eq!(resolve(&mut current, &requested, false), CameraBehavior::Open);
        assert_eq!(current, Some(requested));
    }

    #[test]
    fn test_empty_camera_id_opens() {
        let mut current = Some(env("", 1920, 1080, 30));
        assert_eq!(
            resolve(&mut current, &env("0", 1920, 1080, 30), false),
            CameraBehavior::Open
        );
    }

    #[test]
    fn test_same_params_updates_preview() {
        let mut current = Some(env("2", 1920, 1080, 30));
        assert_eq!(
            resolve(&mut current, &env("2", 1920, 1080, 30), false),
            CameraBehavior::UpdatePreview
        );
    }

    #[test]
    fn test_force_change_restarts_preview() {
        let mut current = Some(env("2", 1920, 1080, 30));
        assert_eq!(
            resolve(&mut current, &env("2", 1920, 1080, 30), true),
            CameraBehavior::StartPreview
        );
    }

    #[test]
    fn test_switch_on_id_fps_or_lock() {
        let mut current = Some(env("0", 1920, 1080, 30));
        assert_eq!(
            resolve(&mut current, &env("1", 1920, 1080, 30), false),
            CameraBehavior::Switch
        );
        assert_eq!(
            resolve(&mut current, &env("1", 1920, 1080, 60), false),
            CameraBehavior::Switch
        );
        let mut locked = env("1", 1920, 1080, 60);
        locked.lock_default_preview_fps = true;
        assert_eq!(resolve(&mut current, &locked, false), CameraBehavior::Switch);
    }

    #[test]
    fn test_size_or_mode_restarts_preview() {
        let mut current = Some(env("0", 1920, 1080, 30));
        assert_eq!(
            resolve(&mut current, &env("0", 3840, 1920, 30), false),
            CameraBehavior::StartPreview
        );
        let photo = env("0", 3840, 1920, 30).with_capture_mode(CaptureMode::Photo);
        assert_eq!(resolve(&mut current, &photo, false), CameraBehavior::StartPreview);
        assert_eq!(current.map(|e| e.capture_mode), Some(CaptureMode::Photo));
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Error types for the capture rig
//!
//! Every asynchronous operation completes with either success or a
//! [`RigError`], which pairs a stable numeric [`ErrorCode`] with a
//! human readable message. The numeric codes are what callers log and
//! compare; messages are for diagnostics only.

use std::fmt;

/// Result type alias using RigError
pub type RigResult<T> = Result<T, RigError>;

/// Stable error taxonomy shared by every pipeline operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Catch-all, also used for a cancelled capture start
    Unknown,
    /// Component used before initialization
    NotInit,
    /// An operation did not complete in its bounded wait
    TimeOut,
    /// Operation on an already released rig
    AlreadyReleased,
    /// No open camera device
    CameraNotOpened,
    /// No capture session exists for the request
    CameraSessionNotCreate,
    /// The device rejected the session configuration
    CameraSessionConfigureFailed,
    /// The synchronized update-preview phase failed
    CameraSessionUpdateFailed,
    /// Capture failures repeated beyond the tolerated rate
    CameraManyCaptureFailed,
    /// A still capture failed
    TakePhotoCaptureFailed,
    /// The stacking engine rejected an input image
    HdrPhotoStackFailed,
    /// An HDR source file could not be decoded
    HdrPhotoStackBitmap,
    /// Fewer HDR source files than the bracket size
    HdrPhotoLose,
    /// Preview could not be restored after an HDR bracket
    HdrPhotoRestorePreviewError,
    /// The capture output target is not usable
    RecordCameraOutSurfaceIllegal,
    /// Raw status code returned by the stacking engine
    Engine(i32),
}

impl ErrorCode {
    /// Numeric code reported to callers
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::Unknown => -1,
            ErrorCode::NotInit => 1,
            ErrorCode::TimeOut => 5,
            ErrorCode::AlreadyReleased => 10,
            ErrorCode::CameraNotOpened => 20,
            ErrorCode::CameraSessionNotCreate => 21,
            ErrorCode::CameraSessionConfigureFailed => 22,
            ErrorCode::CameraSessionUpdateFailed => 23,
            ErrorCode::CameraManyCaptureFailed => 24,
            ErrorCode::TakePhotoCaptureFailed => 31,
            ErrorCode::HdrPhotoStackFailed => 35,
            ErrorCode::HdrPhotoStackBitmap => 36,
            ErrorCode::HdrPhotoLose => 37,
            ErrorCode::HdrPhotoRestorePreviewError => 38,
            ErrorCode::RecordCameraOutSurfaceIllegal => 41,
            ErrorCode::Engine(code) => *code,
        }
    }

    /// Symbolic name as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "UN_KNOWN",
            ErrorCode::NotInit => "NOT_INIT",
            ErrorCode::TimeOut => "TIME_OUT",
            ErrorCode::AlreadyReleased => "ALREADY_RELEASE",
            ErrorCode::CameraNotOpened => "CAMERA_NOT_OPENED",
            ErrorCode::CameraSessionNotCreate => "CAMERA_SESSION_NOT_CREATE",
            ErrorCode::CameraSessionConfigureFailed => "CAMERA_SESSION_CONFIGURE_FAILED",
            ErrorCode::CameraSessionUpdateFailed => "CAMERA_SESSION_UPDATE_FAILED",
            ErrorCode::CameraManyCaptureFailed => "CAMERA_MANY_CAPTURE_FAILED",
            ErrorCode::TakePhotoCaptureFailed => "TAKE_PHOTO_CAPTURE_FAILED",
            ErrorCode::HdrPhotoStackFailed => "HDR_PHOTO_STACK_FAILED",
            ErrorCode::HdrPhotoStackBitmap => "HDR_PHOTO_STACK_BITMAP",
            ErrorCode::HdrPhotoLose => "HDR_PHOTO_LOSE",
            ErrorCode::HdrPhotoRestorePreviewError => "HDR_PHOTO_RESTORE_PREVIEW_ERROR",
            ErrorCode::RecordCameraOutSurfaceIllegal => "RECORD_CAMERA_OUT_SURFACE_ILLEGAL",
            ErrorCode::Engine(_) => "ENGINE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Error delivered to completion callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigError {
    pub code: ErrorCode,
    pub message: String,
}

impl RigError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Numeric code, shorthand for `self.code.code()`
    pub fn code(&self) -> i32 {
        self.code.code()
    }
}

impl fmt::Display for RigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for RigError {}

impl From<ErrorCode> for RigError {
    fn from(code: ErrorCode) -> Self {
        RigError::new(code, "")
    }
}

/// Errors raised synchronously by a camera driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The device is disconnected or in use by another client
    Access(String),
    /// The session or device handle is no longer valid
    Closed,
    /// An output target was rejected
    InvalidTarget(String),
    /// Any other driver failure
    Other(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Access(msg) => write!(f, "Camera access error: {}", msg),
            DriverError::Closed => write!(f, "Handle already closed"),
            DriverError::InvalidTarget(msg) => write!(f, "Invalid output target: {}", msg),
            DriverError::Other(msg) => write!(f, "Driver error: {}", msg),
        }
    }
}

impl std::error::Error for DriverError {}

// Conversions for I/O and codec errors raised while persisting frames
impl From<std::io::Error> for RigError {
    fn from(err: std::io::Error) -> Self {
        RigError::new(ErrorCode::TakePhotoCaptureFailed, err.to_string())
    }
}

impl From<image::ImageError> for RigError {
    fn from(err: image::ImageError) -> Self {
        RigError::new(ErrorCode::HdrPhotoStackBitmap, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_codes() {
        assert_eq!(ErrorCode::Unknown.code(), -1);
        assert_eq!(ErrorCode::CameraNotOpened.code(), 20);
        assert_eq!(ErrorCode::CameraSessionUpdateFailed.code(), 23);
        assert_eq!(ErrorCode::HdrPhotoLose.code(), 37);
        assert_eq!(ErrorCode::Engine(-7).code(), -7);
    }

    #[test]
    fn test_display_includes_name_and_message() {
        let err = RigError::new(ErrorCode::TimeOut, "release");
        assert_eq!(err.to_string(), "TIME_OUT(5): release");
        let bare: RigError = ErrorCode::NotInit.into();
        assert_eq!(bare.to_string(), "NOT_INIT(1)");
    }
}

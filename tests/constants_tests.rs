// SPDX-License-Identifier: MPL-2.0

//! Integration tests for constants module

use pano_rig::constants::{self, ResolutionClass, get_resolution_class};
use pano_rig::errors::{ErrorCode, RigError};

#[test]
fn test_resolution_class_values() {
    assert_eq!(ResolutionClass::ALL.len(), 2);
    assert_eq!(ResolutionClass::default(), ResolutionClass::Standard);
}

#[test]
fn test_exposure_floor_ordering() {
    // Slower readout needs a longer minimum exposure
    assert!(
        ResolutionClass::High.min_exposure_ns() > ResolutionClass::Standard.min_exposure_ns(),
        "High resolution floor must exceed the standard floor"
    );
    assert_eq!(ResolutionClass::Standard.min_exposure_ns(), 65_232);
    assert_eq!(ResolutionClass::High.min_exposure_ns(), 183_824);
}

#[test]
fn test_resolution_class_from_width() {
    assert_eq!(get_resolution_class(constants::still::DEFAULT_SIZE.0), ResolutionClass::Standard);
    assert_eq!(get_resolution_class(constants::still::LARGE_SIZE.0), ResolutionClass::High);
    assert_eq!(
        get_resolution_class(constants::HIGH_RESOLUTION_MIN_WIDTH),
        ResolutionClass::High
    );
}

#[test]
fn test_resolution_class_display_names() {
    for class in ResolutionClass::ALL {
        assert!(!class.display_name().is_empty());
    }
}

#[test]
fn test_timeout_defaults_are_bounded() {
    assert!(constants::CAPTURE_REOPEN_SETTLE_DELAY < constants::CAPTURE_SETTLE_DELAY);
    assert!(constants::STACK_FILE_POLL_INTERVAL < constants::STACK_FILE_READY_TIMEOUT);
    assert!(constants::UPDATE_PREVIEW_BARRIER_TIMEOUT < constants::STOP_RECORD_TIMEOUT);
}

#[test]
fn test_error_codes() {
    assert_eq!(ErrorCode::Unknown.code(), -1);
    assert_eq!(ErrorCode::TimeOut.code(), 5);
    assert_eq!(ErrorCode::CameraSessionUpdateFailed.code(), 23);
    assert_eq!(ErrorCode::HdrPhotoLose.code(), 37);
    assert_eq!(ErrorCode::RecordCameraOutSurfaceIllegal.code(), 41);
    // engine status codes pass through untouched
    assert_eq!(ErrorCode::Engine(-17).code(), -17);
}

#[test]
fn test_error_display_includes_name_and_message() {
    let err = RigError::new(ErrorCode::CameraNotOpened, "camera 1 lost");
    assert_eq!(err.code(), 20);
    assert_eq!(err.to_string(), "CAMERA_NOT_OPENED(20): camera 1 lost");

    let bare: RigError = ErrorCode::AlreadyReleased.into();
    assert_eq!(bare.to_string(), "ALREADY_RELEASE(10)");
}

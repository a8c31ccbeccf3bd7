// SPDX-License-Identifier: MPL-2.0

//! pano-rig: control of a synchronized multi-camera panoramic rig
//!
//! # Architecture
//!
//! - [`backends`]: camera driver traits, per-camera pipelines, the fan-in
//!   coordinator and the rig orchestrator
//! - [`pipelines`]: still photo and HDR bracket capture with stacking
//! - [`config`]: user configuration and timeout overrides
//! - [`storage`]: photo directories and HDR bracket layout
//! - [`errors`]: error codes shared by every callback
//!
//! # Example
//!
//! ```no_run
//! use pano_rig::backends::camera::{
//!     CaptureOrchestrator, ChangeResolutionListener, ResolutionRequest, SimulatedDriver,
//! };
//! use pano_rig::config::RigConfig;
//! use std::sync::Arc;
//!
//! let driver = Arc::new(SimulatedDriver::default());
//! let rig = CaptureOrchestrator::new(driver, 2, RigConfig::default());
//! rig.change_resolution(
//!     ResolutionRequest::new("", 1920, 960, 30),
//!     ChangeResolutionListener::new(|result| println!("{:?}", result)),
//! );
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pipelines;
pub mod storage;

// Re-export commonly used types
pub use backends::camera::{CaptureOrchestrator, ResolutionRequest};
pub use config::RigConfig;
pub use errors::{ErrorCode, RigError, RigResult};

// SPDX-License-Identifier: MPL-2.0

//! Hardware backends
//!
//! - [`camera`]: driver traits, per-camera pipelines and rig coordination

pub mod camera;

// SPDX-License-Identifier: MPL-2.0

//! Capture pipelines layered on top of the camera backends
//!
//! - [`photo`]: single stills and bracketed HDR with stacking

pub mod photo;

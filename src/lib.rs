//! Real-time background replacement for a webcam feed.
//!
//! Frames from the camera are segmented on an independent cadence, the
//! resulting masks are refined into a stable alpha channel, and a render
//! loop composites subject, real background and a chosen image through
//! either a wgpu or a software backend before writing to a v4l2loopback
//! device.

pub mod background;
pub mod capture;
pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub mod output;
pub mod overlay;
pub mod refine;
pub mod render;
pub mod segmentation;
pub mod session;

pub use error::{ConfigError, SessionError, UploadError};

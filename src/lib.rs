//! uvc-capture - V4L2 capture engine for UVC cameras with on-board H.264
//!
//! Opens a capture node, optionally configures the camera's hardware encoder
//! through its UVC extension unit, streams memory-mapped buffers and hands
//! every frame to a configurable sink pipeline.

pub mod config;
pub mod error;
pub mod sink;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};

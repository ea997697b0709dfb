//! Capture configuration
//!
//! Built by the command line front-end, optionally on top of a JSON file.

mod schema;

pub use schema::*;

use std::path::Path;

use crate::error::{AppError, Result};
use crate::video::format::{parse_fourcc, FormatRequest};
use crate::video::sys::VIDEO_MAX_FRAME;

impl CaptureConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            AppError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the device layer cannot handle
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 || self.buffer_count > VIDEO_MAX_FRAME {
            return Err(AppError::Config(format!(
                "buffer_count must be between 1 and {}, got {}",
                VIDEO_MAX_FRAME, self.buffer_count
            )));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(AppError::Config("width and height must be non-zero".into()));
        }
        if let Some(code) = &self.pixel_format {
            parse_fourcc(code)?;
        }
        Ok(())
    }

    /// Format request derived from width/height/pixel format
    pub fn format_request(&self) -> Result<FormatRequest> {
        Ok(FormatRequest {
            width: self.width,
            height: self.height,
            fourcc: self.pixel_format.as_deref().map(parse_fourcc).transpose()?,
        })
    }
}

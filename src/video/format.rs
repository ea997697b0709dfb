//! Negotiated capture format and FourCC helpers

use std::fmt;

use v4l::FourCC;

use crate::error::{AppError, Result};

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Format as reported by the device after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub resolution: Resolution,
    pub fourcc: FourCC,
    /// Bytes per line
    pub stride: u32,
    /// Size in bytes of one image (upper bound for compressed formats)
    pub size: u32,
}

impl fmt::Display for DeviceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} stride={} size={}",
            self.resolution,
            fourcc_str(self.fourcc),
            self.stride,
            self.size
        )
    }
}

/// Requested format changes; `None` keeps the device's current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fourcc: Option<FourCC>,
}

impl FormatRequest {
    /// True when nothing would be changed on the device
    pub fn is_unspecified(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.fourcc.is_none()
    }

    /// Apply the request on top of the current format
    ///
    /// Each dimension is replaced independently; the driver picks the
    /// nearest size it supports.
    pub fn apply_to(&self, current: &DeviceFormat) -> DeviceFormat {
        let mut target = *current;
        if let Some(width) = self.width {
            target.resolution.width = width;
        }
        if let Some(height) = self.height {
            target.resolution.height = height;
        }
        if let Some(fourcc) = self.fourcc {
            target.fourcc = fourcc;
        }
        target
    }
}

/// Parse a four-character pixel format code such as `H264` or `MJPG`
pub fn parse_fourcc(code: &str) -> Result<FourCC> {
    let bytes = code.as_bytes();
    if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err(AppError::Config(format!(
            "pixel format must be exactly 4 ASCII characters, got {:?}",
            code
        )));
    }
    Ok(FourCC::new(&[bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Printable form of a FourCC, escaping non-printable bytes
pub fn fourcc_str(fourcc: FourCC) -> String {
    fourcc
        .repr
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                (b as char).to_string()
            } else {
                format!("\\x{:02x}", b)
            }
        })
        .collect()
}

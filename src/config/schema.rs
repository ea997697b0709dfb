use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::video::uvc::DEFAULT_UNIT_ID;

/// Default number of capture buffers
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Video device path (e.g., /dev/video0)
    pub device: PathBuf,
    /// Requested width; unset keeps the device's current format
    pub width: Option<u32>,
    /// Requested height; unset keeps the device's current height
    pub height: Option<u32>,
    /// Requested pixel format as FourCC (e.g., "H264", "MJPG")
    pub pixel_format: Option<String>,
    /// Number of kernel buffers to request
    pub buffer_count: u32,
    /// Stop after this many dequeued frames
    pub max_frames: Option<u64>,
    /// Extension-unit encoder settings
    pub encoder: EncoderConfig,
    /// Frame delivery settings
    pub sink: SinkConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: None,
            height: None,
            pixel_format: None,
            buffer_count: DEFAULT_BUFFER_COUNT,
            max_frames: None,
            encoder: EncoderConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

/// Hardware H.264 encoder negotiation through the UVC extension unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Run probe/commit negotiation before streaming
    pub enabled: bool,
    /// Abort startup when negotiation fails (otherwise warn and continue)
    pub required: bool,
    /// Extension unit id
    pub unit_id: u8,
    /// I-frame period in milliseconds
    pub iframe_period: Option<u16>,
    /// Bit rate in bits per second
    pub bitrate: Option<u32>,
    /// Frame interval in 100ns units
    pub frame_interval: Option<u32>,
    /// H.264 profile (e.g., 0x4240 constrained baseline)
    pub profile: Option<u16>,
    /// Rate control mode (1 = CBR, 2 = VBR, 3 = constant QP)
    pub rate_control_mode: Option<u8>,
    /// Encoded width
    pub width: Option<u16>,
    /// Encoded height
    pub height: Option<u16>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            unit_id: DEFAULT_UNIT_ID,
            iframe_period: Some(2000),
            bitrate: None,
            frame_interval: None,
            profile: None,
            rate_control_mode: None,
            width: None,
            height: None,
        }
    }
}

/// Frame sink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    /// Deliver one frame out of every `skip_interval` (0 or 1 = every frame)
    pub skip_interval: u32,
    /// Bitstream dump level (0 = off, 1 = unit types, 2 = with byte preview)
    pub dump_level: u8,
    /// Append every delivered frame to this file
    pub output: Option<PathBuf>,
    /// Keep the latest delivered frame in this file
    pub snapshot: Option<PathBuf>,
}

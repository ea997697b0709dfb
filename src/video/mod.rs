//! V4L2 capture engine
//!
//! Device access, UVC extension-unit encoder negotiation, memory-mapped
//! buffer management and the streaming loop.

pub mod buffer_pool;
pub mod capture;
pub mod capturer;
pub mod device;
pub mod format;
pub mod frame;
pub mod sys;
pub mod uvc;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer_pool::{BufferHandle, BufferPool, BufferState};
pub use capture::{
    configure_encoder, prepare_capture, run_capture, run_capture_on, CaptureLoop, CaptureState,
    CaptureStats,
};
pub use capturer::{CapturerState, VideoCapturer};
pub use device::{CaptureDevice, CaptureSession, V4l2Device};
pub use format::{DeviceFormat, FormatRequest, Resolution};
pub use frame::CapturedFrame;
pub use uvc::{EncoderConfigurator, ProbeCommit, XuQuery, XuSelector};

//! V4L2 device access and capture session setup

use std::io;
use std::mem;
use std::os::fd::{BorrowedFd, RawFd};
use std::os::raw::c_void;
use std::path::{Path, PathBuf};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l::buffer::{Flags as BufferFlags, Type as BufferType};
use v4l::capability::Flags;
use v4l::format::{Colorspace, FieldOrder};
use v4l::prelude::*;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Memory;

use super::format::{DeviceFormat, FormatRequest, Resolution};
use super::sys::{self, MmapRegion, UvcXuControlQuery};
use crate::error::{AppError, Result};

/// Device capabilities relevant to streaming capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub video_capture: bool,
    pub streaming: bool,
}

/// Kernel description of one capture buffer (VIDIOC_QUERYBUF)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
}

impl BufferInfo {
    pub fn is_queued(&self) -> bool {
        self.flags & BufferFlags::QUEUED.bits() != 0
    }
}

/// A completed buffer returned by VIDIOC_DQBUF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub flags: u32,
    pub field: u32,
    pub sequence: u32,
}

/// The kernel interface the capture engine drives.
///
/// One implementation talks to a real `/dev/videoN` node; tests use an
/// in-memory double. All calls are blocking and made from one thread.
pub trait CaptureDevice {
    /// Memory mapping of one buffer; unmapped when dropped
    type Mapping: AsRef<[u8]>;

    fn capabilities(&self) -> io::Result<DeviceCapabilities>;
    fn get_format(&self) -> io::Result<DeviceFormat>;
    fn set_format(&self, format: &DeviceFormat) -> io::Result<()>;

    /// Request `count` MMAP buffers, returns the count actually granted
    fn request_buffers(&self, count: u32) -> io::Result<u32>;
    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo>;
    fn map_buffer(&self, info: &BufferInfo) -> io::Result<Self::Mapping>;
    fn queue_buffer(&self, index: u32) -> io::Result<()>;
    /// Block until the driver hands back a filled buffer
    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer>;

    fn stream_on(&self) -> io::Result<()>;
    fn stream_off(&self) -> io::Result<()>;

    /// Raw extension-unit query; `data.len()` is passed as the query size
    fn control_query(&self, unit: u8, selector: u8, query: u8, data: &mut [u8]) -> io::Result<()>;
}

/// Zeroed single-planar MMAP capture buffer descriptor
fn capture_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: BufferType::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: plain integers, a timeval and unions of those.
        ..unsafe { mem::zeroed() }
    }
}

/// V4L2 device node backed by the `v4l` crate plus raw buffer ioctls
pub struct V4l2Device {
    path: PathBuf,
    device: Device,
}

impl V4l2Device {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);
        let device = Device::with_path(&path)?;
        Ok(Self { path, device })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    /// Issue one V4L2 ioctl on the device with `arg` as its record
    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        // SAFETY: every caller passes the record type `request` expects.
        unsafe { v4l2::ioctl(self.fd(), request, arg as *mut T as *mut c_void) }
    }

    fn wait_readable(&self) -> io::Result<()> {
        // SAFETY: the descriptor is owned by self.device for the whole call.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::NONE)?;
        Ok(())
    }
}

impl CaptureDevice for V4l2Device {
    type Mapping = MmapRegion;

    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device.query_caps()?;
        debug!("Device {} ({}) on {}", caps.card, caps.driver, caps.bus);
        Ok(DeviceCapabilities {
            video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn get_format(&self) -> io::Result<DeviceFormat> {
        let fmt = self.device.format()?;
        Ok(DeviceFormat {
            resolution: Resolution::new(fmt.width, fmt.height),
            fourcc: fmt.fourcc,
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_format(&self, format: &DeviceFormat) -> io::Result<()> {
        let mut fmt = self.device.format()?;
        fmt.width = format.resolution.width;
        fmt.height = format.resolution.height;
        fmt.fourcc = format.fourcc;
        fmt.field_order = FieldOrder::Any;
        fmt.colorspace = Colorspace::Default;
        self.device.set_format(&fmt)?;
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: BufferType::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain integer record.
            ..unsafe { mem::zeroed() }
        };
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let mut buf = capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferInfo {
            index: buf.index,
            // SAFETY: MMAP buffers always carry the offset member.
            offset: unsafe { buf.m.offset },
            length: buf.length,
            flags: buf.flags,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MmapRegion> {
        MmapRegion::map(self.fd(), info.offset, info.length)
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut buf = capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        loop {
            let mut buf = capture_buffer(0);
            match self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf) {
                Ok(_) => {
                    return Ok(DequeuedBuffer {
                        index: buf.index,
                        bytes_used: buf.bytesused,
                        flags: buf.flags,
                        field: buf.field,
                        sequence: buf.sequence,
                    })
                }
                // The v4l crate opens nodes non-blocking; wait for the next frame.
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => self.wait_readable()?,
                Err(e) => return Err(e),
            }
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut buf_type = BufferType::VideoCapture as u32;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut buf_type = BufferType::VideoCapture as u32;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn control_query(&self, unit: u8, selector: u8, query: u8, data: &mut [u8]) -> io::Result<()> {
        let size = u16::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "control payload exceeds 65535 bytes")
        })?;
        let mut xu = UvcXuControlQuery {
            unit,
            selector,
            query,
            size,
            data: data.as_mut_ptr(),
        };
        // SAFETY: xu.data points at `size` writable bytes borrowed for the call.
        unsafe { sys::uvcioc_ctrl_query(self.fd(), &mut xu) }?;
        Ok(())
    }
}

/// An open capture device with its negotiated format
///
/// Dropping the session closes the device handle.
pub struct CaptureSession<D: CaptureDevice> {
    device: D,
    label: PathBuf,
    format: DeviceFormat,
}

impl CaptureSession<V4l2Device> {
    /// Open a V4L2 node and check that it can capture video
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let device = V4l2Device::open(path).map_err(|e| AppError::OpenFailed {
            device: path.to_path_buf(),
            source: e,
        })?;
        Self::from_device(device, path)
    }
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Wrap an already open device, validating its capture capability
    pub fn from_device(device: D, label: impl AsRef<Path>) -> Result<Self> {
        let label = label.as_ref().to_path_buf();
        let caps = device.capabilities().map_err(|e| AppError::OpenFailed {
            device: label.clone(),
            source: e,
        })?;
        if !caps.video_capture {
            return Err(AppError::NotACaptureDevice { device: label });
        }
        if !caps.streaming {
            warn!("{:?} does not advertise streaming I/O", label);
        }

        let format = device
            .get_format()
            .map_err(|e| AppError::FormatNegotiationFailed {
                op: "VIDIOC_G_FMT",
                source: e,
            })?;
        info!("Opened {:?}, current format {}", label, format);

        Ok(Self {
            device,
            label,
            format,
        })
    }

    /// Negotiate width and pixel format
    ///
    /// An unspecified request keeps the current device format. Otherwise the
    /// format is set and then re-read, since drivers silently adjust values.
    pub fn negotiate_format(&mut self, request: &FormatRequest) -> Result<DeviceFormat> {
        if request.is_unspecified() {
            debug!("No format requested, keeping {}", self.format);
            return Ok(self.format);
        }

        let target = request.apply_to(&self.format);
        self.device
            .set_format(&target)
            .map_err(|e| AppError::FormatNegotiationFailed {
                op: "VIDIOC_S_FMT",
                source: e,
            })?;
        let actual = self
            .device
            .get_format()
            .map_err(|e| AppError::FormatNegotiationFailed {
                op: "VIDIOC_G_FMT",
                source: e,
            })?;

        if actual.resolution != target.resolution || actual.fourcc != target.fourcc {
            warn!("Requested {}, device applied {}", target, actual);
        } else {
            info!("Negotiated format {}", actual);
        }
        self.format = actual;
        Ok(actual)
    }

    pub fn format(&self) -> DeviceFormat {
        self.format
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn label(&self) -> &Path {
        &self.label
    }

    /// Close the session, releasing the device handle
    pub fn close(self) {
        debug!("Closing {:?}", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::testing::FakeDevice;
    use v4l::FourCC;

    #[test]
    fn test_open_rejects_non_capture() {
        let fake = FakeDevice::new();
        fake.state().capabilities.video_capture = false;
        let err = CaptureSession::from_device(fake, "/dev/fake").err().unwrap();
        assert!(matches!(err, AppError::NotACaptureDevice { .. }));
    }

    #[test]
    fn test_open_missing_node() {
        let err = CaptureSession::open("/nonexistent/video99").err().unwrap();
        assert!(matches!(err, AppError::OpenFailed { .. }));
    }

    #[test]
    fn test_unspecified_format_round_trip() {
        let fake = FakeDevice::new();
        let before = fake.state().format;
        let mut session = CaptureSession::from_device(fake.clone(), "/dev/fake").unwrap();
        let negotiated = session.negotiate_format(&FormatRequest::default()).unwrap();
        assert_eq!(negotiated, before);
        assert_eq!(fake.state().set_format_calls, 0);
    }

    #[test]
    fn test_negotiate_uses_reread_format() {
        let fake = FakeDevice::new();
        // Driver only does 1280 wide
        fake.state().clamp_width = Some(1280);
        let mut session = CaptureSession::from_device(fake.clone(), "/dev/fake").unwrap();
        let request = FormatRequest {
            width: Some(1300),
            height: Some(720),
            fourcc: Some(FourCC::new(b"H264")),
        };
        let negotiated = session.negotiate_format(&request).unwrap();
        assert_eq!(negotiated.resolution, Resolution::new(1280, 720));
        assert_eq!(negotiated.fourcc, FourCC::new(b"H264"));
        assert_eq!(session.format(), negotiated);
    }

    #[test]
    fn test_height_without_width_is_applied() {
        let fake = FakeDevice::new();
        let mut session = CaptureSession::from_device(fake.clone(), "/dev/fake").unwrap();
        let request = FormatRequest {
            height: Some(240),
            fourcc: Some(FourCC::new(b"MJPG")),
            ..Default::default()
        };
        let negotiated = session.negotiate_format(&request).unwrap();
        assert_eq!(negotiated.resolution, Resolution::new(640, 240));
        assert_eq!(negotiated.fourcc, FourCC::new(b"MJPG"));
        assert_eq!(fake.state().set_format_calls, 1);
    }

    #[test]
    fn test_buffer_flags_match_kernel_values() {
        let queued = BufferInfo {
            index: 0,
            offset: 0,
            length: 4096,
            flags: 0x0000_0003,
        };
        assert!(queued.is_queued());
        assert!(!BufferInfo { flags: 0x0000_0001, ..queued }.is_queued());

        let buf = capture_buffer(3);
        assert_eq!(buf.index, 3);
        assert_eq!(buf.type_, 1);
        assert_eq!(buf.memory, 1);
        assert_eq!(unsafe { buf.m.offset }, 0);
    }

    #[test]
    fn test_negotiate_failure() {
        let fake = FakeDevice::new();
        fake.state().fail_set_format = true;
        let mut session = CaptureSession::from_device(fake, "/dev/fake").unwrap();
        let request = FormatRequest {
            fourcc: Some(FourCC::new(b"MJPG")),
            ..Default::default()
        };
        let err = session.negotiate_format(&request).unwrap_err();
        assert!(matches!(
            err,
            AppError::FormatNegotiationFailed {
                op: "VIDIOC_S_FMT",
                ..
            }
        ));
    }
}

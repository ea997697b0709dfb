//! Kernel interfaces the `v4l` crate does not wrap: the UVC extension-unit
//! query from `linux/uvcvideo.h` and buffer memory mappings.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::ptr::NonNull;

use libc::c_void;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

/// Maximum number of buffers the V4L2 core hands out per queue
pub const VIDEO_MAX_FRAME: u32 = 32;

/// `struct uvc_xu_control_query`
#[repr(C)]
#[derive(Debug)]
pub struct UvcXuControlQuery {
    pub unit: u8,
    pub selector: u8,
    pub query: u8,
    pub size: u16,
    pub data: *mut u8,
}

nix::ioctl_readwrite!(uvcioc_ctrl_query, b'u', 0x21, UvcXuControlQuery);

/// Read-only shared mapping of one kernel capture buffer, unmapped on drop
pub struct MmapRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

// The region is only read while the buffer is owned by the application.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// Map `length` bytes of the device at `offset`
    pub fn map(fd: RawFd, offset: u32, length: u32) -> io::Result<Self> {
        let len = std::num::NonZeroUsize::new(length as usize).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "zero-length buffer")
        })?;
        // SAFETY: fd stays open for the lifetime of the owning session, which
        // outlives every mapping it hands out.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        }
        .map_err(io::Error::from)?;
        Ok(Self {
            ptr,
            len: len.get(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for MmapRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by mmap with exactly this length.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!("munmap of {} bytes failed: {}", self.len, e);
        }
    }
}

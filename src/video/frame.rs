//! Frame view handed to sinks

use super::buffer_pool::BufferHandle;

/// A filled capture buffer, borrowed for the duration of one delivery
///
/// The bytes live in a kernel buffer mapping and are only valid until the
/// buffer is requeued, so sinks must copy anything they want to keep.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    /// Buffer index in the pool
    pub index: u32,
    /// Kernel sequence number
    pub sequence: u32,
    /// V4L2 buffer flags
    pub flags: u32,
    /// Filled bytes
    pub data: &'a [u8],
}

impl<'a> CapturedFrame<'a> {
    pub fn new(handle: &BufferHandle, data: &'a [u8]) -> Self {
        Self {
            index: handle.index,
            sequence: handle.sequence,
            flags: handle.flags,
            data,
        }
    }

    /// Build a frame from plain bytes (buffer 0, sequence as given)
    pub fn from_bytes(sequence: u32, data: &'a [u8]) -> Self {
        Self {
            index: 0,
            sequence,
            flags: 0,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hex preview of the first bytes, for debug logs
    pub fn preview(&self, n: usize) -> String {
        hex_preview(self.data, n)
    }
}

/// Space separated hex of up to `n` leading bytes
pub fn hex_preview(data: &[u8], n: usize) -> String {
    data.iter()
        .take(n)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

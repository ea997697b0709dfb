//! File-backed frame sinks

use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{Delivery, FrameSink};
use crate::error::{AppError, Result};
use crate::video::frame::CapturedFrame;

/// Mode of a published snapshot, independent of the umask
const SNAPSHOT_MODE: u32 = 0o644;

/// Appends every delivered frame to one elementary-stream file
///
/// No framing is added; the file is the concatenation of frame payloads.
pub struct AppendSink {
    path: PathBuf,
    file: File,
    written: u64,
}

impl AppendSink {
    /// Create (or truncate) the output file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| AppError::SinkOpenFailed {
                path: path.clone(),
                source: e,
            })?;
        info!("Writing stream to {}", path.display());
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes appended so far
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for AppendSink {
    fn deliver(&mut self, frame: &CapturedFrame<'_>) -> Result<Delivery> {
        self.file
            .write_all(frame.data)
            .map_err(|e| AppError::SinkWriteFailed {
                path: self.path.clone(),
                source: e,
            })?;
        self.written += frame.len() as u64;
        Ok(Delivery::Delivered)
    }

    fn name(&self) -> &str {
        "append"
    }
}

/// Keeps exactly the most recent frame in one file
///
/// Each frame is written to a temporary file in the destination directory
/// and renamed over the destination, so readers see either the previous or
/// the new frame in full.
pub struct SnapshotSink {
    path: PathBuf,
    dir: PathBuf,
}

impl SnapshotSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self { path, dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self, data: &[u8]) -> io::Result<()> {
        let prefix = format!(
            ".{}.",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "snapshot".to_string())
        );
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(data)?;
        // The temporary file is created 0600
        tmp.as_file()
            .set_permissions(Permissions::from_mode(SNAPSHOT_MODE))?;
        tmp.as_file().sync_data()?;
        persist(tmp, &self.path)
    }
}

fn persist(tmp: NamedTempFile, dest: &Path) -> io::Result<()> {
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

impl FrameSink for SnapshotSink {
    fn deliver(&mut self, frame: &CapturedFrame<'_>) -> Result<Delivery> {
        self.write_atomic(frame.data)
            .map_err(|e| AppError::SinkWriteFailed {
                path: self.path.clone(),
                source: e,
            })?;
        debug!("{} bytes written to {}", frame.len(), self.path.display());
        Ok(Delivery::Delivered)
    }

    fn name(&self) -> &str {
        "snapshot"
    }
}

//! Persisting the captured frame.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::traits::{CaptureError, Result};

/// Consumer of the one captured frame.
pub trait FrameSink {
    /// Persist `data` in full.
    fn write_frame(&mut self, data: &[u8]) -> Result<()>;
}

/// Writes the frame to a file, creating it with mode `0660` if absent.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Sink writing to `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for FileSink {
    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let write_error = |source| CaptureError::OutputWrite {
            path: self.path.clone(),
            source,
        };

        // Truncate so a shorter frame never inherits the tail of an older one.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o660)
            .open(&self.path)
            .map_err(write_error)?;

        file.write_all(data).map_err(write_error)?;
        file.sync_all().map_err(write_error)?;

        info!(path = %self.path.display(), bytes = data.len(), "frame saved");
        Ok(())
    }
}

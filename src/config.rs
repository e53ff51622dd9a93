//! Capture configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::traits::Format;

/// Camera device node used when none is given.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/video0";
/// Where the still is saved when no output path is given.
pub const DEFAULT_OUTPUT_PATH: &str = "/home/pi/captured_frame_raw.jpeg";
/// Default capture width in pixels.
pub const DEFAULT_WIDTH: u32 = 1920;
/// Default capture height in pixels.
pub const DEFAULT_HEIGHT: u32 = 1080;

/// Settings for one still capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Camera device node.
    pub device: PathBuf,
    /// Output JPEG path.
    pub output: PathBuf,
    /// Requested width in pixels.
    pub width: u32,
    /// Requested height in pixels.
    pub height: u32,
    /// Upper bound on the wait for a frame. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE_PATH),
            output: PathBuf::from(DEFAULT_OUTPUT_PATH),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            timeout: None,
        }
    }
}

impl CaptureConfig {
    /// The MJPEG format to ask the driver for.
    pub const fn requested_format(&self) -> Format {
        Format::mjpeg(self.width, self.height)
    }
}

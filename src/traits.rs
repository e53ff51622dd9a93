//! Core types, errors, and the device control boundary for still capture.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Pixel format representation (e.g., MJPG, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// MJPEG pixel format (Motion JPEG). The only encoding a still can be saved in.
    pub const MJPG: Self = Self::new(b"MJPG");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// V4L2 colorspace identifier (`enum v4l2_colorspace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colorspace(pub u32);

impl Colorspace {
    /// Let the driver pick.
    pub const DEFAULT: Self = Self(0);
    /// ITU-R BT.709, used for HD capture.
    pub const REC709: Self = Self(3);
}

/// Video capture format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Colorspace requested from (or reported by) the driver.
    pub colorspace: Colorspace,
    /// Bytes per line. Zero for compressed formats.
    pub stride: u32,
    /// Maximum frame size in bytes as reported by the driver.
    pub size: u32,
}

impl Format {
    /// Create a new format request. Stride and size are left for the driver to fill in.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
            colorspace: Colorspace::DEFAULT,
            stride: 0,
            size: 0,
        }
    }

    /// Motion-JPEG request in the Rec.709 colorspace.
    #[must_use]
    pub const fn mjpeg(width: u32, height: u32) -> Self {
        Self::new(width, height, FourCC::MJPG).with_colorspace(Colorspace::REC709)
    }

    /// Replace the colorspace.
    #[must_use]
    pub const fn with_colorspace(mut self, colorspace: Colorspace) -> Self {
        self.colorspace = colorspace;
        self
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Ownership of the frame buffer between the application and the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Owned by the application, empty or already consumed.
    Dequeued,
    /// Handed to the driver, waiting to be filled.
    Queued,
    /// Filled by the driver and dequeued; holds one captured frame.
    Done,
}

/// Driver-side description of the single memory-mapped buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Buffer index. Always 0 for single-shot capture.
    pub index: u32,
    /// Buffer length in bytes.
    pub length: u32,
    /// Offset to pass to `mmap` on the device handle.
    pub offset: u32,
    /// Current queue status.
    pub status: BufferStatus,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Bytes the driver reports as filled.
    pub bytes_used: u32,
}

/// One captured frame, borrowed from the mapped buffer.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    /// Encoded frame bytes, bounded by the buffer length.
    pub data: &'a [u8],
    /// Frame metadata.
    pub metadata: &'a FrameMetadata,
}

/// Error type for capture operations.
///
/// Each variant names the control operation that failed and carries the
/// operating-system error unchanged.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The device node could not be opened or is not a streaming capture device.
    #[error("Error opening {}: {source}", path.display())]
    DeviceOpen {
        /// Device path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The driver rejected the capture format.
    #[error("VIDIOC_S_FMT ({requested}): {source}")]
    FormatRejected {
        /// Format that was asked for.
        requested: Format,
        /// Underlying error.
        source: io::Error,
    },
    /// The driver could not allocate memory-mapped buffers.
    #[error("VIDIOC_REQBUFS: {source}")]
    BufferRequest {
        /// Underlying error.
        source: io::Error,
    },
    /// Buffer geometry could not be queried.
    #[error("VIDIOC_QUERYBUF: {source}")]
    BufferQuery {
        /// Underlying error.
        source: io::Error,
    },
    /// The buffer could not be mapped into the process.
    #[error("mmap: {source}")]
    Mapping {
        /// Underlying error.
        source: io::Error,
    },
    /// Streaming could not be started.
    #[error("VIDIOC_STREAMON: {source}")]
    StreamOn {
        /// Underlying error.
        source: io::Error,
    },
    /// The buffer could not be handed to the driver.
    #[error("VIDIOC_QBUF: {source}")]
    Enqueue {
        /// Underlying error.
        source: io::Error,
    },
    /// No filled buffer could be reclaimed from the driver.
    #[error("VIDIOC_DQBUF: {source}")]
    Dequeue {
        /// Underlying error.
        source: io::Error,
    },
    /// Streaming could not be stopped.
    #[error("VIDIOC_STREAMOFF: {source}")]
    StreamOff {
        /// Underlying error.
        source: io::Error,
    },
    /// The captured frame could not be persisted.
    #[error("Error writing {}: {source}", path.display())]
    OutputWrite {
        /// Output path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl CaptureError {
    /// Name of the failing operation.
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::DeviceOpen { .. } => "open",
            Self::FormatRejected { .. } => "VIDIOC_S_FMT",
            Self::BufferRequest { .. } => "VIDIOC_REQBUFS",
            Self::BufferQuery { .. } => "VIDIOC_QUERYBUF",
            Self::Mapping { .. } => "mmap",
            Self::StreamOn { .. } => "VIDIOC_STREAMON",
            Self::Enqueue { .. } => "VIDIOC_QBUF",
            Self::Dequeue { .. } => "VIDIOC_DQBUF",
            Self::StreamOff { .. } => "VIDIOC_STREAMOFF",
            Self::OutputWrite { .. } => "write",
        }
    }

    /// Process exit status. Every failure is fatal and reported the same way.
    pub const fn exit_code(&self) -> i32 {
        1
    }

    /// Underlying operating-system error.
    pub const fn io_error(&self) -> &io::Error {
        match self {
            Self::DeviceOpen { source, .. }
            | Self::FormatRejected { source, .. }
            | Self::BufferRequest { source }
            | Self::BufferQuery { source }
            | Self::Mapping { source }
            | Self::StreamOn { source }
            | Self::Enqueue { source }
            | Self::Dequeue { source }
            | Self::StreamOff { source }
            | Self::OutputWrite { source, .. } => source,
        }
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Frame memory mapped from the device.
pub trait MappedBuffer {
    /// View the mapped bytes.
    fn as_slice(&self) -> &[u8];

    /// Mutable view of the mapped bytes.
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// The kernel video-capture control interface reached through an open device.
///
/// Each method is one control request and reports the driver's status
/// verbatim. Sequencing is the caller's job; see
/// [`CaptureSession`](crate::session::CaptureSession).
pub trait VideoControl {
    /// Memory region returned by [`map_buffer`](Self::map_buffer).
    type Mapping: MappedBuffer;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// `VIDIOC_S_FMT`. Returns the format the driver actually accepted.
    fn set_format(&mut self, format: &Format) -> io::Result<Format>;

    /// `VIDIOC_REQBUFS` in memory-mapped mode. Returns the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// `VIDIOC_QUERYBUF` for the given buffer index.
    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor>;

    /// Map the described buffer read-write and shared.
    fn map_buffer(&mut self, buffer: &BufferDescriptor) -> io::Result<Self::Mapping>;

    /// `VIDIOC_STREAMON`.
    fn stream_on(&mut self) -> io::Result<()>;

    /// `VIDIOC_QBUF` for the given buffer index.
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// `VIDIOC_DQBUF`. Blocks until the driver has filled `mapping`, or
    /// until `timeout` expires when one is given.
    fn dequeue_buffer(
        &mut self,
        mapping: &mut Self::Mapping,
        timeout: Option<Duration>,
    ) -> io::Result<(u32, FrameMetadata)>;

    /// `VIDIOC_STREAMOFF`.
    fn stream_off(&mut self) -> io::Result<()>;

    /// Release a mapping obtained from [`map_buffer`](Self::map_buffer).
    fn unmap_buffer(&mut self, mapping: Self::Mapping) -> io::Result<()>;

    /// Close the device handle.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

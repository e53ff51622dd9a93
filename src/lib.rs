//! Pi-Cam-Still: single-shot MJPEG capture from a V4L2 camera.
//!
//! A [`CaptureSession`] drives one device through format negotiation,
//! single-buffer memory-mapped provisioning and one round of the streaming
//! protocol, then hands the encoded frame to a [`FrameSink`]. The device
//! control interface is abstracted behind [`VideoControl`] so the session
//! can be exercised without hardware.

pub mod config;
pub mod device;
pub mod logging;
pub mod output;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::CaptureConfig;
pub use device::V4L2Device;
pub use output::{FileSink, FrameSink};
pub use session::{capture_still, CaptureSession, CaptureSummary, StreamState, TeardownReport};
pub use traits::{
    BufferDescriptor, BufferStatus, CaptureError, CapturedFrame, Colorspace, DeviceCapabilities,
    Format, FourCC, FrameMetadata, MappedBuffer, Result, VideoControl,
};

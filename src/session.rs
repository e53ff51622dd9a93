//! Single-shot capture session.
//!
//! A [`CaptureSession`] owns one open device and walks it through
//! Configure, Provision and Stream exactly once:
//!
//! ```text
//! S_FMT -> REQBUFS(1) -> QUERYBUF(0) -> mmap -> STREAMON -> QBUF -> DQBUF -> STREAMOFF
//! ```
//!
//! Every step checks that its predecessor completed and rejects the call
//! otherwise, using the error kind of the rejected step. Resources are
//! released in reverse order by [`CaptureSession::teardown`], which also
//! runs on drop.

use std::io;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::output::FrameSink;
use crate::traits::{
    BufferDescriptor, BufferStatus, CaptureError, CapturedFrame, Format, FrameMetadata,
    MappedBuffer, Result, VideoControl,
};
use crate::validation::validate_jpeg;

/// Index of the one buffer a session provisions.
pub const BUFFER_INDEX: u32 = 0;

const BUFFER_COUNT: u32 = 1;

/// Position in the streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Streaming has not been started.
    Idle,
    /// The driver is streaming; no buffer is queued.
    StreamOn,
    /// Buffer 0 is with the driver.
    FrameQueued,
    /// Buffer 0 holds one captured frame.
    FrameReady,
    /// Streaming was stopped. Terminal.
    StreamOff,
}

/// Resources released by [`CaptureSession::teardown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// `VIDIOC_STREAMOFF` had to be issued because streaming was still on.
    pub stream_off: bool,
    /// The frame buffer was unmapped.
    pub unmapped: bool,
    /// The device handle was closed.
    pub closed: bool,
}

/// Outcome of a successful capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Format the driver negotiated.
    pub format: Format,
    /// Length of the provisioned buffer.
    pub buffer_length: u32,
    /// Bytes handed to the sink.
    pub bytes_written: usize,
    /// Metadata of the captured frame.
    pub metadata: FrameMetadata,
}

/// Capture state over one device handle and one mapped buffer.
pub struct CaptureSession<D: VideoControl> {
    device: Option<D>,
    negotiated: Option<Format>,
    granted: u32,
    buffer: Option<BufferDescriptor>,
    mapping: Option<D::Mapping>,
    state: StreamState,
    // A streaming call failed after STREAMON; STREAMOFF is still owed.
    stream_fault: bool,
    metadata: Option<FrameMetadata>,
    dequeue_timeout: Option<Duration>,
}

fn out_of_sequence(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, detail.to_owned())
}

fn device_closed() -> io::Error {
    out_of_sequence("device already closed")
}

/// Number of frame bytes to deliver: the driver-reported fill, bounded by
/// the buffer. Drivers that leave `bytesused` at zero get the whole buffer.
const fn captured_len(bytes_used: u32, length: usize) -> usize {
    let used = bytes_used as usize;
    if used == 0 || used > length {
        length
    } else {
        used
    }
}

impl<D: VideoControl> CaptureSession<D> {
    /// Start a session over an opened device.
    pub const fn new(device: D) -> Self {
        Self {
            device: Some(device),
            negotiated: None,
            granted: 0,
            buffer: None,
            mapping: None,
            state: StreamState::Idle,
            stream_fault: false,
            metadata: None,
            dequeue_timeout: None,
        }
    }

    /// Bound the wait in [`dequeue`](Self::dequeue). `None` blocks until the driver answers.
    #[must_use]
    pub fn with_dequeue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Current streaming state.
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Format accepted by the driver, once configured.
    pub const fn negotiated_format(&self) -> Option<&Format> {
        self.negotiated.as_ref()
    }

    /// Descriptor of buffer 0, once queried.
    pub const fn buffer(&self) -> Option<&BufferDescriptor> {
        self.buffer.as_ref()
    }

    /// The mapped frame memory, between mapping and teardown.
    pub fn frame_memory(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(MappedBuffer::as_slice)
    }

    /// Whether the device handle has been released.
    pub const fn is_closed(&self) -> bool {
        self.device.is_none()
    }

    /// Set the capture format and keep the driver's answer.
    ///
    /// Width and height substitutions are accepted; a different pixel
    /// encoding is not, since the frame is persisted as-is.
    pub fn configure(&mut self, requested: &Format) -> Result<&Format> {
        let reject = |source| CaptureError::FormatRejected {
            requested: requested.clone(),
            source,
        };

        if self.negotiated.is_some() {
            return Err(reject(out_of_sequence("format already negotiated")));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(reject(device_closed()));
        };

        debug!(%requested, "VIDIOC_S_FMT");
        let negotiated = device.set_format(requested).map_err(reject)?;

        if negotiated.fourcc != requested.fourcc {
            return Err(reject(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("driver substituted pixel format {}", negotiated.fourcc),
            )));
        }
        if negotiated.width != requested.width || negotiated.height != requested.height {
            warn!(%requested, %negotiated, "driver adjusted capture size");
        }

        info!(format = %negotiated, size = negotiated.size, "format negotiated");
        Ok(self.negotiated.insert(negotiated))
    }

    /// Ask the driver for one memory-mapped buffer.
    pub fn request_buffers(&mut self) -> Result<u32> {
        let reject = |source| CaptureError::BufferRequest { source };

        if self.negotiated.is_none() {
            return Err(reject(out_of_sequence("format not negotiated")));
        }
        if self.granted > 0 {
            return Err(reject(out_of_sequence("buffers already requested")));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(reject(device_closed()));
        };

        debug!(count = BUFFER_COUNT, "VIDIOC_REQBUFS");
        let granted = device.request_buffers(BUFFER_COUNT).map_err(reject)?;
        if granted == 0 {
            return Err(reject(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "driver granted no buffers",
            )));
        }
        if granted > BUFFER_COUNT {
            debug!(granted, "driver allocated extra buffers; only buffer 0 is used");
        }

        self.granted = granted;
        Ok(granted)
    }

    /// Read back the length and offset of buffer 0.
    pub fn query_buffer(&mut self) -> Result<&BufferDescriptor> {
        let reject = |source| CaptureError::BufferQuery { source };

        if self.granted == 0 {
            return Err(reject(out_of_sequence("no buffers requested")));
        }
        if self.buffer.is_some() {
            return Err(reject(out_of_sequence("buffer already queried")));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(reject(device_closed()));
        };

        debug!(index = BUFFER_INDEX, "VIDIOC_QUERYBUF");
        let buffer = device.query_buffer(BUFFER_INDEX).map_err(reject)?;
        if buffer.length == 0 {
            return Err(reject(io::Error::new(
                io::ErrorKind::InvalidData,
                "driver reported an empty buffer",
            )));
        }

        info!(
            index = buffer.index,
            length = buffer.length,
            offset = buffer.offset,
            "buffer allocated"
        );
        Ok(self.buffer.insert(buffer))
    }

    /// Map buffer 0 into the process and clear it.
    pub fn map_buffer(&mut self) -> Result<()> {
        let reject = |source| CaptureError::Mapping { source };

        let Some(buffer) = self.buffer.as_ref() else {
            return Err(reject(out_of_sequence("buffer not queried")));
        };
        if self.mapping.is_some() {
            return Err(reject(out_of_sequence("buffer already mapped")));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(reject(device_closed()));
        };

        debug!(length = buffer.length, offset = buffer.offset, "mmap");
        let mut mapping = device.map_buffer(buffer).map_err(reject)?;

        // Stale contents must never pass for a captured frame.
        mapping.as_mut_slice().fill(0);

        self.mapping = Some(mapping);
        Ok(())
    }

    /// Request, query and map the single buffer.
    pub fn provision(&mut self) -> Result<&BufferDescriptor> {
        self.request_buffers()?;
        self.query_buffer()?;
        self.map_buffer()?;
        self.buffer
            .as_ref()
            .ok_or_else(|| CaptureError::BufferQuery {
                source: out_of_sequence("buffer not queried"),
            })
    }

    /// Start the capture pipeline.
    pub fn stream_on(&mut self) -> Result<()> {
        let reject = |source| CaptureError::StreamOn { source };

        if self.mapping.is_none() {
            return Err(reject(out_of_sequence("buffer not mapped")));
        }
        if self.state != StreamState::Idle {
            return Err(reject(out_of_sequence("streaming already started")));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(reject(device_closed()));
        };

        debug!("VIDIOC_STREAMON");
        device.stream_on().map_err(reject)?;

        self.state = StreamState::StreamOn;
        Ok(())
    }

    /// Hand buffer 0 to the driver.
    pub fn enqueue(&mut self) -> Result<()> {
        let reject = |source| CaptureError::Enqueue { source };

        if self.state != StreamState::StreamOn || self.stream_fault {
            return Err(reject(out_of_sequence("streaming is not on")));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(reject(device_closed()));
        };

        debug!(index = BUFFER_INDEX, "VIDIOC_QBUF");
        if let Err(source) = device.queue_buffer(BUFFER_INDEX) {
            self.stream_fault = true;
            return Err(reject(source));
        }

        if let Some(buffer) = self.buffer.as_mut() {
            buffer.status = BufferStatus::Queued;
        }
        self.state = StreamState::FrameQueued;
        Ok(())
    }

    /// Wait for the driver to return buffer 0 filled with one frame.
    pub fn dequeue(&mut self) -> Result<&FrameMetadata> {
        let reject = |source| CaptureError::Dequeue { source };

        if self.state != StreamState::FrameQueued || self.stream_fault {
            return Err(reject(out_of_sequence("no buffer queued")));
        }
        let (Some(device), Some(mapping)) = (self.device.as_mut(), self.mapping.as_mut()) else {
            return Err(reject(device_closed()));
        };

        debug!(timeout = ?self.dequeue_timeout, "VIDIOC_DQBUF");
        let (index, metadata) = match device.dequeue_buffer(mapping, self.dequeue_timeout) {
            Ok(dequeued) => dequeued,
            Err(source) => {
                self.stream_fault = true;
                return Err(reject(source));
            }
        };
        if index != BUFFER_INDEX {
            self.stream_fault = true;
            return Err(reject(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("driver returned unknown buffer {index}"),
            )));
        }

        if let Some(buffer) = self.buffer.as_mut() {
            buffer.status = BufferStatus::Done;
        }
        debug!(
            sequence = metadata.sequence,
            bytes_used = metadata.bytes_used,
            "frame dequeued"
        );
        self.state = StreamState::FrameReady;
        Ok(self.metadata.insert(metadata))
    }

    /// Stop the capture pipeline after the frame was dequeued, or after a
    /// streaming call failed. Issued at most once.
    pub fn stream_off(&mut self) -> Result<()> {
        let reject = |source| CaptureError::StreamOff { source };

        let due = match self.state {
            StreamState::FrameReady => true,
            StreamState::StreamOn | StreamState::FrameQueued => self.stream_fault,
            StreamState::Idle | StreamState::StreamOff => false,
        };
        if !due {
            return Err(reject(out_of_sequence("no completed or failed dequeue")));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(reject(device_closed()));
        };

        debug!("VIDIOC_STREAMOFF");
        self.state = StreamState::StreamOff;
        device.stream_off().map_err(reject)
    }

    /// The captured frame, from a successful dequeue until teardown.
    pub fn frame(&self) -> Option<CapturedFrame<'_>> {
        let metadata = self.metadata.as_ref()?;
        let memory = self.mapping.as_ref()?.as_slice();
        let data = memory.get(..captured_len(metadata.bytes_used, memory.len()))?;
        Some(CapturedFrame { data, metadata })
    }

    /// Run the whole protocol once and hand the frame to `sink`.
    ///
    /// `STREAMOFF` is attempted whenever `STREAMON` succeeded. The first
    /// error wins. Resources stay held until [`teardown`](Self::teardown).
    pub fn capture<S: FrameSink>(
        &mut self,
        requested: &Format,
        sink: &mut S,
    ) -> Result<CaptureSummary> {
        let format = self.configure(requested)?.clone();
        let buffer_length = self.provision()?.length;
        self.stream_on()?;

        let captured = self.enqueue().and_then(|()| self.dequeue().map(|_| ()));
        let stopped = self.stream_off();
        captured?;
        stopped?;

        let frame = self.frame().ok_or_else(|| CaptureError::Dequeue {
            source: io::Error::other("no frame in buffer"),
        })?;

        if let Err(issue) = validate_jpeg(frame.data) {
            warn!(%issue, bytes = frame.data.len(), "captured frame does not look like a JPEG");
        }

        sink.write_frame(frame.data)?;

        Ok(CaptureSummary {
            format,
            buffer_length,
            bytes_written: frame.data.len(),
            metadata: frame.metadata.clone(),
        })
    }

    /// Release everything the session still holds, in reverse order of
    /// acquisition. Failures are logged and never replace an earlier error.
    /// Calling it again does nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let Some(mut device) = self.device.take() else {
            return report;
        };

        if matches!(
            self.state,
            StreamState::StreamOn | StreamState::FrameQueued | StreamState::FrameReady
        ) {
            report.stream_off = true;
            self.state = StreamState::StreamOff;
            if let Err(err) = device.stream_off() {
                warn!(error = %err, "VIDIOC_STREAMOFF failed during teardown");
            }
        }

        self.metadata = None;
        if let Some(mapping) = self.mapping.take() {
            report.unmapped = true;
            if let Err(err) = device.unmap_buffer(mapping) {
                warn!(error = %err, "munmap failed during teardown");
            }
        }

        report.closed = true;
        if let Err(err) = device.close() {
            warn!(error = %err, "close failed during teardown");
        }

        debug!(?report, "session torn down");
        report
    }
}

impl<D: VideoControl> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Capture one frame from `device` into `sink`, then release the device.
///
/// Teardown runs on every path; the returned error is the first failure of
/// the protocol or the sink.
pub fn capture_still<D: VideoControl, S: FrameSink>(
    device: D,
    requested: &Format,
    dequeue_timeout: Option<Duration>,
    sink: &mut S,
) -> Result<CaptureSummary> {
    let mut session = CaptureSession::new(device).with_dequeue_timeout(dequeue_timeout);
    let outcome = session.capture(requested, sink);
    session.teardown();
    outcome
}

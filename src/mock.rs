//! Mock device implementation for testing without hardware.
//!
//! Behaves like a well-mannered V4L2 driver by default and can be told to
//! fail any control call. Every call is recorded in a [`CallJournal`] that
//! outlives the device, so tests can inspect what teardown did.

use crate::output::FrameSink;
use crate::traits::{
    BufferDescriptor, BufferStatus, CaptureError, DeviceCapabilities, Format, FrameMetadata,
    MappedBuffer, Result, VideoControl,
};

use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

/// The only path [`MockDevice::open`] accepts.
pub const MOCK_DEVICE_PATH: &str = "/dev/video-mock";

/// Byte pattern left in freshly mapped memory.
const STALE_BYTE: u8 = 0xA5;

/// Control calls the mock records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    /// Opening the device node.
    Open,
    /// `VIDIOC_S_FMT`.
    SetFormat,
    /// `VIDIOC_REQBUFS`.
    RequestBuffers,
    /// `VIDIOC_QUERYBUF`.
    QueryBuffer,
    /// `mmap`.
    MapBuffer,
    /// `VIDIOC_STREAMON`.
    StreamOn,
    /// `VIDIOC_QBUF`.
    QueueBuffer,
    /// `VIDIOC_DQBUF`.
    DequeueBuffer,
    /// `VIDIOC_STREAMOFF`.
    StreamOff,
    /// `munmap`.
    UnmapBuffer,
    /// `close`.
    Close,
}

/// Shared record of the calls made on a mock device.
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Rc<RefCell<Vec<ControlCall>>>);

impl CallJournal {
    fn record(&self, call: ControlCall) {
        self.0.borrow_mut().push(call);
    }

    /// All calls in order.
    pub fn calls(&self) -> Vec<ControlCall> {
        self.0.borrow().clone()
    }

    /// How often `call` was made.
    pub fn count(&self, call: ControlCall) -> usize {
        self.0.borrow().iter().filter(|&&c| c == call).count()
    }

    /// Whether `call` was made at all.
    pub fn contains(&self, call: ControlCall) -> bool {
        self.count(call) > 0
    }
}

/// A small but well-formed baseline JPEG (SOI, APP0, EOI).
pub fn sample_jpeg() -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    data.extend_from_slice(b"JFIF\0");
    data.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    negotiated: Option<Format>,
    granted: Option<u32>,
    buffer_length: u32,
    frame: Vec<u8>,
    bytes_used: Option<u32>,
    frame_pending: bool,
    failures: Vec<(ControlCall, i32)>,
    journal: CallJournal,
    streaming: bool,
    queued: bool,
    sequence: u32,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock CSI Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            negotiated: None,
            granted: None,
            buffer_length: 4096,
            frame: sample_jpeg(),
            bytes_used: None,
            frame_pending: false,
            failures: Vec::new(),
            journal: CallJournal::default(),
            streaming: false,
            queued: false,
            sequence: 0,
        }
    }

    /// Answer `VIDIOC_S_FMT` with this format instead of echoing the request.
    #[must_use]
    pub fn with_negotiated(mut self, format: Format) -> Self {
        self.negotiated = Some(format);
        self
    }

    /// Grant this many buffers regardless of the request.
    #[must_use]
    pub fn with_granted_buffers(mut self, count: u32) -> Self {
        self.granted = Some(count);
        self
    }

    /// Set the length of the device buffer.
    #[must_use]
    pub fn with_buffer_length(mut self, length: u32) -> Self {
        self.buffer_length = length;
        self
    }

    /// Report this `bytesused` on dequeue instead of the frame size.
    #[must_use]
    pub fn with_bytes_used(mut self, bytes_used: u32) -> Self {
        self.bytes_used = Some(bytes_used);
        self
    }

    /// Never have a frame ready when dequeue is first asked. A bounded wait
    /// times out; an unbounded one gets the frame once it arrives.
    #[must_use]
    pub fn with_frame_pending(mut self) -> Self {
        self.frame_pending = true;
        self
    }

    /// Make `call` fail with `EIO`.
    #[must_use]
    pub fn failing_on(self, call: ControlCall) -> Self {
        self.failing_with(call, libc::EIO)
    }

    /// Make `call` fail with the given errno.
    #[must_use]
    pub fn failing_with(mut self, call: ControlCall, errno: i32) -> Self {
        self.failures.push((call, errno));
        self
    }

    /// Journal shared with this device.
    pub fn journal(&self) -> CallJournal {
        self.journal.clone()
    }

    /// Open the mock node. Only [`MOCK_DEVICE_PATH`] exists.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let open_error = |source| CaptureError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        };

        self.enter(ControlCall::Open).map_err(open_error)?;
        if path != Path::new(MOCK_DEVICE_PATH) {
            return Err(open_error(io::Error::from_raw_os_error(libc::ENOENT)));
        }
        Ok(self)
    }

    fn enter(&self, call: ControlCall) -> io::Result<()> {
        self.journal.record(call);
        match self.failures.iter().find(|(failing, _)| *failing == call) {
            Some(&(_, errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

/// Heap-backed stand-in for a mapped device buffer.
pub struct MockMapping {
    data: Vec<u8>,
}

impl MappedBuffer for MockMapping {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl VideoControl for MockDevice {
    type Mapping = MockMapping;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        self.enter(ControlCall::SetFormat)?;
        let mut negotiated = self.negotiated.clone().unwrap_or_else(|| format.clone());
        negotiated.size = self.buffer_length;
        Ok(negotiated)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.enter(ControlCall::RequestBuffers)?;
        let granted = self.granted.unwrap_or(count);
        self.granted = Some(granted);
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        self.enter(ControlCall::QueryBuffer)?;
        if index >= self.granted.unwrap_or(0) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(BufferDescriptor {
            index,
            length: self.buffer_length,
            offset: index * self.buffer_length,
            status: BufferStatus::Dequeued,
        })
    }

    fn map_buffer(&mut self, buffer: &BufferDescriptor) -> io::Result<MockMapping> {
        self.enter(ControlCall::MapBuffer)?;
        Ok(MockMapping {
            data: vec![STALE_BYTE; buffer.length as usize],
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.enter(ControlCall::StreamOn)?;
        self.streaming = true;
        Ok(())
    }

    fn queue_buffer(&mut self, _index: u32) -> io::Result<()> {
        self.enter(ControlCall::QueueBuffer)?;
        if self.queued {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.queued = true;
        Ok(())
    }

    fn dequeue_buffer(
        &mut self,
        mapping: &mut MockMapping,
        timeout: Option<Duration>,
    ) -> io::Result<(u32, FrameMetadata)> {
        self.enter(ControlCall::DequeueBuffer)?;
        if !self.streaming || !self.queued {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if self.frame_pending && timeout.is_some() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"));
        }
        self.queued = false;

        let len = self.frame.len().min(mapping.data.len());
        mapping.data.truncate(0);
        mapping.data.extend(self.frame.iter().take(len));
        mapping.data.resize(self.buffer_length as usize, 0);

        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = self.bytes_used.unwrap_or(len as u32);
        let sequence = self.sequence;
        self.sequence += 1;

        Ok((
            0,
            FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33),
                bytes_used,
            },
        ))
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.enter(ControlCall::StreamOff)?;
        self.streaming = false;
        self.queued = false;
        Ok(())
    }

    fn unmap_buffer(&mut self, _mapping: MockMapping) -> io::Result<()> {
        self.enter(ControlCall::UnmapBuffer)
    }

    fn close(self) -> io::Result<()> {
        self.enter(ControlCall::Close)
    }
}

/// Sink that keeps every frame in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Frames written, in order.
    pub writes: Vec<Vec<u8>>,
    fail: bool,
}

impl MemorySink {
    /// A sink whose writes always fail with `ENOSPC`.
    pub fn failing() -> Self {
        Self {
            writes: Vec::new(),
            fail: true,
        }
    }
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if self.fail {
            return Err(CaptureError::OutputWrite {
                path: "memory".into(),
                source: io::Error::from_raw_os_error(libc::ENOSPC),
            });
        }
        self.writes.push(data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_jpeg;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
    }

    #[test]
    fn test_mock_open_records_call() {
        let device = MockDevice::new();
        let journal = device.journal();

        device.open(MOCK_DEVICE_PATH).expect("open should succeed");
        assert_eq!(journal.calls(), vec![ControlCall::Open]);
    }

    #[test]
    fn test_mock_injected_errno() {
        let mut device = MockDevice::new().failing_with(ControlCall::StreamOn, libc::EBUSY);

        let err = device.stream_on().expect_err("stream_on should fail");
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        assert!(device.journal().contains(ControlCall::StreamOn));
    }

    #[test]
    fn test_mock_dequeue_requires_queued_buffer() {
        let mut device = MockDevice::new().with_buffer_length(64);
        let buffer = BufferDescriptor {
            index: 0,
            length: 64,
            offset: 0,
            status: BufferStatus::Dequeued,
        };
        let mut mapping = device.map_buffer(&buffer).expect("map should succeed");
        device.stream_on().expect("stream_on should succeed");

        let err = device
            .dequeue_buffer(&mut mapping, None)
            .expect_err("dequeue without queue should fail");
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        device.queue_buffer(0).expect("queue should succeed");
        let (index, meta) = device
            .dequeue_buffer(&mut mapping, None)
            .expect("dequeue should succeed");
        assert_eq!(index, 0);
        assert_eq!(meta.sequence, 0);
        assert_eq!(mapping.as_slice().len(), 64);
    }

    #[test]
    fn test_mock_pending_frame() {
        let mut device = MockDevice::new().with_buffer_length(64).with_frame_pending();
        let buffer = BufferDescriptor {
            index: 0,
            length: 64,
            offset: 0,
            status: BufferStatus::Dequeued,
        };
        let mut mapping = device.map_buffer(&buffer).expect("map should succeed");
        device.stream_on().expect("stream_on should succeed");
        device.queue_buffer(0).expect("queue should succeed");

        let err = device
            .dequeue_buffer(&mut mapping, Some(Duration::from_millis(1)))
            .expect_err("bounded wait should time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let (index, _) = device
            .dequeue_buffer(&mut mapping, None)
            .expect("unbounded wait should get the frame");
        assert_eq!(index, 0);
    }

    #[test]
    fn test_sample_jpeg_is_valid() {
        assert!(validate_jpeg(&sample_jpeg()).is_ok());
    }
}

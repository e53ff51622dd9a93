//! V4L2 device implementation using the v4l crate.
//!
//! Format negotiation goes through the safe `v4l` API. The buffer and
//! streaming requests are issued one at a time through `v4l::v4l2` so that
//! every control call can fail on its own.

#![allow(unsafe_code)]

use tracing::debug;
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{v4l2, Device};

use crate::traits::{
    BufferDescriptor, BufferStatus, CaptureError, Colorspace, DeviceCapabilities, Format, FourCC,
    FrameMetadata, MappedBuffer, Result, VideoControl,
};

use std::mem::{self, ManuallyDrop};
use std::os::raw::c_void;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::time::Duration;
use std::{io, slice};

const BUF_FLAG_QUEUED: u32 = 0x0000_0002;
const BUF_FLAG_DONE: u32 = 0x0000_0004;

/// Zeroed `v4l2_buffer` addressing a memory-mapped capture buffer.
fn capture_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        ..unsafe { mem::zeroed() }
    }
}

/// V4L2 capture device wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a V4L2 device node (e.g., `/dev/video0`) for read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let open_error = |source| CaptureError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        };

        let device = Device::with_path(path).map_err(open_error)?;
        let caps = device.query_caps().map_err(open_error)?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(open_error(io::Error::new(
                io::ErrorKind::Unsupported,
                "not a streaming video capture device",
            )));
        }

        debug!(
            path = %path.display(),
            driver = %capabilities.driver,
            card = %capabilities.card,
            "opened capture device"
        );

        Ok(Self {
            device,
            capabilities,
        })
    }

    fn fd(&self) -> std::os::raw::c_int {
        self.device.handle().fd()
    }

    /// Wait until a buffer can be dequeued. The `v4l` handle is opened
    /// non-blocking, so this always runs before `VIDIOC_DQBUF`.
    fn wait_for_frame(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout.map_or(-1, poll_timeout_ms);

        if self.device.handle().poll(libc::POLLIN, timeout_ms)? == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"));
        }
        Ok(())
    }
}

/// Milliseconds for `poll(2)`, saturating at `i32::MAX`.
fn poll_timeout_ms(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

impl VideoControl for V4L2Device {
    type Mapping = MmapRegion;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        let mut fmt = self.device.format()?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();
        fmt.colorspace = v4l::format::Colorspace::try_from(format.colorspace.0)
            .unwrap_or(v4l::format::Colorspace::Default);

        let fmt = self.device.set_format(&fmt)?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            colorspace: Colorspace(fmt.colorspace as u32),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut request = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(request).cast::<c_void>(),
            )?;
        }

        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        let mut buf = capture_buffer(index);

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )?;
        }

        let status = if buf.flags & BUF_FLAG_QUEUED != 0 {
            BufferStatus::Queued
        } else if buf.flags & BUF_FLAG_DONE != 0 {
            BufferStatus::Done
        } else {
            BufferStatus::Dequeued
        };

        Ok(BufferDescriptor {
            index: buf.index,
            length: buf.length,
            offset: unsafe { buf.m.offset },
            status,
        })
    }

    fn map_buffer(&mut self, buffer: &BufferDescriptor) -> io::Result<MmapRegion> {
        let len = buffer.length as usize;
        let offset = libc::off_t::try_from(buffer.offset).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "buffer offset out of range")
        })?;

        let start = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                offset,
            )?
        };

        let ptr = NonNull::new(start.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;

        Ok(MmapRegion { ptr, len })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_STREAMON,
                ptr::addr_of_mut!(typ).cast::<c_void>(),
            )
        }
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = capture_buffer(index);

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        }
    }

    fn dequeue_buffer(
        &mut self,
        _mapping: &mut MmapRegion,
        timeout: Option<Duration>,
    ) -> io::Result<(u32, FrameMetadata)> {
        self.wait_for_frame(timeout)?;

        let mut buf = capture_buffer(0);

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_DQBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )?;
        }

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = buf.timestamp.tv_sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok((
            buf.index,
            FrameMetadata {
                sequence: buf.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: buf.bytesused,
            },
        ))
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_STREAMOFF,
                ptr::addr_of_mut!(typ).cast::<c_void>(),
            )
        }
    }

    fn unmap_buffer(&mut self, mapping: MmapRegion) -> io::Result<()> {
        mapping.unmap()
    }

    /// `v4l` closes the descriptor when its `Handle` drops and never hands
    /// back the `close(2)` result, so this cannot report a failure.
    fn close(self) -> io::Result<()> {
        drop(self.device);
        Ok(())
    }
}

/// Shared read-write mapping of one device buffer.
///
/// Unmapped explicitly through [`VideoControl::unmap_buffer`]; dropping an
/// unreleased region unmaps it as a fallback.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmapRegion {
    fn unmap(self) -> io::Result<()> {
        let region = ManuallyDrop::new(self);
        unsafe { v4l2::munmap(region.ptr.as_ptr().cast::<c_void>(), region.len) }
    }
}

impl MappedBuffer for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        let _ = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) };
    }
}

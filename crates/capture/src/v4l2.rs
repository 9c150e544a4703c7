// Copyright 2024 Soft KVM Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Video4Linux2 capture backend

use crate::{
    BufferInfo, BufferMapping, CaptureBackend, CaptureDevice, CaptureError, CaptureResult,
    DequeuedBuffer, DeviceCapabilities, DeviceFormat, DisplayTimings,
};
use ikvm_core::{PixelFormat, VideoResolution};
use std::io;
use std::mem;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::time::Duration;
use tracing::debug;
use v4l::buffer::Type as BufferType;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2::vidioc::{
    _IOC_TYPE, VIDIOC_DQBUF, VIDIOC_QBUF, VIDIOC_QUERYBUF, VIDIOC_REQBUFS, VIDIOC_STREAMOFF,
    VIDIOC_STREAMON, VIDIOC_S_CTRL,
};
use v4l::v4l_sys::{v4l2_buffer, v4l2_control, v4l2_dv_timings, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{v4l2, Device};

/// V4L2_BUF_FLAG_ERROR
const BUF_FLAG_ERROR: u32 = 0x0000_0040;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Encode a `'V'` request number the way linux/ioctl.h does
const fn video_request(dir: u32, nr: u32, size: usize) -> _IOC_TYPE {
    ((dir << 30) | ((size as u32) << 16) | ((b'V' as u32) << 8) | nr) as _IOC_TYPE
}

// The DV timing requests are missing from the v4l request table
const VIDIOC_S_DV_TIMINGS: _IOC_TYPE =
    video_request(IOC_READ | IOC_WRITE, 87, mem::size_of::<v4l2_dv_timings>());
const VIDIOC_QUERY_DV_TIMINGS: _IOC_TYPE =
    video_request(IOC_READ, 99, mem::size_of::<v4l2_dv_timings>());

/// Opens `/dev/videoN` nodes
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        V4l2Backend
    }
}

impl CaptureBackend for V4l2Backend {
    type Device = V4l2Device;

    fn open(&mut self, path: &Path) -> CaptureResult<V4l2Device> {
        let device = Device::with_path(path).map_err(|source| CaptureError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let fd = device.handle().fd();
        let mut device = V4l2Device { device, fd };

        // the node is opened non-blocking; the engine expects blocking by default
        device.set_nonblocking(false)?;
        debug!("Opened video device {} (fd {})", path.display(), fd);

        Ok(device)
    }
}

/// An open V4L2 capture node. The file descriptor closes with the device.
pub struct V4l2Device {
    device: Device,
    fd: RawFd,
}

/// Issue a raw V4L2 request, naming it in the error
macro_rules! ioctl {
    ($fd:expr, $request:ident, $arg:expr) => {
        unsafe {
            v4l2::ioctl(
                $fd,
                $request,
                $arg as *mut _ as *mut c_void,
            )
        }
        .map_err(|source| CaptureError::ioctl(stringify!($request), source))
    };
}

fn buffer_desc(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: BufferType::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        ..unsafe { mem::zeroed() }
    }
}

impl CaptureDevice for V4l2Device {
    type Timings = V4l2Timings;
    type Mapping = MmapRegion;

    fn query_capabilities(&mut self) -> CaptureResult<DeviceCapabilities> {
        let caps = self
            .device
            .query_caps()
            .map_err(|source| CaptureError::ioctl("VIDIOC_QUERYCAP", source))?;

        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn get_format(&mut self) -> CaptureResult<DeviceFormat> {
        let format = self
            .device
            .format()
            .map_err(|source| CaptureError::ioctl("VIDIOC_G_FMT", source))?;

        Ok(DeviceFormat {
            resolution: VideoResolution::new(format.width, format.height),
            pixel_format: PixelFormat::from_fourcc(format.fourcc.repr),
        })
    }

    fn set_frame_rate(&mut self, fps: u32) -> CaptureResult<()> {
        self.device
            .set_params(&Parameters::with_fps(fps))
            .map(|_| ())
            .map_err(|source| CaptureError::ioctl("VIDIOC_S_PARM", source))
    }

    fn set_control(&mut self, id: u32, value: i32) -> CaptureResult<()> {
        let mut control = v4l2_control { id, value };
        ioctl!(self.fd, VIDIOC_S_CTRL, &mut control)
    }

    fn query_timings(&mut self) -> CaptureResult<V4l2Timings> {
        let mut timings: v4l2_dv_timings = unsafe { mem::zeroed() };
        ioctl!(self.fd, VIDIOC_QUERY_DV_TIMINGS, &mut timings)?;
        Ok(V4l2Timings(timings))
    }

    fn set_timings(&mut self, timings: &V4l2Timings) -> CaptureResult<()> {
        let mut timings = timings.0;
        ioctl!(self.fd, VIDIOC_S_DV_TIMINGS, &mut timings)
    }

    fn request_buffers(&mut self, count: u32) -> CaptureResult<u32> {
        let mut request = v4l2_requestbuffers {
            count,
            type_: BufferType::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        ioctl!(self.fd, VIDIOC_REQBUFS, &mut request)?;
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> CaptureResult<BufferInfo> {
        let mut buf = buffer_desc(index);
        ioctl!(self.fd, VIDIOC_QUERYBUF, &mut buf)?;

        Ok(BufferInfo {
            index,
            length: buf.length,
            offset: unsafe { buf.m.offset },
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> CaptureResult<MmapRegion> {
        MmapRegion::new(self.fd, info).map_err(|source| CaptureError::Mmap {
            index: info.index,
            source,
        })
    }

    fn queue_buffer(&mut self, index: u32) -> CaptureResult<()> {
        let mut buf = buffer_desc(index);
        ioctl!(self.fd, VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> CaptureResult<DequeuedBuffer> {
        let mut buf = buffer_desc(0);
        ioctl!(self.fd, VIDIOC_DQBUF, &mut buf)?;

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            error: buf.flags & BUF_FLAG_ERROR != 0,
        })
    }

    fn stream_on(&mut self) -> CaptureResult<()> {
        let mut typ = BufferType::VideoCapture as u32;
        ioctl!(self.fd, VIDIOC_STREAMON, &mut typ)
    }

    fn stream_off(&mut self) -> CaptureResult<()> {
        let mut typ = BufferType::VideoCapture as u32;
        ioctl!(self.fd, VIDIOC_STREAMOFF, &mut typ)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> CaptureResult<bool> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(CaptureError::System {
                call: "fcntl(F_GETFL)",
                source: io::Error::last_os_error(),
            });
        }

        let was_nonblocking = flags & libc::O_NONBLOCK != 0;
        if was_nonblocking == nonblocking {
            return Ok(was_nonblocking);
        }

        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };

        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(CaptureError::System {
                call: "fcntl(F_SETFL)",
                source: io::Error::last_os_error(),
            });
        }

        Ok(was_nonblocking)
    }

    fn wait_readable(&mut self, timeout: Duration) -> CaptureResult<bool> {
        let mut fds = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ready < 0 {
            return Err(CaptureError::System {
                call: "poll",
                source: io::Error::last_os_error(),
            });
        }

        Ok(ready > 0 && fds.revents & libc::POLLIN != 0)
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        debug!("Closing video device (fd {})", self.fd);
    }
}

/// Result of VIDIOC_QUERY_DV_TIMINGS, replayed verbatim by VIDIOC_S_DV_TIMINGS
#[derive(Clone, Copy)]
pub struct V4l2Timings(v4l2_dv_timings);

impl DisplayTimings for V4l2Timings {
    fn resolution(&self) -> VideoResolution {
        // packed: copy the fields out instead of borrowing them
        let bt = unsafe { self.0.__bindgen_anon_1.bt };
        let width = bt.width;
        let height = bt.height;
        VideoResolution::new(width, height)
    }
}

/// A driver buffer mapped shared, read/write. Unmapped on drop.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmapRegion {
    fn new(fd: RawFd, info: &BufferInfo) -> io::Result<Self> {
        let len = info.length as usize;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                info.offset as libc::off_t,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(MmapRegion { ptr, len })
    }
}

impl BufferMapping for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VideoSession;
    use ikvm_core::{CaptureConfig, NoopWakeup};

    #[test]
    fn test_open_missing_device() {
        let mut backend = V4l2Backend::new();
        let err = backend
            .open(Path::new("/dev/ikvm-no-such-video-node"))
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Open { .. }));
        assert!(err.to_string().contains("/dev/ikvm-no-such-video-node"));
    }

    #[test]
    fn test_dv_timings_requests() {
        assert_eq!(mem::size_of::<v4l2_dv_timings>(), 132);
        assert_eq!(VIDIOC_QUERY_DV_TIMINGS as u32, 0x8084_5663);
        assert_eq!(VIDIOC_S_DV_TIMINGS as u32, 0xc084_5657);
    }

    #[test]
    fn test_request_encoding_matches_v4l() {
        assert_eq!(
            video_request(IOC_READ | IOC_WRITE, 15, mem::size_of::<v4l2_buffer>()),
            VIDIOC_QBUF
        );
        assert_eq!(
            video_request(IOC_READ | IOC_WRITE, 28, mem::size_of::<v4l2_control>()),
            VIDIOC_S_CTRL
        );
    }

    #[test]
    fn test_session_on_missing_device_stays_stopped() {
        let config = CaptureConfig::with_video_device("/dev/ikvm-no-such-video-node");
        let mut session = VideoSession::new(V4l2Backend::new(), NoopWakeup, &config);

        session.start();
        assert!(!session.is_started());
        assert!(!session.needs_resize());
        session.get_frame();
        assert!(session.frame().is_none());
    }

    #[test]
    fn test_timings_resolution() {
        let mut raw: v4l2_dv_timings = unsafe { mem::zeroed() };
        unsafe {
            raw.__bindgen_anon_1.bt.width = 1280;
            raw.__bindgen_anon_1.bt.height = 1024;
        }
        assert_eq!(
            V4l2Timings(raw).resolution(),
            VideoResolution::new(1280, 1024)
        );
    }
}

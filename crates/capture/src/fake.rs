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

//! In-memory capture driver for engine tests

use crate::{
    BufferInfo, BufferMapping, CaptureBackend, CaptureDevice, CaptureError, CaptureResult,
    DequeuedBuffer, DeviceCapabilities, DeviceFormat, DisplayTimings, VideoSession,
};
use ikvm_core::{CaptureConfig, InputWakeup, PixelFormat, VideoResolution, BYTES_PER_PIXEL};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Simulated driver state, shared between the test and the session under test
#[derive(Debug)]
pub struct FakeHardware {
    /// Resolution reported by the timing query
    pub signal: VideoResolution,
    /// Resolution reported by G_FMT; sizes the buffers
    pub format: VideoResolution,
    pub pixel_format: PixelFormat,
    pub capabilities: DeviceCapabilities,
    /// Number of upcoming timing queries that fail
    pub timing_failures: u32,
    /// Most buffers the driver hands out
    pub grant: u32,
    pub fail_open: bool,
    pub fail_controls: bool,
    pub fail_map: Option<u32>,
    pub fail_queue: bool,
    pub fail_stream_off: bool,
    /// Non-zero buffer requests fail
    pub fail_reqbufs: bool,
    pub fail_query_buffer: Option<u32>,
    pub fail_set_timings: bool,
    pub fail_nonblocking: bool,
    pub nonblocking: bool,

    pub opens: u32,
    pub closes: u32,
    pub frame_rate: Option<u32>,
    pub controls: Vec<(u32, i32)>,
    pub reqbufs: Vec<u32>,
    pub set_timings: Vec<VideoResolution>,
    pub stream_offs: u32,
    pub streaming: bool,
    pub timing_queries: u32,
    pub maps: u32,
    pub nonblocking_switches: u32,

    pub allocated: u32,
    pub queued: BTreeSet<u32>,
    /// Completed buffers waiting to be dequeued: (index, bytes, error)
    pub done: VecDeque<(u32, u32, bool)>,
    live: u32,
}

impl FakeHardware {
    pub fn new(width: u32, height: u32) -> Self {
        let resolution = VideoResolution::new(width, height);
        FakeHardware {
            signal: resolution,
            format: resolution,
            pixel_format: PixelFormat::Jpeg,
            capabilities: DeviceCapabilities {
                driver: "fake".to_string(),
                card: "Fake Capture".to_string(),
                video_capture: true,
                streaming: true,
            },
            timing_failures: 0,
            grant: 4,
            fail_open: false,
            fail_controls: false,
            fail_map: None,
            fail_queue: false,
            fail_stream_off: false,
            fail_reqbufs: false,
            fail_query_buffer: None,
            fail_set_timings: false,
            fail_nonblocking: false,
            nonblocking: false,
            opens: 0,
            closes: 0,
            frame_rate: None,
            controls: Vec::new(),
            reqbufs: Vec::new(),
            set_timings: Vec::new(),
            stream_offs: 0,
            streaming: false,
            timing_queries: 0,
            maps: 0,
            nonblocking_switches: 0,
            allocated: 0,
            queued: BTreeSet::new(),
            done: VecDeque::new(),
            live: 0,
        }
    }

    /// Mappings handed out and not yet dropped
    pub fn live_mappings(&self) -> u32 {
        self.live
    }

    /// Let the driver fill a queued buffer with `bytes` of frame data
    pub fn complete(&mut self, index: u32, bytes: u32) {
        assert!(self.queued.remove(&index), "buffer {} not queued", index);
        self.done.push_back((index, bytes, false));
    }

    /// Let the driver hand back a queued buffer flagged as corrupt
    pub fn complete_with_error(&mut self, index: u32) {
        assert!(self.queued.remove(&index), "buffer {} not queued", index);
        self.done.push_back((index, 0, true));
    }

    fn buffer_length(&self) -> u32 {
        self.format.width * self.format.height * BYTES_PER_PIXEL
    }
}

fn os_error(request: &'static str, code: i32) -> CaptureError {
    CaptureError::ioctl(request, io::Error::from_raw_os_error(code))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeTimings(pub VideoResolution);

impl DisplayTimings for FakeTimings {
    fn resolution(&self) -> VideoResolution {
        self.0
    }
}

pub struct FakeMapping {
    data: Vec<u8>,
    hw: Rc<RefCell<FakeHardware>>,
}

impl BufferMapping for FakeMapping {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for FakeMapping {
    fn drop(&mut self) {
        self.hw.borrow_mut().live -= 1;
    }
}

pub struct FakeDevice {
    hw: Rc<RefCell<FakeHardware>>,
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        let mut hw = self.hw.borrow_mut();
        hw.closes += 1;
        hw.streaming = false;
        hw.queued.clear();
        hw.done.clear();
    }
}

impl CaptureDevice for FakeDevice {
    type Timings = FakeTimings;
    type Mapping = FakeMapping;

    fn query_capabilities(&mut self) -> CaptureResult<DeviceCapabilities> {
        Ok(self.hw.borrow().capabilities.clone())
    }

    fn get_format(&mut self) -> CaptureResult<DeviceFormat> {
        let hw = self.hw.borrow();
        Ok(DeviceFormat {
            resolution: hw.format,
            pixel_format: hw.pixel_format,
        })
    }

    fn set_frame_rate(&mut self, fps: u32) -> CaptureResult<()> {
        self.hw.borrow_mut().frame_rate = Some(fps);
        Ok(())
    }

    fn set_control(&mut self, id: u32, value: i32) -> CaptureResult<()> {
        let mut hw = self.hw.borrow_mut();
        if hw.fail_controls {
            return Err(os_error("VIDIOC_S_CTRL", libc::EINVAL));
        }
        hw.controls.push((id, value));
        Ok(())
    }

    fn query_timings(&mut self) -> CaptureResult<FakeTimings> {
        let mut hw = self.hw.borrow_mut();
        hw.timing_queries += 1;
        if hw.timing_failures > 0 {
            hw.timing_failures -= 1;
            return Err(os_error("VIDIOC_QUERY_DV_TIMINGS", libc::ENOLINK));
        }
        Ok(FakeTimings(hw.signal))
    }

    fn set_timings(&mut self, timings: &FakeTimings) -> CaptureResult<()> {
        let mut hw = self.hw.borrow_mut();
        if hw.fail_set_timings {
            return Err(os_error("VIDIOC_S_DV_TIMINGS", libc::EBUSY));
        }
        hw.set_timings.push(timings.0);
        hw.format = timings.0;
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> CaptureResult<u32> {
        let mut hw = self.hw.borrow_mut();
        hw.reqbufs.push(count);
        if hw.streaming || hw.live > 0 {
            return Err(os_error("VIDIOC_REQBUFS", libc::EBUSY));
        }
        if hw.fail_reqbufs && count > 0 {
            return Err(os_error("VIDIOC_REQBUFS", libc::ENOMEM));
        }
        hw.allocated = count.min(hw.grant);
        hw.queued.clear();
        hw.done.clear();
        Ok(hw.allocated)
    }

    fn query_buffer(&mut self, index: u32) -> CaptureResult<BufferInfo> {
        let hw = self.hw.borrow();
        if index >= hw.allocated || hw.fail_query_buffer == Some(index) {
            return Err(os_error("VIDIOC_QUERYBUF", libc::EINVAL));
        }
        let length = hw.buffer_length();
        Ok(BufferInfo {
            index,
            length,
            offset: index * length,
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> CaptureResult<FakeMapping> {
        {
            let mut hw = self.hw.borrow_mut();
            if hw.fail_map == Some(info.index) {
                return Err(CaptureError::Mmap {
                    index: info.index,
                    source: io::Error::from_raw_os_error(libc::ENOMEM),
                });
            }
            hw.maps += 1;
            hw.live += 1;
        }

        Ok(FakeMapping {
            data: vec![info.index as u8; info.length as usize],
            hw: Rc::clone(&self.hw),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> CaptureResult<()> {
        let mut hw = self.hw.borrow_mut();
        if hw.fail_queue || index >= hw.allocated || !hw.queued.insert(index) {
            return Err(os_error("VIDIOC_QBUF", libc::EINVAL));
        }
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> CaptureResult<DequeuedBuffer> {
        let mut hw = self.hw.borrow_mut();
        match hw.done.pop_front() {
            Some((index, bytes_used, error)) => Ok(DequeuedBuffer {
                index,
                bytes_used,
                error,
            }),
            None => Err(os_error("VIDIOC_DQBUF", libc::EAGAIN)),
        }
    }

    fn stream_on(&mut self) -> CaptureResult<()> {
        self.hw.borrow_mut().streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> CaptureResult<()> {
        let mut hw = self.hw.borrow_mut();
        hw.stream_offs += 1;
        if hw.fail_stream_off {
            return Err(os_error("VIDIOC_STREAMOFF", libc::EIO));
        }
        hw.streaming = false;
        hw.queued.clear();
        hw.done.clear();
        Ok(())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> CaptureResult<bool> {
        let mut hw = self.hw.borrow_mut();
        if hw.fail_nonblocking {
            return Err(CaptureError::System {
                call: "fcntl(F_SETFL)",
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        }
        hw.nonblocking_switches += 1;
        let previous = hw.nonblocking;
        hw.nonblocking = nonblocking;
        Ok(previous)
    }

    fn wait_readable(&mut self, _timeout: Duration) -> CaptureResult<bool> {
        Ok(!self.hw.borrow().done.is_empty())
    }
}

pub struct FakeBackend {
    hw: Rc<RefCell<FakeHardware>>,
}

impl CaptureBackend for FakeBackend {
    type Device = FakeDevice;

    fn open(&mut self, path: &Path) -> CaptureResult<FakeDevice> {
        let mut hw = self.hw.borrow_mut();
        if hw.fail_open {
            return Err(CaptureError::Open {
                path: path.to_path_buf(),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        hw.opens += 1;
        hw.streaming = false;
        hw.allocated = 0;
        hw.queued.clear();
        hw.done.clear();

        Ok(FakeDevice {
            hw: Rc::clone(&self.hw),
        })
    }
}

/// Counts wakeups sent to the host
pub struct FakeWakeup(Rc<Cell<u32>>);

impl InputWakeup for FakeWakeup {
    fn send_wakeup(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

pub type FakeSession = VideoSession<FakeBackend, FakeWakeup>;

pub fn fake_session(
    hardware: FakeHardware,
) -> (FakeSession, Rc<RefCell<FakeHardware>>, Rc<Cell<u32>>) {
    fake_session_with_config(hardware, &CaptureConfig::with_video_device("/dev/video0"))
}

pub fn fake_session_with_config(
    hardware: FakeHardware,
    config: &CaptureConfig,
) -> (FakeSession, Rc<RefCell<FakeHardware>>, Rc<Cell<u32>>) {
    let hw = Rc::new(RefCell::new(hardware));
    let wakeups = Rc::new(Cell::new(0));
    let backend = FakeBackend { hw: Rc::clone(&hw) };
    let session = VideoSession::new(backend, FakeWakeup(Rc::clone(&wakeups)), config);
    (session, hw, wakeups)
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a log subscriber installed and return everything it logged
pub fn capture_logs<F: FnOnce()>(f: F) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();

    tracing::subscriber::with_default(subscriber, f);

    let bytes = buffer.0.lock().unwrap().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}

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

//! Capability interface between the capture engine and the device driver

use crate::CaptureResult;
use ikvm_core::{PixelFormat, VideoResolution};
use std::path::Path;
use std::time::Duration;

/// V4L2_CID_JPEG_CHROMA_SUBSAMPLING
pub const CID_JPEG_CHROMA_SUBSAMPLING: u32 = 0x009d_0901;

/// Number of buffers asked from the driver on every allocation
pub const REQUESTED_BUFFERS: u32 = 3;

/// Fewer buffers than this and the driver cannot fill one while we hold another
pub const MIN_BUFFERS: u32 = 2;

/// Upper bound on how long `get_frame` waits for the driver
pub const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Capabilities reported by the driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub video_capture: bool,
    pub streaming: bool,
}

impl DeviceCapabilities {
    pub fn supports_streaming_capture(&self) -> bool {
        self.video_capture && self.streaming
    }
}

/// Current capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub resolution: VideoResolution,
    pub pixel_format: PixelFormat,
}

/// Detected display timings, opaque apart from the active resolution
pub trait DisplayTimings: Clone {
    fn resolution(&self) -> VideoResolution;
}

/// Kernel-side description of one capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub length: u32,
    pub offset: u32,
}

/// A buffer handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    /// Driver flagged the contents as corrupt
    pub error: bool,
}

/// Driver memory mapped into the process. Dropping it unmaps the region.
pub trait BufferMapping {
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open capture device. Dropping it closes the device.
pub trait CaptureDevice {
    type Timings: DisplayTimings;
    type Mapping: BufferMapping;

    fn query_capabilities(&mut self) -> CaptureResult<DeviceCapabilities>;

    fn get_format(&mut self) -> CaptureResult<DeviceFormat>;

    fn set_frame_rate(&mut self, fps: u32) -> CaptureResult<()>;

    fn set_control(&mut self, id: u32, value: i32) -> CaptureResult<()>;

    fn query_timings(&mut self) -> CaptureResult<Self::Timings>;

    fn set_timings(&mut self, timings: &Self::Timings) -> CaptureResult<()>;

    /// Ask for `count` buffers; returns how many the driver granted.
    /// A count of zero releases every buffer the driver holds.
    fn request_buffers(&mut self, count: u32) -> CaptureResult<u32>;

    fn query_buffer(&mut self, index: u32) -> CaptureResult<BufferInfo>;

    fn map_buffer(&mut self, info: &BufferInfo) -> CaptureResult<Self::Mapping>;

    fn queue_buffer(&mut self, index: u32) -> CaptureResult<()>;

    fn dequeue_buffer(&mut self) -> CaptureResult<DequeuedBuffer>;

    fn stream_on(&mut self) -> CaptureResult<()>;

    fn stream_off(&mut self) -> CaptureResult<()>;

    /// Switch blocking mode; returns whether the handle was non-blocking before
    fn set_nonblocking(&mut self, nonblocking: bool) -> CaptureResult<bool>;

    /// Wait until a completed buffer can be dequeued. `Ok(false)` on timeout.
    fn wait_readable(&mut self, timeout: Duration) -> CaptureResult<bool>;
}

/// Opens capture devices by path
pub trait CaptureBackend {
    type Device: CaptureDevice;

    fn open(&mut self, path: &Path) -> CaptureResult<Self::Device>;
}

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

//! Video capture session lifecycle

use crate::{BufferPool, CaptureBackend, CaptureDevice, CaptureError, CID_JPEG_CHROMA_SUBSAMPLING};
use ikvm_core::{
    CaptureConfig, ChromaSubsampling, InputWakeup, PixelFormat, VideoResolution, BITS_PER_SAMPLE,
    BYTES_PER_PIXEL, SAMPLES_PER_PIXEL,
};
use std::mem;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub(crate) type MappingOf<B> = <<B as CaptureBackend>::Device as CaptureDevice>::Mapping;

/// Session state. The device handle exists only while started.
pub(crate) enum SessionState<D> {
    Stopped,
    Started(D),
    /// Started, and `start` already sized the buffers for a new resolution.
    /// The next resize check reports a resize; the resize itself is a no-op.
    PendingResize(D),
}

impl<D> SessionState<D> {
    pub(crate) fn device_mut(&mut self) -> Option<&mut D> {
        match self {
            SessionState::Stopped => None,
            SessionState::Started(device) | SessionState::PendingResize(device) => Some(device),
        }
    }

    fn take(&mut self) -> Option<D> {
        match mem::replace(self, SessionState::Stopped) {
            SessionState::Stopped => None,
            SessionState::Started(device) | SessionState::PendingResize(device) => Some(device),
        }
    }

    pub(crate) fn set_pending_resize(&mut self, pending: bool) {
        *self = match mem::replace(self, SessionState::Stopped) {
            SessionState::Stopped => SessionState::Stopped,
            SessionState::Started(device) | SessionState::PendingResize(device) => {
                if pending {
                    SessionState::PendingResize(device)
                } else {
                    SessionState::Started(device)
                }
            }
        };
    }
}

/// Health of the display timing query, used to log a failure streak only once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingHealth {
    Unknown,
    Healthy,
    Failing,
}

/// Read-only view of the most recent completed frame
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub index: usize,
    /// Bytes written by the driver for this frame
    pub data: &'a [u8],
    pub resolution: VideoResolution,
    pub pixel_format: PixelFormat,
}

impl Frame<'_> {
    /// Framebuffer geometry consumers should advertise for this frame
    pub fn bits_per_sample(&self) -> u32 {
        BITS_PER_SAMPLE
    }

    pub fn samples_per_pixel(&self) -> u32 {
        SAMPLES_PER_PIXEL
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        BYTES_PER_PIXEL
    }
}

/// Capture session over one video device.
///
/// Not thread safe: one frame-server loop drives
/// every operation sequentially. None of the operations return errors;
/// failures are logged and either tolerated or answered with a restart.
pub struct VideoSession<B: CaptureBackend, W: InputWakeup> {
    backend: B,
    input: W,
    path: PathBuf,
    frame_rate: u32,
    subsampling: ChromaSubsampling,
    strict_pixel_format: bool,
    pub(crate) state: SessionState<B::Device>,
    pub(crate) timing_health: TimingHealth,
    pub(crate) buffers: BufferPool<MappingOf<B>>,
    pub(crate) resolution: VideoResolution,
    pixel_format: PixelFormat,
    pub(crate) last_frame: Option<usize>,
}

impl<B: CaptureBackend, W: InputWakeup> VideoSession<B, W> {
    /// Create a stopped session; nothing touches the device until `start`
    pub fn new(backend: B, input: W, config: &CaptureConfig) -> Self {
        VideoSession {
            backend,
            input,
            path: config.video_device.clone(),
            frame_rate: config.frame_rate,
            subsampling: config.subsampling,
            strict_pixel_format: config.strict_pixel_format,
            state: SessionState::Stopped,
            timing_health: TimingHealth::Unknown,
            buffers: BufferPool::new(),
            resolution: VideoResolution::default(),
            pixel_format: PixelFormat::default(),
            last_frame: None,
        }
    }

    /// Open the device, negotiate the format and start streaming.
    ///
    /// No-op if already started. On open failure the session stays stopped.
    pub fn start(&mut self) {
        if self.is_started() {
            return;
        }

        let previous = self.resolution;

        self.input.send_wakeup();

        let mut device = match self.backend.open(&self.path) {
            Ok(device) => device,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        match device.query_capabilities() {
            Ok(caps) => {
                debug!("Video device: {} ({})", caps.card, caps.driver);
                if !caps.supports_streaming_capture() {
                    warn!("Video device doesn't support streaming video capture");
                }
            }
            Err(e) => warn!("Failed to query video device capabilities: {}", e),
        }

        let format = match device.get_format() {
            Ok(format) => Some(format),
            Err(e) => {
                error!("Failed to query video device format: {}", e);
                None
            }
        };

        if let Err(e) = device.set_frame_rate(self.frame_rate) {
            warn!("Failed to set video device frame rate: {}", e);
        }

        if let Err(e) =
            device.set_control(CID_JPEG_CHROMA_SUBSAMPLING, self.subsampling.control_value())
        {
            warn!("Failed to set video jpeg subsampling: {}", e);
        }

        if let Some(format) = format {
            self.resolution = format.resolution;
            self.pixel_format = format.pixel_format;
        }

        if !self.pixel_format.is_supported() {
            warn!("{}", CaptureError::UnsupportedFormat(self.pixel_format));
            match self.pixel_format {
                PixelFormat::Mjpeg => warn!("Pixel format is MJPEG"),
                PixelFormat::Yuyv => warn!("Pixel format is YUYV"),
                _ => {}
            }

            if self.strict_pixel_format {
                error!("Refusing to stream pixel format {}", self.pixel_format);
                return;
            }
        }

        self.state = SessionState::Started(device);
        self.resize();

        if self.is_started() && self.resolution != previous {
            self.state.set_pending_resize(true);
        }

        info!(
            "Video capture started on {}: {} {} at {} fps, {} subsampling",
            self.path.display(),
            self.resolution,
            self.pixel_format,
            self.frame_rate,
            self.subsampling
        );
    }

    /// Stop streaming, unmap every buffer and close the device. No-op if stopped.
    pub fn stop(&mut self) {
        let Some(mut device) = self.state.take() else {
            return;
        };

        self.last_frame = None;

        if let Err(e) = device.stream_off() {
            warn!("Failed to stop streaming: {}", e);
        }

        self.buffers.unmap_all();
        drop(device);

        info!("Video capture stopped on {}", self.path.display());
    }

    /// Full teardown and reopen; the recovery path for lost signal
    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.state, SessionState::Stopped)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolution(&self) -> VideoResolution {
        self.resolution
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn subsampling(&self) -> ChromaSubsampling {
        self.subsampling
    }

    pub fn timing_health(&self) -> TimingHealth {
        self.timing_health
    }

    pub fn buffers(&self) -> &BufferPool<MappingOf<B>> {
        &self.buffers
    }

    pub fn last_frame_index(&self) -> Option<usize> {
        self.last_frame
    }

    /// Mapped memory of the last completed frame.
    ///
    /// The borrow ends before the next `get_frame`, which may hand the same
    /// buffer back to the driver.
    pub fn data(&self) -> Option<&[u8]> {
        self.last_frame
            .and_then(|index| self.buffers.get(index))
            .and_then(|buffer| buffer.data())
    }

    /// The last completed frame, trimmed to the bytes the driver wrote
    pub fn frame(&self) -> Option<Frame<'_>> {
        let index = self.last_frame?;
        let buffer = self.buffers.get(index)?;
        let data = buffer.data()?;
        let payload = buffer.payload().min(data.len());

        Some(Frame {
            index,
            data: &data[..payload],
            resolution: self.resolution,
            pixel_format: self.pixel_format,
        })
    }

    /// Size of the active pool's mapping at `index`
    pub fn buffer_size(&self, index: usize) -> Option<usize> {
        self.buffers
            .get(index)
            .and_then(|b| b.data().map(|d| d.len()))
    }
}

impl<B: CaptureBackend, W: InputWakeup> Drop for VideoSession<B, W> {
    fn drop(&mut self) {
        self.stop();
    }
}

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

//! # IKVM Capture
//!
//! Capture engine of the IKVM daemon. A [`VideoSession`] owns a video
//! capture device, negotiates its format, keeps a ring of memory-mapped
//! buffers queued to the driver, follows display timing changes and hands
//! out the most recent completed frame.
//!
//! The engine is synchronous and polled: the frame-server loop calls
//! [`VideoSession::needs_resize`], [`VideoSession::resize`],
//! [`VideoSession::get_frame`] and [`VideoSession::frame`] once per cycle.
//! Hardware access goes through the [`CaptureBackend`] / [`CaptureDevice`]
//! traits; [`v4l2::V4l2Backend`] is the Linux implementation.

pub mod buffer;
pub mod device;
pub mod session;

mod acquire;
mod resize;

#[cfg(target_os = "linux")]
pub mod v4l2;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use buffer::*;
pub use device::*;
pub use session::*;

use ikvm_core::PixelFormat;
use std::io;
use std::path::PathBuf;

/// Capture result type
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Capture device errors
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to open video device {}: {}", .path.display(), .source)]
    Open { path: PathBuf, source: io::Error },

    #[error("{request} failed: {source}")]
    Ioctl {
        request: &'static str,
        source: io::Error,
    },

    #[error("{call} failed: {source}")]
    System { call: &'static str, source: io::Error },

    #[error("Failed to mmap buffer {index}: {source}")]
    Mmap { index: u32, source: io::Error },

    #[error("Pixel format {0} not supported")]
    UnsupportedFormat(PixelFormat),
}

impl CaptureError {
    pub fn ioctl(request: &'static str, source: io::Error) -> Self {
        CaptureError::Ioctl { request, source }
    }

    /// True when a non-blocking operation had nothing to return
    pub fn is_would_block(&self) -> bool {
        match self {
            CaptureError::Ioctl { source, .. } | CaptureError::System { source, .. } => {
                source.kind() == io::ErrorKind::WouldBlock
            }
            _ => false,
        }
    }
}

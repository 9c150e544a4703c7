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

//! Core types for IKVM

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bits per color sample handed to frame consumers
pub const BITS_PER_SAMPLE: u32 = 8;

/// Bytes per pixel of the framebuffer handed to frame consumers
pub const BYTES_PER_PIXEL: u32 = 4;

/// Color samples per pixel
pub const SAMPLES_PER_PIXEL: u32 = 3;

/// Frame rate used when none (or an out-of-range one) is configured
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Highest accepted frame rate
pub const MAX_FRAME_RATE: u32 = 60;

/// Video resolution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VideoResolution {
    pub width: u32,
    pub height: u32,
}

impl VideoResolution {
    pub fn new(width: u32, height: u32) -> Self {
        VideoResolution { width, height }
    }

    /// Resolution assumed before any device has been opened
    pub fn svga() -> Self {
        VideoResolution {
            width: 800,
            height: 600,
        }
    }

    pub fn fhd() -> Self {
        VideoResolution {
            width: 1920,
            height: 1080,
        }
    }

    /// True when either dimension is zero
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Default for VideoResolution {
    fn default() -> Self {
        Self::svga()
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel format reported by the capture device, keyed by its fourcc code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb24,
    Jpeg,
    Mjpeg,
    Yuyv,
    Other([u8; 4]),
}

impl PixelFormat {
    pub fn from_fourcc(code: [u8; 4]) -> Self {
        match &code {
            b"RGB3" => PixelFormat::Rgb24,
            b"JPEG" => PixelFormat::Jpeg,
            b"MJPG" => PixelFormat::Mjpeg,
            b"YUYV" => PixelFormat::Yuyv,
            _ => PixelFormat::Other(code),
        }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Jpeg => *b"JPEG",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Other(code) => *code,
        }
    }

    /// Formats the frame consumers know how to handle
    pub fn is_supported(&self) -> bool {
        matches!(self, PixelFormat::Rgb24 | PixelFormat::Jpeg)
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Yuyv
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.fourcc() {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// JPEG chroma subsampling requested from the capture hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChromaSubsampling {
    #[default]
    #[serde(rename = "444")]
    Yuv444,
    #[serde(rename = "420")]
    Yuv420,
}

impl ChromaSubsampling {
    /// Map the numeric selector (0 = 4:4:4, 1 = 4:2:0); anything else falls back to 4:4:4
    pub fn from_selector(selector: i64) -> Self {
        match selector {
            1 => ChromaSubsampling::Yuv420,
            _ => ChromaSubsampling::Yuv444,
        }
    }

    /// Value of the V4L2 JPEG chroma subsampling control
    pub fn control_value(&self) -> i32 {
        match self {
            ChromaSubsampling::Yuv444 => 0,
            ChromaSubsampling::Yuv420 => 2,
        }
    }
}

impl fmt::Display for ChromaSubsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChromaSubsampling::Yuv444 => write!(f, "4:4:4"),
            ChromaSubsampling::Yuv420 => write!(f, "4:2:0"),
        }
    }
}

/// Normalize a requested frame rate; values outside 0..=60 become the default
pub fn normalize_frame_rate(requested: i64) -> u32 {
    if (0..=MAX_FRAME_RATE as i64).contains(&requested) {
        requested as u32
    } else {
        DEFAULT_FRAME_RATE
    }
}

/// Collaborator that pokes the capture target over USB HID so it produces a signal
pub trait InputWakeup {
    /// Fire-and-forget; implementations log their own failures
    fn send_wakeup(&mut self);
}

/// Wakeup collaborator that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeup;

impl InputWakeup for NoopWakeup {
    fn send_wakeup(&mut self) {}
}

impl<T: InputWakeup + ?Sized> InputWakeup for Box<T> {
    fn send_wakeup(&mut self) {
        (**self).send_wakeup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_normalization() {
        assert_eq!(normalize_frame_rate(0), 0);
        assert_eq!(normalize_frame_rate(15), 15);
        assert_eq!(normalize_frame_rate(60), 60);
        assert_eq!(normalize_frame_rate(61), DEFAULT_FRAME_RATE);
        assert_eq!(normalize_frame_rate(-1), DEFAULT_FRAME_RATE);
    }

    #[test]
    fn test_subsampling_selector() {
        assert_eq!(ChromaSubsampling::from_selector(0), ChromaSubsampling::Yuv444);
        assert_eq!(ChromaSubsampling::from_selector(1), ChromaSubsampling::Yuv420);
        assert_eq!(ChromaSubsampling::from_selector(2), ChromaSubsampling::Yuv444);
        assert_eq!(ChromaSubsampling::from_selector(-5), ChromaSubsampling::Yuv444);
        assert_eq!(ChromaSubsampling::Yuv420.control_value(), 2);
    }

    #[test]
    fn test_pixel_format_support() {
        assert!(PixelFormat::from_fourcc(*b"RGB3").is_supported());
        assert!(PixelFormat::from_fourcc(*b"JPEG").is_supported());
        assert_eq!(PixelFormat::from_fourcc(*b"MJPG"), PixelFormat::Mjpeg);
        assert!(!PixelFormat::Yuyv.is_supported());
        assert_eq!(PixelFormat::from_fourcc(*b"NV12").to_string(), "NV12");
    }

    #[test]
    fn test_default_resolution() {
        let resolution = VideoResolution::default();
        assert_eq!(resolution, VideoResolution::new(800, 600));
        assert_eq!(resolution.to_string(), "800x600");
        assert!(VideoResolution::new(0, 600).is_degenerate());
    }
}

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

//! Capture configuration management

use crate::{normalize_frame_rate, validate_device_path, ChromaSubsampling, IkvmResult, DEFAULT_FRAME_RATE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Settings consumed by the capture engine and its input collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub video_device: PathBuf,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default)]
    pub subsampling: ChromaSubsampling,
    #[serde(default)]
    pub keyboard_device: Option<PathBuf>,
    #[serde(default)]
    pub pointer_device: Option<PathBuf>,
    /// Refuse to stream pixel formats other than RGB24 and JPEG
    #[serde(default)]
    pub strict_pixel_format: bool,
}

fn default_frame_rate() -> u32 {
    DEFAULT_FRAME_RATE
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            video_device: PathBuf::new(),
            frame_rate: DEFAULT_FRAME_RATE,
            subsampling: ChromaSubsampling::Yuv444,
            keyboard_device: None,
            pointer_device: None,
            strict_pixel_format: false,
        }
    }
}

impl CaptureConfig {
    pub fn with_video_device<P: Into<PathBuf>>(path: P) -> Self {
        CaptureConfig {
            video_device: path.into(),
            ..Default::default()
        }
    }

    /// Clamp values that came from an untrusted source back into range
    pub fn normalized(mut self) -> Self {
        self.frame_rate = normalize_frame_rate(self.frame_rate as i64);
        self
    }

    /// Fail on a missing video device; only warn about missing HID gadgets
    pub fn validate(&self) -> IkvmResult<()> {
        validate_device_path(&self.video_device)?;

        if self.keyboard_device.is_none() {
            warn!("The keyboard device path is not given");
        }
        if self.pointer_device.is_none() {
            warn!("The pointer device path is not given");
        }

        Ok(())
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfigFile {
    pub capture: CaptureConfig,
}

impl CaptureConfigFile {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> IkvmResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: CaptureConfigFile = serde_json::from_str(&content)?;
        config.capture = config.capture.normalized();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> IkvmResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl From<CaptureConfig> for CaptureConfigFile {
    fn from(capture: CaptureConfig) -> Self {
        CaptureConfigFile { capture }
    }
}

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

//! HID gadget device nodes

use crate::report::{keyboard_wakeup_reports, pointer_wakeup_report};
use ikvm_core::{CaptureConfig, IkvmError, IkvmResult, InputWakeup};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One `/dev/hidgN` endpoint, opened on first use
#[derive(Debug)]
struct GadgetNode {
    path: PathBuf,
    file: Option<File>,
}

impl GadgetNode {
    fn new(path: PathBuf) -> Self {
        GadgetNode { path, file: None }
    }

    fn file(&mut self) -> IkvmResult<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
                .open(&self.path)
                .map_err(|e| {
                    IkvmError::Input(format!("Failed to open {}: {}", self.path.display(), e))
                })?;
            debug!("Opened HID gadget {}", self.path.display());
            self.file = Some(file);
        }

        self.file
            .as_mut()
            .ok_or_else(|| IkvmError::Input(format!("{} not open", self.path.display())))
    }

    fn write_report(&mut self, report: &[u8]) -> IkvmResult<()> {
        let path = self.path.display().to_string();
        let written = self.file()?.write(report);

        match written {
            Ok(n) if n == report.len() => Ok(()),
            Ok(n) => Err(IkvmError::Input(format!(
                "Short write to {}: {} of {} bytes",
                path,
                n,
                report.len()
            ))),
            Err(e) => {
                // reopen next time, the gadget may have been rebound
                self.file = None;
                Err(IkvmError::Input(format!("Failed to write {}: {}", path, e)))
            }
        }
    }
}

/// Keyboard and pointer gadget endpoints.
///
/// Either endpoint may be absent; a missing one is simply skipped.
#[derive(Debug, Default)]
pub struct HidGadget {
    keyboard: Option<GadgetNode>,
    pointer: Option<GadgetNode>,
}

impl HidGadget {
    pub fn new(keyboard: Option<PathBuf>, pointer: Option<PathBuf>) -> Self {
        HidGadget {
            keyboard: keyboard.map(GadgetNode::new),
            pointer: pointer.map(GadgetNode::new),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.keyboard_device.clone(), config.pointer_device.clone())
    }

    pub fn keyboard_path(&self) -> Option<&Path> {
        self.keyboard.as_ref().map(|node| node.path.as_path())
    }

    pub fn pointer_path(&self) -> Option<&Path> {
        self.pointer.as_ref().map(|node| node.path.as_path())
    }

    fn wake_pointer(&mut self) -> IkvmResult<()> {
        match self.pointer.as_mut() {
            Some(node) => node.write_report(&pointer_wakeup_report()),
            None => Ok(()),
        }
    }

    fn wake_keyboard(&mut self) -> IkvmResult<()> {
        let Some(node) = self.keyboard.as_mut() else {
            return Ok(());
        };

        for report in keyboard_wakeup_reports() {
            node.write_report(&report)?;
        }
        Ok(())
    }
}

impl InputWakeup for HidGadget {
    fn send_wakeup(&mut self) {
        if let Err(e) = self.wake_pointer() {
            warn!("Failed to send pointer wakeup: {}", e);
        }

        if let Err(e) = self.wake_keyboard() {
            warn!("Failed to send keyboard wakeup: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_wakeup_writes_reports() {
        let dir = TempDir::new().unwrap();
        let keyboard = dir.path().join("hidg0");
        let pointer = dir.path().join("hidg1");
        fs::write(&keyboard, b"").unwrap();
        fs::write(&pointer, b"").unwrap();

        let mut gadget = HidGadget::new(Some(keyboard.clone()), Some(pointer.clone()));
        gadget.send_wakeup();

        assert_eq!(fs::read(&pointer).unwrap(), pointer_wakeup_report().to_vec());
        assert_eq!(fs::read(&keyboard).unwrap(), keyboard_wakeup_reports().concat());
    }

    #[test]
    fn test_wakeup_keeps_endpoints_open() {
        let dir = TempDir::new().unwrap();
        let pointer = dir.path().join("hidg1");
        fs::write(&pointer, b"").unwrap();

        let mut gadget = HidGadget::new(None, Some(pointer.clone()));
        gadget.send_wakeup();
        gadget.send_wakeup();

        assert_eq!(fs::read(&pointer).unwrap().len(), 2 * crate::POINTER_REPORT_LENGTH);
    }

    #[test]
    fn test_missing_nodes_are_tolerated() {
        let dir = TempDir::new().unwrap();
        let mut gadget = HidGadget::new(Some(dir.path().join("missing")), None);
        gadget.send_wakeup();

        assert!(gadget.keyboard_path().is_some());
        assert!(gadget.pointer_path().is_none());
        assert!(gadget.wake_keyboard().is_err());
    }

    #[test]
    fn test_from_config() {
        let mut config = CaptureConfig::with_video_device("/dev/video0");
        config.keyboard_device = Some(PathBuf::from("/dev/hidg0"));

        let gadget = HidGadget::from_config(&config);
        assert_eq!(gadget.keyboard_path(), Some(Path::new("/dev/hidg0")));
        assert!(gadget.pointer_path().is_none());
    }
}

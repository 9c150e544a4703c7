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

//! Command line

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use ikvm_core::{
    normalize_frame_rate, parse_c_integer, CaptureConfig, CaptureConfigFile, ChromaSubsampling,
};
use std::path::PathBuf;

pub fn build_cli() -> Command {
    Command::new("ikvm-server")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Soft KVM Team")
        .about("Simple IKVM daemon")
        .arg(
            Arg::new("frameRate")
                .short('f')
                .long("frameRate")
                .value_name("RATE")
                .allow_hyphen_values(true)
                .help("Try this frame rate (0-60, otherwise 30)"),
        )
        .arg(
            Arg::new("subsampling")
                .short('s')
                .long("subsampling")
                .value_name("MODE")
                .allow_hyphen_values(true)
                .help("Try this JPEG subsampling: 0 for 4:4:4, 1 for 4:2:0"),
        )
        .arg(
            Arg::new("keyboard")
                .short('k')
                .long("keyboard")
                .value_name("DEVICE")
                .help("HID keyboard gadget device"),
        )
        .arg(
            Arg::new("mouse")
                .short('p')
                .long("mouse")
                .value_name("DEVICE")
                .help("HID mouse gadget device"),
        )
        .arg(
            Arg::new("videoDevice")
                .short('v')
                .long("videoDevice")
                .value_name("DEVICE")
                .help("V4L2 device"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Load settings from a JSON configuration file"),
        )
        .arg(
            Arg::new("save-config")
                .long("save-config")
                .value_name("FILE")
                .help("Write the effective settings to a JSON configuration file"),
        )
        .arg(
            Arg::new("strict-pixel-format")
                .long("strict-pixel-format")
                .help("Refuse to stream pixel formats other than RGB24 and JPEG")
                .action(ArgAction::SetTrue),
        )
}

/// Options given on the command line; unset ones keep the file or default value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOptions {
    pub frame_rate: Option<u32>,
    pub subsampling: Option<ChromaSubsampling>,
    pub keyboard: Option<PathBuf>,
    pub pointer: Option<PathBuf>,
    pub video_device: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub save_config: Option<PathBuf>,
    pub strict_pixel_format: bool,
}

impl CliOptions {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let path = |id: &str| matches.get_one::<String>(id).map(PathBuf::from);

        CliOptions {
            frame_rate: matches
                .get_one::<String>("frameRate")
                .map(|s| normalize_frame_rate(parse_c_integer(s))),
            subsampling: matches
                .get_one::<String>("subsampling")
                .map(|s| ChromaSubsampling::from_selector(parse_c_integer(s))),
            keyboard: path("keyboard"),
            pointer: path("mouse"),
            video_device: path("videoDevice"),
            config: path("config"),
            save_config: path("save-config"),
            strict_pixel_format: matches.get_flag("strict-pixel-format"),
        }
    }

    /// Overlay these options on `config`
    pub fn apply(&self, config: &mut CaptureConfig) {
        if let Some(frame_rate) = self.frame_rate {
            config.frame_rate = frame_rate;
        }
        if let Some(subsampling) = self.subsampling {
            config.subsampling = subsampling;
        }
        if let Some(keyboard) = &self.keyboard {
            config.keyboard_device = Some(keyboard.clone());
        }
        if let Some(pointer) = &self.pointer {
            config.pointer_device = Some(pointer.clone());
        }
        if let Some(video_device) = &self.video_device {
            config.video_device = video_device.clone();
        }
        if self.strict_pixel_format {
            config.strict_pixel_format = true;
        }
    }
}

/// Configuration file (if any) with the command line applied on top
pub fn resolve_config(options: &CliOptions) -> anyhow::Result<CaptureConfig> {
    let mut config = match &options.config {
        Some(path) => {
            CaptureConfigFile::load(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?
                .capture
        }
        None => CaptureConfig::default(),
    };

    options.apply(&mut config);
    Ok(config.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> CliOptions {
        let matches = build_cli().try_get_matches_from(args).unwrap();
        CliOptions::from_matches(&matches)
    }

    #[test]
    fn test_parse_short_options() {
        let options = parse(&[
            "ikvm-server", "-f", "15", "-s", "1", "-k", "/dev/hidg0", "-p", "/dev/hidg1", "-v",
            "/dev/video0",
        ]);

        assert_eq!(options.frame_rate, Some(15));
        assert_eq!(options.subsampling, Some(ChromaSubsampling::Yuv420));
        assert_eq!(options.keyboard, Some(PathBuf::from("/dev/hidg0")));
        assert_eq!(options.pointer, Some(PathBuf::from("/dev/hidg1")));
        assert_eq!(options.video_device, Some(PathBuf::from("/dev/video0")));
        assert!(!options.strict_pixel_format);
    }

    #[test]
    fn test_parse_long_options() {
        let options = parse(&[
            "ikvm-server",
            "--frameRate",
            "0x14",
            "--subsampling",
            "0",
            "--videoDevice",
            "/dev/video1",
            "--strict-pixel-format",
        ]);

        assert_eq!(options.frame_rate, Some(20));
        assert_eq!(options.subsampling, Some(ChromaSubsampling::Yuv444));
        assert_eq!(options.video_device, Some(PathBuf::from("/dev/video1")));
        assert!(options.strict_pixel_format);
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let options = parse(&["ikvm-server", "-f", "61", "-s", "2", "-v", "/dev/video0"]);
        assert_eq!(options.frame_rate, Some(30));
        assert_eq!(options.subsampling, Some(ChromaSubsampling::Yuv444));

        let options = parse(&["ikvm-server", "-f", "-1", "-s", "-1"]);
        assert_eq!(options.frame_rate, Some(30));
        assert_eq!(options.subsampling, Some(ChromaSubsampling::Yuv444));

        let options = parse(&["ikvm-server", "-f", "fast"]);
        assert_eq!(options.frame_rate, Some(0));
    }

    #[test]
    fn test_removed_options_are_rejected() {
        assert!(build_cli()
            .try_get_matches_from(["ikvm-server", "-u", "udc0"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["ikvm-server", "-c"])
            .is_err());
    }

    #[test]
    fn test_command_line_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ikvm.json");

        let mut file_config = CaptureConfig::with_video_device("/dev/video9");
        file_config.frame_rate = 10;
        file_config.keyboard_device = Some(PathBuf::from("/dev/hidg0"));
        CaptureConfigFile::from(file_config).save(&path).unwrap();

        let options = parse(&[
            "ikvm-server",
            "--config",
            path.to_str().unwrap(),
            "-f",
            "25",
        ]);
        let config = resolve_config(&options).unwrap();

        assert_eq!(config.video_device, PathBuf::from("/dev/video9"));
        assert_eq!(config.frame_rate, 25);
        assert_eq!(config.keyboard_device, Some(PathBuf::from("/dev/hidg0")));
        assert!(config.pointer_device.is_none());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let options = parse(&["ikvm-server", "--config", "/nonexistent/ikvm.json"]);
        assert!(resolve_config(&options).is_err());
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve_config(&parse(&["ikvm-server", "-v", "/dev/video0"])).unwrap();
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.subsampling, ChromaSubsampling::Yuv444);
        assert!(!config.strict_pixel_format);
    }
}

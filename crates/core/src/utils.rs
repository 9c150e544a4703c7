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

//! Utility functions for IKVM

use crate::{IkvmError, IkvmResult};
use std::path::Path;

/// Parse an integer option the way `strtol(s, NULL, 0)` does.
///
/// Accepts an optional sign, a `0x`/`0X` hex prefix or a leading-zero octal
/// prefix, and stops at the first character that is not a digit of the
/// detected radix. Input without any digits parses as 0; values too large
/// for `i64` saturate.
pub fn parse_c_integer(input: &str) -> i64 {
    let s = input.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let (radix, digits) = if let Some(hex) = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))
    {
        (16, hex)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let digits = &digits[..end];
    if digits.is_empty() {
        return 0;
    }

    let value = i64::from_str_radix(digits, radix).unwrap_or(i64::MAX);
    if negative {
        -value
    } else {
        value
    }
}

/// Check that a video device path was given and exists
pub fn validate_device_path(path: &Path) -> IkvmResult<()> {
    if path.as_os_str().is_empty() {
        return Err(IkvmError::Config("The video device path is not given".to_string()));
    }

    if !path.exists() {
        return Err(IkvmError::Config(format!(
            "The video device path is not found: {}",
            path.display()
        )));
    }

    Ok(())
}

/// Format duration for display
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

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

//! Wakeup reports

/// Boot keyboard report: modifiers, reserved, six key codes
pub const KEY_REPORT_LENGTH: usize = 8;

/// Absolute pointer report: buttons, x (le16), y (le16), wheel
pub const POINTER_REPORT_LENGTH: usize = 6;

/// Left shift bit of the keyboard modifier byte
pub const MODIFIER_LEFT_SHIFT: u8 = 0x02;

/// Centre of the absolute pointer range
pub const POINTER_CENTER: u16 = i16::MAX as u16 / 2;

/// Pointer parked mid-screen, no buttons held
pub fn pointer_wakeup_report() -> [u8; POINTER_REPORT_LENGTH] {
    let [lo, hi] = POINTER_CENTER.to_le_bytes();
    [0, lo, hi, lo, hi, 0]
}

/// Left shift press followed by its release
pub fn keyboard_wakeup_reports() -> [[u8; KEY_REPORT_LENGTH]; 2] {
    let mut press = [0u8; KEY_REPORT_LENGTH];
    press[0] = MODIFIER_LEFT_SHIFT;
    [press, [0u8; KEY_REPORT_LENGTH]]
}

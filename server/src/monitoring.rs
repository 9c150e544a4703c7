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

//! Capture metrics. Recorded through the `metrics` facade; no exporter is
//! installed here, so they cost nothing unless the embedding process adds one.

use ikvm_core::VideoResolution;
use metrics::{counter, gauge};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CaptureMetrics {
    start_time: Instant,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn record_frame(&self, payload_bytes: usize) {
        counter!("ikvm_frames_total").increment(1);
        gauge!("ikvm_frame_payload_bytes").set(payload_bytes as f64);
    }

    pub fn record_resize(&self, resolution: VideoResolution) {
        counter!("ikvm_resizes_total").increment(1);
        gauge!("ikvm_frame_width").set(resolution.width as f64);
        gauge!("ikvm_frame_height").set(resolution.height as f64);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_uptime(&self) {
        gauge!("ikvm_uptime_seconds").set(self.uptime().as_secs_f64());
    }
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self::new()
    }
}

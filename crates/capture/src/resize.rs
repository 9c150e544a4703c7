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

//! Display timing tracking and buffer pool reallocation

use crate::session::{SessionState, TimingHealth, VideoSession};
use crate::{CaptureBackend, CaptureDevice, DisplayTimings, MIN_BUFFERS, REQUESTED_BUFFERS};
use ikvm_core::InputWakeup;
use tracing::{debug, error, info, warn};

impl<B: CaptureBackend, W: InputWakeup> VideoSession<B, W> {
    /// Check the detected display timings against the negotiated resolution.
    ///
    /// Returns true when the buffers must be reallocated. A failed timing
    /// query means the input signal is gone: the session is restarted and
    /// no resize is reported.
    pub fn needs_resize(&mut self) -> bool {
        let device = match &mut self.state {
            SessionState::Stopped => return false,
            SessionState::PendingResize(_) => return true,
            SessionState::Started(device) => device,
        };

        let timings = match device.query_timings() {
            Ok(timings) => timings,
            Err(e) => {
                if self.timing_health != TimingHealth::Failing {
                    error!("Failed to query timings: {}", e);
                    self.timing_health = TimingHealth::Failing;
                }

                self.restart();
                return false;
            }
        };

        self.timing_health = TimingHealth::Healthy;

        let detected = timings.resolution();
        if detected == self.resolution {
            return false;
        }

        info!("Display timings changed from {} to {}", self.resolution, detected);
        self.resolution = detected;

        if detected.is_degenerate() {
            warn!("Failed to get new resolution: {}", detected);
        }

        self.last_frame = None;
        true
    }

    /// Reallocate the buffer pool for the current timings and (re)start streaming.
    ///
    /// Tears the old pool down only if one was mapped, then always requests,
    /// maps and queues a fresh set of buffers.
    pub fn resize(&mut self) {
        match self.state {
            SessionState::Stopped => return,
            SessionState::PendingResize(_) => {
                self.state.set_pending_resize(false);
                return;
            }
            SessionState::Started(_) => {}
        }

        let was_streaming = self.buffers.any_mapped();

        if was_streaming {
            if let Some(device) = self.state.device_mut() {
                if let Err(e) = device.stream_off() {
                    warn!("Failed to stop streaming: {}", e);
                }
            }
        }

        self.buffers.unmap_all();

        if was_streaming {
            let Some(device) = self.state.device_mut() else {
                return;
            };

            if let Err(e) = device.request_buffers(0) {
                warn!("Failed to zero streaming buffers: {}", e);
            }

            match device.query_timings() {
                Ok(timings) => {
                    if let Err(e) = device.set_timings(&timings) {
                        warn!("Failed to set timings: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to query timings, restart: {}", e);
                    self.restart();
                    return;
                }
            }

            self.buffers.clear();
        }

        self.allocate_buffers();
    }

    fn allocate_buffers(&mut self) {
        let Some(device) = self.state.device_mut() else {
            return;
        };

        let granted = match device.request_buffers(REQUESTED_BUFFERS) {
            Ok(granted) => granted,
            Err(e) => {
                error!("Failed to request streaming buffers: {}", e);
                0
            }
        };

        if granted < MIN_BUFFERS {
            warn!(
                "Driver granted {} streaming buffers, at least {} are needed",
                granted, MIN_BUFFERS
            );
        }

        self.buffers.resize(granted as usize);

        for index in 0..granted {
            let info = match device.query_buffer(index) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Failed to query buffer {}: {}", index, e);
                    continue;
                }
            };

            let mapping = match device.map_buffer(&info) {
                Ok(mapping) => mapping,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            let Some(buffer) = self.buffers.get_mut(index as usize) else {
                continue;
            };
            buffer.attach(mapping);

            match device.queue_buffer(index) {
                Ok(()) => buffer.queued = true,
                Err(e) => warn!("Failed to queue buffer {}: {}", index, e),
            }
        }

        if let Err(e) = device.stream_on() {
            error!("Failed to start streaming: {}", e);
        }

        debug!(
            "Allocated {} capture buffers for {}",
            self.buffers.len(),
            self.resolution
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::fake::*;
    use crate::session::TimingHealth;
    use ikvm_core::VideoResolution;

    #[test]
    fn test_unchanged_timings_never_reallocate() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();

        for _ in 0..5 {
            assert!(!session.needs_resize());
        }

        let hw = hw.borrow();
        assert_eq!(hw.timing_queries, 5);
        assert_eq!(hw.reqbufs.len(), 1);
        assert_eq!(hw.maps, 3);
        assert_eq!(session.buffers().queued_count(), 3);
    }

    #[test]
    fn test_resolution_change_mid_stream() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();
        hw.borrow_mut().complete(1, 4096);
        session.get_frame();
        assert!(session.data().is_some());

        hw.borrow_mut().signal = VideoResolution::fhd();
        assert!(session.needs_resize());
        assert_eq!(session.resolution(), VideoResolution::new(1920, 1080));
        assert!(session.data().is_none());
        assert!(session.frame().is_none());

        // reported once until resize consumes it
        assert!(!session.needs_resize());

        session.resize();
        {
            let hw = hw.borrow();
            assert_eq!(hw.reqbufs, vec![3, 0, 3]);
            assert_eq!(hw.set_timings, vec![VideoResolution::fhd()]);
            assert_eq!(hw.stream_offs, 1);
            assert!(hw.streaming);
            assert_eq!(hw.live_mappings(), 3);
        }

        assert_eq!(session.buffers().len(), 3);
        for buffer in session.buffers().iter() {
            assert!(buffer.is_mapped());
            assert!(buffer.is_queued());
            assert_eq!(buffer.size(), 1920 * 1080 * 4);
        }
        assert!(session.last_frame_index().is_none());
    }

    #[test]
    fn test_degenerate_resolution_is_reported() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();

        hw.borrow_mut().signal = VideoResolution::new(0, 0);
        assert!(session.needs_resize());
        assert_eq!(session.resolution(), VideoResolution::new(0, 0));
    }

    #[test]
    fn test_timing_failure_restarts_session() {
        let (mut session, hw, wakeups) = fake_session(FakeHardware::new(800, 600));
        session.start();

        hw.borrow_mut().timing_failures = 1;
        assert!(!session.needs_resize());

        assert!(session.is_started());
        assert_eq!(session.timing_health(), TimingHealth::Failing);
        assert_eq!(hw.borrow().opens, 2);
        assert_eq!(hw.borrow().closes, 1);
        assert_eq!(wakeups.get(), 2);

        assert!(!session.needs_resize());
        assert_eq!(session.timing_health(), TimingHealth::Healthy);
    }

    #[test]
    fn test_timing_failure_logged_once_per_streak() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        let logs = capture_logs(|| {
            session.start();

            hw.borrow_mut().timing_failures = 2;
            assert!(!session.needs_resize());
            assert!(!session.needs_resize());

            // a success clears the streak
            assert!(!session.needs_resize());

            hw.borrow_mut().timing_failures = 1;
            assert!(!session.needs_resize());
        });

        assert_eq!(logs.matches("Failed to query timings:").count(), 2);
        assert_eq!(hw.borrow().opens, 4);
    }

    #[test]
    fn test_resize_when_stopped_is_noop() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.resize();
        assert!(!session.needs_resize());
        assert!(hw.borrow().reqbufs.is_empty());
        assert!(session.buffers().is_empty());
    }

    #[test]
    fn test_resize_requery_failure_restarts() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();

        hw.borrow_mut().signal = VideoResolution::new(1280, 1024);
        assert!(session.needs_resize());

        hw.borrow_mut().timing_failures = 1;
        session.resize();

        let hw = hw.borrow();
        assert_eq!(hw.opens, 2);
        assert_eq!(hw.closes, 1);
        assert!(hw.set_timings.is_empty());
        assert!(hw.streaming);
        assert!(session.is_started());
        assert_eq!(session.buffers().queued_count(), 3);
    }

    #[test]
    fn test_short_buffer_grant() {
        let mut hardware = FakeHardware::new(800, 600);
        hardware.grant = 1;
        let (mut session, _, _) = fake_session(hardware);

        session.start();
        assert_eq!(session.buffers().len(), 1);
        assert_eq!(session.buffers().queued_count(), 1);
    }

    #[test]
    fn test_buffer_request_failure_counts_as_zero_granted() {
        let mut hardware = FakeHardware::new(800, 600);
        hardware.fail_reqbufs = true;
        let (mut session, hw, _) = fake_session(hardware);

        session.start();
        assert!(session.is_started());
        assert!(session.buffers().is_empty());
        {
            let hw = hw.borrow();
            assert_eq!(hw.reqbufs, vec![3]);
            assert_eq!(hw.maps, 0);
            assert!(hw.streaming);
        }

        session.get_frame();
        assert!(session.frame().is_none());

        hw.borrow_mut().fail_reqbufs = false;
        session.restart();
        assert_eq!(session.buffers().len(), 3);
        assert_eq!(session.buffers().queued_count(), 3);
    }

    #[test]
    fn test_query_buffer_failure_skips_slot() {
        let mut hardware = FakeHardware::new(800, 600);
        hardware.fail_query_buffer = Some(1);
        let (mut session, hw, _) = fake_session(hardware);

        session.start();
        assert_eq!(session.buffers().len(), 3);
        assert!(!session.buffers().get(1).unwrap().is_mapped());
        assert_eq!(session.buffers().queued_count(), 2);
        assert_eq!(hw.borrow().maps, 2);
        assert!(hw.borrow().streaming);

        hw.borrow_mut().complete(2, 321);
        session.get_frame();
        assert_eq!(session.frame().unwrap().index, 2);
        assert!(!session.buffers().get(1).unwrap().is_queued());
        assert_eq!(session.buffers().queued_count(), 1);
    }

    #[test]
    fn test_set_timings_failure_keeps_streaming() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();

        hw.borrow_mut().signal = VideoResolution::new(1280, 1024);
        assert!(session.needs_resize());

        hw.borrow_mut().fail_set_timings = true;
        let logs = capture_logs(|| session.resize());

        assert!(logs.contains("Failed to set timings"));
        assert!(session.is_started());
        assert_eq!(session.resolution(), VideoResolution::new(1280, 1024));
        assert_eq!(session.buffers().queued_count(), 3);

        let hw = hw.borrow();
        assert!(hw.set_timings.is_empty());
        assert_eq!(hw.reqbufs, vec![3, 0, 3]);
        assert_eq!(hw.opens, 1);
        assert!(hw.streaming);
    }

    #[test]
    fn test_map_failure_leaves_slot_unmapped() {
        let mut hardware = FakeHardware::new(800, 600);
        hardware.fail_map = Some(1);
        let (mut session, _, _) = fake_session(hardware);

        session.start();
        assert_eq!(session.buffers().len(), 3);
        assert!(!session.buffers().get(1).unwrap().is_mapped());
        assert!(!session.buffers().get(1).unwrap().is_queued());
        assert_eq!(session.buffers().queued_count(), 2);
    }
}

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

//! Frame acquisition

use crate::session::VideoSession;
use crate::{CaptureBackend, CaptureDevice, FRAME_WAIT_TIMEOUT};
use ikvm_core::InputWakeup;
use tracing::{debug, trace, warn};

impl<B: CaptureBackend, W: InputWakeup> VideoSession<B, W> {
    /// Pick up the newest completed frame, if any, and hand every other
    /// buffer back to the driver.
    ///
    /// The device is switched to non-blocking mode for the duration of the
    /// call so a signal lost mid-dequeue cannot hang the loop; the wait for
    /// a completed buffer is bounded by [`FRAME_WAIT_TIMEOUT`].
    pub fn get_frame(&mut self) {
        let Some(device) = self.state.device_mut() else {
            return;
        };

        let was_nonblocking = match device.set_nonblocking(true) {
            Ok(was_nonblocking) => Some(was_nonblocking),
            Err(e) => {
                warn!("Failed to switch video device to non-blocking mode: {}", e);
                None
            }
        };

        // a descriptor left blocking is only safe to dequeue once per wakeup
        let max_dequeues = if was_nonblocking.is_some() { usize::MAX } else { 1 };

        match device.wait_readable(FRAME_WAIT_TIMEOUT) {
            Ok(true) => for _ in 0..max_dequeues {
                let dequeued = match device.dequeue_buffer() {
                    Ok(dequeued) => dequeued,
                    Err(e) => {
                        if !e.is_would_block() {
                            debug!("Stopped dequeuing buffers: {}", e);
                        }
                        break;
                    }
                };

                let index = dequeued.index as usize;
                let Some(buffer) = self.buffers.get_mut(index) else {
                    warn!("Driver returned unknown buffer index {}", index);
                    continue;
                };
                buffer.queued = false;

                if dequeued.error {
                    trace!("Dropping corrupt frame in buffer {}", index);
                    buffer.payload = 0;
                    continue;
                }

                buffer.payload = dequeued.bytes_used as usize;
                self.last_frame = Some(index);
                break;
            }
            Ok(false) => trace!("No frame ready within {:?}", FRAME_WAIT_TIMEOUT),
            Err(e) => warn!("Failed waiting for video frame: {}", e),
        }

        if let Some(was_nonblocking) = was_nonblocking {
            if let Err(e) = device.set_nonblocking(was_nonblocking) {
                warn!("Failed to restore video device blocking mode: {}", e);
            }
        }

        let last_frame = self.last_frame;
        for (index, buffer) in self.buffers.iter_mut().enumerate() {
            if Some(index) == last_frame || buffer.queued || !buffer.is_mapped() {
                continue;
            }

            match device.queue_buffer(index as u32) {
                Ok(()) => buffer.queued = true,
                Err(e) => warn!("Failed to queue buffer {}: {}", index, e),
            }
        }
    }
}

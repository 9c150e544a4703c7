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

//! Frame-server driving loop

use crate::monitoring::CaptureMetrics;
use anyhow::Context;
use chrono::{DateTime, Utc};
use ikvm_capture::{CaptureBackend, Frame, VideoSession};
use ikvm_core::{format_duration, InputWakeup, PixelFormat, VideoResolution};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Pause between attempts to bring a stopped session back
pub const RESTART_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer of captured frames, the upstream transmitter in a full daemon
pub trait FrameSink {
    /// Buffers were reallocated for a new resolution
    fn on_resize(&mut self, resolution: VideoResolution);

    /// A newly completed frame; the borrow ends before the next capture cycle
    fn on_frame(&mut self, frame: &Frame<'_>);
}

/// One cycle: follow timing changes, then pick up the newest frame.
///
/// Returns true if a new frame was handed to the sink.
pub fn run_cycle<B, W, S>(session: &mut VideoSession<B, W>, sink: &mut S) -> bool
where
    B: CaptureBackend,
    W: InputWakeup,
    S: FrameSink + ?Sized,
{
    if session.needs_resize() {
        session.resize();
        sink.on_resize(session.resolution());
    }

    let previous = session.last_frame_index();
    session.get_frame();

    match session.frame() {
        Some(frame) if Some(frame.index) != previous => {
            sink.on_frame(&frame);
            true
        }
        _ => false,
    }
}

/// Drive `session` until `stop` is raised, then stop it.
///
/// Meant for a blocking worker thread: each cycle may wait up to the
/// engine's frame timeout. A session left stopped by a failed restart is
/// started again every [`RESTART_INTERVAL`].
pub fn run_frame_loop<B, W, S>(session: &mut VideoSession<B, W>, sink: &mut S, stop: &AtomicBool)
where
    B: CaptureBackend,
    W: InputWakeup,
    S: FrameSink + ?Sized,
{
    while !stop.load(Ordering::Relaxed) {
        if !session.is_started() {
            thread::sleep(RESTART_INTERVAL);
            debug!("Retrying video capture start");
            session.start();
            continue;
        }

        run_cycle(session, sink);
    }

    session.stop();
}

/// Wait for the capture worker, raising `stop` once `shutdown` fires.
///
/// If the shutdown signal cannot be listened for, the worker keeps running
/// until it exits on its own.
pub async fn supervise_worker<F>(
    mut worker: JoinHandle<anyhow::Result<()>>,
    shutdown: F,
    stop: &AtomicBool,
) -> anyhow::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    tokio::select! {
        result = &mut worker => return result.context("Capture worker panicked")?,
        result = shutdown => match result {
            Ok(()) => {
                info!("Shutdown signal received, stopping capture...");
                stop.store(true, Ordering::Relaxed);
            }
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    worker.await.context("Capture worker panicked")?
}

/// Running totals kept by [`StatsSink`]
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub frames: u64,
    pub resizes: u64,
    pub last_payload: usize,
    pub resolution: Option<VideoResolution>,
    pub pixel_format: Option<PixelFormat>,
    pub last_frame_at: Option<DateTime<Utc>>,
}

impl FrameStats {
    pub fn summary(&self, uptime: Duration) -> String {
        let resolution = self
            .resolution
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let last_frame = self
            .last_frame_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());

        format!(
            "Capture Stats: Frames={}, Resizes={}, Resolution={}, LastPayload={}B, LastFrame={}, Uptime={}",
            self.frames,
            self.resizes,
            resolution,
            self.last_payload,
            last_frame,
            format_duration(uptime)
        )
    }
}

/// Sink that only counts, standing in for a frame transmitter
pub struct StatsSink {
    stats: Arc<RwLock<FrameStats>>,
    metrics: CaptureMetrics,
}

impl StatsSink {
    pub fn new(metrics: CaptureMetrics) -> Self {
        Self {
            stats: Arc::new(RwLock::new(FrameStats::default())),
            metrics,
        }
    }

    /// Shared handle for the reporting task
    pub fn stats(&self) -> Arc<RwLock<FrameStats>> {
        Arc::clone(&self.stats)
    }
}

impl FrameSink for StatsSink {
    fn on_resize(&mut self, resolution: VideoResolution) {
        self.metrics.record_resize(resolution);

        let mut stats = self.stats.blocking_write();
        stats.resizes += 1;
        stats.resolution = Some(resolution);
    }

    fn on_frame(&mut self, frame: &Frame<'_>) {
        self.metrics.record_frame(frame.data.len());

        let mut stats = self.stats.blocking_write();
        if stats.frames == 0 {
            info!(
                "First frame: {} {}, {} bits per sample, {} samples per pixel, {} bytes per pixel",
                frame.resolution,
                frame.pixel_format,
                frame.bits_per_sample(),
                frame.samples_per_pixel(),
                frame.bytes_per_pixel()
            );
        }
        stats.frames += 1;
        stats.last_payload = frame.data.len();
        stats.resolution = Some(frame.resolution);
        stats.pixel_format = Some(frame.pixel_format);
        stats.last_frame_at = Some(Utc::now());
    }
}

/// Log the statistics every `interval`, forever
pub async fn report_stats(stats: Arc<RwLock<FrameStats>>, metrics: CaptureMetrics, interval: Duration) {
    let mut interval = tokio::time::interval(interval);
    interval.tick().await;

    loop {
        interval.tick().await;
        metrics.record_uptime();
        info!("{}", stats.read().await.summary(metrics.uptime()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikvm_capture::fake::{fake_session, FakeHardware};

    #[derive(Default)]
    struct RecordingSink {
        resizes: Vec<VideoResolution>,
        frames: Vec<(usize, usize)>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl FrameSink for RecordingSink {
        fn on_resize(&mut self, resolution: VideoResolution) {
            self.resizes.push(resolution);
        }

        fn on_frame(&mut self, frame: &Frame<'_>) {
            self.frames.push((frame.index, frame.data.len()));
            if let Some((count, stop)) = &self.stop_after {
                if self.frames.len() >= *count {
                    stop.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    #[test]
    fn test_cycle_delivers_only_new_frames() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();
        let mut sink = RecordingSink::default();

        assert!(!run_cycle(&mut session, &mut sink));

        hw.borrow_mut().complete(0, 1234);
        assert!(run_cycle(&mut session, &mut sink));
        assert!(!run_cycle(&mut session, &mut sink));

        hw.borrow_mut().complete(1, 99);
        assert!(run_cycle(&mut session, &mut sink));

        assert_eq!(sink.frames, vec![(0, 1234), (1, 99)]);
        assert!(sink.resizes.is_empty());
    }

    #[test]
    fn test_cycle_reports_resize() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();
        let mut sink = RecordingSink::default();

        hw.borrow_mut().signal = VideoResolution::new(1280, 1024);
        run_cycle(&mut session, &mut sink);

        assert_eq!(sink.resizes, vec![VideoResolution::new(1280, 1024)]);
        assert_eq!(session.buffers().queued_count(), 3);
    }

    #[test]
    fn test_loop_stops_session_when_flag_raised() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();
        hw.borrow_mut().complete(2, 64);

        let stop = Arc::new(AtomicBool::new(false));
        let mut sink = RecordingSink {
            stop_after: Some((1, Arc::clone(&stop))),
            ..Default::default()
        };

        run_frame_loop(&mut session, &mut sink, &stop);

        assert_eq!(sink.frames, vec![(2, 64)]);
        assert!(!session.is_started());
        assert_eq!(hw.borrow().closes, 1);
        assert_eq!(hw.borrow().live_mappings(), 0);
    }

    #[test]
    fn test_loop_with_flag_already_raised() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();
        let stop = AtomicBool::new(true);

        run_frame_loop(&mut session, &mut RecordingSink::default(), &stop);
        assert!(!session.is_started());
        assert_eq!(hw.borrow().timing_queries, 0);
    }

    #[test]
    fn test_stats_sink_counts() {
        let (mut session, hw, _) = fake_session(FakeHardware::new(800, 600));
        session.start();
        let mut sink = StatsSink::new(CaptureMetrics::new());
        let stats = sink.stats();

        hw.borrow_mut().complete(0, 500);
        run_cycle(&mut session, &mut sink);
        hw.borrow_mut().signal = VideoResolution::fhd();
        run_cycle(&mut session, &mut sink);

        let stats = stats.blocking_read();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.resizes, 1);
        assert_eq!(stats.last_payload, 500);
        assert_eq!(stats.resolution, Some(VideoResolution::fhd()));
        assert!(stats.last_frame_at.is_some());
    }

    #[test]
    fn test_stats_summary() {
        let stats = FrameStats {
            frames: 42,
            resizes: 1,
            last_payload: 2048,
            resolution: Some(VideoResolution::new(1024, 768)),
            ..Default::default()
        };

        let summary = stats.summary(Duration::from_secs(5));
        assert!(summary.contains("Frames=42"));
        assert!(summary.contains("Resolution=1024x768"));
        assert!(summary.contains("LastPayload=2048B"));
        assert!(summary.contains("LastFrame=never"));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_worker() {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = tokio::task::spawn_blocking({
            let stop = Arc::clone(&stop);
            move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
        });

        supervise_worker(worker, async { Ok(()) }, &stop)
            .await
            .unwrap();
        assert!(stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_signal_listener_failure_keeps_worker_running() {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = tokio::task::spawn_blocking({
            let stop = Arc::clone(&stop);
            move || {
                thread::sleep(Duration::from_millis(50));
                if stop.load(Ordering::Relaxed) {
                    anyhow::bail!("worker was stopped");
                }
                Ok(())
            }
        });

        let unavailable = async { Err(io::Error::new(io::ErrorKind::Other, "no signal handler")) };
        supervise_worker(worker, unavailable, &stop).await.unwrap();
        assert!(!stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_worker_error_is_returned() {
        let stop = AtomicBool::new(false);
        let worker =
            tokio::task::spawn_blocking(|| -> anyhow::Result<()> { anyhow::bail!("no device") });

        let result = supervise_worker(worker, std::future::pending(), &stop).await;
        assert!(result.unwrap_err().to_string().contains("no device"));
        assert!(!stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_stats_are_readable_from_async_side() {
        let sink = StatsSink::new(CaptureMetrics::new());
        let stats = sink.stats();

        let mut sink = sink;
        tokio::task::spawn_blocking(move || {
            sink.on_resize(VideoResolution::svga());
        })
        .await
        .unwrap();

        let stats = stats.read().await;
        assert_eq!(stats.resizes, 1);
        assert_eq!(stats.resolution, Some(VideoResolution::svga()));
    }
}

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

//! # IKVM Server
//!
//! Capture daemon: opens the video device, keeps it streaming through
//! signal loss and resolution changes, and feeds frames to a sink.

mod cli;
mod frame_loop;
mod monitoring;

use anyhow::Context;
use ikvm_core::{CaptureConfig, CaptureConfigFile};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often the frame statistics are logged
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if std::env::args_os().len() <= 1 {
        eprintln!("{}", cli::build_cli().render_help());
        std::process::exit(1);
    }

    let matches = cli::build_cli().get_matches();
    let options = cli::CliOptions::from_matches(&matches);
    let config = cli::resolve_config(&options)?;

    if let Some(path) = &options.save_config {
        CaptureConfigFile::from(config.clone())
            .save(path)
            .with_context(|| format!("Failed to save configuration {}", path.display()))?;
        info!("Configuration saved to {}", path.display());
    }

    config.validate().context("Invalid capture configuration")?;

    info!("Starting IKVM capture daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {:?}", config);

    run(config).await?;

    info!("IKVM capture daemon stopped");
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run(config: CaptureConfig) -> anyhow::Result<()> {
    use frame_loop::{report_stats, run_frame_loop, supervise_worker, StatsSink};
    use ikvm_capture::{v4l2::V4l2Backend, VideoSession};
    use ikvm_core::{InputWakeup, NoopWakeup};
    use ikvm_input::HidGadget;
    use monitoring::CaptureMetrics;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::signal;

    let capture_metrics = CaptureMetrics::new();
    let mut sink = StatsSink::new(capture_metrics.clone());
    let reporter = tokio::spawn(report_stats(sink.stats(), capture_metrics, STATS_INTERVAL));

    let stop = Arc::new(AtomicBool::new(false));

    // mapped buffers never leave the worker thread
    let worker = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        move || -> anyhow::Result<()> {
            let input: Box<dyn InputWakeup> =
                if config.keyboard_device.is_none() && config.pointer_device.is_none() {
                    info!("No HID gadget configured, skipping input wakeups");
                    Box::new(NoopWakeup)
                } else {
                    Box::new(HidGadget::from_config(&config))
                };
            let mut session = VideoSession::new(V4l2Backend::new(), input, &config);

            session.start();
            if !session.is_started() {
                anyhow::bail!(
                    "Failed to start video capture on {}",
                    config.video_device.display()
                );
            }

            run_frame_loop(&mut session, &mut sink, &stop);
            Ok(())
        }
    });

    let result = supervise_worker(worker, signal::ctrl_c(), &stop).await;
    reporter.abort();
    result
}

#[cfg(not(target_os = "linux"))]
async fn run(config: CaptureConfig) -> anyhow::Result<()> {
    anyhow::bail!(
        "Video capture from {} requires Video4Linux2",
        config.video_device.display()
    )
}

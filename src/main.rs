mod config;
mod model_download;
mod osc;
mod pipeline;
mod signals;
mod tracker;
mod types;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;

use config::Config;

const FPS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Stream body pose and facial expression from a webcam as OSC messages.
#[derive(Parser, Debug)]
#[command(name = "body-tracker", version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera index (overrides config)
    #[arg(long)]
    camera: Option<u32>,

    /// OSC destination host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// OSC destination port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// List available cameras and exit
    #[arg(long)]
    list_cameras: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if args.list_cameras {
        return list_cameras();
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(index) = args.camera {
        config.camera.index = index;
    }
    if let Some(host) = args.host {
        config.osc.host = host;
    }
    if let Some(port) = args.port {
        config.osc.port = port;
    }

    run(config)
}

#[cfg(feature = "camera-nokhwa")]
fn list_cameras() -> Result<()> {
    let cameras = pipeline::available_cameras().context("failed to query cameras")?;
    if cameras.is_empty() {
        println!("no cameras found");
    }
    for camera in cameras {
        println!("{}: {}", camera.index, camera.label);
    }
    Ok(())
}

#[cfg(not(feature = "camera-nokhwa"))]
fn list_cameras() -> Result<()> {
    anyhow::bail!("built without camera support; enable the `camera-nokhwa` feature")
}

#[cfg(feature = "camera-nokhwa")]
fn run(config: Config) -> Result<()> {
    use osc::OscTransmitter;
    use pipeline::{NokhwaOpener, OrtBackend};
    use tracker::BodyTracker;

    let sink = OscTransmitter::new(&config.osc.host, config.osc.port)
        .context("failed to set up OSC transmitter")?;
    log::info!("sending OSC to {}", sink.target());

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        log::info!("interrupted");
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let mut tracker = BodyTracker::new(
        NokhwaOpener,
        OrtBackend::from_config(&config.models),
        sink,
        config.capture.tracker_settings(),
    );
    tracker
        .start(config.camera.index)
        .context("failed to start tracking")?;
    log::info!("tracking started, press Ctrl-C to stop");

    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) && tracker.is_running() {
        thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= FPS_LOG_INTERVAL {
            log::info!("FPS: {:.1}", tracker.fps());
            last_report = Instant::now();
        }
    }

    tracker.stop();
    Ok(())
}

#[cfg(not(feature = "camera-nokhwa"))]
fn run(_config: Config) -> Result<()> {
    anyhow::bail!("built without camera support; enable the `camera-nokhwa` feature")
}

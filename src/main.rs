//! livecam: relay the freshest frame of a network camera stream to a viewer

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use livecam::capture::{FrameSource, SyntheticSource};
use livecam::display::Sdl2Display;
use livecam::utils::redact_descriptor;
use livecam::{Config, Grab, LiveFrameBuffer, SlotStats};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("livecam=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("livecam launching...");

    // Load configuration: defaults < optional TOML file < LIVECAM__* env
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    livecam::CONFIG.store(Arc::new(config.clone()));

    let descriptor = config.stream.descriptor();
    info!("Using stream: {}", redact_descriptor(&descriptor));

    if descriptor.starts_with("synthetic://") {
        run::<SyntheticSource>(&descriptor, &config).await
    } else {
        run_network(&descriptor, &config).await
    }
}

#[cfg(feature = "gstreamer-pipeline")]
async fn run_network(descriptor: &str, config: &Config) -> Result<()> {
    run::<livecam::capture::GstCapture>(descriptor, config).await
}

#[cfg(not(feature = "gstreamer-pipeline"))]
async fn run_network(_descriptor: &str, _config: &Config) -> Result<()> {
    Err(color_eyre::eyre::eyre!(
        "network streams require the gstreamer-pipeline feature"
    ))
}

async fn run<S: FrameSource>(descriptor: &str, config: &Config) -> Result<()> {
    let buffer = LiveFrameBuffer::<S>::open(descriptor)?;
    buffer.start()?;

    let result = if config.display.enabled {
        show(&buffer, config)
    } else {
        headless(&buffer, config).await
    };

    buffer.stop();
    buffer.join();

    let stats = buffer.stats();
    info!(
        frames = stats.frames,
        misses = stats.misses,
        "livecam shutting down"
    );
    result
}

fn show<S: FrameSource>(buffer: &LiveFrameBuffer<S>, config: &Config) -> Result<()> {
    let sdl_context = sdl2::init().map_err(|e| color_eyre::eyre::eyre!(e))?;
    let poll_interval = Duration::from_millis(config.pipeline.poll_interval_ms);

    let mut display = Sdl2Display::new(&sdl_context, &config.display, poll_interval)?;
    display.run(&sdl_context, buffer)
}

/// Log buffer health periodically until Ctrl-C
async fn headless<S: FrameSource>(buffer: &LiveFrameBuffer<S>, config: &Config) -> Result<()> {
    let period = Duration::from_millis(config.pipeline.stats_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    let mut last = SlotStats::default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                info!("Ctrl-C received");
                break;
            }
            _ = ticker.tick() => {
                let stats = buffer.stats();
                let fps = (stats.frames - last.frames) as f64 / period.as_secs_f64();
                match buffer.read() {
                    Grab::Frame(frame) => info!(
                        sequence = frame.sequence(),
                        age_ms = frame.age().as_millis() as u64,
                        fps,
                        misses = stats.misses,
                        "Latest {}x{} frame",
                        frame.meta.width,
                        frame.meta.height,
                    ),
                    Grab::Missed => warn!(streak = stats.miss_streak, "Failed to get frame"),
                    Grab::Pending => info!("Waiting for first frame"),
                }
                last = stats;
            }
        }
    }

    Ok(())
}

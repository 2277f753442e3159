//! GigE camera capture demo
//!
//! Connects to the simulated camera driver, streams frames for a moment,
//! and reports queue statistics. Settings come from `gigecam.toml` or
//! `GIGECAM_*` environment variables when present.

use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};

use gigecam::sim::{SimConfig, SimulatedCamera};
use gigecam::{Camera, CameraConfig};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("gigecam=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("gigecam starting");

    // Load configuration
    let camera_config: CameraConfig = config::Config::builder()
        .set_default("address", "192.168.100.2")?
        .set_default("local_address", "192.168.100.1")?
        .add_source(config::File::with_name("gigecam").required(false))
        .add_source(config::Environment::with_prefix("GIGECAM"))
        .build()?
        .try_deserialize()?;

    let driver = SimulatedCamera::new(SimConfig {
        frame_interval: Some(Duration::from_millis(200)),
        ..SimConfig::default()
    });

    let camera = Camera::connect(driver, &camera_config)?;
    let meta = camera.metadata().clone();
    info!(
        camera = %meta.name,
        width = meta.width,
        height = meta.height,
        depth = meta.depth,
        "connected"
    );

    // Capture 5 frames per second with a 40 ms exposure.
    camera.set_frame_rate(5.0)?;
    camera.set_exposure(40.0)?;

    for _ in 0..10 {
        match camera.poll(Some(Duration::from_secs(2))) {
            Ok(frame) => info!(
                bytes = frame.data.len(),
                at_secs = frame.timestamp_secs(meta.tick_frequency),
                pending = camera.pending(),
                "frame"
            ),
            Err(err) => {
                warn!(%err, "frame wait failed");
                break;
            }
        }
    }

    let stats = camera.queue_stats();
    info!(
        delivered = stats.pushed,
        dropped = stats.dropped,
        "capture finished"
    );

    camera.disconnect();
    info!("gigecam shutting down");
    Ok(())
}

// src/main.rs

use anyhow::Context;
use evdi_vnc::bridge::Bridge;
use evdi_vnc::config::Config;
use evdi_vnc::{device, os, transport};
use log::info;

/// Main entry point for the `evdi-vnc` bridge.
fn main() -> anyhow::Result<()> {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting evdi-vnc...");

    let config = Config::load_or_default();

    os::signal::install_shutdown_handler()
        .context("Failed to install the SIGINT handler")?;

    // --- Device subsystem ---
    #[cfg(feature = "evdi")]
    let subsystem = device::evdi::EvdiSubsystem::new();
    #[cfg(not(feature = "evdi"))]
    let subsystem = device::sim::SimSubsystem::new();
    #[cfg(not(feature = "evdi"))]
    info!("Built without the evdi feature; serving the simulated display");

    let mut dev = device::open_device(&subsystem)
        .context("Failed to open a virtual display device")?;

    // --- Viewer transport ---
    #[cfg(feature = "rfb")]
    let mut viewer = transport::rfb::RfbTransport::new(&config.server)
        .context("Failed to initialize the RFB transport")?;
    #[cfg(not(feature = "rfb"))]
    let mut viewer = transport::headless::HeadlessTransport::new();

    // --- Bridge ---
    let mut bridge = Bridge::new(
        &mut *dev,
        &mut viewer,
        os::signal::shutdown_flag(),
        &config,
    );

    // The transport cannot start before the device's native mode (and hence
    // the framebuffer size) is known.
    match bridge
        .wait_initial_mode()
        .context("Failed while waiting for the device's first mode")?
    {
        Some(mode) => info!("Serving a {}x{} display", mode.width, mode.height),
        None => {
            info!("Shutdown requested before the device announced a mode");
            return Ok(());
        }
    }

    bridge
        .start_transport()
        .context("Failed to start the viewer transport")?;

    bridge.run()?;

    info!("evdi-vnc exited cleanly");
    Ok(())
}

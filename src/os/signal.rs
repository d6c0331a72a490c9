// src/os/signal.rs

//! SIGINT handling.
//!
//! The handler only flips an atomic flag; the bridge loop observes it
//! within one iteration's worth of bounded poll timeouts and exits through
//! its normal teardown path. No other signals are handled.

use anyhow::{Context, Result};
use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::AtomicBool;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
}

/// Install the SIGINT handler. Call once at startup, before the loop.
pub fn install_shutdown_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .context("sigaction(SIGINT) failed")?;
    debug!("SIGINT handler installed");
    Ok(())
}

/// The flag the loop watches.
pub fn shutdown_flag() -> &'static AtomicBool {
    &SHUTDOWN_REQUESTED
}

// src/clients.rs
//! Viewer connection reference counting.
//!
//! The virtual display is only attached, and therefore only consuming
//! device resources and announcing modes, while at least one viewer is
//! watching. `ClientGate` owns that policy: attach on the 0→1 transition,
//! detach on 1→0, nothing in between.

use crate::device::{DeviceHandle, DISPLAY_IDENTITY};
use log::{debug, info, warn};

#[derive(Debug, Default)]
pub struct ClientGate {
    connected: u32,
}

impl ClientGate {
    pub fn new() -> Self {
        ClientGate::default()
    }

    /// Count of live viewer connections.
    pub fn connection_count(&self) -> u32 {
        self.connected
    }

    /// Whether the device session is currently attached.
    pub fn active(&self) -> bool {
        self.connected > 0
    }

    /// A viewer connected. Attaches to the device before the first viewer
    /// is admitted.
    pub fn client_connected(&mut self, dev: &mut dyn DeviceHandle) {
        if self.connected == 0 {
            info!("First viewer connected; attaching to the virtual display");
            dev.connect(&DISPLAY_IDENTITY);
        }
        self.connected += 1;
        debug!("Viewer connected ({} active)", self.connected);
    }

    /// A viewer went away. Detaches once the last one is gone. The count
    /// can never go negative; a spurious disconnect is logged and dropped.
    pub fn client_disconnected(&mut self, dev: &mut dyn DeviceHandle) {
        if self.connected == 0 {
            warn!("Viewer disconnect reported with no connections tracked");
            return;
        }
        self.connected -= 1;
        debug!("Viewer disconnected ({} active)", self.connected);
        if self.connected == 0 {
            info!("Last viewer gone; detaching from the virtual display");
            dev.disconnect();
        }
    }

    /// Unconditional Active→Idle transition, used at shutdown.
    pub fn force_idle(&mut self, dev: &mut dyn DeviceHandle) {
        if self.connected > 0 {
            self.connected = 0;
            dev.disconnect();
        }
    }
}

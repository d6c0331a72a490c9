// src/device/sim.rs
//! In-process simulated virtual display.
//!
//! Fills the `DeviceSubsystem`/`DeviceHandle` seam when the `evdi` feature
//! is off: one always-available slot whose device announces a fixed 720p
//! mode on attach and paints a scrolling color band on every refresh, so a
//! connected viewer sees motion end to end without any kernel module.

use super::{
    DeviceError, DeviceEvent, DeviceHandle, DeviceSubsystem, Mode, PixelBuffer, Rect, SlotStatus,
};
use log::{debug, trace};
use std::collections::VecDeque;
use std::time::Duration;

const SIM_MODE: Mode = Mode {
    width: 1280,
    height: 720,
    bits_per_pixel: 32,
    refresh_rate: 60,
};

/// Height in pixels of the band repainted per refresh.
const BAND_HEIGHT: u32 = 16;

pub struct SimSubsystem;

impl SimSubsystem {
    pub fn new() -> Self {
        SimSubsystem
    }
}

impl DeviceSubsystem for SimSubsystem {
    fn slot_count(&self) -> usize {
        1
    }

    fn probe(&self, slot: usize) -> SlotStatus {
        if slot == 0 {
            SlotStatus::Available
        } else {
            SlotStatus::Unrecognized
        }
    }

    fn create_device(&self) -> bool {
        false
    }

    fn open(&self, slot: usize) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        if slot != 0 {
            return Err(DeviceError::OpenFailed(slot));
        }
        Ok(Box::new(SimDevice::new()))
    }
}

pub struct SimDevice {
    connected: bool,
    registered: Vec<i32>,
    events: VecDeque<DeviceEvent>,
    frame: u64,
    pending: Option<Rect>,
}

impl SimDevice {
    fn new() -> Self {
        SimDevice {
            connected: false,
            registered: Vec::new(),
            events: VecDeque::new(),
            frame: 0,
            pending: None,
        }
    }
}

impl DeviceHandle for SimDevice {
    fn connect(&mut self, identity: &[u8]) {
        debug!("sim: attached ({}-byte identity)", identity.len());
        self.connected = true;
        // The real device re-announces its mode on every attach.
        self.events.push_back(DeviceEvent::ModeChanged(SIM_MODE));
    }

    fn disconnect(&mut self) {
        debug!("sim: detached");
        self.connected = false;
        self.events.clear();
    }

    fn register_buffer(&mut self, buffer: &PixelBuffer) {
        trace!("sim: buffer {} registered", buffer.id);
        self.registered.push(buffer.id);
    }

    fn unregister_buffer(&mut self, id: i32) {
        trace!("sim: buffer {} unregistered", id);
        self.registered.retain(|&b| b != id);
    }

    fn request_update(&mut self, buffer: &mut PixelBuffer) -> bool {
        if !self.connected || !self.registered.contains(&buffer.id) {
            return false;
        }
        let bands = buffer.height / BAND_HEIGHT.min(buffer.height).max(1);
        let y = (self.frame % u64::from(bands.max(1))) as u32 * BAND_HEIGHT;
        let color = [
            (self.frame * 11 % 256) as u8,
            (self.frame * 17 % 256) as u8,
            (self.frame * 29 % 256) as u8,
            0xff,
        ];
        let rows = BAND_HEIGHT.min(buffer.height - y);
        for row in y..y + rows {
            let start = row as usize * buffer.stride;
            for px in buffer.data[start..start + buffer.stride].chunks_exact_mut(4) {
                px.copy_from_slice(&color);
            }
        }
        self.pending = Some(Rect {
            x1: 0,
            y1: y as i32,
            x2: buffer.width as i32,
            y2: (y + rows) as i32 - 1,
        });
        self.frame += 1;
        true
    }

    fn grab_changed_rects(&mut self, out: &mut Vec<Rect>) {
        out.clear();
        if let Some(rect) = self.pending.take() {
            out.push(rect);
        }
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        if !timeout.is_zero() {
            // Honour the caller's bounded wait; nothing arrives on its own.
            std::thread::sleep(timeout);
        }
        Ok(self.events.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::open_device;

    #[test]
    fn announces_a_mode_on_every_attach() {
        let subsystem = SimSubsystem::new();
        let mut dev = open_device(&subsystem).unwrap();
        dev.connect(&[0u8; 4]);
        let event = dev.poll_event(Duration::ZERO).unwrap();
        assert_eq!(event, Some(DeviceEvent::ModeChanged(SIM_MODE)));
        dev.disconnect();
        dev.connect(&[0u8; 4]);
        let event = dev.poll_event(Duration::ZERO).unwrap();
        assert_eq!(event, Some(DeviceEvent::ModeChanged(SIM_MODE)));
    }

    #[test]
    fn refresh_paints_only_the_reported_band() {
        let mut dev = SimDevice::new();
        dev.connect(&[]);
        let mut buffer = PixelBuffer::for_mode(0, &SIM_MODE);
        dev.register_buffer(&buffer);

        assert!(dev.request_update(&mut buffer));
        let mut rects = Vec::new();
        dev.grab_changed_rects(&mut rects);
        assert_eq!(rects.len(), 1);
        let rect = rects[0];
        assert_eq!(rect.x1, 0);
        assert_eq!(rect.x2, SIM_MODE.width as i32);

        // Rows outside the band stay untouched.
        let outside = (rect.y2 as usize + 1) * buffer.stride;
        assert!(buffer.data[outside..outside + buffer.stride]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn refresh_is_refused_while_detached() {
        let mut dev = SimDevice::new();
        let mut buffer = PixelBuffer::for_mode(0, &SIM_MODE);
        dev.register_buffer(&buffer);
        assert!(!dev.request_update(&mut buffer));
    }
}

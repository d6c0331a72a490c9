// src/device/mod.rs
//! Virtual display device seam.
//!
//! Everything the bridge needs from the kernel-emulated display adapter is
//! expressed through two traits: `DeviceSubsystem` (slot enumeration and
//! device creation, used once at startup) and `DeviceHandle` (the opened
//! device). The real subsystem is the libevdi binding in `evdi`, compiled in
//! with the `evdi` cargo feature; `sim` is an in-process stand-in that lets
//! the binary run, and the loop be tested, without the kernel module.

pub mod sim;

#[cfg(feature = "evdi")]
pub mod evdi;

use log::{debug, info};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on changed rectangles reported with a single update.
pub const MAX_DIRTY_RECTS: usize = 16;

/// Display identity blob sent to the device when attaching. A fixed EDID for
/// a 720p HDMI TV, taken from the Chromium autotest EDID corpus; a real
/// deployment would negotiate this per display.
pub const DISPLAY_IDENTITY: [u8; 256] = [
    0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x4e, 0x84, 0x5d, 0x00,
    0x01, 0x00, 0x00, 0x00, 0x01, 0x15, 0x01, 0x03, 0x80, 0x31, 0x1c, 0x78,
    0x2a, 0x0d, 0xc9, 0xa0, 0x57, 0x47, 0x98, 0x27, 0x12, 0x48, 0x4c, 0x20,
    0x00, 0x00, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01,
    0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x1d, 0x00, 0x72, 0x51, 0xd0,
    0x1e, 0x20, 0x46, 0x28, 0x55, 0x00, 0xe8, 0x12, 0x11, 0x00, 0x00, 0x18,
    0x8c, 0x0a, 0xd0, 0x8a, 0x20, 0xe0, 0x2d, 0x10, 0x10, 0x3e, 0x96, 0x00,
    0xe8, 0x12, 0x11, 0x00, 0x00, 0x18, 0x00, 0x00, 0x00, 0xfc, 0x00, 0x48,
    0x44, 0x4d, 0x49, 0x20, 0x54, 0x56, 0x0a, 0x20, 0x20, 0x20, 0x20, 0x20,
    0x00, 0x00, 0x00, 0xfd, 0x00, 0x31, 0x3d, 0x0f, 0x2e, 0x08, 0x00, 0x0a,
    0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x01, 0x8e, 0x02, 0x03, 0x1d, 0x71,
    0x47, 0x01, 0x02, 0x03, 0x84, 0x11, 0x12, 0x13, 0x23, 0x09, 0x07, 0x07,
    0x83, 0x01, 0x00, 0x00, 0x68, 0x03, 0x0c, 0x00, 0x10, 0x00, 0xb8, 0x2d,
    0x00, 0x01, 0x1d, 0x00, 0x72, 0x51, 0xd0, 0x1e, 0x20, 0x6e, 0x28, 0x55,
    0x00, 0xe8, 0x12, 0x11, 0x00, 0x00, 0x1e, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x39,
];

/// Fatal device faults. Anything here aborts the process; transient
/// conditions (no pending update, an empty rectangle batch) are plain
/// no-op returns on the trait methods instead.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no virtual display device is available and none could be created")]
    NoDeviceAvailable,
    #[error("failed to open virtual display device slot {0}")]
    OpenFailed(usize),
    #[error("device announced {0} bits per pixel; only 32 is supported")]
    UnsupportedMode(u32),
    #[error("device event channel error")]
    Io(#[from] std::io::Error),
}

/// A display configuration the device is emulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub refresh_rate: u32,
}

impl Mode {
    /// Row stride in bytes for buffers carrying this mode.
    pub fn stride(&self) -> usize {
        (self.bits_per_pixel as usize / 8) * self.width as usize
    }
}

/// A changed region reported by the device.
///
/// The device's convention is asymmetric and is preserved everywhere: a
/// rectangle covers `x2 - x1` pixels per row starting at `x1`, over the
/// inclusive row range `y1..=y2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// One pixel buffer registered with the device. The device writes into its
/// storage only in response to an explicit update request, never
/// unsolicited, and only while it stays registered.
#[derive(Debug)]
pub struct PixelBuffer {
    pub id: i32,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub data: Box<[u8]>,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer sized for `mode`.
    pub fn for_mode(id: i32, mode: &Mode) -> Self {
        let stride = mode.stride();
        PixelBuffer {
            id,
            width: mode.width,
            height: mode.height,
            stride,
            data: vec![0u8; mode.height as usize * stride].into_boxed_slice(),
        }
    }
}

/// Notifications posted on the device's event channel, dispatched
/// exhaustively by the bridge loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The emulated display switched modes; buffers must be rebuilt.
    ModeChanged(Mode),
    /// A previously requested update landed in the given buffer.
    UpdateReady(i32),
    /// DPMS power state changed. Acknowledged only.
    PowerChanged(i32),
    /// CRTC enable state changed. Acknowledged only.
    DisplayChanged(i32),
}

/// Availability of one device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    Unavailable,
    Unrecognized,
}

/// Entry points of the virtual-display subsystem, used before a handle
/// exists.
pub trait DeviceSubsystem {
    /// How many device slots the platform currently exposes.
    fn slot_count(&self) -> usize;
    /// Probe one slot for availability.
    fn probe(&self, slot: usize) -> SlotStatus;
    /// Ask the subsystem to create a fresh device. Returns false when refused.
    fn create_device(&self) -> bool;
    /// Open the device in `slot`.
    fn open(&self, slot: usize) -> Result<Box<dyn DeviceHandle>, DeviceError>;
}

/// An opened virtual display device. Exactly one exists per process; the
/// underlying handle is released when the box is dropped.
pub trait DeviceHandle {
    /// Establish the logical session, announcing `identity` (an EDID blob)
    /// to the kernel. The device starts posting events after this.
    fn connect(&mut self, identity: &[u8]);

    /// Tear the logical session down. The handle itself stays open.
    fn disconnect(&mut self);

    /// Make `buffer` addressable by the device under `buffer.id`.
    fn register_buffer(&mut self, buffer: &PixelBuffer);

    /// Withdraw the buffer with `id` from the device. Must happen before the
    /// buffer's storage is dropped.
    fn unregister_buffer(&mut self, id: i32);

    /// Ask the device to refresh `buffer`. Returns true when new pixels were
    /// written synchronously; otherwise an `UpdateReady` event follows once
    /// the refresh lands.
    fn request_update(&mut self, buffer: &mut PixelBuffer) -> bool;

    /// Fetch the changed-rectangle batch for the most recent update into
    /// `out` (cleared first; at most `MAX_DIRTY_RECTS` entries).
    fn grab_changed_rects(&mut self, out: &mut Vec<Rect>);

    /// Wait up to `timeout` for the next notification. Returns queued
    /// events immediately without waiting.
    fn poll_event(&mut self, timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError>;
}

/// Locate an available device slot and open it, creating a device if none
/// exists.
///
/// Probing before creating avoids spawning a new kernel device when an idle
/// one can be reused; the create-then-reprobe step runs exactly once, so a
/// subsystem that refuses creation cannot loop us forever.
pub fn open_device(
    subsystem: &dyn DeviceSubsystem,
) -> Result<Box<dyn DeviceHandle>, DeviceError> {
    let slot = match find_available_slot(subsystem) {
        Some(slot) => slot,
        None => {
            info!("No idle virtual display device found; requesting a new one");
            if !subsystem.create_device() {
                return Err(DeviceError::NoDeviceAvailable);
            }
            find_available_slot(subsystem).ok_or(DeviceError::NoDeviceAvailable)?
        }
    };
    debug!("Opening virtual display device slot {}", slot);
    subsystem.open(slot)
}

fn find_available_slot(subsystem: &dyn DeviceSubsystem) -> Option<usize> {
    (0..subsystem.slot_count()).find(|&slot| subsystem.probe(slot) == SlotStatus::Available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ScriptedSubsystem {
        slots: RefCell<Vec<SlotStatus>>,
        create_allowed: bool,
        create_calls: RefCell<usize>,
        opened: RefCell<Vec<usize>>,
        fail_open: bool,
    }

    impl ScriptedSubsystem {
        fn new(slots: Vec<SlotStatus>, create_allowed: bool) -> Self {
            ScriptedSubsystem {
                slots: RefCell::new(slots),
                create_allowed,
                create_calls: RefCell::new(0),
                opened: RefCell::new(Vec::new()),
                fail_open: false,
            }
        }
    }

    struct NullDevice;

    impl DeviceHandle for NullDevice {
        fn connect(&mut self, _identity: &[u8]) {}
        fn disconnect(&mut self) {}
        fn register_buffer(&mut self, _buffer: &PixelBuffer) {}
        fn unregister_buffer(&mut self, _id: i32) {}
        fn request_update(&mut self, _buffer: &mut PixelBuffer) -> bool {
            false
        }
        fn grab_changed_rects(&mut self, out: &mut Vec<Rect>) {
            out.clear();
        }
        fn poll_event(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<DeviceEvent>, DeviceError> {
            Ok(None)
        }
    }

    impl DeviceSubsystem for ScriptedSubsystem {
        fn slot_count(&self) -> usize {
            self.slots.borrow().len()
        }

        fn probe(&self, slot: usize) -> SlotStatus {
            self.slots.borrow()[slot]
        }

        fn create_device(&self) -> bool {
            *self.create_calls.borrow_mut() += 1;
            if self.create_allowed {
                self.slots.borrow_mut().push(SlotStatus::Available);
            }
            self.create_allowed
        }

        fn open(&self, slot: usize) -> Result<Box<dyn DeviceHandle>, DeviceError> {
            if self.fail_open {
                return Err(DeviceError::OpenFailed(slot));
            }
            self.opened.borrow_mut().push(slot);
            Ok(Box::new(NullDevice))
        }
    }

    #[test]
    fn reuses_the_first_available_slot_without_creating() {
        let subsystem = ScriptedSubsystem::new(
            vec![
                SlotStatus::Unrecognized,
                SlotStatus::Available,
                SlotStatus::Available,
            ],
            true,
        );
        open_device(&subsystem).unwrap();
        assert_eq!(*subsystem.create_calls.borrow(), 0);
        assert_eq!(*subsystem.opened.borrow(), vec![1]);
    }

    #[test]
    fn creates_a_device_when_no_slot_is_available() {
        let subsystem =
            ScriptedSubsystem::new(vec![SlotStatus::Unrecognized, SlotStatus::Unavailable], true);
        open_device(&subsystem).unwrap();
        assert_eq!(*subsystem.create_calls.borrow(), 1);
        assert_eq!(*subsystem.opened.borrow(), vec![2]);
    }

    #[test]
    fn fails_when_creation_is_refused() {
        let subsystem = ScriptedSubsystem::new(vec![SlotStatus::Unavailable], false);
        let err = open_device(&subsystem).err().unwrap();
        assert!(matches!(err, DeviceError::NoDeviceAvailable));
        // Exactly one creation attempt; no unbounded retry.
        assert_eq!(*subsystem.create_calls.borrow(), 1);
    }

    #[test]
    fn reports_open_failures_distinctly() {
        let mut subsystem = ScriptedSubsystem::new(vec![SlotStatus::Available], true);
        subsystem.fail_open = true;
        let err = open_device(&subsystem).err().unwrap();
        assert!(matches!(err, DeviceError::OpenFailed(0)));
    }

    #[test]
    fn mode_stride_follows_pixel_depth() {
        let mode = Mode {
            width: 1280,
            height: 720,
            bits_per_pixel: 32,
            refresh_rate: 60,
        };
        assert_eq!(mode.stride(), 5120);
        assert_eq!(
            PixelBuffer::for_mode(0, &mode).data.len(),
            720 * 5120
        );
    }
}

// src/device/evdi.rs

//! libevdi subsystem binding.
//!
//! Raw FFI over `evdi_lib.h`, wrapped into the `DeviceSubsystem` /
//! `DeviceHandle` seam. The library delivers notifications through C
//! callbacks invoked from `evdi_handle_events`; the callbacks here only
//! translate into `DeviceEvent` values and push them onto a queue owned by
//! the handle, so all real work stays on the bridge thread.
//!
//! Compiled in with the `evdi` cargo feature; build.rs arranges the link.

use super::{
    DeviceError, DeviceEvent, DeviceHandle, DeviceSubsystem, Mode, PixelBuffer, Rect, SlotStatus,
    MAX_DIRTY_RECTS,
};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::io;
use std::os::raw::{c_int, c_uint, c_void};
use std::time::Duration;

type RawHandle = *mut c_void;

// evdi_device_status
const STATUS_AVAILABLE: c_int = 0;
const STATUS_UNRECOGNIZED: c_int = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct EvdiMode {
    width: c_int,
    height: c_int,
    refresh_rate: c_int,
    bits_per_pixel: c_int,
    pixel_format: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct EvdiRect {
    x1: c_int,
    y1: c_int,
    x2: c_int,
    y2: c_int,
}

#[repr(C)]
struct EvdiBuffer {
    id: c_int,
    buffer: *mut c_void,
    width: c_int,
    height: c_int,
    stride: c_int,
    rects: *mut EvdiRect,
    rect_count: c_int,
}

#[repr(C)]
struct EvdiEventContext {
    dpms_handler: Option<extern "C" fn(c_int, *mut c_void)>,
    mode_changed_handler: Option<extern "C" fn(EvdiMode, *mut c_void)>,
    update_ready_handler: Option<extern "C" fn(c_int, *mut c_void)>,
    crtc_state_handler: Option<extern "C" fn(c_int, *mut c_void)>,
    user_data: *mut c_void,
}

extern "C" {
    fn evdi_check_device(device: c_int) -> c_int;
    fn evdi_add_device() -> c_int;
    fn evdi_open(device: c_int) -> RawHandle;
    fn evdi_close(handle: RawHandle);
    fn evdi_connect(
        handle: RawHandle,
        edid: *const u8,
        edid_length: c_uint,
        extra: *const c_void,
        extra_length: c_uint,
    );
    fn evdi_disconnect(handle: RawHandle);
    fn evdi_register_buffer(handle: RawHandle, buffer: EvdiBuffer);
    fn evdi_unregister_buffer(handle: RawHandle, buffer_id: c_int);
    fn evdi_request_update(handle: RawHandle, buffer_id: c_int) -> bool;
    fn evdi_grab_pixels(handle: RawHandle, rects: *mut EvdiRect, num_rects: *mut c_int);
    fn evdi_get_event_ready(handle: RawHandle) -> c_int;
    fn evdi_handle_events(handle: RawHandle, context: *mut EvdiEventContext);
}

// --- event callbacks: translate and queue, nothing else ---

fn queue_of(user_data: *mut c_void) -> &'static mut VecDeque<DeviceEvent> {
    unsafe { &mut *(user_data as *mut VecDeque<DeviceEvent>) }
}

extern "C" fn on_mode_changed(mode: EvdiMode, user_data: *mut c_void) {
    queue_of(user_data).push_back(DeviceEvent::ModeChanged(Mode {
        width: mode.width.max(0) as u32,
        height: mode.height.max(0) as u32,
        bits_per_pixel: mode.bits_per_pixel.max(0) as u32,
        refresh_rate: mode.refresh_rate.max(0) as u32,
    }));
}

extern "C" fn on_update_ready(buffer_id: c_int, user_data: *mut c_void) {
    queue_of(user_data).push_back(DeviceEvent::UpdateReady(buffer_id));
}

extern "C" fn on_dpms(state: c_int, user_data: *mut c_void) {
    queue_of(user_data).push_back(DeviceEvent::PowerChanged(state));
}

extern "C" fn on_crtc_state(state: c_int, user_data: *mut c_void) {
    queue_of(user_data).push_back(DeviceEvent::DisplayChanged(state));
}

pub struct EvdiSubsystem;

impl EvdiSubsystem {
    pub fn new() -> Self {
        EvdiSubsystem
    }
}

impl DeviceSubsystem for EvdiSubsystem {
    fn slot_count(&self) -> usize {
        count_card_entries()
    }

    fn probe(&self, slot: usize) -> SlotStatus {
        match unsafe { evdi_check_device(slot as c_int) } {
            STATUS_AVAILABLE => SlotStatus::Available,
            STATUS_UNRECOGNIZED => SlotStatus::Unrecognized,
            _ => SlotStatus::Unavailable,
        }
    }

    fn create_device(&self) -> bool {
        unsafe { evdi_add_device() != 0 }
    }

    fn open(&self, slot: usize) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        let raw = unsafe { evdi_open(slot as c_int) };
        if raw.is_null() {
            return Err(DeviceError::OpenFailed(slot));
        }
        debug!("Opened EVDI node {}", slot);
        Ok(Box::new(EvdiDevice::new(raw)))
    }
}

/// Count the cardN entries under /sys/class/drm; slots beyond them cannot
/// exist, which bounds the probe loop.
fn count_card_entries() -> usize {
    let entries = match std::fs::read_dir("/sys/class/drm") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not read /sys/class/drm: {}", e);
            return 0;
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix("card")
                .is_some_and(|rest| rest.bytes().all(|b| b.is_ascii_digit()))
        })
        .count()
}

pub struct EvdiDevice {
    raw: RawHandle,
    // Boxed so the pointer handed to the C callbacks stays stable.
    queue: Box<VecDeque<DeviceEvent>>,
}

impl EvdiDevice {
    fn new(raw: RawHandle) -> Self {
        EvdiDevice {
            raw,
            queue: Box::new(VecDeque::new()),
        }
    }

    fn event_context(&mut self) -> EvdiEventContext {
        EvdiEventContext {
            dpms_handler: Some(on_dpms),
            mode_changed_handler: Some(on_mode_changed),
            update_ready_handler: Some(on_update_ready),
            crtc_state_handler: Some(on_crtc_state),
            user_data: &mut *self.queue as *mut VecDeque<DeviceEvent> as *mut c_void,
        }
    }
}

impl DeviceHandle for EvdiDevice {
    fn connect(&mut self, identity: &[u8]) {
        unsafe {
            evdi_connect(
                self.raw,
                identity.as_ptr(),
                identity.len() as c_uint,
                std::ptr::null(),
                0,
            )
        };
        debug!("Attached to the EVDI node ({}-byte identity)", identity.len());
    }

    fn disconnect(&mut self) {
        unsafe { evdi_disconnect(self.raw) };
        debug!("Detached from the EVDI node");
    }

    fn register_buffer(&mut self, buffer: &PixelBuffer) {
        // The kernel writes into this storage only between register and
        // unregister; the pool unregisters before dropping it.
        let descriptor = EvdiBuffer {
            id: buffer.id,
            buffer: buffer.data.as_ptr() as *mut c_void,
            width: buffer.width as c_int,
            height: buffer.height as c_int,
            stride: buffer.stride as c_int,
            rects: std::ptr::null_mut(),
            rect_count: 0,
        };
        unsafe { evdi_register_buffer(self.raw, descriptor) };
        trace!("Registered buffer {} with the device", buffer.id);
    }

    fn unregister_buffer(&mut self, id: i32) {
        unsafe { evdi_unregister_buffer(self.raw, id) };
        trace!("Unregistered buffer {}", id);
    }

    fn request_update(&mut self, buffer: &mut PixelBuffer) -> bool {
        unsafe { evdi_request_update(self.raw, buffer.id) }
    }

    fn grab_changed_rects(&mut self, out: &mut Vec<Rect>) {
        let mut raw_rects = [EvdiRect {
            x1: 0,
            y1: 0,
            x2: 0,
            y2: 0,
        }; MAX_DIRTY_RECTS];
        let mut count: c_int = 0;
        unsafe { evdi_grab_pixels(self.raw, raw_rects.as_mut_ptr(), &mut count) };
        out.clear();
        let count = (count.max(0) as usize).min(MAX_DIRTY_RECTS);
        for rect in &raw_rects[..count] {
            out.push(Rect {
                x1: rect.x1,
                y1: rect.y1,
                x2: rect.x2,
                y2: rect.y2,
            });
        }
        trace!("Grabbed {} changed rect(s)", out.len());
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(Some(event));
        }

        let fd = unsafe { evdi_get_event_ready(self.raw) };
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(DeviceError::Io(err));
        }
        if ready > 0 {
            let mut context = self.event_context();
            unsafe { evdi_handle_events(self.raw, &mut context) };
        }
        Ok(self.queue.pop_front())
    }
}

impl Drop for EvdiDevice {
    fn drop(&mut self) {
        unsafe { evdi_close(self.raw) };
        debug!("Closed the EVDI handle");
    }
}

// src/bridge.rs
//! The bridge event loop.
//!
//! Reconciles the two independently-driven sources (the virtual display
//! device and the viewer transport) on one thread. Each iteration gives
//! the device channel a short bounded poll and the transport the remainder
//! of the frame interval, so neither side starves and worst-case latency
//! from either side is bounded by the sum of the two slices. Because
//! nothing else ever runs between those steps, the buffer pool and the
//! published surface need no locks: a mode change runs to completion
//! before the next copy is dispatched.

use crate::clients::ClientGate;
use crate::config::Config;
use crate::damage;
use crate::device::{DeviceEvent, DeviceHandle, Mode, Rect, DISPLAY_IDENTITY, MAX_DIRTY_RECTS};
use crate::screen::{BufferPool, FrameSurface};
use crate::transport::{TransportEvent, ViewerTransport};
use anyhow::{bail, Context, Result};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Bound on device events dispatched per iteration, so a flooding device
/// cannot keep the transport slice from running.
const MAX_EVENTS_PER_CYCLE: usize = 16;

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Running,
    Shutdown,
}

pub struct Bridge<'a> {
    dev: &'a mut dyn DeviceHandle,
    transport: &'a mut dyn ViewerTransport,
    shutdown: &'a AtomicBool,
    pool: BufferPool,
    surface: Option<FrameSurface>,
    gate: ClientGate,
    next_buffer: usize,
    rects: Vec<Rect>,
    device_poll_timeout: Duration,
    startup_poll_timeout: Duration,
    min_transport_slice: Duration,
}

impl<'a> Bridge<'a> {
    pub fn new(
        dev: &'a mut dyn DeviceHandle,
        transport: &'a mut dyn ViewerTransport,
        shutdown: &'a AtomicBool,
        config: &Config,
    ) -> Self {
        Bridge {
            dev,
            transport,
            shutdown,
            pool: BufferPool::new(config.device.buffer_count),
            surface: None,
            gate: ClientGate::new(),
            next_buffer: 0,
            rects: Vec::with_capacity(MAX_DIRTY_RECTS),
            device_poll_timeout: config.device.poll_timeout(),
            startup_poll_timeout: config.device.startup_poll_timeout(),
            min_transport_slice: config.performance.min_transport_slice(),
        }
    }

    /// Startup gate: learn the device's native mode before anything serves.
    ///
    /// The device only announces modes while attached, so attach
    /// provisionally, wait (cancellably) for the first mode-change, size the
    /// buffer pool and surface from it, then detach again; from here on
    /// the client gate alone owns the attach lifecycle. Returns `None` when
    /// shutdown was requested before a mode arrived.
    pub fn wait_initial_mode(&mut self) -> Result<Option<Mode>> {
        info!("Waiting for the virtual display to announce its native mode");
        self.dev.connect(&DISPLAY_IDENTITY);
        let mode = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.dev.disconnect();
                return Ok(None);
            }
            match self.dev.poll_event(self.startup_poll_timeout)? {
                Some(DeviceEvent::ModeChanged(mode)) => break mode,
                Some(event) => trace!("Ignoring {:?} before the first mode", event),
                None => {}
            }
        };
        self.pool.apply_mode(&mut *self.dev, mode)?;
        self.surface = Some(FrameSurface::new(&mode));
        self.dev.disconnect();
        info!(
            "Native mode is {}x{} @ {}Hz",
            mode.width, mode.height, mode.refresh_rate
        );
        Ok(Some(mode))
    }

    /// Bring the viewer transport up at the known mode's geometry.
    pub fn start_transport(&mut self) -> Result<()> {
        let Some(surface) = &self.surface else {
            bail!("the viewer transport cannot start before a mode is known");
        };
        self.transport.start(surface)
    }

    /// Run until the transport stops serving or shutdown is requested, then
    /// tear everything down.
    pub fn run(&mut self) -> Result<()> {
        info!("Starting event loop");
        let outcome = self.serve();
        self.teardown();
        outcome
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            match self.run_cycle()? {
                BridgeStatus::Running => {}
                BridgeStatus::Shutdown => return Ok(()),
            }
        }
    }

    /// One iteration: refresh request, device poll, transport slice.
    pub fn run_cycle(&mut self) -> Result<BridgeStatus> {
        if self.shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested");
            return Ok(BridgeStatus::Shutdown);
        }
        let frame_start = Instant::now();

        self.pump_next_buffer();

        let mut dispatched = 0;
        if let Some(event) = self.dev.poll_event(self.device_poll_timeout)? {
            self.dispatch(event)?;
            dispatched += 1;
            // Drain whatever else is already queued, without waiting.
            while dispatched < MAX_EVENTS_PER_CYCLE {
                match self.dev.poll_event(Duration::ZERO)? {
                    Some(event) => {
                        self.dispatch(event)?;
                        dispatched += 1;
                    }
                    None => break,
                }
            }
        }

        let slice = self
            .frame_interval()
            .saturating_sub(frame_start.elapsed())
            .max(self.min_transport_slice);
        for transition in self.transport.process_events(slice) {
            match transition {
                TransportEvent::ClientConnected => self.gate.client_connected(&mut *self.dev),
                TransportEvent::ClientGone => self.gate.client_disconnected(&mut *self.dev),
            }
        }

        if !self.transport.is_active() {
            info!("Viewer transport is no longer serving");
            return Ok(BridgeStatus::Shutdown);
        }
        Ok(BridgeStatus::Running)
    }

    /// Release everything in the required order: session, buffers, surface,
    /// transport. Safe to call more than once.
    pub fn teardown(&mut self) {
        self.gate.force_idle(&mut *self.dev);
        self.pool.release(&mut *self.dev);
        self.surface = None;
        self.transport.shutdown(true);
    }

    fn frame_interval(&self) -> Duration {
        let refresh = self
            .pool
            .current_mode()
            .map(|mode| mode.refresh_rate)
            .unwrap_or(60)
            .max(1);
        Duration::from_secs(1) / refresh
    }

    fn dispatch(&mut self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::ModeChanged(mode) => self.apply_mode(mode)?,
            DeviceEvent::UpdateReady(id) => match self.pool.index_of(id) {
                Some(index) => self.copy_damage(index),
                None => warn!("Update ready for unknown buffer {}", id),
            },
            DeviceEvent::PowerChanged(state) => {
                debug!("Display power state is now {}", state);
            }
            DeviceEvent::DisplayChanged(state) => {
                debug!("Display output state is now {}", state);
            }
        }
        Ok(())
    }

    /// Apply a mode change end to end: rebuild the device buffer pool, then
    /// replace the published surface if the geometry moved. The old surface
    /// is dropped only after the transport has the replacement installed,
    /// so in-flight viewer reads never see an undersized surface.
    fn apply_mode(&mut self, mode: Mode) -> Result<()> {
        info!(
            "Mode changed to {}x{} @ {}Hz ({} bpp)",
            mode.width, mode.height, mode.refresh_rate, mode.bits_per_pixel
        );
        self.pool.apply_mode(&mut *self.dev, mode)?;
        self.next_buffer = 0;

        let geometry_unchanged = self
            .surface
            .as_ref()
            .is_some_and(|s| s.width == mode.width && s.height == mode.height);
        if !geometry_unchanged {
            let replacement = FrameSurface::new(&mode);
            self.transport
                .replace_framebuffer(&replacement)
                .context("Failed to install the replacement framebuffer")?;
            self.surface = Some(replacement);
        }
        Ok(())
    }

    /// Ask the device to refresh the next buffer in the pool; copy
    /// immediately if it reports pixels ready synchronously.
    fn pump_next_buffer(&mut self) {
        let count = self.pool.len();
        if count == 0 || self.surface.is_none() {
            return;
        }
        let index = self.next_buffer;
        self.next_buffer = (index + 1) % count;
        let ready = {
            let Some(buffer) = self.pool.buffer_mut(index) else {
                return;
            };
            self.dev.request_update(buffer)
        };
        if ready {
            trace!("Buffer refreshed synchronously");
            self.copy_damage(index);
        }
    }

    fn copy_damage(&mut self, index: usize) {
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        let Some(buffer) = self.pool.buffer(index) else {
            return;
        };
        self.dev.grab_changed_rects(&mut self.rects);
        if self.rects.is_empty() {
            trace!("No changed rectangles this cycle");
            return;
        }
        if !surface.matches(buffer) {
            warn!(
                "Dropping update for buffer {}: geometry disagrees with the published surface",
                buffer.id
            );
            return;
        }
        damage::apply_update(buffer, &self.rects, surface, &mut *self.transport);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, PixelBuffer};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const HD: Mode = Mode {
        width: 1280,
        height: 720,
        bits_per_pixel: 32,
        refresh_rate: 60,
    };
    const FHD: Mode = Mode {
        width: 1920,
        height: 1080,
        bits_per_pixel: 32,
        refresh_rate: 60,
    };

    #[derive(Default)]
    struct DeviceState {
        events: VecDeque<DeviceEvent>,
        log: Vec<String>,
        connects: usize,
        disconnects: usize,
        registered: Vec<(i32, u32, u32, usize)>,
        fill_on_request: Option<(u8, Rect)>,
        pending: Vec<Rect>,
    }

    /// Scripted device; the test keeps a clone of the shared state so it
    /// can queue events and inspect calls while the bridge holds the
    /// `&mut dyn` borrow.
    #[derive(Default, Clone)]
    struct MockDevice {
        state: Rc<RefCell<DeviceState>>,
    }

    impl DeviceHandle for MockDevice {
        fn connect(&mut self, _identity: &[u8]) {
            let mut state = self.state.borrow_mut();
            state.connects += 1;
            state.log.push("connect".into());
        }
        fn disconnect(&mut self) {
            let mut state = self.state.borrow_mut();
            state.disconnects += 1;
            state.log.push("disconnect".into());
        }
        fn register_buffer(&mut self, buffer: &PixelBuffer) {
            let mut state = self.state.borrow_mut();
            state.log.push(format!("register {}", buffer.id));
            state
                .registered
                .push((buffer.id, buffer.width, buffer.height, buffer.stride));
        }
        fn unregister_buffer(&mut self, id: i32) {
            let mut state = self.state.borrow_mut();
            state.log.push(format!("unregister {}", id));
            state.registered.retain(|&(b, ..)| b != id);
        }
        fn request_update(&mut self, buffer: &mut PixelBuffer) -> bool {
            let mut state = self.state.borrow_mut();
            let Some((value, rect)) = state.fill_on_request.take() else {
                return false;
            };
            for y in rect.y1..=rect.y2 {
                let start = y as usize * buffer.stride + rect.x1 as usize * 4;
                let end = start + (rect.x2 - rect.x1) as usize * 4;
                buffer.data[start..end].fill(value);
            }
            state.pending.push(rect);
            true
        }
        fn grab_changed_rects(&mut self, out: &mut Vec<Rect>) {
            out.clear();
            out.extend(self.state.borrow_mut().pending.drain(..));
        }
        fn poll_event(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<DeviceEvent>, DeviceError> {
            Ok(self.state.borrow_mut().events.pop_front())
        }
    }

    #[derive(Default)]
    struct TransportState {
        started: Option<(u32, u32)>,
        replacements: Vec<(u32, u32)>,
        dirty: Vec<Rect>,
        queued: VecDeque<TransportEvent>,
        active: bool,
    }

    #[derive(Default, Clone)]
    struct MockTransport {
        state: Rc<RefCell<TransportState>>,
    }

    impl ViewerTransport for MockTransport {
        fn start(&mut self, surface: &FrameSurface) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.started = Some((surface.width, surface.height));
            state.active = true;
            Ok(())
        }
        fn replace_framebuffer(&mut self, surface: &FrameSurface) -> Result<()> {
            self.state
                .borrow_mut()
                .replacements
                .push((surface.width, surface.height));
            Ok(())
        }
        fn mark_rect_dirty(&mut self, _surface: &FrameSurface, rect: &Rect) {
            self.state.borrow_mut().dirty.push(*rect);
        }
        fn process_events(&mut self, _budget: Duration) -> Vec<TransportEvent> {
            self.state.borrow_mut().queued.drain(..).collect()
        }
        fn is_active(&self) -> bool {
            self.state.borrow().active
        }
        fn shutdown(&mut self, _force: bool) {
            self.state.borrow_mut().active = false;
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        // Keep polls instantaneous under test.
        config.device.poll_timeout_ms = 0;
        config.device.startup_poll_timeout_ms = 0;
        config.performance.min_transport_slice_ms = 0;
        config
    }

    /// Drive a bridge through startup at `mode` and bring the transport up.
    fn started_bridge<'a>(
        dev: &'a mut MockDevice,
        transport: &'a mut MockTransport,
        shutdown: &'a AtomicBool,
        config: &Config,
        mode: Mode,
    ) -> Bridge<'a> {
        dev.state
            .borrow_mut()
            .events
            .push_back(DeviceEvent::ModeChanged(mode));
        let mut bridge = Bridge::new(dev, transport, shutdown, config);
        let announced = bridge.wait_initial_mode().unwrap();
        assert_eq!(announced, Some(mode));
        bridge.start_transport().unwrap();
        bridge
    }

    #[test_log::test]
    fn startup_sizes_everything_from_the_native_mode() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        let state = device.state.borrow();
        assert_eq!(state.registered, vec![(0, 1280, 720, 5120)]);
        assert_eq!(
            bridge.surface.as_ref().unwrap().data().len(),
            1280 * 720 * 4
        );
        assert_eq!(viewer.state.borrow().started, Some((1280, 720)));
        // The provisional attach is balanced by a detach before serving.
        assert_eq!(state.connects, 1);
        assert_eq!(state.disconnects, 1);
    }

    #[test_log::test]
    fn mode_change_swaps_buffers_then_replaces_the_surface() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        device
            .state
            .borrow_mut()
            .events
            .push_back(DeviceEvent::ModeChanged(FHD));
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Running);

        let state = device.state.borrow();
        assert_eq!(
            state.log,
            vec![
                "connect",
                "register 0",
                "disconnect",
                "unregister 0",
                "register 0"
            ]
        );
        // Only the new mode's buffer remains addressable.
        assert_eq!(state.registered, vec![(0, 1920, 1080, 7680)]);
        assert_eq!(viewer.state.borrow().replacements, vec![(1920, 1080)]);
        assert_eq!(
            bridge.surface.as_ref().unwrap().data().len(),
            1920 * 1080 * 4
        );
    }

    #[test_log::test]
    fn synchronous_refresh_copies_and_marks_the_damage() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        let rect = Rect {
            x1: 0,
            y1: 0,
            x2: 10,
            y2: 10,
        };
        device.state.borrow_mut().fill_on_request = Some((0x42, rect));
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Running);

        let surface = bridge.surface.as_ref().unwrap();
        let stride = surface.stride();
        assert_eq!(surface.data()[0], 0x42);
        assert_eq!(surface.data()[10 * stride + 9 * 4], 0x42);
        // First pixel past the span, first row past the range.
        assert_eq!(surface.data()[10 * 4], 0xff);
        assert_eq!(surface.data()[11 * stride], 0xff);
        assert_eq!(viewer.state.borrow().dirty, vec![rect]);
    }

    #[test_log::test]
    fn update_ready_event_copies_from_the_named_buffer() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        // Pixels arrive asynchronously: the device reports readiness later.
        let rect = Rect {
            x1: 4,
            y1: 4,
            x2: 8,
            y2: 7,
        };
        {
            let mut state = device.state.borrow_mut();
            state.pending.push(rect);
            state.events.push_back(DeviceEvent::UpdateReady(0));
        }
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Running);
        assert_eq!(viewer.state.borrow().dirty, vec![rect]);
    }

    #[test_log::test]
    fn first_connect_attaches_exactly_once() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);
        let attaches_after_startup = device.state.borrow().connects;

        {
            let mut state = viewer.state.borrow_mut();
            state.queued.push_back(TransportEvent::ClientConnected);
            state.queued.push_back(TransportEvent::ClientConnected);
        }
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Running);

        assert_eq!(
            device.state.borrow().connects - attaches_after_startup,
            1
        );
        assert_eq!(bridge.gate.connection_count(), 2);
    }

    #[test_log::test]
    fn shutdown_flag_stops_the_loop_and_teardown_is_idempotent() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);
        viewer
            .state
            .borrow_mut()
            .queued
            .push_back(TransportEvent::ClientConnected);
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Running);

        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Shutdown);

        bridge.teardown();
        bridge.teardown();

        let state = device.state.borrow();
        let unregisters = state
            .log
            .iter()
            .filter(|e| e.starts_with("unregister"))
            .count();
        assert_eq!(unregisters, 1);
        // Startup detach plus the forced detach of the active session.
        assert_eq!(state.disconnects, 2);
        assert!(bridge.surface.is_none());
        assert!(!viewer.state.borrow().active);
    }

    #[test_log::test]
    fn teardown_with_zero_connections_releases_without_detaching_again() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        bridge.teardown();
        let state = device.state.borrow();
        // Only the startup detach; the gate was never active.
        assert_eq!(state.disconnects, 1);
        assert!(state.registered.is_empty());
    }

    #[test_log::test]
    fn loop_exits_when_the_transport_stops_serving() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        viewer.state.borrow_mut().active = false;
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Shutdown);
    }

    #[test_log::test]
    fn unsupported_mode_announcement_is_fatal() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        device
            .state
            .borrow_mut()
            .events
            .push_back(DeviceEvent::ModeChanged(Mode {
                bits_per_pixel: 16,
                ..HD
            }));
        assert!(bridge.run_cycle().is_err());
    }

    #[test_log::test]
    fn same_mode_reannouncement_rebuilds_buffers_but_keeps_the_surface() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(false);
        let config = test_config();
        let mut bridge = started_bridge(&mut dev, &mut transport, &shutdown, &config, HD);

        // The device re-announces its mode on every attach.
        device
            .state
            .borrow_mut()
            .events
            .push_back(DeviceEvent::ModeChanged(HD));
        assert_eq!(bridge.run_cycle().unwrap(), BridgeStatus::Running);

        let state = device.state.borrow();
        let registers = state.log.iter().filter(|e| e.starts_with("register")).count();
        assert_eq!(registers, 2);
        // The published surface was not replaced.
        assert!(viewer.state.borrow().replacements.is_empty());
    }

    #[test_log::test]
    fn startup_gate_is_cancellable_by_shutdown() {
        let device = MockDevice::default();
        let viewer = MockTransport::default();
        let (mut dev, mut transport) = (device.clone(), viewer.clone());
        let shutdown = AtomicBool::new(true);
        let config = test_config();
        let mut bridge = Bridge::new(&mut dev, &mut transport, &shutdown, &config);

        assert_eq!(bridge.wait_initial_mode().unwrap(), None);
        assert_eq!(device.state.borrow().disconnects, 1);
    }
}

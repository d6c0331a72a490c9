// src/transport/headless.rs
//! Viewer transport that serves nobody.
//!
//! Used by builds without the `rfb` feature to exercise device bring-up
//! and the bridge loop with no network stack.

use super::{TransportEvent, ViewerTransport};
use crate::device::Rect;
use crate::screen::FrameSurface;
use anyhow::Result;
use log::{info, trace};
use std::time::Duration;

pub struct HeadlessTransport {
    active: bool,
}

impl HeadlessTransport {
    pub fn new() -> Self {
        HeadlessTransport { active: false }
    }
}

impl ViewerTransport for HeadlessTransport {
    fn start(&mut self, surface: &FrameSurface) -> Result<()> {
        info!(
            "Headless transport up at {}x{}; no viewers will connect",
            surface.width, surface.height
        );
        self.active = true;
        Ok(())
    }

    fn replace_framebuffer(&mut self, surface: &FrameSurface) -> Result<()> {
        info!(
            "Headless transport now at {}x{}",
            surface.width, surface.height
        );
        Ok(())
    }

    fn mark_rect_dirty(&mut self, _surface: &FrameSurface, rect: &Rect) {
        trace!(
            "Dirty ({},{})-({},{})",
            rect.x1,
            rect.y1,
            rect.x2,
            rect.y2
        );
    }

    fn process_events(&mut self, budget: Duration) -> Vec<TransportEvent> {
        std::thread::sleep(budget);
        Vec::new()
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn shutdown(&mut self, _force: bool) {
        self.active = false;
    }
}

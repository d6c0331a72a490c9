// src/transport/mod.rs
//! Viewer transport seam.
//!
//! The remote-display protocol engine lives behind `ViewerTransport`; the
//! bridge only ever hands it surface contents and a time slice, and gets
//! connection transitions back. `rfb` is the real RFB server adapter,
//! compiled in by the default `rfb` feature; `headless` serves nobody and
//! exists so the device side can be brought up without a network stack.

pub mod headless;

#[cfg(feature = "rfb")]
pub mod rfb;

use crate::device::Rect;
use crate::screen::FrameSurface;
use anyhow::Result;
use std::time::Duration;

/// Connection transitions observed while servicing the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    ClientConnected,
    ClientGone,
}

pub trait ViewerTransport {
    /// Bring the serving side up with `surface`'s geometry and publish its
    /// initial contents.
    fn start(&mut self, surface: &FrameSurface) -> Result<()>;

    /// Install a replacement surface after a mode change. The caller keeps
    /// the old surface alive until this returns.
    fn replace_framebuffer(&mut self, surface: &FrameSurface) -> Result<()>;

    /// Republish the bytes of `rect`, which the caller just finished
    /// copying into `surface`.
    fn mark_rect_dirty(&mut self, surface: &FrameSurface, rect: &Rect);

    /// Service transport I/O for at most `budget`, returning the connection
    /// transitions that occurred.
    fn process_events(&mut self, budget: Duration) -> Vec<TransportEvent>;

    /// Whether the serving side is still up. The bridge loop exits when
    /// this turns false.
    fn is_active(&self) -> bool;

    /// Stop serving. Idempotent.
    fn shutdown(&mut self, force: bool);
}

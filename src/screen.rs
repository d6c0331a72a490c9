// src/screen.rs
//! Mode and buffer lifecycle.
//!
//! `BufferPool` owns the device-side pixel buffers and the currently active
//! mode; `FrameSurface` is the pixel surface published to viewers. Both are
//! mutated only from the bridge thread, so their consistency is temporal:
//! a mode change runs to completion before any copy touches either side.

use crate::device::{DeviceError, DeviceHandle, Mode, PixelBuffer, Rect};
use log::{debug, trace};

/// The device-side buffer pool. Buffers are round-robined by the bridge so
/// the device can fill one while a previous one is being read.
pub struct BufferPool {
    pool_size: usize,
    buffers: Vec<PixelBuffer>,
    mode: Option<Mode>,
}

impl BufferPool {
    pub fn new(pool_size: usize) -> Self {
        BufferPool {
            pool_size: pool_size.max(1),
            buffers: Vec::new(),
            mode: None,
        }
    }

    pub fn current_mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer(&self, index: usize) -> Option<&PixelBuffer> {
        self.buffers.get(index)
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut PixelBuffer> {
        self.buffers.get_mut(index)
    }

    pub fn index_of(&self, id: i32) -> Option<usize> {
        self.buffers.iter().position(|b| b.id == id)
    }

    /// Rebuild the pool for `mode`.
    ///
    /// Rejects unsupported pixel depths before touching anything. Every
    /// previous buffer is unregistered and its storage dropped before any
    /// new buffer is registered; the device must never be left addressing
    /// freed storage, and a buffer is never resized in place.
    pub fn apply_mode(
        &mut self,
        dev: &mut dyn DeviceHandle,
        mode: Mode,
    ) -> Result<(), DeviceError> {
        if mode.bits_per_pixel != 32 {
            return Err(DeviceError::UnsupportedMode(mode.bits_per_pixel));
        }
        self.release(dev);
        for id in 0..self.pool_size as i32 {
            let buffer = PixelBuffer::for_mode(id, &mode);
            dev.register_buffer(&buffer);
            self.buffers.push(buffer);
        }
        self.mode = Some(mode);
        debug!(
            "Registered {} buffer(s) of {}x{}, stride {}",
            self.buffers.len(),
            mode.width,
            mode.height,
            mode.stride()
        );
        Ok(())
    }

    /// Unregister and drop every buffer. Safe to call on an empty pool.
    pub fn release(&mut self, dev: &mut dyn DeviceHandle) {
        for buffer in self.buffers.drain(..) {
            dev.unregister_buffer(buffer.id);
            trace!("Released buffer {}", buffer.id);
        }
    }
}

/// The externally published framebuffer. Its memory belongs to the core;
/// the viewer transport is handed copies of its contents.
pub struct FrameSurface {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    data: Vec<u8>,
}

impl FrameSurface {
    /// Allocate a surface matching `mode`, painted white so viewers see a
    /// defined field before the first device update lands.
    pub fn new(mode: &Mode) -> Self {
        let bytes_per_pixel = mode.bits_per_pixel as usize / 8;
        let data =
            vec![0xff; mode.width as usize * mode.height as usize * bytes_per_pixel];
        FrameSurface {
            width: mode.width,
            height: mode.height,
            bytes_per_pixel,
            data,
        }
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.bytes_per_pixel
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether `buffer` shares this surface's geometry, byte for byte.
    pub fn matches(&self, buffer: &PixelBuffer) -> bool {
        self.width == buffer.width
            && self.height == buffer.height
            && self.stride() == buffer.stride
    }

    /// Contiguous copy of the bytes inside `rect` (rows `y1..=y2`, `x2 - x1`
    /// pixels per row). The rect must already be clipped to the surface.
    pub fn rect_bytes(&self, rect: &Rect) -> Vec<u8> {
        let span = (rect.x2 - rect.x1).max(0) as usize * self.bytes_per_pixel;
        let rows = (rect.y2 - rect.y1 + 1).max(0) as usize;
        let mut out = Vec::with_capacity(span * rows);
        for y in rect.y1..=rect.y2 {
            let offset = y as usize * self.stride() + rect.x1 as usize * self.bytes_per_pixel;
            out.extend_from_slice(&self.data[offset..offset + span]);
        }
        out
    }
}

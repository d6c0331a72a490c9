// src/damage.rs
//! Damage-rectangle copies from a device buffer into the viewer surface.
//!
//! The copy preserves the device's rect convention exactly: `x2 - x1`
//! pixels per row starting at `x1`, rows `y1..=y2` inclusive. Both sides
//! share stride and pixel format by the caller's invariant (copies are
//! serialized against mode changes), so byte offsets are identical.

use crate::device::{PixelBuffer, Rect};
use crate::screen::FrameSurface;
use crate::transport::ViewerTransport;
use log::trace;

/// Copy every rect in the batch into `surface` and mark it dirty on the
/// transport. An empty batch is a no-op. Rects are clipped to the surface
/// so a report that outruns the current geometry can never write out of
/// bounds.
pub fn apply_update(
    buffer: &PixelBuffer,
    rects: &[Rect],
    surface: &mut FrameSurface,
    transport: &mut dyn ViewerTransport,
) {
    debug_assert_eq!(buffer.stride, surface.stride());
    for rect in rects {
        let Some(clipped) = clip(rect, surface.width, surface.height) else {
            continue;
        };
        copy_rect(buffer, &clipped, surface);
        transport.mark_rect_dirty(surface, &clipped);
    }
}

fn clip(rect: &Rect, width: u32, height: u32) -> Option<Rect> {
    let x1 = rect.x1.max(0);
    let y1 = rect.y1.max(0);
    let x2 = rect.x2.min(width as i32);
    let y2 = rect.y2.min(height as i32 - 1);
    (x1 < x2 && y1 <= y2).then_some(Rect { x1, y1, x2, y2 })
}

fn copy_rect(buffer: &PixelBuffer, rect: &Rect, surface: &mut FrameSurface) {
    let bpp = surface.bytes_per_pixel;
    let stride = surface.stride();
    let span = (rect.x2 - rect.x1) as usize * bpp;
    for y in rect.y1..=rect.y2 {
        let offset = y as usize * stride + rect.x1 as usize * bpp;
        surface.data_mut()[offset..offset + span]
            .copy_from_slice(&buffer.data[offset..offset + span]);
    }
    trace!(
        "Copied ({},{})-({},{}) from buffer {}",
        rect.x1,
        rect.y1,
        rect.x2,
        rect.y2,
        buffer.id
    );
}

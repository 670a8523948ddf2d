//! Framebuffer manager.
//!
//! Two DMA-capable RGB565 buffers. The front buffer is the one the LCD scans
//! out; drawing goes to the back buffer. A finished back buffer is handed to
//! the data path and becomes the front buffer at the next frame boundary, so
//! the panel never shows a half-drawn frame.

use core::{alloc::Layout, convert::Infallible, ptr::NonNull};

use embedded_graphics::{
    pixelcolor::{raw::RawU16, Rgb565},
    prelude::*,
    primitives::Rectangle,
};
use log::{error, trace};

use crate::{
    config::{PanelGeometry, BYTES_PER_PIXEL},
    error::{ConfigError, IoError},
    hal::{DmaRegion, DMA_ALIGNMENT},
    surface::PixelSurface,
};

/// Zero-initialised pixel memory, aligned for DMA.
#[derive(Debug)]
pub struct Framebuffer {
    ptr: NonNull<u8>,
    len: usize,
    generation: u32,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for Framebuffer {}

impl Framebuffer {
    /// Allocate `len` zeroed bytes on a [`DMA_ALIGNMENT`] boundary.
    pub fn allocate(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, DMA_ALIGNMENT).ok()?;
        let ptr = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
        Some(Self {
            ptr,
            len,
            generation: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Frame number of the content, bumped each time the buffer is presented.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn region(&self) -> DmaRegion {
        DmaRegion::new(self.ptr, self.len)
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        // Same size and alignment as in `allocate`, which already validated it.
        if let Ok(layout) = Layout::from_size_align(self.len, DMA_ALIGNMENT) {
            unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// Front/back buffer pair with dirty tracking.
#[derive(Debug)]
pub struct FramebufferManager {
    geometry: PanelGeometry,
    buffers: [Framebuffer; 2],
    front: usize,
    dirty: bool,
    /// The back buffer is queued and waits for the next frame boundary.
    in_flight: bool,
    /// The back buffer holds an older frame than the front one and must be
    /// refreshed before it is drawn on.
    resync: bool,
    dropped_writes: u32,
    presented_frames: u32,
}

impl FramebufferManager {
    /// Allocate both buffers out of `dma_capacity` bytes of DMA memory.
    pub fn allocate(geometry: &PanelGeometry, dma_capacity: usize) -> Result<Self, ConfigError> {
        let frame_bytes = geometry
            .pixel_count()
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or(ConfigError::OutOfMemory {
                requested: usize::MAX,
                available: dma_capacity,
            })?;
        let requested = frame_bytes.checked_mul(2).unwrap_or(usize::MAX);
        if requested > dma_capacity {
            error!(
                "Framebuffers need {} bytes, only {} bytes of DMA memory",
                requested, dma_capacity
            );
            return Err(ConfigError::OutOfMemory {
                requested,
                available: dma_capacity,
            });
        }

        let oom = ConfigError::OutOfMemory {
            requested,
            available: dma_capacity,
        };
        let first = Framebuffer::allocate(frame_bytes).ok_or(oom)?;
        let second = Framebuffer::allocate(frame_bytes).ok_or(oom)?;

        Ok(Self {
            geometry: *geometry,
            buffers: [first, second],
            front: 0,
            dirty: false,
            in_flight: false,
            resync: false,
            dropped_writes: 0,
            presented_frames: 0,
        })
    }

    pub fn geometry(&self) -> &PanelGeometry {
        &self.geometry
    }

    /// Buffer currently scanned out.
    pub fn front(&self) -> &Framebuffer {
        &self.buffers[self.front]
    }

    /// Buffer being drawn, or queued while a hand-off is in flight.
    pub fn back(&self) -> &Framebuffer {
        &self.buffers[1 - self.front]
    }

    /// Set one pixel. Returns `false` if the pixel is off-panel or the back
    /// buffer is locked by a pending hand-off.
    pub fn write_pixel(&mut self, x: i32, y: i32, color: Rgb565) -> bool {
        if !self.geometry.contains(x, y) {
            return false;
        }
        let offset = (y as usize * self.geometry.width() as usize + x as usize) * BYTES_PER_PIXEL;
        let Some(back) = self.writable_back() else {
            return false;
        };
        back[offset..offset + BYTES_PER_PIXEL].copy_from_slice(&encode(color));
        self.dirty = true;
        true
    }

    /// Pixel as the writer sees it.
    pub fn pixel(&self, x: i32, y: i32) -> Option<Rgb565> {
        if !self.geometry.contains(x, y) {
            return None;
        }
        let view = if self.resync { self.front() } else { self.back() };
        let offset = (y as usize * self.geometry.width() as usize + x as usize) * BYTES_PER_PIXEL;
        let bytes = &view.as_bytes()[offset..offset + BYTES_PER_PIXEL];
        Some(RawU16::new(u16::from_le_bytes([bytes[0], bytes[1]])).into())
    }

    /// Fill the whole back buffer.
    pub fn fill(&mut self, color: Rgb565) -> bool {
        if self.in_flight {
            self.dropped_writes += 1;
            return false;
        }
        // Every byte is overwritten, no need to copy the front first.
        self.resync = false;
        let back = 1 - self.front;
        fill_bytes(self.buffers[back].as_bytes_mut(), color);
        self.dirty = true;
        true
    }

    /// Fill the part of `area` that lies on the panel.
    pub fn fill_rect(&mut self, area: &Rectangle, color: Rgb565) -> bool {
        let bounds = Rectangle::new(Point::zero(), self.size());
        let clipped = area.intersection(&bounds);
        let Some(bottom_right) = clipped.bottom_right() else {
            return false;
        };
        let width = self.geometry.width() as usize;
        let Some(back) = self.writable_back() else {
            return false;
        };

        let x0 = clipped.top_left.x as usize;
        let x1 = bottom_right.x as usize + 1;
        for y in clipped.top_left.y as usize..=bottom_right.y as usize {
            let row = y * width;
            let span = &mut back[(row + x0) * BYTES_PER_PIXEL..(row + x1) * BYTES_PER_PIXEL];
            fill_bytes(span, color);
        }
        self.dirty = true;
        true
    }

    /// Raw little-endian RGB565 bytes of the back buffer, `None` while it is
    /// locked. Call [`mark_dirty`](Self::mark_dirty) after writing.
    pub fn back_buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.writable_back()
    }

    /// Request presentation of the back buffer.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// A presented frame is waiting for the frame boundary.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// If the back buffer is dirty, pass it to `hand_off` for scan-out.
    ///
    /// Returns `Ok(true)` when a frame was handed off. Nothing happens while
    /// an earlier hand-off is still waiting for its frame boundary.
    pub fn swap_if_dirty(
        &mut self,
        hand_off: impl FnOnce(DmaRegion) -> Result<(), IoError>,
    ) -> Result<bool, IoError> {
        if !self.dirty || self.in_flight {
            return Ok(false);
        }
        self.resync_back();

        let back = 1 - self.front;
        hand_off(self.buffers[back].region())?;

        self.buffers[back].generation = self.buffers[self.front].generation.wrapping_add(1);
        self.dirty = false;
        self.in_flight = true;
        trace!("Frame {} queued", self.buffers[back].generation);
        Ok(true)
    }

    /// The peripheral reached a frame boundary. Returns `true` when a queued
    /// frame became the front buffer.
    pub fn on_frame_boundary(&mut self) -> bool {
        if !self.in_flight {
            return false;
        }
        self.front = 1 - self.front;
        self.in_flight = false;
        self.resync = true;
        self.presented_frames = self.presented_frames.wrapping_add(1);
        trace!("Frame {} latched", self.buffers[self.front].generation);
        true
    }

    /// The stream stopped before a queued frame was latched. The frame stays
    /// in the back buffer and is presented again on the next swap.
    pub fn cancel_hand_off(&mut self) {
        if self.in_flight {
            self.in_flight = false;
            self.dirty = true;
        }
    }

    /// Writes refused because a hand-off was in flight.
    pub fn dropped_writes(&self) -> u32 {
        self.dropped_writes
    }

    /// Frames that reached the panel.
    pub fn presented_frames(&self) -> u32 {
        self.presented_frames
    }

    fn writable_back(&mut self) -> Option<&mut [u8]> {
        if self.in_flight {
            self.dropped_writes += 1;
            return None;
        }
        self.resync_back();
        Some(self.buffers[1 - self.front].as_bytes_mut())
    }

    fn resync_back(&mut self) {
        if !self.resync {
            return;
        }
        let [a, b] = &mut self.buffers;
        let (front, back) = if self.front == 0 { (a, b) } else { (b, a) };
        back.as_bytes_mut().copy_from_slice(front.as_bytes());
        back.generation = front.generation;
        self.resync = false;
    }
}

fn encode(color: Rgb565) -> [u8; 2] {
    color.into_storage().to_le_bytes()
}

fn fill_bytes(bytes: &mut [u8], color: Rgb565) {
    let pixel = encode(color);
    for chunk in bytes.chunks_exact_mut(BYTES_PER_PIXEL) {
        chunk.copy_from_slice(&pixel);
    }
}

impl PixelSurface for FramebufferManager {
    fn write_pixel(&mut self, x: i32, y: i32, color: Rgb565) -> bool {
        FramebufferManager::write_pixel(self, x, y, color)
    }

    fn width(&self) -> u16 {
        self.geometry.width()
    }

    fn height(&self) -> u16 {
        self.geometry.height()
    }
}

impl OriginDimensions for FramebufferManager {
    fn size(&self) -> Size {
        Size::new(self.geometry.width() as u32, self.geometry.height() as u32)
    }
}

impl DrawTarget for FramebufferManager {
    type Color = Rgb565;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            self.write_pixel(point.x, point.y, color);
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        self.fill_rect(area, color);
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        self.fill(color);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::primitives::{PrimitiveStyle, StyledDrawable};

    fn manager(width: u16, height: u16) -> FramebufferManager {
        let geometry = PanelGeometry::new(width, height).unwrap();
        FramebufferManager::allocate(&geometry, 16 * 1024 * 1024).unwrap()
    }

    fn present(frames: &mut FramebufferManager) -> bool {
        frames.swap_if_dirty(|_| Ok(())).unwrap()
    }

    #[test]
    fn allocates_two_aligned_zeroed_frames() {
        let frames = manager(800, 480);
        for buffer in [frames.front(), frames.back()] {
            assert_eq!(buffer.len(), 800 * 480 * 2);
            assert_eq!(buffer.region().addr() % DMA_ALIGNMENT, 0);
            assert!(buffer.as_bytes().iter().all(|&b| b == 0));
        }
        assert_ne!(frames.front().region().addr(), frames.back().region().addr());
    }

    #[test]
    fn allocation_respects_dma_capacity() {
        let geometry = PanelGeometry::new(800, 480).unwrap();
        assert_eq!(
            FramebufferManager::allocate(&geometry, 1_000_000).err(),
            Some(ConfigError::OutOfMemory {
                requested: 1_536_000,
                available: 1_000_000
            })
        );
    }

    #[test]
    fn out_of_range_writes_are_ignored() {
        let mut frames = manager(4, 3);
        assert!(!frames.write_pixel(4, 0, Rgb565::RED));
        assert!(!frames.write_pixel(0, 3, Rgb565::RED));
        assert!(!frames.write_pixel(-1, 1, Rgb565::RED));
        assert!(!frames.is_dirty());
        assert!(frames.back().as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn pixels_are_stored_little_endian() {
        let mut frames = manager(4, 3);
        assert!(frames.write_pixel(1, 2, Rgb565::RED));
        assert!(frames.is_dirty());

        let offset = (2 * 4 + 1) * 2;
        assert_eq!(&frames.back().as_bytes()[offset..offset + 2], &[0x00, 0xF8]);
        assert_eq!(frames.pixel(1, 2), Some(Rgb565::RED));
        assert_eq!(frames.pixel(4, 2), None);
    }

    #[test]
    fn clean_buffer_is_not_swapped() {
        let mut frames = manager(4, 3);
        let mut called = false;
        let swapped = frames
            .swap_if_dirty(|_| {
                called = true;
                Ok(())
            })
            .unwrap();
        assert!(!swapped);
        assert!(!called);
    }

    #[test]
    fn swap_hands_off_back_buffer_until_frame_boundary() {
        let mut frames = manager(4, 3);
        let back = frames.back().region();
        frames.fill(Rgb565::BLUE);

        let mut handed = None;
        assert!(frames
            .swap_if_dirty(|region| {
                handed = Some(region);
                Ok(())
            })
            .unwrap());
        assert_eq!(handed, Some(back));
        assert!(frames.is_in_flight());
        assert!(!frames.is_dirty());

        // Queued buffer is locked.
        assert!(!frames.write_pixel(0, 0, Rgb565::RED));
        assert!(!frames.fill(Rgb565::RED));
        assert!(frames.back_buffer_mut().is_none());
        assert_eq!(frames.dropped_writes(), 3);

        assert!(frames.on_frame_boundary());
        assert_eq!(frames.front().region(), back);
        assert_eq!(frames.front().generation(), 1);
        assert_eq!(frames.presented_frames(), 1);
        assert!(!frames.on_frame_boundary());
    }

    #[test]
    fn back_buffer_is_refreshed_after_latch() {
        let mut frames = manager(4, 3);
        frames.fill(Rgb565::GREEN);
        present(&mut frames);
        frames.on_frame_boundary();

        // New back buffer still holds the zeroed frame, but the writer sees
        // the latched one.
        assert_eq!(frames.pixel(3, 2), Some(Rgb565::GREEN));
        assert!(frames.write_pixel(0, 0, Rgb565::RED));
        assert_eq!(frames.pixel(3, 2), Some(Rgb565::GREEN));
        assert_eq!(frames.pixel(0, 0), Some(Rgb565::RED));
        assert_eq!(frames.back().generation(), 1);

        present(&mut frames);
        frames.on_frame_boundary();
        assert_eq!(frames.front().generation(), 2);
        assert_eq!(frames.pixel(0, 0), Some(Rgb565::RED));
        assert_eq!(frames.pixel(1, 0), Some(Rgb565::GREEN));
    }

    #[test]
    fn cancelled_hand_off_is_presented_again() {
        let mut frames = manager(4, 3);
        frames.fill(Rgb565::WHITE);
        present(&mut frames);

        frames.cancel_hand_off();
        assert!(!frames.is_in_flight());
        assert!(frames.is_dirty());
        assert!(present(&mut frames));
    }

    #[test]
    fn failed_hand_off_keeps_frame_dirty() {
        let mut frames = manager(4, 3);
        frames.fill(Rgb565::WHITE);
        assert_eq!(
            frames.swap_if_dirty(|_| Err(IoError::NotStreaming)),
            Err(IoError::NotStreaming)
        );
        assert!(frames.is_dirty());
        assert!(!frames.is_in_flight());
    }

    #[test]
    fn fill_rect_clips_to_panel() {
        let mut frames = manager(4, 3);
        assert!(frames.fill_rect(
            &Rectangle::new(Point::new(2, 1), Size::new(10, 10)),
            Rgb565::YELLOW
        ));
        assert_eq!(frames.pixel(1, 1), Some(Rgb565::BLACK));
        assert_eq!(frames.pixel(2, 1), Some(Rgb565::YELLOW));
        assert_eq!(frames.pixel(3, 2), Some(Rgb565::YELLOW));
        assert_eq!(frames.pixel(3, 0), Some(Rgb565::BLACK));

        assert!(!frames.fill_rect(
            &Rectangle::new(Point::new(10, 10), Size::new(2, 2)),
            Rgb565::YELLOW
        ));
    }

    #[test]
    fn draws_embedded_graphics_primitives() {
        let mut frames = manager(8, 8);
        Rectangle::new(Point::new(-2, -2), Size::new(4, 4))
            .draw_styled(&PrimitiveStyle::with_fill(Rgb565::CYAN), &mut frames)
            .unwrap();
        assert_eq!(frames.pixel(0, 0), Some(Rgb565::CYAN));
        assert_eq!(frames.pixel(1, 1), Some(Rgb565::CYAN));
        assert_eq!(frames.pixel(2, 2), Some(Rgb565::BLACK));

        Pixel(Point::new(7, 7), Rgb565::MAGENTA)
            .draw(&mut frames)
            .unwrap();
        assert_eq!(frames.pixel(7, 7), Some(Rgb565::MAGENTA));
    }
}

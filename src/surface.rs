//! Capability traits the display exposes to the rest of the application.

use embassy_time::Duration;
use embedded_graphics::pixelcolor::{Rgb565, Rgb888, RgbColor};

use crate::error::Error;

/// Something pixels can be written to.
pub trait PixelSurface {
    /// Write one pixel in panel coordinates. Off-panel writes are ignored and
    /// return `false`.
    fn write_pixel(&mut self, x: i32, y: i32, color: Rgb565) -> bool;

    fn width(&self) -> u16;

    fn height(&self) -> u16;
}

/// Periodic work driven by the application's scheduler.
pub trait Pollable {
    fn update(&mut self) -> Result<(), Error>;

    /// Suggested time between `update()` calls.
    fn update_interval(&self) -> Duration;
}

/// Truncate an RGB888 colour to RGB565 (drop the low 3/2/3 bits).
pub fn rgb888_to_rgb565(color: Rgb888) -> Rgb565 {
    Rgb565::new(color.r() >> 3, color.g() >> 2, color.b() >> 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::prelude::IntoStorage;

    #[test]
    fn conversion_truncates_low_bits() {
        let color = rgb888_to_rgb565(Rgb888::new(0xFF, 0x80, 0x07));
        // (r & 0xF8) << 8 | (g & 0xFC) << 3 | b >> 3
        let expected = (0xF8u16 << 8) | (0x80u16 << 3);
        assert_eq!(color.into_storage(), expected);
        assert_eq!(rgb888_to_rgb565(Rgb888::WHITE), Rgb565::WHITE);
        assert_eq!(rgb888_to_rgb565(Rgb888::new(7, 3, 7)), Rgb565::BLACK);
    }
}

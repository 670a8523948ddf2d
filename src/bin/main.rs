//! Host demo: drives an 800x480 panel on the simulated LCD peripheral.
//!
//! `RUST_LOG=debug cargo run --features sim`

use embedded_graphics::{
    pixelcolor::{Rgb565, Rgb888},
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
};
use esp32_p4_rgb_display::{
    surface::rgb888_to_rgb565, sim::SimulatedLcd, DisplayConfig, RgbDisplay,
};
use fugit::HertzU32;
use log::{error, info};

const LCD_H_RES: u16 = 800;
const LCD_V_RES: u16 = 480;
const BAR_WIDTH: u32 = 40;
const FRAMES: u32 = 600;

fn main() -> Result<(), Box<dyn core::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting RGB display demo on the simulated LCD peripheral");

    let mut config = DisplayConfig::default();
    config
        .set_dimensions(LCD_H_RES, LCD_V_RES)
        .set_pclk_frequency(HertzU32::MHz(16))
        .set_pclk_inverted(true)
        .set_hsync_pin(46)
        .set_vsync_pin(3)
        .set_de_pin(17)
        .set_pclk_pin(9)
        .set_data_pins(&[10, 11, 12, 13, 14, 21, 8, 18, 45, 38, 39, 40, 41, 42, 2, 1])?;

    let mut display = RgbDisplay::new(SimulatedLcd::new(), config);
    display.init()?;
    display.dump_config();

    // Background gradient, then a bar sweeping across on every redraw.
    let mut position: u32 = 0;
    display.set_writer(move |frames| {
        let _ = frames.clear(Rgb565::BLACK);
        for x in 0..LCD_H_RES as i32 {
            let shade = (x * 255 / LCD_H_RES as i32) as u8;
            let color = rgb888_to_rgb565(Rgb888::new(0, shade / 2, shade));
            let _ = frames.fill_solid(
                &Rectangle::new(Point::new(x, 0), Size::new(1, LCD_V_RES as u32 / 4)),
                color,
            );
        }
        let _ = Rectangle::new(
            Point::new(position as i32, LCD_V_RES as i32 / 4),
            Size::new(BAR_WIDTH, LCD_V_RES as u32 * 3 / 4),
        )
        .into_styled(PrimitiveStyle::with_fill(Rgb565::YELLOW))
        .draw(frames);
        position = (position + 8) % LCD_H_RES as u32;
    });

    let mut frame_count: u32 = 0;
    while frame_count < FRAMES {
        if let Err(e) = display.update() {
            error!("Display update failed: {}", e);
            break;
        }
        if let Some(lcd) = display.peripheral_mut() {
            lcd.advance_frame();
        }
        display.handle_interrupt();
        frame_count = frame_count.wrapping_add(1);

        // Log progress periodically
        if frame_count % 60 == 0 {
            let stats = display.stats();
            info!(
                "Frame: {}, presented: {}, dropped writes: {}",
                frame_count, stats.frames_presented, stats.dropped_writes
            );
        }
    }

    display.stop_stream();
    let lcd = display.release();
    info!(
        "Demo finished after {} scanned frames ({} bytes on the panel)",
        lcd.frames_scanned(),
        lcd.displayed().len()
    );
    Ok(())
}

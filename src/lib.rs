//! Parallel RGB (DPI) LCD driver
//!
//! Drives a 16-bit RGB565 panel through an LCD peripheral running in RGB mode:
//! the peripheral generates HSYNC/VSYNC/DE/PCLK from programmed timing and
//! scans a framebuffer out over DMA without per-pixel software involvement.
//!
//! ```text
//!   graphics layer ──► PixelSurface / DrawTarget
//!                            │
//!                            ▼
//!                 ┌──────────────────────┐     update()      ┌───────────┐
//!                 │      RgbDisplay      │◄──────────────────│  poller   │
//!                 │ (lifecycle + state)  │                   └───────────┘
//!                 └──┬─────────┬───────┬─┘
//!                    │         │       │
//!              TimingGenerator │  FramebufferManager (front/back)
//!                              │
//!                        PixelDataPath ──► LcdPeripheral (registers, DMA)
//! ```
//!
//! Hardware access goes through the [`hal::LcdPeripheral`] trait, so the same
//! driver runs against silicon or against [`sim::SimulatedLcd`] on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod data_path;
pub mod display;
pub mod error;
pub mod framebuffer;
pub mod hal;
pub mod shared;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod surface;
pub mod timing;

pub use config::{DisplayConfig, GpioNum, PanelGeometry, PinAssignment, PinRole, TimingParameters};
pub use display::{DisplayStats, DriverState, RgbDisplay};
pub use error::{ConfigError, Error, HardwareFault, Infeasible, IoError};
pub use framebuffer::{Framebuffer, FramebufferManager};
pub use hal::{LcdEvent, LcdPeripheral};
pub use shared::SharedDisplay;
pub use surface::{PixelSurface, Pollable};

//! Display lifecycle controller.
//!
//! [`RgbDisplay`] owns the peripheral and ties timing, data path and
//! framebuffers together:
//!
//! ```text
//! Uninitialized --init--> Configuring --ok--> Ready --start--> Streaming
//!                              |                ^                 |  |
//!                              +--err--+        +------stop-------+  |
//!                                      v                             |
//!                                   Faulted <------hardware fault----+
//! ```

use alloc::boxed::Box;
use core::{convert::Infallible, fmt};

use embassy_time::Duration;
use embedded_graphics::{
    pixelcolor::{Rgb565, Rgb888},
    prelude::*,
    primitives::Rectangle,
};
use enumset::EnumSet;
use fugit::HertzU32;
use log::{debug, error, info, trace, warn};

use crate::{
    config::{DisplayConfig, TimingParameters},
    data_path::PixelDataPath,
    error::{ConfigError, Error, HardwareFault, IoError},
    framebuffer::FramebufferManager,
    hal::{LcdEvent, LcdPeripheral, TransferConfig},
    surface::{rgb888_to_rgb565, PixelSurface, Pollable},
    timing::{compute, FrameTiming, TimingGenerator},
};

/// Lifecycle state of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Configuring,
    Ready,
    Streaming,
    Faulted,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Uninitialized => "uninitialized",
            DriverState::Configuring => "configuring",
            DriverState::Ready => "ready",
            DriverState::Streaming => "streaming",
            DriverState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Frame delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayStats {
    /// Frames handed to the data path.
    pub frames_queued: u32,
    /// Queued frames that were latched at a frame boundary.
    pub frames_presented: u32,
    /// Frame boundaries seen while streaming.
    pub vsync_count: u32,
    /// Writes refused while a hand-off was pending.
    pub dropped_writes: u32,
}

/// Redraw callback run on every `update()`.
type Writer = Box<dyn FnMut(&mut FramebufferManager) + Send>;

/// RGB panel driver.
pub struct RgbDisplay<P: LcdPeripheral> {
    /// Only `release()` takes the handle out.
    peripheral: Option<P>,
    config: DisplayConfig,
    state: DriverState,
    timing: TimingGenerator,
    data_path: PixelDataPath,
    frames: Option<FramebufferManager>,
    writer: Option<Writer>,
    fault: Option<Error>,
    frames_queued: u32,
    vsync_count: u32,
}

impl<P: LcdPeripheral> RgbDisplay<P> {
    pub fn new(peripheral: P, config: DisplayConfig) -> Self {
        Self {
            peripheral: Some(peripheral),
            config,
            state: DriverState::Uninitialized,
            timing: TimingGenerator::new(),
            data_path: PixelDataPath::new(TransferConfig::default()),
            frames: None,
            writer: None,
            fault: None,
            frames_queued: 0,
            vsync_count: 0,
        }
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    /// Mutable configuration, only before `init()`.
    pub fn config_mut(&mut self) -> Result<&mut DisplayConfig, Error> {
        if self.state != DriverState::Uninitialized {
            return Err(self.invalid_state("config_mut"));
        }
        Ok(&mut self.config)
    }

    /// Install a callback that redraws the back buffer on every `update()`.
    pub fn set_writer<F>(&mut self, writer: F)
    where
        F: FnMut(&mut FramebufferManager) + Send + 'static,
    {
        self.writer = Some(Box::new(writer));
    }

    /// Validate the configuration and bring the hardware up. Allowed once.
    ///
    /// On error nothing stays programmed and the driver is `Faulted`.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.state != DriverState::Uninitialized {
            return Err(self.invalid_state("init"));
        }
        let Some(mut peripheral) = self.peripheral.take() else {
            return Err(self.invalid_state("init"));
        };

        info!("Setting up RGB display...");
        self.state = DriverState::Configuring;

        let result = self.bring_up(&mut peripheral);
        self.peripheral = Some(peripheral);

        match result {
            Ok(()) => {
                self.state = DriverState::Ready;
                info!("RGB display initialized");
                if let Some(frames) = &self.frames {
                    info!("  Frame buffer: {:#x}", frames.front().region().addr());
                }
                info!("  Double buffering: enabled (2 framebuffers)");
                info!(
                    "  Bounce buffer: {} pixels ({} lines)",
                    self.data_path.transfer().bounce_buffer_px,
                    self.config.bounce_buffer_lines
                );
                Ok(())
            }
            Err(err) => {
                error!("RGB display setup failed: {}", err);
                self.teardown();
                self.state = DriverState::Faulted;
                self.fault = Some(err.into());
                Err(err.into())
            }
        }
    }

    fn bring_up(&mut self, peripheral: &mut P) -> Result<(), ConfigError> {
        let geometry = self.config.geometry()?;
        let pins = self.config.pins()?;

        // Everything is checked before the first register write.
        PixelDataPath::validate(&pins, peripheral)?;
        compute(&self.config.timing, &geometry, peripheral)?;
        let frames = FramebufferManager::allocate(&geometry, peripheral.dma_capacity())?;

        self.timing
            .configure(&self.config.timing, &geometry, peripheral)?;
        self.data_path = PixelDataPath::new(PixelDataPath::transfer_for(
            &geometry,
            self.config.bounce_buffer_lines,
        ));
        self.data_path.bind(&pins, peripheral)?;
        self.frames = Some(frames);
        Ok(())
    }

    /// Periodic work: keep the stream running, service pending events, run
    /// the writer and present a dirty frame.
    pub fn update(&mut self) -> Result<(), Error> {
        match self.state {
            DriverState::Faulted => return Err(self.fault_or_invalid("update")),
            DriverState::Uninitialized | DriverState::Configuring => {
                return Err(self.invalid_state("update"))
            }
            DriverState::Ready => self.start_stream()?,
            DriverState::Streaming => {}
        }

        self.handle_interrupt();
        if self.state != DriverState::Streaming {
            return Err(self.fault_or_invalid("update"));
        }

        if let (Some(writer), Some(frames)) = (self.writer.as_mut(), self.frames.as_mut()) {
            if frames.is_in_flight() {
                trace!("Hand-off pending, redraw skipped");
            } else {
                writer(frames);
            }
        }

        self.swap_if_dirty()?;
        Ok(())
    }

    /// Service pending peripheral events. Call from the LCD interrupt or
    /// let `update()` poll it. Returns `true` if a queued frame was latched.
    pub fn handle_interrupt(&mut self) -> bool {
        let Some(peripheral) = self.peripheral.as_mut() else {
            return false;
        };
        let events = peripheral.pending_events();
        if events.is_empty() {
            return false;
        }
        peripheral.clear_events(events);

        if self.state != DriverState::Streaming {
            trace!("Ignoring LCD events {:?} while {}", events, self.state);
            return false;
        }

        // The boundary happened before the fault was raised.
        let latched = events.contains(LcdEvent::Vsync) && self.on_frame_boundary();

        if events.contains(LcdEvent::Underrun) {
            self.hardware_fault(HardwareFault::FifoUnderrun);
        } else if events.contains(LcdEvent::DmaError) {
            self.hardware_fault(HardwareFault::DmaDescriptor);
        }
        latched
    }

    /// Start continuous scan-out of the front buffer.
    pub fn start_stream(&mut self) -> Result<(), Error> {
        match self.state {
            DriverState::Ready => {}
            DriverState::Streaming => return Err(IoError::BusBusy.into()),
            _ => return Err(self.invalid_state("start_stream")),
        }
        let Some(frames) = self.frames.as_ref() else {
            return Err(self.invalid_state("start_stream"));
        };
        let front = frames.front().region();
        let Some(peripheral) = self.peripheral.as_mut() else {
            return Err(self.invalid_state("start_stream"));
        };

        peripheral.clear_events(EnumSet::all());
        // SAFETY: the front buffer is owned by `self.frames`, is never written
        // while it is the front buffer and is only freed after the stream
        // has been stopped.
        if let Err(err) = unsafe { self.data_path.start_stream(front, peripheral) } {
            warn!("Could not start scan-out: {}", err);
            return Err(err.into());
        }

        self.state = DriverState::Streaming;
        info!("RGB display streaming");
        Ok(())
    }

    /// Stop scan-out after the frame on the wire. Safe in any state.
    pub fn stop_stream(&mut self) {
        if self.state != DriverState::Streaming {
            return;
        }
        self.handle_interrupt();
        if self.state != DriverState::Streaming {
            // A fault already tore the stream down.
            return;
        }

        self.halt();
        self.state = DriverState::Ready;
        info!("RGB display stopped");
    }

    /// Hand a dirty back buffer to the running stream. Returns `true` when a
    /// frame was queued.
    pub fn swap_if_dirty(&mut self) -> Result<bool, Error> {
        if self.state != DriverState::Streaming {
            return Ok(false);
        }
        let (Some(frames), Some(peripheral)) = (self.frames.as_mut(), self.peripheral.as_mut())
        else {
            return Ok(false);
        };
        let data_path = &mut self.data_path;
        // SAFETY: the back buffer stays locked by the manager until the frame
        // boundary makes it the front buffer.
        let swapped =
            frames.swap_if_dirty(|region| unsafe { data_path.queue_frame(region, peripheral) })?;
        if swapped {
            self.frames_queued = self.frames_queued.wrapping_add(1);
        }
        Ok(swapped)
    }

    /// Write an RGB888 pixel in panel coordinates, truncated to RGB565.
    pub fn draw_absolute_pixel(&mut self, x: i32, y: i32, color: Rgb888) -> bool {
        self.write_pixel(x, y, rgb888_to_rgb565(color))
    }

    /// Set one pixel of the back buffer.
    pub fn write_pixel(&mut self, x: i32, y: i32, color: Rgb565) -> bool {
        self.settle_hand_off();
        self.frames
            .as_mut()
            .is_some_and(|frames| frames.write_pixel(x, y, color))
    }

    pub fn mark_dirty(&mut self) {
        if let Some(frames) = self.frames.as_mut() {
            frames.mark_dirty();
        }
    }

    /// Re-apply timing on a configured driver. Identical timing is a no-op;
    /// anything else needs a new driver (`ConfigError::ReinitRequired`).
    pub fn reconfigure_timing(&mut self, params: &TimingParameters) -> Result<(), Error> {
        if !matches!(self.state, DriverState::Ready | DriverState::Streaming) {
            return Err(self.invalid_state("reconfigure_timing"));
        }
        let geometry = self.config.geometry()?;
        let Some(peripheral) = self.peripheral.as_mut() else {
            return Err(self.invalid_state("reconfigure_timing"));
        };
        self.timing.configure(params, &geometry, peripheral)?;
        Ok(())
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Error that put the driver into `Faulted`.
    pub fn fault(&self) -> Option<&Error> {
        self.fault.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.state == DriverState::Faulted
    }

    pub fn frame_timing(&self) -> Option<&FrameTiming> {
        self.timing.frame_timing()
    }

    pub fn achieved_pclk(&self) -> Option<HertzU32> {
        self.timing.achieved_pclk()
    }

    pub fn stats(&self) -> DisplayStats {
        let (frames_presented, dropped_writes) = self
            .frames
            .as_ref()
            .map_or((0, 0), |f| (f.presented_frames(), f.dropped_writes()));
        DisplayStats {
            frames_queued: self.frames_queued,
            frames_presented,
            vsync_count: self.vsync_count,
            dropped_writes,
        }
    }

    pub fn framebuffer(&self) -> Option<&FramebufferManager> {
        self.frames.as_ref()
    }

    /// Direct access to the framebuffers. Pending frame boundaries are
    /// serviced first.
    pub fn framebuffer_mut(&mut self) -> Option<&mut FramebufferManager> {
        self.settle_hand_off();
        self.frames.as_mut()
    }

    pub fn peripheral(&self) -> Option<&P> {
        self.peripheral.as_ref()
    }

    pub fn peripheral_mut(&mut self) -> Option<&mut P> {
        self.peripheral.as_mut()
    }

    /// Log the configuration.
    pub fn dump_config(&self) {
        let config = &self.config;
        let timing = &config.timing;
        info!("RGB Display:");
        info!("  Width: {}", config.width());
        info!("  Height: {}", config.height());
        info!("  PCLK Frequency: {} Hz", timing.pclk_frequency.raw());
        if let Some(achieved) = self.timing.achieved_pclk() {
            info!("  PCLK Achieved: {} Hz", achieved.raw());
        }
        info!(
            "  PCLK Inverted: {}",
            if timing.pclk_inverted { "YES" } else { "NO" }
        );
        for (name, pin) in [
            ("DE", config.de_pin()),
            ("PCLK", config.pclk_pin()),
            ("HSYNC", config.hsync_pin()),
            ("VSYNC", config.vsync_pin()),
        ] {
            match pin {
                Some(pin) => info!("  {} Pin: GPIO{}", name, pin),
                None => info!("  {} Pin: unassigned", name),
            }
        }
        info!("  Data Pins: {:?}", config.data_pins());
        info!(
            "  HSYNC: pulse={}, bp={}, fp={}",
            timing.hsync_pulse_width, timing.hsync_back_porch, timing.hsync_front_porch
        );
        info!(
            "  VSYNC: pulse={}, bp={}, fp={}",
            timing.vsync_pulse_width, timing.vsync_back_porch, timing.vsync_front_porch
        );
        if let Some(frame) = self.timing.frame_timing() {
            info!(
                "  Frame: {}x{} total, {} Hz refresh",
                frame.h_total,
                frame.v_total,
                frame.refresh_millihertz(
                    self.timing.achieved_pclk().unwrap_or(timing.pclk_frequency)
                ) / 1000
            );
        }
        if self.is_failed() {
            error!("  Setup failed!");
        }
    }

    /// Stop the stream, release the pins and reset the timing, then hand the
    /// peripheral back.
    pub fn release(mut self) -> P {
        self.teardown();
        match self.peripheral.take() {
            Some(peripheral) => peripheral,
            // `new` stores the handle and only this consuming call takes it.
            None => unreachable!(),
        }
    }

    fn teardown(&mut self) {
        let Some(peripheral) = self.peripheral.as_mut() else {
            return;
        };
        self.data_path.unbind(peripheral);
        peripheral.clear_events(EnumSet::all());
        self.timing.reset(peripheral);
        // Buffers go only after the stream is stopped.
        self.frames = None;
        if self.state == DriverState::Streaming {
            self.state = DriverState::Ready;
        }
        debug!("RGB display torn down");
    }

    /// Stop the transfer and settle the pending hand-off. A boundary raised
    /// while the transfer winds down still latches the queued frame.
    fn halt(&mut self) {
        let Some(peripheral) = self.peripheral.as_mut() else {
            return;
        };
        self.data_path.stop_stream(peripheral);
        let events = peripheral.pending_events();
        peripheral.clear_events(EnumSet::all());

        if events.contains(LcdEvent::Vsync) {
            self.on_frame_boundary();
        }
        if let Some(frames) = self.frames.as_mut() {
            frames.cancel_hand_off();
        }
    }

    fn on_frame_boundary(&mut self) -> bool {
        self.vsync_count = self.vsync_count.wrapping_add(1);
        self.frames
            .as_mut()
            .is_some_and(FramebufferManager::on_frame_boundary)
    }

    /// Account for a boundary the interrupt has not serviced yet, so writes
    /// after a latch reach the new back buffer.
    fn settle_hand_off(&mut self) {
        if self
            .frames
            .as_ref()
            .is_some_and(FramebufferManager::is_in_flight)
        {
            self.handle_interrupt();
        }
    }

    fn hardware_fault(&mut self, fault: HardwareFault) {
        error!("RGB display fault: {}", fault);
        self.halt();
        self.state = DriverState::Faulted;
        self.fault = Some(fault.into());
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            state: self.state,
            operation,
        }
    }

    fn fault_or_invalid(&self, operation: &'static str) -> Error {
        self.fault.unwrap_or(self.invalid_state(operation))
    }
}

impl<P: LcdPeripheral> Drop for RgbDisplay<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<P: LcdPeripheral> PixelSurface for RgbDisplay<P> {
    fn write_pixel(&mut self, x: i32, y: i32, color: Rgb565) -> bool {
        RgbDisplay::write_pixel(self, x, y, color)
    }

    fn width(&self) -> u16 {
        self.config.width()
    }

    fn height(&self) -> u16 {
        self.config.height()
    }
}

impl<P: LcdPeripheral> Pollable for RgbDisplay<P> {
    fn update(&mut self) -> Result<(), Error> {
        RgbDisplay::update(self)
    }

    fn update_interval(&self) -> Duration {
        self.config.update_interval
    }
}

impl<P: LcdPeripheral> OriginDimensions for RgbDisplay<P> {
    fn size(&self) -> Size {
        Size::new(self.config.width() as u32, self.config.height() as u32)
    }
}

impl<P: LcdPeripheral> DrawTarget for RgbDisplay<P> {
    type Color = Rgb565;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        if let Some(frames) = self.framebuffer_mut() {
            frames.draw_iter(pixels)?;
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        if let Some(frames) = self.framebuffer_mut() {
            frames.fill_rect(area, color);
        }
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        if let Some(frames) = self.framebuffer_mut() {
            frames.fill(color);
        }
        Ok(())
    }
}

//! Pixel data path.
//!
//! Routes the 16 data lines and the four control signals through the GPIO
//! matrix and owns the scan-out DMA stream.

use heapless::Vec;
use log::{debug, warn};

use crate::{
    config::{GpioNum, PanelGeometry, PinAssignment, PinRole},
    error::{ConfigError, IoError},
    hal::{DmaRegion, LcdPeripheral, OutputSignal, TransferConfig, DMA_BURST_SIZE},
};

/// Control signals plus the data bus.
const MAX_BOUND: usize = 20;

/// Pin binding and DMA stream control.
#[derive(Debug)]
pub struct PixelDataPath {
    bound: Vec<GpioNum, MAX_BOUND>,
    streaming: bool,
    transfer: TransferConfig,
}

impl PixelDataPath {
    pub fn new(transfer: TransferConfig) -> Self {
        Self {
            bound: Vec::new(),
            streaming: false,
            transfer,
        }
    }

    /// Transfer settings for a panel: 64-byte bursts, a bounce buffer of
    /// `bounce_lines` lines, continuous scan-out.
    pub fn transfer_for(geometry: &PanelGeometry, bounce_lines: u16) -> TransferConfig {
        TransferConfig {
            burst_size: DMA_BURST_SIZE,
            bounce_buffer_px: bounce_lines as usize * geometry.width() as usize,
            continuous: true,
        }
    }

    /// Check that every pin can drive an output and no pin has two roles.
    pub fn validate<P: LcdPeripheral>(
        pins: &PinAssignment,
        peripheral: &P,
    ) -> Result<(), ConfigError> {
        let mut seen: Vec<(GpioNum, PinRole), MAX_BOUND> = Vec::new();
        for (role, pin) in pins.iter() {
            if !peripheral.is_output_capable(pin) {
                return Err(ConfigError::PinNotOutputCapable { role, pin });
            }
            if let Some(&(_, first)) = seen.iter().find(|(p, _)| *p == pin) {
                return Err(ConfigError::PinConflict {
                    pin,
                    first,
                    second: role,
                });
            }
            // Capacity equals the number of roles.
            let _ = seen.push((pin, role));
        }
        Ok(())
    }

    /// Route every signal to its pin. Nothing is connected unless the whole
    /// assignment validates.
    pub fn bind<P: LcdPeripheral>(
        &mut self,
        pins: &PinAssignment,
        peripheral: &mut P,
    ) -> Result<(), ConfigError> {
        Self::validate(pins, peripheral)?;
        self.unbind(peripheral);

        for (role, pin) in pins.iter() {
            let signal = match role {
                PinRole::De => OutputSignal::De,
                PinRole::Pclk => OutputSignal::Pclk,
                PinRole::Hsync => OutputSignal::Hsync,
                PinRole::Vsync => OutputSignal::Vsync,
                PinRole::Data(n) => OutputSignal::Data(n),
            };
            peripheral.connect(signal, pin);
            let _ = self.bound.push(pin);
        }
        debug!("Bound {} LCD pins", self.bound.len());
        Ok(())
    }

    /// Release every bound pin back to GPIO. Stops the stream first.
    pub fn unbind<P: LcdPeripheral>(&mut self, peripheral: &mut P) {
        self.stop_stream(peripheral);
        while let Some(pin) = self.bound.pop() {
            peripheral.disconnect(pin);
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.bound.is_empty()
    }

    /// Start continuous scan-out of `frame`.
    ///
    /// # Safety
    ///
    /// `frame` must stay valid and unwritten while the peripheral reads it,
    /// see [`LcdPeripheral::start_transfer`].
    pub unsafe fn start_stream<P: LcdPeripheral>(
        &mut self,
        frame: DmaRegion,
        peripheral: &mut P,
    ) -> Result<(), IoError> {
        if self.streaming {
            return Err(IoError::BusBusy);
        }
        peripheral.start_transfer(frame, &self.transfer)?;
        self.streaming = true;
        debug!(
            "Scan-out started at {:#x}, {} bytes",
            frame.addr(),
            frame.len()
        );
        Ok(())
    }

    /// Hand `frame` to the running stream; it is picked up at the next frame
    /// boundary.
    ///
    /// # Safety
    ///
    /// Same contract as [`start_stream`](Self::start_stream).
    pub unsafe fn queue_frame<P: LcdPeripheral>(
        &mut self,
        frame: DmaRegion,
        peripheral: &mut P,
    ) -> Result<(), IoError> {
        if !self.streaming {
            return Err(IoError::NotStreaming);
        }
        peripheral.queue_frame(frame);
        Ok(())
    }

    /// Stop after the current frame. Does nothing when already stopped.
    pub fn stop_stream<P: LcdPeripheral>(&mut self, peripheral: &mut P) {
        if !self.streaming {
            return;
        }
        peripheral.stop_transfer();
        self.streaming = false;
        if peripheral.is_running() {
            warn!("LCD still running after stop request");
        }
        debug!("Scan-out stopped");
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn transfer(&self) -> &TransferConfig {
        &self.transfer
    }
}

//! Register-level model of the LCD peripheral for host builds.
//!
//! Keeps the programmed registers, the GPIO matrix routing and the DMA
//! stream state, and "scans out" a frame on [`SimulatedLcd::advance_frame`]
//! by copying the latched framebuffer into [`SimulatedLcd::displayed`].

use alloc::vec::Vec;

use enumset::EnumSet;
use fugit::HertzU32;
use log::trace;

use crate::{
    config::GpioNum,
    error::DmaError,
    hal::{
        DmaRegion, LcdEvent, LcdPeripheral, OutputSignal, TimingLimits, TimingRegisters,
        TransferConfig, DMA_ALIGNMENT,
    },
};

/// XTAL, PLL_F160M and APLL as selectable module clocks.
const CLOCK_SOURCES: [HertzU32; 3] = [HertzU32::MHz(40), HertzU32::MHz(160), HertzU32::MHz(240)];

const GPIO_COUNT: GpioNum = 55;

const DEFAULT_DMA_CAPACITY: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct SimulatedLcd {
    limits: TimingLimits,
    dma_capacity: usize,
    input_only: Vec<GpioNum>,
    timing: Option<TimingRegisters>,
    timing_writes: u32,
    connections: Vec<(GpioNum, OutputSignal)>,
    transfer: Option<TransferConfig>,
    running: bool,
    front: Option<DmaRegion>,
    queued: Option<DmaRegion>,
    events: EnumSet<LcdEvent>,
    refuse_next_start: bool,
    boundary_before_stop: bool,
    starts: u32,
    frames_scanned: u32,
    displayed: Vec<u8>,
}

impl Default for SimulatedLcd {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLcd {
    pub fn new() -> Self {
        Self {
            limits: TimingLimits::LCD_CAM,
            dma_capacity: DEFAULT_DMA_CAPACITY,
            input_only: Vec::new(),
            timing: None,
            timing_writes: 0,
            connections: Vec::new(),
            transfer: None,
            running: false,
            front: None,
            queued: None,
            events: EnumSet::empty(),
            refuse_next_start: false,
            boundary_before_stop: false,
            starts: 0,
            frames_scanned: 0,
            displayed: Vec::new(),
        }
    }

    pub fn with_dma_capacity(mut self, bytes: usize) -> Self {
        self.dma_capacity = bytes;
        self
    }

    pub fn with_max_bandwidth(mut self, bytes_per_second: u64) -> Self {
        self.limits.max_bandwidth = bytes_per_second;
        self
    }

    /// Mark `pin` as unable to drive outputs.
    pub fn with_input_only(mut self, pin: GpioNum) -> Self {
        self.input_only.push(pin);
        self
    }

    /// Make the next `start_transfer` fail with a descriptor error.
    pub fn refuse_next_start(&mut self) {
        self.refuse_next_start = true;
    }

    /// Let a frame boundary fall between a stop request and the end of the
    /// transfer, so a queued frame is latched on the way down.
    pub fn with_boundary_before_stop(mut self) -> Self {
        self.boundary_before_stop = true;
        self
    }

    /// Raise an interrupt as the hardware would.
    pub fn inject(&mut self, event: LcdEvent) {
        self.events |= event;
    }

    /// Run one frame period: latch a queued frame at the boundary, raise
    /// VSYNC and scan the front buffer out. Returns `false` when stopped.
    pub fn advance_frame(&mut self) -> bool {
        if !self.running {
            return false;
        }
        if let Some(queued) = self.queued.take() {
            trace!("Latched frame at {:#x}", queued.addr());
            self.front = Some(queued);
        }
        self.events |= LcdEvent::Vsync;

        if let Some(front) = self.front {
            // SAFETY: the driver keeps the region alive and unwritten while it
            // is bound to the running transfer.
            let bytes = unsafe { core::slice::from_raw_parts(front.as_ptr(), front.len()) };
            self.displayed.clear();
            self.displayed.extend_from_slice(bytes);
        }
        self.frames_scanned += 1;
        true
    }

    /// Last frame that reached the panel.
    pub fn displayed(&self) -> &[u8] {
        &self.displayed
    }

    pub fn frames_scanned(&self) -> u32 {
        self.frames_scanned
    }

    pub fn timing_writes(&self) -> u32 {
        self.timing_writes
    }

    /// Number of successful `start_transfer` calls.
    pub fn starts(&self) -> u32 {
        self.starts
    }

    pub fn connected(&self, pin: GpioNum) -> Option<OutputSignal> {
        self.connections
            .iter()
            .find(|(p, _)| *p == pin)
            .map(|(_, signal)| *signal)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn transfer_config(&self) -> Option<TransferConfig> {
        self.transfer
    }

    /// Region currently scanned out.
    pub fn scanning(&self) -> Option<DmaRegion> {
        self.front
    }

    pub fn queued(&self) -> Option<DmaRegion> {
        self.queued
    }
}

impl LcdPeripheral for SimulatedLcd {
    fn clock_sources(&self) -> &[HertzU32] {
        &CLOCK_SOURCES
    }

    fn limits(&self) -> TimingLimits {
        self.limits
    }

    fn dma_capacity(&self) -> usize {
        self.dma_capacity
    }

    fn is_output_capable(&self, pin: GpioNum) -> bool {
        pin < GPIO_COUNT && !self.input_only.contains(&pin)
    }

    fn write_timing(&mut self, registers: &TimingRegisters) {
        self.timing = Some(*registers);
        self.timing_writes += 1;
    }

    fn timing(&self) -> Option<TimingRegisters> {
        self.timing
    }

    fn reset_timing(&mut self) {
        self.timing = None;
    }

    fn connect(&mut self, signal: OutputSignal, pin: GpioNum) {
        self.disconnect(pin);
        self.connections.push((pin, signal));
    }

    fn disconnect(&mut self, pin: GpioNum) {
        self.connections.retain(|(p, _)| *p != pin);
    }

    unsafe fn start_transfer(
        &mut self,
        frame: DmaRegion,
        config: &TransferConfig,
    ) -> Result<(), DmaError> {
        if core::mem::take(&mut self.refuse_next_start) {
            return Err(DmaError::DescriptorError);
        }
        if frame.addr() % DMA_ALIGNMENT != 0 {
            return Err(DmaError::BufferMisaligned);
        }
        self.events = EnumSet::empty();
        self.transfer = Some(*config);
        self.front = Some(frame);
        self.queued = None;
        self.running = true;
        self.starts += 1;
        Ok(())
    }

    unsafe fn queue_frame(&mut self, frame: DmaRegion) {
        if self.running {
            self.queued = Some(frame);
        }
    }

    fn stop_transfer(&mut self) {
        if self.boundary_before_stop {
            self.advance_frame();
        }
        // The frame on the wire completes; nothing else is latched.
        self.running = false;
        self.front = None;
        self.queued = None;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn pending_events(&self) -> EnumSet<LcdEvent> {
        self.events
    }

    fn clear_events(&mut self, events: EnumSet<LcdEvent>) {
        self.events -= events;
    }
}

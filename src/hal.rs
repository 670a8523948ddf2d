//! Peripheral seam.
//!
//! [`LcdPeripheral`] is the owned handle to the LCD controller, its DMA
//! channel and the GPIO signal matrix. The driver never touches registers
//! any other way, so a chip backend and the host model look the same.

use core::ptr::NonNull;

use enumset::{EnumSet, EnumSetType};
use fugit::HertzU32;

use crate::{config::GpioNum, error::DmaError};

/// Required alignment of framebuffers handed to the DMA engine.
pub const DMA_ALIGNMENT: usize = 64;

/// Default DMA burst size in bytes.
pub const DMA_BURST_SIZE: usize = 64;

/// Peripheral-side output signals routed through the GPIO matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSignal {
    Pclk,
    Vsync,
    Hsync,
    /// Data enable (LCD_H_ENABLE).
    De,
    /// LCD_DATA_0..LCD_DATA_15.
    Data(u8),
}

/// Interrupt sources of the LCD controller.
#[derive(Debug, EnumSetType)]
pub enum LcdEvent {
    /// A VSYNC pulse was sent; the controller is at a frame boundary.
    Vsync,
    /// A one-shot transfer finished.
    TransDone,
    /// The async TX FIFO ran empty while pixels were due.
    Underrun,
    /// The DMA channel hit an invalid descriptor.
    DmaError,
}

/// Raw values for the LCD clock and RGB timing registers.
///
/// Counter fields hold `value - 1`, as the hardware expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingRegisters {
    /// Module clock source select (1-based).
    pub clk_sel: u8,
    /// Integral divider, 0 meaning 256.
    pub clkm_div_num: u8,
    /// Fractional divider denominator.
    pub clkm_div_a: u8,
    /// Fractional divider numerator.
    pub clkm_div_b: u8,
    /// PCLK = LCD_CLK / (clkcnt_n + 1).
    pub clkcnt_n: u8,
    pub pclk_idle_high: bool,
    pub pclk_active_neg: bool,

    pub ht_width: u16,
    pub hb_front: u16,
    pub ha_width: u16,
    pub vt_height: u16,
    pub vb_front: u8,
    pub va_height: u16,
    pub hsync_width: u8,
    pub vsync_width: u8,
    pub hsync_position: u8,

    pub hsync_idle_low: bool,
    pub vsync_idle_low: bool,
    pub de_idle_high: bool,
}

/// Hardware limits the timing generator checks against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingLimits {
    pub max_pclk: HertzU32,
    /// Sustained DMA read bandwidth from framebuffer memory, in bytes/s.
    pub max_bandwidth: u64,
    pub h_total_max: u32,
    pub h_blank_front_max: u32,
    pub h_active_max: u32,
    pub v_total_max: u32,
    pub v_blank_front_max: u32,
    pub v_active_max: u32,
    pub sync_width_max: u32,
}

impl TimingLimits {
    /// Field widths of the LCD_CAM RGB timing registers.
    pub const LCD_CAM: Self = Self {
        max_pclk: HertzU32::MHz(50),
        max_bandwidth: 200_000_000,
        h_total_max: 4096,
        h_blank_front_max: 2048,
        h_active_max: 4096,
        v_total_max: 1024,
        v_blank_front_max: 256,
        v_active_max: 1024,
        sync_width_max: 128,
    };
}

/// Parameters of the scan-out DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub burst_size: usize,
    /// Pixels staged in the bounce buffer, 0 to scan straight from PSRAM.
    pub bounce_buffer_px: usize,
    /// Restart the frame automatically at every frame boundary.
    pub continuous: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            burst_size: DMA_BURST_SIZE,
            bounce_buffer_px: 0,
            continuous: true,
        }
    }
}

/// Address and length of a framebuffer as seen by DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// A region is a plain descriptor; validity is guaranteed by whoever hands it
// to the peripheral.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Owned handle to an LCD controller in RGB mode.
pub trait LcdPeripheral {
    /// Frequencies of the selectable module clock sources, in select order.
    fn clock_sources(&self) -> &[HertzU32];

    fn limits(&self) -> TimingLimits;

    /// Bytes of DMA-capable memory available for framebuffers.
    fn dma_capacity(&self) -> usize;

    fn is_output_capable(&self, pin: GpioNum) -> bool;

    /// Program clock and timing registers and latch them (`lcd_update`).
    fn write_timing(&mut self, registers: &TimingRegisters);

    /// Currently programmed timing, `None` after reset.
    fn timing(&self) -> Option<TimingRegisters>;

    /// Return the timing registers to their reset state.
    fn reset_timing(&mut self);

    /// Route `signal` to `pin` as a push-pull output.
    fn connect(&mut self, signal: OutputSignal, pin: GpioNum);

    /// Detach `pin` from the LCD and return it to plain GPIO.
    fn disconnect(&mut self, pin: GpioNum);

    /// Reset the LCD unit and FIFO, then start scanning `frame` out.
    ///
    /// # Safety
    ///
    /// `frame` must stay valid and must not be written until
    /// [`stop_transfer`](Self::stop_transfer) returns or a frame boundary
    /// has latched a different region.
    unsafe fn start_transfer(
        &mut self,
        frame: DmaRegion,
        config: &TransferConfig,
    ) -> Result<(), DmaError>;

    /// Scan `frame` out from the next frame boundary on.
    ///
    /// # Safety
    ///
    /// Same contract as [`start_transfer`](Self::start_transfer), from the
    /// moment of this call.
    unsafe fn queue_frame(&mut self, frame: DmaRegion);

    /// Stop after the frame currently on the wire. Safe to call when idle.
    fn stop_transfer(&mut self);

    fn is_running(&self) -> bool;

    fn pending_events(&self) -> EnumSet<LcdEvent>;

    fn clear_events(&mut self, events: EnumSet<LcdEvent>);
}

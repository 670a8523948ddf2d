//! Display configuration bundle.
//!
//! Everything the driver needs is collected here before `init()`: panel
//! size, pin routing and sync timing. Defaults match a typical 800x480
//! 16-bit panel at 25 MHz.

use core::fmt;

use embassy_time::Duration;
use fugit::HertzU32;
use heapless::Vec;

use crate::error::ConfigError;

/// GPIO number on the SoC.
pub type GpioNum = u8;

/// Width of the parallel data bus (RGB565).
pub const DATA_LINES: usize = 16;

/// Bytes per RGB565 pixel.
pub const BYTES_PER_PIXEL: usize = 2;

/// Default number of panel lines staged in the bounce buffer.
pub const DEFAULT_BOUNCE_LINES: u16 = 20;

/// Panel resolution in pixels. Both sides are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelGeometry {
    width: u16,
    height: u16,
}

impl PanelGeometry {
    pub fn new(width: u16, height: u16) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::InvalidDimensions { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of one frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }

    /// Whether `(x, y)` lies inside the panel.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width as i32 && y < self.height as i32
    }
}

/// Logical role of an output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRole {
    De,
    Pclk,
    Hsync,
    Vsync,
    /// Data line D0..D15.
    Data(u8),
}

impl fmt::Display for PinRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinRole::De => write!(f, "DE"),
            PinRole::Pclk => write!(f, "PCLK"),
            PinRole::Hsync => write!(f, "HSYNC"),
            PinRole::Vsync => write!(f, "VSYNC"),
            PinRole::Data(n) => write!(f, "DATA{}", n),
        }
    }
}

/// Complete pin routing for the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAssignment {
    pub de: GpioNum,
    pub pclk: GpioNum,
    pub hsync: GpioNum,
    pub vsync: GpioNum,
    /// D0..D15, D0 being the least significant bit of blue.
    pub data: [GpioNum; DATA_LINES],
}

impl PinAssignment {
    /// All `(role, pin)` pairs, control signals first.
    pub fn iter(&self) -> impl Iterator<Item = (PinRole, GpioNum)> + '_ {
        [
            (PinRole::De, self.de),
            (PinRole::Pclk, self.pclk),
            (PinRole::Hsync, self.hsync),
            (PinRole::Vsync, self.vsync),
        ]
        .into_iter()
        .chain(
            self.data
                .iter()
                .enumerate()
                .map(|(i, &pin)| (PinRole::Data(i as u8), pin)),
        )
    }
}

/// Names a timing value, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingField {
    PclkFrequency,
    HsyncPulseWidth,
    HsyncBackPorch,
    HsyncFrontPorch,
    VsyncPulseWidth,
    VsyncBackPorch,
    VsyncFrontPorch,
}

impl fmt::Display for TimingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimingField::PclkFrequency => "pclk_frequency",
            TimingField::HsyncPulseWidth => "hsync_pulse_width",
            TimingField::HsyncBackPorch => "hsync_back_porch",
            TimingField::HsyncFrontPorch => "hsync_front_porch",
            TimingField::VsyncPulseWidth => "vsync_pulse_width",
            TimingField::VsyncBackPorch => "vsync_back_porch",
            TimingField::VsyncFrontPorch => "vsync_front_porch",
        };
        f.write_str(name)
    }
}

/// Pixel clock and sync timing of the panel.
///
/// Horizontal values are in PCLK cycles, vertical values in lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingParameters {
    pub pclk_frequency: HertzU32,
    /// Sample data on the falling edge of PCLK.
    pub pclk_inverted: bool,
    pub hsync_pulse_width: u16,
    pub hsync_back_porch: u16,
    pub hsync_front_porch: u16,
    pub vsync_pulse_width: u16,
    pub vsync_back_porch: u16,
    pub vsync_front_porch: u16,
}

impl Default for TimingParameters {
    fn default() -> Self {
        Self {
            pclk_frequency: HertzU32::MHz(25),
            pclk_inverted: false,
            hsync_pulse_width: 4,
            hsync_back_porch: 8,
            hsync_front_porch: 8,
            vsync_pulse_width: 4,
            vsync_back_porch: 16,
            vsync_front_porch: 16,
        }
    }
}

impl TimingParameters {
    /// First zero value, if any.
    pub fn zero_field(&self) -> Option<TimingField> {
        if self.pclk_frequency.raw() == 0 {
            return Some(TimingField::PclkFrequency);
        }
        [
            (self.hsync_pulse_width, TimingField::HsyncPulseWidth),
            (self.hsync_back_porch, TimingField::HsyncBackPorch),
            (self.hsync_front_porch, TimingField::HsyncFrontPorch),
            (self.vsync_pulse_width, TimingField::VsyncPulseWidth),
            (self.vsync_back_porch, TimingField::VsyncBackPorch),
            (self.vsync_front_porch, TimingField::VsyncFrontPorch),
        ]
        .into_iter()
        .find(|(value, _)| *value == 0)
        .map(|(_, field)| field)
    }
}

/// Everything the driver is configured with before `init()`.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    width: u16,
    height: u16,
    data_pins: Vec<GpioNum, DATA_LINES>,
    de_pin: Option<GpioNum>,
    pclk_pin: Option<GpioNum>,
    hsync_pin: Option<GpioNum>,
    vsync_pin: Option<GpioNum>,
    /// Sync timing and pixel clock.
    pub timing: TimingParameters,
    /// Lines staged in internal SRAM between PSRAM and the LCD FIFO.
    pub bounce_buffer_lines: u16,
    /// How often the poller should call `update()`.
    pub update_interval: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 480,
            data_pins: Vec::new(),
            de_pin: None,
            pclk_pin: None,
            hsync_pin: None,
            vsync_pin: None,
            timing: TimingParameters::default(),
            bounce_buffer_lines: DEFAULT_BOUNCE_LINES,
            update_interval: Duration::from_secs(1),
        }
    }
}

impl DisplayConfig {
    pub fn set_dimensions(&mut self, width: u16, height: u16) -> &mut Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set D0..D15. Anything other than 16 pins is rejected.
    pub fn set_data_pins(&mut self, pins: &[GpioNum]) -> Result<&mut Self, ConfigError> {
        if pins.len() != DATA_LINES {
            return Err(ConfigError::DataPinCount { found: pins.len() });
        }
        self.data_pins = Vec::from_slice(pins)
            .map_err(|_| ConfigError::DataPinCount { found: pins.len() })?;
        Ok(self)
    }

    pub fn set_de_pin(&mut self, pin: GpioNum) -> &mut Self {
        self.de_pin = Some(pin);
        self
    }

    pub fn set_pclk_pin(&mut self, pin: GpioNum) -> &mut Self {
        self.pclk_pin = Some(pin);
        self
    }

    pub fn set_hsync_pin(&mut self, pin: GpioNum) -> &mut Self {
        self.hsync_pin = Some(pin);
        self
    }

    pub fn set_vsync_pin(&mut self, pin: GpioNum) -> &mut Self {
        self.vsync_pin = Some(pin);
        self
    }

    pub fn set_pclk_frequency(&mut self, frequency: HertzU32) -> &mut Self {
        self.timing.pclk_frequency = frequency;
        self
    }

    pub fn set_pclk_inverted(&mut self, inverted: bool) -> &mut Self {
        self.timing.pclk_inverted = inverted;
        self
    }

    pub fn set_hsync_pulse_width(&mut self, width: u16) -> &mut Self {
        self.timing.hsync_pulse_width = width;
        self
    }

    pub fn set_hsync_back_porch(&mut self, porch: u16) -> &mut Self {
        self.timing.hsync_back_porch = porch;
        self
    }

    pub fn set_hsync_front_porch(&mut self, porch: u16) -> &mut Self {
        self.timing.hsync_front_porch = porch;
        self
    }

    pub fn set_vsync_pulse_width(&mut self, width: u16) -> &mut Self {
        self.timing.vsync_pulse_width = width;
        self
    }

    pub fn set_vsync_back_porch(&mut self, porch: u16) -> &mut Self {
        self.timing.vsync_back_porch = porch;
        self
    }

    pub fn set_vsync_front_porch(&mut self, porch: u16) -> &mut Self {
        self.timing.vsync_front_porch = porch;
        self
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn data_pins(&self) -> &[GpioNum] {
        &self.data_pins
    }

    pub fn de_pin(&self) -> Option<GpioNum> {
        self.de_pin
    }

    pub fn pclk_pin(&self) -> Option<GpioNum> {
        self.pclk_pin
    }

    pub fn hsync_pin(&self) -> Option<GpioNum> {
        self.hsync_pin
    }

    pub fn vsync_pin(&self) -> Option<GpioNum> {
        self.vsync_pin
    }

    /// Validated panel geometry.
    pub fn geometry(&self) -> Result<PanelGeometry, ConfigError> {
        PanelGeometry::new(self.width, self.height)
    }

    /// Validated pin routing. Output capability and collisions are checked
    /// against the peripheral when binding.
    pub fn pins(&self) -> Result<PinAssignment, ConfigError> {
        let data: [GpioNum; DATA_LINES] = self
            .data_pins
            .as_slice()
            .try_into()
            .map_err(|_| ConfigError::DataPinCount {
                found: self.data_pins.len(),
            })?;

        Ok(PinAssignment {
            de: self.de_pin.ok_or(ConfigError::PinUnassigned(PinRole::De))?,
            pclk: self.pclk_pin.ok_or(ConfigError::PinUnassigned(PinRole::Pclk))?,
            hsync: self
                .hsync_pin
                .ok_or(ConfigError::PinUnassigned(PinRole::Hsync))?,
            vsync: self
                .vsync_pin
                .ok_or(ConfigError::PinUnassigned(PinRole::Vsync))?,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: [GpioNum; 16] = [10, 11, 12, 13, 14, 21, 8, 18, 45, 38, 39, 40, 41, 42, 2, 1];

    #[test]
    fn defaults_match_panel_schema() {
        let config = DisplayConfig::default();
        assert_eq!((config.width(), config.height()), (800, 480));
        assert_eq!(config.timing.pclk_frequency, HertzU32::MHz(25));
        assert!(!config.timing.pclk_inverted);
        assert_eq!(
            (
                config.timing.hsync_pulse_width,
                config.timing.hsync_back_porch,
                config.timing.hsync_front_porch
            ),
            (4, 8, 8)
        );
        assert_eq!(
            (
                config.timing.vsync_pulse_width,
                config.timing.vsync_back_porch,
                config.timing.vsync_front_porch
            ),
            (4, 16, 16)
        );
        assert_eq!(config.bounce_buffer_lines, 20);
    }

    #[test]
    fn geometry_rejects_zero_sides() {
        assert_eq!(
            PanelGeometry::new(0, 480),
            Err(ConfigError::InvalidDimensions {
                width: 0,
                height: 480
            })
        );
        assert!(PanelGeometry::new(800, 0).is_err());
        let geometry = PanelGeometry::new(1, 1).unwrap();
        assert_eq!(geometry.frame_bytes(), 2);
    }

    #[test]
    fn geometry_contains_is_bounds_checked() {
        let geometry = PanelGeometry::new(800, 480).unwrap();
        assert!(geometry.contains(0, 0));
        assert!(geometry.contains(799, 479));
        assert!(!geometry.contains(800, 0));
        assert!(!geometry.contains(0, 480));
        assert!(!geometry.contains(-1, 3));
    }

    #[test]
    fn data_pin_count_must_be_sixteen() {
        let mut config = DisplayConfig::default();
        assert_eq!(
            config.set_data_pins(&DATA[..15]).err(),
            Some(ConfigError::DataPinCount { found: 15 })
        );

        let mut seventeen = [0u8; 17];
        seventeen[..16].copy_from_slice(&DATA);
        seventeen[16] = 47;
        assert_eq!(
            config.set_data_pins(&seventeen).err(),
            Some(ConfigError::DataPinCount { found: 17 })
        );

        assert!(config.set_data_pins(&DATA).is_ok());
        assert_eq!(config.data_pins(), &DATA);
    }

    #[test]
    fn pins_require_every_role() {
        let mut config = DisplayConfig::default();
        assert_eq!(
            config.pins(),
            Err(ConfigError::DataPinCount { found: 0 })
        );

        config.set_data_pins(&DATA).unwrap();
        config.set_pclk_pin(9).set_hsync_pin(46).set_vsync_pin(3);
        assert_eq!(config.pins(), Err(ConfigError::PinUnassigned(PinRole::De)));

        config.set_de_pin(17);
        let pins = config.pins().unwrap();
        assert_eq!(pins.de, 17);
        assert_eq!(pins.data, DATA);

        let roles: heapless::Vec<PinRole, 20> = pins.iter().map(|(role, _)| role).collect();
        assert_eq!(roles.len(), 20);
        assert_eq!(roles[0], PinRole::De);
        assert_eq!(roles[19], PinRole::Data(15));
    }

    #[test]
    fn zero_field_reports_first_zero() {
        let mut timing = TimingParameters::default();
        assert_eq!(timing.zero_field(), None);

        timing.vsync_back_porch = 0;
        assert_eq!(timing.zero_field(), Some(TimingField::VsyncBackPorch));

        timing.pclk_frequency = HertzU32::from_raw(0);
        assert_eq!(timing.zero_field(), Some(TimingField::PclkFrequency));
    }
}

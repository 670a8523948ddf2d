//! Error taxonomy for the RGB display driver.
//!
//! Configuration problems are fatal and reported at setup time, bus problems
//! are transient and can be retried, hardware faults tear the stream down.

use core::fmt;

use crate::{
    config::{GpioNum, PinRole, TimingField},
    display::DriverState,
};

/// Invalid or unrealisable configuration, detected during `init()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Width or height is zero.
    InvalidDimensions { width: u16, height: u16 },
    /// The data bus needs exactly 16 lines.
    DataPinCount { found: usize },
    /// A control signal has no pin assigned.
    PinUnassigned(PinRole),
    /// The pin cannot drive an output signal.
    PinNotOutputCapable { role: PinRole, pin: GpioNum },
    /// The same pin was given two roles.
    PinConflict {
        pin: GpioNum,
        first: PinRole,
        second: PinRole,
    },
    /// A pulse width, porch or the pixel clock is zero.
    ZeroTiming(TimingField),
    /// The timing cannot be produced by the peripheral.
    TimingInfeasible(Infeasible),
    /// Different timing was requested while the old one is live.
    ReinitRequired,
    /// The framebuffers do not fit in DMA-capable memory.
    OutOfMemory { requested: usize, available: usize },
}

/// Why a timing configuration cannot be realised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Infeasible {
    /// Requested pixel clock is above what the peripheral supports.
    ClockAboveMaximum { requested: u32, max: u32 },
    /// No clock source and divider combination gets close enough.
    ClockUnreachable { requested: u32, achievable: u32 },
    /// Scan-out would need more memory bandwidth than DMA provides.
    Bandwidth { required: u64, available: u64 },
    /// A derived value does not fit its register field.
    RegisterOverflow {
        field: &'static str,
        value: u32,
        max: u32,
    },
}

/// DMA engine refused or aborted a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// The descriptor chain was rejected.
    DescriptorError,
    /// The buffer does not meet the DMA alignment requirement.
    BufferMisaligned,
}

/// Transient transfer condition; recoverable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// A stream is already running.
    BusBusy,
    /// A frame was handed off without an active stream.
    NotStreaming,
    /// The DMA engine refused the transfer.
    Dma(DmaError),
}

/// Fault reported by the peripheral while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareFault {
    /// The LCD FIFO ran dry mid-line.
    FifoUnderrun,
    /// DMA hit a bad descriptor mid-frame.
    DmaDescriptor,
}

/// Top-level driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Config(ConfigError),
    Io(IoError),
    Hardware(HardwareFault),
    /// The operation is not allowed in the current driver state.
    InvalidState {
        state: DriverState,
        operation: &'static str,
    },
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Error::Io(err)
    }
}

impl From<HardwareFault> for Error {
    fn from(err: HardwareFault) -> Self {
        Error::Hardware(err)
    }
}

impl From<DmaError> for IoError {
    fn from(err: DmaError) -> Self {
        IoError::Dma(err)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidDimensions { width, height } => {
                write!(f, "invalid panel dimensions {}x{}", width, height)
            }
            ConfigError::DataPinCount { found } => {
                write!(f, "exactly 16 data pins are required for RGB565 mode, got {}", found)
            }
            ConfigError::PinUnassigned(role) => write!(f, "{} pin must be configured", role),
            ConfigError::PinNotOutputCapable { role, pin } => {
                write!(f, "GPIO{} ({}) is not output capable", pin, role)
            }
            ConfigError::PinConflict { pin, first, second } => {
                write!(f, "GPIO{} assigned to both {} and {}", pin, first, second)
            }
            ConfigError::ZeroTiming(field) => write!(f, "{} must be at least 1", field),
            ConfigError::TimingInfeasible(reason) => write!(f, "timing infeasible: {}", reason),
            ConfigError::ReinitRequired => {
                write!(f, "timing differs from the programmed one, full re-init required")
            }
            ConfigError::OutOfMemory { requested, available } => write!(
                f,
                "framebuffers need {} bytes of DMA memory, {} available",
                requested, available
            ),
        }
    }
}

impl fmt::Display for Infeasible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Infeasible::ClockAboveMaximum { requested, max } => {
                write!(f, "pixel clock {} Hz above maximum {} Hz", requested, max)
            }
            Infeasible::ClockUnreachable {
                requested,
                achievable,
            } => write!(
                f,
                "pixel clock {} Hz not reachable by the clock divider (best {} Hz)",
                requested, achievable
            ),
            Infeasible::Bandwidth {
                required,
                available,
            } => write!(
                f,
                "scan-out needs {} B/s, DMA provides {} B/s",
                required, available
            ),
            Infeasible::RegisterOverflow { field, value, max } => {
                write!(f, "{} = {} exceeds register limit {}", field, value, max)
            }
        }
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaError::DescriptorError => write!(f, "DMA descriptor error"),
            DmaError::BufferMisaligned => write!(f, "DMA buffer misaligned"),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::BusBusy => write!(f, "stream already active"),
            IoError::NotStreaming => write!(f, "no active stream"),
            IoError::Dma(err) => write!(f, "{}", err),
        }
    }
}

impl fmt::Display for HardwareFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareFault::FifoUnderrun => write!(f, "LCD FIFO underrun"),
            HardwareFault::DmaDescriptor => write!(f, "DMA descriptor fault during scan-out"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(err) => write!(f, "configuration error: {}", err),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Hardware(err) => write!(f, "hardware fault: {}", err),
            Error::InvalidState { state, operation } => {
                write!(f, "{} not allowed in state {}", operation, state)
            }
        }
    }
}

impl core::error::Error for ConfigError {}
impl core::error::Error for IoError {}
impl core::error::Error for HardwareFault {}
impl core::error::Error for DmaError {}
impl core::error::Error for Error {}

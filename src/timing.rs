//! Timing generator.
//!
//! Turns panel porches and pulse widths into the RGB timing registers and
//! finds a clock source and divider for the pixel clock.
//!
//! Line layout (in PCLK cycles), the vertical axis works the same in lines:
//!
//! ```text
//! |<- hsync ->|<- back porch ->|<------ active ------>|<- front porch ->|
//! |<------ blank front ------->|
//! |<-------------------------------- total ---------------------------->|
//! ```

use fugit::HertzU32;
use log::{debug, info};

use crate::{
    config::{PanelGeometry, TimingParameters, BYTES_PER_PIXEL},
    error::{ConfigError, Infeasible},
    hal::{LcdPeripheral, TimingLimits, TimingRegisters},
};

/// How far the achieved pixel clock may fall below the request.
pub const PCLK_TOLERANCE_PERCENT: u64 = 5;

/// PCLK = LCD_CLK / 2. The LCD_PCLK divider must be at least 2 (ESP32-S3
/// errata), so the module clock is run at twice the pixel clock.
const PCLK_DIVIDER: u32 = 2;

/// Derived frame geometry including blanking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub h_total: u32,
    /// Cycles from start of line to first active pixel (includes hsync).
    pub h_blank_front: u32,
    pub h_active: u32,
    pub v_total: u32,
    /// Lines from start of frame to first active line (includes vsync).
    pub v_blank_front: u32,
    pub v_active: u32,
    pub hsync_width: u32,
    pub vsync_width: u32,
}

impl FrameTiming {
    pub fn new(params: &TimingParameters, geometry: &PanelGeometry) -> Self {
        let hsync = params.hsync_pulse_width as u32;
        let vsync = params.vsync_pulse_width as u32;
        let h_blank_front = hsync + params.hsync_back_porch as u32;
        let v_blank_front = vsync + params.vsync_back_porch as u32;
        let h_active = geometry.width() as u32;
        let v_active = geometry.height() as u32;

        Self {
            h_total: h_blank_front + h_active + params.hsync_front_porch as u32,
            h_blank_front,
            h_active,
            v_total: v_blank_front + v_active + params.vsync_front_porch as u32,
            v_blank_front,
            v_active,
            hsync_width: hsync,
            vsync_width: vsync,
        }
    }

    /// PCLK cycles per frame, blanking included.
    pub fn cycles_per_frame(&self) -> u64 {
        self.h_total as u64 * self.v_total as u64
    }

    /// Refresh rate at `pclk`, in millihertz.
    pub fn refresh_millihertz(&self, pclk: HertzU32) -> u32 {
        (pclk.raw() as u64 * 1000 / self.cycles_per_frame()) as u32
    }

    fn check(&self, limits: &TimingLimits) -> Result<(), Infeasible> {
        let fields = [
            ("h_total", self.h_total, limits.h_total_max),
            ("h_blank_front", self.h_blank_front, limits.h_blank_front_max),
            ("h_active", self.h_active, limits.h_active_max),
            ("v_total", self.v_total, limits.v_total_max),
            ("v_blank_front", self.v_blank_front, limits.v_blank_front_max),
            ("v_active", self.v_active, limits.v_active_max),
            ("hsync_width", self.hsync_width, limits.sync_width_max),
            ("vsync_width", self.vsync_width, limits.sync_width_max),
        ];
        for (field, value, max) in fields {
            if value > max {
                return Err(Infeasible::RegisterOverflow { field, value, max });
            }
        }
        Ok(())
    }
}

/// Programs and tracks the RGB timing of one peripheral.
#[derive(Debug, Default)]
pub struct TimingGenerator {
    programmed: Option<TimingRegisters>,
    frame: Option<FrameTiming>,
    achieved_pclk: Option<HertzU32>,
}

impl TimingGenerator {
    pub const fn new() -> Self {
        Self {
            programmed: None,
            frame: None,
            achieved_pclk: None,
        }
    }

    /// Validate the timing and program it.
    ///
    /// Calling again with identical parameters leaves the registers alone.
    /// Different parameters on a programmed generator need a full re-init.
    pub fn configure<P: LcdPeripheral>(
        &mut self,
        params: &TimingParameters,
        geometry: &PanelGeometry,
        peripheral: &mut P,
    ) -> Result<(), ConfigError> {
        let (registers, frame, achieved) = compute(params, geometry, peripheral)?;

        if let Some(programmed) = self.programmed {
            if programmed == registers {
                debug!("Timing unchanged, registers left as programmed");
                return Ok(());
            }
            return Err(ConfigError::ReinitRequired);
        }

        peripheral.write_timing(&registers);
        self.programmed = Some(registers);
        self.frame = Some(frame);
        self.achieved_pclk = Some(achieved);

        info!(
            "RGB timing: {}x{} total, PCLK {} Hz (requested {} Hz), {}.{:03} Hz refresh",
            frame.h_total,
            frame.v_total,
            achieved.raw(),
            params.pclk_frequency.raw(),
            frame.refresh_millihertz(achieved) / 1000,
            frame.refresh_millihertz(achieved) % 1000,
        );
        Ok(())
    }

    /// Forget the programmed timing and reset the registers.
    pub fn reset<P: LcdPeripheral>(&mut self, peripheral: &mut P) {
        if self.programmed.take().is_some() {
            peripheral.reset_timing();
        }
        self.frame = None;
        self.achieved_pclk = None;
    }

    pub fn is_programmed(&self) -> bool {
        self.programmed.is_some()
    }

    pub fn registers(&self) -> Option<&TimingRegisters> {
        self.programmed.as_ref()
    }

    pub fn frame_timing(&self) -> Option<&FrameTiming> {
        self.frame.as_ref()
    }

    pub fn achieved_pclk(&self) -> Option<HertzU32> {
        self.achieved_pclk
    }
}

/// Derive register values for `params` on `peripheral` without touching it.
pub fn compute<P: LcdPeripheral>(
    params: &TimingParameters,
    geometry: &PanelGeometry,
    peripheral: &P,
) -> Result<(TimingRegisters, FrameTiming, HertzU32), ConfigError> {
    if let Some(field) = params.zero_field() {
        return Err(ConfigError::ZeroTiming(field));
    }

    let limits = peripheral.limits();
    let requested = params.pclk_frequency.raw();
    if requested > limits.max_pclk.raw() {
        return Err(infeasible(Infeasible::ClockAboveMaximum {
            requested,
            max: limits.max_pclk.raw(),
        }));
    }

    let frame = FrameTiming::new(params, geometry);
    frame.check(&limits).map_err(infeasible)?;

    let required = requested as u64 * BYTES_PER_PIXEL as u64;
    if required > limits.max_bandwidth {
        return Err(infeasible(Infeasible::Bandwidth {
            required,
            available: limits.max_bandwidth,
        }));
    }

    let lcd_clk = requested
        .checked_mul(PCLK_DIVIDER)
        .ok_or(infeasible(Infeasible::ClockAboveMaximum {
            requested,
            max: limits.max_pclk.raw(),
        }))?;
    let (source, divider) = calculate_clkm(lcd_clk, peripheral.clock_sources()).ok_or(
        infeasible(Infeasible::ClockUnreachable {
            requested,
            achievable: 0,
        }),
    )?;
    let achieved =
        output_frequency(peripheral.clock_sources()[source].raw(), &divider) / PCLK_DIVIDER;
    if (achieved as u64) * 100 < requested as u64 * (100 - PCLK_TOLERANCE_PERCENT) {
        return Err(infeasible(Infeasible::ClockUnreachable {
            requested,
            achievable: achieved,
        }));
    }

    let registers = TimingRegisters {
        clk_sel: (source + 1) as u8,
        clkm_div_num: divider.div_num as u8,
        clkm_div_a: divider.div_a as u8,
        clkm_div_b: divider.div_b as u8,
        clkcnt_n: (PCLK_DIVIDER - 1) as u8,
        pclk_idle_high: !params.pclk_inverted,
        pclk_active_neg: params.pclk_inverted,

        ht_width: (frame.h_total - 1) as u16,
        hb_front: (frame.h_blank_front - 1) as u16,
        ha_width: (frame.h_active - 1) as u16,
        vt_height: (frame.v_total - 1) as u16,
        vb_front: (frame.v_blank_front - 1) as u8,
        va_height: (frame.v_active - 1) as u16,
        hsync_width: (frame.hsync_width - 1) as u8,
        vsync_width: (frame.vsync_width - 1) as u8,
        hsync_position: 0,

        hsync_idle_low: false,
        vsync_idle_low: false,
        de_idle_high: false,
    };

    Ok((registers, frame, HertzU32::from_raw(achieved)))
}

fn infeasible(reason: Infeasible) -> ConfigError {
    ConfigError::TimingInfeasible(reason)
}

/// LCD_CLK = source / (div_num + div_b / div_a).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDivider {
    /// Integral part (8 bits). 0 is treated as 256, 1 as 2.
    pub div_num: u32,
    /// Fractional numerator (6 bits).
    pub div_b: u32,
    /// Fractional denominator (6 bits).
    pub div_a: u32,
}

/// Pick the clock source whose best divider gets closest to `desired`
/// without exceeding it. Returns the source index and its divider.
pub fn calculate_clkm(desired: u32, sources: &[HertzU32]) -> Option<(usize, ClockDivider)> {
    let mut result: Option<(usize, ClockDivider)> = None;
    let mut result_freq = 0;

    for (i, source) in sources.iter().enumerate() {
        let Some(div) = calculate_closest_divider(source.raw(), desired) else {
            continue;
        };
        let freq = output_frequency(source.raw(), &div);
        if result.is_none() || freq > result_freq {
            result = Some((i, div));
            result_freq = freq;
        }
    }

    result
}

/// Frequency a source produces through `divider`.
pub fn output_frequency(source: u32, divider: &ClockDivider) -> u32 {
    let n = match divider.div_num {
        0 => 256,
        1 => 2,
        n => n.min(256),
    } as u64;

    if divider.div_a != 0 && divider.div_b != 0 {
        // source / (n + b/a) = source * a / (n * a + b)
        let source = source as u64;
        let a = divider.div_a as u64;
        let b = divider.div_b as u64;
        (source * a / (n * a + b)) as u32
    } else {
        (source as u64 / n) as u32
    }
}

fn calculate_closest_divider(source: u32, desired: u32) -> Option<ClockDivider> {
    if desired == 0 {
        return None;
    }

    let div_num = source / desired;
    if div_num < 2 {
        // Source isn't fast enough; the best it can do is source / 2.
        return Some(ClockDivider {
            div_num: 1,
            div_b: 0,
            div_a: 0,
        });
    }
    if div_num > 256 {
        // Too fast to divide down that far.
        return None;
    }

    let div_num = if div_num == 256 { 0 } else { div_num };

    let remainder = source % desired;
    if remainder == 0 {
        return Some(ClockDivider {
            div_num,
            div_b: 0,
            div_a: 0,
        });
    }

    let gcd = hcf(remainder, desired);
    let target = Fraction {
        numerator: remainder / gcd,
        denominator: desired / gcd,
    };

    // Round the fraction up so the output never exceeds the request.
    let closest = farey_sequence(63).find(|curr| {
        curr.numerator as u64 * target.denominator as u64
            >= target.numerator as u64 * curr.denominator as u64
    })?;

    Some(ClockDivider {
        div_num,
        div_b: closest.numerator,
        div_a: closest.denominator,
    })
}

const fn hcf(a: u32, b: u32) -> u32 {
    if b != 0 {
        hcf(b, a % b)
    } else {
        a
    }
}

struct Fraction {
    numerator: u32,
    denominator: u32,
}

// Next-term recurrence of the Farey sequence of the given order, ascending
// from 0/1 to 1/1.
fn farey_sequence(order: u32) -> impl Iterator<Item = Fraction> {
    let (mut a, mut b, mut c, mut d) = (0u32, 1u32, 1u32, order);
    core::iter::from_fn(move || {
        if a > b {
            return None;
        }
        let next = Fraction {
            numerator: a,
            denominator: b,
        };
        if a == b {
            // 1/1 is the last term.
            a = b + 1;
            return Some(next);
        }
        let k = (order + b) / d;
        (a, b, c, d) = (c, d, k * c - a, k * d - b);
        Some(next)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedLcd;

    fn panel() -> PanelGeometry {
        PanelGeometry::new(800, 480).unwrap()
    }

    #[test]
    fn frame_timing_adds_porches_and_pulses() {
        let frame = FrameTiming::new(&TimingParameters::default(), &panel());
        assert_eq!(frame.h_total, 4 + 8 + 800 + 8);
        assert_eq!(frame.h_blank_front, 12);
        assert_eq!(frame.v_total, 4 + 16 + 480 + 16);
        assert_eq!(frame.v_blank_front, 20);
        // 25 MHz / (820 * 516) = 59.084 Hz
        assert_eq!(frame.refresh_millihertz(HertzU32::MHz(25)), 59_084);
    }

    #[test]
    fn default_timing_registers() {
        let lcd = SimulatedLcd::new();
        let (regs, _, achieved) =
            compute(&TimingParameters::default(), &panel(), &lcd).unwrap();

        assert_eq!(achieved, HertzU32::MHz(25));
        assert_eq!(regs.ht_width, 819);
        assert_eq!(regs.hb_front, 11);
        assert_eq!(regs.ha_width, 799);
        assert_eq!(regs.vt_height, 515);
        assert_eq!(regs.vb_front, 19);
        assert_eq!(regs.va_height, 479);
        assert_eq!(regs.hsync_width, 3);
        assert_eq!(regs.vsync_width, 3);
        assert_eq!(regs.clkcnt_n, 1);
        assert!(regs.pclk_idle_high);
        assert!(!regs.pclk_active_neg);
    }

    #[test]
    fn inverted_pclk_flips_clock_edges() {
        let lcd = SimulatedLcd::new();
        let params = TimingParameters {
            pclk_inverted: true,
            ..Default::default()
        };
        let (regs, _, _) = compute(&params, &panel(), &lcd).unwrap();
        assert!(!regs.pclk_idle_high);
        assert!(regs.pclk_active_neg);
    }

    #[test]
    fn fractional_divider_hits_exact_clock() {
        // 50 MHz from 160 MHz: 3 + 1/5
        let div = calculate_closest_divider(160_000_000, 50_000_000).unwrap();
        assert_eq!(
            div,
            ClockDivider {
                div_num: 3,
                div_b: 1,
                div_a: 5
            }
        );
        assert_eq!(output_frequency(160_000_000, &div), 50_000_000);
    }

    #[test]
    fn divider_never_overshoots() {
        for desired in [7_000_000u32, 13_600_000, 33_333_333, 48_000_000] {
            let div = calculate_closest_divider(160_000_000, desired).unwrap();
            assert!(output_frequency(160_000_000, &div) <= desired);
        }
    }

    #[test]
    fn slow_source_caps_at_half() {
        let div = calculate_closest_divider(40_000_000, 50_000_000).unwrap();
        assert_eq!(output_frequency(40_000_000, &div), 20_000_000);
    }

    #[test]
    fn clkm_prefers_closest_source() {
        let sources = [HertzU32::MHz(40), HertzU32::MHz(160)];
        let (index, div) = calculate_clkm(50_000_000, &sources).unwrap();
        assert_eq!(index, 1);
        assert_eq!(output_frequency(160_000_000, &div), 50_000_000);
    }

    #[test]
    fn clkm_none_when_too_slow_for_every_source() {
        // 240 MHz / 256 is still above 100 kHz.
        assert!(calculate_clkm(100_000, &[HertzU32::MHz(240)]).is_none());
    }

    #[test]
    fn zero_porch_is_rejected() {
        let lcd = SimulatedLcd::new();
        let params = TimingParameters {
            hsync_front_porch: 0,
            ..Default::default()
        };
        assert_eq!(
            compute(&params, &panel(), &lcd).err(),
            Some(ConfigError::ZeroTiming(
                crate::config::TimingField::HsyncFrontPorch
            ))
        );
    }

    #[test]
    fn pclk_above_maximum_is_infeasible() {
        let lcd = SimulatedLcd::new();
        let params = TimingParameters {
            pclk_frequency: HertzU32::MHz(120),
            ..Default::default()
        };
        assert!(matches!(
            compute(&params, &panel(), &lcd),
            Err(ConfigError::TimingInfeasible(
                Infeasible::ClockAboveMaximum { .. }
            ))
        ));
    }

    #[test]
    fn unreachable_pclk_is_infeasible() {
        let lcd = SimulatedLcd::new();
        // Far below what 256 can divide the slowest source down to.
        let params = TimingParameters {
            pclk_frequency: HertzU32::kHz(20),
            ..Default::default()
        };
        assert!(matches!(
            compute(&params, &panel(), &lcd),
            Err(ConfigError::TimingInfeasible(
                Infeasible::ClockUnreachable { .. }
            ))
        ));
    }

    #[test]
    fn oversized_panel_overflows_registers() {
        let lcd = SimulatedLcd::new();
        let tall = PanelGeometry::new(800, 1200).unwrap();
        assert!(matches!(
            compute(&TimingParameters::default(), &tall, &lcd),
            Err(ConfigError::TimingInfeasible(Infeasible::RegisterOverflow {
                field: "v_total",
                ..
            }))
        ));
    }

    #[test]
    fn bandwidth_budget_is_enforced() {
        let lcd = SimulatedLcd::new().with_max_bandwidth(40_000_000);
        assert!(matches!(
            compute(&TimingParameters::default(), &panel(), &lcd),
            Err(ConfigError::TimingInfeasible(Infeasible::Bandwidth {
                required: 50_000_000,
                available: 40_000_000
            }))
        ));
    }

    #[test]
    fn configure_twice_with_same_parameters_is_idempotent() {
        let mut lcd = SimulatedLcd::new();
        let mut generator = TimingGenerator::new();
        let params = TimingParameters::default();

        assert!(!generator.is_programmed());
        generator.configure(&params, &panel(), &mut lcd).unwrap();
        let snapshot = lcd.timing();
        assert_eq!(lcd.timing_writes(), 1);
        assert!(generator.is_programmed());
        assert_eq!(generator.registers().copied(), snapshot);

        generator.configure(&params, &panel(), &mut lcd).unwrap();
        assert_eq!(lcd.timing_writes(), 1);
        assert_eq!(lcd.timing(), snapshot);
    }

    #[test]
    fn configure_with_new_parameters_needs_reinit() {
        let mut lcd = SimulatedLcd::new();
        let mut generator = TimingGenerator::new();
        generator
            .configure(&TimingParameters::default(), &panel(), &mut lcd)
            .unwrap();

        let faster = TimingParameters {
            pclk_frequency: HertzU32::MHz(30),
            ..Default::default()
        };
        assert_eq!(
            generator.configure(&faster, &panel(), &mut lcd),
            Err(ConfigError::ReinitRequired)
        );
        assert_eq!(lcd.timing_writes(), 1);

        generator.reset(&mut lcd);
        assert!(lcd.timing().is_none());
        assert!(generator.registers().is_none());
        generator.configure(&faster, &panel(), &mut lcd).unwrap();
        assert_eq!(lcd.timing_writes(), 2);
    }

    #[test]
    fn farey_sequence_is_ascending_and_complete() {
        let terms: alloc::vec::Vec<(u32, u32)> = farey_sequence(5)
            .map(|f| (f.numerator, f.denominator))
            .collect();
        assert_eq!(terms.first(), Some(&(0, 1)));
        assert_eq!(terms.last(), Some(&(1, 1)));
        // |F5| = 11
        assert_eq!(terms.len(), 11);
        for pair in terms.windows(2) {
            let (a, b) = pair[0];
            let (c, d) = pair[1];
            assert!(a * d < c * b);
        }
    }
}

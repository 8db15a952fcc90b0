//! Fixed-point wire formats of the instrument.
//!
//! The instrument speaks in raw integer codes:
//! - ADC readings are 22-bit two's-complement values packed into 3 bytes, with
//!   the two top bits of the MSB carrying overflow flags.
//! - DAC setpoints are 20-bit offset-binary codes packed as 8/8/4 bits into
//!   3 bytes (the low nibble of the last byte is unused).
//! - Shunt trims are 16-bit offset-binary codes in 2 bytes.
//!
//! All conversions to physical units go through [`Calibration`].

use crate::ranging::CurrentRange;

// ============================================================================
// Constants
// ============================================================================

/// Bias of the 20-bit offset-binary DAC code.
pub const DAC_BIAS: i32 = 1 << 19;
/// Largest signed DAC value (before bias).
pub const DAC_MAX: i32 = DAC_BIAS - 1;
/// Smallest signed DAC value (before bias).
pub const DAC_MIN: i32 = -DAC_BIAS;

/// Bias of the 16-bit offset-binary calibration fields.
const TWO_BYTE_BIAS: i32 = 1 << 15;

/// ADC full scale in counts (2^21).
pub const ADC_FULL_SCALE: f64 = 2_097_152.0;
/// Potential measured at ADC full scale, in volts.
const POTENTIAL_FULL_SCALE_V: f64 = 8.0;
/// Current measured at ADC full scale on the 20 mA range, in mA, before the
/// per-decade divisor.
const CURRENT_FULL_SCALE_MA: f64 = 25.0;

const ADC_OVERFLOW_HIGH: u8 = 0x40; // B22
const ADC_OVERFLOW_LOW: u8 = 0x80; // B23
const ADC_SIGN_BIT: u8 = 0x20; // B21 (sign when no overflow)

// ============================================================================
// Raw codes
// ============================================================================

/// Reconstruct a signed 22-bit ADC reading from its three wire bytes.
///
/// Without overflow the sign lives in bit 21. When either overflow flag is
/// set, bit 23 decides the sign instead.
pub fn decode_adc_value(msb: u8, mid: u8, lsb: u8) -> i32 {
    let overflow_high = msb & ADC_OVERFLOW_HIGH != 0 && msb & ADC_OVERFLOW_LOW == 0;
    let overflow_low = msb & ADC_OVERFLOW_LOW != 0;
    let magnitude = ((msb as i32 & 0x3F) << 16) | ((mid as i32) << 8) | lsb as i32;

    let negative = if !overflow_high && !overflow_low {
        msb & ADC_SIGN_BIT != 0
    } else {
        msb & ADC_OVERFLOW_LOW != 0
    };

    if negative {
        magnitude - (1 << 22)
    } else {
        magnitude
    }
}

/// Encode a signed DAC value into the 3-byte wire form.
///
/// The value is rounded and silently clipped to `[DAC_MIN, DAC_MAX]`; an
/// out-of-range code is never sent.
pub fn encode_dac_value(value: f64) -> [u8; 3] {
    let clipped = value.round().clamp(DAC_MIN as f64, DAC_MAX as f64) as i32;
    let code = (clipped + DAC_BIAS) as u32;
    [
        (code >> 12) as u8,
        ((code >> 4) & 0xFF) as u8,
        ((code & 0x0F) << 4) as u8,
    ]
}

/// Inverse of [`encode_dac_value`].
pub fn decode_dac_value(bytes: [u8; 3]) -> i32 {
    let code = ((bytes[0] as i32) << 12) | ((bytes[1] as i32) << 4) | (bytes[2] as i32 >> 4);
    code - DAC_BIAS
}

/// Encode a signed value into a 2-byte offset-binary field (big endian).
pub fn encode_two_bytes(value: f64) -> [u8; 2] {
    let clipped = value
        .round()
        .clamp(-TWO_BYTE_BIAS as f64, (TWO_BYTE_BIAS - 1) as f64) as i32;
    let code = (clipped + TWO_BYTE_BIAS) as u16;
    code.to_be_bytes()
}

/// Inverse of [`encode_two_bytes`].
pub fn decode_two_bytes(bytes: [u8; 2]) -> f64 {
    (u16::from_be_bytes(bytes) as i32 - TWO_BYTE_BIAS) as f64
}

// ============================================================================
// Calibration
// ============================================================================

/// Calibration state of one instrument.
///
/// Offsets are in ADC counts. `shunt_correction` holds the fine trim of each
/// shunt resistor (R1/10 Ω, R2/1 kΩ, R3/100 kΩ), nominally 1.0, stored on the
/// device in 1 ppm steps (±3.3%).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub dac_offset: i32,
    pub dac_gain: i32,
    pub potential_offset: i32,
    pub current_offset: i32,
    pub shunt_correction: [f64; 3],
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            dac_offset: 0,
            dac_gain: DAC_BIAS,
            potential_offset: 0,
            current_offset: 0,
            shunt_correction: [1.0; 3],
        }
    }
}

impl Calibration {
    /// Measured potential in volts.
    pub fn potential_volts(&self, raw_potential: i32) -> f64 {
        (raw_potential - self.potential_offset) as f64 / ADC_FULL_SCALE * POTENTIAL_FULL_SCALE_V
    }

    /// Measured current in mA on the given range.
    pub fn current_milliamps(&self, raw_current: i32, range: CurrentRange) -> f64 {
        (raw_current - self.current_offset) as f64 / ADC_FULL_SCALE * CURRENT_FULL_SCALE_MA
            / self.shunt_divisor(range)
    }

    /// DAC value that commands the given potential (volts).
    pub fn potential_setpoint(&self, volts: f64) -> f64 {
        volts / POTENTIAL_FULL_SCALE_V * DAC_BIAS as f64
            + (self.potential_offset as f64 / 4.0).round()
    }

    /// DAC value that commands the given current (mA) on the given range.
    pub fn current_setpoint(&self, milliamps: f64, range: CurrentRange) -> f64 {
        milliamps / (CURRENT_FULL_SCALE_MA / self.shunt_divisor(range)) * DAC_BIAS as f64
            + (self.current_offset as f64 / 4.0).round()
    }

    fn shunt_divisor(&self, range: CurrentRange) -> f64 {
        self.shunt_correction[range.index()] * range.decade_divisor()
    }
}

// ============================================================================
// Display formatting
// ============================================================================

/// Potential with sign and millivolt resolution, e.g. `"+0.250 V"`.
pub fn format_potential(volts: f64) -> String {
    format!("{:+6.3} V", volts)
}

/// Format a current with the resolution appropriate to the active range.
pub fn format_current(range: CurrentRange, milliamps: f64) -> String {
    let abs_value = milliamps.abs();
    match range {
        CurrentRange::High if abs_value <= 9.9995 => format!("{:+6.3} mA", milliamps),
        CurrentRange::High => format!("{:+6.2} mA", milliamps),
        CurrentRange::Mid if abs_value < 9.9995e-2 => format!("{:+06.2} µA", milliamps * 1e3),
        CurrentRange::Mid => format!("{:+6.1} µA", milliamps * 1e3),
        CurrentRange::Low => format!("{:+6.3} µA", milliamps * 1e3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adc_positive_without_overflow() {
        assert_eq!(decode_adc_value(0b0001_0000, 0x00, 0x00), 1_048_576);
        assert_eq!(decode_adc_value(0x1F, 0xFF, 0xFF), 2_097_151);
        assert_eq!(decode_adc_value(0x00, 0x01, 0x02), 258);
    }

    #[test]
    fn adc_negative_without_overflow() {
        assert_eq!(decode_adc_value(0x3F, 0xFF, 0xFF), -1);
        assert_eq!(decode_adc_value(0x20, 0x00, 0x00), -2_097_152);
    }

    #[test]
    fn adc_overflow_high_is_positive() {
        // B22 set: bit 21 no longer carries the sign
        assert_eq!(decode_adc_value(0x60, 0x00, 0x00), 2_097_152);
        assert_eq!(decode_adc_value(0x40, 0x00, 0x05), 5);
    }

    #[test]
    fn adc_overflow_low_is_negative() {
        assert_eq!(decode_adc_value(0xA0, 0x00, 0x00), -2_097_152);
        assert_eq!(decode_adc_value(0x80, 0x00, 0x00), -4_194_304);
    }

    #[test]
    fn dac_round_trip_over_full_range() {
        for v in (DAC_MIN..=DAC_MAX).step_by(997).chain([DAC_MIN, -1, 0, 1, DAC_MAX]) {
            assert_eq!(decode_dac_value(encode_dac_value(v as f64)), v, "value {v}");
        }
    }

    #[test]
    fn dac_clips_instead_of_wrapping() {
        assert_eq!(decode_dac_value(encode_dac_value(1e9)), DAC_MAX);
        assert_eq!(decode_dac_value(encode_dac_value(-1e9)), DAC_MIN);
        assert_eq!(encode_dac_value(DAC_MAX as f64 + 1.0), [0xFF, 0xFF, 0xF0]);
        assert_eq!(encode_dac_value(DAC_MIN as f64 - 1.0), [0x00, 0x00, 0x00]);
    }

    #[test]
    fn dac_zero_is_mid_scale() {
        assert_eq!(encode_dac_value(0.0), [0x80, 0x00, 0x00]);
        assert_eq!(encode_dac_value(0.4), [0x80, 0x00, 0x00]);
        assert_eq!(encode_dac_value(1.0), [0x80, 0x00, 0x10]);
    }

    #[test]
    fn two_byte_fields() {
        assert_eq!(encode_two_bytes(0.0), [0x80, 0x00]);
        assert_eq!(decode_two_bytes(encode_two_bytes(-1234.0)), -1234.0);
        assert_eq!(decode_two_bytes(encode_two_bytes(40_000.0)), 32_767.0);
        assert_eq!(decode_two_bytes(encode_two_bytes(-40_000.0)), -32_768.0);
    }

    #[test]
    fn physical_conversions() {
        let cal = Calibration::default();
        assert_eq!(cal.potential_volts(1_048_576), 4.0);
        assert_eq!(cal.current_milliamps(1_048_576, CurrentRange::High), 12.5);
        assert!((cal.current_milliamps(1_048_576, CurrentRange::Mid) - 0.125).abs() < 1e-12);
        assert!((cal.current_milliamps(1_048_576, CurrentRange::Low) - 0.00125).abs() < 1e-12);

        let trimmed = Calibration {
            potential_offset: 100,
            current_offset: -100,
            shunt_correction: [1.0, 1.01, 1.0],
            ..Calibration::default()
        };
        assert_eq!(trimmed.potential_volts(100), 0.0);
        assert_eq!(trimmed.current_milliamps(-100, CurrentRange::Mid), 0.0);
        let i = trimmed.current_milliamps(1_048_476, CurrentRange::Mid);
        assert!((i - 0.125 / 1.01).abs() < 1e-12);
    }

    #[test]
    fn setpoints_include_quarter_offset() {
        let cal = Calibration {
            potential_offset: 10,
            current_offset: -6,
            ..Calibration::default()
        };
        assert_eq!(cal.potential_setpoint(1.0), 65_536.0 + 3.0);
        // -1.5 rounds away from zero
        assert_eq!(cal.current_setpoint(0.0, CurrentRange::High), -2.0);
    }

    #[test]
    fn formatting() {
        assert_eq!(format_potential(0.5), "+0.500 V");
        assert_eq!(format_current(CurrentRange::High, 1.2341), "+1.234 mA");
        assert_eq!(format_current(CurrentRange::High, -12.346), "-12.35 mA");
        assert_eq!(format_current(CurrentRange::Mid, 0.05), "+50.00 µA");
        assert_eq!(format_current(CurrentRange::Mid, 0.15), "+150.0 µA");
        assert_eq!(format_current(CurrentRange::Low, 0.0012), "+1.200 µA");
    }
}

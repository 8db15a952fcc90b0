//! Simulated instrument.
//!
//! [`SimulatedCell`] answers the full command set for a resistor, optionally in
//! series with a capacitor, so runs can be exercised without hardware. The
//! model is ideal: setpoints are reproduced exactly, readings are clamped at
//! ADC full scale, and flash starts out empty.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use crate::codec::{decode_dac_value, ADC_FULL_SCALE, DAC_BIAS};
use crate::errors::Result;
use crate::ranging::CurrentRange;
use crate::timing::Clock;
use crate::transport::Transport;

const EMPTY_FLASH: [u8; 6] = [0xFF; 6];
const UNKNOWN_COMMAND: &[u8] = b"?";

/// Externally observable state of the simulated instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SimState {
    pub cell_on: bool,
    pub galvanostatic: bool,
    pub range: CurrentRange,
    /// Signed DAC code last written with `DACSET`.
    pub dac_code: i32,
    /// Voltage across the capacitor, if the cell has one.
    pub capacitor_voltage: f64,
    pub dac_calibration: Option<[u8; 6]>,
    pub offsets: Option<[u8; 6]>,
    pub shunt_calibration: Option<[u8; 6]>,
    /// `ADCREAD` requests still to be answered with `WAIT`.
    pub pending_waits: u32,
    /// `ADCREAD` requests still to be answered with a truncated frame.
    pub pending_garbled: u32,
    pub commands: Vec<Vec<u8>>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            cell_on: false,
            galvanostatic: false,
            range: CurrentRange::High,
            dac_code: 0,
            capacitor_voltage: 0.0,
            dac_calibration: None,
            offsets: None,
            shunt_calibration: None,
            pending_waits: 0,
            pending_garbled: 0,
            commands: Vec::new(),
        }
    }
}

/// Shared view of a [`SimulatedCell`] that stays usable after the cell has
/// been handed to the engine.
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn state(&self) -> SimState {
        self.lock().clone()
    }

    /// Answer the next `count` ADC reads with `WAIT`.
    pub fn respond_wait(&self, count: u32) {
        self.lock().pending_waits += count;
    }

    /// Answer the next `count` ADC reads with two bytes instead of six.
    pub fn respond_garbled(&self, count: u32) {
        self.lock().pending_garbled += count;
    }

    /// Preload the calibration blocks as if they had been saved earlier.
    pub fn store_calibration(&self, dac: [u8; 6], offsets: [u8; 6], shunts: [u8; 6]) {
        let mut state = self.lock();
        state.dac_calibration = Some(dac);
        state.offsets = Some(offsets);
        state.shunt_calibration = Some(shunts);
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // a poisoned lock still holds consistent plain data
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct SimulatedCell {
    resistance: f64,
    capacitance: Option<(f64, Arc<dyn Clock>)>,
    last_update: Option<Duration>,
    state: SimHandle,
}

impl SimulatedCell {
    /// A plain resistor of `ohms`.
    pub fn resistor(ohms: f64) -> Self {
        Self {
            resistance: ohms,
            capacitance: None,
            last_update: None,
            state: SimHandle(Arc::new(Mutex::new(SimState::default()))),
        }
    }

    /// A resistor in series with a capacitor of `farads`, charged in `clock` time.
    pub fn rc(ohms: f64, farads: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacitance: Some((farads, clock)),
            ..Self::resistor(ohms)
        }
    }

    pub fn handle(&self) -> SimHandle {
        self.state.clone()
    }

    /// Full-scale current of a range in mA, nominal shunts.
    fn current_scale(range: CurrentRange) -> f64 {
        25.0 / range.decade_divisor()
    }

    /// Cell current in mA for the present state, ignoring reading limits.
    fn cell_current(&self, state: &SimState) -> f64 {
        if !state.cell_on {
            return 0.0;
        }
        let fraction = state.dac_code as f64 / DAC_BIAS as f64;
        if state.galvanostatic {
            fraction * Self::current_scale(state.range)
        } else {
            let applied = fraction * 8.0;
            (applied - state.capacitor_voltage) / self.resistance * 1e3
        }
    }

    fn cell_potential(&self, state: &SimState, current_ma: f64) -> f64 {
        if !state.cell_on {
            return 0.0;
        }
        if state.galvanostatic {
            state.capacitor_voltage + current_ma * 1e-3 * self.resistance
        } else {
            state.dac_code as f64 / DAC_BIAS as f64 * 8.0
        }
    }

    /// Integrate the capacitor charge up to now.
    fn advance(&mut self) {
        let Some((farads, clock)) = &self.capacitance else {
            return;
        };
        let now = clock.now();
        let farads = *farads;
        let dt = self
            .last_update
            .map_or(0.0, |last| now.saturating_sub(last).as_secs_f64());
        self.last_update = Some(now);

        let state = self.state.lock().clone();
        let current = self.cell_current(&state);
        self.state.lock().capacitor_voltage += current * 1e-3 * dt / farads;
    }

    fn read_adc(&self) -> Vec<u8> {
        let mut state = self.state.lock();
        if state.pending_waits > 0 {
            state.pending_waits -= 1;
            return b"WAIT".to_vec();
        }
        if state.pending_garbled > 0 {
            state.pending_garbled -= 1;
            return vec![0x7F, 0x00];
        }
        let current = self.cell_current(&state);
        let potential = self.cell_potential(&state, current);
        let raw_potential = potential / 8.0 * ADC_FULL_SCALE;
        let raw_current = current / Self::current_scale(state.range) * ADC_FULL_SCALE;

        let mut frame = encode_adc_value(raw_potential).to_vec();
        frame.extend_from_slice(&encode_adc_value(raw_current));
        frame
    }

    fn respond(&mut self, command: &[u8]) -> Vec<u8> {
        self.advance();
        if command == b"ADCREAD" {
            return self.read_adc();
        }

        let mut state = self.state.lock();
        state.commands.push(command.to_vec());
        let ok = b"OK".to_vec();
        match command {
            b"CELL ON" => state.cell_on = true,
            b"CELL OFF" => state.cell_on = false,
            b"POTENTIOSTATIC" => state.galvanostatic = false,
            b"GALVANOSTATIC" => state.galvanostatic = true,
            b"RANGE 1" => state.range = CurrentRange::High,
            b"RANGE 2" => state.range = CurrentRange::Mid,
            b"RANGE 3" => state.range = CurrentRange::Low,
            b"DACCAL" => {
                // ideal DAC: zero offset, nominal gain
                state.dac_calibration = Some([0x80, 0, 0, 0x80, 0, 0]);
            }
            b"DACCALGET" => return state.dac_calibration.unwrap_or(EMPTY_FLASH).to_vec(),
            b"OFFSETREAD" => return state.offsets.unwrap_or(EMPTY_FLASH).to_vec(),
            b"SHUNTCALREAD" => return state.shunt_calibration.unwrap_or(EMPTY_FLASH).to_vec(),
            _ => {
                if let Some(payload) = payload::<3>(command, b"DACSET ") {
                    state.dac_code = decode_dac_value(payload);
                } else if let Some(payload) = payload::<6>(command, b"DACCALSET ") {
                    state.dac_calibration = Some(payload);
                } else if let Some(payload) = payload::<6>(command, b"OFFSETSAVE ") {
                    state.offsets = Some(payload);
                } else if let Some(payload) = payload::<6>(command, b"SHUNTCALSAVE ") {
                    state.shunt_calibration = Some(payload);
                } else {
                    debug!("sim: unknown command {:?}", String::from_utf8_lossy(command));
                    return UNKNOWN_COMMAND.to_vec();
                }
            }
        }
        ok
    }
}

impl Transport for SimulatedCell {
    fn query(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        Ok(self.respond(command))
    }
}

/// Binary payload of exactly `N` bytes following `prefix`.
fn payload<const N: usize>(command: &[u8], prefix: &[u8]) -> Option<[u8; N]> {
    command
        .strip_prefix(prefix)
        .and_then(|rest| <[u8; N]>::try_from(rest).ok())
}

/// 22-bit two's-complement ADC word, clamped to full scale.
fn encode_adc_value(raw: f64) -> [u8; 3] {
    let limit = ADC_FULL_SCALE;
    let value = raw.round().clamp(-limit, limit - 1.0) as i32;
    let word = (value & 0x3F_FFFF) as u32;
    [(word >> 16) as u8, (word >> 8) as u8, word as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_adc_value, encode_dac_value};
    use crate::timing::ManualClock;

    fn dacset(volts: f64) -> Vec<u8> {
        let mut cmd = b"DACSET ".to_vec();
        cmd.extend_from_slice(&encode_dac_value(volts / 8.0 * DAC_BIAS as f64));
        cmd
    }

    fn adc(cell: &mut SimulatedCell) -> (i32, i32) {
        let frame = cell.query(b"ADCREAD").unwrap();
        (
            decode_adc_value(frame[0], frame[1], frame[2]),
            decode_adc_value(frame[3], frame[4], frame[5]),
        )
    }

    #[test]
    fn adc_words_decode_back() {
        for raw in [0.0, 1.0, -1.0, 1_048_576.0, -2_097_152.0] {
            let b = encode_adc_value(raw);
            assert_eq!(decode_adc_value(b[0], b[1], b[2]), raw as i32);
        }
        let b = encode_adc_value(1e9);
        assert_eq!(decode_adc_value(b[0], b[1], b[2]), 2_097_151);
    }

    #[test]
    fn resistor_follows_ohms_law() {
        let mut cell = SimulatedCell::resistor(1000.0);
        assert_eq!(cell.query(&dacset(0.5)).unwrap(), b"OK");
        assert_eq!(cell.query(b"CELL ON").unwrap(), b"OK");
        let (raw_v, raw_i) = adc(&mut cell);
        // 0.5 V over 8 V full scale, 0.5 mA over 25 mA full scale
        assert_eq!(raw_v, 131_072);
        assert_eq!(raw_i, 41_943);

        cell.query(b"CELL OFF").unwrap();
        assert_eq!(adc(&mut cell), (0, 0));
    }

    #[test]
    fn capacitor_charges_under_constant_current() {
        let clock = Arc::new(ManualClock::new());
        let mut cell = SimulatedCell::rc(100.0, 0.01, clock.clone());
        let handle = cell.handle();
        cell.query(b"GALVANOSTATIC").unwrap();
        cell.query(b"RANGE 2").unwrap();
        // 0.1 mA on the 0.25 mA scale
        let mut cmd = b"DACSET ".to_vec();
        cmd.extend_from_slice(&encode_dac_value(0.4 * DAC_BIAS as f64));
        cell.query(&cmd).unwrap();
        cell.query(b"CELL ON").unwrap();

        clock.advance(Duration::from_secs(10));
        adc(&mut cell);
        let v = handle.state().capacitor_voltage;
        assert!((v - 0.1).abs() < 1e-6, "capacitor at {v} V");
    }

    #[test]
    fn flash_starts_empty_and_keeps_saved_blocks() {
        let mut cell = SimulatedCell::resistor(1.0);
        assert_eq!(cell.query(b"OFFSETREAD").unwrap(), EMPTY_FLASH);
        let mut save = b"OFFSETSAVE ".to_vec();
        save.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(cell.query(&save).unwrap(), b"OK");
        assert_eq!(cell.query(b"OFFSETREAD").unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(cell.query(b"DACSET 1").unwrap(), b"?");
    }

    #[test]
    fn scheduled_waits() {
        let mut cell = SimulatedCell::resistor(1.0);
        cell.handle().respond_wait(1);
        assert_eq!(cell.query(b"ADCREAD").unwrap(), b"WAIT");
        assert_eq!(cell.query(b"ADCREAD").unwrap().len(), 6);

        cell.handle().respond_garbled(1);
        assert_eq!(cell.query(b"ADCREAD").unwrap().len(), 2);
        assert_eq!(cell.query(b"ADCREAD").unwrap().len(), 6);
    }
}

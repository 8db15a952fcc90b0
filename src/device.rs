//! Instrument driver.
//!
//! Wraps a [`Transport`] with the potentiostat's command set. Every command is
//! a single blocking round-trip; the driver never issues a second command
//! before the first response has arrived.
//!
//! # Protocol
//!
//! | command                 | response                              |
//! |-------------------------|---------------------------------------|
//! | `CELL ON` / `CELL OFF`  | `OK`                                  |
//! | `POTENTIOSTATIC` / `GALVANOSTATIC` | `OK`                       |
//! | `RANGE 1..3`            | `OK`                                  |
//! | `DACSET` + 3 bytes      | `OK`                                  |
//! | `DACCAL`                | `OK`                                  |
//! | `ADCREAD`               | `WAIT` or potential(3) + current(3)   |
//! | `OFFSETREAD`            | potential offset(3) + current offset(3), or 6×0xFF |
//! | `OFFSETSAVE ` + 6 bytes | `OK`                                  |
//! | `DACCALGET`             | DAC offset(3) + DAC gain−2^19(3), or 6×0xFF |
//! | `DACCALSET ` + 6 bytes  | `OK`                                  |
//! | `SHUNTCALREAD`          | 3 × 2-byte trims in ppm, or 6×0xFF    |
//! | `SHUNTCALSAVE ` + 6 bytes | `OK`                                |

use std::sync::Arc;

use log::{debug, info, warn};

use crate::codec::{
    decode_adc_value, decode_dac_value, decode_two_bytes, encode_dac_value, encode_two_bytes,
    Calibration, DAC_BIAS,
};
use crate::errors::{DriverError, Result};
use crate::ranging::CurrentRange;
use crate::timing::{Clock, ReadPacer};
use crate::transport::Transport;

const RESPONSE_OK: &[u8] = b"OK";
const RESPONSE_WAIT: &[u8] = b"WAIT";
const PAYLOAD_LEN: usize = 6;
const NOT_STORED: [u8; PAYLOAD_LEN] = [0xFF; PAYLOAD_LEN];

/// Feedback loop mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// Hold the commanded potential.
    #[default]
    Potentiostatic,
    /// Hold the commanded current.
    Galvanostatic,
}

impl ControlMode {
    fn command(self) -> &'static [u8] {
        match self {
            ControlMode::Potentiostatic => b"POTENTIOSTATIC",
            ControlMode::Galvanostatic => b"GALVANOSTATIC",
        }
    }
}

/// A DAC setpoint in one of the supported units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputValue {
    /// Volts
    Potential(f64),
    /// Milliamps, on the active range
    Current(f64),
    /// Raw signed DAC code
    DacCode(i32),
}

/// One ADC reading converted with the calibration and range in effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentSample {
    pub raw_potential: i32,
    pub raw_current: i32,
    /// Volts
    pub potential: f64,
    /// Milliamps
    pub current: f64,
    pub range: CurrentRange,
}

/// Which calibration blocks were found in device flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationLoad {
    pub dac: bool,
    pub offsets: bool,
    pub shunts: bool,
}

/// Driver for one connected instrument.
pub struct Potentiostat {
    transport: Box<dyn Transport>,
    clock: Arc<dyn Clock>,
    pacer: ReadPacer,
    calibration: Calibration,
    range: CurrentRange,
    cell_on: bool,
    control_mode: ControlMode,
    last_sample: Option<InstrumentSample>,
}

impl Potentiostat {
    pub fn new(transport: Box<dyn Transport>, clock: Arc<dyn Clock>, pacer: ReadPacer) -> Self {
        Self {
            transport,
            clock,
            pacer,
            calibration: Calibration::default(),
            range: CurrentRange::High,
            cell_on: false,
            control_mode: ControlMode::Potentiostatic,
            last_sample: None,
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    pub fn range(&self) -> CurrentRange {
        self.range
    }

    pub fn cell_on(&self) -> bool {
        self.cell_on
    }

    pub fn control_mode(&self) -> ControlMode {
        self.control_mode
    }

    /// Most recent successful ADC reading.
    pub fn last_sample(&self) -> Option<&InstrumentSample> {
        self.last_sample.as_ref()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub fn set_cell(&mut self, on: bool) -> Result<()> {
        let command: &[u8] = if on { b"CELL ON" } else { b"CELL OFF" };
        self.send_command(command)?;
        self.cell_on = on;
        Ok(())
    }

    pub fn set_control_mode(&mut self, mode: ControlMode) -> Result<()> {
        self.send_command(mode.command())?;
        self.control_mode = mode;
        Ok(())
    }

    pub fn set_range(&mut self, range: CurrentRange) -> Result<()> {
        self.send_command(range.command().as_bytes())?;
        if range != self.range {
            debug!("current range {} -> {}", self.range, range);
        }
        self.range = range;
        Ok(())
    }

    /// Command a new DAC setpoint. Currents use the active range.
    pub fn set_output(&mut self, value: OutputValue) -> Result<()> {
        let code = match value {
            OutputValue::Potential(volts) => self.calibration.potential_setpoint(volts),
            OutputValue::Current(ma) => self.calibration.current_setpoint(ma, self.range),
            OutputValue::DacCode(code) => code as f64,
        };
        let mut command = b"DACSET ".to_vec();
        command.extend_from_slice(&encode_dac_value(code));
        self.send_command(&command)
    }

    /// Run the on-board DAC self-calibration and read back the result.
    pub fn dac_calibrate(&mut self) -> Result<bool> {
        self.send_command(b"DACCAL")?;
        info!("DAC calibration performed.");
        self.load_dac_calibration()
    }

    /// Read one ADC conversion, waiting out the conversion period first.
    ///
    /// Returns `None` when the instrument answers `WAIT` (conversion not ready).
    pub fn read_sample(&mut self) -> Result<Option<InstrumentSample>> {
        self.pacer.wait(self.clock.as_ref());
        let command = b"ADCREAD";
        let response = self.transport.query(command)?;
        if response_is(&response, RESPONSE_WAIT) {
            debug!("ADC conversion not ready");
            return Ok(None);
        }
        let frame = payload(command, &response)?;

        let raw_potential = decode_adc_value(frame[0], frame[1], frame[2]);
        let raw_current = decode_adc_value(frame[3], frame[4], frame[5]);
        let sample = InstrumentSample {
            raw_potential,
            raw_current,
            potential: self.calibration.potential_volts(raw_potential),
            current: self.calibration.current_milliamps(raw_current, self.range),
            range: self.range,
        };
        self.last_sample = Some(sample);
        Ok(Some(sample))
    }

    // ------------------------------------------------------------------------
    // Calibration storage
    // ------------------------------------------------------------------------

    /// Load every calibration block from flash. Blocks that are not stored
    /// keep their current values.
    pub fn load_calibration(&mut self) -> Result<CalibrationLoad> {
        Ok(CalibrationLoad {
            dac: self.load_dac_calibration()?,
            offsets: self.load_offsets()?,
            shunts: self.load_shunt_calibration()?,
        })
    }

    pub fn load_dac_calibration(&mut self) -> Result<bool> {
        match self.read_block(b"DACCALGET")? {
            Some(block) => {
                self.calibration.dac_offset = decode_dac_value([block[0], block[1], block[2]]);
                self.calibration.dac_gain =
                    decode_dac_value([block[3], block[4], block[5]]) + DAC_BIAS;
                debug!(
                    "DAC calibration: offset={} gain={}",
                    self.calibration.dac_offset, self.calibration.dac_gain
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn load_offsets(&mut self) -> Result<bool> {
        match self.read_block(b"OFFSETREAD")? {
            Some(block) => {
                self.calibration.potential_offset =
                    decode_dac_value([block[0], block[1], block[2]]);
                self.calibration.current_offset = decode_dac_value([block[3], block[4], block[5]]);
                debug!(
                    "offsets: potential={} current={}",
                    self.calibration.potential_offset, self.calibration.current_offset
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn load_shunt_calibration(&mut self) -> Result<bool> {
        match self.read_block(b"SHUNTCALREAD")? {
            Some(block) => {
                for (i, pair) in block.chunks_exact(2).enumerate() {
                    self.calibration.shunt_correction[i] =
                        1.0 + decode_two_bytes([pair[0], pair[1]]) / 1e6;
                }
                debug!("shunt calibration: {:?}", self.calibration.shunt_correction);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write every calibration block to flash.
    pub fn save_calibration(&mut self) -> Result<()> {
        self.save_dac_calibration()?;
        self.save_offsets()?;
        self.save_shunt_calibration()
    }

    pub fn save_dac_calibration(&mut self) -> Result<()> {
        let cal = self.calibration;
        let mut command = b"DACCALSET ".to_vec();
        command.extend_from_slice(&encode_dac_value(cal.dac_offset as f64));
        command.extend_from_slice(&encode_dac_value((cal.dac_gain - DAC_BIAS) as f64));
        self.send_command(&command)?;
        info!("DAC calibration saved to flash memory.");
        Ok(())
    }

    pub fn save_offsets(&mut self) -> Result<()> {
        let cal = self.calibration;
        let mut command = b"OFFSETSAVE ".to_vec();
        command.extend_from_slice(&encode_dac_value(cal.potential_offset as f64));
        command.extend_from_slice(&encode_dac_value(cal.current_offset as f64));
        self.send_command(&command)?;
        info!("Offset values saved to flash memory.");
        Ok(())
    }

    pub fn save_shunt_calibration(&mut self) -> Result<()> {
        let mut command = b"SHUNTCALSAVE ".to_vec();
        for shunt in self.calibration.shunt_correction {
            command.extend_from_slice(&encode_two_bytes((shunt - 1.0) * 1e6));
        }
        self.send_command(&command)?;
        info!("Shunt calibration values saved to flash memory.");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    /// Send a command whose only valid answer is `OK`.
    fn send_command(&mut self, command: &[u8]) -> Result<()> {
        let response = self.transport.query(command)?;
        if response_is(&response, RESPONSE_OK) {
            Ok(())
        } else {
            let err = DriverError::protocol(command, "OK", &response);
            warn!("{err}");
            Err(err)
        }
    }

    /// Read a 6-byte calibration block; `None` if flash holds no value.
    fn read_block(&mut self, command: &[u8]) -> Result<Option<[u8; PAYLOAD_LEN]>> {
        let response = self.transport.query(command)?;
        let block = payload(command, &response)?;
        if block == NOT_STORED {
            debug!("{}: no value stored", String::from_utf8_lossy(command));
            Ok(None)
        } else {
            Ok(Some(block))
        }
    }
}

/// The response equals `literal`, allowing zero padding up to the packet size.
fn response_is(response: &[u8], literal: &[u8]) -> bool {
    response.len() >= literal.len()
        && &response[..literal.len()] == literal
        && response[literal.len()..].iter().all(|&b| b == 0)
}

fn payload(command: &[u8], response: &[u8]) -> Result<[u8; PAYLOAD_LEN]> {
    response
        .get(..PAYLOAD_LEN)
        .and_then(|b| <[u8; PAYLOAD_LEN]>::try_from(b).ok())
        .ok_or_else(|| DriverError::protocol(command, "6-byte frame", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ManualClock;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records the commands it received.
    struct Scripted {
        responses: VecDeque<Vec<u8>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Transport for Scripted {
        fn query(&mut self, command: &[u8]) -> Result<Vec<u8>> {
            self.sent.lock().unwrap().push(command.to_vec());
            Ok(self.responses.pop_front().unwrap_or_else(|| b"OK".to_vec()))
        }
    }

    fn device(responses: Vec<&[u8]>) -> (Potentiostat, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Scripted {
            responses: responses.into_iter().map(|r| r.to_vec()).collect(),
            sent: sent.clone(),
        };
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let pacer = ReadPacer::new(std::time::Duration::from_millis(90), false);
        (Potentiostat::new(Box::new(transport), clock, pacer), sent)
    }

    #[test]
    fn ok_commands_update_state() {
        let (mut dev, sent) = device(vec![b"OK", b"OK", b"OK"]);
        dev.set_cell(true).unwrap();
        dev.set_control_mode(ControlMode::Galvanostatic).unwrap();
        dev.set_range(CurrentRange::Low).unwrap();
        assert!(dev.cell_on());
        assert_eq!(dev.control_mode(), ControlMode::Galvanostatic);
        assert_eq!(dev.range(), CurrentRange::Low);
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], b"CELL ON");
        assert_eq!(sent[1], b"GALVANOSTATIC");
        assert_eq!(sent[2], b"RANGE 3");
    }

    #[test]
    fn padded_ok_is_accepted() {
        let mut padded = b"OK".to_vec();
        padded.resize(64, 0);
        let (mut dev, _) = device(vec![&padded]);
        assert!(dev.set_cell(false).is_ok());
    }

    #[test]
    fn unexpected_response_is_protocol_error_and_keeps_state() {
        let (mut dev, _) = device(vec![b"ERR"]);
        match dev.set_range(CurrentRange::Mid) {
            Err(DriverError::Protocol {
                command,
                expected,
                actual,
            }) => {
                assert_eq!(command, "RANGE 2");
                assert_eq!(expected, "OK");
                assert_eq!(actual, "ERR");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dev.range(), CurrentRange::High);
    }

    #[test]
    fn potential_setpoint_encoding() {
        let (mut dev, sent) = device(vec![b"OK", b"OK"]);
        dev.set_output(OutputValue::Potential(1.0)).unwrap();
        dev.set_output(OutputValue::DacCode(-1)).unwrap();
        let sent = sent.lock().unwrap();
        // 1 V = 2^16 counts above mid-scale
        assert_eq!(&sent[0][..7], b"DACSET ");
        assert_eq!(decode_dac_value([sent[0][7], sent[0][8], sent[0][9]]), 65_536);
        assert_eq!(decode_dac_value([sent[1][7], sent[1][8], sent[1][9]]), -1);
    }

    #[test]
    fn adc_read_decodes_frame_or_waits() {
        let (mut dev, _) = device(vec![b"WAIT", &[0x10, 0, 0, 0x3F, 0xFF, 0xFF]]);
        assert_eq!(dev.read_sample().unwrap(), None);
        let sample = dev.read_sample().unwrap().unwrap();
        assert_eq!(sample.raw_potential, 1_048_576);
        assert_eq!(sample.raw_current, -1);
        assert_eq!(sample.potential, 4.0);
        assert_eq!(sample.range, CurrentRange::High);
    }

    #[test]
    fn short_adc_frame_is_protocol_error() {
        let (mut dev, _) = device(vec![&[1, 2, 3]]);
        assert!(matches!(
            dev.read_sample(),
            Err(DriverError::Protocol { .. })
        ));
    }

    #[test]
    fn calibration_load_and_missing_blocks() {
        let mut dac = encode_dac_value(12.0).to_vec();
        dac.extend_from_slice(&encode_dac_value(-100.0));
        let mut shunts = Vec::new();
        for ppm in [0.0, 1000.0, -2000.0] {
            shunts.extend_from_slice(&encode_two_bytes(ppm));
        }
        let (mut dev, _) = device(vec![&dac, &NOT_STORED, &shunts]);
        let load = dev.load_calibration().unwrap();
        assert_eq!(
            load,
            CalibrationLoad {
                dac: true,
                offsets: false,
                shunts: true
            }
        );
        let cal = dev.calibration();
        assert_eq!(cal.dac_offset, 12);
        assert_eq!(cal.dac_gain, DAC_BIAS - 100);
        assert_eq!(cal.potential_offset, 0);
        for (got, want) in cal.shunt_correction.iter().zip([1.0, 1.001, 0.998]) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn calibration_save_payloads() {
        let (mut dev, sent) = device(vec![]);
        dev.set_calibration(Calibration {
            dac_offset: -3,
            dac_gain: DAC_BIAS + 7,
            potential_offset: 40,
            current_offset: -40,
            shunt_correction: [1.0, 1.0005, 0.9995],
        });
        dev.save_calibration().unwrap();
        let sent = sent.lock().unwrap();

        assert!(sent[0].starts_with(b"DACCALSET "));
        assert_eq!(sent[0].len(), 16);
        assert_eq!(decode_dac_value([sent[0][10], sent[0][11], sent[0][12]]), -3);
        assert_eq!(decode_dac_value([sent[0][13], sent[0][14], sent[0][15]]), 7);

        assert!(sent[1].starts_with(b"OFFSETSAVE "));
        assert_eq!(sent[1].len(), 17);
        assert_eq!(decode_dac_value([sent[1][14], sent[1][15], sent[1][16]]), -40);

        assert!(sent[2].starts_with(b"SHUNTCALSAVE "));
        assert_eq!(sent[2].len(), 19);
        assert_eq!(decode_two_bytes([sent[2][15], sent[2][16]]), 500.0);
        assert_eq!(decode_two_bytes([sent[2][17], sent[2][18]]), -500.0);
    }
}

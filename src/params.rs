//! Run parameters.
//!
//! Each measurement mode has a `*Config` struct mirroring the user-facing
//! fields (scan rate in mV/s, currents in µA, as entered on the instrument
//! panel) and an immutable `*Parameters` struct in engine units (V/s, mA)
//! that only exists once validation has passed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::ranging::RangeMask;

fn default_samples() -> usize {
    1
}

fn default_ranges() -> [bool; 3] {
    [true; 3]
}

/// Where a run writes its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub path: PathBuf,
    /// Replace an existing file instead of refusing to start.
    #[serde(default)]
    pub overwrite: bool,
}

impl OutputTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overwrite: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

// ============================================================================
// Cyclic voltammetry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub lower_bound_v: f64,
    pub upper_bound_v: f64,
    pub start_potential_v: f64,
    pub stop_potential_v: f64,
    pub scan_rate_mv_per_s: f64,
    pub cycles: u32,
    #[serde(default = "default_samples")]
    pub samples_per_average: usize,
    /// Current ranges the auto-ranging may use, highest current first.
    #[serde(default = "default_ranges")]
    pub enabled_ranges: [bool; 3],
    pub output: OutputTarget,
}

/// Validated cyclic voltammetry parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameters {
    lower_bound: f64,
    upper_bound: f64,
    start_potential: f64,
    stop_potential: f64,
    scan_rate: f64,
    cycles: u32,
    samples_per_average: usize,
    enabled_ranges: RangeMask,
    output: OutputTarget,
}

impl SweepConfig {
    pub fn validate(self) -> Result<SweepParameters> {
        let scan_rate = self.scan_rate_mv_per_s / 1e3;
        if self.upper_bound_v < self.lower_bound_v {
            return Err(DriverError::parameter(
                "the upper bound cannot be lower than the lower bound",
            ));
        }
        if scan_rate == 0.0 {
            return Err(DriverError::parameter("the scan rate cannot be zero"));
        }
        if scan_rate > 0.0 && self.upper_bound_v < self.start_potential_v {
            return Err(DriverError::parameter(
                "for a positive scan rate, the start potential must be lower than the upper bound",
            ));
        }
        if scan_rate < 0.0 && self.lower_bound_v > self.start_potential_v {
            return Err(DriverError::parameter(
                "for a negative scan rate, the start potential must be higher than the lower bound",
            ));
        }
        if self.samples_per_average < 1 {
            return Err(DriverError::parameter(
                "the number of samples to average must be at least 1",
            ));
        }
        let enabled_ranges = RangeMask(self.enabled_ranges);
        if !enabled_ranges.any() {
            return Err(DriverError::parameter(
                "at least one current range must be enabled",
            ));
        }
        check_finite(&[
            self.lower_bound_v,
            self.upper_bound_v,
            self.start_potential_v,
            self.stop_potential_v,
            scan_rate,
        ])?;

        Ok(SweepParameters {
            lower_bound: self.lower_bound_v,
            upper_bound: self.upper_bound_v,
            start_potential: self.start_potential_v,
            stop_potential: self.stop_potential_v,
            scan_rate,
            cycles: self.cycles,
            samples_per_average: self.samples_per_average,
            enabled_ranges,
            output: self.output,
        })
    }
}

impl SweepParameters {
    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    pub fn start_potential(&self) -> f64 {
        self.start_potential
    }

    pub fn stop_potential(&self) -> f64 {
        self.stop_potential
    }

    /// Signed scan rate in V/s.
    pub fn scan_rate(&self) -> f64 {
        self.scan_rate
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn samples_per_average(&self) -> usize {
        self.samples_per_average
    }

    pub fn enabled_ranges(&self) -> RangeMask {
        self.enabled_ranges
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    /// Target potential `t` seconds into the sweep.
    pub fn potential_at(&self, t: f64) -> Option<f64> {
        crate::sweep::potential_at(
            t,
            self.start_potential,
            self.stop_potential,
            self.upper_bound,
            self.lower_bound,
            self.scan_rate,
            self.cycles,
        )
    }

    /// Duration of the whole sweep in seconds.
    pub fn duration(&self) -> f64 {
        crate::sweep::total_travel(
            self.start_potential,
            self.stop_potential,
            self.upper_bound,
            self.lower_bound,
            self.scan_rate,
            self.cycles,
        ) / self.scan_rate.abs()
    }
}

// ============================================================================
// Galvanostatic charge/discharge
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub lower_bound_v: f64,
    pub upper_bound_v: f64,
    pub charge_current_ua: f64,
    pub discharge_current_ua: f64,
    pub half_cycles: u32,
    #[serde(default = "default_samples")]
    pub samples_per_average: usize,
    pub output: OutputTarget,
}

/// Validated charge/discharge parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleParameters {
    lower_bound: f64,
    upper_bound: f64,
    charge_current: f64,
    discharge_current: f64,
    half_cycles: u32,
    samples_per_average: usize,
    output: OutputTarget,
}

impl CycleConfig {
    pub fn validate(self) -> Result<CycleParameters> {
        let charge_current = self.charge_current_ua / 1e3;
        let discharge_current = self.discharge_current_ua / 1e3;
        if self.upper_bound_v < self.lower_bound_v {
            return Err(DriverError::parameter(
                "the upper bound cannot be lower than the lower bound",
            ));
        }
        if charge_current == 0.0 {
            return Err(DriverError::parameter("the charge current cannot be zero"));
        }
        if discharge_current == 0.0 {
            return Err(DriverError::parameter("the discharge current cannot be zero"));
        }
        if charge_current * discharge_current > 0.0 {
            return Err(DriverError::parameter(
                "charge and discharge current must have opposite sign",
            ));
        }
        if self.half_cycles == 0 {
            return Err(DriverError::parameter(
                "the number of half cycles must be positive and non-zero",
            ));
        }
        if self.samples_per_average < 1 {
            return Err(DriverError::parameter(
                "the number of samples to average must be at least 1",
            ));
        }
        check_finite(&[
            self.lower_bound_v,
            self.upper_bound_v,
            charge_current,
            discharge_current,
        ])?;

        Ok(CycleParameters {
            lower_bound: self.lower_bound_v,
            upper_bound: self.upper_bound_v,
            charge_current,
            discharge_current,
            half_cycles: self.half_cycles,
            samples_per_average: self.samples_per_average,
            output: self.output,
        })
    }
}

impl CycleParameters {
    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    /// Charge current in mA.
    pub fn charge_current(&self) -> f64 {
        self.charge_current
    }

    /// Discharge current in mA.
    pub fn discharge_current(&self) -> f64 {
        self.discharge_current
    }

    pub fn half_cycles(&self) -> u32 {
        self.half_cycles
    }

    pub fn samples_per_average(&self) -> usize {
        self.samples_per_average
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }
}

// ============================================================================
// Rate testing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTestConfig {
    pub lower_bound_v: f64,
    pub upper_bound_v: f64,
    /// Current that (dis)charges the nominal capacity in one hour.
    pub one_c_current_ua: f64,
    pub c_rates: Vec<f64>,
    pub cycles_per_rate: u32,
    pub output: OutputTarget,
}

/// Validated rate-test parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTestParameters {
    lower_bound: f64,
    upper_bound: f64,
    one_c_current: f64,
    c_rates: Vec<f64>,
    currents: Vec<f64>,
    cycles_per_rate: u32,
    output: OutputTarget,
}

impl RateTestConfig {
    pub fn validate(self) -> Result<RateTestParameters> {
        let one_c_current = self.one_c_current_ua / 1e3;
        if self.upper_bound_v < self.lower_bound_v {
            return Err(DriverError::parameter(
                "the upper bound cannot be lower than the lower bound",
            ));
        }
        if self.c_rates.is_empty() {
            return Err(DriverError::parameter("at least one C-rate is required"));
        }
        let currents: Vec<f64> = self.c_rates.iter().map(|c| c * one_c_current).collect();
        if currents.iter().any(|&i| i == 0.0) {
            return Err(DriverError::parameter(
                "the charge/discharge current cannot be zero",
            ));
        }
        if self.cycles_per_rate == 0 {
            return Err(DriverError::parameter(
                "the number of cycles per C-rate must be positive and non-zero",
            ));
        }
        check_finite(&[self.lower_bound_v, self.upper_bound_v])?;
        check_finite(&currents)?;

        Ok(RateTestParameters {
            lower_bound: self.lower_bound_v,
            upper_bound: self.upper_bound_v,
            one_c_current,
            c_rates: self.c_rates,
            currents,
            cycles_per_rate: self.cycles_per_rate,
            output: self.output,
        })
    }
}

impl RateTestParameters {
    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    /// 1C current in mA.
    pub fn one_c_current(&self) -> f64 {
        self.one_c_current
    }

    pub fn c_rates(&self) -> &[f64] {
        &self.c_rates
    }

    /// Derived currents in mA, one per C-rate.
    pub fn currents(&self) -> &[f64] {
        &self.currents
    }

    pub fn cycles_per_rate(&self) -> u32 {
        self.cycles_per_rate
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    /// Samples to average at a C-rate; higher rates get smaller blocks so the
    /// point density per half-cycle stays roughly constant.
    pub fn samples_per_average(&self, rate_index: usize) -> usize {
        let c_rate = self.c_rates.get(rate_index).copied().unwrap_or(1.0);
        ((36.0 / c_rate) as i64).max(1) as usize
    }
}

fn check_finite(values: &[f64]) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DriverError::parameter("parameters must be finite numbers"))
    }
}

// ============================================================================
// Configuration documents
// ============================================================================

/// A run description as stored in a JSON document, tagged by `"mode"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunConfig {
    Sweep(SweepConfig),
    Cycle(CycleConfig),
    Rate(RateTestConfig),
}

/// Validated parameters of any mode.
#[derive(Debug, Clone, PartialEq)]
pub enum RunParameters {
    Sweep(SweepParameters),
    Cycle(CycleParameters),
    Rate(RateTestParameters),
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DriverError::file(path, e))?;
        Self::from_json(&text)
    }

    pub fn validate(self) -> Result<RunParameters> {
        Ok(match self {
            RunConfig::Sweep(c) => RunParameters::Sweep(c.validate()?),
            RunConfig::Cycle(c) => RunParameters::Cycle(c.validate()?),
            RunConfig::Rate(c) => RunParameters::Rate(c.validate()?),
        })
    }
}

//! USB potentiostat driver and measurement engine, with optional Python
//! bindings.
//!
//! The crate talks to a three-electrode potentiostat over a vendor-specific
//! USB bulk interface and runs the three measurement modes on it: cyclic
//! voltammetry, galvanostatic charge/discharge cycling and rate testing.
//!
//! # Driving the engine
//!
//! [`Engine`] does nothing on its own. The caller:
//!
//! 1. connects a [`Transport`] (a [`UsbTransport`] or a [`sim::SimulatedCell`]),
//! 2. calls [`Engine::tick`] roughly every [`ADC_READ_INTERVAL`],
//! 3. starts and stops runs between ticks,
//! 4. consumes the [`Event`]s delivered to its [`EventSink`].
//!
//! Each tick performs at most a handful of blocking command round-trips and
//! one ADC read; the read waits out whatever is left of the conversion period.
//!
//! # Units
//!
//! Potentials are in volts throughout. Currents are in mA inside the engine
//! and in A in data files and [`Event::Point`]; configuration documents take
//! µA and mV/s, matching the instrument's front panel.

pub mod average;
pub mod charge;
pub mod codec;
pub mod device;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod output;
pub mod params;
pub mod ranging;
pub mod runs;
pub mod sim;
pub mod sweep;
pub mod timing;
pub mod transport;

pub use codec::Calibration;
pub use device::{ControlMode, InstrumentSample, OutputValue, Potentiostat};
pub use engine::{Engine, EngineConfig, SessionState};
pub use errors::*;
pub use events::{Event, EventSink, LogSink, RunKind};
pub use params::{
    CycleConfig, CycleParameters, OutputTarget, RateTestConfig, RateTestParameters, RunConfig,
    RunParameters, SweepConfig, SweepParameters,
};
pub use ranging::CurrentRange;
pub use runs::RunSummary;
pub use timing::{Clock, ManualClock, SystemClock, ADC_READ_INTERVAL};
pub use transport::{Transport, UsbTransport, DEFAULT_PID, DEFAULT_VID};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::path::PathBuf;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Arc;

    use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use super::*;

    fn to_py_err(e: DriverError) -> PyErr {
        match e {
            DriverError::Parameter(_) | DriverError::Config(_) => {
                PyErr::new::<PyValueError, _>(e.to_string())
            }
            DriverError::NotConnected
            | DriverError::AlreadyConnected
            | DriverError::InvalidState(_) => PyErr::new::<PyRuntimeError, _>(e.to_string()),
            DriverError::DeviceNotFound { .. } => PyErr::new::<PyConnectionError, _>(e.to_string()),
            _ => PyErr::new::<PyIOError, _>(e.to_string()),
        }
    }

    fn event_to_dict<'py>(py: Python<'py>, event: &Event) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        match event {
            Event::Sample(s) => {
                dict.set_item("type", "sample")?;
                dict.set_item("potential", s.potential)?;
                dict.set_item("current", s.current)?;
                dict.set_item("raw_potential", s.raw_potential)?;
                dict.set_item("raw_current", s.raw_current)?;
                dict.set_item("range", s.range.index())?;
            }
            Event::Point {
                kind,
                time,
                potential,
                current,
                charge,
            } => {
                dict.set_item("type", "point")?;
                dict.set_item("kind", kind.to_string())?;
                dict.set_item("time", *time)?;
                dict.set_item("potential", *potential)?;
                dict.set_item("current", *current)?;
                dict.set_item("charge", *charge)?;
            }
            Event::Capacity {
                kind,
                key,
                charge,
                discharge,
            } => {
                dict.set_item("type", "capacity")?;
                dict.set_item("kind", kind.to_string())?;
                dict.set_item("key", *key)?;
                dict.set_item("charge", *charge)?;
                dict.set_item("discharge", *discharge)?;
            }
            Event::RunFinished {
                kind,
                interrupted,
                charges,
            } => {
                dict.set_item("type", "run_finished")?;
                dict.set_item("kind", kind.to_string())?;
                dict.set_item("interrupted", *interrupted)?;
                dict.set_item("charges", charges.clone())?;
            }
            Event::RangeChanged(range) => {
                dict.set_item("type", "range_changed")?;
                dict.set_item("range", range.index())?;
            }
            Event::StateChanged(state) => {
                dict.set_item("type", "state_changed")?;
                dict.set_item("state", state.to_string())?;
            }
            Event::Message(text) => {
                dict.set_item("type", "message")?;
                dict.set_item("text", text.as_str())?;
            }
        }
        Ok(dict)
    }

    /// Potentiostat session.
    ///
    /// Call `tick()` about every 90 ms (for example from a GUI timer) and
    /// drain `poll_events()` afterwards.
    ///
    /// Example:
    ///     >>> p = Potentiostat()            # first USB device found
    ///     >>> p.tick()                      # enter the live display
    ///     >>> p.start_sweep(-0.5, 0.5, 0.0, 0.0, 10.0, 1, "cv.txt")
    ///     >>> while p.state.startswith("running"):
    ///     ...     p.tick()
    #[pyclass(name = "Potentiostat", unsendable)]
    struct PyPotentiostat {
        engine: Engine,
        events: Receiver<Event>,
    }

    impl PyPotentiostat {
        fn with_transport(transport: Box<dyn Transport>) -> PyResult<Self> {
            let (tx, rx) = mpsc::channel();
            let mut engine = Engine::new(
                EngineConfig::default(),
                Arc::new(SystemClock::default()),
                Box::new(tx),
            );
            engine.connect(transport).map_err(to_py_err)?;
            Ok(Self { engine, events: rx })
        }
    }

    #[pymethods]
    impl PyPotentiostat {
        /// Connect to the first USB device with the given IDs.
        #[new]
        #[pyo3(signature = (vid=DEFAULT_VID, pid=DEFAULT_PID))]
        fn new(vid: u16, pid: u16) -> PyResult<Self> {
            let transport = UsbTransport::open(vid, pid).map_err(to_py_err)?;
            Self::with_transport(Box::new(transport))
        }

        /// Connect to a simulated resistive cell instead of hardware.
        #[staticmethod]
        #[pyo3(signature = (ohms=1000.0))]
        fn simulate(ohms: f64) -> PyResult<Self> {
            Self::with_transport(Box::new(sim::SimulatedCell::resistor(ohms)))
        }

        fn disconnect(&mut self) -> PyResult<()> {
            self.engine.disconnect().map_err(to_py_err)
        }

        /// Advance the session by one acquisition period.
        fn tick(&mut self) -> PyResult<()> {
            self.engine.tick().map_err(to_py_err)
        }

        /// Start cyclic voltammetry. Scan rate in mV/s.
        #[pyo3(signature = (lower_bound, upper_bound, start_potential, stop_potential, scan_rate, cycles, path, samples_per_average=1, enabled_ranges=[true, true, true], overwrite=false))]
        #[allow(clippy::too_many_arguments)]
        fn start_sweep(
            &mut self,
            lower_bound: f64,
            upper_bound: f64,
            start_potential: f64,
            stop_potential: f64,
            scan_rate: f64,
            cycles: u32,
            path: PathBuf,
            samples_per_average: usize,
            enabled_ranges: [bool; 3],
            overwrite: bool,
        ) -> PyResult<()> {
            let params = SweepConfig {
                lower_bound_v: lower_bound,
                upper_bound_v: upper_bound,
                start_potential_v: start_potential,
                stop_potential_v: stop_potential,
                scan_rate_mv_per_s: scan_rate,
                cycles,
                samples_per_average,
                enabled_ranges,
                output: OutputTarget::new(path).overwrite(overwrite),
            }
            .validate()
            .map_err(to_py_err)?;
            self.engine.start_sweep(params).map_err(to_py_err)
        }

        /// Start charge/discharge cycling. Currents in µA.
        #[pyo3(signature = (lower_bound, upper_bound, charge_current, discharge_current, half_cycles, path, samples_per_average=1, overwrite=false))]
        #[allow(clippy::too_many_arguments)]
        fn start_cycle(
            &mut self,
            lower_bound: f64,
            upper_bound: f64,
            charge_current: f64,
            discharge_current: f64,
            half_cycles: u32,
            path: PathBuf,
            samples_per_average: usize,
            overwrite: bool,
        ) -> PyResult<()> {
            let params = CycleConfig {
                lower_bound_v: lower_bound,
                upper_bound_v: upper_bound,
                charge_current_ua: charge_current,
                discharge_current_ua: discharge_current,
                half_cycles,
                samples_per_average,
                output: OutputTarget::new(path).overwrite(overwrite),
            }
            .validate()
            .map_err(to_py_err)?;
            self.engine.start_cycle(params).map_err(to_py_err)
        }

        /// Start a rate test. 1C current in µA.
        #[pyo3(signature = (lower_bound, upper_bound, one_c_current, c_rates, cycles_per_rate, path, overwrite=false))]
        #[allow(clippy::too_many_arguments)]
        fn start_rate_test(
            &mut self,
            lower_bound: f64,
            upper_bound: f64,
            one_c_current: f64,
            c_rates: Vec<f64>,
            cycles_per_rate: u32,
            path: PathBuf,
            overwrite: bool,
        ) -> PyResult<()> {
            let params = RateTestConfig {
                lower_bound_v: lower_bound,
                upper_bound_v: upper_bound,
                one_c_current_ua: one_c_current,
                c_rates,
                cycles_per_rate,
                output: OutputTarget::new(path).overwrite(overwrite),
            }
            .validate()
            .map_err(to_py_err)?;
            self.engine.start_rate_test(params).map_err(to_py_err)
        }

        /// Start a run described by a JSON document.
        fn start(&mut self, config_json: &str) -> PyResult<()> {
            let params = RunConfig::from_json(config_json)
                .and_then(RunConfig::validate)
                .map_err(to_py_err)?;
            self.engine.start_run(params).map_err(to_py_err)
        }

        /// Interrupt the run in progress.
        ///
        /// Returns:
        ///     The charges (µAh) accounted so far.
        fn stop(&mut self) -> PyResult<Vec<f64>> {
            self.engine
                .stop()
                .map(|summary| summary.charges)
                .map_err(to_py_err)
        }

        fn back_to_live(&mut self) -> PyResult<()> {
            self.engine.back_to_live().map_err(to_py_err)
        }

        /// Sweep profile as a list of (time, potential) tuples.
        #[pyo3(signature = (lower_bound, upper_bound, start_potential, stop_potential, scan_rate, cycles))]
        fn preview_sweep(
            &mut self,
            lower_bound: f64,
            upper_bound: f64,
            start_potential: f64,
            stop_potential: f64,
            scan_rate: f64,
            cycles: u32,
        ) -> PyResult<Vec<(f64, f64)>> {
            let params = SweepConfig {
                lower_bound_v: lower_bound,
                upper_bound_v: upper_bound,
                start_potential_v: start_potential,
                stop_potential_v: stop_potential,
                scan_rate_mv_per_s: scan_rate,
                cycles,
                samples_per_average: 1,
                enabled_ranges: [true; 3],
                output: OutputTarget::new("preview"),
            }
            .validate()
            .map_err(to_py_err)?;
            self.engine.preview_sweep(&params).map_err(to_py_err)
        }

        fn zero_offset(&mut self) -> PyResult<()> {
            self.engine.zero_offset().map_err(to_py_err)
        }

        fn save_calibration(&mut self) -> PyResult<()> {
            self.engine.save_calibration().map_err(to_py_err)
        }

        fn dac_calibrate(&mut self) -> PyResult<()> {
            self.engine.dac_calibrate().map_err(to_py_err)
        }

        fn set_cell(&mut self, on: bool) -> PyResult<()> {
            self.engine.set_cell(on).map_err(to_py_err)
        }

        /// Select a current range by index (0 = 20 mA, 1 = 200 µA, 2 = 2 µA).
        fn set_current_range(&mut self, index: usize) -> PyResult<()> {
            let range = CurrentRange::from_index(index)
                .ok_or_else(|| PyErr::new::<PyValueError, _>("range index must be 0, 1 or 2"))?;
            self.engine.set_current_range(range).map_err(to_py_err)
        }

        /// Drain the pending events as a list of dicts with a "type" key.
        fn poll_events<'py>(&self, py: Python<'py>) -> PyResult<Vec<Bound<'py, PyDict>>> {
            self.events
                .try_iter()
                .map(|event| event_to_dict(py, &event))
                .collect()
        }

        #[getter]
        fn state(&self) -> String {
            self.engine.state().to_string()
        }

        /// Last measured potential in V.
        #[getter]
        fn potential(&self) -> Option<f64> {
            self.engine.last_sample().map(|s| s.potential)
        }

        /// Last measured current in mA.
        #[getter]
        fn current(&self) -> Option<f64> {
            self.engine.last_sample().map(|s| s.current)
        }

        #[getter]
        fn range(&self) -> Option<usize> {
            self.engine.range().map(CurrentRange::index)
        }

        #[getter]
        fn live_potential(&self) -> Vec<f64> {
            self.engine.live().potential().iter().copied().collect()
        }

        #[getter]
        fn live_current(&self) -> Vec<f64> {
            self.engine.live().current().iter().copied().collect()
        }

        /// Calibration values as a dict.
        fn calibration<'py>(&self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyDict>>> {
            let Some(cal) = self.engine.calibration() else {
                return Ok(None);
            };
            let dict = PyDict::new(py);
            dict.set_item("dac_offset", cal.dac_offset)?;
            dict.set_item("dac_gain", cal.dac_gain)?;
            dict.set_item("potential_offset", cal.potential_offset)?;
            dict.set_item("current_offset", cal.current_offset)?;
            dict.set_item("shunt_correction", cal.shunt_correction.to_vec())?;
            Ok(Some(dict))
        }

        fn __repr__(&self) -> String {
            format!("Potentiostat(state={})", self.engine.state())
        }
    }

    /// Forward Rust logs to Python's `logging` module.
    #[pyfunction]
    fn init_logging(py: Python<'_>) -> PyResult<()> {
        logging::init_python_logging(py)
    }

    /// Set the minimum forwarded level ("error" .. "trace").
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        logging::set_python_log_level_str(py, level)
    }

    /// The Python module definition
    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PyPotentiostat>()?;
        m.add_function(wrap_pyfunction!(init_logging, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

        // Add module-level constants
        m.add("DEFAULT_VID", DEFAULT_VID)?;
        m.add("DEFAULT_PID", DEFAULT_PID)?;
        m.add("ADC_READ_INTERVAL_MS", ADC_READ_INTERVAL.as_millis() as u64)?;
        m.add("CURRENT_RANGES", vec!["20 mA", "200 µA", "2 µA"])?;

        Ok(())
    }
}

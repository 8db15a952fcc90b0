//! Acquisition loop and session state machine.
//!
//! The [`Engine`] is the single owner of the instrument, the session state and
//! the run in progress. It only acts when called: an external driver (CLI
//! timer, Python event loop, test) invokes [`Engine::tick`] about once per ADC
//! conversion period and the mode-entry operations in between.
//!
//! ```text
//! Disconnected -> InitializingIdle -> Idle -> Running{Sweep,Cycle,RateTest}
//!                       ^               |              |
//!                       |               v              v
//!                       +-------- StationaryGraph <----+
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::codec::Calibration;
use crate::device::{ControlMode, InstrumentSample, OutputValue, Potentiostat};
use crate::errors::{DriverError, Result};
use crate::events::{Event, EventSink, RunKind};
use crate::output::{validate_output_path, FreshOutputs};
use crate::params::{
    CycleParameters, OutputTarget, RateTestParameters, RunParameters, SweepParameters,
};
use crate::ranging::CurrentRange;
use crate::runs::{ActiveRun, CycleRun, RateRun, RunStatus, RunSummary, SweepRun};
use crate::sweep;
use crate::timing::{Clock, ReadPacer, ADC_READ_INTERVAL};
use crate::transport::Transport;

/// Points per bound-to-bound traverse in a sweep preview.
const PREVIEW_STEPS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    InitializingIdle,
    Idle,
    StationaryGraph,
    RunningSweep,
    RunningCycle,
    RunningRateTest,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionState::RunningSweep | SessionState::RunningCycle | SessionState::RunningRateTest
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "disconnected",
            SessionState::InitializingIdle => "initializing",
            SessionState::Idle => "idle",
            SessionState::StationaryGraph => "stationary graph",
            SessionState::RunningSweep => "running cyclic voltammetry",
            SessionState::RunningCycle => "running charge/discharge",
            SessionState::RunningRateTest => "running rate test",
        })
    }
}

const MEASUREMENT_ENTRY: [SessionState; 2] = [SessionState::Idle, SessionState::StationaryGraph];
const RUNNING: [SessionState; 3] = [
    SessionState::RunningSweep,
    SessionState::RunningCycle,
    SessionState::RunningRateTest,
];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum spacing between ADC reads.
    pub read_interval: Duration,
    /// Spin for the back half of each read interval.
    pub busy_wait: bool,
    /// Capacity of the live ring buffers.
    pub live_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_interval: ADC_READ_INTERVAL,
            busy_wait: cfg!(windows),
            live_history: 200,
        }
    }
}

/// Fixed-capacity history of idle readings; the oldest entry is evicted.
#[derive(Debug, Clone)]
pub struct LiveBuffers {
    capacity: usize,
    potential: VecDeque<f64>,
    current: VecDeque<f64>,
    raw_potential: VecDeque<i32>,
    raw_current: VecDeque<i32>,
}

impl LiveBuffers {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            potential: VecDeque::with_capacity(capacity),
            current: VecDeque::with_capacity(capacity),
            raw_potential: VecDeque::with_capacity(capacity),
            raw_current: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: &InstrumentSample) {
        if self.potential.len() == self.capacity {
            self.potential.pop_front();
            self.current.pop_front();
            self.raw_potential.pop_front();
            self.raw_current.pop_front();
        }
        self.potential.push_back(sample.potential);
        self.current.push_back(sample.current);
        self.raw_potential.push_back(sample.raw_potential);
        self.raw_current.push_back(sample.raw_current);
    }

    pub fn clear(&mut self) {
        self.potential.clear();
        self.current.clear();
        self.raw_potential.clear();
        self.raw_current.clear();
    }

    pub fn len(&self) -> usize {
        self.potential.len()
    }

    pub fn is_empty(&self) -> bool {
        self.potential.is_empty()
    }

    /// V
    pub fn potential(&self) -> &VecDeque<f64> {
        &self.potential
    }

    /// mA
    pub fn current(&self) -> &VecDeque<f64> {
        &self.current
    }

    pub fn raw_potential(&self) -> &VecDeque<i32> {
        &self.raw_potential
    }

    pub fn raw_current(&self) -> &VecDeque<i32> {
        &self.raw_current
    }
}

fn rounded_mean(values: &VecDeque<i32>) -> i32 {
    let sum: f64 = values.iter().map(|&v| v as f64).sum();
    (sum / values.len() as f64).round() as i32
}

/// Session context: instrument, state machine and live display data.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sink: Box<dyn EventSink>,
    device: Option<Potentiostat>,
    state: SessionState,
    run: Option<ActiveRun>,
    live: LiveBuffers,
}

impl Engine {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>, sink: Box<dyn EventSink>) -> Self {
        let live = LiveBuffers::new(config.live_history);
        Self {
            config,
            clock,
            sink,
            device: None,
            state: SessionState::Disconnected,
            run: None,
            live,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    pub fn live(&self) -> &LiveBuffers {
        &self.live
    }

    pub fn last_sample(&self) -> Option<&InstrumentSample> {
        self.device.as_ref().and_then(|d| d.last_sample())
    }

    pub fn range(&self) -> Option<CurrentRange> {
        self.device.as_ref().map(|d| d.range())
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.device.as_ref().map(|d| d.calibration())
    }

    pub fn run_kind(&self) -> Option<RunKind> {
        self.run.as_ref().map(|r| r.kind())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Take over `transport`, load the calibration and put the instrument in
    /// a safe default configuration (cell off, potentiostatic, 20 mA range).
    pub fn connect(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.device.is_some() {
            return Err(DriverError::AlreadyConnected);
        }
        let pacer = ReadPacer::new(self.config.read_interval, self.config.busy_wait);
        let mut device = Potentiostat::new(transport, self.clock.clone(), pacer);

        let loaded = device.load_calibration()?;
        if !loaded.dac {
            self.message("No DAC calibration values were found in device flash memory.");
        }
        if !loaded.offsets {
            self.message("No offset values were found in device flash memory.");
        }
        if !loaded.shunts {
            self.message("No shunt calibration values were found in device flash memory.");
        }
        device.set_cell(false)?;
        device.set_control_mode(ControlMode::Potentiostatic)?;
        device.set_range(CurrentRange::High)?;

        self.device = Some(device);
        self.message("USB interface connected.");
        self.set_state(SessionState::InitializingIdle);
        Ok(())
    }

    /// Interrupt any run, switch the cell off (best effort) and release the
    /// transport.
    pub fn disconnect(&mut self) -> Result<()> {
        self.check_connected()?;
        if let Some(summary) = self.finish_run(true) {
            self.report(summary);
        }
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.set_cell(false) {
                warn!("could not switch the cell off: {e}");
            }
        }
        self.live.clear();
        self.message("Disconnected.");
        self.set_state(SessionState::Disconnected);
        Ok(())
    }

    /// Fail unless the session is in one of `allowed`.
    pub fn check_state(&self, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else if self.state == SessionState::Disconnected {
            Err(DriverError::NotConnected)
        } else {
            Err(DriverError::InvalidState(self.state))
        }
    }

    // ========================================================================
    // Acquisition loop
    // ========================================================================

    /// Advance the session by one acquisition period.
    pub fn tick(&mut self) -> Result<()> {
        match self.state {
            SessionState::Disconnected => Ok(()),
            SessionState::InitializingIdle => {
                self.live.clear();
                self.set_state(SessionState::Idle);
                Ok(())
            }
            SessionState::Idle => {
                if let Some(sample) = self.read()? {
                    self.live.push(&sample);
                }
                Ok(())
            }
            SessionState::StationaryGraph => self.read().map(|_| ()),
            SessionState::RunningSweep
            | SessionState::RunningCycle
            | SessionState::RunningRateTest => self.update_run(),
        }
    }

    fn read(&mut self) -> Result<Option<InstrumentSample>> {
        let device = self.device.as_mut().ok_or(DriverError::NotConnected)?;
        let sample = device.read_sample()?;
        if let Some(s) = sample {
            self.sink.emit(Event::Sample(s));
        }
        Ok(sample)
    }

    fn update_run(&mut self) -> Result<()> {
        let (Some(device), Some(run)) = (self.device.as_mut(), self.run.as_mut()) else {
            return Err(DriverError::InvalidState(self.state));
        };
        match run.update(device, self.clock.as_ref(), self.sink.as_mut()) {
            Ok(RunStatus::Running) => Ok(()),
            Ok(RunStatus::Complete) => {
                if let Some(summary) = self.finish_run(false) {
                    self.report(summary);
                }
                self.set_state(SessionState::StationaryGraph);
                Ok(())
            }
            Err(e @ DriverError::File { .. }) => {
                warn!("run terminated: {e}");
                if let Some(summary) = self.finish_run(true) {
                    self.report(summary);
                }
                self.message(&format!("Run terminated: {e}"));
                self.set_state(SessionState::StationaryGraph);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Runs
    // ========================================================================

    pub fn start_run(&mut self, params: RunParameters) -> Result<()> {
        match params {
            RunParameters::Sweep(p) => self.start_sweep(p),
            RunParameters::Cycle(p) => self.start_cycle(p),
            RunParameters::Rate(p) => self.start_rate_test(p),
        }
    }

    pub fn start_sweep(&mut self, params: SweepParameters) -> Result<()> {
        self.check_state(&MEASUREMENT_ENTRY)?;
        let output = params.output().clone();
        let run = self.start_writing(&output, |device, clock, sink| {
            SweepRun::start(params, device, clock, sink)
        })?;
        self.begin(ActiveRun::Sweep(run), SessionState::RunningSweep);
        Ok(())
    }

    pub fn start_cycle(&mut self, params: CycleParameters) -> Result<()> {
        self.check_state(&MEASUREMENT_ENTRY)?;
        let output = params.output().clone();
        let run = self.start_writing(&output, |device, clock, sink| {
            CycleRun::start(params, device, clock, sink)
        })?;
        self.begin(ActiveRun::Cycle(run), SessionState::RunningCycle);
        Ok(())
    }

    pub fn start_rate_test(&mut self, params: RateTestParameters) -> Result<()> {
        self.check_state(&MEASUREMENT_ENTRY)?;
        let output = params.output().clone();
        let run = self.start_writing(&output, |device, clock, sink| {
            RateRun::start(params, device, clock, sink)
        })?;
        self.begin(ActiveRun::Rate(run), SessionState::RunningRateTest);
        Ok(())
    }

    /// Interrupt the run in progress.
    pub fn stop(&mut self) -> Result<RunSummary> {
        self.check_state(&RUNNING)?;
        let summary = self
            .finish_run(true)
            .ok_or(DriverError::InvalidState(self.state))?;
        self.report(summary.clone());
        self.set_state(SessionState::StationaryGraph);
        Ok(summary)
    }

    /// Leave the stationary graph and resume the live display.
    pub fn back_to_live(&mut self) -> Result<()> {
        self.check_state(&[SessionState::StationaryGraph])?;
        self.set_state(SessionState::InitializingIdle);
        Ok(())
    }

    /// Potential profile the sweep would follow, as (s, V) pairs.
    pub fn preview_sweep(&mut self, params: &SweepParameters) -> Result<Vec<(f64, f64)>> {
        self.check_state(&MEASUREMENT_ENTRY)?;
        let points = sweep::preview(
            params.start_potential(),
            params.stop_potential(),
            params.upper_bound(),
            params.lower_bound(),
            params.scan_rate(),
            params.cycles(),
            PREVIEW_STEPS,
        );
        self.set_state(SessionState::StationaryGraph);
        Ok(points)
    }

    fn with_device<T>(
        &mut self,
        start: impl FnOnce(&mut Potentiostat, &dyn Clock, &mut dyn EventSink) -> Result<T>,
    ) -> Result<T> {
        let device = self.device.as_mut().ok_or(DriverError::NotConnected)?;
        let result = start(device, self.clock.as_ref(), self.sink.as_mut());
        if result.is_err() && device.cell_on() {
            if let Err(e) = device.set_cell(false) {
                warn!("could not switch the cell off: {e}");
            }
        }
        result
    }

    /// Start a run that writes to `output`. Files created by a start that
    /// fails are removed again.
    fn start_writing<T>(
        &mut self,
        output: &OutputTarget,
        start: impl FnOnce(&mut Potentiostat, &dyn Clock, &mut dyn EventSink) -> Result<T>,
    ) -> Result<T> {
        validate_output_path(output)?;
        let fresh = FreshOutputs::new(output);
        let result = self.with_device(start);
        if result.is_err() {
            fresh.discard();
        }
        result
    }

    fn begin(&mut self, run: ActiveRun, state: SessionState) {
        self.message(&format!("Starting {}.", run.kind()));
        self.run = Some(run);
        self.set_state(state);
    }

    fn finish_run(&mut self, interrupted: bool) -> Option<RunSummary> {
        let run = self.run.take()?;
        match self.device.as_mut() {
            Some(device) => Some(run.finish(device, interrupted)),
            None => None,
        }
    }

    fn report(&mut self, summary: RunSummary) {
        self.sink.emit(Event::RunFinished {
            kind: summary.kind,
            interrupted: summary.interrupted,
            charges: summary.charges,
        });
        self.message(&summary.message);
    }

    // ========================================================================
    // Manual control
    // ========================================================================

    pub fn set_cell(&mut self, on: bool) -> Result<()> {
        self.device_mut()?.set_cell(on)
    }

    pub fn set_control_mode(&mut self, mode: ControlMode) -> Result<()> {
        self.device_mut()?.set_control_mode(mode)
    }

    pub fn set_current_range(&mut self, range: CurrentRange) -> Result<()> {
        self.device_mut()?.set_range(range)?;
        self.sink.emit(Event::RangeChanged(range));
        Ok(())
    }

    pub fn set_output(&mut self, value: OutputValue) -> Result<()> {
        self.device_mut()?.set_output(value)
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    /// Replace the in-memory calibration (not written to flash).
    pub fn set_calibration(&mut self, calibration: Calibration) -> Result<()> {
        self.device_mut()?.set_calibration(calibration);
        Ok(())
    }

    pub fn save_calibration(&mut self) -> Result<()> {
        self.device_mut()?.save_calibration()?;
        self.message("Calibration values saved to flash memory.");
        Ok(())
    }

    pub fn dac_calibrate(&mut self) -> Result<()> {
        let found = self.device_mut()?.dac_calibrate()?;
        if !found {
            self.message("No DAC calibration values were found in device flash memory.");
        }
        self.message("DAC has been calibrated.");
        Ok(())
    }

    /// Take the mean of the raw live readings as the new zero offsets. The
    /// cell is expected to be off (open circuit).
    pub fn zero_offset(&mut self) -> Result<()> {
        self.check_state(&[SessionState::Idle])?;
        if self.live.is_empty() {
            return Err(DriverError::parameter(
                "no live readings available to determine the offsets",
            ));
        }
        let potential_offset = rounded_mean(self.live.raw_potential());
        let current_offset = rounded_mean(self.live.raw_current());

        let device = self.device_mut()?;
        let mut calibration = *device.calibration();
        calibration.potential_offset = potential_offset;
        calibration.current_offset = current_offset;
        device.set_calibration(calibration);

        self.message(&format!(
            "Offset values have been set: potential {potential_offset}, current {current_offset}."
        ));
        Ok(())
    }

    // ========================================================================
    // Internal Methods
    // ========================================================================

    fn device_mut(&mut self) -> Result<&mut Potentiostat> {
        self.device.as_mut().ok_or(DriverError::NotConnected)
    }

    fn check_connected(&self) -> Result<()> {
        if self.device.is_some() {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("session state: {} -> {}", self.state, state);
            self.state = state;
            self.sink.emit(Event::StateChanged(state));
        }
    }

    fn message(&mut self, text: &str) {
        info!("{text}");
        self.sink.emit(Event::Message(text.to_string()));
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(summary) = self.finish_run(true) {
            info!("{}", summary.message);
        }
    }
}

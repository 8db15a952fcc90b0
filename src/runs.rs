//! Measurement runs.
//!
//! Each run owns its output files and averaging buffers. The engine calls
//! `update` once per tick; `finish` turns the cell off and closes the files on
//! every exit path.

use std::time::Duration;

use log::{debug, info, warn};

use crate::average::AverageBuffer;
use crate::charge::{capacity_ah, charge_from_sweep};
use crate::device::{ControlMode, InstrumentSample, OutputValue, Potentiostat};
use crate::errors::Result;
use crate::events::{Event, EventSink, RunKind};
use crate::output::{CapacityLayout, CapacityWriter, RawDataWriter};
use crate::params::{CycleParameters, RateTestParameters, SweepParameters};
use crate::ranging::{range_for_magnitude, AutoRanger, CurrentRange, RangeDecision};
use crate::timing::Clock;

const SWEEP_SETTLE: Duration = Duration::from_millis(100);
const GALVANOSTATIC_SETTLE: Duration = Duration::from_millis(200);
const AH_TO_MICROAMP_HOURS: f64 = 1e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Complete,
}

/// Outcome of a run, reported once it has been shut down.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub kind: RunKind,
    pub interrupted: bool,
    /// µAh
    pub charges: Vec<f64>,
    pub message: String,
}

// ============================================================================
// Shared helpers
// ============================================================================

fn read(device: &mut Potentiostat, sink: &mut dyn EventSink) -> Result<Option<InstrumentSample>> {
    let sample = device.read_sample()?;
    if let Some(s) = sample {
        sink.emit(Event::Sample(s));
    }
    Ok(sample)
}

fn switch_range(
    device: &mut Potentiostat,
    range: CurrentRange,
    sink: &mut dyn EventSink,
) -> Result<()> {
    let changed = device.range() != range;
    device.set_range(range)?;
    if changed {
        sink.emit(Event::RangeChanged(range));
    }
    Ok(())
}

fn elapsed(clock: &dyn Clock, start: Duration) -> f64 {
    clock.now().saturating_sub(start).as_secs_f64()
}

/// Turn the cell off and close the files; failures are logged, never raised.
fn shut_down(device: &mut Potentiostat, writers: Vec<Result<()>>) {
    if let Err(e) = device.set_cell(false) {
        warn!("could not switch the cell off: {e}");
    }
    for result in writers {
        if let Err(e) = result {
            warn!("{e}");
        }
    }
}

fn charge_list(charges_uah: &[f64]) -> String {
    if charges_uah.is_empty() {
        return "none".to_string();
    }
    charges_uah
        .iter()
        .map(|c| format!("{c:.2} µAh"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn summary(kind: RunKind, interrupted: bool, charges: Vec<f64>) -> RunSummary {
    let verb = if interrupted { "interrupted" } else { "finished" };
    let mut label = kind.to_string();
    if let Some(first) = label.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    let message = format!("{label} {verb}. Charges: {}", charge_list(&charges));
    RunSummary {
        kind,
        interrupted,
        charges,
        message,
    }
}

/// Block averagers for the time, potential and current series of one run.
#[derive(Debug, Clone)]
struct PointAverager {
    time: AverageBuffer,
    potential: AverageBuffer,
    current: AverageBuffer,
    /// Trapezoidal ∫I dt over the averaged points so far, in C.
    charge: f64,
}

impl PointAverager {
    fn new(block_size: usize) -> Self {
        Self {
            time: AverageBuffer::new(block_size),
            potential: AverageBuffer::new(block_size),
            current: AverageBuffer::new(block_size),
            charge: 0.0,
        }
    }

    /// Returns the averaged (s, V, A) point when a block completes.
    fn add(&mut self, time: f64, potential: f64, current_a: f64) -> Option<(f64, f64, f64)> {
        let t = self.time.add_sample(time);
        let v = self.potential.add_sample(potential);
        let i = self.current.add_sample(current_a);
        match (t, v, i) {
            (Some(t), Some(v), Some(i)) => {
                self.accumulate_charge();
                Some((t, v, i))
            }
            _ => None,
        }
    }

    /// Add the trapezoid ending at the newest averaged point.
    fn accumulate_charge(&mut self) {
        let (t, i) = (self.times(), self.currents());
        let n = t.len().min(i.len());
        if n >= 2 {
            self.charge += (t[n - 1] - t[n - 2]) * (i[n - 1] + i[n - 2]) / 2.0;
        }
    }

    /// |∫I dt| since the last clear, in Ah.
    fn charge_ah(&self) -> f64 {
        (self.charge / 3600.0).abs()
    }

    fn clear(&mut self) {
        self.time.clear();
        self.potential.clear();
        self.current.clear();
        self.charge = 0.0;
    }

    fn set_block_size(&mut self, block_size: usize) {
        self.time.set_block_size(block_size);
        self.potential.set_block_size(block_size);
        self.current.set_block_size(block_size);
    }

    fn times(&self) -> &[f64] {
        self.time.completed()
    }

    fn currents(&self) -> &[f64] {
        self.current.completed()
    }
}

// ============================================================================
// Cyclic voltammetry
// ============================================================================

pub struct SweepRun {
    params: SweepParameters,
    writer: RawDataWriter,
    averager: PointAverager,
    ranger: AutoRanger,
    skip: u32,
    start: Duration,
}

impl SweepRun {
    /// Apply the start potential, switch the cell on and settle the current
    /// range before the clock starts.
    pub fn start(
        params: SweepParameters,
        device: &mut Potentiostat,
        clock: &dyn Clock,
        sink: &mut dyn EventSink,
    ) -> Result<Self> {
        device.set_output(OutputValue::Potential(params.start_potential()))?;
        device.set_control_mode(ControlMode::Potentiostatic)?;
        switch_range(device, CurrentRange::High, sink)?;
        clock.sleep(SWEEP_SETTLE);

        let writer = RawDataWriter::create(&params.output().path)?;
        let averager = PointAverager::new(params.samples_per_average());
        device.set_cell(true)?;
        clock.sleep(SWEEP_SETTLE);

        let mask = params.enabled_ranges();
        for pass in 0..2 {
            if pass > 0 {
                clock.sleep(SWEEP_SETTLE);
            }
            let mut current = read(device, sink)?.map_or(0.0, |s| s.current);
            clock.sleep(SWEEP_SETTLE);
            if let Some(s) = read(device, sink)? {
                current = s.current;
            }
            let range = mask.nearest_enabled(range_for_magnitude(current));
            switch_range(device, range, sink)?;
        }

        info!(
            "Cyclic voltammetry started: {} V to {} V at {} mV/s, {} cycle(s)",
            params.lower_bound(),
            params.upper_bound(),
            params.scan_rate() * 1e3,
            params.cycles()
        );
        Ok(Self {
            ranger: AutoRanger::new(mask),
            params,
            writer,
            averager,
            skip: crate::ranging::RANGE_SWITCH_SKIP_SAMPLES,
            start: clock.now(),
        })
    }

    pub fn update(
        &mut self,
        device: &mut Potentiostat,
        clock: &dyn Clock,
        sink: &mut dyn EventSink,
    ) -> Result<RunStatus> {
        let t = elapsed(clock, self.start);
        let Some(potential) = self.params.potential_at(t) else {
            return Ok(RunStatus::Complete);
        };
        device.set_output(OutputValue::Potential(potential))?;

        let Some(sample) = read(device, sink)? else {
            return Ok(RunStatus::Running);
        };
        if self.skip > 0 {
            self.skip -= 1;
            return Ok(RunStatus::Running);
        }

        if let Some((t, v, i)) = self.averager.add(t, sample.potential, sample.current * 1e-3) {
            self.writer.write_point(t, v, i)?;
            sink.emit(Event::Point {
                kind: RunKind::Sweep,
                time: t,
                potential: v,
                current: i,
                charge: None,
            });
        }

        if let RangeDecision::Switch { range, skip } =
            self.ranger.update(sample.current, sample.range)
        {
            switch_range(device, range, sink)?;
            self.skip = skip;
        }
        Ok(RunStatus::Running)
    }

    pub fn finish(self, device: &mut Potentiostat, interrupted: bool) -> RunSummary {
        shut_down(device, vec![self.writer.finish()]);
        let charges = charge_from_sweep(self.averager.times(), self.averager.currents());
        summary(RunKind::Sweep, interrupted, charges)
    }
}

// ============================================================================
// Galvanostatic charge/discharge
// ============================================================================

pub struct CycleRun {
    params: CycleParameters,
    writer: RawDataWriter,
    capacities: CapacityWriter,
    averager: PointAverager,
    charging: bool,
    /// 1-based index of the half-cycle in progress.
    half_cycle: u32,
    /// Ah, one per completed half-cycle
    charges: Vec<f64>,
    start: Duration,
}

impl CycleRun {
    pub fn start(
        params: CycleParameters,
        device: &mut Potentiostat,
        clock: &dyn Clock,
        sink: &mut dyn EventSink,
    ) -> Result<Self> {
        let path = params.output().path.clone();
        let writer = RawDataWriter::create(&path)?;
        let capacities = CapacityWriter::create_for(&path, CapacityLayout::Cycle)?;

        let setpoint = params.charge_current();
        switch_range(device, range_for_magnitude(setpoint), sink)?;
        device.set_output(OutputValue::Current(setpoint))?;
        device.set_control_mode(ControlMode::Galvanostatic)?;
        clock.sleep(GALVANOSTATIC_SETTLE);

        let start = clock.now();
        let averager = PointAverager::new(params.samples_per_average());
        device.set_cell(true)?;

        info!(
            "Charge/discharge started: {} µA / {} µA between {} V and {} V, {} half cycle(s)",
            params.charge_current() * 1e3,
            params.discharge_current() * 1e3,
            params.lower_bound(),
            params.upper_bound(),
            params.half_cycles()
        );
        Ok(Self {
            params,
            writer,
            capacities,
            averager,
            charging: true,
            half_cycle: 1,
            charges: Vec::new(),
            start,
        })
    }

    fn setpoint(&self) -> f64 {
        if self.charging {
            self.params.charge_current()
        } else {
            self.params.discharge_current()
        }
    }

    pub fn update(
        &mut self,
        device: &mut Potentiostat,
        clock: &dyn Clock,
        sink: &mut dyn EventSink,
    ) -> Result<RunStatus> {
        if self.half_cycle > self.params.half_cycles() {
            return Ok(RunStatus::Complete);
        }

        let Some(sample) = read(device, sink)? else {
            return Ok(RunStatus::Running);
        };
        let t = elapsed(clock, self.start);
        if let Some((t, v, i)) = self.averager.add(t, sample.potential, sample.current * 1e-3) {
            self.writer.write_point(t, v, i)?;
            sink.emit(Event::Point {
                kind: RunKind::Cycle,
                time: t,
                potential: v,
                current: i,
                charge: Some(self.averager.charge_ah()),
            });
        }

        let setpoint = self.setpoint();
        let crossed = (setpoint > 0.0 && sample.potential > self.params.upper_bound())
            || (setpoint < 0.0 && sample.potential < self.params.lower_bound());
        if crossed {
            self.next_half_cycle(device, sink)?;
        }
        Ok(RunStatus::Running)
    }

    fn next_half_cycle(&mut self, device: &mut Potentiostat, sink: &mut dyn EventSink) -> Result<()> {
        self.charging = !self.charging;
        let setpoint = self.setpoint();
        switch_range(device, range_for_magnitude(setpoint), sink)?;
        device.set_output(OutputValue::Current(setpoint))?;

        let capacity = capacity_ah(self.averager.currents(), self.averager.times());
        debug!(
            "half cycle {} ended: {capacity:e} Ah (running total {:e} Ah)",
            self.half_cycle,
            self.averager.charge_ah()
        );
        self.charges.push(capacity);

        if self.half_cycle % 2 == 0 {
            let n = self.charges.len();
            let (charge, discharge) = (self.charges[n - 2], self.charges[n - 1]);
            let key = (self.half_cycle / 2) as f64;
            self.capacities.write_row(key, charge, discharge)?;
            sink.emit(Event::Capacity {
                kind: RunKind::Cycle,
                key,
                charge,
                discharge,
            });
        }

        self.averager.clear();
        self.half_cycle += 1;
        Ok(())
    }

    pub fn finish(self, device: &mut Potentiostat, interrupted: bool) -> RunSummary {
        shut_down(device, vec![self.writer.finish(), self.capacities.finish()]);
        let charges = self
            .charges
            .iter()
            .map(|c| c * AH_TO_MICROAMP_HOURS)
            .collect();
        summary(RunKind::Cycle, interrupted, charges)
    }
}

// ============================================================================
// Rate testing
// ============================================================================

pub struct RateRun {
    params: RateTestParameters,
    writer: RawDataWriter,
    capacities: CapacityWriter,
    averager: PointAverager,
    rate_index: usize,
    /// Half-cycles left at the current C-rate; even while charging.
    countdown: u32,
    /// Ah, charge capacity of the last full cycle at the current C-rate.
    charge_capacity: f64,
    /// (charge, discharge) in Ah, one per completed C-rate.
    records: Vec<(f64, f64)>,
    start: Duration,
}

impl RateRun {
    pub fn start(
        params: RateTestParameters,
        device: &mut Potentiostat,
        clock: &dyn Clock,
        sink: &mut dyn EventSink,
    ) -> Result<Self> {
        let path = params.output().path.clone();
        let writer = RawDataWriter::create(&path)?;
        let capacities = CapacityWriter::create_for(&path, CapacityLayout::Rate)?;

        let current = params.currents()[0];
        switch_range(device, range_for_magnitude(current), sink)?;
        device.set_output(OutputValue::Current(current))?;
        device.set_control_mode(ControlMode::Galvanostatic)?;
        clock.sleep(GALVANOSTATIC_SETTLE);

        let start = clock.now();
        let averager = PointAverager::new(params.samples_per_average(0));
        device.set_cell(true)?;

        info!(
            "Rate testing started: C-rates {:?} with 1C = {} µA, {} cycle(s) each",
            params.c_rates(),
            params.one_c_current() * 1e3,
            params.cycles_per_rate()
        );
        Ok(Self {
            countdown: 2 * params.cycles_per_rate(),
            params,
            writer,
            capacities,
            averager,
            rate_index: 0,
            charge_capacity: 0.0,
            records: Vec::new(),
            start,
        })
    }

    pub fn update(
        &mut self,
        device: &mut Potentiostat,
        clock: &dyn Clock,
        sink: &mut dyn EventSink,
    ) -> Result<RunStatus> {
        let Some(sample) = read(device, sink)? else {
            return Ok(RunStatus::Running);
        };
        let t = elapsed(clock, self.start);
        if let Some((t, v, i)) = self.averager.add(t, sample.potential, sample.current * 1e-3) {
            self.writer.write_point(t, v, i)?;
            sink.emit(Event::Point {
                kind: RunKind::RateTest,
                time: t,
                potential: v,
                current: i,
                charge: None,
            });
        }

        let charging = self.countdown % 2 == 0;
        let crossed = (charging && sample.potential > self.params.upper_bound())
            || (!charging && sample.potential < self.params.lower_bound());
        if !crossed {
            return Ok(RunStatus::Running);
        }

        self.countdown -= 1;
        if self.countdown == 1 {
            self.charge_capacity = capacity_ah(self.averager.currents(), self.averager.times());
        } else if self.countdown == 0 {
            let discharge = capacity_ah(self.averager.currents(), self.averager.times());
            let c_rate = self.params.c_rates()[self.rate_index];
            self.capacities
                .write_row(c_rate, self.charge_capacity, discharge)?;
            self.records.push((self.charge_capacity, discharge));
            sink.emit(Event::Capacity {
                kind: RunKind::RateTest,
                key: c_rate,
                charge: self.charge_capacity,
                discharge,
            });

            if self.rate_index + 1 >= self.params.c_rates().len() {
                return Ok(RunStatus::Complete);
            }
            self.rate_index += 1;
            self.countdown = 2 * self.params.cycles_per_rate();
            device.set_output(OutputValue::Current(0.0))?;
            let next = self.params.currents()[self.rate_index];
            switch_range(device, range_for_magnitude(next), sink)?;
            self.averager
                .set_block_size(self.params.samples_per_average(self.rate_index));
            info!("Now testing C-rate {}", self.params.c_rates()[self.rate_index]);
        }

        let magnitude = self.params.currents()[self.rate_index];
        let current = if self.countdown % 2 == 0 {
            magnitude
        } else {
            -magnitude
        };
        device.set_output(OutputValue::Current(current))?;
        self.averager.clear();
        Ok(RunStatus::Running)
    }

    pub fn finish(self, device: &mut Potentiostat, interrupted: bool) -> RunSummary {
        shut_down(device, vec![self.writer.finish(), self.capacities.finish()]);
        let charges = self
            .records
            .iter()
            .flat_map(|&(c, d)| [c, d])
            .map(|c| c * AH_TO_MICROAMP_HOURS)
            .collect();
        summary(RunKind::RateTest, interrupted, charges)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// The run in progress, if any.
pub enum ActiveRun {
    Sweep(SweepRun),
    Cycle(CycleRun),
    Rate(RateRun),
}

impl ActiveRun {
    pub fn kind(&self) -> RunKind {
        match self {
            ActiveRun::Sweep(_) => RunKind::Sweep,
            ActiveRun::Cycle(_) => RunKind::Cycle,
            ActiveRun::Rate(_) => RunKind::RateTest,
        }
    }

    pub fn update(
        &mut self,
        device: &mut Potentiostat,
        clock: &dyn Clock,
        sink: &mut dyn EventSink,
    ) -> Result<RunStatus> {
        match self {
            ActiveRun::Sweep(run) => run.update(device, clock, sink),
            ActiveRun::Cycle(run) => run.update(device, clock, sink),
            ActiveRun::Rate(run) => run.update(device, clock, sink),
        }
    }

    pub fn finish(self, device: &mut Potentiostat, interrupted: bool) -> RunSummary {
        match self {
            ActiveRun::Sweep(run) => run.finish(device, interrupted),
            ActiveRun::Cycle(run) => run.finish(device, interrupted),
            ActiveRun::Rate(run) => run.finish(device, interrupted),
        }
    }

    /// Swap the raw data writer, returning the one in use.
    #[cfg(test)]
    pub(crate) fn replace_raw_writer(&mut self, writer: RawDataWriter) -> RawDataWriter {
        let current = match self {
            ActiveRun::Sweep(run) => &mut run.writer,
            ActiveRun::Cycle(run) => &mut run.writer,
            ActiveRun::Rate(run) => &mut run.writer,
        };
        std::mem::replace(current, writer)
    }
}

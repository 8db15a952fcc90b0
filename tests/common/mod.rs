#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use _core::sim::{SimHandle, SimulatedCell};
use _core::{Clock, Engine, EngineConfig, Event, ManualClock, SessionState};

/// An engine connected to a simulated cell, running on virtual time.
pub struct Bench {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub sim: SimHandle,
    pub events: Receiver<Event>,
}

impl Bench {
    /// Connect and enter the live display.
    pub fn new(make_cell: impl FnOnce(Arc<dyn Clock>) -> SimulatedCell) -> Self {
        let mut bench = Self::initializing(make_cell);
        bench.engine.tick().unwrap();
        assert_eq!(bench.engine.state(), SessionState::Idle);
        bench
    }

    /// Build the bench and connect, but stay in `InitializingIdle`.
    pub fn initializing(make_cell: impl FnOnce(Arc<dyn Clock>) -> SimulatedCell) -> Self {
        let clock = Arc::new(ManualClock::new());
        let cell = make_cell(clock.clone());
        let sim = cell.handle();
        let (tx, events) = mpsc::channel();
        let config = EngineConfig {
            busy_wait: false,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config, clock.clone(), Box::new(tx));
        engine.connect(Box::new(cell)).unwrap();
        Self {
            engine,
            clock,
            sim,
            events,
        }
    }

    pub fn resistor(ohms: f64) -> Self {
        Self::new(|_| SimulatedCell::resistor(ohms))
    }

    /// Tick until the run in progress ends. Returns the number of ticks.
    pub fn run_to_completion(&mut self, max_ticks: usize) -> usize {
        for n in 1..=max_ticks {
            self.engine.tick().unwrap();
            if !self.engine.state().is_running() {
                return n;
            }
        }
        panic!("run still going after {max_ticks} ticks");
    }

    pub fn drain(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }
}

/// Fresh scratch directory for one test.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("potentiostat-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// (time s, potential V, current A) of every averaged point.
pub fn points(events: &[Event]) -> Vec<(f64, f64, f64)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Point {
                time,
                potential,
                current,
                ..
            } => Some((*time, *potential, *current)),
            _ => None,
        })
        .collect()
}

pub fn capacities(events: &[Event]) -> Vec<(f64, f64, f64)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Capacity {
                key,
                charge,
                discharge,
                ..
            } => Some((*key, *charge, *discharge)),
            _ => None,
        })
        .collect()
}

pub fn finished_charges(events: &[Event]) -> Option<(bool, Vec<f64>)> {
    events.iter().find_map(|e| match e {
        Event::RunFinished {
            interrupted,
            charges,
            ..
        } => Some((*interrupted, charges.clone())),
        _ => None,
    })
}

pub fn messages(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Message(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

pub fn assert_close(actual: f64, expected: f64, rel: f64) {
    assert!(
        (actual - expected).abs() <= expected.abs() * rel,
        "expected {expected:e} ±{:.1}%, got {actual:e}",
        rel * 100.0
    );
}

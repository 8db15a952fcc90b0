//! Notifications from the engine to whoever drives it (CLI, Python, tests).

use std::fmt;
use std::sync::mpsc::Sender;

use log::{debug, info};

use crate::device::InstrumentSample;
use crate::engine::SessionState;
use crate::ranging::CurrentRange;

/// Measurement mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunKind {
    Sweep,
    Cycle,
    RateTest,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunKind::Sweep => "cyclic voltammetry",
            RunKind::Cycle => "charge/discharge",
            RunKind::RateTest => "rate testing",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A raw reading, emitted for every successful ADC read.
    Sample(InstrumentSample),
    /// One averaged data point, as written to the raw data file.
    Point {
        kind: RunKind,
        /// s since run start
        time: f64,
        /// V
        potential: f64,
        /// A
        current: f64,
        /// Cumulative charge of the current half-cycle in Ah (cycle runs only).
        charge: Option<f64>,
    },
    /// One row of the capacity summary. `key` is the cycle number or C-rate.
    Capacity {
        kind: RunKind,
        key: f64,
        /// Ah
        charge: f64,
        /// Ah
        discharge: f64,
    },
    RunFinished {
        kind: RunKind,
        interrupted: bool,
        /// µAh
        charges: Vec<f64>,
    },
    RangeChanged(CurrentRange),
    StateChanged(SessionState),
    /// Human-readable status text.
    Message(String),
}

/// Receiver of engine events. Emitting never fails; a sink that has lost its
/// consumer drops events.
pub trait EventSink: Send {
    fn emit(&mut self, event: Event);
}

impl EventSink for Sender<Event> {
    fn emit(&mut self, event: Event) {
        let _ = self.send(event);
    }
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

/// Writes events to the log and discards them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: Event) {
        match event {
            Event::Sample(_) => {}
            Event::Message(text) => info!("{text}"),
            other => debug!("{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (mut tx, rx) = mpsc::channel();
        tx.emit(Event::Message("a".into()));
        assert_eq!(rx.recv().unwrap(), Event::Message("a".into()));
        drop(rx);
        tx.emit(Event::Message("b".into()));
    }

    #[test]
    fn run_kind_labels() {
        assert_eq!(RunKind::Sweep.to_string(), "cyclic voltammetry");
        assert_eq!(RunKind::RateTest.to_string(), "rate testing");
    }
}

mod common;

use std::fs;

use _core::sim::SimulatedCell;
use _core::{CurrentRange, CycleConfig, Event, OutputTarget, RateTestConfig, SessionState};

use common::{assert_close, capacities, finished_charges, points, scratch_dir, Bench};

#[test]
fn charge_discharge_of_an_rc_cell() {
    let dir = scratch_dir("cd-rc");
    let path = dir.join("cd.txt");
    let mut bench = Bench::new(|clock| SimulatedCell::rc(100.0, 0.01, clock));

    let params = CycleConfig {
        lower_bound_v: 0.0,
        upper_bound_v: 0.5,
        charge_current_ua: 100.0,
        discharge_current_ua: -100.0,
        half_cycles: 4,
        samples_per_average: 5,
        output: OutputTarget::new(&path),
    }
    .validate()
    .unwrap();
    bench.engine.start_cycle(params).unwrap();
    assert_eq!(bench.engine.state(), SessionState::RunningCycle);
    let sim = bench.sim.state();
    assert!(sim.cell_on && sim.galvanostatic);
    assert_eq!(sim.range, CurrentRange::Mid);

    bench.run_to_completion(3000);
    assert_eq!(bench.engine.state(), SessionState::StationaryGraph);
    assert!(!bench.sim.state().cell_on);

    let events = bench.drain();
    // 0.1 mA through 10 mF moves 0.48 V in about 48 s
    let caps = capacities(&events);
    assert_eq!(caps.len(), 2);
    for (n, &(key, charge, discharge)) in caps.iter().enumerate() {
        assert_eq!(key, (n + 1) as f64);
        for q in [charge, discharge] {
            assert!((1.28e-6..1.40e-6).contains(&q), "capacity {q:e} Ah");
        }
    }

    let (interrupted, charges) = finished_charges(&events).unwrap();
    assert!(!interrupted);
    assert_eq!(charges.len(), 4);
    assert!(charges.iter().all(|q| (1.28..1.40).contains(q)), "{charges:?}");

    // every averaged point carries the running charge of its half-cycle
    let pts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Point { charge, .. } => Some(*charge),
            _ => None,
        })
        .collect();
    assert!(pts.iter().all(Option::is_some));
    let running: Vec<f64> = pts.into_iter().flatten().collect();
    // it peaks at each half-cycle's capacity, then restarts from zero
    let mut peaks: Vec<f64> = running
        .windows(2)
        .filter(|w| w[1] < w[0])
        .map(|w| w[0])
        .collect();
    peaks.extend(running.last());
    assert_eq!(peaks.len(), charges.len());
    for (peak, q) in peaks.iter().zip(&charges) {
        assert_close(*peak, q * 1e-6, 1e-9);
    }

    // the potential stays within the bounds plus one IR step
    for (_, v, _) in points(&events) {
        assert!((-0.02..0.52).contains(&v), "{v} V");
    }

    let table = fs::read_to_string(dir.join("cd_capacities.txt")).unwrap();
    let rows: Vec<&str> = table.lines().collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0],
        "Cycle number\tCharge capacity (Ah)\tDischarge capacity (Ah)"
    );
    assert!(rows[1].starts_with("1\t"));
    assert!(rows[2].starts_with("2\t"));

    let raw = fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 1 + points(&events).len());
}

#[test]
fn interrupted_cycle_keeps_completed_half_cycles() {
    let dir = scratch_dir("cd-stop");
    let mut bench = Bench::new(|clock| SimulatedCell::rc(100.0, 0.01, clock));
    let params = CycleConfig {
        lower_bound_v: 0.0,
        upper_bound_v: 0.5,
        charge_current_ua: 100.0,
        discharge_current_ua: -100.0,
        half_cycles: 10,
        samples_per_average: 1,
        output: OutputTarget::new(dir.join("cd.txt")),
    }
    .validate()
    .unwrap();
    bench.engine.start_cycle(params).unwrap();
    // 72 s: one charge done, discharge under way
    for _ in 0..800 {
        bench.engine.tick().unwrap();
    }
    let summary = bench.engine.stop().unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.charges.len(), 1);
    assert!(summary
        .message
        .starts_with("Charge/discharge interrupted. Charges: 1.3"));
    assert!(!bench.sim.state().cell_on);

    // no complete cycle, so only the header
    let table = fs::read_to_string(dir.join("cd_capacities.txt")).unwrap();
    assert_eq!(table.lines().count(), 1);
}

#[test]
fn rate_test_steps_through_c_rates() {
    let dir = scratch_dir("rate-rc");
    let path = dir.join("rate.txt");
    let mut bench = Bench::new(|clock| SimulatedCell::rc(100.0, 0.005, clock));

    let params = RateTestConfig {
        lower_bound_v: 0.0,
        upper_bound_v: 0.5,
        one_c_current_ua: 50.0,
        c_rates: vec![1.0, 2.0],
        cycles_per_rate: 1,
        output: OutputTarget::new(&path),
    }
    .validate()
    .unwrap();
    bench.engine.start_rate_test(params).unwrap();
    assert_eq!(bench.engine.state(), SessionState::RunningRateTest);

    bench.run_to_completion(2500);
    assert_eq!(bench.engine.state(), SessionState::StationaryGraph);
    assert!(!bench.sim.state().cell_on);

    let events = bench.drain();
    let caps = capacities(&events);
    assert_eq!(caps.len(), 2);
    assert_eq!(caps[0].0, 1.0);
    assert_eq!(caps[1].0, 2.0);
    // the capacitor holds about 0.68 µAh over the window; block averaging
    // trims the ends of each half-cycle
    for &(_, charge, discharge) in &caps {
        for q in [charge, discharge] {
            assert!((5.1e-7..7.2e-7).contains(&q), "capacity {q:e} Ah");
        }
    }

    let (_, charges) = finished_charges(&events).unwrap();
    assert_eq!(charges.len(), 4);

    // 36 samples per point at 1C, 18 at 2C
    let pts = points(&events);
    let gaps: Vec<f64> = pts.windows(2).map(|w| w[1].0 - w[0].0).collect();
    assert!(gaps.iter().any(|g| (g - 3.24).abs() < 1e-6));
    assert!(gaps.iter().any(|g| (g - 1.62).abs() < 1e-6));

    let table = fs::read_to_string(dir.join("rate_capacities.txt")).unwrap();
    let rows: Vec<&str> = table.lines().collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], "C-rate\tCharge capacity (Ah)\tDischarge capacity (Ah)");
    assert!(rows[1].starts_with("1.000000e+00\t"));
    assert!(rows[2].starts_with("2.000000e+00\t"));
}

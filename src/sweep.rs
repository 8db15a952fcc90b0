//! Cyclic voltammetry potential profile.
//!
//! A sweep starts at `start`, ramps to the upper bound, runs `cycles` full
//! triangles between the bounds and finally ramps from the upper bound to
//! `stop`. Negative scan rates mirror the whole profile.

/// Target potential `t` seconds into the sweep, or `None` once the sweep is
/// complete.
pub fn potential_at(
    t: f64,
    start: f64,
    stop: f64,
    upper: f64,
    lower: f64,
    rate: f64,
    cycles: u32,
) -> Option<f64> {
    if rate < 0.0 {
        return potential_at(t, -start, -stop, -lower, -upper, -rate, cycles).map(|v| -v);
    }

    let span = upper - lower;
    let ramp_in = upper - start;
    let cyclic = span * 2.0 * cycles as f64;
    let ramp_out = (stop - upper).abs();
    let travelled = rate * t;

    if travelled < ramp_in {
        Some(start + travelled)
    } else if travelled < ramp_in + cyclic {
        let s = travelled - ramp_in;
        Some(lower + (s.rem_euclid(2.0 * span) - span).abs())
    } else if travelled < ramp_in + cyclic + ramp_out {
        let s = travelled - ramp_in - cyclic;
        if stop > upper {
            Some(upper + s)
        } else {
            Some(upper - s)
        }
    } else {
        None
    }
}

/// Total potential distance covered by a sweep with a positive-rate layout.
pub fn total_travel(start: f64, stop: f64, upper: f64, lower: f64, rate: f64, cycles: u32) -> f64 {
    let (start, stop, upper, lower) = if rate < 0.0 {
        (-start, -stop, -lower, -upper)
    } else {
        (start, stop, upper, lower)
    };
    (upper - start) + (upper - lower) * 2.0 * cycles as f64 + (stop - upper).abs()
}

/// Sample the profile at regular time steps, `steps_per_span` points per
/// bound-to-bound traverse, until it reports completion.
pub fn preview(
    start: f64,
    stop: f64,
    upper: f64,
    lower: f64,
    rate: f64,
    cycles: u32,
    steps_per_span: u32,
) -> Vec<(f64, f64)> {
    let mut points = Vec::new();
    let step = ((upper - lower) / steps_per_span.max(1) as f64 / rate).abs();
    if step <= 0.0 || !step.is_finite() {
        // degenerate span: a single point keeps the preview non-empty
        if let Some(v) = potential_at(0.0, start, stop, upper, lower, rate, cycles) {
            points.push((0.0, v));
        }
        return points;
    }

    let mut index = 0u64;
    loop {
        let t = index as f64 * step;
        match potential_at(t, start, stop, upper, lower, rate, cycles) {
            Some(v) => points.push((t, v)),
            None => break,
        }
        index += 1;
    }
    points
}

/// Samples to average for a given scan rate (mV/s), giving about one averaged
/// point per 20 mV·s of sweep.
pub fn suggested_samples_per_average(scan_rate_mv_s: f64) -> usize {
    if scan_rate_mv_s == 0.0 || !scan_rate_mv_s.is_finite() {
        return 1;
    }
    (20.0 / scan_rate_mv_s.abs()) as usize + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn starts_at_start_potential() {
        assert_eq!(potential_at(0.0, 0.0, 0.0, 1.0, -1.0, 1.0, 1), Some(0.0));
    }

    #[test]
    fn follows_the_three_phases() {
        let p = |t| potential_at(t, 0.0, 0.0, 1.0, -1.0, 1.0, 1).unwrap();
        assert!(close(p(0.5), 0.5));
        assert!(close(p(1.0), 1.0));
        assert!(close(p(2.0), 0.0));
        assert!(close(p(3.0), -1.0));
        assert!(close(p(4.0), 0.0));
        assert!(close(p(4.5), 0.5));
        assert!(close(p(5.5), 0.5));
    }

    #[test]
    fn finishes_after_total_travel() {
        assert_eq!(total_travel(0.0, 0.0, 1.0, -1.0, 1.0, 1), 6.0);
        assert!(potential_at(5.999, 0.0, 0.0, 1.0, -1.0, 1.0, 1).is_some());
        assert_eq!(potential_at(6.0, 0.0, 0.0, 1.0, -1.0, 1.0, 1), None);
        assert_eq!(potential_at(100.0, 0.0, 0.0, 1.0, -1.0, 1.0, 1), None);
    }

    #[test]
    fn start_at_upper_bound_skips_the_first_ramp() {
        let p = |t| potential_at(t, 1.0, 1.0, 1.0, -1.0, 2.0, 1).unwrap();
        assert!(close(p(0.0), 1.0));
        assert!(close(p(0.5), 0.0));
        assert!(close(p(1.0), -1.0));
        assert_eq!(potential_at(2.0, 1.0, 1.0, 1.0, -1.0, 2.0, 1), None);
    }

    #[test]
    fn final_ramp_can_go_above_upper_bound() {
        let p = |t| potential_at(t, 0.0, 1.5, 1.0, 0.0, 1.0, 0).unwrap();
        assert!(close(p(1.25), 1.25));
        assert_eq!(potential_at(1.6, 0.0, 1.5, 1.0, 0.0, 1.0, 0), None);
    }

    #[test]
    fn negative_rate_mirrors_the_profile() {
        let (s0, s1, u, l, r, n) = (0.2, -0.1, 0.5, -0.5, 0.05, 2);
        for i in 0..500 {
            let t = i as f64 * 0.37;
            let forward = potential_at(t, s0, s1, u, l, r, n);
            let mirrored = potential_at(t, -s0, -s1, -l, -u, -r, n);
            match (forward, mirrored) {
                (Some(a), Some(b)) => assert!(close(a, -b), "t={t}: {a} vs {b}"),
                (None, None) => {}
                other => panic!("t={t}: completion mismatch {other:?}"),
            }
        }
    }

    #[test]
    fn negative_rate_sweeps_down_first() {
        let p = |t| potential_at(t, 0.0, 0.0, 1.0, -1.0, -1.0, 1).unwrap();
        assert!(close(p(0.5), -0.5));
        assert!(close(p(1.0), -1.0));
        assert!(close(p(3.0), 1.0));
        assert!(close(p(5.5), -0.5));
        assert_eq!(potential_at(6.5, 0.0, 0.0, 1.0, -1.0, -1.0, 1), None);
    }

    #[test]
    fn preview_covers_whole_sweep() {
        let points = preview(0.0, 0.0, 0.5, -0.5, 0.01, 1, 100);
        // 3 V of travel at 10 mV per step
        assert_eq!(points.len(), 300);
        assert_eq!(points[0], (0.0, 0.0));
        let (t_last, _) = *points.last().unwrap();
        assert!(close(t_last, 299.0));
    }

    #[test]
    fn samples_per_average_hint() {
        assert_eq!(suggested_samples_per_average(10.0), 3);
        assert_eq!(suggested_samples_per_average(-100.0), 1);
        assert_eq!(suggested_samples_per_average(1.0), 21);
        assert_eq!(suggested_samples_per_average(0.0), 1);
    }
}

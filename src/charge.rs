//! Charge integration over sampled current/time series.

/// Minimum length of a same-signed current run to count as a phase; shorter
/// runs are noise around zero.
pub const MIN_PHASE_SAMPLES: usize = 10;

/// Coulombs to µAh.
const COULOMB_TO_MICROAMP_HOURS: f64 = 1000.0 / 3.6;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Trapezoidal integral of `y` over `x`. Extra elements of the longer slice
/// are ignored.
pub fn trapz(y: &[f64], x: &[f64]) -> f64 {
    y.windows(2)
        .zip(x.windows(2))
        .map(|(y, x)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum()
}

/// Running trapezoidal integral, starting at 0 for the first sample.
pub fn cumtrapz(y: &[f64], x: &[f64]) -> Vec<f64> {
    let n = y.len().min(x.len());
    let mut out = Vec::with_capacity(n);
    let mut acc = 0.0;
    for i in 0..n {
        if i > 0 {
            acc += (x[i] - x[i - 1]) * (y[i] + y[i - 1]) / 2.0;
        }
        out.push(acc);
    }
    out
}

/// |∫I dt| in Ah for current in A and time in s.
pub fn capacity_ah(current_a: &[f64], time_s: &[f64]) -> f64 {
    (trapz(current_a, time_s) / SECONDS_PER_HOUR).abs()
}

/// Indices where a same-signed run of at least [`MIN_PHASE_SAMPLES`] samples
/// begins. Zero counts towards either sign.
pub fn zero_crossings(current: &[f64]) -> Vec<usize> {
    let mut crossings = Vec::new();
    let mut index = 0;
    while index < current.len() {
        let start = index;
        while index < current.len() && current[index] >= 0.0 {
            index += 1;
        }
        if index - start >= MIN_PHASE_SAMPLES {
            crossings.push(start);
        }

        let start = index;
        while index < current.len() && current[index] <= 0.0 {
            index += 1;
        }
        if index - start >= MIN_PHASE_SAMPLES {
            crossings.push(start);
        }

        // NaN satisfies neither comparison
        if index < current.len() && current[index].is_nan() {
            index += 1;
        }
    }
    crossings
}

/// Charge passed between consecutive zero crossings of a sweep, in µAh.
///
/// `time_s` in seconds and `current_a` in amperes, sample-aligned. Samples
/// beyond the shorter of the two are ignored.
pub fn charge_from_sweep(time_s: &[f64], current_a: &[f64]) -> Vec<f64> {
    let n = time_s.len().min(current_a.len());
    let (time_s, current_a) = (&time_s[..n], &current_a[..n]);
    zero_crossings(current_a)
        .windows(2)
        .map(|w| {
            let (a, b) = (w[0], w[1]);
            trapz(&current_a[a..b], &time_s[a..b]) * COULOMB_TO_MICROAMP_HOURS
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trapz_matches_hand_integration() {
        assert_eq!(trapz(&[1.0, 3.0, 5.0], &[0.0, 1.0, 3.0]), 2.0 + 8.0);
        assert_eq!(trapz(&[1.0], &[0.0]), 0.0);
        assert_eq!(trapz(&[], &[]), 0.0);
    }

    #[test]
    fn sweep_charge_ignores_unpaired_samples() {
        let current: Vec<f64> = [1.0, -1.0, 1.0]
            .iter()
            .flat_map(|&i| std::iter::repeat(i).take(20))
            .collect();
        let time: Vec<f64> = (0..35).map(f64::from).collect();
        let charges = charge_from_sweep(&time, &current);
        assert_eq!(charges.len(), 1);
        assert!((charges[0] - 19.0 * COULOMB_TO_MICROAMP_HOURS).abs() < 1e-9);
    }

    #[test]
    fn cumtrapz_is_running_total() {
        let c = cumtrapz(&[1.0, 3.0, 5.0], &[0.0, 1.0, 3.0]);
        assert_eq!(c, vec![0.0, 2.0, 10.0]);
    }

    #[test]
    fn capacity_is_absolute_ah() {
        // -1 A for one hour
        assert!((capacity_ah(&[-1.0, -1.0], &[0.0, 3600.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn short_runs_are_not_crossings() {
        let mut current = vec![1.0; 12];
        current.extend([-1.0; 3]);
        current.extend([1.0; 12]);
        assert_eq!(zero_crossings(&current), vec![0, 15]);
    }

    #[test]
    fn single_sign_flip_yields_one_charge() {
        let time: Vec<f64> = (0..30).map(|i| i as f64 * 0.5).collect();
        let current: Vec<f64> = (0..30)
            .map(|i| if i <= 15 { 2e-3 } else { -1e-3 })
            .collect();
        assert_eq!(zero_crossings(&current), vec![0, 16]);

        let charges = charge_from_sweep(&time, &current);
        assert_eq!(charges.len(), 1);

        // 16 samples of 2 mA at 0.5 s spacing: 15 intervals
        let expected_coulombs = 15.0 * 0.5 * 2e-3;
        let expected = expected_coulombs * 1e6 / 3600.0;
        assert!((charges[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_current_counts_for_both_signs() {
        let current = vec![0.0; 25];
        assert_eq!(zero_crossings(&current), vec![0]);
        assert!(charge_from_sweep(&[0.0; 25], &current).is_empty());
    }
}

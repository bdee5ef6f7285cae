//! Startup timing calibration: measures whether the host platform can
//! actually deliver the sub-millisecond timing this stack assumes, and
//! warns (rather than fails) when it cannot — matching the original's
//! posture that a coarse clock degrades protocol margins but shouldn't
//! prevent the tool from running.

use std::time::Instant;
use tracing::warn;

use super::{monotonic_ms, sleep_ms};

/// Result of the startup calibration pass.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationReport {
    /// Observed resolution of `monotonic_ms`, in milliseconds.
    pub clock_resolution_ms: f64,
    /// `sleep_ms(10)` requested-vs-actual ratio; 1.0 is perfect.
    pub sleep_accuracy_ratio: f64,
    pub adequate: bool,
}

/// Measure clock resolution and `sleep_ms` accuracy, logging a
/// `tracing::warn!` if either falls outside tolerance (sleep off by
/// ≥5% at 2-50 ms, or clock resolution coarser than 1.2 ms).
pub fn calibrate() -> CalibrationReport {
    let clock_resolution_ms = measure_clock_resolution();
    let sleep_accuracy_ratio = measure_sleep_accuracy(10);

    let clock_ok = clock_resolution_ms <= 1.2;
    let sleep_ok = (sleep_accuracy_ratio - 1.0).abs() <= 0.05;

    if !clock_ok {
        warn!(
            clock_resolution_ms,
            "monotonic clock resolution coarser than 1.2ms; protocol timing margins will be tight"
        );
    }
    if !sleep_ok {
        warn!(
            sleep_accuracy_ratio,
            "sleep_ms accuracy off by more than 5% at 10ms; consider DumbOpts::MAN_BREAK for bit-banged timing"
        );
    }

    CalibrationReport {
        clock_resolution_ms,
        sleep_accuracy_ratio,
        adequate: clock_ok && sleep_ok,
    }
}

fn measure_clock_resolution() -> f64 {
    let mut deltas = Vec::with_capacity(16);
    let mut last = monotonic_ms();
    let start = Instant::now();
    while start.elapsed().as_millis() < 50 {
        let now = monotonic_ms();
        if now != last {
            deltas.push(now - last);
            last = now;
        }
    }
    if deltas.is_empty() {
        return 50.0;
    }
    let sum: u64 = deltas.iter().sum();
    sum as f64 / deltas.len() as f64
}

fn measure_sleep_accuracy(requested_ms: u64) -> f64 {
    let start = Instant::now();
    sleep_ms(requested_ms);
    let actual_ms = start.elapsed().as_secs_f64() * 1000.0;
    actual_ms / requested_ms as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_reports_plausible_values() {
        let report = calibrate();
        assert!(report.clock_resolution_ms >= 0.0);
        assert!(report.sleep_accuracy_ratio >= 1.0);
    }
}

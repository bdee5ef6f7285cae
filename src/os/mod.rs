//! OS services: monotonic time, precise sleep, a background periodic
//! timer, a mutex wrapper, and a startup timing calibration.
//!
//! The periodic timer runs on a dedicated thread rather than a signal
//! handler, avoiding the non-async-signal-safety that a `SIGALRM`-driven
//! callback doing real work would otherwise rely on.

mod calibrate;
mod mutex;
mod timer;

pub use calibrate::{calibrate, CalibrationReport};
pub use mutex::Mutex;
pub use timer::{PeriodicTimer, TimerHandle};

use std::thread;
use std::time::{Duration, Instant};

/// Monotonic milliseconds since an arbitrary epoch fixed at first call.
pub fn monotonic_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// High-resolution tick count; on this platform ticks are nanoseconds, so
/// resolution is far better than the ≤1 ms requirement.
pub fn hrt_ticks() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

pub fn hrt_ticks_to_us(ticks: u64) -> u64 {
    ticks / 1_000
}

/// Sleep for at least `ms` milliseconds, self-correcting drift: if the
/// previous call overslept, the overshoot is subtracted from this call's
/// request. A thread-local tracks the running error.
pub fn sleep_ms(ms: u64) {
    thread_local! {
        static DRIFT_NS: std::cell::Cell<i64> = const { std::cell::Cell::new(0) };
    }

    let drift = DRIFT_NS.with(|d| d.get());
    let target = Duration::from_millis(ms);
    let adjusted = if drift > 0 {
        target.saturating_sub(Duration::from_nanos(drift as u64))
    } else {
        target + Duration::from_nanos((-drift) as u64)
    };

    let start = Instant::now();
    thread::sleep(adjusted);
    let actual = start.elapsed();

    let overshoot = actual.as_nanos() as i64 - target.as_nanos() as i64;
    DRIFT_NS.with(|d| d.set(overshoot));
}

/// Sleep hybrid: `thread::sleep` for the bulk, spin-wait for the final
/// stretch, to hit sub-millisecond targets that `thread::sleep` alone
/// cannot reliably meet. Mirrors `FtdiConnection::delay_us`.
pub fn sleep_precise_us(us: u64) {
    let start = Instant::now();
    let target = Duration::from_micros(us);

    if us > 2_000 {
        let sleep_time = Duration::from_micros(us.saturating_sub(1_000));
        thread::sleep(sleep_time);
    }

    while start.elapsed() < target {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_never_goes_backwards() {
        let a = monotonic_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn sleep_ms_sleeps_at_least_requested() {
        let start = Instant::now();
        sleep_ms(5);
        assert!(start.elapsed() >= Duration::from_millis(4));
    }
}

//! Periodic timer service (C1): fires a single registered callback
//! roughly every 300 ms from a dedicated background thread, rather than
//! a signal handler, so the callback can safely do real work. The
//! try-lock serialization contract against the connection registry (see
//! `crate::l2`) is what keeps concurrent ticks from racing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(300);

/// A running periodic timer. Dropping or calling [`TimerHandle::stop`]
/// joins the background thread, guaranteeing no further callback
/// invocations happen after the call returns.
pub struct TimerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

pub struct PeriodicTimer;

impl PeriodicTimer {
    /// Spawn the timer thread. `callback` is invoked approximately every
    /// 300 ms; it must try-lock whatever state it touches and return
    /// promptly (§4.1/§5: no I/O over ~20 ms, no allocation on the hot
    /// path beyond what the callback itself needs).
    pub fn spawn<F>(mut callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let thread = std::thread::Builder::new()
            .name("kdiag-timer".into())
            .spawn(move || {
                while !stop_thread.load(Ordering::Relaxed) {
                    crate::os::sleep_ms(TICK.as_millis() as u64);
                    if stop_thread.load(Ordering::Relaxed) {
                        break;
                    }
                    callback();
                }
            })
            .expect("failed to spawn timer thread");

        TimerHandle {
            stop,
            thread: Some(thread),
        }
    }
}

impl TimerHandle {
    /// Stop the timer and block until the background thread has
    /// returned, so the caller can rely on no further invocations.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callback_never_runs_concurrently_with_itself() {
        let counter = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));
        let c = counter.clone();
        let b = busy.clone();
        let timer = PeriodicTimer::spawn(move || {
            assert!(!b.swap(true, Ordering::SeqCst), "reentrant callback invocation");
            c.fetch_add(1, Ordering::SeqCst);
            b.store(false, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(650));
        timer.stop();
    }

    #[test]
    fn stop_prevents_further_invocations() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let timer = PeriodicTimer::spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(350));
        timer.stop();
        let after_stop = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(350));
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }
}

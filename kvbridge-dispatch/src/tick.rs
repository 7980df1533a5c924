//! # Tick Host
//!
//! Purpose: Model the host's periodic-callback registration and provide a
//! thread-backed host for processes without a scheduler of their own.
//!
//! ## Design Principles
//! 1. **Host Agnostic**: The dispatcher only needs `register_tick`; the tick
//!    period changes delivery latency, never correctness.
//! 2. **Self Unregistering**: A tick returns `false` once its owner is gone.
//! 3. **Explicit Shutdown**: `IntervalTicker::stop` joins the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Periodic callback. Returning `false` unregisters it.
pub type TickFn = Box<dyn FnMut() -> bool + Send>;

/// A host that invokes registered callbacks at regular intervals.
pub trait TickHost {
    fn register_tick(&self, tick: TickFn);
}

/// Runs registered ticks on one background thread at a fixed interval.
pub struct IntervalTicker {
    ticks: Arc<Mutex<Vec<TickFn>>>,
    stop: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalTicker {
    /// Starts the tick thread. A zero interval is raised to 1 ms.
    pub fn start(interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };

        let ticks: Arc<Mutex<Vec<TickFn>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_ticks = Arc::clone(&ticks);
        let thread_stop = Arc::clone(&stop);

        let join = thread::Builder::new()
            .name("kvbridge-tick".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    run_ticks(&thread_ticks);
                }
            });
        let join = match join {
            Ok(handle) => Some(handle),
            Err(err) => {
                debug!(error = %err, "tick thread failed to start");
                None
            }
        };

        IntervalTicker {
            ticks,
            stop,
            join: Mutex::new(join),
        }
    }

    /// Number of registered ticks still alive.
    pub fn registered(&self) -> usize {
        self.ticks.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.join.lock().is_some()
    }

    /// Signals the thread to exit and waits for it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let join = self.join.lock().take();
        if let Some(join) = join {
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                debug!("tick thread panicked");
            }
        }
    }
}

impl TickHost for IntervalTicker {
    fn register_tick(&self, tick: TickFn) {
        self.ticks.lock().push(tick);
    }
}

impl Drop for IntervalTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

// Ticks run outside the registry lock so a tick may register another.
fn run_ticks(registry: &Mutex<Vec<TickFn>>) {
    let mut running = std::mem::take(&mut *registry.lock());
    running.retain_mut(|tick| tick());
    let mut registry = registry.lock();
    let added = std::mem::replace(&mut *registry, running);
    registry.extend(added);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        check()
    }

    #[test]
    fn ticks_repeat_until_they_return_false() {
        let ticker = IntervalTicker::start(Duration::from_millis(1));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        ticker.register_tick(Box::new(move || seen.fetch_add(1, Ordering::SeqCst) + 1 < 3));

        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) >= 3));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        ticker.stop();
        assert_eq!(ticker.registered(), 0);
        assert!(!ticker.is_running());
    }

    #[test]
    fn tick_may_register_another() {
        let ticker = Arc::new(IntervalTicker::start(Duration::from_millis(1)));
        let nested = Arc::new(AtomicBool::new(false));
        let host = Arc::downgrade(&ticker);
        let flag = Arc::clone(&nested);
        ticker.register_tick(Box::new(move || {
            if let Some(host) = host.upgrade() {
                let flag = Arc::clone(&flag);
                host.register_tick(Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                    false
                }));
            }
            false
        }));

        assert!(wait_until(Duration::from_secs(2), || nested.load(Ordering::SeqCst)));
        ticker.stop();
    }

    #[test]
    fn stop_survives_a_panicking_tick() {
        let ticker = IntervalTicker::start(Duration::from_millis(1));
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        ticker.register_tick(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            panic!("tick failed");
        }));

        assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst) > 0));
        thread::sleep(Duration::from_millis(20));
        ticker.stop();
        assert!(!ticker.is_running());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

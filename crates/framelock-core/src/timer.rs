//! Drift-correcting periodic timer.
//!
//! [`DriftTimer`] fires a callback on a dedicated thread at a configurable
//! interval. Unlike a naively re-armed timer, reconfiguring it while enabled
//! preserves phase: the pending delay is recomputed from the time already
//! elapsed since the last fire instead of restarting the full interval, so
//! frequent reconfiguration does not accumulate drift. The pending delay is
//! clamped at zero, never negative.
//!
//! A panicking callback does not take the timer down: the panic is caught,
//! handed to the optional process-wide fault handler (or logged), and the
//! timer keeps firing if auto-reset is on.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

/// Handler invoked with a description of a panic that escaped a tick
/// callback.
type FaultHandler = Box<dyn Fn(&str) + Send + Sync>;

static TICK_FAULT_HANDLER: OnceLock<FaultHandler> = OnceLock::new();

/// Registers the process-wide handler observing panics raised inside timer
/// callbacks. Returns false if a handler was already registered; the first
/// registration wins.
pub fn set_tick_fault_handler(handler: impl Fn(&str) + Send + Sync + 'static) -> bool {
    TICK_FAULT_HANDLER.set(Box::new(handler)).is_ok()
}

fn report_tick_fault(payload: &(dyn Any + Send)) {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "tick callback panicked with a non-string payload".to_string());

    match TICK_FAULT_HANDLER.get() {
        Some(handler) => handler(&message),
        None => error!("timer tick callback panicked: {message}"),
    }
}

/// Remaining portion of a pending delay after `elapsed` time has already
/// passed, clamped to zero.
///
/// This is the reconfiguration rule: changing the interval of a running
/// timer re-arms it with `remaining_delay(next_delay, elapsed_since_fire)`
/// rather than a full fresh interval.
pub fn remaining_delay(next_delay: Duration, elapsed: Duration) -> Duration {
    next_delay.saturating_sub(elapsed)
}

struct TimerState {
    interval: Duration,
    next_delay: Duration,
    enabled: bool,
    auto_reset: bool,
    /// Time of the last fire (or of enabling, before the first fire).
    last_fire: Instant,
    /// Time the pending delay was last measured from.
    armed_at: Instant,
    /// Absolute fire time the worker is waiting for, while enabled.
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Periodic timer with phase-preserving reconfiguration.
///
/// The callback runs on the timer's own thread, outside the timer lock, so
/// it may freely call back into the timer's setters. Dropping the timer
/// cancels pending fires and joins the thread; an in-flight callback is
/// allowed to finish first.
pub struct DriftTimer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DriftTimer {
    /// Creates a disabled timer firing `tick` every `interval` once enabled.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub fn new(interval: Duration, tick: impl FnMut() + Send + 'static) -> Self {
        assert!(interval > Duration::ZERO, "interval must be greater than 0");

        let now = Instant::now();
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                interval,
                next_delay: interval,
                enabled: false,
                auto_reset: true,
                last_fire: now,
                armed_at: now,
                deadline: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let mut tick = tick;
            std::thread::spawn(move || run_worker(&shared, &mut tick))
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Starts or stops firing. Enabling arms the timer with the current
    /// next-delay measured from now; disabling cancels the pending fire
    /// without destroying the timer. Idempotent.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;
        if enabled {
            let now = Instant::now();
            state.last_fire = now;
            state.armed_at = now;
            state.deadline = Some(now + state.next_delay);
        } else {
            state.deadline = None;
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Returns true while the timer is armed.
    pub fn enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    /// Changes the firing interval. While enabled, the pending fire keeps
    /// its phase: it is re-armed with `remaining_delay(next_delay,
    /// elapsed_since_last_fire)`, not with a fresh full interval.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub fn set_interval(&self, interval: Duration) {
        assert!(interval > Duration::ZERO, "interval must be greater than 0");

        let mut state = self.shared.state.lock();
        if state.interval == interval {
            return;
        }
        state.interval = interval;
        if state.enabled {
            let now = Instant::now();
            let pending = remaining_delay(state.next_delay, now - state.last_fire);
            state.deadline = Some(now + pending);
            trace!(?pending, "interval changed while enabled");
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Current firing interval.
    pub fn interval(&self) -> Duration {
        self.shared.state.lock().interval
    }

    /// Sets the delay until the next fire only; the steady interval is
    /// untouched. While enabled the timer re-arms with the new delay
    /// measured from now.
    pub fn set_next_delay(&self, next_delay: Duration) {
        let mut state = self.shared.state.lock();
        if state.next_delay == next_delay {
            return;
        }
        state.next_delay = next_delay;
        if state.enabled {
            let now = Instant::now();
            state.armed_at = now;
            state.deadline = Some(now + next_delay);
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Time remaining until the next fire while enabled, or the configured
    /// next-delay while disabled.
    pub fn next_delay(&self) -> Duration {
        let state = self.shared.state.lock();
        if state.enabled {
            remaining_delay(state.next_delay, state.armed_at.elapsed())
        } else {
            state.next_delay
        }
    }

    /// When false, the timer fires once and disables itself. Defaults to
    /// true. Changing this while enabled re-arms phase-preserving, like an
    /// interval change.
    pub fn set_auto_reset(&self, auto_reset: bool) {
        let mut state = self.shared.state.lock();
        if state.auto_reset == auto_reset {
            return;
        }
        state.auto_reset = auto_reset;
        if state.enabled {
            let now = Instant::now();
            let pending = remaining_delay(state.next_delay, now - state.last_fire);
            state.deadline = Some(now + pending);
        }
        drop(state);
        self.shared.cond.notify_all();
    }
}

impl Drop for DriftTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.deadline = None;
        }
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: &Shared, tick: &mut (dyn FnMut() + Send)) {
    loop {
        let mut state = shared.state.lock();

        // Park until there is a deadline to chase or we are shut down.
        let deadline = loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                Some(deadline) if state.enabled => break deadline,
                _ => shared.cond.wait(&mut state),
            }
        };

        if Instant::now() < deadline {
            let result = shared.cond.wait_until(&mut state, deadline);
            if !result.timed_out() {
                // Reconfigured or shut down; re-read the state.
                continue;
            }
        }

        // Re-validate: the deadline may have moved while we slept.
        if state.shutdown {
            return;
        }
        if !state.enabled {
            continue;
        }
        match state.deadline {
            Some(current) if current <= Instant::now() => {}
            _ => continue,
        }

        // Fire: reset next-delay to the steady interval and update the
        // phase timestamps before running the callback unlocked.
        let now = Instant::now();
        state.next_delay = state.interval;
        state.last_fire = now;
        state.armed_at = now;
        if state.auto_reset {
            state.deadline = Some(now + state.interval);
        } else {
            state.enabled = false;
            state.deadline = None;
        }
        drop(state);

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| tick())) {
            report_tick_fault(payload.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn remaining_delay_clamps_to_zero() {
        let d = Duration::from_millis;
        assert_eq!(remaining_delay(d(40), d(10)), d(30));
        assert_eq!(remaining_delay(d(40), d(40)), d(0));
        assert_eq!(remaining_delay(d(40), d(100)), d(0));
        assert_eq!(remaining_delay(d(0), d(0)), d(0));
    }

    #[test]
    fn fires_repeatedly_while_enabled() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let timer = DriftTimer::new(Duration::from_millis(10), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timer.set_enabled(true);
        std::thread::sleep(Duration::from_millis(120));
        timer.set_enabled(false);
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 4, "expected several fires, got {fired}");

        // Disabled timers stay quiet.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), fired);
    }

    #[test]
    fn one_shot_fires_once_without_auto_reset() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let timer = DriftTimer::new(Duration::from_millis(10), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timer.set_auto_reset(false);
        timer.set_enabled(true);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.enabled());
    }

    #[test]
    fn zero_next_delay_fires_promptly() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let timer = DriftTimer::new(Duration::from_secs(60), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timer.set_enabled(true);
        timer.set_next_delay(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interval_change_preserves_phase() {
        // With a long interval and an immediate reconfiguration, the
        // pending delay must shrink by the elapsed time, so the first fire
        // happens close to the original schedule, not a fresh interval
        // after the change.
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let timer = DriftTimer::new(Duration::from_millis(60), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timer.set_enabled(true);
        std::thread::sleep(Duration::from_millis(20));
        timer.set_interval(Duration::from_millis(200));
        // Original schedule: ~60ms after enable. A naive re-arm would wait
        // 200ms from the change (~220ms after enable).
        std::thread::sleep(Duration::from_millis(90));
        assert_eq!(count.load(Ordering::SeqCst), 1, "fire kept its phase");
    }

    #[test]
    fn panicking_tick_does_not_stop_the_timer() {
        static FAULTS: AtomicUsize = AtomicUsize::new(0);
        // First registration wins; other tests do not register a handler.
        let _ = set_tick_fault_handler(|_| {
            FAULTS.fetch_add(1, Ordering::SeqCst);
        });

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let timer = DriftTimer::new(Duration::from_millis(10), move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("injected tick fault");
            }
        });
        timer.set_enabled(true);
        std::thread::sleep(Duration::from_millis(100));
        timer.set_enabled(false);

        assert!(FAULTS.load(Ordering::SeqCst) >= 1, "fault was observed");
        assert!(
            count.load(Ordering::SeqCst) >= 2,
            "timer kept firing after the panic"
        );
    }

    #[test]
    fn drop_cancels_pending_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let timer = DriftTimer::new(Duration::from_millis(30), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timer.set_enabled(true);
        drop(timer);
        let after_drop = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), after_drop);
    }
}

//! Frame pacing gate.
//!
//! A [`FrameGate`] turns a [`DriftTimer`](crate::timer::DriftTimer) cadence
//! into a binary, auto-clearing release signal: each timer tick arms the
//! signal, and a decode loop consumes it once per frame hand-off. At most
//! one waiter is released per tick, so a loop that decodes faster than the
//! cadence blocks instead of racing ahead. Additional ticks while the
//! signal is already armed are no-ops, and additional arms are tolerated
//! without corrupting pacing.
//!
//! One process-wide gate paces every pipeline in the process; see
//! [`FrameGate::global`]. Hosts and tests may also run private gates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::timer::DriftTimer;

/// Default pacing cadence, in ticks per second.
pub const DEFAULT_CADENCE_HZ: u32 = 25;

static GLOBAL_GATE: OnceLock<Arc<FrameGate>> = OnceLock::new();

/// Outcome of waiting on the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWait {
    /// A tick released this waiter; proceed with the frame hand-off.
    Released,
    /// The wait ended without a tick: either the caller's stop flag was
    /// raised or the gate itself was stopped. The caller decides whether
    /// that means teardown or unpaced continuation.
    Interrupted,
}

struct GateState {
    signaled: bool,
    running: bool,
}

/// Process-wide periodic release signal pacing frame hand-offs.
pub struct FrameGate {
    state: Mutex<GateState>,
    cond: Condvar,
    timer: Mutex<Option<DriftTimer>>,
    interval: Duration,
}

impl FrameGate {
    /// Creates a stopped gate ticking every `interval` once started.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub fn new(interval: Duration) -> Arc<Self> {
        assert!(interval > Duration::ZERO, "cadence interval must be greater than 0");
        Arc::new(Self {
            state: Mutex::new(GateState {
                signaled: false,
                running: false,
            }),
            cond: Condvar::new(),
            timer: Mutex::new(None),
            interval,
        })
    }

    /// Creates a stopped gate at `hz` ticks per second.
    pub fn with_cadence_hz(hz: u32) -> Arc<Self> {
        Self::new(Duration::from_micros(1_000_000 / u64::from(hz.max(1))))
    }

    /// The shared process-wide gate at the default cadence, started on
    /// first acquisition.
    pub fn global() -> Arc<FrameGate> {
        Arc::clone(GLOBAL_GATE.get_or_init(|| {
            let gate = FrameGate::with_cadence_hz(DEFAULT_CADENCE_HZ);
            gate.start();
            gate
        }))
    }

    /// Tick interval of this gate.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the cadence timer. Idempotent.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }

        let mut timer = self.timer.lock();
        if timer.is_none() {
            let weak: Weak<FrameGate> = Arc::downgrade(self);
            let cadence = DriftTimer::new(self.interval, move || {
                if let Some(gate) = weak.upgrade() {
                    gate.tick();
                }
            });
            cadence.set_enabled(true);
            *timer = Some(cadence);
            debug!(interval_ms = self.interval.as_millis() as u64, "pacing gate started");
        }
    }

    /// Stops the cadence timer and wakes every blocked waiter with
    /// [`GateWait::Interrupted`]. Idempotent, and safe to call while a
    /// decode loop is blocked on [`wait_released`](Self::wait_released).
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.signaled = false;
        }
        self.cond.notify_all();

        // Dropping the timer joins its thread; an in-flight tick finishes
        // against the state lock released above.
        if let Some(cadence) = self.timer.lock().take() {
            cadence.set_enabled(false);
            drop(cadence);
        }
        debug!("pacing gate stopped");
    }

    /// Returns true while the cadence timer is live.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Arms the release signal. Called by the cadence timer; exposed so
    /// tests and bespoke hosts can drive the gate manually. Arming an
    /// already-armed gate is a no-op, which is what bounds releases to at
    /// most one per tick.
    pub fn tick(&self) {
        let mut state = self.state.lock();
        if !state.running {
            // A late tick from a timer already being torn down.
            return;
        }
        state.signaled = true;
        drop(state);
        self.cond.notify_one();
    }

    /// Consumes the release signal without blocking. Returns true if a
    /// tick was pending.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        let was = state.signaled;
        state.signaled = false;
        was
    }

    /// Blocks until the next tick and consumes it.
    ///
    /// The wait re-checks `stop` on every wakeup and at least once per
    /// tick interval, so a raised stop flag interrupts the wait within a
    /// bounded time even if nobody notifies the gate. A stopped gate
    /// interrupts immediately.
    pub fn wait_released(&self, stop: &AtomicBool) -> GateWait {
        let mut state = self.state.lock();
        loop {
            if stop.load(Ordering::Acquire) || !state.running {
                return GateWait::Interrupted;
            }
            if state.signaled {
                state.signaled = false;
                return GateWait::Released;
            }
            self.cond.wait_for(&mut state, self.interval);
        }
    }
}

//! Scheduler tick emulation and idle tick suspension.
//!
//! Once a processor switches to high-resolution mode, the periodic tick is
//! no longer driven by the hardware. Instead, each processor queues a tick
//! emulation timer that fires once per tick period, advances the jiffy
//! counter, and calls the platform's [`on_tick`] hook.
//!
//! While a processor is idle, that timer can be pushed out to the next
//! instant at which something actually has to happen, so that an idle
//! processor is not woken once per tick for nothing. This is controlled by
//! [`HrTimers::stop_tick`] and [`HrTimers::restart_tick`].
//!
//! [`on_tick`]: crate::Platform::on_tick
use crate::{
    base::{spin_mutex, SpinMutex},
    hrtimers::{CpuError, HrTimers, NO_CPU},
    loom::sync::atomic::Ordering::*,
    platform::CpuId,
    time::{dur_to_nanos, ClockId, Duration, Instant},
    timer::{CallbackMode, HrTimer, Mode, Restart},
};

/// Per-processor tick emulation state.
#[derive(Debug)]
pub(crate) struct TickSched {
    pub(crate) timer: HrTimer,
    pub(crate) state: SpinMutex<TickState>,
}

#[derive(Debug, Default)]
pub(crate) struct TickState {
    /// Set once the tick emulation timer is installed and the tick may be
    /// stopped while idle.
    nohz_active: bool,
    tick_stopped: bool,
    idle_entry_time: Instant,
    idle_sleeptime: Duration,
    idle_calls: u64,
    idle_sleeps: u64,
    /// The tick timer's expiry when the tick was stopped.
    idle_tick: Instant,
    /// The jiffy count when the tick was stopped.
    idle_jiffies: u64,
    idle_expires: Option<Instant>,
    idle_ticks: u64,
}

/// A snapshot of a processor's idle tick statistics, returned by
/// [`HrTimers::tick_stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct TickStats {
    /// Whether the tick is currently stopped.
    pub tick_stopped: bool,
    /// The number of times [`HrTimers::stop_tick`] was called while the tick
    /// could be stopped.
    pub idle_calls: u64,
    /// The number of times the tick was actually stopped or pushed out.
    pub idle_sleeps: u64,
    /// The total time spent with the tick stopped.
    pub idle_sleeptime: Duration,
    /// When the processor last entered the idle loop.
    pub idle_entry_time: Instant,
    /// When the tick timer is due while the tick is stopped, or `None` if no
    /// timer was pending when the tick was stopped.
    pub idle_expires: Option<Instant>,
    /// The number of ticks that were skipped while idle.
    pub idle_ticks: u64,
}

/// Jiffy bookkeeping shared by all processors.
#[derive(Debug, Default)]
pub(crate) struct Jiffies {
    pub(crate) count: u64,
    pub(crate) last_update: Instant,
}

// === impl TickSched ===

impl TickSched {
    pub(crate) fn new() -> Self {
        Self {
            timer: HrTimer::new(tick_sched_timer, CallbackMode::InlineImmediate),
            state: spin_mutex(TickState::default()),
        }
    }

    /// Forgets all idle state, for a processor that is going offline.
    pub(crate) fn reset(&self) {
        *self.state.lock() = TickState::default();
    }
}

/// The tick emulation timer's callback.
fn tick_sched_timer(timer: &HrTimer, timers: &HrTimers) -> Restart {
    let Some(cpu) = timer.owner_cpu() else {
        return Restart::Done;
    };
    let now = timers.platform.now();

    // If the processor responsible for the jiffy counter dropped that duty
    // (because its tick was stopped), take it over.
    let _ = timers
        .do_timer_cpu
        .compare_exchange(NO_CPU, cpu, AcqRel, Acquire);
    if timers.do_timer_cpu.load(Acquire) == cpu {
        timers.update_jiffies(now);
    }

    let stopped = {
        let mut state = timers.cpus[cpu].tick.state.lock();
        if state.tick_stopped {
            // Don't account this tick as idle when the tick restarts.
            state.idle_jiffies += 1;
        }
        state.tick_stopped
    };

    timers.platform.on_tick(cpu);

    if stopped {
        return Restart::Done;
    }
    timers.forward(timer, now, timers.config.tick_period());
    Restart::Restart
}

// === impl HrTimers ===

impl HrTimers {
    /// Installs the tick emulation timer on `cpu`, which must be the calling
    /// processor and must have just switched to high-resolution mode.
    pub(crate) fn setup_sched_timer(&self, cpu: CpuId) {
        let ts = &self.cpus[cpu].tick;
        let tick = self.config.tick_period();
        self.init(&ts.timer, ClockId::Monotonic, Mode::Absolute);

        // Stagger the ticks of different processors across half a tick period,
        // so they don't all contend on the jiffy lock at once.
        let last_update = self.jiffies.lock().last_update;
        let stagger = dur_to_nanos(tick) / 2 / self.config.max_cpus() as u64;
        ts.timer
            .set_expires(last_update + Duration::from_nanos(stagger * cpu as u64));

        let mut now = self.platform.now();
        loop {
            self.forward(&ts.timer, now, tick);
            // Safety: the tick timer lives as long as the registry does.
            unsafe { self.start_unchecked(&ts.timer, ts.timer.expires(), Mode::Absolute) };
            if ts.timer.is_queued() {
                break;
            }
            now = self.platform.now();
        }

        if self.config.nohz() {
            ts.state.lock().nohz_active = true;
        }
        debug!(cpu, tick.expires = %ts.timer.expires(), "installed tick emulation timer");
    }

    /// Stops the scheduler tick on the calling processor, if nothing needs
    /// it soon.
    ///
    /// This is called by the idle loop before halting the processor. The
    /// tick is only stopped if the processor is in high-resolution mode,
    /// idle tick suspension is [enabled](crate::Config::with_nohz), and the
    /// platform reports that [no work is pending](crate::Platform::work_pending).
    ///
    /// Rather than firing every tick, the tick emulation timer is moved to the
    /// tick boundary at or before the next pending timer on this processor. If
    /// no timers are pending, it is cancelled outright.
    ///
    /// This may be called multiple times before the tick is restarted, such
    /// as when an interrupt wakes the processor without making work runnable.
    pub fn stop_tick(&self) {
        let cpu = self.current_cpu();
        let base = &self.cpus[cpu];
        let ts = &base.tick;
        let mut state = ts.state.lock();
        let now = self.platform.now();

        if !state.nohz_active || self.platform.work_pending(cpu) {
            return;
        }

        if state.tick_stopped {
            let delta = now - state.idle_entry_time;
            state.idle_sleeptime += delta;
        }
        state.idle_entry_time = now;
        state.idle_calls += 1;

        let (last_update, last_jiffies) = {
            let jiffies = self.jiffies.lock();
            (jiffies.last_update, jiffies.count)
        };
        let next = {
            let inner = base.lock();
            if inner.pending.is_empty() {
                inner.next_expiry_excluding(&ts.timer)
            } else {
                Some(now)
            }
        };
        let tick = dur_to_nanos(self.config.tick_period());
        let delta_ticks = test_dbg!(next.map_or(u64::MAX, |next| {
            next.as_nanos().saturating_sub(last_update.as_nanos()) / tick
        }));

        // Don't bother stopping the tick if the next timer is due within the
        // next tick anyway.
        if delta_ticks == 0 || (!state.tick_stopped && delta_ticks == 1) {
            return;
        }

        if !state.tick_stopped {
            state.idle_tick = ts.timer.expires();
            state.tick_stopped = true;
            state.idle_jiffies = last_jiffies;
        }

        // If this processor maintains the jiffy counter, give that up, so
        // that it is taken over by whichever processor ticks next.
        let _ = self
            .do_timer_cpu
            .compare_exchange(cpu, NO_CPU, AcqRel, Acquire);
        state.idle_sleeps += 1;

        if next.is_none() {
            state.idle_expires = None;
            drop(state);
            debug!(cpu, "no timers pending, cancelling tick");
            self.cancel(&ts.timer);
            return;
        }

        let expires =
            Instant::from_nanos(last_update.as_nanos().saturating_add(delta_ticks.saturating_mul(tick)));
        state.idle_expires = Some(expires);
        // Safety: the tick timer lives as long as the registry does.
        unsafe { self.start_unchecked(&ts.timer, expires, Mode::Absolute) };
        if ts.timer.is_queued() {
            debug!(cpu, idle.expires = %expires, ticks = delta_ticks, "stopped tick");
            return;
        }

        // We crossed a tick boundary while stopping the tick. Account for it
        // and resume ticking.
        drop(state);
        self.update_jiffies(self.platform.now());
        self.restart_tick();
    }

    /// Restarts the scheduler tick on the calling processor, if it was
    /// stopped by [`HrTimers::stop_tick`].
    ///
    /// This is called when leaving the idle loop. The jiffy counter is
    /// advanced past the ticks that were skipped, the idle interval is
    /// accounted, and the tick emulation timer is requeued at the next tick
    /// boundary after the current time.
    pub fn restart_tick(&self) {
        let cpu = self.current_cpu();
        let ts = &self.cpus[cpu].tick;
        let tick = self.config.tick_period();
        let mut state = ts.state.lock();
        if !state.tick_stopped {
            return;
        }

        let mut now = self.platform.now();
        self.update_jiffies(now);

        let idle = now - state.idle_entry_time;
        state.idle_sleeptime += idle;

        let ticks = self.jiffies().saturating_sub(state.idle_jiffies);
        state.idle_ticks += ticks;

        state.tick_stopped = false;
        state.idle_expires = None;
        let idle_tick = state.idle_tick;
        drop(state);

        self.cancel(&ts.timer);
        ts.timer.set_expires(idle_tick);
        loop {
            self.forward(&ts.timer, now, tick);
            // Safety: the tick timer lives as long as the registry does.
            unsafe { self.start_unchecked(&ts.timer, ts.timer.expires(), Mode::Absolute) };
            if ts.timer.is_queued() {
                break;
            }
            // The next tick passed while we were requeueing the timer.
            self.update_jiffies(now);
            now = self.platform.now();
        }

        debug!(cpu, ?idle, ticks, tick.expires = %ts.timer.expires(), "restarted tick");
    }

    /// Returns a snapshot of `cpu`'s idle tick statistics.
    ///
    /// # Errors
    ///
    /// Returns [`CpuError::OutOfRange`] if `cpu` is not a valid processor ID.
    pub fn tick_stats(&self, cpu: CpuId) -> Result<TickStats, CpuError> {
        let state = self.cpu(cpu)?.tick.state.lock();
        Ok(TickStats {
            tick_stopped: state.tick_stopped,
            idle_calls: state.idle_calls,
            idle_sleeps: state.idle_sleeps,
            idle_sleeptime: state.idle_sleeptime,
            idle_entry_time: state.idle_entry_time,
            idle_expires: state.idle_expires,
            idle_ticks: state.idle_ticks,
        })
    }

    /// Returns the number of scheduler ticks since boot.
    #[must_use]
    pub fn jiffies(&self) -> u64 {
        self.jiffies.lock().count
    }

    /// Advances the jiffy counter by the number of whole ticks between its
    /// last update and `now`.
    pub(crate) fn update_jiffies(&self, now: Instant) {
        let tick = dur_to_nanos(self.config.tick_period());
        let mut jiffies = self.jiffies.lock();
        let delta = now.as_nanos().saturating_sub(jiffies.last_update.as_nanos());
        if delta < tick {
            return;
        }
        let ticks = delta / tick;
        jiffies.last_update += Duration::from_nanos(ticks * tick);
        jiffies.count += ticks;
        test_trace!(jiffies = jiffies.count, ticks, "updated jiffies");
    }
}

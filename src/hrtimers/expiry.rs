//! Running expired timers.
//!
//! Expired timers are found in one of two ways. In low-resolution mode,
//! [`HrTimers::run_queues`] runs once per periodic tick and fires everything
//! that expired before it. In high-resolution mode, [`HrTimers::interrupt`]
//! runs when the clock event device fires, and reprograms the device for the
//! next expiry before returning.
use super::{HrTimers, NO_CPU};
use crate::{
    loom::sync::atomic::Ordering::*,
    platform::CpuId,
    time::{ClockId, Instant},
    timer::{CallbackMode, Restart, StateBits},
};

/// Summary of one run of [`HrTimers::interrupt`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Expiry {
    /// The monotonic time the queues were last scanned at.
    pub now: Instant,
    /// The number of callbacks run inline.
    pub fired: usize,
    /// The number of timers moved to the pending deferred list.
    pub deferred: usize,
    /// The number of times the queues were re-scanned because the next expiry
    /// passed while the handler was running.
    pub retries: usize,
    /// Whether the handler gave up re-scanning, and pushed the next event out
    /// instead.
    pub hang_detected: bool,
    /// The instant the clock event device was programmed for, or `None` if no
    /// timers remain queued.
    pub next_event: Option<Instant>,
}

impl Expiry {
    fn new(now: Instant) -> Self {
        Self {
            now,
            fired: 0,
            deferred: 0,
            retries: 0,
            hang_detected: false,
            next_event: None,
        }
    }
}

impl HrTimers {
    /// Handles a clock event interrupt on the calling processor.
    ///
    /// Every timer on this processor whose expiry has passed is removed from
    /// its queue. Timers with [`CallbackMode::Deferred`] are moved to the
    /// pending list, and [`Platform::raise_deferred`] is called once the
    /// handler is done; all other callbacks are run directly, with no locks
    /// held. Finally, the clock event device is programmed for the earliest
    /// remaining expiry.
    ///
    /// If that expiry has already passed by the time the device is
    /// programmed, the queues are scanned again, up to
    /// [`Config::max_reprogram_retries`] times. If the handler still cannot
    /// keep up, it gives up and programs the device a short while into the
    /// future, so that the processor can make progress on other work.
    ///
    /// Calling this on a processor that is not in high-resolution mode does
    /// nothing.
    ///
    /// [`Platform::raise_deferred`]: crate::Platform::raise_deferred
    /// [`Config::max_reprogram_retries`]: crate::Config::max_reprogram_retries
    pub fn interrupt(&self) -> Expiry {
        let cpu = self.current_cpu();
        let base = &self.cpus[cpu];
        let entry_time = self.platform.now();
        let mut expiry = Expiry::new(entry_time);

        let mut inner = base.lock();
        let dev = match self.platform.clock_event(cpu) {
            Some(dev) if inner.hres_active => dev,
            _ => {
                debug!(cpu, "clock event interrupt outside of high resolution mode");
                return expiry;
            }
        };
        inner.stats.nr_events += 1;

        let mut now = entry_time;
        loop {
            expiry.now = now;
            // Timers started by callbacks below may program the device
            // themselves; the device is reprogrammed for the real next
            // expiry once the queues are drained.
            inner.expires_next = None;

            for clock in ClockId::ALL {
                let base_now = now + inner.base(clock).offset;
                loop {
                    let queue = &inner.base(clock).queue;
                    let (Some(first), Some(expires)) = (queue.first(), queue.first_expires())
                    else {
                        break;
                    };
                    if expires > base_now {
                        break;
                    }
                    // Safety: queued timers outlive their membership in the
                    // queue, and we hold the lock.
                    let timer = unsafe { first.as_ref() };
                    if timer.callback_mode() == CallbackMode::Deferred {
                        inner.detach(timer, clock);
                        inner.push_pending(timer);
                        expiry.deferred += 1;
                        continue;
                    }
                    inner = self.run_timer(base, inner, timer, clock, base_now);
                    expiry.fired += 1;
                }
            }

            let next = inner.next_expiry();
            inner.expires_next = next;
            expiry.next_event = next;
            let Some(next) = next else {
                dev.disarm();
                break;
            };
            if dev.arm(next).is_ok() {
                break;
            }

            if expiry.retries >= self.config.max_reprogram_retries() {
                // Give up, and let the processor do something else for a
                // bit before handling the rest.
                let now = self.platform.now();
                let delta = now - entry_time;
                inner.stats.nr_hangs += 1;
                inner.stats.max_hang_time = inner.stats.max_hang_time.max(delta);
                let delay = delta.min(self.config.max_hang_delay());
                let expires = crate::base::program_event(self.platform, dev, now + delay, true);
                inner.expires_next = Some(expires);
                expiry.next_event = Some(expires);
                expiry.hang_detected = true;
                warn!(
                    cpu,
                    ?delta,
                    ?delay,
                    retries = expiry.retries,
                    "hrtimer interrupt could not keep up, deferring next expiry"
                );
                break;
            }

            expiry.retries += 1;
            inner.stats.nr_retries += 1;
            now = self.platform.now();
            test_trace!(cpu, %now, retries = expiry.retries, "next expiry already passed, rescanning");
        }
        drop(inner);

        if expiry.deferred > 0 {
            self.platform.raise_deferred(cpu);
        }
        trace!(cpu, ?expiry, "hrtimer interrupt");
        expiry
    }

    /// Runs the callbacks of every [deferred](CallbackMode::Deferred) timer
    /// that has expired on the calling processor.
    ///
    /// This should be called in response to
    /// [`Platform::raise_deferred`](crate::Platform::raise_deferred), from a
    /// context where it is safe to run arbitrary work. Returns the number of
    /// callbacks that were run.
    pub fn run_deferred(&self) -> usize {
        let cpu = self.current_cpu();
        let base = &self.cpus[cpu];
        let dev = self.platform.clock_event(cpu);
        let mut ran = 0;

        let mut inner = base.lock();
        while let Some(ptr) = inner.pending.pop_front() {
            // Safety: pending timers outlive their membership in the list.
            let timer = unsafe { ptr.as_ref() };
            timer.update_state(|state| {
                state
                    .set(StateBits::PENDING, false)
                    .set(StateBits::CALLBACK, true);
            });
            inner.running = Some(ptr);
            drop(inner);

            trace!(timer.addr = ?format_args!("{:p}", timer), "running deferred timer callback");
            let restart = timer.call(self);
            ran += 1;

            inner = base.lock();
            inner.running = None;
            timer.update_state(|state| {
                state.set(StateBits::CALLBACK, false);
            });

            let clock = timer.clock();
            if restart == Restart::Restart && !timer.is_queued() {
                if let Some(period) = timer.period() {
                    let clock_base = inner.base(clock);
                    let now = clock_base.now(self.platform);
                    let resolution = clock_base.resolution;
                    timer.forward_with_resolution(now, period, resolution);
                }
                inner = self.enqueue_reprogram(base, inner, timer, clock, true);
            } else if timer.owner_cpu() == Some(cpu)
                && inner.hres_active
                && inner.base(clock).queue.first() == Some(ptr)
            {
                // The callback re-armed its own timer. Starting it could not
                // reprogram the device while the callback was running, so do
                // that now.
                let expires = timer.expires() - inner.base(clock).offset;
                if inner.reprogram(expires, dev).is_err() {
                    inner.force_reprogram(self.platform, dev);
                }
            }
        }
        drop(inner);

        if ran > 0 {
            trace!(cpu, ran, "ran deferred timers");
        }
        ran
    }

    /// Runs expired timers on the calling processor while it is in
    /// low-resolution mode.
    ///
    /// This should be called from the periodic tick interrupt. It also
    /// advances the jiffy counter, and is where the switch to
    /// high-resolution mode happens: if [enabled](crate::Config::with_highres)
    /// and the processor's clock event device supports one-shot mode, the
    /// processor switches on the first call and this returns without running
    /// any timers.
    ///
    /// Only timers that expired strictly before the current time are run.
    /// Every callback runs inline, regardless of its [`CallbackMode`].
    ///
    /// Returns the number of callbacks that were run.
    pub fn run_queues(&self) -> usize {
        let cpu = self.current_cpu();
        let base = &self.cpus[cpu];
        if base.lock().hres_active {
            return 0;
        }

        let can_switch = self.config.highres()
            && self
                .platform
                .clock_event(cpu)
                .is_some_and(|dev| dev.supports_oneshot());
        if can_switch && self.switch_to_hres(cpu) {
            return 0;
        }

        let _ = self
            .do_timer_cpu
            .compare_exchange(NO_CPU, cpu, AcqRel, Acquire);
        if self.do_timer_cpu.load(Acquire) == cpu {
            self.update_jiffies(self.platform.now());
        }

        let mut fired = 0;
        let mut inner = base.lock();
        for clock in ClockId::ALL {
            let softirq_time = {
                let base = inner.base(clock);
                base.softirq_time = base.now(self.platform);
                base.softirq_time
            };
            loop {
                let queue = &inner.base(clock).queue;
                let (Some(first), Some(expires)) = (queue.first(), queue.first_expires()) else {
                    break;
                };
                if expires >= softirq_time {
                    break;
                }
                // Safety: queued timers outlive their membership in the queue,
                // and we hold the lock.
                let timer = unsafe { first.as_ref() };
                inner = self.run_timer(base, inner, timer, clock, softirq_time);
                fired += 1;
            }
        }
        fired
    }

    /// Switches `cpu` (the calling processor) to high-resolution mode.
    ///
    /// Returns `true` if the processor is now in high-resolution mode.
    fn switch_to_hres(&self, cpu: CpuId) -> bool {
        let base = &self.cpus[cpu];
        {
            let mut inner = base.lock();
            if inner.hres_active {
                return true;
            }
            if !inner.online {
                return false;
            }
            inner.hres_active = true;
            let resolution = self.config.high_res_resolution();
            for base in inner.bases.iter_mut() {
                base.resolution = resolution;
            }
        }

        self.setup_sched_timer(cpu);
        self.retrigger_next_event();
        info!(
            cpu,
            dev = self.platform.clock_event(cpu).map(|dev| dev.name()),
            resolution = ?self.config.high_res_resolution(),
            "switched to high resolution mode"
        );
        true
    }

    /// Notifies the registry that the realtime clock was set.
    ///
    /// Every online processor refreshes its realtime offset, and the calling
    /// processor reprograms its clock event device, since realtime timers may
    /// now be due earlier or later than they were.
    pub fn clock_was_set(&self) {
        for base in self.cpus.iter().filter(|base| base.is_online()) {
            base.lock().update_offsets(self.platform);
        }
        self.retrigger_next_event();
        debug!(offset = ?self.platform.realtime_offset(), "clock was set");
    }

    /// Recomputes the next expiry on the calling processor and reprograms its
    /// clock event device.
    ///
    /// This is used after resuming from suspend, or after the clock event
    /// device lost its programming. Does nothing in low-resolution mode.
    pub fn retrigger_next_event(&self) {
        let cpu = self.current_cpu();
        let mut inner = self.cpus[cpu].lock();
        if !inner.hres_active {
            return;
        }
        inner.update_offsets(self.platform);
        inner.force_reprogram(self.platform, self.platform.clock_event(cpu));
        test_trace!(cpu, expires_next = ?inner.expires_next, "retriggered next event");
    }
}

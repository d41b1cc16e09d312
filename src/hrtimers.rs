use crate::{
    base::{lock_two, spin_mutex, CpuBase, Inner, SpinGuard, SpinMutex},
    config::Config,
    loom::sync::atomic::{AtomicUsize, Ordering::*},
    platform::{CpuId, Platform},
    tick::Jiffies,
    time::{ClockId, Duration, Instant},
    timer::{decode_owner, CallbackMode, HrTimer, Mode, Restart, StateBits},
};
use alloc::boxed::Box;
use core::{
    fmt,
    ptr::{self, NonNull},
};
use maitake_sync::util::Backoff;

mod expiry;
#[cfg(test)]
mod tests;

pub use self::expiry::Expiry;

/// The processor registry: all per-processor timer state.
///
/// An `HrTimers` owns the timer state for every processor the platform
/// supports, and is the entry point for every timer operation. It is
/// typically stored in a `static` (for example, behind a `OnceCell`) and
/// shared by all processors.
///
/// # Clock bases
///
/// Each processor has one *clock base* per [`ClockId`]. A clock base is an
/// ordered queue of the [`HrTimer`]s started on that processor against that
/// clock, with a cached pointer to the timer that expires first. All of a
/// processor's clock bases are guarded by a single lock, which is never held
/// while a timer callback runs.
///
/// A timer records which clock base owns it. That record is read without
/// holding any lock, so every operation on a timer first locks the processor
/// it names and then checks that the timer still belongs to that processor,
/// retrying if the timer was migrated in the meantime.
///
/// # Resolution modes
///
/// Processors start in *low-resolution* mode, where expired timers are
/// found once per scheduler tick by [`HrTimers::run_queues`]. The first time
/// `run_queues` runs on a processor whose [clock event device] supports
/// one-shot mode, the processor switches to *high-resolution* mode: the
/// device is programmed for the next expiry, [`HrTimers::interrupt`] runs the
/// expired timers when it fires, and the scheduler tick is emulated by a
/// timer. The switch is one-way.
///
/// [clock event device]: crate::ClockEvent
pub struct HrTimers {
    pub(crate) platform: &'static dyn Platform,
    pub(crate) config: Config,
    pub(crate) cpus: Box<[CpuBase]>,
    pub(crate) jiffies: SpinMutex<Jiffies>,
    /// The processor responsible for advancing the jiffy counter, or
    /// [`NO_CPU`].
    pub(crate) do_timer_cpu: AtomicUsize,
}

/// Errors returned by processor lifecycle operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CpuError {
    /// The processor ID is not less than [`Config::max_cpus`].
    #[error("processor {cpu} is out of range (this registry supports {max} processors)")]
    OutOfRange {
        /// The requested processor.
        cpu: CpuId,
        /// The number of processors the registry supports.
        max: usize,
    },
    /// The processor was already online.
    #[error("processor {0} is already online")]
    AlreadyOnline(CpuId),
    /// The processor is not online.
    #[error("processor {0} is not online")]
    NotOnline(CpuId),
    /// A processor cannot migrate its own timers away.
    #[error("processor {0} cannot take itself offline")]
    OfflineSelf(CpuId),
}

/// Error returned by [`HrTimers::try_cancel`] when the timer's callback is
/// currently running.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, thiserror::Error)]
#[error("timer callback is currently running")]
pub struct Busy;

/// A snapshot of a processor's timer state, returned by
/// [`HrTimers::cpu_stats`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct CpuStats {
    /// Whether the processor is online.
    pub online: bool,
    /// Whether the processor is in high-resolution mode.
    pub hres_active: bool,
    /// The instant the processor's clock event device is programmed for.
    pub expires_next: Option<Instant>,
    /// The number of clock event interrupts handled.
    pub nr_events: u64,
    /// The number of times the expiry handler re-scanned its queues because
    /// the next expiry had already passed.
    pub nr_retries: u64,
    /// The number of times the expiry handler gave up re-scanning.
    pub nr_hangs: u64,
    /// The longest time spent in the expiry handler before giving up.
    pub max_hang_time: Duration,
    /// The number of queued timers, per clock, indexed in [`ClockId::ALL`]
    /// order.
    pub queued: [usize; ClockId::COUNT],
    /// The number of timers waiting for [`HrTimers::run_deferred`].
    pub pending: usize,
}

pub(crate) const NO_CPU: usize = usize::MAX;

/// A locked clock base that owns a timer.
struct Locked<'a> {
    base: &'a CpuBase,
    inner: SpinGuard<'a, Inner>,
    clock: ClockId,
}

// === impl HrTimers ===

impl HrTimers {
    /// Returns a new registry for `platform`, with room for
    /// [`Config::max_cpus`] processors.
    ///
    /// All processors start out offline. The platform must call
    /// [`HrTimers::online`] for each processor as it is brought up, including
    /// the boot processor.
    #[must_use]
    pub fn new(platform: &'static dyn Platform, config: Config) -> Self {
        let cpus = (0..config.max_cpus())
            .map(|id| CpuBase::new(id, &config))
            .collect::<Box<[_]>>();
        Self {
            platform,
            config,
            cpus,
            jiffies: spin_mutex(Jiffies::default()),
            do_timer_cpu: AtomicUsize::new(NO_CPU),
        }
    }

    /// Returns this registry's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Brings `cpu` online, with empty clock bases in low-resolution mode.
    ///
    /// # Errors
    ///
    /// - [`CpuError::OutOfRange`] if `cpu` is not a valid processor ID.
    /// - [`CpuError::AlreadyOnline`] if `cpu` is already online.
    pub fn online(&self, cpu: CpuId) -> Result<(), CpuError> {
        let base = self.cpu(cpu)?;
        let mut inner = base.lock();
        if inner.online {
            return Err(CpuError::AlreadyOnline(cpu));
        }
        *inner = Inner::new(&self.config);
        inner.update_offsets(self.platform);
        base.set_online(&mut inner, true);
        drop(inner);
        base.tick.reset();
        info!(cpu, "processor online");
        Ok(())
    }

    /// Takes `dying` offline, migrating all of its timers to the calling
    /// processor.
    ///
    /// This must be called on the processor that takes over `dying`'s timers,
    /// after `dying` has stopped running timer callbacks. Every queued timer
    /// moves to the matching clock base of the calling processor, and every
    /// timer waiting for [`HrTimers::run_deferred`] moves to the calling
    /// processor's pending list.
    ///
    /// # Errors
    ///
    /// - [`CpuError::OutOfRange`] if `dying` is not a valid processor ID.
    /// - [`CpuError::OfflineSelf`] if `dying` is the calling processor.
    /// - [`CpuError::NotOnline`] if `dying` or the calling processor is not
    ///   online.
    pub fn offline(&self, dying: CpuId) -> Result<(), CpuError> {
        let this_cpu = self.current_cpu();
        let old = self.cpu(dying)?;
        if dying == this_cpu {
            return Err(CpuError::OfflineSelf(dying));
        }
        let new = &self.cpus[this_cpu];
        if !new.is_online() {
            return Err(CpuError::NotOnline(this_cpu));
        }
        if !old.is_online() {
            return Err(CpuError::NotOnline(dying));
        }

        // The dying processor's tick emulation dies with it.
        if old.tick.timer.is_bound() {
            self.cancel(&old.tick.timer);
        }
        old.tick.reset();
        let _ = self
            .do_timer_cpu
            .compare_exchange(dying, NO_CPU, AcqRel, Acquire);

        let (mut old_inner, mut new_inner) = lock_two(old, new);
        if !old_inner.online {
            return Err(CpuError::NotOnline(dying));
        }
        debug_assert!(
            old_inner.running.is_none(),
            "processor {dying} is still running a timer callback ({:?}) while going offline",
            old_inner.running,
        );

        let mut migrated = 0;
        let mut deferred = 0;
        old_inner.drain(|timer, clock, pending| {
            timer.set_owner(this_cpu, clock);
            if pending {
                new_inner.push_pending(timer);
                deferred += 1;
            } else {
                new_inner.enqueue(timer, clock);
            }
            migrated += 1;
        });

        *old_inner = Inner::new(&self.config);
        old.set_online(&mut old_inner, false);
        drop(old_inner);

        if new_inner.hres_active {
            new_inner.force_reprogram(self.platform, self.platform.clock_event(this_cpu));
        }
        drop(new_inner);

        if deferred > 0 {
            self.platform.raise_deferred(this_cpu);
        }
        info!(cpu = dying, to = this_cpu, migrated, deferred, "processor offline");
        Ok(())
    }

    /// Binds `timer` to `clock` on the calling processor.
    ///
    /// This must be called before a timer is started for the first time, and
    /// may be called again to change its clock while it is not queued.
    ///
    /// A [relative](Mode::Relative) timer on the [realtime](ClockId::Realtime)
    /// clock is bound to the monotonic clock instead, since a relative
    /// timeout should not be affected by the wall-clock time being set.
    ///
    /// # Panics
    ///
    /// If `timer` is currently queued.
    #[track_caller]
    pub fn init(&self, timer: &HrTimer, clock: ClockId, mode: Mode) {
        assert!(
            !timer.is_queued(),
            "cannot initialize a timer while it is queued"
        );
        let clock = match (clock, mode) {
            (ClockId::Realtime, Mode::Relative) => ClockId::Monotonic,
            (clock, _) => clock,
        };
        let cpu = self.current_cpu();
        timer.set_clock(clock);
        timer.set_owner(cpu, clock);
        trace!(timer.addr = ?format_args!("{:p}", timer), cpu, %clock, "initialized timer");
    }

    /// Starts `timer`, to expire at `expires`.
    ///
    /// If the timer is already queued, it is first removed, so starting a
    /// queued timer is equivalent to cancelling and then starting it.
    ///
    /// The timer is queued on the calling processor, unless its callback is
    /// currently running, in which case it stays on the processor running the
    /// callback.
    ///
    /// Returns `true` if the timer was queued before this call.
    ///
    /// # Panics
    ///
    /// If `timer` was never [initialized](Self::init).
    #[track_caller]
    pub fn start(&self, timer: &'static HrTimer, expires: Instant, mode: Mode) -> bool {
        // Safety: the timer is `'static`, so it outlives its membership in any
        // queue.
        unsafe { self.start_unchecked(timer, expires, mode) }
    }

    /// Starts `timer` again at its current expiry.
    #[track_caller]
    pub fn restart(&self, timer: &'static HrTimer) -> bool {
        self.start(timer, timer.expires(), Mode::Absolute)
    }

    /// Starts a timer that is not `'static`.
    ///
    /// # Safety
    ///
    /// `timer` must not be moved or dropped while it is queued.
    #[track_caller]
    pub(crate) unsafe fn start_unchecked(
        &self,
        timer: &HrTimer,
        expires: Instant,
        mode: Mode,
    ) -> bool {
        let this_cpu = self.current_cpu();
        let mut locked = self.lock_base(timer);
        let was_queued = self.remove_locked(&mut locked, timer, this_cpu);

        let Locked { base, inner, clock } = self.switch_base(timer, locked, this_cpu);
        let expires = match mode {
            Mode::Absolute => expires,
            Mode::Relative => inner.bases[clock.index()].now(self.platform) + expires.as_duration(),
        };
        timer.set_expires(expires);

        // A timer whose callback is running is reprogrammed for by whoever is
        // running the callback, once it returns.
        let reprogram = base.id == this_cpu && !timer.is_callback_running();
        drop(self.enqueue_reprogram(base, inner, timer, clock, reprogram));
        was_queued
    }

    /// Attempts to cancel `timer` without waiting.
    ///
    /// Returns `Ok(true)` if the timer was queued and has been removed, or
    /// `Ok(false)` if it was not queued.
    ///
    /// # Errors
    ///
    /// Returns [`Busy`] if the timer's callback is currently running. The
    /// timer is not modified in that case.
    ///
    /// # Panics
    ///
    /// If `timer` was never [initialized](Self::init).
    #[track_caller]
    pub fn try_cancel(&self, timer: &HrTimer) -> Result<bool, Busy> {
        let this_cpu = self.current_cpu();
        let mut locked = self.lock_base(timer);
        if timer.is_callback_running() {
            return Err(Busy);
        }
        Ok(self.remove_locked(&mut locked, timer, this_cpu))
    }

    /// Cancels `timer`, waiting for its callback to finish if it is running.
    ///
    /// Once this returns, the timer is not queued and its callback is not
    /// running on any processor (unless it is started again concurrently).
    ///
    /// Returns `true` if the timer was active, meaning it was queued or its
    /// callback was running.
    ///
    /// # Panics
    ///
    /// If `timer` was never [initialized](Self::init).
    #[track_caller]
    pub fn cancel(&self, timer: &HrTimer) -> bool {
        let mut backoff = Backoff::new();
        let mut was_running = false;
        loop {
            match self.try_cancel(timer) {
                Ok(was_queued) => return was_queued || was_running,
                Err(Busy) => {
                    was_running = true;
                    backoff.spin();
                }
            }
        }
    }

    /// Forwards `timer`'s expiry past `now` by a whole number of `interval`s,
    /// returning the number of intervals that elapsed (the overrun).
    ///
    /// `interval` is rounded up to the resolution of the timer's clock base.
    /// If the timer does not expire before `now`, nothing happens and `0` is
    /// returned.
    ///
    /// This is intended to be called from a timer's callback, or while the
    /// timer is not queued.
    #[track_caller]
    pub fn forward(&self, timer: &HrTimer, now: Instant, interval: Duration) -> u64 {
        let resolution = {
            let mut locked = self.lock_base(timer);
            locked.inner.base(locked.clock).resolution
        };
        test_dbg!(timer.forward_with_resolution(now, interval, resolution))
    }

    /// Returns the time remaining until `timer` expires, or zero if it
    /// already has.
    #[track_caller]
    pub fn remaining(&self, timer: &HrTimer) -> Duration {
        let mut locked = self.lock_base(timer);
        let now = locked.inner.base(locked.clock).now(self.platform);
        timer.expires() - now
    }

    /// Returns the resolution of `clock` on the calling processor.
    #[must_use]
    pub fn resolution(&self, clock: ClockId) -> Duration {
        let cpu = self.current_cpu();
        self.cpus[cpu].lock().base(clock).resolution
    }

    /// Returns the time until the next timer on the calling processor
    /// expires, or `None` if no timers are queued.
    #[must_use]
    pub fn next_event(&self) -> Option<Duration> {
        let cpu = self.current_cpu();
        let inner = self.cpus[cpu].lock();
        inner
            .bases
            .iter()
            .filter_map(|base| Some(base.queue.first_expires()? - base.now(self.platform)))
            .min()
    }

    /// Returns a snapshot of `cpu`'s timer state.
    ///
    /// # Errors
    ///
    /// Returns [`CpuError::OutOfRange`] if `cpu` is not a valid processor ID.
    pub fn cpu_stats(&self, cpu: CpuId) -> Result<CpuStats, CpuError> {
        let inner = self.cpu(cpu)?.lock();
        Ok(CpuStats {
            online: inner.online,
            hres_active: inner.hres_active,
            expires_next: inner.expires_next,
            nr_events: inner.stats.nr_events,
            nr_retries: inner.stats.nr_retries,
            nr_hangs: inner.stats.nr_hangs,
            max_hang_time: inner.stats.max_hang_time,
            queued: [inner.bases[0].queue.len(), inner.bases[1].queue.len()],
            pending: inner.pending.iter().count(),
        })
    }

    pub(crate) fn cpu(&self, cpu: CpuId) -> Result<&CpuBase, CpuError> {
        self.cpus.get(cpu).ok_or(CpuError::OutOfRange {
            cpu,
            max: self.cpus.len(),
        })
    }

    #[track_caller]
    pub(crate) fn current_cpu(&self) -> CpuId {
        let cpu = self.platform.current_cpu();
        assert!(
            cpu < self.cpus.len(),
            "platform reported processor {cpu}, but only {} are supported",
            self.cpus.len()
        );
        cpu
    }

    /// Locks the processor that owns `timer`.
    ///
    /// The owner is read without holding any lock, and may change while we
    /// wait for the lock, so it is re-checked once the lock is held. If it
    /// changed, or the timer is in the middle of moving between processors,
    /// we back off and try again.
    #[track_caller]
    fn lock_base(&self, timer: &HrTimer) -> Locked<'_> {
        assert!(
            timer.is_bound(),
            "timer must be initialized with `HrTimers::init` before use"
        );
        let mut backoff = Backoff::new();
        loop {
            let key = timer.owner_key();
            if key != HrTimer::MIGRATING {
                let (cpu, clock) = decode_owner(key);
                let base = &self.cpus[cpu];
                let inner = base.lock();
                if test_dbg!(timer.owner_key()) == key {
                    return Locked { base, inner, clock };
                }
                test_trace!(cpu, "timer changed owners while locking, retrying");
            }
            backoff.spin();
        }
    }

    /// Moves `timer` to the calling processor, unless it is already there or
    /// its callback is running.
    fn switch_base<'a>(&'a self, timer: &HrTimer, locked: Locked<'a>, this_cpu: CpuId) -> Locked<'a> {
        if locked.base.id == this_cpu || timer.is_callback_running() {
            return locked;
        }
        let new_base = &self.cpus[this_cpu];
        if !new_base.is_online() {
            return locked;
        }

        let Locked { base, inner, clock } = locked;
        // Concurrent lockers spin until the timer names its new owner.
        timer.set_migrating();
        drop(inner);
        let inner = new_base.lock();
        timer.set_owner(this_cpu, clock);
        trace!(
            timer.addr = ?format_args!("{:p}", timer),
            from = base.id,
            to = this_cpu,
            "switched timer base"
        );
        Locked {
            base: new_base,
            inner,
            clock,
        }
    }

    /// Removes `timer` from its queue or pending list, if it is on one.
    ///
    /// If it was the first timer of a base on the calling processor, the
    /// clock event device is reprogrammed for the new first timer.
    fn remove_locked(&self, locked: &mut Locked<'_>, timer: &HrTimer, this_cpu: CpuId) -> bool {
        if !timer.is_queued() {
            return false;
        }
        let was_first = locked.inner.detach(timer, locked.clock);
        if was_first && locked.base.id == this_cpu && locked.inner.hres_active {
            locked
                .inner
                .force_reprogram(self.platform, self.platform.clock_event(this_cpu));
        }
        true
    }

    /// Queues `timer` on `base`, reprogramming the clock event device if it
    /// became the first timer and `reprogram` is set.
    ///
    /// If the device reports that the timer has already expired, the timer is
    /// not queued, and is instead handled according to its callback mode: an
    /// [`InlineNoRequeue`](CallbackMode::InlineNoRequeue) callback runs right
    /// away, and any other timer is moved to the pending deferred list. The
    /// tick emulation timer is the exception, and is left inactive. This may
    /// release and re-acquire the lock.
    pub(crate) fn enqueue_reprogram<'a>(
        &'a self,
        base: &'a CpuBase,
        mut inner: SpinGuard<'a, Inner>,
        timer: &HrTimer,
        clock: ClockId,
        reprogram: bool,
    ) -> SpinGuard<'a, Inner> {
        let first = inner.enqueue(timer, clock);
        if !(first && reprogram && inner.hres_active) {
            return inner;
        }

        let expires = timer.expires() - inner.bases[clock.index()].offset;
        if inner
            .reprogram(expires, self.platform.clock_event(base.id))
            .is_ok()
        {
            return inner;
        }

        inner.detach(timer, clock);
        match timer.callback_mode() {
            // The tick emulator forwards its timer and retries on its own.
            CallbackMode::InlineImmediate if ptr::eq(timer, &base.tick.timer) => {
                debug!(
                    timer.expires = %timer.expires(),
                    "tick expired while starting; leaving it inactive"
                );
            }
            CallbackMode::InlineNoRequeue => {
                debug!(
                    timer.addr = ?format_args!("{:p}", timer),
                    timer.expires = %timer.expires(),
                    "timer expired while starting; running callback"
                );
                timer.update_state(|state| {
                    state.set(StateBits::CALLBACK, true);
                });
                drop(inner);
                let _restart = timer.call(self);
                debug_assert_eq!(
                    _restart,
                    Restart::Done,
                    "`InlineNoRequeue` timer callbacks may not restart their timer"
                );
                inner = base.lock();
                timer.update_state(|state| {
                    state.set(StateBits::CALLBACK, false);
                });
            }
            CallbackMode::InlineImmediate | CallbackMode::Deferred => {
                debug!(
                    timer.addr = ?format_args!("{:p}", timer),
                    timer.expires = %timer.expires(),
                    "timer expired while starting; deferring callback"
                );
                inner.push_pending(timer);
                self.platform.raise_deferred(base.id);
            }
        }
        inner
    }

    /// Runs an expired timer's callback, releasing the lock while it runs.
    ///
    /// `now` is the time on the timer's clock that it expired against, and
    /// is used to forward periodic timers.
    pub(crate) fn run_timer<'a>(
        &'a self,
        base: &'a CpuBase,
        mut inner: SpinGuard<'a, Inner>,
        timer: &HrTimer,
        clock: ClockId,
        now: Instant,
    ) -> SpinGuard<'a, Inner> {
        inner.detach(timer, clock);
        timer.update_state(|state| {
            state.set(StateBits::CALLBACK, true);
        });
        inner.running = Some(NonNull::from(timer));
        drop(inner);

        trace!(
            timer.addr = ?format_args!("{:p}", timer),
            timer.expires = %timer.expires(),
            %now,
            "running timer callback"
        );
        let restart = timer.call(self);

        let mut inner = base.lock();
        inner.running = None;
        if restart == Restart::Restart && !timer.is_queued() {
            let clock = timer.clock();
            if let Some(period) = timer.period() {
                let resolution = inner.base(clock).resolution;
                timer.forward_with_resolution(now, period, resolution);
            }
            inner.enqueue(timer, clock);
        }
        timer.update_state(|state| {
            state.set(StateBits::CALLBACK, false);
        });
        inner
    }
}

impl fmt::Debug for HrTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrTimers")
            .field("config", &self.config)
            .field("cpus", &self.cpus)
            .field("jiffies", &self.jiffies)
            .field("do_timer_cpu", &self.do_timer_cpu)
            .finish_non_exhaustive()
    }
}

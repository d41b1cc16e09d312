//! Per-processor timer state.
use crate::{
    config::Config,
    loom::sync::atomic::{AtomicBool, Ordering::*},
    platform::{ClockEvent, CpuId, Platform, TooLate},
    tick::TickSched,
    time::{ClockId, Duration, Instant},
    timer::{queue::TimerQueue, HrTimer, StateBits},
};
use cordyceps::List;
use core::{fmt, ptr::NonNull};
use maitake_sync::{
    blocking::{Mutex, MutexGuard},
    spin::Spinlock,
};

/// The lock guarding per-processor state.
///
/// Guards are held across calls that release and re-acquire the lock, so this
/// is a guard-based spinlock rather than the scoped default mutex.
pub(crate) type SpinMutex<T> = Mutex<T, Spinlock>;
pub(crate) type SpinGuard<'a, T> = MutexGuard<'a, T, Spinlock>;

pub(crate) fn spin_mutex<T>(data: T) -> SpinMutex<T> {
    Mutex::new_with_raw_mutex(data, Spinlock::new())
}

/// The timer state of one processor.
///
/// A `CpuBase` lives for as long as the registry does; taking a processor
/// offline empties it but does not free it, so a lock address read from a
/// timer's owner key is always valid.
pub(crate) struct CpuBase {
    pub(crate) id: CpuId,
    /// Mirrors `Inner::online`, so that `start` can decide whether to migrate
    /// a timer here without taking this processor's lock.
    online: AtomicBool,
    pub(crate) inner: SpinMutex<Inner>,
    pub(crate) tick: TickSched,
}

/// The lock-protected part of a [`CpuBase`].
pub(crate) struct Inner {
    pub(crate) online: bool,
    pub(crate) hres_active: bool,
    /// The instant the clock event device is currently programmed for, on the
    /// monotonic clock.
    pub(crate) expires_next: Option<Instant>,
    pub(crate) bases: [ClockBase; ClockId::COUNT],
    /// Expired timers waiting for `run_deferred`.
    pub(crate) pending: List<HrTimer>,
    /// The timer whose callback is currently executing on this processor.
    pub(crate) running: Option<NonNull<HrTimer>>,
    pub(crate) stats: Stats,
}

/// An ordered set of timers sharing one processor and one clock.
pub(crate) struct ClockBase {
    pub(crate) clock: ClockId,
    pub(crate) queue: TimerQueue<HrTimer>,
    pub(crate) resolution: Duration,
    /// The offset of this clock from the monotonic clock.
    pub(crate) offset: Duration,
    /// This clock's time, as of the last low-resolution queue run.
    pub(crate) softirq_time: Instant,
    get_time: fn(&dyn Platform) -> Instant,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Stats {
    pub(crate) nr_events: u64,
    pub(crate) nr_retries: u64,
    pub(crate) nr_hangs: u64,
    pub(crate) max_hang_time: Duration,
}

// === impl CpuBase ===

impl CpuBase {
    pub(crate) fn new(id: CpuId, config: &Config) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            inner: spin_mutex(Inner::new(config)),
            tick: TickSched::new(),
        }
    }

    #[inline]
    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Acquire)
    }

    /// Marks this processor as online or offline. Must be called with `inner`
    /// locked.
    pub(crate) fn set_online(&self, inner: &mut Inner, online: bool) {
        inner.online = online;
        self.online.store(online, Release);
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_, Inner> {
        self.inner.lock()
    }
}

impl fmt::Debug for CpuBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBase")
            .field("id", &self.id)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

/// Locks two distinct processors in ascending ID order, returning the guards
/// in argument order.
pub(crate) fn lock_two<'a>(
    a: &'a CpuBase,
    b: &'a CpuBase,
) -> (SpinGuard<'a, Inner>, SpinGuard<'a, Inner>) {
    debug_assert_ne!(a.id, b.id, "cannot lock a processor twice");
    if a.id < b.id {
        let a = a.lock();
        let b = b.lock();
        (a, b)
    } else {
        let b = b.lock();
        let a = a.lock();
        (a, b)
    }
}

// === impl Inner ===

impl Inner {
    pub(crate) fn new(config: &Config) -> Self {
        let resolution = config.tick_period();
        Self {
            online: false,
            hres_active: false,
            expires_next: None,
            bases: [
                ClockBase::new(ClockId::Monotonic, resolution),
                ClockBase::new(ClockId::Realtime, resolution),
            ],
            pending: List::new(),
            running: None,
            stats: Stats::default(),
        }
    }

    #[inline]
    pub(crate) fn base(&mut self, clock: ClockId) -> &mut ClockBase {
        &mut self.bases[clock.index()]
    }

    /// Inserts `timer` into the queue for `clock`, returning `true` if it
    /// became that queue's first timer.
    pub(crate) fn enqueue(&mut self, timer: &HrTimer, clock: ClockId) -> bool {
        let expires = timer.expires();
        let base = self.base(clock);
        let first = base.queue.insert(NonNull::from(timer), expires);
        timer.update_state(|state| {
            state.set(StateBits::ENQUEUED, true);
        });
        trace!(
            timer.addr = ?format_args!("{:p}", timer),
            timer.expires = %expires,
            %clock,
            first,
            "enqueued timer"
        );
        first
    }

    /// Appends an expired timer to the pending deferred list.
    pub(crate) fn push_pending(&mut self, timer: &HrTimer) {
        self.pending.push_back(NonNull::from(timer));
        timer.update_state(|state| {
            state.set(StateBits::PENDING, true);
        });
    }

    /// Removes `timer` from whichever queue or list it is on, leaving its
    /// callback bit untouched.
    ///
    /// Returns `true` if the timer was the first timer of its clock base.
    pub(crate) fn detach(&mut self, timer: &HrTimer, clock: ClockId) -> bool {
        let ptr = NonNull::from(timer);
        let bits = timer.state_bits();
        let mut was_first = false;
        if bits.get(StateBits::PENDING) {
            // Safety: a timer with the pending bit set is on this processor's
            // pending list, because the bit is only changed under this lock.
            let _removed = unsafe { self.pending.remove(ptr) };
            debug_assert!(_removed.is_some(), "pending timer was not on the pending list");
        } else if bits.get(StateBits::ENQUEUED) {
            let base = self.base(clock);
            was_first = base.queue.first() == Some(ptr);
            // Safety: an enqueued timer is in the queue named by its owner
            // key, which we hold the lock for.
            let _removed = unsafe { base.queue.remove(ptr) };
            debug_assert!(_removed.is_some(), "enqueued timer was not in its queue");
        }
        timer.update_state(|state| {
            state.set(StateBits::ENQUEUED, false).set(StateBits::PENDING, false);
        });
        trace!(
            timer.addr = ?format_args!("{:p}", timer),
            %clock,
            was_first,
            "removed timer"
        );
        was_first
    }

    /// Returns the earliest expiry across all clock bases, on the monotonic
    /// clock.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.bases
            .iter()
            .filter_map(|base| Some(base.queue.first_expires()? - base.offset))
            .min()
    }

    /// Like [`Inner::next_expiry`], but ignoring `skip` (the tick emulation
    /// timer).
    pub(crate) fn next_expiry_excluding(&self, skip: &HrTimer) -> Option<Instant> {
        let skip = NonNull::from(skip);
        self.bases
            .iter()
            .filter_map(|base| {
                let first = base.queue.first()?;
                let first = if first == skip {
                    // Safety: `first` is linked into this queue.
                    unsafe { base.queue.next(first)? }
                } else {
                    first
                };
                // Safety: `first` is linked into this queue, and the queue
                // lock is held.
                let expires = unsafe { first.as_ref() }.expires();
                Some(expires - base.offset)
            })
            .min()
    }

    /// Reprograms the clock event device for a timer that is about to become
    /// the first timer of its base.
    ///
    /// Does nothing if the device is already programmed for an earlier
    /// instant.
    pub(crate) fn reprogram(
        &mut self,
        expires: Instant,
        dev: Option<&dyn ClockEvent>,
    ) -> Result<(), TooLate> {
        if matches!(self.expires_next, Some(next) if expires >= next) {
            return Ok(());
        }
        let Some(dev) = dev else {
            return Ok(());
        };
        dev.arm(expires)?;
        debug!(dev = dev.name(), %expires, "reprogrammed clock event device");
        self.expires_next = Some(expires);
        Ok(())
    }

    /// Recomputes the next expiry from scratch and programs the device with
    /// it, pushing the expiry out if the device reports that it is too late.
    ///
    /// If no timers are left, the device is disarmed.
    pub(crate) fn force_reprogram(&mut self, platform: &dyn Platform, dev: Option<&dyn ClockEvent>) {
        self.expires_next = self.next_expiry();
        let Some(dev) = dev else {
            return;
        };
        match self.expires_next {
            Some(expires) => self.expires_next = Some(program_event(platform, dev, expires, true)),
            None => {
                dev.disarm();
                trace!(dev = dev.name(), "no timers left, disarmed clock event device");
            }
        }
    }

    /// Empties this processor, returning every queued and pending timer to
    /// `f` along with the clock it was queued on.
    pub(crate) fn drain(&mut self, mut f: impl FnMut(&HrTimer, ClockId, bool)) {
        for base in self.bases.iter_mut() {
            while let Some(timer) = base.queue.pop_first() {
                // Safety: queued timers outlive their membership in the queue.
                let timer = unsafe { timer.as_ref() };
                timer.update_state(|state| {
                    state.set(StateBits::ENQUEUED, false);
                });
                f(timer, base.clock, false);
            }
        }
        while let Some(timer) = self.pending.pop_front() {
            let timer = unsafe { timer.as_ref() };
            timer.update_state(|state| {
                state.set(StateBits::PENDING, false);
            });
            f(timer, timer.clock(), true);
        }
    }

    /// Refreshes the cached clock offsets from the platform.
    pub(crate) fn update_offsets(&mut self, platform: &dyn Platform) {
        self.base(ClockId::Realtime).offset = platform.realtime_offset();
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("online", &self.online)
            .field("hres_active", &self.hres_active)
            .field("expires_next", &self.expires_next)
            .field("bases", &self.bases)
            .field("running", &self.running)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// Safety: the raw pointers in `Inner` refer to timers that are either
// `'static` or owned by the registry, and are only dereferenced with the lock
// held.
unsafe impl Send for Inner {}

// === impl ClockBase ===

impl ClockBase {
    fn new(clock: ClockId, resolution: Duration) -> Self {
        let get_time = match clock {
            ClockId::Monotonic => monotonic_time as fn(&dyn Platform) -> Instant,
            ClockId::Realtime => realtime_time,
        };
        Self {
            clock,
            queue: TimerQueue::new(),
            resolution,
            offset: Duration::ZERO,
            softirq_time: Instant::ZERO,
            get_time,
        }
    }

    /// Reads this clock's current time from the platform.
    #[inline]
    pub(crate) fn now(&self, platform: &dyn Platform) -> Instant {
        (self.get_time)(platform)
    }
}

impl fmt::Debug for ClockBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockBase")
            .field("clock", &self.clock)
            .field("queued", &self.queue.len())
            .field("first", &self.queue.first_expires())
            .field("resolution", &self.resolution)
            .field("offset", &self.offset)
            .finish()
    }
}

fn monotonic_time(platform: &dyn Platform) -> Instant {
    platform.now()
}

fn realtime_time(platform: &dyn Platform) -> Instant {
    platform.now() + platform.realtime_offset()
}

/// Programs `dev` to fire at `expires`.
///
/// If the device reports that `expires` has already passed and `force` is
/// set, the device is instead programmed at increasing multiples of its
/// minimum delta from the current time until it accepts. Returns the instant
/// the device was programmed for.
pub(crate) fn program_event(
    platform: &dyn Platform,
    dev: &dyn ClockEvent,
    expires: Instant,
    force: bool,
) -> Instant {
    const MAX_FORCE_ATTEMPTS: u32 = 16;

    if dev.arm(expires).is_ok() || !force {
        return expires;
    }

    let min_delta = dev.min_delta().max(Duration::from_nanos(1));
    let mut delta = min_delta;
    for _ in 0..MAX_FORCE_ATTEMPTS {
        let expires = platform.now() + delta;
        if dev.arm(expires).is_ok() {
            debug!(dev = dev.name(), %expires, ?delta, "force-programmed clock event device");
            return expires;
        }
        delta = delta.saturating_mul(2);
    }

    warn!(
        dev = dev.name(),
        ?delta,
        "clock event device refused every expiry; leaving it unprogrammed"
    );
    expires
}

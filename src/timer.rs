//! High-resolution timers.
//!
//! See the [`HrTimer`] type's documentation for details.
use crate::{
    hrtimers::HrTimers,
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering::*},
    },
    platform::CpuId,
    time::{dur_to_nanos, ClockId, Duration, Instant},
};
use cordyceps::{list, Linked};
use core::{
    fmt,
    marker::PhantomPinned,
    ptr::{self, NonNull},
};

pub mod queue;

/// A timer callback.
///
/// The callback is passed a reference to the timer that fired, and to the
/// registry it fired on, so that it may [forward] or restart the timer.
/// Callbacks run with no locks held, so they may start or cancel any timer,
/// including their own.
///
/// [forward]: HrTimers::forward
pub type TimerFn = fn(&HrTimer, &HrTimers) -> Restart;

/// A high-resolution timer.
///
/// An `HrTimer` is an *intrusive* timer: the queue links are stored inside the
/// timer itself, so starting a timer never allocates. A timer is owned by its
/// user, typically as a `static`:
///
/// ```
/// use hrtimer::{CallbackMode, HrTimer, HrTimers, Restart};
///
/// fn on_timeout(_timer: &HrTimer, _timers: &HrTimers) -> Restart {
///     // ... handle the timeout ...
///     Restart::Done
/// }
///
/// static TIMEOUT: HrTimer = HrTimer::new(on_timeout, CallbackMode::InlineImmediate);
/// ```
///
/// Before a timer is started for the first time, it must be bound to a clock
/// with [`HrTimers::init`]. Afterwards, it is driven entirely through the
/// [`HrTimers`] registry: [`HrTimers::start`] queues it on the calling
/// processor, and [`HrTimers::cancel`] removes it again.
///
/// # States
///
/// A timer is always in one of the states described by [`State`]. Note that a
/// timer whose callback is running may also have been re-queued by that
/// callback; [`HrTimer::state`] reports `CallbackRunning` in that case, while
/// [`HrTimer::is_queued`] returns `true`.
pub struct HrTimer {
    /// Links for the per-clock timer queue.
    node: UnsafeCell<queue::Links<HrTimer>>,

    /// Links for the pending deferred callback list.
    deferred: UnsafeCell<list::Links<HrTimer>>,

    /// The absolute expiry, in nanoseconds on the timer's clock.
    expires: AtomicU64,

    /// The timer's period in nanoseconds, or 0 if it is not periodic.
    period: AtomicU64,

    state: AtomicU8,

    /// The clock base that currently owns this timer, encoded as
    /// `cpu * ClockId::COUNT + clock`.
    ///
    /// This is a lookup key into the registry rather than a pointer, and is
    /// only ever written with the owning processor's lock held.
    owner: AtomicUsize,

    clock: AtomicU8,

    function: TimerFn,
    mode: CallbackMode,

    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

/// Returned by a [`TimerFn`] to indicate whether its timer should be queued
/// again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Restart {
    /// Queue the timer again.
    ///
    /// If the timer has a [period](HrTimer::set_period), its expiry is
    /// forwarded past the current time by that period. Otherwise, the callback
    /// is expected to have set a new expiry itself, using
    /// [`HrTimers::forward`].
    Restart,
    /// The timer is done.
    Done,
}

/// How the expiry passed to [`HrTimers::start`] is interpreted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// The expiry is an absolute instant on the timer's clock.
    Absolute,
    /// The expiry is relative to the clock's current time. The instant's
    /// offset from the clock's epoch is used as the delay, so a relative
    /// expiry is constructed with [`Instant::from_duration`].
    Relative,
}

/// Where a timer's callback is executed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CallbackMode {
    /// The callback runs directly in the expiry handler.
    ///
    /// If the timer is started in high-resolution mode with an expiry that has
    /// already passed, its callback is handed to [`HrTimers::run_deferred`]
    /// instead, since it cannot be run with the lock held.
    InlineImmediate,
    /// The callback runs directly in the expiry handler, and never restarts
    /// its timer.
    ///
    /// If the timer is started with an expiry that has already passed, the
    /// callback is invoked immediately.
    InlineNoRequeue,
    /// The callback is deferred to [`HrTimers::run_deferred`], which runs in a
    /// context where arbitrary work is safe.
    Deferred,
}

/// A snapshot of a timer's state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    /// The timer is not queued and its callback is not running.
    Inactive,
    /// The timer is queued on a clock base, waiting to expire.
    Enqueued,
    /// The timer's callback is currently executing.
    CallbackRunning,
    /// The timer has expired and is waiting for its callback to be run by
    /// [`HrTimers::run_deferred`].
    PendingDeferred,
}

mycelium_bitfield::bitfield! {
    /// The raw state word of an [`HrTimer`].
    #[derive(PartialEq, Eq)]
    pub(crate) struct StateBits<u8> {
        /// If set, the timer is in a clock base's queue.
        pub(crate) const ENQUEUED: bool;

        /// If set, the timer's callback is executing.
        pub(crate) const CALLBACK: bool;

        /// If set, the timer is on a processor's pending deferred list.
        pub(crate) const PENDING: bool;
    }
}

// === impl HrTimer ===

impl HrTimer {
    /// Owner key of a timer that has never been initialized.
    const UNBOUND: usize = usize::MAX;

    /// Owner key of a timer that is moving between processors.
    pub(crate) const MIGRATING: usize = usize::MAX - 1;

    loom_const_fn! {
        /// Returns a new, inactive timer that calls `function` when it expires.
        #[must_use]
        pub fn new(function: TimerFn, mode: CallbackMode) -> HrTimer {
            Self {
                node: UnsafeCell::new(queue::Links::new()),
                deferred: UnsafeCell::new(list::Links::new()),
                expires: AtomicU64::new(0),
                period: AtomicU64::new(0),
                state: AtomicU8::new(0),
                owner: AtomicUsize::new(Self::UNBOUND),
                clock: AtomicU8::new(ClockId::Monotonic as u8),
                function,
                mode,
                _pin: PhantomPinned,
            }
        }
    }

    /// Returns a snapshot of this timer's current [`State`].
    #[must_use]
    pub fn state(&self) -> State {
        let bits = self.state_bits();
        if bits.get(StateBits::CALLBACK) {
            State::CallbackRunning
        } else if bits.get(StateBits::PENDING) {
            State::PendingDeferred
        } else if bits.get(StateBits::ENQUEUED) {
            State::Enqueued
        } else {
            State::Inactive
        }
    }

    /// Returns `true` if this timer is queued, pending, or running its
    /// callback.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state_bits() != StateBits::new()
    }

    /// Returns `true` if this timer is queued on a clock base or waiting on a
    /// pending deferred list.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        let bits = self.state_bits();
        bits.get(StateBits::ENQUEUED) || bits.get(StateBits::PENDING)
    }

    /// Returns `true` if this timer's callback is currently executing.
    #[must_use]
    pub fn is_callback_running(&self) -> bool {
        self.state_bits().get(StateBits::CALLBACK)
    }

    /// Returns this timer's absolute expiry, on its [clock](Self::clock).
    #[must_use]
    pub fn expires(&self) -> Instant {
        Instant::from_nanos(self.expires.load(Acquire))
    }

    /// Returns this timer's period, if it has one.
    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        match self.period.load(Acquire) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Sets this timer's period.
    ///
    /// When a periodic timer's callback returns [`Restart::Restart`], the
    /// timer is forwarded by its period and queued again.
    pub fn set_period(&self, period: Option<Duration>) {
        let nanos = period.map_or(0, |period| dur_to_nanos(period).max(1));
        self.period.store(nanos, Release);
    }

    /// Returns the clock this timer is measured against.
    #[must_use]
    pub fn clock(&self) -> ClockId {
        ClockId::from_index(usize::from(self.clock.load(Acquire)))
    }

    /// Returns the processor whose clock base currently owns this timer, or
    /// `None` if the timer was never initialized or is being migrated.
    #[must_use]
    pub fn owner_cpu(&self) -> Option<CpuId> {
        match self.owner.load(Acquire) {
            Self::UNBOUND | Self::MIGRATING => None,
            key => Some(key / ClockId::COUNT),
        }
    }

    #[inline]
    pub(crate) fn callback_mode(&self) -> CallbackMode {
        self.mode
    }

    #[inline]
    pub(crate) fn call(&self, timers: &HrTimers) -> Restart {
        (self.function)(self, timers)
    }

    #[inline]
    pub(crate) fn is_bound(&self) -> bool {
        self.owner.load(Acquire) != Self::UNBOUND
    }

    #[inline]
    pub(crate) fn owner_key(&self) -> usize {
        self.owner.load(Acquire)
    }

    /// Records the clock base that owns this timer. The owner key may only be
    /// changed while holding the lock of the processor it names (or, when
    /// migrating, the lock of the processor it is leaving).
    #[inline]
    pub(crate) fn set_owner(&self, cpu: CpuId, clock: ClockId) {
        self.owner.store(owner_key(cpu, clock), Release);
    }

    #[inline]
    pub(crate) fn set_migrating(&self) {
        self.owner.store(Self::MIGRATING, Release);
    }

    #[inline]
    pub(crate) fn set_clock(&self, clock: ClockId) {
        self.clock.store(clock as u8, Release);
    }

    #[inline]
    pub(crate) fn set_expires(&self, expires: Instant) {
        self.expires.store(expires.as_nanos(), Release);
    }

    #[inline]
    pub(crate) fn state_bits(&self) -> StateBits {
        StateBits::from_bits(self.state.load(Acquire))
    }

    #[inline]
    pub(crate) fn set_state_bits(&self, bits: StateBits) {
        test_trace!(timer.addr = ?format_args!("{:p}", self), state = ?bits, "HrTimer::set_state");
        self.state.store(bits.0, Release);
    }

    /// Updates this timer's state word. Only called with the owning
    /// processor's lock held.
    #[inline]
    pub(crate) fn update_state(&self, f: impl FnOnce(&mut StateBits)) {
        let mut bits = self.state_bits();
        f(&mut bits);
        self.set_state_bits(bits);
    }

    /// Advances this timer's expiry past `now` in steps of `interval`, which
    /// is rounded up to `resolution`, returning the number of steps taken.
    ///
    /// The arithmetic saturates at [`Instant::MAX`].
    pub(crate) fn forward_with_resolution(
        &self,
        now: Instant,
        interval: Duration,
        resolution: Duration,
    ) -> u64 {
        let expires = self.expires();
        let (expires, overrun) = forward(expires, now, interval, resolution);
        self.set_expires(expires);
        overrun
    }
}

/// Computes the result of forwarding a timer expiring at `expires` past `now`.
pub(crate) fn forward(
    expires: Instant,
    now: Instant,
    interval: Duration,
    resolution: Duration,
) -> (Instant, u64) {
    if expires > now {
        return (expires, 0);
    }

    let step = dur_to_nanos(interval.max(resolution)).max(1);
    let delta = now.as_nanos() - expires.as_nanos();
    let mut overrun = delta / step;
    let mut expires = Instant::from_nanos(
        expires
            .as_nanos()
            .saturating_add(overrun.saturating_mul(step)),
    );
    if expires <= now {
        expires = Instant::from_nanos(expires.as_nanos().saturating_add(step));
        overrun += 1;
    }
    (expires, overrun)
}

#[inline]
pub(crate) const fn owner_key(cpu: CpuId, clock: ClockId) -> usize {
    cpu * ClockId::COUNT + clock.index()
}

/// Decodes an owner key into a processor and a clock.
#[inline]
pub(crate) const fn decode_owner(key: usize) -> (CpuId, ClockId) {
    (key / ClockId::COUNT, ClockId::from_index(key % ClockId::COUNT))
}

impl fmt::Debug for HrTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HrTimer")
            .field("addr", &format_args!("{:p}", self))
            .field("state", &self.state())
            .field("expires", &self.expires())
            .field("period", &self.period())
            .field("clock", &self.clock())
            .field("owner", &self.owner_cpu())
            .field("mode", &self.mode)
            .finish()
    }
}

// Safety: all mutable state of an `HrTimer` is either atomic, or (in the case
// of the intrusive links) only accessed while holding the lock of the
// processor that owns the timer.
unsafe impl Send for HrTimer {}
unsafe impl Sync for HrTimer {}

unsafe impl Linked<queue::Links<HrTimer>> for HrTimer {
    type Handle = NonNull<HrTimer>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<queue::Links<HrTimer>> {
        // Safety: using `ptr::addr_of!` avoids creating a temporary
        // reference, which stacked borrows dislikes.
        let links = ptr::addr_of!((*target.as_ptr()).node);
        (*links).with_mut(|links| {
            // Safety: since the `target` pointer is `NonNull`, we can assume
            // that pointers to its members are also not null, making this use
            // of `new_unchecked` fine.
            NonNull::new_unchecked(links)
        })
    }
}

unsafe impl Linked<list::Links<HrTimer>> for HrTimer {
    type Handle = NonNull<HrTimer>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<HrTimer>> {
        let links = ptr::addr_of!((*target.as_ptr()).deferred);
        (*links).with_mut(|links| NonNull::new_unchecked(links))
    }
}

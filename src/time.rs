//! Instants and clock identities.
use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};
pub use core::time::Duration;

/// A point in time, measured in nanoseconds on some clock.
///
/// Every `Instant` belongs to a [`ClockId`]. Instants on the
/// [monotonic](ClockId::Monotonic) clock count nanoseconds since boot, and are
/// the only instants that are ever handed to a [`ClockEvent`] device. Instants
/// on the [realtime](ClockId::Realtime) clock are offset from the monotonic
/// clock by the platform's [realtime offset].
///
/// Arithmetic on `Instant`s saturates rather than overflowing: the largest
/// representable instant, [`Instant::MAX`], is roughly 584 years after boot,
/// and is treated as "never".
///
/// [`ClockEvent`]: crate::ClockEvent
/// [realtime offset]: crate::Platform::realtime_offset
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Instant(u64);

/// Identifies the clock a timer is measured against.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ClockId {
    /// A monotonically nondecreasing clock that counts time since boot.
    ///
    /// Setting the wall-clock time does not affect timers on this clock.
    Monotonic = 0,
    /// The wall-clock time.
    ///
    /// This clock runs at the same rate as the monotonic clock, but is
    /// offset from it by an amount that may change when the system time is
    /// set. Absolute timers on this clock are re-evaluated when that happens.
    Realtime = 1,
}

// === impl Instant ===

impl Instant {
    /// The earliest representable instant.
    pub const ZERO: Self = Self(0);

    /// The latest representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Returns an `Instant` `nanos` nanoseconds after the clock's epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns an `Instant` `dur` after the clock's epoch, saturating at
    /// [`Instant::MAX`].
    #[must_use]
    pub const fn from_duration(dur: Duration) -> Self {
        Self(dur_to_nanos(dur))
    }

    /// Returns the number of nanoseconds since the clock's epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the [`Duration`] since the clock's epoch.
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or zero if
    /// `earlier` is later than `self`.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or [`None`]
    /// if `earlier` is later than `self`.
    #[must_use]
    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_nanos)
    }

    /// Returns `self + dur`, or [`None`] if that would overflow.
    #[must_use]
    pub fn checked_add(self, dur: Duration) -> Option<Instant> {
        self.0.checked_add(dur_to_nanos(dur)).map(Self)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(dur_to_nanos(rhs)))
    }
}

impl AddAssign<Duration> for Instant {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_sub(dur_to_nanos(rhs)))
    }
}

impl SubAssign<Duration> for Instant {
    #[inline]
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    /// Returns the time elapsed between two instants, saturating at zero.
    #[inline]
    fn sub(self, rhs: Instant) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MAX {
            return f.pad("Instant::MAX");
        }
        write!(f, "Instant({:?})", self.as_duration())
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.as_duration(), f)
    }
}

// === impl ClockId ===

impl ClockId {
    /// The number of distinct clocks.
    pub const COUNT: usize = 2;

    /// All clocks, in index order.
    pub const ALL: [ClockId; Self::COUNT] = [ClockId::Monotonic, ClockId::Realtime];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        match index {
            0 => ClockId::Monotonic,
            1 => ClockId::Realtime,
            _ => panic!("invalid clock index"),
        }
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockId::Monotonic => f.pad("monotonic"),
            ClockId::Realtime => f.pad("realtime"),
        }
    }
}

/// Converts a [`Duration`] to a number of nanoseconds, saturating at
/// [`u64::MAX`].
#[inline]
pub(crate) const fn dur_to_nanos(dur: Duration) -> u64 {
    let nanos = dur.as_nanos();
    if nanos > u64::MAX as u128 {
        u64::MAX
    } else {
        nanos as u64
    }
}

//! Interfaces consumed from the platform layer.
//!
//! The timer core does not talk to hardware directly. Instead, a platform
//! implements [`Platform`], which supplies the current time, the identity of
//! the executing processor, and a per-processor [`ClockEvent`] device that the
//! core programs to interrupt at the next relevant expiry.
use crate::time::{Duration, Instant};
use core::fmt;

/// Identifies a processor. Processor IDs are dense, starting at zero, and
/// bounded by [`Config::max_cpus`](crate::Config::max_cpus).
pub type CpuId = usize;

/// A platform that timers run on.
pub trait Platform: Send + Sync {
    /// Returns the ID of the processor that is currently executing.
    ///
    /// The result must remain accurate for the duration of any call into
    /// [`HrTimers`](crate::HrTimers); callers are expected to disable
    /// preemption (or otherwise prevent migration to another processor) while
    /// calling into the timer core.
    fn current_cpu(&self) -> CpuId;

    /// Returns the current time on the monotonic clock.
    fn now(&self) -> Instant;

    /// Returns the offset of the realtime clock from the monotonic clock.
    ///
    /// The realtime clock reads `now() + realtime_offset()`. When the offset
    /// changes, the platform calls [`HrTimers::clock_was_set`].
    ///
    /// [`HrTimers::clock_was_set`]: crate::HrTimers::clock_was_set
    fn realtime_offset(&self) -> Duration {
        Duration::ZERO
    }

    /// Returns the clock event device local to `cpu`, if it has one.
    ///
    /// A processor without a clock event device stays in low-resolution mode
    /// and relies on the platform calling [`HrTimers::run_queues`] from its
    /// periodic tick.
    ///
    /// [`HrTimers::run_queues`]: crate::HrTimers::run_queues
    fn clock_event(&self, cpu: CpuId) -> Option<&dyn ClockEvent>;

    /// Returns `true` if `cpu` has work that should run soon, in which case
    /// the tick is not stopped when the processor goes idle.
    fn work_pending(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        false
    }

    /// Called on every scheduler tick, on the processor that is ticking.
    ///
    /// This is where a scheduler does its periodic bookkeeping.
    fn on_tick(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Requests that [`HrTimers::run_deferred`] be called on `cpu` soon, from a
    /// context where it is safe to run arbitrary callbacks.
    ///
    /// [`HrTimers::run_deferred`]: crate::HrTimers::run_deferred
    fn raise_deferred(&self, cpu: CpuId) {
        let _ = cpu;
    }
}

/// A per-processor timer interrupt source that can be programmed to fire at a
/// given instant.
pub trait ClockEvent: Send + Sync {
    /// Returns the name of this device, for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns `true` if this device can be programmed to fire once at an
    /// arbitrary instant, rather than only periodically.
    ///
    /// Only processors whose device supports one-shot mode can switch to
    /// high-resolution mode.
    fn supports_oneshot(&self) -> bool;

    /// Returns the smallest delta into the future that this device can be
    /// reliably programmed with.
    fn min_delta(&self) -> Duration;

    /// Programs the device to fire at `expires` (on the monotonic clock).
    ///
    /// Any previously programmed expiry is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`TooLate`] if `expires` had already passed by the time the
    /// device was programmed. In that case, the device will not fire.
    fn arm(&self, expires: Instant) -> Result<(), TooLate>;

    /// Stops the device from firing.
    fn disarm(&self);
}

/// Error returned by [`ClockEvent::arm`] when the requested expiry is already
/// in the past.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, thiserror::Error)]
#[error("clock event expiry is already in the past")]
pub struct TooLate;

impl fmt::Debug for dyn ClockEvent + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockEvent")
            .field("name", &self.name())
            .field("oneshot", &self.supports_oneshot())
            .finish()
    }
}

use super::*;
use crate::{
    loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
    platform::{ClockEvent, TooLate},
    timer::State,
};
use core::cell::Cell;

#[cfg(not(loom))]
std::thread_local! {
    static CPU: Cell<CpuId> = const { Cell::new(0) };
}

#[cfg(loom)]
::loom::thread_local! {
    static CPU: Cell<CpuId> = Cell::new(0);
}

fn set_cpu(cpu: CpuId) {
    CPU.with(|current| current.set(cpu));
}

/// A platform with a manually advanced clock, where every processor shares a
/// single clock event device.
struct Mock {
    now: AtomicU64,
    armed: AtomicU64,
    arms: AtomicUsize,
    raised: AtomicUsize,
}

impl Mock {
    fn leak() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self {
            now: AtomicU64::new(0),
            armed: AtomicU64::new(0),
            arms: AtomicUsize::new(0),
            raised: AtomicUsize::new(0),
        }))
    }

    fn set_now(&self, now: Instant) {
        self.now.store(now.as_nanos(), SeqCst);
    }

    fn armed(&self) -> Instant {
        Instant::from_nanos(self.armed.load(SeqCst))
    }
}

impl Platform for Mock {
    fn current_cpu(&self) -> CpuId {
        CPU.with(Cell::get)
    }

    fn now(&self) -> Instant {
        Instant::from_nanos(self.now.load(SeqCst))
    }

    fn clock_event(&self, _cpu: CpuId) -> Option<&dyn ClockEvent> {
        Some(self)
    }

    fn raise_deferred(&self, _cpu: CpuId) {
        self.raised.fetch_add(1, SeqCst);
    }
}

impl ClockEvent for Mock {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_oneshot(&self) -> bool {
        true
    }

    fn min_delta(&self) -> Duration {
        Duration::from_nanos(1)
    }

    fn arm(&self, expires: Instant) -> Result<(), TooLate> {
        if expires <= Platform::now(self) {
            return Err(TooLate);
        }
        self.armed.store(expires.as_nanos(), SeqCst);
        self.arms.fetch_add(1, SeqCst);
        Ok(())
    }

    fn disarm(&self) {
        self.armed.store(0, SeqCst);
    }
}

fn registry(platform: &'static Mock, cpus: usize) -> &'static HrTimers {
    let timers = alloc::boxed::Box::leak(alloc::boxed::Box::new(HrTimers::new(
        platform,
        Config::new().with_max_cpus(cpus),
    )));
    for cpu in 0..cpus {
        timers.online(cpu).expect("processor should come online");
    }
    timers
}

fn leak_timer(function: crate::TimerFn, mode: CallbackMode) -> &'static HrTimer {
    alloc::boxed::Box::leak(alloc::boxed::Box::new(HrTimer::new(function, mode)))
}

fn noop(_: &HrTimer, _: &HrTimers) -> Restart {
    Restart::Done
}

fn ms(ms: u64) -> Instant {
    Instant::from_nanos(ms * 1_000_000)
}

#[cfg(not(loom))]
mod sequential {
    use super::*;

    #[test]
    fn init_binds_relative_realtime_to_monotonic() {
        let _trace = crate::util::trace_init();
        let timers = registry(Mock::leak(), 1);

        let timer = leak_timer(noop, CallbackMode::InlineImmediate);
        timers.init(timer, ClockId::Realtime, Mode::Relative);
        assert_eq!(timer.clock(), ClockId::Monotonic);
        assert_eq!(timer.owner_cpu(), Some(0));

        timers.init(timer, ClockId::Realtime, Mode::Absolute);
        assert_eq!(timer.clock(), ClockId::Realtime);
    }

    #[test]
    #[should_panic]
    fn start_uninitialized_panics() {
        let timers = registry(Mock::leak(), 1);
        let timer = leak_timer(noop, CallbackMode::InlineImmediate);
        timers.start(timer, ms(10), Mode::Absolute);
    }

    #[test]
    fn start_moves_timer_to_calling_cpu() {
        let _trace = crate::util::trace_init();
        let timers = registry(Mock::leak(), 2);
        let timer = leak_timer(noop, CallbackMode::InlineImmediate);

        set_cpu(0);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        assert!(!timers.start(timer, ms(10), Mode::Absolute));
        assert_eq!(timers.cpu_stats(0).unwrap().queued, [1, 0]);

        set_cpu(1);
        assert!(timers.start(timer, ms(20), Mode::Absolute));
        assert_eq!(timer.owner_cpu(), Some(1));
        assert_eq!(timers.cpu_stats(0).unwrap().queued, [0, 0]);
        assert_eq!(timers.cpu_stats(1).unwrap().queued, [1, 0]);

        assert_eq!(timers.try_cancel(timer), Ok(true));
        assert_eq!(timers.try_cancel(timer), Ok(false));
        assert_eq!(timer.state(), State::Inactive);
        set_cpu(0);
    }

    #[test]
    fn running_callback_pins_timer() {
        let _trace = crate::util::trace_init();
        let timers = registry(Mock::leak(), 2);
        let timer = leak_timer(noop, CallbackMode::InlineImmediate);

        set_cpu(0);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        timer.update_state(|state| {
            state.set(StateBits::CALLBACK, true);
        });

        set_cpu(1);
        timers.start(timer, ms(10), Mode::Absolute);
        assert_eq!(timer.owner_cpu(), Some(0), "timer must stay on the cpu running its callback");
        assert_eq!(timer.state(), State::CallbackRunning);
        assert!(timer.is_queued());
        assert_eq!(timers.try_cancel(timer), Err(Busy));
        assert!(timer.is_queued(), "a busy cancel must not modify the timer");

        timer.update_state(|state| {
            state.set(StateBits::CALLBACK, false);
        });
        assert_eq!(timers.try_cancel(timer), Ok(true));
        set_cpu(0);
    }

    #[test]
    fn relative_start_adds_now() {
        let platform = Mock::leak();
        let timers = registry(platform, 1);
        let timer = leak_timer(noop, CallbackMode::InlineImmediate);

        platform.set_now(ms(100));
        timers.init(timer, ClockId::Monotonic, Mode::Relative);
        timers.start(timer, Instant::from_duration(Duration::from_millis(5)), Mode::Relative);
        assert_eq!(timer.expires(), ms(105));
        assert_eq!(timers.remaining(timer), Duration::from_millis(5));
        assert_eq!(timers.next_event(), Some(Duration::from_millis(5)));

        platform.set_now(ms(200));
        assert_eq!(timers.remaining(timer), Duration::ZERO);
    }

    #[test]
    fn removing_first_timer_reprograms() {
        let _trace = crate::util::trace_init();
        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;

        let a = leak_timer(noop, CallbackMode::InlineImmediate);
        let b = leak_timer(noop, CallbackMode::InlineImmediate);
        timers.init(a, ClockId::Monotonic, Mode::Absolute);
        timers.init(b, ClockId::Monotonic, Mode::Absolute);

        timers.start(b, ms(30), Mode::Absolute);
        assert_eq!(platform.armed(), ms(30));
        timers.start(a, ms(20), Mode::Absolute);
        assert_eq!(platform.armed(), ms(20));

        assert!(timers.cancel(a));
        assert_eq!(platform.armed(), ms(30));
        assert_eq!(timers.cpu_stats(0).unwrap().expires_next, Some(ms(30)));
    }

    #[test]
    fn cancelling_last_timer_disarms_device() {
        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;

        let timer = leak_timer(noop, CallbackMode::InlineImmediate);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        timers.start(timer, ms(20), Mode::Absolute);
        assert_eq!(platform.armed(), ms(20));

        assert!(timers.cancel(timer));
        assert_eq!(platform.armed(), Instant::ZERO, "device should be disarmed");
        assert_eq!(timers.cpu_stats(0).unwrap().expires_next, None);
    }

    #[test]
    fn interrupt_disarms_device_when_queues_empty() {
        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;

        let timer = leak_timer(noop, CallbackMode::InlineImmediate);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        timers.start(timer, ms(20), Mode::Absolute);

        platform.set_now(ms(20));
        let expiry = timers.interrupt();
        assert_eq!(expiry.fired, 1);
        assert_eq!(expiry.next_event, None);
        assert_eq!(platform.armed(), Instant::ZERO, "device should be disarmed");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn offline_with_running_callback_panics() {
        let timers = registry(Mock::leak(), 2);
        let timer = leak_timer(noop, CallbackMode::InlineImmediate);
        timers.cpus[1].lock().running = Some(core::ptr::NonNull::from(timer));

        set_cpu(0);
        let _ = timers.offline(1);
    }

    #[test]
    fn expired_start_inline_immediate() {
        static FIRED: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        fn callback(_: &HrTimer, _: &HrTimers) -> Restart {
            FIRED.fetch_add(1, SeqCst);
            Restart::Done
        }

        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;
        platform.set_now(ms(100));

        let timer = leak_timer(callback, CallbackMode::InlineImmediate);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        timers.start(timer, ms(50), Mode::Absolute);
        // the callback cannot run under the lock, so it is handed off
        assert_eq!(timer.state(), State::PendingDeferred);
        assert_eq!(platform.raised.load(SeqCst), 1);
        assert_eq!(FIRED.load(SeqCst), 0);

        assert_eq!(timers.run_deferred(), 1);
        assert_eq!(FIRED.load(SeqCst), 1);
        assert_eq!(timer.state(), State::Inactive);
    }

    #[test]
    fn expired_tick_start_is_left_inactive() {
        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;
        platform.set_now(ms(100));

        let tick = &timers.cpus[0].tick.timer;
        timers.init(tick, ClockId::Monotonic, Mode::Absolute);
        // Safety: the tick timer lives as long as the leaked registry.
        unsafe { timers.start_unchecked(tick, ms(50), Mode::Absolute) };
        assert_eq!(tick.state(), State::Inactive);
        assert_eq!(platform.raised.load(SeqCst), 0);
        assert_eq!(timers.cpu_stats(0).unwrap().pending, 0);
    }

    #[test]
    fn expired_start_inline_no_requeue() {
        static FIRED: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        fn callback(timer: &HrTimer, _: &HrTimers) -> Restart {
            assert_eq!(timer.state(), State::CallbackRunning);
            FIRED.fetch_add(1, SeqCst);
            Restart::Done
        }

        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;
        platform.set_now(ms(100));

        let timer = leak_timer(callback, CallbackMode::InlineNoRequeue);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        timers.start(timer, ms(50), Mode::Absolute);
        assert_eq!(FIRED.load(SeqCst), 1);
        assert_eq!(timer.state(), State::Inactive);
    }

    #[test]
    fn expired_start_deferred() {
        static FIRED: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        fn callback(_: &HrTimer, _: &HrTimers) -> Restart {
            FIRED.fetch_add(1, SeqCst);
            Restart::Done
        }

        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;
        platform.set_now(ms(100));

        let timer = leak_timer(callback, CallbackMode::Deferred);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        timers.start(timer, ms(50), Mode::Absolute);
        assert_eq!(timer.state(), State::PendingDeferred);
        assert_eq!(platform.raised.load(SeqCst), 1);
        assert_eq!(FIRED.load(SeqCst), 0);
        assert_eq!(timers.cpu_stats(0).unwrap().pending, 1);

        assert_eq!(timers.run_deferred(), 1);
        assert_eq!(FIRED.load(SeqCst), 1);
        assert_eq!(timer.state(), State::Inactive);
    }

    #[test]
    fn cancel_pending_deferred() {
        let platform = Mock::leak();
        let timers = registry(platform, 1);
        timers.cpus[0].lock().hres_active = true;
        platform.set_now(ms(100));

        let timer = leak_timer(noop, CallbackMode::Deferred);
        timers.init(timer, ClockId::Monotonic, Mode::Absolute);
        timers.start(timer, ms(50), Mode::Absolute);
        assert_eq!(timer.state(), State::PendingDeferred);

        assert!(timers.cancel(timer));
        assert_eq!(timer.state(), State::Inactive);
        assert_eq!(timers.run_deferred(), 0);
    }

    #[test]
    fn cpu_errors() {
        let timers = registry(Mock::leak(), 2);
        set_cpu(0);
        assert_eq!(
            timers.online(5),
            Err(CpuError::OutOfRange { cpu: 5, max: 2 })
        );
        assert_eq!(timers.online(1), Err(CpuError::AlreadyOnline(1)));
        assert_eq!(timers.offline(0), Err(CpuError::OfflineSelf(0)));
        assert_eq!(timers.offline(1), Ok(()));
        assert_eq!(timers.offline(1), Err(CpuError::NotOnline(1)));
        assert_eq!(timers.online(1), Ok(()));
        assert!(timers.cpu_stats(7).is_err());
        assert!(timers.tick_stats(7).is_err());
    }

    #[test]
    fn registry_is_send_sync() {
        crate::util::test::assert_send_sync::<HrTimers>();
        crate::util::test::assert_send_sync::<HrTimer>();
    }
}

#[cfg(loom)]
mod concurrent {
    use super::*;
    use crate::loom::{model, thread};

    #[test]
    fn start_races_cancel() {
        model(|| {
            let timers = registry(Mock::leak(), 2);
            let timer = leak_timer(noop, CallbackMode::InlineImmediate);
            set_cpu(0);
            timers.init(timer, ClockId::Monotonic, Mode::Absolute);
            timers.start(timer, ms(10), Mode::Absolute);

            let thread = thread::spawn(move || {
                set_cpu(1);
                timers.start(timer, ms(20), Mode::Absolute);
            });
            timers.cancel(timer);
            thread.join().unwrap();

            // Whichever operation won, the timer is in at most one queue, and
            // that queue belongs to its owner.
            let queued: usize = (0..2)
                .map(|cpu| timers.cpu_stats(cpu).unwrap().queued.iter().sum::<usize>())
                .sum();
            if timer.is_queued() {
                assert_eq!(queued, 1);
                assert_eq!(timer.owner_cpu(), Some(1));
                assert_eq!(timers.cpu_stats(1).unwrap().queued, [1, 0]);
            } else {
                assert_eq!(queued, 0);
            }
        });
    }

    #[test]
    fn concurrent_starts_from_two_cpus() {
        model(|| {
            let timers = registry(Mock::leak(), 2);
            let timer = leak_timer(noop, CallbackMode::InlineImmediate);
            set_cpu(0);
            timers.init(timer, ClockId::Monotonic, Mode::Absolute);

            let thread = thread::spawn(move || {
                set_cpu(1);
                timers.start(timer, ms(20), Mode::Absolute);
            });
            timers.start(timer, ms(10), Mode::Absolute);
            thread.join().unwrap();

            assert!(timer.is_queued());
            let owner = timer.owner_cpu().expect("timer should have an owner");
            let stats = timers.cpu_stats(owner).unwrap();
            assert_eq!(stats.queued, [1, 0]);
        });
    }
}

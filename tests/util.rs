#![allow(dead_code)]

use hrtimer::{ClockEvent, Config, CpuId, Duration, HrTimers, Instant, Platform, TooLate};
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::SeqCst},
        Arc, Mutex,
    },
};

std::thread_local! {
    static CPU: Cell<CpuId> = const { Cell::new(0) };
}

pub fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .try_init();
}

/// Runs `f` as though it were executing on `cpu`.
pub fn on_cpu<T>(cpu: CpuId, f: impl FnOnce() -> T) -> T {
    let prev = CPU.with(|current| current.replace(cpu));
    let result = f();
    CPU.with(|current| current.set(prev));
    result
}

pub fn ms(ms: u64) -> Instant {
    Instant::from_nanos(ms * 1_000_000)
}

/// A platform whose clock only moves when a test advances it.
#[derive(Debug)]
pub struct TestPlatform {
    now: Arc<AtomicU64>,
    realtime_offset: AtomicU64,
    devices: Vec<TestDevice>,
    pub work_pending: AtomicBool,
    pub ticks: Vec<AtomicUsize>,
    pub deferred_raised: Vec<AtomicUsize>,
}

/// A one-shot clock event device that records what it was armed with.
#[derive(Debug)]
pub struct TestDevice {
    now: Arc<AtomicU64>,
    oneshot: bool,
    armed: Mutex<Option<Instant>>,
    arms: AtomicUsize,
    /// The number of upcoming `arm` calls to refuse, regardless of expiry.
    refuse: AtomicUsize,
}

impl TestPlatform {
    pub fn new(cpus: usize) -> &'static Self {
        Self::with_oneshot(cpus, true)
    }

    pub fn with_oneshot(cpus: usize, oneshot: bool) -> &'static Self {
        let now = Arc::new(AtomicU64::new(0));
        let devices = (0..cpus)
            .map(|_| TestDevice {
                now: now.clone(),
                oneshot,
                armed: Mutex::new(None),
                arms: AtomicUsize::new(0),
                refuse: AtomicUsize::new(0),
            })
            .collect();
        Box::leak(Box::new(Self {
            now,
            realtime_offset: AtomicU64::new(0),
            devices,
            work_pending: AtomicBool::new(false),
            ticks: (0..cpus).map(|_| AtomicUsize::new(0)).collect(),
            deferred_raised: (0..cpus).map(|_| AtomicUsize::new(0)).collect(),
        }))
    }

    pub fn set_now(&self, now: Instant) {
        self.now.store(now.as_nanos(), SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, SeqCst);
    }

    pub fn set_realtime_offset(&self, offset: Duration) {
        self.realtime_offset.store(offset.as_nanos() as u64, SeqCst);
    }

    pub fn device(&self, cpu: CpuId) -> &TestDevice {
        &self.devices[cpu]
    }

    pub fn ticks(&self, cpu: CpuId) -> usize {
        self.ticks[cpu].load(SeqCst)
    }

    pub fn deferred_raised(&self, cpu: CpuId) -> usize {
        self.deferred_raised[cpu].load(SeqCst)
    }
}

impl Platform for TestPlatform {
    fn current_cpu(&self) -> CpuId {
        CPU.with(Cell::get)
    }

    fn now(&self) -> Instant {
        Instant::from_nanos(self.now.load(SeqCst))
    }

    fn realtime_offset(&self) -> Duration {
        Duration::from_nanos(self.realtime_offset.load(SeqCst))
    }

    fn clock_event(&self, cpu: CpuId) -> Option<&dyn ClockEvent> {
        self.devices.get(cpu).map(|dev| dev as &dyn ClockEvent)
    }

    fn work_pending(&self, _cpu: CpuId) -> bool {
        self.work_pending.load(SeqCst)
    }

    fn on_tick(&self, cpu: CpuId) {
        self.ticks[cpu].fetch_add(1, SeqCst);
    }

    fn raise_deferred(&self, cpu: CpuId) {
        self.deferred_raised[cpu].fetch_add(1, SeqCst);
    }
}

impl TestDevice {
    pub fn armed(&self) -> Option<Instant> {
        *self.armed.lock().unwrap()
    }

    pub fn arms(&self) -> usize {
        self.arms.load(SeqCst)
    }

    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, SeqCst);
    }
}

impl ClockEvent for TestDevice {
    fn name(&self) -> &'static str {
        "test"
    }

    fn supports_oneshot(&self) -> bool {
        self.oneshot
    }

    fn min_delta(&self) -> Duration {
        Duration::from_micros(1)
    }

    fn arm(&self, expires: Instant) -> Result<(), TooLate> {
        let refused = self
            .refuse
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused || expires.as_nanos() <= self.now.load(SeqCst) {
            return Err(TooLate);
        }
        *self.armed.lock().unwrap() = Some(expires);
        self.arms.fetch_add(1, SeqCst);
        Ok(())
    }

    fn disarm(&self) {
        *self.armed.lock().unwrap() = None;
    }
}

/// Returns a registry with every processor online, all in low-resolution
/// mode.
pub fn registry(platform: &'static TestPlatform, config: Config) -> &'static HrTimers {
    let timers = Box::leak(Box::new(HrTimers::new(platform, config)));
    for cpu in 0..config.max_cpus() {
        timers.online(cpu).expect("processor should come online");
    }
    timers
}

/// Returns a registry with every processor online and switched to
/// high-resolution mode.
///
/// The tick period is one second, so that tick emulation stays out of the way
/// of tests that don't care about it.
pub fn hres_registry(platform: &'static TestPlatform, cpus: usize) -> &'static HrTimers {
    let config = Config::new()
        .with_max_cpus(cpus)
        .with_tick_period(Duration::from_secs(1));
    let timers = registry(platform, config);
    for cpu in 0..cpus {
        on_cpu(cpu, || {
            assert_eq!(timers.run_queues(), 0);
            assert!(timers.cpu_stats(cpu).unwrap().hres_active);
        });
    }
    timers
}

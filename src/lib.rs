//! Per-CPU high-resolution timers.
//!
//! This crate implements the core of a kernel's high-resolution timer
//! subsystem: per-CPU [clock bases] holding ordered queues of [`HrTimer`]s, a
//! protocol for reprogramming a one-shot [clock event device] to the next
//! relevant expiry, switching from periodic low-resolution ticks to
//! high-resolution mode, migrating timers off of processors that go offline,
//! and suspending the periodic scheduler tick while a processor is idle.
//!
//! # Overview
//!
//! All state lives in an explicit [`HrTimers`] registry, indexed by processor
//! ID. The registry is driven by a [`Platform`] implementation, which provides
//! the current time, the identity of the processor that is currently
//! executing, and a [`ClockEvent`] device for each processor.
//!
//! ```text
//!  HrTimers ─┬─ CpuBase 0 ─┬─ ClockBase (monotonic) ── TimerQueue ── HrTimer...
//!            │             ├─ ClockBase (realtime)  ── TimerQueue ── HrTimer...
//!            │             ├─ pending deferred list
//!            │             └─ tick emulation timer + idle bookkeeping
//!            └─ CpuBase 1 ─ ...
//! ```
//!
//! Timers are *intrusive*: the storage for a [`HrTimer`] is owned by its user,
//! and enqueueing one never allocates. Because a queued timer is referenced by
//! the queue, the safe API requires timers to be `&'static` (for example, a
//! `static` item or a leaked allocation).
//!
//! # Driving the timers
//!
//! The platform layer is responsible for calling into the registry at the
//! right times:
//!
//! - [`HrTimers::online`] and [`HrTimers::offline`] on processor hotplug,
//! - [`HrTimers::run_queues`] from the periodic tick interrupt while a
//!   processor is still in low-resolution mode,
//! - [`HrTimers::interrupt`] from the clock event interrupt once a processor is
//!   in high-resolution mode,
//! - [`HrTimers::run_deferred`] when [`Platform::raise_deferred`] was called,
//!   from a context where it is safe to run arbitrary callbacks,
//! - [`HrTimers::stop_tick`] and [`HrTimers::restart_tick`] when entering and
//!   leaving the idle loop.
//!
//! [clock bases]: HrTimers#clock-bases
//! [clock event device]: ClockEvent
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), no_std)]
#![warn(missing_debug_implementations)]
extern crate alloc;
#[macro_use]
extern crate tracing;

#[macro_use]
pub(crate) mod util;
pub(crate) mod loom;

mod base;
pub mod config;
mod hrtimers;
pub mod platform;
mod tick;
pub mod time;
pub mod timer;

pub use self::{
    config::{Config, ConfigError},
    hrtimers::{Busy, CpuError, CpuStats, Expiry, HrTimers},
    platform::{ClockEvent, CpuId, Platform, TooLate},
    tick::TickStats,
    time::{ClockId, Duration, Instant},
    timer::{CallbackMode, HrTimer, Mode, Restart, State, TimerFn},
};

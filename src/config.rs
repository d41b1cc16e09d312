//! Registry configuration.
use crate::time::Duration;
use alloc::string::{String, ToString};

/// Configures a [`HrTimers`](crate::HrTimers) registry.
///
/// A `Config` is constructed with [`Config::new`] and customized using the
/// `with_*` builder methods, all of which are `const fn`s, so a configuration
/// may be declared in a `static` or `const` item:
///
/// ```
/// use hrtimer::{Config, Duration};
///
/// const CONFIG: Config = Config::new()
///     .with_max_cpus(4)
///     .with_tick_period(Duration::from_millis(10))
///     .with_nohz(false);
/// # assert_eq!(CONFIG.max_cpus(), 4);
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Config {
    max_cpus: usize,
    tick_period: Duration,
    high_res_resolution: Duration,
    highres: bool,
    nohz: bool,
    max_reprogram_retries: usize,
    max_hang_delay: Duration,
}

/// Errors returned by [`Config::from_cmdline`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A boot parameter was not recognized.
    #[error("unknown timer parameter `{0}`")]
    UnknownParam(String),
    /// A boolean parameter was neither `on` nor `off`.
    #[error("invalid value `{value}` for `{param}` (expected `on` or `off`)")]
    InvalidSwitch {
        /// The parameter name.
        param: &'static str,
        /// The value that could not be parsed.
        value: String,
    },
    /// The `hz=` parameter was not a positive integer.
    #[error("invalid tick frequency `{0}`")]
    InvalidHz(String),
}

impl Config {
    /// The default tick period, corresponding to a tick rate of 250 Hz.
    pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(4);

    /// The default resolution of clock bases in high-resolution mode.
    pub const DEFAULT_HIGH_RES_RESOLUTION: Duration = Duration::from_nanos(1);

    /// Returns a new `Config` with the default settings.
    ///
    /// By default, a single processor is supported, the tick period is
    /// [`Config::DEFAULT_TICK_PERIOD`], and both high-resolution mode and idle
    /// tick suspension are enabled.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_cpus: 1,
            tick_period: Self::DEFAULT_TICK_PERIOD,
            high_res_resolution: Self::DEFAULT_HIGH_RES_RESOLUTION,
            highres: true,
            nohz: true,
            max_reprogram_retries: 3,
            max_hang_delay: Duration::from_millis(100),
        }
    }

    /// Sets the maximum number of processors. Processor IDs range from `0` to
    /// `max_cpus - 1`.
    ///
    /// # Panics
    ///
    /// If `max_cpus` is zero.
    #[must_use]
    #[track_caller]
    pub const fn with_max_cpus(self, max_cpus: usize) -> Self {
        assert!(max_cpus > 0, "at least one processor is required");
        Self { max_cpus, ..self }
    }

    /// Sets the period of the scheduler tick.
    ///
    /// In low-resolution mode, this is also the resolution of every clock
    /// base.
    ///
    /// # Panics
    ///
    /// If `tick_period` is zero.
    #[must_use]
    #[track_caller]
    pub const fn with_tick_period(self, tick_period: Duration) -> Self {
        assert!(!tick_period.is_zero(), "tick period must be non-zero");
        Self {
            tick_period,
            ..self
        }
    }

    /// Sets the resolution of clock bases once a processor has switched to
    /// high-resolution mode.
    #[must_use]
    #[track_caller]
    pub const fn with_high_res_resolution(self, resolution: Duration) -> Self {
        assert!(!resolution.is_zero(), "resolution must be non-zero");
        Self {
            high_res_resolution: resolution,
            ..self
        }
    }

    /// Sets whether processors may switch to high-resolution mode.
    #[must_use]
    pub const fn with_highres(self, highres: bool) -> Self {
        Self { highres, ..self }
    }

    /// Sets whether the scheduler tick may be stopped while idle.
    #[must_use]
    pub const fn with_nohz(self, nohz: bool) -> Self {
        Self { nohz, ..self }
    }

    /// Sets how many times the expiry handler re-scans the clock bases when the
    /// clock event device reports that the next expiry is already in the past,
    /// before treating the situation as a hang.
    #[must_use]
    pub const fn with_max_reprogram_retries(self, retries: usize) -> Self {
        Self {
            max_reprogram_retries: retries,
            ..self
        }
    }

    /// Sets the upper bound on how long the device is deferred after a hang.
    #[must_use]
    pub const fn with_max_hang_delay(self, delay: Duration) -> Self {
        Self {
            max_hang_delay: delay,
            ..self
        }
    }

    /// Parses whitespace-separated boot parameters, starting from the default
    /// configuration.
    ///
    /// The following parameters are understood:
    ///
    /// - `highres=on|off`: enable or disable high-resolution mode,
    /// - `nohz=on|off`: enable or disable stopping the tick while idle,
    /// - `hz=<n>`: set the tick frequency in Hz.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a parameter is unknown or its value is
    /// invalid.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        cmdline
            .split_whitespace()
            .try_fold(Self::new(), |config, param| config.apply_param(param))
    }

    fn apply_param(self, param: &str) -> Result<Self, ConfigError> {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| ConfigError::UnknownParam(param.to_string()))?;
        match key {
            "highres" => Ok(self.with_highres(parse_switch("highres", value)?)),
            "nohz" => Ok(self.with_nohz(parse_switch("nohz", value)?)),
            "hz" => {
                let hz = value
                    .parse::<u64>()
                    .ok()
                    .filter(|&hz| hz > 0 && hz <= 1_000_000_000)
                    .ok_or_else(|| ConfigError::InvalidHz(value.to_string()))?;
                Ok(self.with_tick_period(Duration::from_nanos(1_000_000_000 / hz)))
            }
            _ => Err(ConfigError::UnknownParam(key.to_string())),
        }
    }

    /// Returns the maximum number of processors.
    #[must_use]
    pub const fn max_cpus(&self) -> usize {
        self.max_cpus
    }

    /// Returns the period of the scheduler tick.
    #[must_use]
    pub const fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Returns the resolution of clock bases in high-resolution mode.
    #[must_use]
    pub const fn high_res_resolution(&self) -> Duration {
        self.high_res_resolution
    }

    /// Returns whether high-resolution mode is enabled.
    #[must_use]
    pub const fn highres(&self) -> bool {
        self.highres
    }

    /// Returns whether stopping the tick while idle is enabled.
    #[must_use]
    pub const fn nohz(&self) -> bool {
        self.nohz
    }

    /// Returns the expiry handler's re-scan limit.
    #[must_use]
    pub const fn max_reprogram_retries(&self) -> usize {
        self.max_reprogram_retries
    }

    /// Returns the upper bound on the post-hang device delay.
    #[must_use]
    pub const fn max_hang_delay(&self) -> Duration {
        self.max_hang_delay
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_switch(param: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(ConfigError::InvalidSwitch {
            param,
            value: value.to_string(),
        }),
    }
}

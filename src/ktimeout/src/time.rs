//! Tick-based time values and engine configuration
use core::fmt;

/// A signed tick count, used for relative time spans.
pub type Ticks = i64;

/// The tick count passed to [`PortTimer::set_timeout`] (after conversion to
/// `i32`) when there is no deadline to wait for.
///
/// [`PortTimer::set_timeout`]: crate::PortTimer::set_timeout
pub const TICKS_FOREVER: Ticks = -1;

/// [`TICKS_FOREVER`] in the representation used by the tick source interface.
pub(crate) const TICKS_FOREVER_32: i32 = TICKS_FOREVER as i32;

/// The amount of time a timeout operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Never expire. Scheduling a timeout with this value is a no-op.
    Forever,
    /// Expire as soon as possible. Equivalent to `Ticks(0)`, which is rounded
    /// up to the next tick.
    NoWait,
    /// Expire after the specified number of ticks, counted from now. Values
    /// below `1` are rounded up to `1`.
    Ticks(Ticks),
    /// Expire when the tick counter reaches the specified value. A deadline
    /// in the past expires on the next tick.
    AbsTicks(u64),
}

impl Timeout {
    /// Get a flag indicating whether `self` is [`Timeout::Forever`].
    #[inline]
    pub const fn is_forever(self) -> bool {
        matches!(self, Self::Forever)
    }

    /// Get a flag indicating whether `self` is [`Timeout::NoWait`] or an
    /// equivalent relative timeout.
    #[inline]
    pub const fn is_no_wait(self) -> bool {
        matches!(self, Self::NoWait | Self::Ticks(0))
    }
}

/// An absolute point on the tick counter at which a timeout ends.
///
/// Obtained by [`TimeoutEngine::timepoint_calc`]. Storing a `Timepoint`
/// instead of a relative [`Timeout`] lets a caller resume an interrupted wait
/// without extending it.
///
/// [`TimeoutEngine::timepoint_calc`]: crate::TimeoutEngine::timepoint_calc
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timepoint {
    tick: u64,
}

impl Timepoint {
    /// The time point that is never reached.
    pub const FOREVER: Self = Self { tick: u64::MAX };

    /// The time point that has always been reached.
    pub const NO_WAIT: Self = Self { tick: 0 };

    /// Construct a `Timepoint` from an absolute tick count.
    #[inline]
    pub const fn from_tick(tick: u64) -> Self {
        Self { tick }
    }

    /// Get the absolute tick count.
    #[inline]
    pub const fn tick(self) -> u64 {
        self.tick
    }

    #[inline]
    pub const fn is_forever(self) -> bool {
        self.tick == u64::MAX
    }

    /// Get a flag indicating whether `self` has been reached at tick `now`.
    #[inline]
    pub const fn is_expired(self, now: u64) -> bool {
        !self.is_forever() && self.tick <= now
    }
}

impl fmt::Debug for Timepoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_forever() {
            f.write_str("Timepoint(FOREVER)")
        } else {
            f.debug_tuple("Timepoint").field(&self.tick).finish()
        }
    }
}

/// Engine configuration.
///
/// These correspond to kernel build options; they are fixed for the lifetime
/// of a [`TimeoutEngine`].
///
/// [`TimeoutEngine`]: crate::TimeoutEngine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The tick rate, used to convert between ticks and milliseconds.
    pub ticks_per_sec: u32,

    /// The tick source only interrupts when a deadline is due and reports
    /// unannounced ticks through [`PortTimer::elapsed`].
    ///
    /// When this is `false`, the tick source is assumed to announce every
    /// tick and [`PortTimer::elapsed`] is never consulted.
    ///
    /// [`PortTimer::elapsed`]: crate::PortTimer::elapsed
    pub tickless: bool,

    /// Request [`TICKS_FOREVER`] instead of the largest representable wait
    /// when nothing is pending, letting the tick source stop entirely.
    pub sloppy_idle: bool,

    /// More than one CPU may program the tick source.
    /// [`TimeoutEngine::set_timeout_expiry`] then always reprograms it.
    ///
    /// [`TimeoutEngine::set_timeout_expiry`]: crate::TimeoutEngine::set_timeout_expiry
    pub smp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            ticks_per_sec: 100,
            tickless: true,
            sloppy_idle: false,
            smp: false,
        }
    }

    pub const fn with_ticks_per_sec(self, ticks_per_sec: u32) -> Self {
        assert!(ticks_per_sec != 0, "`ticks_per_sec` must not be zero");
        Self {
            ticks_per_sec,
            ..self
        }
    }

    pub const fn with_tickless(self, tickless: bool) -> Self {
        Self { tickless, ..self }
    }

    pub const fn with_sloppy_idle(self, sloppy_idle: bool) -> Self {
        Self {
            sloppy_idle,
            ..self
        }
    }

    pub const fn with_smp(self, smp: bool) -> Self {
        Self { smp, ..self }
    }

    /// The wait requested from the tick source when nothing is pending. Also
    /// the saturation point of every requested wait.
    #[inline]
    pub const fn max_wait(&self) -> i32 {
        if self.sloppy_idle {
            TICKS_FOREVER_32
        } else {
            i32::MAX
        }
    }

    /// Convert milliseconds to ticks, rounding up. Saturates at `u64::MAX`.
    pub const fn ms_to_ticks_ceil(&self, ms: u64) -> u64 {
        let hz = self.ticks_per_sec as u128;
        let ticks = (ms as u128 * hz + 999) / 1000;
        if ticks > u64::MAX as u128 {
            u64::MAX
        } else {
            ticks as u64
        }
    }

    /// Convert ticks to milliseconds, rounding down. Saturates at `u64::MAX`.
    pub const fn ticks_to_ms_floor(&self, ticks: u64) -> u64 {
        let ms = ticks as u128 * 1000 / self.ticks_per_sec as u128;
        if ms > u64::MAX as u128 {
            u64::MAX
        } else {
            ms as u64
        }
    }

    /// Construct a relative [`Timeout`] that lasts at least `ms` milliseconds.
    pub const fn timeout_ms(&self, ms: u64) -> Timeout {
        let ticks = self.ms_to_ticks_ceil(ms);
        if ticks == 0 {
            Timeout::NoWait
        } else if ticks > Ticks::MAX as u64 {
            Timeout::Ticks(Ticks::MAX)
        } else {
            Timeout::Ticks(ticks as Ticks)
        }
    }
}

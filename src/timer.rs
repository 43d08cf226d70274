//! Clock — monotonic scheduler time over a wrapping hardware counter
//!
//! The hardware exposes a 32-bit free-running tick counter. [`Clock`] samples
//! it and folds every delta into a 64-bit running total, adding one full
//! counter period whenever a sample is lower than the previous one.
//! [`Time`] is the fixed-point value type handed to the rest of the kernel:
//! arithmetic stays in ticks and only converts to seconds at the boundary.
//!
//! Author: Moroya Sakamoto

use core::fmt;
use core::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

use crate::config::{ROLLOVER_TICKS, TIMER_HZ};

/// Hardware timer peripheral contract
///
/// Only [`Clock`] calls into this. Sampling takes `&mut self` so that
/// simulated timers can advance on every read.
pub trait HardwareTimer {
    /// Start counting
    fn enable(&mut self);
    /// Stop counting
    fn disable(&mut self);
    /// Zero the counter
    fn reset(&mut self);
    /// Configure free-running mode (count up, wrap at 2^32, no interrupt)
    fn set_free_running(&mut self);
    /// Current raw counter value
    fn read_raw_ticks(&mut self) -> u32;
}

/// Convert a tick count to seconds
#[inline]
pub fn ticks_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / TIMER_HZ as f64
}

/// Fixed-point time value in hardware ticks
///
/// Used both for absolute readings (seconds since scheduler start) and
/// for intervals. Addition and subtraction saturate, so [`Time::MAX`] can
/// stand in for "no bound".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(i64);

impl Time {
    /// Scheduler epoch / empty interval
    pub const ZERO: Time = Time(0);
    /// Effectively infinite
    pub const MAX: Time = Time(i64::MAX);

    /// From raw ticks
    pub const fn from_ticks(ticks: i64) -> Self {
        Time(ticks)
    }

    /// From seconds
    pub fn from_secs(secs: f64) -> Self {
        Time((secs * TIMER_HZ as f64) as i64)
    }

    /// From milliseconds
    pub const fn from_millis(ms: i64) -> Self {
        Time(ms * TIMER_HZ / 1_000)
    }

    /// From microseconds
    pub const fn from_micros(us: i64) -> Self {
        Time(us * TIMER_HZ / 1_000_000)
    }

    /// Raw ticks
    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Value in seconds
    pub fn as_secs(self) -> f64 {
        ticks_to_seconds(self.0)
    }

    /// Midpoint of two values
    pub const fn average(self, other: Time) -> Time {
        Time(self.0 / 2 + other.0 / 2 + (self.0 % 2 + other.0 % 2) / 2)
    }
}

impl Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        Time(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        *self = *self + rhs;
    }
}

impl Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        Time(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Time {
    fn sub_assign(&mut self, rhs: Time) {
        *self = *self - rhs;
    }
}

impl Mul<i64> for Time {
    type Output = Time;
    fn mul(self, rhs: i64) -> Time {
        Time(self.0.saturating_mul(rhs))
    }
}

/// Fractional scaling (backoff defaults, boosting)
impl Mul<f64> for Time {
    type Output = Time;
    fn mul(self, rhs: f64) -> Time {
        Time((self.0 as f64 * rhs) as i64)
    }
}

impl Div<i64> for Time {
    type Output = Time;
    fn div(self, rhs: i64) -> Time {
        Time(self.0 / rhs)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs())
    }
}

/// Monotonic scheduler clock
///
/// Must be sampled from one place (the scheduler loop); the rollover
/// detection relies on consecutive samples being coherent.
pub struct Clock<T: HardwareTimer> {
    timer: T,
    /// Raw counter value at the previous sample
    last_raw: u32,
    /// Ticks since the clock was first started
    running: i64,
    /// Detected counter wraparounds
    rollovers: u32,
    started: bool,
}

impl<T: HardwareTimer> Clock<T> {
    /// Wrap a hardware timer. The timer is not touched until [`Clock::start`].
    pub const fn new(timer: T) -> Self {
        Self {
            timer,
            last_raw: 0,
            running: 0,
            rollovers: 0,
            started: false,
        }
    }

    /// Put the timer into free-running mode from zero
    ///
    /// The running total is kept, so restarting never moves time backwards.
    pub fn start(&mut self) {
        self.timer.disable();
        self.timer.reset();
        self.timer.set_free_running();
        self.timer.enable();
        self.last_raw = 0;
        self.started = true;
    }

    /// Has the timer been configured?
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Seconds since scheduler start, as ticks
    pub fn now(&mut self) -> Time {
        if !self.started {
            self.start();
        }
        let raw = self.timer.read_raw_ticks();
        if raw < self.last_raw {
            self.running += ROLLOVER_TICKS;
            self.rollovers += 1;
        }
        self.running += raw as i64 - self.last_raw as i64;
        self.last_raw = raw;
        Time(self.running)
    }

    /// Number of counter wraparounds seen so far
    pub fn rollovers(&self) -> u32 {
        self.rollovers
    }

    /// Underlying timer
    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Underlying timer (mutable, for simulated time)
    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }
}

/// Software counter for host runs and tests
///
/// Every read advances the counter by `step` ticks so that a scheduler loop
/// with nothing to do still observes time passing.
#[derive(Debug, Clone)]
pub struct SoftwareTimer {
    ticks: u32,
    step: u32,
    enabled: bool,
}

impl SoftwareTimer {
    /// One tick per read
    pub const fn new() -> Self {
        Self::with_step(1)
    }

    /// `step` ticks per read
    pub const fn with_step(step: u32) -> Self {
        Self {
            ticks: 0,
            step,
            enabled: false,
        }
    }

    /// Advance by raw ticks (wraps like the hardware)
    pub fn advance(&mut self, ticks: u32) {
        if self.enabled {
            self.ticks = self.ticks.wrapping_add(ticks);
        }
    }

    /// Advance by a time interval, wrapping as often as needed
    pub fn advance_by(&mut self, interval: Time) {
        let mut remaining = interval.ticks();
        while remaining > 0 {
            let chunk = remaining.min(u32::MAX as i64);
            self.advance(chunk as u32);
            remaining -= chunk;
        }
    }

    /// Force the raw counter (e.g. just below the wrap point)
    pub fn set_raw(&mut self, ticks: u32) {
        self.ticks = ticks;
    }

    /// Raw counter without advancing
    pub fn raw(&self) -> u32 {
        self.ticks
    }

    /// Is the counter running?
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for SoftwareTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareTimer for SoftwareTimer {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn reset(&mut self) {
        self.ticks = 0;
    }

    fn set_free_running(&mut self) {}

    fn read_raw_ticks(&mut self) -> u32 {
        if self.enabled {
            self.ticks = self.ticks.wrapping_add(self.step);
        }
        self.ticks
    }
}

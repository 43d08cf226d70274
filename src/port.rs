//! Cortex-M port — DWT cycle counter as the scheduler timer
//!
//! The DWT counter runs at the core clock. [`DwtTimer`] rescales it to
//! [`TIMER_HZ`] ticks and presents a 32-bit counter that wraps like the
//! dedicated timer peripheral would, so [`Clock`](crate::Clock) sees the
//! same contract on every target. It must be sampled at least once per
//! 2^32 core cycles, and the core must run at [`TIMER_HZ`] or faster: a
//! slower core cannot be scaled up and the clock then runs slow.
//!
//! Author: Moroya Sakamoto

use cortex_m::peripheral::{DCB, DWT};

use crate::config::TIMER_HZ;
use crate::timer::HardwareTimer;

/// Free-running timer backed by the DWT cycle counter
pub struct DwtTimer {
    dcb: DCB,
    dwt: DWT,
    /// Core cycles per scheduler tick
    divider: u64,
    /// Cycle count at the previous sample
    last_cycles: u32,
    /// Cycles not yet converted to a whole tick
    remainder: u64,
    /// Scaled counter handed to the clock
    ticks: u32,
}

impl DwtTimer {
    /// Take ownership of the trace peripherals. `core_hz` is the CPU clock.
    pub fn new(dcb: DCB, dwt: DWT, core_hz: u32) -> Self {
        Self {
            dcb,
            dwt,
            divider: tick_divider(core_hz),
            last_cycles: 0,
            remainder: 0,
            ticks: 0,
        }
    }

    /// Give the peripherals back
    pub fn free(self) -> (DCB, DWT) {
        (self.dcb, self.dwt)
    }
}

/// Core cycles per scheduler tick, at least one
///
/// Warns when the core is too slow to produce [`TIMER_HZ`] ticks.
pub fn tick_divider(core_hz: u32) -> u64 {
    let divider = core_hz as u64 / TIMER_HZ as u64;
    if divider == 0 {
        log::warn!(
            "core clock {} Hz is below the {} Hz scheduler tick; time will run slow",
            core_hz,
            TIMER_HZ
        );
        1
    } else {
        divider
    }
}

impl HardwareTimer for DwtTimer {
    fn enable(&mut self) {
        self.dcb.enable_trace();
        self.dwt.enable_cycle_counter();
    }

    fn disable(&mut self) {
        self.dwt.disable_cycle_counter();
    }

    fn reset(&mut self) {
        self.dwt.set_cycle_count(0);
        self.last_cycles = 0;
        self.remainder = 0;
        self.ticks = 0;
    }

    fn set_free_running(&mut self) {}

    fn read_raw_ticks(&mut self) -> u32 {
        let cycles = DWT::cycle_count();
        self.remainder += cycles.wrapping_sub(self.last_cycles) as u64;
        self.last_cycles = cycles;
        let whole = self.remainder / self.divider;
        self.remainder -= whole * self.divider;
        self.ticks = self.ticks.wrapping_add(whole as u32);
        self.ticks
    }
}

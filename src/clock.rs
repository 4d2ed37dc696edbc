//! Monotonic system time
//!
//! A single periodic SysTick interrupt drives a single tick counter for the
//! whole program. The counter gives coarse, tick-quantized milliseconds;
//! best-effort microsecond timestamps are recovered by combining the tick
//! count with the live hardware down-counter. Timestamps wrap at their
//! integer width, so intervals must be computed with the wrap-safe
//! [`elapsed_ticks`]/[`elapsed_ms`]/[`elapsed_us`] helpers, never with
//! signed subtraction.
//!
//! ```ignore
//! use stm32f446_hal::clock::{self, Clock, TickCounter};
//! use stm32f446_hal::time::U32Ext;
//!
//! static TICKS: TickCounter = TickCounter::new();
//!
//! let clock = Clock::new(cp.SYST, rcc.clocks.sysclk(), 1_000.us(), &TICKS, &mut cp.SCB, 4)
//!     .unwrap();
//!
//! let start = clock.now_ms();
//! // ...
//! let waited = clock::elapsed_ms(clock.now_ms(), start);
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::time::{Hertz, MicroSeconds};

/// The SysTick reload register supports values between 1 and 0x00FF_FFFF (24 bits)
const MAX_RELOAD: u32 = 0x00FF_FFFF;

/// Attempts at a consistent tick/down-counter sample before falling back to
/// tick-only resolution
const SAMPLE_RETRIES: u32 = 3;

/// Clock configuration errors
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The tick period is shorter than one core clock cycle
    PeriodTooShort,
    /// The tick period does not fit the 24-bit reload register
    PeriodTooLong,
}

/// Monotonic tick count shared between the SysTick handler and foreground
/// code
///
/// The handler is the sole writer. One instance serves the whole program;
/// the board layer keeps it in a `static`.
pub struct TickCounter(AtomicU32);

impl TickCounter {
    /// A counter starting at zero
    pub const fn new() -> Self {
        TickCounter(AtomicU32::new(0))
    }

    /// ISR entry point: one increment, nothing else
    #[inline]
    pub fn tick(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }

    /// Current tick count; wraps at the integer width
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the reload value for one tick of `period_us` at `sysclk`
fn reload_value(sysclk: u32, period_us: u32) -> Result<u32, Error> {
    let cycles = u64::from(sysclk) * u64::from(period_us) / 1_000_000;
    if cycles == 0 {
        return Err(Error::PeriodTooShort);
    }
    let reload = cycles - 1;
    if reload > u64::from(MAX_RELOAD) {
        return Err(Error::PeriodTooLong);
    }
    Ok(reload as u32)
}

/// Milliseconds represented by `ticks` tick periods, truncated
fn ticks_to_ms(ticks: u32, period_us: u32) -> u32 {
    (u64::from(ticks) * u64::from(period_us) / 1_000) as u32
}

/// Combine the coarse tick count with a down-counter sample.
///
/// The tick counter is read on both sides of the down-counter; a pair that
/// disagrees means a tick boundary was crossed mid-sample, so the cycle
/// count cannot be attributed to either tick and the sample is retried.
/// Execution is bounded: after the retry budget the result degrades to
/// tick-only resolution instead of looping.
fn compose_us(
    mut tick_count: impl FnMut() -> u32,
    mut countdown: impl FnMut() -> u32,
    reload: u32,
    sysclk: u32,
    period_us: u32,
) -> u64 {
    for _ in 0..SAMPLE_RETRIES {
        let before = tick_count();
        let val = countdown();
        let after = tick_count();

        if before == after {
            // VAL counts down from the reload value within each tick
            let elapsed_cycles = reload - val;
            let us_in_tick = u64::from(elapsed_cycles) * 1_000_000 / u64::from(sysclk);
            return u64::from(before) * u64::from(period_us) + us_in_tick;
        }
    }

    u64::from(tick_count()) * u64::from(period_us)
}

/// System timer (SysTick) as a monotonic clock
///
/// Owning the SYST peripheral here dedicates it to timekeeping; it cannot
/// double as a blocking delay source.
pub struct Clock {
    syst: SYST,
    ticks: &'static TickCounter,
    reload: u32,
    sysclk: Hertz,
    tick_period_us: u32,
}

impl Clock {
    /// Configure SysTick to interrupt every `period` and drive `ticks`
    ///
    /// The matching vector handler must forward to [`TickCounter::tick`].
    pub fn new(
        mut syst: SYST,
        sysclk: Hertz,
        period: MicroSeconds,
        ticks: &'static TickCounter,
        scb: &mut SCB,
        priority: u8,
    ) -> Result<Self, Error> {
        let reload = reload_value(sysclk.0, period.0)?;

        syst.disable_counter();
        syst.set_clock_source(SystClkSource::Core);
        syst.set_reload(reload);
        syst.clear_current();

        unsafe {
            scb.set_priority(
                SystemHandler::SysTick,
                priority << (8 - crate::NVIC_PRIO_BITS),
            );
        }

        syst.enable_interrupt();
        syst.enable_counter();

        Ok(Clock {
            syst,
            ticks,
            reload,
            sysclk,
            tick_period_us: period.0,
        })
    }

    /// Ticks elapsed since the clock started; wraps at the integer width
    pub fn now_ticks(&self) -> u32 {
        self.ticks.count()
    }

    /// Milliseconds since the clock started, quantized to the tick period
    pub fn now_ms(&self) -> u32 {
        ticks_to_ms(self.ticks.count(), self.tick_period_us)
    }

    /// Best-effort microseconds since the clock started
    ///
    /// Sub-tick resolution comes from the hardware down-counter, guarded by
    /// a bounded consistency check; see [`compose_us`] for the sampling
    /// scheme.
    pub fn now_us(&self) -> u64 {
        compose_us(
            || self.ticks.count(),
            SYST::get_current,
            self.reload,
            self.sysclk.0,
            self.tick_period_us,
        )
    }

    /// Releases the system timer (SysTick) resource
    pub fn free(mut self) -> SYST {
        self.syst.disable_interrupt();
        self.syst.disable_counter();
        self.syst
    }
}

/// Wrap-safe difference between two tick readings
pub fn elapsed_ticks(now: u32, start: u32) -> u32 {
    now.wrapping_sub(start)
}

/// Wrap-safe difference between two millisecond timestamps
pub fn elapsed_ms(now_ms: u32, start_ms: u32) -> u32 {
    now_ms.wrapping_sub(start_ms)
}

/// Wrap-safe difference between two microsecond timestamps
pub fn elapsed_us(now_us: u64, start_us: u64) -> u64 {
    now_us.wrapping_sub(start_us)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_for_1ms_at_16mhz() {
        assert_eq!(reload_value(16_000_000, 1_000), Ok(15_999));
    }

    #[test]
    fn reload_rejects_out_of_range_periods() {
        // shorter than one core cycle
        assert_eq!(reload_value(16_000_000, 0), Err(Error::PeriodTooShort));
        assert_eq!(reload_value(400_000, 1), Err(Error::PeriodTooShort));
        // does not fit 24 bits
        assert_eq!(
            reload_value(16_000_000, 2_000_000),
            Err(Error::PeriodTooLong)
        );
    }

    #[test]
    fn hundred_ticks_of_1ms_read_as_100ms() {
        let ticks = TickCounter::new();
        for _ in 0..100 {
            ticks.tick();
        }
        assert_eq!(ticks.count(), 100);
        assert_eq!(ticks_to_ms(ticks.count(), 1_000), 100);
    }

    #[test]
    fn sub_ms_ticks_quantize_down() {
        // 100 ticks of 100 us land on the previous whole millisecond
        assert_eq!(ticks_to_ms(100, 100), 10);
        assert_eq!(ticks_to_ms(105, 100), 10);
    }

    #[test]
    fn us_composition_combines_tick_and_cycles() {
        // 1600 cycles into tick 5 at 16 MHz is 100 us past 5 ms
        let us = compose_us(|| 5, || 15_999 - 1_600, 15_999, 16_000_000, 1_000);
        assert_eq!(us, 5_100);
    }

    #[test]
    fn us_composition_retries_across_a_tick_boundary() {
        // first sample straddles the boundary (5 -> 6), second agrees
        let mut tick_reads = [5u32, 6, 6, 6].into_iter();
        let us = compose_us(
            move || tick_reads.next().unwrap(),
            || 15_999,
            15_999,
            16_000_000,
            1_000,
        );
        assert_eq!(us, 6_000);
    }

    #[test]
    fn us_composition_falls_back_after_the_retry_budget() {
        // the counter advances on every read, so no pair ever agrees
        let mut reads = 0u32;
        let us = compose_us(
            move || {
                reads += 1;
                reads
            },
            || 0,
            15_999,
            16_000_000,
            1_000,
        );
        // 3 failed attempts consume 6 reads; the fallback read is the 7th
        assert_eq!(us, 7_000);
    }

    #[test]
    fn elapsed_survives_counter_wraparound() {
        assert_eq!(elapsed_ticks(5, u32::MAX - 9), 15);
        assert_eq!(elapsed_ms(3, u32::MAX - 1), 5);
        assert_eq!(elapsed_us(7, u64::MAX - 2), 10);
        // and still behaves for the ordinary case
        assert_eq!(elapsed_ms(1_000, 400), 600);
    }
}

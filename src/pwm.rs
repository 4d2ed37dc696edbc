//! Pulse-width modulated waveform generation
//!
//! Drives up to three independent output channels from the advanced-control
//! timer TIM1 in center-aligned counting mode. The period is fixed at
//! configuration time; per-channel duty cycles are adjusted at run time,
//! with permyriad units (parts per ten thousand) for 0.01 % granularity.
//!
//! Edge-aligned counting is recognized by the configuration type but not
//! implemented; selecting it fails configuration.
//!
//! ```ignore
//! use stm32f446_hal::pwm::{Alignment, Channel, Pwm};
//! use stm32f446_hal::time::U32Ext;
//!
//! // with PA8/PA9/PA10 in alternate function 1:
//! let mut pwm = Pwm::tim1(
//!     d.TIM1,
//!     (Some(ch1), Some(ch2), Some(ch3)),
//!     rcc.clocks.pclk2(),
//!     1_000.hz(),
//!     Alignment::Center1,
//!     &mut rcc.apb2,
//! )
//! .unwrap();
//!
//! pwm.set_duty_permyriad(Channel::Ch2, 5_000).unwrap(); // 50.00 %
//! pwm.start();
//! ```

use cast::{u16, u32};
use stm32f4::stm32f446::TIM1;

use crate::gpio::{AF, PA10, PA8, PA9};
use crate::rcc::APB2;
use crate::time::Hertz;

/// CH1 output pin - DO NOT IMPLEMENT THIS TRAIT
pub unsafe trait Ch1Pin<TIM> {}

/// CH2 output pin - DO NOT IMPLEMENT THIS TRAIT
pub unsafe trait Ch2Pin<TIM> {}

/// CH3 output pin - DO NOT IMPLEMENT THIS TRAIT
pub unsafe trait Ch3Pin<TIM> {}

unsafe impl Ch1Pin<TIM1> for PA8<AF::AF1> {}
unsafe impl Ch2Pin<TIM1> for PA9<AF::AF1> {}
unsafe impl Ch3Pin<TIM1> for PA10<AF::AF1> {}

/// Counter alignment mode
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Alignment {
    /// Edge-aligned (up-counting). An extension point: configuration
    /// currently rejects it.
    Edge,
    /// Center-aligned, compare flags set while counting down
    Center1,
    /// Center-aligned, compare flags set while counting up
    Center2,
    /// Center-aligned, compare flags set in both directions
    Center3,
}

impl Alignment {
    /// Counter mode-selection field value; `None` for the unimplemented
    /// edge-aligned mode
    fn cms(self) -> Option<u8> {
        match self {
            Alignment::Edge => None,
            Alignment::Center1 => Some(0b01),
            Alignment::Center2 => Some(0b10),
            Alignment::Center3 => Some(0b11),
        }
    }
}

/// Waveform output channel
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Channel {
    /// Channel 1
    Ch1,
    /// Channel 2
    Ch2,
    /// Channel 3
    Ch3,
}

/// PWM configuration and duty errors
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Edge-aligned generation is an unimplemented extension point
    EdgeAlignedUnsupported,
    /// No channel pin was supplied
    NoChannelsEnabled,
    /// The target frequency is too high for the counter to represent
    FrequencyTooHigh,
    /// No prescaler setting brings the period within the counter width
    FrequencyTooLow,
    /// The channel is outside the configured set
    UnconfiguredChannel,
}

/// Find the smallest prescaler whose half-period fits the 16-bit counter.
///
/// In center-aligned mode the counter ramps up and back down each output
/// period, so `freq = clk / (2 * (psc + 1) * (arr + 1))`. The search walks
/// the prescaler upwards until the per-direction tick count fits.
fn center_aligned_divider(tim_clk: u32, freq: u32) -> Result<(u16, u16), Error> {
    if freq == 0 {
        return Err(Error::FrequencyTooLow);
    }

    let half_ticks = tim_clk / (2 * freq);
    if half_ticks < 2 {
        return Err(Error::FrequencyTooHigh);
    }

    let mut psc: u16 = 0;
    while half_ticks / (u32(psc) + 1) > 65_535 {
        if psc == u16::MAX {
            return Err(Error::FrequencyTooLow);
        }
        psc += 1;
    }

    let arr = u16(half_ticks / (u32(psc) + 1) - 1).map_err(|_| Error::FrequencyTooLow)?;
    Ok((psc, arr))
}

/// Scale a permyriad duty to a compare value, saturating at 100.00 %
fn compare_from_permyriad(permyriad: u16, arr: u16) -> u16 {
    let permyriad = permyriad.min(10_000);
    (u32(permyriad) * u32(arr) / 10_000) as u16
}

/// Multi-channel PWM timer
pub struct Pwm<TIM> {
    tim: TIM,
    /// Auto-reload value, fixed after configuration; defines the duty
    /// resolution
    arr: u16,
    channels: [bool; 3],
}

impl Pwm<TIM1> {
    /// Configure TIM1 for center-aligned PWM at `freq`
    ///
    /// Channel pins may be omitted individually; the matching outputs stay
    /// inactive. At least one channel is required. Every enabled channel is
    /// put into proportional (PWM mode 1, compare-preloaded) mode with an
    /// initial duty of zero, and the output gate is armed; the counter stays
    /// halted until [`start`](Pwm::start).
    pub fn tim1<P1, P2, P3>(
        tim: TIM1,
        pins: (Option<P1>, Option<P2>, Option<P3>),
        tim_clk: Hertz,
        freq: Hertz,
        alignment: Alignment,
        apb2: &mut APB2,
    ) -> Result<Self, Error>
    where
        P1: Ch1Pin<TIM1>,
        P2: Ch2Pin<TIM1>,
        P3: Ch3Pin<TIM1>,
    {
        let cms = alignment.cms().ok_or(Error::EdgeAlignedUnsupported)?;

        let channels = [pins.0.is_some(), pins.1.is_some(), pins.2.is_some()];
        if !channels.iter().any(|&enabled| enabled) {
            return Err(Error::NoChannelsEnabled);
        }

        let (psc, arr) = center_aligned_divider(tim_clk.0, freq.0)?;

        apb2.enr().modify(|_, w| w.tim1en().set_bit());
        while apb2.enr().read().tim1en().bit_is_clear() {}

        tim.cr1.modify(|_, w| w.cen().clear_bit());

        // up/down counting with the selected center-aligned mode
        tim.cr1
            .modify(|_, w| unsafe { w.cms().bits(cms) }.dir().clear_bit());

        tim.psc.write(|w| unsafe { w.bits(u32(psc)) });
        tim.arr.write(|w| unsafe { w.bits(u32(arr)) });
        tim.cr1.modify(|_, w| w.arpe().set_bit());

        // outputs off while the compare modes change
        tim.ccer
            .modify(|_, w| w.cc1e().clear_bit().cc2e().clear_bit().cc3e().clear_bit());

        // PWM mode 1 with preloaded compare registers on the enabled
        // channels; disabled channels stay in frozen mode
        tim.ccmr1_output().modify(|_, w| {
            let w = if channels[0] {
                unsafe { w.oc1m().bits(0b110) }.oc1pe().set_bit()
            } else {
                unsafe { w.oc1m().bits(0b000) }.oc1pe().clear_bit()
            };
            if channels[1] {
                unsafe { w.oc2m().bits(0b110) }.oc2pe().set_bit()
            } else {
                unsafe { w.oc2m().bits(0b000) }.oc2pe().clear_bit()
            }
        });
        tim.ccmr2_output().modify(|_, w| {
            if channels[2] {
                unsafe { w.oc3m().bits(0b110) }.oc3pe().set_bit()
            } else {
                unsafe { w.oc3m().bits(0b000) }.oc3pe().clear_bit()
            }
        });

        // active-high polarity; enable only the configured outputs
        tim.ccer.modify(|_, w| {
            w.cc1p()
                .clear_bit()
                .cc2p()
                .clear_bit()
                .cc3p()
                .clear_bit()
                .cc1e()
                .bit(channels[0])
                .cc2e()
                .bit(channels[1])
                .cc3e()
                .bit(channels[2])
        });

        // arm the advanced-timer output gate; safe initial duty of zero
        tim.bdtr.modify(|_, w| w.moe().set_bit());
        tim.ccr1().write(|w| unsafe { w.bits(0) });
        tim.ccr2().write(|w| unsafe { w.bits(0) });
        tim.ccr3().write(|w| unsafe { w.bits(0) });

        // update event to latch the preloaded registers
        tim.egr.write(|w| w.ug().set_bit());

        Ok(Pwm { tim, arr, channels })
    }

    /// Load the raw compare value for `channel`, saturated to the
    /// auto-reload value
    pub fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<(), Error> {
        if !self.enabled(channel) {
            return Err(Error::UnconfiguredChannel);
        }
        let duty = duty.min(self.arr);
        match channel {
            Channel::Ch1 => self.tim.ccr1().write(|w| unsafe { w.bits(u32(duty)) }),
            Channel::Ch2 => self.tim.ccr2().write(|w| unsafe { w.bits(u32(duty)) }),
            Channel::Ch3 => self.tim.ccr3().write(|w| unsafe { w.bits(u32(duty)) }),
        }
        Ok(())
    }

    /// Set `channel`'s duty cycle in permyriad: 0..=10000 maps to
    /// 0.00 %..100.00 %, with larger values clamped
    pub fn set_duty_permyriad(&mut self, channel: Channel, permyriad: u16) -> Result<(), Error> {
        self.set_duty(channel, compare_from_permyriad(permyriad, self.arr))
    }

    /// Compare value producing a 100 % duty cycle
    pub fn max_duty(&self) -> u16 {
        self.arr
    }

    /// Whether `channel` was configured with an output pin
    pub fn enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Ch1 => self.channels[0],
            Channel::Ch2 => self.channels[1],
            Channel::Ch3 => self.channels[2],
        }
    }

    /// Start the counter and the output gate together
    pub fn start(&mut self) {
        self.tim.bdtr.modify(|_, w| w.moe().set_bit());
        self.tim.cr1.modify(|_, w| w.cen().set_bit());
    }

    /// Halt the counter and disable the output gate together
    pub fn stop(&mut self) {
        self.tim.cr1.modify(|_, w| w.cen().clear_bit());
        self.tim.bdtr.modify(|_, w| w.moe().clear_bit());
    }

    /// Stops the waveform and releases the TIM peripheral
    pub fn free(mut self) -> TIM1 {
        self.stop();
        self.tim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divider_for_1khz_from_16mhz() {
        // 16 MHz / (2 * 1 kHz) = 8000 half-period ticks, no prescaling needed
        assert_eq!(center_aligned_divider(16_000_000, 1_000), Ok((0, 7999)));
    }

    #[test]
    fn divider_walks_the_prescaler_up() {
        // 8_000_000 half-period ticks only fit once divided by 123
        assert_eq!(center_aligned_divider(16_000_000, 1), Ok((122, 65_039)));
    }

    #[test]
    fn divider_rejects_unattainable_frequencies() {
        // fewer than two ticks per half-period
        assert_eq!(
            center_aligned_divider(16_000_000, 8_000_000),
            Err(Error::FrequencyTooHigh)
        );
        assert_eq!(
            center_aligned_divider(16_000_000, 0),
            Err(Error::FrequencyTooLow)
        );
    }

    #[test]
    fn divider_boundary_cases() {
        // exactly two ticks per half-period is representable
        assert_eq!(center_aligned_divider(16_000_000, 4_000_000), Ok((0, 1)));
        // largest half-period that needs no prescaler
        assert_eq!(center_aligned_divider(131_070, 1), Ok((0, 65_534)));
    }

    #[test]
    fn permyriad_scaling_truncates() {
        // 50.00 % of 7999 is 3999.5, floored
        assert_eq!(compare_from_permyriad(5_000, 7999), 3999);
        assert_eq!(compare_from_permyriad(1, 7999), 0);
    }

    #[test]
    fn permyriad_end_points_and_clamp() {
        assert_eq!(compare_from_permyriad(0, 7999), 0);
        assert_eq!(compare_from_permyriad(10_000, 7999), 7999);
        // out-of-range requests clamp to 100.00 %
        assert_eq!(compare_from_permyriad(12_345, 7999), 7999);
    }

    #[test]
    fn edge_alignment_has_no_counter_mode() {
        assert_eq!(Alignment::Edge.cms(), None);
        assert_eq!(Alignment::Center1.cms(), Some(0b01));
        assert_eq!(Alignment::Center3.cms(), Some(0b11));
    }
}

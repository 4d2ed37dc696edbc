//! Analog-digital conversion
//!
//! Single-channel regular conversions on ADC1, completed through the
//! end-of-conversion interrupt. A conversion is a two-step handshake:
//! [`Adc::start`] clears the ready state and triggers the hardware, the
//! interrupt publishes the sample into the shared [`AdcSample`], and a later
//! [`Adc::read`] consumes it. Neither step blocks.
//!
//! ```ignore
//! use stm32f446_hal::adc::{self, Adc, AdcSample};
//!
//! static SAMPLE: AdcSample = AdcSample::new();
//!
//! // with PA0 converted to analog mode:
//! let mut adc = Adc::adc1(
//!     d.ADC1,
//!     &light_sense,
//!     adc::Resolution::Bits12,
//!     adc::SampleTime::Cycles84,
//!     adc::Mode::Single,
//!     &SAMPLE,
//!     &mut rcc.apb2,
//!     &mut cp.NVIC,
//!     5,
//! );
//!
//! adc.start();
//! // ... later, once the completion interrupt has run:
//! if let Some(raw) = adc.read() {
//!     // use the sample
//! }
//! ```

use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use cortex_m::peripheral::NVIC;
use embedded_hal::adc::Channel;
use stm32f4::stm32f446::{Interrupt, ADC1};

use crate::gpio::Analog;
use crate::gpio::{PA0, PA1, PA2, PA3, PA4, PA5, PA6, PA7, PB0, PB1, PC0, PC1, PC2, PC3, PC4, PC5};
use crate::rcc::APB2;

/// Highest regular-channel index of this ADC (channels 16-18 are the
/// internal temperature, reference and battery inputs)
pub const ADC_CHANNEL_MAX: u8 = 18;

/// Conversion resolution
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Resolution {
    /// 12-bit resolution
    Bits12 = 0b00,
    /// 10-bit resolution
    Bits10 = 0b01,
    /// 8-bit resolution
    Bits8 = 0b10,
    /// 6-bit resolution
    Bits6 = 0b11,
}

/// Sampling duration, in ADC clock cycles
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SampleTime {
    /// 3 cycles
    Cycles3 = 0b000,
    /// 15 cycles
    Cycles15 = 0b001,
    /// 28 cycles
    Cycles28 = 0b010,
    /// 56 cycles
    Cycles56 = 0b011,
    /// 84 cycles
    Cycles84 = 0b100,
    /// 112 cycles
    Cycles112 = 0b101,
    /// 144 cycles
    Cycles144 = 0b110,
    /// 480 cycles
    Cycles480 = 0b111,
}

/// Conversion run mode
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// One conversion per software start
    Single,
    /// The hardware restarts the conversion after each completion; every
    /// completion still passes through the same ready/consume handshake
    Continuous,
}

/// Conversion result shared between the completion interrupt and foreground
/// code
///
/// The interrupt is the only writer of the stored value and the only setter
/// of the ready flag; foreground code is the only consumer. There is no
/// overrun detection: a completion that arrives before the previous sample
/// was consumed silently overwrites it.
pub struct AdcSample {
    value: AtomicU16,
    ready: AtomicBool,
}

impl AdcSample {
    /// Create an empty slot with no sample pending
    pub const fn new() -> Self {
        AdcSample {
            value: AtomicU16::new(0),
            ready: AtomicBool::new(false),
        }
    }

    /// Store a completed conversion and mark it ready, unconditionally
    pub(crate) fn publish(&self, value: u16) {
        self.value.store(value, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Consume the pending sample, if a completed-and-unread one exists
    pub fn take(&self) -> Option<u16> {
        if self.ready.swap(false, Ordering::Acquire) {
            Some(self.value.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

impl Default for AdcSample {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! adc_pin {
    ($PXi:ident, $i:expr) => {
        impl Channel<Adc> for $PXi<Analog> {
            type ID = u8;
            fn channel() -> u8 {
                $i
            }
        }
    };
}

adc_pin!(PA0, 0);
adc_pin!(PA1, 1);
adc_pin!(PA2, 2);
adc_pin!(PA3, 3);
adc_pin!(PA4, 4);
adc_pin!(PA5, 5);
adc_pin!(PA6, 6);
adc_pin!(PA7, 7);
adc_pin!(PB0, 8);
adc_pin!(PB1, 9);
adc_pin!(PC0, 10);
adc_pin!(PC1, 11);
adc_pin!(PC2, 12);
adc_pin!(PC3, 13);
adc_pin!(PC4, 14);
adc_pin!(PC5, 15);

/// Register access needed by the completion interrupt
pub(crate) trait AdcRegisters {
    fn end_of_conversion(&self) -> bool;
    /// Read the data register, which also clears the end-of-conversion flag
    fn data(&self) -> u16;
}

/// Zero-sized interrupt-context register proxy for ADC1
pub(crate) struct IsrRegs;

impl AdcRegisters for IsrRegs {
    fn end_of_conversion(&self) -> bool {
        // NOTE(unsafe) atomic read with no side effects
        unsafe { (*ADC1::ptr()).sr.read().eoc().bit_is_set() }
    }

    fn data(&self) -> u16 {
        // NOTE(unsafe) the read clears EOC as a side effect
        unsafe { (*ADC1::ptr()).dr.read().bits() as u16 }
    }
}

/// One pass of the completion interrupt: publish the sample if a conversion
/// has ended
pub(crate) fn service(regs: &impl AdcRegisters, sample: &AdcSample) {
    if regs.end_of_conversion() {
        sample.publish(regs.data());
    }
}

/// ISR entry point, to be called from the ADC vector handler with the
/// sample slot the converter was configured with
pub fn adc1_isr(sample: &AdcSample) {
    service(&IsrRegs, sample);
}

/// The constrained ADC peripheral
pub struct Adc {
    adc: ADC1,
    channel: u8,
    sample: &'static AdcSample,
}

impl Adc {
    /// Configure ADC1 for interrupt-completed conversions of `pin`'s channel
    ///
    /// The conversion sequence has a single entry (no scan). Requiring an
    /// analog-mode pin with a `Channel` implementation makes the channel
    /// index valid by construction, so configuration cannot fail.
    #[allow(clippy::too_many_arguments)]
    pub fn adc1<PIN>(
        adc: ADC1,
        _pin: &PIN,
        resolution: Resolution,
        sample_time: SampleTime,
        mode: Mode,
        sample: &'static AdcSample,
        apb2: &mut APB2,
        nvic: &mut NVIC,
        priority: u8,
    ) -> Adc
    where
        PIN: Channel<Adc, ID = u8>,
    {
        let channel = PIN::channel();

        apb2.enr().modify(|_, w| w.adc1en().set_bit());
        while apb2.enr().read().adc1en().bit_is_clear() {}

        // power down while reconfiguring
        adc.cr2.modify(|_, w| w.adon().clear_bit());

        adc.cr1
            .modify(|_, w| unsafe { w.res().bits(resolution as u8).eocie().set_bit() });

        match mode {
            Mode::Single => adc.cr2.modify(|_, w| w.cont().clear_bit()),
            Mode::Continuous => adc.cr2.modify(|_, w| w.cont().set_bit()),
        }

        // single-entry regular sequence: length 0 means one conversion
        adc.sqr1.modify(|_, w| unsafe { w.l().bits(0) });
        adc.sqr3.write(|w| unsafe { w.bits(u32::from(channel)) });

        // per-channel 3-bit sample-time field, split across SMPR1/SMPR2
        let sel = u32::from(sample_time as u8);
        if channel < 10 {
            let shift = u32::from(channel) * 3;
            adc.smpr2
                .modify(|r, w| unsafe { w.bits((r.bits() & !(0b111 << shift)) | (sel << shift)) });
        } else {
            let shift = u32::from(channel - 10) * 3;
            adc.smpr1
                .modify(|r, w| unsafe { w.bits((r.bits() & !(0b111 << shift)) | (sel << shift)) });
        }

        // discard any leftover conversion result, then clear the stale
        // status flags (write-zero-to-clear)
        let _ = adc.dr.read();
        adc.sr.write(|w| unsafe { w.bits(0) });

        unsafe {
            nvic.set_priority(Interrupt::ADC, priority << (8 - crate::NVIC_PRIO_BITS));
            NVIC::unpend(Interrupt::ADC);
            NVIC::unmask(Interrupt::ADC);
        }

        sample.clear();

        adc.cr2.modify(|_, w| w.adon().set_bit());

        Adc {
            adc,
            channel,
            sample,
        }
    }

    /// The regular-channel index this converter samples
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Begin a conversion. Non-blocking; completion is signaled only through
    /// the end-of-conversion interrupt.
    ///
    /// In continuous mode one start suffices; in single mode call this before
    /// every conversion.
    pub fn start(&mut self) {
        self.sample.clear();
        self.adc.cr2.modify(|_, w| w.swstart().set_bit());
    }

    /// Return and consume the last conversion result, if a
    /// completed-and-unread one exists. Returns `None`, with no side
    /// effects, otherwise.
    pub fn read(&mut self) -> Option<u16> {
        self.sample.take()
    }

    /// Releases the ADC peripheral
    pub fn free(self) -> ADC1 {
        self.adc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockAdc {
        eoc: bool,
        value: u16,
    }

    impl AdcRegisters for MockAdc {
        fn end_of_conversion(&self) -> bool {
            self.eoc
        }

        fn data(&self) -> u16 {
            self.value
        }
    }

    #[test]
    fn read_before_any_completion_fails() {
        let sample = AdcSample::new();
        assert_eq!(sample.take(), None);
    }

    #[test]
    fn one_completion_yields_exactly_one_read() {
        let sample = AdcSample::new();
        service(
            &MockAdc {
                eoc: true,
                value: 0x0123,
            },
            &sample,
        );

        assert_eq!(sample.take(), Some(0x0123));
        // consumed: a second read without a new completion fails
        assert_eq!(sample.take(), None);
    }

    #[test]
    fn no_completion_publishes_nothing() {
        let sample = AdcSample::new();
        service(
            &MockAdc {
                eoc: false,
                value: 0x0123,
            },
            &sample,
        );
        assert_eq!(sample.take(), None);
    }

    #[test]
    fn unread_sample_is_silently_overwritten() {
        let sample = AdcSample::new();
        service(
            &MockAdc {
                eoc: true,
                value: 0x0100,
            },
            &sample,
        );
        service(
            &MockAdc {
                eoc: true,
                value: 0x0200,
            },
            &sample,
        );

        // the earlier sample is gone; only the latest is observable
        assert_eq!(sample.take(), Some(0x0200));
        assert_eq!(sample.take(), None);
    }
}

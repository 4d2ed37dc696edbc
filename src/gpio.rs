//! General Purpose Input / Output
//!
//! Implementation of the GPIO functionality for the STM32F446.
//!
//! Typical usage is to create a port instance by trading in the peripheral
//! singleton, then to pull the port apart into pins and convert each pin
//! into the mode its consumer requires:
//!
//! ```ignore
//! use stm32f446_hal::gpio;
//! use stm32f446_hal::rcc::RccExt;
//!
//! let d = stm32f446_hal::pac::Peripherals::take().unwrap();
//! let mut rcc = d.RCC.constrain();
//!
//! let gpioa = gpio::A::new(d.GPIOA, &mut rcc.ahb1);
//!
//! // configure a pin as an output
//! let led = gpioa.PA5.into_output::<gpio::PushPull, gpio::Floating>();
//!
//! // as an analog input
//! let sense = gpioa.PA0.into_analog();
//!
//! // as an alternate function
//! let tx = gpioa.PA2.into_alt_fun::<gpio::AF::AF7>();
//! ```
//!
//! The pin mode is part of the pin's type, so a driver that requires a pin
//! in (say) analog mode states that requirement as a trait bound instead of
//! checking it at run time.

use core::convert::Infallible;
use core::marker::PhantomData;

use embedded_hal::digital::v2::{toggleable, InputPin, OutputPin, StatefulOutputPin};

use crate::rcc;

#[doc(hidden)]
mod private {
    /// Sealed stops crates other than STM32F446-HAL from implementing traits that use it.
    pub trait Sealed {}

    impl Sealed for super::Analog {}
    impl Sealed for super::Floating {}
    impl Sealed for super::PullDown {}
    impl Sealed for super::PullUp {}
    impl<MODE> Sealed for super::Input<MODE> {}
    impl Sealed for super::PushPull {}
    impl Sealed for super::OpenDrain {}
    impl<MODE, PUMODE> Sealed for super::Output<MODE, PUMODE> {}
}

/// GPIO port identifier
///
/// The discriminant is the port's code in the SYSCFG external-interrupt
/// configuration registers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Port {
    /// Port A
    A = 0,
    /// Port B
    B = 1,
    /// Port C
    C = 2,
    /// Port D
    D = 3,
    /// Port E
    E = 4,
    /// Port F
    F = 5,
    /// Port G
    G = 6,
    /// Port H
    H = 7,
}

#[doc(hidden)]
/// Helper trait for configuring PUPDR registers for analog mode
pub trait AnalogMode: private::Sealed {
    /// Used to set pin to floating
    fn modify_pupdr_bits(original: u32, offset: u32) -> u32;
}

/// Analog mode (type state) indicating that a pin is configured in Analog (high-z) input mode
pub struct Analog(());
impl AnalogMode for Analog {
    #[inline]
    fn modify_pupdr_bits(original: u32, offset: u32) -> u32 {
        original & !(0b11 << offset)
    }
}

#[doc(hidden)]
/// Helper trait for configuring PUPDR registers for the desired pull up/down mode
pub trait PullMode: private::Sealed {
    /// Manipulate pull up/down bits
    fn modify_pupdr_bits(original: u32, offset: u32) -> u32;
}

/// Floating input (type state) indicating that a pin is floating
pub struct Floating;
impl PullMode for Floating {
    #[inline]
    fn modify_pupdr_bits(original: u32, offset: u32) -> u32 {
        original & !(0b11 << offset)
    }
}

/// Pulled down input (type state) indicating that the pin is configured for pull-down
pub struct PullDown;
impl PullMode for PullDown {
    #[inline]
    fn modify_pupdr_bits(original: u32, offset: u32) -> u32 {
        (original & !(0b11 << offset)) | (0b10 << offset)
    }
}

/// Pulled up input (type state) indicating that the pin is configured for pull-up
pub struct PullUp;
impl PullMode for PullUp {
    #[inline]
    fn modify_pupdr_bits(original: u32, offset: u32) -> u32 {
        (original & !(0b11 << offset)) | (0b01 << offset)
    }
}

#[doc(hidden)]
/// Input mode (type state) indicating that the pin is configured as an input
pub struct Input<MODE> {
    #[doc(hidden)]
    _mode: PhantomData<MODE>,
}

#[doc(hidden)]
/// Helper trait for configuring the OTYPER register for the desired output drive mode
pub trait OutputMode: private::Sealed {
    /// Modify output type bits
    fn modify_otyper_bits(original: u32, idx: u8) -> u32;
}

/// Push pull output (type state) indicating that the pin is configured for push-pull
pub struct PushPull;
impl OutputMode for PushPull {
    #[inline]
    fn modify_otyper_bits(original: u32, idx: u8) -> u32 {
        original & !(0b1 << idx)
    }
}

/// Open drain output (type state) indicating that the pin is configured as an open-drain
pub struct OpenDrain;
impl OutputMode for OpenDrain {
    #[inline]
    fn modify_otyper_bits(original: u32, idx: u8) -> u32 {
        original | (0b1 << idx)
    }
}

/// Output mode (type state) indicating that the pin is configured as an output
pub struct Output<MODE, PUMODE> {
    #[doc(hidden)]
    _mode: PhantomData<MODE>,
    #[doc(hidden)]
    _pu: PhantomData<PUMODE>,
}

/// Pin drive strength
///
/// Note: Refer to the device datasheet for the frequency specifications and
/// the power supply and load conditions for each speed.
#[allow(missing_docs)]
#[repr(u8)]
pub enum PinSpeed {
    Low = 0,
    Medium,
    Fast,
    High,
}

#[doc(hidden)]
/// Helper trait to contain a numeric value used to identify alternate functions
///
/// Note: this trait SHALL NOT be implemented, and should be considered Sealed
pub trait AltFun {
    /// Number of the alternate function
    const NUM: u32;
}

macro_rules! impl_af {
    ( [$($af:ident, $i:expr;)*] ) => {
        $(
            /// Alternate pin function (type state)
            pub struct $af;
            impl super::AltFun for $af {
                const NUM: u32 = $i;
            }
         )*
    }
}

#[allow(non_snake_case)]
/// Module containing the (auto-generated) alternate functions for the GPIOs
pub mod AF {
    impl_af!([AF0, 0; AF1, 1; AF2, 2; AF3, 3; AF4, 4; AF5, 5; AF6, 6; AF7, 7; AF8, 8; AF9, 9; AF10, 10; AF11, 11; AF12, 12; AF13, 13; AF14, 14; AF15, 15;]);
}

macro_rules! impl_pin {
    ($GPIOX:ident, $port:ident, $PXi:ident, $i:expr) => {
        /// Specific GPIO pin
        pub struct $PXi<MODE>(PhantomData<MODE>);

        impl<MODE> $PXi<MODE> {
            const OFFSET: u32 = 2 * $i;

            /// Configures the pin to operate as a high-impedance analog input
            pub fn into_analog(self) -> $PXi<Analog> {
                unsafe {
                    (*$GPIOX::ptr()).pupdr.modify(|r, w| {
                        w.bits(Analog::modify_pupdr_bits(r.bits(), Self::OFFSET))
                    });
                    (*$GPIOX::ptr())
                        .moder
                        .modify(|r, w| w.bits(r.bits() | (0b11 << Self::OFFSET)));
                }

                $PXi(PhantomData)
            }

            /// Configures the pin to operate as an input pin according to `Mode`
            pub fn into_input<Mode: PullMode>(self) -> $PXi<Input<Mode>> {
                unsafe {
                    (*$GPIOX::ptr())
                        .moder
                        .modify(|r, w| w.bits(r.bits() & !(0b11 << Self::OFFSET)));
                    (*$GPIOX::ptr()).pupdr.modify(|r, w| {
                        w.bits(Mode::modify_pupdr_bits(r.bits(), Self::OFFSET))
                    });
                }

                $PXi(PhantomData)
            }

            /// Configures the pin to operate as an output pin according to `OMode` and `PUMode`
            pub fn into_output<OMode: OutputMode, PUMode: PullMode>(
                self,
            ) -> $PXi<Output<OMode, PUMode>> {
                unsafe {
                    (*$GPIOX::ptr()).moder.modify(|r, w| {
                        w.bits((r.bits() & !(0b11 << Self::OFFSET)) | (0b01 << Self::OFFSET))
                    });
                    (*$GPIOX::ptr()).pupdr.modify(|r, w| {
                        w.bits(PUMode::modify_pupdr_bits(r.bits(), Self::OFFSET))
                    });
                    (*$GPIOX::ptr())
                        .otyper
                        .modify(|r, w| w.bits(OMode::modify_otyper_bits(r.bits(), $i)));
                }

                $PXi(PhantomData)
            }

            /// Configures the pin to operate as the given alternate function
            pub fn into_alt_fun<AF: AltFun>(self) -> $PXi<AF> {
                // AFRx pin fields are 4 bits wide, and each 8-pin bank has its own
                // reg (L or H); e.g. pin 8's offset is _0_, within AFRH.
                const AFR_OFFSET: usize = ($i % 8) * 4;
                unsafe {
                    (*$GPIOX::ptr()).moder.modify(|r, w| {
                        w.bits((r.bits() & !(0b11 << Self::OFFSET)) | (0b10 << Self::OFFSET))
                    });
                    if $i < 8 {
                        (*$GPIOX::ptr()).afrl.modify(|r, w| {
                            w.bits((r.bits() & !(0b1111 << AFR_OFFSET)) | (AF::NUM << AFR_OFFSET))
                        });
                    } else {
                        (*$GPIOX::ptr()).afrh.modify(|r, w| {
                            w.bits((r.bits() & !(0b1111 << AFR_OFFSET)) | (AF::NUM << AFR_OFFSET))
                        });
                    }
                }

                $PXi(PhantomData)
            }

            /// Set the drive strength of the pin
            #[inline]
            pub fn set_pin_speed(&self, spd: PinSpeed) {
                unsafe {
                    (*$GPIOX::ptr()).ospeedr.modify(|r, w| {
                        w.bits(
                            (r.bits() & !(0b11 << Self::OFFSET))
                                | ((spd as u32) << Self::OFFSET),
                        )
                    });
                }
            }
        }

        unsafe impl<MODE> crate::exti::LinePin for $PXi<Input<MODE>> {
            const PORT: Port = Port::$port;
            const LINE: u8 = $i;
        }

        impl<OMODE, PUMODE> OutputPin for $PXi<Output<OMODE, PUMODE>> {
            type Error = Infallible;

            fn set_high(&mut self) -> Result<(), Self::Error> {
                // NOTE(unsafe) atomic write to a stateless register
                Ok(unsafe { (*$GPIOX::ptr()).bsrr.write(|w| w.bits(1 << $i)) })
            }

            fn set_low(&mut self) -> Result<(), Self::Error> {
                // NOTE(unsafe) atomic write to a stateless register
                Ok(unsafe { (*$GPIOX::ptr()).bsrr.write(|w| w.bits(1 << (16 + $i))) })
            }
        }

        impl<OMODE, PUMODE> StatefulOutputPin for $PXi<Output<OMODE, PUMODE>> {
            /// Returns whether high bit is set.
            fn is_set_high(&self) -> Result<bool, Self::Error> {
                self.is_set_low().map(|r| !r)
            }

            /// Returns whether low bit is set.
            fn is_set_low(&self) -> Result<bool, Self::Error> {
                // NOTE(unsafe) atomic read with no side effects
                Ok(unsafe { (*$GPIOX::ptr()).odr.read().bits() & (1 << $i) == 0 })
            }
        }

        impl<OMODE, PUMODE> toggleable::Default for $PXi<Output<OMODE, PUMODE>> {}

        impl<PUMODE> InputPin for $PXi<Input<PUMODE>> {
            type Error = Infallible;

            fn is_high(&self) -> Result<bool, Self::Error> {
                self.is_low().map(|r| !r)
            }

            fn is_low(&self) -> Result<bool, Self::Error> {
                // NOTE(unsafe) atomic read with no side effects
                Ok(unsafe { (*$GPIOX::ptr()).idr.read().bits() & (1 << $i) == 0 })
            }
        }
    };
}

macro_rules! impl_pins {
    ($GPIOX:ident, $port:ident: [$($PXi:ident, $i:expr;)*]) => {
        $(
            impl_pin!($GPIOX, $port, $PXi, $i);
         )*
    }
}

macro_rules! impl_gpio {
    ($name:ident, $GPIOX:ident, $port:ident, $gpioen:ident, [$($PXi:ident, $i:expr;)*]) => {

        use stm32f4::stm32f446::$GPIOX;

        impl_pins!($GPIOX, $port: [$($PXi, $i;)*]);

        #[allow(non_snake_case)]
        /// GPIO port
        ///
        /// Once created, a port instance is usually pulled apart by moving its
        /// fields. Pins start out in their reset state, floating input.
        pub struct $name {
            $(
                /// Pin
                pub $PXi: $PXi<Input<Floating>>,
            )*
        }

        impl $name {
            /// Trade the GPIO registers for a port instance
            pub fn new(_gpio: $GPIOX, ahb1: &mut rcc::AHB1) -> Self {
                ahb1.enr().modify(|_, w| w.$gpioen().set_bit());
                while ahb1.enr().read().$gpioen().bit_is_clear() {}
                Self {
                    $(
                        $PXi: $PXi(PhantomData),
                    )*
                }
            }
        }
    }
}

impl_gpio!(A, GPIOA, A, gpioaen,
 [PA0, 0; PA1, 1; PA2, 2; PA3, 3; PA4, 4; PA5, 5; PA6, 6; PA7, 7;
  PA8, 8; PA9, 9; PA10, 10; PA11, 11; PA12, 12; PA13, 13; PA14, 14; PA15, 15;]
);
impl_gpio!(B, GPIOB, B, gpioben,
 [PB0, 0; PB1, 1; PB2, 2; PB3, 3; PB4, 4; PB5, 5; PB6, 6; PB7, 7;
  PB8, 8; PB9, 9; PB10, 10; PB11, 11; PB12, 12; PB13, 13; PB14, 14; PB15, 15;]
);
impl_gpio!(C, GPIOC, C, gpiocen,
 [PC0, 0; PC1, 1; PC2, 2; PC3, 3; PC4, 4; PC5, 5; PC6, 6; PC7, 7;
  PC8, 8; PC9, 9; PC10, 10; PC11, 11; PC12, 12; PC13, 13; PC14, 14; PC15, 15;]
);

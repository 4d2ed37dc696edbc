//! Reset and clock control
//!
//! The drivers in this crate run from the reset clock tree: SYSCLK on the
//! 16 MHz HSI with both APB prescalers at 1. Constraining `RCC` therefore
//! yields the bus gates and a frozen `Clocks` record directly; there is no
//! clock-tree reprogramming step.

use stm32f4::stm32f446::{rcc, RCC};

use crate::time::Hertz;

/// Frequency of the high-speed internal RC oscillator
const HSI_FREQ: u32 = 16_000_000;

/// Extension trait that constrains the `RCC` peripheral
pub trait RccExt {
    /// Constrains the `RCC` peripheral so it plays nicely with the other abstractions
    fn constrain(self) -> Rcc;
}

impl RccExt for RCC {
    fn constrain(self) -> Rcc {
        Rcc {
            ahb1: AHB1(()),
            apb1: APB1(()),
            apb2: APB2(()),
            clocks: Clocks {
                sysclk: Hertz(HSI_FREQ),
                pclk1: Hertz(HSI_FREQ),
                pclk2: Hertz(HSI_FREQ),
            },
        }
    }
}

/// Constrained RCC peripheral
pub struct Rcc {
    /// AHB1 peripheral registers
    pub ahb1: AHB1,
    /// APB1 peripheral registers
    pub apb1: APB1,
    /// APB2 peripheral registers
    pub apb2: APB2,
    /// Frozen bus frequencies
    pub clocks: Clocks,
}

/// AHB1 register access
pub struct AHB1(());
impl AHB1 {
    /// Access AHB1RSTR reset register
    pub fn rstr(&mut self) -> &rcc::AHB1RSTR {
        unsafe { &(*RCC::ptr()).ahb1rstr }
    }

    /// Access AHB1ENR clock enable register
    pub fn enr(&mut self) -> &rcc::AHB1ENR {
        unsafe { &(*RCC::ptr()).ahb1enr }
    }
}

/// APB1 register access
pub struct APB1(());
impl APB1 {
    /// Access APB1RSTR reset register
    pub fn rstr(&mut self) -> &rcc::APB1RSTR {
        unsafe { &(*RCC::ptr()).apb1rstr }
    }

    /// Access APB1ENR clock enable register
    pub fn enr(&mut self) -> &rcc::APB1ENR {
        unsafe { &(*RCC::ptr()).apb1enr }
    }
}

/// APB2 register access
pub struct APB2(());
impl APB2 {
    /// Access APB2RSTR reset register
    pub fn rstr(&mut self) -> &rcc::APB2RSTR {
        unsafe { &(*RCC::ptr()).apb2rstr }
    }

    /// Access APB2ENR clock enable register
    pub fn enr(&mut self) -> &rcc::APB2ENR {
        unsafe { &(*RCC::ptr()).apb2enr }
    }
}

/// Frozen clock frequencies
///
/// The existence of this value indicates that the clock configuration can no
/// longer be changed.
#[derive(Clone, Copy)]
pub struct Clocks {
    sysclk: Hertz,
    pclk1: Hertz,
    pclk2: Hertz,
}

impl Clocks {
    /// Returns the frequency of the APB1
    pub fn pclk1(&self) -> Hertz {
        self.pclk1
    }

    /// Returns the frequency of the APB2
    pub fn pclk2(&self) -> Hertz {
        self.pclk2
    }

    /// Returns the system (core) frequency
    pub fn sysclk(&self) -> Hertz {
        self.sysclk
    }
}

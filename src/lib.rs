//! HAL for the STM32F446 microcontroller
//!
//! The drivers in this crate share one constraint: state that crosses the
//! interrupt/foreground boundary is handed off lock-free, with exactly one
//! writer context per field. The interrupt-facing half of each driver is a
//! small entry point that the matching vector handler forwards to; the
//! `board` module wires everything to the fixed pins of the NUCLEO-F446RE.

#![no_std]

pub use stm32f4;
pub use stm32f4::stm32f446 as pac;

pub mod adc;
pub mod clock;
pub mod exti;
pub mod gpio;
pub mod pwm;
pub mod rcc;
pub mod serial;
pub mod time;

mod ring;

#[cfg(feature = "rt")]
pub mod board;

/// Priority bits implemented by the STM32F4's NVIC; priorities passed to the
/// drivers occupy this many most-significant bits of the priority byte.
pub(crate) const NVIC_PRIO_BITS: u8 = 4;

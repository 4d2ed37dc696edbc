//! Board wiring for the NUCLEO-F446RE
//!
//! Composition only: this module owns the `static` state shared with the
//! interrupt handlers, applies the board's fixed pin map, and forwards each
//! vector-table handler to its driver's ISR entry point. No logic beyond
//! wiring lives here.
//!
//! Fixed wiring:
//!
//! - LD2 user LED on PA5
//! - B1 user button on PC13, EXTI line 13, falling edge
//! - USART2 console on PA2/PA3 (AF7), routed to the ST-LINK virtual COM port
//! - ADC1_IN0 on PA0
//! - TIM1 PWM channels 1-3 on PA8/PA9/PA10 (AF1)

use core::sync::atomic::{AtomicBool, Ordering};

use cortex_m_rt::exception;
use stm32f4::stm32f446::{interrupt, Peripherals, TIM1, USART2};

use crate::adc::{self, Adc, AdcSample};
use crate::clock::{Clock, TickCounter};
use crate::exti::{self, Edge, ExtiDispatcher, ExtiLines};
use crate::gpio::{self, Floating, Output, PullUp, PushPull, AF};
use crate::pwm::{Alignment, Pwm};
use crate::rcc::RccExt;
use crate::serial::{self, Serial, SerialBuffers};
use crate::time::U32Ext;

/// Baud rate of the virtual COM port link
pub const CONSOLE_BAUD: u32 = 115_200;
/// PWM output frequency in Hz
pub const PWM_FREQ_HZ: u32 = 1_000;
/// SysTick period in microseconds
pub const TICK_PERIOD_US: u32 = 1_000;

/// Ring buffers and error counters of the USART2 console link
pub static USART2_BUFFERS: SerialBuffers = SerialBuffers::new();
/// Line-callback registry served by all seven EXTI handlers
pub static EXTI_DISPATCHER: ExtiDispatcher = ExtiDispatcher::new();
/// Latest ADC1 conversion result
pub static ADC1_SAMPLE: AdcSample = AdcSample::new();
/// SysTick tick count
pub static TICKS: TickCounter = TickCounter::new();

/// Raised by the user-button callback, consumed by [`user_button_pressed`]
static USER_BUTTON: AtomicBool = AtomicBool::new(false);

/// The user LED
pub type Led = gpio::PA5<Output<PushPull, Floating>>;

/// The USART2 console handle
pub type Console = Serial<USART2, (gpio::PA2<AF::AF7>, gpio::PA3<AF::AF7>)>;

/// Foreground handles to the board's peripherals
pub struct Board {
    /// LD2 user LED
    pub led: Led,
    /// Console on the ST-LINK virtual COM port
    pub serial: Console,
    /// Analog input on PA0
    pub adc: Adc,
    /// Three-channel waveform output on TIM1
    pub pwm: Pwm<TIM1>,
    /// Monotonic time source
    pub clock: Clock,
}

fn on_user_button(_token: usize) {
    USER_BUTTON.store(true, Ordering::Release);
}

/// Whether the user button was pressed since the last call
pub fn user_button_pressed() -> bool {
    USER_BUTTON.swap(false, Ordering::Acquire)
}

/// Bring up every peripheral with the board's fixed wiring
pub fn init(dp: Peripherals, mut cp: cortex_m::Peripherals) -> Board {
    let mut rcc = dp.RCC.constrain();
    let clocks = rcc.clocks;

    let gpioa = gpio::A::new(dp.GPIOA, &mut rcc.ahb1);
    let gpioc = gpio::C::new(dp.GPIOC, &mut rcc.ahb1);

    let led = gpioa.PA5.into_output::<PushPull, Floating>();

    let button = gpioc.PC13.into_input::<PullUp>();
    let mut syscfg = dp.SYSCFG;
    let mut exti_regs = dp.EXTI;
    EXTI_DISPATCHER
        .register(13, on_user_button, 0)
        .expect("user button line");
    exti::configure(
        &button,
        Edge::Falling,
        6,
        &mut syscfg,
        &mut exti_regs,
        &mut rcc.apb2,
        &mut cp.NVIC,
    );

    let tx = gpioa.PA2.into_alt_fun::<AF::AF7>();
    let rx = gpioa.PA3.into_alt_fun::<AF::AF7>();
    tx.set_pin_speed(gpio::PinSpeed::High);
    rx.set_pin_speed(gpio::PinSpeed::High);
    let serial = Serial::usart2(
        dp.USART2,
        (tx, rx),
        CONSOLE_BAUD.bps(),
        clocks.pclk1(),
        &USART2_BUFFERS,
        &mut rcc.apb1,
        &mut cp.NVIC,
        6,
    )
    .expect("console baud rate");

    let sense = gpioa.PA0.into_analog();
    let adc = Adc::adc1(
        dp.ADC1,
        &sense,
        adc::Resolution::Bits12,
        adc::SampleTime::Cycles84,
        adc::Mode::Single,
        &ADC1_SAMPLE,
        &mut rcc.apb2,
        &mut cp.NVIC,
        5,
    );

    let ch1 = gpioa.PA8.into_alt_fun::<AF::AF1>();
    let ch2 = gpioa.PA9.into_alt_fun::<AF::AF1>();
    let ch3 = gpioa.PA10.into_alt_fun::<AF::AF1>();
    ch1.set_pin_speed(gpio::PinSpeed::High);
    ch2.set_pin_speed(gpio::PinSpeed::High);
    ch3.set_pin_speed(gpio::PinSpeed::High);
    let pwm = Pwm::tim1(
        dp.TIM1,
        (Some(ch1), Some(ch2), Some(ch3)),
        clocks.pclk2(),
        PWM_FREQ_HZ.hz(),
        Alignment::Center1,
        &mut rcc.apb2,
    )
    .expect("pwm frequency");

    let clock = Clock::new(
        cp.SYST,
        clocks.sysclk(),
        TICK_PERIOD_US.us(),
        &TICKS,
        &mut cp.SCB,
        4,
    )
    .expect("tick period");

    Board {
        led,
        serial,
        adc,
        pwm,
        clock,
    }
}

#[interrupt]
fn EXTI0() {
    EXTI_DISPATCHER.dispatch(0, 0, &ExtiLines);
}

#[interrupt]
fn EXTI1() {
    EXTI_DISPATCHER.dispatch(1, 1, &ExtiLines);
}

#[interrupt]
fn EXTI2() {
    EXTI_DISPATCHER.dispatch(2, 2, &ExtiLines);
}

#[interrupt]
fn EXTI3() {
    EXTI_DISPATCHER.dispatch(3, 3, &ExtiLines);
}

#[interrupt]
fn EXTI4() {
    EXTI_DISPATCHER.dispatch(4, 4, &ExtiLines);
}

#[interrupt]
fn EXTI9_5() {
    EXTI_DISPATCHER.dispatch(5, 9, &ExtiLines);
}

#[interrupt]
fn EXTI15_10() {
    EXTI_DISPATCHER.dispatch(10, 15, &ExtiLines);
}

#[interrupt]
fn USART2() {
    serial::usart2_isr(&USART2_BUFFERS);
}

#[interrupt]
fn ADC() {
    adc::adc1_isr(&ADC1_SAMPLE);
}

#[exception]
fn SysTick() {
    TICKS.tick();
}

//! External interrupt lines
//!
//! Sixteen edge-detect lines are shared by all GPIO ports: line `n` can be
//! routed to pin `n` of exactly one port. This module owns the mapping of a
//! pin to its line, the edge/priority configuration, and a registry of
//! per-line callbacks that the vector handlers drain through [`ExtiDispatcher::dispatch`].
//!
//! The registry is registration-time data: callbacks are installed while the
//! board is wired up, and only read afterwards. Each slot is guarded by a
//! short critical section rather than by the lock-free protocol the data-path
//! state uses.

use core::cell::Cell;

use cortex_m::peripheral::NVIC;
use critical_section::Mutex;
use stm32f4::stm32f446::{Interrupt, EXTI, SYSCFG};

use crate::gpio::Port;
use crate::rcc::APB2;

/// Number of routable edge-detect lines
pub const LINES: usize = 16;

/// Line callback: invoked from interrupt context with the opaque token it
/// was registered with. Must be bounded and non-blocking.
pub type LineCallback = fn(usize);

#[derive(Clone, Copy)]
struct LineHook {
    callback: LineCallback,
    token: usize,
}

/// EXTI-related errors
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The line index exceeds the number of edge-detect lines
    InvalidLine,
}

/// Interrupt trigger edge
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Edge {
    /// Trigger on the rising edge only
    Rising,
    /// Trigger on the falling edge only
    Falling,
    /// Trigger on both edges
    Both,
}

/// A pin that can drive an EXTI line - DO NOT IMPLEMENT THIS TRAIT
///
/// Edge detection samples the pin's input path, so this is only implemented
/// for pins in input mode.
pub unsafe trait LinePin {
    /// The pin's port, selected into the line's port-select field
    const PORT: Port;
    /// The line number the pin is routed to (its pin index)
    const LINE: u8;
}

/// Read/clear access to the latched pending bits
///
/// Implemented by [`ExtiLines`] for the real peripheral and by simulated
/// register banks in tests.
pub trait PendingLines {
    /// Whether `line`'s pending bit is latched
    fn is_pending(&self, line: u8) -> bool;
    /// Clear `line`'s pending bit
    fn clear_pending(&self, line: u8);
}

/// The pending-bit register of the EXTI peripheral
pub struct ExtiLines;

impl PendingLines for ExtiLines {
    fn is_pending(&self, line: u8) -> bool {
        // NOTE(unsafe) atomic read with no side effects
        unsafe { (*EXTI::ptr()).pr.read().bits() & (1 << line) != 0 }
    }

    fn clear_pending(&self, line: u8) {
        // NOTE(unsafe) write-one-to-clear; other lines are unaffected by the
        // zero bits, so no read-modify-write is involved
        unsafe { (*EXTI::ptr()).pr.write(|w| w.bits(1 << line)) }
    }
}

/// Registry of per-line callbacks
///
/// Explicitly constructed and typically stored in a `static` by the board
/// layer; one instance serves all sixteen lines.
pub struct ExtiDispatcher {
    lines: [Mutex<Cell<Option<LineHook>>>; LINES],
}

impl ExtiDispatcher {
    /// Create a registry with no callbacks installed
    pub const fn new() -> Self {
        const NONE: Mutex<Cell<Option<LineHook>>> = Mutex::new(Cell::new(None));
        ExtiDispatcher { lines: [NONE; LINES] }
    }

    /// Install `callback` for `line`, replacing any prior registration
    ///
    /// The callback runs in interrupt context and receives `token` verbatim.
    pub fn register(&self, line: u8, callback: LineCallback, token: usize) -> Result<(), Error> {
        if usize::from(line) >= LINES {
            return Err(Error::InvalidLine);
        }
        critical_section::with(|cs| {
            self.lines[usize::from(line)]
                .borrow(cs)
                .set(Some(LineHook { callback, token }))
        });
        Ok(())
    }

    /// Remove the registration for `line`, if any
    pub fn unregister(&self, line: u8) -> Result<(), Error> {
        if usize::from(line) >= LINES {
            return Err(Error::InvalidLine);
        }
        critical_section::with(|cs| self.lines[usize::from(line)].borrow(cs).set(None));
        Ok(())
    }

    /// Service every pending line in `first..=last` - interrupt context only
    ///
    /// The pending bit is cleared *before* the callback runs, so an edge
    /// arriving during the callback latches again instead of being lost. The
    /// price is that a burst of edges before service may invoke the callback
    /// only once per service, or once more than strictly needed. Lines with
    /// no registered callback are skipped.
    pub fn dispatch(&self, first: u8, last: u8, pending: &impl PendingLines) {
        let last = last.min(LINES as u8 - 1);
        for line in first..=last {
            if pending.is_pending(line) {
                pending.clear_pending(line);
                let hook =
                    critical_section::with(|cs| self.lines[usize::from(line)].borrow(cs).get());
                if let Some(hook) = hook {
                    (hook.callback)(hook.token);
                }
            }
        }
    }
}

impl Default for ExtiDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Route `PIN`'s port to its line, arm edge detection and enable the line's
/// interrupt at `priority`
///
/// Any stale pending state for the line is cleared before the line is
/// unmasked, so a previously latched edge cannot fire a spurious callback.
pub fn configure<PIN: LinePin>(
    _pin: &PIN,
    edge: Edge,
    priority: u8,
    syscfg: &mut SYSCFG,
    exti: &mut EXTI,
    apb2: &mut APB2,
    nvic: &mut NVIC,
) {
    apb2.enr().modify(|_, w| w.syscfgen().set_bit());

    // Four 4-bit port-select fields per configuration register
    let shift = u32::from(PIN::LINE % 4) * 4;
    let code = (PIN::PORT as u32) << shift;
    let mask = 0xF << shift;
    match PIN::LINE / 4 {
        0 => syscfg
            .exticr1
            .modify(|r, w| unsafe { w.bits((r.bits() & !mask) | code) }),
        1 => syscfg
            .exticr2
            .modify(|r, w| unsafe { w.bits((r.bits() & !mask) | code) }),
        2 => syscfg
            .exticr3
            .modify(|r, w| unsafe { w.bits((r.bits() & !mask) | code) }),
        _ => syscfg
            .exticr4
            .modify(|r, w| unsafe { w.bits((r.bits() & !mask) | code) }),
    }

    let bit = 1u32 << PIN::LINE;

    // Mask the line while the trigger edges change
    exti.imr.modify(|r, w| unsafe { w.bits(r.bits() & !bit) });

    match edge {
        Edge::Rising => {
            exti.ftsr.modify(|r, w| unsafe { w.bits(r.bits() & !bit) });
            exti.rtsr.modify(|r, w| unsafe { w.bits(r.bits() | bit) });
        }
        Edge::Falling => {
            exti.rtsr.modify(|r, w| unsafe { w.bits(r.bits() & !bit) });
            exti.ftsr.modify(|r, w| unsafe { w.bits(r.bits() | bit) });
        }
        Edge::Both => {
            exti.rtsr.modify(|r, w| unsafe { w.bits(r.bits() | bit) });
            exti.ftsr.modify(|r, w| unsafe { w.bits(r.bits() | bit) });
        }
    }

    // Discard anything latched while the line was unconfigured, then unmask
    exti.pr.write(|w| unsafe { w.bits(bit) });
    exti.imr.modify(|r, w| unsafe { w.bits(r.bits() | bit) });

    let irq = match PIN::LINE {
        0 => Interrupt::EXTI0,
        1 => Interrupt::EXTI1,
        2 => Interrupt::EXTI2,
        3 => Interrupt::EXTI3,
        4 => Interrupt::EXTI4,
        5..=9 => Interrupt::EXTI9_5,
        _ => Interrupt::EXTI15_10,
    };
    unsafe {
        nvic.set_priority(irq, priority << (8 - crate::NVIC_PRIO_BITS));
        NVIC::unpend(irq);
        NVIC::unmask(irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    /// Pending bits held in a plain cell, standing in for EXTI_PR
    struct SimulatedLines(Cell<u32>);

    impl SimulatedLines {
        fn with_pending(bits: u32) -> Self {
            SimulatedLines(Cell::new(bits))
        }
    }

    impl PendingLines for SimulatedLines {
        fn is_pending(&self, line: u8) -> bool {
            self.0.get() & (1 << line) != 0
        }

        fn clear_pending(&self, line: u8) {
            self.0.set(self.0.get() & !(1 << line));
        }
    }

    #[test]
    fn register_rejects_out_of_range_line() {
        let dispatcher = ExtiDispatcher::new();
        fn noop(_: usize) {}
        assert_eq!(dispatcher.register(16, noop, 0), Err(Error::InvalidLine));
        assert_eq!(dispatcher.register(15, noop, 0), Ok(()));
    }

    #[test]
    fn dispatch_invokes_registered_callback_once() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn count(token: usize) {
            HITS.fetch_add(token, Ordering::SeqCst);
        }

        let dispatcher = ExtiDispatcher::new();
        dispatcher.register(13, count, 1).unwrap();

        let lines = SimulatedLines::with_pending(1 << 13);
        dispatcher.dispatch(10, 15, &lines);

        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert!(!lines.is_pending(13));

        // nothing pending any more: no further invocation
        dispatcher.dispatch(10, 15, &lines);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_bit_is_cleared_before_the_callback_runs() {
        static BITS: AtomicU32 = AtomicU32::new(0);
        static SAW_CLEARED: AtomicBool = AtomicBool::new(false);

        struct SharedLines;
        impl PendingLines for SharedLines {
            fn is_pending(&self, line: u8) -> bool {
                BITS.load(Ordering::SeqCst) & (1 << line) != 0
            }
            fn clear_pending(&self, line: u8) {
                BITS.fetch_and(!(1 << line), Ordering::SeqCst);
            }
        }

        fn observe(_: usize) {
            SAW_CLEARED.store(BITS.load(Ordering::SeqCst) & (1 << 4) == 0, Ordering::SeqCst);
        }

        BITS.store(1 << 4, Ordering::SeqCst);
        let dispatcher = ExtiDispatcher::new();
        dispatcher.register(4, observe, 0).unwrap();
        dispatcher.dispatch(4, 4, &SharedLines);

        assert!(SAW_CLEARED.load(Ordering::SeqCst));
    }

    #[test]
    fn unregistered_pending_line_is_skipped() {
        let dispatcher = ExtiDispatcher::new();
        let lines = SimulatedLines::with_pending(1 << 7);
        dispatcher.dispatch(5, 9, &lines);
        // still cleared, even with nothing registered
        assert!(!lines.is_pending(7));
    }

    #[test]
    fn lines_outside_the_range_are_not_serviced() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn count(_: usize) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        let dispatcher = ExtiDispatcher::new();
        dispatcher.register(3, count, 0).unwrap();

        let lines = SimulatedLines::with_pending(1 << 3);
        dispatcher.dispatch(10, 15, &lines);
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
        assert!(lines.is_pending(3));
    }

    #[test]
    fn last_registration_wins() {
        static FIRST: AtomicUsize = AtomicUsize::new(0);
        static SECOND: AtomicUsize = AtomicUsize::new(0);
        fn first(_: usize) {
            FIRST.fetch_add(1, Ordering::SeqCst);
        }
        fn second(_: usize) {
            SECOND.fetch_add(1, Ordering::SeqCst);
        }

        let dispatcher = ExtiDispatcher::new();
        dispatcher.register(0, first, 0).unwrap();
        dispatcher.register(0, second, 0).unwrap();

        let lines = SimulatedLines::with_pending(1);
        dispatcher.dispatch(0, 0, &lines);

        assert_eq!(FIRST.load(Ordering::SeqCst), 0);
        assert_eq!(SECOND.load(Ordering::SeqCst), 1);
    }
}

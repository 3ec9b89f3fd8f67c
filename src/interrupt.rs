//! NVIC-backed interrupt controller

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::NVIC;

use crate::resources::InterruptController;

/// An interrupt number, as seen by the NVIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Irq(u16);

// Safety: the number comes from a peripheral's resource description, which
// the application fills in from the device's vector table.
unsafe impl InterruptNumber for Irq {
    fn number(self) -> u16 {
        self.0
    }
}

/// The Cortex-M NVIC as an [`InterruptController`].
///
/// Priorities are written as-is to the NVIC priority registers, so they
/// include the device's unimplemented low bits. On an STM32 with four
/// priority bits, priority 5 is `5 << 4`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nvic;

impl InterruptController for Nvic {
    fn enable(&self, irq: u16, priority: u8) {
        // Safety: priority changes don't break priority-based critical
        // sections in this crate; drivers only use critical_section.
        unsafe {
            let mut peripherals = cortex_m::Peripherals::steal();
            peripherals.NVIC.set_priority(Irq(irq), priority);
            NVIC::unmask(Irq(irq));
        }
    }

    fn disable(&self, irq: u16) {
        NVIC::mask(Irq(irq));
    }

    fn clear_pending(&self, irq: u16) {
        NVIC::unpend(Irq(irq));
    }
}

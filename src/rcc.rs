//! Peripheral clock gates
//!
//! The clock tree is the application's business. This module only gates and
//! resets peripheral clocks, and reports the bus frequencies that the
//! application configured.

use core::cell::Cell;

use critical_section::Mutex;

use crate::ral::{self, Static};
use crate::resources::Clocks;

/// Peripheral bus of a clock gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bus {
    Ahb1,
    Ahb2,
    Apb1,
    Apb2,
}

impl Bus {
    /// Slot in the RCC reset and enable banks.
    const fn slot(self) -> usize {
        match self {
            Bus::Ahb1 => 0,
            Bus::Ahb2 => 1,
            Bus::Apb1 => 4,
            Bus::Apb2 => 5,
        }
    }
}

/// A peripheral's clock gate: its bus, and its bit in that bus's enable and
/// reset registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockId {
    pub bus: Bus,
    pub bit: u8,
}

impl ClockId {
    pub const fn new(bus: Bus, bit: u8) -> Self {
        Self { bus, bit }
    }

    const fn mask(self) -> u32 {
        1 << self.bit
    }
}

/// Bus clock frequencies, in Hz, as configured by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frequencies {
    pub ahb: u32,
    pub apb1: u32,
    pub apb2: u32,
}

/// RCC clock gate driver.
///
/// Enable and reset registers are shared by every peripheral on a bus. All
/// updates are read-modify-write inside a critical section.
pub struct Rcc {
    registers: Static<ral::rcc::RegisterBlock>,
    frequencies: Mutex<Cell<Frequencies>>,
}

// Safety: OK to allocate in a static context. Register updates happen in
// critical sections.
unsafe impl Sync for Rcc {}

impl Rcc {
    /// Create the clock gate driver.
    ///
    /// # Safety
    ///
    /// `registers` must point to the RCC register block. Create only one
    /// `Rcc`.
    pub const unsafe fn new(registers: *const (), frequencies: Frequencies) -> Self {
        Self {
            registers: Static(registers.cast()),
            frequencies: Mutex::new(Cell::new(frequencies)),
        }
    }

    /// Record new bus frequencies after the application changes the clock
    /// tree.
    pub fn set_frequencies(&self, frequencies: Frequencies) {
        critical_section::with(|cs| self.frequencies.borrow(cs).set(frequencies));
    }

    /// Returns `true` if the peripheral clock is enabled.
    pub fn is_enabled(&self, clock: ClockId) -> bool {
        self.registers.ENR[clock.bus.slot()].read() & clock.mask() != 0
    }
}

impl Clocks for Rcc {
    fn frequency(&self, clock: ClockId) -> u32 {
        let frequencies = critical_section::with(|cs| self.frequencies.borrow(cs).get());
        match clock.bus {
            Bus::Ahb1 | Bus::Ahb2 => frequencies.ahb,
            Bus::Apb1 => frequencies.apb1,
            Bus::Apb2 => frequencies.apb2,
        }
    }

    fn enable(&self, clock: ClockId) {
        let enr = &self.registers.ENR[clock.bus.slot()];
        critical_section::with(|_| enr.write(enr.read() | clock.mask()));
        // Dummy read. The enable takes effect a couple of bus cycles later.
        let _ = enr.read();
    }

    fn disable(&self, clock: ClockId) {
        let enr = &self.registers.ENR[clock.bus.slot()];
        critical_section::with(|_| enr.write(enr.read() & !clock.mask()));
    }

    fn reset(&self, clock: ClockId) {
        let rstr = &self.registers.RSTR[clock.bus.slot()];
        critical_section::with(|_| {
            rstr.write(rstr.read() | clock.mask());
            rstr.write(rstr.read() & !clock.mask());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQUENCIES: Frequencies = Frequencies {
        ahb: 84_000_000,
        apb1: 42_000_000,
        apb2: 84_000_000,
    };

    #[test]
    fn enable_is_read_modify_write() {
        let regs: ral::rcc::RegisterBlock = ral::zeroed();
        regs.ENR[4].write(1 << 3);
        let rcc = unsafe { Rcc::new(&regs as *const _ as *const (), FREQUENCIES) };

        let i2c1 = ClockId::new(Bus::Apb1, 21);
        rcc.enable(i2c1);
        assert_eq!(regs.ENR[4].read(), 1 << 3 | 1 << 21);
        assert!(rcc.is_enabled(i2c1));

        rcc.disable(i2c1);
        assert_eq!(regs.ENR[4].read(), 1 << 3);
    }

    #[test]
    fn reset_pulses_and_releases() {
        let regs: ral::rcc::RegisterBlock = ral::zeroed();
        let rcc = unsafe { Rcc::new(&regs as *const _ as *const (), FREQUENCIES) };
        rcc.reset(ClockId::new(Bus::Apb2, 12));
        assert_eq!(regs.RSTR[5].read(), 0);
    }

    #[test]
    fn frequency_by_bus() {
        let regs: ral::rcc::RegisterBlock = ral::zeroed();
        let rcc = unsafe { Rcc::new(&regs as *const _ as *const (), FREQUENCIES) };
        assert_eq!(rcc.frequency(ClockId::new(Bus::Apb1, 17)), 42_000_000);
        assert_eq!(rcc.frequency(ClockId::new(Bus::Apb2, 4)), 84_000_000);
        assert_eq!(rcc.frequency(ClockId::new(Bus::Ahb1, 22)), 84_000_000);
    }
}

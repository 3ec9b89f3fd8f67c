//! GPIO pins for peripheral routing
//!
//! A GPIO port is shared by every pin on it, and possibly by pins of several
//! drivers. Mode, type, pull, and alternate function updates are
//! read-modify-write in a critical section. Output levels go through `BSRR`,
//! which the hardware updates atomically.

use crate::ral::{self, Static};
use crate::resources::{Pin, PinMode, Pull};

/// A GPIO port.
pub struct Port {
    registers: Static<ral::gpio::RegisterBlock>,
}

// Safety: OK to allocate in a static context. Shared registers are updated
// in critical sections or through BSRR.
unsafe impl Sync for Port {}

impl Port {
    /// Create a port driver.
    ///
    /// # Safety
    ///
    /// `registers` must point to a GPIO port register block, and the port's
    /// clock must be enabled before any pin is configured.
    pub const unsafe fn new(registers: *const ()) -> Self {
        Self {
            registers: Static(registers.cast()),
        }
    }

    /// Returns the pin at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is 16 or greater.
    pub const fn pin(&self, index: u8) -> GpioPin<'_> {
        assert!(index < 16);
        GpioPin { port: self, index }
    }
}

/// One pin of a GPIO [`Port`].
#[derive(Clone, Copy)]
pub struct GpioPin<'p> {
    port: &'p Port,
    index: u8,
}

impl GpioPin<'_> {
    /// The pin number within its port.
    pub fn index(&self) -> u8 {
        self.index
    }

    fn modify(&self, register: &ral_registers::RWRegister<u32>, index: u32, width: u32, value: u32) {
        let shift = index * width;
        let mask = ((1 << width) - 1) << shift;
        critical_section::with(|_| {
            register.write((register.read() & !mask) | ((value << shift) & mask));
        });
    }
}

impl Pin for GpioPin<'_> {
    fn configure(&self, mode: PinMode) {
        let regs = &*self.port.registers;
        let index = self.index as u32;
        let (moder, open_drain, pull) = match mode {
            PinMode::Analog => (0b11, false, Pull::None),
            PinMode::Input(pull) => (0b00, false, pull),
            PinMode::Output { open_drain } => (0b01, open_drain, Pull::None),
            PinMode::Alternate {
                function,
                open_drain,
            } => {
                let afr = &regs.AFR[(index / 8) as usize];
                self.modify(afr, index % 8, 4, function as u32);
                (0b10, open_drain, Pull::None)
            }
        };
        let pupdr = match pull {
            Pull::None => 0b00,
            Pull::Up => 0b01,
            Pull::Down => 0b10,
        };
        self.modify(&regs.OTYPER, index, 1, open_drain as u32);
        self.modify(&regs.PUPDR, index, 2, pupdr);
        // Highest speed for anything a peripheral drives.
        self.modify(&regs.OSPEEDR, index, 2, 0b11);
        self.modify(&regs.MODER, index, 2, moder);
    }

    fn set_high(&self) {
        self.port.registers.BSRR.write(1 << self.index);
    }

    fn set_low(&self) {
        self.port.registers.BSRR.write(1 << (self.index + 16));
    }

    fn is_high(&self) -> bool {
        self.port.registers.IDR.read() & (1 << self.index) != 0
    }
}

impl embedded_hal::digital::ErrorType for GpioPin<'_> {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for GpioPin<'_> {
    fn set_high(&mut self) -> Result<(), Self::Error> {
        Pin::set_high(self);
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), Self::Error> {
        Pin::set_low(self);
        Ok(())
    }
}

impl embedded_hal::digital::InputPin for GpioPin<'_> {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(Pin::is_high(self))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!Pin::is_high(self))
    }
}

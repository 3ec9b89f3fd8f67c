//! Services that drivers consume, and the static description of a peripheral
//!
//! A driver never owns its clock gate, its interrupt line, its pins, or its
//! DMA channels. It holds references to the services that manage them. Those
//! services may be shared across peripherals, so implementations must make
//! their own read-modify-write sequences safe against interrupts.

use crate::dma::DmaChannel;
use crate::rcc::ClockId;

/// Peripheral clock gating and frequency queries.
pub trait Clocks {
    /// Frequency of the clock that feeds `clock`'s peripheral, in Hz.
    fn frequency(&self, clock: ClockId) -> u32;
    /// Enable the peripheral clock.
    fn enable(&self, clock: ClockId);
    /// Disable the peripheral clock.
    fn disable(&self, clock: ClockId);
    /// Pulse the peripheral reset, returning its registers to defaults.
    fn reset(&self, clock: ClockId);
}

/// Interrupt line control.
pub trait InterruptController {
    /// Set the line's priority, then unmask it.
    fn enable(&self, irq: u16, priority: u8);
    /// Mask the line.
    fn disable(&self, irq: u16);
    /// Drop any pending request on the line.
    fn clear_pending(&self, irq: u16);
}

/// Pull resistor selection for inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pull {
    None,
    Up,
    Down,
}

/// The function of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinMode {
    /// Analog; the safe, low-leakage state of an unused pin.
    Analog,
    /// Digital input.
    Input(Pull),
    /// Software-controlled output.
    Output { open_drain: bool },
    /// Routed to a peripheral through alternate function `function`.
    Alternate { function: u8, open_drain: bool },
}

/// A pin that a driver can route and, for a few protocol corner cases,
/// drive by hand.
pub trait Pin {
    /// Change the pin's function.
    fn configure(&self, mode: PinMode);
    /// Drive the output high, or release an open-drain output.
    fn set_high(&self);
    /// Drive the output low.
    fn set_low(&self);
    /// Sample the pin level.
    fn is_high(&self) -> bool;
}

/// A pin bound to a peripheral signal.
#[derive(Clone, Copy)]
pub struct PinBinding<'d> {
    /// The pin.
    pub pin: &'d dyn Pin,
    /// Alternate function number that routes the signal, `0..=15`.
    pub function: u8,
}

impl<'d> PinBinding<'d> {
    /// Bind `pin` through alternate function `function`.
    pub const fn new(pin: &'d dyn Pin, function: u8) -> Self {
        Self { pin, function }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.function <= 15
    }

    /// Route the pin to the peripheral.
    pub(crate) fn connect(&self, open_drain: bool) {
        self.pin.configure(PinMode::Alternate {
            function: self.function,
            open_drain,
        });
    }

    /// Return the pin to its safe state.
    pub(crate) fn disconnect(&self) {
        self.pin.configure(PinMode::Analog);
    }
}

/// Checks that every bound pin has a valid alternate function.
pub(crate) fn validate_pins(pins: &[Option<PinBinding<'_>>]) -> crate::Result<()> {
    if pins.iter().flatten().all(PinBinding::is_valid) {
        Ok(())
    } else {
        Err(crate::Error::Parameter)
    }
}

/// The static description of one peripheral instance.
///
/// Build one per physical peripheral, and hand it to that peripheral's
/// driver. Everything here is fixed for the life of the program.
#[derive(Clone, Copy)]
pub struct Resources<'d> {
    /// Clock gate and reset line of the peripheral.
    pub clock: ClockId,
    /// The peripheral's interrupt number. For I2C, this is the event
    /// interrupt.
    pub irq: u16,
    /// Priority for the peripheral's interrupts.
    ///
    /// DMA channels bound to this peripheral must interrupt at the same
    /// priority, so that the DMA completion path and the peripheral
    /// interrupt never preempt each other.
    pub priority: u8,
    /// Clock service.
    pub clocks: &'d dyn Clocks,
    /// Interrupt controller.
    pub interrupts: &'d dyn InterruptController,
    /// Optional DMA channel for transmitted data.
    pub dma_tx: Option<&'d dyn DmaChannel>,
    /// Optional DMA channel for received data.
    pub dma_rx: Option<&'d dyn DmaChannel>,
}

impl Resources<'_> {
    /// Bring up the clock, reset the peripheral, and arm the interrupt.
    pub(crate) fn power_up(&self, irqs: &[u16]) {
        self.clocks.enable(self.clock);
        self.clocks.reset(self.clock);
        for channel in self.dma_tx.iter().chain(self.dma_rx.iter()) {
            channel.initialize();
        }
        for &irq in irqs {
            self.interrupts.clear_pending(irq);
            self.interrupts.enable(irq, self.priority);
        }
    }

    /// Undo [`power_up`](Self::power_up). Safe from any state.
    pub(crate) fn power_down(&self, irqs: &[u16]) {
        for &irq in irqs {
            self.interrupts.disable(irq);
            self.interrupts.clear_pending(irq);
        }
        for channel in self.dma_tx.iter().chain(self.dma_rx.iter()) {
            channel.disable();
            channel.uninitialize();
        }
        self.clocks.reset(self.clock);
        self.clocks.disable(self.clock);
    }

    /// Frequency of the peripheral's kernel clock.
    pub(crate) fn frequency(&self) -> u32 {
        self.clocks.frequency(self.clock)
    }
}

//! Interrupt and DMA driven serial drivers for STM32 processors.
//!
//! `stm32-serial` provides SPI, USART, and I2C drivers that move data in the
//! background. You start a transfer, it returns right away, and the driver
//! reports completion and errors through a callback that runs in interrupt
//! context.
//!
//! Every driver follows the same lifecycle:
//!
//! 1. [`initialize`](Driver::initialize) binds the pins and the callback.
//! 2. [`power_control`](Driver::power_control) clocks the peripheral and arms
//!    its interrupts.
//! 3. [`control`](Driver::control) applies protocol parameters.
//! 4. Transfers run until you power off.
//!
//! # Getting started
//!
//! A driver doesn't own its clock gate, interrupt line, pins, or DMA
//! channels. It borrows the services that manage them through a
//! [`Resources`](resources::Resources) descriptor. This crate implements
//! those services for the STM32F4 [`Rcc`](rcc::Rcc), the Cortex-M
//! [`Nvic`](interrupt::Nvic), [`gpio`] ports, and [`dma`] streams. You may
//! substitute your own.
//!
//! ```no_run
//! use stm32_serial::{gpio, rcc, resources, usart, Driver, Events, PowerState};
//! use stm32_serial::interrupt::Nvic;
//! # const RCC_PTR: *const () = core::ptr::null();
//! # const GPIOA_PTR: *const () = core::ptr::null();
//! # const USART2_PTR: *const () = core::ptr::null();
//!
//! static RCC: rcc::Rcc = unsafe {
//!     rcc::Rcc::new(RCC_PTR, rcc::Frequencies { ahb: 16_000_000, apb1: 16_000_000, apb2: 16_000_000 })
//! };
//! static NVIC: Nvic = Nvic;
//! // Safety: the address is GPIOA.
//! static GPIOA: gpio::Port = unsafe { gpio::Port::new(GPIOA_PTR) };
//! static TX: gpio::GpioPin = GPIOA.pin(2);
//! static RX: gpio::GpioPin = GPIOA.pin(3);
//!
//! // Safety: the address is USART2, and there's only one USART2 driver.
//! static USART2: usart::Usart = unsafe {
//!     usart::Usart::new(
//!         USART2_PTR,
//!         resources::Resources {
//!             clock: rcc::ClockId::new(rcc::Bus::Apb1, 17),
//!             irq: 38,
//!             priority: 0x80,
//!             clocks: &RCC,
//!             interrupts: &NVIC,
//!             dma_tx: None,
//!             dma_rx: None,
//!         },
//!         usart::Pins {
//!             tx: Some(resources::PinBinding::new(&TX, 7)),
//!             rx: Some(resources::PinBinding::new(&RX, 7)),
//!             ck: None,
//!             rts: None,
//!             cts: None,
//!         },
//!     )
//! };
//!
//! static ON_EVENT: fn(Events) = |events| {
//!     if events.contains(Events::SEND_COMPLETE) {
//!         // ...
//!     }
//! };
//!
//! fn main() -> stm32_serial::Result<()> {
//!     USART2.initialize(Some(&ON_EVENT))?;
//!     USART2.power_control(PowerState::Full)?;
//!     USART2.control(usart::Control::Configure(usart::Config::default()))?;
//!     static GREETING: [u8; 5] = *b"hello";
//!     // Safety: the buffer is static and never written.
//!     unsafe { USART2.send(GREETING.as_ptr(), GREETING.len())? };
//!     Ok(())
//! }
//!
//! // Call from the USART2 interrupt handler.
//! fn usart2() {
//!     USART2.on_interrupt();
//! }
//! ```
//!
//! # Concurrency
//!
//! Entry points may run in thread mode and be preempted by the driver's own
//! interrupts. Every driver keeps its mutable state behind a
//! [`critical_section::Mutex`], and makes its decisions inside a critical
//! section. The callback always runs after the critical section ends, once per
//! interrupt entry, with all events of that entry.
//!
//! A peripheral's DMA streams must interrupt at the same priority as the
//! peripheral itself. Then, the DMA completion handlers and the peripheral
//! handler never preempt each other.
//!
//! The one blocking operation is [`I2c::bus_clear`](i2c::I2c::bus_clear).
//!
//! ### License
//!
//! Licensed under either of
//!
//! - [Apache License, Version 2.0](http://www.apache.org/licenses/LICENSE-2.0) ([LICENSE-APACHE](./LICENSE-APACHE))
//! - [MIT License](http://opensource.org/licenses/MIT) ([LICENSE-MIT](./LICENSE-MIT))
//!
//! at your option.
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted
//! for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
//! dual licensed as above, without any additional terms or conditions.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod fmt;

pub mod dma;
mod error;
mod event;
pub mod gpio;
pub mod i2c;
pub mod interrupt;
mod lifecycle;
mod ral;
pub mod rcc;
pub mod resources;
pub mod spi;
#[cfg(test)]
mod testing;
mod transfer;
pub mod usart;
mod word;

pub use error::Error;
pub use event::{Callback, Events};
pub use lifecycle::{PowerState, RunState};
pub use word::{Width, Word};

/// A driver result
pub type Result<T> = core::result::Result<T, Error>;

/// The lifecycle every serial driver shares.
///
/// Entry points are synchronous and never wait for hardware. They check their
/// arguments, then their state, then whether a transfer is active, and
/// return the first failure.
pub trait Driver<'d> {
    /// Protocol commands accepted by [`control`](Self::control).
    type Control;
    /// Busy and sticky error flags reported by [`status`](Self::status).
    type Status;

    /// Bind the pins and the event callback.
    ///
    /// Repeated calls return `Ok` without rebinding. Fails with
    /// [`Error::Parameter`] if a pin binding is invalid.
    fn initialize(&self, callback: Option<Callback<'d>>) -> Result<()>;

    /// Power off if needed, then return the pins to their safe state.
    fn uninitialize(&self) -> Result<()>;

    /// Switch the peripheral's power.
    ///
    /// `Full` requires an initialized driver, and is a no-op when the
    /// peripheral is already powered. `Off` is accepted from any state, and
    /// discards transfer state and sticky flags. `Low` isn't supported.
    fn power_control(&self, state: PowerState) -> Result<()>;

    /// Apply a protocol command.
    fn control(&self, command: Self::Control) -> Result<()>;

    /// Busy and sticky error flags.
    fn status(&self) -> Self::Status;
}

//! Host doubles for the services a driver consumes.

use core::cell::{Cell, RefCell};
use std::vec::Vec;

use crate::dma::{DmaChannel, DmaStatus, DmaTransfer};
use crate::event::Events;
use crate::rcc::{Bus, ClockId};
use crate::resources::{Clocks, InterruptController, Pin, PinMode};
use crate::transfer::Port;

/// Pointer to a register block allocated in a test.
pub fn ptr<T>(block: &T) -> *const () {
    (block as *const T).cast()
}

/// Clock service that remembers gates and counts resets.
pub struct FakeClocks {
    frequency: u32,
    enabled: Cell<[u32; 4]>,
    resets: Cell<u32>,
}

fn slot(bus: Bus) -> usize {
    match bus {
        Bus::Ahb1 => 0,
        Bus::Ahb2 => 1,
        Bus::Apb1 => 2,
        Bus::Apb2 => 3,
    }
}

impl FakeClocks {
    pub fn new(frequency: u32) -> Self {
        Self {
            frequency,
            enabled: Cell::new([0; 4]),
            resets: Cell::new(0),
        }
    }

    pub fn is_enabled(&self, clock: ClockId) -> bool {
        self.enabled.get()[slot(clock.bus)] & (1 << clock.bit) != 0
    }

    pub fn resets(&self) -> u32 {
        self.resets.get()
    }
}

impl Clocks for FakeClocks {
    fn frequency(&self, _: ClockId) -> u32 {
        self.frequency
    }
    fn enable(&self, clock: ClockId) {
        let mut enabled = self.enabled.get();
        enabled[slot(clock.bus)] |= 1 << clock.bit;
        self.enabled.set(enabled);
    }
    fn disable(&self, clock: ClockId) {
        let mut enabled = self.enabled.get();
        enabled[slot(clock.bus)] &= !(1 << clock.bit);
        self.enabled.set(enabled);
    }
    fn reset(&self, _: ClockId) {
        self.resets.set(self.resets.get() + 1);
    }
}

/// Interrupt controller that remembers which lines are unmasked.
#[derive(Default)]
pub struct FakeInterrupts {
    lines: RefCell<Vec<(u16, u8)>>,
    cleared: Cell<u32>,
}

impl FakeInterrupts {
    /// Priority of an unmasked line, or `None` if the line is masked.
    pub fn priority(&self, irq: u16) -> Option<u8> {
        self.lines
            .borrow()
            .iter()
            .find(|(line, _)| *line == irq)
            .map(|(_, priority)| *priority)
    }

    pub fn is_enabled(&self, irq: u16) -> bool {
        self.priority(irq).is_some()
    }

    pub fn cleared(&self) -> u32 {
        self.cleared.get()
    }
}

impl InterruptController for FakeInterrupts {
    fn enable(&self, irq: u16, priority: u8) {
        self.disable(irq);
        self.lines.borrow_mut().push((irq, priority));
    }
    fn disable(&self, irq: u16) {
        self.lines.borrow_mut().retain(|(line, _)| *line != irq);
    }
    fn clear_pending(&self, _: u16) {
        self.cleared.set(self.cleared.get() + 1);
    }
}

/// A pin with a level and a mode.
///
/// Reads follow the driven level, except that [`hold_low`](Self::hold_low)
/// makes the next few reads see the line held low by another device.
pub struct FakePin {
    mode: Cell<Option<PinMode>>,
    level: Cell<bool>,
    held: Cell<u32>,
    falling: Cell<u32>,
}

impl Default for FakePin {
    fn default() -> Self {
        Self {
            mode: Cell::new(None),
            level: Cell::new(true),
            held: Cell::new(0),
            falling: Cell::new(0),
        }
    }
}

impl FakePin {
    pub fn mode(&self) -> Option<PinMode> {
        self.mode.get()
    }

    /// The level this side drives.
    pub fn level(&self) -> bool {
        self.level.get()
    }

    /// Another device holds the line low for the next `reads` samples.
    pub fn hold_low(&self, reads: u32) {
        self.held.set(reads);
    }

    /// Number of high-to-low transitions this side drove.
    pub fn falling_edges(&self) -> u32 {
        self.falling.get()
    }
}

impl Pin for FakePin {
    fn configure(&self, mode: PinMode) {
        self.mode.set(Some(mode));
    }
    fn set_high(&self) {
        self.level.set(true);
    }
    fn set_low(&self) {
        if self.level.get() {
            self.falling.set(self.falling.get() + 1);
        }
        self.level.set(false);
    }
    fn is_high(&self) -> bool {
        let held = self.held.get();
        if held > 0 {
            self.held.set(held - 1);
            false
        } else {
            self.level.get()
        }
    }
}

/// A DMA channel that moves nothing on its own.
///
/// Tests move items with [`advance`](Self::advance), which raises the
/// completion flag once the count reaches zero.
#[derive(Default)]
pub struct FakeDma {
    transfer: Cell<Option<DmaTransfer>>,
    enabled: Cell<bool>,
    initialized: Cell<bool>,
    remaining: Cell<u16>,
    status: Cell<DmaStatus>,
}

impl FakeDma {
    pub fn transfer(&self) -> Option<DmaTransfer> {
        self.transfer.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// Move `items` items.
    pub fn advance(&self, items: u16) {
        let remaining = self.remaining.get().saturating_sub(items);
        self.remaining.set(remaining);
        if remaining == 0 {
            self.flag_complete();
        }
    }

    pub fn flag_complete(&self) {
        let mut status = self.status.get();
        status.complete = true;
        self.status.set(status);
    }

    pub fn flag_error(&self) {
        let mut status = self.status.get();
        status.error = true;
        self.status.set(status);
    }
}

impl DmaChannel for FakeDma {
    fn initialize(&self) {
        self.initialized.set(true);
    }
    fn uninitialize(&self) {
        self.initialized.set(false);
    }
    unsafe fn configure(&self, transfer: &DmaTransfer) {
        self.enabled.set(false);
        self.transfer.set(Some(*transfer));
        self.remaining.set(transfer.count);
        self.status.set(DmaStatus::default());
    }
    fn enable(&self) {
        self.enabled.set(true);
    }
    fn disable(&self) {
        self.enabled.set(false);
    }
    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }
    fn remaining(&self) -> u16 {
        self.remaining.get()
    }
    fn take_status(&self) -> DmaStatus {
        self.status.replace(DmaStatus::default())
    }
}

/// A data path that records what the engine does to it.
#[derive(Default)]
pub struct FakePort {
    data: Cell<u16>,
    written: RefCell<Vec<u16>>,
    tx_listening: Cell<bool>,
    rx_listening: Cell<bool>,
    tx_requesting: Cell<bool>,
    rx_requesting: Cell<bool>,
}

impl FakePort {
    pub fn written(&self) -> Vec<u16> {
        self.written.borrow().clone()
    }
    pub fn tx_listening(&self) -> bool {
        self.tx_listening.get()
    }
    pub fn rx_listening(&self) -> bool {
        self.rx_listening.get()
    }
    pub fn tx_requesting(&self) -> bool {
        self.tx_requesting.get()
    }
}

impl Port for FakePort {
    fn data_register(&self) -> *const () {
        ptr(&self.data)
    }
    fn write(&self, word: u16) {
        self.written.borrow_mut().push(word);
    }
    fn read(&self) -> u16 {
        self.data.get()
    }
    fn listen_tx(&self, enable: bool) {
        self.tx_listening.set(enable);
    }
    fn listen_rx(&self, enable: bool) {
        self.rx_listening.set(enable);
    }
    fn request_tx(&self, enable: bool) {
        self.tx_requesting.set(enable);
    }
    fn request_rx(&self, enable: bool) {
        self.rx_requesting.set(enable);
    }
}

/// Collects the events a driver reports.
#[derive(Default)]
pub struct Recorder {
    events: RefCell<Vec<Events>>,
}

impl Recorder {
    pub fn record(&self, events: Events) {
        self.events.borrow_mut().push(events);
    }

    /// Every callback invocation, in order.
    pub fn events(&self) -> Vec<Events> {
        self.events.borrow().clone()
    }

    pub fn last(&self) -> Option<Events> {
        self.events.borrow().last().copied()
    }

    pub fn count(&self) -> usize {
        self.events.borrow().len()
    }
}

/// A delay that only adds up how long it was asked to wait.
#[derive(Default)]
pub struct FakeDelay {
    pub ns: u64,
}

impl embedded_hal::delay::DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.ns += ns as u64;
    }
}

//! The transfer engine shared by byte-oriented serial drivers.
//!
//! A transfer has two lanes, one per direction. Each lane tracks the caller's
//! buffer (if any), how many items it wants, how many moved, and whether DMA
//! or the peripheral interrupt moves them. The engine doesn't know any
//! register layout; drivers describe their data path through [`Port`].
//!
//! The engine never locks anything itself. Drivers call into it from inside
//! their critical sections, both from entry points and from interrupts.

use core::cell::UnsafeCell;

use crate::dma::{DmaChannel, DmaStatus, DmaTransfer, Direction};
use crate::event::Events;
use crate::word::{self, Width};

/// The data path of a serial peripheral.
pub(crate) trait Port {
    /// The receiver interrupt stays enabled when no receive is active, so
    /// that unexpected data is drained and reported.
    const KEEP_RX_ARMED: bool = false;

    /// Address of the data register, for DMA endpoints.
    fn data_register(&self) -> *const ();
    /// Write one item to the data register.
    fn write(&self, word: u16);
    /// Read one item from the data register.
    fn read(&self) -> u16;
    /// Enable or disable the "transmit buffer empty" interrupt.
    fn listen_tx(&self, enable: bool);
    /// Enable or disable the "receive buffer not empty" interrupt.
    fn listen_rx(&self, enable: bool);
    /// Enable or disable the transmit DMA request.
    fn request_tx(&self, enable: bool);
    /// Enable or disable the receive DMA request.
    fn request_rx(&self, enable: bool);
}

/// What the caller asked for, as opposed to what the hardware has to do.
///
/// Synchronous links clock both directions for every item. The engine runs
/// both lanes, but reports completion for the caller's intent only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Intent {
    Tx,
    Rx,
    TxRx,
}

impl Intent {
    pub(crate) fn completion(self) -> Events {
        match self {
            Intent::Tx => Events::SEND_COMPLETE,
            Intent::Rx => Events::RECEIVE_COMPLETE,
            Intent::TxRx => Events::TRANSFER_COMPLETE,
        }
    }
}

/// How a lane's items move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Transport {
    Interrupt,
    Dma,
}

/// One direction of a transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lane {
    /// Caller's buffer. Null when the lane only keeps the clock running.
    buffer: *mut u8,
    pub(crate) num: usize,
    pub(crate) cnt: usize,
    pub(crate) transport: Transport,
    pub(crate) active: bool,
}

impl Lane {
    pub(crate) const IDLE: Self = Self {
        buffer: core::ptr::null_mut(),
        num: 0,
        cnt: 0,
        transport: Transport::Interrupt,
        active: false,
    };

    fn arm(&mut self, buffer: *mut u8, num: usize) {
        *self = Self {
            buffer,
            num,
            cnt: 0,
            transport: Transport::Interrupt,
            active: true,
        };
    }

    /// Items moved so far. Reads the DMA counter while DMA is moving them.
    pub(crate) fn progress(&self, channel: Option<&dyn DmaChannel>) -> usize {
        match (self.active, self.transport, channel) {
            (true, Transport::Dma, Some(channel)) => {
                self.num.saturating_sub(channel.remaining() as usize)
            }
            _ => self.cnt,
        }
    }

    pub(crate) fn has_buffer(&self) -> bool {
        !self.buffer.is_null()
    }

    fn finish(&mut self) {
        self.cnt = self.num;
        self.active = false;
    }
}

/// Stable memory for DMA when a lane has no buffer.
///
/// The transmit slot holds the default value; the receive slot absorbs
/// discarded items. Lives outside the driver's critical-section state so that
/// its address never changes.
pub(crate) struct Scratch {
    tx: UnsafeCell<u16>,
    rx: UnsafeCell<u16>,
}

impl Scratch {
    pub(crate) const fn new() -> Self {
        Self {
            tx: UnsafeCell::new(0),
            rx: UnsafeCell::new(0),
        }
    }

    fn fill(&self, value: u16) -> *const () {
        // Safety: only written here, with the tx DMA lane idle.
        unsafe { self.tx.get().write_volatile(value) };
        self.tx.get().cast_const().cast()
    }

    fn sink(&self) -> *const () {
        self.rx.get().cast_const().cast()
    }
}

/// Result of a DMA completion interrupt for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum DmaOutcome {
    /// The lane moved every item.
    Complete,
    /// The channel reported a bus error. The lane is stopped.
    Failed,
    /// Nothing to report: a stale flag, or the lane was aborted.
    Ignored,
}

/// The state of one transfer.
pub(crate) struct TransferInfo {
    pub(crate) tx: Lane,
    pub(crate) rx: Lane,
    /// Item width, fixed by the driver's configuration.
    pub(crate) width: Width,
    /// Sent when a lane has no buffer.
    pub(crate) default: u16,
    pub(crate) intent: Intent,
}

impl TransferInfo {
    pub(crate) const fn new() -> Self {
        Self {
            tx: Lane::IDLE,
            rx: Lane::IDLE,
            width: Width::Byte,
            default: 0,
            intent: Intent::Tx,
        }
    }

    /// Drop all transfer state, keeping the configuration.
    pub(crate) fn clear(&mut self) {
        self.tx = Lane::IDLE;
        self.rx = Lane::IDLE;
    }

    pub(crate) fn arm_tx(&mut self, buffer: *const u8, num: usize) {
        self.tx.arm(buffer.cast_mut(), num);
    }

    pub(crate) fn arm_rx(&mut self, buffer: *mut u8, num: usize) {
        self.rx.arm(buffer, num);
    }

    /// Start moving the transmit lane.
    ///
    /// With a DMA channel, the channel moves every item. Otherwise, the first
    /// item goes straight into the data register before the "buffer empty"
    /// interrupt is enabled; some peripherals never raise the first one.
    ///
    /// # Safety
    ///
    /// The lane's buffer must be valid for the whole transfer.
    pub(crate) unsafe fn start_tx<P: Port>(
        &mut self,
        port: &P,
        dma: Option<&dyn DmaChannel>,
        scratch: &Scratch,
    ) {
        match dma.filter(|_| fits_dma(self.tx.num)) {
            Some(channel) => {
                self.tx.transport = Transport::Dma;
                let (memory, increment) = if self.tx.has_buffer() {
                    (self.tx.buffer.cast_const().cast(), true)
                } else {
                    (scratch.fill(self.default), false)
                };
                channel.configure(&DmaTransfer {
                    direction: Direction::MemoryToPeripheral,
                    peripheral: port.data_register(),
                    memory,
                    count: self.tx.num as u16,
                    width: self.width,
                    increment,
                });
                channel.enable();
                port.request_tx(true);
            }
            None => {
                self.tx.transport = Transport::Interrupt;
                let word = self.next_tx();
                port.write(word);
                port.listen_tx(true);
            }
        }
    }

    /// Start moving the receive lane. Call before [`start_tx`](Self::start_tx)
    /// on duplex links, so that no received item is missed.
    ///
    /// # Safety
    ///
    /// The lane's buffer must be valid for the whole transfer.
    pub(crate) unsafe fn start_rx<P: Port>(
        &mut self,
        port: &P,
        dma: Option<&dyn DmaChannel>,
        scratch: &Scratch,
    ) {
        match dma.filter(|_| fits_dma(self.rx.num)) {
            Some(channel) => {
                self.rx.transport = Transport::Dma;
                let (memory, increment) = if self.rx.has_buffer() {
                    (self.rx.buffer.cast_const().cast(), true)
                } else {
                    (scratch.sink(), false)
                };
                channel.configure(&DmaTransfer {
                    direction: Direction::PeripheralToMemory,
                    peripheral: port.data_register(),
                    memory,
                    count: self.rx.num as u16,
                    width: self.width,
                    increment,
                });
                channel.enable();
                port.request_rx(true);
            }
            None => {
                self.rx.transport = Transport::Interrupt;
                port.listen_rx(true);
            }
        }
    }

    fn next_tx(&mut self) -> u16 {
        let word = if self.tx.has_buffer() {
            // Safety: cnt < num, and the caller vouched for num items.
            unsafe { word::read(self.tx.buffer, self.width, self.tx.cnt) }
        } else {
            self.default
        };
        self.tx.cnt += 1;
        word
    }

    /// Move at most one item out of the transmit lane, in response to a
    /// "buffer empty" interrupt. Returns `true` when the lane just finished.
    pub(crate) fn service_tx<P: Port>(&mut self, port: &P) -> bool {
        if !self.tx.active || self.tx.transport != Transport::Interrupt {
            return false;
        }
        if self.tx.cnt < self.tx.num {
            let word = self.next_tx();
            port.write(word);
        }
        if self.tx.cnt == self.tx.num {
            port.listen_tx(false);
            self.tx.active = false;
            return true;
        }
        false
    }

    /// Store one received item, already read from the data register.
    ///
    /// Returns `None` if no interrupt-driven receive is active, in which case
    /// the item is discarded. Otherwise, returns `Some(true)` when the lane
    /// just finished.
    pub(crate) fn service_rx<P: Port>(&mut self, port: &P, word: u16) -> Option<bool> {
        if !self.rx.active || self.rx.transport != Transport::Interrupt {
            return None;
        }
        if self.rx.has_buffer() {
            // Safety: cnt < num while the lane is active, and the caller
            // vouched for num items.
            unsafe { word::write(self.rx.buffer, self.width, self.rx.cnt, word) };
        }
        self.rx.cnt += 1;
        if self.rx.cnt == self.rx.num {
            if !P::KEEP_RX_ARMED {
                port.listen_rx(false);
            }
            self.rx.active = false;
            return Some(true);
        }
        Some(false)
    }

    /// Handle a transmit DMA interrupt.
    pub(crate) fn finish_dma_tx<P: Port>(&mut self, port: &P, channel: &dyn DmaChannel) -> DmaOutcome {
        let status = channel.take_status();
        let outcome = dma_outcome(&self.tx, channel, status);
        match outcome {
            DmaOutcome::Complete => {
                port.request_tx(false);
                channel.disable();
                self.tx.finish();
            }
            DmaOutcome::Failed => {
                port.request_tx(false);
                channel.disable();
                self.tx.cnt = self.tx.progress(Some(channel));
                self.tx.active = false;
            }
            DmaOutcome::Ignored => {}
        }
        outcome
    }

    /// Handle a receive DMA interrupt.
    pub(crate) fn finish_dma_rx<P: Port>(&mut self, port: &P, channel: &dyn DmaChannel) -> DmaOutcome {
        let status = channel.take_status();
        let outcome = dma_outcome(&self.rx, channel, status);
        match outcome {
            DmaOutcome::Complete => {
                port.request_rx(false);
                channel.disable();
                self.rx.finish();
            }
            DmaOutcome::Failed => {
                port.request_rx(false);
                channel.disable();
                self.rx.cnt = self.rx.progress(Some(channel));
                self.rx.active = false;
            }
            DmaOutcome::Ignored => {}
        }
        outcome
    }

    /// Stop the transmit lane now. No event follows.
    pub(crate) fn abort_tx<P: Port>(&mut self, port: &P, dma: Option<&dyn DmaChannel>) {
        port.listen_tx(false);
        port.request_tx(false);
        if let Some(channel) = dma {
            channel.disable();
            let _ = channel.take_status();
        }
        self.tx.cnt = self.tx.progress(dma);
        self.tx.active = false;
    }

    /// Stop the receive lane now. No event follows.
    pub(crate) fn abort_rx<P: Port>(&mut self, port: &P, dma: Option<&dyn DmaChannel>) {
        if !P::KEEP_RX_ARMED {
            port.listen_rx(false);
        }
        port.request_rx(false);
        if let Some(channel) = dma {
            channel.disable();
            let _ = channel.take_status();
        }
        self.rx.cnt = self.rx.progress(dma);
        self.rx.active = false;
    }
}

fn fits_dma(num: usize) -> bool {
    num <= u16::MAX as usize
}

/// Tells a genuine completion from an abort.
///
/// An aborted lane is already inactive when the stale completion flag shows
/// up, and its channel stopped with items remaining.
fn dma_outcome(lane: &Lane, channel: &dyn DmaChannel, status: DmaStatus) -> DmaOutcome {
    if !lane.active || lane.transport != Transport::Dma {
        DmaOutcome::Ignored
    } else if status.error {
        DmaOutcome::Failed
    } else if status.complete && channel.remaining() == 0 {
        DmaOutcome::Complete
    } else {
        DmaOutcome::Ignored
    }
}

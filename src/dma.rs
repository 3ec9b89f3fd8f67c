//! DMA channels for serial transfers.
//!
//! Serial drivers only need a narrow slice of a DMA controller: move `count`
//! items between a peripheral data register and a buffer, then say whether
//! that finished or failed. [`DmaChannel`] is that slice. Implement it for
//! your DMA controller, or use [`Stream`] on STM32F2/F4 parts.
//!
//! A [`Dma`] manages one stream controller. It's configured with a pointer
//! to the controller registers, and allocates [`Stream`]s.
//!
//! ```no_run
//! use stm32_serial::dma::{Dma, Priority, StreamConfig};
//! use stm32_serial::interrupt::Nvic;
//! use stm32_serial::rcc::{Bus, ClockId, Frequencies, Rcc};
//! # const RCC_PTR: *const () = core::ptr::null();
//! # const DMA2_PTR: *const () = core::ptr::null();
//!
//! static RCC: Rcc = unsafe {
//!     Rcc::new(RCC_PTR, Frequencies { ahb: 84_000_000, apb1: 42_000_000, apb2: 84_000_000 })
//! };
//! static NVIC: Nvic = Nvic;
//! // Safety: the address is the DMA2 controller.
//! static DMA2: Dma = unsafe { Dma::new(DMA2_PTR, ClockId::new(Bus::Ahb1, 22), &RCC, &NVIC) };
//!
//! // Safety: only one stream 0 object.
//! let spi1_rx = unsafe {
//!     DMA2.stream(0, StreamConfig { channel: 3, priority: Priority::High, irq: 56, irq_priority: 5 << 4 })
//! };
//! ```

use core::cell::Cell;

use critical_section::Mutex;

use crate::ral::{self, Static};
use crate::rcc::ClockId;
use crate::resources::{Clocks, InterruptController};
use crate::word::Width;

/// Direction of a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Peripheral data register to memory.
    PeripheralToMemory,
    /// Memory to peripheral data register.
    MemoryToPeripheral,
}

/// One peripheral DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTransfer {
    pub direction: Direction,
    /// The peripheral data register.
    pub peripheral: *const (),
    /// The buffer, or a single scratch item when `increment` is false.
    pub memory: *const (),
    /// Number of items.
    pub count: u16,
    /// Width of each item, on both sides.
    pub width: Width,
    /// Advance `memory` after each item.
    pub increment: bool,
}

/// Flags a channel raised since the last check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaStatus {
    /// The channel moved every item.
    pub complete: bool,
    /// The channel stopped on a bus error.
    pub error: bool,
}

/// A DMA channel that a serial driver can program.
///
/// Drivers call these methods with the peripheral's interrupts serialized, so
/// implementations don't need to guard against the owning driver. They do
/// need to guard state shared with other channels.
pub trait DmaChannel {
    /// Prepare the channel for use. Called when the driver powers up.
    fn initialize(&self);
    /// Release the channel. Called when the driver powers down; must be
    /// harmless if the channel wasn't initialized.
    fn uninitialize(&self);
    /// Program the channel for `transfer`, leaving it disabled.
    ///
    /// # Safety
    ///
    /// Both endpoints must stay valid until the transfer completes or the
    /// channel is disabled.
    unsafe fn configure(&self, transfer: &DmaTransfer);
    /// Start moving data.
    fn enable(&self);
    /// Stop moving data. The remaining count is preserved.
    fn disable(&self);
    /// Returns `true` while the channel is enabled.
    fn is_enabled(&self) -> bool;
    /// Items not yet moved.
    fn remaining(&self) -> u16;
    /// Read and clear the channel's completion flags.
    fn take_status(&self) -> DmaStatus;
}

/// Stream arbitration priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Low,
    Medium,
    High,
    VeryHigh,
}

/// How a stream connects to its peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamConfig {
    /// Request channel selection, `0..=7`. See the DMA request mapping
    /// table of your reference manual.
    pub channel: u8,
    /// Arbitration priority.
    pub priority: Priority,
    /// The stream's interrupt number.
    pub irq: u16,
    /// The stream's interrupt priority. Match the priority of the peripheral
    /// that uses the stream.
    pub irq_priority: u8,
}

/// A DMA stream controller.
///
/// `Dma` allocates [`Stream`]s. It enables the controller clock when the
/// first stream is initialized, and disables it after the last stream is
/// uninitialized.
pub struct Dma<'d> {
    controller: Static<ral::dma::RegisterBlock>,
    clock: ClockId,
    clocks: &'d dyn Clocks,
    interrupts: &'d dyn InterruptController,
    users: Mutex<Cell<u8>>,
}

// Safety: OK to allocate a DMA driver in a static context. Shared state is
// behind a critical section.
unsafe impl Sync for Dma<'_> {}

impl<'d> Dma<'d> {
    /// Create the DMA driver.
    ///
    /// # Safety
    ///
    /// Caller must make sure that `controller` is a pointer to the start of
    /// the DMA controller register block, and that `clock` is that
    /// controller's clock gate.
    pub const unsafe fn new(
        controller: *const (),
        clock: ClockId,
        clocks: &'d dyn Clocks,
        interrupts: &'d dyn InterruptController,
    ) -> Self {
        Self {
            controller: Static(controller.cast()),
            clock,
            clocks,
            interrupts,
            users: Mutex::new(Cell::new(0)),
        }
    }

    /// Creates the DMA stream described by `index`.
    ///
    /// # Safety
    ///
    /// This will create a handle that may alias global, mutable state. You
    /// should only create one stream per index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is 8 or greater, or if the request channel is 8 or
    /// greater.
    pub unsafe fn stream(&'d self, index: usize, config: StreamConfig) -> Stream<'d> {
        assert!(index < 8);
        assert!(config.channel < 8);
        Stream {
            dma: self,
            index,
            config,
            initialized: Mutex::new(Cell::new(false)),
        }
    }

    fn acquire(&self) {
        let first = critical_section::with(|cs| {
            let users = self.users.borrow(cs);
            users.set(users.get() + 1);
            users.get() == 1
        });
        if first {
            debug!("DMA controller clock on");
            self.clocks.enable(self.clock);
        }
    }

    fn release(&self) {
        let last = critical_section::with(|cs| {
            let users = self.users.borrow(cs);
            users.set(users.get().saturating_sub(1));
            users.get() == 0
        });
        if last {
            debug!("DMA controller clock off");
            self.clocks.disable(self.clock);
        }
    }
}

/// A DMA stream.
///
/// The `Stream` stores memory addresses independent of the memory lifetime.
/// You must make sure that the stream's state is valid before enabling a
/// transfer!
pub struct Stream<'d> {
    dma: &'d Dma<'d>,
    /// Our stream number, between [0, 8)
    index: usize,
    config: StreamConfig,
    initialized: Mutex<Cell<bool>>,
}

impl Stream<'_> {
    fn registers(&self) -> &ral::dma::StreamRegisterBlock {
        &self.dma.controller.ST[self.index]
    }

    /// Our stream number.
    pub fn index(&self) -> usize {
        self.index
    }

    fn clear_flags(&self) {
        let bits = ral::dma::flags::ALL << ral::dma::flags::shift(self.index);
        // Immutable write OK. Clear registers are write-1-to-clear; other
        // streams' bits are written as zero.
        if self.index < 4 {
            self.dma.controller.LIFCR.write(bits);
        } else {
            self.dma.controller.HIFCR.write(bits);
        }
    }

    fn flags(&self) -> u32 {
        let isr = if self.index < 4 {
            self.dma.controller.LISR.read()
        } else {
            self.dma.controller.HISR.read()
        };
        (isr >> ral::dma::flags::shift(self.index)) & ral::dma::flags::ALL
    }
}

const fn size(width: Width) -> u32 {
    match width {
        Width::Byte => 0b00,
        Width::HalfWord => 0b01,
    }
}

impl DmaChannel for Stream<'_> {
    fn initialize(&self) {
        let first = critical_section::with(|cs| !self.initialized.borrow(cs).replace(true));
        if first {
            self.dma.acquire();
            self.disable();
            self.clear_flags();
            let dma = self.dma;
            dma.interrupts.clear_pending(self.config.irq);
            dma.interrupts
                .enable(self.config.irq, self.config.irq_priority);
        }
    }

    fn uninitialize(&self) {
        let was = critical_section::with(|cs| self.initialized.borrow(cs).replace(false));
        if was {
            self.disable();
            self.dma.interrupts.disable(self.config.irq);
            self.clear_flags();
            self.dma.release();
        }
    }

    unsafe fn configure(&self, transfer: &DmaTransfer) {
        self.disable();
        self.clear_flags();
        let stream = self.registers();
        stream.PAR.write(transfer.peripheral as u32);
        stream.M0AR.write(transfer.memory as u32);
        ral::write_reg!(crate::ral::dma, stream, NDTR, NDT: transfer.count as u32);
        // Direct mode; the FIFO stays off.
        stream.FCR.write(0);
        let dir = match transfer.direction {
            Direction::PeripheralToMemory => 0b00,
            Direction::MemoryToPeripheral => 0b01,
        };
        ral::write_reg!(
            crate::ral::dma,
            stream,
            CR,
            CHSEL: self.config.channel as u32,
            PL: self.config.priority as u32,
            MSIZE: size(transfer.width),
            PSIZE: size(transfer.width),
            MINC: transfer.increment as u32,
            DIR: dir,
            TCIE: 1,
            TEIE: 1,
            DMEIE: 1
        );
    }

    fn enable(&self) {
        // Immutable write OK. Only this stream writes its CR.
        let stream = self.registers();
        ral::modify_reg!(crate::ral::dma, stream, CR, EN: 1);
    }

    fn disable(&self) {
        let stream = self.registers();
        ral::modify_reg!(crate::ral::dma, stream, CR, EN: 0);
        // The stream finishes its current item before EN reads back as zero.
        for _ in 0..1_000 {
            if !self.is_enabled() {
                break;
            }
        }
    }

    fn is_enabled(&self) -> bool {
        let stream = self.registers();
        ral::read_reg!(crate::ral::dma, stream, CR, EN == 1)
    }

    fn remaining(&self) -> u16 {
        let stream = self.registers();
        ral::read_reg!(crate::ral::dma, stream, NDTR, NDT) as u16
    }

    fn take_status(&self) -> DmaStatus {
        use ral::dma::flags;
        let raised = self.flags();
        if raised != 0 {
            let shifted = raised << flags::shift(self.index);
            if self.index < 4 {
                self.dma.controller.LIFCR.write(shifted);
            } else {
                self.dma.controller.HIFCR.write(shifted);
            }
        }
        DmaStatus {
            complete: raised & flags::TCIF != 0,
            error: raised & (flags::TEIF | flags::DMEIF) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcc::Bus;
    use crate::testing::{FakeClocks, FakeInterrupts};

    const CONFIG: StreamConfig = StreamConfig {
        channel: 3,
        priority: Priority::High,
        irq: 56,
        irq_priority: 0x50,
    };

    #[test]
    fn clock_follows_stream_users() {
        let regs: ral::dma::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(16_000_000);
        let interrupts = FakeInterrupts::default();
        let clock = ClockId::new(Bus::Ahb1, 22);
        let dma = unsafe { Dma::new(&regs as *const _ as *const (), clock, &clocks, &interrupts) };
        let a = unsafe { dma.stream(0, CONFIG) };
        let b = unsafe { dma.stream(5, CONFIG) };

        a.initialize();
        a.initialize();
        b.initialize();
        assert!(clocks.is_enabled(clock));
        assert_eq!(interrupts.priority(56), Some(0x50));

        a.uninitialize();
        a.uninitialize();
        assert!(clocks.is_enabled(clock));
        b.uninitialize();
        assert!(!clocks.is_enabled(clock));
    }

    #[test]
    fn configure_then_enable() {
        let regs: ral::dma::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(16_000_000);
        let interrupts = FakeInterrupts::default();
        let dma = unsafe {
            Dma::new(
                &regs as *const _ as *const (),
                ClockId::new(Bus::Ahb1, 22),
                &clocks,
                &interrupts,
            )
        };
        let stream = unsafe { dma.stream(2, CONFIG) };
        let buffer = [0u16; 4];
        let transfer = DmaTransfer {
            direction: Direction::MemoryToPeripheral,
            peripheral: 0x4001_300C as *const (),
            memory: buffer.as_ptr().cast(),
            count: 4,
            width: Width::HalfWord,
            increment: true,
        };
        unsafe { stream.configure(&transfer) };

        let st = &regs.ST[2];
        assert_eq!(st.PAR.read(), 0x4001_300C);
        assert_eq!(st.NDTR.read(), 4);
        assert_eq!(stream.remaining(), 4);
        let cr = st.CR.read();
        assert_eq!(cr >> 25, 3, "request channel");
        assert_eq!((cr >> 16) & 0b11, 2, "priority");
        assert_eq!((cr >> 13) & 0b11, 1, "memory size");
        assert_eq!((cr >> 6) & 0b11, 1, "memory to peripheral");
        assert_ne!(cr & (1 << 10), 0, "memory increment");
        assert!(!stream.is_enabled());
        assert_eq!(regs.LIFCR.read(), 0x3D << 16);

        stream.enable();
        assert!(stream.is_enabled());
        stream.disable();
        assert!(!stream.is_enabled());
    }

    #[test]
    fn status_from_high_flags() {
        let regs: ral::dma::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(16_000_000);
        let interrupts = FakeInterrupts::default();
        let dma = unsafe {
            Dma::new(
                &regs as *const _ as *const (),
                ClockId::new(Bus::Ahb1, 21),
                &clocks,
                &interrupts,
            )
        };
        let stream = unsafe { dma.stream(7, CONFIG) };
        regs.HISR.write(ral::dma::flags::TCIF << 22);
        assert_eq!(
            stream.take_status(),
            DmaStatus {
                complete: true,
                error: false
            }
        );
        assert_eq!(regs.HIFCR.read(), ral::dma::flags::TCIF << 22);

        regs.HISR.write(ral::dma::flags::TEIF << 22);
        assert!(stream.take_status().error);
    }
}

//! I2C driver.
//!
//! The peripheral is a master while one of your master operations runs, and
//! a slave otherwise. Slave operations arm a buffer for the next time a
//! master addresses us. When a master addresses us without a matching
//! buffer, the driver reports [`Events::SLAVE_TRANSMIT`] or
//! [`Events::SLAVE_RECEIVE`], and you may arm one from the callback. Until
//! then, the driver pads reads with `0xFF` and drops writes.
//!
//! Master receives of one, two, and three bytes follow the reference manual's
//! special sequences. Longer receives read byte-by-byte until three bytes
//! remain, then finish with the three-byte sequence.
//!
//! [`bus_clear`](I2c::bus_clear) is the one blocking operation in this
//! crate. It polls the bus lines, and waits with the delay you provide.

use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;

use crate::dma::{self, DmaChannel, DmaTransfer};
use crate::event::{self, Callback, Events};
use crate::lifecycle::{PowerState, RunState};
use crate::ral::{self, Static};
use crate::resources::{self, Pin, PinBinding, PinMode, Resources};
use crate::transfer::Transport;
use crate::word::{self, Width};
use crate::{Driver, Error, Result};

/// A slave address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Address {
    /// `0..=0x7F`
    SevenBit(u8),
    /// `0..=0x3FF`
    TenBit(u16),
}

impl Address {
    fn is_valid(self) -> bool {
        match self {
            Address::SevenBit(address) => address <= 0x7F,
            Address::TenBit(address) => address <= 0x3FF,
        }
    }

    fn is_ten_bit(self) -> bool {
        matches!(self, Address::TenBit(_))
    }

    /// The first byte after a start condition.
    fn header(self, read: bool) -> u8 {
        let address = match self {
            Address::SevenBit(address) => address << 1,
            Address::TenBit(address) => 0xF0 | ((address >> 7) as u8 & 0x06),
        };
        address | read as u8
    }

    /// The second byte of a 10-bit address.
    fn low(self) -> u8 {
        match self {
            Address::SevenBit(address) => address,
            Address::TenBit(address) => address as u8,
        }
    }
}

/// SCL frequency.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusSpeed {
    /// 100 kHz
    #[default]
    Standard,
    /// 400 kHz
    Fast,
    /// 1 MHz. Not supported by this peripheral.
    FastPlus,
}

/// Timing of [`I2c::bus_clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusClearConfig {
    /// Most clock pulses to send while SDA is held low.
    pub pulses: u32,
    /// Half of the SCL period, in microseconds.
    pub half_period_us: u32,
    /// How many 1 us polls to wait for a slave that stretches SCL.
    pub stretch_polls: u32,
}

impl BusClearConfig {
    /// Nine pulses at 100 kHz.
    pub const DEFAULT: Self = Self {
        pulses: 9,
        half_period_us: 5,
        stretch_polls: 100,
    };
}

impl Default for BusClearConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// I2C commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Control {
    /// Our slave address, and whether we answer the general call.
    OwnAddress { address: Address, general_call: bool },
    /// Set the bus speed, and enable the peripheral.
    BusSpeed(BusSpeed),
    /// Timing for the next bus clear.
    BusClearTiming(BusClearConfig),
    /// Stop the active operation. A master releases the bus. No event
    /// follows.
    Abort,
}

/// The role of the peripheral on the bus.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    #[default]
    Slave,
    Master,
}

/// Which way data moves, from our side.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    #[default]
    Transmitter,
    Receiver,
}

/// I2C status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    /// An operation is active.
    pub busy: bool,
    pub mode: Mode,
    pub direction: Direction,
    /// The last slave addressing was a general call.
    pub general_call: bool,
    pub arbitration_lost: bool,
    pub bus_error: bool,
    /// As a slave, we received a byte before the last was read, or had
    /// nothing ready to send.
    pub overrun: bool,
}

/// What this I2C instance can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities {
    pub ten_bit_addressing: bool,
    pub fast_plus: bool,
    /// Master transmits use DMA.
    pub dma_tx: bool,
    /// Master receives of two or more bytes use DMA.
    pub dma_rx: bool,
}

/// I2C signals.
#[derive(Clone, Copy)]
pub struct Pins<'d> {
    pub scl: PinBinding<'d>,
    pub sda: PinBinding<'d>,
}

/// Where an operation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Phase {
    Idle,
    StartSent,
    /// First byte of a 10-bit address is out.
    HeaderSent,
    /// Repeated start that turns a 10-bit address around for reading.
    Restart,
    AddressSent,
    /// A master addressed us.
    Addressed,
    Data,
    /// The last bytes of a master receive, paced by BTF.
    LastBytes,
    /// Every byte of a master transmit is out; the last BTF ends it.
    StopPending,
}

#[derive(Clone, Copy)]
struct Operation {
    mode: Mode,
    direction: Direction,
    address: Address,
    buffer: *mut u8,
    num: usize,
    cnt: usize,
    transport: Transport,
    /// Keep the bus after this operation.
    pending: bool,
    /// The 10-bit read turnaround happened.
    restarted: bool,
    active: bool,
}

impl Operation {
    const IDLE: Self = Self {
        mode: Mode::Slave,
        direction: Direction::Transmitter,
        address: Address::SevenBit(0),
        buffer: core::ptr::null_mut(),
        num: 0,
        cnt: 0,
        transport: Transport::Interrupt,
        pending: false,
        restarted: false,
        active: false,
    };

    fn progress(&self, channel: Option<&dyn DmaChannel>) -> usize {
        match (self.active, self.transport, channel) {
            (true, Transport::Dma, Some(channel)) => self.num.saturating_sub(channel.remaining() as usize),
            _ => self.cnt,
        }
    }

    fn next(&mut self) -> u8 {
        // Safety: cnt < num, and the caller vouched for num bytes.
        let byte = unsafe { word::read(self.buffer, Width::Byte, self.cnt) };
        self.cnt += 1;
        byte as u8
    }

    fn store(&mut self, byte: u8) {
        // Safety: cnt < num, and the caller vouched for num bytes.
        unsafe { word::write(self.buffer, Width::Byte, self.cnt, byte as u16) };
        self.cnt += 1;
    }

    fn is_slave(&self, direction: Direction) -> bool {
        self.active && self.mode == Mode::Slave && self.direction == direction
    }
}

struct State<'d> {
    run: RunState,
    callback: Option<Callback<'d>>,
    status: Status,
    phase: Phase,
    op: Operation,
    /// A pending master operation kept the bus.
    held: bool,
    /// The direction a master asked of us.
    addressed: Option<Direction>,
    bus_clear: BusClearConfig,
}

impl State<'_> {
    const fn new() -> Self {
        Self {
            run: RunState::Uninitialized,
            callback: None,
            status: Status {
                busy: false,
                mode: Mode::Slave,
                direction: Direction::Transmitter,
                general_call: false,
                arbitration_lost: false,
                bus_error: false,
                overrun: false,
            },
            phase: Phase::Idle,
            op: Operation::IDLE,
            held: false,
            addressed: None,
            bus_clear: BusClearConfig::DEFAULT,
        }
    }

    fn reset(&mut self) {
        self.status = Status::default();
        self.phase = Phase::Idle;
        self.op = Operation::IDLE;
        self.held = false;
        self.addressed = None;
    }
}

/// An I2C driver.
pub struct I2c<'d> {
    registers: Static<ral::i2c::RegisterBlock>,
    resources: Resources<'d>,
    error_irq: u16,
    pins: Pins<'d>,
    state: Mutex<RefCell<State<'d>>>,
}

// Safety: OK to allocate in a static context. Mutable state is behind a
// critical section.
unsafe impl Sync for I2c<'_> {}

impl<'d> I2c<'d> {
    /// Create an I2C driver.
    ///
    /// `resources.irq` is the event interrupt. `error_irq` is the error
    /// interrupt.
    ///
    /// # Safety
    ///
    /// `registers` must point to an I2C register block, and `resources` must
    /// describe that same peripheral. Create only one driver per peripheral.
    pub const unsafe fn new(
        registers: *const (),
        resources: Resources<'d>,
        error_irq: u16,
        pins: Pins<'d>,
    ) -> Self {
        Self {
            registers: Static(registers.cast()),
            resources,
            error_irq,
            pins,
            state: Mutex::new(RefCell::new(State::new())),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            ten_bit_addressing: true,
            fast_plus: false,
            dma_tx: self.resources.dma_tx.is_some(),
            dma_rx: self.resources.dma_rx.is_some(),
        }
    }

    fn irqs(&self) -> [u16; 2] {
        [self.resources.irq, self.error_irq]
    }

    fn channel(&self, direction: Direction) -> Option<&'d dyn DmaChannel> {
        match direction {
            Direction::Transmitter => self.resources.dma_tx,
            Direction::Receiver => self.resources.dma_rx,
        }
    }

    /// Write `num` bytes to the slave at `address`.
    ///
    /// With `pending`, the driver keeps the bus when it's done, and the next
    /// master operation starts with a repeated start.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `num` bytes until the operation
    /// finishes, is aborted, or the driver powers off.
    pub unsafe fn master_transmit(&self, address: Address, data: *const u8, num: usize, pending: bool) -> Result<()> {
        self.start_master(address, data.cast_mut(), num, pending, Direction::Transmitter)
    }

    /// Read `num` bytes from the slave at `address`.
    ///
    /// # Safety
    ///
    /// `data` must be valid for writes of `num` bytes until the operation
    /// finishes, is aborted, or the driver powers off.
    pub unsafe fn master_receive(&self, address: Address, data: *mut u8, num: usize, pending: bool) -> Result<()> {
        self.start_master(address, data, num, pending, Direction::Receiver)
    }

    unsafe fn start_master(
        &self,
        address: Address,
        buffer: *mut u8,
        num: usize,
        pending: bool,
        direction: Direction,
    ) -> Result<()> {
        if buffer.is_null() || num == 0 || !address.is_valid() {
            return Err(Error::Parameter);
        }
        let regs = &self.registers;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            state.run.require_configured()?;
            if state.status.busy {
                return Err(Error::Busy);
            }
            if !state.held && ral::read_reg!(crate::ral::i2c, regs, SR2, BUSY == 1) {
                // Another master owns the bus.
                return Err(Error::Busy);
            }

            let channel = self
                .channel(direction)
                .filter(|_| num <= u16::MAX as usize)
                .filter(|_| direction == Direction::Transmitter || num >= 2);
            state.op = Operation {
                mode: Mode::Master,
                direction,
                address,
                buffer,
                num,
                cnt: 0,
                transport: if channel.is_some() { Transport::Dma } else { Transport::Interrupt },
                pending,
                restarted: false,
                active: true,
            };
            state.status.busy = true;
            state.status.mode = Mode::Master;
            state.status.direction = direction;
            state.status.arbitration_lost = false;
            state.status.bus_error = false;
            state.status.overrun = false;
            state.held = false;
            state.addressed = None;
            state.phase = Phase::StartSent;

            match channel {
                Some(channel) => {
                    let dma_direction = match direction {
                        Direction::Transmitter => dma::Direction::MemoryToPeripheral,
                        Direction::Receiver => dma::Direction::PeripheralToMemory,
                    };
                    channel.configure(&DmaTransfer {
                        direction: dma_direction,
                        peripheral: regs.address_of(|regs| &regs.DR),
                        memory: buffer.cast_const().cast(),
                        count: num as u16,
                        width: Width::Byte,
                        increment: true,
                    });
                    channel.enable();
                    ral::modify_reg!(
                        crate::ral::i2c,
                        regs,
                        CR2,
                        ITBUFEN: 0,
                        DMAEN: 1,
                        LAST: (direction == Direction::Receiver) as u32
                    );
                }
                None => ral::modify_reg!(crate::ral::i2c, regs, CR2, ITBUFEN: 1, DMAEN: 0, LAST: 0),
            }
            ral::modify_reg!(crate::ral::i2c, regs, CR1, ACK: 1, POS: 0, START: 1);
            Ok(())
        })
    }

    /// Send `num` bytes the next time a master reads from us.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `num` bytes until the operation
    /// finishes, is aborted, or the driver powers off.
    pub unsafe fn slave_transmit(&self, data: *const u8, num: usize) -> Result<()> {
        self.start_slave(data.cast_mut(), num, Direction::Transmitter)
    }

    /// Accept `num` bytes the next time a master writes to us.
    ///
    /// # Safety
    ///
    /// `data` must be valid for writes of `num` bytes until the operation
    /// finishes, is aborted, or the driver powers off.
    pub unsafe fn slave_receive(&self, data: *mut u8, num: usize) -> Result<()> {
        self.start_slave(data, num, Direction::Receiver)
    }

    unsafe fn start_slave(&self, buffer: *mut u8, num: usize, direction: Direction) -> Result<()> {
        if buffer.is_null() || num == 0 {
            return Err(Error::Parameter);
        }
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.run.require_configured()?;
            if state.status.busy {
                return Err(Error::Busy);
            }
            state.op = Operation {
                mode: Mode::Slave,
                direction,
                buffer,
                num,
                active: true,
                ..Operation::IDLE
            };
            state.status.busy = true;
            state.status.arbitration_lost = false;
            state.status.bus_error = false;
            state.status.overrun = false;
            Ok(())
        })
    }

    /// Bytes moved by the current, or last, operation.
    pub fn data_count(&self) -> usize {
        critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            let channel = self.channel(state.op.direction);
            state.op.progress(channel)
        })
    }

    /// Handle the I2C event interrupt.
    pub fn on_event_interrupt(&self) {
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            let status = regs.SR1.read();
            let buffers = regs.CR2.read() & ral::i2c::CR2::ITBUFEN::mask != 0;
            let events = if state.op.active && state.op.mode == Mode::Master {
                self.master_event(state, status, buffers)
            } else {
                self.slave_event(state, status, buffers)
            };
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    fn master_event(&self, state: &mut State<'d>, status: u32, buffers: bool) -> Events {
        use ral::i2c::sr1;
        let regs = &self.registers;
        let op = &mut state.op;

        if status & sr1::SB != 0 {
            // Reading SR1, then writing DR, clears SB.
            match state.phase {
                Phase::StartSent => {
                    let read = op.direction == Direction::Receiver && !op.address.is_ten_bit();
                    regs.DR.write(op.address.header(read) as u32);
                    state.phase = if op.address.is_ten_bit() {
                        Phase::HeaderSent
                    } else {
                        Phase::AddressSent
                    };
                }
                Phase::Restart => {
                    regs.DR.write(op.address.header(true) as u32);
                    state.phase = Phase::AddressSent;
                }
                _ => {}
            }
            return Events::empty();
        }
        if status & sr1::ADD10 != 0 && state.phase == Phase::HeaderSent {
            regs.DR.write(op.address.low() as u32);
            state.phase = Phase::AddressSent;
            return Events::empty();
        }
        if status & sr1::ADDR != 0 && state.phase == Phase::AddressSent {
            self.master_addressed(state);
            return Events::empty();
        }

        match (state.phase, op.direction) {
            (Phase::StopPending, _) if status & sr1::BTF != 0 => {
                let stop = !op.pending;
                self.finish_master(state, stop)
            }
            (Phase::Data, Direction::Transmitter) if buffers && status & sr1::TXE != 0 => {
                if op.cnt < op.num {
                    let byte = op.next();
                    regs.DR.write(byte as u32);
                }
                if op.cnt == op.num {
                    ral::modify_reg!(crate::ral::i2c, regs, CR2, ITBUFEN: 0);
                    state.phase = Phase::StopPending;
                }
                Events::empty()
            }
            (Phase::Data, Direction::Receiver) if buffers && status & sr1::RXNE != 0 => {
                op.store(regs.DR.read() as u8);
                match op.num - op.cnt {
                    0 => self.finish_master(state, false),
                    3 => {
                        ral::modify_reg!(crate::ral::i2c, regs, CR2, ITBUFEN: 0);
                        state.phase = Phase::LastBytes;
                        Events::empty()
                    }
                    _ => Events::empty(),
                }
            }
            (Phase::LastBytes, _) if status & sr1::BTF != 0 => {
                if op.num - op.cnt > 2 {
                    // N-2 is in DR, N-1 in the shift register. NACK N.
                    ral::modify_reg!(crate::ral::i2c, regs, CR1, ACK: 0);
                    op.store(regs.DR.read() as u8);
                    Events::empty()
                } else {
                    if !op.pending {
                        ral::modify_reg!(crate::ral::i2c, regs, CR1, STOP: 1);
                    }
                    op.store(regs.DR.read() as u8);
                    op.store(regs.DR.read() as u8);
                    self.finish_master(state, false)
                }
            }
            _ => Events::empty(),
        }
    }

    /// The addressed slave acknowledged. Sets up the data phase before
    /// releasing SCL by clearing ADDR.
    fn master_addressed(&self, state: &mut State<'d>) {
        let regs = &self.registers;
        // With SR1 already read, reading SR2 clears ADDR.
        let clear = || {
            let _ = regs.SR2.read();
        };
        let op = &mut state.op;

        if op.direction == Direction::Receiver && op.address.is_ten_bit() && !op.restarted {
            clear();
            ral::modify_reg!(crate::ral::i2c, regs, CR1, START: 1);
            op.restarted = true;
            state.phase = Phase::Restart;
            return;
        }

        state.phase = Phase::Data;
        match (op.direction, op.transport, op.num) {
            (Direction::Transmitter, _, _) | (Direction::Receiver, Transport::Dma, _) => clear(),
            (Direction::Receiver, _, 1) => {
                ral::modify_reg!(crate::ral::i2c, regs, CR1, ACK: 0);
                clear();
                if !op.pending {
                    ral::modify_reg!(crate::ral::i2c, regs, CR1, STOP: 1);
                }
            }
            (Direction::Receiver, _, 2) => {
                // NACK the second byte, the one in the shift register.
                ral::modify_reg!(crate::ral::i2c, regs, CR1, ACK: 0, POS: 1);
                clear();
                ral::modify_reg!(crate::ral::i2c, regs, CR2, ITBUFEN: 0);
                state.phase = Phase::LastBytes;
            }
            (Direction::Receiver, _, 3) => {
                clear();
                ral::modify_reg!(crate::ral::i2c, regs, CR2, ITBUFEN: 0);
                state.phase = Phase::LastBytes;
            }
            (Direction::Receiver, _, _) => clear(),
        }
    }

    /// Stop moving data, and return to the idle slave state.
    fn teardown(&self, state: &mut State<'d>, stop: bool) {
        let regs = &self.registers;
        let channel = self.channel(state.op.direction);
        if state.op.transport == Transport::Dma {
            if let Some(channel) = channel {
                channel.disable();
                let _ = channel.take_status();
            }
        }
        state.op.cnt = state.op.progress(channel);
        state.op.active = false;
        ral::modify_reg!(crate::ral::i2c, regs, CR2, ITBUFEN: 1, DMAEN: 0, LAST: 0);
        if stop {
            ral::modify_reg!(crate::ral::i2c, regs, CR1, STOP: 1);
        }
        ral::modify_reg!(crate::ral::i2c, regs, CR1, ACK: 1, POS: 0);
        state.status.busy = false;
        state.phase = Phase::Idle;
        state.held = false;
        state.addressed = None;
    }

    fn finish_master(&self, state: &mut State<'d>, stop: bool) -> Events {
        self.teardown(state, stop);
        state.held = state.op.pending;
        Events::TRANSFER_DONE
    }

    fn fail_master(&self, state: &mut State<'d>, stop: bool) -> Events {
        self.teardown(state, stop);
        Events::TRANSFER_DONE | Events::TRANSFER_INCOMPLETE
    }

    fn slave_event(&self, state: &mut State<'d>, status: u32, buffers: bool) -> Events {
        use ral::i2c::{sr1, sr2};
        let regs = &self.registers;
        let mut events = Events::empty();

        if status & sr1::ADDR != 0 {
            // With SR1 already read, reading SR2 clears ADDR.
            let sr2 = regs.SR2.read();
            if sr2 & sr2::MSL != 0 {
                // The address phase of an aborted master operation.
                return events;
            }
            let direction = if sr2 & sr2::TRA != 0 {
                Direction::Transmitter
            } else {
                Direction::Receiver
            };
            let general_call = sr2 & sr2::GENCALL != 0;
            state.addressed = Some(direction);
            state.phase = Phase::Addressed;
            state.status.mode = Mode::Slave;
            state.status.direction = direction;
            state.status.general_call = general_call;
            if general_call {
                events |= Events::GENERAL_CALL;
            }
            if !state.op.is_slave(direction) {
                events |= match direction {
                    Direction::Transmitter => Events::SLAVE_TRANSMIT,
                    Direction::Receiver => Events::SLAVE_RECEIVE,
                };
            }
        }

        match state.addressed {
            Some(Direction::Transmitter) if buffers && status & sr1::TXE != 0 => {
                let op = &mut state.op;
                let byte = if op.is_slave(Direction::Transmitter) && op.cnt < op.num {
                    op.next()
                } else {
                    0xFF
                };
                regs.DR.write(byte as u32);
            }
            Some(Direction::Receiver) if buffers && status & sr1::RXNE != 0 => {
                let byte = regs.DR.read() as u8;
                let op = &mut state.op;
                if op.is_slave(Direction::Receiver) && op.cnt < op.num {
                    op.store(byte);
                }
            }
            _ => {}
        }

        if status & sr1::STOPF != 0 {
            // Reading SR1, then writing CR1, clears STOPF.
            ral::modify_reg!(crate::ral::i2c, regs, CR1, PE: 1);
            if let Some(direction) = state.addressed {
                events |= self.finish_slave(state, direction);
            }
        }
        events
    }

    fn finish_slave(&self, state: &mut State<'d>, direction: Direction) -> Events {
        state.phase = Phase::Idle;
        state.addressed = None;
        let op = &mut state.op;
        if !op.is_slave(direction) {
            return Events::empty();
        }
        op.active = false;
        state.status.busy = false;
        if op.cnt < op.num {
            Events::TRANSFER_DONE | Events::TRANSFER_INCOMPLETE
        } else {
            Events::TRANSFER_DONE
        }
    }

    /// Handle the I2C error interrupt.
    pub fn on_error_interrupt(&self) {
        use ral::i2c::sr1;
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            let status = regs.SR1.read();
            let master = state.op.active && state.op.mode == Mode::Master;
            let mut events = Events::empty();

            // The error flags are rc_w0.
            if status & sr1::BERR != 0 {
                ral::modify_reg!(crate::ral::i2c, regs, SR1, BERR: 0);
                state.status.bus_error = true;
                events |= Events::BUS_ERROR;
            }
            if status & sr1::ARLO != 0 {
                ral::modify_reg!(crate::ral::i2c, regs, SR1, ARLO: 0);
                state.status.arbitration_lost = true;
                state.status.mode = Mode::Slave;
                events |= Events::ARBITRATION_LOST;
            }
            if status & sr1::AF != 0 {
                ral::modify_reg!(crate::ral::i2c, regs, SR1, AF: 0);
                if master && matches!(state.phase, Phase::HeaderSent | Phase::AddressSent) {
                    events |= Events::ADDRESS_NACK;
                } else if state.addressed == Some(Direction::Transmitter) {
                    // The master NACKs the last byte it wants.
                    events |= self.finish_slave(state, Direction::Transmitter);
                }
            }
            if status & sr1::OVR != 0 {
                ral::modify_reg!(crate::ral::i2c, regs, SR1, OVR: 0);
                state.status.overrun = true;
                events |= Events::DATA_LOST;
                warn!("I2C slave overrun");
            }

            if master && status & (sr1::BERR | sr1::ARLO | sr1::AF) != 0 {
                // After losing arbitration, the bus belongs to someone else.
                let stop = status & sr1::ARLO == 0;
                events |= self.fail_master(state, stop);
            }
            if !events.is_empty() {
                debug!("I2C error {}", events.bits());
            }
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    /// Handle the transmit DMA channel's interrupt.
    pub fn on_dma_tx(&self) {
        let Some(channel) = self.resources.dma_tx else {
            return;
        };
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            let status = channel.take_status();
            let op = &state.op;
            let events = if !op.active
                || op.mode != Mode::Master
                || op.direction != Direction::Transmitter
                || op.transport != Transport::Dma
            {
                Events::empty()
            } else if status.error {
                warn!("I2C transmit DMA error");
                self.fail_master(state, true)
            } else if status.complete && channel.remaining() == 0 {
                channel.disable();
                ral::modify_reg!(crate::ral::i2c, regs, CR2, DMAEN: 0);
                // The last byte is still shifting out.
                state.phase = Phase::StopPending;
                Events::empty()
            } else {
                Events::empty()
            };
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    /// Handle the receive DMA channel's interrupt.
    pub fn on_dma_rx(&self) {
        let Some(channel) = self.resources.dma_rx else {
            return;
        };
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            let status = channel.take_status();
            let op = &state.op;
            let events = if !op.active
                || op.mode != Mode::Master
                || op.direction != Direction::Receiver
                || op.transport != Transport::Dma
            {
                Events::empty()
            } else if status.error {
                warn!("I2C receive DMA error");
                self.fail_master(state, true)
            } else if status.complete && channel.remaining() == 0 {
                // LAST already NACKed the final byte.
                let stop = !op.pending;
                self.finish_master(state, stop)
            } else {
                Events::empty()
            };
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    /// Free a bus that a slave holds by keeping SDA low.
    ///
    /// Clocks SCL by hand until the slave lets go of SDA, then generates a
    /// stop condition and resets the peripheral. Blocks for up to
    /// [`BusClearConfig::pulses`] clock periods, plus any clock stretching.
    /// Reports [`Events::BUS_CLEAR`] through the callback once SDA is free.
    pub fn bus_clear(&self, delay: &mut impl DelayNs) -> Result<()> {
        let regs = &self.registers;
        let (timing, callback) = critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            state.run.require_powered()?;
            if state.status.busy {
                return Err(Error::Busy);
            }
            Ok((state.bus_clear, state.callback))
        })?;

        let cr1 = regs.CR1.read();
        let saved = [
            regs.CR2.read(),
            regs.OAR1.read(),
            regs.OAR2.read(),
            regs.CCR.read(),
            regs.TRISE.read(),
        ];
        ral::modify_reg!(crate::ral::i2c, regs, CR1, PE: 0);

        let (scl, sda) = (self.pins.scl.pin, self.pins.sda.pin);
        for pin in [scl, sda] {
            pin.set_high();
            pin.configure(PinMode::Output { open_drain: true });
        }
        let half = timing.half_period_us;

        let mut released = sda.is_high();
        let mut pulses = 0;
        while !released && pulses < timing.pulses {
            scl.set_low();
            delay.delay_us(half);
            scl.set_high();
            wait_for_clock(scl, delay, timing.stretch_polls);
            delay.delay_us(half);
            pulses += 1;
            released = sda.is_high();
        }
        trace!("I2C bus clear sent {} pulses", pulses);

        // Stop: SDA rises while SCL is high.
        sda.set_low();
        delay.delay_us(half);
        sda.set_high();
        delay.delay_us(half);

        ral::write_reg!(crate::ral::i2c, regs, CR1, SWRST: 1);
        regs.CR1.write(0);
        regs.CR2.write(saved[0]);
        regs.OAR1.write(saved[1]);
        regs.OAR2.write(saved[2]);
        regs.CCR.write(saved[3]);
        regs.TRISE.write(saved[4]);
        {
            use ral::i2c::CR1::{ACK, ENGC, PE};
            regs.CR1.write(cr1 & (PE::mask | ENGC::mask | ACK::mask));
        }
        self.pins.scl.connect(true);
        self.pins.sda.connect(true);

        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.phase = Phase::Idle;
            state.held = false;
            state.addressed = None;
        });

        if released {
            debug!("I2C bus clear");
            event::notify(callback, Events::BUS_CLEAR);
            Ok(())
        } else {
            warn!("I2C SDA still low after bus clear");
            Err(Error::BusClear)
        }
    }

    fn set_bus_speed(&self, state: &mut State<'d>, speed: BusSpeed) -> Result<()> {
        let regs = &self.registers;
        let pclk = self.resources.frequency();
        let mhz = pclk / 1_000_000;
        if !(2..=50).contains(&mhz) {
            return Err(Error::BusSpeed);
        }
        let (ccr, fs, trise) = match speed {
            BusSpeed::Standard => ((pclk / 200_000).max(4), 0, mhz + 1),
            // Duty 2:1, so the period is 3 * CCR.
            BusSpeed::Fast => ((pclk / 1_200_000).max(1), 1, mhz * 3 / 10 + 1),
            BusSpeed::FastPlus => return Err(Error::Unsupported),
        };
        ral::modify_reg!(crate::ral::i2c, regs, CR1, PE: 0);
        ral::write_reg!(crate::ral::i2c, regs, CR2, FREQ: mhz, ITERREN: 1, ITEVTEN: 1, ITBUFEN: 1);
        ral::write_reg!(crate::ral::i2c, regs, CCR, CCR: ccr, FS: fs);
        ral::write_reg!(crate::ral::i2c, regs, TRISE, TRISE: trise);
        ral::modify_reg!(crate::ral::i2c, regs, CR1, PE: 1);
        // ACK only sticks once PE is set.
        ral::modify_reg!(crate::ral::i2c, regs, CR1, ACK: 1);
        state.run = RunState::Configured;
        debug!("I2C CCR {} TRISE {}", ccr, trise);
        Ok(())
    }

    fn configure(&self, command: Control) -> Result<()> {
        let regs = &self.registers;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            state.run.require_powered()?;
            match command {
                Control::OwnAddress { address, general_call } => {
                    if !address.is_valid() {
                        return Err(Error::Parameter);
                    }
                    match address {
                        Address::SevenBit(address) => ral::write_reg!(
                            crate::ral::i2c,
                            regs,
                            OAR1,
                            ADD: (address as u32) << 1,
                            ALWAYS_ONE: 1
                        ),
                        Address::TenBit(address) => ral::write_reg!(
                            crate::ral::i2c,
                            regs,
                            OAR1,
                            ADD: address as u32,
                            ALWAYS_ONE: 1,
                            ADDMODE: 1
                        ),
                    }
                    ral::modify_reg!(crate::ral::i2c, regs, CR1, ENGC: general_call as u32);
                }
                Control::BusSpeed(speed) => {
                    if state.status.busy {
                        return Err(Error::Busy);
                    }
                    self.set_bus_speed(state, speed).inspect_err(|err| {
                        debug!("I2C bus speed rejected: {}", err);
                    })?;
                }
                Control::BusClearTiming(timing) => state.bus_clear = timing,
                Control::Abort => {
                    if state.op.active {
                        let master = state.op.mode == Mode::Master;
                        self.teardown(state, master);
                        if master {
                            // Reading SR1, then SR2, clears a pending ADDR.
                            let _ = regs.SR1.read();
                            let _ = regs.SR2.read();
                        }
                        debug!("I2C operation aborted");
                    }
                }
            }
            Ok(())
        })
    }
}

/// Waits while a slave stretches the clock.
fn wait_for_clock(scl: &dyn Pin, delay: &mut impl DelayNs, polls: u32) {
    for _ in 0..polls {
        if scl.is_high() {
            return;
        }
        delay.delay_us(1);
    }
}

impl<'d> Driver<'d> for I2c<'d> {
    type Control = Control;
    type Status = Status;

    fn initialize(&self, callback: Option<Callback<'d>>) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.run >= RunState::Initialized {
                return Ok(());
            }
            let bindings = [Some(self.pins.scl), Some(self.pins.sda)];
            resources::validate_pins(&bindings)?;
            for binding in bindings.into_iter().flatten() {
                binding.connect(true);
            }
            state.callback = callback;
            state.run = RunState::Initialized;
            Ok(())
        })
    }

    fn uninitialize(&self) -> Result<()> {
        self.power_control(PowerState::Off)?;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.run == RunState::Uninitialized {
                return;
            }
            self.pins.scl.disconnect();
            self.pins.sda.disconnect();
            state.callback = None;
            state.run = RunState::Uninitialized;
        });
        Ok(())
    }

    fn power_control(&self, power: PowerState) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            match power {
                PowerState::Off => {
                    if state.run >= RunState::Powered {
                        self.resources.power_down(&self.irqs());
                        debug!("I2C powered off");
                    }
                    state.reset();
                    state.run = state.run.powered_off();
                    Ok(())
                }
                PowerState::Full => match state.run {
                    RunState::Uninitialized => Err(Error::Generic),
                    RunState::Initialized => {
                        self.resources.power_up(&self.irqs());
                        state.reset();
                        state.run = RunState::Powered;
                        debug!("I2C powered on");
                        Ok(())
                    }
                    RunState::Powered | RunState::Configured => Ok(()),
                },
                PowerState::Low => Err(Error::Unsupported),
            }
        })
    }

    fn control(&self, command: Control) -> Result<()> {
        self.configure(command)
    }

    fn status(&self) -> Status {
        critical_section::with(|cs| self.state.borrow_ref(cs).status)
    }
}

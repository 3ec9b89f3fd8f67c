//! SPI driver.
//!
//! SPI is always full duplex. Every transfer clocks both directions: a send
//! discards what it receives, and a receive clocks out the default transmit
//! value. The caller's intent decides which completion event fires.
//!
//! Data moves by interrupt, or by DMA when both a transmit and a receive
//! channel are bound. Completion always comes from the receive side, since
//! the last item is only in when it's been received.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::dma::DmaChannel;
use crate::event::{self, Callback, Events};
use crate::lifecycle::{PowerState, RunState};
use crate::ral::{self, Static};
use crate::resources::{self, PinBinding, PinMode, Resources};
use crate::transfer::{DmaOutcome, Intent, Port, Scratch, TransferInfo};
use crate::word::{Width, Word};
use crate::{Driver, Error, Result};

/// Clock polarity, clock phase, or an alternate frame protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameFormat {
    /// CPOL = 0, CPHA = 0.
    Mode0,
    /// CPOL = 0, CPHA = 1.
    Mode1,
    /// CPOL = 1, CPHA = 0.
    Mode2,
    /// CPOL = 1, CPHA = 1.
    Mode3,
    /// Texas Instruments synchronous serial frames. Requires hardware slave
    /// select.
    TiSsi,
    /// National Microwire. Not supported.
    Microwire,
}

/// Bit order on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// How a master handles its slave select signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MasterSelect {
    /// No slave select signal.
    Unused,
    /// The NSS pin is a GPIO output, driven with [`Control::SlaveSelect`].
    Software,
    /// The peripheral drives NSS low while it's enabled.
    HardwareOutput,
    /// NSS is an input. Another master pulling it low is a mode fault.
    HardwareInput,
}

/// How a slave learns that it's selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveSelect {
    /// From the NSS pin.
    Hardware,
    /// From [`Control::SlaveSelect`].
    Software,
}

/// Master configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub frame_format: FrameFormat,
    /// 8 or 16.
    pub data_bits: u8,
    pub bit_order: BitOrder,
    pub slave_select: MasterSelect,
    /// Requested clock rate, in Hz. The driver picks the fastest rate that
    /// doesn't exceed it.
    pub bus_speed: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_format: FrameFormat::Mode0,
            data_bits: 8,
            bit_order: BitOrder::MsbFirst,
            slave_select: MasterSelect::Unused,
            bus_speed: 1_000_000,
        }
    }
}

/// Slave configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlaveConfig {
    pub frame_format: FrameFormat,
    /// 8 or 16.
    pub data_bits: u8,
    pub bit_order: BitOrder,
    pub slave_select: SlaveSelect,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            frame_format: FrameFormat::Mode0,
            data_bits: 8,
            bit_order: BitOrder::MsbFirst,
            slave_select: SlaveSelect::Hardware,
        }
    }
}

/// SPI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Control {
    /// Disable the peripheral, keeping it powered.
    Inactive,
    /// Become a master.
    Master(Config),
    /// Become a slave.
    Slave(SlaveConfig),
    /// Change a master's clock rate, in Hz.
    BusSpeed(u32),
    /// Drive a software slave select: `true` selects.
    SlaveSelect(bool),
    /// Item clocked out when a transfer has nothing to send.
    DefaultTxValue(u16),
    /// Stop the active transfer. No event follows.
    Abort,
}

/// SPI status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    /// A transfer is active.
    pub busy: bool,
    /// A received item was lost since the last transfer started.
    pub data_lost: bool,
    /// A mode fault ended the last transfer.
    pub mode_fault: bool,
}

/// What this SPI instance can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities {
    pub ti_ssi: bool,
    pub microwire: bool,
    /// [`Events::MODE_FAULT`] is reported.
    pub mode_fault: bool,
    /// Transfers use DMA.
    pub dma: bool,
}

/// SPI signals.
#[derive(Clone, Copy)]
pub struct Pins<'d> {
    pub sck: Option<PinBinding<'d>>,
    pub miso: Option<PinBinding<'d>>,
    pub mosi: Option<PinBinding<'d>>,
    pub nss: Option<PinBinding<'d>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Inactive,
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Select {
    None,
    /// Master drives the NSS pin as a GPIO.
    Pin,
    /// Slave selection follows the SSI bit.
    Internal,
    Hardware,
}

struct State<'d> {
    run: RunState,
    callback: Option<Callback<'d>>,
    xfer: TransferInfo,
    status: Status,
    role: Role,
    select: Select,
    bus_speed: u32,
    /// Items an aborted transfer already clocked out, still to arrive.
    stale: usize,
}

impl State<'_> {
    const fn new() -> Self {
        Self {
            run: RunState::Uninitialized,
            callback: None,
            xfer: TransferInfo::new(),
            status: Status {
                busy: false,
                data_lost: false,
                mode_fault: false,
            },
            role: Role::Inactive,
            select: Select::None,
            bus_speed: 0,
            stale: 0,
        }
    }
}

/// An SPI driver.
pub struct Spi<'d> {
    registers: Static<ral::spi::RegisterBlock>,
    resources: Resources<'d>,
    pins: Pins<'d>,
    state: Mutex<RefCell<State<'d>>>,
    scratch: Scratch,
}

// Safety: OK to allocate in a static context. Mutable state is behind a
// critical section, and scratch memory is only touched by DMA while a
// transfer is active.
unsafe impl Sync for Spi<'_> {}

impl Port for Static<ral::spi::RegisterBlock> {
    fn data_register(&self) -> *const () {
        self.address_of(|regs| &regs.DR)
    }
    fn write(&self, word: u16) {
        self.DR.write(word as u32);
    }
    fn read(&self) -> u16 {
        self.DR.read() as u16
    }
    fn listen_tx(&self, enable: bool) {
        ral::modify_reg!(crate::ral::spi, self, CR2, TXEIE: enable as u32);
    }
    fn listen_rx(&self, enable: bool) {
        ral::modify_reg!(crate::ral::spi, self, CR2, RXNEIE: enable as u32);
    }
    fn request_tx(&self, enable: bool) {
        ral::modify_reg!(crate::ral::spi, self, CR2, TXDMAEN: enable as u32);
    }
    fn request_rx(&self, enable: bool) {
        ral::modify_reg!(crate::ral::spi, self, CR2, RXDMAEN: enable as u32);
    }
}

/// The `BR` field value for the fastest clock at or below `hz`.
fn prescaler(pclk: u32, hz: u32) -> Option<u32> {
    (0..8).find(|br| pclk >> (br + 1) <= hz)
}

/// `(CPOL, CPHA, FRF)` for a frame format.
fn frame_bits(format: FrameFormat) -> Result<(u32, u32, u32)> {
    match format {
        FrameFormat::Mode0 => Ok((0, 0, 0)),
        FrameFormat::Mode1 => Ok((0, 1, 0)),
        FrameFormat::Mode2 => Ok((1, 0, 0)),
        FrameFormat::Mode3 => Ok((1, 1, 0)),
        FrameFormat::TiSsi => Ok((0, 0, 1)),
        FrameFormat::Microwire => Err(Error::Unsupported),
    }
}

fn frame_width(data_bits: u8) -> Result<Width> {
    match data_bits {
        8 => Ok(Width::Byte),
        16 => Ok(Width::HalfWord),
        _ => Err(Error::DataBits),
    }
}

/// Everything a configuration writes, computed before touching hardware.
struct Setup {
    master: bool,
    cpol: u32,
    cpha: u32,
    frf: u32,
    width: Width,
    lsb_first: bool,
    select: Select,
    br: u32,
}

impl<'d> Spi<'d> {
    /// Create an SPI driver.
    ///
    /// # Safety
    ///
    /// `registers` must point to an SPI register block, and `resources` must
    /// describe that same peripheral. Create only one driver per peripheral.
    pub const unsafe fn new(registers: *const (), resources: Resources<'d>, pins: Pins<'d>) -> Self {
        Self {
            registers: Static(registers.cast()),
            resources,
            pins,
            state: Mutex::new(RefCell::new(State::new())),
            scratch: Scratch::new(),
        }
    }

    /// What this instance can do, given its bound resources.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            ti_ssi: true,
            microwire: false,
            mode_fault: true,
            dma: self.dma().0.is_some(),
        }
    }

    /// DMA only runs with both channels.
    fn dma(&self) -> (Option<&'d dyn DmaChannel>, Option<&'d dyn DmaChannel>) {
        match (self.resources.dma_tx, self.resources.dma_rx) {
            (Some(tx), Some(rx)) => (Some(tx), Some(rx)),
            _ => (None, None),
        }
    }

    /// The clock rate that the master achieved, in Hz. Zero when not a master.
    pub fn bus_speed(&self) -> u32 {
        critical_section::with(|cs| self.state.borrow_ref(cs).bus_speed)
    }

    /// Send `num` items from `data`, discarding received items.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `num` items until the transfer
    /// completes, is aborted, or the driver powers off. The driver must not
    /// move while a transfer is active.
    pub unsafe fn send<W: Word>(&self, data: *const W, num: usize) -> Result<()> {
        if data.is_null() {
            return Err(Error::Parameter);
        }
        self.start(data.cast(), core::ptr::null_mut(), num, W::WIDTH, Intent::Tx)
    }

    /// Receive `num` items into `data`, clocking out the default value.
    ///
    /// # Safety
    ///
    /// `data` must be valid for writes of `num` items until the transfer
    /// completes, is aborted, or the driver powers off. The driver must not
    /// move while a transfer is active.
    pub unsafe fn receive<W: Word>(&self, data: *mut W, num: usize) -> Result<()> {
        if data.is_null() {
            return Err(Error::Parameter);
        }
        self.start(core::ptr::null(), data.cast(), num, W::WIDTH, Intent::Rx)
    }

    /// Send `num` items from `tx` while receiving `num` items into `rx`.
    ///
    /// # Safety
    ///
    /// See [`send`](Self::send) and [`receive`](Self::receive).
    pub unsafe fn transfer<W: Word>(&self, tx: *const W, rx: *mut W, num: usize) -> Result<()> {
        if tx.is_null() || rx.is_null() {
            return Err(Error::Parameter);
        }
        self.start(tx.cast(), rx.cast(), num, W::WIDTH, Intent::TxRx)
    }

    unsafe fn start(
        &self,
        tx: *const u8,
        rx: *mut u8,
        num: usize,
        width: Width,
        intent: Intent,
    ) -> Result<()> {
        if num == 0 {
            return Err(Error::Parameter);
        }
        let (dma_tx, dma_rx) = self.dma();
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.run.require_configured()?;
            if state.xfer.width != width {
                return Err(Error::Parameter);
            }
            if state.status.busy {
                return Err(Error::Busy);
            }
            state.status = Status {
                busy: true,
                ..Status::default()
            };
            self.drain(&mut state, dma_rx.is_some() && num <= u16::MAX as usize);
            let xfer = &mut state.xfer;
            xfer.intent = intent;
            xfer.arm_tx(tx, num);
            xfer.arm_rx(rx, num);
            xfer.start_rx(&self.registers, dma_rx, &self.scratch);
            xfer.start_tx(&self.registers, dma_tx, &self.scratch);
            Ok(())
        })
    }

    /// Items sent by the current, or last, transfer.
    pub fn tx_count(&self) -> usize {
        critical_section::with(|cs| self.state.borrow_ref(cs).xfer.tx.progress(self.dma().0))
    }

    /// Items received by the current, or last, transfer.
    pub fn rx_count(&self) -> usize {
        critical_section::with(|cs| self.state.borrow_ref(cs).xfer.rx.progress(self.dma().1))
    }

    /// Handle the SPI interrupt.
    pub fn on_interrupt(&self) {
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let sr = regs.SR.read();
            let mut events = Events::empty();

            if sr & ral::spi::sr::MODF != 0 {
                // SR was read; a CR1 write clears the fault. The hardware
                // already dropped SPE and MSTR.
                regs.CR1.write(regs.CR1.read() & !(ral::spi::CR1::SPE::mask | ral::spi::CR1::MSTR::mask));
                let (dma_tx, dma_rx) = self.dma();
                state.xfer.abort_rx(regs, dma_rx);
                state.xfer.abort_tx(regs, dma_tx);
                state.status.busy = false;
                state.status.mode_fault = true;
                state.stale = 0;
                state.role = Role::Inactive;
                state.run = RunState::Powered;
                warn!("SPI mode fault");
                return (Events::MODE_FAULT, state.callback);
            }

            if sr & ral::spi::sr::RXNE != 0 {
                let word = regs.read();
                if state.stale > 0 {
                    state.stale -= 1;
                } else if state.xfer.service_rx(regs, word) == Some(true) {
                    // The transmit lane may still wait for a final TXE.
                    state.xfer.abort_tx(regs, None);
                    state.status.busy = false;
                    events |= state.xfer.intent.completion();
                }
            }
            if sr & ral::spi::sr::OVR != 0 {
                // Cleared by a DR read followed by an SR read.
                if sr & ral::spi::sr::RXNE == 0 {
                    let _ = regs.read();
                }
                let _ = regs.SR.read();
                state.status.data_lost = true;
                events |= Events::DATA_LOST;
            }
            if sr & ral::spi::sr::TXE != 0 {
                state.xfer.service_tx(regs);
            }
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    /// Handle the transmit DMA channel's interrupt.
    pub fn on_dma_tx(&self) {
        let (Some(dma_tx), dma_rx) = self.dma() else {
            return;
        };
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let events = match state.xfer.finish_dma_tx(regs, dma_tx) {
                DmaOutcome::Failed => {
                    warn!("SPI transmit DMA error");
                    state.xfer.abort_rx(regs, dma_rx);
                    state.status.busy = false;
                    state.status.data_lost = true;
                    Events::DATA_LOST
                }
                // Completion comes from the receive channel.
                DmaOutcome::Complete | DmaOutcome::Ignored => Events::empty(),
            };
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    /// Handle the receive DMA channel's interrupt.
    pub fn on_dma_rx(&self) {
        let (dma_tx, Some(dma_rx)) = self.dma() else {
            return;
        };
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let events = match state.xfer.finish_dma_rx(regs, dma_rx) {
                DmaOutcome::Complete => {
                    // Every item was received, so every item was sent. The
                    // transmit interrupt may still be pending.
                    if state.xfer.tx.active {
                        state.xfer.abort_tx(regs, dma_tx);
                    }
                    state.status.busy = false;
                    state.xfer.intent.completion()
                }
                DmaOutcome::Failed => {
                    warn!("SPI receive DMA error");
                    state.xfer.abort_tx(regs, dma_tx);
                    state.status.busy = false;
                    state.status.data_lost = true;
                    Events::DATA_LOST
                }
                DmaOutcome::Ignored => Events::empty(),
            };
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    fn abort(&self, state: &mut State<'d>) {
        let (dma_tx, dma_rx) = self.dma();
        state.xfer.abort_rx(&self.registers, dma_rx);
        state.xfer.abort_tx(&self.registers, dma_tx);
        if state.status.busy {
            // Transmit runs ahead of receive. What it wrote still shifts in.
            state.stale = state.xfer.tx.cnt.saturating_sub(state.xfer.rx.cnt);
            debug!("SPI transfer aborted with {} items in flight", state.stale);
        }
        state.status.busy = false;
    }

    /// Drop what an aborted transfer left in the receive path, before the
    /// next transfer arms it.
    ///
    /// An interrupt-driven receive discards the remaining stale items as they
    /// arrive. A DMA receive can't, so only the item that already landed is
    /// dropped.
    fn drain(&self, state: &mut State<'d>, dma: bool) {
        use ral::spi::sr;
        let regs = &self.registers;
        let status = regs.SR.read();
        if status & sr::OVR != 0 {
            // A DR read, then an SR read, clears OVR. Every stale item is in.
            let _ = regs.read();
            let _ = regs.SR.read();
            state.stale = 0;
        } else if dma && state.stale > 0 {
            if status & sr::RXNE != 0 {
                let _ = regs.read();
            }
            state.stale = 0;
        }
    }

    fn master_setup(&self, config: &Config) -> Result<Setup> {
        let (cpol, cpha, frf) = frame_bits(config.frame_format)?;
        let width = frame_width(config.data_bits)?;
        let nss = self.pins.nss.is_some();
        let select = match config.slave_select {
            MasterSelect::Unused => Select::None,
            MasterSelect::Software if nss => Select::Pin,
            MasterSelect::HardwareOutput | MasterSelect::HardwareInput if nss => Select::Hardware,
            _ => return Err(Error::SlaveSelect),
        };
        if frf == 1 && config.slave_select != MasterSelect::HardwareOutput {
            return Err(Error::FrameFormat);
        }
        let br = prescaler(self.resources.frequency(), config.bus_speed).ok_or(Error::BusSpeed)?;
        Ok(Setup {
            master: true,
            cpol,
            cpha,
            frf,
            width,
            lsb_first: config.bit_order == BitOrder::LsbFirst,
            select,
            br,
        })
    }

    fn slave_setup(&self, config: &SlaveConfig) -> Result<Setup> {
        let (cpol, cpha, frf) = frame_bits(config.frame_format)?;
        let width = frame_width(config.data_bits)?;
        let select = match config.slave_select {
            SlaveSelect::Hardware if self.pins.nss.is_some() => Select::Hardware,
            SlaveSelect::Hardware => return Err(Error::SlaveSelect),
            SlaveSelect::Software => Select::Internal,
        };
        if frf == 1 && select != Select::Hardware {
            return Err(Error::FrameFormat);
        }
        Ok(Setup {
            master: false,
            cpol,
            cpha,
            frf,
            width,
            lsb_first: config.bit_order == BitOrder::LsbFirst,
            select,
            br: 0,
        })
    }

    fn apply(&self, state: &mut State<'d>, setup: Setup, hardware_output: bool) {
        let regs = &self.registers;
        // Software-managed selection keeps SSI high: a master stays clear of
        // mode faults, and a slave starts deselected.
        let ssm = matches!(setup.select, Select::None | Select::Pin | Select::Internal) as u32;
        regs.CR1.write(0);
        ral::write_reg!(
            crate::ral::spi,
            regs,
            CR2,
            SSOE: hardware_output as u32,
            FRF: setup.frf,
            ERRIE: 1
        );
        ral::write_reg!(
            crate::ral::spi,
            regs,
            CR1,
            CPHA: setup.cpha,
            CPOL: setup.cpol,
            MSTR: setup.master as u32,
            BR: setup.br,
            LSBFIRST: setup.lsb_first as u32,
            SSI: ssm,
            SSM: ssm,
            DFF: (setup.width == Width::HalfWord) as u32
        );
        if let Some(nss) = self.pins.nss {
            match setup.select {
                Select::Pin => {
                    nss.pin.set_high();
                    nss.pin.configure(PinMode::Output { open_drain: false });
                }
                Select::Hardware => nss.connect(false),
                Select::None | Select::Internal => {}
            }
        }
        ral::modify_reg!(crate::ral::spi, regs, CR1, SPE: 1);

        state.xfer.width = setup.width;
        state.select = setup.select;
        state.role = if setup.master { Role::Master } else { Role::Slave };
        state.bus_speed = if setup.master {
            self.resources.frequency() >> (setup.br + 1)
        } else {
            0
        };
        state.status.mode_fault = false;
        state.run = RunState::Configured;
    }

    fn configure(&self, command: Control) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            state.run.require_powered()?;

            match command {
                Control::Abort => {
                    self.abort(state);
                    return Ok(());
                }
                Control::DefaultTxValue(value) => {
                    state.xfer.default = value;
                    return Ok(());
                }
                _ => {}
            }

            match command {
                Control::SlaveSelect(active) => {
                    state.run.require_configured()?;
                    match (state.select, self.pins.nss) {
                        (Select::Pin, Some(nss)) if active => nss.pin.set_low(),
                        (Select::Pin, Some(nss)) => nss.pin.set_high(),
                        (Select::Internal, _) => {
                            let regs = &self.registers;
                            ral::modify_reg!(crate::ral::spi, regs, CR1, SSI: !active as u32);
                        }
                        _ => return Err(Error::SlaveSelect),
                    }
                    return Ok(());
                }
                _ if state.status.busy => return Err(Error::Busy),
                _ => {}
            }

            match command {
                Control::Inactive => {
                    self.registers.CR1.write(0);
                    state.stale = 0;
                    state.role = Role::Inactive;
                    state.bus_speed = 0;
                    state.run = RunState::Powered;
                    Ok(())
                }
                Control::Master(config) => {
                    let setup = self.master_setup(&config).inspect_err(|err| {
                        debug!("SPI master configuration rejected: {}", err);
                    })?;
                    self.apply(state, setup, config.slave_select == MasterSelect::HardwareOutput);
                    debug!("SPI master at {} Hz", state.bus_speed);
                    Ok(())
                }
                Control::Slave(config) => {
                    let setup = self.slave_setup(&config).inspect_err(|err| {
                        debug!("SPI slave configuration rejected: {}", err);
                    })?;
                    self.apply(state, setup, false);
                    debug!("SPI slave");
                    Ok(())
                }
                Control::BusSpeed(hz) => {
                    state.run.require_configured()?;
                    if state.role != Role::Master {
                        return Err(Error::Mode);
                    }
                    let pclk = self.resources.frequency();
                    let br = prescaler(pclk, hz).ok_or(Error::BusSpeed)?;
                    let regs = &self.registers;
                    ral::modify_reg!(crate::ral::spi, regs, CR1, SPE: 0);
                    ral::modify_reg!(crate::ral::spi, regs, CR1, BR: br);
                    ral::modify_reg!(crate::ral::spi, regs, CR1, SPE: 1);
                    state.bus_speed = pclk >> (br + 1);
                    Ok(())
                }
                Control::SlaveSelect(_) | Control::Abort | Control::DefaultTxValue(_) => Ok(()),
            }
        })
    }

    fn bindings(&self) -> [Option<PinBinding<'d>>; 4] {
        [self.pins.sck, self.pins.miso, self.pins.mosi, self.pins.nss]
    }
}

impl<'d> Driver<'d> for Spi<'d> {
    type Control = Control;
    type Status = Status;

    fn initialize(&self, callback: Option<Callback<'d>>) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.run >= RunState::Initialized {
                return Ok(());
            }
            resources::validate_pins(&self.bindings())?;
            for binding in self.bindings().into_iter().flatten() {
                binding.connect(false);
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
            for binding in self.bindings().into_iter().flatten() {
                binding.disconnect();
            }
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
                        self.resources.power_down(&[self.resources.irq]);
                        debug!("SPI powered off");
                    }
                    state.xfer.clear();
                    state.status = Status::default();
                    state.role = Role::Inactive;
                    state.select = Select::None;
                    state.bus_speed = 0;
                    state.stale = 0;
                    state.run = state.run.powered_off();
                    Ok(())
                }
                PowerState::Full => match state.run {
                    RunState::Uninitialized => Err(Error::Generic),
                    RunState::Initialized => {
                        self.resources.power_up(&[self.resources.irq]);
                        state.xfer.clear();
                        state.status = Status::default();
                        state.stale = 0;
                        state.run = RunState::Powered;
                        debug!("SPI powered on");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcc::{Bus, ClockId};
    use crate::testing::{ptr, FakeClocks, FakeDma, FakeInterrupts, FakePin, Recorder};

    const IRQ: u16 = 35;

    fn resources<'d>(
        clocks: &'d FakeClocks,
        interrupts: &'d FakeInterrupts,
        dma: Option<(&'d FakeDma, &'d FakeDma)>,
    ) -> Resources<'d> {
        Resources {
            clock: ClockId::new(Bus::Apb2, 12),
            irq: IRQ,
            priority: 0x40,
            clocks,
            interrupts,
            dma_tx: dma.map(|(tx, _)| tx as &dyn DmaChannel),
            dma_rx: dma.map(|(_, rx)| rx as &dyn DmaChannel),
        }
    }

    fn pins<'d>(sck: &'d FakePin, nss: Option<&'d FakePin>) -> Pins<'d> {
        Pins {
            sck: Some(PinBinding::new(sck, 5)),
            miso: None,
            mosi: None,
            nss: nss.map(|pin| PinBinding::new(pin, 5)),
        }
    }

    fn bring_up<'d>(spi: &Spi<'d>, callback: Option<Callback<'d>>) {
        spi.initialize(callback).unwrap();
        spi.power_control(PowerState::Full).unwrap();
        spi.control(Control::Master(Config::default())).unwrap();
    }

    #[test]
    fn lifecycle_gates_operations() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        let data = [0u8; 4];

        assert_eq!(spi.power_control(PowerState::Full), Err(Error::Generic));
        assert_eq!(spi.control(Control::Master(Config::default())), Err(Error::NotPowered));

        spi.initialize(None).unwrap();
        assert!(matches!(sck.mode(), Some(PinMode::Alternate { function: 5, .. })));
        assert_eq!(unsafe { spi.send(data.as_ptr(), 4) }, Err(Error::NotConfigured));

        spi.power_control(PowerState::Full).unwrap();
        assert!(clocks.is_enabled(ClockId::new(Bus::Apb2, 12)));
        assert_eq!(interrupts.priority(IRQ), Some(0x40));
        spi.power_control(PowerState::Full).unwrap();
        assert_eq!(clocks.resets(), 1, "second power up is a no-op");
        assert_eq!(spi.power_control(PowerState::Low), Err(Error::Unsupported));

        spi.control(Control::Master(Config::default())).unwrap();
        assert_eq!(unsafe { spi.send(core::ptr::null::<u8>(), 4) }, Err(Error::Parameter));
        assert_eq!(unsafe { spi.send(data.as_ptr(), 0) }, Err(Error::Parameter));
        assert_eq!(
            unsafe { spi.send(data.as_ptr().cast::<u16>(), 2) },
            Err(Error::Parameter),
            "16-bit buffer for 8-bit frames"
        );

        spi.uninitialize().unwrap();
        assert!(!clocks.is_enabled(ClockId::new(Bus::Apb2, 12)));
        assert!(!interrupts.is_enabled(IRQ));
        assert_eq!(sck.mode(), Some(PinMode::Analog));
    }

    #[test]
    fn master_configuration() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        spi.initialize(None).unwrap();
        spi.power_control(PowerState::Full).unwrap();

        spi.control(Control::Master(Config {
            frame_format: FrameFormat::Mode3,
            data_bits: 16,
            bus_speed: 3_000_000,
            ..Config::default()
        }))
        .unwrap();
        assert_eq!(spi.bus_speed(), 2_000_000);
        let cr1 = regs.CR1.read();
        assert_eq!(cr1 & 0b11, 0b11, "CPOL and CPHA");
        assert_ne!(cr1 & (1 << 2), 0, "master");
        assert_eq!((cr1 >> 3) & 0b111, 1, "divide by 4");
        assert_ne!(cr1 & (1 << 6), 0, "enabled");
        assert_ne!(cr1 & (1 << 11), 0, "16-bit frames");
        assert_eq!(cr1 & (0b11 << 8), 0b11 << 8, "software selection");

        spi.control(Control::BusSpeed(100_000)).unwrap();
        assert_eq!(spi.bus_speed(), 62_500);
        assert_eq!(spi.control(Control::BusSpeed(31_249)), Err(Error::BusSpeed));

        let rejected = |config: Config| spi.control(Control::Master(config));
        assert_eq!(
            rejected(Config { data_bits: 9, ..Config::default() }),
            Err(Error::DataBits)
        );
        assert_eq!(
            rejected(Config { frame_format: FrameFormat::Microwire, ..Config::default() }),
            Err(Error::Unsupported)
        );
        assert_eq!(
            rejected(Config { slave_select: MasterSelect::Software, ..Config::default() }),
            Err(Error::SlaveSelect),
            "no NSS pin"
        );
        assert_eq!(
            rejected(Config { frame_format: FrameFormat::TiSsi, ..Config::default() }),
            Err(Error::FrameFormat)
        );
    }

    #[test]
    fn software_slave_select_drives_pin() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let nss = FakePin::default();
        let spi = unsafe {
            Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, Some(&nss)))
        };
        spi.initialize(None).unwrap();
        spi.power_control(PowerState::Full).unwrap();
        spi.control(Control::Master(Config {
            slave_select: MasterSelect::Software,
            ..Config::default()
        }))
        .unwrap();
        assert_eq!(nss.mode(), Some(PinMode::Output { open_drain: false }));
        assert!(nss.level());

        spi.control(Control::SlaveSelect(true)).unwrap();
        assert!(!nss.level());
        spi.control(Control::SlaveSelect(false)).unwrap();
        assert!(nss.level());

        spi.control(Control::Slave(SlaveConfig {
            slave_select: SlaveSelect::Software,
            ..SlaveConfig::default()
        }))
        .unwrap();
        spi.control(Control::SlaveSelect(true)).unwrap();
        assert_eq!(regs.CR1.read() & (1 << 8), 0, "SSI low selects");
    }

    #[test]
    fn interrupt_transfer_completes_once() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        bring_up(&spi, Some(&callback));

        let tx = [1u8, 2, 3];
        let mut rx = [0u8; 3];
        unsafe { spi.transfer(tx.as_ptr(), rx.as_mut_ptr(), 3) }.unwrap();
        assert_eq!(regs.DR.read(), 1, "first item seeded");
        assert!(spi.status().busy);
        assert_eq!(
            unsafe { spi.send(tx.as_ptr(), 3) },
            Err(Error::Busy)
        );

        regs.SR.write(ral::spi::sr::TXE | ral::spi::sr::RXNE);
        for (received, sent) in [(0x11, 2), (0x22, 3)] {
            regs.DR.write(received);
            spi.on_interrupt();
            assert_eq!(regs.DR.read(), sent);
        }
        assert_eq!(spi.tx_count(), 3);
        assert_eq!(spi.rx_count(), 2);
        assert_eq!(recorder.count(), 0);

        regs.SR.write(ral::spi::sr::RXNE);
        regs.DR.write(0x33);
        spi.on_interrupt();
        assert_eq!(rx, [0x11, 0x22, 0x33]);
        assert_eq!(recorder.events(), [Events::TRANSFER_COMPLETE]);
        assert!(!spi.status().busy);
        assert_eq!(regs.CR2.read() & (0b11 << 6), 0, "data interrupts off");
    }

    #[test]
    fn receive_sends_default_value() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        bring_up(&spi, Some(&callback));
        spi.control(Control::DefaultTxValue(0x5A)).unwrap();

        let mut rx = [0u8; 1];
        unsafe { spi.receive(rx.as_mut_ptr(), 1) }.unwrap();
        assert_eq!(regs.DR.read(), 0x5A);

        regs.DR.write(0x42);
        regs.SR.write(ral::spi::sr::RXNE);
        spi.on_interrupt();
        assert_eq!(rx, [0x42]);
        assert_eq!(recorder.last(), Some(Events::RECEIVE_COMPLETE));
    }

    #[test]
    fn overrun_while_idle_sets_sticky_flag() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        bring_up(&spi, Some(&callback));

        regs.SR.write(ral::spi::sr::OVR);
        spi.on_interrupt();
        assert_eq!(recorder.events(), [Events::DATA_LOST]);
        assert!(spi.status().data_lost);
        assert_eq!(spi.rx_count(), 0);

        let data = [0u8; 2];
        regs.SR.write(0);
        unsafe { spi.send(data.as_ptr(), 2) }.unwrap();
        assert!(!spi.status().data_lost, "cleared by the next transfer");
    }

    #[test]
    fn mode_fault_ends_transfer() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        bring_up(&spi, Some(&callback));

        let data = [0u8; 4];
        unsafe { spi.send(data.as_ptr(), 4) }.unwrap();
        regs.SR.write(ral::spi::sr::MODF | ral::spi::sr::TXE);
        spi.on_interrupt();

        assert_eq!(recorder.events(), [Events::MODE_FAULT]);
        let status = spi.status();
        assert!(status.mode_fault);
        assert!(!status.busy);
        assert_eq!(
            unsafe { spi.send(data.as_ptr(), 4) },
            Err(Error::NotConfigured),
            "reconfigure after a mode fault"
        );
    }

    #[test]
    fn abort_is_silent_and_counts_restart() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        bring_up(&spi, Some(&callback));

        let mut rx = [0u8; 4];
        unsafe { spi.receive(rx.as_mut_ptr(), 4) }.unwrap();
        regs.SR.write(ral::spi::sr::RXNE | ral::spi::sr::TXE);
        spi.on_interrupt();
        spi.on_interrupt();
        assert_eq!(spi.rx_count(), 2);

        spi.control(Control::Abort).unwrap();
        assert!(!spi.status().busy);
        spi.on_interrupt();
        assert_eq!(recorder.count(), 0);

        unsafe { spi.receive(rx.as_mut_ptr(), 4) }.unwrap();
        assert_eq!(spi.rx_count(), 0);
        assert_eq!(spi.tx_count(), 1, "seeded item");
    }

    #[test]
    fn dma_completion_from_receive_channel() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let dma_tx = FakeDma::default();
        let dma_rx = FakeDma::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe {
            Spi::new(
                ptr(&regs),
                resources(&clocks, &interrupts, Some((&dma_tx, &dma_rx))),
                pins(&sck, None),
            )
        };
        assert!(spi.capabilities().dma);
        bring_up(&spi, Some(&callback));
        assert!(dma_tx.is_initialized() && dma_rx.is_initialized());

        let data = [7u8; 16];
        unsafe { spi.send(data.as_ptr(), 16) }.unwrap();
        let rx = dma_rx.transfer().unwrap();
        assert!(!rx.increment, "send discards into scratch");
        assert_eq!(rx.peripheral, dma_tx.transfer().unwrap().peripheral);
        assert_eq!(regs.CR2.read() & 0b11, 0b11, "DMA requests");
        assert_eq!(regs.CR2.read() & (0b11 << 6), 0, "no data interrupts");

        dma_tx.advance(10);
        dma_rx.advance(9);
        assert_eq!(spi.tx_count(), 10);
        assert_eq!(spi.rx_count(), 9);

        dma_tx.advance(6);
        spi.on_dma_tx();
        assert_eq!(recorder.count(), 0);
        dma_rx.advance(7);
        spi.on_dma_rx();
        assert_eq!(recorder.events(), [Events::SEND_COMPLETE]);
        assert_eq!(spi.rx_count(), 16);
        assert!(!spi.status().busy);
    }

    #[test]
    fn dma_abort_ignores_late_completion() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let dma_tx = FakeDma::default();
        let dma_rx = FakeDma::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe {
            Spi::new(
                ptr(&regs),
                resources(&clocks, &interrupts, Some((&dma_tx, &dma_rx))),
                pins(&sck, None),
            )
        };
        bring_up(&spi, Some(&callback));

        let mut data = [0u8; 8];
        unsafe { spi.receive(data.as_mut_ptr(), 8) }.unwrap();
        dma_rx.advance(5);
        spi.control(Control::Abort).unwrap();
        assert!(!dma_rx.is_enabled());

        dma_rx.flag_complete();
        spi.on_dma_rx();
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn item_in_flight_at_abort_is_discarded() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        bring_up(&spi, Some(&callback));

        let mut first = [0u8; 4];
        unsafe { spi.receive(first.as_mut_ptr(), 4) }.unwrap();
        regs.SR.write(ral::spi::sr::RXNE | ral::spi::sr::TXE);
        regs.DR.write(0x11);
        spi.on_interrupt();
        assert_eq!((spi.tx_count(), spi.rx_count()), (2, 1));
        spi.control(Control::Abort).unwrap();

        regs.SR.write(0);
        let mut second = [0u8; 1];
        unsafe { spi.receive(second.as_mut_ptr(), 1) }.unwrap();

        regs.SR.write(ral::spi::sr::RXNE);
        regs.DR.write(0xEE);
        spi.on_interrupt();
        assert_eq!(recorder.count(), 0, "the aborted transfer's last item");
        assert!(spi.status().busy);
        assert_eq!(spi.rx_count(), 0);

        regs.DR.write(0x42);
        spi.on_interrupt();
        assert_eq!(second, [0x42]);
        assert_eq!(recorder.events(), [Events::RECEIVE_COMPLETE]);
        assert_eq!(first, [0x11, 0, 0, 0]);
    }

    #[test]
    fn overrun_left_by_abort_is_cleared_on_start() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe { Spi::new(ptr(&regs), resources(&clocks, &interrupts, None), pins(&sck, None)) };
        bring_up(&spi, Some(&callback));

        let mut first = [0u8; 4];
        unsafe { spi.receive(first.as_mut_ptr(), 4) }.unwrap();
        spi.control(Control::Abort).unwrap();

        // Every stale item arrived while nobody listened.
        regs.SR.write(ral::spi::sr::OVR | ral::spi::sr::RXNE);
        let mut second = [0u8; 1];
        unsafe { spi.receive(second.as_mut_ptr(), 1) }.unwrap();
        assert!(!spi.status().data_lost);

        regs.SR.write(ral::spi::sr::RXNE);
        regs.DR.write(0x42);
        spi.on_interrupt();
        assert_eq!(second, [0x42]);
        assert_eq!(recorder.events(), [Events::RECEIVE_COMPLETE]);
    }

    #[test]
    fn dma_errors_end_the_transfer() {
        let regs: ral::spi::RegisterBlock = ral::zeroed();
        let clocks = FakeClocks::new(8_000_000);
        let interrupts = FakeInterrupts::default();
        let sck = FakePin::default();
        let dma_tx = FakeDma::default();
        let dma_rx = FakeDma::default();
        let recorder = Recorder::default();
        let callback = |events| recorder.record(events);
        let spi = unsafe {
            Spi::new(
                ptr(&regs),
                resources(&clocks, &interrupts, Some((&dma_tx, &dma_rx))),
                pins(&sck, None),
            )
        };
        bring_up(&spi, Some(&callback));

        let data = [7u8; 16];
        unsafe { spi.send(data.as_ptr(), 16) }.unwrap();
        dma_tx.advance(4);
        dma_tx.flag_error();
        spi.on_dma_tx();
        assert_eq!(recorder.events(), [Events::DATA_LOST]);
        let status = spi.status();
        assert!(status.data_lost);
        assert!(!status.busy);
        assert_eq!(spi.tx_count(), 4);
        assert!(!dma_tx.is_enabled() && !dma_rx.is_enabled());
        assert_eq!(regs.CR2.read() & 0b11, 0, "DMA requests off");

        let mut buffer = [0u8; 8];
        unsafe { spi.receive(buffer.as_mut_ptr(), 8) }.unwrap();
        assert!(!spi.status().data_lost, "cleared by the next transfer");
        dma_rx.advance(3);
        dma_rx.flag_error();
        spi.on_dma_rx();
        assert_eq!(recorder.last(), Some(Events::DATA_LOST));
        assert!(spi.status().data_lost);
        assert!(!spi.status().busy);
        assert_eq!(spi.rx_count(), 3);
        assert!(!dma_tx.is_enabled());

        dma_rx.flag_complete();
        spi.on_dma_rx();
        assert_eq!(recorder.count(), 2, "nothing after the failure");
    }
}

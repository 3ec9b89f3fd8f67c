//! USART driver.
//!
//! In the asynchronous modes, sends and receives are independent. Each has
//! its own busy flag and completion event. The receiver interrupt stays armed
//! whenever the receiver is on, so data that arrives with no receive active is
//! drained and reported as [`Events::RX_OVERFLOW`].
//!
//! A synchronous master clocks both directions on every frame. A send then
//! runs a discarding receive, and a receive sends the default value. The
//! transfer completes when the last frame is received.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::dma::DmaChannel;
use crate::event::{self, Callback, Events};
use crate::lifecycle::{PowerState, RunState};
use crate::ral::{self, Static};
use crate::resources::{self, PinBinding, Resources};
use crate::transfer::{DmaOutcome, Intent, Port, Scratch, TransferInfo, Transport};
use crate::word::{Width, Word};
use crate::{Driver, Error, Result};

/// How the USART talks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// UART framing on separate TX and RX lines.
    Asynchronous,
    /// The USART drives a clock on CK for every frame.
    SynchronousMaster,
    /// Clocked by an external master. Not supported by this peripheral.
    SynchronousSlave,
    /// Half duplex on the TX line.
    SingleWire,
    /// IrDA SIR encoding.
    IrDa,
    /// ISO 7816 smart card, with the card clock on CK.
    SmartCard,
}

impl Mode {
    const fn is_synchronous(self) -> bool {
        matches!(self, Mode::SynchronousMaster | Mode::SynchronousSlave)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    One,
    Two,
    Half,
    OneAndHalf,
}

/// Hardware flow control lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowControl {
    None,
    Rts,
    Cts,
    RtsCts,
}

/// Synchronous clock idle level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockPolarity {
    IdleLow,
    IdleHigh,
}

/// Synchronous clock edge that captures data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockPhase {
    FirstEdge,
    SecondEdge,
}

/// USART configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub mode: Mode,
    /// Requested baud rate. Accepted if an achievable rate is within 2%.
    pub baud_rate: u32,
    /// 7 (with parity), 8, or 9 (without parity).
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    pub clock_polarity: ClockPolarity,
    pub clock_phase: ClockPhase,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Asynchronous,
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            clock_polarity: ClockPolarity::IdleLow,
            clock_phase: ClockPhase::FirstEdge,
        }
    }
}

/// USART commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Control {
    /// Apply a configuration, and enable the peripheral.
    Configure(Config),
    /// Item sent when a synchronous receive has nothing to send.
    DefaultTxValue(u16),
    /// Enable or disable the transmitter.
    Transmitter(bool),
    /// Enable or disable the receiver.
    Receiver(bool),
    /// Send a break frame.
    Break(bool),
    /// IrDA pulse width in nanoseconds. Zero selects normal mode; anything
    /// else selects low-power mode with the closest prescaler.
    IrdaPulse(u32),
    /// Smart card guard time, in baud clocks.
    SmartCardGuardTime(u8),
    /// Smart card clock, in Hz. Zero stops the clock.
    SmartCardClock(u32),
    /// Smart card NACK on parity errors.
    SmartCardNack(bool),
    /// Stop the active send. No event follows.
    AbortSend,
    /// Stop the active receive. No event follows.
    AbortReceive,
    /// Stop the active synchronous transfer. No event follows.
    AbortTransfer,
}

/// USART status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub tx_busy: bool,
    pub rx_busy: bool,
    /// The last send stopped early on a DMA error.
    pub tx_error: bool,
    /// Received data was lost since the last receive started.
    pub rx_overflow: bool,
    pub rx_break: bool,
    pub rx_framing_error: bool,
    pub rx_parity_error: bool,
}

/// Modem lines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModemStatus {
    /// The peer asserts CTS. Always `false` without a CTS pin.
    pub cts: bool,
}

/// What this USART instance can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities {
    pub asynchronous: bool,
    pub synchronous_master: bool,
    pub synchronous_slave: bool,
    pub single_wire: bool,
    pub irda: bool,
    pub smart_card: bool,
    pub smart_card_clock: bool,
    pub flow_control_rts: bool,
    pub flow_control_cts: bool,
    /// [`Events::TX_COMPLETE`] is reported.
    pub event_tx_complete: bool,
    pub dma_tx: bool,
    pub dma_rx: bool,
}

/// USART signals.
#[derive(Clone, Copy)]
pub struct Pins<'d> {
    pub tx: Option<PinBinding<'d>>,
    pub rx: Option<PinBinding<'d>>,
    pub ck: Option<PinBinding<'d>>,
    pub rts: Option<PinBinding<'d>>,
    pub cts: Option<PinBinding<'d>>,
}

struct State<'d> {
    run: RunState,
    callback: Option<Callback<'d>>,
    xfer: TransferInfo,
    status: Status,
    mode: Mode,
    /// Significant bits of a received frame.
    mask: u16,
    baud_rate: u32,
}

impl State<'_> {
    const fn new() -> Self {
        Self {
            run: RunState::Uninitialized,
            callback: None,
            xfer: TransferInfo::new(),
            status: Status {
                tx_busy: false,
                rx_busy: false,
                rx_overflow: false,
                rx_break: false,
                rx_framing_error: false,
                rx_parity_error: false,
                tx_error: false,
            },
            mode: Mode::Asynchronous,
            mask: 0xFF,
            baud_rate: 0,
        }
    }

    fn clear_rx_errors(&mut self) {
        self.status.rx_overflow = false;
        self.status.rx_break = false;
        self.status.rx_framing_error = false;
        self.status.rx_parity_error = false;
    }
}

/// A USART driver.
pub struct Usart<'d> {
    registers: Static<ral::usart::RegisterBlock>,
    resources: Resources<'d>,
    pins: Pins<'d>,
    state: Mutex<RefCell<State<'d>>>,
    scratch: Scratch,
}

// Safety: OK to allocate in a static context. Mutable state is behind a
// critical section, and scratch memory is only touched by DMA while a
// transfer is active.
unsafe impl Sync for Usart<'_> {}

impl Port for Static<ral::usart::RegisterBlock> {
    const KEEP_RX_ARMED: bool = true;

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
        ral::modify_reg!(crate::ral::usart, self, CR1, TXEIE: enable as u32);
    }
    fn listen_rx(&self, enable: bool) {
        ral::modify_reg!(crate::ral::usart, self, CR1, RXNEIE: enable as u32);
    }
    fn request_tx(&self, enable: bool) {
        ral::modify_reg!(crate::ral::usart, self, CR3, DMAT: enable as u32);
    }
    fn request_rx(&self, enable: bool) {
        ral::modify_reg!(crate::ral::usart, self, CR3, DMAR: enable as u32);
    }
}

/// Picks the `BRR` divider for `baud` from a kernel clock of `pclk`.
///
/// With 16x oversampling, the rate is `pclk / D` for `16 <= D <= 0xFFFF`.
/// The better of the two dividers around `pclk / baud` wins, if it's within
/// 2% of the request.
fn divider(pclk: u32, baud: u32) -> Result<u32> {
    if baud == 0 {
        return Err(Error::BaudRate);
    }
    let exact = pclk / baud;
    let error = |d: u32| (pclk as u64).abs_diff(baud as u64 * d as u64);
    let best = [exact, exact.saturating_add(1)]
        .map(|d| d.clamp(16, 0xFFFF))
        .into_iter()
        .min_by_key(|&d| error(d) * 0x1_0000 / d as u64)
        .ok_or(Error::BaudRate)?;
    // |pclk/D - baud| <= baud / 50, scaled by D.
    if error(best) * 50 <= baud as u64 * best as u64 {
        Ok(best)
    } else {
        Err(Error::BaudRate)
    }
}

/// Everything a configuration writes, computed before touching hardware.
struct Setup {
    brr: u32,
    m: u32,
    pce: u32,
    ps: u32,
    stop: u32,
    width: Width,
    mask: u16,
}

impl<'d> Usart<'d> {
    /// Create a USART driver.
    ///
    /// # Safety
    ///
    /// `registers` must point to a USART register block, and `resources` must
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
        let ck = self.pins.ck.is_some();
        Capabilities {
            asynchronous: true,
            synchronous_master: ck,
            synchronous_slave: false,
            single_wire: true,
            irda: true,
            smart_card: true,
            smart_card_clock: ck,
            flow_control_rts: self.pins.rts.is_some(),
            flow_control_cts: self.pins.cts.is_some(),
            event_tx_complete: true,
            dma_tx: self.resources.dma_tx.is_some(),
            dma_rx: self.resources.dma_rx.is_some(),
        }
    }

    /// The baud rate that the configuration achieved. Zero when not
    /// configured.
    pub fn baud_rate(&self) -> u32 {
        critical_section::with(|cs| self.state.borrow_ref(cs).baud_rate)
    }

    /// Modem input lines.
    pub fn modem_status(&self) -> ModemStatus {
        ModemStatus {
            // Active low.
            cts: self.pins.cts.is_some_and(|cts| !cts.pin.is_high()),
        }
    }

    /// Send `num` items from `data`.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `num` items until the send
    /// completes, is aborted, or the driver powers off. The driver must not
    /// move while a transfer is active.
    pub unsafe fn send<W: Word>(&self, data: *const W, num: usize) -> Result<()> {
        if data.is_null() {
            return Err(Error::Parameter);
        }
        self.start(data.cast(), core::ptr::null_mut(), num, W::WIDTH, Intent::Tx)
    }

    /// Receive `num` items into `data`.
    ///
    /// # Safety
    ///
    /// `data` must be valid for writes of `num` items until the receive
    /// completes, is aborted, or the driver powers off. The driver must not
    /// move while a transfer is active.
    pub unsafe fn receive<W: Word>(&self, data: *mut W, num: usize) -> Result<()> {
        if data.is_null() {
            return Err(Error::Parameter);
        }
        self.start(core::ptr::null(), data.cast(), num, W::WIDTH, Intent::Rx)
    }

    /// Send and receive `num` items as a synchronous master.
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
        let regs = &self.registers;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            state.run.require_configured()?;
            if state.xfer.width != width {
                return Err(Error::Parameter);
            }
            let synchronous = state.mode.is_synchronous();
            if intent == Intent::TxRx && !synchronous {
                return Err(Error::Unsupported);
            }
            let busy = match intent {
                _ if synchronous => state.status.tx_busy || state.status.rx_busy,
                Intent::Tx => state.status.tx_busy,
                Intent::Rx | Intent::TxRx => state.status.rx_busy,
            };
            if busy {
                return Err(Error::Busy);
            }

            state.xfer.intent = intent;
            if synchronous || intent != Intent::Tx {
                state.status.rx_busy = true;
                state.clear_rx_errors();
                state.xfer.arm_rx(rx, num);
                state.xfer.start_rx(regs, self.resources.dma_rx, &self.scratch);
                if state.xfer.rx.transport == Transport::Dma {
                    // DMA owns the data register.
                    regs.listen_rx(false);
                }
            }
            if synchronous || intent != Intent::Rx {
                state.status.tx_busy = true;
                state.status.tx_error = false;
                state.xfer.arm_tx(tx, num);
                state.xfer.start_tx(regs, self.resources.dma_tx, &self.scratch);
            }
            Ok(())
        })
    }

    /// Items sent by the current, or last, send.
    pub fn tx_count(&self) -> usize {
        critical_section::with(|cs| self.state.borrow_ref(cs).xfer.tx.progress(self.resources.dma_tx))
    }

    /// Items received by the current, or last, receive.
    pub fn rx_count(&self) -> usize {
        critical_section::with(|cs| self.state.borrow_ref(cs).xfer.rx.progress(self.resources.dma_rx))
    }

    /// The receiver interrupt follows the receiver, unless DMA owns the data
    /// register.
    fn rearm_rx(&self, state: &State<'d>) {
        let regs = &self.registers;
        let receiving = ral::read_reg!(crate::ral::usart, regs, CR1, RE == 1);
        let rx = &state.xfer.rx;
        let dma = rx.active && rx.transport == Transport::Dma;
        regs.listen_rx(receiving && !dma);
    }

    /// Completion of the transmit lane.
    fn tx_done(&self, state: &mut State<'d>) -> Events {
        if state.mode.is_synchronous() {
            // The receive lane reports the transfer.
            return Events::empty();
        }
        state.status.tx_busy = false;
        let regs = &self.registers;
        ral::modify_reg!(crate::ral::usart, regs, CR1, TCIE: 1);
        Events::SEND_COMPLETE
    }

    /// Completion of the receive lane.
    fn rx_done(&self, state: &mut State<'d>) -> Events {
        state.status.rx_busy = false;
        if state.mode.is_synchronous() {
            // Every frame was clocked, so every frame was sent.
            if state.xfer.tx.active {
                state.xfer.abort_tx(&self.registers, self.resources.dma_tx);
            }
            state.status.tx_busy = false;
            state.xfer.intent.completion()
        } else {
            Events::RECEIVE_COMPLETE
        }
    }

    /// Handle the USART interrupt.
    pub fn on_interrupt(&self) {
        use ral::usart::sr;
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            let status = regs.SR.read();
            let cr1 = regs.CR1.read();
            let cr3 = regs.CR3.read();
            let mut events = Events::empty();

            // With the SR read above, the DR read clears the receive error
            // flags.
            let word = (status & sr::RXNE != 0 && cr1 & ral::usart::CR1::RXNEIE::mask != 0)
                .then(|| regs.read() & state.mask);

            if status & sr::ORE != 0 {
                state.status.rx_overflow = true;
                events |= Events::RX_OVERFLOW;
            }
            if status & sr::FE != 0 {
                if word == Some(0) {
                    state.status.rx_break = true;
                    events |= Events::RX_BREAK;
                } else {
                    state.status.rx_framing_error = true;
                    events |= Events::RX_FRAMING_ERROR;
                }
            }
            if status & sr::PE != 0 {
                state.status.rx_parity_error = true;
                events |= Events::RX_PARITY_ERROR;
            }
            if !events.is_empty() {
                debug!("USART receive error {}", events.bits());
            }

            if let Some(word) = word {
                match state.xfer.service_rx(regs, word) {
                    Some(true) => events |= self.rx_done(state),
                    Some(false) => {}
                    None => {
                        // Nowhere to put it.
                        state.status.rx_overflow = true;
                        events |= Events::RX_OVERFLOW;
                    }
                }
            }

            if status & sr::TXE != 0 && cr1 & ral::usart::CR1::TXEIE::mask != 0 && state.xfer.service_tx(regs) {
                events |= self.tx_done(state);
            }

            if status & sr::TC != 0 && cr1 & ral::usart::CR1::TCIE::mask != 0 {
                ral::modify_reg!(crate::ral::usart, regs, CR1, TCIE: 0);
                events |= Events::TX_COMPLETE;
            }

            if status & sr::CTS != 0 && cr3 & ral::usart::CR3::CTSIE::mask != 0 {
                // rc_w0; ones leave the other flags alone.
                regs.SR.write(!sr::CTS & 0x3FF);
                events |= Events::CTS;
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
            let events = match state.xfer.finish_dma_tx(regs, channel) {
                DmaOutcome::Complete => self.tx_done(state),
                DmaOutcome::Failed => {
                    warn!("USART transmit DMA error");
                    if state.mode.is_synchronous() {
                        // Nothing clocks the rest of the receive.
                        self.abort_receive(state);
                    }
                    state.status.tx_busy = false;
                    state.status.tx_error = true;
                    Events::TX_ERROR
                }
                DmaOutcome::Ignored => Events::empty(),
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
        let regs = &self.registers;
        let (events, callback) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            let events = match state.xfer.finish_dma_rx(regs, channel) {
                DmaOutcome::Complete => {
                    self.rearm_rx(state);
                    self.rx_done(state)
                }
                DmaOutcome::Failed => {
                    warn!("USART receive DMA error");
                    self.rearm_rx(state);
                    state.status.rx_busy = false;
                    state.status.rx_overflow = true;
                    Events::RX_OVERFLOW
                }
                DmaOutcome::Ignored => Events::empty(),
            };
            (events, state.callback)
        });
        event::notify(callback, events);
    }

    fn abort_send(&self, state: &mut State<'d>) {
        state.xfer.abort_tx(&self.registers, self.resources.dma_tx);
        state.status.tx_busy = false;
    }

    fn abort_receive(&self, state: &mut State<'d>) {
        state.xfer.abort_rx(&self.registers, self.resources.dma_rx);
        self.rearm_rx(state);
        state.status.rx_busy = false;
    }

    fn setup(&self, config: &Config) -> Result<Setup> {
        let (m, pce, width, mask) = match (config.data_bits, config.parity) {
            (7, Parity::None) => return Err(Error::DataBits),
            (7, _) => (0, 1, Width::Byte, 0x7F),
            (8, Parity::None) => (0, 0, Width::Byte, 0xFF),
            (8, _) => (1, 1, Width::Byte, 0xFF),
            (9, Parity::None) => (1, 0, Width::HalfWord, 0x1FF),
            (9, _) => return Err(Error::Parity),
            _ => return Err(Error::DataBits),
        };
        let stop = match config.stop_bits {
            StopBits::One => 0b00,
            StopBits::Half => 0b01,
            StopBits::Two => 0b10,
            StopBits::OneAndHalf => 0b11,
        };
        match config.mode {
            Mode::SynchronousSlave => return Err(Error::Unsupported),
            Mode::SynchronousMaster if self.pins.ck.is_none() => return Err(Error::Mode),
            Mode::SmartCard if config.parity == Parity::None => return Err(Error::Parity),
            _ => {}
        }
        let rts = matches!(config.flow_control, FlowControl::Rts | FlowControl::RtsCts);
        let cts = matches!(config.flow_control, FlowControl::Cts | FlowControl::RtsCts);
        if (rts && self.pins.rts.is_none()) || (cts && self.pins.cts.is_none()) {
            return Err(Error::FlowControl);
        }
        let brr = divider(self.resources.frequency(), config.baud_rate)?;
        Ok(Setup {
            brr,
            m,
            pce,
            ps: (config.parity == Parity::Odd) as u32,
            stop,
            width,
            mask,
        })
    }

    fn apply(&self, state: &mut State<'d>, config: &Config, setup: Setup) {
        let regs = &self.registers;
        let clocked = matches!(config.mode, Mode::SynchronousMaster | Mode::SmartCard);
        let rts = matches!(config.flow_control, FlowControl::Rts | FlowControl::RtsCts) as u32;
        let cts = matches!(config.flow_control, FlowControl::Cts | FlowControl::RtsCts) as u32;

        regs.CR1.write(0);
        ral::write_reg!(
            crate::ral::usart,
            regs,
            CR2,
            STOP: setup.stop,
            CLKEN: clocked as u32,
            CPOL: (config.clock_polarity == ClockPolarity::IdleHigh) as u32,
            CPHA: (config.clock_phase == ClockPhase::SecondEdge) as u32,
            LBCL: (config.mode == Mode::SynchronousMaster) as u32
        );
        ral::write_reg!(
            crate::ral::usart,
            regs,
            CR3,
            EIE: 1,
            IREN: (config.mode == Mode::IrDa) as u32,
            HDSEL: (config.mode == Mode::SingleWire) as u32,
            SCEN: (config.mode == Mode::SmartCard) as u32,
            RTSE: rts,
            CTSE: cts,
            CTSIE: cts
        );
        match config.mode {
            // Normal IrDA mode needs a prescaler of one.
            Mode::IrDa => ral::write_reg!(crate::ral::usart, regs, GTPR, PSC: 1),
            // Card clock at pclk / 2 until told otherwise.
            Mode::SmartCard => ral::write_reg!(crate::ral::usart, regs, GTPR, PSC: 1),
            _ => regs.GTPR.write(0),
        }
        regs.BRR.write(setup.brr);

        let open_drain = matches!(config.mode, Mode::SingleWire | Mode::SmartCard);
        if let Some(tx) = self.pins.tx {
            tx.connect(open_drain);
        }
        let transmit = self.pins.tx.is_some();
        let receive = self.pins.rx.is_some() || (config.mode == Mode::SingleWire && transmit);
        ral::write_reg!(
            crate::ral::usart,
            regs,
            CR1,
            M: setup.m,
            PCE: setup.pce,
            PS: setup.ps,
            PEIE: setup.pce,
            TE: transmit as u32,
            RE: receive as u32,
            RXNEIE: receive as u32,
            UE: 1
        );

        state.mode = config.mode;
        state.mask = setup.mask;
        state.xfer.width = setup.width;
        state.baud_rate = self.resources.frequency() / setup.brr;
        state.run = RunState::Configured;
    }

    fn require_mode(state: &State<'d>, mode: Mode) -> Result<()> {
        state.run.require_configured()?;
        if state.mode == mode {
            Ok(())
        } else {
            Err(Error::Unsupported)
        }
    }

    fn configure(&self, command: Control) -> Result<()> {
        let regs = &self.registers;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let state = &mut *state;
            state.run.require_powered()?;
            match command {
                Control::Configure(config) => {
                    if state.status.tx_busy || state.status.rx_busy {
                        return Err(Error::Busy);
                    }
                    let setup = self.setup(&config).inspect_err(|err| {
                        debug!("USART configuration rejected: {}", err);
                    })?;
                    self.apply(state, &config, setup);
                    debug!("USART at {} baud", state.baud_rate);
                }
                Control::DefaultTxValue(value) => state.xfer.default = value,
                Control::Transmitter(enable) => {
                    state.run.require_configured()?;
                    if !enable {
                        if state.mode.is_synchronous() {
                            // The transmitter clocks the receive too.
                            self.abort_receive(state);
                        }
                        self.abort_send(state);
                    }
                    ral::modify_reg!(crate::ral::usart, regs, CR1, TE: enable as u32);
                }
                Control::Receiver(enable) => {
                    state.run.require_configured()?;
                    ral::modify_reg!(crate::ral::usart, regs, CR1, RE: enable as u32);
                    if enable {
                        self.rearm_rx(state);
                    } else {
                        self.abort_receive(state);
                    }
                }
                Control::Break(send) => {
                    state.run.require_configured()?;
                    if state.status.tx_busy {
                        return Err(Error::Busy);
                    }
                    // The hardware clears SBK once the break is out.
                    if send {
                        ral::modify_reg!(crate::ral::usart, regs, CR1, SBK: 1);
                    }
                }
                Control::IrdaPulse(ns) => {
                    Self::require_mode(state, Mode::IrDa)?;
                    if ns == 0 {
                        ral::modify_reg!(crate::ral::usart, regs, CR3, IRLP: 0);
                        ral::modify_reg!(crate::ral::usart, regs, GTPR, PSC: 1);
                    } else {
                        let ticks = self.resources.frequency() as u64 * ns as u64 / 1_000_000_000;
                        let psc = u8::try_from(ticks)
                            .ok()
                            .filter(|&psc| psc != 0)
                            .ok_or(Error::Parameter)?;
                        ral::modify_reg!(crate::ral::usart, regs, GTPR, PSC: psc as u32);
                        ral::modify_reg!(crate::ral::usart, regs, CR3, IRLP: 1);
                    }
                }
                Control::SmartCardGuardTime(gt) => {
                    Self::require_mode(state, Mode::SmartCard)?;
                    ral::modify_reg!(crate::ral::usart, regs, GTPR, GT: gt as u32);
                }
                Control::SmartCardClock(hz) => {
                    Self::require_mode(state, Mode::SmartCard)?;
                    if hz == 0 {
                        ral::modify_reg!(crate::ral::usart, regs, CR2, CLKEN: 0);
                    } else {
                        // The card clock is pclk / (2 * PSC), PSC in 1..=31.
                        let psc = self.resources.frequency() / (2 * hz);
                        if !(1..=31).contains(&psc) {
                            return Err(Error::Parameter);
                        }
                        ral::modify_reg!(crate::ral::usart, regs, GTPR, PSC: psc);
                        ral::modify_reg!(crate::ral::usart, regs, CR2, CLKEN: 1);
                    }
                }
                Control::SmartCardNack(enable) => {
                    Self::require_mode(state, Mode::SmartCard)?;
                    ral::modify_reg!(crate::ral::usart, regs, CR3, NACK: enable as u32);
                }
                Control::AbortSend if state.mode.is_synchronous() => {
                    self.abort_receive(state);
                    self.abort_send(state);
                }
                Control::AbortSend => self.abort_send(state),
                Control::AbortReceive if state.mode.is_synchronous() => {
                    self.abort_receive(state);
                    self.abort_send(state);
                }
                Control::AbortReceive => self.abort_receive(state),
                Control::AbortTransfer => {
                    if !state.mode.is_synchronous() {
                        return Err(Error::Unsupported);
                    }
                    self.abort_receive(state);
                    self.abort_send(state);
                }
            }
            Ok(())
        })
    }

    fn bindings(&self) -> [Option<PinBinding<'d>>; 5] {
        [self.pins.tx, self.pins.rx, self.pins.ck, self.pins.rts, self.pins.cts]
    }
}

impl<'d> Driver<'d> for Usart<'d> {
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
                        debug!("USART powered off");
                    }
                    state.xfer.clear();
                    state.status = Status::default();
                    state.baud_rate = 0;
                    state.run = state.run.powered_off();
                    Ok(())
                }
                PowerState::Full => match state.run {
                    RunState::Uninitialized => Err(Error::Generic),
                    RunState::Initialized => {
                        self.resources.power_up(&[self.resources.irq]);
                        state.xfer.clear();
                        state.status = Status::default();
                        state.run = RunState::Powered;
                        debug!("USART powered on");
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
    use ral::usart::sr;

    struct Bench {
        regs: ral::usart::RegisterBlock,
        clocks: FakeClocks,
        interrupts: FakeInterrupts,
        tx: FakePin,
        rx: FakePin,
        ck: FakePin,
        cts: FakePin,
        dma_tx: FakeDma,
        dma_rx: FakeDma,
        recorder: Recorder,
    }

    impl Bench {
        fn new(pclk: u32) -> Self {
            Self {
                regs: ral::zeroed(),
                clocks: FakeClocks::new(pclk),
                interrupts: FakeInterrupts::default(),
                tx: FakePin::default(),
                rx: FakePin::default(),
                ck: FakePin::default(),
                cts: FakePin::default(),
                dma_tx: FakeDma::default(),
                dma_rx: FakeDma::default(),
                recorder: Recorder::default(),
            }
        }

        fn usart(&self, ck: bool, dma: bool) -> Usart<'_> {
            let resources = Resources {
                clock: ClockId::new(Bus::Apb1, 17),
                irq: 38,
                priority: 0x80,
                clocks: &self.clocks,
                interrupts: &self.interrupts,
                dma_tx: dma.then_some(&self.dma_tx as &dyn DmaChannel),
                dma_rx: dma.then_some(&self.dma_rx as &dyn DmaChannel),
            };
            let pins = Pins {
                tx: Some(PinBinding::new(&self.tx, 7)),
                rx: Some(PinBinding::new(&self.rx, 7)),
                ck: ck.then_some(PinBinding::new(&self.ck, 7)),
                rts: None,
                cts: Some(PinBinding::new(&self.cts, 7)),
            };
            unsafe { Usart::new(ptr(&self.regs), resources, pins) }
        }

        /// Received frame `word` is waiting in the data register.
        fn frame(&self, word: u32) {
            self.regs.DR.write(word);
            self.regs.SR.write(sr::RXNE);
        }
    }

    fn bring_up<'d>(usart: &Usart<'d>, callback: Callback<'d>, config: Config) {
        usart.initialize(Some(callback)).unwrap();
        usart.power_control(PowerState::Full).unwrap();
        usart.control(Control::Configure(config)).unwrap();
    }

    #[test]
    fn baud_115200_from_8mhz() {
        let d = divider(8_000_000, 115_200).unwrap();
        let actual = 8_000_000 / d;
        assert!((112_896..=117_504).contains(&actual), "{actual}");
        assert_eq!(divider(8_000_000, 1), Err(Error::BaudRate));
        assert_eq!(divider(8_000_000, 0), Err(Error::BaudRate));
        assert_eq!(divider(8_000_000, 1_000_000), Err(Error::BaudRate), "divider below 16");
        assert_eq!(divider(8_000_000, 500_000), Ok(16));
    }

    #[test]
    fn divider_accepted_iff_some_divider_is_close_enough() {
        let pclk = 8_000_000u32;
        let close = |baud: u32, d: u32| {
            (pclk as u64).abs_diff(baud as u64 * d as u64) * 50 <= baud as u64 * d as u64
        };
        let bauds = (1..=200u32)
            .map(|n| n * 2_617)
            .chain([110, 122, 123, 300, 9_600, 38_400, 57_600, 230_400, 490_000, 510_000, 520_000]);
        for baud in bauds {
            let exists = (16..=0xFFFF).any(|d| close(baud, d));
            match divider(pclk, baud) {
                Ok(d) => {
                    assert!(exists, "{baud}");
                    assert!(close(baud, d), "{baud} with {d}");
                }
                Err(err) => {
                    assert!(!exists, "{baud}");
                    assert_eq!(err, Error::BaudRate);
                }
            }
        }
    }

    #[test]
    fn configure_writes_frame_and_baud() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());

        assert_eq!(bench.regs.BRR.read(), 69);
        assert_eq!(usart.baud_rate(), 115_942);
        let cr1 = bench.regs.CR1.read();
        assert_ne!(cr1 & (1 << 13), 0, "UE");
        assert_ne!(cr1 & (1 << 3), 0, "TE");
        assert_ne!(cr1 & (1 << 2), 0, "RE");
        assert_ne!(cr1 & (1 << 5), 0, "RXNEIE");
        assert_eq!(cr1 & (1 << 12), 0, "8 bits");

        usart
            .control(Control::Configure(Config {
                data_bits: 8,
                parity: Parity::Odd,
                stop_bits: StopBits::Two,
                ..Config::default()
            }))
            .unwrap();
        let cr1 = bench.regs.CR1.read();
        let framing = (1 << 12) | (1 << 10) | (1 << 9);
        assert_eq!(cr1 & framing, framing, "M, PCE, PS");
        assert_eq!((bench.regs.CR2.read() >> 12) & 0b11, 0b10);
    }

    #[test]
    fn configuration_rejections() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());

        let configure = |config: Config| usart.control(Control::Configure(config));
        assert_eq!(configure(Config { baud_rate: 1, ..Config::default() }), Err(Error::BaudRate));
        for data_bits in [0, 5, 6, 10] {
            assert_eq!(
                configure(Config { data_bits, ..Config::default() }),
                Err(Error::DataBits)
            );
        }
        assert_eq!(configure(Config { data_bits: 7, ..Config::default() }), Err(Error::DataBits));
        assert_eq!(
            configure(Config { data_bits: 9, parity: Parity::Even, ..Config::default() }),
            Err(Error::Parity)
        );
        assert_eq!(
            configure(Config { mode: Mode::SynchronousMaster, ..Config::default() }),
            Err(Error::Mode),
            "no clock pin"
        );
        assert_eq!(
            configure(Config { mode: Mode::SynchronousSlave, ..Config::default() }),
            Err(Error::Unsupported)
        );
        assert_eq!(
            configure(Config { flow_control: FlowControl::Rts, ..Config::default() }),
            Err(Error::FlowControl)
        );
        configure(Config { flow_control: FlowControl::Cts, ..Config::default() }).unwrap();
        assert_ne!(bench.regs.CR3.read() & (0b11 << 9), 0, "CTSE, CTSIE");
        configure(Config { data_bits: 9, ..Config::default() }).unwrap();

        let data = [0u8; 2];
        assert_eq!(unsafe { usart.send(data.as_ptr(), 2) }, Err(Error::Parameter), "9-bit frames take u16");
    }

    #[test]
    fn second_receive_is_busy_until_first_completes() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());

        let mut first = [0u8; 5];
        let mut second = [0u8; 3];
        unsafe { usart.receive(first.as_mut_ptr(), 5) }.unwrap();
        assert_eq!(unsafe { usart.receive(second.as_mut_ptr(), 3) }, Err(Error::Busy));
        assert_eq!(second, [0; 3]);

        for (index, byte) in (b'a'..=b'e').enumerate() {
            assert_eq!(usart.rx_count(), index);
            bench.frame(byte as u32);
            usart.on_interrupt();
        }
        assert_eq!(&first, b"abcde");
        assert_eq!(bench.recorder.events(), [Events::RECEIVE_COMPLETE]);
        assert!(!usart.status().rx_busy);

        unsafe { usart.receive(second.as_mut_ptr(), 3) }.unwrap();
        assert_eq!(usart.rx_count(), 0);
    }

    #[test]
    fn data_while_idle_is_an_overflow() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());

        bench.frame(0x55);
        usart.on_interrupt();
        assert_eq!(bench.recorder.events(), [Events::RX_OVERFLOW]);
        assert!(usart.status().rx_overflow);
        assert_eq!(usart.rx_count(), 0);

        let mut data = [0u8; 1];
        unsafe { usart.receive(data.as_mut_ptr(), 1) }.unwrap();
        assert!(!usart.status().rx_overflow, "cleared by the next receive");
    }

    #[test]
    fn receive_errors_are_reported_together() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());

        let mut data = [0xFFu8; 2];
        unsafe { usart.receive(data.as_mut_ptr(), 2) }.unwrap();

        bench.regs.DR.write(0);
        bench.regs.SR.write(sr::RXNE | sr::FE);
        usart.on_interrupt();
        bench.regs.DR.write(0x12);
        bench.regs.SR.write(sr::RXNE | sr::PE | sr::ORE);
        usart.on_interrupt();

        assert_eq!(
            bench.recorder.events(),
            [
                Events::RX_BREAK,
                Events::RX_PARITY_ERROR | Events::RX_OVERFLOW | Events::RECEIVE_COMPLETE
            ]
        );
        assert_eq!(data, [0, 0x12]);
        let status = usart.status();
        assert!(status.rx_break && status.rx_parity_error && status.rx_overflow);
        assert!(!status.rx_framing_error);
    }

    #[test]
    fn send_then_line_idle() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());

        let data = *b"hi!";
        unsafe { usart.send(data.as_ptr(), 3) }.unwrap();
        assert_eq!(bench.regs.DR.read(), b'h' as u32);
        assert!(usart.status().tx_busy);
        assert_eq!(unsafe { usart.send(data.as_ptr(), 3) }, Err(Error::Busy));

        bench.regs.SR.write(sr::TXE);
        usart.on_interrupt();
        usart.on_interrupt();
        assert_eq!(bench.regs.DR.read(), b'!' as u32);
        assert_eq!(bench.recorder.events(), [Events::SEND_COMPLETE]);
        assert!(!usart.status().tx_busy);
        assert_eq!(usart.tx_count(), 3);

        bench.regs.SR.write(sr::TXE | sr::TC);
        usart.on_interrupt();
        assert_eq!(bench.recorder.last(), Some(Events::TX_COMPLETE));
        usart.on_interrupt();
        assert_eq!(bench.recorder.count(), 2, "TC reported once");
    }

    #[test]
    fn abort_receive_is_silent() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());

        let mut data = [0u8; 4];
        unsafe { usart.receive(data.as_mut_ptr(), 4) }.unwrap();
        bench.frame(1);
        usart.on_interrupt();
        usart.control(Control::AbortReceive).unwrap();
        assert!(!usart.status().rx_busy);
        assert_ne!(bench.regs.CR1.read() & (1 << 5), 0, "receiver stays armed");
        assert_eq!(bench.recorder.count(), 0);
        assert_eq!(usart.control(Control::AbortTransfer), Err(Error::Unsupported));
    }

    #[test]
    fn synchronous_send_completes_after_clocked_receive() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(true, false);
        assert!(usart.capabilities().synchronous_master);
        bring_up(
            &usart,
            &callback,
            Config {
                mode: Mode::SynchronousMaster,
                ..Config::default()
            },
        );
        assert_ne!(bench.regs.CR2.read() & (1 << 11), 0, "CLKEN");

        let data = [1u8, 2];
        unsafe { usart.send(data.as_ptr(), 2) }.unwrap();
        let status = usart.status();
        assert!(status.tx_busy && status.rx_busy);

        bench.regs.SR.write(sr::TXE | sr::RXNE);
        usart.on_interrupt();
        assert_eq!(bench.recorder.count(), 0, "last frame not yet received");
        bench.frame(0);
        usart.on_interrupt();
        assert_eq!(bench.recorder.events(), [Events::SEND_COMPLETE]);
        assert!(!usart.status().tx_busy);

        let mut rx = [0u8; 2];
        unsafe { usart.transfer(data.as_ptr(), rx.as_mut_ptr(), 2) }.unwrap();
    }

    #[test]
    fn transfer_needs_synchronous_mode() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(&usart, &callback, Config::default());
        let tx = [0u8; 2];
        let mut rx = [0u8; 2];
        assert_eq!(
            unsafe { usart.transfer(tx.as_ptr(), rx.as_mut_ptr(), 2) },
            Err(Error::Unsupported)
        );
    }

    #[test]
    fn dma_receive_and_abort() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, true);
        bring_up(&usart, &callback, Config::default());

        let mut data = [0u8; 8];
        unsafe { usart.receive(data.as_mut_ptr(), 8) }.unwrap();
        assert_eq!(bench.regs.CR1.read() & (1 << 5), 0, "DMA owns DR");
        assert_ne!(bench.regs.CR3.read() & (1 << 6), 0, "DMAR");
        bench.dma_rx.advance(8);
        usart.on_dma_rx();
        assert_eq!(bench.recorder.events(), [Events::RECEIVE_COMPLETE]);
        assert_ne!(bench.regs.CR1.read() & (1 << 5), 0, "receiver interrupt back");

        unsafe { usart.receive(data.as_mut_ptr(), 8) }.unwrap();
        bench.dma_rx.advance(3);
        assert_eq!(usart.rx_count(), 3);
        usart.control(Control::AbortReceive).unwrap();
        bench.dma_rx.flag_complete();
        usart.on_dma_rx();
        assert_eq!(bench.recorder.count(), 1);
    }

    #[test]
    fn dma_send_waits_for_line_idle() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, true);
        bring_up(&usart, &callback, Config::default());

        let data = [0u8; 32];
        unsafe { usart.send(data.as_ptr(), 32) }.unwrap();
        assert_eq!(bench.dma_tx.transfer().unwrap().count, 32);
        bench.dma_tx.advance(32);
        usart.on_dma_tx();
        assert_eq!(bench.recorder.events(), [Events::SEND_COMPLETE]);
        assert_ne!(bench.regs.CR1.read() & (1 << 6), 0, "TCIE");
    }

    #[test]
    fn dma_errors_are_reported() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, true);
        bring_up(&usart, &callback, Config::default());

        let data = [0u8; 32];
        unsafe { usart.send(data.as_ptr(), 32) }.unwrap();
        bench.dma_tx.advance(5);
        bench.dma_tx.flag_error();
        usart.on_dma_tx();
        assert_eq!(bench.recorder.events(), [Events::TX_ERROR]);
        let status = usart.status();
        assert!(status.tx_error);
        assert!(!status.tx_busy);
        assert_eq!(usart.tx_count(), 5);
        assert!(!bench.dma_tx.is_enabled());
        assert_eq!(bench.regs.CR1.read() & (1 << 6), 0, "no TCIE after a failed send");

        let mut buffer = [0u8; 8];
        unsafe { usart.receive(buffer.as_mut_ptr(), 8) }.unwrap();
        bench.dma_rx.advance(2);
        bench.dma_rx.flag_error();
        usart.on_dma_rx();
        assert_eq!(bench.recorder.last(), Some(Events::RX_OVERFLOW));
        let status = usart.status();
        assert!(status.rx_overflow);
        assert!(!status.rx_busy);
        assert_eq!(usart.rx_count(), 2);
        assert_ne!(bench.regs.CR1.read() & (1 << 5), 0, "receiver interrupt back");

        unsafe { usart.send(data.as_ptr(), 32) }.unwrap();
        assert!(!usart.status().tx_error, "cleared by the next send");
    }

    #[test]
    fn receiver_enable_leaves_dma_in_charge() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, true);
        bring_up(&usart, &callback, Config::default());

        let mut data = [0u8; 8];
        unsafe { usart.receive(data.as_mut_ptr(), 8) }.unwrap();
        usart.control(Control::Receiver(true)).unwrap();
        assert_ne!(bench.regs.CR1.read() & (1 << 2), 0, "RE");
        assert_eq!(bench.regs.CR1.read() & (1 << 5), 0, "DMA owns DR");

        bench.frame(0x55);
        usart.on_interrupt();
        assert_eq!(bench.recorder.count(), 0);
        assert!(!usart.status().rx_overflow);

        bench.dma_rx.advance(8);
        usart.on_dma_rx();
        assert_eq!(bench.recorder.events(), [Events::RECEIVE_COMPLETE]);
        assert_ne!(bench.regs.CR1.read() & (1 << 5), 0, "receiver interrupt back");

        usart.control(Control::Receiver(false)).unwrap();
        assert_eq!(bench.regs.CR1.read() & ((1 << 2) | (1 << 5)), 0);
        usart.control(Control::Receiver(true)).unwrap();
        assert_ne!(bench.regs.CR1.read() & (1 << 5), 0, "idle receiver listens");
    }

    #[test]
    fn synchronous_receive_ends_with_the_transmitter() {
        let synchronous = Config {
            mode: Mode::SynchronousMaster,
            ..Config::default()
        };

        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(true, false);
        bring_up(&usart, &callback, synchronous);
        let data = [1u8, 2];
        unsafe { usart.send(data.as_ptr(), 2) }.unwrap();
        usart.control(Control::Transmitter(false)).unwrap();
        let status = usart.status();
        assert!(!status.tx_busy && !status.rx_busy);
        assert_eq!(bench.regs.CR1.read() & (1 << 3), 0, "TE");
        assert_eq!(bench.recorder.count(), 0);

        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(true, true);
        bring_up(&usart, &callback, synchronous);
        unsafe { usart.send(data.as_ptr(), 2) }.unwrap();
        assert!(bench.dma_rx.is_enabled(), "clocked receive");
        bench.dma_tx.flag_error();
        usart.on_dma_tx();
        assert_eq!(bench.recorder.events(), [Events::TX_ERROR]);
        let status = usart.status();
        assert!(!status.tx_busy && !status.rx_busy);
        assert!(!bench.dma_rx.is_enabled());
    }

    #[test]
    fn cts_changes_and_modem_status() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(false, false);
        bring_up(
            &usart,
            &callback,
            Config {
                flow_control: FlowControl::Cts,
                ..Config::default()
            },
        );

        bench.regs.SR.write(sr::CTS);
        usart.on_interrupt();
        assert_eq!(bench.recorder.events(), [Events::CTS]);
        assert_eq!(bench.regs.SR.read() & sr::CTS, 0);

        assert!(!usart.modem_status().cts);
        bench.cts.hold_low(1);
        assert!(usart.modem_status().cts);
    }

    #[test]
    fn smart_card_controls() {
        let bench = Bench::new(8_000_000);
        let callback = |events| bench.recorder.record(events);
        let usart = bench.usart(true, false);
        bring_up(&usart, &callback, Config::default());
        assert_eq!(usart.control(Control::SmartCardGuardTime(2)), Err(Error::Unsupported));

        usart
            .control(Control::Configure(Config {
                mode: Mode::SmartCard,
                baud_rate: 9_600,
                parity: Parity::Even,
                stop_bits: StopBits::OneAndHalf,
                ..Config::default()
            }))
            .unwrap();
        usart.control(Control::SmartCardGuardTime(16)).unwrap();
        usart.control(Control::SmartCardClock(1_000_000)).unwrap();
        assert_eq!(bench.regs.GTPR.read(), (16 << 8) | 4);
        assert_eq!(usart.control(Control::SmartCardClock(10)), Err(Error::Parameter));
        usart.control(Control::SmartCardNack(true)).unwrap();
        assert_ne!(bench.regs.CR3.read() & (1 << 4), 0);
    }
}

//! Semantic events delivered to a driver callback

use core::ops::{BitOr, BitOrAssign};

/// A set of events observed in one interrupt.
///
/// A driver calls its callback at most once per interrupt entry, with every
/// event it observed OR'd together. Test for each event you care about with
/// [`contains`](Events::contains).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Events(u32);

impl Events {
    /// A send finished; every item left the buffer.
    pub const SEND_COMPLETE: Self = Self(1 << 0);
    /// A receive finished; every item landed in the buffer.
    pub const RECEIVE_COMPLETE: Self = Self(1 << 1);
    /// A duplex transfer finished.
    pub const TRANSFER_COMPLETE: Self = Self(1 << 2);
    /// The transmitter finished shifting out the last frame.
    pub const TX_COMPLETE: Self = Self(1 << 3);
    /// Received data was lost, or arrived with nowhere to go.
    pub const DATA_LOST: Self = Self(1 << 4);
    /// Alias of [`DATA_LOST`](Self::DATA_LOST), in USART terms.
    pub const RX_OVERFLOW: Self = Self::DATA_LOST;
    /// A break condition was received.
    pub const RX_BREAK: Self = Self(1 << 5);
    /// A frame arrived without a valid stop bit.
    pub const RX_FRAMING_ERROR: Self = Self(1 << 6);
    /// A frame arrived with bad parity.
    pub const RX_PARITY_ERROR: Self = Self(1 << 7);
    /// The CTS line changed state.
    pub const CTS: Self = Self(1 << 8);
    /// The SPI master lost its slave select.
    pub const MODE_FAULT: Self = Self(1 << 9);
    /// An I2C transfer finished, successfully or not.
    pub const TRANSFER_DONE: Self = Self(1 << 10);
    /// An I2C transfer moved fewer items than requested.
    pub const TRANSFER_INCOMPLETE: Self = Self(1 << 11);
    /// A master addressed us to read; provide data with a slave transmit.
    pub const SLAVE_TRANSMIT: Self = Self(1 << 12);
    /// A master addressed us to write; provide space with a slave receive.
    pub const SLAVE_RECEIVE: Self = Self(1 << 13);
    /// No slave acknowledged the address.
    pub const ADDRESS_NACK: Self = Self(1 << 14);
    /// We were addressed through the general call address.
    pub const GENERAL_CALL: Self = Self(1 << 15);
    /// Another master won bus arbitration.
    pub const ARBITRATION_LOST: Self = Self(1 << 16);
    /// A misplaced start or stop condition was detected.
    pub const BUS_ERROR: Self = Self(1 << 17);
    /// A bus clear finished.
    pub const BUS_CLEAR: Self = Self(1 << 18);
    /// A send stopped early. Its DMA stream reported a bus error.
    pub const TX_ERROR: Self = Self(1 << 19);

    /// No events.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns `true` if no event is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every event in `other` is also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds the events in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// The raw event bits.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Events {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::fmt::Debug for Events {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const NAMES: [(Events, &str); 20] = [
            (Events::SEND_COMPLETE, "SEND_COMPLETE"),
            (Events::RECEIVE_COMPLETE, "RECEIVE_COMPLETE"),
            (Events::TRANSFER_COMPLETE, "TRANSFER_COMPLETE"),
            (Events::TX_COMPLETE, "TX_COMPLETE"),
            (Events::DATA_LOST, "DATA_LOST"),
            (Events::RX_BREAK, "RX_BREAK"),
            (Events::RX_FRAMING_ERROR, "RX_FRAMING_ERROR"),
            (Events::RX_PARITY_ERROR, "RX_PARITY_ERROR"),
            (Events::CTS, "CTS"),
            (Events::MODE_FAULT, "MODE_FAULT"),
            (Events::TRANSFER_DONE, "TRANSFER_DONE"),
            (Events::TRANSFER_INCOMPLETE, "TRANSFER_INCOMPLETE"),
            (Events::SLAVE_TRANSMIT, "SLAVE_TRANSMIT"),
            (Events::SLAVE_RECEIVE, "SLAVE_RECEIVE"),
            (Events::ADDRESS_NACK, "ADDRESS_NACK"),
            (Events::GENERAL_CALL, "GENERAL_CALL"),
            (Events::ARBITRATION_LOST, "ARBITRATION_LOST"),
            (Events::BUS_ERROR, "BUS_ERROR"),
            (Events::BUS_CLEAR, "BUS_CLEAR"),
            (Events::TX_ERROR, "TX_ERROR"),
        ];
        let mut set = f.debug_set();
        for (event, name) in NAMES {
            if self.contains(event) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// A driver's event callback.
///
/// Called from interrupt context, never from inside a critical section.
pub type Callback<'d> = &'d dyn Fn(Events);

/// Calls `callback` once if there's something to report.
pub(crate) fn notify(callback: Option<Callback<'_>>, events: Events) {
    if events.is_empty() {
        return;
    }
    if let Some(callback) = callback {
        callback(events);
    }
}

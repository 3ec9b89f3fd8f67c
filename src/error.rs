//! Driver status codes

/// An error returned by a driver entry point.
///
/// Every variant describes a condition that's detected synchronously, before
/// the driver touches the hardware. Errors that happen while data moves are
/// never returned; they're reported through [`Events`](crate::Events) and the
/// sticky flags of each driver's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Unspecified failure.
    Generic,
    /// A transfer is active in the requested direction.
    Busy,
    /// An argument is invalid: a null buffer, a zero count, or a value out of
    /// range.
    Parameter,
    /// The operation or combination isn't supported by this peripheral.
    Unsupported,
    /// The operation requires a powered peripheral.
    NotPowered,
    /// The operation requires a configured peripheral.
    NotConfigured,
    /// The baud rate can't be reached within tolerance.
    BaudRate,
    /// The number of data bits isn't supported.
    DataBits,
    /// The parity mode isn't supported.
    Parity,
    /// The number of stop bits isn't supported.
    StopBits,
    /// The flow control mode isn't supported, or its pins aren't bound.
    FlowControl,
    /// The operating mode isn't supported, or its pins aren't bound.
    Mode,
    /// The SPI frame format isn't supported.
    FrameFormat,
    /// The slave select mode isn't supported, or its pin isn't bound.
    SlaveSelect,
    /// The bus speed can't be generated from the peripheral clock.
    BusSpeed,
    /// The bus didn't recover after a bus clear.
    BusClear,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::Generic => "driver error",
            Error::Busy => "driver busy",
            Error::Parameter => "invalid parameter",
            Error::Unsupported => "operation not supported",
            Error::NotPowered => "peripheral not powered",
            Error::NotConfigured => "peripheral not configured",
            Error::BaudRate => "baud rate out of tolerance",
            Error::DataBits => "unsupported data bits",
            Error::Parity => "unsupported parity",
            Error::StopBits => "unsupported stop bits",
            Error::FlowControl => "unsupported flow control",
            Error::Mode => "unsupported mode",
            Error::FrameFormat => "unsupported frame format",
            Error::SlaveSelect => "unsupported slave select mode",
            Error::BusSpeed => "unsupported bus speed",
            Error::BusClear => "bus clear failed",
        };
        f.write_str(msg)
    }
}

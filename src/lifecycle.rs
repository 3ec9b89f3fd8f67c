//! Power and configuration state shared by every driver

/// Requested power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// Clock off, interrupt masked, state discarded.
    Off,
    /// Low power retention. Not supported by these peripherals.
    Low,
    /// Clock on, peripheral reset, interrupt armed.
    Full,
}

/// Where a driver is in its lifecycle.
///
/// The order is meaningful: operations that need a powered peripheral accept
/// `Powered` and `Configured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunState {
    /// Nothing is bound.
    Uninitialized,
    /// Pins and callback are bound.
    Initialized,
    /// The peripheral is clocked and its interrupt is armed.
    Powered,
    /// Protocol parameters are applied and the peripheral is enabled.
    Configured,
}

impl RunState {
    /// Fails with `NotPowered` below `Powered`.
    pub(crate) fn require_powered(self) -> crate::Result<()> {
        if self >= RunState::Powered {
            Ok(())
        } else {
            Err(crate::Error::NotPowered)
        }
    }

    /// Fails with `NotConfigured` below `Configured`.
    pub(crate) fn require_configured(self) -> crate::Result<()> {
        if self == RunState::Configured {
            Ok(())
        } else {
            Err(crate::Error::NotConfigured)
        }
    }

    /// The state after a power off.
    pub(crate) fn powered_off(self) -> Self {
        self.min(RunState::Initialized)
    }
}

//! Reset and clock control registers (STM32F2/F4)
//!
//! Only the reset and enable banks are described. The clock tree itself is
//! configured by the application.

use super::RWRegister;

/// RCC registers, up to the peripheral clock enable banks.
#[repr(C)]
pub struct RegisterBlock {
    pub CR: RWRegister<u32>,
    pub PLLCFGR: RWRegister<u32>,
    pub CFGR: RWRegister<u32>,
    pub CIR: RWRegister<u32>,
    /// Reset registers, indexed by [`Bus`](crate::rcc::Bus) slot.
    ///
    /// AHB1, AHB2, AHB3, reserved, APB1, APB2.
    pub RSTR: [RWRegister<u32>; 6],
    _reserved0: [u32; 2],
    /// Enable registers, same slots as `RSTR`.
    pub ENR: [RWRegister<u32>; 6],
}

const _: () = assert!(core::mem::offset_of!(RegisterBlock, RSTR) == 0x10);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, ENR) == 0x30);

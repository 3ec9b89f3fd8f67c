//! GPIO port registers (STM32F2/F4)

use super::RWRegister;

/// GPIO port registers.
#[repr(C)]
pub struct RegisterBlock {
    /// Mode register, two bits per pin
    pub MODER: RWRegister<u32>,
    /// Output type register
    pub OTYPER: RWRegister<u32>,
    /// Output speed register, two bits per pin
    pub OSPEEDR: RWRegister<u32>,
    /// Pull-up / pull-down register, two bits per pin
    pub PUPDR: RWRegister<u32>,
    /// Input data register
    pub IDR: RWRegister<u32>,
    /// Output data register
    pub ODR: RWRegister<u32>,
    /// Bit set / reset register
    pub BSRR: RWRegister<u32>,
    /// Lock register
    pub LCKR: RWRegister<u32>,
    /// Alternate function registers, four bits per pin
    pub AFR: [RWRegister<u32>; 2],
}

const _: () = assert!(core::mem::offset_of!(RegisterBlock, BSRR) == 0x18);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, AFR) == 0x20);

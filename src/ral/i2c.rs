//! I2C v1 register block and fields (STM32F1/F2/F4)

use super::RWRegister;

/// I2C registers.
#[repr(C)]
pub struct RegisterBlock {
    /// Control register 1
    pub CR1: RWRegister<u32>,
    /// Control register 2
    pub CR2: RWRegister<u32>,
    /// Own address register 1
    pub OAR1: RWRegister<u32>,
    /// Own address register 2
    pub OAR2: RWRegister<u32>,
    /// Data register
    pub DR: RWRegister<u32>,
    /// Status register 1
    pub SR1: RWRegister<u32>,
    /// Status register 2
    pub SR2: RWRegister<u32>,
    /// Clock control register
    pub CCR: RWRegister<u32>,
    /// Rise time register
    pub TRISE: RWRegister<u32>,
}

super::fields! {
    CR1 {
        PE: 0, 1;
        SMBUS: 1, 1;
        ENGC: 6, 1;
        NOSTRETCH: 7, 1;
        START: 8, 1;
        STOP: 9, 1;
        ACK: 10, 1;
        POS: 11, 1;
        SWRST: 15, 1;
    }
    CR2 {
        FREQ: 0, 6;
        ITERREN: 8, 1;
        ITEVTEN: 9, 1;
        ITBUFEN: 10, 1;
        DMAEN: 11, 1;
        LAST: 12, 1;
    }
    OAR1 {
        ADD: 0, 10;
        ALWAYS_ONE: 14, 1;
        ADDMODE: 15, 1;
    }
    SR1 {
        SB: 0, 1;
        ADDR: 1, 1;
        BTF: 2, 1;
        ADD10: 3, 1;
        STOPF: 4, 1;
        RXNE: 6, 1;
        TXE: 7, 1;
        BERR: 8, 1;
        ARLO: 9, 1;
        AF: 10, 1;
        OVR: 11, 1;
    }
    SR2 {
        MSL: 0, 1;
        BUSY: 1, 1;
        TRA: 2, 1;
        GENCALL: 4, 1;
    }
    CCR {
        CCR: 0, 12;
        DUTY: 14, 1;
        FS: 15, 1;
    }
    TRISE {
        TRISE: 0, 6;
    }
}

/// Raw `SR1` bits, for decoding a snapshot taken once per interrupt.
pub mod sr1 {
    pub const SB: u32 = 1 << 0;
    pub const ADDR: u32 = 1 << 1;
    pub const BTF: u32 = 1 << 2;
    pub const ADD10: u32 = 1 << 3;
    pub const STOPF: u32 = 1 << 4;
    pub const RXNE: u32 = 1 << 6;
    pub const TXE: u32 = 1 << 7;
    pub const BERR: u32 = 1 << 8;
    pub const ARLO: u32 = 1 << 9;
    pub const AF: u32 = 1 << 10;
    pub const OVR: u32 = 1 << 11;
}

/// Raw `SR2` bits.
pub mod sr2 {
    pub const MSL: u32 = 1 << 0;
    pub const BUSY: u32 = 1 << 1;
    pub const TRA: u32 = 1 << 2;
    pub const GENCALL: u32 = 1 << 4;
}

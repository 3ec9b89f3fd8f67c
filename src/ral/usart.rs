//! USART v1 register block and fields (STM32F1/F2/F4)

use super::RWRegister;

/// USART registers.
#[repr(C)]
pub struct RegisterBlock {
    /// Status register
    pub SR: RWRegister<u32>,
    /// Data register
    pub DR: RWRegister<u32>,
    /// Baud rate register
    pub BRR: RWRegister<u32>,
    /// Control register 1
    pub CR1: RWRegister<u32>,
    /// Control register 2
    pub CR2: RWRegister<u32>,
    /// Control register 3
    pub CR3: RWRegister<u32>,
    /// Guard time and prescaler register
    pub GTPR: RWRegister<u32>,
}

super::fields! {
    SR {
        PE: 0, 1;
        FE: 1, 1;
        NF: 2, 1;
        ORE: 3, 1;
        IDLE: 4, 1;
        RXNE: 5, 1;
        TC: 6, 1;
        TXE: 7, 1;
        LBD: 8, 1;
        CTS: 9, 1;
    }
    CR1 {
        SBK: 0, 1;
        RWU: 1, 1;
        RE: 2, 1;
        TE: 3, 1;
        IDLEIE: 4, 1;
        RXNEIE: 5, 1;
        TCIE: 6, 1;
        TXEIE: 7, 1;
        PEIE: 8, 1;
        PS: 9, 1;
        PCE: 10, 1;
        WAKE: 11, 1;
        M: 12, 1;
        UE: 13, 1;
        OVER8: 15, 1;
    }
    CR2 {
        ADD: 0, 4;
        LBDL: 5, 1;
        LBDIE: 6, 1;
        LBCL: 8, 1;
        CPHA: 9, 1;
        CPOL: 10, 1;
        CLKEN: 11, 1;
        STOP: 12, 2;
        LINEN: 14, 1;
    }
    CR3 {
        EIE: 0, 1;
        IREN: 1, 1;
        IRLP: 2, 1;
        HDSEL: 3, 1;
        NACK: 4, 1;
        SCEN: 5, 1;
        DMAR: 6, 1;
        DMAT: 7, 1;
        RTSE: 8, 1;
        CTSE: 9, 1;
        CTSIE: 10, 1;
    }
    GTPR {
        PSC: 0, 8;
        GT: 8, 8;
    }
}

/// Raw `SR` bits, for decoding a snapshot taken once per interrupt.
pub mod sr {
    pub const PE: u32 = 1 << 0;
    pub const FE: u32 = 1 << 1;
    pub const ORE: u32 = 1 << 3;
    pub const RXNE: u32 = 1 << 5;
    pub const TC: u32 = 1 << 6;
    pub const TXE: u32 = 1 << 7;
    pub const CTS: u32 = 1 << 9;
}

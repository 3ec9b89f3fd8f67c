//! SPI v1 register block and fields (STM32F1/F2/F4)

use super::RWRegister;

/// SPI registers.
#[repr(C)]
pub struct RegisterBlock {
    /// Control register 1
    pub CR1: RWRegister<u32>,
    /// Control register 2
    pub CR2: RWRegister<u32>,
    /// Status register
    pub SR: RWRegister<u32>,
    /// Data register
    pub DR: RWRegister<u32>,
    /// CRC polynomial register
    pub CRCPR: RWRegister<u32>,
    /// RX CRC register
    pub RXCRCR: RWRegister<u32>,
    /// TX CRC register
    pub TXCRCR: RWRegister<u32>,
    /// I2S configuration register
    pub I2SCFGR: RWRegister<u32>,
    /// I2S prescaler register
    pub I2SPR: RWRegister<u32>,
}

super::fields! {
    CR1 {
        CPHA: 0, 1;
        CPOL: 1, 1;
        MSTR: 2, 1;
        BR: 3, 3;
        SPE: 6, 1;
        LSBFIRST: 7, 1;
        SSI: 8, 1;
        SSM: 9, 1;
        RXONLY: 10, 1;
        DFF: 11, 1;
        CRCNEXT: 12, 1;
        CRCEN: 13, 1;
        BIDIOE: 14, 1;
        BIDIMODE: 15, 1;
    }
    CR2 {
        RXDMAEN: 0, 1;
        TXDMAEN: 1, 1;
        SSOE: 2, 1;
        FRF: 4, 1;
        ERRIE: 5, 1;
        RXNEIE: 6, 1;
        TXEIE: 7, 1;
    }
    SR {
        RXNE: 0, 1;
        TXE: 1, 1;
        CHSIDE: 2, 1;
        UDR: 3, 1;
        CRCERR: 4, 1;
        MODF: 5, 1;
        OVR: 6, 1;
        BSY: 7, 1;
        FRE: 8, 1;
    }
}

/// Raw `SR` bits, for decoding a snapshot taken once per interrupt.
pub mod sr {
    pub const RXNE: u32 = 1 << 0;
    pub const TXE: u32 = 1 << 1;
    pub const MODF: u32 = 1 << 5;
    pub const OVR: u32 = 1 << 6;
    pub const BSY: u32 = 1 << 7;
}

#[cfg(test)]
mod tests {
    use super::RegisterBlock;
    use core::mem::offset_of;

    #[test]
    fn layout() {
        assert_eq!(offset_of!(RegisterBlock, SR), 0x08);
        assert_eq!(offset_of!(RegisterBlock, DR), 0x0C);
        assert_eq!(offset_of!(RegisterBlock, I2SPR), 0x20);
    }
}

//! DMA stream controller register blocks and fields (STM32F2/F4)

use super::RWRegister;

/// DMA controller registers.
#[repr(C)]
pub struct RegisterBlock {
    /// Low interrupt status register (streams 0..=3)
    pub LISR: RWRegister<u32>,
    /// High interrupt status register (streams 4..=7)
    pub HISR: RWRegister<u32>,
    /// Low interrupt flag clear register
    pub LIFCR: RWRegister<u32>,
    /// High interrupt flag clear register
    pub HIFCR: RWRegister<u32>,
    /// Stream registers
    pub ST: [StreamRegisterBlock; 8],
}

/// Registers of one DMA stream.
#[repr(C)]
pub struct StreamRegisterBlock {
    /// Configuration register
    pub CR: RWRegister<u32>,
    /// Number of data register
    pub NDTR: RWRegister<u32>,
    /// Peripheral address register
    pub PAR: RWRegister<u32>,
    /// Memory 0 address register
    pub M0AR: RWRegister<u32>,
    /// Memory 1 address register
    pub M1AR: RWRegister<u32>,
    /// FIFO control register
    pub FCR: RWRegister<u32>,
}

// The stream clusters start right after the flag registers.
const _: () = assert!(core::mem::offset_of!(RegisterBlock, ST) == 0x10);
const _: () = assert!(core::mem::size_of::<StreamRegisterBlock>() == 0x18);

super::fields! {
    CR {
        EN: 0, 1;
        DMEIE: 1, 1;
        TEIE: 2, 1;
        HTIE: 3, 1;
        TCIE: 4, 1;
        PFCTRL: 5, 1;
        DIR: 6, 2;
        CIRC: 8, 1;
        PINC: 9, 1;
        MINC: 10, 1;
        PSIZE: 11, 2;
        MSIZE: 13, 2;
        PL: 16, 2;
        CHSEL: 25, 3;
    }
    NDTR {
        NDT: 0, 16;
    }
    FCR {
        FTH: 0, 2;
        DMDIS: 2, 1;
    }
}

/// Per-stream interrupt flags, before shifting into `LISR`/`HISR`.
pub mod flags {
    /// FIFO error
    pub const FEIF: u32 = 1 << 0;
    /// Direct mode error
    pub const DMEIF: u32 = 1 << 2;
    /// Transfer error
    pub const TEIF: u32 = 1 << 3;
    /// Half transfer
    pub const HTIF: u32 = 1 << 4;
    /// Transfer complete
    pub const TCIF: u32 = 1 << 5;
    /// Every flag of one stream.
    pub const ALL: u32 = FEIF | DMEIF | TEIF | HTIF | TCIF;

    /// Bit position of a stream's flags within its half of the status registers.
    pub const fn shift(stream: usize) -> u32 {
        const SHIFTS: [u32; 4] = [0, 6, 16, 22];
        SHIFTS[stream % 4]
    }
}

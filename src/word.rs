//! Items moved by a transfer

/// Width of one transfer item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Width {
    /// 8-bit items.
    Byte,
    /// 16-bit items, for SPI 16-bit frames and USART 9-bit frames.
    HalfWord,
}

impl Width {
    /// Size of one item in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::HalfWord => 2,
        }
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
}

/// An item that a serial driver moves to or from a buffer.
///
/// Implemented for `u8` and `u16`. The item type of a buffer must match the
/// frame width that the driver is configured for.
pub trait Word: Copy + private::Sealed {
    /// Width of this item.
    const WIDTH: Width;
}

impl Word for u8 {
    const WIDTH: Width = Width::Byte;
}

impl Word for u16 {
    const WIDTH: Width = Width::HalfWord;
}

/// Reads the item at `index` from a buffer of `width` items.
///
/// # Safety
///
/// `buffer` must be valid for reads of `index + 1` items.
pub(crate) unsafe fn read(buffer: *const u8, width: Width, index: usize) -> u16 {
    match width {
        Width::Byte => buffer.add(index).read_volatile() as u16,
        Width::HalfWord => buffer.cast::<u16>().add(index).read_volatile(),
    }
}

/// Writes `value` to `index` of a buffer of `width` items.
///
/// # Safety
///
/// `buffer` must be valid for writes of `index + 1` items.
pub(crate) unsafe fn write(buffer: *mut u8, width: Width, index: usize, value: u16) {
    match width {
        Width::Byte => buffer.add(index).write_volatile(value as u8),
        Width::HalfWord => buffer.cast::<u16>().add(index).write_volatile(value),
    }
}

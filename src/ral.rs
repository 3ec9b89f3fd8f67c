//! A RAL-like module to support register access
//!
//! The STM32 v1 serial blocks are small, but their fields are scattered and
//! several bits have side effects when read or written. Each register block
//! here is a `#[repr(C)]` struct, and each register has a module of fields so
//! that we can use the RAL macros.
//!
//! Every block is plain memory as far as the compiler is concerned. That lets
//! tests back a block with zeroed RAM and inspect it afterwards.

#![allow(
    non_snake_case, // Compatibility with RAL
    non_upper_case_globals, // Compatibility with RAL
    unused, // Not every field has a reader
)]

pub mod dma;
pub mod gpio;
pub mod i2c;
pub mod rcc;
pub mod spi;
pub mod usart;

pub use ral_registers::{modify_reg, read_reg, write_reg};
use ral_registers::RWRegister;

//
// Helper types for static memory
//
// Similar to the RAL's `Instance` type, but more copy.
//

pub(crate) struct Static<T>(pub(crate) *const T);
impl<T> core::ops::Deref for Static<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // Safety: pointer points to static memory (peripheral memory)
        unsafe { &*self.0 }
    }
}
impl<T> Clone for Static<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Static<T> {}

impl<T> Static<T> {
    /// Address of a register inside the block, for DMA endpoints.
    pub(crate) fn address_of<R>(&self, register: impl FnOnce(&T) -> &R) -> *const () {
        let register: *const R = register(&**self);
        register.cast()
    }
}

/// Declares register field modules the way the RAL lays them out.
///
/// Each field gets `offset` and `mask` constants, plus the empty `R`, `W`,
/// and `RW` modules that the access macros import.
macro_rules! fields {
    ($($register:ident { $($field:ident: $offset:expr, $width:expr;)* })*) => {
        $(
            pub mod $register {
                $(
                    pub mod $field {
                        pub const offset: u32 = $offset;
                        pub const mask: u32 = ((1u32 << $width) - 1) << offset;
                        pub mod R {}
                        pub mod W {}
                        pub mod RW {}
                    }
                )*
            }
        )*
    };
}
pub(crate) use fields;

/// Allocates a zeroed register block for tests.
#[cfg(test)]
pub(crate) fn zeroed<T>() -> T {
    // Safety: register blocks are only UnsafeCell<uN> and padding
    // arrays. All-zero is a valid bit pattern for each of them.
    unsafe { core::mem::zeroed() }
}

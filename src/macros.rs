//! # Internal Macros
//!
//! Boilerplate reduction for zerocopy little-endian field access.
//!
//! ## zerocopy_getters!
//!
//! Generates read-only accessors for struct fields that use zerocopy's
//! little-endian wrapper types (U16, U32, U64, I64).
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     record_size: U32,
//!     timestamp: U64,
//! }
//!
//! impl Header {
//!     zerocopy_getters! {
//!         record_size: u32,
//!         timestamp: u64,
//!     }
//! }
//! ```

/// Generates getter methods for zerocopy little-endian fields (read-only).
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}

//! Native memory access and C struct marshaling.
//!
//! A [`Runtime`] owns the platform facts and the type registry. Memory is
//! reached through [`Pointer`] and its owning variants, and C structs are
//! described by a [`StructLayout`] and accessed through [`Struct`].

pub mod error;
pub mod layout;
pub mod library;
pub mod memory;
pub mod platform;
mod runtime;
pub mod types;
pub mod utils;
pub mod value;

pub use error::{FfiError, Result};
pub use layout::{ArrayProxy, Field, Member, Struct, StructLayout, StructLayoutBuilder};
pub use memory::{
    AbstractMemory, AutoPointer, Buffer, Function, MemoryPointer, Pointer, ToPointer,
};
pub use platform::{ByteOrder, Platform};
pub use runtime::Runtime;
pub use types::{NativeLayout, NativeType, Symbol, Type};
pub use value::Value;

pub mod access;
pub mod allocator;
mod function;
pub mod ops;
mod owned;
mod pointer;

pub use access::{MemoryAccessor, MemoryIo, Primitive};
pub use allocator::{Allocation, Allocator, HeapAllocator};
pub use function::Function;
pub use ops::{MemoryOp, PrimitiveOp};
pub use owned::{AutoPointer, Buffer, MemoryPointer};
pub use pointer::{AbstractMemory, Pointer, ToPointer, UNBOUNDED};

pub(crate) use pointer::pointer_accessor;

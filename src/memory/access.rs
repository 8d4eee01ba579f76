use super::allocator::Allocation;
use crate::{
    error::{FfiError, Result, FREED_MEMORY_ACCESS, NULL_POINTER_ACCESS},
    platform::ByteOrder,
    utils::Address,
};
use enum_dispatch::enum_dispatch;
use std::{fmt, ptr, sync::Arc};

pub(crate) const SWAPPED_ADDRESS_ACCESS: &str = "addresses cannot be accessed through byte-swapped memory";

/// Fixed-width values that can be moved in and out of native memory.
pub trait Primitive: Copy {
    fn byte_swapped(self) -> Self;
}

macro_rules! int_primitive {
    ($($t:ty),*) => {
        $(impl Primitive for $t {
            #[inline]
            fn byte_swapped(self) -> Self {
                self.swap_bytes()
            }
        })*
    };
}
int_primitive!(i8, u8, i16, u16, i32, u32, i64, u64, usize);

impl Primitive for f32 {
    #[inline]
    fn byte_swapped(self) -> Self {
        f32::from_bits(self.to_bits().swap_bytes())
    }
}

impl Primitive for f64 {
    #[inline]
    fn byte_swapped(self) -> Self {
        f64::from_bits(self.to_bits().swap_bytes())
    }
}

#[enum_dispatch]
pub trait MemoryIo {
    fn address(&self) -> usize;
    fn order(&self) -> ByteOrder;
    /// Resolves `offset` to a raw pointer, or fails if this accessor cannot
    /// be read or written.
    fn pointer_at(&self, offset: usize) -> Result<*mut u8>;
    fn is_direct(&self) -> bool {
        true
    }
    fn is_null(&self) -> bool {
        false
    }
}

/// Live memory at a native address, optionally keeping its allocation alive.
#[derive(Clone)]
pub struct DirectMemoryIo {
    address: usize,
    owner: Option<Arc<Allocation>>,
}

impl DirectMemoryIo {
    pub(crate) fn new(address: usize, owner: Option<Arc<Allocation>>) -> Self {
        Self { address, owner }
    }

    pub fn owner(&self) -> Option<&Arc<Allocation>> {
        self.owner.as_ref()
    }
}

impl MemoryIo for DirectMemoryIo {
    fn address(&self) -> usize {
        self.address
    }
    fn order(&self) -> ByteOrder {
        ByteOrder::native()
    }
    fn pointer_at(&self, offset: usize) -> Result<*mut u8> {
        if self.owner.as_ref().is_some_and(|o| o.is_released()) {
            return Err(FfiError::AccessViolation(FREED_MEMORY_ACCESS));
        }
        Ok(self.address.wrapping_add(offset) as *mut u8)
    }
}

/// Live memory whose multi-byte values are stored in the non-native order.
#[derive(Clone)]
pub struct SwappedMemoryIo {
    inner: DirectMemoryIo,
}

impl MemoryIo for SwappedMemoryIo {
    fn address(&self) -> usize {
        self.inner.address
    }
    fn order(&self) -> ByteOrder {
        ByteOrder::native().opposite()
    }
    fn pointer_at(&self, offset: usize) -> Result<*mut u8> {
        self.inner.pointer_at(offset)
    }
}

#[derive(Clone, Copy)]
pub struct NullMemoryIo;

impl MemoryIo for NullMemoryIo {
    fn address(&self) -> usize {
        0
    }
    fn order(&self) -> ByteOrder {
        ByteOrder::native()
    }
    fn pointer_at(&self, _offset: usize) -> Result<*mut u8> {
        Err(FfiError::AccessViolation(NULL_POINTER_ACCESS))
    }
    fn is_null(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy)]
pub struct FreedMemoryIo;

impl MemoryIo for FreedMemoryIo {
    fn address(&self) -> usize {
        0
    }
    fn order(&self) -> ByteOrder {
        ByteOrder::native()
    }
    fn pointer_at(&self, _offset: usize) -> Result<*mut u8> {
        Err(FfiError::AccessViolation(FREED_MEMORY_ACCESS))
    }
    fn is_direct(&self) -> bool {
        false
    }
}

/// Raw read/write access to a region of native memory.
///
/// Accessors do no bounds checking; the facades in [`crate::memory`] check
/// every access against their declared extent before delegating here.
#[enum_dispatch(MemoryIo)]
#[derive(Clone)]
pub enum MemoryAccessor {
    DirectMemoryIo,
    SwappedMemoryIo,
    NullMemoryIo,
    FreedMemoryIo,
}

impl MemoryAccessor {
    /// Accessor for an address the caller does not own. Address 0 is null.
    pub fn wrap(address: usize) -> Self {
        if address == 0 {
            NullMemoryIo.into()
        } else {
            DirectMemoryIo::new(address, None).into()
        }
    }

    pub fn is_freed(&self) -> bool {
        matches!(self, MemoryAccessor::FreedMemoryIo(_))
    }

    fn swaps(&self) -> bool {
        matches!(self, MemoryAccessor::SwappedMemoryIo(_))
    }

    fn reject_swapped(&self) -> Result<()> {
        if self.swaps() {
            return Err(FfiError::AccessViolation(SWAPPED_ADDRESS_ACCESS));
        }
        Ok(())
    }

    pub fn get<T: Primitive>(&self, offset: usize) -> Result<T> {
        let p = self.pointer_at(offset)?;
        // SAFETY: the facade checked offset + size_of::<T>() against its extent.
        let v = unsafe { ptr::read_unaligned(p.cast::<T>()) };
        Ok(if self.swaps() { v.byte_swapped() } else { v })
    }

    pub fn put<T: Primitive>(&self, offset: usize, value: T) -> Result<()> {
        let p = self.pointer_at(offset)?;
        let v = if self.swaps() {
            value.byte_swapped()
        } else {
            value
        };
        unsafe { ptr::write_unaligned(p.cast::<T>(), v) };
        Ok(())
    }

    pub fn get_address(&self, offset: usize) -> Result<usize> {
        self.reject_swapped()?;
        self.get::<usize>(offset)
    }

    pub fn put_address(&self, offset: usize, address: usize) -> Result<()> {
        self.reject_swapped()?;
        self.put::<usize>(offset, address)
    }

    /// Reads the address stored at `offset` and wraps it as a new accessor.
    pub fn get_memory_io(&self, offset: usize) -> Result<MemoryAccessor> {
        Ok(Self::wrap(self.get_address(offset)?))
    }

    pub fn put_memory_io(&self, offset: usize, io: &MemoryAccessor) -> Result<()> {
        match io {
            MemoryAccessor::FreedMemoryIo(_) => {
                Err(FfiError::AccessViolation(FREED_MEMORY_ACCESS))
            }
            MemoryAccessor::SwappedMemoryIo(_) => {
                Err(FfiError::AccessViolation(SWAPPED_ADDRESS_ACCESS))
            }
            other => self.put_address(offset, other.address()),
        }
    }

    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let p = self.pointer_at(offset)?;
        unsafe { ptr::copy_nonoverlapping(p as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    pub fn put_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let p = self.pointer_at(offset)?;
        unsafe { ptr::copy(src.as_ptr(), p, src.len()) };
        Ok(())
    }

    pub fn set_memory(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let p = self.pointer_at(offset)?;
        unsafe { ptr::write_bytes(p, value, len) };
        Ok(())
    }

    /// Position of the first `value` byte in `[offset, offset + limit)`,
    /// relative to `offset`.
    pub fn index_of(&self, offset: usize, value: u8, limit: usize) -> Result<Option<usize>> {
        let p = self.pointer_at(offset)?;
        for i in 0..limit {
            if unsafe { *p.add(i) } == value {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Bytes up to (not including) the first NUL, scanning at most `limit` bytes.
    pub fn get_zero_terminated(&self, offset: usize, limit: usize) -> Result<Vec<u8>> {
        let len = self.index_of(offset, 0, limit)?.unwrap_or(limit);
        let mut buf = vec![0u8; len];
        self.get_bytes(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn put_zero_terminated(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.put_bytes(offset, bytes)?;
        self.put::<u8>(offset + bytes.len(), 0)
    }

    pub fn slice(&self, offset: usize) -> MemoryAccessor {
        match self {
            MemoryAccessor::DirectMemoryIo(d) => {
                DirectMemoryIo::new(d.address.wrapping_add(offset), d.owner.clone()).into()
            }
            MemoryAccessor::SwappedMemoryIo(s) => SwappedMemoryIo {
                inner: DirectMemoryIo::new(
                    s.inner.address.wrapping_add(offset),
                    s.inner.owner.clone(),
                ),
            }
            .into(),
            other => other.clone(),
        }
    }

    /// The same memory viewed in `order`. Null and freed accessors are
    /// returned unchanged.
    pub fn with_order(&self, order: ByteOrder) -> MemoryAccessor {
        match self {
            MemoryAccessor::DirectMemoryIo(d) if !order.is_native() => {
                SwappedMemoryIo { inner: d.clone() }.into()
            }
            MemoryAccessor::SwappedMemoryIo(s) if order.is_native() => s.inner.clone().into(),
            other => other.clone(),
        }
    }

    pub fn owner(&self) -> Option<&Arc<Allocation>> {
        match self {
            MemoryAccessor::DirectMemoryIo(d) => d.owner(),
            MemoryAccessor::SwappedMemoryIo(s) => s.inner.owner(),
            _ => None,
        }
    }
}

impl PartialEq for MemoryAccessor {
    fn eq(&self, other: &Self) -> bool {
        self.is_direct() == other.is_direct()
            && self.address() == other.address()
            && self.order() == other.order()
    }
}

impl fmt::Debug for MemoryAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAccessor::DirectMemoryIo(d) => {
                write!(f, "Direct({:?})", Address(d.address))
            }
            MemoryAccessor::SwappedMemoryIo(s) => {
                write!(f, "Swapped({:?})", Address(s.inner.address))
            }
            MemoryAccessor::NullMemoryIo(_) => write!(f, "Null"),
            MemoryAccessor::FreedMemoryIo(_) => write!(f, "Freed"),
        }
    }
}

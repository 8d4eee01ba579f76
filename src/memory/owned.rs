use super::{
    access::{DirectMemoryIo, FreedMemoryIo},
    allocator::{Allocation, Allocator},
    AbstractMemory, Pointer, ToPointer,
};
use crate::{
    error::{FfiError, Result},
    platform::{ByteOrder, Platform},
    types::{NativeLayout, TypeSpec},
    Runtime,
};
use parking_lot::Mutex;
use std::{fmt, ops::Deref, sync::Arc};
use tracing::{debug, trace};

const ALLOCATION_ALIGNMENT: usize = 16;

fn allocate(
    allocator: &dyn Allocator,
    platform: Platform,
    type_size: usize,
    count: usize,
    clear: bool,
) -> Result<(AbstractMemory, Arc<Allocation>)> {
    let size = type_size.checked_mul(count).ok_or_else(|| {
        FfiError::InvalidArgument(format!("cannot allocate {count} x {type_size} bytes"))
    })?;
    let allocation = allocator.allocate(size, ALLOCATION_ALIGNMENT, clear)?;
    let io = DirectMemoryIo::new(allocation.address(), Some(allocation.clone()));
    Ok((
        AbstractMemory::new(io.into(), size, type_size, platform),
        allocation,
    ))
}

/// A pointer to memory this process allocated.
///
/// The memory is released when the last handle to it goes away, unless
/// autorelease was turned off, or earlier through [`free`](Self::free).
#[derive(Clone)]
pub struct MemoryPointer {
    pointer: Pointer,
    allocation: Arc<Allocation>,
}

impl MemoryPointer {
    pub fn new(runtime: &Runtime, type_size: usize, count: usize, clear: bool) -> Result<Self> {
        Self::with_allocator(
            runtime.allocator().as_ref(),
            *runtime.platform(),
            type_size,
            count,
            clear,
        )
    }

    /// Room for `count` values of the named type.
    pub fn of_type(runtime: &Runtime, ty: impl Into<TypeSpec>, count: usize) -> Result<Self> {
        let ty = runtime.resolve(ty)?;
        Self::new(runtime, ty.size(), count, true)
    }

    pub fn with_allocator(
        allocator: &dyn Allocator,
        platform: Platform,
        type_size: usize,
        count: usize,
        clear: bool,
    ) -> Result<Self> {
        let (memory, allocation) = allocate(allocator, platform, type_size, count, clear)?;
        debug!("memory pointer {:?}", allocation);
        Ok(Self {
            pointer: Pointer::from_memory(memory),
            allocation,
        })
    }

    /// A NUL-terminated copy of `bytes`.
    pub fn from_string(runtime: &Runtime, bytes: &[u8]) -> Result<Self> {
        let mp = Self::new(runtime, 1, bytes.len() + 1, false)?;
        mp.put_string(0, bytes)?;
        Ok(mp)
    }

    pub(crate) fn from_string_with(allocator: &dyn Allocator, platform: Platform, bytes: &[u8]) -> Result<Self> {
        let mp = Self::with_allocator(allocator, platform, 1, bytes.len() + 1, false)?;
        mp.put_string(0, bytes)?;
        Ok(mp)
    }

    /// Releases the memory now. Every view of it fails with an access
    /// violation from then on; freeing twice is an error.
    pub fn free(&mut self) -> Result<()> {
        self.allocation.release()?;
        self.pointer.memory_mut().invalidate(FreedMemoryIo.into());
        Ok(())
    }

    pub fn set_autorelease(&self, autorelease: bool) {
        self.allocation.set_autorelease(autorelease);
    }

    pub fn is_autorelease(&self) -> bool {
        self.allocation.is_autorelease()
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.allocation
    }

    pub fn into_pointer(self) -> Pointer {
        self.pointer
    }

    pub fn with_order(&self, order: ByteOrder) -> Pointer {
        self.pointer.with_order(order)
    }
}

impl Deref for MemoryPointer {
    type Target = Pointer;

    fn deref(&self) -> &Pointer {
        &self.pointer
    }
}

impl ToPointer for MemoryPointer {
    fn to_ptr(&self) -> Result<Pointer> {
        Ok(self.pointer.clone())
    }
}

impl PartialEq for MemoryPointer {
    fn eq(&self, other: &Self) -> bool {
        self.pointer == other.pointer
    }
}

impl fmt::Debug for MemoryPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPointer")
            .field("allocation", &self.allocation)
            .finish()
    }
}

/// Owned scratch memory used as an argument buffer. Unlike a
/// [`MemoryPointer`] it cannot be stored into pointer slots.
#[derive(Clone)]
pub struct Buffer {
    memory: AbstractMemory,
    allocation: Arc<Allocation>,
}

impl Buffer {
    pub fn new(runtime: &Runtime, type_size: usize, count: usize) -> Result<Self> {
        let (memory, allocation) = allocate(
            runtime.allocator().as_ref(),
            *runtime.platform(),
            type_size,
            count,
            true,
        )?;
        Ok(Self { memory, allocation })
    }

    pub fn slice(&self, offset: usize, len: Option<usize>) -> Result<Buffer> {
        Ok(Self {
            memory: self.memory.slice_memory(offset, len)?,
            allocation: self.allocation.clone(),
        })
    }

    pub fn with_order(&self, order: ByteOrder) -> Buffer {
        Self {
            memory: self.memory.with_io(self.memory.io().with_order(order)),
            allocation: self.allocation.clone(),
        }
    }
}

impl Deref for Buffer {
    type Target = AbstractMemory;

    fn deref(&self) -> &AbstractMemory {
        &self.memory
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.memory.size())
            .field("allocation", &self.allocation)
            .finish()
    }
}

type Releaser = Box<dyn FnOnce(Pointer) + Send>;

/// Foreign memory paired with the function that gives it back.
///
/// The releaser runs exactly once: on [`free`](Self::free), or on drop while
/// autorelease is on.
pub struct AutoPointer {
    pointer: Pointer,
    releaser: Mutex<Option<Releaser>>,
    autorelease: bool,
}

impl AutoPointer {
    pub fn new(pointer: Pointer, releaser: impl FnOnce(Pointer) + Send + 'static) -> Result<Self> {
        if pointer.io().owner().is_some() {
            return Err(FfiError::type_mismatch(
                "foreign pointer",
                "memory already owned by this process",
            ));
        }
        Ok(Self {
            pointer,
            releaser: Mutex::new(Some(Box::new(releaser))),
            autorelease: true,
        })
    }

    pub fn free(&mut self) -> Result<()> {
        let releaser = self
            .releaser
            .lock()
            .take()
            .ok_or(FfiError::AccessViolation("memory already freed"))?;
        let target = self.pointer.clone();
        self.pointer.memory_mut().invalidate(FreedMemoryIo.into());
        trace!("releasing auto pointer at {:#x}", target.address());
        releaser(target);
        Ok(())
    }

    pub fn set_autorelease(&mut self, autorelease: bool) {
        self.autorelease = autorelease;
    }

    pub fn is_autorelease(&self) -> bool {
        self.autorelease
    }
}

impl Deref for AutoPointer {
    type Target = Pointer;

    fn deref(&self) -> &Pointer {
        &self.pointer
    }
}

impl ToPointer for AutoPointer {
    fn to_ptr(&self) -> Result<Pointer> {
        if self.pointer.io().is_freed() {
            return Err(FfiError::AccessViolation(crate::error::FREED_MEMORY_ACCESS));
        }
        Ok(self.pointer.clone())
    }
}

impl Drop for AutoPointer {
    fn drop(&mut self) {
        if !self.autorelease {
            return;
        }
        if let Some(releaser) = self.releaser.get_mut().take() {
            releaser(self.pointer.clone());
        }
    }
}

impl fmt::Debug for AutoPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoPointer")
            .field("pointer", &self.pointer)
            .field("autorelease", &self.autorelease)
            .finish()
    }
}

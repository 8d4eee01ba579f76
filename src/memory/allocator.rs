use crate::{
    error::{FfiError, Result},
    utils::Address,
};
use std::{
    alloc::{self, Layout},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{trace, warn};

/// A block of native memory obtained from the process heap.
///
/// The block is returned to the heap either by an explicit [`release`] or,
/// when autorelease is on, once the last handle to it is dropped.
///
/// [`release`]: Allocation::release
pub struct Allocation {
    address: usize,
    layout: Layout,
    autorelease: AtomicBool,
    released: AtomicBool,
}

impl Allocation {
    pub(crate) fn new(size: usize, alignment: usize, clear: bool) -> Result<Self> {
        if size == 0 {
            return Err(FfiError::InvalidArgument(
                "allocation size must be positive".into(),
            ));
        }
        let layout = Layout::from_size_align(size, alignment.max(1).next_power_of_two())
            .map_err(|e| FfiError::InvalidArgument(e.to_string()))?;
        let raw = unsafe {
            if clear {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        if raw.is_null() {
            return Err(FfiError::AccessViolation("out of memory"));
        }
        trace!("allocated {size} bytes at {:?}", Address(raw as usize));
        Ok(Self {
            address: raw as usize,
            layout,
            autorelease: AtomicBool::new(true),
            released: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn is_autorelease(&self) -> bool {
        self.autorelease.load(Ordering::Acquire)
    }

    pub fn set_autorelease(&self, autorelease: bool) {
        self.autorelease.store(autorelease, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns the block to the heap now. Any other handle still pointing at
    /// it must not be dereferenced afterwards.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(FfiError::AccessViolation("memory already freed"));
        }
        trace!("released {:?}", Address(self.address));
        unsafe { alloc::dealloc(self.address as *mut u8, self.layout) };
        Ok(())
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        if self.is_autorelease() {
            unsafe { alloc::dealloc(self.address as *mut u8, self.layout) };
        } else {
            warn!(
                "leaking {} bytes at {:?} (autorelease disabled)",
                self.layout.size(),
                Address(self.address)
            );
        }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("address", &Address(self.address))
            .field("size", &self.layout.size())
            .field("autorelease", &self.is_autorelease())
            .field("released", &self.is_released())
            .finish()
    }
}

pub trait Allocator: Send + Sync + fmt::Debug {
    fn allocate(&self, size: usize, alignment: usize, clear: bool) -> Result<Arc<Allocation>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize, alignment: usize, clear: bool) -> Result<Arc<Allocation>> {
        Allocation::new(size, alignment, clear).map(Arc::new)
    }
}

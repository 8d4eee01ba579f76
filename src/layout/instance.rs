use super::{FieldKey, Member, Storage, StructLayout};
use crate::{
    error::{FfiError, Result},
    memory::{Allocator, MemoryPointer, Pointer, ToPointer},
    platform::ByteOrder,
    types::Symbol,
    value::Value,
    Runtime,
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{Arc, OnceLock},
};
use tracing::trace;

type Slots = Box<[Mutex<Option<Value>>]>;

/// The per-instance caches. Both arrays are created on first use, sized by
/// the layout's slot counts.
struct InstanceStorage {
    values: OnceLock<Slots>,
    references: OnceLock<Slots>,
    value_count: usize,
    reference_count: usize,
    allocator: Arc<dyn Allocator>,
}

impl InstanceStorage {
    fn new(layout: &StructLayout, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            values: OnceLock::new(),
            references: OnceLock::new(),
            value_count: layout.cache_count(),
            reference_count: layout.reference_count(),
            allocator,
        }
    }

    fn slots(cell: &OnceLock<Slots>, len: usize) -> &Slots {
        cell.get_or_init(|| (0..len).map(|_| Mutex::new(None)).collect())
    }

    fn clear(&self) {
        if let Some(values) = self.values.get() {
            values.iter().for_each(|slot| *slot.lock() = None);
        }
    }
}

impl Storage for InstanceStorage {
    fn cached_value(&self, member: &Member) -> Option<Value> {
        let index = member.cache_index()?;
        self.values.get()?.get(index)?.lock().clone()
    }

    fn put_cached_value(&self, member: &Member, value: Value) {
        if let Some(index) = member.cache_index() {
            if let Some(slot) = Self::slots(&self.values, self.value_count).get(index) {
                *slot.lock() = Some(value);
            }
        }
    }

    fn put_reference(&self, member: &Member, value: Value) {
        if let Some(index) = member.reference_index() {
            if let Some(slot) = Self::slots(&self.references, self.reference_count).get(index) {
                *slot.lock() = Some(value);
            }
        }
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }
}

struct StructInner {
    layout: Arc<StructLayout>,
    memory: Pointer,
    storage: InstanceStorage,
}

/// A struct instance: a layout laid over a region of memory.
///
/// Objects written into pointer, string, callback and by-reference fields are
/// retained by the instance, so the native addresses stored in its memory stay
/// valid for as long as the instance is alive.
#[derive(Clone)]
pub struct Struct(Arc<StructInner>);

impl Struct {
    /// Allocates zeroed memory for a new instance.
    pub fn new(runtime: &Runtime, layout: Arc<StructLayout>) -> Result<Self> {
        let memory = MemoryPointer::new(runtime, layout.size().max(1), 1, true)?;
        trace!("new struct of {} bytes at {:#x}", layout.size(), memory.address());
        Self::with_memory(runtime, layout, memory.into_pointer())
    }

    /// Overlays `layout` on existing memory, which must be large enough.
    pub fn with_memory(runtime: &Runtime, layout: Arc<StructLayout>, memory: Pointer) -> Result<Self> {
        Self::with_allocator(layout, memory, runtime.allocator().clone())
    }

    /// Like [`Struct::with_memory`], with string fields copied into blocks
    /// from `allocator`.
    pub fn with_allocator(
        layout: Arc<StructLayout>,
        memory: Pointer,
        allocator: Arc<dyn Allocator>,
    ) -> Result<Self> {
        if memory.size() < layout.size() {
            return Err(FfiError::InvalidArgument(format!(
                "memory of {} bytes is too small for a struct of {} bytes",
                memory.size(),
                layout.size()
            )));
        }
        let storage = InstanceStorage::new(&layout, allocator);
        Ok(Self(Arc::new(StructInner {
            layout,
            memory,
            storage,
        })))
    }

    pub fn layout(&self) -> &Arc<StructLayout> {
        &self.0.layout
    }

    pub fn memory(&self) -> &Pointer {
        &self.0.memory
    }

    pub fn size(&self) -> usize {
        self.0.layout.size()
    }

    pub fn alignment(&self) -> usize {
        self.0.layout.alignment()
    }

    pub fn is_null(&self) -> bool {
        self.0.memory.is_null()
    }

    pub fn order(&self) -> ByteOrder {
        self.0.memory.order()
    }

    /// The same layout over a view of the same memory in `order`. The new
    /// instance starts with empty caches.
    pub fn with_order(&self, order: ByteOrder) -> Result<Self> {
        if order == self.order() {
            return Ok(self.clone());
        }
        Self::with_allocator(
            self.0.layout.clone(),
            self.0.memory.with_order(order),
            self.0.storage.allocator.clone(),
        )
    }

    pub fn get<'k>(&self, key: impl Into<FieldKey<'k>>) -> Result<Value> {
        let member = self.0.layout.member(key)?;
        member.get(&self.0.storage, &self.0.memory)
    }

    pub fn set<'k>(&self, key: impl Into<FieldKey<'k>>, value: impl Into<Value>) -> Result<()> {
        let member = self.0.layout.member(key)?;
        member.put(&self.0.storage, &self.0.memory, &value.into())
    }

    /// Every field's value, in declaration order.
    pub fn values(&self) -> Result<Vec<Value>> {
        self.0
            .layout
            .members()
            .iter()
            .map(|m| m.get(&self.0.storage, &self.0.memory))
            .collect()
    }

    pub fn members(&self) -> Vec<Symbol> {
        self.0.layout.field_names()
    }

    pub fn offset_of<'k>(&self, key: impl Into<FieldKey<'k>>) -> Result<usize> {
        self.0.layout.offset_of(key)
    }

    pub fn offsets(&self) -> Vec<(Symbol, usize)> {
        self.0.layout.offsets()
    }

    /// Zeroes the struct's bytes and drops any memoized field views.
    pub fn clear(&self) -> Result<()> {
        let size = self.size();
        self.0.memory.check_bounds(0, size)?;
        self.0.memory.io().set_memory(0, size, 0)?;
        self.0.storage.clear();
        Ok(())
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl ToPointer for Struct {
    fn to_ptr(&self) -> Result<Pointer> {
        Ok(self.0.memory.clone())
    }
}

impl PartialEq for Struct {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
            || (self.0.memory.address() == other.0.memory.address()
                && *self.0.layout == *other.0.layout)
    }
}

impl fmt::Debug for Struct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Struct")
            .field("memory", &self.0.memory)
            .field("layout", &self.0.layout)
            .finish()
    }
}

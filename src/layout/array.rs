use crate::{
    error::{FfiError, Result},
    memory::{AbstractMemory, MemoryOp, Pointer, ToPointer},
    platform::{ByteOrder, Platform},
    types::{ArrayType, EnumType, NativeLayout, Type},
    value::Value,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, sync::OnceLock};

/// Element access for an array field: a plain memory op, an enum mapping
/// over its integer op, or a nested array for multi-dimensional fields.
#[derive(Clone, Debug)]
pub enum ComponentOp {
    Memory(MemoryOp),
    Enum {
        op: MemoryOp,
        mapping: EnumType,
    },
    Nested {
        array: ArrayType,
        inner: Box<ComponentOp>,
    },
}

impl ComponentOp {
    pub fn for_type(ty: &Type, order: ByteOrder, platform: &Platform) -> Result<Self> {
        match ty {
            Type::ArrayType(a) => Ok(ComponentOp::Nested {
                array: a.clone(),
                inner: Box::new(Self::for_type(a.component_type(), order, platform)?),
            }),
            Type::EnumType(e) => Ok(ComponentOp::Enum {
                op: MemoryOp::for_native(e.native_type(), order, platform)?,
                mapping: e.clone(),
            }),
            other => MemoryOp::for_type(other, order, platform)
                .map(ComponentOp::Memory)
                .map_err(|_| {
                    FfiError::NotImplemented(format!(
                        "unsupported array field type {}",
                        other.describe()
                    ))
                }),
        }
    }

    /// Nested arrays and structs are handed out as views and keep their
    /// identity across reads.
    fn is_memoized(&self) -> bool {
        matches!(
            self,
            ComponentOp::Nested { .. } | ComponentOp::Memory(MemoryOp::StructByValue(_))
        )
    }

    pub(crate) fn get(&self, memory: &AbstractMemory, offset: usize) -> Result<Value> {
        match self {
            ComponentOp::Memory(op) => op.get(memory, offset),
            ComponentOp::Enum { op, mapping } => {
                Ok(mapping.from_native(op.get(memory, offset)?.to_i64()?))
            }
            ComponentOp::Nested { array, inner } => {
                let slice = memory.slice_memory(offset, Some(array.size()))?;
                Ok(Value::Array(ArrayProxy::new(
                    slice,
                    array.clone(),
                    (**inner).clone(),
                )))
            }
        }
    }

    pub(crate) fn put(&self, memory: &AbstractMemory, offset: usize, value: &Value) -> Result<()> {
        match (self, value) {
            (ComponentOp::Memory(op), _) => op.put(memory, offset, value),
            (ComponentOp::Enum { op, mapping }, _) => {
                op.put(memory, offset, &Value::Int(mapping.to_native(value)?))
            }
            (ComponentOp::Nested { array, .. }, Value::Bytes(bytes)) if array.is_char_array() => {
                put_char_array(memory, offset, array.length(), bytes)
            }
            (ComponentOp::Nested { .. }, _) => Err(FfiError::AccessViolation(
                "cannot set multi dimensional array field",
            )),
        }
    }
}

/// Writes a string into a fixed `capacity`-byte char array: shorter strings
/// are NUL-terminated, an exact fit is stored without a terminator.
pub(crate) fn put_char_array(
    memory: &AbstractMemory,
    offset: usize,
    capacity: usize,
    bytes: &[u8],
) -> Result<()> {
    if bytes.len() < capacity {
        memory.put_string(offset, bytes)
    } else if bytes.len() == capacity {
        memory.put_bytes(offset, bytes)
    } else {
        Err(FfiError::InvalidArgument(format!(
            "String is longer ({} bytes) than the char array ({} bytes)",
            bytes.len(),
            capacity
        )))
    }
}

struct ArrayInner {
    memory: AbstractMemory,
    array: ArrayType,
    op: ComponentOp,
    length: usize,
    stride: usize,
    elements: OnceLock<Box<[Mutex<Option<Value>>]>>,
}

/// An indexable view of an array embedded in struct memory.
#[derive(Clone)]
pub struct ArrayProxy(Arc<ArrayInner>);

impl ArrayProxy {
    pub(crate) fn new(memory: AbstractMemory, array: ArrayType, op: ComponentOp) -> Self {
        let stride = array.component_type().size().max(1);
        let length = match array.length() {
            0 if memory.is_bounded() => memory.size() / stride,
            0 => usize::MAX,
            n => n,
        };
        Self(Arc::new(ArrayInner {
            memory,
            array,
            op,
            length,
            stride,
            elements: OnceLock::new(),
        }))
    }

    pub fn len(&self) -> usize {
        self.0.length
    }

    pub fn is_empty(&self) -> bool {
        self.0.length == 0
    }

    pub fn array_type(&self) -> &ArrayType {
        &self.0.array
    }

    pub fn is_char_array(&self) -> bool {
        self.0.array.is_char_array()
    }

    pub fn memory(&self) -> &AbstractMemory {
        &self.0.memory
    }

    fn check_index(&self, index: usize) -> Result<usize> {
        if index >= self.0.length {
            return Err(FfiError::IndexOutOfBounds(format!(
                "index {index} out of bounds"
            )));
        }
        Ok(index * self.0.stride)
    }

    fn element_slot(&self, index: usize) -> Option<&Mutex<Option<Value>>> {
        if !self.0.op.is_memoized() || self.0.array.length() == 0 {
            return None;
        }
        let slots = self.0.elements.get_or_init(|| {
            (0..self.0.length).map(|_| Mutex::new(None)).collect()
        });
        slots.get(index)
    }

    pub fn get(&self, index: usize) -> Result<Value> {
        let offset = self.check_index(index)?;
        let Some(slot) = self.element_slot(index) else {
            return self.0.op.get(&self.0.memory, offset);
        };
        let mut cached = slot.lock();
        if let Some(v) = cached.as_ref() {
            return Ok(v.clone());
        }
        let v = self.0.op.get(&self.0.memory, offset)?;
        *cached = Some(v.clone());
        Ok(v)
    }

    pub fn put(&self, index: usize, value: &Value) -> Result<()> {
        let offset = self.check_index(index)?;
        self.0.op.put(&self.0.memory, offset, value)
    }

    pub fn to_vec(&self) -> Result<Vec<Value>> {
        if self.0.array.length() == 0 {
            return Err(FfiError::NotImplemented(
                "cannot enumerate an array of unknown length".into(),
            ));
        }
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// The char array's contents up to the first NUL.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.require_chars()?;
        self.0.memory.get_string_limited(0, self.0.length)
    }

    pub fn to_string_lossy(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.to_bytes()?).into_owned())
    }

    pub fn put_string(&self, bytes: &[u8]) -> Result<()> {
        self.require_chars()?;
        put_char_array(&self.0.memory, 0, self.0.length, bytes)
    }

    fn require_chars(&self) -> Result<()> {
        if !self.is_char_array() {
            return Err(FfiError::type_mismatch(
                "char array",
                self.0.array.component_type().describe(),
            ));
        }
        Ok(())
    }
}

impl ToPointer for ArrayProxy {
    fn to_ptr(&self) -> Result<Pointer> {
        Ok(Pointer::from_memory(self.0.memory.clone()))
    }
}

impl PartialEq for ArrayProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.memory.address() == other.0.memory.address() && self.0.array == other.0.array)
    }
}

impl fmt::Debug for ArrayProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayProxy")
            .field("type", &self.0.array.component_type().describe())
            .field("length", &self.0.length)
            .finish()
    }
}

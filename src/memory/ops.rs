use super::{AbstractMemory, HeapAllocator, Pointer, Primitive};
use crate::{
    error::{FfiError, Result},
    layout::Struct,
    platform::{ByteOrder, Platform},
    types::{MappedType, NativeLayout, NativeType, StructByValue, Type},
    value::Value,
};
use std::{mem::size_of, sync::Arc};

/// Fixed-width kinds that have a direct memory representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveOp {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Pointer,
}

impl PrimitiveOp {
    /// `long`/`ulong` resolve to the 32 or 64-bit op according to `platform`.
    pub fn for_native(native_type: NativeType, platform: &Platform) -> Option<Self> {
        use NativeType as N;
        Some(match native_type {
            N::Bool => PrimitiveOp::Bool,
            N::Int8 => PrimitiveOp::Int8,
            N::UInt8 => PrimitiveOp::UInt8,
            N::Int16 => PrimitiveOp::Int16,
            N::UInt16 => PrimitiveOp::UInt16,
            N::Int32 => PrimitiveOp::Int32,
            N::UInt32 => PrimitiveOp::UInt32,
            N::Int64 => PrimitiveOp::Int64,
            N::UInt64 => PrimitiveOp::UInt64,
            N::Long if platform.long_size() == 32 => PrimitiveOp::Int32,
            N::Long => PrimitiveOp::Int64,
            N::ULong if platform.long_size() == 32 => PrimitiveOp::UInt32,
            N::ULong => PrimitiveOp::UInt64,
            N::Float32 => PrimitiveOp::Float32,
            N::Float64 => PrimitiveOp::Float64,
            N::Pointer => PrimitiveOp::Pointer,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            PrimitiveOp::Bool | PrimitiveOp::Int8 | PrimitiveOp::UInt8 => 1,
            PrimitiveOp::Int16 | PrimitiveOp::UInt16 => 2,
            PrimitiveOp::Int32 | PrimitiveOp::UInt32 | PrimitiveOp::Float32 => 4,
            PrimitiveOp::Int64 | PrimitiveOp::UInt64 | PrimitiveOp::Float64 => 8,
            PrimitiveOp::Pointer => size_of::<usize>(),
        }
    }

    fn is_swappable(self) -> bool {
        self.size() > 1 && self != PrimitiveOp::Pointer
    }

    fn load<T: Primitive>(memory: &AbstractMemory, offset: usize, swap: bool) -> Result<T> {
        let v = memory.io().get::<T>(offset)?;
        Ok(if swap { v.byte_swapped() } else { v })
    }

    fn store<T: Primitive>(memory: &AbstractMemory, offset: usize, v: T, swap: bool) -> Result<()> {
        memory
            .io()
            .put::<T>(offset, if swap { v.byte_swapped() } else { v })
    }

    fn get(self, memory: &AbstractMemory, offset: usize, swap: bool) -> Result<Value> {
        memory.check_bounds(offset, self.size())?;
        Ok(match self {
            PrimitiveOp::Bool => Value::Bool(Self::load::<u8>(memory, offset, false)? != 0),
            PrimitiveOp::Int8 => Value::Int(Self::load::<i8>(memory, offset, false)? as i64),
            PrimitiveOp::UInt8 => Value::Int(Self::load::<u8>(memory, offset, false)? as i64),
            PrimitiveOp::Int16 => Value::Int(Self::load::<i16>(memory, offset, swap)? as i64),
            PrimitiveOp::UInt16 => Value::Int(Self::load::<u16>(memory, offset, swap)? as i64),
            PrimitiveOp::Int32 => Value::Int(Self::load::<i32>(memory, offset, swap)? as i64),
            PrimitiveOp::UInt32 => Value::Int(Self::load::<u32>(memory, offset, swap)? as i64),
            PrimitiveOp::Int64 => Value::Int(Self::load::<i64>(memory, offset, swap)?),
            PrimitiveOp::UInt64 => Value::UInt(Self::load::<u64>(memory, offset, swap)?),
            PrimitiveOp::Float32 => Value::Float(Self::load::<f32>(memory, offset, swap)? as f64),
            PrimitiveOp::Float64 => Value::Float(Self::load::<f64>(memory, offset, swap)?),
            PrimitiveOp::Pointer => Value::Pointer(memory.get_pointer(offset)?),
        })
    }

    fn put(self, memory: &AbstractMemory, offset: usize, value: &Value, swap: bool) -> Result<()> {
        memory.check_bounds(offset, self.size())?;
        match self {
            PrimitiveOp::Bool => Self::store::<u8>(memory, offset, value.is_truthy() as u8, false),
            PrimitiveOp::Int8 => Self::store(memory, offset, value.to_i64()? as i8, false),
            PrimitiveOp::UInt8 => Self::store(memory, offset, value.to_i64()? as u8, false),
            PrimitiveOp::Int16 => Self::store(memory, offset, value.to_i64()? as i16, swap),
            PrimitiveOp::UInt16 => Self::store(memory, offset, value.to_i64()? as u16, swap),
            PrimitiveOp::Int32 => Self::store(memory, offset, value.to_i64()? as i32, swap),
            PrimitiveOp::UInt32 => Self::store(memory, offset, value.to_i64()? as u32, swap),
            PrimitiveOp::Int64 => Self::store(memory, offset, value.to_i64()?, swap),
            PrimitiveOp::UInt64 => Self::store(memory, offset, value.to_u64()?, swap),
            PrimitiveOp::Float32 => Self::store(memory, offset, value.to_f64()? as f32, swap),
            PrimitiveOp::Float64 => Self::store(memory, offset, value.to_f64()?, swap),
            PrimitiveOp::Pointer => memory.put_pointer_value(offset, value),
        }
    }
}

/// Reads and writes one value of a given type at an offset of a memory
/// facade.
///
/// Each primitive kind has a native-order and a swapped-order form; structs
/// embedded by value and converter-backed types get their own variants.
#[derive(Clone, Debug)]
pub enum MemoryOp {
    Native(PrimitiveOp),
    Swapped(PrimitiveOp),
    StructByValue(StructByValue),
    Mapped {
        mapped: MappedType,
        inner: Box<MemoryOp>,
    },
}

impl MemoryOp {
    pub fn for_native(native_type: NativeType, order: ByteOrder, platform: &Platform) -> Result<Self> {
        let op = PrimitiveOp::for_native(native_type, platform).ok_or_else(|| {
            FfiError::NotImplemented(format!("no memory op for {native_type}"))
        })?;
        Ok(if !order.is_native() && op.is_swappable() {
            MemoryOp::Swapped(op)
        } else {
            MemoryOp::Native(op)
        })
    }

    pub fn for_type(t: &Type, order: ByteOrder, platform: &Platform) -> Result<Self> {
        match t {
            Type::StructByValue(s) => Ok(MemoryOp::StructByValue(s.clone())),
            Type::MappedType(m) => Ok(MemoryOp::Mapped {
                mapped: m.clone(),
                inner: Box::new(Self::for_type(m.real_type(), order, platform)?),
            }),
            Type::CallbackInfo(_) | Type::StructByReference(_) => {
                Self::for_native(NativeType::Pointer, order, platform)
            }
            other => Self::for_native(other.native_type(), order, platform),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            MemoryOp::Native(op) | MemoryOp::Swapped(op) => op.size(),
            MemoryOp::StructByValue(s) => s.size(),
            MemoryOp::Mapped { inner, .. } => inner.size(),
        }
    }

    /// Whether the op moves a raw address, which has no byte-swapped form.
    pub fn carries_address(&self) -> bool {
        match self {
            MemoryOp::Native(op) | MemoryOp::Swapped(op) => *op == PrimitiveOp::Pointer,
            MemoryOp::Mapped { inner, .. } => inner.carries_address(),
            MemoryOp::StructByValue(_) => false,
        }
    }

    pub fn get(&self, memory: &AbstractMemory, offset: usize) -> Result<Value> {
        match self {
            MemoryOp::Native(op) => op.get(memory, offset, false),
            MemoryOp::Swapped(op) => op.get(memory, offset, true),
            MemoryOp::StructByValue(s) => {
                let slice = memory.slice_memory(offset, Some(s.size()))?;
                Ok(Value::Struct(Struct::with_allocator(
                    s.layout().clone(),
                    Pointer::from_memory(slice),
                    Arc::new(HeapAllocator),
                )?))
            }
            MemoryOp::Mapped { mapped, inner } => mapped.from_native(inner.get(memory, offset)?),
        }
    }

    pub fn put(&self, memory: &AbstractMemory, offset: usize, value: &Value) -> Result<()> {
        match self {
            MemoryOp::Native(op) => op.put(memory, offset, value, false),
            MemoryOp::Swapped(op) => op.put(memory, offset, value, true),
            MemoryOp::StructByValue(s) => {
                let Value::Struct(src) = value else {
                    return Err(FfiError::type_mismatch("struct", value.type_name()));
                };
                if **src.layout() != **s.layout() {
                    return Err(FfiError::type_mismatch(
                        "struct with a matching layout",
                        "incompatible struct layout",
                    ));
                }
                memory.check_bounds(offset, s.size())?;
                let bytes = src.memory().get_bytes(0, s.size())?;
                memory.io().put_bytes(offset, &bytes)
            }
            MemoryOp::Mapped { mapped, inner } => {
                inner.put(memory, offset, &mapped.to_native(value)?)
            }
        }
    }
}

use super::{array::put_char_array, ArrayProxy, ComponentOp, Member, Struct};
use crate::{
    error::{FfiError, Result},
    memory::{AbstractMemory, Allocator, Function, HeapAllocator, MemoryOp, MemoryPointer, Pointer},
    platform::{ByteOrder, Platform},
    types::{
        ArrayType, CallbackInfo, EnumType, MappedType, NativeLayout, NativeType,
        StructByReference, StructByValue, Type,
    },
    value::Value,
};
use std::{cell::RefCell, sync::Arc};

/// Per-instance state a field strategy may read or update: the value cache
/// and the reference slots that keep written objects alive.
pub trait Storage {
    fn cached_value(&self, member: &Member) -> Option<Value>;
    fn put_cached_value(&self, member: &Member, value: Value);
    fn put_reference(&self, member: &Member, value: Value);
    /// Where buffers owned on behalf of a field (string copies) come from.
    fn allocator(&self) -> Arc<dyn Allocator>;
}

/// Storage for access without a struct instance; nothing is cached or kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStorage;

impl Storage for NullStorage {
    fn cached_value(&self, _member: &Member) -> Option<Value> {
        None
    }
    fn put_cached_value(&self, _member: &Member, _value: Value) {}
    fn put_reference(&self, _member: &Member, _value: Value) {}
    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::new(HeapAllocator)
    }
}

/// Collects what an inner strategy retains, so a mapped field can keep it
/// in the same slot as its own converted value.
struct Retaining<'s> {
    outer: &'s dyn Storage,
    kept: RefCell<Vec<Value>>,
}

impl Storage for Retaining<'_> {
    fn cached_value(&self, _member: &Member) -> Option<Value> {
        None
    }
    fn put_cached_value(&self, _member: &Member, _value: Value) {}
    fn put_reference(&self, _member: &Member, value: Value) {
        self.kept.borrow_mut().push(value);
    }
    fn allocator(&self) -> Arc<dyn Allocator> {
        self.outer.allocator()
    }
}

/// How a field of a given type moves values in and out of struct memory.
///
/// Chosen once per field when it is created.
#[derive(Clone, Debug)]
pub enum FieldIo {
    Number(MemoryOp),
    Enum {
        op: MemoryOp,
        mapping: EnumType,
    },
    String,
    Pointer,
    Function(Arc<CallbackInfo>),
    InnerStruct(StructByValue),
    Array {
        array: ArrayType,
        op: ComponentOp,
    },
    StructByReference(StructByReference),
    Mapped {
        mapped: MappedType,
        inner: Box<FieldIo>,
    },
    Unsupported(NativeType),
}

impl FieldIo {
    pub fn for_type(ty: &Type, order: ByteOrder, platform: &Platform) -> Result<Self> {
        Ok(match ty {
            Type::Builtin(b) => match b.native_type() {
                NativeType::String => FieldIo::String,
                NativeType::Pointer => FieldIo::Pointer,
                nt @ (NativeType::Void | NativeType::LongDouble) => FieldIo::Unsupported(nt),
                nt => FieldIo::Number(MemoryOp::for_native(nt, order, platform)?),
            },
            Type::EnumType(e) => FieldIo::Enum {
                op: MemoryOp::for_native(e.native_type(), order, platform)?,
                mapping: e.clone(),
            },
            Type::CallbackInfo(c) => FieldIo::Function(Arc::new(c.clone())),
            Type::StructByValue(s) => FieldIo::InnerStruct(s.clone()),
            Type::ArrayType(a) => FieldIo::Array {
                array: a.clone(),
                op: ComponentOp::for_type(a.component_type(), order, platform)?,
            },
            Type::StructByReference(s) => FieldIo::StructByReference(s.clone()),
            Type::MappedType(m) => FieldIo::Mapped {
                mapped: m.clone(),
                inner: Box::new(Self::for_type(m.real_type(), order, platform)?),
            },
        })
    }

    /// Whether reads produce a facade worth memoizing per instance.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            FieldIo::Pointer | FieldIo::Function(_) | FieldIo::InnerStruct(_) | FieldIo::Array { .. }
        )
    }

    /// Whether writes must keep the written object alive alongside the struct.
    pub fn is_reference_needed(&self) -> bool {
        match self {
            FieldIo::String
            | FieldIo::Pointer
            | FieldIo::Function(_)
            | FieldIo::StructByReference(_) => true,
            FieldIo::Mapped { mapped, inner } => {
                inner.is_reference_needed() || mapped.is_reference_required()
            }
            _ => false,
        }
    }

    pub fn get(&self, storage: &dyn Storage, member: &Member, memory: &AbstractMemory) -> Result<Value> {
        let offset = member.offset();
        match self {
            FieldIo::Number(op) => op.get(memory, offset),
            FieldIo::Enum { op, mapping } => Ok(mapping.from_native(op.get(memory, offset)?.to_i64()?)),
            FieldIo::String => {
                let target = memory.get_pointer(offset)?;
                if target.is_null() {
                    Ok(Value::Nil)
                } else {
                    Ok(Value::Bytes(target.get_string(0)?))
                }
            }
            FieldIo::Pointer => {
                let current = memory.get_pointer(offset)?;
                if let Some(Value::Pointer(cached)) = storage.cached_value(member) {
                    if cached.io() == current.io() {
                        return Ok(Value::Pointer(cached));
                    }
                }
                let value = Value::Pointer(current);
                storage.put_cached_value(member, value.clone());
                Ok(value)
            }
            FieldIo::Function(info) => {
                let address = memory.get_address(offset)?;
                if address == 0 {
                    return Ok(Value::Nil);
                }
                if let Some(Value::Function(cached)) = storage.cached_value(member) {
                    if cached.address() == address {
                        return Ok(Value::Function(cached));
                    }
                }
                let function = Function::new(Pointer::new(address, *memory.platform()), info.clone());
                let value = Value::Function(function);
                storage.put_cached_value(member, value.clone());
                Ok(value)
            }
            FieldIo::InnerStruct(s) => {
                if let Some(cached @ Value::Struct(_)) = storage.cached_value(member) {
                    return Ok(cached);
                }
                let slice = memory.slice_memory(offset, Some(s.size()))?;
                let value = Value::Struct(Struct::with_allocator(
                    s.layout().clone(),
                    Pointer::from_memory(slice),
                    storage.allocator(),
                )?);
                storage.put_cached_value(member, value.clone());
                Ok(value)
            }
            FieldIo::Array { array, op } => {
                if let Some(cached @ Value::Array(_)) = storage.cached_value(member) {
                    return Ok(cached);
                }
                let len = (array.length() > 0).then(|| array.size());
                let slice = memory.slice_memory(offset, len)?;
                let value = Value::Array(ArrayProxy::new(slice, array.clone(), op.clone()));
                storage.put_cached_value(member, value.clone());
                Ok(value)
            }
            FieldIo::StructByReference(s) => {
                let address = memory.get_address(offset)?;
                if address == 0 {
                    return Ok(Value::Nil);
                }
                let target = Pointer::new(address, *memory.platform()).slice(0, Some(s.layout().size()))?;
                Ok(Value::Struct(Struct::with_allocator(
                    s.layout().clone(),
                    target,
                    storage.allocator(),
                )?))
            }
            FieldIo::Mapped { mapped, inner } => {
                mapped.from_native(inner.get(&NullStorage, member, memory)?)
            }
            FieldIo::Unsupported(nt) => Err(unsupported(*nt)),
        }
    }

    pub fn put(
        &self,
        storage: &dyn Storage,
        member: &Member,
        memory: &AbstractMemory,
        value: &Value,
    ) -> Result<()> {
        let offset = member.offset();
        match self {
            FieldIo::Number(op) => op.put(memory, offset, value),
            FieldIo::Enum { op, mapping } => {
                op.put(memory, offset, &Value::Int(mapping.to_native(value)?))
            }
            FieldIo::String => match value {
                Value::Nil => {
                    memory.put_address(offset, 0)?;
                    storage.put_reference(member, Value::Nil);
                    Ok(())
                }
                Value::Bytes(bytes) => {
                    let allocator = storage.allocator();
                    let copy = MemoryPointer::from_string_with(allocator.as_ref(), *memory.platform(), bytes)?;
                    memory.put_pointer(offset, &copy)?;
                    storage.put_reference(member, Value::Pointer(copy.into_pointer()));
                    Ok(())
                }
                other => Err(FfiError::type_mismatch("string", other.type_name())),
            },
            FieldIo::Pointer => {
                memory.put_pointer_value(offset, value)?;
                storage.put_reference(member, value.clone());
                Ok(())
            }
            FieldIo::Function(_) => {
                let address = match value {
                    Value::Nil => 0,
                    Value::Function(f) => f.address(),
                    Value::Pointer(p) => p.address(),
                    other => return Err(FfiError::type_mismatch("function", other.type_name())),
                };
                memory.put_address(offset, address)?;
                storage.put_reference(member, value.clone());
                Ok(())
            }
            FieldIo::InnerStruct(s) => MemoryOp::StructByValue(s.clone()).put(memory, offset, value),
            FieldIo::Array { array, op } => match value {
                Value::Bytes(bytes) if array.is_char_array() => {
                    put_char_array(memory, offset, array.length(), bytes)
                }
                Value::List(values) => {
                    if array.length() > 0 && values.len() > array.length() {
                        return Err(FfiError::IndexOutOfBounds("array too big".into()));
                    }
                    let stride = array.component_type().size();
                    for (i, v) in values.iter().enumerate() {
                        op.put(memory, offset + i * stride, v)?;
                    }
                    Ok(())
                }
                _ => Err(FfiError::NotImplemented("cannot set array field".into())),
            },
            FieldIo::StructByReference(s) => {
                match value {
                    Value::Nil => {}
                    Value::Struct(target)
                        if Arc::ptr_eq(target.layout(), s.layout()) || target.layout() == s.layout() => {}
                    Value::Struct(_) => {
                        return Err(FfiError::type_mismatch(
                            "struct of the declared layout",
                            "wrong struct subtype",
                        ))
                    }
                    other => return Err(FfiError::type_mismatch("struct", other.type_name())),
                }
                memory.put_pointer_value(offset, value)?;
                storage.put_reference(member, value.clone());
                Ok(())
            }
            FieldIo::Mapped { mapped, inner } => {
                let native = mapped.to_native(value)?;
                if !self.is_reference_needed() {
                    return inner.put(storage, member, memory, &native);
                }
                let retaining = Retaining {
                    outer: storage,
                    kept: RefCell::new(Vec::new()),
                };
                inner.put(&retaining, member, memory, &native)?;
                let mut kept = vec![value.clone(), native];
                kept.extend(retaining.kept.into_inner());
                storage.put_reference(member, Value::List(kept));
                Ok(())
            }
            FieldIo::Unsupported(nt) => Err(unsupported(*nt)),
        }
    }
}

fn unsupported(nt: NativeType) -> FfiError {
    FfiError::NotImplemented(format!("fields of type {nt} cannot be accessed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{types::DataConverter, Runtime};

    #[derive(Default)]
    struct Recording {
        references: RefCell<Vec<Value>>,
    }

    impl Storage for Recording {
        fn cached_value(&self, _member: &Member) -> Option<Value> {
            None
        }
        fn put_cached_value(&self, _member: &Member, _value: Value) {}
        fn put_reference(&self, _member: &Member, value: Value) {
            self.references.borrow_mut().push(value);
        }
        fn allocator(&self) -> Arc<dyn Allocator> {
            Arc::new(HeapAllocator)
        }
    }

    #[derive(Debug)]
    struct Shout {
        native: Type,
    }

    impl DataConverter for Shout {
        fn native_type(&self) -> Type {
            self.native.clone()
        }
        fn to_native(&self, value: &Value) -> Result<Value> {
            match value {
                Value::Bytes(b) => Ok(Value::Bytes(b.to_ascii_uppercase())),
                other => Ok(other.clone()),
            }
        }
        fn from_native(&self, value: Value) -> Result<Value> {
            Ok(value)
        }
    }

    #[test]
    fn test_mapped_string_keeps_inner_buffer() {
        let rt = Runtime::new();
        let shout = Type::from(MappedType::new(Arc::new(Shout {
            native: rt.resolve("string").unwrap(),
        })));
        let mut builder = rt.layout();
        builder.add("name", shout).unwrap();
        let layout = builder.build().unwrap();
        let member = layout.member("name").unwrap();
        let mem = MemoryPointer::new(&rt, layout.size(), 1, true).unwrap();

        let storage = Recording::default();
        member
            .put(&storage, &mem, &Value::Bytes(b"hello".to_vec()))
            .unwrap();
        let references = storage.references.borrow();
        let [Value::List(kept)] = references.as_slice() else {
            panic!("expected one retained list, got {references:?}");
        };
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[1], Value::Bytes(b"HELLO".to_vec()));
        let Value::Pointer(buffer) = &kept[2] else {
            panic!("expected the string buffer, got {:?}", kept[2]);
        };
        assert_eq!(buffer.address(), mem.get_address(0).unwrap());
        assert_eq!(member.get(&storage, &mem).unwrap(), Value::Bytes(b"HELLO".to_vec()));
    }

    #[test]
    fn test_strategy_flags() {
        let rt = Runtime::new();
        let p = rt.platform();
        let io = |name: &str| FieldIo::for_type(&rt.resolve(name).unwrap(), ByteOrder::native(), p).unwrap();
        assert!(!io("int32").is_cacheable());
        assert!(!io("int32").is_reference_needed());
        assert!(io("pointer").is_cacheable());
        assert!(io("string").is_reference_needed());
        assert!(!io("string").is_cacheable());
        assert!(matches!(io("long_double"), FieldIo::Unsupported(NativeType::LongDouble)));
    }
}

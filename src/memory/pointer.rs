use super::{
    access::{MemoryIo, SWAPPED_ADDRESS_ACCESS},
    Function, MemoryAccessor, MemoryOp,
};
use crate::{
    error::{FfiError, Result},
    platform::{ByteOrder, Platform},
    types::{NativeLayout, Type},
    utils::Address,
    value::Value,
};
use std::{fmt, mem::size_of, ops::Deref};

/// Extent of a facade whose size is not known.
pub const UNBOUNDED: usize = usize::MAX;

/// Bounds-checked, typed access to a region of native memory.
///
/// Every offset-taking operation validates `offset + width <= size` before it
/// touches the underlying accessor. [`Pointer`], [`Buffer`] and
/// [`MemoryPointer`] all deref to this type.
///
/// [`Buffer`]: super::Buffer
/// [`MemoryPointer`]: super::MemoryPointer
#[derive(Clone)]
pub struct AbstractMemory {
    io: MemoryAccessor,
    size: usize,
    type_size: usize,
    platform: Platform,
}

macro_rules! primitive_accessors {
    ($($t:ty => $get:ident, $put:ident, $read:ident, $write:ident,
        $get_array:ident, $put_array:ident, $read_array:ident, $write_array:ident;)*) => {
        impl AbstractMemory {
            $(
                pub fn $get(&self, offset: usize) -> Result<$t> {
                    self.check_bounds(offset, size_of::<$t>())?;
                    self.io.get::<$t>(offset)
                }

                pub fn $put(&self, offset: usize, value: $t) -> Result<()> {
                    self.check_bounds(offset, size_of::<$t>())?;
                    self.io.put::<$t>(offset, value)
                }

                pub fn $read(&self) -> Result<$t> {
                    self.$get(0)
                }

                pub fn $write(&self, value: $t) -> Result<()> {
                    self.$put(0, value)
                }

                pub fn $get_array(&self, offset: usize, count: usize) -> Result<Vec<$t>> {
                    let width = size_of::<$t>();
                    self.check_bounds(offset, Self::span(count, width)?)?;
                    (0..count).map(|i| self.io.get::<$t>(offset + i * width)).collect()
                }

                /// Writes element by element; on failure the elements already
                /// written stay written.
                pub fn $put_array(&self, offset: usize, values: &[$t]) -> Result<()> {
                    let width = size_of::<$t>();
                    for (i, v) in values.iter().enumerate() {
                        self.$put(offset + i * width, *v)?;
                    }
                    Ok(())
                }

                pub fn $read_array(&self, count: usize) -> Result<Vec<$t>> {
                    self.$get_array(0, count)
                }

                pub fn $write_array(&self, values: &[$t]) -> Result<()> {
                    self.$put_array(0, values)
                }
            )*
        }
    };
}

primitive_accessors! {
    i8 => get_int8, put_int8, read_int8, write_int8,
        get_array_of_int8, put_array_of_int8, read_array_of_int8, write_array_of_int8;
    u8 => get_uint8, put_uint8, read_uint8, write_uint8,
        get_array_of_uint8, put_array_of_uint8, read_array_of_uint8, write_array_of_uint8;
    i16 => get_int16, put_int16, read_int16, write_int16,
        get_array_of_int16, put_array_of_int16, read_array_of_int16, write_array_of_int16;
    u16 => get_uint16, put_uint16, read_uint16, write_uint16,
        get_array_of_uint16, put_array_of_uint16, read_array_of_uint16, write_array_of_uint16;
    i32 => get_int32, put_int32, read_int32, write_int32,
        get_array_of_int32, put_array_of_int32, read_array_of_int32, write_array_of_int32;
    u32 => get_uint32, put_uint32, read_uint32, write_uint32,
        get_array_of_uint32, put_array_of_uint32, read_array_of_uint32, write_array_of_uint32;
    i64 => get_int64, put_int64, read_int64, write_int64,
        get_array_of_int64, put_array_of_int64, read_array_of_int64, write_array_of_int64;
    u64 => get_uint64, put_uint64, read_uint64, write_uint64,
        get_array_of_uint64, put_array_of_uint64, read_array_of_uint64, write_array_of_uint64;
    f32 => get_float32, put_float32, read_float32, write_float32,
        get_array_of_float32, put_array_of_float32, read_array_of_float32, write_array_of_float32;
    f64 => get_float64, put_float64, read_float64, write_float64,
        get_array_of_float64, put_array_of_float64, read_array_of_float64, write_array_of_float64;
}

impl AbstractMemory {
    pub(crate) fn new(io: MemoryAccessor, size: usize, type_size: usize, platform: Platform) -> Self {
        Self {
            io,
            size,
            type_size: type_size.max(1),
            platform,
        }
    }

    fn span(count: usize, width: usize) -> Result<usize> {
        count
            .checked_mul(width)
            .ok_or_else(|| FfiError::InvalidArgument(format!("count {count} is too large")))
    }

    pub fn io(&self) -> &MemoryAccessor {
        &self.io
    }

    pub(crate) fn with_io(&self, io: MemoryAccessor) -> Self {
        Self {
            io,
            ..self.clone()
        }
    }

    pub(crate) fn invalidate(&mut self, io: MemoryAccessor) {
        self.io = io;
    }

    pub fn address(&self) -> usize {
        self.io.address()
    }

    pub fn is_null(&self) -> bool {
        self.io.is_null()
    }

    /// Declared extent in bytes; [`UNBOUNDED`] if unknown.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn total(&self) -> usize {
        self.size
    }

    pub fn is_bounded(&self) -> bool {
        self.size != UNBOUNDED
    }

    pub fn type_size(&self) -> usize {
        self.type_size
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn order(&self) -> ByteOrder {
        self.io.order()
    }

    pub fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(FfiError::out_of_bounds(offset, len, self.size)),
        }
    }

    /// A view of `[offset, offset + len)`. Without a length, a bounded
    /// facade keeps the remainder of its extent and an unbounded one stays
    /// unbounded.
    pub fn slice_memory(&self, offset: usize, len: Option<usize>) -> Result<AbstractMemory> {
        let size = match len {
            Some(len) => {
                self.check_bounds(offset, len)?;
                len
            }
            None if self.is_bounded() => {
                self.check_bounds(offset, 0)?;
                self.size - offset
            }
            None => UNBOUNDED,
        };
        Ok(Self {
            io: self.io.slice(offset),
            size,
            type_size: self.type_size,
            platform: self.platform,
        })
    }

    pub fn clear(&self) -> Result<()> {
        if !self.is_bounded() {
            return Err(FfiError::UnsupportedOperation(
                "cannot clear memory of unknown size".into(),
            ));
        }
        self.io.set_memory(0, self.size, 0)
    }

    pub fn get_long(&self, offset: usize) -> Result<i64> {
        match self.platform.long_size() {
            32 => self.get_int32(offset).map(i64::from),
            _ => self.get_int64(offset),
        }
    }

    pub fn put_long(&self, offset: usize, value: i64) -> Result<()> {
        match self.platform.long_size() {
            32 => self.put_int32(offset, value as i32),
            _ => self.put_int64(offset, value),
        }
    }

    pub fn get_ulong(&self, offset: usize) -> Result<u64> {
        match self.platform.long_size() {
            32 => self.get_uint32(offset).map(u64::from),
            _ => self.get_uint64(offset),
        }
    }

    pub fn put_ulong(&self, offset: usize, value: u64) -> Result<()> {
        match self.platform.long_size() {
            32 => self.put_uint32(offset, value as u32),
            _ => self.put_uint64(offset, value),
        }
    }

    pub fn read_long(&self) -> Result<i64> {
        self.get_long(0)
    }

    pub fn write_long(&self, value: i64) -> Result<()> {
        self.put_long(0, value)
    }

    pub fn get_array_of_long(&self, offset: usize, count: usize) -> Result<Vec<i64>> {
        let width = self.platform.long_bytes();
        self.check_bounds(offset, Self::span(count, width)?)?;
        (0..count).map(|i| self.get_long(offset + i * width)).collect()
    }

    pub fn put_array_of_long(&self, offset: usize, values: &[i64]) -> Result<()> {
        let width = self.platform.long_bytes();
        for (i, v) in values.iter().enumerate() {
            self.put_long(offset + i * width, *v)?;
        }
        Ok(())
    }

    pub fn get_address(&self, offset: usize) -> Result<usize> {
        self.check_bounds(offset, size_of::<usize>())?;
        self.io.get_address(offset)
    }

    pub fn put_address(&self, offset: usize, address: usize) -> Result<()> {
        self.check_bounds(offset, size_of::<usize>())?;
        self.io.put_address(offset, address)
    }

    /// Reads the address stored at `offset` as an unbounded pointer.
    pub fn get_pointer(&self, offset: usize) -> Result<Pointer> {
        self.check_bounds(offset, size_of::<usize>())?;
        let io = self.io.get_memory_io(offset)?;
        Ok(Pointer(AbstractMemory::new(io, UNBOUNDED, 1, self.platform)))
    }

    pub fn put_pointer(&self, offset: usize, target: &Pointer) -> Result<()> {
        self.check_bounds(offset, size_of::<usize>())?;
        self.io.put_memory_io(offset, target.io())
    }

    /// Stores anything that denotes an address: a pointer, a struct backed by
    /// native memory, a function, an array view, an integer or nil.
    pub fn put_pointer_value(&self, offset: usize, value: &Value) -> Result<()> {
        let io = pointer_accessor(value)?;
        self.check_bounds(offset, size_of::<usize>())?;
        self.io.put_memory_io(offset, &io)
    }

    pub fn read_pointer(&self) -> Result<Pointer> {
        self.get_pointer(0)
    }

    pub fn write_pointer(&self, target: &Pointer) -> Result<()> {
        self.put_pointer(0, target)
    }

    pub fn get_array_of_pointer(&self, offset: usize, count: usize) -> Result<Vec<Pointer>> {
        let width = size_of::<usize>();
        self.check_bounds(offset, Self::span(count, width)?)?;
        (0..count).map(|i| self.get_pointer(offset + i * width)).collect()
    }

    pub fn put_array_of_pointer(&self, offset: usize, values: &[Pointer]) -> Result<()> {
        let width = size_of::<usize>();
        for (i, p) in values.iter().enumerate() {
            self.put_pointer(offset + i * width, p)?;
        }
        Ok(())
    }

    pub fn put_callback(&self, offset: usize, function: &Function) -> Result<()> {
        self.put_address(offset, function.address())
    }

    fn string_limit(&self, offset: usize) -> Result<usize> {
        self.check_bounds(offset, 0)?;
        Ok(if self.is_bounded() {
            self.size - offset
        } else {
            UNBOUNDED - offset
        })
    }

    /// NUL-terminated bytes at `offset`, never scanning past the extent.
    pub fn get_string(&self, offset: usize) -> Result<Vec<u8>> {
        let limit = self.string_limit(offset)?;
        self.io.get_zero_terminated(offset, limit)
    }

    pub fn get_string_limited(&self, offset: usize, max_len: usize) -> Result<Vec<u8>> {
        let limit = self.string_limit(offset)?.min(max_len);
        self.io.get_zero_terminated(offset, limit)
    }

    /// Writes `bytes` followed by a NUL terminator.
    pub fn put_string(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_bounds(offset, bytes.len() + 1)?;
        self.io.put_zero_terminated(offset, bytes)
    }

    pub fn read_string(&self) -> Result<Vec<u8>> {
        self.get_string(0)
    }

    /// Writes `bytes` at offset 0 without a terminator.
    pub fn write_string(&self, bytes: &[u8]) -> Result<()> {
        self.put_bytes(0, bytes)
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, len)?;
        let mut buf = vec![0u8; len];
        self.io.get_bytes(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn put_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_bounds(offset, bytes.len())?;
        self.io.put_bytes(offset, bytes)
    }

    /// Writes `len` bytes of `src` starting at `index`.
    pub fn put_bytes_range(&self, offset: usize, src: &[u8], index: usize, len: usize) -> Result<()> {
        if index > src.len() {
            return Err(FfiError::InvalidArgument("invalid string index".into()));
        }
        if len > src.len() - index {
            return Err(FfiError::InvalidArgument("invalid length".into()));
        }
        self.put_bytes(offset, &src[index..index + len])
    }

    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        self.get_bytes(0, len)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.put_bytes(0, bytes)
    }

    /// Reads an array of C string pointers. With a count, NULL entries come
    /// back as `None`; without one, reading stops at the first NULL.
    pub fn get_array_of_string(&self, offset: usize, count: Option<usize>) -> Result<Vec<Option<Vec<u8>>>> {
        let width = size_of::<usize>();
        let mut out = Vec::new();
        let mut i = 0;
        loop {
            if count.is_some_and(|n| i >= n) {
                break;
            }
            let entry = self.get_pointer(offset + i * width)?;
            if entry.is_null() {
                if count.is_none() {
                    break;
                }
                out.push(None);
            } else {
                out.push(Some(entry.get_string(0)?));
            }
            i += 1;
        }
        Ok(out)
    }

    /// The op for `ty` in this facade's byte order. Addresses cannot be moved
    /// through a byte-swapped view.
    fn typed_op(&self, ty: &Type) -> Result<MemoryOp> {
        let op = MemoryOp::for_type(ty, self.order(), &self.platform)?;
        if !self.order().is_native() && op.carries_address() {
            return Err(FfiError::AccessViolation(SWAPPED_ADDRESS_ACCESS));
        }
        Ok(op)
    }

    /// Type-driven read of one value of `ty` at `offset`.
    pub fn get(&self, ty: &Type, offset: usize) -> Result<Value> {
        self.typed_op(ty)?.get(&native_view(self), offset)
    }

    pub fn put(&self, ty: &Type, offset: usize, value: &Value) -> Result<()> {
        self.typed_op(ty)?.put(&native_view(self), offset, value)
    }

    pub fn read_array_of_type(&self, ty: &Type, count: usize) -> Result<Vec<Value>> {
        let op = self.typed_op(ty)?;
        let view = native_view(self);
        let stride = ty.size();
        self.check_bounds(0, Self::span(count, stride)?)?;
        (0..count).map(|i| op.get(&view, i * stride)).collect()
    }

    pub fn write_array_of_type(&self, ty: &Type, values: &[Value]) -> Result<()> {
        let op = self.typed_op(ty)?;
        let view = native_view(self);
        let stride = ty.size();
        for (i, v) in values.iter().enumerate() {
            op.put(&view, i * stride, v)?;
        }
        Ok(())
    }
}

/// Type-driven ops already encode the facade's byte order, so they run
/// against a native-order view of the same memory.
fn native_view(memory: &AbstractMemory) -> AbstractMemory {
    memory.with_io(memory.io.with_order(ByteOrder::native()))
}

/// Resolves a value used as a pointer to the accessor whose address gets stored.
pub(crate) fn pointer_accessor(value: &Value) -> Result<MemoryAccessor> {
    match value {
        Value::Nil => Ok(MemoryAccessor::wrap(0)),
        Value::Pointer(p) => Ok(p.io().clone()),
        Value::Struct(s) => {
            let io = s.memory().io();
            if !io.is_direct() {
                return Err(FfiError::InvalidArgument(
                    "Struct memory not backed by a native pointer".into(),
                ));
            }
            Ok(io.clone())
        }
        Value::Function(f) => Ok(MemoryAccessor::wrap(f.address())),
        Value::Array(a) => Ok(a.to_ptr()?.io().clone()),
        Value::Int(_) | Value::UInt(_) => Ok(MemoryAccessor::wrap(value.to_u64()? as usize)),
        _ => Err(FfiError::InvalidArgument("Invalid pointer value".into())),
    }
}

/// Conversion to a plain pointer facade over the same memory.
pub trait ToPointer {
    fn to_ptr(&self) -> Result<Pointer>;
}

/// A possibly unowned, possibly unbounded view of native memory.
#[derive(Clone)]
pub struct Pointer(AbstractMemory);

impl Pointer {
    pub fn new(address: usize, platform: Platform) -> Self {
        Self(AbstractMemory::new(
            MemoryAccessor::wrap(address),
            UNBOUNDED,
            1,
            platform,
        ))
    }

    pub fn null(platform: Platform) -> Self {
        Self::new(0, platform)
    }

    pub fn from_memory(memory: AbstractMemory) -> Self {
        Self(memory)
    }

    pub fn memory(&self) -> &AbstractMemory {
        &self.0
    }

    pub(crate) fn memory_mut(&mut self) -> &mut AbstractMemory {
        &mut self.0
    }

    pub fn with_type_size(mut self, type_size: usize) -> Self {
        self.0.type_size = type_size.max(1);
        self
    }

    pub fn slice(&self, offset: usize, len: Option<usize>) -> Result<Pointer> {
        self.0.slice_memory(offset, len).map(Pointer)
    }

    /// Address arithmetic: the pointer `delta` bytes further on.
    pub fn offset_by(&self, delta: usize) -> Result<Pointer> {
        self.slice(delta, None)
    }

    /// The `index`th element, `type_size` bytes apart.
    pub fn element(&self, index: usize) -> Result<Pointer> {
        let offset = index.checked_mul(self.type_size()).unwrap_or(UNBOUNDED);
        if offset >= self.size() {
            return Err(FfiError::IndexOutOfBounds(format!(
                "Index {index} out of range"
            )));
        }
        self.slice(offset, Some(self.type_size().min(self.size() - offset)))
    }

    pub fn with_order(&self, order: ByteOrder) -> Pointer {
        if order == self.order() {
            return self.clone();
        }
        Pointer(self.0.with_io(self.0.io.with_order(order)))
    }
}

impl Deref for Pointer {
    type Target = AbstractMemory;

    fn deref(&self) -> &AbstractMemory {
        &self.0
    }
}

impl ToPointer for Pointer {
    fn to_ptr(&self) -> Result<Pointer> {
        Ok(self.clone())
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Pointer");
        d.field("address", &Address(self.address()));
        if self.is_bounded() {
            d.field("size", &self.size());
        }
        d.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryPointer, Runtime};

    #[test]
    fn test_bounds_checked_before_access() {
        let rt = Runtime::new();
        let mem = MemoryPointer::new(&rt, 1, 4, true).unwrap();
        assert!(mem.put_int32(0, 7).is_ok());
        assert!(matches!(mem.get_int32(1), Err(FfiError::IndexOutOfBounds(_))));
        assert!(matches!(
            mem.get_int8(usize::MAX),
            Err(FfiError::IndexOutOfBounds(_))
        ));
    }

    #[test]
    fn test_signedness_is_a_read_concern() {
        let rt = Runtime::new();
        let mem = MemoryPointer::new(&rt, 1, 1, true).unwrap();
        mem.put_int8(0, -1).unwrap();
        assert_eq!(mem.get_uint8(0).unwrap(), 255);
    }

    #[test]
    fn test_put_bytes_range_validation() {
        let rt = Runtime::new();
        let mem = MemoryPointer::new(&rt, 1, 8, true).unwrap();
        assert!(matches!(
            mem.put_bytes_range(0, b"abc", 4, 0),
            Err(FfiError::InvalidArgument(m)) if m == "invalid string index"
        ));
        assert!(matches!(
            mem.put_bytes_range(0, b"abc", 1, 3),
            Err(FfiError::InvalidArgument(m)) if m == "invalid length"
        ));
        mem.put_bytes_range(0, b"abc", 1, 2).unwrap();
        assert_eq!(mem.get_bytes(0, 2).unwrap(), b"bc");
    }

    #[test]
    fn test_string_scan_stops_at_extent() {
        let rt = Runtime::new();
        let mem = MemoryPointer::new(&rt, 1, 4, true).unwrap();
        mem.put_bytes(0, b"abcd").unwrap();
        assert_eq!(mem.get_string(0).unwrap(), b"abcd");
        assert_eq!(mem.get_string_limited(1, 2).unwrap(), b"bc");
        assert!(mem.put_string(0, b"abcd").is_err());
    }

    #[test]
    fn test_element_indexing() {
        let rt = Runtime::new();
        let mem = MemoryPointer::new(&rt, 4, 3, true).unwrap();
        mem.put_array_of_int32(0, &[10, 20, 30]).unwrap();
        assert_eq!(mem.element(2).unwrap().read_int32().unwrap(), 30);
        assert!(matches!(
            mem.element(3),
            Err(FfiError::IndexOutOfBounds(m)) if m == "Index 3 out of range"
        ));
    }

    #[test]
    fn test_array_of_string_stops_at_null() {
        let rt = Runtime::new();
        let a = MemoryPointer::from_string(&rt, b"one").unwrap();
        let b = MemoryPointer::from_string(&rt, b"two").unwrap();
        let table = MemoryPointer::new(&rt, size_of::<usize>(), 3, true).unwrap();
        table
            .put_array_of_pointer(0, &[a.to_ptr().unwrap(), b.to_ptr().unwrap()])
            .unwrap();
        let all = table.get_array_of_string(0, None).unwrap();
        assert_eq!(all, vec![Some(b"one".to_vec()), Some(b"two".to_vec())]);
        let counted = table.get_array_of_string(0, Some(3)).unwrap();
        assert_eq!(counted[2], None);
    }

    #[test]
    fn test_pointer_value_coercions() {
        let rt = Runtime::new();
        let slot = MemoryPointer::new(&rt, size_of::<usize>(), 1, true).unwrap();
        slot.put_pointer_value(0, &Value::UInt(0x1000)).unwrap();
        assert_eq!(slot.get_address(0).unwrap(), 0x1000);
        slot.put_pointer_value(0, &Value::Nil).unwrap();
        assert!(slot.read_pointer().unwrap().is_null());
        assert!(matches!(
            slot.put_pointer_value(0, &Value::Float(1.0)),
            Err(FfiError::InvalidArgument(m)) if m == "Invalid pointer value"
        ));
    }

    #[test]
    fn test_type_driven_access() {
        let rt = Runtime::new();
        let mem = MemoryPointer::new(&rt, 2, 3, true).unwrap();
        let short = rt.resolve("int16").unwrap();
        mem.write_array_of_type(&short, &[Value::Int(1), Value::Int(2), Value::Int(-3)])
            .unwrap();
        assert_eq!(
            mem.read_array_of_type(&short, 3).unwrap(),
            vec![Value::Int(1), Value::Int(2), Value::Int(-3)]
        );
        let big = mem.with_order(ByteOrder::Big);
        big.put(&short, 0, &Value::Int(0x0102)).unwrap();
        assert_eq!(mem.get_bytes(0, 2).unwrap(), [1, 2]);
        assert_eq!(big.get(&short, 0).unwrap(), Value::Int(0x0102));
    }

    #[test]
    fn test_typed_addresses_rejected_when_swapped() {
        let rt = Runtime::new();
        let mem = MemoryPointer::new(&rt, size_of::<usize>(), 2, true).unwrap();
        let pointer = rt.resolve("pointer").unwrap();
        let swapped = mem.with_order(ByteOrder::native().opposite());
        assert!(matches!(
            swapped.put(&pointer, 0, &Value::UInt(0x1000)),
            Err(FfiError::AccessViolation(_))
        ));
        assert!(matches!(swapped.get(&pointer, 0), Err(FfiError::AccessViolation(_))));
        assert!(matches!(
            swapped.read_array_of_type(&pointer, 2),
            Err(FfiError::AccessViolation(_))
        ));
        assert_eq!(mem.get_address(0).unwrap(), 0);
        mem.put(&pointer, 0, &Value::UInt(0x1000)).unwrap();
        assert_eq!(mem.get_address(0).unwrap(), 0x1000);
    }
}

use super::{Field, StructLayout};
use crate::{
    error::{FfiError, Result},
    platform::ByteOrder,
    types::{NativeLayout, TypeSpec},
    utils::{align_up, ByteOffset},
    Runtime,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Lays out fields the way a C compiler would: each field at the next offset
/// aligned to its type (capped by any packing), the total size rounded up to
/// the largest alignment. Unions place every field at offset 0.
pub struct StructLayoutBuilder<'r> {
    runtime: &'r Runtime,
    fields: Vec<Field>,
    size: usize,
    alignment: usize,
    union: bool,
    packed: Option<usize>,
    order: ByteOrder,
}

impl<'r> StructLayoutBuilder<'r> {
    pub fn new(runtime: &'r Runtime) -> Self {
        Self {
            runtime,
            fields: Vec::new(),
            size: 0,
            alignment: 1,
            union: false,
            packed: None,
            order: ByteOrder::native(),
        }
    }

    pub fn union(runtime: &'r Runtime) -> Self {
        Self {
            union: true,
            ..Self::new(runtime)
        }
    }

    /// Caps every field's alignment at `packing` bytes.
    pub fn packed(&mut self, packing: usize) -> Result<&mut Self> {
        if packing == 0 || !packing.is_power_of_two() {
            return Err(FfiError::InvalidArgument(format!(
                "invalid packing {packing}"
            )));
        }
        self.packed = Some(packing);
        Ok(self)
    }

    /// Byte order for numeric fields added from now on.
    pub fn order(&mut self, order: ByteOrder) -> &mut Self {
        self.order = order;
        self
    }

    /// Adds a field at the next naturally aligned offset.
    pub fn add(&mut self, name: &str, ty: impl Into<TypeSpec>) -> Result<&mut Self> {
        self.push(name, ty, None)
    }

    /// Adds a field at an explicit offset.
    pub fn add_at(&mut self, name: &str, ty: impl Into<TypeSpec>, offset: usize) -> Result<&mut Self> {
        self.push(name, ty, Some(offset))
    }

    fn push(&mut self, name: &str, ty: impl Into<TypeSpec>, offset: Option<usize>) -> Result<&mut Self> {
        let ty = self.runtime.resolve(ty)?;
        let align = match self.packed {
            Some(p) => ty.alignment().min(p),
            None => ty.alignment(),
        }
        .max(1);
        let offset = match offset {
            Some(o) => o,
            None if self.union => 0,
            None => align_up(self.size, align),
        };
        let size = ty.size();
        let end = offset.checked_add(size).ok_or_else(|| {
            FfiError::InvalidArgument(format!("field {name} at offset {offset} overflows"))
        })?;
        trace!("field {name}: {} at {:?}", ty.describe(), ByteOffset(offset));

        let field = Field::with_order(
            self.runtime.symbol(name),
            ty,
            offset,
            self.order,
            self.runtime.platform(),
        )?;
        self.fields.push(field);
        self.alignment = self.alignment.max(align);
        self.size = self.size.max(end);
        Ok(self)
    }

    pub fn build(&self) -> Result<Arc<StructLayout>> {
        let size = align_up(self.size, self.alignment);
        debug!(
            "struct layout: {} fields, size {size}, alignment {}",
            self.fields.len(),
            self.alignment
        );
        StructLayout::new(self.fields.clone(), size, self.alignment).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_alignment() {
        let rt = Runtime::new();
        let mut b = StructLayoutBuilder::new(&rt);
        b.add("c", "char").unwrap().add("d", "double").unwrap().add("s", "short").unwrap();
        let layout = b.build().unwrap();
        assert_eq!(layout.offset_of("d").unwrap(), 8);
        assert_eq!(layout.offset_of("s").unwrap(), 16);
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.alignment(), 8);
    }

    #[test]
    fn test_packed_layout() {
        let rt = Runtime::new();
        let mut b = StructLayoutBuilder::new(&rt);
        b.packed(1).unwrap().add("c", "char").unwrap().add("i", "int32").unwrap();
        let layout = b.build().unwrap();
        assert_eq!(layout.offset_of("i").unwrap(), 1);
        assert_eq!(layout.size(), 5);
        assert!(StructLayoutBuilder::new(&rt).packed(3).is_err());
    }

    #[test]
    fn test_union_layout() {
        let rt = Runtime::new();
        let mut b = StructLayoutBuilder::union(&rt);
        b.add("i", "int32").unwrap().add("d", "double").unwrap().add("b", "uint8").unwrap();
        let layout = b.build().unwrap();
        assert!(layout.is_union());
        assert_eq!(layout.size(), 8);
        assert!(layout.fields().all(|f| f.offset() == 0));
    }

    #[test]
    fn test_explicit_offsets() {
        let rt = Runtime::new();
        let mut b = StructLayoutBuilder::new(&rt);
        b.add_at("hi", "uint16", 2).unwrap().add_at("lo", "uint16", 0).unwrap();
        let layout = b.build().unwrap();
        assert_eq!(layout.size(), 4);
        assert_eq!(layout.offset_of("hi").unwrap(), 2);
    }

    #[test]
    fn test_offset_overflow_rejected() {
        let rt = Runtime::new();
        let mut b = StructLayoutBuilder::new(&rt);
        assert!(matches!(
            b.add_at("x", "int32", usize::MAX - 1),
            Err(FfiError::InvalidArgument(_))
        ));
        b.add("y", "int8").unwrap();
        assert_eq!(b.build().unwrap().size(), 1);
    }

    #[test]
    fn test_order_applies_to_later_fields() {
        let rt = Runtime::new();
        let mut b = StructLayoutBuilder::new(&rt);
        b.add("host", "uint16")
            .unwrap()
            .order(ByteOrder::Big)
            .add("wire", "uint16")
            .unwrap();
        let layout = b.build().unwrap();
        let mem = crate::memory::MemoryPointer::new(&rt, layout.size(), 1, true).unwrap();
        layout.put(&mem, "wire", &crate::Value::Int(0x0102)).unwrap();
        assert_eq!(mem.get_bytes(2, 2).unwrap(), [1, 2]);
    }

    #[test]
    fn test_unknown_type_name() {
        let rt = Runtime::new();
        assert!(StructLayoutBuilder::new(&rt).add("x", "widget").is_err());
    }
}

use crate::{
    error::{FfiError, Result},
    memory::AbstractMemory,
    platform::{ByteOrder, Platform},
    types::{NativeLayout, Symbol, Type},
    utils::round_up_to_power_of_two,
    value::Value,
};
use libffi::middle;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::trace;

mod array;
mod builder;
mod field_io;
mod instance;

pub use array::{ArrayProxy, ComponentOp};
pub use builder::StructLayoutBuilder;
pub use field_io::{FieldIo, NullStorage, Storage};
pub use instance::Struct;

/// A named, typed slot at a fixed offset inside a struct.
#[derive(Clone, Debug)]
pub struct Field {
    name: Symbol,
    ty: Type,
    offset: usize,
    io: FieldIo,
}

impl Field {
    pub fn new(name: Symbol, ty: Type, offset: usize, platform: &Platform) -> Result<Self> {
        Self::with_order(name, ty, offset, ByteOrder::native(), platform)
    }

    /// A field whose numeric value is stored in `order`.
    pub fn with_order(
        name: Symbol,
        ty: Type,
        offset: usize,
        order: ByteOrder,
        platform: &Platform,
    ) -> Result<Self> {
        let io = FieldIo::for_type(&ty, order, platform)?;
        Ok(Self {
            name,
            ty,
            offset,
            io,
        })
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }

    pub fn alignment(&self) -> usize {
        self.ty.alignment()
    }

    pub fn io(&self) -> &FieldIo {
        &self.io
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.offset == other.offset && self.ty == other.ty
    }
}

/// A field bound to its slots in the per-instance caches of one layout.
#[derive(Clone, Debug)]
pub struct Member {
    field: Field,
    index: usize,
    cache_index: Option<usize>,
    reference_index: Option<usize>,
}

impl Member {
    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn name(&self) -> &Symbol {
        &self.field.name
    }

    pub fn offset(&self) -> usize {
        self.field.offset
    }

    pub fn ty(&self) -> &Type {
        &self.field.ty
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cache_index(&self) -> Option<usize> {
        self.cache_index
    }

    pub fn reference_index(&self) -> Option<usize> {
        self.reference_index
    }

    pub fn get(&self, storage: &dyn Storage, memory: &AbstractMemory) -> Result<Value> {
        self.field.io.get(storage, self, memory)
    }

    pub fn put(&self, storage: &dyn Storage, memory: &AbstractMemory, value: &Value) -> Result<()> {
        self.field.io.put(storage, self, memory, value)
    }
}

/// How a caller names a field: an interned symbol, or plain text.
#[derive(Clone, Copy, Debug)]
pub enum FieldKey<'a> {
    Symbol(&'a Symbol),
    Name(&'a str),
}

impl<'a> From<&'a Symbol> for FieldKey<'a> {
    fn from(s: &'a Symbol) -> Self {
        FieldKey::Symbol(s)
    }
}
impl<'a> From<&'a str> for FieldKey<'a> {
    fn from(s: &'a str) -> Self {
        FieldKey::Name(s)
    }
}
impl<'a> From<&'a String> for FieldKey<'a> {
    fn from(s: &'a String) -> Self {
        FieldKey::Name(s)
    }
}

impl fmt::Display for FieldKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKey::Symbol(s) => f.write_str(s.as_str()),
            FieldKey::Name(s) => f.write_str(s),
        }
    }
}

/// The immutable description of a native struct: its members in declaration
/// order, total size and alignment, and how many cache and reference slots
/// every instance needs.
pub struct StructLayout {
    members: Vec<Member>,
    size: usize,
    alignment: usize,
    union: bool,
    cache_count: usize,
    reference_count: usize,
    identity_table: Box<[Option<u32>]>,
    names: HashMap<Arc<str>, usize>,
}

impl StructLayout {
    pub fn new(fields: Vec<Field>, size: usize, alignment: usize) -> Result<Self> {
        let table_len = round_up_to_power_of_two(fields.len() * 8);
        let mut identity_table = vec![None; table_len].into_boxed_slice();
        let mut names = HashMap::with_capacity(fields.len());
        let mut members = Vec::with_capacity(fields.len());
        let mut cache_count = 0;
        let mut reference_count = 0;
        let mut max_offset = 0;
        let field_count = fields.len();

        for (index, field) in fields.into_iter().enumerate() {
            if names.contains_key(field.name.as_str()) {
                return Err(FfiError::type_mismatch(
                    "unique field name",
                    format!("duplicate field {}", field.name),
                ));
            }
            if field.size() == 0 && index + 1 != field_count {
                return Err(FfiError::type_mismatch(
                    "sized field",
                    format!("sizeof field {} == 0", field.name),
                ));
            }

            let cache_index = field.io.is_cacheable().then(|| {
                cache_count += 1;
                cache_count - 1
            });
            let reference_index = field.io.is_reference_needed().then(|| {
                reference_count += 1;
                reference_count - 1
            });

            let mask = table_len - 1;
            let mut slot = field.name.id().hash_code() & mask;
            while identity_table[slot].is_some() {
                slot = (slot + 1) & mask;
            }
            identity_table[slot] = Some(index as u32);
            names.insert(field.name.text(), index);
            max_offset = max_offset.max(field.offset);

            trace!(
                "member {} @ {} (cache {:?}, reference {:?})",
                field.name,
                field.offset,
                cache_index,
                reference_index
            );
            members.push(Member {
                field,
                index,
                cache_index,
                reference_index,
            });
        }

        Ok(Self {
            union: max_offset == 0 && members.len() > 1,
            members,
            size,
            alignment,
            cache_count,
            reference_count,
            identity_table,
            names,
        })
    }

    fn lookup_symbol(&self, sym: &Symbol) -> Option<usize> {
        let mask = self.identity_table.len() - 1;
        let mut slot = sym.id().hash_code() & mask;
        while let Some(index) = self.identity_table[slot] {
            let index = index as usize;
            if self.members[index].name() == sym {
                return Some(index);
            }
            slot = (slot + 1) & mask;
        }
        None
    }

    pub fn member<'k>(&self, key: impl Into<FieldKey<'k>>) -> Result<&Member> {
        let key = key.into();
        let found = match key {
            FieldKey::Symbol(sym) => self
                .lookup_symbol(sym)
                .or_else(|| self.names.get(sym.as_str()).copied()),
            FieldKey::Name(name) => self.names.get(name).copied(),
        };
        found
            .map(|i| &self.members[i])
            .ok_or_else(|| FfiError::InvalidArgument(format!("Unknown field: {key}")))
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.members.iter().map(Member::field)
    }

    pub fn field<'k>(&self, key: impl Into<FieldKey<'k>>) -> Result<&Field> {
        self.member(key).map(Member::field)
    }

    pub fn field_names(&self) -> Vec<Symbol> {
        self.members.iter().map(|m| m.name().clone()).collect()
    }

    pub fn offsets(&self) -> Vec<(Symbol, usize)> {
        self.members
            .iter()
            .map(|m| (m.name().clone(), m.offset()))
            .collect()
    }

    pub fn offset_of<'k>(&self, key: impl Into<FieldKey<'k>>) -> Result<usize> {
        self.member(key).map(Member::offset)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_union(&self) -> bool {
        self.union
    }

    pub fn cache_count(&self) -> usize {
        self.cache_count
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    /// Reads a field straight from memory, without any instance caches.
    pub fn get<'k>(&self, memory: &AbstractMemory, key: impl Into<FieldKey<'k>>) -> Result<Value> {
        self.member(key)?.get(&NullStorage, memory)
    }

    /// Writes a field straight to memory. Fields whose writes must keep an
    /// object alive (strings, pointers, callbacks, struct references) need a
    /// [`Struct`] instance to own it and are refused here.
    pub fn put<'k>(
        &self,
        memory: &AbstractMemory,
        key: impl Into<FieldKey<'k>>,
        value: &Value,
    ) -> Result<()> {
        let member = self.member(key)?;
        if member.field().io().is_reference_needed() {
            return Err(FfiError::UnsupportedOperation(format!(
                "field {} can only be set through a struct instance",
                member.name()
            )));
        }
        member.put(&NullStorage, memory, value)
    }

    /// The libffi description of this struct passed by value. Unions are
    /// described as enough alignment-sized scalars to cover their size.
    pub fn ffi_type(&self) -> Result<middle::Type> {
        if self.size == 0 {
            return Err(FfiError::NotImplemented(
                "zero-sized struct has no ffi representation".into(),
            ));
        }
        if self.union {
            let (scalar, width) = match self.alignment {
                1 => (middle::Type::u8(), 1),
                2 => (middle::Type::u16(), 2),
                4 => (middle::Type::u32(), 4),
                _ => (middle::Type::u64(), 8),
            };
            let count = self.size.div_ceil(width);
            return Ok(middle::Type::structure(std::iter::repeat(scalar).take(count)));
        }
        let fields = self
            .fields()
            .map(|f| f.ty().ffi_type())
            .collect::<Result<Vec<_>>>()?;
        Ok(middle::Type::structure(fields))
    }
}

impl PartialEq for StructLayout {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self.alignment == other.alignment
            && self.members.len() == other.members.len()
            && self
                .members
                .iter()
                .zip(&other.members)
                .all(|(a, b)| a.field == b.field)
    }
}

impl fmt::Debug for StructLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructLayout")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("union", &self.union)
            .field("fields", &self.offsets())
            .finish()
    }
}

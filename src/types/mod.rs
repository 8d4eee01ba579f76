use crate::{
    error::{FfiError, Result, TypeResolutionError},
    layout::StructLayout,
    platform::Platform,
    value::Value,
};
use enum_dispatch::enum_dispatch;
use libffi::middle::{self, Cif};
use std::{collections::HashMap, fmt, mem::size_of, sync::Arc};

pub mod resolver;
pub mod symbol;

pub use resolver::{TypeResolver, TypeSpec};
pub use symbol::{Symbol, SymbolTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeType {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Long,
    ULong,
    Float32,
    Float64,
    LongDouble,
    Pointer,
    String,
    Struct,
    Array,
    Function,
    Mapped,
}

impl NativeType {
    pub fn name(self) -> &'static str {
        match self {
            NativeType::Void => "void",
            NativeType::Bool => "bool",
            NativeType::Int8 => "int8",
            NativeType::UInt8 => "uint8",
            NativeType::Int16 => "int16",
            NativeType::UInt16 => "uint16",
            NativeType::Int32 => "int32",
            NativeType::UInt32 => "uint32",
            NativeType::Int64 => "int64",
            NativeType::UInt64 => "uint64",
            NativeType::Long => "long",
            NativeType::ULong => "ulong",
            NativeType::Float32 => "float32",
            NativeType::Float64 => "float64",
            NativeType::LongDouble => "long_double",
            NativeType::Pointer => "pointer",
            NativeType::String => "string",
            NativeType::Struct => "struct",
            NativeType::Array => "array",
            NativeType::Function => "function",
            NativeType::Mapped => "mapped",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            NativeType::Int8
                | NativeType::UInt8
                | NativeType::Int16
                | NativeType::UInt16
                | NativeType::Int32
                | NativeType::UInt32
                | NativeType::Int64
                | NativeType::UInt64
                | NativeType::Long
                | NativeType::ULong
        )
    }

    /// Kinds whose values are plain numbers and never need a retained object.
    pub fn is_scalar(self) -> bool {
        self.is_integer()
            || matches!(
                self,
                NativeType::Bool | NativeType::Float32 | NativeType::Float64 | NativeType::LongDouble
            )
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[enum_dispatch]
pub trait NativeLayout {
    fn native_type(&self) -> NativeType;
    fn size(&self) -> usize;
    fn alignment(&self) -> usize;
}

/// A native type descriptor: primitives, fixed arrays, callbacks, structs
/// embedded by value or by reference, converter-backed mapped types and enums.
#[enum_dispatch(NativeLayout)]
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Builtin,
    ArrayType,
    CallbackInfo,
    MappedType,
    StructByValue,
    StructByReference,
    EnumType,
}

impl Type {
    pub fn builtin(native_type: NativeType, platform: &Platform) -> Result<Self> {
        Ok(Builtin::new(native_type, platform)?.into())
    }

    /// Short human readable description used in error messages and dumps.
    pub fn describe(&self) -> String {
        match self {
            Type::Builtin(b) => b.native_type.name().to_string(),
            Type::ArrayType(a) => format!("{}[{}]", a.component.describe(), a.length),
            Type::CallbackInfo(c) => {
                let params: Vec<_> = c.parameter_types.iter().map(Type::describe).collect();
                format!("callback({}) -> {}", params.join(", "), c.return_type.describe())
            }
            Type::MappedType(m) => format!("mapped({})", m.real.describe()),
            Type::StructByValue(s) => format!("struct[{} bytes]", s.layout.size()),
            Type::StructByReference(s) => format!("struct*[{} bytes]", s.layout.size()),
            Type::EnumType(e) => match &e.0.name {
                Some(name) => format!("enum {name}"),
                None => "enum".to_string(),
            },
        }
    }

    pub fn ffi_type(&self) -> Result<middle::Type> {
        match self {
            Type::Builtin(b) => b.ffi_type(),
            Type::ArrayType(a) => {
                if a.length == 0 {
                    return Err(FfiError::NotImplemented(
                        "flexible array has no ffi representation".into(),
                    ));
                }
                let component = a.component.ffi_type()?;
                Ok(middle::Type::structure(
                    std::iter::repeat(component).take(a.length),
                ))
            }
            Type::CallbackInfo(_) | Type::StructByReference(_) => Ok(middle::Type::pointer()),
            Type::MappedType(m) => m.real.ffi_type(),
            Type::StructByValue(s) => s.layout.ffi_type(),
            Type::EnumType(e) => e.0.native.ffi_type(),
        }
    }

    pub fn as_struct_layout(&self) -> Option<&Arc<StructLayout>> {
        match self {
            Type::StructByValue(s) => Some(&s.layout),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Builtin {
    native_type: NativeType,
    size: usize,
    alignment: usize,
}

impl Builtin {
    pub fn new(native_type: NativeType, platform: &Platform) -> Result<Self> {
        use NativeType::*;
        let ptr = platform.pointer_bytes();
        let (size, alignment) = match native_type {
            Void => (0, 1),
            Bool | Int8 | UInt8 => (1, 1),
            Int16 | UInt16 => (2, 2),
            Int32 | UInt32 | Float32 => (4, 4),
            Int64 | UInt64 => (8, std::mem::align_of::<u64>()),
            Float64 => (8, std::mem::align_of::<f64>()),
            Long | ULong => (platform.long_bytes(), platform.long_bytes()),
            LongDouble if platform.address_size() == 64 => (16, 16),
            LongDouble => (12, 4),
            Pointer | String => (ptr, ptr),
            Struct | Array | Function | Mapped => {
                return Err(TypeResolutionError::InvalidType(format!(
                    "{native_type} is not a builtin type"
                ))
                .into())
            }
        };
        Ok(Self {
            native_type,
            size,
            alignment,
        })
    }

    pub fn ffi_type(&self) -> Result<middle::Type> {
        use NativeType::*;
        Ok(match self.native_type {
            Void => middle::Type::void(),
            Bool | UInt8 => middle::Type::u8(),
            Int8 => middle::Type::i8(),
            Int16 => middle::Type::i16(),
            UInt16 => middle::Type::u16(),
            Int32 => middle::Type::i32(),
            UInt32 => middle::Type::u32(),
            Int64 => middle::Type::i64(),
            UInt64 => middle::Type::u64(),
            Long if self.size == 4 => middle::Type::i32(),
            Long => middle::Type::i64(),
            ULong if self.size == 4 => middle::Type::u32(),
            ULong => middle::Type::u64(),
            Float32 => middle::Type::f32(),
            Float64 => middle::Type::f64(),
            Pointer | String => middle::Type::pointer(),
            LongDouble | Struct | Array | Function | Mapped => {
                return Err(FfiError::NotImplemented(format!(
                    "no ffi type for {}",
                    self.native_type
                )))
            }
        })
    }
}

impl NativeLayout for Builtin {
    fn native_type(&self) -> NativeType {
        self.native_type
    }
    fn size(&self) -> usize {
        self.size
    }
    fn alignment(&self) -> usize {
        self.alignment
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayType {
    component: Box<Type>,
    length: usize,
}

impl ArrayType {
    /// A `length` of zero declares a flexible trailing array.
    pub fn new(component: Type, length: usize) -> Self {
        Self {
            component: Box::new(component),
            length,
        }
    }

    pub fn component_type(&self) -> &Type {
        &self.component
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_char_array(&self) -> bool {
        matches!(
            self.component.native_type(),
            NativeType::Int8 | NativeType::UInt8
        ) && !matches!(*self.component, Type::EnumType(_) | Type::MappedType(_))
    }
}

impl NativeLayout for ArrayType {
    fn native_type(&self) -> NativeType {
        NativeType::Array
    }
    fn size(&self) -> usize {
        self.component.size() * self.length
    }
    fn alignment(&self) -> usize {
        self.component.alignment()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    #[default]
    Default,
    Stdcall,
}

impl CallingConvention {
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "default" | "cdecl" => Ok(CallingConvention::Default),
            "stdcall" => Ok(CallingConvention::Stdcall),
            other => Err(FfiError::InvalidArgument(format!(
                "unknown calling convention {other:?}"
            ))),
        }
    }
}

/// Signature of a native function or callback; values of this type are
/// pointer-sized.
#[derive(Clone, Debug, PartialEq)]
pub struct CallbackInfo {
    parameter_types: Vec<Type>,
    return_type: Box<Type>,
    convention: CallingConvention,
}

impl CallbackInfo {
    pub fn new(parameter_types: Vec<Type>, return_type: Type) -> Self {
        Self {
            parameter_types,
            return_type: Box::new(return_type),
            convention: CallingConvention::Default,
        }
    }

    pub fn with_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn parameter_types(&self) -> &[Type] {
        &self.parameter_types
    }

    pub fn return_type(&self) -> &Type {
        &self.return_type
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn cif(&self) -> Result<Cif> {
        let args = self
            .parameter_types
            .iter()
            .map(Type::ffi_type)
            .collect::<Result<Vec<_>>>()?;
        let ret = self.return_type.ffi_type()?;
        #[allow(unused_mut)]
        let mut cif = Cif::new(args, ret);
        #[cfg(all(windows, target_arch = "x86"))]
        if self.convention == CallingConvention::Stdcall {
            cif.set_abi(libffi::raw::ffi_abi_FFI_STDCALL);
        }
        Ok(cif)
    }
}

impl NativeLayout for CallbackInfo {
    fn native_type(&self) -> NativeType {
        NativeType::Function
    }
    fn size(&self) -> usize {
        size_of::<usize>()
    }
    fn alignment(&self) -> usize {
        std::mem::align_of::<usize>()
    }
}

/// User supplied conversion between a host value and a native representation.
pub trait DataConverter: Send + Sync + fmt::Debug {
    fn native_type(&self) -> Type;
    fn to_native(&self, value: &Value) -> Result<Value>;
    fn from_native(&self, value: Value) -> Result<Value>;
}

#[derive(Clone, Debug)]
pub struct MappedType {
    real: Box<Type>,
    converter: Arc<dyn DataConverter>,
    reference_required: bool,
}

impl MappedType {
    pub fn new(converter: Arc<dyn DataConverter>) -> Self {
        let real = converter.native_type();
        let reference_required = !real.native_type().is_scalar();
        Self {
            real: Box::new(real),
            converter,
            reference_required,
        }
    }

    pub fn with_reference_required(mut self, required: bool) -> Self {
        self.reference_required = required;
        self
    }

    pub fn real_type(&self) -> &Type {
        &self.real
    }

    pub fn converter(&self) -> &Arc<dyn DataConverter> {
        &self.converter
    }

    pub fn is_reference_required(&self) -> bool {
        self.reference_required
    }

    pub fn to_native(&self, value: &Value) -> Result<Value> {
        self.converter.to_native(value)
    }

    pub fn from_native(&self, value: Value) -> Result<Value> {
        self.converter.from_native(value)
    }
}

impl PartialEq for MappedType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.converter, &other.converter) && self.real == other.real
    }
}

impl NativeLayout for MappedType {
    fn native_type(&self) -> NativeType {
        NativeType::Mapped
    }
    fn size(&self) -> usize {
        self.real.size()
    }
    fn alignment(&self) -> usize {
        self.real.alignment()
    }
}

/// A struct embedded inline in its container.
#[derive(Clone, Debug)]
pub struct StructByValue {
    layout: Arc<StructLayout>,
}

impl StructByValue {
    pub fn new(layout: Arc<StructLayout>) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Arc<StructLayout> {
        &self.layout
    }
}

impl PartialEq for StructByValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.layout, &other.layout) || self.layout == other.layout
    }
}

impl NativeLayout for StructByValue {
    fn native_type(&self) -> NativeType {
        NativeType::Struct
    }
    fn size(&self) -> usize {
        self.layout.size()
    }
    fn alignment(&self) -> usize {
        self.layout.alignment()
    }
}

/// A pointer-sized slot referring to a struct stored elsewhere.
#[derive(Clone, Debug)]
pub struct StructByReference {
    layout: Arc<StructLayout>,
}

impl StructByReference {
    pub fn new(layout: Arc<StructLayout>) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Arc<StructLayout> {
        &self.layout
    }
}

impl PartialEq for StructByReference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.layout, &other.layout) || self.layout == other.layout
    }
}

impl NativeLayout for StructByReference {
    fn native_type(&self) -> NativeType {
        NativeType::Pointer
    }
    fn size(&self) -> usize {
        size_of::<usize>()
    }
    fn alignment(&self) -> usize {
        std::mem::align_of::<usize>()
    }
}

#[derive(Debug, PartialEq)]
struct EnumMapping {
    name: Option<String>,
    native: Builtin,
    values: HashMap<Symbol, i64>,
    symbols: HashMap<i64, Symbol>,
}

/// Symbolic names over an integer native type.
#[derive(Clone, Debug, PartialEq)]
pub struct EnumType(Arc<EnumMapping>);

impl EnumType {
    pub fn new(
        name: Option<String>,
        native: Builtin,
        entries: impl IntoIterator<Item = (Symbol, i64)>,
    ) -> Result<Self> {
        if !native.native_type().is_integer() {
            return Err(FfiError::type_mismatch(
                "integer native type",
                native.native_type().name(),
            ));
        }
        let mut values = HashMap::new();
        let mut symbols = HashMap::new();
        for (sym, value) in entries {
            symbols.entry(value).or_insert_with(|| sym.clone());
            values.insert(sym, value);
        }
        Ok(Self(Arc::new(EnumMapping {
            name,
            native,
            values,
            symbols,
        })))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn native(&self) -> Builtin {
        self.0.native
    }

    pub fn find(&self, symbol: &Symbol) -> Option<i64> {
        self.0.values.get(symbol).copied()
    }

    pub fn symbol_for(&self, value: i64) -> Option<&Symbol> {
        self.0.symbols.get(&value)
    }

    pub fn to_native(&self, value: &Value) -> Result<i64> {
        match value {
            Value::Symbol(sym) => self.find(sym).ok_or_else(|| {
                FfiError::InvalidArgument(format!("invalid enum value, {sym:?}"))
            }),
            other => other.to_i64(),
        }
    }

    /// Unknown integers come back unchanged.
    pub fn from_native(&self, value: i64) -> Value {
        match self.symbol_for(value) {
            Some(sym) => Value::Symbol(sym.clone()),
            None => Value::Int(value),
        }
    }
}

impl NativeLayout for EnumType {
    fn native_type(&self) -> NativeType {
        self.0.native.native_type()
    }
    fn size(&self) -> usize {
        self.0.native.size()
    }
    fn alignment(&self) -> usize {
        self.0.native.alignment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(nt: NativeType) -> Type {
        Type::builtin(nt, &Platform::native()).unwrap()
    }

    #[test]
    fn test_builtin_sizes() {
        let p = Platform::native();
        assert_eq!(int(NativeType::Int16).size(), 2);
        assert_eq!(int(NativeType::Float64).size(), 8);
        assert_eq!(int(NativeType::Pointer).size(), p.pointer_bytes());
        assert_eq!(
            Type::builtin(NativeType::Long, &p.with_long_size(32).unwrap())
                .unwrap()
                .size(),
            4
        );
        assert!(Builtin::new(NativeType::Struct, &p).is_err());
    }

    #[test]
    fn test_array_type_layout() {
        let arr = ArrayType::new(int(NativeType::Int16), 3);
        assert_eq!(arr.size(), 6);
        assert_eq!(arr.alignment(), 2);
        assert!(!arr.is_char_array());
        assert!(ArrayType::new(int(NativeType::UInt8), 4).is_char_array());
    }

    #[test]
    fn test_callback_cif_arity() {
        let info = CallbackInfo::new(
            vec![int(NativeType::Int32), int(NativeType::Pointer)],
            int(NativeType::Void),
        );
        let cif = info.cif().unwrap();
        assert_eq!(unsafe { (*cif.as_raw_ptr()).nargs }, 2);
        assert_eq!(Type::from(info).size(), size_of::<usize>());
    }

    #[test]
    fn test_enum_rejects_float_native() {
        let p = Platform::native();
        let float = Builtin::new(NativeType::Float32, &p).unwrap();
        assert!(EnumType::new(None, float, []).is_err());
    }

    #[test]
    fn test_enum_round_trip_and_unknown_values() {
        let table = SymbolTable::new();
        let red = table.intern("red");
        let native = Builtin::new(NativeType::Int32, &Platform::native()).unwrap();
        let e = EnumType::new(Some("color".into()), native, [(red.clone(), 1)]).unwrap();
        assert_eq!(e.to_native(&Value::Symbol(red.clone())).unwrap(), 1);
        assert_eq!(e.from_native(1), Value::Symbol(red));
        assert_eq!(e.from_native(42), Value::Int(42));
        assert!(e
            .to_native(&Value::Symbol(table.intern("blue")))
            .is_err());
    }
}

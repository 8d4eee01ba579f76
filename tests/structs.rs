use ffi_memory::{
    memory::{Allocation, Allocator, HeapAllocator},
    types::{ArrayType, CallbackInfo, DataConverter, MappedType, StructByReference, StructByValue},
    ByteOrder, Field, FfiError, Function, MemoryPointer, NativeLayout, NativeType, Platform,
    Pointer, Runtime, Struct, StructLayout, StructLayoutBuilder, ToPointer, Type, Value,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

macro_rules! layout {
    ($rt:expr, { $($name:ident : $ty:expr),+ $(,)? }) => {{
        let mut builder = StructLayoutBuilder::new(&$rt);
        $(builder.add(stringify!($name), $ty).unwrap();)+
        builder.build().unwrap()
    }};
}

macro_rules! assert_err {
    ($expr:expr, $pat:pat) => {
        match $expr {
            Err($pat) => {}
            other => panic!("expected {}, got {:?}", stringify!($pat), other),
        }
    };
}

fn array_of(rt: &Runtime, component: &str, length: usize) -> Type {
    ArrayType::new(rt.resolve(component).unwrap(), length).into()
}

#[test]
fn test_two_int_layout() {
    let rt = Runtime::new();
    let int32 = rt.resolve("int32").unwrap();
    let layout = Arc::new(
        StructLayout::new(
            vec![
                Field::new(rt.symbol("a"), int32.clone(), 0, rt.platform()).unwrap(),
                Field::new(rt.symbol("b"), int32, 4, rt.platform()).unwrap(),
            ],
            8,
            4,
        )
        .unwrap(),
    );
    assert_eq!(layout.size(), 8);
    assert_eq!(layout.alignment(), 4);
    assert!(!layout.is_union());

    let s = Struct::new(&rt, layout).unwrap();
    s.set("a", 5).unwrap();
    s.set("b", 7).unwrap();
    assert_eq!(s.get("a").unwrap(), Value::Int(5));
    assert_eq!(s.get("b").unwrap(), Value::Int(7));
    assert_eq!(s.values().unwrap(), vec![Value::Int(5), Value::Int(7)]);
    assert_eq!(s.memory().get_int32(4).unwrap(), 7);
}

#[test]
fn test_layout_size_covers_fields() {
    let rt = Runtime::new();
    let layout = layout!(rt, { tag: "uint8", value: "int64", count: "uint16" });
    let end = layout
        .fields()
        .map(|f| f.offset() + f.size())
        .max()
        .unwrap();
    assert_eq!(end, 18);
    assert_eq!(layout.size(), 24);
    assert_eq!(
        layout.offsets(),
        vec![(rt.symbol("tag"), 0), (rt.symbol("value"), 8), (rt.symbol("count"), 16)]
    );
}

#[test]
fn test_symbol_and_text_lookup_agree() {
    let rt = Runtime::new();
    let layout = layout!(rt, { x: "double", y: "float" });
    let by_symbol = layout.member(&rt.symbol("y")).unwrap();
    let by_name = layout.member("y").unwrap();
    assert_eq!(by_symbol.offset(), by_name.offset());
    assert_eq!(by_symbol.ty(), by_name.ty());
    assert_eq!(
        layout.member("z").unwrap_err(),
        FfiError::InvalidArgument("Unknown field: z".into())
    );
}

#[test]
fn test_struct_over_existing_memory() {
    let rt = Runtime::new();
    let layout = layout!(rt, { lo: "uint16", hi: "uint16" });
    let mem = MemoryPointer::new(&rt, 1, 4, true).unwrap();
    mem.put_uint16(2, 0xABCD).unwrap();

    let s = Struct::with_memory(&rt, layout.clone(), mem.to_ptr().unwrap()).unwrap();
    assert_eq!(s.get("hi").unwrap(), Value::Int(0xABCD));
    s.set("lo", 1).unwrap();
    assert_eq!(mem.get_uint16(0).unwrap(), 1);

    s.clear().unwrap();
    assert_eq!(mem.get_uint32(0).unwrap(), 0);

    let small = MemoryPointer::new(&rt, 1, 2, true).unwrap();
    assert_err!(
        Struct::with_memory(&rt, layout, small.to_ptr().unwrap()),
        FfiError::InvalidArgument(_)
    );
}

#[test]
fn test_string_field() {
    let rt = Runtime::new();
    let layout = layout!(rt, { name: "string" });
    let s = Struct::new(&rt, layout).unwrap();
    assert_eq!(s.get("name").unwrap(), Value::Nil);

    s.set("name", "hello").unwrap();
    assert_eq!(s.get("name").unwrap(), Value::Bytes(b"hello".to_vec()));
    assert_ne!(s.memory().get_address(0).unwrap(), 0);

    s.set("name", Value::Nil).unwrap();
    assert_eq!(s.memory().get_address(0).unwrap(), 0);
    assert_err!(s.set("name", 3.5), FfiError::TypeMismatch { .. });
}

#[test]
fn test_pointer_field_retains_target() {
    let rt = Runtime::new();
    let layout = layout!(rt, { data: "pointer" });
    let s = Struct::new(&rt, layout).unwrap();

    let target = MemoryPointer::new(&rt, 4, 1, true).unwrap();
    target.write_int32(99).unwrap();
    let address = target.address();
    s.set("data", target).unwrap();

    let read = s.get("data").unwrap();
    let pointer = read.as_pointer().unwrap();
    assert_eq!(pointer.address(), address);
    // the struct keeps the block alive after the caller's handle is gone
    assert_eq!(pointer.read_int32().unwrap(), 99);
    assert_eq!(s.get("data").unwrap(), read);

    s.set("data", Value::Nil).unwrap();
    assert!(s.get("data").unwrap().as_pointer().unwrap().is_null());
}

#[test]
fn test_struct_by_reference_field() {
    let rt = Runtime::new();
    let node = layout!(rt, { value: "int32" });
    let by_ref: Type = StructByReference::new(node.clone()).into();
    let mut builder = StructLayoutBuilder::new(&rt);
    builder.add("next", by_ref).unwrap();
    let outer = Struct::new(&rt, builder.build().unwrap()).unwrap();

    outer.set("next", Value::Nil).unwrap();
    assert_eq!(outer.memory().get_address(0).unwrap(), 0);
    assert_eq!(outer.get("next").unwrap(), Value::Nil);

    let target = Struct::new(&rt, node).unwrap();
    target.set("value", 42).unwrap();
    outer.set("next", target.clone()).unwrap();
    assert_eq!(
        outer.memory().get_address(0).unwrap(),
        target.memory().address()
    );
    let read = outer.get("next").unwrap();
    assert_eq!(read.as_struct().unwrap().get("value").unwrap(), Value::Int(42));

    let other = Struct::new(&rt, layout!(rt, { value: "int32", extra: "int8" })).unwrap();
    assert_err!(outer.set("next", other), FfiError::TypeMismatch { .. });
}

#[test]
fn test_inner_struct_keeps_identity() {
    let rt = Runtime::new();
    let point = layout!(rt, { x: "int16", y: "int16" });
    let inner: Type = StructByValue::new(point.clone()).into();
    let mut builder = StructLayoutBuilder::new(&rt);
    builder.add("id", "uint8").unwrap().add("pos", inner).unwrap();
    let outer = Struct::new(&rt, builder.build().unwrap()).unwrap();
    assert_eq!(outer.offset_of("pos").unwrap(), 2);

    let first = outer.get("pos").unwrap();
    let second = outer.get("pos").unwrap();
    assert!(Struct::ptr_eq(first.as_struct().unwrap(), second.as_struct().unwrap()));

    first.as_struct().unwrap().set("y", -3).unwrap();
    assert_eq!(outer.memory().get_int16(4).unwrap(), -3);

    let replacement = Struct::new(&rt, point).unwrap();
    replacement.set("x", 11).unwrap();
    outer.set("pos", replacement).unwrap();
    assert_eq!(first.as_struct().unwrap().get("x").unwrap(), Value::Int(11));
}

#[test]
fn test_numeric_array_field() {
    let rt = Runtime::new();
    let layout = layout!(rt, { values: array_of(&rt, "int16", 3) });
    let s = Struct::new(&rt, layout).unwrap();

    let list = |n: &[i64]| Value::List(n.iter().map(|&v| Value::Int(v)).collect());
    s.set("values", list(&[1, 2, 3])).unwrap();
    assert_eq!(s.memory().get_array_of_int16(0, 3).unwrap(), vec![1, 2, 3]);

    let proxy = s.get("values").unwrap();
    let proxy = proxy.as_array().unwrap();
    assert_eq!(proxy.len(), 3);
    assert_eq!(proxy.to_vec().unwrap(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(
        s.set("values", list(&[1, 2, 3, 4])).unwrap_err(),
        FfiError::IndexOutOfBounds("array too big".into())
    );
    assert_err!(s.set("values", 5), FfiError::NotImplemented(_));
}

#[test]
fn test_char_array_field() {
    let rt = Runtime::new();
    let layout = layout!(rt, { name: array_of(&rt, "char", 6) });
    let s = Struct::new(&rt, layout).unwrap();

    s.set("name", "abc").unwrap();
    let proxy = s.get("name").unwrap();
    let proxy = proxy.as_array().unwrap();
    assert!(proxy.is_char_array());
    assert_eq!(proxy.to_string_lossy().unwrap(), "abc");

    s.set("name", "abcdef").unwrap();
    assert_eq!(proxy.to_bytes().unwrap(), b"abcdef");
    assert_eq!(
        s.set("name", "abcdefg").unwrap_err(),
        FfiError::InvalidArgument(
            "String is longer (7 bytes) than the char array (6 bytes)".into()
        )
    );
}

#[test]
fn test_enum_field() {
    let rt = Runtime::new();
    rt.enum_type(Some("color"), "int", &[("red", 0), ("green", 1), ("blue", 2)])
        .unwrap();
    let layout = layout!(rt, { shade: "color" });
    let s = Struct::new(&rt, layout).unwrap();

    s.set("shade", rt.symbol("blue")).unwrap();
    assert_eq!(s.memory().get_int32(0).unwrap(), 2);
    assert_eq!(s.get("shade").unwrap(), Value::Symbol(rt.symbol("blue")));

    s.set("shade", 9).unwrap();
    assert_eq!(s.get("shade").unwrap(), Value::Int(9));
    assert_err!(s.set("shade", rt.symbol("mauve")), FfiError::InvalidArgument(_));
}

#[test]
fn test_enum_array_field() {
    let rt = Runtime::new();
    rt.enum_type(Some("color"), "int", &[("red", 0), ("green", 1), ("blue", 2)])
        .unwrap();
    let colors = ArrayType::new(rt.resolve("color").unwrap(), 3);
    let layout = layout!(rt, { shades: Type::from(colors) });
    let s = Struct::new(&rt, layout).unwrap();

    s.set(
        "shades",
        Value::List(vec![Value::Symbol(rt.symbol("blue")), Value::Int(1)]),
    )
    .unwrap();
    assert_eq!(s.memory().get_array_of_int32(0, 2).unwrap(), vec![2, 1]);

    let Value::Array(shades) = s.get("shades").unwrap() else {
        panic!("expected an array view");
    };
    assert_eq!(shades.get(0).unwrap(), Value::Symbol(rt.symbol("blue")));
    assert_eq!(shades.get(1).unwrap(), Value::Symbol(rt.symbol("green")));
    shades.put(2, &Value::Symbol(rt.symbol("red"))).unwrap();
    assert_eq!(shades.get(2).unwrap(), Value::Symbol(rt.symbol("red")));
    assert_err!(
        shades.put(2, &Value::Symbol(rt.symbol("mauve"))),
        FfiError::InvalidArgument(_)
    );
}

#[test]
fn test_struct_byte_order_views() {
    let rt = Runtime::new();
    let layout = layout!(rt, { word: "uint32" });
    let s = Struct::new(&rt, layout).unwrap();
    s.memory().put_bytes(0, &[1, 2, 3, 4]).unwrap();
    assert_eq!(s.order(), ByteOrder::native());

    let little = s.with_order(ByteOrder::Little).unwrap();
    assert_eq!(little.order(), ByteOrder::Little);
    assert_eq!(little.get("word").unwrap(), Value::Int(0x0403_0201));
    let big = s.with_order(ByteOrder::Big).unwrap();
    assert_eq!(big.get("word").unwrap(), Value::Int(0x0102_0304));
    let network = s.with_order(ByteOrder::parse("network").unwrap()).unwrap();
    assert_eq!(network.get("word").unwrap(), Value::Int(0x0102_0304));

    big.set("word", 0x0A0B_0C0D).unwrap();
    assert_eq!(s.memory().get_bytes(0, 4).unwrap(), [0x0A, 0x0B, 0x0C, 0x0D]);
    assert_eq!(s.order(), ByteOrder::native());
    assert!(Struct::ptr_eq(&s, &s.with_order(ByteOrder::native()).unwrap()));
}

#[test]
fn test_layout_put_refuses_retained_fields() {
    let rt = Runtime::new();
    let layout = layout!(rt, { count: "int32", name: "string", data: "pointer" });
    let mem = MemoryPointer::new(&rt, layout.size(), 1, true).unwrap();

    layout.put(&mem, "count", &Value::Int(7)).unwrap();
    assert_eq!(layout.get(&mem, "count").unwrap(), Value::Int(7));
    assert_err!(
        layout.put(&mem, "name", &Value::from("hello")),
        FfiError::UnsupportedOperation(_)
    );
    assert_err!(
        layout.put(&mem, "data", &Value::UInt(0x1000)),
        FfiError::UnsupportedOperation(_)
    );
    assert_eq!(mem.get_address(layout.offset_of("name").unwrap()).unwrap(), 0);
    assert_eq!(layout.get(&mem, "name").unwrap(), Value::Nil);
}

#[derive(Debug, Default)]
struct CountingAllocator {
    allocations: AtomicUsize,
}

impl Allocator for CountingAllocator {
    fn allocate(&self, size: usize, alignment: usize, clear: bool) -> ffi_memory::Result<Arc<Allocation>> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        HeapAllocator.allocate(size, alignment, clear)
    }
}

#[test]
fn test_string_fields_use_runtime_allocator() {
    let counter = Arc::new(CountingAllocator::default());
    let rt = Runtime::new().with_allocator(counter.clone());
    let layout = layout!(rt, { name: "string" });
    let s = Struct::new(&rt, layout).unwrap();
    assert_eq!(counter.allocations.load(Ordering::SeqCst), 1);

    s.set("name", "hello").unwrap();
    s.set("name", "again").unwrap();
    assert_eq!(counter.allocations.load(Ordering::SeqCst), 3);
    assert_eq!(s.get("name").unwrap(), Value::Bytes(b"again".to_vec()));
}

#[derive(Debug)]
struct UpperCase {
    native: Type,
}

impl DataConverter for UpperCase {
    fn native_type(&self) -> Type {
        self.native.clone()
    }

    fn to_native(&self, value: &Value) -> ffi_memory::Result<Value> {
        match value {
            Value::Bytes(b) => Ok(Value::Bytes(b.to_ascii_uppercase())),
            other => Err(FfiError::type_mismatch("string", other.type_name())),
        }
    }

    fn from_native(&self, value: Value) -> ffi_memory::Result<Value> {
        Ok(value)
    }
}

#[test]
fn test_mapped_string_field_keeps_buffer() {
    let rt = Runtime::new();
    let shout: Type = MappedType::new(Arc::new(UpperCase {
        native: rt.resolve("string").unwrap(),
    }))
    .into();
    let layout = layout!(rt, { name: shout });
    let s = Struct::new(&rt, layout).unwrap();
    s.set("name", "hello").unwrap();
    let address = s.memory().get_address(0).unwrap();

    // fresh blocks of the same size must not land on the string's buffer
    let others: Vec<_> = (0..64)
        .map(|_| MemoryPointer::from_string(&rt, b"XXXXX").unwrap())
        .collect();
    assert!(others.iter().all(|m| m.address() != address));
    assert_eq!(s.get("name").unwrap(), Value::Bytes(b"HELLO".to_vec()));
}

#[derive(Debug)]
struct FlagConverter {
    native: Type,
}

impl DataConverter for FlagConverter {
    fn native_type(&self) -> Type {
        self.native.clone()
    }

    fn to_native(&self, value: &Value) -> ffi_memory::Result<Value> {
        Ok(Value::Int(if value.is_truthy() { 1 } else { 0 }))
    }

    fn from_native(&self, value: Value) -> ffi_memory::Result<Value> {
        Ok(Value::Bool(value.to_i64()? != 0))
    }
}

#[test]
fn test_mapped_field() {
    let rt = Runtime::new();
    let converter = FlagConverter {
        native: rt.builtin(NativeType::Int32).unwrap(),
    };
    let flag: Type = MappedType::new(Arc::new(converter)).into();
    assert_eq!(flag.size(), 4);

    let layout = layout!(rt, { enabled: flag, count: "int32" });
    let s = Struct::new(&rt, layout).unwrap();
    s.set("enabled", true).unwrap();
    assert_eq!(s.memory().get_int32(0).unwrap(), 1);
    assert_eq!(s.get("enabled").unwrap(), Value::Bool(true));
    s.set("enabled", false).unwrap();
    assert_eq!(s.get("enabled").unwrap(), Value::Bool(false));
}

#[test]
fn test_function_field() {
    let rt = Runtime::new();
    let int = rt.resolve("int").unwrap();
    let info = CallbackInfo::new(vec![int.clone()], int);
    let layout = layout!(rt, { callback: Type::from(info.clone()) });
    let s = Struct::new(&rt, layout).unwrap();
    assert_eq!(s.get("callback").unwrap(), Value::Nil);

    let platform = Platform::native();
    let function = Function::new(Pointer::new(0x1000, platform), info);
    s.set("callback", function.clone()).unwrap();
    assert_eq!(s.memory().get_address(0).unwrap(), 0x1000);
    assert_eq!(s.get("callback").unwrap(), Value::Function(function));

    s.set("callback", Value::Nil).unwrap();
    assert_eq!(s.get("callback").unwrap(), Value::Nil);
}

#[test]
fn test_union_layout() {
    let rt = Runtime::new();
    let mut builder = StructLayoutBuilder::union(&rt);
    builder.add("word", "uint32").unwrap().add("bytes", array_of(&rt, "uint8", 4)).unwrap();
    let layout = builder.build().unwrap();
    assert!(layout.is_union());
    assert_eq!(layout.size(), 4);

    let s = Struct::new(&rt, layout).unwrap();
    s.set("word", 0x0102_0304).unwrap();
    let bytes = s.get("bytes").unwrap();
    let first = bytes.as_array().unwrap().get(0).unwrap();
    let expected = if cfg!(target_endian = "little") { 4 } else { 1 };
    assert_eq!(first, Value::Int(expected));
}

#[test]
fn test_unsupported_field_type() {
    let rt = Runtime::new();
    let layout = layout!(rt, { wide: "long_double" });
    let s = Struct::new(&rt, layout).unwrap();
    assert_err!(s.get("wide"), FfiError::NotImplemented(_));
    assert_err!(s.set("wide", 1.0), FfiError::NotImplemented(_));
}

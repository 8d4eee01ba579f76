use crate::{
    error::{FfiError, Result},
    layout::StructLayoutBuilder,
    library::NativeLibraries,
    memory::{Allocator, HeapAllocator},
    platform::Platform,
    types::{EnumType, NativeType, Symbol, SymbolTable, Type, TypeResolver, TypeSpec},
};
use std::{fmt, sync::Arc};

/// One independent session: platform facts, interned symbols, named types,
/// the allocator behind owned memory and the opened native libraries.
///
/// Nothing here is global, so separate runtimes never observe each other's
/// typedefs or symbols.
pub struct Runtime {
    platform: Platform,
    symbols: SymbolTable,
    resolver: TypeResolver,
    allocator: Arc<dyn Allocator>,
    libraries: NativeLibraries,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_platform(Platform::native())
    }

    pub fn with_platform(platform: Platform) -> Self {
        let symbols = SymbolTable::new();
        Self {
            platform,
            resolver: TypeResolver::new(symbols.clone(), &platform),
            symbols,
            allocator: Arc::new(HeapAllocator),
            libraries: NativeLibraries::new(),
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn symbol(&self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn resolver(&self) -> &TypeResolver {
        &self.resolver
    }

    pub fn resolve(&self, spec: impl Into<TypeSpec>) -> Result<Type> {
        self.resolver.resolve(spec)
    }

    pub fn typedef(&self, name: &str, target: impl Into<TypeSpec>) -> Result<Type> {
        self.resolver.typedef(name, target)
    }

    pub fn builtin(&self, native_type: NativeType) -> Result<Type> {
        Type::builtin(native_type, &self.platform)
    }

    /// An enum over an integer type, e.g. `enum_type(Some("color"), "int", &[("red", 0)])`.
    pub fn enum_type(
        &self,
        name: Option<&str>,
        native: impl Into<TypeSpec>,
        entries: &[(&str, i64)],
    ) -> Result<Type> {
        let native = match self.resolve(native)? {
            Type::Builtin(b) => b,
            other => return Err(FfiError::type_mismatch("builtin integer type", other.describe())),
        };
        let entries = entries.iter().map(|(n, v)| (self.symbol(n), *v));
        let t: Type = EnumType::new(name.map(str::to_string), native, entries)?.into();
        if let Some(name) = name {
            self.typedef(name, &t)?;
        }
        Ok(t)
    }

    pub fn layout(&self) -> StructLayoutBuilder<'_> {
        StructLayoutBuilder::new(self)
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn libraries(&self) -> &NativeLibraries {
        &self.libraries
    }

    pub fn libraries_mut(&mut self) -> &mut NativeLibraries {
        &mut self.libraries
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("platform", &self.platform)
            .field("symbols", &self.symbols.len())
            .field("resolver", &self.resolver)
            .field("allocator", &self.allocator)
            .finish()
    }
}

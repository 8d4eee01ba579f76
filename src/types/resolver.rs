use super::{Builtin, NativeType, Symbol, SymbolTable, Type};
use crate::{
    error::{Result, TypeResolutionError},
    platform::Platform,
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, trace};

/// Anything that can name a type: a descriptor, a symbol or plain text.
#[derive(Clone, Debug)]
pub enum TypeSpec {
    Type(Type),
    Symbol(Symbol),
    Name(String),
}

impl From<Type> for TypeSpec {
    fn from(t: Type) -> Self {
        TypeSpec::Type(t)
    }
}
impl From<&Type> for TypeSpec {
    fn from(t: &Type) -> Self {
        TypeSpec::Type(t.clone())
    }
}
impl From<Builtin> for TypeSpec {
    fn from(b: Builtin) -> Self {
        TypeSpec::Type(b.into())
    }
}
impl From<Symbol> for TypeSpec {
    fn from(s: Symbol) -> Self {
        TypeSpec::Symbol(s)
    }
}
impl From<&Symbol> for TypeSpec {
    fn from(s: &Symbol) -> Self {
        TypeSpec::Symbol(s.clone())
    }
}
impl From<&str> for TypeSpec {
    fn from(s: &str) -> Self {
        TypeSpec::Name(s.to_string())
    }
}
impl From<String> for TypeSpec {
    fn from(s: String) -> Self {
        TypeSpec::Name(s)
    }
}

fn builtin_registry(platform: &Platform) -> HashMap<&'static str, NativeType> {
    use NativeType::*;
    let (size_t, ssize_t) = if platform.address_size() == 64 {
        (UInt64, Int64)
    } else {
        (UInt32, Int32)
    };
    HashMap::from([
        ("void", Void),
        ("bool", Bool),
        ("char", Int8),
        ("uchar", UInt8),
        ("int8", Int8),
        ("uint8", UInt8),
        ("short", Int16),
        ("ushort", UInt16),
        ("int16", Int16),
        ("uint16", UInt16),
        ("int", Int32),
        ("uint", UInt32),
        ("int32", Int32),
        ("uint32", UInt32),
        ("long", Long),
        ("ulong", ULong),
        ("long_long", Int64),
        ("ulong_long", UInt64),
        ("int64", Int64),
        ("uint64", UInt64),
        ("float", Float32),
        ("double", Float64),
        ("float32", Float32),
        ("float64", Float64),
        ("long_double", LongDouble),
        ("pointer", Pointer),
        ("string", String),
        ("size_t", size_t),
        ("ssize_t", ssize_t),
        ("intptr_t", ssize_t),
        ("uintptr_t", size_t),
    ])
}

/// Maps type names to descriptors. User typedefs take precedence over the
/// builtin names; successful symbol lookups are memoized in a copy-on-write
/// map so readers never contend with each other.
pub struct TypeResolver {
    symbols: SymbolTable,
    builtins: HashMap<&'static str, Type>,
    typedefs: RwLock<HashMap<Symbol, Type>>,
    cache: RwLock<Arc<HashMap<Symbol, Type>>>,
}

impl TypeResolver {
    pub fn new(symbols: SymbolTable, platform: &Platform) -> Self {
        let builtins = builtin_registry(platform)
            .into_iter()
            .filter_map(|(name, nt)| Some((name, Builtin::new(nt, platform).ok()?.into())))
            .collect();
        Self {
            symbols,
            builtins,
            typedefs: RwLock::new(HashMap::new()),
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn resolve(&self, spec: impl Into<TypeSpec>) -> Result<Type> {
        match spec.into() {
            TypeSpec::Type(t) => Ok(t),
            TypeSpec::Symbol(sym) => self.resolve_symbol(&sym),
            TypeSpec::Name(name) => self.resolve_symbol(&self.symbols.intern(&name)),
        }
    }

    fn resolve_symbol(&self, sym: &Symbol) -> Result<Type> {
        let snapshot = self.cache.read().clone();
        if let Some(t) = snapshot.get(sym) {
            return Ok(t.clone());
        }

        let found = self
            .typedefs
            .read()
            .get(sym)
            .cloned()
            .or_else(|| self.builtins.get(sym.as_str()).cloned());

        match found {
            Some(t) => {
                let t = self.remember(sym.clone(), t);
                trace!("resolved type {sym:?} -> {}", t.describe());
                Ok(t)
            }
            None => Err(TypeResolutionError::NotFound(sym.to_string()).into()),
        }
    }

    /// Caches `t` for `sym`. A typedef declared since `t` was looked up wins
    /// over it, so a stale builtin never gets pinned in the cache.
    fn remember(&self, sym: Symbol, t: Type) -> Type {
        let mut guard = self.cache.write();
        let t = self.typedefs.read().get(&sym).cloned().unwrap_or(t);
        let mut next = HashMap::clone(&guard);
        next.insert(sym, t.clone());
        *guard = Arc::new(next);
        t
    }

    fn forget(&self, sym: &Symbol) {
        let mut guard = self.cache.write();
        if guard.contains_key(sym) {
            let mut next = HashMap::clone(&guard);
            next.remove(sym);
            *guard = Arc::new(next);
        }
    }

    /// Declares `name` as an alias for `target`, shadowing any builtin of
    /// the same name.
    pub fn typedef(&self, name: &str, target: impl Into<TypeSpec>) -> Result<Type> {
        let t = self.resolve(target)?;
        let sym = self.symbols.intern(name);
        debug!("typedef {name} = {}", t.describe());
        self.typedefs.write().insert(sym.clone(), t.clone());
        self.forget(&sym);
        Ok(t)
    }

    pub fn find_builtin(&self, name: &str) -> Option<Type> {
        self.builtins.get(name).cloned()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

impl std::fmt::Debug for TypeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeResolver")
            .field("builtins", &self.builtins.len())
            .field("typedefs", &self.typedefs.read().len())
            .finish()
    }
}

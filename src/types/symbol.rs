use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    /// Mixed identity hash used by the layout lookup tables.
    pub fn hash_code(self) -> usize {
        (self.0 as usize).wrapping_mul(0x9E37_79B9)
    }
}

/// An interned field or type name.
///
/// Two symbols compare equal iff they were interned from the same text by the
/// same table.
#[derive(Clone)]
pub struct Symbol {
    id: SymbolId,
    name: Arc<str>,
}

impl Symbol {
    pub fn id(&self) -> SymbolId {
        self.id
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> Arc<str> {
        self.name.clone()
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.name, &other.name)
    }
}
impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

struct SymbolTableImpl {
    names: Vec<Arc<str>>,
    mappings: HashMap<Arc<str>, SymbolId>,
}

impl SymbolTableImpl {
    fn get_or_add(&mut self, value: &str) -> Symbol {
        if let Some(&id) = self.mappings.get(value) {
            return Symbol {
                id,
                name: self.names[id.0 as usize].clone(),
            };
        }
        let id = SymbolId(self.names.len() as u32);
        let name: Arc<str> = Arc::from(value);
        self.names.push(name.clone());
        self.mappings.insert(name.clone(), id);
        Symbol { id, name }
    }
}

#[derive(Clone)]
pub struct SymbolTable(Arc<RwLock<SymbolTableImpl>>);

impl SymbolTable {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(SymbolTableImpl {
            names: Vec::new(),
            mappings: HashMap::new(),
        })))
    }

    pub fn intern(&self, value: &str) -> Symbol {
        if let Some(sym) = self.lookup(value) {
            return sym;
        }
        self.0.write().get_or_add(value)
    }

    /// Finds an existing symbol without creating one.
    pub fn lookup(&self, value: &str) -> Option<Symbol> {
        let table = self.0.read();
        let id = *table.mappings.get(value)?;
        Some(Symbol {
            id,
            name: table.names[id.0 as usize].clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.0.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable")
            .field("len", &self.len())
            .finish()
    }
}

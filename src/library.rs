use crate::{
    error::{LibraryError, Result},
    memory::{Function, Pointer},
    platform::Platform,
    types::CallbackInfo,
};
use dashmap::DashMap;
use libloading::{Library, Symbol};
use std::{ffi::c_void, path::PathBuf};
use tracing::debug;

/// Dynamic libraries opened on behalf of a runtime, keyed by the name they
/// were requested under.
pub struct NativeLibraries {
    search_paths: Vec<PathBuf>,
    libraries: DashMap<String, Library>,
}

impl NativeLibraries {
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
            libraries: DashMap::new(),
        }
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    fn find_library_path(&self, name: &str) -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        let extensions = &[".dylib", ".so"];
        #[cfg(target_os = "windows")]
        let extensions = &[".dll"];
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let extensions = &[".so"];

        for root in &self.search_paths {
            let exact = root.join(name);
            if exact.exists() {
                return Some(exact);
            }
            for ext in extensions {
                for candidate in [format!("{name}{ext}"), format!("lib{name}{ext}")] {
                    let path = root.join(candidate);
                    if path.exists() {
                        return Some(path);
                    }
                }
            }
        }
        None
    }

    /// Opens `name`, trying the search paths first and then the platform
    /// loader's own search.
    pub fn open(&self, name: &str) -> Result<()> {
        if self.libraries.contains_key(name) {
            return Ok(());
        }
        let path = self
            .find_library_path(name)
            .unwrap_or_else(|| PathBuf::from(name));
        debug!("loading library {name} from {}", path.display());
        let lib = unsafe { Library::new(&path) }
            .map_err(|e| LibraryError::LoadError(name.to_string(), e.to_string()))?;
        self.libraries.entry(name.to_string()).or_insert(lib);
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.libraries.contains_key(name)
    }

    fn symbol_address(&self, library: &str, symbol: &str) -> Result<usize> {
        self.open(library)?;
        let lib = self
            .libraries
            .get(library)
            .ok_or_else(|| LibraryError::LibraryNotFound(library.to_string()))?;
        let sym: Symbol<*mut c_void> = unsafe { lib.get(symbol.as_bytes()) }
            .map_err(|_| LibraryError::SymbolNotFound(library.to_string(), symbol.to_string()))?;
        Ok(*sym as usize)
    }

    /// Address of an exported variable or function as an unbounded pointer.
    pub fn find_symbol(&self, library: &str, symbol: &str, platform: Platform) -> Result<Pointer> {
        Ok(Pointer::new(self.symbol_address(library, symbol)?, platform))
    }

    pub fn find_function(
        &self,
        library: &str,
        symbol: &str,
        info: CallbackInfo,
        platform: Platform,
    ) -> Result<Function> {
        let pointer = self.find_symbol(library, symbol, platform)?;
        Ok(Function::new(pointer, info))
    }
}

impl Default for NativeLibraries {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NativeLibraries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLibraries")
            .field("search_paths", &self.search_paths)
            .field("loaded", &self.libraries.len())
            .finish()
    }
}

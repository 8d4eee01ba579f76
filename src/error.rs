use thiserror::Error;

pub type Result<T, E = FfiError> = std::result::Result<T, E>;

pub const NULL_POINTER_ACCESS: &str = "NULL pointer access";
pub const FREED_MEMORY_ACCESS: &str = "attempting to access freed memory";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FfiError {
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    #[error("Memory access violation: {0}")]
    AccessViolation(&'static str),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Type resolution failed: {0}")]
    TypeResolution(#[from] TypeResolutionError),

    #[error("Library lookup failed: {0}")]
    Library(#[from] LibraryError),
}

impl FfiError {
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Bounds failure for an access of `len` bytes at `offset` into a region of `limit` bytes.
    pub fn out_of_bounds(offset: usize, len: usize, limit: usize) -> Self {
        Self::IndexOutOfBounds(format!(
            "Memory access offset={offset} size={len} is out of bounds (limit {limit})"
        ))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeResolutionError {
    #[error("Type not found: {0}")]
    NotFound(String),
    #[error("Invalid type: {0}")]
    InvalidType(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LibraryError {
    #[error("Library not found: {0}")]
    LibraryNotFound(String),
    #[error("Symbol {1} not found in library {0}")]
    SymbolNotFound(String, String),
    #[error("Failed to load library {0}: {1}")]
    LoadError(String, String),
}

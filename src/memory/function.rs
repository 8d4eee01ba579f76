use super::{Pointer, ToPointer};
use crate::{error::Result, types::CallbackInfo, utils::Address};
use libffi::middle::{Cif, CodePtr};
use std::{ffi::c_void, fmt, sync::Arc};

/// A native function address together with its signature.
#[derive(Clone)]
pub struct Function {
    pointer: Pointer,
    info: Arc<CallbackInfo>,
}

impl Function {
    pub fn new(pointer: Pointer, info: impl Into<Arc<CallbackInfo>>) -> Self {
        Self {
            pointer,
            info: info.into(),
        }
    }

    pub fn address(&self) -> usize {
        self.pointer.address()
    }

    pub fn info(&self) -> &Arc<CallbackInfo> {
        &self.info
    }

    pub fn code_ptr(&self) -> CodePtr {
        CodePtr::from_ptr(self.address() as *const c_void)
    }

    pub fn cif(&self) -> Result<Cif> {
        self.info.cif()
    }
}

impl ToPointer for Function {
    fn to_ptr(&self) -> Result<Pointer> {
        Ok(self.pointer.clone())
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("address", &Address(self.address()))
            .field("signature", &self.info)
            .finish()
    }
}

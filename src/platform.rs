use crate::error::{FfiError, Result};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    pub const fn opposite(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    pub fn is_native(self) -> bool {
        self == Self::native()
    }

    /// Accepts `little`, `big`, `network` (big-endian) and `native`.
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "little" => Ok(ByteOrder::Little),
            "big" | "network" => Ok(ByteOrder::Big),
            "native" => Ok(Self::native()),
            other => Err(FfiError::InvalidArgument(format!(
                "unknown byte order {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "little"),
            ByteOrder::Big => write!(f, "big"),
        }
    }
}

/// Facts about the host that drive size and alignment of the builtin types.
///
/// Sizes are in bits, matching the way C ABIs usually describe them. The
/// address size and byte order always describe the running process; only the
/// width of `long` may be overridden, which is enough to model LP64 vs LLP64.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Platform {
    address_size: usize,
    long_size: usize,
    byte_order: ByteOrder,
}

impl Platform {
    pub fn native() -> Self {
        let address_size = usize::BITS as usize;
        let long_size = if cfg!(windows) { 32 } else { address_size };
        Self {
            address_size,
            long_size,
            byte_order: ByteOrder::native(),
        }
    }

    pub fn with_long_size(self, bits: usize) -> Result<Self> {
        if bits != 32 && bits != 64 {
            return Err(FfiError::InvalidArgument(format!(
                "unsupported long size {bits}"
            )));
        }
        Ok(Self {
            long_size: bits,
            ..self
        })
    }

    pub fn address_size(&self) -> usize {
        self.address_size
    }

    pub fn long_size(&self) -> usize {
        self.long_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn pointer_bytes(&self) -> usize {
        self.address_size / 8
    }

    pub fn long_bytes(&self) -> usize {
        self.long_size / 8
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::native()
    }
}

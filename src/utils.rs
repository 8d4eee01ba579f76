use std::fmt::{Debug, Formatter};

pub fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Smallest power of two that is `>= value`, with a floor of 1.
pub fn round_up_to_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

/// Byte offset into a memory region, formatted in hex for trace output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteOffset(pub usize);

impl Debug for ByteOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

/// Debug formatter for raw addresses.
pub struct Address(pub usize);

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

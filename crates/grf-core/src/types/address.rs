//! Target memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed target virtual address
///
/// This wrapper around `u64` provides type safety when working with addresses in the
/// *target's* address space. It prevents accidentally mixing target addresses with sizes,
/// counts, or addresses in the analyzer's own address space — a target address must never
/// be dereferenced locally, only passed to a memory reader.
///
/// ## Arithmetic
///
/// Heap scanning constantly derives offsets (`addr - span.base`) and advances cursors
/// (`addr + elem_size`). The operators here mirror how the span index uses them:
///
/// - `offset_from` produces a signed offset between two addresses
/// - `add_signed` advances by a signed element/field offset (wrapping, like the target's
///   own pointer arithmetic)
/// - `checked_add` / `saturating_sub` are for untrusted values read out of the target,
///   where overflow indicates a corrupt or unmapped structure rather than a bug here
///
/// ## Example
///
/// ```rust
/// use grf_core::types::Address;
///
/// let base = Address::new(0x1000);
/// let addr = base + 0x230;
/// assert_eq!(addr.offset_from(base), 0x230);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    ///
    /// Used as the "no pointer found" sentinel by the heap-bits iterators.
    pub const NULL: Self = Address(0);

    /// Create a new address from a `u64` value
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Signed offset of `self` relative to `base`.
    ///
    /// This is the workhorse of mask indexing: `addr.offset_from(span.base)` gives the
    /// byte offset whose `/8` is the pointer-word index. Wrapping on purpose — callers
    /// compare against `[start, end)` bounds before trusting the offset.
    pub const fn offset_from(self, base: Address) -> i64
    {
        self.0.wrapping_sub(base.0) as i64
    }

    /// Advance by a signed byte offset (wrapping).
    pub const fn add_signed(self, offset: i64) -> Self
    {
        Address(self.0.wrapping_add(offset as u64))
    }

    /// Add an offset, checking for overflow.
    ///
    /// Returns `None` on overflow. Used when the offset came out of target memory and
    /// cannot be trusted.
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset, saturating at the null address.
    pub fn saturating_sub(self, offset: u64) -> Self
    {
        Address(self.0.saturating_sub(offset))
    }

    /// Round up to a multiple of `align`. `align` must be a power of two.
    pub const fn align(self, align: u64) -> Self
    {
        Address((self.0 + align - 1) & !(align - 1))
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_offset_from()
    {
        let base = Address::new(0x4000);
        assert_eq!((base + 0x88).offset_from(base), 0x88);
        assert_eq!(base.offset_from(base + 0x10), -0x10);
    }

    #[test]
    fn test_checked_add_overflow()
    {
        assert_eq!(Address::new(0x1000).checked_add(0x100), Some(Address::new(0x1100)));
        assert_eq!(Address::new(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn test_saturating_sub()
    {
        assert_eq!(Address::new(0x100).saturating_sub(0x1000), Address::NULL);
    }

    #[test]
    fn test_align()
    {
        assert_eq!(Address::new(0x1001).align(8), Address::new(0x1008));
        assert_eq!(Address::new(0x1008).align(8), Address::new(0x1008));
    }
}

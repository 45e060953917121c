//! GC pointer-mask iteration.
//!
//! A `GcMaskIterator` walks the set bits of a pointer mask restricted to one object's
//! `[base, end)` window. The typed walker consumes bits through `reset_gc_mask` as it
//! classifies pointers; whatever bits survive the typed pass drive the final-mark pass.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::types::Address;

/// Shared ownership of packed mask words.
///
/// Span pointer masks are mutated in place by every iterator that covers a window of the
/// span, and final-mark queue entries outlive the object walk that created them; `Rc` +
/// `RefCell` gives the aliasing the algorithm needs without locks — the analyzer is
/// single-threaded by design.
pub type MaskWords = Rc<RefCell<Vec<u64>>>;

/// Allocate a zeroed mask handle sized for `size` bytes of target memory.
pub fn new_mask(size: i64) -> MaskWords
{
    Rc::new(RefCell::new(vec![0u64; crate::bitmap::mask_words(size)]))
}

/// Iterator over the set pointer bits of one window of a mask.
///
/// `mask_base` is the target address corresponding to bit 0 of the mask; `[base, end)`
/// is the window this iterator may touch. Reads outside the window are refused with
/// `Error::OutOfRange` — the guard that keeps unsafe casts in the target from walking
/// the analyzer off the object.
#[derive(Clone)]
pub struct GcMaskIterator
{
    base: Address,
    end: Address,
    mask_base: Address,
    mask: MaskWords,
    addr: Cell<Address>,
}

impl GcMaskIterator
{
    pub fn new(base: Address, end: Address, mask_base: Address, mask: MaskWords) -> Self
    {
        GcMaskIterator {
            base,
            end,
            mask_base,
            mask,
            addr: Cell::new(base),
        }
    }

    /// First valid address of the window.
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// One past the last valid address of the window.
    pub fn end(&self) -> Address
    {
        self.end
    }

    /// Next pointer address at or after the cursor, or `Address::NULL` if the window
    /// holds no more set bits.
    ///
    /// With `advance = true` the cursor moves past the returned bit, so repeated calls
    /// enumerate every pointer once; with `advance = false` this is a peek.
    pub fn next_ptr(&self, advance: bool) -> Address
    {
        let words = self.mask.borrow();
        let start = self.addr.get().offset_from(self.mask_base);
        let end = self.end.offset_from(self.mask_base);
        if start >= end || start < 0 {
            return Address::NULL;
        }
        let Some(index) = crate::bitmap::next_set_bit(&words, (start / 8) as usize) else {
            return Address::NULL;
        };
        let addr = self.mask_base.add_signed(index as i64 * 8);
        if addr >= self.end {
            return Address::NULL;
        }
        if advance {
            self.addr.set(addr + 8);
        }
        addr
    }

    /// Clear the pointer bit at `addr`, so the final-mark pass will never see it again.
    ///
    /// Fails with `Error::OutOfRange` when `addr` escapes the iterator window.
    pub fn reset_gc_mask(&self, addr: Address) -> Result<()>
    {
        if addr < self.base || addr >= self.end {
            return Err(Error::OutOfRange);
        }
        let offset = addr.offset_from(self.mask_base);
        let mut words = self.mask.borrow_mut();
        let index = (offset / 8) as usize;
        if index / 64 < words.len() {
            crate::bitmap::clear_bit(&mut words, index);
        }
        Ok(())
    }

    /// Whether any set bit remains in the window at or after the cursor.
    pub fn has_pending(&self) -> bool
    {
        !self.next_ptr(false).is_null()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn mask_with_offsets(words: usize, offsets: &[i64]) -> MaskWords
    {
        let mask = Rc::new(RefCell::new(vec![0u64; words]));
        {
            let mut borrowed = mask.borrow_mut();
            for offset in offsets {
                crate::bitmap::set_bit(&mut borrowed, (offset / 8) as usize);
            }
        }
        mask
    }

    #[test]
    fn test_next_ptr_and_reset()
    {
        // two mask words cover 1024 bytes of target memory
        let offsets: [i64; 5] = [16, 72, 208, 504, 928];
        let mask = mask_with_offsets(2, &offsets);
        let hb = GcMaskIterator::new(Address::NULL, Address::new(1024), Address::NULL, mask);

        for (i, offset) in offsets.iter().enumerate() {
            let next = if i < offsets.len() - 1 { offsets[i + 1] } else { 0 };
            assert_eq!(hb.next_ptr(false), Address::new(*offset as u64), "peek at {offset}");
            hb.reset_gc_mask(Address::new(*offset as u64)).unwrap();
            assert_eq!(hb.next_ptr(false), Address::new(next as u64), "after reset of {offset}");
        }
        assert!(!hb.has_pending());
    }

    #[test]
    fn test_advancing_walk_returns_each_once()
    {
        let offsets: [i64; 3] = [0, 8, 240];
        let mask = mask_with_offsets(1, &offsets);
        let hb = GcMaskIterator::new(Address::NULL, Address::new(512), Address::NULL, mask);
        let mut seen = Vec::new();
        loop {
            let ptr = hb.next_ptr(true);
            if ptr.is_null() {
                break;
            }
            seen.push(ptr.value() as i64);
        }
        assert_eq!(seen, offsets);
    }

    #[test]
    fn test_reset_outside_window()
    {
        let mask = mask_with_offsets(1, &[8]);
        let hb = GcMaskIterator::new(Address::new(64), Address::new(128), Address::NULL, mask);
        assert!(hb.reset_gc_mask(Address::new(8)).unwrap_err().is_out_of_range());
        assert!(hb.reset_gc_mask(Address::new(128)).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_window_restricts_scan()
    {
        let mask = mask_with_offsets(1, &[8, 96]);
        let hb = GcMaskIterator::new(Address::new(16), Address::new(96), Address::new(0), mask);
        // bit 8 is before the window cursor, bit 96 is past end
        assert_eq!(hb.next_ptr(true), Address::NULL);
    }
}

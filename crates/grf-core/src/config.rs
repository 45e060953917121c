//! Process-wide analyzer configuration.
//!
//! The maximum reference depth is the only piece of global mutable state in the
//! analyzer. It is initialized once from the CLI before scanning starts and read
//! everywhere the walker recurses; lifecycle = process.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default bound on reference-chain depth.
///
/// Deeper subtrees are not lost: their residual pointer bits survive the typed pass
/// and are accounted for by the final-mark pass.
pub const DEFAULT_MAX_REF_DEPTH: usize = 256;

static MAX_REF_DEPTH: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_REF_DEPTH);

/// Override the maximum reference depth. Values of zero are ignored.
pub fn set_max_ref_depth(depth: usize)
{
    if depth > 0 {
        MAX_REF_DEPTH.store(depth, Ordering::Relaxed);
    }
}

/// Current maximum reference depth.
pub fn max_ref_depth() -> usize
{
    MAX_REF_DEPTH.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_zero_depth_ignored()
    {
        let before = max_ref_depth();
        set_max_ref_depth(0);
        assert_eq!(max_ref_depth(), before);
    }
}

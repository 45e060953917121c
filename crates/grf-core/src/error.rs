//! # Error Types
//!
//! General error handling for the analyzer.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! ## Error Categories
//!
//! 1. **Fatal errors**: `Init` (runtime metadata could not be located), `Io`, `Encode` —
//!    these unwind to the orchestrator, which reports once and exits non-zero.
//! 2. **Recoverable errors**: everything else. They are absorbed at the smallest enclosing
//!    component: an `OutOfRange` read short-circuits the enclosing struct or array, a failed
//!    memory read skips one pointer, a malformed container skips that container.

use thiserror::Error;

/// Main error type for analyzer operations.
#[derive(Error, Debug)]
pub enum Error
{
    /// Runtime symbols or module data could not be located in the target.
    ///
    /// This is fatal: without the runtime's `mheap` region and module descriptors there is
    /// nothing to scan, so the analyzer aborts before producing any output.
    #[error("failed to initialize analysis: {0}")]
    Init(String),

    /// A read through a heap-bits iterator escaped the iterator's `[base, end)` window.
    ///
    /// This happens when an unsafe conversion in the target makes a declared type larger
    /// than the actual heap object (e.g. `(*[1 << 16]T)(unsafe.Pointer(p))`). The walker
    /// reacts by abandoning the remaining fields of the enclosing struct or array; the
    /// condition is expected and not logged.
    #[error("out of heap span range")]
    OutOfRange,

    /// A memory read at an arbitrary target address failed (unmapped page, detached
    /// target, or an error reported by the debugger backend).
    #[error("memory read failed at {addr:#x}: {reason}")]
    ReadMemory
    {
        /// Target virtual address of the failed read
        addr: u64,
        /// Backend-provided failure description
        reason: String,
    },

    /// A memory read returned fewer bytes than requested.
    ///
    /// Short reads are normal at the far ends of mapped regions; callers that need the
    /// full value treat this the same as a failed read and skip the pointer.
    #[error("short read at {addr:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead
    {
        /// Target virtual address of the read
        addr: u64,
        /// Requested length in bytes
        wanted: usize,
        /// Length actually returned
        got: usize,
    },

    /// DWARF resolution failed for an individual entity (variable, type, function).
    ///
    /// Logged and skipped; the rest of the scan continues.
    #[error("dwarf resolution failed: {0}")]
    Dwarf(String),

    /// A runtime structure did not have the shape the analyzer expected
    /// (e.g. a map bucket whose keys field is not an array).
    #[error("malformed runtime structure: {0}")]
    MalformedRuntime(String),

    /// The target platform or architecture is not supported by this build.
    #[error("unsupported target: {0}")]
    Unsupported(String),

    /// Profile serialization failed.
    #[error("profile encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),

    /// I/O error writing the output profile.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error
{
    /// Whether this error is the recoverable out-of-window marker.
    ///
    /// The walker uses this to distinguish "stop scanning the rest of this struct" from
    /// "skip this one pointer".
    pub fn is_out_of_range(&self) -> bool
    {
        matches!(self, Error::OutOfRange)
    }
}

/// Convenience type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_out_of_range_marker()
    {
        assert!(Error::OutOfRange.is_out_of_range());
        assert!(!Error::Init("no mheap".to_string()).is_out_of_range());
    }

    #[test]
    fn test_short_read_message()
    {
        let err = Error::ShortRead {
            addr: 0x1000,
            wanted: 8,
            got: 3,
        };
        let message = format!("{err}");
        assert!(message.contains("0x1000"));
        assert!(message.contains("wanted 8"));
    }
}

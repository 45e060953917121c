//! Target memory access and the per-object range cache.
//!
//! Everything the analyzer knows about the target it learns through `MemoryReader`.
//! The debugger backend supplies the root reader; `CachedMemory` layers a bounded,
//! lazily-filled range cache in front of it for the duration of one object scan.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, Result};

/// Maximum size of a cached range. Oversize requests bypass the cache entirely.
const CACHE_THRESHOLD: usize = 1024 * 1024 * 1024;

/// Read access to the target's address space.
///
/// Implementations must tolerate reads at the far ends of mapped regions: a partial
/// read returns the number of bytes actually copied, and an unmapped address returns
/// an error rather than panicking.
pub trait MemoryReader
{
    /// Read up to `buf.len()` bytes at `addr`, returning the number of bytes read.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// The uncached reader underneath this one, if this reader is a cache layer.
    fn base_memory(&self) -> Option<Memory>
    {
        None
    }

    /// Downcast hook used by `cache_memory` to avoid stacking caches.
    fn as_cache(&self) -> Option<&CachedMemory>
    {
        None
    }
}

/// Shared handle to a memory reader.
///
/// Readers are threaded through every variable and region by handle; `Rc` keeps the
/// clone cost of projection (`to_field`, `array_access`) at a refcount bump.
pub type Memory = Rc<dyn MemoryReader>;

/// A forward range cache over another reader.
///
/// The cached range is fixed at construction and loaded in one bulk read on first use.
/// Reads wholly inside the range are served from the buffer; everything else falls
/// through. Lifecycle: one cache per object elected for a full scan, dropped when the
/// walker finishes the object.
pub struct CachedMemory
{
    loaded: Cell<bool>,
    cache_addr: u64,
    cache: RefCell<Vec<u8>>,
    mem: Memory,
}

impl CachedMemory
{
    fn new(addr: u64, size: usize, mem: Memory) -> Self
    {
        CachedMemory {
            loaded: Cell::new(false),
            cache_addr: addr,
            cache: RefCell::new(vec![0u8; size]),
            mem,
        }
    }

    fn contains(&self, addr: u64, size: usize) -> bool
    {
        let Some(end) = addr.checked_add(size as u64) else {
            return false;
        };
        addr >= self.cache_addr && end <= self.cache_addr + self.cache.borrow().len() as u64
    }

    fn load(&self) -> Result<()>
    {
        if self.loaded.get() {
            return Ok(());
        }
        let mut cache = self.cache.borrow_mut();
        let wanted = cache.len();
        let got = self.mem.read_memory(self.cache_addr, &mut cache)?;
        if got < wanted {
            return Err(Error::ShortRead {
                addr: self.cache_addr,
                wanted,
                got,
            });
        }
        self.loaded.set(true);
        Ok(())
    }
}

impl MemoryReader for CachedMemory
{
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize>
    {
        if self.contains(addr, buf.len()) {
            self.load()?;
            let cache = self.cache.borrow();
            let start = (addr - self.cache_addr) as usize;
            buf.copy_from_slice(&cache[start..start + buf.len()]);
            return Ok(buf.len());
        }
        self.mem.read_memory(addr, buf)
    }

    fn base_memory(&self) -> Option<Memory>
    {
        Some(self.mem.clone())
    }

    fn as_cache(&self) -> Option<&CachedMemory>
    {
        Some(self)
    }
}

/// Wrap `mem` in a range cache covering `[addr, addr + size)`.
///
/// Degenerate requests (empty, overflowing, or larger than the threshold) return the
/// reader unchanged. If `mem` is already a cache containing the range, it is reused;
/// a cache that misses is rebuilt over its underlying reader so caches never stack.
pub fn cache_memory(mem: &Memory, addr: u64, size: usize) -> Memory
{
    if size == 0 || size > CACHE_THRESHOLD {
        return mem.clone();
    }
    if addr.checked_add(size as u64).is_none() {
        return mem.clone();
    }
    if let Some(cache) = mem.as_cache() {
        if cache.contains(addr, size) {
            return mem.clone();
        }
        return Rc::new(CachedMemory::new(addr, size, cache.mem.clone()));
    }
    Rc::new(CachedMemory::new(addr, size, mem.clone()))
}

/// The reader to use after following a pointer out of a cached object.
///
/// A pointee lives outside the current object's cached range, so dereference reads go
/// back to the underlying reader.
pub fn dereference_memory(mem: &Memory) -> Memory
{
    mem.base_memory().unwrap_or_else(|| mem.clone())
}

fn read_exact(mem: &Memory, addr: u64, buf: &mut [u8]) -> Result<()>
{
    let got = mem.read_memory(addr, buf)?;
    if got < buf.len() {
        return Err(Error::ShortRead {
            addr,
            wanted: buf.len(),
            got,
        });
    }
    Ok(())
}

/// Read a little-endian unsigned integer of 1, 2, 4 or 8 bytes.
pub fn read_uint_raw(mem: &Memory, addr: u64, size: usize) -> Result<u64>
{
    let mut buf = [0u8; 8];
    read_exact(mem, addr, &mut buf[..size])?;
    Ok(match size {
        1 => u64::from(buf[0]),
        2 => u64::from(u16::from_le_bytes([buf[0], buf[1]])),
        4 => u64::from(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
        _ => u64::from_le_bytes(buf),
    })
}

/// Read a little-endian signed integer of 1, 2, 4 or 8 bytes.
pub fn read_int_raw(mem: &Memory, addr: u64, size: usize) -> Result<i64>
{
    let raw = read_uint_raw(mem, addr, size)?;
    Ok(match size {
        1 => i64::from(raw as u8 as i8),
        2 => i64::from(raw as u16 as i16),
        4 => i64::from(raw as u32 as i32),
        _ => raw as i64,
    })
}

/// Bulk-read little-endian `u64` words into `out`.
pub fn read_uint64_array(mem: &Memory, addr: u64, out: &mut [u64]) -> Result<()>
{
    let mut buf = vec![0u8; out.len() * 8];
    read_exact(mem, addr, &mut buf)?;
    for (i, chunk) in buf.chunks_exact(8).enumerate() {
        out[i] = u64::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests
{
    use super::*;

    /// Flat test memory with a tracked read count.
    pub(crate) struct FlatMemory
    {
        pub base: u64,
        pub bytes: RefCell<Vec<u8>>,
        pub reads: Cell<usize>,
    }

    impl FlatMemory
    {
        pub fn new(base: u64, bytes: Vec<u8>) -> Rc<FlatMemory>
        {
            Rc::new(FlatMemory {
                base,
                bytes: RefCell::new(bytes),
                reads: Cell::new(0),
            })
        }
    }

    impl MemoryReader for FlatMemory
    {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize>
        {
            self.reads.set(self.reads.get() + 1);
            let bytes = self.bytes.borrow();
            if addr < self.base {
                return Err(Error::ReadMemory {
                    addr,
                    reason: "unmapped".to_string(),
                });
            }
            let start = (addr - self.base) as usize;
            if start >= bytes.len() {
                return Err(Error::ReadMemory {
                    addr,
                    reason: "unmapped".to_string(),
                });
            }
            let n = buf.len().min(bytes.len() - start);
            buf[..n].copy_from_slice(&bytes[start..start + n]);
            Ok(n)
        }
    }

    #[test]
    fn test_cache_serves_from_single_bulk_read()
    {
        let flat = FlatMemory::new(0x1000, (0..64u8).collect());
        let raw: Memory = flat.clone();
        let cached = cache_memory(&raw, 0x1000, 64);
        let mut buf = [0u8; 4];
        cached.read_memory(0x1010, &mut buf).unwrap();
        assert_eq!(buf, [16, 17, 18, 19]);
        cached.read_memory(0x1020, &mut buf).unwrap();
        assert_eq!(buf, [32, 33, 34, 35]);
        assert_eq!(flat.reads.get(), 1);
    }

    #[test]
    fn test_cache_miss_falls_through()
    {
        let raw: Memory = FlatMemory::new(0x1000, (0..64u8).collect());
        let cached = cache_memory(&raw, 0x1000, 16);
        let mut buf = [0u8; 4];
        cached.read_memory(0x1030, &mut buf).unwrap();
        assert_eq!(buf, [48, 49, 50, 51]);
    }

    #[test]
    fn test_oversize_request_bypasses()
    {
        let raw: Memory = FlatMemory::new(0x1000, vec![0u8; 8]);
        let cached = cache_memory(&raw, 0x1000, CACHE_THRESHOLD + 1);
        assert!(cached.as_cache().is_none());
    }

    #[test]
    fn test_caches_never_stack()
    {
        let raw: Memory = FlatMemory::new(0x1000, (0..128u8).collect());
        let first = cache_memory(&raw, 0x1000, 32);
        let second = cache_memory(&first, 0x1040, 32);
        // the second cache reads straight from the flat memory
        assert!(second.base_memory().unwrap().as_cache().is_none());
        // a contained range reuses the existing cache
        let reused = cache_memory(&first, 0x1008, 8);
        assert!(std::ptr::eq(
            reused.as_cache().unwrap() as *const _,
            first.as_cache().unwrap() as *const _
        ));
    }

    #[test]
    fn test_scalar_readers()
    {
        let raw: Memory = FlatMemory::new(0, vec![0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0x2a, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(read_uint_raw(&raw, 0, 4).unwrap(), 0xffff_ffff);
        assert_eq!(read_int_raw(&raw, 0, 4).unwrap(), -1);
        assert_eq!(read_uint_raw(&raw, 8, 8).unwrap(), 42);
        let mut words = [0u64; 2];
        read_uint64_array(&raw, 0, &mut words).unwrap();
        assert_eq!(words, [0xffff_ffff, 42]);
    }

    #[test]
    fn test_short_read_is_reported()
    {
        let raw: Memory = FlatMemory::new(0, vec![1, 2, 3]);
        let err = read_uint_raw(&raw, 0, 8).unwrap_err();
        assert!(matches!(err, Error::ShortRead { got: 3, .. }));
    }
}

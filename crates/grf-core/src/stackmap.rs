//! Stack pointer-map decoding.
//!
//! The runtime's PC tables (functab, pctab, stackmaps) tell the garbage collector which
//! stack words hold live pointers at a given PC. The root builder decodes the same
//! tables to derive one `FramePointerMask` per unwound frame, covering the frame's
//! locals and arguments relative to the frame pointer, using the architecture's frame
//! convention.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::bitmap;
use crate::gcmask::GcMaskIterator;
use crate::heap::{FramePointerMask, FuncExtra, HeapScope};
use crate::mem::{read_uint_raw, Memory};
use crate::region::Region;
use crate::target::{Architecture, FrameInfo};
use crate::types::{Address, RefType};

pub(crate) const PCDATA_STACK_MAP_INDEX: usize = 1;
pub(crate) const FUNCDATA_ARGS_POINTER_MAPS: usize = 0;
pub(crate) const FUNCDATA_LOCALS_POINTER_MAPS: usize = 1;
pub(crate) const FUNCDATA_STACK_OBJECTS: usize = 2;

/// A pctab sequence: maps an offset within a function to an int64 value.
#[derive(Default)]
pub struct PcTab
{
    entries: Vec<PcTabEntry>,
}

struct PcTabEntry
{
    /// Number of bytes this entry covers.
    bytes: i64,
    /// Value over that range of bytes.
    val: i64,
}

impl PcTab
{
    pub(crate) fn set_empty(&mut self)
    {
        self.entries = vec![PcTabEntry {
            bytes: i64::MAX,
            val: -1,
        }];
    }

    pub(crate) fn find(&self, mut off: i64) -> Option<i64>
    {
        for entry in &self.entries {
            if off < entry.bytes {
                return Some(entry.val);
            }
            off -= entry.bytes;
        }
        None
    }
}

/// Cached `moduledata.text` / `textsectmap` for entry-offset relocation.
pub struct TextCache
{
    text: u64,
    sections: Vec<TextSection>,
}

struct TextSection
{
    vaddr: u64,
    end: u64,
    baseaddr: u64,
}

fn pc_quantum(arch: &Architecture) -> i64
{
    match arch {
        Architecture::Amd64 => 1,
        Architecture::Arm64 => 4,
        Architecture::Other(_) => 1,
    }
}

/// Size of the fixed frame part below the frame pointer; `None` means the frame
/// convention of this architecture is unknown and stack roots cannot be derived.
fn min_frame_size(arch: &Architecture) -> Option<i64>
{
    match arch {
        Architecture::Amd64 => Some(0),
        Architecture::Arm64 => Some(8),
        Architecture::Other(_) => None,
    }
}

/// Read a runtime varint; returns `(value, bytes consumed)`.
fn read_varint(mem: &Memory, mut addr: u64) -> (i64, i64)
{
    let mut val: i64 = 0;
    let mut n: i64 = 0;
    loop {
        let Ok(byte) = read_uint_raw(mem, addr, 1) else {
            return (0, 0);
        };
        let byte = byte as u8;
        val |= i64::from(byte & 0x7f) << (n * 7);
        n += 1;
        addr += 1;
        if byte & 0x80 == 0 {
            return (val, n);
        }
    }
}

impl<'a> HeapScope<'a>
{
    /// Decode one module's functab, caching funcdata addresses and the stack-map pctab
    /// per function entry.
    pub(crate) fn read_func_tab(&mut self, md: &Region, func_typ: &std::sync::Arc<RefType>) -> crate::error::Result<()>
    {
        let pcln = md.field("pclntable")?;
        let pctab = md.field("pctab")?;
        let ftab = md.field("ftab")?;
        // last slot is a dummy, just holds entry
        let n = ftab.slice_len()? - 1;
        for i in 0..n {
            let ft = ftab.slice_index(i)?;
            let (entry, funcoff);
            if ft.has_field("entryoff") {
                entry = self.text_addr(md, ft.field("entryoff")?.uint_value()? as u32)?;
                funcoff = ft.field("funcoff")?.uint_value()? as i64;
            } else {
                // prior to 1.18, functab.entry directly referenced the entries
                entry = Address::new(ft.field("entry")?.uintptr()?);
                funcoff = ft.field("funcoff")?.uintptr()? as i64;
            }
            let Some(fun) = self.target.pc_to_func(entry.value()) else {
                continue;
            };
            let f = pcln.slice_index(funcoff)?.cast(func_typ.clone());
            match self.read_func(md, &f, &pctab) {
                Ok((funcdata, stack_map)) => {
                    let fe = self.func_extra.entry(fun.entry).or_insert_with(FuncExtra::default);
                    fe.funcdata = funcdata;
                    fe.stack_map = stack_map;
                }
                Err(err) => {
                    error!("decoding runtime._func for {}: {err}", fun.name);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Parse pcdata and funcdata, which are laid out beyond the end of the `_func`.
    fn read_func(&self, md: &Region, f: &Region, pctab: &Region) -> crate::error::Result<(Vec<Address>, PcTab)>
    {
        let nfd = f.field("nfuncdata")?;
        let nfdv = nfd.uint_value()? as u32;
        let mut a = nfd.addr().add_signed(nfd.typ().size);

        let npcdata = f.field("npcdata")?.uint_value()? as u32;
        let mut pcdata = Vec::with_capacity(npcdata as usize);
        for _ in 0..npcdata {
            pcdata.push(read_uint_raw(&self.mem, a.value(), 4)? as u32);
            a = a + 4;
        }

        let is_118_or_greater = md.has_field("gofunc");
        if !is_118_or_greater {
            // since 1.18, funcdata no longer needs to be aligned
            a = a.align(8);
        }
        let go_func_ptr = if is_118_or_greater {
            md.field("gofunc")?.uintptr()?
        } else {
            0
        };

        let mut funcdata = Vec::with_capacity(nfdv as usize);
        for _ in 0..nfdv {
            if is_118_or_greater {
                // since 1.18, funcdata contains offsets from go:func.*
                let off = read_uint_raw(&self.mem, a.value(), 4)? as u32;
                if off == u32::MAX {
                    // no entry
                    funcdata.push(Address::NULL);
                } else {
                    funcdata.push(Address::new(go_func_ptr + u64::from(off)));
                }
                a = a + 4;
            } else {
                // prior to 1.18, funcdata contains pointers directly to the data
                funcdata.push(Address::new(read_uint_raw(&self.mem, a.value(), 8)?));
                a = a + 8;
            }
        }

        let mut stack_map = PcTab::default();
        if pcdata.len() > PCDATA_STACK_MAP_INDEX {
            self.read_pc_tab(&mut stack_map, pctab.slice_index(i64::from(pcdata[PCDATA_STACK_MAP_INDEX]))?.addr());
        } else {
            stack_map.set_empty();
        }
        Ok((funcdata, stack_map))
    }

    /// Resolve a text offset to an address, honoring `textsectmap` relocation.
    ///
    /// Equivalent to `runtime.moduledata.textAddr`.
    fn text_addr(&mut self, md: &Region, off32: u32) -> crate::error::Result<Address>
    {
        if self.text_cache.is_none() {
            let text = md.field("text")?.uintptr()?;
            let textsectmap = md.field("textsectmap")?;
            let length = textsectmap.slice_len()?;
            let mut sections = Vec::with_capacity(length as usize);
            for i in 0..length {
                let sect = textsectmap.slice_index(i)?;
                sections.push(TextSection {
                    vaddr: sect.field("vaddr")?.uintptr()?,
                    end: sect.field("end")?.uintptr()?,
                    baseaddr: sect.field("baseaddr")?.uintptr()?,
                });
            }
            self.text_cache = Some(TextCache { text, sections });
        }
        let cache = self.text_cache.as_ref().unwrap();
        let off = u64::from(off32);
        let mut res = cache.text + off;
        if cache.sections.len() > 1 {
            for (i, sect) in cache.sections.iter().enumerate() {
                if off >= sect.vaddr && off < sect.end || (i == cache.sections.len() - 1 && off == sect.end) {
                    res = sect.baseaddr + off - sect.vaddr;
                }
            }
        }
        Ok(Address::new(res))
    }

    /// Decode a pctab sequence starting at `data`: zig-zag varint value deltas paired
    /// with PC advance counts in units of the architecture's PC quantum.
    fn read_pc_tab(&self, tab: &mut PcTab, data: Address)
    {
        let quantum = pc_quantum(&self.target.architecture());
        let mut data = data;
        let mut val: i64 = -1;
        let mut first = true;
        loop {
            let (v, n) = read_varint(&self.mem, data.value());
            if v == 0 && !first {
                return;
            }
            if n == 0 {
                return;
            }
            data = data.add_signed(n);
            if v & 1 != 0 {
                val += !(v >> 1);
            } else {
                val += v >> 1;
            }

            let (v, n) = read_varint(&self.mem, data.value());
            data = data.add_signed(n);
            tab.entries.push(PcTabEntry {
                bytes: v * quantum,
                val,
            });
            first = false;
        }
    }

    /// Derive the per-frame pointer masks for one unwound task stack.
    ///
    /// Frames without func data are silently skipped. On architectures without a known
    /// frame convention this reports the coverage gap and returns no masks.
    pub(crate) fn stack_ptr_mask(&self, frames: &[FrameInfo]) -> Vec<FramePointerMask>
    {
        let stkmap_typ = match self.target.find_type("runtime.stackmap") {
            Ok(Some(typ)) => typ,
            _ => {
                error!("stack scan: cannot resolve type runtime.stackmap");
                return Vec::new();
            }
        };
        let arch = self.target.architecture();
        let mut masks: Vec<FramePointerMask> = Vec::new();
        for frame in frames {
            let Some(fun) = &frame.func else {
                continue;
            };
            let sp = Address::new(frame.sp);
            let fp = Address::new(frame.frame_base);
            let off = frame.pc as i64 - fun.entry as i64;
            let Some(fe) = self.func_extra.get(&fun.entry) else {
                continue;
            };
            if fe.funcdata.is_empty() {
                continue;
            }
            for pm in [FUNCDATA_LOCALS_POINTER_MAPS, FUNCDATA_ARGS_POINTER_MAPS] {
                let Some(&addr) = fe.funcdata.get(pm) else {
                    continue;
                };
                if addr.is_null() {
                    continue;
                }
                let vars = Region::new(addr, stkmap_typ.clone(), self.mem.clone());
                let (n, nbit) = match (
                    vars.field("n").and_then(|r| r.int_value()),
                    vars.field("nbit").and_then(|r| r.int_value()),
                ) {
                    (Ok(n), Ok(nbit)) => (n, nbit),
                    _ => continue,
                };
                if nbit == 0 {
                    continue;
                }
                let Some(idx) = fe.stack_map.find(off) else {
                    debug!("cannot read stack map at pc={:#x}", frame.pc);
                    continue;
                };
                let idx = idx.max(0);
                if idx >= n {
                    continue;
                }
                let bits = match vars.field("bytedata") {
                    Ok(bytedata) => bytedata.addr().add_signed((nbit + 7) / 8 * idx),
                    Err(_) => continue,
                };
                let base = if pm == FUNCDATA_LOCALS_POINTER_MAPS {
                    locals_offset(&arch, fp, sp, nbit)
                } else {
                    args_offset(&arch, fp)
                };
                let Some(base) = base else {
                    warn!(
                        "stack pointer masks are not supported on {}; stack-root coverage is dropped",
                        arch.name()
                    );
                    return Vec::new();
                };
                let mut words = vec![0u64; bitmap::ceil_divide(nbit, 64) as usize];
                let mut data = vec![0u8; bitmap::ceil_divide(nbit, 8) as usize];
                match self.mem.read_memory(bits.value(), &mut data) {
                    Ok(got) if got == data.len() => {}
                    _ => {
                        debug!("cannot read stack map bytedata at pc={:#x}", frame.pc);
                        continue;
                    }
                }
                bitmap::expand_byte_mask(&mut words, &data);
                masks.push(FramePointerMask {
                    func_name: fun.name.clone(),
                    iter: GcMaskIterator::new(
                        base,
                        base.add_signed(nbit * 8),
                        base,
                        Rc::new(RefCell::new(words)),
                    ),
                });
            }
            // stack-object records: enumerated for completeness; locals/args masks plus
            // the final-mark pass account for what they would cover
            if let Some(&addr) = fe.funcdata.get(FUNCDATA_STACK_OBJECTS) {
                if !addr.is_null() {
                    if let Ok(n) = read_uint_raw(&self.mem, addr.value(), 8) {
                        debug!("{} stack object records at pc={:#x}", n, frame.pc);
                    }
                }
            }
        }
        masks.sort_by_key(|mask| mask.iter.base());
        masks
    }
}

/// Start of the locals pointer map relative to the frame, per the architecture's frame
/// convention (see the runtime's traceback scanning).
fn locals_offset(arch: &Architecture, fp: Address, sp: Address, nbit: i64) -> Option<Address>
{
    let min_frame = min_frame_size(arch)?;
    let mut fp = fp;
    if min_frame == 0 {
        // on x86, the call instruction pushes the return PC before entering the function
        fp = fp - 8;
    }
    if fp > sp {
        fp = fp - 8;
    }
    Some(fp.add_signed(-nbit * 8))
}

/// Start of the arguments pointer map relative to the frame.
fn args_offset(arch: &Architecture, fp: Address) -> Option<Address>
{
    let min_frame = min_frame_size(arch)?;
    Some(fp.add_signed(min_frame))
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::mem::tests::FlatMemory;

    #[test]
    fn test_pc_tab_find()
    {
        let mut tab = PcTab::default();
        tab.entries = vec![
            PcTabEntry { bytes: 16, val: 3 },
            PcTabEntry { bytes: 32, val: 7 },
        ];
        assert_eq!(tab.find(0), Some(3));
        assert_eq!(tab.find(15), Some(3));
        assert_eq!(tab.find(16), Some(7));
        assert_eq!(tab.find(47), Some(7));
        assert_eq!(tab.find(48), None);

        let mut empty = PcTab::default();
        empty.set_empty();
        assert_eq!(empty.find(1 << 40), Some(-1));
    }

    #[test]
    fn test_read_varint()
    {
        let mem: Memory = FlatMemory::new(0, vec![0x05, 0x80, 0x01, 0xff, 0x7f]);
        assert_eq!(read_varint(&mem, 0), (5, 1));
        assert_eq!(read_varint(&mem, 1), (128, 2));
        assert_eq!(read_varint(&mem, 3), (16383, 2));
    }

    #[test]
    fn test_frame_offsets_per_architecture()
    {
        let fp = Address::new(0x7000);
        let sp = Address::new(0x6fe0);
        // amd64: return PC slot below fp, then the mask
        let base = locals_offset(&Architecture::Amd64, fp, sp, 2).unwrap();
        assert_eq!(base, Address::new(0x7000 - 8 - 8 - 16));
        assert_eq!(args_offset(&Architecture::Amd64, fp).unwrap(), fp);
        // arm64 keeps a fixed frame slot
        assert_eq!(args_offset(&Architecture::Arm64, fp).unwrap(), fp + 8);
        assert!(locals_offset(&Architecture::Other("riscv64".to_string()), fp, sp, 2).is_none());
    }
}

//! # Span and Arena Index
//!
//! Reconstruction of the target runtime's heap layout inside the analyzer's own address
//! space: the span table, the two-level arena map that resolves arbitrary addresses to
//! spans, per-span visit and pointer masks, data/bss segments, and the finalizer/cleanup
//! special records attached to spans.
//!
//! The pointer bitmap exists in three dialects across runtime releases, detected by
//! structural probing of the `heapArena` type rather than version gating:
//!
//! - **multi-bit bitmap**: 2 bits per pointer word, 4 pointer words per byte
//! - **one-bit bitmap**: 1 bit per pointer word
//! - **no bitmap**: allocation headers in-object; pointer masks are expanded lazily from
//!   per-object type descriptors on first touch (`copy_gc_mask`)

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, error};

use crate::bitmap;
use crate::error::{Error, Result};
use crate::gcmask::{new_mask, GcMaskIterator, MaskWords};
use crate::mem::{cache_memory, read_uint64_array, read_uint_raw, Memory};
use crate::region::Region;
use crate::target::Target;
use crate::types::{Address, RefType};

/// Offsets inside the runtime's `abi.Type` descriptor. Layout is stable across the
/// releases that use allocation headers.
const TYPE_SIZE_OFFSET: i64 = 0;
const TYPE_PTR_BYTES_OFFSET: i64 = 8;
const TYPE_GC_DATA_OFFSET: i64 = 32;

/// A span's size class plus its noscan flag, packed the way the runtime packs them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanClass(pub u8);

impl SpanClass
{
    /// Spans of pointer-free objects; skipped entirely during scanning.
    pub fn noscan(self) -> bool
    {
        self.0 & 1 != 0
    }

    /// Size class 0 means a large (single-object) span.
    pub fn sizeclass(self) -> i8
    {
        (self.0 >> 1) as i8
    }
}

/// Everything the analyzer keeps per in-use span.
pub struct SpanInfo
{
    /// Start address of the span.
    pub base: Address,
    /// Size of objects in the span.
    pub elem_size: i64,
    /// Size of the span.
    pub span_size: i64,

    /// One visit bit per 8-byte word; set when the word has been walked as an object base.
    visit_mask: RefCell<Vec<u64>>,
    /// One pointer bit per 8-byte word; consumed by the walker as pointers are classified.
    pub ptr_mask: MaskWords,

    span_class: Cell<SpanClass>,
    /// For size-class-0 spans under allocation-header runtimes: the per-object type
    /// descriptor shared by the whole span.
    large_type_addr: Cell<u64>,
}

impl SpanInfo
{
    fn new(base: Address, elem_size: i64, span_size: i64) -> Rc<SpanInfo>
    {
        Rc::new(SpanInfo {
            base,
            elem_size,
            span_size,
            visit_mask: RefCell::new(vec![0; bitmap::mask_words(span_size)]),
            ptr_mask: new_mask(span_size),
            span_class: Cell::new(SpanClass::default()),
            large_type_addr: Cell::new(0),
        })
    }

    /// Mark the object base as visited; returns true iff it was not marked before.
    pub fn mark(&self, addr: Address) -> bool
    {
        let offset = addr.offset_from(self.base);
        !bitmap::test_and_set(&mut self.visit_mask.borrow_mut(), (offset / 8) as usize)
    }

    /// End of the object starting at `base`, clipped to the span.
    pub fn elem_end(&self, base: Address) -> Address
    {
        let end = base.add_signed(self.elem_size);
        let span_end = self.base.add_signed(self.span_size);
        if end > span_end {
            span_end
        } else {
            end
        }
    }

    pub fn span_class(&self) -> SpanClass
    {
        self.span_class.get()
    }

    /// Heap-bits iterator over one object's window of this span's pointer mask.
    pub fn heap_bits(&self, base: Address, end: Address) -> GcMaskIterator
    {
        GcMaskIterator::new(base, end, self.base, self.ptr_mask.clone())
    }
}

/// A contiguous root region: one data or bss range, or one task stack.
pub struct Segment
{
    pub start: Address,
    pub end: Address,
    visit_mask: RefCell<Vec<u64>>,
    ptr_mask: MaskWords,
}

impl Segment
{
    pub fn new(start: Address, end: Address, ptr_words: Vec<u64>) -> Segment
    {
        let size = end.offset_from(start);
        Segment {
            start,
            end,
            visit_mask: RefCell::new(vec![0; bitmap::mask_words(size)]),
            ptr_mask: Rc::new(RefCell::new(ptr_words)),
        }
    }

    /// Mark the slot holding `addr`; false when outside the segment or already marked.
    pub fn mark(&self, addr: Address) -> bool
    {
        if addr < self.start || addr >= self.end {
            return false;
        }
        let offset = addr.offset_from(self.start);
        !bitmap::test_and_set(&mut self.visit_mask.borrow_mut(), (offset / 8) as usize)
    }

    /// Iterator over the segment's residual pointer bits.
    pub fn ptr_iter(&self) -> GcMaskIterator
    {
        GcMaskIterator::new(self.start, self.end, self.start, self.ptr_mask.clone())
    }
}

/// Mark `addr` in whichever segment contains it.
pub fn mark_segments<'a>(segments: &'a [Segment], addr: Address) -> Option<&'a Segment>
{
    segments.iter().find(|seg| seg.mark(addr))
}

/// Pointer mask covering one sub-range of a task stack, derived from the function's
/// stack maps at the frame's PC.
pub struct FramePointerMask
{
    pub func_name: String,
    pub iter: GcMaskIterator,
}

/// A task stack: a root segment plus its per-frame pointer masks.
pub struct StackRoot
{
    pub segment: Segment,
    pub frames: Vec<FramePointerMask>,
}

/// Finalizer special: the finalized object and the address of the finalizer `fn` slot.
pub struct Finalizer
{
    pub obj: Address,
    pub fn_addr: Address,
}

/// Cleanup special: the address of the cleanup `fn` slot.
pub struct Cleanup
{
    pub fn_addr: Address,
}

/// Per-function state accumulated while decoding the runtime's PC tables.
#[derive(Default)]
pub struct FuncExtra
{
    pub funcdata: Vec<Address>,
    pub stack_map: crate::stackmap::PcTab,
    pub closure_struct: Option<std::sync::Arc<RefType>>,
}

enum BitmapDialect
{
    OneBit,
    OneBitPtrScalar,
    MultiBit,
}

type ArenaPages = Vec<Option<Rc<SpanInfo>>>;
type ArenaL2 = Vec<Option<Box<ArenaPages>>>;

/// The reconstructed heap of one target, valid for one scan.
pub struct HeapScope<'a>
{
    pub target: &'a dyn Target,
    pub mem: Memory,

    // runtime constants
    pub(crate) page_size: i64,
    heap_arena_bytes: i64,
    pages_per_arena: i64,
    arena_l1_bits: i64,
    arena_l2_bits: i64,
    arena_base_offset: i64,
    min_size_for_malloc_header: i64,
    enable_alloc_header: bool,

    arena_info: Vec<Option<Box<ArenaL2>>>,

    pub data: Vec<Segment>,
    pub bss: Vec<Segment>,
    pub finalizers: Vec<Finalizer>,
    pub cleanups: Vec<Cleanup>,

    pub(crate) func_extra: HashMap<u64, FuncExtra>,
    pub(crate) text_cache: Option<crate::stackmap::TextCache>,
}

impl<'a> HeapScope<'a>
{
    pub fn new(target: &'a dyn Target) -> HeapScope<'a>
    {
        HeapScope {
            target,
            mem: target.memory(),
            page_size: 0,
            heap_arena_bytes: 0,
            pages_per_arena: 0,
            arena_l1_bits: 0,
            arena_l2_bits: 0,
            arena_base_offset: 0,
            min_size_for_malloc_header: 0,
            enable_alloc_header: false,
            arena_info: Vec::new(),
            data: Vec::new(),
            bss: Vec::new(),
            finalizers: Vec::new(),
            cleanups: Vec::new(),
            func_extra: HashMap::new(),
            text_cache: None,
        }
    }

    fn rt_constant(&self, name: &str) -> i64
    {
        match self.target.runtime_constant(name) {
            Ok(Some(value)) => value,
            Ok(None) => 0,
            Err(err) => {
                debug!("runtime constant {name}: {err}");
                0
            }
        }
    }

    fn runtime_region(&self, name: &str) -> Result<Region>
    {
        let (addr, typ) = self
            .target
            .runtime_global(name)?
            .ok_or_else(|| Error::Init(format!("cannot locate {name} in the target")))?;
        Ok(Region::new(addr, typ, self.mem.clone()))
    }

    /// Rebuild the span table, arena index, segments and specials from the target.
    pub fn read_heap(&mut self) -> Result<()>
    {
        let mheap = self.runtime_region("runtime.mheap_")?;

        self.page_size = self.rt_constant("_PageSize");
        let mut span_in_use = self.rt_constant("_MSpanInUse") as u8;
        if span_in_use == 0 {
            span_in_use = self.rt_constant("mSpanInUse") as u8;
        }
        self.heap_arena_bytes = self.rt_constant("heapArenaBytes");
        if self.page_size == 0 || self.heap_arena_bytes == 0 {
            return Err(Error::Init("runtime heap constants are missing".to_string()));
        }
        self.pages_per_arena = self.heap_arena_bytes / self.page_size;
        let kind_finalizer = self.rt_constant("_KindSpecialFinalizer") as u8;
        let kind_cleanup = self.rt_constant("_KindSpecialCleanup") as u8;
        self.arena_base_offset = -self.rt_constant("arenaBaseOffsetUintptr");
        self.arena_l1_bits = self.rt_constant("arenaL1Bits");
        self.arena_l2_bits = self.rt_constant("arenaL2Bits");
        self.min_size_for_malloc_header = self.rt_constant("minSizeForMallocHeader");

        let spans = self.read_all_spans(&mheap.field("allspans")?, span_in_use, kind_finalizer, kind_cleanup)?;

        if !self.read_arenas(&mheap)? {
            // allocation headers: defer pointer masks to first object touch
            self.read_type_pointers(&spans);
        }

        self.read_module_data()
    }

    fn read_all_spans(
        &mut self,
        allspans: &Region,
        span_in_use: u8,
        kind_finalizer: u8,
        kind_cleanup: u8,
    ) -> Result<Vec<(Region, Rc<SpanInfo>)>>
    {
        let mut spans = Vec::new();
        let n = allspans.slice_len()?;
        for i in 0..n {
            match self.read_span(allspans, i, span_in_use, kind_finalizer, kind_cleanup) {
                Ok(Some(entry)) => spans.push(entry),
                Ok(None) => {}
                Err(err) => debug!("span {i}: {err}"),
            }
        }
        Ok(spans)
    }

    fn read_span(
        &mut self,
        allspans: &Region,
        i: i64,
        span_in_use: u8,
        kind_finalizer: u8,
        kind_cleanup: u8,
    ) -> Result<Option<(Region, Rc<SpanInfo>)>>
    {
        let sp = allspans.slice_index(i)?.deref()?;
        let base = Address::new(sp.field("startAddr")?.uintptr()?);
        let elem_size = sp.field("elemsize")?.uintptr()? as i64;
        let span_size = sp.field("npages")?.uintptr()? as i64 * self.page_size;
        let mut state = sp.field("state")?;
        if state.is_struct() && state.has_field("s") {
            state = state.field("s")?;
        }
        if state.is_struct() && state.has_field("value") {
            state = state.field("value")?;
        }
        if state.uint_value()? as u8 != span_in_use {
            return Ok(None);
        }
        if elem_size <= 0 || span_size <= 0 {
            return Ok(None);
        }
        let spi = SpanInfo::new(base, elem_size, span_size);
        let max = base.add_signed(span_size);
        let mut addr = base;
        while addr < max {
            self.alloc_span(addr, &spi);
            addr = addr.add_signed(self.page_size);
        }
        if let Err(err) = self.add_specials(&sp, &spi, kind_finalizer, kind_cleanup) {
            error!("reading span specials: {err}");
        }
        Ok(Some((sp, spi)))
    }

    fn heap_bits_in_span(&self, elem_size: i64) -> bool
    {
        elem_size <= self.min_size_for_malloc_header
    }

    /// Populate span classes and, where possible, in-span pointer bitmaps for
    /// allocation-header runtimes.
    fn read_type_pointers(&mut self, spans: &[(Region, Rc<SpanInfo>)])
    {
        for (sp, spi) in spans {
            let class = match sp.field("spanclass").and_then(|r| r.uint_value()) {
                Ok(value) => SpanClass(value as u8),
                Err(err) => {
                    debug!("span class: {err}");
                    continue;
                }
            };
            spi.span_class.set(class);
            if class.noscan() {
                continue;
            }
            if self.heap_bits_in_span(spi.elem_size) {
                // the bitmap lives at the tail of the span itself
                let bitmap_size = spi.span_size / 8 / 8;
                let addr = spi.base.add_signed(spi.span_size - bitmap_size);
                let mut words = spi.ptr_mask.borrow_mut();
                if let Err(err) = read_uint64_array(&self.mem, addr.value(), &mut words) {
                    debug!("in-span heap bits at {addr}: {err}");
                }
                continue;
            }
            if class.sizeclass() == 0 {
                if let Ok(large) = sp.field("largeType") {
                    if let Ok(addr) = large.uintptr() {
                        spi.large_type_addr.set(addr);
                    }
                }
            }
        }
    }

    /// Walk the arena table, decoding the pointer bitmap dialect detected on the first
    /// populated arena. Returns false when the runtime stores allocation headers
    /// instead of arena bitmaps.
    fn read_arenas(&mut self, mheap: &Region) -> Result<bool>
    {
        let level1 = mheap.field("arenas")?;
        let level1_size = level1.array_len();
        let mut dialect: Option<BitmapDialect> = None;
        for l1 in 0..level1_size {
            let entry = level1.array_index(l1)?;
            if entry.uintptr()? == 0 {
                continue;
            }
            let level2 = entry.deref()?;
            let level2_size = level2.array_len();
            for l2 in 0..level2_size {
                let entry = level2.array_index(l2)?;
                if entry.uintptr()? == 0 {
                    continue;
                }
                let arena = entry.deref()?;
                let min = Address::new((self.heap_arena_bytes * (l2 + l1 * level2_size) - self.arena_base_offset) as u64);
                if dialect.is_none() {
                    match Self::probe_bitmap_dialect(&arena) {
                        Some(found) => dialect = Some(found),
                        None => {
                            self.enable_alloc_header = true;
                            return Ok(false);
                        }
                    }
                }
                match dialect.as_ref().unwrap() {
                    BitmapDialect::OneBit => self.read_one_bit_bitmap(&arena.field("bitmap")?, min)?,
                    BitmapDialect::OneBitPtrScalar => {
                        self.read_one_bit_bitmap(&arena.field("heapArenaPtrScalar")?.field("bitmap")?, min)?
                    }
                    BitmapDialect::MultiBit => self.read_multi_bit_bitmap(&arena.field("bitmap")?, min)?,
                }
            }
        }
        Ok(true)
    }

    fn probe_bitmap_dialect(arena: &Region) -> Option<BitmapDialect>
    {
        if arena.has_field("bitmap") {
            if arena.has_field("noMorePtrs") {
                return Some(BitmapDialect::OneBit);
            }
            return Some(BitmapDialect::MultiBit);
        }
        if let Ok(inner) = arena.field("heapArenaPtrScalar") {
            if inner.has_field("bitmap") {
                return Some(BitmapDialect::OneBitPtrScalar);
            }
        }
        None
    }

    /// One bit per pointer word.
    fn read_one_bit_bitmap(&mut self, bitmap: &Region, min: Address) -> Result<()>
    {
        let n = bitmap.array_len();
        for i in 0..n {
            let mut word = bitmap.array_index(i)?.uintptr()?;
            let mut j = i64::from(word.trailing_zeros());
            while j < 64 {
                self.set_heap_ptr(min.add_signed((i * 64 + j) * 8));
                word &= !(1 << j);
                j = i64::from(word.trailing_zeros());
            }
        }
        Ok(())
    }

    /// Two bits per pointer word, four pointer words per byte; only the low pointer/scalar
    /// bit of each pair matters here.
    fn read_multi_bit_bitmap(&mut self, bitmap: &Region, min: Address) -> Result<()>
    {
        let ptr_size = self.target.architecture().ptr_size();
        let n = bitmap.array_len();
        for i in 0..n {
            let byte = bitmap.array_index(i)?.uint_value()? as u8;
            for j in 0..4 {
                if byte >> j & 1 != 0 {
                    self.set_heap_ptr(min.add_signed((i * 4 + i64::from(j)) * ptr_size));
                }
            }
        }
        Ok(())
    }

    /// On first touch of an object in an allocation-header span, expand the object's
    /// type descriptor bitmap into the span's pointer mask and return the base of the
    /// object's payload (past the 8-byte header for normal size classes).
    pub fn copy_gc_mask(&self, sp: &Rc<SpanInfo>, base: Address) -> Address
    {
        if !self.enable_alloc_header {
            return base;
        }
        if sp.span_class().noscan() {
            return base;
        }
        if self.heap_bits_in_span(sp.elem_size) {
            return base;
        }
        if sp.span_class().sizeclass() != 0 {
            // type descriptor in the 8-byte allocation header
            let Ok(type_addr) = read_uint_raw(&self.mem, base.value(), 8) else {
                return base + 8;
            };
            self.read_type(sp, Address::new(type_addr), base + 8, sp.elem_end(base));
            base + 8
        } else {
            self.read_type(sp, Address::new(sp.large_type_addr.get()), base, sp.elem_end(base));
            base
        }
    }

    /// Expand a type descriptor's packed GC bitmap over `[addr, end)`, replicating the
    /// pattern per element when the object is a homogeneous array and honoring the
    /// type's PtrBytes (no pointers past that offset).
    fn read_type(&self, sp: &Rc<SpanInfo>, type_addr: Address, addr: Address, end: Address)
    {
        let mem = cache_memory(&self.mem, type_addr.value(), (TYPE_GC_DATA_OFFSET + 8) as usize);
        let type_size = match read_uint_raw(&mem, type_addr.add_signed(TYPE_SIZE_OFFSET).value(), 8) {
            Ok(size) if size > 0 => size as i64,
            _ => return,
        };
        let ptr_bytes = match read_uint_raw(&mem, type_addr.add_signed(TYPE_PTR_BYTES_OFFSET).value(), 8) {
            Ok(bytes) if bytes > 0 => bytes as i64,
            _ => return,
        };
        let gc_data_addr = match read_uint_raw(&mem, type_addr.add_signed(TYPE_GC_DATA_OFFSET).value(), 8) {
            Ok(data) => Address::new(data),
            Err(_) => return,
        };
        let mask_len = bitmap::ceil_divide(ptr_bytes, 512) * 512 / 64;
        let gc_mem = cache_memory(&self.mem, gc_data_addr.value(), mask_len as usize);

        let mut ptr_mask = sp.ptr_mask.borrow_mut();
        let mut elem = addr;
        let mut addr = addr;
        loop {
            if addr >= elem.add_signed(ptr_bytes) {
                // No more ptrs, copy the next element.
                // Maybe overflow beyond the real object, but doesn't affect the correctness.
                elem = elem.add_signed(type_size);
                addr = elem;
            }
            if addr >= end {
                break;
            }
            let mut mask = match read_uint_raw(&gc_mem, gc_data_addr.add_signed(addr.offset_from(elem) / 64).value(), 8) {
                Ok(mask) => mask,
                Err(err) => {
                    error!("read gc data addr error: {err}");
                    break;
                }
            };
            if addr.add_signed(8 * 64) > end {
                let head_bits = end.offset_from(addr) / 8;
                if head_bits < 64 {
                    mask &= (1u64 << head_bits) - 1;
                }
            }
            let offset = addr.offset_from(sp.base);
            let idx = (offset / 8 / 64) as usize;
            let bit = (offset / 8 % 64) as u32;
            if idx >= ptr_mask.len() {
                break;
            }
            ptr_mask[idx] |= mask << bit;
            if bit > 0 && idx + 1 < ptr_mask.len() {
                // carry the mask tail into the next word
                ptr_mask[idx + 1] |= mask >> (64 - bit);
            }
            addr = addr.add_signed(8 * 64);
        }
    }

    fn indexes(&self, addr: Address) -> (usize, usize, usize)
    {
        let (l1, l2);
        let ri = self.arena_index(addr);
        if self.arena_l1_bits == 0 {
            l1 = 0;
            l2 = ri;
        } else {
            l1 = ri >> self.arena_l2_bits;
            l2 = ri & ((1u64 << self.arena_l2_bits) - 1);
        }
        let idx = (addr.value() / self.page_size as u64) % self.pages_per_arena as u64;
        (l1 as usize, l2 as usize, idx as usize)
    }

    fn arena_index(&self, addr: Address) -> u64
    {
        addr.value().wrapping_add(self.arena_base_offset as u64) / self.heap_arena_bytes as u64
    }

    fn alloc_span(&mut self, addr: Address, sp: &Rc<SpanInfo>)
    {
        let (l1, l2, idx) = self.indexes(addr);
        let l2_len = 1usize << self.arena_l2_bits;
        let pages_per_arena = self.pages_per_arena as usize;
        if self.arena_info.is_empty() {
            self.arena_info = (0..1u64 << self.arena_l1_bits).map(|_| None).collect();
        }
        if l1 >= self.arena_info.len() {
            return;
        }
        let l1_info = self.arena_info[l1].get_or_insert_with(|| Box::new((0..l2_len).map(|_| None).collect()));
        if l2 >= l1_info.len() {
            return;
        }
        let arena = l1_info[l2].get_or_insert_with(|| Box::new(vec![None; pages_per_arena]));
        if idx >= arena.len() {
            return;
        }
        if arena[idx].is_none() {
            arena[idx] = Some(sp.clone());
        }
    }

    /// O(1) three-level lookup of the span containing `addr`.
    pub fn span_of(&self, addr: Address) -> Option<Rc<SpanInfo>>
    {
        let (l1, l2, idx) = self.indexes(addr);
        self.arena_info
            .get(l1)?
            .as_ref()?
            .get(l2)?
            .as_ref()?
            .get(idx)?
            .clone()
    }

    /// The span containing `addr` plus the base address of the object holding it.
    pub fn find_span_and_base(&self, addr: Address) -> Option<(Rc<SpanInfo>, Address)>
    {
        let sp = self.span_of(addr)?;
        let offset = addr.offset_from(sp.base);
        let base = sp.base.add_signed(offset / sp.elem_size * sp.elem_size);
        Some((sp, base))
    }

    fn set_heap_ptr(&mut self, addr: Address)
    {
        let Some(sp) = self.span_of(addr) else {
            return;
        };
        let offset = addr.offset_from(sp.base);
        bitmap::set_bit(&mut sp.ptr_mask.borrow_mut(), (offset / 8) as usize);
    }

    /// Walk the module descriptor list, recording data/bss segments (with their GC
    /// pointer masks) and decoding the PC tables for stack maps.
    fn read_module_data(&mut self) -> Result<()>
    {
        let firstmoduledata = self.runtime_region("runtime.firstmoduledata")?;
        let func_typ = self.target.find_type("runtime._func")?;
        let mut md = firstmoduledata;
        loop {
            let data_start = Address::new(md.field("data")?.uintptr()?);
            let data_end = Address::new(md.field("edata")?.uintptr()?);
            let bss_start = Address::new(md.field("bss")?.uintptr()?);
            let bss_end = Address::new(md.field("ebss")?.uintptr()?);
            let data_ptrs = self.read_bitvector(&md, "gcdatamask", data_end.offset_from(data_start));
            let bss_ptrs = self.read_bitvector(&md, "gcbssmask", bss_end.offset_from(bss_start));
            self.data.push(Segment::new(data_start, data_end, data_ptrs));
            self.bss.push(Segment::new(bss_start, bss_end, bss_ptrs));

            if let Some(func_typ) = &func_typ {
                if let Err(err) = self.read_func_tab(&md, func_typ) {
                    debug!("functab for module at {}: {err}", md.addr());
                }
            }

            let next = md.field("next")?;
            if next.uintptr()? == 0 {
                return Ok(());
            }
            md = next.deref()?;
        }
    }

    /// Decode a `runtime.bitvector` into packed mask words sized for `size` bytes.
    fn read_bitvector(&self, md: &Region, field: &str, size: i64) -> Vec<u64>
    {
        let mut words = vec![0u64; bitmap::mask_words(size)];
        if let Err(err) = self.decode_bitvector(md, field, &mut words) {
            debug!("{field}: {err}");
        }
        words
    }

    fn decode_bitvector(&self, md: &Region, field: &str, words: &mut [u64]) -> Result<()>
    {
        let bv = md.field(field)?;
        let n = bv.field("n")?.int_value()?;
        if n <= 0 {
            return Ok(());
        }
        let bytedata = bv.field("bytedata")?.uintptr()?;
        let mut bytes = vec![0u8; bitmap::ceil_divide(n, 8) as usize];
        let got = self.mem.read_memory(bytedata, &mut bytes)?;
        bytes.truncate(got);
        bitmap::expand_byte_mask(words, &bytes);
        Ok(())
    }

    fn add_specials(&mut self, sp: &Region, spi: &Rc<SpanInfo>, kind_finalizer: u8, kind_cleanup: u8) -> Result<()>
    {
        let finalizer_typ = self.target.find_type("runtime.specialfinalizer")?;
        let cleanup_typ = self.target.find_type("runtime.specialCleanup")?;
        let mut link = sp.field("specials")?;
        loop {
            let ptr = link.uintptr()?;
            if ptr == 0 {
                return Ok(());
            }
            let special = link.deref()?;
            let kind = special.field("kind")?.uint_value()? as u8;
            if kind == kind_finalizer {
                if let Some(typ) = &finalizer_typ {
                    let offset = special.field("offset")?.uint_value()? as i64;
                    let obj = spi.base.add_signed(offset / spi.elem_size * spi.elem_size);
                    let spf = special.cast(typ.clone());
                    self.finalizers.push(Finalizer {
                        obj,
                        fn_addr: spf.field("fn")?.addr(),
                    });
                }
            } else if kind_cleanup != 0 && kind == kind_cleanup {
                if let Some(typ) = &cleanup_typ {
                    let spc = special.cast(typ.clone());
                    self.cleanups.push(Cleanup {
                        fn_addr: spc.field("fn")?.addr(),
                    });
                }
            }
            // all other specials (profile records) can't point into the heap
            link = special.field("next")?;
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_span_mark_idempotent()
    {
        let sp = SpanInfo::new(Address::new(0x10000), 64, 8192);
        let addr = Address::new(0x10040);
        assert!(sp.mark(addr));
        assert!(!sp.mark(addr));
        assert!(sp.mark(Address::new(0x10080)));
    }

    #[test]
    fn test_span_elem_end_clips_to_span()
    {
        let sp = SpanInfo::new(Address::new(0x10000), 6144, 8192);
        assert_eq!(sp.elem_end(Address::new(0x10000)), Address::new(0x11800));
        assert_eq!(sp.elem_end(Address::new(0x11800)), Address::new(0x12000));
    }

    #[test]
    fn test_segment_mark_bounds()
    {
        let seg = Segment::new(Address::new(0x2000), Address::new(0x3000), Vec::new());
        assert!(!seg.mark(Address::new(0x1fff)));
        assert!(!seg.mark(Address::new(0x3000)));
        assert!(seg.mark(Address::new(0x2008)));
        assert!(!seg.mark(Address::new(0x2008)));
    }

    #[test]
    fn test_span_class_bits()
    {
        let class = SpanClass(0b101);
        assert!(class.noscan());
        assert_eq!(class.sizeclass(), 2);
        assert!(!SpanClass(0b100).noscan());
    }
}

//! # Reference Walker
//!
//! The traversal driver. `find_ref` dispatches on a variable's resolved type, discovers
//! the heap objects it references, marks them, and records one profile edge per named
//! sub-object. `find_object` owns the per-object state machine:
//!
//! ```text
//!             not-in-span? ─── segment/stack? ── yes ── root-typed var, no heap bits ─┐
//!   addr ───┤                                                                        │
//!             in-span ── already visited ── return nothing ────────────────────────┤
//!                            │                                                      │
//!                            first touch → mark + copy_gc_mask → walk recursively ──┘
//! ```
//!
//! The typed pass is optimistic: declared types may hide pointers (unsafe casts). Every
//! pointer bit it classifies is cleared from the owning span's mask; whatever survives
//! is drained afterwards by the conservative final-mark pass, which flood-fills through
//! span lookups and attributes whole subtrees to the chain captured at queue time.
//! Together the two passes are exact on total size and count.

use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::config;
use crate::error::Result;
use crate::gcmask::GcMaskIterator;
use crate::heap::{mark_segments, HeapScope, StackRoot};
use crate::mapwalk::to_map_walker;
use crate::mem::{cache_memory, dereference_memory, read_uint_raw, Memory};
use crate::profile::{ChainIndex, ProfileBuilder};
use crate::target::FuncInfo;
use crate::types::{fake_array_type, has_ptr_type, pointer_to, Address, RefType, StructField, TypeKind, KIND_DIRECT_IFACE};
use crate::vars::{read_interface, read_string_info, ReferenceVariable};

/// Chain component that buckets the residues of anonymous sub-objects.
pub(crate) const SUB_OBJECTS_NAME: &str = "$sub_objects$";

/// A residue captured during the typed pass: the chain it belongs under and the
/// iterator still holding unclassified pointer bits.
pub(crate) struct FinalMarkParam
{
    idx: Option<Rc<ChainIndex>>,
    hb: GcMaskIterator,
}

/// Walker state for one scan: the reconstructed heap, the profile under construction,
/// the stack of the task currently being walked, and the final-mark queue.
pub struct RefWalker<'a, W: Write>
{
    pub heap: HeapScope<'a>,
    pub pb: ProfileBuilder<W>,
    pub(crate) cur_stack: Option<StackRoot>,
    final_marks: Vec<FinalMarkParam>,
}

impl<'a, W: Write> RefWalker<'a, W>
{
    pub fn new(heap: HeapScope<'a>, pb: ProfileBuilder<W>) -> RefWalker<'a, W>
    {
        RefWalker {
            heap,
            pb,
            cur_stack: None,
            final_marks: Vec::new(),
        }
    }

    /// Resolve `addr` to a walkable variable, or nothing if the address is outside
    /// every root region or its object has already been visited.
    pub(crate) fn find_object(&self, addr: Address, typ: Arc<RefType>, mem: Memory) -> Option<ReferenceVariable>
    {
        if let Some((sp, base)) = self.heap.find_span_and_base(addr) {
            if !sp.mark(base) {
                // already found
                return None;
            }
            let real_base = self.heap.copy_gc_mask(&sp, base);
            let hb = sp.heap_bits(real_base, sp.elem_end(base));
            let mem = if hb.has_pending() {
                // the object holds pointers; elect it for a full cached scan
                cache_memory(&mem, base.value(), sp.elem_size as usize)
            } else {
                mem
            };
            return Some(ReferenceVariable::with_size_and_count(
                addr,
                "",
                typ,
                mem,
                Some(hb),
                sp.elem_size,
                1,
            ));
        }
        // not in the heap: maybe a data/bss slot or a stack address
        let end = if let Some(seg) = mark_segments(&self.heap.bss, addr) {
            seg.end
        } else if let Some(seg) = mark_segments(&self.heap.data, addr) {
            seg.end
        } else if let Some(stack) = self.cur_stack.as_ref().filter(|stack| stack.segment.mark(addr)) {
            stack.segment.end
        } else {
            return None;
        };
        if addr.add_signed(typ.size) > end {
            // an unsafe conversion; another root object must reference this memory,
            // so there is no need to scan it from here
            return None;
        }
        Some(ReferenceVariable::new(addr, "", typ, mem, None))
    }

    /// Follow the pointer held by `v` and resolve the pointee, consuming the mask bit.
    pub(crate) fn dereference(&self, v: &ReferenceVariable) -> Option<ReferenceVariable>
    {
        let elem = v.typ.ptr_elem()?.clone();
        let ptr = v.read_pointer(v.addr).ok()?;
        self.find_object(Address::new(ptr), elem, dereference_memory(&v.mem))
    }

    /// Untyped flood fill from `addr`: visit the object, chase every remaining pointer
    /// bit, and return the accumulated `(size, count)`.
    fn mark_object(&self, addr: Address, mem: &Memory) -> (i64, i64)
    {
        let Some((sp, base)) = self.heap.find_span_and_base(addr) else {
            return (0, 0);
        };
        if !sp.mark(base) {
            return (0, 0);
        }
        let real_base = self.heap.copy_gc_mask(&sp, base);
        let (mut size, mut count) = (sp.elem_size, 1);
        let hb = sp.heap_bits(real_base, sp.elem_end(base));
        let mut cached: Option<Memory> = None;
        loop {
            let ptr = hb.next_ptr(true);
            if ptr.is_null() {
                break;
            }
            let cmem = cached
                .get_or_insert_with(|| cache_memory(mem, ptr.value(), hb.end().offset_from(ptr) as usize))
                .clone();
            let Ok(nptr) = read_uint_raw(&cmem, ptr.value(), 8) else {
                continue;
            };
            let (child_size, child_count) = self.mark_object(Address::new(nptr), &cmem);
            size += child_size;
            count += child_count;
        }
        (size, count)
    }

    fn record(&mut self, idx: &Option<Rc<ChainIndex>>, size: i64, count: i64)
    {
        if size == 0 && count == 0 {
            return;
        }
        let Some(idx) = idx else {
            return;
        };
        self.pb.add_reference(idx.indexes(), count, size);
    }

    /// Queue a residue under `parent → $sub_objects$`.
    fn queue_sub_objects(&mut self, idx: &Option<Rc<ChainIndex>>, hb: GcMaskIterator)
    {
        let sid = self.pb.string_index(SUB_OBJECTS_NAME);
        self.final_marks.push(FinalMarkParam {
            idx: Some(ChainIndex::push(idx, sid)),
            hb,
        });
    }

    /// Queue a residue directly under `idx` (frame and segment roots).
    pub(crate) fn queue_final_mark(&mut self, idx: Option<Rc<ChainIndex>>, hb: GcMaskIterator)
    {
        self.final_marks.push(FinalMarkParam { idx, hb });
    }

    /// Drain one queued residue: flood-fill every surviving pointer and emit a single
    /// conservative sample against the captured chain.
    fn final_mark(&mut self, idx: Option<Rc<ChainIndex>>, hb: &GcMaskIterator)
    {
        let (mut size, mut count) = (0, 0);
        let mut cached: Option<Memory> = None;
        loop {
            let ptr = hb.next_ptr(true);
            if ptr.is_null() {
                break;
            }
            let cmem = cached
                .get_or_insert_with(|| cache_memory(&self.heap.mem, ptr.value(), hb.end().offset_from(ptr) as usize))
                .clone();
            let Ok(nptr) = read_uint_raw(&cmem, ptr.value(), 8) else {
                continue;
            };
            let (child_size, child_count) = self.mark_object(Address::new(nptr), &cmem);
            size += child_size;
            count += child_count;
        }
        self.record(&idx, size, count);
    }

    /// Run the final-mark pass over everything queued during the typed pass. Must run
    /// after all typed walks: they clear the pointer bits that would otherwise be
    /// double-counted here.
    pub fn drain_final_marks(&mut self)
    {
        let marks = std::mem::take(&mut self.final_marks);
        for param in marks {
            self.final_mark(param.idx, &param.hb);
        }
    }

    /// Find the sub-references of `x` and record them under `idx`.
    ///
    /// Named variables push a chain component and emit an edge on the way out; fresh
    /// anonymous heap objects instead fold into their parent and queue any pointer
    /// bits the typed walk failed to consume.
    pub fn find_ref(&mut self, x: &mut ReferenceVariable, idx: Option<Rc<ChainIndex>>) -> Result<()>
    {
        if !x.name.is_empty() {
            if let Some(parent) = &idx {
                if parent.depth() >= config::max_ref_depth() {
                    // no scan past the depth bound; the residue stays in the pointer
                    // masks and the final-mark pass accounts for it
                    return Ok(());
                }
            }
            let sid = self.pb.string_index(&x.name);
            let idx = Some(ChainIndex::push(&idx, sid));
            let result = self.find_ref_inner(x, &idx);
            self.record(&idx, x.size, x.count);
            result
        } else {
            let result = self.find_ref_inner(x, &idx);
            if let Some(hb) = &x.hb {
                if hb.has_pending() {
                    // the declared type did not explain every pointer in the object
                    let hb = hb.clone();
                    self.queue_sub_objects(&idx, hb);
                }
            }
            result
        }
    }

    fn find_ref_inner(&mut self, x: &mut ReferenceVariable, idx: &Option<Rc<ChainIndex>>) -> Result<()>
    {
        let shape = match &x.typ.kind {
            TypeKind::Parametric { shape, .. } => Some(shape.clone()),
            _ => None,
        };
        if let Some(shape) = shape {
            x.typ = shape;
        }

        let typ = x.typ.clone();
        match &typ.kind {
            TypeKind::Ptr { elem } => {
                let ptr = x.read_pointer(x.addr)?;
                if let Some(mut y) = self.find_object(Address::new(ptr), elem.clone(), dereference_memory(&x.mem)) {
                    let _ = self.find_ref(&mut y, idx.clone());
                    // flatten the reference
                    x.size += y.size;
                    x.count += y.count;
                }
            }
            TypeKind::Chan { elem, header } => {
                let ptr = x.read_pointer(x.addr)?;
                if let Some(mut y) = self.find_object(Address::new(ptr), header.clone(), dereference_memory(&x.mem)) {
                    x.size += y.size;
                    x.count += y.count;
                    let Some(fields) = y.typ.fields().map(<[StructField]>::to_vec) else {
                        return Ok(());
                    };
                    let mut buf = 0u64;
                    let mut chan_len = 0u64;
                    for field in &fields {
                        match field.name.as_str() {
                            "buf" => buf = y.read_pointer(y.addr.add_signed(field.byte_offset))?,
                            "dataqsiz" => chan_len = y.read_uint64(y.addr.add_signed(field.byte_offset)).unwrap_or(0),
                            _ => {}
                        }
                    }
                    if let Some(mut z) = self.find_object(
                        Address::new(buf),
                        fake_array_type(chan_len, elem),
                        y.mem.clone(),
                    ) {
                        let _ = self.find_ref(&mut z, idx.clone());
                        x.size += z.size;
                        x.count += z.count;
                    }
                }
            }
            TypeKind::Map { key, elem, header } => {
                let ptr = x.read_pointer(x.addr)?;
                if let Some(y) = self.find_object(Address::new(ptr), header.clone(), dereference_memory(&x.mem)) {
                    let mut it = match to_map_walker(self, y, key, elem) {
                        Ok(it) => it,
                        Err(err) => {
                            debug!("map walker: {err}");
                            return Ok(());
                        }
                    };
                    while it.next(self) {
                        if let Some(mut k) = it.key() {
                            k.name = format!("$mapkey. ({})", key.name);
                            if self.find_ref(&mut k, idx.clone()).is_err() {
                                continue;
                            }
                        }
                        if let Some(mut v) = it.value() {
                            v.name = format!("$mapval. ({})", elem.name);
                            if self.find_ref(&mut v, idx.clone()).is_err() {
                                continue;
                            }
                        }
                    }
                    // avoid losing memory the iterator discovered on its own
                    let (objects, size, count) = it.reference_info();
                    for obj in objects {
                        if let Some(hb) = obj.hb {
                            if hb.has_pending() {
                                self.queue_sub_objects(idx, hb);
                            }
                        }
                    }
                    x.size += size;
                    x.count += count;
                }
            }
            TypeKind::Str { .. } => {
                let (addr, len) = read_string_info(x)?;
                if let Some(mut y) = self.find_object(
                    Address::new(addr),
                    fake_array_type(len, &RefType::byte()),
                    dereference_memory(&x.mem),
                ) {
                    let _ = self.find_ref(&mut y, idx.clone());
                    x.size += y.size;
                    x.count += y.count;
                }
            }
            TypeKind::Slice { elem, fields } => {
                let mut base = 0u64;
                let mut cap = 0u64;
                for field in fields {
                    match field.name.as_str() {
                        "array" => base = x.read_pointer(x.addr.add_signed(field.byte_offset))?,
                        "cap" => cap = x.read_uint64(x.addr.add_signed(field.byte_offset)).unwrap_or(0),
                        _ => {}
                    }
                }
                if let Some(mut y) = self.find_object(
                    Address::new(base),
                    fake_array_type(cap, elem),
                    dereference_memory(&x.mem),
                ) {
                    let _ = self.find_ref(&mut y, idx.clone());
                    x.size += y.size;
                    x.count += y.count;
                }
            }
            TypeKind::Interface { .. } => {
                let (type_addr, data) = read_interface(x)?;
                let Some(data) = data else {
                    return Ok(());
                };
                let ptr = data.read_pointer(data.addr)?;
                if ptr == 0 {
                    return Ok(());
                }
                let mut ityp: Option<Arc<RefType>> = None;
                if type_addr != 0 {
                    if let Ok(Some((rtyp, kind))) = self.heap.target.runtime_type_to_type(type_addr, data.addr.value()) {
                        let rtyp = if kind & KIND_DIRECT_IFACE == 0 && !rtyp.is_ptr() {
                            // the concrete value lives behind a pointer, not inline
                            pointer_to(&rtyp)
                        } else {
                            rtyp
                        };
                        ityp = rtyp.ptr_elem().cloned();
                    }
                }
                let ityp = ityp.unwrap_or_else(RefType::void);
                if let Some(mut y) = self.find_object(Address::new(ptr), ityp, dereference_memory(&x.mem)) {
                    let _ = self.find_ref(&mut y, idx.clone());
                    x.size += y.size;
                    x.count += y.count;
                }
            }
            TypeKind::Struct { fields } => {
                let fields = special_struct_fields(&typ.name, fields);
                for field in fields.iter() {
                    let mut y = x.to_field(field);
                    if let Err(err) = self.find_ref(&mut y, idx.clone()) {
                        if err.is_out_of_range() {
                            // the object is out of span; the remaining fields are
                            // guaranteed invalid
                            return Err(err);
                        }
                    }
                }
            }
            TypeKind::Array { elem, count, stride } => {
                if !has_ptr_type(elem) {
                    return Ok(());
                }
                for i in 0..*count {
                    let mut y = x.array_access(i, elem, *stride);
                    if let Err(err) = self.find_ref(&mut y, idx.clone()) {
                        if err.is_out_of_range() {
                            return Err(err);
                        }
                    }
                }
            }
            TypeKind::Func => {
                let closure_addr = x.read_pointer(x.addr)?;
                if closure_addr == 0 {
                    return Ok(());
                }
                let mut cst: Option<Arc<RefType>> = None;
                let deref_mem = dereference_memory(&x.mem);
                if let Ok(func_addr) = read_uint_raw(&deref_mem, closure_addr, 8) {
                    if func_addr != 0 {
                        if let Some(fun) = self.heap.target.pc_to_func(func_addr) {
                            cst = self.closure_struct_type(&fun);
                        }
                    }
                }
                let cst = cst.unwrap_or_else(RefType::void);
                if let Some(mut closure) = self.find_object(Address::new(closure_addr), cst, deref_mem) {
                    let _ = self.find_ref(&mut closure, idx.clone());
                    x.size += closure.size;
                    x.count += closure.count;
                }
            }
            TypeKind::FinalizePtr => {
                if let Some(mut y) = self.find_object(x.addr, RefType::void(), x.mem.clone()) {
                    let _ = self.find_ref(&mut y, idx.clone());
                    x.size += y.size;
                    x.count += y.count;
                }
            }
            TypeKind::Void | TypeKind::Base | TypeKind::Parametric { .. } => {}
        }
        Ok(())
    }

    /// The synthesized struct type of `fun`'s closure record, built from the variables
    /// carrying a closure capture offset and cached per function.
    fn closure_struct_type(&mut self, fun: &FuncInfo) -> Option<Arc<RefType>>
    {
        if let Some(fe) = self.heap.func_extra.get(&fun.entry) {
            if let Some(cached) = &fe.closure_struct {
                return Some(cached.clone());
            }
        }
        let entries = match self.heap.target.closure_variables(fun) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("closure variables of {}: {err}", fun.name);
                return None;
            }
        };
        let mut fields = Vec::with_capacity(entries.len());
        for entry in entries {
            // escaped variables carry an `&` prefix
            let name = entry.name.strip_prefix('&').unwrap_or(&entry.name).to_string();
            fields.push(StructField {
                name,
                typ: entry.typ,
                byte_offset: entry.closure_offset,
            });
        }
        let size = fields.last().map_or(0, |f| f.byte_offset + f.typ.size);
        let st = RefType::new("closure", size, TypeKind::Struct { fields });
        self.heap
            .func_extra
            .entry(fun.entry)
            .or_default()
            .closure_struct = Some(st.clone());
        Some(st)
    }
}

/// `sync/atomic.Pointer[T]` hides its payload behind an `unsafe.Pointer`-typed third
/// field; rewrite that field's type to the `*T` recorded by the leading zero-length
/// array so the pointee is walked with its element type.
fn special_struct_fields(name: &str, fields: &[StructField]) -> Vec<StructField>
{
    if name.starts_with("sync/atomic.Pointer[") && name.ends_with(']') && fields.len() == 3 {
        if let TypeKind::Array { elem, .. } = &fields[0].typ.kind {
            let mut rewritten = fields.to_vec();
            rewritten[2].typ = elem.clone();
            return rewritten;
        }
    }
    fields.to_vec()
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn atomic_pointer_type() -> (String, Vec<StructField>)
    {
        let payload = RefType::base("main.T", 16);
        let payload_ptr = pointer_to(&payload);
        let fields = vec![
            StructField {
                name: "_".to_string(),
                typ: fake_array_type(0, &payload_ptr),
                byte_offset: 0,
            },
            StructField {
                name: "_".to_string(),
                typ: RefType::base("sync/atomic.noCopy", 0),
                byte_offset: 0,
            },
            StructField {
                name: "v".to_string(),
                typ: pointer_to(&RefType::void()),
                byte_offset: 0,
            },
        ];
        ("sync/atomic.Pointer[main.T]".to_string(), fields)
    }

    #[test]
    fn test_atomic_pointer_payload_gets_its_element_type()
    {
        let (name, fields) = atomic_pointer_type();
        let rewritten = special_struct_fields(&name, &fields);
        assert_eq!(rewritten[2].typ.name, "*main.T");
    }

    #[test]
    fn test_plain_structs_are_untouched()
    {
        let (_, fields) = atomic_pointer_type();
        let rewritten = special_struct_fields("main.Box", &fields);
        assert_eq!(rewritten[2].typ.name, "*void");
    }
}

//! # Orchestrator
//!
//! `analyze` wires the whole scan: reconstruct the heap (C3) and roots (C4), walk
//! every root through the reference walker, then drain the final-mark queue and flush
//! the profile. Root order follows the load-bearing rule that all typed walks complete
//! before any final mark runs — typed walks clear the pointer bits that would
//! otherwise be double-counted.
//!
//! Failure model: heap reconstruction and profile output are fatal; everything
//! per-variable or per-task is logged and skipped.

use std::io::Write;

use tracing::{debug, warn};

use crate::error::Result;
use crate::heap::{HeapScope, Segment, StackRoot};
use crate::mem::read_uint_raw;
use crate::profile::{ChainIndex, ProfileBuilder};
use crate::target::{Target, VarEntry};
use crate::types::{Address, RefType, TypeKind};
use crate::vars::{resolve_parametric_type, ReferenceVariable};
use crate::walker::RefWalker;

/// Name the compiler gives the runtime dictionary local of generic functions.
const GO_DICTIONARY_NAME: &str = ".dict";
/// Name the compiler gives the captured closure pointer.
const GO_CLOSURE_PTR: &str = ".closureptr";

const MAX_STACK_FRAMES: usize = 1024;

/// Scan every GC root of the stopped target and write the reference profile.
pub fn analyze<W: Write>(target: &dyn Target, writer: W) -> Result<()>
{
    let mut heap = HeapScope::new(target);
    heap.read_heap()?;

    let mem = heap.mem.clone();
    let mut walker = RefWalker::new(heap, ProfileBuilder::new(writer));

    // package-level globals
    match target.global_variables() {
        Ok(globals) => {
            for global in globals {
                if global.addr == 0 {
                    continue;
                }
                let mut v =
                    ReferenceVariable::new(Address::new(global.addr), global.name, global.typ, mem.clone(), None);
                let _ = walker.find_ref(&mut v, None);
            }
        }
        Err(err) => warn!("package variables: {err}"),
    }

    // task stacks: locals and formal parameters per frame, innermost first
    for task in target.tasks().unwrap_or_default() {
        let frames = match target.stacktrace(&task, MAX_STACK_FRAMES) {
            Ok(frames) => frames,
            Err(err) => {
                warn!("stacktrace of task {}: {err}", task.id);
                continue;
            }
        };
        let frame_masks = walker.heap.stack_ptr_mask(&frames);
        walker.cur_stack = Some(StackRoot {
            segment: Segment::new(Address::new(task.stack_lo), Address::new(task.stack_hi), Vec::new()),
            frames: frame_masks,
        });

        for (i, frame) in frames.iter().enumerate() {
            let Some(fun) = &frame.func else {
                continue;
            };
            let locals = match target.frame_variables(&task, i) {
                Ok(locals) => locals,
                Err(err) => {
                    warn!("local variables err: {err}");
                    continue;
                }
            };
            for mut local in order_locals(target, &mem, locals) {
                if local.addr == 0 {
                    continue;
                }
                if local.name.starts_with('&') {
                    // escaped variables
                    local.name.remove(0);
                }
                let name = format!("{}.{}", fun.name, local.name);
                let mut v = ReferenceVariable::new(Address::new(local.addr), name, local.typ, mem.clone(), None);
                let _ = walker.find_ref(&mut v, None);
            }
        }

        // scan root gc bits in case dwarf searching failure
        let stack = walker.cur_stack.take().unwrap();
        for frame in stack.frames {
            if frame.iter.has_pending() {
                let sid = walker.pb.string_index(&frame.func_name);
                walker.queue_final_mark(Some(ChainIndex::push(&None, sid)), frame.iter);
            }
        }
    }

    // residual segment root bits
    let mut residues = Vec::new();
    for (kind, segments) in [("bss", &walker.heap.bss), ("data", &walker.heap.data)] {
        for (i, segment) in segments.iter().enumerate() {
            let iter = segment.ptr_iter();
            if iter.has_pending() {
                residues.push((format!("{kind} segment[{i}]"), iter));
            }
        }
    }
    for (name, iter) in residues {
        let sid = walker.pb.string_index(&name);
        walker.queue_final_mark(Some(ChainIndex::push(&None, sid)), iter);
    }

    // finalizer and cleanup roots
    let func_typ = RefType::new("func()", 8, TypeKind::Func);
    let finalizers = std::mem::take(&mut walker.heap.finalizers);
    for fin in finalizers {
        let mut obj = ReferenceVariable::new(fin.obj, "runtime.SetFinalizer.obj", RefType::finalize_ptr(), mem.clone(), None);
        let _ = walker.find_ref(&mut obj, None);
        let mut finalizer =
            ReferenceVariable::new(fin.fn_addr, "runtime.SetFinalizer.fn", func_typ.clone(), mem.clone(), None);
        let _ = walker.find_ref(&mut finalizer, None);
    }
    let cleanups = std::mem::take(&mut walker.heap.cleanups);
    for cleanup in cleanups {
        let mut f = ReferenceVariable::new(cleanup.fn_addr, "runtime.AddCleanup.fn", func_typ.clone(), mem.clone(), None);
        let _ = walker.find_ref(&mut f, None);
    }

    // conservative accounting of everything the typed pass could not classify;
    // must run after all typed walks
    walker.drain_final_marks();

    walker.pb.flush()
}

/// Filter compiler-internal entries, resolve parametric types through the frame's
/// dictionary, and order variables so shadowed declarations resolve innermost-first.
fn order_locals(target: &dyn Target, mem: &crate::mem::Memory, locals: Vec<VarEntry>) -> Vec<VarEntry>
{
    // the first `.dict` local names the dictionary of instantiated generic functions
    let mut dict_addr = 0u64;
    for local in &locals {
        if local.name == GO_DICTIONARY_NAME {
            match read_uint_raw(mem, local.addr, 8) {
                Ok(addr) => dict_addr = addr,
                Err(err) => debug!("could not load {} variable: {err}", GO_DICTIONARY_NAME),
            }
            break;
        }
    }

    let mut ordered: Vec<(i32, VarEntry)> = Vec::with_capacity(locals.len());
    for mut local in locals {
        if local.name == GO_DICTIONARY_NAME
            || local.name == GO_CLOSURE_PTR
            || ["#state", "&#state", "#next", "&#next", "#yield"]
                .iter()
                .any(|prefix| local.name.starts_with(prefix))
        {
            continue;
        }
        local.typ = resolve_parametric_type(target, mem, &local.typ, dict_addr);
        let mut depth = local.depth;
        if local.is_parameter && depth <= 1 {
            depth = 0;
        }
        ordered.push((depth, local));
    }
    ordered.sort_by_key(|(depth, _)| *depth);
    ordered.into_iter().map(|(_, local)| local).collect()
}

//! # Typed Variable Model
//!
//! A `ReferenceVariable` is the unit the walker moves around: a target address, a
//! display name, a resolved type, the memory handle to read through, and (for heap
//! objects) the heap-bits iterator tying the variable to its window of the owning
//! span's pointer mask. Projections never mutate the receiver — `to_field` and
//! `array_access` hand back fresh variables sharing the same mask window.
//!
//! Reads come in two flavors with different contracts:
//!
//! - `read_pointer` consumes the pointer bit at the read address (the typed pass has
//!   classified it; the final-mark pass must not see it again)
//! - `read_uint64` is a plain range-checked read for non-pointer slots
//!
//! Both refuse to touch memory outside the heap-bits window, surfacing the recoverable
//! `OutOfRange` error the walker uses to short-circuit unsafe casts.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::gcmask::GcMaskIterator;
use crate::mem::{dereference_memory, read_int_raw, read_uint_raw, Memory};
use crate::target::Target;
use crate::types::{Address, RefType, StructField, TypeKind};

/// A variable under analysis: root, projected field, or discovered heap object.
#[derive(Clone)]
pub struct ReferenceVariable
{
    pub addr: Address,
    /// Display name; empty for anonymous heap objects, which aggregate into their
    /// parent instead of emitting their own edge.
    pub name: String,
    pub typ: Arc<RefType>,
    pub mem: Memory,
    /// Heap bits for this object. Present iff the variable is backed by a span;
    /// `base` equals the object payload base, `end` is clipped to the span.
    pub hb: Option<GcMaskIterator>,

    /// Accumulated size of this node and the anonymous objects folded into it.
    pub size: i64,
    /// Accumulated object count, same folding rule.
    pub count: i64,
}

impl ReferenceVariable
{
    pub fn new(addr: Address, name: impl Into<String>, typ: Arc<RefType>, mem: Memory, hb: Option<GcMaskIterator>)
        -> ReferenceVariable
    {
        ReferenceVariable {
            addr,
            name: name.into(),
            typ,
            mem,
            hb,
            size: 0,
            count: 0,
        }
    }

    pub fn with_size_and_count(
        addr: Address,
        name: impl Into<String>,
        typ: Arc<RefType>,
        mem: Memory,
        hb: Option<GcMaskIterator>,
        size: i64,
        count: i64,
    ) -> ReferenceVariable
    {
        let mut v = ReferenceVariable::new(addr, name, typ, mem, hb);
        v.size = size;
        v.count = count;
        v
    }

    /// Project a struct member. The name records both the member and its type so the
    /// profile chain reads `field. (Type)`.
    pub fn to_field(&self, field: &StructField) -> ReferenceVariable
    {
        ReferenceVariable::new(
            self.addr.add_signed(field.byte_offset),
            format!("{}. ({})", field.name, field.typ.name),
            field.typ.clone(),
            self.mem.clone(),
            self.hb.clone(),
        )
    }

    /// Project an array element. Indexes of ten and above collapse to `[10+]` so a
    /// large array contributes a bounded number of distinct chains.
    pub fn array_access(&self, i: i64, elem: &Arc<RefType>, stride: i64) -> ReferenceVariable
    {
        let name = if i < 10 {
            format!("[{}]. ({})", i, elem.name)
        } else {
            format!("[10+]. ({})", elem.name)
        };
        ReferenceVariable::new(
            self.addr.add_signed(i * stride),
            name,
            elem.clone(),
            self.mem.clone(),
            self.hb.clone(),
        )
    }

    /// Unnamed element projection used by the map walkers for their internal
    /// structures, where only the final key/value names reach the profile.
    pub fn element(&self, i: i64, elem: &Arc<RefType>, stride: i64) -> ReferenceVariable
    {
        ReferenceVariable::new(
            self.addr.add_signed(i * stride),
            "",
            elem.clone(),
            self.mem.clone(),
            self.hb.clone(),
        )
    }

    /// Read a pointer slot at `at` and consume its pointer bit.
    pub fn read_pointer(&self, at: Address) -> Result<u64>
    {
        if let Some(hb) = &self.hb {
            hb.reset_gc_mask(at)?;
        }
        read_uint_raw(&self.mem, at.value(), 8)
    }

    /// Read a non-pointer 8-byte slot at `at`, range-checked against the heap-bits
    /// window when one is present.
    pub fn read_uint64(&self, at: Address) -> Result<u64>
    {
        if let Some(hb) = &self.hb {
            if at < hb.base() || at >= hb.end() {
                return Err(Error::OutOfRange);
            }
        }
        read_uint_raw(&self.mem, at.value(), 8)
    }

    /// Read this variable's slot as a signed scalar of its own size.
    pub fn read_int(&self) -> Result<i64>
    {
        read_int_raw(&self.mem, self.addr.value(), self.typ.size.clamp(1, 8) as usize)
    }

    /// Read this variable's slot as an unsigned scalar of its own size.
    pub fn read_uint(&self) -> Result<u64>
    {
        read_uint_raw(&self.mem, self.addr.value(), self.typ.size.clamp(1, 8) as usize)
    }
}

/// Decode a string header into `(data address, length)`.
///
/// The data structure is always two pointers in size: the data pointer followed by the
/// length. Reading the data pointer consumes its mask bit.
pub fn read_string_info(v: &ReferenceVariable) -> Result<(u64, u64)>
{
    let TypeKind::Str { fields } = &v.typ.kind else {
        return Err(Error::MalformedRuntime(format!("{} is not a string header", v.typ.name)));
    };
    let mut addr = 0u64;
    let mut len = 0u64;
    for field in fields {
        match field.name.as_str() {
            "len" => len = v.read_uint64(v.addr.add_signed(field.byte_offset)).unwrap_or(0),
            "str" => addr = v.read_pointer(v.addr.add_signed(field.byte_offset))?,
            _ => {}
        }
    }
    Ok((addr, len))
}

/// Decode an interface header into the runtime type descriptor address and the data
/// slot variable.
///
/// Works for both shapes: non-empty interfaces (`iface{tab, data}`, where the
/// descriptor hangs off the itab) and empty interfaces (`eface{_type, data}`).
pub fn read_interface(v: &ReferenceVariable) -> Result<(u64, Option<ReferenceVariable>)>
{
    let TypeKind::Interface { fields } = &v.typ.kind else {
        return Err(Error::MalformedRuntime(format!("{} is not an interface", v.typ.name)));
    };
    let mut type_addr = 0u64;
    let mut data = None;
    for field in fields {
        match field.name.as_str() {
            "tab" => {
                // runtime.iface: the descriptor lives behind the itab
                let Ok(tab) = v.read_uint64(v.addr.add_signed(field.byte_offset)) else {
                    continue;
                };
                if tab == 0 {
                    continue;
                }
                let Some(itab) = field.typ.ptr_elem() else {
                    continue;
                };
                let Some(slot) = itab.field("Type").or_else(|| itab.field("_type")) else {
                    debug!("invalid interface type");
                    continue;
                };
                let mem = dereference_memory(&v.mem);
                if let Ok(addr) = read_uint_raw(&mem, tab.wrapping_add(slot.byte_offset as u64), 8) {
                    type_addr = addr;
                }
            }
            "_type" => {
                // runtime.eface: the descriptor is stored inline
                if let Ok(addr) = v.read_uint64(v.addr.add_signed(field.byte_offset)) {
                    type_addr = addr;
                }
            }
            "data" => {
                data = Some(ReferenceVariable::new(
                    v.addr.add_signed(field.byte_offset),
                    "",
                    field.typ.clone(),
                    v.mem.clone(),
                    v.hb.clone(),
                ));
            }
            _ => {}
        }
    }
    Ok((type_addr, data))
}

/// Resolve a parametric (generic shape) type to its concrete type through the task's
/// runtime dictionary. Failure degrades gracefully to the shape type.
pub fn resolve_parametric_type(
    target: &dyn Target,
    mem: &Memory,
    typ: &Arc<RefType>,
    dict_addr: u64,
) -> Arc<RefType>
{
    let TypeKind::Parametric { shape, dict_index } = &typ.kind else {
        return typ.clone();
    };
    if dict_addr == 0 {
        debug!("parametric type {} without a dictionary", typ.name);
        return shape.clone();
    }
    let slot = dict_addr.wrapping_add(*dict_index as u64 * 8);
    match read_uint_raw(mem, slot, 8) {
        Ok(rtype_addr) => match target.runtime_type_to_type(rtype_addr, 0) {
            Ok(Some((concrete, _))) => concrete,
            _ => shape.clone(),
        },
        Err(err) => {
            debug!("could not resolve parametric type {}: {err}", typ.name);
            shape.clone()
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::gcmask::new_mask;
    use crate::mem::tests::FlatMemory;
    use crate::types::{pointer_to, RefType};

    fn string_type() -> Arc<RefType>
    {
        let byte = RefType::base("byte", 1);
        RefType::new(
            "string",
            16,
            TypeKind::Str {
                fields: vec![
                    StructField {
                        name: "str".to_string(),
                        typ: pointer_to(&byte),
                        byte_offset: 0,
                    },
                    StructField {
                        name: "len".to_string(),
                        typ: RefType::base("int", 8),
                        byte_offset: 8,
                    },
                ],
            },
        )
    }

    #[test]
    fn test_read_pointer_consumes_mask_bit()
    {
        let mut bytes = vec![0u8; 16];
        bytes[..8].copy_from_slice(&0xdead_0000u64.to_le_bytes());
        let mem: Memory = FlatMemory::new(0x100, bytes);

        let mask = new_mask(16);
        crate::bitmap::set_bit(&mut mask.borrow_mut(), 0);
        let hb = GcMaskIterator::new(Address::new(0x100), Address::new(0x110), Address::new(0x100), mask);
        let v = ReferenceVariable::new(Address::new(0x100), "p", RefType::void(), mem, Some(hb));

        assert!(v.hb.as_ref().unwrap().has_pending());
        assert_eq!(v.read_pointer(Address::new(0x100)).unwrap(), 0xdead_0000);
        assert!(!v.hb.as_ref().unwrap().has_pending());
    }

    #[test]
    fn test_reads_refuse_to_escape_window()
    {
        let mem: Memory = FlatMemory::new(0x100, vec![0u8; 32]);
        let hb = GcMaskIterator::new(Address::new(0x100), Address::new(0x110), Address::new(0x100), new_mask(32));
        let v = ReferenceVariable::new(Address::new(0x100), "", RefType::void(), mem, Some(hb));

        assert!(v.read_uint64(Address::new(0x110)).unwrap_err().is_out_of_range());
        assert!(v.read_pointer(Address::new(0x118)).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_string_header_decoding()
    {
        let mut bytes = vec![0u8; 16];
        bytes[..8].copy_from_slice(&0x2000u64.to_le_bytes());
        bytes[8..].copy_from_slice(&1024u64.to_le_bytes());
        let mem: Memory = FlatMemory::new(0x100, bytes);

        let v = ReferenceVariable::new(Address::new(0x100), "s", string_type(), mem, None);
        assert_eq!(read_string_info(&v).unwrap(), (0x2000, 1024));
    }

    #[test]
    fn test_array_access_collapses_large_indexes()
    {
        let mem: Memory = FlatMemory::new(0, vec![0u8; 8]);
        let elem = RefType::base("int64", 8);
        let v = ReferenceVariable::new(Address::new(0x100), "arr", RefType::void(), mem, None);
        assert_eq!(v.array_access(3, &elem, 8).name, "[3]. (int64)");
        assert_eq!(v.array_access(3, &elem, 8).addr, Address::new(0x118));
        assert_eq!(v.array_access(12, &elem, 8).name, "[10+]. (int64)");
    }
}

//! Typed views over runtime data structures.
//!
//! Reconstructing the span index means walking the runtime's own structs (`mheap_`,
//! `moduledata`, `heapArena`, specials, functab) field by field. A `Region` pairs a
//! target address with a resolved type and a memory handle, and knows how to project
//! members, follow pointers, index arrays and slices, and read scalars. It is the
//! metadata-decoding counterpart of the heap walker's variable model.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mem::{read_int_raw, read_uint_raw, Memory};
use crate::types::{Address, RefType, TypeKind};

/// A typed window of target memory.
#[derive(Clone)]
pub struct Region
{
    addr: Address,
    typ: Arc<RefType>,
    mem: Memory,
}

impl Region
{
    pub fn new(addr: Address, typ: Arc<RefType>, mem: Memory) -> Region
    {
        Region { addr, typ, mem }
    }

    pub fn addr(&self) -> Address
    {
        self.addr
    }

    pub fn typ(&self) -> &Arc<RefType>
    {
        &self.typ
    }

    pub fn mem(&self) -> &Memory
    {
        &self.mem
    }

    /// Reinterpret this region as another type at the same address.
    pub fn cast(&self, typ: Arc<RefType>) -> Region
    {
        Region::new(self.addr, typ, self.mem.clone())
    }

    pub fn is_struct(&self) -> bool
    {
        matches!(self.typ.kind, TypeKind::Struct { .. })
    }

    pub fn has_field(&self, name: &str) -> bool
    {
        self.typ.field(name).is_some()
    }

    /// Project a struct member.
    pub fn field(&self, name: &str) -> Result<Region>
    {
        let field = self
            .typ
            .field(name)
            .ok_or_else(|| Error::MalformedRuntime(format!("{} has no field {}", self.typ.name, name)))?;
        Ok(Region::new(
            self.addr.add_signed(field.byte_offset),
            field.typ.clone(),
            self.mem.clone(),
        ))
    }

    /// Follow a pointer-typed region to its pointee.
    pub fn deref(&self) -> Result<Region>
    {
        let elem = self
            .typ
            .ptr_elem()
            .ok_or_else(|| Error::MalformedRuntime(format!("cannot dereference {}", self.typ.name)))?
            .clone();
        let ptr = read_uint_raw(&self.mem, self.addr.value(), 8)?;
        Ok(Region::new(Address::new(ptr), elem, self.mem.clone()))
    }

    /// Element count of a fixed-size array type.
    pub fn array_len(&self) -> i64
    {
        match &self.typ.kind {
            TypeKind::Array { count, .. } => *count,
            _ => 0,
        }
    }

    /// Index a fixed-size array.
    pub fn array_index(&self, i: i64) -> Result<Region>
    {
        match &self.typ.kind {
            TypeKind::Array { elem, stride, .. } => Ok(Region::new(
                self.addr.add_signed(i * stride),
                elem.clone(),
                self.mem.clone(),
            )),
            _ => Err(Error::MalformedRuntime(format!("{} is not an array", self.typ.name))),
        }
    }

    /// Length of a slice-typed region, read from its header.
    pub fn slice_len(&self) -> Result<i64>
    {
        let len = self.field("len")?;
        read_int_raw(&self.mem, len.addr.value(), 8)
    }

    /// Index a slice-typed region: follows the backing-array pointer.
    pub fn slice_index(&self, i: i64) -> Result<Region>
    {
        match &self.typ.kind {
            TypeKind::Slice { elem, .. } => {
                let array = self.field("array")?;
                let base = read_uint_raw(&self.mem, array.addr.value(), 8)?;
                Ok(Region::new(
                    Address::new(base).add_signed(i * elem.size.max(1)),
                    elem.clone(),
                    self.mem.clone(),
                ))
            }
            _ => Err(Error::MalformedRuntime(format!("{} is not a slice", self.typ.name))),
        }
    }

    /// Read this region as an unsigned scalar of its own size (capped at 8 bytes).
    pub fn uint_value(&self) -> Result<u64>
    {
        let size = self.typ.size.clamp(1, 8) as usize;
        read_uint_raw(&self.mem, self.addr.value(), size)
    }

    /// Read this region as a signed scalar of its own size (capped at 8 bytes).
    pub fn int_value(&self) -> Result<i64>
    {
        let size = self.typ.size.clamp(1, 8) as usize;
        read_int_raw(&self.mem, self.addr.value(), size)
    }

    /// Read this region as a pointer-sized unsigned value.
    pub fn uintptr(&self) -> Result<u64>
    {
        read_uint_raw(&self.mem, self.addr.value(), 8)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::mem::tests::FlatMemory;
    use crate::types::{RefType, StructField};

    fn pair_type() -> Arc<RefType>
    {
        RefType::new(
            "pair",
            16,
            TypeKind::Struct {
                fields: vec![
                    StructField {
                        name: "first".to_string(),
                        typ: RefType::base("uint64", 8),
                        byte_offset: 0,
                    },
                    StructField {
                        name: "second".to_string(),
                        typ: RefType::base("uint64", 8),
                        byte_offset: 8,
                    },
                ],
            },
        )
    }

    #[test]
    fn test_field_projection_and_scalars()
    {
        let mut bytes = vec![0u8; 16];
        bytes[..8].copy_from_slice(&7u64.to_le_bytes());
        bytes[8..].copy_from_slice(&(-2i64).to_le_bytes());
        let mem: Memory = FlatMemory::new(0x100, bytes);

        let region = Region::new(Address::new(0x100), pair_type(), mem);
        assert_eq!(region.field("first").unwrap().uint_value().unwrap(), 7);
        assert_eq!(region.field("second").unwrap().int_value().unwrap(), -2);
        assert!(region.field("third").is_err());
    }

    #[test]
    fn test_deref_and_array_index()
    {
        // [0x100] = pointer to 0x110; [0x110..] = array of two u64
        let mut bytes = vec![0u8; 0x20];
        bytes[..8].copy_from_slice(&0x110u64.to_le_bytes());
        bytes[0x10..0x18].copy_from_slice(&11u64.to_le_bytes());
        bytes[0x18..0x20].copy_from_slice(&22u64.to_le_bytes());
        let mem: Memory = FlatMemory::new(0x100, bytes);

        let elem = RefType::base("uint64", 8);
        let arr = crate::types::fake_array_type(2, &elem);
        let ptr = crate::types::pointer_to(&arr);
        let region = Region::new(Address::new(0x100), ptr, mem);

        let pointee = region.deref().unwrap();
        assert_eq!(pointee.addr(), Address::new(0x110));
        assert_eq!(pointee.array_len(), 2);
        assert_eq!(pointee.array_index(1).unwrap().uint_value().unwrap(), 22);
    }
}

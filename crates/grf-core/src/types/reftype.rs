//! Resolved target type model.
//!
//! The debugger facade resolves DWARF entries into this tree before handing variables to
//! the walker: typedefs and qualifiers are already collapsed, struct members carry byte
//! offsets, and the Go flavor types (strings, slices, maps, channels, interfaces) expose
//! both their element types and the runtime struct layout behind them. The walker only
//! ever dispatches on `TypeKind`; it never touches DWARF itself.

use std::sync::Arc;

use once_cell::sync::Lazy;

/// Flag bit in a runtime type's kind byte: the concrete value of an interface is stored
/// directly in the data slot instead of behind a pointer.
pub const KIND_DIRECT_IFACE: i64 = 1 << 5;

/// A member of a struct layout.
#[derive(Debug, Clone)]
pub struct StructField
{
    pub name: String,
    pub typ: Arc<RefType>,
    pub byte_offset: i64,
}

/// A resolved type: display name, byte size, and shape.
#[derive(Debug)]
pub struct RefType
{
    pub name: String,
    pub size: i64,
    pub kind: TypeKind,
}

/// The shape the walker dispatches on.
#[derive(Debug)]
pub enum TypeKind
{
    /// No type information; walked for liveness only.
    Void,
    /// Scalar with no pointers (integers, floats, booleans).
    Base,
    /// Function value. The 8-byte slot holds a pointer to the closure object.
    Func,
    /// Typed pointer.
    Ptr
    {
        elem: Arc<RefType>,
    },
    /// Plain struct.
    Struct
    {
        fields: Vec<StructField>,
    },
    /// Fixed-size array.
    Array
    {
        elem: Arc<RefType>,
        count: i64,
        stride: i64,
    },
    /// Slice header; `fields` is the `{array, len, cap}` layout.
    Slice
    {
        elem: Arc<RefType>,
        fields: Vec<StructField>,
    },
    /// String header; `fields` is the `{str, len}` layout.
    Str
    {
        fields: Vec<StructField>,
    },
    /// Map. `header` is the runtime header struct (`hmap` or the swiss-table map struct)
    /// the map value points at.
    Map
    {
        key: Arc<RefType>,
        elem: Arc<RefType>,
        header: Arc<RefType>,
    },
    /// Channel. `header` is the `hchan` runtime struct the channel value points at.
    Chan
    {
        elem: Arc<RefType>,
        header: Arc<RefType>,
    },
    /// Interface header; `fields` is the `iface`/`eface` layout (`tab`/`_type` + `data`).
    Interface
    {
        fields: Vec<StructField>,
    },
    /// Generic shape type carrying the dictionary slot that names the concrete type.
    Parametric
    {
        shape: Arc<RefType>,
        dict_index: i64,
    },
    /// Synthetic type for objects known live without DWARF coverage (finalizer targets).
    /// Walking one only pulls the object into the visited set.
    FinalizePtr,
}

impl RefType
{
    pub fn new(name: impl Into<String>, size: i64, kind: TypeKind) -> Arc<RefType>
    {
        Arc::new(RefType {
            name: name.into(),
            size,
            kind,
        })
    }

    /// The shared no-information type.
    pub fn void() -> Arc<RefType>
    {
        static VOID: Lazy<Arc<RefType>> = Lazy::new(|| RefType::new("void", 0, TypeKind::Void));
        VOID.clone()
    }

    pub fn base(name: impl Into<String>, size: i64) -> Arc<RefType>
    {
        RefType::new(name, size, TypeKind::Base)
    }

    /// The shared one-byte element type for string and channel payload arrays.
    pub fn byte() -> Arc<RefType>
    {
        static BYTE: Lazy<Arc<RefType>> = Lazy::new(|| RefType::base("byte", 1));
        BYTE.clone()
    }

    pub fn finalize_ptr() -> Arc<RefType>
    {
        RefType::new("<finalized>", 0, TypeKind::FinalizePtr)
    }

    /// The struct layout behind this type, if it has one.
    pub fn fields(&self) -> Option<&[StructField]>
    {
        match &self.kind {
            TypeKind::Struct { fields }
            | TypeKind::Slice { fields, .. }
            | TypeKind::Str { fields }
            | TypeKind::Interface { fields } => Some(fields),
            _ => None,
        }
    }

    /// Look up a member of the struct layout by name.
    pub fn field(&self, name: &str) -> Option<&StructField>
    {
        self.fields().and_then(|fields| fields.iter().find(|f| f.name == name))
    }

    pub fn is_ptr(&self) -> bool
    {
        matches!(self.kind, TypeKind::Ptr { .. })
    }

    /// Pointee type of a pointer, or `None`.
    pub fn ptr_elem(&self) -> Option<&Arc<RefType>>
    {
        match &self.kind {
            TypeKind::Ptr { elem } => Some(elem),
            _ => None,
        }
    }
}

/// Synthesize `*elem`.
pub fn pointer_to(elem: &Arc<RefType>) -> Arc<RefType>
{
    RefType::new(
        format!("*{}", elem.name),
        8,
        TypeKind::Ptr { elem: elem.clone() },
    )
}

/// Synthesize `[count]elem`.
///
/// DWARF byte sizes already include the padding that makes a type self-aligned, so the
/// element size doubles as the stride.
pub fn fake_array_type(count: u64, elem: &Arc<RefType>) -> Arc<RefType>
{
    let stride = elem.size.max(1);
    RefType::new(
        format!("[{}]{}", count, elem.name),
        count as i64 * stride,
        TypeKind::Array {
            elem: elem.clone(),
            count: count as i64,
            stride,
        },
    )
}

/// Whether values of this type can transitively contain pointers.
///
/// Arrays of pointer-free elements are skipped wholesale by the walker, which matters
/// for large numeric buffers.
pub fn has_ptr_type(typ: &RefType) -> bool
{
    match &typ.kind {
        TypeKind::Ptr { .. }
        | TypeKind::Chan { .. }
        | TypeKind::Map { .. }
        | TypeKind::Str { .. }
        | TypeKind::Slice { .. }
        | TypeKind::Interface { .. }
        | TypeKind::Func => true,
        TypeKind::Struct { fields } => fields.iter().any(|f| has_ptr_type(&f.typ)),
        TypeKind::Array { elem, .. } => has_ptr_type(elem),
        TypeKind::Parametric { shape, .. } => has_ptr_type(shape),
        TypeKind::Void | TypeKind::Base | TypeKind::FinalizePtr => false,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_has_ptr_type_transitive()
    {
        let b = RefType::base("uint8", 1);
        let arr = fake_array_type(16, &b);
        assert!(!has_ptr_type(&arr));

        let p = pointer_to(&b);
        let holder = RefType::new(
            "holder",
            16,
            TypeKind::Struct {
                fields: vec![
                    StructField {
                        name: "pad".to_string(),
                        typ: RefType::base("int64", 8),
                        byte_offset: 0,
                    },
                    StructField {
                        name: "p".to_string(),
                        typ: p,
                        byte_offset: 8,
                    },
                ],
            },
        );
        assert!(has_ptr_type(&holder));
        assert!(has_ptr_type(&fake_array_type(4, &holder)));
    }

    #[test]
    fn test_fake_array_naming_and_size()
    {
        let elem = RefType::base("byte", 1);
        let arr = fake_array_type(1024, &elem);
        assert_eq!(arr.name, "[1024]byte");
        assert_eq!(arr.size, 1024);
    }
}

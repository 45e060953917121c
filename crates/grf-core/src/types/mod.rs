//! Core data types shared across the analyzer.

pub mod address;
pub mod reftype;

pub use address::Address;
pub use reftype::{fake_array_type, has_ptr_type, pointer_to, RefType, StructField, TypeKind, KIND_DIRECT_IFACE};

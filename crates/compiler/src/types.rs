//! The Ember type system
//!
//! A small nominal type language: machine integers up to 256 bits,
//! addresses, booleans, fixed and dynamic byte strings, arrays, mappings,
//! and named structs with precomputed field offsets.

use serde::Serialize;

/// A struct field with its byte offset inside the struct's storage region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
    /// Slot-relative offset: field index × 32 (one storage slot per field).
    pub offset: usize,
}

/// An Ember type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Type {
    /// Unsigned integer of `bits` width, `bits ∈ {8, 16, …, 256}`.
    Uint { bits: u16 },
    /// Signed integer of `bits` width.
    Int { bits: u16 },
    /// 20-byte account address.
    Address,
    Bool,
    /// Byte string; `size` is `Some(n)` for `bytesN`, `None` for dynamic.
    Bytes { size: Option<usize> },
    String,
    /// Array of `element`; `size` is `None` for dynamic arrays.
    Array {
        element: Box<Type>,
        size: Option<usize>,
    },
    Mapping {
        key: Box<Type>,
        value: Box<Type>,
    },
    Struct {
        name: String,
        fields: Vec<StructField>,
    },
}

impl Type {
    pub fn uint256() -> Type {
        Type::Uint { bits: 256 }
    }

    /// Size in bytes used by the memory planner when packing spilled values.
    ///
    /// Reference types (dynamic bytes, string, array, mapping, struct) are
    /// represented as 32-byte pointers/slots.
    pub fn byte_size(&self) -> usize {
        match self {
            Type::Bool => 1,
            Type::Uint { bits } | Type::Int { bits } => (*bits as usize) / 8,
            Type::Address => 20,
            Type::Bytes { size: Some(n) } => *n,
            Type::Bytes { size: None }
            | Type::String
            | Type::Array { .. }
            | Type::Mapping { .. }
            | Type::Struct { .. } => 32,
        }
    }

    /// True for types that fit one VM word and can be promoted to SSA temps
    /// by the phi inserter. Reference types keep their memory identity.
    pub fn is_word(&self) -> bool {
        matches!(
            self,
            Type::Uint { .. }
                | Type::Int { .. }
                | Type::Address
                | Type::Bool
                | Type::Bytes { size: Some(_) }
        )
    }

    /// True for types accessed through a pointer (dynamic data or
    /// aggregates).
    pub fn is_reference(&self) -> bool {
        !self.is_word()
    }

    /// Whether a value of `self` can be assigned from a value of `other`
    /// without an explicit cast. Identical types only, plus the
    /// fixed-bytes-into-dynamic-bytes widening that store_local supports.
    pub fn assignable_from(&self, other: &Type) -> bool {
        if self == other {
            return true;
        }
        matches!(
            (self, other),
            (Type::Bytes { size: None }, Type::Bytes { size: Some(_) })
        )
    }

    /// Valid mapping key types: word types plus string/dynamic bytes.
    pub fn valid_mapping_key(&self) -> bool {
        self.is_word() || matches!(self, Type::String | Type::Bytes { size: None })
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Uint { bits } => write!(f, "uint{}", bits),
            Type::Int { bits } => write!(f, "int{}", bits),
            Type::Address => write!(f, "address"),
            Type::Bool => write!(f, "bool"),
            Type::Bytes { size: Some(n) } => write!(f, "bytes{}", n),
            Type::Bytes { size: None } => write!(f, "bytes"),
            Type::String => write!(f, "string"),
            Type::Array { element, size } => match size {
                Some(n) => write!(f, "{}[{}]", element, n),
                None => write!(f, "{}[]", element),
            },
            Type::Mapping { key, value } => write!(f, "mapping<{}, {}>", key, value),
            Type::Struct { name, .. } => write!(f, "{}", name),
        }
    }
}

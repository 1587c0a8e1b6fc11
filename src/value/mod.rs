//! # Runtime Value System
//!
//! Core runtime types and values flowing through a compiled pipeline:
//! `String`, `Int`, `Float`, `Boolean`, `List`, `Map`, `Record`, `Union`,
//! `Optional`. Every [`CValue`] reports its [`CType`] via a pure function;
//! type and value are always parallel (an empty list still knows its
//! element type, a `None` still knows its inner type).
//!
//! ## Usage
//!
//! ```rust
//! use constellation::value::{CType, CValue};
//!
//! let scores = CValue::list(
//!     CType::Int,
//!     vec![CValue::Int(5), CValue::Int(15)],
//! );
//! assert_eq!(scores.ctype(), CType::List(Box::new(CType::Int)));
//! ```

pub mod convert;
pub mod hash;

pub use convert::{CTyped, ConversionError, FromCValue, IntoCValue};
pub use hash::{canonical_input_hash, canonical_value_hash};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Types
// ============================================================================

/// Runtime type of a pipeline value.
///
/// Record and union fields use `BTreeMap` so iteration order is
/// deterministic; display and the canonical hash encoding depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CType {
    /// UTF-8 text
    String,
    /// 64-bit signed integer
    Int,
    /// IEEE-754 double
    Float,
    Boolean,
    /// Homogeneous ordered sequence
    List(Box<CType>),
    /// Key-value pairs with uniform key and value types.
    /// Key uniqueness is expected but not enforced at the type level.
    Map(Box<CType>, Box<CType>),
    /// Record with named fields
    Product(BTreeMap<String, CType>),
    /// Tagged union
    Union(BTreeMap<String, CType>),
    /// `Some<T>` or `None<T>`
    Optional(Box<CType>),
}

impl CType {
    /// The zero value of this type, used by the `skip`/`log` error
    /// policies when a module fails without a fallback.
    ///
    /// For unions the first variant in tag order is zeroed; tags are
    /// synthesized deterministically so this is stable.
    pub fn zero_value(&self) -> CValue {
        match self {
            CType::String => CValue::String(String::new()),
            CType::Int => CValue::Int(0),
            CType::Float => CValue::Float(0.0),
            CType::Boolean => CValue::Boolean(false),
            CType::List(elem) => CValue::list((**elem).clone(), vec![]),
            CType::Map(k, v) => CValue::map((**k).clone(), (**v).clone(), vec![]),
            CType::Product(fields) => CValue::Record(
                fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.zero_value()))
                    .collect(),
            ),
            CType::Union(variants) => {
                // BTreeMap iterates in tag order. Module output types
                // never carry the uninhabited union, and zero values are
                // only requested for module outputs.
                let (tag, ty) = variants
                    .iter()
                    .next()
                    .expect("union type with no variants");
                CValue::Union {
                    tag: tag.clone(),
                    value: Box::new(ty.zero_value()),
                    variants: variants.clone(),
                }
            }
            CType::Optional(inner) => CValue::Optional {
                inner: (**inner).clone(),
                value: None,
            },
        }
    }

    /// Render like the surface language writes types: `List<Int>`,
    /// `{id: Int, name: String}`, `String?`.
    pub fn render(&self) -> String {
        match self {
            CType::String => "String".to_string(),
            CType::Int => "Int".to_string(),
            CType::Float => "Float".to_string(),
            CType::Boolean => "Boolean".to_string(),
            CType::List(elem) => format!("List<{}>", elem.render()),
            CType::Map(k, v) => format!("Map<{}, {}>", k.render(), v.render()),
            CType::Product(fields) => {
                let body: Vec<String> = fields
                    .iter()
                    .map(|(name, ty)| format!("{}: {}", name, ty.render()))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            CType::Union(variants) => {
                let body: Vec<String> = variants.values().map(CType::render).collect();
                body.join(" | ")
            }
            CType::Optional(inner) => format!("{}?", inner.render()),
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

// ============================================================================
// Values
// ============================================================================

/// A runtime value. Structural equality; the canonical hash encodes
/// float bit patterns, so cache keys and equality agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CValue {
    String(String),
    Int(i64),
    Float(f64),
    Boolean(bool),
    List {
        elem: CType,
        items: Vec<CValue>,
    },
    Map {
        key: CType,
        value: CType,
        entries: Vec<(CValue, CValue)>,
    },
    Record(BTreeMap<String, CValue>),
    Union {
        tag: String,
        value: Box<CValue>,
        variants: BTreeMap<String, CType>,
    },
    Optional {
        inner: CType,
        /// `None` here is the language-level `None<inner>`
        value: Option<Box<CValue>>,
    },
}

impl CValue {
    /// Build a list value carrying its element type.
    pub fn list(elem: CType, items: Vec<CValue>) -> Self {
        CValue::List { elem, items }
    }

    /// Build a map value carrying its key/value types.
    pub fn map(key: CType, value: CType, entries: Vec<(CValue, CValue)>) -> Self {
        CValue::Map { key, value, entries }
    }

    /// Build a record from `(name, value)` pairs.
    pub fn record(fields: Vec<(String, CValue)>) -> Self {
        CValue::Record(fields.into_iter().collect())
    }

    /// `Some<T>` with the inner type derived from the value.
    pub fn some(value: CValue) -> Self {
        CValue::Optional {
            inner: value.ctype(),
            value: Some(Box::new(value)),
        }
    }

    /// `None<T>` for the given inner type.
    pub fn none(inner: CType) -> Self {
        CValue::Optional { inner, value: None }
    }

    /// The runtime type of this value. Pure and total.
    pub fn ctype(&self) -> CType {
        match self {
            CValue::String(_) => CType::String,
            CValue::Int(_) => CType::Int,
            CValue::Float(_) => CType::Float,
            CValue::Boolean(_) => CType::Boolean,
            CValue::List { elem, .. } => CType::List(Box::new(elem.clone())),
            CValue::Map { key, value, .. } => {
                CType::Map(Box::new(key.clone()), Box::new(value.clone()))
            }
            CValue::Record(fields) => CType::Product(
                fields
                    .iter()
                    .map(|(name, v)| (name.clone(), v.ctype()))
                    .collect(),
            ),
            CValue::Union { variants, .. } => CType::Union(variants.clone()),
            CValue::Optional { inner, .. } => CType::Optional(Box::new(inner.clone())),
        }
    }

    /// Boolean view for condition positions. The type checker guarantees
    /// conditions are boolean; a `None` here is an internal invariant
    /// violation handled by the caller.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Field lookup on records. Returns `None` for non-records or
    /// missing fields.
    pub fn field(&self, name: &str) -> Option<&CValue> {
        match self {
            CValue::Record(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Render for string interpolation: strings appear bare, everything
    /// else as its display form.
    pub fn render_raw(&self) -> String {
        match self {
            CValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for CValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CValue::String(s) => write!(f, "{s:?}"),
            CValue::Int(n) => write!(f, "{n}"),
            CValue::Float(x) => write!(f, "{x}"),
            CValue::Boolean(b) => write!(f, "{b}"),
            CValue::List { items, .. } => {
                let body: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", body.join(", "))
            }
            CValue::Map { entries, .. } => {
                let body: Vec<String> =
                    entries.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", body.join(", "))
            }
            CValue::Record(fields) => {
                let body: Vec<String> =
                    fields.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", body.join(", "))
            }
            CValue::Union { tag, value, .. } => write!(f, "{tag}({value})"),
            CValue::Optional { value: Some(v), .. } => write!(f, "Some({v})"),
            CValue::Optional { value: None, .. } => write!(f, "None"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_reports_parallel_type() {
        let v = CValue::record(vec![
            ("id".to_string(), CValue::Int(1)),
            ("name".to_string(), CValue::String("Alice".to_string())),
        ]);
        let ty = v.ctype();
        match ty {
            CType::Product(fields) => {
                assert_eq!(fields.get("id"), Some(&CType::Int));
                assert_eq!(fields.get("name"), Some(&CType::String));
            }
            other => panic!("expected product type, got {other}"),
        }
    }

    #[test]
    fn test_empty_list_keeps_element_type() {
        let v = CValue::list(CType::Float, vec![]);
        assert_eq!(v.ctype(), CType::List(Box::new(CType::Float)));
    }

    #[test]
    fn test_none_keeps_inner_type() {
        let v = CValue::none(CType::String);
        assert_eq!(v.ctype(), CType::Optional(Box::new(CType::String)));
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(CType::String.zero_value(), CValue::String(String::new()));
        assert_eq!(CType::Int.zero_value(), CValue::Int(0));
        assert_eq!(CType::Boolean.zero_value(), CValue::Boolean(false));

        let list_zero = CType::List(Box::new(CType::Int)).zero_value();
        assert_eq!(list_zero, CValue::list(CType::Int, vec![]));

        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), CType::Int);
        let record_zero = CType::Product(fields).zero_value();
        assert_eq!(
            record_zero,
            CValue::record(vec![("n".to_string(), CValue::Int(0))])
        );
    }

    #[test]
    fn test_optional_zero_is_none() {
        let zero = CType::Optional(Box::new(CType::Int)).zero_value();
        assert_eq!(zero, CValue::none(CType::Int));
    }

    #[test]
    fn test_type_rendering() {
        let ty = CType::Map(
            Box::new(CType::String),
            Box::new(CType::List(Box::new(CType::Int))),
        );
        assert_eq!(ty.render(), "Map<String, List<Int>>");
        assert_eq!(CType::Optional(Box::new(CType::Float)).render(), "Float?");
    }
}

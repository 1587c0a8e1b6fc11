//! Host-type conversion layer.
//!
//! Maps host Rust types to [`CType`]/[`CValue`] and back. Injection is
//! total; extraction is fallible and reports the expected/found pair
//! instead of panicking.

use super::{CType, CValue};
use std::collections::HashMap;
use thiserror::Error;

/// Conversion failure between a host type and a runtime value.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("type mismatch: expected {expected}, found {found}")]
pub struct ConversionError {
    pub expected: CType,
    pub found: CType,
}

/// Host types with a statically known runtime type.
///
/// Composable: `Vec<A>` derives `List<derive(A)>`, maps derive
/// `Map<String, derive(V)>`, options derive `Optional<derive(T)>`.
pub trait CTyped {
    fn ctype() -> CType;
}

/// Inject a host value into the runtime value space.
pub trait IntoCValue: CTyped {
    fn into_cvalue(self) -> CValue;
}

/// Extract a host value from a runtime value.
pub trait FromCValue: CTyped + Sized {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError>;
}

fn mismatch<T: CTyped>(found: &CValue) -> ConversionError {
    ConversionError {
        expected: T::ctype(),
        found: found.ctype(),
    }
}

// ============================================================================
// Primitive impls
// ============================================================================

impl CTyped for String {
    fn ctype() -> CType {
        CType::String
    }
}

impl IntoCValue for String {
    fn into_cvalue(self) -> CValue {
        CValue::String(self)
    }
}

impl FromCValue for String {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError> {
        match value {
            CValue::String(s) => Ok(s),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl CTyped for i64 {
    fn ctype() -> CType {
        CType::Int
    }
}

impl IntoCValue for i64 {
    fn into_cvalue(self) -> CValue {
        CValue::Int(self)
    }
}

impl FromCValue for i64 {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError> {
        match value {
            CValue::Int(n) => Ok(n),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl CTyped for f64 {
    fn ctype() -> CType {
        CType::Float
    }
}

impl IntoCValue for f64 {
    fn into_cvalue(self) -> CValue {
        CValue::Float(self)
    }
}

impl FromCValue for f64 {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError> {
        match value {
            CValue::Float(x) => Ok(x),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl CTyped for bool {
    fn ctype() -> CType {
        CType::Boolean
    }
}

impl IntoCValue for bool {
    fn into_cvalue(self) -> CValue {
        CValue::Boolean(self)
    }
}

impl FromCValue for bool {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError> {
        match value {
            CValue::Boolean(b) => Ok(b),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

// ============================================================================
// Container impls
// ============================================================================

impl<T: CTyped> CTyped for Vec<T> {
    fn ctype() -> CType {
        CType::List(Box::new(T::ctype()))
    }
}

impl<T: IntoCValue> IntoCValue for Vec<T> {
    fn into_cvalue(self) -> CValue {
        CValue::list(
            T::ctype(),
            self.into_iter().map(IntoCValue::into_cvalue).collect(),
        )
    }
}

impl<T: FromCValue> FromCValue for Vec<T> {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError> {
        match value {
            CValue::List { items, .. } => items.into_iter().map(T::from_cvalue).collect(),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl<V: CTyped> CTyped for HashMap<String, V> {
    fn ctype() -> CType {
        CType::Map(Box::new(CType::String), Box::new(V::ctype()))
    }
}

impl<V: IntoCValue> IntoCValue for HashMap<String, V> {
    fn into_cvalue(self) -> CValue {
        CValue::map(
            CType::String,
            V::ctype(),
            self.into_iter()
                .map(|(k, v)| (CValue::String(k), v.into_cvalue()))
                .collect(),
        )
    }
}

impl<V: FromCValue> FromCValue for HashMap<String, V> {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError> {
        match value {
            CValue::Map { entries, .. } => entries
                .into_iter()
                .map(|(k, v)| {
                    let key = String::from_cvalue(k)?;
                    Ok((key, V::from_cvalue(v)?))
                })
                .collect(),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl<T: CTyped> CTyped for Option<T> {
    fn ctype() -> CType {
        CType::Optional(Box::new(T::ctype()))
    }
}

impl<T: IntoCValue> IntoCValue for Option<T> {
    fn into_cvalue(self) -> CValue {
        match self {
            Some(v) => CValue::Optional {
                inner: T::ctype(),
                value: Some(Box::new(v.into_cvalue())),
            },
            None => CValue::none(T::ctype()),
        }
    }
}

impl<T: FromCValue> FromCValue for Option<T> {
    fn from_cvalue(value: CValue) -> Result<Self, ConversionError> {
        match value {
            CValue::Optional { value: Some(v), .. } => Ok(Some(T::from_cvalue(*v)?)),
            CValue::Optional { value: None, .. } => Ok(None),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let v = "hello".to_string().into_cvalue();
        assert_eq!(String::from_cvalue(v).unwrap(), "hello");

        let v = 42i64.into_cvalue();
        assert_eq!(i64::from_cvalue(v).unwrap(), 42);
    }

    #[test]
    fn test_list_round_trip() {
        let v = vec![1i64, 2, 3].into_cvalue();
        assert_eq!(v.ctype(), CType::List(Box::new(CType::Int)));
        assert_eq!(Vec::<i64>::from_cvalue(v).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_option_round_trip() {
        let v = Some(2.5f64).into_cvalue();
        assert_eq!(Option::<f64>::from_cvalue(v).unwrap(), Some(2.5));

        let v = Option::<f64>::None.into_cvalue();
        assert_eq!(v.ctype(), CType::Optional(Box::new(CType::Float)));
        assert_eq!(Option::<f64>::from_cvalue(v).unwrap(), None);
    }

    #[test]
    fn test_extraction_mismatch_is_an_error() {
        let err = i64::from_cvalue(CValue::String("nope".to_string())).unwrap_err();
        assert_eq!(err.expected, CType::Int);
        assert_eq!(err.found, CType::String);
    }

    #[test]
    fn test_derived_container_types_compose() {
        assert_eq!(
            Vec::<Option<i64>>::ctype(),
            CType::List(Box::new(CType::Optional(Box::new(CType::Int))))
        );
    }
}

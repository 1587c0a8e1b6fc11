//! Canonical value hashing.
//!
//! Produces a deterministic SHA-256 digest for a value or an input map,
//! used as the cache key for module invocations. Two values hash equal
//! iff they compare equal: floats are encoded as IEEE-754 bit patterns,
//! map entries are sorted by their encoded key bytes, and record fields
//! iterate in `BTreeMap` order. Never iterates a `HashMap` directly.

use super::CValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// Encoding tags, one byte per variant.
const TAG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;
const TAG_LIST: u8 = 0x05;
const TAG_MAP: u8 = 0x06;
const TAG_RECORD: u8 = 0x07;
const TAG_UNION: u8 = 0x08;
const TAG_SOME: u8 = 0x09;
const TAG_NONE: u8 = 0x0a;

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Append the canonical encoding of `value` to `buf`.
pub fn encode_value(buf: &mut Vec<u8>, value: &CValue) {
    match value {
        CValue::String(s) => {
            buf.push(TAG_STRING);
            encode_str(buf, s);
        }
        CValue::Int(n) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&n.to_be_bytes());
        }
        CValue::Float(x) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&x.to_bits().to_be_bytes());
        }
        CValue::Boolean(b) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        CValue::List { items, .. } => {
            buf.push(TAG_LIST);
            buf.extend_from_slice(&(items.len() as u64).to_be_bytes());
            for item in items {
                encode_value(buf, item);
            }
        }
        CValue::Map { entries, .. } => {
            // Canonicalize: sort entries by encoded key so insertion
            // order never leaks into the digest.
            let mut encoded: Vec<(Vec<u8>, &CValue)> = entries
                .iter()
                .map(|(k, v)| {
                    let mut kb = Vec::new();
                    encode_value(&mut kb, k);
                    (kb, v)
                })
                .collect();
            encoded.sort_by(|a, b| a.0.cmp(&b.0));

            buf.push(TAG_MAP);
            buf.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
            for (kb, v) in encoded {
                buf.extend_from_slice(&kb);
                encode_value(buf, v);
            }
        }
        CValue::Record(fields) => {
            buf.push(TAG_RECORD);
            buf.extend_from_slice(&(fields.len() as u64).to_be_bytes());
            for (name, v) in fields {
                encode_str(buf, name);
                encode_value(buf, v);
            }
        }
        CValue::Union { tag, value, .. } => {
            buf.push(TAG_UNION);
            encode_str(buf, tag);
            encode_value(buf, value);
        }
        CValue::Optional { value: Some(v), .. } => {
            buf.push(TAG_SOME);
            encode_value(buf, v);
        }
        CValue::Optional { value: None, .. } => {
            buf.push(TAG_NONE);
        }
    }
}

/// SHA-256 digest of a single value's canonical encoding, hex-encoded.
pub fn canonical_value_hash(value: &CValue) -> String {
    let mut buf = Vec::new();
    encode_value(&mut buf, value);
    hex_digest(&buf)
}

/// Cache key for a module invocation: digest over the sorted
/// `(param name, value)` pairs.
pub fn canonical_input_hash(inputs: &BTreeMap<String, CValue>) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(inputs.len() as u64).to_be_bytes());
    for (name, value) in inputs {
        encode_str(&mut buf, name);
        encode_value(&mut buf, value);
    }
    hex_digest(&buf)
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CType;

    #[test]
    fn test_equal_values_hash_equal() {
        let a = CValue::record(vec![
            ("x".to_string(), CValue::Int(1)),
            ("y".to_string(), CValue::Float(2.0)),
        ]);
        let b = CValue::record(vec![
            ("y".to_string(), CValue::Float(2.0)),
            ("x".to_string(), CValue::Int(1)),
        ]);
        assert_eq!(canonical_value_hash(&a), canonical_value_hash(&b));
    }

    #[test]
    fn test_different_values_hash_differently() {
        let a = CValue::String("hello".to_string());
        let b = CValue::String("world".to_string());
        assert_ne!(canonical_value_hash(&a), canonical_value_hash(&b));
    }

    #[test]
    fn test_int_and_float_do_not_collide() {
        // 2 and 2.0 are distinct per their declared types
        let a = CValue::Int(2);
        let b = CValue::Float(2.0);
        assert_ne!(canonical_value_hash(&a), canonical_value_hash(&b));
    }

    #[test]
    fn test_map_entry_order_is_canonical() {
        let a = CValue::map(
            CType::String,
            CType::Int,
            vec![
                (CValue::String("b".to_string()), CValue::Int(2)),
                (CValue::String("a".to_string()), CValue::Int(1)),
            ],
        );
        let b = CValue::map(
            CType::String,
            CType::Int,
            vec![
                (CValue::String("a".to_string()), CValue::Int(1)),
                (CValue::String("b".to_string()), CValue::Int(2)),
            ],
        );
        assert_eq!(canonical_value_hash(&a), canonical_value_hash(&b));
    }

    #[test]
    fn test_input_hash_covers_param_names() {
        let mut a = BTreeMap::new();
        a.insert("text".to_string(), CValue::String("hi".to_string()));
        let mut b = BTreeMap::new();
        b.insert("other".to_string(), CValue::String("hi".to_string()));
        assert_ne!(canonical_input_hash(&a), canonical_input_hash(&b));
    }
}

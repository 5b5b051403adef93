//! Deterministic content hashing: canonical JSON, `payload_digest`, and
//! `inputs_hash`.

use serde::Serialize;
use serde::ser::{self, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors raised while canonicalizing or hashing a value.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// The value contained a `NaN` or infinite floating-point number, which
    /// has no canonical JSON representation.
    #[error("value contains a NaN or infinite number, which cannot be canonically hashed")]
    NonFiniteNumber,
    /// The value could not be serialized at all.
    #[error("failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize `value` to canonical JSON bytes.
///
/// Canonical JSON, per the content-hashing contract: object keys sorted
/// lexicographically (`serde_json::Map` is BTreeMap-backed without the
/// `preserve_order` feature, so this falls out of ordinary serialization),
/// `NaN`/infinite floats rejected outright, and floats with no fractional
/// part re-encoded as integers so `3.0` and `3` hash identically.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    reject_non_finite(value)?;
    let raw = serde_json::to_value(value)?;
    let normalized = normalize_numbers(raw);
    serde_json::to_vec(&normalized).map_err(HashError::from)
}

/// SHA-256 of `bytes`, lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_lower(&digest)
}

/// `payload_digest(value) = sha256(canonical_json(value))`, lowercase hex.
pub fn payload_digest<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let bytes = canonical_json(value)?;
    Ok(sha256_hex(&bytes))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_f64() {
                let f = n.as_f64().expect("checked is_f64");
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    return Value::from(f as i64);
                }
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k, normalize_numbers(v));
            }
            Value::Object(out)
        }
        other => other,
    }
}

fn reject_non_finite<T: Serialize + ?Sized>(value: &T) -> Result<(), HashError> {
    value
        .serialize(FiniteCheck)
        .map_err(|_: NonFinite| HashError::NonFiniteNumber)
}

/// A no-op [`Serializer`] that walks a value solely to reject non-finite
/// floats; `serde_json::to_value` silently maps `NaN`/`Infinity` to `null`,
/// which would hide the very values the content-hashing contract requires
/// us to reject.
struct FiniteCheck;

#[derive(Debug)]
struct NonFinite;

impl std::fmt::Display for NonFinite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("non-finite number")
    }
}

impl std::error::Error for NonFinite {}

impl ser::Error for NonFinite {
    fn custom<T: std::fmt::Display>(_msg: T) -> Self {
        NonFinite
    }
}

macro_rules! passthrough {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> Result<Self::Ok, Self::Error> {
                Ok(())
            }
        )*
    };
}

impl Serializer for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    passthrough!(
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
    );

    fn serialize_f32(self, v: f32) -> Result<Self::Ok, Self::Error> {
        if v.is_finite() { Ok(()) } else { Err(NonFinite) }
    }

    fn serialize_f64(self, v: f64) -> Result<Self::Ok, Self::Error> {
        if v.is_finite() { Ok(()) } else { Err(NonFinite) }
    }

    fn serialize_none(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Self::Ok, Self::Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        Ok(self)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Self::Error> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), NonFinite> {
        key.serialize(FiniteCheck)
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let value = json!({"b": 1, "a": 2});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn nested_objects_sort_keys() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": 3});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":3,"z":{"x":2,"y":1}}"#
        );
    }

    #[test]
    fn float_with_no_fraction_becomes_integer() {
        let value = json!({"n": 3.0});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"n":3}"#);
    }

    #[test]
    fn float_with_fraction_stays_float() {
        let value = json!({"n": 3.5});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"n":3.5}"#);
    }

    #[test]
    fn rejects_nan() {
        let err = canonical_json(&f64::NAN).unwrap_err();
        assert!(matches!(err, HashError::NonFiniteNumber));
    }

    #[test]
    fn rejects_infinity() {
        let err = canonical_json(&f64::INFINITY).unwrap_err();
        assert!(matches!(err, HashError::NonFiniteNumber));
    }

    #[test]
    fn rejects_nan_nested_in_object() {
        let err = canonical_json(&json!({"n": f64::NAN})).unwrap_err();
        assert!(matches!(err, HashError::NonFiniteNumber));
    }

    #[test]
    fn payload_digest_is_stable() {
        let a = payload_digest(&json!({"b": 1, "a": 2})).unwrap();
        let b = payload_digest(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b, "key order must not affect the digest");
    }

    #[test]
    fn payload_digest_changes_with_content() {
        let a = payload_digest(&json!({"a": 1})).unwrap();
        let b = payload_digest(&json!({"a": 2})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_hex_is_lowercase_and_64_chars() {
        let digest = sha256_hex(b"hello");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn sha256_known_vector() {
        // sha256("") = e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

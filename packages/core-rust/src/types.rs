use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Player identifier. Stable for the lifetime of the player.
pub type PlayerId = uuid::Uuid;

/// Secondary island identifier, derived from the player record.
pub type IslandId = i64;

/// Generic runtime value type for game-state payload entries.
///
/// Supports all JSON-compatible types plus binary data. Gameplay modules
/// store their state under string keys of a [`Payload`]; the storage layer
/// never interprets these values.
///
/// Externally tagged. In human-readable formats bytes are written as a
/// base64 string and non-finite floats as `inf`, `-inf` or `NaN`, so every
/// variant survives JSON and YAML as well as `MsgPack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(#[serde(with = "float_repr")] f64),
    /// JSON string (UTF-8).
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(#[serde(with = "bytes_repr")] Vec<u8>),
    /// JSON array (ordered sequence of values).
    Array(Vec<Value>),
    /// JSON object. `BTreeMap` keeps serialization order deterministic.
    Map(BTreeMap<String, Value>),
}

mod bytes_repr {
    use std::fmt;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serde_bytes::serialize(bytes, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(TextBytes)
        } else {
            serde_bytes::deserialize(deserializer)
        }
    }

    /// Accepts base64 text, or a plain integer array written by older files.
    struct TextBytes;

    impl<'de> Visitor<'de> for TextBytes {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a base64 string or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
            STANDARD.decode(v).map_err(E::custom)
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}

mod float_repr {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() || !serializer.is_human_readable() {
            serializer.serialize_f64(*value)
        } else {
            // JSON has no literal for these and would write `null`.
            serializer.collect_str(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(TextFloat)
        } else {
            f64::deserialize(deserializer)
        }
    }

    struct TextFloat;

    impl Visitor<'_> for TextFloat {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, `inf`, `-inf` or `NaN`")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        #[allow(clippy::cast_precision_loss)]
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        #[allow(clippy::cast_precision_loss)]
        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            v.parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

/// Opaque game-state blob carried by a player record.
pub type Payload = BTreeMap<String, Value>;

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            prop_oneof![
                any::<f64>().prop_filter("NaN never compares equal", |f| !f.is_nan()),
                Just(f64::INFINITY),
                Just(f64::NEG_INFINITY),
            ]
            .prop_map(Value::Float),
            "[ -~]{0,12}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z_]{1,6}", inner, 0..4).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn every_variant_survives_json(value in arb_value()) {
            let text = serde_json::to_string(&value).unwrap();
            prop_assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), value);
        }

        #[test]
        fn every_variant_survives_yaml(value in arb_value()) {
            let text = serde_yaml::to_string(&value).unwrap();
            prop_assert_eq!(serde_yaml::from_str::<Value>(&text).unwrap(), value);
        }

        #[test]
        fn every_variant_survives_msgpack(value in arb_value()) {
            let bytes = rmp_serde::to_vec_named(&value).unwrap();
            prop_assert_eq!(rmp_serde::from_slice::<Value>(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn text_formats_spell_out_bytes_and_infinities() {
        let json = serde_json::to_string(&Value::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(json, r#"{"Bytes":"AQID"}"#);
        let json = serde_json::to_string(&Value::Float(f64::NEG_INFINITY)).unwrap();
        assert_eq!(json, r#"{"Float":"-inf"}"#);
    }

    #[test]
    fn nan_survives_text_formats() {
        let json = serde_json::to_string(&Value::Float(f64::NAN)).unwrap();
        let Value::Float(back) = serde_json::from_str(&json).unwrap() else {
            panic!("not a float: {json}");
        };
        assert!(back.is_nan());

        let yaml = serde_yaml::to_string(&Value::Float(f64::NAN)).unwrap();
        let Value::Float(back) = serde_yaml::from_str(&yaml).unwrap() else {
            panic!("not a float: {yaml}");
        };
        assert!(back.is_nan());
    }

    #[test]
    fn integer_arrays_from_older_files_still_decode() {
        let value: Value = serde_json::from_str(r#"{"Bytes":[1,2,3]}"#).unwrap();
        assert_eq!(value, Value::Bytes(vec![1, 2, 3]));
    }
}

//! Self-describing JSON tree used to carry arbitrary vendor payloads end-to-end.
//!
//! Unlike a raw `serde_json::Value` passthrough, [`AnyValue`] is a closed set of
//! variants with structural equality, so callers can compare tool-call arguments
//! or vendor-carried metadata without reaching back into `serde_json`.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A self-describing JSON value.
///
/// Construction from [`serde_json::Value`] coerces each node to the first
/// matching variant in order: null, int, double, string, bool, array, object;
/// anything else becomes [`AnyValue::Unsupported`].
///
/// Object keys use a `BTreeMap` rather than the usual `HashMap` so that
/// structural equality does not depend on insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyValue {
    Null,
    Int(i64),
    Double(f64),
    String(String),
    Bool(bool),
    Array(Vec<AnyValue>),
    Object(BTreeMap<String, AnyValue>),
    /// Sentinel for host-constructed inputs that don't fit any other variant
    /// (e.g. NaN/infinite floats). Never produced when decoding network input.
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum AnyValueError {
    #[error("cannot encode unsupported value: {0}")]
    Unsupported(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnyValue {
    /// Builds an `AnyValue` tree from a loosely typed `serde_json::Value`.
    pub fn from_raw(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AnyValue::Null,
            serde_json::Value::Bool(b) => AnyValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AnyValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    AnyValue::Double(f)
                } else {
                    AnyValue::Unsupported(format!("{n:?}"))
                }
            }
            serde_json::Value::String(s) => AnyValue::String(s),
            serde_json::Value::Array(items) => {
                AnyValue::Array(items.into_iter().map(AnyValue::from_raw).collect())
            }
            serde_json::Value::Object(map) => AnyValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, AnyValue::from_raw(v)))
                    .collect(),
            ),
        }
    }

    /// Reconstructs a native, loosely typed `serde_json::Value` tree.
    ///
    /// Fails if any node is [`AnyValue::Unsupported`].
    pub fn to_raw(&self) -> Result<serde_json::Value, AnyValueError> {
        Ok(match self {
            AnyValue::Null => serde_json::Value::Null,
            AnyValue::Bool(b) => serde_json::Value::Bool(*b),
            AnyValue::Int(i) => serde_json::Value::Number((*i).into()),
            AnyValue::Double(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| AnyValueError::Unsupported(format!("{f}")))?,
            AnyValue::String(s) => serde_json::Value::String(s.clone()),
            AnyValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.to_raw()?);
                }
                serde_json::Value::Array(out)
            }
            AnyValue::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_raw()?);
                }
                serde_json::Value::Object(out)
            }
            AnyValue::Unsupported(debug) => {
                return Err(AnyValueError::Unsupported(debug.clone()))
            }
        })
    }

    /// Parses a JSON string directly into an `AnyValue`.
    pub fn parse(s: &str) -> Result<Self, AnyValueError> {
        let raw: serde_json::Value = serde_json::from_str(s)?;
        Ok(AnyValue::from_raw(raw))
    }

    /// Serializes this value to a JSON string.
    pub fn encode(&self) -> Result<String, AnyValueError> {
        Ok(serde_json::to_string(&self.to_raw()?)?)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AnyValue::Null)
    }
}

impl Default for AnyValue {
    fn default() -> Self {
        AnyValue::Null
    }
}

impl From<serde_json::Value> for AnyValue {
    fn from(value: serde_json::Value) -> Self {
        AnyValue::from_raw(value)
    }
}

// Manual Serialize/Deserialize: the wire shape is plain JSON (the variant tag
// is structural, not externally tagged), so callers can embed `AnyValue`
// directly inside other `#[derive(Serialize, Deserialize)]` wire types.
impl Serialize for AnyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AnyValue::Null => serializer.serialize_none(),
            AnyValue::Bool(b) => serializer.serialize_bool(*b),
            AnyValue::Int(i) => serializer.serialize_i64(*i),
            AnyValue::Double(f) => serializer.serialize_f64(*f),
            AnyValue::String(s) => serializer.serialize_str(s),
            AnyValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            AnyValue::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            AnyValue::Unsupported(debug) => {
                Err(serde::ser::Error::custom(format!("unsupported value: {debug}")))
            }
        }
    }
}

impl<'de> Deserialize<'de> for AnyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AnyValueVisitor;

        impl<'de> Visitor<'de> for AnyValueVisitor {
            type Value = AnyValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any valid JSON value")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(AnyValue::Null)
            }
            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(AnyValue::Null)
            }
            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(AnyValue::Bool(v))
            }
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(AnyValue::Int(v))
            }
            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                match i64::try_from(v) {
                    Ok(i) => Ok(AnyValue::Int(i)),
                    Err(_) => Ok(AnyValue::Double(v as f64)),
                }
            }
            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
                Ok(AnyValue::Double(v))
            }
            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(AnyValue::String(v.to_owned()))
            }
            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(AnyValue::String(v))
            }
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(AnyValue::Array(items))
            }
            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out = BTreeMap::new();
                while let Some((k, v)) = map.next_entry()? {
                    out.insert(k, v);
                }
                Ok(AnyValue::Object(out))
            }
        }

        deserializer.deserialize_any(AnyValueVisitor)
    }
}

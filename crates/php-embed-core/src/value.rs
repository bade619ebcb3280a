//! Host-side value model.
//!
//! [`HostValue`] is the closed set of shapes the host can exchange with
//! scripts. Everything that crosses the boundary is first expressed as a
//! `HostValue`, either directly, through the `From` conversions below, or by
//! serializing a record type with [`crate::ser::to_host_value`].
//!
//! Shapes without an engine representation are kept as
//! [`HostValue::Unsupported`] so that the codec can refuse them before any
//! native allocation happens.

use std::fmt;

use indexmap::IndexMap;
use serde::ser::{Error as _, SerializeMap};
use serde::{Serialize, Serializer};

/// Associative container, iterated in insertion order.
///
/// Equality ignores ordering, as for a hash map.
pub type HostMap = IndexMap<MapKey, HostValue>;

/// Key of an associative container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKey {
    /// Integer key.
    Int(i64),
    /// String key.
    Str(String),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Int(i) => write!(f, "{i}"),
            MapKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MapKey {
    fn from(value: i64) -> Self {
        MapKey::Int(value)
    }
}

impl From<i32> for MapKey {
    fn from(value: i32) -> Self {
        MapKey::Int(i64::from(value))
    }
}

impl From<&str> for MapKey {
    fn from(value: &str) -> Self {
        MapKey::Str(value.to_string())
    }
}

impl From<String> for MapKey {
    fn from(value: String) -> Self {
        MapKey::Str(value)
    }
}

/// A structured record: a type name plus its externally visible fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Name of the host type, for diagnostics.
    pub name: String,
    /// Visible fields in declaration order.
    pub fields: Vec<(String, HostValue)>,
}

impl Record {
    /// Create an empty record.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// A host value that can be exchanged with scripts.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    /// Absent or unit value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence, projected to an indexed array.
    List(Vec<HostValue>),
    /// Associative container, projected to an associative array.
    Map(HostMap),
    /// Structured record, projected to an object.
    Record(Record),
    /// A category with no engine representation.
    Unsupported {
        /// Name of the offending type.
        type_name: String,
    },
}

impl HostValue {
    /// Mark a host type as unsupported, using its type name for diagnostics.
    pub fn unsupported<T: ?Sized>() -> Self {
        HostValue::Unsupported {
            type_name: std::any::type_name::<T>().to_string(),
        }
    }

    /// Short name of the value's category.
    pub fn kind_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::String(_) => "string",
            HostValue::List(_) => "list",
            HostValue::Map(_) => "map",
            HostValue::Record(_) => "record",
            HostValue::Unsupported { .. } => "unsupported",
        }
    }

    /// Type name of the first unsupported value found, depth first.
    pub fn find_unsupported(&self) -> Option<&str> {
        match self {
            HostValue::Unsupported { type_name } => Some(type_name),
            HostValue::List(items) => items.iter().find_map(HostValue::find_unsupported),
            HostValue::Map(map) => map.values().find_map(HostValue::find_unsupported),
            HostValue::Record(record) => record
                .fields
                .iter()
                .find_map(|(_, value)| value.find_unsupported()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            HostValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HostMap> {
        match self {
            HostValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a string key in a map value.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.as_map()
            .and_then(|map| map.get(&MapKey::Str(key.to_string())))
    }
}

macro_rules! from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for HostValue {
            fn from(value: $ty) -> Self {
                HostValue::Int(i64::from(value))
            }
        })*
    };
}

from_signed!(i8, i16, i32, i64);

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<f32> for HostValue {
    fn from(value: f32) -> Self {
        HostValue::Float(f64::from(value))
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<()> for HostValue {
    fn from((): ()) -> Self {
        HostValue::Null
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(value: Vec<T>) -> Self {
        HostValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(HostValue::Null, Into::into)
    }
}

impl From<HostMap> for HostValue {
    fn from(value: HostMap) -> Self {
        HostValue::Map(value)
    }
}

impl From<Record> for HostValue {
    fn from(value: Record) -> Self {
        HostValue::Record(value)
    }
}

impl<K: Into<MapKey>, V: Into<HostValue>> FromIterator<(K, V)> for HostValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        HostValue::Map(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    HostValue::Int(i)
                } else if n.is_u64() {
                    HostValue::unsupported::<u64>()
                } else {
                    n.as_f64().map_or(HostValue::Null, HostValue::Float)
                }
            }
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::List(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(map) => HostValue::Map(
                map.into_iter()
                    .map(|(k, v)| (MapKey::Str(k), HostValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for HostValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            HostValue::Null => serializer.serialize_unit(),
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Int(i) => serializer.serialize_i64(*i),
            HostValue::Float(f) => serializer.serialize_f64(*f),
            HostValue::String(s) => serializer.serialize_str(s),
            HostValue::List(items) => items.serialize(serializer),
            HostValue::Map(map) => {
                let mut state = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    state.serialize_entry(&key.to_string(), value)?;
                }
                state.end()
            }
            HostValue::Record(record) => {
                let mut state = serializer.serialize_map(Some(record.fields.len()))?;
                for (name, value) in &record.fields {
                    state.serialize_entry(name, value)?;
                }
                state.end()
            }
            HostValue::Unsupported { type_name } => Err(S::Error::custom(format!(
                "Unable to serialize value of unknown type '{type_name}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_primitives() {
        assert_eq!(HostValue::from(42_i32), HostValue::Int(42));
        assert_eq!(HostValue::from(1.5_f64), HostValue::Float(1.5));
        assert_eq!(HostValue::from(true), HostValue::Bool(true));
        assert_eq!(HostValue::from("hi"), HostValue::String("hi".into()));
        assert_eq!(HostValue::from(()), HostValue::Null);
        assert_eq!(HostValue::from(None::<i64>), HostValue::Null);
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let a: HostValue = vec![(10, "this"), (20, "that")].into_iter().collect();
        let b: HostValue = vec![(20, "that"), (10, "this")].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_find_unsupported_nested() {
        let value = HostValue::List(vec![
            HostValue::Int(1),
            HostValue::List(vec![HostValue::unsupported::<fn()>()]),
        ]);
        assert_eq!(value.find_unsupported(), Some("fn()"));
        assert_eq!(HostValue::Int(1).find_unsupported(), None);
    }

    #[test]
    fn test_from_json() {
        let value = HostValue::from(serde_json::json!({
            "name": "test",
            "count": -3,
            "ratio": 0.5,
            "tags": ["a", "b"],
        }));

        assert_eq!(value.get("name"), Some(&HostValue::from("test")));
        assert_eq!(value.get("count"), Some(&HostValue::Int(-3)));
        assert_eq!(value.get("ratio"), Some(&HostValue::Float(0.5)));
        assert_eq!(
            value.get("tags"),
            Some(&HostValue::from(vec!["a", "b"]))
        );
    }

    #[test]
    fn test_from_json_large_unsigned() {
        let value = HostValue::from(serde_json::json!(u64::MAX));
        assert_eq!(value.find_unsupported(), Some("u64"));
    }

    #[test]
    fn test_serialize_to_json() {
        let value: HostValue = vec![(MapKey::Int(10), HostValue::from("this"))]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({"10": "this"}));
    }

    #[test]
    fn test_map_key_display() {
        assert_eq!(MapKey::Int(-7).to_string(), "-7");
        assert_eq!(MapKey::from("key").to_string(), "key");
    }
}

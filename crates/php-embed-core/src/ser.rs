//! `serde` serializer producing [`HostValue`]s.
//!
//! This is how record types reach scripts: any `Serialize` type is walked
//! into a [`HostValue`] tree, structs become [`Record`]s holding only the
//! fields serde exposes (`#[serde(skip)]` fields stay on the host side).
//!
//! Unsigned integers, byte buffers and maps keyed by anything other than an
//! integer or a string have no engine representation and fail with
//! [`CodecError::UnsupportedType`].

use serde::ser::{self, Serialize};

use php_embed_common::CodecError;

use crate::value::{HostMap, HostValue, MapKey, Record};

/// Convert any serializable host value into a [`HostValue`].
///
/// # Errors
///
/// Returns [`CodecError::UnsupportedType`] if the value contains a category
/// without an engine representation.
pub fn to_host_value<T: Serialize + ?Sized>(value: &T) -> Result<HostValue, CodecError> {
    value.serialize(ValueSerializer)
}

struct ValueSerializer;

fn variant_map(variant: &'static str, value: HostValue) -> HostValue {
    let mut map = HostMap::with_capacity(1);
    map.insert(MapKey::Str(variant.to_string()), value);
    HostValue::Map(map)
}

impl ser::Serializer for ValueSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    type SerializeSeq = SeqSerializer;
    type SerializeTuple = SeqSerializer;
    type SerializeTupleStruct = SeqSerializer;
    type SerializeTupleVariant = SeqSerializer;
    type SerializeMap = MapSerializer;
    type SerializeStruct = RecordSerializer;
    type SerializeStructVariant = RecordSerializer;

    fn serialize_bool(self, v: bool) -> Result<HostValue, CodecError> {
        Ok(HostValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<HostValue, CodecError> {
        Ok(HostValue::Int(i64::from(v)))
    }

    fn serialize_i16(self, v: i16) -> Result<HostValue, CodecError> {
        Ok(HostValue::Int(i64::from(v)))
    }

    fn serialize_i32(self, v: i32) -> Result<HostValue, CodecError> {
        Ok(HostValue::Int(i64::from(v)))
    }

    fn serialize_i64(self, v: i64) -> Result<HostValue, CodecError> {
        Ok(HostValue::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<HostValue, CodecError> {
        i64::try_from(v)
            .map(HostValue::Int)
            .map_err(|_| CodecError::unsupported("i128"))
    }

    fn serialize_u8(self, _v: u8) -> Result<HostValue, CodecError> {
        Err(CodecError::unsupported("u8"))
    }

    fn serialize_u16(self, _v: u16) -> Result<HostValue, CodecError> {
        Err(CodecError::unsupported("u16"))
    }

    fn serialize_u32(self, _v: u32) -> Result<HostValue, CodecError> {
        Err(CodecError::unsupported("u32"))
    }

    fn serialize_u64(self, _v: u64) -> Result<HostValue, CodecError> {
        Err(CodecError::unsupported("u64"))
    }

    fn serialize_u128(self, _v: u128) -> Result<HostValue, CodecError> {
        Err(CodecError::unsupported("u128"))
    }

    fn serialize_f32(self, v: f32) -> Result<HostValue, CodecError> {
        Ok(HostValue::Float(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> Result<HostValue, CodecError> {
        Ok(HostValue::Float(v))
    }

    fn serialize_char(self, v: char) -> Result<HostValue, CodecError> {
        Ok(HostValue::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<HostValue, CodecError> {
        Ok(HostValue::String(v.to_string()))
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<HostValue, CodecError> {
        Err(CodecError::unsupported("&[u8]"))
    }

    fn serialize_none(self) -> Result<HostValue, CodecError> {
        Ok(HostValue::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<HostValue, CodecError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<HostValue, CodecError> {
        Ok(HostValue::Null)
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<HostValue, CodecError> {
        Ok(HostValue::Record(Record::new(name)))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<HostValue, CodecError> {
        Ok(HostValue::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<HostValue, CodecError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<HostValue, CodecError> {
        Ok(variant_map(variant, value.serialize(ValueSerializer)?))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqSerializer, CodecError> {
        Ok(SeqSerializer {
            items: Vec::with_capacity(len.unwrap_or(0)),
            variant: None,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqSerializer, CodecError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqSerializer, CodecError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqSerializer, CodecError> {
        Ok(SeqSerializer {
            items: Vec::with_capacity(len),
            variant: Some(variant),
        })
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapSerializer, CodecError> {
        Ok(MapSerializer {
            map: HostMap::with_capacity(len.unwrap_or(0)),
            pending_key: None,
        })
    }

    fn serialize_struct(
        self,
        name: &'static str,
        len: usize,
    ) -> Result<RecordSerializer, CodecError> {
        Ok(RecordSerializer {
            record: Record {
                name: name.to_string(),
                fields: Vec::with_capacity(len),
            },
            variant: None,
        })
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<RecordSerializer, CodecError> {
        Ok(RecordSerializer {
            record: Record {
                name: name.to_string(),
                fields: Vec::with_capacity(len),
            },
            variant: Some(variant),
        })
    }
}

pub(crate) struct SeqSerializer {
    items: Vec<HostValue>,
    variant: Option<&'static str>,
}

impl SeqSerializer {
    fn finish(self) -> HostValue {
        let list = HostValue::List(self.items);
        match self.variant {
            Some(variant) => variant_map(variant, list),
            None => list,
        }
    }
}

impl ser::SerializeSeq for SeqSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<HostValue, CodecError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<HostValue, CodecError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<HostValue, CodecError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleVariant for SeqSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<HostValue, CodecError> {
        Ok(self.finish())
    }
}

pub(crate) struct MapSerializer {
    map: HostMap,
    pending_key: Option<MapKey>,
}

impl ser::SerializeMap for MapSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CodecError> {
        self.pending_key = Some(key.serialize(KeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| CodecError::Custom("map value serialized before its key".into()))?;
        self.map.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<HostValue, CodecError> {
        Ok(HostValue::Map(self.map))
    }
}

pub(crate) struct RecordSerializer {
    record: Record,
    variant: Option<&'static str>,
}

impl ser::SerializeStruct for RecordSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        self.record
            .fields
            .push((key.to_string(), value.serialize(ValueSerializer)?));
        Ok(())
    }

    fn end(self) -> Result<HostValue, CodecError> {
        let record = HostValue::Record(self.record);
        Ok(match self.variant {
            Some(variant) => variant_map(variant, record),
            None => record,
        })
    }
}

impl ser::SerializeStructVariant for RecordSerializer {
    type Ok = HostValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        ser::SerializeStruct::serialize_field(self, key, value)
    }

    fn end(self) -> Result<HostValue, CodecError> {
        ser::SerializeStruct::end(self)
    }
}

/// Serializer for map keys: only integers and strings are accepted.
struct KeySerializer;

fn unsupported_key(type_name: &str) -> CodecError {
    CodecError::unsupported(format!("map keyed by {type_name}"))
}

impl ser::Serializer for KeySerializer {
    type Ok = MapKey;
    type Error = CodecError;

    type SerializeSeq = ser::Impossible<MapKey, CodecError>;
    type SerializeTuple = ser::Impossible<MapKey, CodecError>;
    type SerializeTupleStruct = ser::Impossible<MapKey, CodecError>;
    type SerializeTupleVariant = ser::Impossible<MapKey, CodecError>;
    type SerializeMap = ser::Impossible<MapKey, CodecError>;
    type SerializeStruct = ser::Impossible<MapKey, CodecError>;
    type SerializeStructVariant = ser::Impossible<MapKey, CodecError>;

    fn serialize_bool(self, _v: bool) -> Result<MapKey, CodecError> {
        Err(unsupported_key("bool"))
    }

    fn serialize_i8(self, v: i8) -> Result<MapKey, CodecError> {
        Ok(MapKey::Int(i64::from(v)))
    }

    fn serialize_i16(self, v: i16) -> Result<MapKey, CodecError> {
        Ok(MapKey::Int(i64::from(v)))
    }

    fn serialize_i32(self, v: i32) -> Result<MapKey, CodecError> {
        Ok(MapKey::Int(i64::from(v)))
    }

    fn serialize_i64(self, v: i64) -> Result<MapKey, CodecError> {
        Ok(MapKey::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<MapKey, CodecError> {
        i64::try_from(v)
            .map(MapKey::Int)
            .map_err(|_| unsupported_key("i128"))
    }

    fn serialize_u8(self, _v: u8) -> Result<MapKey, CodecError> {
        Err(unsupported_key("u8"))
    }

    fn serialize_u16(self, _v: u16) -> Result<MapKey, CodecError> {
        Err(unsupported_key("u16"))
    }

    fn serialize_u32(self, _v: u32) -> Result<MapKey, CodecError> {
        Err(unsupported_key("u32"))
    }

    fn serialize_u64(self, _v: u64) -> Result<MapKey, CodecError> {
        Err(unsupported_key("u64"))
    }

    fn serialize_u128(self, _v: u128) -> Result<MapKey, CodecError> {
        Err(unsupported_key("u128"))
    }

    fn serialize_f32(self, _v: f32) -> Result<MapKey, CodecError> {
        Err(unsupported_key("f32"))
    }

    fn serialize_f64(self, _v: f64) -> Result<MapKey, CodecError> {
        Err(unsupported_key("f64"))
    }

    fn serialize_char(self, v: char) -> Result<MapKey, CodecError> {
        Ok(MapKey::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<MapKey, CodecError> {
        Ok(MapKey::Str(v.to_string()))
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<MapKey, CodecError> {
        Err(unsupported_key("&[u8]"))
    }

    fn serialize_none(self) -> Result<MapKey, CodecError> {
        Err(unsupported_key("Option"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<MapKey, CodecError> {
        Err(unsupported_key("Option"))
    }

    fn serialize_unit(self) -> Result<MapKey, CodecError> {
        Err(unsupported_key("()"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<MapKey, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<MapKey, CodecError> {
        Ok(MapKey::Str(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<MapKey, CodecError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<MapKey, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CodecError> {
        Err(unsupported_key("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CodecError> {
        Err(unsupported_key("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CodecError> {
        Err(unsupported_key("map"))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CodecError> {
        Err(unsupported_key(name))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Visitor {
        name: String,
        visits: i32,
        #[serde(skip)]
        #[allow(dead_code)]
        secret: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_struct_to_record() {
        let visitor = Visitor {
            name: "alice".into(),
            visits: 3,
            secret: "hidden".into(),
            tags: vec!["a".into()],
        };

        let value = to_host_value(&visitor).unwrap();
        let HostValue::Record(record) = value else {
            panic!("expected record");
        };

        assert_eq!(record.name, "Visitor");
        let names: Vec<&str> = record.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["name", "visits", "tags"]);
    }

    #[test]
    fn test_int_keyed_map() {
        let mut map = BTreeMap::new();
        map.insert(10_i64, "this");
        map.insert(20_i64, "that");

        let value = to_host_value(&map).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map.get(&MapKey::Int(10)), Some(&HostValue::from("this")));
        assert_eq!(map.get(&MapKey::Int(20)), Some(&HostValue::from("that")));
    }

    #[test]
    fn test_wide_int_keyed_map() {
        let mut map = BTreeMap::new();
        map.insert(5_i128, "five");
        let value = to_host_value(&map).unwrap();
        assert_eq!(
            value.as_map().unwrap().get(&MapKey::Int(5)),
            Some(&HostValue::from("five"))
        );

        let mut map = BTreeMap::new();
        map.insert(i128::MAX, "too big");
        let err = to_host_value(&map).unwrap_err();
        assert_eq!(err, CodecError::unsupported("map keyed by i128"));

        let mut map = BTreeMap::new();
        map.insert(1_u128, "unsigned");
        let err = to_host_value(&map).unwrap_err();
        assert_eq!(err, CodecError::unsupported("map keyed by u128"));
    }

    #[test]
    fn test_bool_keyed_map_is_unsupported() {
        let mut map = HashMap::new();
        map.insert(true, "yes");

        let err = to_host_value(&map).unwrap_err();
        assert_eq!(err, CodecError::unsupported("map keyed by bool"));
    }

    #[test]
    fn test_unsigned_is_unsupported() {
        let err = to_host_value(&7_u32).unwrap_err();
        assert_eq!(err, CodecError::unsupported("u32"));

        let err = to_host_value(&vec![1_i64, 2]).map(|_| ()).err();
        assert!(err.is_none());
    }

    #[test]
    fn test_option_and_unit() {
        assert_eq!(to_host_value(&None::<i32>).unwrap(), HostValue::Null);
        assert_eq!(to_host_value(&Some(5_i32)).unwrap(), HostValue::Int(5));
        assert_eq!(to_host_value(&()).unwrap(), HostValue::Null);
    }

    #[derive(Serialize)]
    enum Shape {
        Empty,
        Circle(f64),
    }

    #[test]
    fn test_enum_variants() {
        assert_eq!(
            to_host_value(&Shape::Empty).unwrap(),
            HostValue::from("Empty")
        );
        let circle = to_host_value(&Shape::Circle(2.0)).unwrap();
        assert_eq!(circle.get("Circle"), Some(&HostValue::Float(2.0)));
    }
}

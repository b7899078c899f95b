// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Serializer/Deserializer implementations for `value::Value`.
//!
//! Instances convert to their state (or their constructor arguments if they
//! have none), placeholders to their captured attributes, and bare classes
//! to their dotted name.

use std::fmt;
use std::vec;
use std::result::Result as StdResult;
use std::collections::{btree_map, BTreeMap};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{de, ser, forward_to_deserialize_any};
use serde::de::{DeserializeOwned, DeserializeSeed, Visitor};
use serde::ser::{Serialize, SerializeMap as _, SerializeSeq as _, SerializeTuple as _};

use crate::error::{Error, ErrorCode, Result};
use crate::value::{Value, HashableValue};

fn serialize_bigint<S: ser::Serializer>(i: &BigInt, s: S) -> StdResult<S::Ok, S::Error> {
    if let Some(i) = i.to_i64() {
        s.serialize_i64(i)
    } else if let Some(u) = i.to_u64() {
        s.serialize_u64(u)
    } else if let Some(i) = i.to_i128() {
        s.serialize_i128(i)
    } else if let Some(u) = i.to_u128() {
        s.serialize_u128(u)
    } else {
        Err(ser::Error::custom("integer too large"))
    }
}

impl Serialize for Value {
    fn serialize<S: ser::Serializer>(&self, s: S) -> StdResult<S::Ok, S::Error> {
        match *self {
            Value::None => s.serialize_none(),
            Value::Bool(b) => s.serialize_bool(b),
            Value::I64(i) => s.serialize_i64(i),
            Value::Int(ref i) => serialize_bigint(i, s),
            Value::F64(f) => s.serialize_f64(f),
            Value::Bytes(ref b) => s.serialize_bytes(b),
            Value::String(ref string) => s.serialize_str(string),
            Value::List(ref l) => s.collect_seq(l),
            Value::Tuple(ref t) => {
                let mut tup = s.serialize_tuple(t.len())?;
                for item in t {
                    tup.serialize_element(item)?;
                }
                tup.end()
            }
            Value::Set(ref set) | Value::FrozenSet(ref set) => s.collect_seq(set),
            Value::Dict(ref d) => s.collect_map(d),
            Value::Class(ref class) => s.collect_str(class),
            Value::Object(ref obj) => match obj.state {
                Some(ref state) => state.serialize(s),
                None => {
                    let mut seq = s.serialize_seq(Some(obj.args.len()))?;
                    for arg in &obj.args {
                        seq.serialize_element(arg)?;
                    }
                    seq.end()
                }
            },
            Value::Unresolved(ref u) => {
                let mut map = s.serialize_map(Some(u.dict.len()))?;
                for (key, value) in &u.dict {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl Serialize for HashableValue {
    fn serialize<S: ser::Serializer>(&self, s: S) -> StdResult<S::Ok, S::Error> {
        match *self {
            HashableValue::None => s.serialize_none(),
            HashableValue::Bool(b) => s.serialize_bool(b),
            HashableValue::I64(i) => s.serialize_i64(i),
            HashableValue::Int(ref i) => serialize_bigint(i, s),
            HashableValue::F64(f) => s.serialize_f64(f),
            HashableValue::Bytes(ref b) => s.serialize_bytes(b),
            HashableValue::String(ref string) => s.serialize_str(string),
            HashableValue::FrozenSet(ref set) => s.collect_seq(set),
            HashableValue::Tuple(ref t) => {
                let mut tup = s.serialize_tuple(t.len())?;
                for item in t {
                    tup.serialize_element(item)?;
                }
                tup.end()
            }
            HashableValue::Class(ref class) => s.collect_str(class),
            ref other => other.clone().into_value().serialize(s),
        }
    }
}

impl<'de> de::Deserialize<'de> for Value {
    #[inline]
    fn deserialize<D: de::Deserializer<'de>>(deser: D) -> StdResult<Value, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
                fmt.write_str("any valid Python value")
            }

            #[inline]
            fn visit_bool<E>(self, value: bool) -> StdResult<Value, E> {
                Ok(Value::Bool(value))
            }

            #[inline]
            fn visit_i64<E>(self, value: i64) -> StdResult<Value, E> {
                Ok(Value::I64(value))
            }

            #[inline]
            fn visit_u64<E>(self, value: u64) -> StdResult<Value, E> {
                if value < 0x8000_0000_0000_0000 {
                    Ok(Value::I64(value as i64))
                } else {
                    Ok(Value::Int(BigInt::from(value)))
                }
            }

            #[inline]
            fn visit_i128<E>(self, value: i128) -> StdResult<Value, E> {
                Ok(Value::Int(BigInt::from(value)))
            }

            #[inline]
            fn visit_u128<E>(self, value: u128) -> StdResult<Value, E> {
                Ok(Value::Int(BigInt::from(value)))
            }

            #[inline]
            fn visit_f64<E>(self, value: f64) -> StdResult<Value, E> {
                Ok(Value::F64(value))
            }

            #[inline]
            fn visit_str<E: de::Error>(self, value: &str) -> StdResult<Value, E> {
                Ok(Value::String(value.into()))
            }

            #[inline]
            fn visit_string<E>(self, value: String) -> StdResult<Value, E> {
                Ok(Value::String(value))
            }

            #[inline]
            fn visit_bytes<E: de::Error>(self, value: &[u8]) -> StdResult<Value, E> {
                Ok(Value::Bytes(value.to_vec()))
            }

            #[inline]
            fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> StdResult<Value, E> {
                Ok(Value::Bytes(value))
            }

            #[inline]
            fn visit_none<E>(self) -> StdResult<Value, E> {
                Ok(Value::None)
            }

            #[inline]
            fn visit_some<D: de::Deserializer<'de>>(self, deser: D) -> StdResult<Value, D::Error> {
                de::Deserialize::deserialize(deser)
            }

            #[inline]
            fn visit_unit<E>(self) -> StdResult<Value, E> {
                Ok(Value::None)
            }

            #[inline]
            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> StdResult<Value, A::Error> {
                let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
                while let Some(value) = seq.next_element()? {
                    values.push(value);
                }
                Ok(Value::List(values))
            }

            #[inline]
            fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> StdResult<Value, A::Error> {
                let mut values = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<HashableValue, Value>()? {
                    values.insert(key, value);
                }
                Ok(Value::Dict(values))
            }
        }

        deser.deserialize_any(ValueVisitor)
    }
}

impl<'de> de::Deserialize<'de> for HashableValue {
    #[inline]
    fn deserialize<D: de::Deserializer<'de>>(deser: D) -> StdResult<HashableValue, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = HashableValue;

            fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
                fmt.write_str("a hashable Python value")
            }

            #[inline]
            fn visit_bool<E>(self, value: bool) -> StdResult<HashableValue, E> {
                Ok(HashableValue::Bool(value))
            }

            #[inline]
            fn visit_i64<E>(self, value: i64) -> StdResult<HashableValue, E> {
                Ok(HashableValue::I64(value))
            }

            #[inline]
            fn visit_u64<E>(self, value: u64) -> StdResult<HashableValue, E> {
                if value < 0x8000_0000_0000_0000 {
                    Ok(HashableValue::I64(value as i64))
                } else {
                    Ok(HashableValue::Int(BigInt::from(value)))
                }
            }

            #[inline]
            fn visit_f64<E>(self, value: f64) -> StdResult<HashableValue, E> {
                Ok(HashableValue::F64(value))
            }

            #[inline]
            fn visit_str<E: de::Error>(self, value: &str) -> StdResult<HashableValue, E> {
                Ok(HashableValue::String(value.into()))
            }

            #[inline]
            fn visit_string<E>(self, value: String) -> StdResult<HashableValue, E> {
                Ok(HashableValue::String(value))
            }

            #[inline]
            fn visit_bytes<E: de::Error>(self, value: &[u8]) -> StdResult<HashableValue, E> {
                Ok(HashableValue::Bytes(value.to_vec()))
            }

            #[inline]
            fn visit_none<E>(self) -> StdResult<HashableValue, E> {
                Ok(HashableValue::None)
            }

            #[inline]
            fn visit_some<D: de::Deserializer<'de>>(self, deser: D)
                                                    -> StdResult<HashableValue, D::Error> {
                de::Deserialize::deserialize(deser)
            }

            #[inline]
            fn visit_unit<E>(self) -> StdResult<HashableValue, E> {
                Ok(HashableValue::None)
            }

            #[inline]
            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A)
                                                -> StdResult<HashableValue, A::Error> {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element()? {
                    values.push(value);
                }
                Ok(HashableValue::Tuple(values))
            }
        }

        deser.deserialize_any(ValueVisitor)
    }
}

/// Deserializes a decoded value into any serde supported value.
pub struct Deserializer {
    value: Option<Value>,
}

impl Deserializer {
    /// Creates a new deserializer instance for deserializing the specified value.
    pub fn new(value: Value) -> Deserializer {
        Deserializer { value: Some(value) }
    }

    fn take(&mut self) -> Result<Value> {
        match self.value.take() {
            Some(value) => Ok(value),
            None => Err(de::Error::custom("value already consumed")),
        }
    }
}

impl<'de, 'a> de::Deserializer<'de> for &'a mut Deserializer {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.take()? {
            Value::None => visitor.visit_unit(),
            Value::Bool(v) => visitor.visit_bool(v),
            Value::I64(v) => visitor.visit_i64(v),
            Value::Int(v) => {
                if let Some(i) = v.to_i64() {
                    visitor.visit_i64(i)
                } else if let Some(u) = v.to_u64() {
                    visitor.visit_u64(u)
                } else {
                    Err(Error::Syntax(ErrorCode::InvalidValue("integer too large".into())))
                }
            }
            Value::F64(v) => visitor.visit_f64(v),
            Value::Bytes(v) => visitor.visit_byte_buf(v),
            Value::String(v) => visitor.visit_string(v),
            Value::List(v) | Value::Tuple(v) => visitor.visit_seq(SeqDeserializer::new(v)),
            Value::Set(v) | Value::FrozenSet(v) => {
                let v: Vec<_> = v.into_iter().map(HashableValue::into_value).collect();
                visitor.visit_seq(SeqDeserializer::new(v))
            }
            Value::Dict(v) => visitor.visit_map(MapDeserializer::new(v)),
            Value::Class(class) => visitor.visit_string(class.key()),
            Value::Object(obj) => match obj.state {
                Some(state) => {
                    self.value = Some(state);
                    self.deserialize_any(visitor)
                }
                None => visitor.visit_seq(SeqDeserializer::new(obj.args)),
            },
            Value::Unresolved(u) => visitor.visit_map(MapDeserializer::new(u.dict)),
        }
    }

    #[inline]
    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Some(Value::None) => {
                self.value = None;
                visitor.visit_none()
            }
            _ => visitor.visit_some(self),
        }
    }

    #[inline]
    fn deserialize_newtype_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V)
                                                   -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    // We use tuples for enums:
    // Variant             ('Variant',)
    // Variant(T)          ('Variant', T)
    // Variant(T1, T2)     ('Variant', [T1, T2])
    // Variant { x: T }    ('Variant', {'x': T})
    // The bare string and one-entry dict forms are accepted as well.
    #[inline]
    fn deserialize_enum<V: Visitor<'de>>(self, _name: &'static str,
                                         _variants: &'static [&'static str],
                                         visitor: V) -> Result<V::Value> {
        visitor.visit_enum(self)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map struct
        identifier ignored_any
    }
}

impl<'de, 'a> de::EnumAccess<'de> for &'a mut Deserializer {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self)> {
        let (name, payload) = match self.take()? {
            Value::Tuple(v) | Value::List(v) => {
                let mut items = v.into_iter();
                match (items.next(), items.next(), items.next()) {
                    (Some(name), payload, None) => (name, payload),
                    _ => return Err(Error::Syntax(ErrorCode::Structure(
                        "enums must be tuples of one or two items".into()))),
                }
            }
            Value::String(name) => (Value::String(name), None),
            Value::Dict(d) if d.len() == 1 => match d.into_iter().next() {
                Some((name, payload)) => (name.into_value(), Some(payload)),
                None => return Err(de::Error::custom("empty enum dict")),
            },
            _ => return Err(Error::Syntax(ErrorCode::Structure("enums must be tuples".into()))),
        };
        let variant = seed.deserialize(&mut Deserializer::new(name))?;
        self.value = payload;
        Ok((variant, self))
    }
}

impl<'de, 'a> de::VariantAccess<'de> for &'a mut Deserializer {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        de::Deserializer::deserialize_any(self, visitor)
    }

    fn struct_variant<V: Visitor<'de>>(self, _fields: &'static [&'static str], visitor: V)
                                       -> Result<V::Value> {
        de::Deserializer::deserialize_any(self, visitor)
    }
}

struct SeqDeserializer {
    iter: vec::IntoIter<Value>,
}

impl SeqDeserializer {
    fn new(values: Vec<Value>) -> SeqDeserializer {
        SeqDeserializer { iter: values.into_iter() }
    }
}

impl<'de> de::SeqAccess<'de> for SeqDeserializer {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        match self.iter.next() {
            Some(value) => seed.deserialize(&mut Deserializer::new(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct MapDeserializer {
    iter: btree_map::IntoIter<HashableValue, Value>,
    value: Option<Value>,
}

impl MapDeserializer {
    fn new(map: BTreeMap<HashableValue, Value>) -> MapDeserializer {
        MapDeserializer { iter: map.into_iter(), value: None }
    }
}

impl<'de> de::MapAccess<'de> for MapDeserializer {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(&mut Deserializer::new(key.into_value())).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        match self.value.take() {
            Some(value) => seed.deserialize(&mut Deserializer::new(value)),
            None => Err(de::Error::custom("map value requested before key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

/// A `serde::Serializer` that serializes a `Serialize`e into a `Value`.
pub struct Serializer;

impl ser::Serializer for Serializer {
    type Ok = Value;
    type Error = Error;

    type SerializeSeq = SerializeVec;
    type SerializeTuple = SerializeVec;
    type SerializeTupleStruct = SerializeVec;
    type SerializeTupleVariant = SerializeTupleVariant;
    type SerializeMap = SerializeMap;
    type SerializeStruct = SerializeMap;
    type SerializeStructVariant = SerializeStructVariant;

    #[inline]
    fn serialize_bool(self, value: bool) -> Result<Value> {
        Ok(Value::Bool(value))
    }

    #[inline]
    fn serialize_i8(self, value: i8) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    #[inline]
    fn serialize_i16(self, value: i16) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    #[inline]
    fn serialize_i32(self, value: i32) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    #[inline]
    fn serialize_i64(self, value: i64) -> Result<Value> {
        Ok(Value::I64(value))
    }

    #[inline]
    fn serialize_i128(self, value: i128) -> Result<Value> {
        Ok(match value.to_i64() {
            Some(i) => Value::I64(i),
            None => Value::Int(BigInt::from(value)),
        })
    }

    #[inline]
    fn serialize_u8(self, value: u8) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    #[inline]
    fn serialize_u16(self, value: u16) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    #[inline]
    fn serialize_u32(self, value: u32) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    #[inline]
    fn serialize_u64(self, value: u64) -> Result<Value> {
        if value < 0x8000_0000_0000_0000 {
            Ok(Value::I64(value as i64))
        } else {
            Ok(Value::Int(BigInt::from(value)))
        }
    }

    #[inline]
    fn serialize_u128(self, value: u128) -> Result<Value> {
        Ok(match value.to_i64() {
            Some(i) => Value::I64(i),
            None => Value::Int(BigInt::from(value)),
        })
    }

    #[inline]
    fn serialize_f32(self, value: f32) -> Result<Value> {
        Ok(Value::F64(value.into()))
    }

    #[inline]
    fn serialize_f64(self, value: f64) -> Result<Value> {
        Ok(Value::F64(value))
    }

    #[inline]
    fn serialize_char(self, value: char) -> Result<Value> {
        Ok(Value::String(value.to_string()))
    }

    #[inline]
    fn serialize_str(self, value: &str) -> Result<Value> {
        Ok(Value::String(value.into()))
    }

    #[inline]
    fn serialize_bytes(self, value: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(value.to_vec()))
    }

    #[inline]
    fn serialize_none(self) -> Result<Value> {
        Ok(Value::None)
    }

    #[inline]
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value> {
        value.serialize(self)
    }

    #[inline]
    fn serialize_unit(self) -> Result<Value> {
        // Although Python has an empty tuple, we use None here for compatibility
        // with other serialization formats.
        Ok(Value::None)
    }

    #[inline]
    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value> {
        Ok(Value::Tuple(Vec::new()))
    }

    #[inline]
    fn serialize_unit_variant(self, _name: &'static str, _variant_index: u32,
                              variant: &'static str) -> Result<Value> {
        Ok(Value::Tuple(vec![Value::String(variant.into())]))
    }

    #[inline]
    fn serialize_newtype_struct<T: Serialize + ?Sized>(self, _name: &'static str, value: &T)
                                                       -> Result<Value> {
        value.serialize(self)
    }

    #[inline]
    fn serialize_newtype_variant<T: Serialize + ?Sized>(self, _name: &'static str, _variant_index: u32,
                                                        variant: &'static str, value: &T)
                                                        -> Result<Value> {
        Ok(Value::Tuple(vec![Value::String(variant.into()), to_value(value)?]))
    }

    #[inline]
    fn serialize_seq(self, len: Option<usize>) -> Result<SerializeVec> {
        Ok(SerializeVec { items: Vec::with_capacity(len.unwrap_or(0)), tuple: false })
    }

    #[inline]
    fn serialize_tuple(self, len: usize) -> Result<SerializeVec> {
        Ok(SerializeVec { items: Vec::with_capacity(len), tuple: true })
    }

    #[inline]
    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SerializeVec> {
        self.serialize_tuple(len)
    }

    #[inline]
    fn serialize_tuple_variant(self, _name: &'static str, _variant_index: u32,
                               variant: &'static str, len: usize) -> Result<SerializeTupleVariant> {
        Ok(SerializeTupleVariant { variant, items: Vec::with_capacity(len) })
    }

    #[inline]
    fn serialize_map(self, _len: Option<usize>) -> Result<SerializeMap> {
        Ok(SerializeMap { map: BTreeMap::new(), key: None })
    }

    #[inline]
    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<SerializeMap> {
        self.serialize_map(Some(len))
    }

    #[inline]
    fn serialize_struct_variant(self, _name: &'static str, _variant_index: u32,
                                variant: &'static str, _len: usize) -> Result<SerializeStructVariant> {
        Ok(SerializeStructVariant { variant, map: BTreeMap::new() })
    }
}

#[doc(hidden)]
pub struct SerializeVec {
    items: Vec<Value>,
    tuple: bool,
}

#[doc(hidden)]
pub struct SerializeTupleVariant {
    variant: &'static str,
    items: Vec<Value>,
}

#[doc(hidden)]
pub struct SerializeMap {
    map: BTreeMap<HashableValue, Value>,
    key: Option<HashableValue>,
}

#[doc(hidden)]
pub struct SerializeStructVariant {
    variant: &'static str,
    map: BTreeMap<HashableValue, Value>,
}

impl ser::SerializeSeq for SerializeVec {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.items.push(to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(if self.tuple { Value::Tuple(self.items) } else { Value::List(self.items) })
    }
}

impl ser::SerializeTuple for SerializeVec {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SerializeVec {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleVariant for SerializeTupleVariant {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.items.push(to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Tuple(vec![Value::String(self.variant.into()), Value::List(self.items)]))
    }
}

impl ser::SerializeMap for SerializeMap {
    type Ok = Value;
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<()> {
        self.key = Some(to_value(key)?.into_hashable()?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        match self.key.take() {
            Some(key) => {
                self.map.insert(key, to_value(value)?);
                Ok(())
            }
            None => Err(ser::Error::custom("map value serialized before key")),
        }
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Dict(self.map))
    }
}

impl ser::SerializeStruct for SerializeMap {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T)
                                              -> Result<()> {
        self.map.insert(HashableValue::String(key.into()), to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Dict(self.map))
    }
}

impl ser::SerializeStructVariant for SerializeStructVariant {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T)
                                              -> Result<()> {
        self.map.insert(HashableValue::String(key.into()), to_value(value)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Tuple(vec![Value::String(self.variant.into()), Value::Dict(self.map)]))
    }
}

/// Serialize any serde serializable object into a `value::Value`.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    value.serialize(Serializer)
}

/// Deserialize a `value::Value` into any serde deserializable object.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    let mut de = Deserializer::new(value);
    de::Deserialize::deserialize(&mut de)
}

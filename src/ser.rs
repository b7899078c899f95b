// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Pickle serialization
//!
//! Values are written with protocol 3 by default, which any Python 3 can
//! read.  Protocol 2 is available for Python 2 readers, and protocol 4 is
//! the extended format, the only one able to write placeholders for
//! unresolved classes and keyword-constructed instances.

use std::io;
use std::collections::{BTreeMap, BTreeSet};
use serde::ser::Serialize;
use byteorder::{LittleEndian, BigEndian, WriteBytesExt};
use num_bigint::BigInt;
use num_traits::Signed;

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::failure::Unresolved;
use crate::resolve::{PLACEHOLDER_MODULE, PLACEHOLDER_NAME};
use crate::value::{to_value, ClassRef, HashableValue, Instance, Value};

/// Options for serializing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SerOptions {
    protocol: u8,
}

impl SerOptions {
    /// Construct with default options: protocol 3.
    pub fn new() -> Self {
        SerOptions { protocol: PRIMARY_PROTOCOL }
    }

    /// Write protocol 2, which Python 2 can read.
    pub fn proto_v2(mut self) -> Self {
        self.protocol = 2;
        self
    }

    /// Write the extended format (protocol 4).
    pub fn extended(mut self) -> Self {
        self.protocol = EXTENDED_PROTOCOL;
        self
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }
}

impl Default for SerOptions {
    fn default() -> Self {
        SerOptions::new()
    }
}

/// A structure for writing values into a pickle stream.
pub struct Serializer<W> {
    writer: W,
    options: SerOptions,
}

impl<W: io::Write> Serializer<W> {
    pub fn new(writer: W, options: SerOptions) -> Self {
        Serializer { writer, options }
    }

    /// Unwrap the `Writer` from the `Serializer`.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn extended(&self) -> bool {
        self.options.protocol >= EXTENDED_PROTOCOL
    }

    #[inline]
    fn write_opcode(&mut self, opcode: u8) -> Result<()> {
        self.writer.write_all(&[opcode]).map_err(From::from)
    }

    fn serialize_hashable_value(&mut self, value: &HashableValue) -> Result<()> {
        match *value {
            HashableValue::None    => self.write_opcode(NONE),
            HashableValue::Bool(b) => self.serialize_bool(b),
            HashableValue::I64(i)  => self.serialize_i64(i),
            HashableValue::F64(f)  => self.serialize_f64(f),
            HashableValue::Bytes(ref b) => self.serialize_bytes(b),
            HashableValue::String(ref s) => self.serialize_str(s),
            HashableValue::Int(ref i) => self.serialize_bigint(i),
            HashableValue::FrozenSet(ref s) => self.serialize_set(s, "frozenset"),
            HashableValue::Tuple(ref t) =>
                self.serialize_tuplevalue(t, |slf, v| slf.serialize_hashable_value(v)),
            HashableValue::Class(ref class) => self.serialize_global(class),
            HashableValue::Object(ref obj) => self.serialize_instance(obj),
            HashableValue::Unresolved(ref u) => self.serialize_unresolved(u),
        }
    }

    pub fn serialize_value(&mut self, value: &Value) -> Result<()> {
        match *value {
            Value::None    => self.write_opcode(NONE),
            Value::Bool(b) => self.serialize_bool(b),
            Value::I64(i)  => self.serialize_i64(i),
            Value::F64(f)  => self.serialize_f64(f),
            Value::Bytes(ref b) => self.serialize_bytes(b),
            Value::String(ref s) => self.serialize_str(s),
            Value::Int(ref i) => self.serialize_bigint(i),
            Value::List(ref l) => {
                self.write_opcode(EMPTY_LIST)?;
                for chunk in l.chunks(BATCHSIZE) {
                    self.write_opcode(MARK)?;
                    for item in chunk {
                        self.serialize_value(item)?;
                    }
                    self.write_opcode(APPENDS)?;
                }
                Ok(())
            }
            Value::Dict(ref d) => self.serialize_dict(d),
            Value::Tuple(ref t) => self.serialize_tuplevalue(t, |slf, v| slf.serialize_value(v)),
            Value::Set(ref s) => self.serialize_set(s, "set"),
            Value::FrozenSet(ref s) => self.serialize_set(s, "frozenset"),
            Value::Class(ref class) => self.serialize_global(class),
            Value::Object(ref obj) => self.serialize_instance(obj),
            Value::Unresolved(ref u) => self.serialize_unresolved(u),
        }
    }

    fn serialize_dict(&mut self, d: &BTreeMap<HashableValue, Value>) -> Result<()> {
        self.write_opcode(EMPTY_DICT)?;
        let items: Vec<_> = d.iter().collect();
        for chunk in items.chunks(BATCHSIZE) {
            self.write_opcode(MARK)?;
            for &(key, value) in chunk {
                self.serialize_hashable_value(key)?;
                self.serialize_value(value)?;
            }
            self.write_opcode(SETITEMS)?;
        }
        Ok(())
    }

    fn serialize_bool(&mut self, value: bool) -> Result<()> {
        self.write_opcode(if value { NEWTRUE } else { NEWFALSE })
    }

    fn serialize_i64(&mut self, value: i64) -> Result<()> {
        if 0 <= value && value < 0x100 {
            self.write_opcode(BININT1)?;
            self.writer.write_u8(value as u8).map_err(From::from)
        } else if 0 <= value && value < 0x1_0000 {
            self.write_opcode(BININT2)?;
            self.writer.write_u16::<LittleEndian>(value as u16).map_err(From::from)
        } else if -0x8000_0000 <= value && value < 0x8000_0000 {
            self.write_opcode(BININT)?;
            self.writer.write_i32::<LittleEndian>(value as i32).map_err(From::from)
        } else {
            self.write_opcode(LONG1)?;
            self.writer.write_i8(8)?;
            self.writer.write_i64::<LittleEndian>(value).map_err(From::from)
        }
    }

    fn serialize_f64(&mut self, value: f64) -> Result<()> {
        self.write_opcode(BINFLOAT)?;
        // Yes, this one is big endian.
        self.writer.write_f64::<BigEndian>(value).map_err(From::from)
    }

    fn serialize_str(&mut self, value: &str) -> Result<()> {
        if self.extended() && value.len() < 0x100 {
            self.write_opcode(SHORT_BINUNICODE)?;
            self.writer.write_u8(value.len() as u8)?;
        } else if value.len() as u64 <= u64::from(u32::MAX) {
            self.write_opcode(BINUNICODE)?;
            self.writer.write_u32::<LittleEndian>(value.len() as u32)?;
        } else if self.extended() {
            self.write_opcode(BINUNICODE8)?;
            self.writer.write_u64::<LittleEndian>(value.len() as u64)?;
        } else {
            return Err(Error::Syntax(ErrorCode::Unpicklable(
                "strings over 4 GiB before protocol 4".into())));
        }
        self.writer.write_all(value.as_bytes()).map_err(From::from)
    }

    fn serialize_bytes(&mut self, value: &[u8]) -> Result<()> {
        if self.options.protocol < 3 {
            // Protocol 2 has no bytes type; Python 3 writes
            // `_codecs.encode(latin1_text, 'latin1')`.
            self.serialize_global(&ClassRef::new("_codecs", "encode"))?;
            let text: String = value.iter().map(|&b| b as char).collect();
            self.serialize_str(&text)?;
            self.serialize_str("latin1")?;
            self.write_opcode(TUPLE2)?;
            return self.write_opcode(REDUCE);
        }
        if value.len() < 0x100 {
            self.write_opcode(SHORT_BINBYTES)?;
            self.writer.write_u8(value.len() as u8)?;
        } else if value.len() as u64 <= u64::from(u32::MAX) {
            self.write_opcode(BINBYTES)?;
            self.writer.write_u32::<LittleEndian>(value.len() as u32)?;
        } else if self.extended() {
            self.write_opcode(BINBYTES8)?;
            self.writer.write_u64::<LittleEndian>(value.len() as u64)?;
        } else {
            return Err(Error::Syntax(ErrorCode::Unpicklable(
                "byte strings over 4 GiB before protocol 4".into())));
        }
        self.writer.write_all(value).map_err(From::from)
    }

    fn serialize_bigint(&mut self, i: &BigInt) -> Result<()> {
        let bytes = if i.is_negative() {
            let n_bytes = i.to_bytes_le().1.len();
            let pos = i + (BigInt::from(1) << (n_bytes * 8));
            let mut bytes = pos.to_bytes_le().1;
            while bytes.len() < n_bytes {
                bytes.push(0x00);
            }
            if bytes.last().map_or(true, |&b| b < 0x80) {
                bytes.push(0xff);
            }
            bytes
        } else {
            let mut bytes = i.to_bytes_le().1;
            if bytes.last().map_or(false, |&b| b >= 0x80) {
                bytes.push(0x00);
            }
            bytes
        };
        if bytes.len() < 0x100 {
            self.write_opcode(LONG1)?;
            self.writer.write_u8(bytes.len() as u8)?;
        } else {
            self.write_opcode(LONG4)?;
            self.writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
        }
        self.writer.write_all(&bytes).map_err(From::from)
    }

    fn serialize_tuplevalue<T, F>(&mut self, t: &[T], f: F) -> Result<()>
        where F: Fn(&mut Self, &T) -> Result<()>
    {
        match t.len() {
            0 => self.write_opcode(EMPTY_TUPLE),
            1 => {
                f(self, &t[0])?;
                self.write_opcode(TUPLE1)
            }
            2 => {
                f(self, &t[0])?;
                f(self, &t[1])?;
                self.write_opcode(TUPLE2)
            }
            3 => {
                f(self, &t[0])?;
                f(self, &t[1])?;
                f(self, &t[2])?;
                self.write_opcode(TUPLE3)
            }
            _ => {
                self.write_opcode(MARK)?;
                for item in t {
                    f(self, item)?;
                }
                self.write_opcode(TUPLE)
            }
        }
    }

    fn serialize_set(&mut self, items: &BTreeSet<HashableValue>, name: &str) -> Result<()> {
        if self.extended() {
            let items: Vec<_> = items.iter().collect();
            if name == "frozenset" {
                self.write_opcode(MARK)?;
                for item in items {
                    self.serialize_hashable_value(item)?;
                }
                return self.write_opcode(FROZENSET);
            }
            self.write_opcode(EMPTY_SET)?;
            for chunk in items.chunks(BATCHSIZE) {
                self.write_opcode(MARK)?;
                for item in chunk {
                    self.serialize_hashable_value(item)?;
                }
                self.write_opcode(ADDITEMS)?;
            }
            return Ok(());
        }
        let module = if self.options.protocol < 3 { "__builtin__" } else { "builtins" };
        self.serialize_global(&ClassRef::new(module, name))?;
        self.write_opcode(EMPTY_LIST)?;
        let items: Vec<_> = items.iter().collect();
        for chunk in items.chunks(BATCHSIZE) {
            self.write_opcode(MARK)?;
            for item in chunk {
                self.serialize_hashable_value(item)?;
            }
            self.write_opcode(APPENDS)?;
        }
        self.write_opcode(TUPLE1)?;
        self.write_opcode(REDUCE)
    }

    fn serialize_global(&mut self, class: &ClassRef) -> Result<()> {
        if self.extended() {
            self.serialize_str(&class.module)?;
            self.serialize_str(&class.name)?;
            return self.write_opcode(STACK_GLOBAL);
        }
        if class.module.contains('\n') || class.name.contains('\n') {
            return Err(Error::Syntax(ErrorCode::Unpicklable(format!("global {:?}", class.key()))));
        }
        self.write_opcode(GLOBAL)?;
        self.writer.write_all(class.module.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.write_all(class.name.as_bytes())?;
        self.writer.write_all(b"\n").map_err(From::from)
    }

    fn serialize_instance(&mut self, obj: &Instance) -> Result<()> {
        if !obj.kwargs.is_empty() && !self.extended() {
            return Err(Error::Syntax(ErrorCode::Unpicklable(
                format!("{} instance with keyword arguments before protocol 4", obj.class))));
        }
        self.serialize_global(&obj.class)?;
        self.serialize_tuplevalue(&obj.args, |slf, v| slf.serialize_value(v))?;
        if obj.kwargs.is_empty() {
            self.write_opcode(NEWOBJ)?;
        } else {
            self.serialize_dict(&obj.kwargs)?;
            self.write_opcode(NEWOBJ_EX)?;
        }
        if let Some(ref state) = obj.state {
            self.serialize_value(state)?;
            self.write_opcode(BUILD)?;
        }
        Ok(())
    }

    /// Placeholders are written as a call to the placeholder global with
    /// `(module, name, error, args, kwargs)`, followed by BUILD for the
    /// captured state.  Reading them back retries the original class.
    fn serialize_unresolved(&mut self, u: &Unresolved) -> Result<()> {
        if !self.extended() {
            return Err(Error::Syntax(ErrorCode::Unpicklable(
                format!("placeholder for unresolved class {}", u.class))));
        }
        self.serialize_global(&ClassRef::new(PLACEHOLDER_MODULE, PLACEHOLDER_NAME))?;
        let header = [
            Value::String(u.class.module.clone()),
            Value::String(u.class.name.clone()),
            Value::String(u.error.clone()),
        ];
        self.write_opcode(MARK)?;
        for item in &header {
            self.serialize_value(item)?;
        }
        self.serialize_tuplevalue(&u.args, |slf, v| slf.serialize_value(v))?;
        self.serialize_dict(&u.kwargs)?;
        self.write_opcode(TUPLE)?;
        self.write_opcode(REDUCE)?;
        if !u.dict.is_empty() {
            self.serialize_dict(&u.dict)?;
            self.write_opcode(BUILD)?;
        }
        if let Some(ref raw) = u.raw_state {
            self.serialize_value(raw)?;
            self.write_opcode(BUILD)?;
        }
        Ok(())
    }
}

fn wrap_write<W: io::Write, F>(mut writer: W, inner: F, options: SerOptions) -> Result<()>
    where F: FnOnce(&mut Serializer<W>) -> Result<()>
{
    writer.write_all(&[PROTO, options.protocol])?;
    let mut ser = Serializer::new(writer, options);
    inner(&mut ser)?;
    let mut writer = ser.into_inner();
    writer.write_all(&[STOP]).map_err(From::from)
}

/// Encode the value into a pickle stream.
pub fn value_to_writer<W: io::Write>(writer: &mut W, value: &Value, options: SerOptions)
                                     -> Result<()> {
    wrap_write(writer, |ser| ser.serialize_value(value), options)
}

/// Encode the specified struct into a `[u8]` writer.
#[inline]
pub fn to_writer<W: io::Write, T: Serialize>(writer: &mut W, value: &T, options: SerOptions)
                                             -> Result<()> {
    let value = to_value(value)?;
    value_to_writer(writer, &value, options)
}

/// Encode the value into a `Vec<u8>` buffer.
#[inline]
pub fn value_to_vec(value: &Value, options: SerOptions) -> Result<Vec<u8>> {
    let mut writer = Vec::with_capacity(128);
    value_to_writer(&mut writer, value, options)?;
    Ok(writer)
}

/// Encode the specified struct into a `Vec<u8>` buffer.
#[inline]
pub fn to_vec<T: Serialize>(value: &T, options: SerOptions) -> Result<Vec<u8>> {
    let mut writer = Vec::with_capacity(128);
    to_writer(&mut writer, value, options)?;
    Ok(writer)
}

// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Pickle deserialization
//!
//! Note: Pickles are not a declarative format, but a program for a stack-based
//! VM.  Each value that is decoded is simply put on the stack, and some
//! operations pop items from the stack and construct new data with them.
//!
//! The reader therefore works on its own stack representation, which can hold
//! references into the memo and not-yet-built objects.  Only when STOP is
//! reached is the result converted into a [`value::Value`]: memo references
//! are expanded (recursive structures are rejected), and objects are built by
//! their class factories.
//!
//! Module globals are looked up through a [`ClassResolver`], which either
//! finds a factory, reports an error, or hands out a placeholder.

use std::io::{self, BufReader, Read};
use std::mem;
use std::str;
use std::char;
use std::collections::{BTreeMap, BTreeSet};
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;
use byteorder::{ByteOrder, BigEndian, LittleEndian};
use iter_read::{IterRead, IterReadItem};
use serde::de::DeserializeOwned;

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::failure::{FailureRecord, Unresolved};
use crate::resolve::{fix_py2_name, Builtin, ClassFactory, ClassResolver, Fallback, Resolved};
use crate::value::{self, from_value, ClassRef, HashableValue};

/// How legacy (Python 2) `str` objects are decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Ascii,
    Latin1,
    Utf8,
    /// Keep them as bytes.
    Bytes,
}

impl Encoding {
    pub fn parse(s: &str) -> Option<Encoding> {
        match &*s.to_ascii_lowercase().replace('_', "-") {
            "ascii" | "us-ascii" => Some(Encoding::Ascii),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Some(Encoding::Latin1),
            "utf8" | "utf-8" => Some(Encoding::Utf8),
            "bytes" => Some(Encoding::Bytes),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Encoding::Ascii => "ASCII",
            Encoding::Latin1 => "latin-1",
            Encoding::Utf8 => "UTF-8",
            Encoding::Bytes => "bytes",
        }
    }
}

/// What to do with legacy string bytes the encoding cannot represent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Errors {
    Strict,
    Ignore,
    Replace,
}

impl Errors {
    pub fn parse(s: &str) -> Option<Errors> {
        match s {
            "strict" => Some(Errors::Strict),
            "ignore" => Some(Errors::Ignore),
            "replace" => Some(Errors::Replace),
            _ => None,
        }
    }
}

/// Options for deserializing.
#[derive(Clone, Debug)]
pub struct DeOptions {
    encoding: Encoding,
    errors: Errors,
    fix_imports: bool,
}

impl DeOptions {
    /// Construct with default options:
    ///
    /// - legacy strings are decoded as ASCII, failing on other bytes
    /// - Python 2 module names are mapped to their Python 3 locations
    pub fn new() -> Self {
        DeOptions { encoding: Encoding::Ascii, errors: Errors::Strict, fix_imports: true }
    }

    /// Set the encoding for legacy strings.
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the error handling for legacy strings.
    pub fn errors(mut self, errors: Errors) -> Self {
        self.errors = errors;
        self
    }

    /// Enable or disable mapping of Python 2 names.
    pub fn fix_imports(mut self, fix_imports: bool) -> Self {
        self.fix_imports = fix_imports;
        self
    }

    pub fn get_encoding(&self) -> Encoding {
        self.encoding
    }
}

impl Default for DeOptions {
    fn default() -> Self {
        DeOptions::new()
    }
}

type MemoId = u32;

/// Stack representation of values during unpickling.
#[derive(Clone, Debug)]
enum Value {
    MemoRef(MemoId),
    Global(ClassRef, Resolved),
    None,
    Bool(bool),
    I64(i64),
    Int(BigInt),
    F64(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Object(Box<Object>),
}

/// An object whose construction is deferred until the stream is complete.
#[derive(Clone, Debug)]
struct Object {
    target: Resolved,
    args: Vec<Value>,
    kwargs: Option<Value>,
    states: Vec<Value>,
}

fn describe(value: &Value) -> String {
    match *value {
        Value::MemoRef(id) => format!("memo reference {}", id),
        Value::Global(ref class, _) => format!("global {}", class),
        Value::None => "None".into(),
        Value::Bool(_) => "bool".into(),
        Value::I64(_) | Value::Int(_) => "int".into(),
        Value::F64(_) => "float".into(),
        Value::Bytes(_) => "bytes".into(),
        Value::String(_) => "str".into(),
        Value::List(_) => "list".into(),
        Value::Tuple(_) => "tuple".into(),
        Value::Set(_) => "set".into(),
        Value::FrozenSet(_) => "frozenset".into(),
        Value::Dict(_) => "dict".into(),
        Value::Object(ref obj) => format!("object {:?}", obj.target),
    }
}

/// Decodes pickle streams into values, resolving globals through a
/// [`ClassResolver`].
pub struct PickleReader<'r, R: Read> {
    rdr: R,
    pos: usize,
    stack: Vec<Value>,
    stacks: Vec<Vec<Value>>,
    memo: BTreeMap<MemoId, Value>,
    converted: BTreeMap<MemoId, value::Value>,
    in_progress: BTreeSet<MemoId>,
    placeholders: usize,
    options: DeOptions,
    resolver: &'r mut ClassResolver,
}

impl<'r, R: Read> PickleReader<'r, R> {
    pub fn new(rdr: R, options: DeOptions, resolver: &'r mut ClassResolver) -> PickleReader<'r, R> {
        PickleReader {
            rdr,
            pos: 0,
            stack: Vec::with_capacity(128),
            stacks: Vec::with_capacity(16),
            memo: BTreeMap::new(),
            converted: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            placeholders: 0,
            options,
            resolver,
        }
    }

    /// Decode one complete pickle and convert it into a value.
    pub fn read_value(&mut self) -> Result<value::Value> {
        let raw = self.parse()?;
        self.convert_value(raw)
    }

    /// Make sure the whole stream has been consumed.
    pub fn end(&mut self) -> Result<()> {
        let mut buf = [0u8; 1];
        match self.rdr.read(&mut buf) {
            Ok(0) => Ok(()),
            Ok(_) => self.error(ErrorCode::TrailingBytes),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn parse(&mut self) -> Result<Value> {
        loop {
            match self.read_byte()? {
                // Specials
                STOP => return self.pop(),
                POP => {
                    if self.stack.is_empty() {
                        self.pop_mark()?;
                    } else {
                        self.pop()?;
                    }
                }
                POP_MARK => { self.pop_mark()?; }
                DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                MARK => {
                    let stack = mem::replace(&mut self.stack, Vec::with_capacity(128));
                    self.stacks.push(stack);
                }
                PROTO => {
                    let proto = self.read_byte()?;
                    if proto > HIGHEST_PROTOCOL {
                        return self.error(ErrorCode::InvalidValue(
                            format!("unsupported pickle protocol {}", proto)));
                    }
                }
                FRAME => {
                    // Frames only matter for buffering; skip the length.
                    self.read_bytes(8)?;
                }

                // Memo
                PUT => {
                    let line = self.read_line()?;
                    let id = self.parse_ascii::<MemoId>(line)?;
                    self.memoize(id)?;
                }
                BINPUT => {
                    let id = self.read_byte()?;
                    self.memoize(id.into())?;
                }
                LONG_BINPUT => {
                    let bytes = self.read_bytes(4)?;
                    self.memoize(LittleEndian::read_u32(&bytes))?;
                }
                MEMOIZE => {
                    let id = self.memo.len() as MemoId;
                    self.memoize(id)?;
                }
                GET => {
                    let line = self.read_line()?;
                    let id = self.parse_ascii::<MemoId>(line)?;
                    self.push_memo_ref(id)?;
                }
                BINGET => {
                    let id = self.read_byte()?;
                    self.push_memo_ref(id.into())?;
                }
                LONG_BINGET => {
                    let bytes = self.read_bytes(4)?;
                    self.push_memo_ref(LittleEndian::read_u32(&bytes))?;
                }

                // Singletons
                NONE => self.stack.push(Value::None),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                NEWTRUE => self.stack.push(Value::Bool(true)),

                // ASCII-formatted numbers
                INT => {
                    let line = self.read_line()?;
                    // Protocol 1 spells booleans as "00" and "01".
                    let val = if line == b"00" {
                        Value::Bool(false)
                    } else if line == b"01" {
                        Value::Bool(true)
                    } else {
                        Value::I64(self.parse_ascii::<i64>(line)?)
                    };
                    self.stack.push(val);
                }
                LONG => {
                    let mut line = self.read_line()?;
                    if line.last() == Some(&b'L') { line.pop(); }
                    match BigInt::parse_bytes(&line, 10) {
                        Some(i) => self.stack.push(Value::Int(i)),
                        None => return self.error(ErrorCode::InvalidLiteral(line)),
                    }
                }
                FLOAT => {
                    let line = self.read_line()?;
                    let f = self.parse_ascii::<f64>(line)?;
                    self.stack.push(Value::F64(f));
                }

                // Until-EOL strings
                STRING => {
                    let line = self.read_line()?;
                    let quoted = line.len() >= 2 && line[0] == line[line.len() - 1] &&
                        (line[0] == b'"' || line[0] == b'\'');
                    let slice = if quoted { &line[1..line.len() - 1] } else { &line[..] };
                    let unescaped = self.decode_escaped_string(slice)?;
                    let string = self.decode_string(unescaped)?;
                    self.stack.push(string);
                }
                UNICODE => {
                    let line = self.read_line()?;
                    let string = self.decode_escaped_unicode(&line)?;
                    self.stack.push(string);
                }

                // Binary-coded numbers
                BINFLOAT => {
                    let bytes = self.read_bytes(8)?;
                    self.stack.push(Value::F64(BigEndian::read_f64(&bytes)));
                }
                BININT => {
                    let bytes = self.read_bytes(4)?;
                    self.stack.push(Value::I64(LittleEndian::read_i32(&bytes).into()));
                }
                BININT1 => {
                    let byte = self.read_byte()?;
                    self.stack.push(Value::I64(byte.into()));
                }
                BININT2 => {
                    let bytes = self.read_bytes(2)?;
                    self.stack.push(Value::I64(LittleEndian::read_u16(&bytes).into()));
                }

                // Length-prefixed longs
                LONG1 => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(decode_long(bytes));
                }
                LONG4 => {
                    let bytes = self.read_i32_prefixed_bytes()?;
                    self.stack.push(decode_long(bytes));
                }

                // Length-prefixed (byte)strings
                SHORT_BINBYTES => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(bytes));
                }
                BINBYTES => {
                    let bytes = self.read_u32_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(bytes));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let bytes = self.read_u64_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(bytes));
                }
                SHORT_BINSTRING => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    let string = self.decode_string(bytes)?;
                    self.stack.push(string);
                }
                BINSTRING => {
                    let bytes = self.read_i32_prefixed_bytes()?;
                    let string = self.decode_string(bytes)?;
                    self.stack.push(string);
                }
                SHORT_BINUNICODE => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    let string = self.decode_unicode(bytes)?;
                    self.stack.push(string);
                }
                BINUNICODE => {
                    let bytes = self.read_u32_prefixed_bytes()?;
                    let string = self.decode_unicode(bytes)?;
                    self.stack.push(string);
                }
                BINUNICODE8 => {
                    let bytes = self.read_u64_prefixed_bytes()?;
                    let string = self.decode_unicode(bytes)?;
                    self.stack.push(string);
                }

                // Containers
                EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                TUPLE1 => {
                    let item = self.pop()?;
                    self.stack.push(Value::Tuple(vec![item]));
                }
                TUPLE2 => {
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::Tuple(vec![item1, item2]));
                }
                TUPLE3 => {
                    let item3 = self.pop()?;
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::Tuple(vec![item1, item2, item3]));
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                APPEND => {
                    let value = self.pop()?;
                    self.modify_list(|list| list.push(value))?;
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    self.modify_list(|list| list.extend(items))?;
                }
                EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = pairs(items);
                    self.stack.push(Value::Dict(pairs));
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.modify_dict(|dict| dict.push((key, value)))?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    self.modify_dict(|dict| dict.extend(pairs(items)))?;
                }
                EMPTY_SET => self.stack.push(Value::Set(Vec::new())),
                FROZENSET => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::FrozenSet(items));
                }
                ADDITEMS => {
                    let items = self.pop_mark()?;
                    let pos = self.pos;
                    match *self.top()? {
                        Value::Set(ref mut set) => set.extend(items),
                        ref other => return Err(Error::Eval(
                            ErrorCode::InvalidStackTop("set", describe(other)), pos)),
                    }
                }

                // Module globals and object construction
                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.push_global(module, name)?;
                }
                STACK_GLOBAL => {
                    let name = self.pop_string()?;
                    let module = self.pop_string()?;
                    self.push_global(module.into_bytes(), name.into_bytes())?;
                }
                REDUCE => {
                    let args = self.pop_tuple()?;
                    let callable = self.pop_resolved()?;
                    let result = self.call(callable, args, None)?;
                    self.stack.push(result);
                }
                NEWOBJ => {
                    let args = self.pop_tuple()?;
                    let cls = self.pop_resolved()?;
                    let result = self.call(cls, args, None)?;
                    self.stack.push(result);
                }
                NEWOBJ_EX => {
                    let kwargs = self.pop()?;
                    let args = self.pop_tuple()?;
                    let cls = self.pop_resolved()?;
                    let result = self.call(cls, args, Some(kwargs))?;
                    self.stack.push(result);
                }
                INST => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let args = self.pop_mark()?;
                    self.push_global(module, name)?;
                    let cls = self.pop()?;
                    let result = self.call(cls, args, None)?;
                    self.stack.push(result);
                }
                OBJ => {
                    let mut items = self.pop_mark()?.into_iter();
                    let cls = match items.next() {
                        Some(cls) => self.resolve_ref(cls)?,
                        None => return self.error(ErrorCode::StackUnderflow),
                    };
                    let result = self.call(cls, items.collect(), None)?;
                    self.stack.push(result);
                }
                BUILD => {
                    let state = self.pop()?;
                    let pos = self.pos;
                    match *self.top()? {
                        Value::Object(ref mut obj) => obj.states.push(state),
                        // Builtin containers restored by REDUCE have no state to set.
                        _ if matches!(state, Value::None) => {}
                        ref other => return Err(Error::Eval(
                            ErrorCode::InvalidStackTop("object", describe(other)), pos)),
                    }
                }

                // Persistent ids (PERSID, BINPERSID), the extension registry
                // (EXT1, EXT2, EXT4) and out-of-band buffers end up here too.
                code => return self.error(ErrorCode::Unsupported(code as char)),
            }
        }
    }

    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => self.error(ErrorCode::StackUnderflow),
        }
    }

    /// The stack top, following memo references so that mutations reach
    /// the memoized value.
    fn top(&mut self) -> Result<&mut Value> {
        let pos = self.pos;
        let mut id = match self.stack.last_mut() {
            None => return Err(Error::Eval(ErrorCode::StackUnderflow, pos)),
            Some(&mut Value::MemoRef(id)) => id,
            Some(top) => return Ok(top),
        };
        let mut hops = 0;
        while let Some(&Value::MemoRef(next)) = self.memo.get(&id) {
            hops += 1;
            if hops > self.memo.len() {
                return Err(Error::Eval(ErrorCode::Recursive, pos));
            }
            id = next;
        }
        match self.memo.get_mut(&id) {
            Some(value) => Ok(value),
            None => Err(Error::Eval(ErrorCode::MissingMemo(id), pos)),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        match self.stacks.pop() {
            Some(new) => Ok(mem::replace(&mut self.stack, new)),
            None => self.error(ErrorCode::StackUnderflow),
        }
    }

    /// Pop a value, replacing a memo reference by a copy of its target.
    fn pop_resolved(&mut self) -> Result<Value> {
        let value = self.pop()?;
        self.resolve_ref(value)
    }

    fn resolve_ref(&self, value: Value) -> Result<Value> {
        let mut id = match value {
            Value::MemoRef(id) => id,
            other => return Ok(other),
        };
        for _ in 0..=self.memo.len() {
            match self.memo.get(&id) {
                Some(&Value::MemoRef(next)) => id = next,
                Some(other) => return Ok(other.clone()),
                None => return self.error(ErrorCode::MissingMemo(id)),
            }
        }
        self.error(ErrorCode::Recursive)
    }

    fn pop_tuple(&mut self) -> Result<Vec<Value>> {
        match self.pop_resolved()? {
            Value::Tuple(items) => Ok(items),
            other => self.error(ErrorCode::InvalidStackTop("tuple", describe(&other))),
        }
    }

    fn pop_string(&mut self) -> Result<String> {
        match self.pop_resolved()? {
            Value::String(s) => Ok(s),
            other => self.error(ErrorCode::InvalidStackTop("str", describe(&other))),
        }
    }

    fn modify_list<F: FnOnce(&mut Vec<Value>)>(&mut self, f: F) -> Result<()> {
        let pos = self.pos;
        match *self.top()? {
            Value::List(ref mut list) => { f(list); Ok(()) }
            ref other => Err(Error::Eval(ErrorCode::InvalidStackTop("list", describe(other)), pos)),
        }
    }

    fn modify_dict<F: FnOnce(&mut Vec<(Value, Value)>)>(&mut self, f: F) -> Result<()> {
        let pos = self.pos;
        match *self.top()? {
            Value::Dict(ref mut dict) => { f(dict); Ok(()) }
            // Instances of dict subclasses receive their items as state.
            Value::Object(ref mut obj) => {
                let mut items = Vec::new();
                f(&mut items);
                obj.states.push(Value::Dict(items));
                Ok(())
            }
            ref other => Err(Error::Eval(ErrorCode::InvalidStackTop("dict", describe(other)), pos)),
        }
    }

    fn memoize(&mut self, id: MemoId) -> Result<()> {
        let pos = self.pos;
        let top = match self.stack.last_mut() {
            Some(top) => top,
            None => return Err(Error::Eval(ErrorCode::StackUnderflow, pos)),
        };
        let existing = match *top {
            Value::MemoRef(existing) => Some(existing),
            _ => None,
        };
        // Memoizing a memo reference makes the new id an alias.
        let value = match existing {
            Some(existing) if existing == id => return Ok(()),
            Some(existing) => Value::MemoRef(existing),
            None => mem::replace(top, Value::MemoRef(id)),
        };
        self.memo.insert(id, value);
        Ok(())
    }

    fn push_memo_ref(&mut self, id: MemoId) -> Result<()> {
        if !self.memo.contains_key(&id) {
            return self.error(ErrorCode::MissingMemo(id));
        }
        self.stack.push(Value::MemoRef(id));
        Ok(())
    }

    fn push_global(&mut self, module: Vec<u8>, name: Vec<u8>) -> Result<()> {
        let module = self.decode_name(module)?;
        let name = self.decode_name(name)?;
        let mut class = ClassRef::new(module, name);
        if self.options.fix_imports {
            class = fix_py2_name(class);
        }
        match self.resolver.resolve(class.clone()) {
            Ok(resolved) => {
                self.stack.push(Value::Global(class, resolved));
                Ok(())
            }
            Err(err) => self.error(ErrorCode::UnresolvedClass {
                module: class.module,
                name: class.name,
                reason: err.to_string(),
            }),
        }
    }

    /// Apply a callable (REDUCE) or class (NEWOBJ, INST, OBJ) to arguments.
    fn call(&mut self, callable: Value, mut args: Vec<Value>, kwargs: Option<Value>) -> Result<Value> {
        let target = match callable {
            Value::Global(_, target) => target,
            other => return self.error(ErrorCode::InvalidStackTop("class", describe(&other))),
        };
        let builtin = match target {
            Resolved::Builtin(builtin) => builtin,
            target => return Ok(Value::Object(Box::new(Object {
                target, args, kwargs, states: Vec::new(),
            }))),
        };
        let first = match args.len() {
            0 => None,
            _ => Some(self.resolve_ref(args.remove(0))?),
        };
        Ok(match (builtin, first) {
            (Builtin::Set, None) => Value::Set(Vec::new()),
            (Builtin::FrozenSet, None) => Value::FrozenSet(Vec::new()),
            (Builtin::List, None) => Value::List(Vec::new()),
            (Builtin::Dict, None) => Value::Dict(Vec::new()),
            (Builtin::Bytearray, None) => Value::Bytes(Vec::new()),
            (Builtin::Set, Some(items)) => Value::Set(self.iterable(items)?),
            (Builtin::FrozenSet, Some(items)) => Value::FrozenSet(self.iterable(items)?),
            (Builtin::List, Some(items)) => Value::List(self.iterable(items)?),
            (Builtin::Dict, Some(Value::Dict(items))) => Value::Dict(items),
            (Builtin::Dict, Some(items)) => {
                let mut dict = Vec::new();
                for pair in self.iterable(items)? {
                    match self.resolve_ref(pair)? {
                        Value::Tuple(mut kv) | Value::List(mut kv) if kv.len() == 2 => {
                            let v = kv.pop();
                            let k = kv.pop();
                            if let (Some(k), Some(v)) = (k, v) {
                                dict.push((k, v));
                            }
                        }
                        other => return self.error(
                            ErrorCode::InvalidStackTop("key/value pair", describe(&other))),
                    }
                }
                Value::Dict(dict)
            }
            (Builtin::Bytearray, Some(Value::Bytes(b))) => Value::Bytes(b),
            (Builtin::Bytearray, Some(Value::String(s))) |
            (Builtin::Encode, Some(Value::String(s))) => {
                // `_codecs.encode(s, 'latin1')`: no codepoints above 0xff.
                Value::Bytes(s.chars().map(|c| c as u32 as u8).collect())
            }
            (Builtin::Reconstructor, Some(cls)) => {
                // `copyreg._reconstructor(cls, base, state)`: subclasses of
                // builtins (list, dict, ...) get the state as their argument.
                let mut rest = args.into_iter();
                let base = rest.next().map(|v| self.resolve_ref(v)).transpose()?;
                let ctor_args = match (base, rest.next()) {
                    (Some(Value::Global(_, Resolved::Builtin(Builtin::Object))), _) |
                    (_, None) | (_, Some(Value::None)) => Vec::new(),
                    (_, Some(state)) => vec![state],
                };
                return self.call(cls, ctor_args, None);
            }
            (Builtin::Placeholder, Some(Value::String(module))) => {
                return self.call_placeholder(module, args);
            }
            (builtin, first) => {
                let got = first.as_ref().map_or_else(|| "no arguments".into(), describe);
                return self.error(ErrorCode::InvalidValue(
                    format!("cannot apply builtin {:?} to {}", builtin, got)));
            }
        })
    }

    /// Rebuild a placeholder written by the extended format: retry the
    /// original class, and keep a placeholder if it still doesn't resolve.
    fn call_placeholder(&mut self, module: String, args: Vec<Value>) -> Result<Value> {
        // Remaining args: (name, error, args tuple, kwargs dict)
        let mut args = args.into_iter();
        let name = match args.next().map(|v| self.resolve_ref(v)).transpose()? {
            Some(Value::String(name)) => name,
            _ => return self.error(ErrorCode::InvalidValue("malformed placeholder".into())),
        };
        let error = match args.next().map(|v| self.resolve_ref(v)).transpose()? {
            Some(Value::String(error)) => error,
            _ => String::new(),
        };
        let ctor_args = match args.next().map(|v| self.resolve_ref(v)).transpose()? {
            Some(Value::Tuple(items)) => items,
            _ => Vec::new(),
        };
        let ctor_kwargs = args.next();

        let class = ClassRef::new(module, name);
        let target = match self.resolver.resolve(class.clone()) {
            Ok(resolved @ Resolved::Class(..)) => resolved,
            Ok(Resolved::Placeholder { class, record, .. }) =>
                Resolved::Placeholder { class, record, universal: true },
            Ok(Resolved::Builtin(_)) | Err(_) => {
                let reason = if error.is_empty() { "unresolved when saved".to_string() } else { error };
                self.resolver.placeholder(class, &reason, true)
            }
        };
        Ok(Value::Object(Box::new(Object {
            target, args: ctor_args, kwargs: ctor_kwargs, states: Vec::new(),
        })))
    }

    fn iterable(&self, value: Value) -> Result<Vec<Value>> {
        match value {
            Value::List(items) | Value::Tuple(items) |
            Value::Set(items) | Value::FrozenSet(items) => Ok(items),
            Value::Dict(items) => Ok(items.into_iter().map(|(k, _)| k).collect()),
            other => self.error(ErrorCode::InvalidStackTop("iterable", describe(&other))),
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        loop {
            match self.rdr.read(&mut buf) {
                Ok(0) => return self.error(ErrorCode::EOFWhileParsing),
                Ok(_) => { self.pos += 1; return Ok(buf[0]); }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(16);
        loop {
            match self.read_byte()? {
                b'\n' => {
                    if result.last() == Some(&b'\r') { result.pop(); }
                    return Ok(result);
                }
                ch => result.push(ch),
            }
        }
    }

    fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>> {
        // Read through `take` so that a bogus length can't make us allocate
        // more than the stream holds.
        let mut buf = Vec::new();
        (&mut self.rdr).take(n).read_to_end(&mut buf)?;
        self.pos += buf.len();
        if (buf.len() as u64) < n {
            return self.error(ErrorCode::EOFWhileParsing);
        }
        Ok(buf)
    }

    fn read_i32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(4)?;
        match LittleEndian::read_i32(&lenbytes) {
            0 => Ok(vec![]),
            l if l < 0 => self.error(ErrorCode::NegativeLength),
            l => self.read_bytes(l as u64),
        }
    }

    fn read_u64_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(8)?;
        self.read_bytes(LittleEndian::read_u64(&lenbytes))
    }

    fn read_u32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(4)?;
        self.read_bytes(LittleEndian::read_u32(&lenbytes).into())
    }

    fn read_u8_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbyte = self.read_byte()?;
        self.read_bytes(lenbyte.into())
    }

    fn parse_ascii<T: str::FromStr>(&self, line: Vec<u8>) -> Result<T> {
        match str::from_utf8(&line).ok().and_then(|s| s.parse::<T>().ok()) {
            Some(v) => Ok(v),
            None => self.error(ErrorCode::InvalidLiteral(line)),
        }
    }

    fn decode_name(&self, name: Vec<u8>) -> Result<String> {
        match String::from_utf8(name) {
            Ok(s) => Ok(s),
            Err(_) => self.error(ErrorCode::StringNotUTF8),
        }
    }

    /// Decode a Python 2 `str` according to the configured encoding.
    fn decode_string(&self, bytes: Vec<u8>) -> Result<Value> {
        let encoding = self.options.encoding;
        let errors = self.options.errors;
        let decoded = match encoding {
            Encoding::Bytes => return Ok(Value::Bytes(bytes)),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Ascii => {
                if bytes.is_ascii() {
                    // Checked above; ASCII is valid UTF-8.
                    String::from_utf8_lossy(&bytes).into_owned()
                } else {
                    match errors {
                        Errors::Strict => return self.error(
                            ErrorCode::StringNotDecodable(encoding.name())),
                        Errors::Ignore => bytes.iter().filter(|b| b.is_ascii())
                                               .map(|&b| b as char).collect(),
                        Errors::Replace => bytes.iter()
                            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                            .collect(),
                    }
                }
            }
            Encoding::Utf8 => match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(err) => match errors {
                    Errors::Strict => return self.error(
                        ErrorCode::StringNotDecodable(encoding.name())),
                    Errors::Ignore => String::from_utf8_lossy(err.as_bytes())
                        .chars().filter(|&c| c != char::REPLACEMENT_CHARACTER).collect(),
                    Errors::Replace => String::from_utf8_lossy(err.as_bytes()).into_owned(),
                },
            },
        };
        Ok(Value::String(decoded))
    }

    fn decode_escaped_string(&self, s: &[u8]) -> Result<Vec<u8>> {
        // These are encoded with "normal" Python string escape rules.
        let mut result = Vec::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            if b != b'\\' {
                result.push(b);
                continue;
            }
            let unescaped = match iter.next() {
                Some(&b'\\') => b'\\',
                Some(&b'\'') => b'\'',
                Some(&b'"') => b'"',
                Some(&b'a') => b'\x07',
                Some(&b'b') => b'\x08',
                Some(&b't') => b'\x09',
                Some(&b'n') => b'\x0a',
                Some(&b'v') => b'\x0b',
                Some(&b'f') => b'\x0c',
                Some(&b'r') => b'\x0d',
                Some(&b'x') => {
                    let hi = iter.next().and_then(|&c| (c as char).to_digit(16));
                    let lo = iter.next().and_then(|&c| (c as char).to_digit(16));
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => (hi * 16 + lo) as u8,
                        _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
                    }
                }
                _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
            };
            result.push(unescaped);
        }
        Ok(result)
    }

    fn decode_unicode(&self, string: Vec<u8>) -> Result<Value> {
        match String::from_utf8(string) {
            Ok(v) => Ok(Value::String(v)),
            Err(_) => self.error(ErrorCode::StringNotUTF8),
        }
    }

    fn decode_escaped_unicode(&self, s: &[u8]) -> Result<Value> {
        // These are encoded with "raw-unicode-escape", which only knows
        // the \uXXXX and \UYYYYYYYY escapes.  The backslash is escaped
        // in this way, too.
        let mut result = String::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            if b != b'\\' {
                result.push(b as char);
                continue;
            }
            let digits = match iter.next() {
                Some(&b'u') => 4,
                Some(&b'U') => 8,
                _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
            };
            let mut accum = 0;
            for _ in 0..digits {
                match iter.next().and_then(|&ch| (ch as char).to_digit(16)) {
                    Some(v) => accum = accum * 16 + v,
                    None => return self.error(ErrorCode::InvalidLiteral(s.into())),
                }
            }
            match char::from_u32(accum) {
                Some(v) => result.push(v),
                None => return self.error(ErrorCode::InvalidLiteral(s.into())),
            }
        }
        Ok(Value::String(result))
    }

    fn convert_value(&mut self, value: Value) -> Result<value::Value> {
        Ok(match value {
            Value::MemoRef(id) => {
                if let Some(done) = self.converted.get(&id) {
                    return Ok(done.clone());
                }
                if !self.in_progress.insert(id) {
                    return Err(Error::Syntax(ErrorCode::Recursive));
                }
                let raw = match self.memo.get(&id) {
                    Some(raw) => raw.clone(),
                    None => return Err(Error::Syntax(ErrorCode::MissingMemo(id))),
                };
                let result = self.convert_value(raw);
                self.in_progress.remove(&id);
                let done = result?;
                self.converted.insert(id, done.clone());
                done
            }
            Value::Global(class, Resolved::Placeholder { record, universal, .. }) =>
                value::Value::Unresolved(Box::new(self.placeholder(class, &record, universal))),
            Value::Global(class, _) => value::Value::Class(class),
            Value::None => value::Value::None,
            Value::Bool(b) => value::Value::Bool(b),
            Value::I64(i) => value::Value::I64(i),
            Value::Int(i) => value::Value::Int(i),
            Value::F64(f) => value::Value::F64(f),
            Value::Bytes(b) => value::Value::Bytes(b),
            Value::String(s) => value::Value::String(s),
            Value::List(items) => value::Value::List(self.convert_items(items)?),
            Value::Tuple(items) => value::Value::Tuple(self.convert_items(items)?),
            Value::Set(items) => value::Value::Set(self.convert_set(items)?),
            Value::FrozenSet(items) => value::Value::FrozenSet(self.convert_set(items)?),
            Value::Dict(pairs) => value::Value::Dict(self.convert_dict(pairs)?),
            Value::Object(obj) => self.convert_object(*obj)?,
        })
    }

    fn convert_items(&mut self, items: Vec<Value>) -> Result<Vec<value::Value>> {
        items.into_iter().map(|v| self.convert_value(v)).collect()
    }

    fn convert_set(&mut self, items: Vec<Value>) -> Result<BTreeSet<HashableValue>> {
        items.into_iter().map(|v| self.convert_value(v)?.into_hashable()).collect()
    }

    fn convert_dict(&mut self, pairs: Vec<(Value, Value)>) -> Result<BTreeMap<HashableValue, value::Value>> {
        let mut dict = BTreeMap::new();
        for (key, value) in pairs {
            let key = self.convert_value(key)?.into_hashable()?;
            dict.insert(key, self.convert_value(value)?);
        }
        Ok(dict)
    }

    fn convert_kwargs(&mut self, kwargs: Option<Value>) -> Result<BTreeMap<HashableValue, value::Value>> {
        match kwargs {
            None => Ok(BTreeMap::new()),
            Some(kwargs) => match self.convert_value(kwargs)? {
                value::Value::Dict(dict) => Ok(dict),
                other => Err(Error::Syntax(ErrorCode::InvalidValue(
                    format!("keyword arguments must be a dict, not {}", other)))),
            },
        }
    }

    fn convert_object(&mut self, obj: Object) -> Result<value::Value> {
        let Object { target, args, kwargs, states } = obj;
        match target {
            Resolved::Class(class, factory) if self.resolver.fallback_mode() == Fallback::Universal => {
                // Failing factories become universal placeholders as well.
                match self.build(&class, &*factory, args.clone(), kwargs.clone(), states.clone()) {
                    Ok(instance) => Ok(instance),
                    Err(err) => {
                        let target = self.resolver.placeholder(class, &err, true);
                        self.convert_object(Object { target, args, kwargs, states })
                    }
                }
            }
            Resolved::Class(class, factory) => self.build(&class, &*factory, args, kwargs, states),
            Resolved::Placeholder { class, record, universal } => {
                let mut sentinel = self.placeholder(class, &record, universal);
                if universal {
                    // Placeholders must never fail to build: anything that
                    // can't be converted is dropped.
                    let args = args.into_iter()
                        .map(|v| self.convert_value(v).unwrap_or(value::Value::None))
                        .collect();
                    let kwargs = self.convert_kwargs(kwargs).unwrap_or_default();
                    sentinel.capture_args(args, kwargs);
                    for state in states {
                        self.capture_state(&mut sentinel, state);
                    }
                }
                Ok(value::Value::Unresolved(Box::new(sentinel)))
            }
            Resolved::Builtin(builtin) => Err(Error::Syntax(ErrorCode::InvalidValue(
                format!("cannot instantiate builtin {:?}", builtin)))),
        }
    }

    fn placeholder(&mut self, class: ClassRef, record: &FailureRecord, universal: bool) -> Unresolved {
        let ledger = self.resolver.ledger_handle().clone();
        let mut sentinel = Unresolved::new(class, record, universal, ledger);
        self.placeholders += 1;
        sentinel.occurrence = self.placeholders;
        sentinel
    }

    fn build(&mut self, class: &ClassRef, factory: &dyn ClassFactory, args: Vec<Value>,
             kwargs: Option<Value>, states: Vec<Value>) -> Result<value::Value> {
        let args = self.convert_items(args)?;
        let kwargs = self.convert_kwargs(kwargs)?;
        let mut instance = factory.construct(class, args, kwargs)?;
        for state in states {
            let state = self.convert_value(state)?;
            factory.set_state(&mut instance, state)?;
        }
        Ok(instance)
    }

    fn capture_state(&mut self, sentinel: &mut Unresolved, state: Value) {
        let state = match self.resolve_ref(state) {
            Ok(state) => state,
            Err(_) => return,
        };
        match state {
            Value::Dict(pairs) => {
                let mut unhashable = Vec::new();
                for (key, value) in pairs {
                    let key = match self.convert_value(key) {
                        Ok(key) => key,
                        Err(_) => continue,
                    };
                    let value = self.convert_value(value).unwrap_or(value::Value::None);
                    match key.clone().into_hashable() {
                        Ok(key) => { sentinel.dict.insert(key, value); }
                        Err(_) => unhashable.push(value::Value::Tuple(vec![key, value])),
                    }
                }
                if !unhashable.is_empty() {
                    sentinel.capture_state(value::Value::List(unhashable));
                }
            }
            other => {
                if let Ok(other) = self.convert_value(other) {
                    sentinel.capture_state(other);
                }
            }
        }
    }

    fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Eval(reason, self.pos))
    }
}

fn pairs(items: Vec<Value>) -> Vec<(Value, Value)> {
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut key = None;
    for value in items {
        match key.take() {
            None => key = Some(value),
            Some(k) => pairs.push((k, value)),
        }
    }
    pairs
}

fn decode_long(bytes: Vec<u8>) -> Value {
    // BigInt::from_bytes_le doesn't like a sign bit in the bytes, therefore
    // we have to extract that ourselves and do the two-s complement.
    let negative = bytes.last().map_or(false, |&b| b & 0x80 != 0);
    let mut val = BigInt::from_bytes_le(Sign::Plus, &bytes);
    if negative {
        val -= BigInt::from(1) << (bytes.len() * 8);
    }
    match val.to_i64() {
        Some(i) => Value::I64(i),
        None => Value::Int(val),
    }
}

/// Decodes a value from a `std::io::Read`, resolving globals with the given
/// resolver.
pub fn value_from_reader_with<R: Read>(rdr: R, options: DeOptions,
                                       resolver: &mut ClassResolver) -> Result<value::Value> {
    let mut reader = PickleReader::new(rdr, options, resolver);
    let value = reader.read_value()?;
    reader.end()?;
    Ok(value)
}

/// Decodes a value from a byte slice, resolving globals with the given
/// resolver.
pub fn value_from_slice_with(v: &[u8], options: DeOptions,
                             resolver: &mut ClassResolver) -> Result<value::Value> {
    value_from_reader_with(v, options, resolver)
}

/// Decodes a value from a `std::io::Read`.  Only builtin globals are
/// understood.
pub fn value_from_reader<R: Read>(rdr: R, options: DeOptions) -> Result<value::Value> {
    let mut resolver = ClassResolver::builtins_only();
    value_from_reader_with(BufReader::new(rdr), options, &mut resolver)
}

/// Decodes a value from a byte slice `&[u8]`.
pub fn value_from_slice(v: &[u8], options: DeOptions) -> Result<value::Value> {
    let mut resolver = ClassResolver::builtins_only();
    value_from_slice_with(v, options, &mut resolver)
}

/// Decodes a value directly from an iterator.
pub fn value_from_iter<E, I>(iter: I, options: DeOptions) -> Result<value::Value>
    where E: IterReadItem, I: Iterator<Item=E>
{
    value_from_reader(IterRead::new(iter), options)
}

/// Decodes a value from a `std::io::Read`.
pub fn from_reader<R: Read, T: DeserializeOwned>(rdr: R, options: DeOptions) -> Result<T> {
    from_value(value_from_reader(rdr, options)?)
}

/// Decodes a value from a byte slice `&[u8]`.
pub fn from_slice<T: DeserializeOwned>(v: &[u8], options: DeOptions) -> Result<T> {
    from_value(value_from_slice(v, options)?)
}

/// Decodes a value directly from an iterator.
pub fn from_iter<E, I, T>(iter: I, options: DeOptions) -> Result<T>
    where E: IterReadItem, I: Iterator<Item=E>, T: DeserializeOwned
{
    from_value(value_from_iter(iter, options)?)
}
